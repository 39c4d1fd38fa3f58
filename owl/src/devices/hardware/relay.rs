use crate::{devices::hardware::gpio, error::DriverError};
use gpio_cdev::LineHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    thread,
    time::Duration,
};
use strum_macros::Display;
use tracing::{info, warn};

/// Boards held by console stand-ins in this process. Lets two dispatchers
/// configured against the same simulated board conflict the same way two
/// processes conflict over a real GPIO chip.
static CLAIMED_BOARDS: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

/// Output capability every relay board provides. Each channel line is only
/// ever driven by the worker that owns the channel, so implementations only
/// need to guard a line against `release` and `shutdown`.
pub trait ActuatorDriver: Send + Sync {
    /// Switch the channel's load on.
    fn energize(&self, channel: u8) -> Result<(), DriverError>;

    /// Switch the channel's load off.
    fn de_energize(&self, channel: u8) -> Result<(), DriverError>;

    /// Sound the buzzer `repeats` times, on for `duration` and off for
    /// half of it. Blocks the caller for the whole pattern.
    fn sound(&self, duration: Duration, repeats: u32) -> Result<(), DriverError>;

    /// Switch the channel off and hand its line back to the system.
    fn release(&self, channel: u8) -> Result<(), DriverError>;

    /// De-energize every channel then release every line and the buzzer.
    /// Channels that were never acquired or are already released are
    /// skipped, and a second call does nothing.
    fn shutdown(&self) -> Result<(), DriverError>;

    /// Channels this driver can switch.
    fn channels(&self) -> Vec<u8>;

    /// Energize every channel, used when priming or bench testing nozzles.
    fn all_on(&self) {
        for channel in self.channels() {
            if let Err(e) = self.energize(channel) {
                warn!(channel, error = %e, "Failed to energize channel");
            }
        }
    }

    /// De-energize every channel.
    fn all_off(&self) {
        for channel in self.channels() {
            if let Err(e) = self.de_energize(channel) {
                warn!(channel, error = %e, "Failed to de-energize channel");
            }
        }
    }
}

/// Which implementation of the hardware boundary to build. Chosen once
/// from configuration at start up, nothing in the core inspects the
/// platform it is running on.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Copy, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DriverKind {
    /// Linux GPIO character device.
    Gpio,
    /// Log every transition, used on desktops and in the lab.
    Console,
}

/// Hardware boundary configuration shared by the relay board and the
/// indicator lights.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct DriverConfig {
    /// Implementation to build.
    pub kind: DriverKind,
    /// GPIO chip path for `gpio`, board name for `console`.
    pub device: String,
    /// Relay boards on the machine switch on when the pin is pulled low.
    #[serde(default = "default_active_low")]
    pub active_low: bool,
}

fn default_active_low() -> bool {
    true
}

/// Mapping from a logical channel (nozzle) to the line wired to its relay.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct RelayPin {
    /// Logical channel used by the detection pipeline.
    pub channel: u8,
    /// Line offset on the GPIO chip.
    pub pin: u32,
}

impl RelayPin {
    /// Map `channel` to line `pin`.
    pub fn new(channel: u8, pin: u32) -> Self {
        Self { channel, pin }
    }
}

impl DriverConfig {
    /// Drive real hardware through the GPIO chip at `chip`.
    pub fn gpio(chip: impl Into<String>) -> Self {
        Self {
            kind: DriverKind::Gpio,
            device: chip.into(),
            active_low: true,
        }
    }

    /// Log transitions for the simulated board named `board`.
    pub fn console(board: impl Into<String>) -> Self {
        Self {
            kind: DriverKind::Console,
            device: board.into(),
            active_low: true,
        }
    }

    /// Acquire the relay lines and the buzzer.
    ///
    /// Fails with [`DriverError::AlreadyRunning`] when another instance
    /// holds the lines, and [`DriverError::Hardware`] for anything else.
    ///
    /// * `relay_pins`: channel to line mapping.
    /// * `buzzer_pin`: line of the buzzer, if fitted.
    pub fn acquire(
        &self,
        relay_pins: &[RelayPin],
        buzzer_pin: Option<u32>,
    ) -> Result<Arc<dyn ActuatorDriver>, DriverError> {
        match self.kind {
            DriverKind::Gpio => Ok(Arc::new(GpioRelayBoard::acquire(
                &self.device,
                relay_pins,
                buzzer_pin,
                self.active_low,
            )?)),
            DriverKind::Console => Ok(Arc::new(ConsoleRelayBoard::acquire(
                &self.device,
                relay_pins,
            )?)),
        }
    }
}

/// Relay board wired to a Linux GPIO chip. Lines are held for the life of
/// the board, the kernel refuses a second request for the same line which
/// is how a second running instance is detected.
pub struct GpioRelayBoard {
    /// Chip path, used in log and error messages.
    chip: String,
    /// One line per channel, `None` once released.
    relays: BTreeMap<u8, Mutex<Option<LineHandle>>>,
    /// Buzzer line, `None` when not fitted or released.
    buzzer: Mutex<Option<LineHandle>>,
}

impl GpioRelayBoard {
    /// Request every relay line and the buzzer from `chip`. The buzzer is
    /// requested first so a conflicting instance is reported before any
    /// relay is touched.
    ///
    /// * `chip`: chip path, e.g. `/dev/gpiochip0`.
    /// * `relay_pins`: channel to line mapping.
    /// * `buzzer_pin`: buzzer line, if fitted.
    /// * `active_low`: relays switch on when their pin is low.
    pub fn acquire(
        chip: &str,
        relay_pins: &[RelayPin],
        buzzer_pin: Option<u32>,
        active_low: bool,
    ) -> Result<Self, DriverError> {
        let mut gpio_chip = gpio::open_chip(chip)?;

        let buzzer = buzzer_pin
            .map(|pin| gpio::request_output(&mut gpio_chip, pin, false, "owl-buzzer"))
            .transpose()?;

        let mut relays = BTreeMap::new();
        for relay in relay_pins {
            let handle = gpio::request_output(&mut gpio_chip, relay.pin, active_low, "owl-relay")?;
            relays.insert(relay.channel, Mutex::new(Some(handle)));
        }

        info!(chip, relays = relays.len(), active_low, "Relay board acquired");
        Ok(Self {
            chip: chip.to_string(),
            relays,
            buzzer: Mutex::new(buzzer),
        })
    }

    fn write(&self, channel: u8, value: u8) -> Result<(), DriverError> {
        let line = self
            .relays
            .get(&channel)
            .ok_or(DriverError::UnknownChannel(channel))?
            .lock();
        let handle = line.as_ref().ok_or(DriverError::UnknownChannel(channel))?;
        handle
            .set_value(value)
            .map_err(|e| DriverError::hardware(format!("{} relay {channel}", self.chip), e))
    }

    fn write_buzzer(handle: &LineHandle, value: u8) -> Result<(), DriverError> {
        handle
            .set_value(value)
            .map_err(|e| DriverError::hardware("buzzer", e))
    }
}

impl ActuatorDriver for GpioRelayBoard {
    fn energize(&self, channel: u8) -> Result<(), DriverError> {
        self.write(channel, 1)
    }

    fn de_energize(&self, channel: u8) -> Result<(), DriverError> {
        self.write(channel, 0)
    }

    fn sound(&self, duration: Duration, repeats: u32) -> Result<(), DriverError> {
        let buzzer = self.buzzer.lock();
        let Some(handle) = buzzer.as_ref() else {
            return Ok(());
        };
        for _ in 0..repeats {
            Self::write_buzzer(handle, 1)?;
            thread::sleep(duration);
            Self::write_buzzer(handle, 0)?;
            thread::sleep(duration / 2);
        }
        Ok(())
    }

    fn release(&self, channel: u8) -> Result<(), DriverError> {
        let line = self
            .relays
            .get(&channel)
            .ok_or(DriverError::UnknownChannel(channel))?;
        if let Some(handle) = line.lock().take() {
            handle
                .set_value(0)
                .map_err(|e| DriverError::hardware(format!("{} relay {channel}", self.chip), e))?;
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DriverError> {
        let mut first_error = None;
        for channel in self.relays.keys() {
            if let Err(e) = self.release(*channel) {
                warn!(channel, error = %e, "Failed to release relay");
                first_error.get_or_insert(e);
            }
        }
        if let Some(handle) = self.buzzer.lock().take() {
            if let Err(e) = Self::write_buzzer(&handle, 0) {
                first_error.get_or_insert(e);
            }
        }
        info!(chip = %self.chip, "Relay board released");
        first_error.map_or(Ok(()), Err)
    }

    fn channels(&self) -> Vec<u8> {
        self.relays.keys().copied().collect()
    }
}

/// Stand-in for the relay board when no hardware is present. Every
/// transition is logged, nothing is switched.
pub struct ConsoleRelayBoard {
    /// Name of the simulated board.
    board: String,
    /// Channel line states, `None` once released.
    relays: BTreeMap<u8, Mutex<Option<bool>>>,
    /// False once `shutdown` has handed the board back.
    claimed: Mutex<bool>,
}

impl ConsoleRelayBoard {
    /// Claim the simulated board `board` and its channels.
    ///
    /// * `board`: name of the simulated board, two live instances may not
    ///   share one.
    /// * `relay_pins`: channel to line mapping.
    pub fn acquire(board: &str, relay_pins: &[RelayPin]) -> Result<Self, DriverError> {
        if !CLAIMED_BOARDS.lock().insert(board.to_string()) {
            return Err(DriverError::already_running(format!("console:{board}")));
        }
        let relays = relay_pins
            .iter()
            .map(|relay| (relay.channel, Mutex::new(Some(false))))
            .collect::<BTreeMap<_, _>>();
        info!(board, relays = relays.len(), "Console relay board acquired, GPIO disabled");
        Ok(Self {
            board: board.to_string(),
            relays,
            claimed: Mutex::new(true),
        })
    }

    fn write(&self, channel: u8, energized: bool) -> Result<(), DriverError> {
        let mut line = self
            .relays
            .get(&channel)
            .ok_or(DriverError::UnknownChannel(channel))?
            .lock();
        let state = line.as_mut().ok_or(DriverError::UnknownChannel(channel))?;
        *state = energized;
        info!(board = %self.board, channel, energized, "Relay switched");
        Ok(())
    }
}

impl ActuatorDriver for ConsoleRelayBoard {
    fn energize(&self, channel: u8) -> Result<(), DriverError> {
        self.write(channel, true)
    }

    fn de_energize(&self, channel: u8) -> Result<(), DriverError> {
        self.write(channel, false)
    }

    fn sound(&self, duration: Duration, repeats: u32) -> Result<(), DriverError> {
        for _ in 0..repeats {
            info!(board = %self.board, on_ms = duration.as_millis() as u64, "BEEP");
        }
        Ok(())
    }

    fn release(&self, channel: u8) -> Result<(), DriverError> {
        let line = self
            .relays
            .get(&channel)
            .ok_or(DriverError::UnknownChannel(channel))?;
        if line.lock().take().is_some() {
            info!(board = %self.board, channel, "Relay released");
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DriverError> {
        let mut claimed = self.claimed.lock();
        if !*claimed {
            return Ok(());
        }
        for channel in self.relays.keys() {
            self.release(*channel)?;
        }
        CLAIMED_BOARDS.lock().remove(&self.board);
        *claimed = false;
        info!(board = %self.board, "Console relay board released");
        Ok(())
    }

    fn channels(&self) -> Vec<u8> {
        self.relays.keys().copied().collect()
    }
}

impl Drop for ConsoleRelayBoard {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(board = %self.board, error = %e, "Failed to release console board");
        }
    }
}
