use crate::{
    devices::hardware::{
        gpio,
        relay::{DriverConfig, DriverKind},
    },
    error::DriverError,
};
use gpio_cdev::LineHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

/// A single on/off output driving an indicator light.
pub trait LightOutput: Send {
    /// Light or darken the output.
    fn set(&mut self, lit: bool) -> Result<(), DriverError>;
}

/// Indicator light on a GPIO line.
pub struct GpioLight {
    /// Line held for the life of the light.
    handle: LineHandle,
}

impl LightOutput for GpioLight {
    fn set(&mut self, lit: bool) -> Result<(), DriverError> {
        self.handle
            .set_value(u8::from(lit))
            .map_err(|e| DriverError::hardware("indicator light", e))
    }
}

/// Stand-in light that logs every transition.
pub struct ConsoleLight {
    /// Name used in the log line.
    label: String,
}

impl LightOutput for ConsoleLight {
    fn set(&mut self, lit: bool) -> Result<(), DriverError> {
        info!(light = %self.label, lit, "LED");
        Ok(())
    }
}

/// Acquire the output for an indicator light through the same hardware
/// boundary as the relay board.
///
/// * `driver`: hardware boundary configuration.
/// * `pin`: line offset of the light.
/// * `label`: name used for logging and as the GPIO consumer label.
pub fn acquire_light(
    driver: &DriverConfig,
    pin: u32,
    label: &str,
) -> Result<Box<dyn LightOutput>, DriverError> {
    match driver.kind {
        DriverKind::Gpio => {
            let mut chip = gpio::open_chip(&driver.device)?;
            let handle = gpio::request_output(&mut chip, pin, false, label)?;
            Ok(Box::new(GpioLight { handle }))
        }
        DriverKind::Console => Ok(Box::new(ConsoleLight {
            label: format!("{label}:{pin}"),
        })),
    }
}

/// On and off times of one blink cycle.
#[serde_as]
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct BlinkPattern {
    /// Time the light is lit per cycle.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub on: Duration,
    /// Time the light is dark per cycle.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub off: Duration,
}

impl BlinkPattern {
    /// Pattern from on and off times in milliseconds.
    pub const fn from_millis(on: u64, off: u64) -> Self {
        Self {
            on: Duration::from_millis(on),
            off: Duration::from_millis(off),
        }
    }

    /// Length of one full cycle.
    pub fn period(&self) -> Duration {
        self.on + self.off
    }
}

enum LedCommand {
    Solid(bool),
    Blink {
        pattern: BlinkPattern,
        /// `None` blinks until the next command.
        repeats: Option<u32>,
        /// Signalled when the pattern ends or is interrupted.
        done: Option<Sender<()>>,
    },
    Shutdown,
}

enum BlinkOutcome {
    Completed,
    Interrupted(LedCommand),
    Disconnected,
}

/// Indicator light driven from its own thread. Patterns run in the
/// background and any new command interrupts the running one, so a
/// "blink forever" request always has an owner and a way to end.
pub struct Led {
    /// Name used in logs.
    label: String,
    /// Command queue into the blinker thread.
    commands: Sender<LedCommand>,
    /// Blinker thread, taken on stop.
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Led {
    /// Spawn the blinker thread for `output`. The light starts dark.
    ///
    /// * `label`: name used in logs.
    /// * `output`: line the light is wired to.
    pub fn start(label: impl Into<String>, output: Box<dyn LightOutput>) -> Self {
        let label = label.into();
        let (commands, receiver) = mpsc::channel();
        let thread_label = label.clone();
        let join_handle = thread::spawn(move || run_blinker(thread_label, output, receiver));
        Self {
            label,
            commands,
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    /// Name of the light.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Light solid, ending any running pattern.
    pub fn on(&self) {
        self.send(LedCommand::Solid(true));
    }

    /// Darken, ending any running pattern.
    pub fn off(&self) {
        self.send(LedCommand::Solid(false));
    }

    /// Start blinking in the background and return straight away.
    ///
    /// * `pattern`: on and off times.
    /// * `repeats`: number of cycles, `None` to blink until the next command.
    pub fn blink(&self, pattern: BlinkPattern, repeats: Option<u32>) {
        self.send(LedCommand::Blink {
            pattern,
            repeats,
            done: None,
        });
    }

    /// Blink `repeats` times and block until the pattern has finished or
    /// was interrupted by another command.
    pub fn blink_and_wait(&self, pattern: BlinkPattern, repeats: u32) {
        let (done, finished) = mpsc::channel();
        self.send(LedCommand::Blink {
            pattern,
            repeats: Some(repeats),
            done: Some(done),
        });
        // An error means the blinker is gone, nothing left to wait for.
        if finished.recv().is_err() {
            debug!(light = %self.label, "Blinker stopped before pattern finished");
        }
    }

    /// Darken the light and join the blinker thread. Safe to call twice.
    pub fn stop(&self) {
        let Some(handle) = self.join_handle.lock().take() else {
            return;
        };
        self.send(LedCommand::Shutdown);
        if handle.join().is_err() {
            warn!(light = %self.label, "Blinker thread panicked");
        }
    }

    fn send(&self, command: LedCommand) {
        if self.commands.send(command).is_err() {
            debug!(light = %self.label, "Command sent to stopped light");
        }
    }
}

impl Drop for Led {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_blinker(label: String, mut output: Box<dyn LightOutput>, commands: Receiver<LedCommand>) {
    let mut write = |lit: bool| {
        if let Err(e) = output.set(lit) {
            warn!(light = %label, error = %e, "Failed to switch light");
        }
    };
    write(false);

    let mut next = commands.recv().ok();
    while let Some(command) = next.take() {
        next = match command {
            LedCommand::Solid(lit) => {
                write(lit);
                commands.recv().ok()
            }
            LedCommand::Blink {
                pattern,
                repeats,
                done,
            } => {
                let outcome = blink(&mut write, &commands, pattern, repeats);
                if let Some(done) = done {
                    // The requester may have given up waiting.
                    done.send(()).ok();
                }
                match outcome {
                    BlinkOutcome::Completed => commands.recv().ok(),
                    BlinkOutcome::Interrupted(command) => Some(command),
                    BlinkOutcome::Disconnected => None,
                }
            }
            LedCommand::Shutdown => None,
        };
    }
    write(false);
}

fn blink(
    write: &mut impl FnMut(bool),
    commands: &Receiver<LedCommand>,
    pattern: BlinkPattern,
    repeats: Option<u32>,
) -> BlinkOutcome {
    let mut cycle = 0;
    while repeats.map_or(true, |n| cycle < n) {
        write(true);
        if let Some(outcome) = hold(commands, pattern.on) {
            write(false);
            return outcome;
        }
        write(false);
        if let Some(outcome) = hold(commands, pattern.off) {
            return outcome;
        }
        cycle += 1;
    }
    BlinkOutcome::Completed
}

/// Keep the light as it is for `period` unless a command arrives first.
fn hold(commands: &Receiver<LedCommand>, period: Duration) -> Option<BlinkOutcome> {
    match commands.recv_timeout(period) {
        Ok(command) => Some(BlinkOutcome::Interrupted(command)),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(BlinkOutcome::Disconnected),
    }
}
