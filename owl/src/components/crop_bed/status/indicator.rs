use crate::{
    components::crop_bed::status::storage::{
        DiskProbe, StorageLevel, StorageMonitor, StorageMonitorConfig, StorageProbe,
    },
    devices::hardware::{
        led::{acquire_light, BlinkPattern, Led, LightOutput},
        relay::DriverConfig,
    },
    error::{ConfigError, DriverError},
    messages::control::status::{Capability, StatusMessage},
    utils::{read_yaml_config, signal::StopSignal},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    num::NonZeroU8,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use strum_macros::{Display, EnumIter};
use tracing::{info, warn};
use uuid::Uuid;

/// Error code flashed when the save drive is full.
pub const DRIVE_FULL: NonZeroU8 = match NonZeroU8::new(1) {
    Some(code) => code,
    None => unreachable!(),
};
/// Error code flashed when images should be saved but the drive cannot be read.
pub const STORAGE_UNAVAILABLE: NonZeroU8 = match NonZeroU8::new(6) {
    Some(code) => code,
    None => unreachable!(),
};

const NOTIFICATION: BlinkPattern = BlinkPattern::from_millis(100, 100);
const IMAGE_WRITE: BlinkPattern = BlinkPattern::from_millis(100, 100);
const WEED_DETECT: BlinkPattern = BlinkPattern::from_millis(50, 50);
const ALERT: BlinkPattern = BlinkPattern::from_millis(500, 500);

/// What the machine is doing, as shown on the status light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum IndicatorState {
    /// Neither detecting nor recording.
    Idle,
    /// Saving images only.
    Recording,
    /// Detecting and spraying only.
    Detecting,
    /// Running a notification pattern, the previous state comes back after.
    Notification,
    /// Detecting and saving images.
    RecordingAndDetecting,
    /// A fault is being flashed. Stays until cleared by hand.
    Error,
}

impl IndicatorState {
    /// Operating state for a pair of capability flags.
    ///
    /// * `detection`: weed detection is enabled.
    /// * `recording`: image recording is enabled.
    pub fn from_flags(detection: bool, recording: bool) -> Self {
        match (detection, recording) {
            (true, true) => Self::RecordingAndDetecting,
            (true, false) => Self::Detecting,
            (false, true) => Self::Recording,
            (false, false) => Self::Idle,
        }
    }

    /// True for the states that include weed detection.
    pub fn is_detecting(self) -> bool {
        matches!(self, Self::Detecting | Self::RecordingAndDetecting)
    }
}

/// Light arrangements fitted to the different machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorVariant {
    /// Single status light showing every state, pulse and error.
    Advanced,
    /// Record and storage lights, storage shown as a blink rate.
    Ute,
    /// No lights, only the drive full flag is kept.
    Headless,
}

/// Timing of the error code flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashTiming {
    /// Time lit per blink.
    pub on: Duration,
    /// Dark time between blinks of one code.
    pub gap: Duration,
    /// Dark time between repetitions of the code.
    pub pause: Duration,
}

impl Default for FlashTiming {
    fn default() -> Self {
        Self {
            on: Duration::from_millis(200),
            gap: Duration::from_millis(500),
            pause: Duration::from_secs(2),
        }
    }
}

/// Configuration for the status indicator of one machine.
#[derive(Deserialize, Serialize, PartialEq, Debug, Clone)]
pub struct StatusIndicatorConfig {
    /// Light arrangement.
    variant: IndicatorVariant,
    /// Hardware boundary the lights are attached through.
    driver: DriverConfig,
    /// Status light line, advanced variant.
    status_led_pin: Option<u32>,
    /// Record light line, ute variant.
    record_led_pin: Option<u32>,
    /// Storage light line, ute variant.
    storage_led_pin: Option<u32>,
    /// Where images are saved, polled for free space.
    save_directory: Option<PathBuf>,
    /// Storage polling.
    #[serde(default)]
    storage: StorageMonitorConfig,
}

impl StatusIndicatorConfig {
    /// Status indicator configuration without any lights.
    ///
    /// * `variant`: light arrangement.
    /// * `driver`: hardware boundary the lights are attached through.
    pub fn new(variant: IndicatorVariant, driver: DriverConfig) -> Self {
        Self {
            variant,
            driver,
            status_led_pin: None,
            record_led_pin: None,
            storage_led_pin: None,
            save_directory: None,
            storage: StorageMonitorConfig::default(),
        }
    }

    /// Set the status light line.
    pub fn with_status_led(mut self, pin: u32) -> Self {
        self.status_led_pin = Some(pin);
        self
    }

    /// Set the record and storage light lines.
    pub fn with_ute_leds(mut self, record_pin: u32, storage_pin: u32) -> Self {
        self.record_led_pin = Some(record_pin);
        self.storage_led_pin = Some(storage_pin);
        self
    }

    /// Poll `directory` for free space.
    pub fn with_save_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.save_directory = Some(directory.into());
        self
    }

    /// Override storage polling.
    pub fn with_storage(mut self, storage: StorageMonitorConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Build the config by reading a file.
    ///
    /// * `filepath`: path to config.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        read_yaml_config(filepath)
    }

    /// Directory polled for free space.
    pub fn save_directory(&self) -> Option<&PathBuf> {
        self.save_directory.as_ref()
    }
}

/// State guarded by the indicator lock.
#[derive(Debug)]
struct IndicatorInner {
    state: IndicatorState,
    detection_enabled: bool,
    recording_enabled: bool,
}

impl IndicatorInner {
    fn update_state(&mut self) {
        if self.state != IndicatorState::Error {
            self.state = IndicatorState::from_flags(self.detection_enabled, self.recording_enabled);
        }
    }
}

/// Running error flash loop.
struct ErrorFlash {
    stop: Arc<StopSignal>,
    join_handle: JoinHandle<()>,
}

/// Component that tells the operator what the machine is doing. Detection
/// and recording toggle two flags that decide the shown state, faults are
/// flashed as a blink count on their own thread and storage is polled in
/// the background once started.
pub struct StatusIndicator {
    /// Unique identifier for the component.
    uuid: Uuid,
    /// Light arrangement.
    variant: IndicatorVariant,
    /// State, serialises every read, toggle and pulse.
    inner: Mutex<IndicatorInner>,
    /// Single light of the advanced variant.
    status_led: Option<Arc<Led>>,
    /// Record light of the ute variant.
    record_led: Option<Arc<Led>>,
    /// Storage light of the ute variant.
    storage_led: Option<Arc<Led>>,
    /// Code the flash loop shows on its next repetition.
    error_code: Arc<AtomicU8>,
    /// Error flash loop, started by the first error.
    flash: Mutex<Option<ErrorFlash>>,
    /// Flash timing.
    timing: FlashTiming,
    /// Set once the drive passes 90 percent.
    drive_full: AtomicBool,
    /// Storage polling settings.
    storage_config: StorageMonitorConfig,
    /// Storage polling, present between start and stop.
    storage: Mutex<Option<StorageMonitor>>,
}

impl StatusIndicator {
    /// Acquire the configured lights and build the indicator.
    ///
    /// * `config`: `StatusIndicatorConfig`
    pub fn new(config: &StatusIndicatorConfig) -> Result<Self, DriverError> {
        let light = |pin: Option<u32>, label: &str| {
            pin.map(|pin| acquire_light(&config.driver, pin, label))
                .transpose()
        };
        let (status, record, storage) = match config.variant {
            IndicatorVariant::Advanced => (light(config.status_led_pin, "owl-status")?, None, None),
            IndicatorVariant::Ute => (
                None,
                light(config.record_led_pin, "owl-record")?,
                light(config.storage_led_pin, "owl-storage")?,
            ),
            IndicatorVariant::Headless => (None, None, None),
        };
        Ok(Self::from_outputs(config.variant, status, record, storage)
            .with_storage_config(config.storage.clone()))
    }

    /// Build the indicator around already acquired light outputs.
    ///
    /// * `variant`: light arrangement.
    /// * `status`: status light, advanced variant.
    /// * `record`: record light, ute variant.
    /// * `storage`: storage light, ute variant.
    pub fn from_outputs(
        variant: IndicatorVariant,
        status: Option<Box<dyn LightOutput>>,
        record: Option<Box<dyn LightOutput>>,
        storage: Option<Box<dyn LightOutput>>,
    ) -> Self {
        let led = |output: Option<Box<dyn LightOutput>>, label: &str| {
            output.map(|output| Arc::new(Led::start(label, output)))
        };
        Self {
            uuid: Uuid::new_v4(),
            variant,
            inner: Mutex::new(IndicatorInner {
                state: IndicatorState::Idle,
                detection_enabled: false,
                recording_enabled: false,
            }),
            status_led: led(status, "status"),
            record_led: led(record, "record"),
            storage_led: led(storage, "storage"),
            error_code: Arc::new(AtomicU8::new(0)),
            flash: Mutex::new(None),
            timing: FlashTiming::default(),
            drive_full: AtomicBool::new(false),
            storage_config: StorageMonitorConfig::default(),
            storage: Mutex::new(None),
        }
    }

    /// Override the error flash timing.
    pub fn with_flash_timing(mut self, timing: FlashTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Override storage polling.
    pub fn with_storage_config(mut self, storage_config: StorageMonitorConfig) -> Self {
        self.storage_config = storage_config;
        self
    }

    /// Return the unique id of the indicator.
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    /// Light arrangement.
    pub fn variant(&self) -> IndicatorVariant {
        self.variant
    }

    /// State currently shown.
    pub fn state(&self) -> IndicatorState {
        self.inner.lock().state
    }

    /// True once the save drive has passed 90 percent.
    pub fn drive_full(&self) -> bool {
        self.drive_full.load(Ordering::Acquire)
    }

    /// Start polling the save drive through `probe`.
    pub fn start(self: &Arc<Self>, probe: Box<dyn StorageProbe>) {
        let mut storage = self.storage.lock();
        if storage.is_none() {
            *storage = Some(StorageMonitor::start(
                Arc::downgrade(self),
                probe,
                self.storage_config.clone(),
            ));
        }
    }

    /// Start polling the save directory from `config`.
    pub fn start_from_config(self: &Arc<Self>, config: &StatusIndicatorConfig) {
        self.start(Box::new(DiskProbe::new(config.save_directory.clone())));
    }

    /// Stop storage polling and the error flash, then darken every light.
    /// Safe to call twice.
    pub fn stop(&self) {
        let storage = self.storage.lock().take();
        if let Some(mut storage) = storage {
            storage.stop();
        }
        self.stop_flash();
        for led in self.leds() {
            led.stop();
        }
        info!(uuid = %self.uuid, "Status indicator stopped");
    }

    /// Apply a capability toggle from the detection or recording pipeline.
    pub fn apply(&self, message: &StatusMessage) {
        match (message.capability, message.enabled) {
            (Capability::Detection, true) => self.enable_weed_detection(),
            (Capability::Detection, false) => self.disable_weed_detection(),
            (Capability::Recording, true) => self.enable_image_recording(),
            (Capability::Recording, false) => self.disable_image_recording(),
        }
    }

    /// Weed detection has started.
    pub fn enable_weed_detection(&self) {
        self.toggle(|inner| inner.detection_enabled = true);
    }

    /// Weed detection has stopped.
    pub fn disable_weed_detection(&self) {
        self.toggle(|inner| inner.detection_enabled = false);
    }

    /// Image recording has started.
    pub fn enable_image_recording(&self) {
        self.toggle(|inner| inner.recording_enabled = true);
    }

    /// Image recording has stopped.
    pub fn disable_image_recording(&self) {
        self.toggle(|inner| inner.recording_enabled = false);
    }

    fn toggle(&self, update: impl FnOnce(&mut IndicatorInner)) {
        let mut inner = self.inner.lock();
        update(&mut inner);
        inner.update_state();
    }

    /// Short pulse when an image is saved. The ute record light pulses on
    /// every write. The advanced status light skips the pulse while
    /// detecting, it is busy showing detections, and while showing an error.
    pub fn image_write_indicator(&self) {
        let inner = self.inner.lock();
        match self.variant {
            IndicatorVariant::Advanced => {
                if inner.state == IndicatorState::Error || inner.state.is_detecting() {
                    return;
                }
                if let Some(led) = &self.status_led {
                    led.blink(IMAGE_WRITE, Some(1));
                }
            }
            IndicatorVariant::Ute => {
                if let Some(led) = &self.record_led {
                    led.blink(IMAGE_WRITE, Some(1));
                }
            }
            IndicatorVariant::Headless => {}
        }
    }

    /// Shorter pulse when a weed is sprayed. Only shown while detecting.
    pub fn weed_detect_indicator(&self) {
        let inner = self.inner.lock();
        if !inner.state.is_detecting() {
            return;
        }
        if let Some(led) = self.signal_led() {
            led.blink(WEED_DETECT, Some(1));
        }
    }

    /// Blink twice and return to the previous state. The lock is held for
    /// the whole pattern so nothing else can change the light meanwhile.
    pub fn generic_notification(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = IndicatorState::Notification;
        if let Some(led) = self.signal_led() {
            led.off();
            led.blink_and_wait(NOTIFICATION, 2);
        }
        inner.state = previous;
    }

    /// Confirmation pattern once the machine is ready.
    pub fn setup_success(&self) {
        match self.variant {
            IndicatorVariant::Advanced => {
                if let Some(led) = &self.status_led {
                    led.blink(BlinkPattern::from_millis(100, 100), Some(2));
                }
            }
            IndicatorVariant::Ute => {
                for led in [&self.storage_led, &self.record_led].into_iter().flatten() {
                    led.blink(BlinkPattern::from_millis(100, 200), Some(3));
                }
            }
            IndicatorVariant::Headless => {}
        }
    }

    /// Blink every light until something else takes over.
    pub fn alert_flash(&self) {
        for led in self.leds() {
            led.blink(ALERT, None);
        }
    }

    /// Show a fault. The state becomes Error and stays there, and the code
    /// is flashed until the indicator stops or the error is cleared. A
    /// later error only changes the code being flashed.
    ///
    /// * `code`: fault to show as a blink count.
    pub fn error(&self, code: NonZeroU8) {
        // Flash lock first, then state, same order as clear_error.
        let mut flash = self.flash.lock();
        self.error_code.store(code.get(), Ordering::Release);
        self.inner.lock().state = IndicatorState::Error;

        let running = flash
            .as_ref()
            .is_some_and(|flash| !flash.join_handle.is_finished());
        if running {
            return;
        }
        if let Some(finished) = flash.take() {
            finished.join_handle.join().ok();
        }

        warn!(code = code.get(), "Showing error code");
        let stop = Arc::new(StopSignal::new());
        let light = self.error_led();
        let error_code = self.error_code.clone();
        let timing = self.timing;
        let thread_stop = stop.clone();
        let join_handle =
            thread::spawn(move || flash_error_code(light, error_code, thread_stop, timing));
        *flash = Some(ErrorFlash { stop, join_handle });
    }

    /// Leave the Error state and show the state the flags describe.
    /// Errors are never cleared automatically.
    pub fn clear_error(&self) {
        let mut flash = self.flash.lock();
        if let Some(running) = flash.take() {
            running.stop.stop();
            if running.join_handle.join().is_err() {
                warn!("Error flash thread panicked");
            }
        }
        self.error_code.store(0, Ordering::Release);
        let mut inner = self.inner.lock();
        if inner.state == IndicatorState::Error {
            inner.state =
                IndicatorState::from_flags(inner.detection_enabled, inner.recording_enabled);
            info!(state = %inner.state, "Error cleared");
        }
        if let Some(led) = self.error_led() {
            led.off();
        }
    }

    /// True while the error flash loop is alive.
    pub fn is_flashing(&self) -> bool {
        self.flash
            .lock()
            .as_ref()
            .is_some_and(|flash| !flash.join_handle.is_finished())
    }

    /// Show the storage level measured by the storage monitor.
    ///
    /// * `percent_full`: used over total, 0.0 to 1.0.
    pub fn update_storage(&self, percent_full: f64) {
        let level = StorageLevel::from_percent_full(percent_full);
        if level == StorageLevel::Full {
            if !self.drive_full.swap(true, Ordering::AcqRel) {
                warn!(percent_full, "Save drive is full");
            }
            match self.variant {
                IndicatorVariant::Advanced => self.error(DRIVE_FULL),
                IndicatorVariant::Ute => {
                    if let Some(led) = &self.storage_led {
                        led.on();
                    }
                    if let Some(led) = &self.record_led {
                        led.off();
                    }
                }
                IndicatorVariant::Headless => {}
            }
        } else if let (Some(led), Some(pattern)) = (&self.storage_led, level.pattern()) {
            led.blink(pattern, None);
        }
    }

    /// Light used for pulses and notifications.
    fn signal_led(&self) -> Option<&Arc<Led>> {
        self.status_led.as_ref().or(self.record_led.as_ref())
    }

    /// Light used for error codes. Only the advanced status light shows
    /// them, the ute lights keep showing recording and storage.
    fn error_led(&self) -> Option<Arc<Led>> {
        self.status_led.clone()
    }

    fn leds(&self) -> impl Iterator<Item = &Arc<Led>> {
        [&self.status_led, &self.record_led, &self.storage_led]
            .into_iter()
            .flatten()
    }

    fn stop_flash(&self) {
        let flash = self.flash.lock().take();
        if let Some(flash) = flash {
            flash.stop.stop();
            if flash.join_handle.join().is_err() {
                warn!("Error flash thread panicked");
            }
        }
    }
}

impl Drop for StatusIndicator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Flash the current error code until stopped. The code is read at the
/// start of every repetition so a new error shows on the next round.
fn flash_error_code(
    light: Option<Arc<Led>>,
    error_code: Arc<AtomicU8>,
    stop: Arc<StopSignal>,
    timing: FlashTiming,
) {
    let blink = BlinkPattern {
        on: timing.on,
        off: Duration::ZERO,
    };
    while !stop.is_stopped() {
        for _ in 0..error_code.load(Ordering::Acquire) {
            if let Some(light) = &light {
                light.blink_and_wait(blink, 1);
            }
            if stop.wait_timeout(timing.gap) {
                return;
            }
        }
        if stop.wait_timeout(timing.pause) {
            return;
        }
    }
}
