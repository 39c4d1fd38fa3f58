use crate::{
    components::crop_bed::status::indicator::StatusIndicator,
    devices::hardware::relay::{ActuatorDriver, DriverConfig, RelayPin},
    error::{ConfigError, DispatchError},
    messages::control::weed::WeedMessage,
    utils::read_yaml_config,
};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use ringbuffer::{AllocRingBuffer, RingBuffer};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::{
    collections::BTreeMap,
    ffi::OsStr,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Jobs held per channel. When a detection burst outruns the nozzle the
/// oldest job is dropped, a late spray is worth less than a current one.
pub const CHANNEL_QUEUE_CAPACITY: usize = 5;

/// One timed activation of a channel, tied to the detection that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Channel (nozzle) to fire.
    pub channel: u8,
    /// When the weed was detected.
    pub timestamp: DateTime<Utc>,
    /// Lag between energizing the relay and the nozzle spraying.
    pub delay: Duration,
    /// How long the channel should spray, measured from `timestamp`.
    pub duration: Duration,
}

impl Job {
    /// Create a new job.
    pub fn new(channel: u8, timestamp: DateTime<Utc>, delay: Duration, duration: Duration) -> Self {
        Self {
            channel,
            timestamp,
            delay,
            duration,
        }
    }

    /// Time left to spray at `now`. The duration is anchored to the
    /// detection, so time spent queued or dispatching is taken off, and
    /// a job that is already spent returns zero.
    ///
    /// * `now`: current time.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = now.signed_duration_since(self.timestamp);
        match elapsed.to_std() {
            Ok(elapsed) => self.duration.saturating_sub(elapsed),
            // Stamped ahead of our clock.
            Err(_) => (-elapsed)
                .to_std()
                .map_or(self.duration, |ahead| self.duration.saturating_add(ahead)),
        }
    }
}

impl From<WeedMessage> for Job {
    fn from(message: WeedMessage) -> Self {
        Self::new(
            message.channel,
            message.timestamp,
            message.delay,
            message.duration,
        )
    }
}

/// Whether the channel's relay is currently energized. Only the channel's
/// own consumer thread reads or writes it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState {
    /// Relay is energized.
    pub is_active: bool,
}

/// Notified on every relay transition, used to drive a live view of the
/// nozzles.
pub trait RelayObserver: Send + Sync {
    /// `channel` has switched to `energized`.
    fn update(&self, channel: u8, energized: bool);
}

/// Bounded job queue of one channel paired with the condition its consumer
/// sleeps on.
pub struct ChannelMonitor {
    /// Pending jobs, oldest first.
    queue: Mutex<AllocRingBuffer<Job>>,
    /// Signalled on every submission and on shutdown.
    signal: Condvar,
}

impl Default for ChannelMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMonitor {
    /// Create an empty monitor holding at most [`CHANNEL_QUEUE_CAPACITY`] jobs.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(AllocRingBuffer::new(CHANNEL_QUEUE_CAPACITY)),
            signal: Condvar::new(),
        }
    }

    /// Queue `job` and wake the consumer. Never waits on actuation, only
    /// on the queue lock. Returns the job evicted to make room, if any.
    ///
    /// * `job`: job to queue.
    pub fn submit(&self, job: Job) -> Option<Job> {
        let mut queue = self.queue.lock();
        let evicted = if queue.is_full() { queue.dequeue() } else { None };
        if let Some(dropped) = &evicted {
            debug!(channel = dropped.channel, timestamp = %dropped.timestamp, "Queue full, dropped oldest job");
        }
        queue.push(job);
        self.signal.notify_one();
        evicted
    }

    /// Jobs waiting to be consumed, oldest first.
    pub fn pending(&self) -> Vec<Job> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Wake the consumer so it can observe shutdown. The lock is taken so
    /// a consumer between checking the running flag and waiting cannot
    /// miss the wake up.
    fn wake(&self) {
        let _queue = self.queue.lock();
        self.signal.notify_all();
    }
}

/// Dispatcher side of a channel: the shared monitor and the consumer thread.
pub struct ChannelWorker {
    /// Channel served.
    channel: u8,
    /// Queue shared with the consumer thread.
    monitor: Arc<ChannelMonitor>,
    /// Consumer thread, taken when joined.
    join_handle: Option<JoinHandle<()>>,
}

impl ChannelWorker {
    /// Spawn the consumer thread for `channel`. The thread reports on
    /// `ready` before taking jobs so the dispatcher knows when every
    /// channel is live.
    fn spawn(
        channel: u8,
        driver: Arc<dyn ActuatorDriver>,
        running: Arc<AtomicBool>,
        ready: Sender<u8>,
        indicator: Option<Arc<StatusIndicator>>,
        observer: Option<Arc<dyn RelayObserver>>,
    ) -> io::Result<Self> {
        let monitor = Arc::new(ChannelMonitor::new());
        let consumer = ChannelConsumer {
            channel,
            monitor: monitor.clone(),
            driver,
            running,
            indicator,
            observer,
            state: ChannelState::default(),
        };
        let join_handle = thread::Builder::new()
            .name(format!("relay-{channel}"))
            .spawn(move || {
                // The dispatcher stops listening once it has heard from everyone.
                ready.send(channel).ok();
                consumer.run();
            })?;
        Ok(Self {
            channel,
            monitor,
            join_handle: Some(join_handle),
        })
    }

    /// Queue a job on this channel.
    ///
    /// * `job`: job to queue.
    pub fn submit(&self, job: Job) {
        self.monitor.submit(job);
    }

    /// Channel served by this worker.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Jobs waiting on this channel, oldest first.
    pub fn pending(&self) -> Vec<Job> {
        self.monitor.pending()
    }

    fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                error!(channel = self.channel, "Channel worker panicked");
            }
        }
    }
}

/// Consumer thread state of one channel.
struct ChannelConsumer {
    channel: u8,
    monitor: Arc<ChannelMonitor>,
    driver: Arc<dyn ActuatorDriver>,
    running: Arc<AtomicBool>,
    indicator: Option<Arc<StatusIndicator>>,
    observer: Option<Arc<dyn RelayObserver>>,
    state: ChannelState,
}

impl ChannelConsumer {
    /// Drain the queue until shutdown. The queue lock is held except while
    /// a job is being actuated or the thread is waiting for work.
    fn run(mut self) {
        let monitor = self.monitor.clone();
        let mut queue = monitor.queue.lock();
        debug!(channel = self.channel, "Channel worker started");

        while self.running.load(Ordering::Acquire) {
            while let Some(job) = queue.dequeue() {
                MutexGuard::unlocked(&mut queue, || self.actuate(&job));
            }

            if self.state.is_active {
                self.switch_off();
            }

            if self.running.load(Ordering::Acquire) && queue.is_empty() {
                monitor.signal.wait(&mut queue);
            }
        }
        drop(queue);

        if self.state.is_active {
            self.switch_off();
        }
        debug!(channel = self.channel, "Channel worker stopped");
    }

    /// Spray for the remainder of `job`. A channel that is already on stays
    /// on, so back to back jobs extend the spray without a flicker.
    fn actuate(&mut self, job: &Job) {
        let remaining = job.remaining(Utc::now());

        if !self.state.is_active {
            thread::sleep(job.delay);
            self.switch_on();
        }
        debug!(channel = self.channel, remaining_ms = remaining.as_millis() as u64, "Spraying");
        thread::sleep(remaining);
    }

    fn switch_on(&mut self) {
        match self.driver.energize(self.channel) {
            Ok(()) => {
                self.state.is_active = true;
                if let Some(indicator) = &self.indicator {
                    indicator.weed_detect_indicator();
                }
                if let Some(observer) = &self.observer {
                    observer.update(self.channel, true);
                }
            }
            Err(e) => error!(channel = self.channel, error = %e, "Failed to energize relay"),
        }
    }

    fn switch_off(&mut self) {
        if let Err(e) = self.driver.de_energize(self.channel) {
            error!(channel = self.channel, error = %e, "Failed to de-energize relay");
        }
        self.state.is_active = false;
        if let Some(observer) = &self.observer {
            observer.update(self.channel, false);
        }
    }
}

/// Confirmation beep sounded once every channel is live.
#[serde_as]
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct BeepConfig {
    /// Time the buzzer is on per beep.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
    /// Number of beeps.
    pub repeats: u32,
}

impl Default for BeepConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(500),
            repeats: 2,
        }
    }
}

/// Set the configuration for the relay dispatcher of one crop bed.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct RelayDispatcherConfig {
    /// ID of the crop bed the relays are attached to.
    crop_bed_id: u8,
    /// Hardware boundary to build.
    driver: DriverConfig,
    /// Logical channel to relay line mapping. The wiring harness rarely
    /// follows nozzle order, so the mapping lives in config.
    relay_pins: Vec<RelayPin>,
    /// Line of the buzzer, if fitted.
    buzzer_pin: Option<u32>,
    /// Beep sounded once every channel is live.
    #[serde(default)]
    beep: BeepConfig,
}

impl RelayDispatcherConfig {
    /// Relay dispatcher configuration without any channels.
    ///
    /// * `crop_bed_id`: module ids from [0 - 2]
    /// * `driver`: hardware boundary to build.
    pub fn new(crop_bed_id: u8, driver: DriverConfig) -> Self {
        Self {
            crop_bed_id,
            driver,
            relay_pins: Vec::new(),
            buzzer_pin: None,
            beep: BeepConfig::default(),
        }
    }

    /// Add a channel wired to relay line `pin`.
    ///
    /// * `channel`: logical channel.
    /// * `pin`: line offset.
    pub fn add_relay(mut self, channel: u8, pin: u32) -> Self {
        self.relay_pins.push(RelayPin::new(channel, pin));
        self
    }

    /// Set the buzzer line.
    pub fn with_buzzer(mut self, pin: u32) -> Self {
        self.buzzer_pin = Some(pin);
        self
    }

    /// Override the confirmation beep.
    pub fn with_beep(mut self, beep: BeepConfig) -> Self {
        self.beep = beep;
        self
    }

    /// Create a new `RelayDispatcherConfig` by reading parameters stored in a file.
    ///
    /// * `filepath`: filepath to the stored parameters.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        read_yaml_config(filepath)
    }

    /// Channels configured, in ascending order.
    pub fn channels(&self) -> Vec<u8> {
        let mut channels: Vec<_> = self.relay_pins.iter().map(|relay| relay.channel).collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }
}

/// Component that owns the relay board and one worker per nozzle. Jobs
/// received from the detection pipeline are handed to the matching channel
/// worker which fires the relay on its own thread.
pub struct RelayDispatcher {
    /// Unique identifier for the component.
    uuid: Uuid,
    /// Configuration the component was built from.
    config: RelayDispatcherConfig,
    /// Relay board, present while running.
    driver: Option<Arc<dyn ActuatorDriver>>,
    /// Channel workers, present while running.
    workers: BTreeMap<u8, ChannelWorker>,
    /// Cleared on stop, observed by every worker.
    running: Arc<AtomicBool>,
    /// Pulsed when a channel fires.
    indicator: Option<Arc<StatusIndicator>>,
    /// Told about every relay transition.
    observer: Option<Arc<dyn RelayObserver>>,
}

impl RelayDispatcher {
    /// Create a new component from a config struct. Nothing is acquired
    /// until [`RelayDispatcher::start`].
    ///
    /// * `config`: Struct containing the parameters for configuration.
    pub fn new(config: RelayDispatcherConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            config,
            driver: None,
            workers: BTreeMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            indicator: None,
            observer: None,
        }
    }

    /// Create a new component by reading the config parameters from a file.
    ///
    /// * `filepath`: path to config file.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        Ok(Self::new(RelayDispatcherConfig::from_file(filepath)?))
    }

    /// Pulse `indicator` whenever a channel fires.
    pub fn with_indicator(mut self, indicator: Arc<StatusIndicator>) -> Self {
        self.indicator = Some(indicator);
        self
    }

    /// Report relay transitions to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn RelayObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Return the unique id of the dispatcher.
    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    /// True between a successful start and stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Channels with a live worker.
    pub fn channels(&self) -> Vec<u8> {
        self.workers.keys().copied().collect()
    }

    /// Acquire the relay board, start every channel worker and beep once
    /// they are all live. A conflicting instance is reported as
    /// [`DriverError::AlreadyRunning`](crate::error::DriverError) and is
    /// never retried.
    pub fn start(&mut self) -> Result<(), DispatchError> {
        if self.is_running() {
            return Err(DispatchError::AlreadyStarted);
        }
        let driver = self
            .config
            .driver
            .acquire(&self.config.relay_pins, self.config.buzzer_pin)
            .inspect_err(|e| {
                if e.is_conflict() {
                    error!(error = %e, "Relay board is held by another instance");
                }
            })?;
        self.start_with_driver(driver)
    }

    /// Start every channel worker against an already acquired driver.
    ///
    /// * `driver`: relay board to fire.
    pub fn start_with_driver(
        &mut self,
        driver: Arc<dyn ActuatorDriver>,
    ) -> Result<(), DispatchError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::AlreadyStarted);
        }
        info!(uuid = %self.uuid, crop_bed = self.config.crop_bed_id, "Setting up nozzles");

        let (ready, live) = mpsc::channel();
        for channel in self.config.channels() {
            let worker = ChannelWorker::spawn(
                channel,
                driver.clone(),
                self.running.clone(),
                ready.clone(),
                self.indicator.clone(),
                self.observer.clone(),
            );
            match worker {
                Ok(worker) => {
                    self.workers.insert(channel, worker);
                }
                Err(e) => {
                    error!(channel, error = %e, "Failed to spawn channel worker");
                    self.abort_start(driver.as_ref());
                    return Err(DispatchError::Spawn(e));
                }
            }
        }
        drop(ready);
        let reported = live.iter().take(self.workers.len()).count();
        info!(channels = reported, "Nozzle setup complete");

        if let Err(e) = driver.sound(self.config.beep.duration, self.config.beep.repeats) {
            warn!(error = %e, "Failed to sound confirmation beep");
        }
        self.driver = Some(driver);
        Ok(())
    }

    /// Queue an activation of `channel`. Best effort, the call returns as
    /// soon as the job is queued and a burst may push older jobs out.
    ///
    /// * `channel`: channel to fire.
    /// * `timestamp`: when the weed was detected.
    /// * `delay`: actuator lag before the nozzle sprays.
    /// * `duration`: spray time measured from `timestamp`.
    pub fn receive(
        &self,
        channel: u8,
        timestamp: DateTime<Utc>,
        delay: Duration,
        duration: Duration,
    ) -> Result<(), DispatchError> {
        self.receive_job(Job::new(channel, timestamp, delay, duration))
    }

    /// Queue an already built job.
    pub fn receive_job(&self, job: Job) -> Result<(), DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::NotRunning);
        }
        let worker = self
            .workers
            .get(&job.channel)
            .ok_or(DispatchError::UnknownChannel(job.channel))?;
        worker.submit(job);
        Ok(())
    }

    /// Stop every worker, wait for them to finish their current job, then
    /// release the relay board. A second call does nothing.
    pub fn stop(&mut self) -> Result<(), DispatchError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!(uuid = %self.uuid, "Stopping relay dispatcher");
        self.join_workers();

        if let Some(driver) = self.driver.take() {
            driver.shutdown()?;
        }
        info!(uuid = %self.uuid, "Relay dispatcher stopped");
        Ok(())
    }
}

impl RelayDispatcher {
    fn join_workers(&mut self) {
        for worker in self.workers.values() {
            worker.monitor.wake();
        }
        for worker in self.workers.values_mut() {
            worker.join();
        }
        self.workers.clear();
    }

    /// Undo a partial start, the driver is handed back straight away.
    fn abort_start(&mut self, driver: &dyn ActuatorDriver) {
        self.running.store(false, Ordering::Release);
        self.join_workers();
        if let Err(e) = driver.shutdown() {
            error!(error = %e, "Failed to release relay board after aborted start");
        }
    }
}

impl Drop for RelayDispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "Failed to stop relay dispatcher");
        }
    }
}
