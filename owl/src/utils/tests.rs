//! Fakes shared by the unit tests of the hardware facing components.

use crate::{
    components::crop_bed::{
        actuating::spray::RelayObserver,
        status::storage::{DriveCapacity, StorageProbe},
    },
    devices::hardware::{led::LightOutput, relay::ActuatorDriver},
    error::DriverError,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Call made on a `RecordingDriver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    Energize(u8),
    DeEnergize(u8),
    /// Number of beeps requested.
    Sound(u32),
    Release(u8),
    Shutdown,
}

/// Driver that records every call with the time it was made.
pub struct RecordingDriver {
    channels: Vec<u8>,
    events: Mutex<Vec<(Instant, DriverEvent)>>,
}

impl RecordingDriver {
    pub fn new(channels: &[u8]) -> Self {
        Self {
            channels: channels.to_vec(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().iter().map(|(_, event)| *event).collect()
    }

    /// Energize and de-energize calls on one channel.
    pub fn relay_events(&self, channel: u8) -> Vec<DriverEvent> {
        self.events()
            .into_iter()
            .filter(|event| {
                matches!(event, DriverEvent::Energize(c) | DriverEvent::DeEnergize(c) if *c == channel)
            })
            .collect()
    }

    /// When `event` was first recorded.
    pub fn first_at(&self, event: &DriverEvent) -> Option<Instant> {
        self.events
            .lock()
            .iter()
            .find(|(_, recorded)| recorded == event)
            .map(|(at, _)| *at)
    }

    fn record(&self, event: DriverEvent) {
        self.events.lock().push((Instant::now(), event));
    }

    fn check(&self, channel: u8) -> Result<(), DriverError> {
        if self.channels.contains(&channel) {
            Ok(())
        } else {
            Err(DriverError::UnknownChannel(channel))
        }
    }
}

impl ActuatorDriver for RecordingDriver {
    fn energize(&self, channel: u8) -> Result<(), DriverError> {
        self.check(channel)?;
        self.record(DriverEvent::Energize(channel));
        Ok(())
    }

    fn de_energize(&self, channel: u8) -> Result<(), DriverError> {
        self.check(channel)?;
        self.record(DriverEvent::DeEnergize(channel));
        Ok(())
    }

    fn sound(&self, _duration: Duration, repeats: u32) -> Result<(), DriverError> {
        self.record(DriverEvent::Sound(repeats));
        Ok(())
    }

    fn release(&self, channel: u8) -> Result<(), DriverError> {
        self.record(DriverEvent::Release(channel));
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DriverError> {
        self.record(DriverEvent::Shutdown);
        Ok(())
    }

    fn channels(&self) -> Vec<u8> {
        self.channels.clone()
    }
}

/// Light output that records every write.
pub struct RecordingLight {
    writes: Arc<Mutex<Vec<bool>>>,
}

/// Read side of a `RecordingLight`, kept by the test after the light is
/// handed to an `Led`.
#[derive(Clone)]
pub struct LightRecord {
    writes: Arc<Mutex<Vec<bool>>>,
}

impl RecordingLight {
    pub fn new() -> (Self, LightRecord) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                writes: writes.clone(),
            },
            LightRecord { writes },
        )
    }
}

impl LightOutput for RecordingLight {
    fn set(&mut self, lit: bool) -> Result<(), DriverError> {
        self.writes.lock().push(lit);
        Ok(())
    }
}

impl LightRecord {
    /// Number of times the light was switched on.
    pub fn lit_count(&self) -> usize {
        self.writes.lock().iter().filter(|lit| **lit).count()
    }

    pub fn last(&self) -> Option<bool> {
        self.writes.lock().last().copied()
    }

    pub fn writes(&self) -> Vec<bool> {
        self.writes.lock().clone()
    }
}

/// Observer that records relay updates in order.
#[derive(Default)]
pub struct RecordingObserver {
    updates: Mutex<Vec<(u8, bool)>>,
}

impl RecordingObserver {
    pub fn updates(&self) -> Vec<(u8, bool)> {
        self.updates.lock().clone()
    }
}

impl RelayObserver for RecordingObserver {
    fn update(&self, channel: u8, energized: bool) {
        self.updates.lock().push((channel, energized));
    }
}

/// Probe that plays back a fixed list of samples and then repeats the last.
pub struct ScriptedProbe {
    samples: VecDeque<Option<DriveCapacity>>,
    last: Option<DriveCapacity>,
    taken: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    /// Probe and a counter of the samples taken from it.
    pub fn new(samples: Vec<Option<DriveCapacity>>) -> (Self, Arc<AtomicUsize>) {
        let taken = Arc::new(AtomicUsize::new(0));
        (
            Self {
                samples: samples.into(),
                last: None,
                taken: taken.clone(),
            },
            taken,
        )
    }
}

impl StorageProbe for ScriptedProbe {
    fn sample(&mut self) -> Option<DriveCapacity> {
        self.taken.fetch_add(1, Ordering::AcqRel);
        if let Some(next) = self.samples.pop_front() {
            self.last = next;
        }
        self.last
    }
}
