use crate::{
    components::crop_bed::status::indicator::{StatusIndicator, STORAGE_UNAVAILABLE},
    devices::hardware::led::BlinkPattern,
    utils::signal::StopSignal,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::Duration,
};
use sysinfo::Disks;
use tracing::{debug, info, warn};

/// Used and total bytes of the drive holding the save directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveCapacity {
    pub used: u64,
    pub total: u64,
}

impl DriveCapacity {
    /// Fraction of the drive in use, `None` for a drive reporting no size.
    pub fn percent_full(&self) -> Option<f64> {
        (self.total > 0).then(|| self.used as f64 / self.total as f64)
    }
}

/// Storage band shown on the storage light.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLevel {
    /// 90 percent and over.
    Full,
    /// 85 percent and over.
    Critical,
    /// 80 percent and over.
    High,
    /// 75 percent and over.
    Elevated,
    /// 50 percent and over.
    Half,
    Low,
}

impl StorageLevel {
    /// Band for a fraction of the drive in use.
    pub fn from_percent_full(percent_full: f64) -> Self {
        match percent_full {
            p if p >= 0.90 => Self::Full,
            p if p >= 0.85 => Self::Critical,
            p if p >= 0.80 => Self::High,
            p if p >= 0.75 => Self::Elevated,
            p if p >= 0.5 => Self::Half,
            _ => Self::Low,
        }
    }

    /// Blink rate of the storage light, faster as the drive fills. A full
    /// drive has no pattern, the light is held on instead.
    pub fn pattern(self) -> Option<BlinkPattern> {
        match self {
            Self::Full => None,
            Self::Critical => Some(BlinkPattern::from_millis(200, 200)),
            Self::High => Some(BlinkPattern::from_millis(500, 500)),
            Self::Elevated => Some(BlinkPattern::from_millis(500, 1_500)),
            Self::Half => Some(BlinkPattern::from_millis(500, 3_000)),
            Self::Low => Some(BlinkPattern::from_millis(500, 4_500)),
        }
    }
}

/// Source of drive capacity readings.
pub trait StorageProbe: Send {
    /// Current capacity, `None` when it cannot be measured.
    fn sample(&mut self) -> Option<DriveCapacity>;
}

/// Probe reading the drive that holds the save directory.
pub struct DiskProbe {
    save_directory: Option<PathBuf>,
}

impl DiskProbe {
    /// * `save_directory`: where images are saved, `None` when unset.
    pub fn new(save_directory: Option<PathBuf>) -> Self {
        Self { save_directory }
    }
}

impl StorageProbe for DiskProbe {
    fn sample(&mut self) -> Option<DriveCapacity> {
        // A missing or unmounted save directory has no capacity to report.
        let directory = self.save_directory.as_ref()?.canonicalize().ok()?;
        if !directory.is_dir() {
            return None;
        }
        let disks = Disks::new_with_refreshed_list();
        select_mount(
            &directory,
            disks
                .list()
                .iter()
                .map(|disk| (disk.mount_point(), disk.total_space(), disk.available_space())),
        )
    }
}

/// Capacity of the mount with the longest mount point containing `path`.
///
/// * `path`: absolute path on the drive.
/// * `mounts`: mount point, total bytes and available bytes of every disk.
fn select_mount<'a>(
    path: &Path,
    mounts: impl Iterator<Item = (&'a Path, u64, u64)>,
) -> Option<DriveCapacity> {
    mounts
        .filter(|(mount_point, _, _)| path.starts_with(mount_point))
        .max_by_key(|(mount_point, _, _)| mount_point.components().count())
        .map(|(_, total, available)| DriveCapacity {
            used: total.saturating_sub(available),
            total,
        })
}

fn default_interval() -> Duration {
    Duration::from_millis(10_500)
}

fn default_save_required() -> bool {
    true
}

/// Storage polling configuration.
#[serde_as]
#[derive(Deserialize, Serialize, PartialEq, Debug, Clone)]
pub struct StorageMonitorConfig {
    /// Time between polls.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "default_interval")]
    pub interval: Duration,
    /// Raise an error when the drive cannot be read. Off when image
    /// saving is disabled.
    #[serde(default = "default_save_required")]
    pub save_required: bool,
}

impl Default for StorageMonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            save_required: default_save_required(),
        }
    }
}

/// Background poll of the save drive, reporting into a status indicator.
pub struct StorageMonitor {
    stop: Arc<StopSignal>,
    join_handle: Option<JoinHandle<()>>,
}

impl StorageMonitor {
    /// Poll straight away, then every `config.interval` until stopped or
    /// until the indicator is dropped.
    ///
    /// * `indicator`: indicator receiving the readings.
    /// * `probe`: drive capacity source.
    /// * `config`: polling configuration.
    pub fn start(
        indicator: Weak<StatusIndicator>,
        mut probe: Box<dyn StorageProbe>,
        config: StorageMonitorConfig,
    ) -> Self {
        let stop = Arc::new(StopSignal::new());
        let thread_stop = stop.clone();
        let join_handle = thread::spawn(move || {
            info!(interval = ?config.interval, "Storage monitor started");
            loop {
                match indicator.upgrade() {
                    Some(indicator) => poll_once(&indicator, probe.as_mut(), &config),
                    None => break,
                }
                if thread_stop.wait_timeout(config.interval) {
                    break;
                }
            }
            debug!("Storage monitor finished");
        });
        Self {
            stop,
            join_handle: Some(join_handle),
        }
    }

    /// Stop polling and join the thread. Safe to call twice.
    pub fn stop(&mut self) {
        self.stop.stop();
        let Some(handle) = self.join_handle.take() else {
            return;
        };
        // The indicator can be dropped from the polling thread itself.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("Storage monitor thread panicked");
        }
    }
}

impl Drop for StorageMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Take one reading and report it.
///
/// * `indicator`: indicator receiving the reading.
/// * `probe`: drive capacity source.
/// * `config`: decides whether a missing reading is an error.
pub fn poll_once(
    indicator: &StatusIndicator,
    probe: &mut dyn StorageProbe,
    config: &StorageMonitorConfig,
) {
    match probe.sample().and_then(|capacity| capacity.percent_full()) {
        Some(percent_full) => {
            debug!(percent_full, "Storage sampled");
            indicator.update_storage(percent_full);
        }
        None if config.save_required => {
            warn!("Save drive unavailable");
            indicator.error(STORAGE_UNAVAILABLE);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        components::crop_bed::status::indicator::{IndicatorState, IndicatorVariant},
        utils::tests::ScriptedProbe,
    };
    use rstest::rstest;
    use std::{sync::atomic::Ordering, time::Instant};

    fn headless() -> StatusIndicator {
        StatusIndicator::from_outputs(IndicatorVariant::Headless, None, None, None)
    }

    fn capacity(used: u64) -> Option<DriveCapacity> {
        Some(DriveCapacity { used, total: 100 })
    }

    #[rstest]
    #[case(0.95, StorageLevel::Full)]
    #[case(0.90, StorageLevel::Full)]
    #[case(0.87, StorageLevel::Critical)]
    #[case(0.80, StorageLevel::High)]
    #[case(0.76, StorageLevel::Elevated)]
    #[case(0.50, StorageLevel::Half)]
    #[case(0.10, StorageLevel::Low)]
    fn test_storage_bands(#[case] percent_full: f64, #[case] level: StorageLevel) {
        assert_eq!(StorageLevel::from_percent_full(percent_full), level);
        assert_eq!(level.pattern().is_none(), level == StorageLevel::Full);
    }

    #[test]
    fn test_empty_drive_has_no_percentage() {
        assert_eq!(DriveCapacity { used: 0, total: 0 }.percent_full(), None);
        assert_eq!(DriveCapacity { used: 25, total: 100 }.percent_full(), Some(0.25));
    }

    #[test]
    fn test_longest_mount_point_wins() {
        let mounts: [(&Path, u64, u64); 3] = [
            (Path::new("/"), 1_000, 900),
            (Path::new("/media/owl"), 100, 5),
            (Path::new("/media"), 500, 500),
        ];
        let selected = select_mount(
            Path::new("/media/owl/images"),
            mounts.iter().copied(),
        );
        assert_eq!(selected, Some(DriveCapacity { used: 95, total: 100 }));
        assert_eq!(select_mount(Path::new("relative"), mounts.iter().copied()), None);
    }

    #[test]
    fn test_probe_without_directory_has_no_reading() {
        assert_eq!(DiskProbe::new(None).sample(), None);
    }

    #[test]
    fn test_probe_with_missing_directory_has_no_reading() {
        let mut probe = DiskProbe::new(Some(PathBuf::from("/does/not/exist/owl/images")));
        assert_eq!(probe.sample(), None);
    }

    #[test]
    fn test_missing_save_directory_raises_storage_error() {
        let indicator = headless();
        let mut probe = DiskProbe::new(Some(PathBuf::from("/does/not/exist/owl/images")));
        poll_once(&indicator, &mut probe, &StorageMonitorConfig::default());

        assert_eq!(indicator.state(), IndicatorState::Error);
        indicator.stop();
    }

    #[test]
    fn test_full_drive_sets_flag() {
        let indicator = headless();
        let (mut probe, _) = ScriptedProbe::new(vec![capacity(95)]);
        poll_once(&indicator, &mut probe, &StorageMonitorConfig::default());

        assert!(indicator.drive_full());
        indicator.stop();
    }

    #[rstest]
    #[case(true, IndicatorState::Error)]
    #[case(false, IndicatorState::Idle)]
    fn test_missing_drive_errors_only_when_saving(
        #[case] save_required: bool,
        #[case] expected: IndicatorState,
    ) {
        let indicator = headless();
        let (mut probe, _) = ScriptedProbe::new(vec![None]);
        let config = StorageMonitorConfig {
            save_required,
            ..StorageMonitorConfig::default()
        };
        poll_once(&indicator, &mut probe, &config);

        assert_eq!(indicator.state(), expected);
        assert!(!indicator.drive_full());
        indicator.stop();
    }

    #[test]
    fn test_monitor_polls_immediately_and_stops_promptly() {
        let indicator = Arc::new(headless());
        let (probe, taken) = ScriptedProbe::new(vec![capacity(40)]);
        let mut monitor = StorageMonitor::start(
            Arc::downgrade(&indicator),
            Box::new(probe),
            StorageMonitorConfig {
                interval: Duration::from_secs(30),
                save_required: true,
            },
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        while taken.load(Ordering::Acquire) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let stopping = Instant::now();
        monitor.stop();
        monitor.stop();

        assert_eq!(taken.load(Ordering::Acquire), 1);
        assert!(stopping.elapsed() < Duration::from_secs(1));
        assert!(!indicator.drive_full());
    }

    #[test]
    fn test_indicator_start_and_stop_drive_the_monitor() {
        let indicator = Arc::new(headless().with_storage_config(StorageMonitorConfig {
            interval: Duration::from_millis(10),
            save_required: true,
        }));
        let (probe, taken) = ScriptedProbe::new(vec![capacity(10), capacity(20), capacity(92)]);
        indicator.start(Box::new(probe));

        let deadline = Instant::now() + Duration::from_secs(2);
        while !indicator.drive_full() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        indicator.stop();
        let after_stop = taken.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(50));

        assert!(indicator.drive_full());
        assert!(after_stop >= 3);
        assert_eq!(taken.load(Ordering::Acquire), after_stop);
    }
}
