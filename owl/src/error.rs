use std::path::PathBuf;
use thiserror::Error;

/// Errors raised at the hardware boundary. Only acquisition and release
/// failures are fatal, everything raised once the workers are running is
/// logged by the caller and the thread carries on.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Another process already holds the output lines, most likely a
    /// second instance of the sprayer started on the same board.
    #[error("{resource} is busy, an instance may already be running")]
    AlreadyRunning {
        /// The chip, board or line that refused the request.
        resource: String,
    },

    /// Any other fault talking to the hardware, a missing chip, a bad
    /// line offset, a failed write.
    #[error("hardware fault on {resource}: {reason}")]
    Hardware {
        /// The chip, board or line that failed.
        resource: String,
        /// Description of the fault from the underlying driver.
        reason: String,
    },

    /// The channel was never acquired, or has been released.
    #[error("channel {0} is not mapped to an output line")]
    UnknownChannel(u8),
}

impl DriverError {
    /// Create a hardware fault error.
    pub fn hardware(resource: impl Into<String>, reason: impl ToString) -> Self {
        Self::Hardware {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an already running error.
    pub fn already_running(resource: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            resource: resource.into(),
        }
    }

    /// True when the failure is a conflict with another instance rather
    /// than a wiring or hardware problem.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }
}

/// Errors returned by the relay dispatcher lifecycle and job intake.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Acquiring or releasing the driver failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A job was addressed to a channel with no worker.
    #[error("no worker for channel {0}")]
    UnknownChannel(u8),

    /// `start` was called on a dispatcher that is already running.
    #[error("dispatcher is already started")]
    AlreadyStarted,

    /// A job was received before `start` or after `stop`.
    #[error("dispatcher is not running")]
    NotRunning,

    /// The operating system refused to start a channel worker.
    #[error("failed to spawn channel worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors reading component configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file does not exist.
    #[error("could not locate the config file {0:?}")]
    Missing(PathBuf),

    /// The file exists but could not be parsed into the expected struct.
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        /// Path of the file being read.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: config::ConfigError,
    },
}
