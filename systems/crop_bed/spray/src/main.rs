//! Spray system binary. Reads weed and status messages as JSON lines on
//! stdin and drives the relay board until stdin closes or ctrl-c.

use clap::Parser;
use owl::{
    components::prelude::*,
    error::{DispatchError, DriverError},
    messages::control::ControlMessage,
};
use std::{process::ExitCode, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code when another instance already holds the relay board.
const EXIT_ALREADY_RUNNING: u8 = 2;

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the Relay Dispatcher Component.
    #[arg(short, long)]
    dispatcher: String,
    /// Path to the config file for the Status Indicator Component.
    #[arg(short, long)]
    indicator: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let indicator = match args.indicator.as_deref().map(load_indicator).transpose() {
        Ok(indicator) => indicator,
        Err(code) => return code,
    };

    let mut dispatcher = match RelayDispatcher::from_config_file(&args.dispatcher) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(error = %e, "Failed to load relay dispatcher config");
            return ExitCode::FAILURE;
        }
    };
    if let Some(indicator) = &indicator {
        dispatcher = dispatcher.with_indicator(indicator.clone());
    }

    if let Err(e) = dispatcher.start() {
        if let Some(indicator) = &indicator {
            indicator.stop();
        }
        return match e {
            DispatchError::Driver(e @ DriverError::AlreadyRunning { .. }) => {
                error!(error = %e, "Sprayer is already running, stop the other instance first");
                ExitCode::from(EXIT_ALREADY_RUNNING)
            }
            e => {
                error!(error = %e, "Failed to start relay dispatcher");
                ExitCode::FAILURE
            }
        };
    }
    if let Some(indicator) = &indicator {
        indicator.setup_success();
    }
    info!(channels = ?dispatcher.channels(), "Ready for weed messages");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&dispatcher, indicator.as_deref(), &line),
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let stopped = dispatcher.stop();
    if let Some(indicator) = &indicator {
        indicator.stop();
    }
    match stopped {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Failed to release relay board");
            ExitCode::FAILURE
        }
    }
}

fn load_indicator(filepath: &str) -> Result<Arc<StatusIndicator>, ExitCode> {
    let config = StatusIndicatorConfig::from_file(filepath).map_err(|e| {
        error!(error = %e, "Failed to load status indicator config");
        ExitCode::FAILURE
    })?;
    let indicator = StatusIndicator::new(&config).map_err(|e| {
        error!(error = %e, "Failed to acquire status lights");
        if e.is_conflict() {
            ExitCode::from(EXIT_ALREADY_RUNNING)
        } else {
            ExitCode::FAILURE
        }
    })?;
    let indicator = Arc::new(indicator);
    indicator.start_from_config(&config);
    Ok(indicator)
}

fn handle_line(dispatcher: &RelayDispatcher, indicator: Option<&StatusIndicator>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<ControlMessage>(line) {
        Ok(ControlMessage::Weed(message)) => {
            debug!(?message, "Weed message");
            if let Err(e) = dispatcher.receive_job(message.into()) {
                warn!(error = %e, "Dropped weed message");
            }
        }
        Ok(ControlMessage::Status(message)) => match indicator {
            Some(indicator) => indicator.apply(&message),
            None => debug!(?message, "No status indicator configured"),
        },
        Err(e) => warn!(error = %e, line, "Unrecognised message"),
    }
}
