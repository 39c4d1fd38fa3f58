/**
The owl actuation core turns timestamped weed detections into timed nozzle
activations and keeps the operator informed through indicator lights and a
buzzer. As with the rest of the machine, functionality is split into devices
(relay boards, lights) that are composed into components (the relay
dispatcher, the status indicator) with their own threads and lifecycles.
*/

/// Components in the system are created by grouping together
/// devices into a logical unit that performs some function
/// for the overall control system.
pub mod components;
/// Devices that are an atomic unit, and can be composed
/// with other devices into components to perform some function.
pub mod devices;
/// Error types shared by devices and components.
pub mod error;
/// Message structure for communication into the control
/// system from the detection and recording pipelines.
pub mod messages;
/// Configuration loading, shutdown signalling and test helpers.
pub mod utils;

/// Macro that helps to check test file exist at compile time.
/// [link](https://stackoverflow.com/questions/30003921/how-can-i-locate-resources-for-testing-with-cargo)
/// [link](https://stackoverflow.com/questions/73187970/compile-time-check-if-file-at-path-exists-like-include-str)
#[macro_export]
macro_rules! test_file_path {
    ($arg1:expr) => {{
        let _ = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), $arg1));
        concat!(env!("CARGO_MANIFEST_DIR"), $arg1)
    }};
}
