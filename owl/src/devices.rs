/// Devices are the atomic units that can be combined together
/// into components. Their core responsibilities do not change
/// based on location, name etc.
pub mod hardware {
    /// Shared helpers for requesting lines from a GPIO character device.
    pub mod gpio;
    /// Indicator lights and the background blinker that drives them.
    pub mod led;
    /// Relay boards switching the spray solenoids, plus the buzzer.
    pub mod relay;
}
