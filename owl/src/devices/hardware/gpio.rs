use crate::error::DriverError;
use gpio_cdev::{Chip, Error as GpioError, LineHandle, LineRequestFlags};
use nix::errno::Errno;
use std::{error::Error, io};
use tracing::debug;

/// Open a GPIO character device, e.g. `/dev/gpiochip0`.
///
/// * `path`: path to the chip.
pub fn open_chip(path: &str) -> Result<Chip, DriverError> {
    Chip::new(path).map_err(|e| classify(path.to_string(), e))
}

/// Request a single line as an output held at its inactive level.
///
/// With `active_low` the kernel inverts the line, so writing 1 always
/// means "on" regardless of how the board was wired.
///
/// * `chip`: opened chip.
/// * `offset`: line offset on the chip.
/// * `active_low`: the load switches on when the pin is pulled low.
/// * `consumer`: label shown by `gpioinfo` while the line is held.
pub fn request_output(
    chip: &mut Chip,
    offset: u32,
    active_low: bool,
    consumer: &str,
) -> Result<LineHandle, DriverError> {
    let resource = format!("{}:{offset}", chip.path().display());
    let line = chip
        .get_line(offset)
        .map_err(|e| DriverError::hardware(&resource, e))?;

    let mut flags = LineRequestFlags::OUTPUT;
    if active_low {
        flags |= LineRequestFlags::ACTIVE_LOW;
    }
    let handle = line
        .request(flags, 0, consumer)
        .map_err(|e| classify(resource.clone(), e))?;
    debug!(line = %resource, consumer, active_low, "Requested output line");
    Ok(handle)
}

/// Translate a driver error, separating a line held by another process
/// (EBUSY) from every other fault.
fn classify(resource: String, error: GpioError) -> DriverError {
    if is_busy(&error) {
        DriverError::already_running(resource)
    } else {
        DriverError::hardware(resource, error)
    }
}

fn is_busy(error: &GpioError) -> bool {
    let Some(source) = error.source() else {
        return false;
    };
    if let Some(errno) = source.downcast_ref::<Errno>() {
        return *errno == Errno::EBUSY;
    }
    source
        .downcast_ref::<io::Error>()
        .is_some_and(|io| io.raw_os_error() == Some(libc::EBUSY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_chip_is_a_hardware_fault() {
        let error = open_chip("/dev/gpiochip-does-not-exist")
            .err()
            .expect("chip should not open");
        assert!(!error.is_conflict());
        assert!(matches!(error, DriverError::Hardware { .. }));
    }

    #[test]
    fn test_busy_line_is_a_conflict() {
        let busy = GpioError::from(io::Error::from_raw_os_error(libc::EBUSY));
        let error = classify(String::from("/dev/gpiochip0:17"), busy);

        assert!(error.is_conflict());
        assert!(error.to_string().contains("/dev/gpiochip0:17"));
    }

    #[test]
    fn test_missing_device_is_not_a_conflict() {
        let missing = GpioError::from(io::Error::from_raw_os_error(libc::ENOENT));
        let error = classify(String::from("/dev/gpiochip9"), missing);

        assert!(matches!(error, DriverError::Hardware { .. }));
    }
}
