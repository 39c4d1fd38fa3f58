use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use std::{ffi::OsStr, path::Path};

/// Cooperative stop signal with interruptible waits.
pub mod signal;
/// Fakes for the hardware boundary shared between test modules.
#[cfg(test)]
pub mod tests;

/// Read a yaml component config into a type safe structure. Every
/// component and device config goes through here so a missing file
/// and a malformed file are reported the same way.
///
/// * `filepath`: path to the yaml file.
pub fn read_yaml_config<T, F>(filepath: F) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
    F: AsRef<OsStr>,
{
    let file = Path::new(&filepath);
    if !file.is_file() {
        return Err(ConfigError::Missing(file.to_path_buf()));
    }
    config::Config::builder()
        .add_source(config::File::new(
            &file.to_string_lossy(),
            config::FileFormat::Yaml,
        ))
        .build()
        .and_then(|config_file| config_file.try_deserialize::<T>())
        .map_err(|source| ConfigError::Parse {
            path: file.to_path_buf(),
            source,
        })
}
