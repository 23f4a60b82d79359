//! Configuration management for shroud
//!
//! Configuration lives in TOML files. Every field has a default, so a file
//! only needs to name what it overrides.

mod mux;

pub use mux::{MuxConfig, ValveConfig};

use std::io;
use std::path::Path;

use crate::error::ConfigError;

/// Read a TOML file into `T`
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
        _ => ConfigError::Invalid(format!("cannot read {}: {}", path.display(), e)),
    })?;
    Ok(toml::from_str(&content)?)
}

/// Write `config` as TOML, creating parent directories as needed
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| {
            ConfigError::Invalid(format!("cannot create {}: {}", dir.display(), e))
        })?;
    }
    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("cannot write {}: {}", path.display(), e)))
}

impl MuxConfig {
    /// Load a multiplexer configuration and check it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_config(path)?;
        config.validate()?;
        Ok(config)
    }
}
