//! Runtime configuration.
//!
//! # Environment
//!
//! - `OXMETA_LOG`: minimum log level
//! - `OXMETA_TYPE_CAPACITY`: initial size of the type table
//! - `OXMETA_CONVERTER_CAPACITY`: initial size of the converter table

use oxmeta_log::Level;
use std::str::FromStr;

/// Environment variable with the initial type table size.
pub const TYPE_CAPACITY_ENV: &str = "OXMETA_TYPE_CAPACITY";

/// Environment variable with the initial converter table size.
pub const CONVERTER_CAPACITY_ENV: &str = "OXMETA_CONVERTER_CAPACITY";

/// Settings applied when a [`Runtime`](crate::Runtime) is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Minimum log level to install, `None` to leave the logger alone.
    pub log_level: Option<Level>,
    /// Types to reserve room for, builtins included.
    pub type_capacity: usize,
    /// Converters to reserve room for, builtins included.
    pub converter_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: None,
            type_capacity: 64,
            converter_capacity: 256,
        }
    }
}

impl Config {
    /// Defaults overridden by whatever the environment sets.
    ///
    /// Unparseable values are reported with a warning and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.log_level = env_value(oxmeta_log::LEVEL_ENV);
        if let Some(capacity) = env_value(TYPE_CAPACITY_ENV) {
            config.type_capacity = capacity;
        }
        if let Some(capacity) = env_value(CONVERTER_CAPACITY_ENV) {
            config.converter_capacity = capacity;
        }
        config
    }

    #[must_use]
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    #[must_use]
    pub fn with_type_capacity(mut self, capacity: usize) -> Self {
        self.type_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_converter_capacity(mut self, capacity: usize) -> Self {
        self.converter_capacity = capacity;
        self
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            oxmeta_log::warn!("ignoring {}={:?}", name, raw);
            None
        }
    }
}
