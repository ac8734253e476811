//! Process-level pieces of the burrow server: loading the configuration file.

mod config;

pub use self::config::{load, parse, ConfigError, LoadedConfig};
