//! Application-level configuration and errors.

mod config;
mod error;

pub use config::{
    Config, DEFAULT_IGNORE_TAGS, DEFAULT_PROBE_CAPACITY, DEFAULT_TOOL_TIMEOUT,
};
pub use error::ConfigError;
