//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::vpath::CodecError;

/// Invalid configuration, surfaced at startup and fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid ignore-tags pattern: {0}")]
    IgnoreTags(#[source] regex::Error),

    #[error("invalid filename configuration: {0}")]
    Codec(#[from] CodecError),

    #[error("source root {} is not a directory", .0.display())]
    SourceRoot(PathBuf),
}
