//! Filesystem configuration.
//!
//! `Config` is the single configuration surface the CLI hands to the
//! library. Regex-valued options are validated here so bad patterns are
//! rejected at startup rather than mid-listing.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::app::ConfigError;
use crate::cache::{CacheConfig, DEFAULT_FAILURE_TTL, DEFAULT_MAX_BYTES};
use crate::materialize::ToolSpec;
use crate::vpath::{
    PathCodec, DEFAULT_EXTENSION_PATTERN, DEFAULT_SEPARATOR, DEFAULT_TITLE_LENGTH,
};

/// Default pattern of tag keys dropped during synthesis.
pub const DEFAULT_IGNORE_TAGS: &str = "CUE_TRACK.*|COMMENT";

/// Default wall-clock limit for one materialization pipeline.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of memoized album probes.
pub const DEFAULT_PROBE_CAPACITY: u64 = 64;

/// Complete configuration of a cuefs mount.
#[derive(Debug, Clone)]
pub struct Config {
    /// Physical directory tree to project.
    pub source_root: PathBuf,
    /// Separator token in synthetic filenames.
    pub separator: String,
    /// Maximum title characters embedded in synthetic filenames.
    pub title_length: usize,
    /// Pattern identifying album files by extension.
    pub extension_pattern: String,
    /// Pattern of tag keys dropped during synthesis (whole-key match).
    pub ignore_tags: String,
    /// Expose split albums alongside their synthetic tracks.
    pub keep_album: bool,
    /// Artifact cache byte budget.
    pub cache_bytes: u64,
    /// Maximum concurrent materializations.
    pub max_builds: usize,
    /// Wall-clock limit per materialization.
    pub tool_timeout: Duration,
    /// The flac binary used as decoder and encoder.
    pub flac_bin: PathBuf,
    /// Number of memoized album probes.
    pub probe_capacity: u64,
    /// How long failed materializations are remembered.
    pub failure_ttl: Duration,
}

impl Config {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            separator: DEFAULT_SEPARATOR.to_string(),
            title_length: DEFAULT_TITLE_LENGTH,
            extension_pattern: DEFAULT_EXTENSION_PATTERN.to_string(),
            ignore_tags: DEFAULT_IGNORE_TAGS.to_string(),
            keep_album: false,
            cache_bytes: DEFAULT_MAX_BYTES,
            max_builds: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            flac_bin: PathBuf::from("flac"),
            probe_capacity: DEFAULT_PROBE_CAPACITY,
            failure_ttl: DEFAULT_FAILURE_TTL,
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_title_length(mut self, title_length: usize) -> Self {
        self.title_length = title_length;
        self
    }

    pub fn with_extension_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.extension_pattern = pattern.into();
        self
    }

    pub fn with_ignore_tags(mut self, pattern: impl Into<String>) -> Self {
        self.ignore_tags = pattern.into();
        self
    }

    pub fn with_keep_album(mut self, keep_album: bool) -> Self {
        self.keep_album = keep_album;
        self
    }

    pub fn with_cache_bytes(mut self, cache_bytes: u64) -> Self {
        self.cache_bytes = cache_bytes;
        self
    }

    pub fn with_max_builds(mut self, max_builds: usize) -> Self {
        self.max_builds = max_builds;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_flac_bin(mut self, flac_bin: impl Into<PathBuf>) -> Self {
        self.flac_bin = flac_bin.into();
        self
    }

    /// Compile the ignore-tags pattern, anchored to match whole keys.
    pub fn ignore_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&format!("^(?:{})$", self.ignore_tags)).map_err(ConfigError::IgnoreTags)
    }

    /// Build the filename codec from the pattern options.
    pub fn codec(&self) -> Result<PathCodec, ConfigError> {
        Ok(PathCodec::new(
            &self.separator,
            self.title_length,
            &self.extension_pattern,
        )?)
    }

    /// Cache policy derived from this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_bytes: self.cache_bytes,
            max_builds: self.max_builds,
            failure_ttl: self.failure_ttl,
        }
    }

    /// External tool invocation parameters.
    pub fn tool_spec(&self) -> ToolSpec {
        ToolSpec::new(self.flac_bin.clone(), self.tool_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("/music");
        assert_eq!(config.separator, ".#-#.");
        assert_eq!(config.title_length, 20);
        assert_eq!(config.ignore_tags, "CUE_TRACK.*|COMMENT");
        assert!(!config.keep_album);
        assert!(config.max_builds >= 1);
    }

    #[test]
    fn test_builders() {
        let config = Config::new("/music")
            .with_separator("=@=")
            .with_title_length(8)
            .with_keep_album(true)
            .with_cache_bytes(1024)
            .with_max_builds(2);
        assert_eq!(config.separator, "=@=");
        assert_eq!(config.title_length, 8);
        assert!(config.keep_album);
        assert_eq!(config.cache_config().max_bytes, 1024);
        assert_eq!(config.cache_config().max_builds, 2);
    }

    #[test]
    fn test_ignore_regex_is_anchored() {
        let re = Config::new("/music").ignore_regex().unwrap();
        assert!(re.is_match("COMMENT"));
        assert!(re.is_match("CUE_TRACK01_TITLE"));
        assert!(!re.is_match("COMMENTARY"));
    }

    #[test]
    fn test_bad_ignore_pattern_rejected() {
        let config = Config::new("/music").with_ignore_tags("(unclosed");
        assert!(matches!(
            config.ignore_regex(),
            Err(ConfigError::IgnoreTags(_))
        ));
    }

    #[test]
    fn test_codec_uses_configured_patterns() {
        let config = Config::new("/music").with_extension_pattern(r"\.flac");
        let codec = config.codec().unwrap();
        assert!(codec.is_album("a.flac"));
        assert!(!codec.is_album("b.wav"));
    }
}
