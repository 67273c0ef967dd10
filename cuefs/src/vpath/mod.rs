//! Synthetic track filename codec.
//!
//! Synthetic tracks are named after the album file they come from:
//!
//! ```text
//! <album_name><SEP><NN>.<title>.<start>-<end>.flac
//! ```
//!
//! e.g. `a.flac.#-#.01.Intro.0-44100.flac`. The separator defaults to
//! `.#-#.` and is chosen to be a substring that never occurs in source
//! filenames; everything after it is machine-generated, so a filename can
//! be decoded back to the album it came from and the exact sample range
//! without consulting any state. Titles are sanitized before embedding so
//! the name stays a single valid path component.

use regex::Regex;
use thiserror::Error;

/// Default separator between album name and track suffix.
pub const DEFAULT_SEPARATOR: &str = ".#-#.";

/// Default maximum number of title characters embedded in a filename.
pub const DEFAULT_TITLE_LENGTH: usize = 20;

/// Default pattern identifying album files by extension.
pub const DEFAULT_EXTENSION_PATTERN: &str = r"(\.flac|\.wav)";

/// Identity of a synthetic track, as recoverable from its filename alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualTrackKey {
    /// Filename of the album file (extension included).
    pub album_name: String,
    /// 1-based track number.
    pub ordinal: u32,
    /// First sample of the track (inclusive).
    pub start: u64,
    /// End sample of the track (exclusive).
    pub end: u64,
}

/// Codec construction failure.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid extension pattern: {0}")]
    ExtensionPattern(#[source] regex::Error),

    #[error("separator must not be empty")]
    EmptySeparator,
}

/// Encoder/decoder for synthetic track filenames.
///
/// The patterns depend on runtime configuration (separator, extension
/// regex), so they are compiled once at construction rather than stored
/// in a static.
#[derive(Debug)]
pub struct PathCodec {
    separator: String,
    title_length: usize,
    track_pattern: Regex,
    album_pattern: Regex,
}

impl PathCodec {
    /// Build a codec for the given separator, title budget and album
    /// extension pattern (matched case-insensitively at the name's end).
    pub fn new(
        separator: &str,
        title_length: usize,
        extension_pattern: &str,
    ) -> Result<Self, CodecError> {
        if separator.is_empty() {
            return Err(CodecError::EmptySeparator);
        }
        let sep = regex::escape(separator);
        let track_pattern = Regex::new(&format!(
            r"^(?P<album>.+){sep}(?P<ord>\d{{2,}})\.(?P<title>.*?)\.(?P<start>\d+)-(?P<end>\d+)\.flac$"
        ))
        .expect("track pattern is valid for any escaped separator");
        let album_pattern = Regex::new(&format!("(?i:{extension_pattern})$"))
            .map_err(CodecError::ExtensionPattern)?;
        Ok(Self {
            separator: separator.to_string(),
            title_length,
            track_pattern,
            album_pattern,
        })
    }

    /// The configured separator token.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Encode a synthetic filename. Total and deterministic.
    pub fn encode(&self, album_name: &str, ordinal: u32, title: Option<&str>, start: u64, end: u64) -> String {
        let title = self.sanitize_title(title.unwrap_or(""));
        format!(
            "{album_name}{sep}{ordinal:02}.{title}.{start}-{end}.flac",
            sep = self.separator
        )
    }

    /// Decode a filename into a [`VirtualTrackKey`].
    ///
    /// Returns `None` for anything that is not a well-formed synthetic
    /// name: missing separator, bad ordinal, inverted sample range, or a
    /// different extension.
    pub fn decode(&self, name: &str) -> Option<VirtualTrackKey> {
        let caps = self.track_pattern.captures(name)?;
        let ordinal: u32 = caps["ord"].parse().ok()?;
        let start: u64 = caps["start"].parse().ok()?;
        let end: u64 = caps["end"].parse().ok()?;
        if start >= end {
            return None;
        }
        Some(VirtualTrackKey {
            album_name: caps["album"].to_string(),
            ordinal,
            start,
            end,
        })
    }

    /// Whether the filename matches the configured album extension pattern.
    pub fn is_album(&self, name: &str) -> bool {
        self.album_pattern.is_match(name)
    }

    /// Sanitize a cue title for embedding in a filename: path separators,
    /// NUL bytes and any occurrence of the separator token become `_`,
    /// runs of `_` collapse, and the result is truncated to the title
    /// budget.
    fn sanitize_title(&self, title: &str) -> String {
        let replaced = title.replace(&self.separator, "_");
        let mut out = String::with_capacity(replaced.len());
        let mut last_was_underscore = false;
        for c in replaced.chars() {
            let c = if c == '/' || c == '\0' { '_' } else { c };
            if c == '_' {
                if last_was_underscore {
                    continue;
                }
                last_was_underscore = true;
            } else {
                last_was_underscore = false;
            }
            out.push(c);
        }
        out.chars().take(self.title_length).collect()
    }
}
