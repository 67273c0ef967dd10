//! Cue-sheet parsing.
//!
//! Cue sheets are line-oriented and tiny, so this is a hand-written
//! line parser rather than a grammar framework. Only the commands that
//! matter for track extraction are interpreted; everything else
//! (`REM`, `CATALOG`, `FLAGS`, `PREGAP`, ...) is skipped.
//!
//! Commands recognized:
//!
//! - `FILE <name> <type>` - recorded but not used for boundaries
//! - `TRACK <n> <type>` - only `AUDIO` tracks survive into the result
//! - `INDEX <i> mm:ss:ff` - index 1 marks the track start; index 0, when
//!   present, must precede it
//! - `TITLE`, `PERFORMER`, `SONGWRITER` - album-level before the first
//!   `TRACK`, per-track inside a track block
//! - `ISRC` - per-track
//!
//! `PERFORMER` and `SONGWRITER` values frequently pack several artists
//! into one entry separated by `;`; they are split and trimmed here.

use thiserror::Error;

/// A position expressed in CD frames (75 frames per second).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameTime {
    frames: u64,
}

impl FrameTime {
    /// Build from a `mm:ss:ff` triple.
    pub fn from_msf(mm: u64, ss: u64, ff: u64) -> Self {
        Self {
            frames: (mm * 60 + ss) * 75 + ff,
        }
    }

    /// Total CD frames since the start of the file.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Convert to a sample count at the given rate, rounded to nearest.
    pub fn to_samples(&self, sample_rate: u32) -> u64 {
        (self.frames * sample_rate as u64 * 2 + 75) / 150
    }
}

/// One audio track extracted from a cue sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CueTrack {
    /// 1-based track number as declared in the sheet.
    pub ordinal: u32,
    pub title: Option<String>,
    pub performers: Vec<String>,
    pub songwriters: Vec<String>,
    pub isrc: Option<String>,
    /// Optional pregap index; never used for boundaries.
    pub index0: Option<FrameTime>,
    /// The track start. Mandatory for every track.
    pub index1: FrameTime,
}

/// A parsed cue sheet: album-level metadata plus the ordered audio tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CueSheet {
    pub album_title: Option<String>,
    pub album_performers: Vec<String>,
    pub album_songwriters: Vec<String>,
    pub tracks: Vec<CueTrack>,
}

/// Cue grammar failure, carrying the 1-based source line.
#[derive(Debug, Error)]
pub enum CueParseError {
    #[error("line {line}: malformed time code '{value}'")]
    BadTimeCode { line: usize, value: String },

    #[error("line {line}: malformed TRACK command")]
    BadTrack { line: usize },

    #[error("line {line}: malformed INDEX command")]
    BadIndex { line: usize },

    #[error("line {line}: {command} outside of a TRACK block")]
    OutsideTrack { line: usize, command: &'static str },

    #[error("track {ordinal} (line {line}) has no INDEX 01")]
    MissingIndex1 { line: usize, ordinal: u32 },

    #[error("track {ordinal} (line {line}): INDEX 00 does not precede INDEX 01")]
    IndexOrder { line: usize, ordinal: u32 },

    #[error("line {line}: track number {ordinal} is not increasing")]
    OrdinalOrder { line: usize, ordinal: u32 },

    #[error("cue sheet declares no audio tracks")]
    NoTracks,
}

/// Partially assembled track while its block is being read.
struct PendingTrack {
    line: usize,
    ordinal: u32,
    audio: bool,
    title: Option<String>,
    performers: Vec<String>,
    songwriters: Vec<String>,
    isrc: Option<String>,
    index0: Option<FrameTime>,
    index1: Option<FrameTime>,
}

impl PendingTrack {
    fn finish(self) -> Result<Option<CueTrack>, CueParseError> {
        if !self.audio {
            return Ok(None);
        }
        let index1 = self.index1.ok_or(CueParseError::MissingIndex1 {
            line: self.line,
            ordinal: self.ordinal,
        })?;
        if let Some(index0) = self.index0 {
            if index0 > index1 {
                return Err(CueParseError::IndexOrder {
                    line: self.line,
                    ordinal: self.ordinal,
                });
            }
        }
        Ok(Some(CueTrack {
            ordinal: self.ordinal,
            title: self.title,
            performers: self.performers,
            songwriters: self.songwriters,
            isrc: self.isrc,
            index0: self.index0,
            index1,
        }))
    }
}

/// Parse a complete cue sheet.
pub fn parse(text: &str) -> Result<CueSheet, CueParseError> {
    let mut sheet = CueSheet {
        album_title: None,
        album_performers: Vec::new(),
        album_songwriters: Vec::new(),
        tracks: Vec::new(),
    };
    let mut current: Option<PendingTrack> = None;
    let mut last_ordinal: Option<u32> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = split_command(line);
        match command.to_ascii_uppercase().as_str() {
            "TRACK" => {
                if let Some(pending) = current.take() {
                    if let Some(track) = pending.finish()? {
                        sheet.tracks.push(track);
                    }
                }
                let mut parts = rest.split_whitespace();
                let ordinal: u32 = parts
                    .next()
                    .and_then(|n| n.parse().ok())
                    .ok_or(CueParseError::BadTrack { line: line_no })?;
                let kind = parts
                    .next()
                    .ok_or(CueParseError::BadTrack { line: line_no })?;
                if last_ordinal.is_some_and(|prev| ordinal <= prev) {
                    return Err(CueParseError::OrdinalOrder {
                        line: line_no,
                        ordinal,
                    });
                }
                last_ordinal = Some(ordinal);
                current = Some(PendingTrack {
                    line: line_no,
                    ordinal,
                    audio: kind.eq_ignore_ascii_case("AUDIO"),
                    title: None,
                    performers: Vec::new(),
                    songwriters: Vec::new(),
                    isrc: None,
                    index0: None,
                    index1: None,
                });
            }
            "INDEX" => {
                let track = current.as_mut().ok_or(CueParseError::OutsideTrack {
                    line: line_no,
                    command: "INDEX",
                })?;
                let mut parts = rest.split_whitespace();
                let number: u8 = parts
                    .next()
                    .and_then(|n| n.parse().ok())
                    .ok_or(CueParseError::BadIndex { line: line_no })?;
                let time_str = parts
                    .next()
                    .ok_or(CueParseError::BadIndex { line: line_no })?;
                let time = parse_msf(time_str).ok_or_else(|| CueParseError::BadTimeCode {
                    line: line_no,
                    value: time_str.to_string(),
                })?;
                match number {
                    0 => track.index0 = Some(time),
                    1 => track.index1 = Some(time),
                    // higher indexes exist on some rips; irrelevant here
                    _ => {}
                }
            }
            "TITLE" => {
                let value = unquote(rest).to_string();
                match current.as_mut() {
                    Some(track) => track.title = Some(value),
                    None => sheet.album_title = Some(value),
                }
            }
            "PERFORMER" => {
                let values = split_multi(unquote(rest));
                match current.as_mut() {
                    Some(track) => track.performers.extend(values),
                    None => sheet.album_performers.extend(values),
                }
            }
            "SONGWRITER" => {
                let values = split_multi(unquote(rest));
                match current.as_mut() {
                    Some(track) => track.songwriters.extend(values),
                    None => sheet.album_songwriters.extend(values),
                }
            }
            "ISRC" => {
                let track = current.as_mut().ok_or(CueParseError::OutsideTrack {
                    line: line_no,
                    command: "ISRC",
                })?;
                track.isrc = Some(unquote(rest).to_string());
            }
            // FILE is recorded only in the sense that it is valid syntax;
            // boundaries always come from the containing album file.
            "FILE" | "REM" | "CATALOG" | "FLAGS" | "PREGAP" | "POSTGAP" => {}
            // unknown commands are skipped
            _ => {}
        }
    }

    if let Some(pending) = current.take() {
        if let Some(track) = pending.finish()? {
            sheet.tracks.push(track);
        }
    }

    if sheet.tracks.is_empty() {
        return Err(CueParseError::NoTracks);
    }
    Ok(sheet)
}

/// Split a line into its command word and the remainder.
fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    }
}

/// Strip surrounding double quotes if present.
fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Split a multi-artist entry on `;`, trimming whitespace and dropping
/// empty fragments.
fn split_multi(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `mm:ss:ff`. Each element must be numeric; `ss` and `ff` must be
/// in range for their unit.
fn parse_msf(value: &str) -> Option<FrameTime> {
    let mut parts = value.split(':');
    let mm: u64 = parts.next()?.parse().ok()?;
    let ss: u64 = parts.next()?.parse().ok()?;
    let ff: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || ss >= 60 || ff >= 75 {
        return None;
    }
    Some(FrameTime::from_msf(mm, ss, ff))
}
