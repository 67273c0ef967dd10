//! Album probing: headers, tags, cue discovery and track spans.
//!
//! A probe turns a physical album file into an [`AlbumInfo`]: technical
//! parameters from the FLAC STREAMINFO or WAVE fmt chunk, the inherited
//! tag map, optional cover art, and - when a cue source exists - the
//! resolved list of track sample spans.
//!
//! Cue sources are tried in order: an embedded `CUESHEET` vorbis comment,
//! then a side-car `<basename>.cue` file. Exactly one is used.
//!
//! Probes are memoized per physical path in a `moka` cache and
//! revalidated against the file's `(mtime, size)`. Concurrent probes of
//! the same path coalesce into a single build.

pub mod flac;
pub mod wave;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use moka::future::Cache;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cue::{self, CueParseError, CueSheet, CueTrack};
use crate::tags::TagMap;
use crate::vpath::VirtualTrackKey;

use wave::WaveStream;

/// Audio container of an album file, detected from its magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Flac,
    Wave,
}

/// Probe failure. Recorded per physical path; the directory view falls
/// back to exposing the album unchanged.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a FLAC or WAVE file")]
    UnsupportedFormat,

    #[error("malformed album file: {0}")]
    Malformed(String),

    #[error("cue sheet error: {0}")]
    Cue(#[from] CueParseError),
}

/// A cue track with its boundaries resolved to album samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpan {
    pub cue: CueTrack,
    /// First sample (inclusive).
    pub start_sample: u64,
    /// End sample (exclusive). For the last track this is always the
    /// album's total sample count, whatever the cue claims.
    pub end_sample: u64,
}

impl TrackSpan {
    pub fn ordinal(&self) -> u32 {
        self.cue.ordinal
    }

    pub fn title(&self) -> Option<&str> {
        self.cue.title.as_deref()
    }
}

/// The resolved track list of a split album, plus album-level cue metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackList {
    pub album_title: Option<String>,
    pub album_performers: Vec<String>,
    pub album_songwriters: Vec<String>,
    pub spans: Vec<TrackSpan>,
}

/// Everything known about a probed album file. Immutable once built.
#[derive(Debug)]
pub struct AlbumInfo {
    pub path: PathBuf,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub total_samples: u64,
    /// Inherited tags; multi-line values are already dropped here.
    pub tags: TagMap,
    /// Cover art bytes, copied verbatim from the first source found.
    pub cover: Option<Vec<u8>>,
    /// `None` when the album has no usable cue source: it is exposed
    /// unsplit.
    pub tracks: Option<TrackList>,
    /// Data-chunk location, present for WAVE albums only.
    pub wave: Option<WaveStream>,
}

impl AlbumInfo {
    /// Filename of the album file.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .map(|n| n.to_str().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Size of the raw PCM for a span, used as the provisional `getattr`
    /// size before the artifact exists.
    pub fn raw_pcm_len(&self, span: &TrackSpan) -> u64 {
        (span.end_sample - span.start_sample)
            * self.channels as u64
            * (self.bits_per_sample as u64 / 8)
    }

    /// Find the span matching a decoded filename key. The ordinal and the
    /// exact sample range must all agree.
    pub fn span_for_key(&self, key: &VirtualTrackKey) -> Option<&TrackSpan> {
        self.tracks.as_ref()?.spans.iter().find(|span| {
            span.ordinal() == key.ordinal
                && span.start_sample == key.start
                && span.end_sample == key.end
        })
    }
}

type Fingerprint = (SystemTime, u64);

#[derive(Clone)]
struct ProbeEntry {
    fingerprint: Fingerprint,
    result: Result<Arc<AlbumInfo>, Arc<ProbeError>>,
}

/// Memoizing probe cache keyed by physical path.
pub struct ProbeCache {
    cache: Cache<PathBuf, ProbeEntry>,
}

impl ProbeCache {
    /// Create a cache holding up to `capacity` probed albums.
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Probe an album file, reusing the cached result while the file's
    /// `(mtime, size)` is unchanged. Failures are cached too, so an
    /// unreadable album does not get re-parsed on every listing.
    pub async fn probe(&self, path: &Path) -> Result<Arc<AlbumInfo>, Arc<ProbeError>> {
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| Arc::new(ProbeError::Io(e)))?;
        let modified = meta
            .modified()
            .map_err(|e| Arc::new(ProbeError::Io(e)))?;
        let fingerprint = (modified, meta.len());

        if let Some(entry) = self.cache.get(path).await {
            if entry.fingerprint == fingerprint {
                return entry.result;
            }
            debug!(path = %path.display(), "album file changed, re-probing");
            self.cache.invalidate(path).await;
        }

        let build_path = path.to_path_buf();
        let entry = self
            .cache
            .get_with(path.to_path_buf(), async move {
                let result = tokio::task::spawn_blocking(move || build_album(&build_path))
                    .await
                    .unwrap_or_else(|e| {
                        Err(ProbeError::Malformed(format!("probe task panicked: {e}")))
                    });
                if let Err(ref e) = result {
                    warn!(error = %e, "album probe failed");
                }
                ProbeEntry {
                    fingerprint,
                    result: result.map(Arc::new).map_err(Arc::new),
                }
            })
            .await;
        entry.result
    }
}

/// Probe a single album file. Blocking.
fn build_album(path: &Path) -> Result<AlbumInfo, ProbeError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    match &magic {
        b"fLaC" => build_flac(path, file),
        b"RIFF" => build_wave(path, file),
        _ => Err(ProbeError::UnsupportedFormat),
    }
}

fn build_flac(path: &Path, mut file: File) -> Result<AlbumInfo, ProbeError> {
    let stream = flac::read_metadata(&mut file)?;

    // Embedded cue sheet takes precedence over a side-car file.
    let embedded_cue = stream
        .comments
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("CUESHEET"))
        .map(|(_, value)| value.clone());
    let cue_text = match embedded_cue {
        Some(text) => Some(text),
        None => sidecar_cue(path)?,
    };

    // Multi-line values (the embedded cue sheet among them) never make it
    // into the inherited tag map.
    let mut tags = TagMap::new();
    for (key, value) in &stream.comments {
        if value.lines().count() > 1 {
            continue;
        }
        tags.append(key, value.clone());
    }

    let tracks = cue_text
        .map(|text| {
            let sheet = cue::parse(&text)?;
            resolve_spans(sheet, stream.sample_rate, stream.total_samples)
        })
        .transpose()?;

    let cover = stream.picture.or_else(|| sidecar_cover(path));

    Ok(AlbumInfo {
        path: path.to_path_buf(),
        format: AudioFormat::Flac,
        sample_rate: stream.sample_rate,
        channels: stream.channels,
        bits_per_sample: stream.bits_per_sample,
        total_samples: stream.total_samples,
        tags,
        cover,
        tracks,
        wave: None,
    })
}

fn build_wave(path: &Path, mut file: File) -> Result<AlbumInfo, ProbeError> {
    let stream = wave::read_metadata(&mut file)?;

    // WAVE carries no intrinsic tags; only a side-car cue can split it.
    let tracks = sidecar_cue(path)?
        .map(|text| {
            let sheet = cue::parse(&text)?;
            resolve_spans(sheet, stream.sample_rate, stream.total_samples)
        })
        .transpose()?;

    Ok(AlbumInfo {
        path: path.to_path_buf(),
        format: AudioFormat::Wave,
        sample_rate: stream.sample_rate,
        channels: stream.channels,
        bits_per_sample: stream.bits_per_sample,
        total_samples: stream.total_samples,
        tags: TagMap::new(),
        cover: sidecar_cover(path),
        tracks,
        wave: Some(stream),
    })
}

/// Turn parsed cue tracks into sample spans against the album length.
fn resolve_spans(sheet: CueSheet, sample_rate: u32, total_samples: u64) -> Result<TrackList, ProbeError> {
    let starts: Vec<u64> = sheet
        .tracks
        .iter()
        .map(|t| t.index1.to_samples(sample_rate))
        .collect();

    let mut spans = Vec::with_capacity(sheet.tracks.len());
    let count = sheet.tracks.len();
    for (i, track) in sheet.tracks.into_iter().enumerate() {
        let start_sample = starts[i];
        let end_sample = if i + 1 < count {
            starts[i + 1]
        } else {
            total_samples
        };
        if start_sample >= end_sample || end_sample > total_samples {
            return Err(ProbeError::Malformed(format!(
                "track {} spans [{start_sample}, {end_sample}) outside an album of {total_samples} samples",
                track.ordinal
            )));
        }
        spans.push(TrackSpan {
            cue: track,
            start_sample,
            end_sample,
        });
    }

    Ok(TrackList {
        album_title: sheet.album_title,
        album_performers: sheet.album_performers,
        album_songwriters: sheet.album_songwriters,
        spans,
    })
}

/// Read `<basename>.cue` next to the album, if it exists. The bytes are
/// decoded lossily; rippers produce a mix of encodings and the commands
/// themselves are plain ASCII.
fn sidecar_cue(path: &Path) -> Result<Option<String>, ProbeError> {
    let cue_path = path.with_extension("cue");
    match std::fs::read(&cue_path) {
        Ok(bytes) => {
            debug!(path = %cue_path.display(), "found side-car cue sheet");
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Cover art from files next to the album: `<basename>.jpg`, then
/// `folder.jpg`. Unreadable images are treated as absent.
fn sidecar_cover(path: &Path) -> Option<Vec<u8>> {
    let mut candidates = vec![path.with_extension("jpg")];
    if let Some(dir) = path.parent() {
        candidates.push(dir.join("folder.jpg"));
    }
    for candidate in candidates {
        match std::fs::read(&candidate) {
            Ok(bytes) => return Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(path = %candidate.display(), error = %e, "failed to read cover art");
                continue;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::flac::test_support::flac_bytes;
    use super::wave::test_support::wave_bytes;
    use super::*;
    use tempfile::TempDir;

    const TWO_TRACK_CUE: &str =
        "TRACK 01 AUDIO\nTITLE Intro\nINDEX 01 00:00:00\nTRACK 02 AUDIO\nTITLE Outro\nINDEX 01 00:01:00\n";

    fn write_flac_album(
        dir: &TempDir,
        name: &str,
        comments: &[(&str, &str)],
        picture: Option<&[u8]>,
    ) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, flac_bytes(44100, 2, 16, 88200, comments, picture)).unwrap();
        path
    }

    // ========================================================================
    // Format detection and headers
    // ========================================================================

    #[tokio::test]
    async fn test_probe_flac_headers() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(&dir, "a.flac", &[], None);

        let info = ProbeCache::new(16).probe(&path).await.unwrap();
        assert_eq!(info.format, AudioFormat::Flac);
        assert_eq!(info.sample_rate, 44100);
        assert_eq!(info.channels, 2);
        assert_eq!(info.bits_per_sample, 16);
        assert_eq!(info.total_samples, 88200);
        assert!(info.tracks.is_none());
    }

    #[tokio::test]
    async fn test_probe_rejects_unknown_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.flac");
        std::fs::write(&path, b"MP3\0data").unwrap();

        let err = ProbeCache::new(16).probe(&path).await.unwrap_err();
        assert!(matches!(*err, ProbeError::UnsupportedFormat));
    }

    // ========================================================================
    // Cue discovery
    // ========================================================================

    #[tokio::test]
    async fn test_embedded_cue_splits_album() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(&dir, "a.flac", &[("CUESHEET", TWO_TRACK_CUE)], None);

        let info = ProbeCache::new(16).probe(&path).await.unwrap();
        let tracks = info.tracks.as_ref().unwrap();
        assert_eq!(tracks.spans.len(), 2);
        assert_eq!(tracks.spans[0].start_sample, 0);
        assert_eq!(tracks.spans[0].end_sample, 44100);
        assert_eq!(tracks.spans[1].start_sample, 44100);
        // the last track always ends at the album's total length
        assert_eq!(tracks.spans[1].end_sample, 88200);
    }

    #[tokio::test]
    async fn test_embedded_cue_takes_precedence_over_sidecar() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(&dir, "a.flac", &[("CUESHEET", TWO_TRACK_CUE)], None);
        std::fs::write(
            dir.path().join("a.cue"),
            "TRACK 01 AUDIO\nTITLE Sidecar\nINDEX 01 00:00:00\n",
        )
        .unwrap();

        let info = ProbeCache::new(16).probe(&path).await.unwrap();
        let tracks = info.tracks.as_ref().unwrap();
        assert_eq!(tracks.spans.len(), 2);
        assert_eq!(tracks.spans[0].title(), Some("Intro"));
    }

    #[tokio::test]
    async fn test_sidecar_cue_on_wave() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.wav");
        std::fs::write(&path, wave_bytes(44100, 2, 16, &[0u8; 400])).unwrap();
        std::fs::write(
            dir.path().join("b.cue"),
            "TRACK 01 AUDIO\nTITLE Only\nINDEX 01 00:00:00\n",
        )
        .unwrap();

        let info = ProbeCache::new(16).probe(&path).await.unwrap();
        assert_eq!(info.format, AudioFormat::Wave);
        let tracks = info.tracks.as_ref().unwrap();
        assert_eq!(tracks.spans.len(), 1);
        assert_eq!(tracks.spans[0].title(), Some("Only"));
        assert_eq!(tracks.spans[0].end_sample, info.total_samples);
        assert!(info.wave.is_some());
    }

    #[tokio::test]
    async fn test_malformed_cue_is_a_probe_error() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(
            &dir,
            "a.flac",
            &[("CUESHEET", "TRACK 01 AUDIO\nINDEX 01 xx:00:00\n")],
            None,
        );

        let err = ProbeCache::new(16).probe(&path).await.unwrap_err();
        assert!(matches!(*err, ProbeError::Cue(_)));
    }

    #[tokio::test]
    async fn test_cue_beyond_album_length_rejected() {
        let dir = TempDir::new().unwrap();
        // Album is 2 s long; the second track starts at 10 s.
        let cue = "TRACK 01 AUDIO\nINDEX 01 00:00:00\nTRACK 02 AUDIO\nINDEX 01 00:10:00\n";
        let path = write_flac_album(&dir, "a.flac", &[("CUESHEET", cue)], None);

        let err = ProbeCache::new(16).probe(&path).await.unwrap_err();
        assert!(matches!(*err, ProbeError::Malformed(_)));
    }

    // ========================================================================
    // Tags
    // ========================================================================

    #[tokio::test]
    async fn test_inherited_tags_drop_multiline_values() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(
            &dir,
            "a.flac",
            &[
                ("ARTIST", "Alice"),
                ("CUESHEET", TWO_TRACK_CUE),
                ("COMMENT", "single line"),
            ],
            None,
        );

        let info = ProbeCache::new(16).probe(&path).await.unwrap();
        assert_eq!(info.tags.first("ARTIST"), Some("Alice"));
        assert_eq!(info.tags.first("COMMENT"), Some("single line"));
        // the embedded cue sheet is multi-line and never inherited
        assert!(!info.tags.contains("CUESHEET"));
    }

    // ========================================================================
    // Cover art
    // ========================================================================

    #[tokio::test]
    async fn test_embedded_picture_preferred() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(&dir, "a.flac", &[], Some(&[1, 2, 3]));
        std::fs::write(dir.path().join("a.jpg"), [9, 9, 9]).unwrap();

        let info = ProbeCache::new(16).probe(&path).await.unwrap();
        assert_eq!(info.cover.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[tokio::test]
    async fn test_basename_jpg_before_folder_jpg() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(&dir, "a.flac", &[], None);
        std::fs::write(dir.path().join("a.jpg"), [4u8]).unwrap();
        std::fs::write(dir.path().join("folder.jpg"), [5u8]).unwrap();

        let info = ProbeCache::new(16).probe(&path).await.unwrap();
        assert_eq!(info.cover.as_deref(), Some(&[4u8][..]));
    }

    #[tokio::test]
    async fn test_folder_jpg_fallback() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(&dir, "a.flac", &[], None);
        std::fs::write(dir.path().join("folder.jpg"), [5u8]).unwrap();

        let info = ProbeCache::new(16).probe(&path).await.unwrap();
        assert_eq!(info.cover.as_deref(), Some(&[5u8][..]));
    }

    // ========================================================================
    // Memoization
    // ========================================================================

    #[tokio::test]
    async fn test_probe_is_memoized_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(&dir, "a.flac", &[("CUESHEET", TWO_TRACK_CUE)], None);

        let cache = ProbeCache::new(16);
        let first = cache.probe(&path).await.unwrap();
        let second = cache.probe(&path).await.unwrap();

        // same Arc while the file is unchanged
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.tracks, second.tracks);
    }

    #[tokio::test]
    async fn test_probe_revalidates_on_file_change() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(&dir, "a.flac", &[("CUESHEET", TWO_TRACK_CUE)], None);

        let cache = ProbeCache::new(16);
        let first = cache.probe(&path).await.unwrap();
        assert_eq!(first.tracks.as_ref().unwrap().spans.len(), 2);

        // Rewrite with a different size so the fingerprint changes even on
        // coarse mtime granularity.
        std::fs::write(
            &path,
            flac_bytes(
                44100,
                2,
                16,
                88200,
                &[
                    ("CUESHEET", "TRACK 01 AUDIO\nINDEX 01 00:00:00\n"),
                    ("PADDING", "x"),
                ],
                None,
            ),
        )
        .unwrap();

        let second = cache.probe(&path).await.unwrap();
        assert_eq!(second.tracks.as_ref().unwrap().spans.len(), 1);
    }

    // ========================================================================
    // Key matching
    // ========================================================================

    #[tokio::test]
    async fn test_span_for_key_requires_exact_range() {
        let dir = TempDir::new().unwrap();
        let path = write_flac_album(&dir, "a.flac", &[("CUESHEET", TWO_TRACK_CUE)], None);
        let info = ProbeCache::new(16).probe(&path).await.unwrap();

        let key = VirtualTrackKey {
            album_name: "a.flac".into(),
            ordinal: 1,
            start: 0,
            end: 44100,
        };
        assert!(info.span_for_key(&key).is_some());

        let stale = VirtualTrackKey {
            end: 44101,
            ..key.clone()
        };
        assert!(info.span_for_key(&stale).is_none());
    }

    #[test]
    fn test_raw_pcm_len_estimate() {
        let span = TrackSpan {
            cue: crate::cue::parse("TRACK 01 AUDIO\nINDEX 01 00:00:00\n")
                .unwrap()
                .tracks
                .remove(0),
            start_sample: 0,
            end_sample: 44100,
        };
        let info = AlbumInfo {
            path: PathBuf::from("a.flac"),
            format: AudioFormat::Flac,
            sample_rate: 44100,
            channels: 2,
            bits_per_sample: 16,
            total_samples: 44100,
            tags: TagMap::new(),
            cover: None,
            tracks: None,
            wave: None,
        };
        assert_eq!(info.raw_pcm_len(&span), 44100 * 2 * 2);
    }
}
