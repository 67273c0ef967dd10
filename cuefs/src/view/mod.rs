//! Virtual directory view.
//!
//! Maps the physical source tree onto the virtual one: directory listings
//! replace each split album file with its synthetic track names (or add
//! them alongside it with keep-album), and virtual paths resolve back to
//! either a physical file or an `(album, track span)` pair.
//!
//! An album whose probe fails, or that has no cue source, is exposed
//! unchanged; a probe failure never breaks the listing.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::probe::{AlbumInfo, ProbeCache, TrackSpan};
use crate::vpath::PathCodec;

/// Kind of a virtual directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// One entry of a virtual directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

/// What a virtual path names.
pub enum Resolved {
    /// A physical file or directory, served as-is.
    Passthrough(PathBuf),
    /// A synthetic track of a probed album.
    Track {
        album: Arc<AlbumInfo>,
        span: TrackSpan,
    },
}

/// Resolution failure.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("no such virtual path")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The virtual tree over one source root.
pub struct DirectoryView {
    root: PathBuf,
    codec: PathCodec,
    probes: ProbeCache,
    keep_album: bool,
}

impl DirectoryView {
    pub fn new(root: PathBuf, codec: PathCodec, probes: ProbeCache, keep_album: bool) -> Self {
        Self {
            root,
            codec,
            probes,
            keep_album,
        }
    }

    /// The physical source root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn codec(&self) -> &PathCodec {
        &self.codec
    }

    /// Physical path behind a virtual (root-relative) path.
    pub fn physical(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    /// List a virtual directory given its root-relative path.
    pub async fn read_dir(&self, rel: &Path) -> std::io::Result<Vec<VirtualEntry>> {
        let dir = self.physical(rel);
        let mut reader = tokio::fs::read_dir(&dir).await?;
        let mut entries = Vec::new();

        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name();
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else {
                EntryKind::File
            };

            let album_name = match name.to_str() {
                Some(text) if kind == EntryKind::File && self.codec.is_album(text) => text,
                _ => {
                    entries.push(VirtualEntry { name, kind });
                    continue;
                }
            };

            match self.probes.probe(&entry.path()).await {
                Ok(info) if info.tracks.is_some() => {
                    if self.keep_album {
                        entries.push(VirtualEntry {
                            name: name.clone(),
                            kind,
                        });
                    }
                    let spans = &info.tracks.as_ref().expect("tracks checked above").spans;
                    for span in spans {
                        let synth = self.codec.encode(
                            album_name,
                            span.ordinal(),
                            span.title(),
                            span.start_sample,
                            span.end_sample,
                        );
                        entries.push(VirtualEntry {
                            name: synth.into(),
                            kind: EntryKind::File,
                        });
                    }
                }
                // no cue, or the probe failed: expose the album unchanged
                Ok(_) => entries.push(VirtualEntry { name, kind }),
                Err(e) => {
                    debug!(album = %entry.path().display(), error = %e, "probe failed, passing album through");
                    entries.push(VirtualEntry { name, kind });
                }
            }
        }
        Ok(entries)
    }

    /// Resolve a root-relative virtual path.
    ///
    /// Synthetic names are recognized first; the separator token cannot
    /// occur in source filenames, so a decodable name is never a real
    /// file.
    pub async fn resolve(&self, rel: &Path) -> Result<Resolved, ViewError> {
        let synth_key = rel
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| self.codec.decode(n));

        if let Some(key) = synth_key {
            let parent = rel.parent().unwrap_or_else(|| Path::new(""));
            let album_path = self.root.join(parent).join(&key.album_name);
            let album = match self.probes.probe(&album_path).await {
                Ok(info) => info,
                Err(_) => return Err(ViewError::NotFound),
            };
            let span = album.span_for_key(&key).ok_or(ViewError::NotFound)?.clone();
            return Ok(Resolved::Track { album, span });
        }

        let physical = self.physical(rel);
        match tokio::fs::symlink_metadata(&physical).await {
            Ok(_) => Ok(Resolved::Passthrough(physical)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ViewError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::flac::test_support::flac_bytes;
    use crate::probe::wave::test_support::wave_bytes;
    use crate::vpath::{DEFAULT_EXTENSION_PATTERN, DEFAULT_SEPARATOR, DEFAULT_TITLE_LENGTH};
    use tempfile::TempDir;

    const TWO_TRACK_CUE: &str =
        "TRACK 01 AUDIO\nTITLE Intro\nINDEX 01 00:00:00\nTRACK 02 AUDIO\nTITLE Outro\nINDEX 01 00:01:00\n";

    fn view(root: &TempDir, keep_album: bool) -> DirectoryView {
        DirectoryView::new(
            root.path().to_path_buf(),
            PathCodec::new(DEFAULT_SEPARATOR, DEFAULT_TITLE_LENGTH, DEFAULT_EXTENSION_PATTERN)
                .unwrap(),
            ProbeCache::new(16),
            keep_album,
        )
    }

    fn names(entries: &[VirtualEntry]) -> Vec<String> {
        let mut names: Vec<String> = entries
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    async fn read_root(view: &DirectoryView) -> Vec<VirtualEntry> {
        view.read_dir(Path::new("")).await.unwrap()
    }

    // ========================================================================
    // Listings
    // ========================================================================

    #[tokio::test]
    async fn test_split_album_lists_synthetic_tracks() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.flac"),
            flac_bytes(44100, 2, 16, 88200, &[("CUESHEET", TWO_TRACK_CUE)], None),
        )
        .unwrap();

        let entries = read_root(&view(&dir, false)).await;
        assert_eq!(
            names(&entries),
            vec![
                "a.flac.#-#.01.Intro.0-44100.flac",
                "a.flac.#-#.02.Outro.44100-88200.flac",
            ]
        );
        assert!(entries.iter().all(|e| e.kind == EntryKind::File));
    }

    #[tokio::test]
    async fn test_keep_album_lists_both() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.flac"),
            flac_bytes(44100, 2, 16, 88200, &[("CUESHEET", TWO_TRACK_CUE)], None),
        )
        .unwrap();

        let entries = read_root(&view(&dir, true)).await;
        assert_eq!(
            names(&entries),
            vec![
                "a.flac",
                "a.flac.#-#.01.Intro.0-44100.flac",
                "a.flac.#-#.02.Outro.44100-88200.flac",
            ]
        );
    }

    #[tokio::test]
    async fn test_sidecar_wave_album() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.wav"), wave_bytes(44100, 2, 16, &[0u8; 400])).unwrap();
        std::fs::write(
            dir.path().join("b.cue"),
            "TRACK 01 AUDIO\nTITLE Only\nINDEX 01 00:00:00\n",
        )
        .unwrap();

        let entries = read_root(&view(&dir, false)).await;
        // the cue file itself passes through; the album becomes one track
        assert_eq!(names(&entries), vec!["b.cue", "b.wav.#-#.01.Only.0-100.flac"]);
    }

    #[tokio::test]
    async fn test_album_without_cue_passes_through() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("plain.flac"),
            flac_bytes(44100, 2, 16, 1000, &[], None),
        )
        .unwrap();

        let entries = read_root(&view(&dir, false)).await;
        assert_eq!(names(&entries), vec!["plain.flac"]);
    }

    #[tokio::test]
    async fn test_corrupt_album_passes_through() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.flac"), b"not a flac at all").unwrap();

        let entries = read_root(&view(&dir, false)).await;
        assert_eq!(names(&entries), vec!["broken.flac"]);
    }

    #[tokio::test]
    async fn test_non_album_entries_pass_through() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let entries = read_root(&view(&dir, false)).await;
        assert_eq!(names(&entries), vec!["notes.txt", "subdir"]);
        let subdir = entries
            .iter()
            .find(|e| e.name == OsString::from("subdir"))
            .unwrap();
        assert_eq!(subdir.kind, EntryKind::Directory);
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    #[tokio::test]
    async fn test_resolve_synthetic_track() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.flac"),
            flac_bytes(44100, 2, 16, 88200, &[("CUESHEET", TWO_TRACK_CUE)], None),
        )
        .unwrap();

        let view = view(&dir, false);
        let resolved = view
            .resolve(Path::new("a.flac.#-#.02.Outro.44100-88200.flac"))
            .await
            .unwrap();
        match resolved {
            Resolved::Track { album, span } => {
                assert_eq!(album.file_name(), "a.flac");
                assert_eq!(span.ordinal(), 2);
                assert_eq!(span.start_sample, 44100);
                assert_eq!(span.end_sample, 88200);
            }
            Resolved::Passthrough(_) => panic!("expected a track"),
        }
    }

    #[tokio::test]
    async fn test_resolve_stale_synthetic_name_is_not_found() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.flac"),
            flac_bytes(44100, 2, 16, 88200, &[("CUESHEET", TWO_TRACK_CUE)], None),
        )
        .unwrap();

        // ordinal exists but the embedded range is wrong
        let result = view(&dir, false)
            .resolve(Path::new("a.flac.#-#.02.Outro.44100-88201.flac"))
            .await;
        assert!(matches!(result, Err(ViewError::NotFound)));
    }

    #[tokio::test]
    async fn test_resolve_passthrough_and_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let view = view(&dir, false);
        match view.resolve(Path::new("notes.txt")).await.unwrap() {
            Resolved::Passthrough(path) => assert!(path.ends_with("notes.txt")),
            Resolved::Track { .. } => panic!("expected passthrough"),
        }
        assert!(matches!(
            view.resolve(Path::new("missing.txt")).await,
            Err(ViewError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_resolve_track_in_subdirectory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("albums")).unwrap();
        std::fs::write(
            dir.path().join("albums/a.flac"),
            flac_bytes(44100, 2, 16, 88200, &[("CUESHEET", TWO_TRACK_CUE)], None),
        )
        .unwrap();

        let resolved = view(&dir, false)
            .resolve(Path::new("albums/a.flac.#-#.01.Intro.0-44100.flac"))
            .await
            .unwrap();
        assert!(matches!(resolved, Resolved::Track { .. }));
    }
}
