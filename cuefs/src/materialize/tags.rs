//! Vorbis comment synthesis for materialized tracks.
//!
//! The final tag set starts from the album's inherited tags and is
//! reshaped by the cue sheet: per-track entries override, album-level cue
//! entries only fill gaps. The ignore pattern (default `CUE_TRACK.*|COMMENT`)
//! is matched against the whole key.

use regex::Regex;

use crate::probe::{AlbumInfo, TrackSpan};
use crate::tags::TagMap;

/// Build the vorbis comment set for one track.
pub fn synthesize(album: &AlbumInfo, span: &TrackSpan, ignore: &Regex) -> TagMap {
    let mut tags = album.tags.clone();

    tags.retain_keys(|key| !ignore.is_match(key));
    tags.retain_values(|value| !value.contains('\n'));

    // Albums tagged with ARTIST/TITLE instead of ALBUMARTIST/ALBUM keep
    // their identity once the per-track overrides land.
    if !tags.contains("ALBUMARTIST") {
        if let Some(artists) = tags.get("ARTIST") {
            tags.set("ALBUMARTIST", artists.to_vec());
        }
    }
    if !tags.contains("ALBUM") {
        if let Some(titles) = tags.get("TITLE") {
            tags.set("ALBUM", titles.to_vec());
        }
    }

    // Per-track cue entries replace their inherited counterparts.
    if let Some(title) = span.cue.title.as_deref() {
        tags.set_one("TITLE", title);
    }
    if !span.cue.performers.is_empty() {
        tags.set("ARTIST", span.cue.performers.clone());
    }
    if !span.cue.songwriters.is_empty() {
        tags.set("COMPOSER", span.cue.songwriters.clone());
    }
    if let Some(isrc) = span.cue.isrc.as_deref() {
        tags.set_one("ISRC", isrc);
    }

    // Album-level cue entries fill gaps, never overwrite.
    if let Some(list) = album.tracks.as_ref() {
        if !tags.contains("ALBUM") {
            if let Some(title) = list.album_title.as_deref() {
                tags.set_one("ALBUM", title);
            }
        }
        if !tags.contains("ALBUMARTIST") && !list.album_performers.is_empty() {
            tags.set("ALBUMARTIST", list.album_performers.clone());
        }
        if !tags.contains("COMPOSER") && !list.album_songwriters.is_empty() {
            tags.set("COMPOSER", list.album_songwriters.clone());
        }
        if !tags.contains("TRACKTOTAL") {
            tags.set_one("TRACKTOTAL", list.spans.len().to_string());
        }
    }

    tags.set_one("TRACKNUMBER", format!("{:02}", span.cue.ordinal));
    tags
}
