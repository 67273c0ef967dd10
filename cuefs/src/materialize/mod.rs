//! Track materialization.
//!
//! A materialization turns `(album, track span)` into a complete FLAC
//! byte stream for exactly that sample range:
//!
//! 1. slice extraction - the external decoder produces raw PCM for
//!    `[start_sample, end_sample)` (FLAC albums), or the PCM is read
//!    straight out of the WAVE data chunk;
//! 2. re-encoding - the external encoder turns the PCM back into FLAC at
//!    the album's native rate and depth;
//! 3. tag synthesis - inherited tags reshaped by the cue sheet;
//! 4. cover embedding - the probed picture, handed to the encoder via a
//!    transient file.
//!
//! The artifact length is only known once the encoder finishes; callers
//! treat the returned buffer as immutable.

mod tags;
mod tools;

pub use tools::{MaterializeError, ToolSpec};

use std::time::Instant;

use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::probe::{AlbumInfo, AudioFormat, TrackSpan};

/// Builds FLAC artifacts for synthetic tracks.
pub struct Materializer {
    tools: ToolSpec,
    ignore_tags: Regex,
}

impl Materializer {
    /// `ignore_tags` must already be anchored; see [`crate::app::Config`].
    pub fn new(tools: ToolSpec, ignore_tags: Regex) -> Self {
        Self { tools, ignore_tags }
    }

    /// Produce the complete FLAC stream for one track.
    pub async fn materialize(
        &self,
        album: &AlbumInfo,
        span: &TrackSpan,
    ) -> Result<Vec<u8>, MaterializeError> {
        let started = Instant::now();
        info!(
            album = %album.path.display(),
            track = span.ordinal(),
            start = span.start_sample,
            end = span.end_sample,
            "materializing track"
        );

        let track_tags = tags::synthesize(album, span, &self.ignore_tags);

        // The encoder wants cover art as a file; keep the temp file alive
        // until the pipeline is done.
        let picture = match album.cover.clone() {
            Some(bytes) => Some(write_picture_file(bytes).await?),
            None => None,
        };

        let encoder = self.tools.encode_command(
            album.sample_rate,
            album.channels,
            album.bits_per_sample,
            &track_tags,
            picture.as_ref().map(|f| f.path()),
        );

        let bytes = match album.format {
            AudioFormat::Flac => {
                let decoder =
                    self.tools
                        .decode_command(&album.path, span.start_sample, span.end_sample);
                tools::run_pipeline(decoder, encoder, self.tools.timeout()).await?
            }
            AudioFormat::Wave => {
                let stream = album
                    .wave
                    .expect("probed WAVE albums always carry their data-chunk location");
                let path = album.path.clone();
                let (start, end) = (span.start_sample, span.end_sample);
                let pcm = tokio::task::spawn_blocking(move || {
                    crate::probe::wave::read_pcm_slice(&path, &stream, start, end)
                })
                .await
                .map_err(|e| {
                    MaterializeError::Io(std::io::Error::other(format!(
                        "PCM slice task failed: {e}"
                    )))
                })??;
                tools::run_encoder_with_input(encoder, pcm, self.tools.timeout()).await?
            }
        };

        debug!(
            track = span.ordinal(),
            len = bytes.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "track materialized"
        );
        Ok(bytes)
    }
}

/// Write cover bytes to a transient file the encoder can read.
async fn write_picture_file(bytes: Vec<u8>) -> Result<NamedTempFile, MaterializeError> {
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut file = NamedTempFile::new()?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok::<_, std::io::Error>(file)
    })
    .await
    .map_err(|e| MaterializeError::Io(std::io::Error::other(format!("picture task failed: {e}"))))?
    .map_err(MaterializeError::Io)
}
