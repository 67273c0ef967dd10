//! WAVE (RIFF) header reader and PCM slice access.
//!
//! WAVE albums carry no intrinsic tags; the probe only needs the `fmt `
//! chunk for technical parameters and the location of the `data` chunk.
//! Because the data chunk already is interleaved PCM, track slices can be
//! read straight out of the file without an external decoder.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::ProbeError;

/// Technical parameters and data-chunk location of a WAVE file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveStream {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub total_samples: u64,
    /// Absolute file offset of the first PCM byte.
    pub data_offset: u64,
    /// Length of the data chunk in bytes.
    pub data_len: u64,
}

impl WaveStream {
    /// Bytes per interleaved sample frame.
    pub fn frame_size(&self) -> u64 {
        self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }
}

/// Read the RIFF header and chunk table of a WAVE file.
pub fn read_metadata<R: Read + Seek>(reader: &mut R) -> Result<WaveStream, ProbeError> {
    let mut riff = [0u8; 12];
    reader.read_exact(&mut riff)?;
    if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
        return Err(ProbeError::Malformed("missing RIFF/WAVE header".into()));
    }

    let mut format: Option<(u32, u8, u8, u16)> = None;
    let mut data: Option<(u64, u64)> = None;

    loop {
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let chunk_id = &header[0..4];
        let chunk_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;

        match chunk_id {
            b"fmt " => {
                if chunk_len < 16 {
                    return Err(ProbeError::Malformed("fmt chunk too short".into()));
                }
                let mut fmt = [0u8; 16];
                reader.read_exact(&mut fmt)?;
                let audio_format = u16::from_le_bytes([fmt[0], fmt[1]]);
                if audio_format != 1 {
                    return Err(ProbeError::Malformed(format!(
                        "unsupported WAVE audio format {audio_format} (only PCM)"
                    )));
                }
                let channels = u16::from_le_bytes([fmt[2], fmt[3]]);
                let sample_rate = u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]);
                let block_align = u16::from_le_bytes([fmt[12], fmt[13]]);
                let bits = u16::from_le_bytes([fmt[14], fmt[15]]);
                if sample_rate == 0 || channels == 0 || bits == 0 || block_align == 0 {
                    return Err(ProbeError::Malformed("degenerate fmt chunk".into()));
                }
                format = Some((sample_rate, channels as u8, bits as u8, block_align));
                // skip any fmt extension
                skip_padded(reader, chunk_len - 16)?;
            }
            b"data" => {
                let offset = reader.stream_position()?;
                data = Some((offset, chunk_len));
                skip_padded(reader, chunk_len)?;
            }
            _ => {
                skip_padded(reader, chunk_len)?;
            }
        }

        if format.is_some() && data.is_some() {
            break;
        }
    }

    let (sample_rate, channels, bits_per_sample, block_align) =
        format.ok_or_else(|| ProbeError::Malformed("WAVE file has no fmt chunk".into()))?;
    let (data_offset, data_len) =
        data.ok_or_else(|| ProbeError::Malformed("WAVE file has no data chunk".into()))?;

    Ok(WaveStream {
        sample_rate,
        channels,
        bits_per_sample,
        total_samples: data_len / block_align as u64,
        data_offset,
        data_len,
    })
}

/// Read the raw PCM bytes of the sample range `[start, end)`.
///
/// Blocking; callers in async context run this via `spawn_blocking`.
pub fn read_pcm_slice(
    path: &Path,
    stream: &WaveStream,
    start_sample: u64,
    end_sample: u64,
) -> std::io::Result<Vec<u8>> {
    let frame = stream.frame_size();
    let offset = stream.data_offset + start_sample * frame;
    let len = (end_sample - start_sample) * frame;

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut pcm = vec![0u8; len as usize];
    file.read_exact(&mut pcm)?;
    Ok(pcm)
}

/// RIFF chunks are word-aligned: odd-sized chunks carry one pad byte.
fn skip_padded<R: Read + Seek>(reader: &mut R, len: u64) -> std::io::Result<()> {
    let padded = len + (len & 1);
    reader.seek(SeekFrom::Current(padded as i64))?;
    Ok(())
}
