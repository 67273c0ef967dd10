//! FLAC metadata-block reader.
//!
//! Reads only the metadata section of a FLAC file: STREAMINFO for the
//! technical parameters, VORBIS_COMMENT for tags and PICTURE for cover
//! art. Audio frames are never touched; unknown block types are skipped
//! via seek, so probing a multi-gigabyte album costs a few small reads.

use std::io::{Read, Seek, SeekFrom};

use super::ProbeError;

const BLOCK_STREAMINFO: u8 = 0;
const BLOCK_VORBIS_COMMENT: u8 = 4;
const BLOCK_PICTURE: u8 = 6;

/// Everything the probe needs from a FLAC metadata section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlacStream {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub total_samples: u64,
    /// Raw vorbis comments in file order, keys not yet normalized.
    pub comments: Vec<(String, String)>,
    /// Image data of the first PICTURE block, if any.
    pub picture: Option<Vec<u8>>,
}

/// Read the metadata section from the start of a FLAC stream.
pub fn read_metadata<R: Read + Seek>(reader: &mut R) -> Result<FlacStream, ProbeError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != b"fLaC" {
        return Err(ProbeError::Malformed("missing fLaC stream marker".into()));
    }

    let mut stream_info: Option<FlacStream> = None;
    let mut comments: Vec<(String, String)> = Vec::new();
    let mut picture: Option<Vec<u8>> = None;

    loop {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header)?;
        let last = header[0] & 0x80 != 0;
        let block_type = header[0] & 0x7F;
        let length = u32::from_be_bytes([0, header[1], header[2], header[3]]) as u64;

        match block_type {
            BLOCK_STREAMINFO => {
                if length < 34 {
                    return Err(ProbeError::Malformed("STREAMINFO block too short".into()));
                }
                let mut data = vec![0u8; length as usize];
                reader.read_exact(&mut data)?;
                stream_info = Some(parse_stream_info(&data)?);
            }
            BLOCK_VORBIS_COMMENT => {
                let mut data = vec![0u8; length as usize];
                reader.read_exact(&mut data)?;
                comments = parse_vorbis_comments(&data)?;
            }
            BLOCK_PICTURE if picture.is_none() => {
                let mut data = vec![0u8; length as usize];
                reader.read_exact(&mut data)?;
                picture = Some(parse_picture(&data)?);
            }
            _ => {
                reader.seek(SeekFrom::Current(length as i64))?;
            }
        }

        if last {
            break;
        }
    }

    let mut stream =
        stream_info.ok_or_else(|| ProbeError::Malformed("FLAC file has no STREAMINFO".into()))?;
    stream.comments = comments;
    stream.picture = picture;
    Ok(stream)
}

/// STREAMINFO layout (bytes 10..18 of the block data):
/// 20 bits sample rate, 3 bits channels-1, 5 bits bps-1, 36 bits total samples.
fn parse_stream_info(data: &[u8]) -> Result<FlacStream, ProbeError> {
    let sample_rate =
        ((data[10] as u32) << 12) | ((data[11] as u32) << 4) | ((data[12] as u32) >> 4);
    let channels = ((data[12] >> 1) & 0x07) + 1;
    let bits_per_sample = (((data[12] & 0x01) << 4) | (data[13] >> 4)) + 1;
    let total_samples = (((data[13] & 0x0F) as u64) << 32)
        | u32::from_be_bytes([data[14], data[15], data[16], data[17]]) as u64;

    if sample_rate == 0 {
        return Err(ProbeError::Malformed("STREAMINFO sample rate is zero".into()));
    }

    Ok(FlacStream {
        sample_rate,
        channels,
        bits_per_sample,
        total_samples,
        comments: Vec::new(),
        picture: None,
    })
}

/// Vorbis comment block: LE vendor length + vendor, LE count, then
/// length-prefixed `KEY=value` entries. Entries without `=` are skipped.
fn parse_vorbis_comments(data: &[u8]) -> Result<Vec<(String, String)>, ProbeError> {
    let mut cursor = 0usize;
    let vendor_len = read_le_u32(data, &mut cursor)? as usize;
    skip(data, &mut cursor, vendor_len)?;
    let count = read_le_u32(data, &mut cursor)?;

    let mut comments = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_le_u32(data, &mut cursor)? as usize;
        let entry = take(data, &mut cursor, len)?;
        let entry = String::from_utf8_lossy(entry);
        if let Some((key, value)) = entry.split_once('=') {
            comments.push((key.to_string(), value.to_string()));
        }
    }
    Ok(comments)
}

/// Picture block: all the descriptive fields are skipped; only the image
/// data itself is returned.
fn parse_picture(data: &[u8]) -> Result<Vec<u8>, ProbeError> {
    let mut cursor = 0usize;
    let _picture_type = read_be_u32(data, &mut cursor)?;
    let mime_len = read_be_u32(data, &mut cursor)? as usize;
    skip(data, &mut cursor, mime_len)?;
    let desc_len = read_be_u32(data, &mut cursor)? as usize;
    skip(data, &mut cursor, desc_len)?;
    // width, height, color depth, palette size
    for _ in 0..4 {
        read_be_u32(data, &mut cursor)?;
    }
    let data_len = read_be_u32(data, &mut cursor)? as usize;
    Ok(take(data, &mut cursor, data_len)?.to_vec())
}

fn read_le_u32(data: &[u8], cursor: &mut usize) -> Result<u32, ProbeError> {
    let bytes = take(data, cursor, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_be_u32(data: &[u8], cursor: &mut usize) -> Result<u32, ProbeError> {
    let bytes = take(data, cursor, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], ProbeError> {
    let end = cursor
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| ProbeError::Malformed("truncated FLAC metadata block".into()))?;
    let slice = &data[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn skip(data: &[u8], cursor: &mut usize, len: usize) -> Result<(), ProbeError> {
    take(data, cursor, len).map(|_| ())
}


#[cfg(test)]
mod tests {
    use super::test_support::flac_bytes;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_stream_info() {
        let bytes = flac_bytes(44100, 2, 16, 88200, &[], None);
        let stream = read_metadata(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(stream.sample_rate, 44100);
        assert_eq!(stream.channels, 2);
        assert_eq!(stream.bits_per_sample, 16);
        assert_eq!(stream.total_samples, 88200);
        assert!(stream.comments.is_empty());
        assert!(stream.picture.is_none());
    }

    #[test]
    fn test_read_high_resolution_parameters() {
        let bytes = flac_bytes(192000, 6, 24, 1 << 33, &[], None);
        let stream = read_metadata(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(stream.sample_rate, 192000);
        assert_eq!(stream.channels, 6);
        assert_eq!(stream.bits_per_sample, 24);
        assert_eq!(stream.total_samples, 1 << 33);
    }

    #[test]
    fn test_read_vorbis_comments() {
        let bytes = flac_bytes(
            44100,
            2,
            16,
            1000,
            &[("ARTIST", "Alice"), ("Title", "Live"), ("ARTIST", "Bob")],
            None,
        );
        let stream = read_metadata(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(
            stream.comments,
            vec![
                ("ARTIST".to_string(), "Alice".to_string()),
                ("Title".to_string(), "Live".to_string()),
                ("ARTIST".to_string(), "Bob".to_string()),
            ]
        );
    }

    #[test]
    fn test_read_picture_data() {
        let image = [0xFFu8, 0xD8, 0xFF, 0xE0, 1, 2, 3];
        let bytes = flac_bytes(44100, 2, 16, 1000, &[], Some(&image));
        let stream = read_metadata(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(stream.picture.as_deref(), Some(&image[..]));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut cursor = Cursor::new(b"RIFFxxxx".to_vec());
        assert!(matches!(
            read_metadata(&mut cursor),
            Err(ProbeError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_comment_block_rejected() {
        let mut bytes = flac_bytes(44100, 2, 16, 1000, &[("A", "B")], None);
        // Corrupt the declared length of the last comment entry.
        let len = bytes.len();
        bytes[len - 5] = 0xFF;
        assert!(read_metadata(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn test_zero_sample_rate_rejected() {
        let bytes = flac_bytes(1, 2, 16, 1000, &[], None);
        // Zero out the sample-rate bits in STREAMINFO.
        let mut bytes = bytes;
        bytes[8 + 10] = 0;
        bytes[8 + 11] = 0;
        bytes[8 + 12] &= 0x0F;
        assert!(matches!(
            read_metadata(&mut Cursor::new(bytes)),
            Err(ProbeError::Malformed(_))
        ));
    }
}
