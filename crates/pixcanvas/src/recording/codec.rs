use std::io::{self, Read, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::canvas::{CanvasImage, Color};
use crate::geometry::{PixelSize, Point, Rect};

pub const MAGIC: &[u8; 4] = b"PREC";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 54;

const TAG_SET_PIXEL: u8 = 10;
const TAG_INVALIDATE_RECT: u8 = 20;
const TAG_INVALIDATE_ALL: u8 = 21;
const TAG_REVALIDATE_RECT: u8 = 22;
const TAG_SET_IMAGE: u8 = 30;

const RESERVED_WORDS: usize = 6;
const MAX_IMAGE_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("recording i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),
    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
    #[error("record is truncated")]
    Truncated,
}

/// Fixed-size file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingHeader {
    pub version: u16,
    pub started_at_ns: i64,
    pub chunk_size: PixelSize,
    pub origin: Point,
}

impl RecordingHeader {
    pub fn new(started_at: SystemTime, chunk_size: PixelSize, origin: Point) -> Self {
        Self {
            version: FORMAT_VERSION,
            started_at_ns: system_time_to_ns(started_at),
            chunk_size,
            origin,
        }
    }

    pub fn started_at(&self) -> SystemTime {
        ns_to_system_time(self.started_at_ns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    SetPixel {
        pos: Point,
        rgb: [u8; 3],
    },
    InvalidateRect {
        rect: Rect,
    },
    InvalidateAll,
    RevalidateRect {
        rect: Rect,
    },
    /// Tightly packed RGB rows.
    SetImage {
        origin: Point,
        width: u16,
        height: u16,
        rgb: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp_ns: i64,
    pub body: RecordBody,
}

impl Record {
    pub fn new(time: SystemTime, body: RecordBody) -> Self {
        Self {
            timestamp_ns: system_time_to_ns(time),
            body,
        }
    }

    pub fn set_pixel(time: SystemTime, pos: Point, color: Color) -> Self {
        Self::new(
            time,
            RecordBody::SetPixel {
                pos,
                rgb: [color.0[0], color.0[1], color.0[2]],
            },
        )
    }

    /// Fails for images wider or taller than 65535 pixels.
    pub fn set_image(time: SystemTime, image: &CanvasImage) -> Result<Self, CodecError> {
        let rect = image.rect();
        let width = u16::try_from(rect.width()).map_err(|_| CodecError::InvalidRecord("image too wide"))?;
        let height = u16::try_from(rect.height()).map_err(|_| CodecError::InvalidRecord("image too tall"))?;
        Ok(Self::new(
            time,
            RecordBody::SetImage {
                origin: rect.min,
                width,
                height,
                rgb: image.to_rgb_bytes(),
            },
        ))
    }

    pub fn time(&self) -> SystemTime {
        ns_to_system_time(self.timestamp_ns)
    }
}

impl RecordBody {
    pub fn name(&self) -> &'static str {
        match self {
            RecordBody::SetPixel { .. } => "set_pixel",
            RecordBody::InvalidateRect { .. } => "invalidate_rect",
            RecordBody::InvalidateAll => "invalidate_all",
            RecordBody::RevalidateRect { .. } => "revalidate_rect",
            RecordBody::SetImage { .. } => "set_image",
        }
    }

    /// Opaque image for a `SetImage` record.
    pub fn image(&self) -> Option<CanvasImage> {
        match self {
            RecordBody::SetImage {
                origin,
                width,
                height,
                rgb,
            } => CanvasImage::from_rgb_bytes(*origin, *width as u32, *height as u32, rgb),
            _ => None,
        }
    }
}

pub fn write_header(writer: &mut impl Write, header: &RecordingHeader) -> Result<(), CodecError> {
    let mut bytes = Vec::with_capacity(HEADER_LEN);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&header.version.to_le_bytes());
    bytes.extend_from_slice(&header.started_at_ns.to_le_bytes());
    bytes.extend_from_slice(&(header.chunk_size.width as u32).to_le_bytes());
    bytes.extend_from_slice(&(header.chunk_size.height as u32).to_le_bytes());
    bytes.extend_from_slice(&header.origin.x.to_le_bytes());
    bytes.extend_from_slice(&header.origin.y.to_le_bytes());
    bytes.extend_from_slice(&[0u8; RESERVED_WORDS * 4]);
    writer.write_all(&bytes)?;
    Ok(())
}

pub fn read_header(reader: &mut impl Read) -> Result<RecordingHeader, CodecError> {
    let magic = read_array::<4>(reader)?;
    if &magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = u16::from_le_bytes(read_array(reader)?);
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let started_at_ns = i64::from_le_bytes(read_array(reader)?);
    let width = u32::from_le_bytes(read_array(reader)?);
    let height = u32::from_le_bytes(read_array(reader)?);
    let origin_x = i32::from_le_bytes(read_array(reader)?);
    let origin_y = i32::from_le_bytes(read_array(reader)?);
    read_array::<{ RESERVED_WORDS * 4 }>(reader)?;

    let chunk_size = PixelSize::new(
        i32::try_from(width).map_err(|_| CodecError::InvalidRecord("chunk width out of range"))?,
        i32::try_from(height).map_err(|_| CodecError::InvalidRecord("chunk height out of range"))?,
    );
    if !chunk_size.is_positive() {
        return Err(CodecError::InvalidRecord("chunk size must be positive"));
    }
    Ok(RecordingHeader {
        version,
        started_at_ns,
        chunk_size,
        origin: Point::new(origin_x, origin_y),
    })
}

pub fn encode_record(record: &Record) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::with_capacity(32);
    let tag = match &record.body {
        RecordBody::SetPixel { .. } => TAG_SET_PIXEL,
        RecordBody::InvalidateRect { .. } => TAG_INVALIDATE_RECT,
        RecordBody::InvalidateAll => TAG_INVALIDATE_ALL,
        RecordBody::RevalidateRect { .. } => TAG_REVALIDATE_RECT,
        RecordBody::SetImage { .. } => TAG_SET_IMAGE,
    };
    bytes.push(tag);
    bytes.extend_from_slice(&record.timestamp_ns.to_le_bytes());

    match &record.body {
        RecordBody::SetPixel { pos, rgb } => {
            write_point(&mut bytes, *pos);
            bytes.extend_from_slice(rgb);
        }
        RecordBody::InvalidateRect { rect } | RecordBody::RevalidateRect { rect } => {
            write_point(&mut bytes, rect.min);
            write_point(&mut bytes, rect.max);
        }
        RecordBody::InvalidateAll => {}
        RecordBody::SetImage {
            origin,
            width,
            height,
            rgb,
        } => {
            if rgb.len() != *width as usize * *height as usize * 3 {
                return Err(CodecError::InvalidRecord("image byte length does not match its size"));
            }
            let byte_len = u32::try_from(rgb.len())
                .ok()
                .filter(|len| *len <= MAX_IMAGE_BYTES)
                .ok_or(CodecError::InvalidRecord("image payload too large"))?;
            write_point(&mut bytes, *origin);
            bytes.extend_from_slice(&width.to_le_bytes());
            bytes.extend_from_slice(&height.to_le_bytes());
            bytes.extend_from_slice(&byte_len.to_le_bytes());
            bytes.extend_from_slice(rgb);
        }
    }
    Ok(bytes)
}

pub fn write_record(writer: &mut impl Write, record: &Record) -> Result<(), CodecError> {
    writer.write_all(&encode_record(record)?)?;
    Ok(())
}

/// Reads the next record. `Ok(None)` marks the end of the available data; a
/// stream ending inside a record yields [`CodecError::Truncated`].
pub fn read_record(reader: &mut impl Read) -> Result<Option<Record>, CodecError> {
    let mut tag = [0u8; 1];
    loop {
        match reader.read(&mut tag) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            // Compressed streams of a recording still being written end mid-frame.
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(error) => return Err(error.into()),
        }
    }
    let timestamp_ns = i64::from_le_bytes(read_array(reader)?);

    let body = match tag[0] {
        TAG_SET_PIXEL => {
            let pos = read_point(reader)?;
            RecordBody::SetPixel {
                pos,
                rgb: read_array(reader)?,
            }
        }
        TAG_INVALIDATE_RECT => RecordBody::InvalidateRect {
            rect: read_rect(reader)?,
        },
        TAG_INVALIDATE_ALL => RecordBody::InvalidateAll,
        TAG_REVALIDATE_RECT => RecordBody::RevalidateRect {
            rect: read_rect(reader)?,
        },
        TAG_SET_IMAGE => {
            let origin = read_point(reader)?;
            let width = u16::from_le_bytes(read_array(reader)?);
            let height = u16::from_le_bytes(read_array(reader)?);
            let byte_len = u32::from_le_bytes(read_array(reader)?);
            if byte_len > MAX_IMAGE_BYTES {
                return Err(CodecError::InvalidRecord("image payload too large"));
            }
            if byte_len as usize != width as usize * height as usize * 3 {
                return Err(CodecError::InvalidRecord("image byte length does not match its size"));
            }
            let mut rgb = vec![0u8; byte_len as usize];
            read_exact(reader, &mut rgb)?;
            RecordBody::SetImage {
                origin,
                width,
                height,
                rgb,
            }
        }
        other => return Err(CodecError::UnknownRecordType(other)),
    };
    Ok(Some(Record { timestamp_ns, body }))
}

/// Nanoseconds since the Unix epoch, saturating at the `i64` range.
pub fn system_time_to_ns(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|ns| -ns)
            .unwrap_or(i64::MIN),
    }
}

pub fn ns_to_system_time(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(ns.unsigned_abs())
    }
}

fn write_point(bytes: &mut Vec<u8>, pos: Point) {
    bytes.extend_from_slice(&pos.x.to_le_bytes());
    bytes.extend_from_slice(&pos.y.to_le_bytes());
}

fn read_point(reader: &mut impl Read) -> Result<Point, CodecError> {
    let x = i32::from_le_bytes(read_array(reader)?);
    let y = i32::from_le_bytes(read_array(reader)?);
    Ok(Point::new(x, y))
}

fn read_rect(reader: &mut impl Read) -> Result<Rect, CodecError> {
    let min = read_point(reader)?;
    let max = read_point(reader)?;
    Ok(Rect { min, max })
}

fn read_array<const N: usize>(reader: &mut impl Read) -> Result<[u8; N], CodecError> {
    let mut bytes = [0u8; N];
    read_exact(reader, &mut bytes)?;
    Ok(bytes)
}

fn read_exact(reader: &mut impl Read, target: &mut [u8]) -> Result<(), CodecError> {
    reader.read_exact(target).map_err(|error| {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::Truncated
        } else {
            CodecError::Io(error)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::canvas::opaque;

    fn at(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn header_layout_is_fixed() {
        let header = RecordingHeader::new(at(1_500), PixelSize::new(64, 32), Point::new(-3, 7));
        let mut bytes = Vec::new();
        write_header(&mut bytes, &header).expect("write");
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..4], b"PREC");
        assert_eq!(&bytes[4..6], &1u16.to_le_bytes());
        assert_eq!(&bytes[6..14], &1_500_000_000i64.to_le_bytes());
        assert_eq!(&bytes[14..18], &64u32.to_le_bytes());
        assert_eq!(&bytes[22..26], &(-3i32).to_le_bytes());
        assert!(bytes[30..].iter().all(|byte| *byte == 0));

        let decoded = read_header(&mut Cursor::new(bytes)).expect("read");
        assert_eq!(decoded, header);
        assert_eq!(decoded.started_at(), at(1_500));
    }

    #[test]
    fn header_rejects_foreign_files() {
        let mut bytes = b"NOPE".to_vec();
        bytes.resize(HEADER_LEN, 0);
        assert!(matches!(
            read_header(&mut Cursor::new(bytes)),
            Err(CodecError::BadMagic(magic)) if &magic == b"NOPE"
        ));

        let mut bytes = Vec::new();
        write_header(
            &mut bytes,
            &RecordingHeader::new(at(0), PixelSize::new(8, 8), Point::default()),
        )
        .expect("write");
        bytes[4..6].copy_from_slice(&7u16.to_le_bytes());
        assert!(matches!(
            read_header(&mut Cursor::new(bytes)),
            Err(CodecError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn set_pixel_record_layout() {
        let record = Record::set_pixel(at(2), Point::new(-1, 5), opaque(1, 2, 3));
        let bytes = encode_record(&record).expect("encode");
        assert_eq!(bytes.len(), 1 + 8 + 8 + 3);
        assert_eq!(bytes[0], 10);
        assert_eq!(&bytes[9..13], &(-1i32).to_le_bytes());
        assert_eq!(&bytes[17..], &[1, 2, 3]);
    }

    #[test]
    fn record_stream_decodes_in_order_until_clean_end() {
        let mut image = CanvasImage::new_rgba(Rect::new(4, 4, 6, 5));
        image.set_pixel(Point::new(5, 4), opaque(9, 8, 7)).expect("inside");
        let records = vec![
            Record::set_pixel(at(1), Point::new(0, 0), opaque(255, 0, 0)),
            Record::new(at(2), RecordBody::InvalidateRect { rect: Rect::new(0, 0, 8, 8) }),
            Record::new(at(3), RecordBody::RevalidateRect { rect: Rect::new(-8, -8, 0, 0) }),
            Record::set_image(at(4), &image).expect("image record"),
            Record::new(at(5), RecordBody::InvalidateAll),
        ];
        let mut bytes = Vec::new();
        for record in &records {
            write_record(&mut bytes, record).expect("write");
        }

        let mut cursor = Cursor::new(bytes);
        let mut decoded = Vec::new();
        while let Some(record) = read_record(&mut cursor).expect("read") {
            decoded.push(record);
        }
        assert_eq!(decoded, records);

        let replayed = decoded[3].body.image().expect("image");
        assert_eq!(replayed.rect(), image.rect());
        assert_eq!(replayed.pixel(Point::new(5, 4)), Ok(opaque(9, 8, 7)));
    }

    #[test]
    fn truncated_and_unknown_records_are_errors() {
        let bytes = encode_record(&Record::new(at(1), RecordBody::InvalidateRect { rect: Rect::new(0, 0, 1, 1) }))
            .expect("encode");
        let truncated = bytes[..bytes.len() - 2].to_vec();
        assert!(matches!(
            read_record(&mut Cursor::new(truncated)),
            Err(CodecError::Truncated)
        ));

        let mut unknown = bytes;
        unknown[0] = 99;
        assert!(matches!(
            read_record(&mut Cursor::new(unknown)),
            Err(CodecError::UnknownRecordType(99))
        ));
    }

    #[test]
    fn set_image_length_mismatch_is_rejected() {
        let record = Record::new(
            at(1),
            RecordBody::SetImage {
                origin: Point::default(),
                width: 2,
                height: 2,
                rgb: vec![0; 5],
            },
        );
        assert!(matches!(encode_record(&record), Err(CodecError::InvalidRecord(_))));
    }

    #[test]
    fn time_conversion_handles_pre_epoch_values() {
        let before = UNIX_EPOCH - Duration::from_millis(3);
        assert_eq!(system_time_to_ns(before), -3_000_000);
        assert_eq!(ns_to_system_time(-3_000_000), before);
    }
}
