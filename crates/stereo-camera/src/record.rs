//! Fixed-size binary record of one stereo frame pair, for logging and playback.
//!
//! Layout (little-endian, packed):
//!
//! | offset  | size    | field        |
//! |---------|---------|--------------|
//! | 0       | 1       | version      |
//! | 1       | 4       | frame id     |
//! | 5       | 8       | timestamp    |
//! | 13      | 64      | reserved     |
//! | 77      | 16      | cols, rows, rowinc, channels |
//! | 93      | 408     | padding      |
//! | 501     | 786432  | left buffer  |
//! | 786933  | 786432  | right buffer |
//! | 1573365 | 8       | shutter, gain |

use crate::{Error, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use tracing::debug;

pub const RECORD_VERSION: u8 = 4;
pub const RECORD_MAX_COLS: usize = 1024;
pub const RECORD_MAX_ROWS: usize = 768;
/// Capacity of each image buffer.
pub const RECORD_IMAGE_BYTES: usize = RECORD_MAX_COLS * RECORD_MAX_ROWS;
pub const RECORD_RESERVED_WORDS: usize = 16;
pub const RECORD_PADDING_BYTES: usize = 408;
const HEADER_BYTES: usize = 1 + 4 + 8 + 4 * RECORD_RESERVED_WORDS + 4 * 4 + RECORD_PADDING_BYTES;
/// Encoded size of one record.
pub const RECORD_SIZE: usize = HEADER_BYTES + 2 * RECORD_IMAGE_BYTES + 4 + 4;

/// One captured stereo pair in wire form. Buffers always hold [`RECORD_IMAGE_BYTES`].
#[derive(Clone, PartialEq)]
pub struct StereoImageRecord {
    pub frame_id: i32,
    pub timestamp: u64,
    pub cols: i32,
    pub rows: i32,
    /// Row stride in bytes.
    pub rowinc: i32,
    /// 1 = grayscale, 3 = RGB.
    pub channels: i32,
    left: Vec<u8>,
    right: Vec<u8>,
    pub shutter: f32,
    pub gain: f32,
}

impl std::fmt::Debug for StereoImageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StereoImageRecord")
            .field("frame_id", &self.frame_id)
            .field("timestamp", &self.timestamp)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("rowinc", &self.rowinc)
            .field("channels", &self.channels)
            .field("shutter", &self.shutter)
            .field("gain", &self.gain)
            .finish_non_exhaustive()
    }
}

impl Default for StereoImageRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl StereoImageRecord {
    pub fn new() -> Self {
        Self {
            frame_id: 0,
            timestamp: 0,
            cols: 0,
            rows: 0,
            rowinc: 0,
            channels: 0,
            left: vec![0; RECORD_IMAGE_BYTES],
            right: vec![0; RECORD_IMAGE_BYTES],
            shutter: 0.0,
            gain: 0.0,
        }
    }

    pub fn left_buffer(&self) -> &[u8] {
        &self.left
    }

    pub fn right_buffer(&self) -> &[u8] {
        &self.right
    }

    /// The meaningful part of the left buffer.
    pub fn left_image(&self) -> &[u8] {
        &self.left[..self.payload_len().min(RECORD_IMAGE_BYTES)]
    }

    pub fn right_image(&self) -> &[u8] {
        &self.right[..self.payload_len().min(RECORD_IMAGE_BYTES)]
    }

    fn payload_len(&self) -> usize {
        (self.rows.max(0) as usize) * (self.rowinc.max(0) as usize)
    }

    /// Store a left/right pair of `rows` x `cols` x `channels` images, rows packed without padding.
    pub fn set_images(
        &mut self,
        rows: usize,
        cols: usize,
        channels: usize,
        left: &[u8],
        right: &[u8],
    ) -> Result<()> {
        let len = rows * cols * channels;
        if len > RECORD_IMAGE_BYTES {
            return Err(Error::Record(format!(
                "{cols}x{rows}x{channels} image exceeds the {RECORD_IMAGE_BYTES} byte buffer"
            )));
        }
        if left.len() < len || right.len() < len {
            return Err(Error::BufferTooSmall {
                needed: len,
                got: left.len().min(right.len()),
            });
        }
        let dim = |v: usize| {
            i32::try_from(v).map_err(|_| Error::Record(format!("dimension {v} out of range")))
        };
        self.left[..len].copy_from_slice(&left[..len]);
        self.right[..len].copy_from_slice(&right[..len]);
        self.rows = dim(rows)?;
        self.cols = dim(cols)?;
        self.channels = dim(channels)?;
        self.rowinc = dim(cols * channels)?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut header = Vec::with_capacity(HEADER_BYTES);
        header.push(RECORD_VERSION);
        header.extend_from_slice(&self.frame_id.to_le_bytes());
        header.extend_from_slice(&self.timestamp.to_le_bytes());
        header.extend_from_slice(&[0u8; 4 * RECORD_RESERVED_WORDS]);
        for v in [self.cols, self.rows, self.rowinc, self.channels] {
            header.extend_from_slice(&v.to_le_bytes());
        }
        header.extend_from_slice(&[0u8; RECORD_PADDING_BYTES]);
        w.write_all(&header)?;
        w.write_all(&self.left)?;
        w.write_all(&self.right)?;
        w.write_all(&self.shutter.to_le_bytes())?;
        w.write_all(&self.gain.to_le_bytes())?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_SIZE);
        // writing into a Vec cannot fail
        let _ = self.write_to(&mut out);
        out
    }

    /// Read one record. `Ok(None)` on a clean end of stream.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; HEADER_BYTES];
        match r.read_exact(&mut header[..1]) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        r.read_exact(&mut header[1..])?;
        let mut rec = Self::parse_header(&header)?;
        r.read_exact(&mut rec.left)?;
        r.read_exact(&mut rec.right)?;
        let mut tail = [0u8; 8];
        r.read_exact(&mut tail)?;
        rec.shutter = f32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        rec.gain = f32::from_le_bytes([tail[4], tail[5], tail[6], tail[7]]);
        Ok(Some(rec))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_SIZE {
            return Err(Error::Record(format!(
                "record is {} bytes, expected {RECORD_SIZE}",
                bytes.len()
            )));
        }
        let mut cursor = bytes;
        Self::read_from(&mut cursor)?.ok_or_else(|| Error::Record("empty record".into()))
    }

    fn parse_header(h: &[u8; HEADER_BYTES]) -> Result<Self> {
        if h[0] != RECORD_VERSION {
            return Err(Error::Record(format!(
                "unsupported version {}, expected {RECORD_VERSION}",
                h[0]
            )));
        }
        let i32_at = |o: usize| i32::from_le_bytes([h[o], h[o + 1], h[o + 2], h[o + 3]]);
        let reserved = &h[13..13 + 4 * RECORD_RESERVED_WORDS];
        if reserved.iter().any(|&b| b != 0) {
            return Err(Error::Record("reserved words must be zero".into()));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&h[5..13]);
        let dims = 13 + 4 * RECORD_RESERVED_WORDS;
        let mut rec = Self::new();
        rec.frame_id = i32_at(1);
        rec.timestamp = u64::from_le_bytes(ts);
        rec.cols = i32_at(dims);
        rec.rows = i32_at(dims + 4);
        rec.rowinc = i32_at(dims + 8);
        rec.channels = i32_at(dims + 12);
        Ok(rec)
    }
}

/// Appends records back to back to a log file.
pub struct RecordWriter<W: Write = BufWriter<File>> {
    inner: W,
    written: u64,
    last_frame_id: Option<i32>,
}

impl RecordWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "record log opened");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            written: 0,
            last_frame_id: None,
        }
    }

    /// Append a record. Frame ids must increase strictly within one log.
    pub fn append(&mut self, record: &StereoImageRecord) -> Result<()> {
        if let Some(last) = self.last_frame_id {
            if record.frame_id <= last {
                return Err(Error::Record(format!(
                    "frame id {} does not follow {last}",
                    record.frame_id
                )));
            }
        }
        record.write_to(&mut self.inner)?;
        self.last_frame_id = Some(record.frame_id);
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Reads records written by [`RecordWriter`].
pub struct RecordReader<R: Read = BufReader<File>> {
    inner: R,
}

impl RecordReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_record(&mut self) -> Result<Option<StereoImageRecord>> {
        StereoImageRecord::read_from(&mut self.inner)
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<StereoImageRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(frame_id: i32) -> StereoImageRecord {
        let mut rec = StereoImageRecord::new();
        rec.frame_id = frame_id;
        rec.timestamp = 0x0102_0304_0506_0708;
        rec.shutter = 0.0105;
        rec.gain = 3.25;
        let left: Vec<u8> = (0..48 * 64).map(|i| (i % 251) as u8).collect();
        let right: Vec<u8> = left.iter().map(|v| v.wrapping_mul(3)).collect();
        rec.set_images(48, 64, 1, &left, &right).unwrap();
        rec
    }

    #[test]
    fn encoded_size_matches_the_packed_layout() {
        assert_eq!(RECORD_SIZE, 1_573_373);
        assert_eq!(sample(1).to_bytes().len(), RECORD_SIZE);
    }

    #[test]
    fn header_fields_sit_at_fixed_offsets() {
        let bytes = sample(7).to_bytes();
        assert_eq!(bytes[0], RECORD_VERSION);
        assert_eq!(&bytes[1..5], &7i32.to_le_bytes());
        assert_eq!(&bytes[5..13], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert!(bytes[13..77].iter().all(|&b| b == 0));
        assert_eq!(&bytes[77..81], &64i32.to_le_bytes());
        assert_eq!(&bytes[81..85], &48i32.to_le_bytes());
        assert_eq!(&bytes[85..89], &64i32.to_le_bytes());
        assert_eq!(&bytes[89..93], &1i32.to_le_bytes());
        assert_eq!(&bytes[RECORD_SIZE - 8..RECORD_SIZE - 4], &0.0105f32.to_le_bytes());
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let rec = sample(3);
        let back = StereoImageRecord::from_bytes(&rec.to_bytes()).unwrap();
        assert_eq!(back, rec);
        assert_eq!(back.shutter.to_bits(), rec.shutter.to_bits());
        assert_eq!(back.left_image(), rec.left_image());
    }

    #[test]
    fn rejects_wrong_version_and_dirty_reserved() {
        let mut bytes = sample(1).to_bytes();
        bytes[0] = 3;
        assert!(matches!(
            StereoImageRecord::from_bytes(&bytes),
            Err(Error::Record(_))
        ));
        let mut bytes = sample(1).to_bytes();
        bytes[20] = 1;
        assert!(StereoImageRecord::from_bytes(&bytes).is_err());
    }

    #[test]
    fn oversized_payload_is_refused() {
        let mut rec = StereoImageRecord::new();
        let big = vec![0u8; 640 * 480 * 3];
        let err = rec.set_images(480, 640, 3, &big, &big).unwrap_err();
        assert!(matches!(err, Error::Record(_)));
    }

    #[test]
    fn log_file_round_trip_and_ordering() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stereo.log");
        let mut writer = RecordWriter::create(&path)?;
        writer.append(&sample(1))?;
        writer.append(&sample(2))?;
        assert!(writer.append(&sample(2)).is_err());
        assert_eq!(writer.written(), 2);
        writer.finish()?;

        let ids: Vec<i32> = RecordReader::open(&path)?
            .map(|r| r.map(|rec| rec.frame_id))
            .collect::<Result<_>>()?;
        assert_eq!(ids, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn truncated_log_is_an_error() {
        let bytes = sample(1).to_bytes();
        let mut reader = RecordReader::new(&bytes[..1000]);
        assert!(matches!(reader.next_record(), Err(Error::Io(_))));
    }
}
