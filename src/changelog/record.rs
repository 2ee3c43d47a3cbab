//! Record codec
//!
//! Pure encode/decode of a single record:
//! `[RecordId: u32][DataLength: u32][Checksum: u64][Payload][Zero padding]`
//! with the whole encoding padded to `RECORD_ALIGNMENT`.

use std::fmt;
use std::io::{self, Read};

use bytes::Bytes;

/// RecordId (4) + DataLength (4) + Checksum (8)
pub const RECORD_HEADER_SIZE: usize = 16;

/// Every record starts at a multiple of this many bytes past the file header
pub const RECORD_ALIGNMENT: usize = 8;

/// Largest payload accepted by append and by the decoder (64 MB)
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

// =============================================================================
// Header
// =============================================================================

/// Fixed-size header preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_id: u32,
    pub data_length: u32,
    pub checksum: u64,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.record_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.data_length.to_le_bytes());
        buf[8..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let mut id = [0u8; 4];
        let mut len = [0u8; 4];
        let mut sum = [0u8; 8];
        id.copy_from_slice(&buf[0..4]);
        len.copy_from_slice(&buf[4..8]);
        sum.copy_from_slice(&buf[8..16]);
        Self {
            record_id: u32::from_le_bytes(id),
            data_length: u32::from_le_bytes(len),
            checksum: u64::from_le_bytes(sum),
        }
    }
}

/// Checksum stored in the header: CRC32 of the payload, zero-extended
pub fn checksum(payload: &[u8]) -> u64 {
    u64::from(crc32fast::hash(payload))
}

/// `len` rounded up to the record alignment
pub fn padded_len(len: usize) -> usize {
    (len + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

/// Total bytes a payload of `len` bytes occupies on disk
pub fn encoded_len(len: usize) -> usize {
    RECORD_HEADER_SIZE + padded_len(len)
}

// =============================================================================
// Encoding
// =============================================================================

/// Append the encoding of one record to `out`; returns the bytes appended
pub fn encode(record_id: u32, payload: &[u8], out: &mut Vec<u8>) -> usize {
    let start = out.len();
    let header = RecordHeader {
        record_id,
        data_length: payload.len() as u32,
        checksum: checksum(payload),
    };

    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out.resize(start + encoded_len(payload.len()), 0);

    out.len() - start
}

// =============================================================================
// Decoding
// =============================================================================

/// A successfully decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub record_id: u32,
    pub payload: Bytes,
    /// Bytes consumed, header and padding included
    pub encoded_len: usize,
}

/// Why a record could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    ZeroLength,
    Overlong { length: u32 },
    TruncatedPayload { expected: usize, available: usize },
    ChecksumMismatch { expected: u64, actual: u64 },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corruption::ZeroLength => write!(f, "zero payload length"),
            Corruption::Overlong { length } => write!(f, "payload length {} is too large", length),
            Corruption::TruncatedPayload {
                expected,
                available,
            } => write!(f, "truncated payload: {} of {} bytes", available, expected),
            Corruption::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch: expected {:#x}, computed {:#x}",
                expected, actual
            ),
        }
    }
}

/// Outcome of decoding one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Record(DecodedRecord),
    /// Fewer bytes than a header remain
    EndOfRecords,
    Corrupt(Corruption),
}

/// Decode the record at the start of `buf`; the payload shares `buf`'s memory
pub fn decode(buf: &Bytes) -> Decoded {
    if buf.len() < RECORD_HEADER_SIZE {
        return Decoded::EndOfRecords;
    }

    let mut raw = [0u8; RECORD_HEADER_SIZE];
    raw.copy_from_slice(&buf[..RECORD_HEADER_SIZE]);
    let header = RecordHeader::from_bytes(&raw);

    if let Err(corruption) = check_length(&header) {
        return Decoded::Corrupt(corruption);
    }

    let length = header.data_length as usize;
    let total = encoded_len(length);
    if buf.len() < total {
        return Decoded::Corrupt(Corruption::TruncatedPayload {
            expected: total - RECORD_HEADER_SIZE,
            available: buf.len() - RECORD_HEADER_SIZE,
        });
    }

    let payload = buf.slice(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + length);
    finish(header, payload, total)
}

fn check_length(header: &RecordHeader) -> std::result::Result<(), Corruption> {
    if header.data_length == 0 {
        return Err(Corruption::ZeroLength);
    }
    if header.data_length as usize > MAX_RECORD_SIZE {
        return Err(Corruption::Overlong {
            length: header.data_length,
        });
    }
    Ok(())
}

fn finish(header: RecordHeader, payload: Bytes, encoded_len: usize) -> Decoded {
    let actual = checksum(&payload);
    if actual != header.checksum {
        return Decoded::Corrupt(Corruption::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }
    Decoded::Record(DecodedRecord {
        record_id: header.record_id,
        payload,
        encoded_len,
    })
}

// =============================================================================
// Streaming Reader
// =============================================================================

/// Decodes consecutive records from a byte stream (used by recovery scans)
pub struct RecordReader<R> {
    inner: R,
    /// File offset of the next record to decode
    position: u64,
}

impl<R: Read> RecordReader<R> {
    /// `position` is the file offset `inner` is currently at
    pub fn new(inner: R, position: u64) -> Self {
        Self { inner, position }
    }

    /// Offset of the first byte not belonging to a successfully decoded record
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Decode the next record; the position only advances past good records
    pub fn next_record(&mut self) -> io::Result<Decoded> {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        if read_full(&mut self.inner, &mut raw)? < RECORD_HEADER_SIZE {
            return Ok(Decoded::EndOfRecords);
        }
        let header = RecordHeader::from_bytes(&raw);

        if let Err(corruption) = check_length(&header) {
            return Ok(Decoded::Corrupt(corruption));
        }

        let length = header.data_length as usize;
        let mut body = vec![0u8; padded_len(length)];
        let available = read_full(&mut self.inner, &mut body)?;
        if available < body.len() {
            return Ok(Decoded::Corrupt(Corruption::TruncatedPayload {
                expected: body.len(),
                available,
            }));
        }
        body.truncate(length);

        let decoded = finish(header, Bytes::from(body), encoded_len(length));
        if let Decoded::Record(record) = &decoded {
            self.position += record.encoded_len as u64;
        }
        Ok(decoded)
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
