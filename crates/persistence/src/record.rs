//! Record frame codec.
//!
//! ```text
//! ┌────────────┬──────────┬────────┬───────────┬──────────┬──────────────┬─────────┬─────────────┐
//! │ Frame Len  │ CRC64    │ Offset │ Timestamp │ Sequence │ Producer Len │ Key Len │ Payload Len │
//! │ (4 bytes)  │(8 bytes) │(8)     │(8)        │(8)       │(2)           │(4)      │(4)          │
//! └────────────┴──────────┴────────┴───────────┴──────────┴──────────────┴─────────┴─────────────┘
//! [producer id][key][payload]
//! ```
//!
//! Frame length counts every byte after the length field. The checksum covers
//! every byte after the checksum field. A key length of `u32::MAX` encodes
//! "no key", which keeps an empty key distinct from an absent one.

use crate::error::{PersistenceError, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use crc64fast::Digest;
use std::io::{self, Read};

const LEN_PREFIX: usize = 4;
const CHECKSUM_SIZE: usize = 8;
const BODY_HEADER_SIZE: usize = 8 + 8 + 8 + 2 + 4 + 4;
const NO_KEY: u32 = u32::MAX;

/// Size of the fixed part of every frame (46 bytes).
pub const FRAME_HEADER_SIZE: usize = LEN_PREFIX + CHECKSUM_SIZE + BODY_HEADER_SIZE;

/// A committed log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    /// Milliseconds since the Unix epoch at commit. Advisory only.
    pub timestamp: u64,
    pub producer_id: String,
    pub sequence: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

impl Record {
    /// Total number of bytes this record occupies on disk.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE
            + self.producer_id.len()
            + self.key.as_ref().map_or(0, |k| k.len())
            + self.payload.len()
    }

    /// Checksum stored in this record's frame.
    pub fn checksum(&self) -> Result<u64> {
        Ok(checksum(&self.encode_body()?))
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let producer_len = u16::try_from(self.producer_id.len()).map_err(|_| {
            PersistenceError::InvalidFormat(format!(
                "producer id is {} bytes, limit is {}",
                self.producer_id.len(),
                u16::MAX
            ))
        })?;
        let key_len = match &self.key {
            Some(key) => match u32::try_from(key.len()) {
                Ok(len) if len != NO_KEY => len,
                _ => {
                    return Err(PersistenceError::InvalidFormat(format!(
                        "key of {} bytes does not fit in a frame",
                        key.len()
                    )))
                }
            },
            None => NO_KEY,
        };
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| {
            PersistenceError::InvalidFormat(format!(
                "payload of {} bytes does not fit in a frame",
                self.payload.len()
            ))
        })?;

        let mut body = Vec::with_capacity(self.encoded_len() - LEN_PREFIX - CHECKSUM_SIZE);
        body.write_u64::<LittleEndian>(self.offset)?;
        body.write_u64::<LittleEndian>(self.timestamp)?;
        body.write_u64::<LittleEndian>(self.sequence)?;
        body.write_u16::<LittleEndian>(producer_len)?;
        body.write_u32::<LittleEndian>(key_len)?;
        body.write_u32::<LittleEndian>(payload_len)?;
        body.extend_from_slice(self.producer_id.as_bytes());
        if let Some(key) = &self.key {
            body.extend_from_slice(key);
        }
        body.extend_from_slice(&self.payload);
        Ok(body)
    }

    /// Encode into a complete frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = self.encode_body()?;
        let frame_len = u32::try_from(CHECKSUM_SIZE + body.len()).map_err(|_| {
            PersistenceError::InvalidFormat("frame exceeds u32::MAX bytes".into())
        })?;

        let mut frame = Vec::with_capacity(LEN_PREFIX + CHECKSUM_SIZE + body.len());
        frame.write_u32::<LittleEndian>(frame_len)?;
        frame.write_u64::<LittleEndian>(checksum(&body))?;
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode the frame at the start of `buf`.
    ///
    /// Returns the record and the number of bytes consumed. Never returns a
    /// partially decoded record: short input, inconsistent lengths and
    /// checksum mismatches are all errors.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < LEN_PREFIX {
            return Err(PersistenceError::Truncated {
                needed: LEN_PREFIX,
                available: buf.len(),
            });
        }
        let frame_len = LittleEndian::read_u32(&buf[..LEN_PREFIX]) as usize;
        if frame_len < CHECKSUM_SIZE + BODY_HEADER_SIZE {
            return Err(PersistenceError::InvalidFormat(format!(
                "frame length {} is shorter than the fixed header",
                frame_len
            )));
        }
        let total = LEN_PREFIX + frame_len;
        if buf.len() < total {
            return Err(PersistenceError::Truncated {
                needed: total,
                available: buf.len(),
            });
        }

        let stored = LittleEndian::read_u64(&buf[LEN_PREFIX..LEN_PREFIX + CHECKSUM_SIZE]);
        let body = &buf[LEN_PREFIX + CHECKSUM_SIZE..total];
        let found = checksum(body);
        if found != stored {
            return Err(PersistenceError::ChecksumMismatch {
                expected: stored,
                found,
            });
        }

        let mut cursor = body;
        let offset = cursor.read_u64::<LittleEndian>()?;
        let timestamp = cursor.read_u64::<LittleEndian>()?;
        let sequence = cursor.read_u64::<LittleEndian>()?;
        let producer_len = cursor.read_u16::<LittleEndian>()? as usize;
        let key_len = cursor.read_u32::<LittleEndian>()?;
        let payload_len = cursor.read_u32::<LittleEndian>()? as usize;

        let key_bytes = if key_len == NO_KEY { 0 } else { key_len as usize };
        if producer_len + key_bytes + payload_len != cursor.len() {
            return Err(PersistenceError::InvalidFormat(format!(
                "declared field lengths {}+{}+{} do not match frame body of {} bytes",
                producer_len,
                key_bytes,
                payload_len,
                cursor.len()
            )));
        }

        let (producer, rest) = cursor.split_at(producer_len);
        let producer_id = String::from_utf8(producer.to_vec()).map_err(|e| {
            PersistenceError::InvalidFormat(format!("Invalid UTF-8 in producer id: {}", e))
        })?;
        let (key, payload) = rest.split_at(key_bytes);
        let key = (key_len != NO_KEY).then(|| Bytes::copy_from_slice(key));

        Ok((
            Self {
                offset,
                timestamp,
                producer_id,
                sequence,
                key,
                payload: Bytes::copy_from_slice(payload),
            },
            total,
        ))
    }
}

pub fn checksum(body: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(body);
    digest.sum64()
}

/// Read one raw frame from `reader`.
///
/// `Ok(None)` means a clean end of stream (no bytes left). A stream that ends
/// inside a frame yields `Truncated`. Frames longer than `max_frame` are
/// rejected before allocating, since a damaged length prefix can claim gigabytes.
pub fn read_frame<R: Read>(mut reader: R, max_frame: usize) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(PersistenceError::Truncated {
                    needed: LEN_PREFIX,
                    available: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let frame_len = LittleEndian::read_u32(&prefix) as usize;
    let total = LEN_PREFIX + frame_len;
    if total > max_frame {
        return Err(PersistenceError::InvalidFormat(format!(
            "frame of {} bytes exceeds the {} byte limit",
            total, max_frame
        )));
    }

    let mut frame = vec![0u8; total];
    frame[..LEN_PREFIX].copy_from_slice(&prefix);
    let mut read = LEN_PREFIX;
    while read < total {
        match reader.read(&mut frame[read..]) {
            Ok(0) => {
                return Err(PersistenceError::Truncated {
                    needed: total,
                    available: read,
                })
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(key: Option<&'static [u8]>) -> Record {
        Record {
            offset: 42,
            timestamp: 1_700_000_000_000,
            producer_id: "producer-a".to_string(),
            sequence: 7,
            key: key.map(Bytes::from_static),
            payload: Bytes::from_static(b"hello world"),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let record = sample(Some(b"user-1"));
        let frame = record.encode().unwrap();
        assert_eq!(frame.len(), record.encoded_len());

        let (decoded, consumed) = Record::decode(&frame).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_empty_key_is_not_absent_key() {
        let empty = Record::decode(&sample(Some(b"")).encode().unwrap()).unwrap().0;
        let absent = Record::decode(&sample(None).encode().unwrap()).unwrap().0;
        assert_eq!(empty.key, Some(Bytes::new()));
        assert_eq!(absent.key, None);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut frame = sample(None).encode().unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let result = Record::decode(&frame);
        assert!(matches!(result, Err(PersistenceError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_frame() {
        let frame = sample(Some(b"k")).encode().unwrap();
        let result = Record::decode(&frame[..frame.len() - 3]);
        assert!(matches!(result, Err(PersistenceError::Truncated { .. })));

        let result = Record::decode(&frame[..2]);
        assert!(matches!(result, Err(PersistenceError::Truncated { needed: 4, available: 2 })));
    }

    #[test]
    fn test_inconsistent_lengths_rejected() {
        let record = sample(None);
        let mut body = record.encode_body().unwrap();
        // Claim a longer payload than the body carries, with a valid checksum.
        let payload_len_at = 8 + 8 + 8 + 2 + 4;
        LittleEndian::write_u32(&mut body[payload_len_at..payload_len_at + 4], 999);

        let mut frame = Vec::new();
        frame.write_u32::<LittleEndian>((CHECKSUM_SIZE + body.len()) as u32).unwrap();
        frame.write_u64::<LittleEndian>(checksum(&body)).unwrap();
        frame.extend_from_slice(&body);

        assert!(matches!(Record::decode(&frame), Err(PersistenceError::InvalidFormat(_))));
    }

    #[test]
    fn test_read_frame_stream() {
        let a = sample(None).encode().unwrap();
        let b = sample(Some(b"k")).encode().unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);
        stream.extend_from_slice(&b[..5]);

        let mut reader = &stream[..];
        assert_eq!(read_frame(&mut reader, 1 << 20).unwrap(), Some(a));
        assert_eq!(read_frame(&mut reader, 1 << 20).unwrap(), Some(b));
        assert!(matches!(
            read_frame(&mut reader, 1 << 20),
            Err(PersistenceError::Truncated { .. })
        ));

        let mut empty: &[u8] = &[];
        assert_eq!(read_frame(&mut empty, 1 << 20).unwrap(), None);
    }

    #[test]
    fn test_read_frame_rejects_oversized_prefix() {
        let mut bogus = Vec::new();
        bogus.write_u32::<LittleEndian>(u32::MAX).unwrap();
        let result = read_frame(&bogus[..], 1024);
        assert!(matches!(result, Err(PersistenceError::InvalidFormat(_))));
    }
}
