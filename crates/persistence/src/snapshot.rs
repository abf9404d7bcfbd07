//! Checksummed snapshot container used for producer state and consumer offsets.

use crate::error::{PersistenceError, Result};
use crate::record::checksum;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SnapshotKind {
    Producers = 1,
    Consumers = 2,
}

impl SnapshotKind {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Producers),
            2 => Ok(Self::Consumers),
            other => Err(PersistenceError::InvalidFormat(format!(
                "unknown snapshot kind {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub kind: SnapshotKind,
    /// High-water offset of the log when the snapshot was taken.
    pub as_of: u64,
    pub timestamp: u64,
    pub body_checksum: u64,
    pub body_len: u32,
}

impl SnapshotHeader {
    pub const SIZE: usize = 4 + 4 + 4 + 8 + 8 + 8 + 4; // 40 bytes
    pub const MAGIC: [u8; 4] = *b"EVSN";
    pub const VERSION: u32 = 1;

    pub fn new(kind: SnapshotKind, as_of: u64, timestamp: u64, body: &[u8]) -> Result<Self> {
        let body_len = u32::try_from(body.len()).map_err(|_| {
            PersistenceError::InvalidFormat(format!("snapshot body of {} bytes is too large", body.len()))
        })?;
        Ok(Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            kind,
            as_of,
            timestamp,
            body_checksum: checksum(body),
            body_len,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[12..20].copy_from_slice(&self.as_of.to_le_bytes());
        buf[20..28].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[28..36].copy_from_slice(&self.body_checksum.to_le_bytes());
        buf[36..40].copy_from_slice(&self.body_len.to_le_bytes());
        buf
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => PersistenceError::Truncated {
                needed: Self::SIZE,
                available: 0,
            },
            _ => PersistenceError::IoError(e),
        })?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != Self::MAGIC {
            return Err(PersistenceError::InvalidMagic);
        }

        let version = u32::from_le_bytes(le4(&buf[4..8]));
        if version != Self::VERSION {
            return Err(PersistenceError::InvalidFormat(format!(
                "unsupported snapshot version {}",
                version
            )));
        }

        Ok(Self {
            magic,
            version,
            kind: SnapshotKind::from_u32(u32::from_le_bytes(le4(&buf[8..12])))?,
            as_of: u64::from_le_bytes(le8(&buf[12..20])),
            timestamp: u64::from_le_bytes(le8(&buf[20..28])),
            body_checksum: u64::from_le_bytes(le8(&buf[28..36])),
            body_len: u32::from_le_bytes(le4(&buf[36..40])),
        })
    }
}

fn le4(s: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(s);
    out
}

fn le8(s: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(s);
    out
}

/// Atomically replace `path` with a snapshot of `body`.
pub fn write_to(path: impl AsRef<Path>, header: &SnapshotHeader, body: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&header.to_bytes())?;
        file.write_all(body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    // The rename is only durable once the directory is synced.
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// Read and verify a snapshot. Returns `Ok(None)` if the file does not exist.
pub fn read_snapshot(
    path: impl AsRef<Path>,
    expected: SnapshotKind,
) -> Result<Option<(SnapshotHeader, Vec<u8>)>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let header = SnapshotHeader::read_from(&mut file)?;
    if header.kind != expected {
        return Err(PersistenceError::InvalidFormat(format!(
            "expected {:?} snapshot, found {:?}",
            expected, header.kind
        )));
    }

    let mut body = Vec::with_capacity(header.body_len as usize);
    file.read_to_end(&mut body)?;
    if body.len() != header.body_len as usize {
        return Err(PersistenceError::Truncated {
            needed: header.body_len as usize,
            available: body.len(),
        });
    }
    let found = checksum(&body);
    if found != header.body_checksum {
        return Err(PersistenceError::ChecksumMismatch {
            expected: header.body_checksum,
            found,
        });
    }
    Ok(Some((header, body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_header_serialization() {
        let header = SnapshotHeader::new(SnapshotKind::Producers, 100, 1234567890, b"body").unwrap();
        let bytes = header.to_bytes();

        let mut reader = &bytes[..];
        let decoded = SnapshotHeader::read_from(&mut reader).unwrap();

        assert_eq!(header, decoded);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = [0u8; SnapshotHeader::SIZE];
        bytes[0..4].copy_from_slice(b"BADM");
        let mut reader = &bytes[..];
        let result = SnapshotHeader::read_from(&mut reader);
        assert!(matches!(result, Err(PersistenceError::InvalidMagic)));
    }

    #[test]
    fn test_write_and_read_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("consumers.offsets");
        let body = br#"{"sink-a":12}"#;
        let header = SnapshotHeader::new(SnapshotKind::Consumers, 13, 0, body).unwrap();
        write_to(&path, &header, body).unwrap();

        let (read_back, read_body) = read_snapshot(&path, SnapshotKind::Consumers).unwrap().unwrap();
        assert_eq!(read_back, header);
        assert_eq!(read_back.as_of, 13);
        assert_eq!(read_body, body.to_vec());
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempdir().unwrap();
        let result = read_snapshot(dir.path().join("nope"), SnapshotKind::Producers).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_corrupt_body_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("producers.snapshot");
        let body = b"0123456789";
        let header = SnapshotHeader::new(SnapshotKind::Producers, 1, 0, body).unwrap();
        write_to(&path, &header, body).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let result = read_snapshot(&path, SnapshotKind::Producers);
        assert!(matches!(result, Err(PersistenceError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("producers.snapshot");
        let header = SnapshotHeader::new(SnapshotKind::Producers, 1, 0, b"").unwrap();
        write_to(&path, &header, b"").unwrap();

        let result = read_snapshot(&path, SnapshotKind::Consumers);
        assert!(matches!(result, Err(PersistenceError::InvalidFormat(_))));
    }
}
