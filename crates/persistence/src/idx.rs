//! Sparse index file format.
//!
//! A flat array of 16-byte entries, `[offset: u64][position: u64]`, appended
//! as the owning segment grows. There is no header: a file whose length is not
//! a multiple of [`IndexEntry::SIZE`] has a torn last entry.

use crate::error::{PersistenceError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub position: u64,
}

impl IndexEntry {
    pub const SIZE: usize = 8 + 8;

    pub fn read_from<R: io::Read>(mut reader: R) -> Result<Self> {
        let offset = reader.read_u64::<LittleEndian>()?;
        let position = reader.read_u64::<LittleEndian>()?;
        Ok(Self { offset, position })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.position.to_le_bytes());
        buf
    }
}

/// Append one entry. The caller decides when to sync.
pub fn append_entry<W: Write>(mut writer: W, entry: IndexEntry) -> Result<()> {
    writer.write_u64::<LittleEndian>(entry.offset)?;
    writer.write_u64::<LittleEndian>(entry.position)?;
    Ok(())
}

/// Read every entry in the file, validating that both fields strictly increase.
pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<IndexEntry>> {
    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len % IndexEntry::SIZE != 0 {
        return Err(PersistenceError::Truncated {
            needed: len.next_multiple_of(IndexEntry::SIZE),
            available: len,
        });
    }

    let mut reader = BufReader::new(file);
    let mut entries: Vec<IndexEntry> = Vec::with_capacity(len / IndexEntry::SIZE);
    for _ in 0..len / IndexEntry::SIZE {
        let entry = IndexEntry::read_from(&mut reader)?;
        if let Some(prev) = entries.last() {
            if entry.offset <= prev.offset || entry.position <= prev.position {
                return Err(PersistenceError::InvalidFormat(format!(
                    "index entry ({}, {}) does not follow ({}, {})",
                    entry.offset, entry.position, prev.offset, prev.position
                )));
            }
        }
        entries.push(entry);
    }

    Ok(entries)
}

/// Replace the file with exactly `entries`, durably.
///
/// Writes a sibling temp file, syncs it, then renames over the target so a
/// crash leaves either the old or the new index, never a mix.
pub fn write_all(path: impl AsRef<Path>, entries: &[IndexEntry]) -> Result<()> {
    let path = path.as_ref();
    let tmp_path = path.with_extension("index.tmp");
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            writer.write_all(&entry.to_bytes())?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
