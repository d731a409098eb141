//! Append-only journal log file
//!
//! Record format:
//! ```text
//! +--------+-----+---------+--------+
//! | Magic  | Tag | Payload | CRC32C |
//! | 4B     | 1B  | 8/16B   | 4B     |
//! +--------+-----+---------+--------+
//! ```
//!
//! The payload size is fixed per tag. A batch append writes all records and
//! syncs once; replay stops at the first torn record, so a batch interrupted
//! mid-write is dropped in its entirety on the next recovery.

use super::{Journal, JournalEntry};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tierio_common::{BlockId, Error, Result};
use tracing::warn;

/// Journal record magic number
const RECORD_MAGIC: u32 = 0x544A_524E; // "TJRN"

/// Record header size (magic + tag)
const RECORD_HEADER_SIZE: usize = 5;

const TAG_CONTAINER_ID_GENERATOR: u8 = 1;
const TAG_BLOCK_INFO: u8 = 2;
const TAG_DELETE_BLOCK: u8 = 3;

fn payload_size(tag: u8) -> Option<usize> {
    match tag {
        TAG_CONTAINER_ID_GENERATOR | TAG_DELETE_BLOCK => Some(8),
        TAG_BLOCK_INFO => Some(16),
        _ => None,
    }
}

fn encode_record(entry: &JournalEntry, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    let body_start = buf.len();
    match *entry {
        JournalEntry::ContainerIdGenerator { next_container_id } => {
            buf.push(TAG_CONTAINER_ID_GENERATOR);
            buf.extend_from_slice(&next_container_id.to_le_bytes());
        }
        JournalEntry::BlockInfo { block_id, length } => {
            buf.push(TAG_BLOCK_INFO);
            buf.extend_from_slice(&block_id.as_u64().to_le_bytes());
            buf.extend_from_slice(&length.to_le_bytes());
        }
        JournalEntry::DeleteBlock { block_id } => {
            buf.push(TAG_DELETE_BLOCK);
            buf.extend_from_slice(&block_id.as_u64().to_le_bytes());
        }
    }
    let crc = crc32c::crc32c(&buf[body_start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Decode one record from the front of `data`.
///
/// `Ok(Some((entry, len)))` consumes `len` bytes; `Ok(None)` means the data
/// is a torn or garbage tail and replay must stop; `Err` means the record is
/// well framed but carries a tag this master does not understand.
fn decode_record(data: &[u8]) -> Result<Option<(JournalEntry, usize)>> {
    if data.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != RECORD_MAGIC {
        return Ok(None);
    }
    let tag = data[4];
    let Some(payload_len) = payload_size(tag) else {
        return Err(Error::UnexpectedJournalEntry { tag });
    };
    let total_len = RECORD_HEADER_SIZE + payload_len + 4;
    if data.len() < total_len {
        return Ok(None);
    }
    let body = &data[4..RECORD_HEADER_SIZE + payload_len];
    let stored_crc = u32::from_le_bytes(
        data[RECORD_HEADER_SIZE + payload_len..total_len]
            .try_into()
            .unwrap(),
    );
    if crc32c::crc32c(body) != stored_crc {
        return Ok(None);
    }

    let payload = &data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_len];
    let entry = match tag {
        TAG_CONTAINER_ID_GENERATOR => JournalEntry::ContainerIdGenerator {
            next_container_id: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
        },
        TAG_BLOCK_INFO => JournalEntry::BlockInfo {
            block_id: BlockId::from(u64::from_le_bytes(payload[0..8].try_into().unwrap())),
            length: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
        },
        TAG_DELETE_BLOCK => JournalEntry::DeleteBlock {
            block_id: BlockId::from(u64::from_le_bytes(payload[0..8].try_into().unwrap())),
        },
        _ => unreachable!("payload_size accepted the tag"),
    };
    Ok(Some((entry, total_len)))
}

/// Append-only file journal.
pub struct JournalLog {
    file: Mutex<File>,
}

impl JournalLog {
    /// Open the log at `path`, creating it if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Read every committed entry from the start of the log.
    ///
    /// A torn tail (interrupted batch append) is dropped with a warning; an
    /// unknown record tag fails the replay.
    pub fn replay(&self) -> Result<Vec<JournalEntry>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            match decode_record(&data[offset..])? {
                Some((entry, len)) => {
                    entries.push(entry);
                    offset += len;
                }
                None => {
                    warn!(
                        "dropping {} bytes of torn journal tail",
                        data.len() - offset
                    );
                    break;
                }
            }
        }
        Ok(entries)
    }
}

impl Journal for JournalLog {
    fn append(&self, entries: &[JournalEntry]) -> Result<()> {
        let mut buf = Vec::with_capacity(entries.len() * 32);
        for entry in entries {
            encode_record(entry, &mut buf);
        }
        let mut file = self.file.lock();
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entries() -> Vec<JournalEntry> {
        vec![
            JournalEntry::ContainerIdGenerator {
                next_container_id: 1000,
            },
            JournalEntry::BlockInfo {
                block_id: BlockId::from(7),
                length: 1024,
            },
            JournalEntry::DeleteBlock {
                block_id: BlockId::from(7),
            },
        ]
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let log = JournalLog::open(&path).unwrap();
        log.append(&sample_entries()).unwrap();
        assert_eq!(log.replay().unwrap(), sample_entries());
    }

    #[test]
    fn test_reopen_preserves_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        {
            let log = JournalLog::open(&path).unwrap();
            log.append(&sample_entries()).unwrap();
        }

        let log = JournalLog::open(&path).unwrap();
        log.append(&[JournalEntry::BlockInfo {
            block_id: BlockId::from(9),
            length: 512,
        }])
        .unwrap();

        let entries = log.replay().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[3],
            JournalEntry::BlockInfo {
                block_id: BlockId::from(9),
                length: 512,
            }
        );
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let log = JournalLog::open(&path).unwrap();
        log.append(&sample_entries()).unwrap();
        drop(log);

        // Simulate a write interrupted mid-record.
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        data.push(TAG_BLOCK_INFO);
        data.extend_from_slice(&42u64.to_le_bytes());
        std::fs::write(&path, &data).unwrap();

        let log = JournalLog::open(&path).unwrap();
        assert_eq!(log.replay().unwrap(), sample_entries());
    }

    #[test]
    fn test_unknown_tag_fails_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let mut data = Vec::new();
        data.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        data.push(9);
        std::fs::write(&path, &data).unwrap();

        let log = JournalLog::open(&path).unwrap();
        let err = log.replay().unwrap_err();
        assert!(matches!(err, Error::UnexpectedJournalEntry { tag: 9 }));
    }

    #[test]
    fn test_corrupt_crc_stops_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let log = JournalLog::open(&path).unwrap();
        log.append(&sample_entries()).unwrap();
        drop(log);

        // Flip a payload byte of the last record.
        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data[len - 6] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let log = JournalLog::open(&path).unwrap();
        assert_eq!(log.replay().unwrap(), &sample_entries()[..2]);
    }
}
