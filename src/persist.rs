//! Queue journal — append-only persistence with replay
//!
//! One file per durable queue. Records are little-endian u32
//! length-prefixed: `{op u8, idLen u16 LE, id, msgLen u32 LE, msgBytes}`
//! with `op` Insert=1 or Remove=2; Remove records carry `msgLen` 0 and
//! cancel a prior Insert by id. Message bytes are the wire encoding of
//! the frame. A valid file is either empty or a sequence of complete
//! records; a truncated tail is discarded on replay. The file is owned
//! exclusively by its queue's actor.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codec;
use crate::error::{HmqError, Result};
use crate::message::Message;

const OP_INSERT: u8 = 1;
const OP_REMOVE: u8 = 2;

/// File extension for queue journals
pub const JOURNAL_EXTENSION: &str = "hmq";

/// Append-only journal for one queue
pub struct QueueJournal {
    path: PathBuf,
    file: File,
    /// Insert records in the file, live or not
    records: u64,
    /// Remove records in the file
    tombstones: u64,
}

impl QueueJournal {
    /// Journal file path for a queue inside `dir`
    pub fn path_for(dir: &Path, queue: &str) -> PathBuf {
        dir.join(format!("{}.{}", queue, JOURNAL_EXTENSION))
    }

    /// Open (or create) the journal for `queue` and replay its records.
    /// Returns the journal plus the surviving messages in insertion order.
    pub fn open(dir: &Path, queue: &str) -> Result<(Self, Vec<Message>)> {
        std::fs::create_dir_all(dir).map_err(|e| {
            HmqError::Persistence(format!(
                "Failed to create journal directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        let path = Self::path_for(dir, queue);

        let (messages, records, tombstones) = match std::fs::read(&path) {
            Ok(bytes) => replay(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), 0, 0),
            Err(e) => {
                return Err(HmqError::Persistence(format!(
                    "Failed to read journal {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                HmqError::Persistence(format!(
                    "Failed to open journal {}: {}",
                    path.display(),
                    e
                ))
            })?;

        if !messages.is_empty() {
            tracing::info!(
                queue = %queue,
                count = messages.len(),
                path = %path.display(),
                "Journal replayed"
            );
        }

        Ok((
            Self {
                path,
                file,
                records,
                tombstones,
            },
            messages,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an Insert record for the message
    pub fn insert(&mut self, message: &Message) -> Result<()> {
        let frame = codec::encode(message)?;
        self.append(OP_INSERT, &message.id, &frame)?;
        self.records += 1;
        Ok(())
    }

    /// Append a Remove record cancelling a prior Insert
    pub fn remove(&mut self, id: &str) -> Result<()> {
        self.append(OP_REMOVE, id, &[])?;
        self.tombstones += 1;
        Ok(())
    }

    /// Whether more than half of the inserted records are tombstoned
    pub fn should_compact(&self) -> bool {
        self.tombstones * 2 > self.records
    }

    /// Rewrite the file to hold only `live` messages.
    /// Atomic via temp file + rename.
    pub fn compact<'a>(&mut self, live: impl Iterator<Item = &'a Message>) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let mut buf = Vec::new();
        let mut records = 0u64;
        for message in live {
            let frame = codec::encode(message)?;
            encode_record(&mut buf, OP_INSERT, &message.id, &frame);
            records += 1;
        }

        std::fs::write(&tmp_path, &buf).map_err(|e| {
            HmqError::Persistence(format!(
                "Failed to write journal {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            HmqError::Persistence(format!(
                "Failed to rename journal {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                HmqError::Persistence(format!(
                    "Failed to reopen journal {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        self.records = records;
        self.tombstones = 0;
        tracing::debug!(path = %self.path.display(), records, "Journal compacted");
        Ok(())
    }

    /// Delete the journal file (queue removed). The open handle stays
    /// valid but writes go to an unlinked file.
    pub fn delete_file(&self) -> Result<()> {
        std::fs::remove_file(&self.path).map_err(|e| {
            HmqError::Persistence(format!(
                "Failed to delete journal {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn append(&mut self, op: u8, id: &str, frame: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(11 + id.len() + frame.len());
        encode_record(&mut buf, op, id, frame);
        self.file.write_all(&buf).map_err(|e| {
            HmqError::Persistence(format!(
                "Failed to append to journal {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

fn encode_record(buf: &mut Vec<u8>, op: u8, id: &str, frame: &[u8]) {
    let body_len = 1 + 2 + id.len() + 4 + frame.len();
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.push(op);
    buf.extend_from_slice(&(id.len() as u16).to_le_bytes());
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
    buf.extend_from_slice(frame);
}

/// Replay journal bytes into the surviving ordered messages plus the
/// insert/tombstone record counts. Stops at the first incomplete or
/// malformed record.
fn replay(bytes: &[u8]) -> (Vec<Message>, u64, u64) {
    let mut entries: Vec<(String, Option<Message>)> = Vec::new();
    let mut records = 0u64;
    let mut tombstones = 0u64;
    let mut pos = 0usize;

    loop {
        if bytes.len() < pos + 4 {
            break;
        }
        let body_len =
            u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
                as usize;
        let body_start = pos + 4;
        if bytes.len() < body_start + body_len || body_len < 7 {
            break;
        }
        let body = &bytes[body_start..body_start + body_len];

        let op = body[0];
        let id_len = u16::from_le_bytes([body[1], body[2]]) as usize;
        if body.len() < 3 + id_len + 4 {
            break;
        }
        let Ok(id) = std::str::from_utf8(&body[3..3 + id_len]) else {
            break;
        };
        let msg_start = 3 + id_len + 4;
        let msg_len = u32::from_le_bytes([
            body[3 + id_len],
            body[4 + id_len],
            body[5 + id_len],
            body[6 + id_len],
        ]) as usize;
        if body.len() < msg_start + msg_len {
            break;
        }

        match op {
            OP_INSERT => {
                let Ok(Some((message, _))) = codec::decode(&body[msg_start..msg_start + msg_len])
                else {
                    break;
                };
                entries.push((id.to_string(), Some(message)));
                records += 1;
            }
            OP_REMOVE => {
                for entry in entries.iter_mut() {
                    if entry.0 == id && entry.1.is_some() {
                        entry.1 = None;
                        break;
                    }
                }
                tombstones += 1;
            }
            _ => break,
        }
        pos = body_start + body_len;
    }

    let messages = entries.into_iter().filter_map(|(_, m)| m).collect();
    (messages, records, tombstones)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, content: &str) -> Message {
        let mut message = Message::queue("orders", 1001);
        message.set_id(id);
        message.set_string_content(content);
        message
    }

    #[test]
    fn test_replay_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut journal, replayed) = QueueJournal::open(dir.path(), "orders").unwrap();
            assert!(replayed.is_empty());
            journal.insert(&message("m1", "one")).unwrap();
            journal.insert(&message("m2", "two")).unwrap();
            journal.insert(&message("m3", "three")).unwrap();
            journal.remove("m2").unwrap();
        }

        let (_journal, replayed) = QueueJournal::open(dir.path(), "orders").unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, "m1");
        assert_eq!(replayed[1].id, "m3");
        assert_eq!(replayed[1].content_string(), "three");
    }

    #[test]
    fn test_truncated_tail_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut journal, _) = QueueJournal::open(dir.path(), "orders").unwrap();
            journal.insert(&message("m1", "one")).unwrap();
            journal.insert(&message("m2", "two")).unwrap();
        }

        // Chop bytes off the last record
        let path = QueueJournal::path_for(dir.path(), "orders");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let (_journal, replayed) = QueueJournal::open(dir.path(), "orders").unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, "m1");
    }

    #[test]
    fn test_should_compact_past_half_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let (mut journal, _) = QueueJournal::open(dir.path(), "orders").unwrap();

        for i in 0..4 {
            journal.insert(&message(&format!("m{}", i), "x")).unwrap();
        }
        assert!(!journal.should_compact());

        for i in 0..3 {
            journal.remove(&format!("m{}", i)).unwrap();
        }
        assert!(journal.should_compact());
    }

    #[test]
    fn test_compact_drops_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let live = [message("m3", "three"), message("m4", "four")];
        {
            let (mut journal, _) = QueueJournal::open(dir.path(), "orders").unwrap();
            for i in 0..5 {
                journal.insert(&message(&format!("m{}", i), "x")).unwrap();
            }
            for i in 0..3 {
                journal.remove(&format!("m{}", i)).unwrap();
            }
            journal.compact(live.iter()).unwrap();
            assert!(!journal.should_compact());

            // The compacted journal keeps accepting appends
            journal.insert(&message("m5", "five")).unwrap();
        }

        let (_journal, replayed) = QueueJournal::open(dir.path(), "orders").unwrap();
        let ids: Vec<&str> = replayed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m3", "m4", "m5"]);
    }

    #[test]
    fn test_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = QueueJournal::open(dir.path(), "orders").unwrap();
        let path = journal.path().to_path_buf();
        assert!(path.exists());
        journal.delete_file().unwrap();
        assert!(!path.exists());
    }
}
