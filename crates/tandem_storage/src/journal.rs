#![forbid(unsafe_code)]

//! Append-only JSONL journal backing the transaction ledger.
//!
//! Every accepted ledger mutation is written as one line before it is applied
//! in memory. Opening a store replays the file in order; the last `upsert`
//! for a transaction wins and `delete` lines remove rows pruned by retention.
//!
//! A final line without its newline is a write torn by a crash: it is dropped
//! and the file truncated. A bad line anywhere else is corruption and fails
//! the replay. [`LedgerJournal::compact`] rewrites the file as one `upsert`
//! per live row.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tandem_contracts::txlog::{TransactionId, TransactionLogRow};
use tracing::{debug, warn};

use crate::ledger::StorageError;

pub const LEDGER_JOURNAL_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerJournalEntry {
    Upsert { row: TransactionLogRow },
    Delete { transaction_id: TransactionId },
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerJournalLine<E> {
    schema_version: u32,
    entry: E,
}

enum LineError {
    Malformed(String),
    Unsupported(u32),
}

#[derive(Debug, Clone)]
pub struct LedgerJournal {
    path: PathBuf,
}

fn journal_error(path: &Path, action: &str, err: impl fmt::Display) -> StorageError {
    StorageError::Journal(format!("ledger journal '{}': {action}: {err}", path.display()))
}

fn encode_line(entry: &LedgerJournalEntry) -> Result<Vec<u8>, StorageError> {
    let mut line = serde_json::to_vec(&LedgerJournalLine {
        schema_version: LEDGER_JOURNAL_SCHEMA_VERSION,
        entry,
    })
    .map_err(|err| StorageError::Journal(format!("ledger journal entry not encodable: {err}")))?;
    line.push(b'\n');
    Ok(line)
}

fn decode_line(raw: &[u8]) -> Result<Option<LedgerJournalEntry>, LineError> {
    let text = std::str::from_utf8(raw).map_err(|e| LineError::Malformed(e.to_string()))?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    let line: LedgerJournalLine<LedgerJournalEntry> =
        serde_json::from_str(text).map_err(|e| LineError::Malformed(e.to_string()))?;
    if line.schema_version != LEDGER_JOURNAL_SCHEMA_VERSION {
        return Err(LineError::Unsupported(line.schema_version));
    }
    Ok(Some(line.entry))
}

impl LedgerJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| journal_error(parent, "create directory", err))?;
        }
        if !path.exists() {
            File::create(&path).map_err(|err| journal_error(&path, "create", err))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry in order, repairing a torn final line on disk.
    pub fn replay(&self) -> Result<Vec<LedgerJournalEntry>, StorageError> {
        let bytes = fs::read(&self.path).map_err(|err| journal_error(&self.path, "read", err))?;
        let mut entries = Vec::new();
        let mut offset = 0;
        let mut line_no = 0;
        while offset < bytes.len() {
            line_no += 1;
            let rest = &bytes[offset..];
            let (raw, terminated) = match rest.iter().position(|b| *b == b'\n') {
                Some(end) => (&rest[..end], true),
                None => (rest, false),
            };
            match decode_line(raw) {
                Ok(Some(entry)) => {
                    entries.push(entry);
                    if !terminated {
                        // Record is whole but its newline never reached disk.
                        self.write_synced(b"\n")?;
                    }
                }
                Ok(None) => {}
                Err(LineError::Malformed(reason)) if !terminated => {
                    warn!(
                        path = %self.path.display(),
                        line = line_no,
                        torn_bytes = raw.len(),
                        reason = %reason,
                        "dropping torn ledger journal tail"
                    );
                    self.truncate(offset as u64)?;
                    break;
                }
                Err(LineError::Malformed(reason)) => {
                    return Err(journal_error(
                        &self.path,
                        &format!("corrupt line {line_no}"),
                        reason,
                    ))
                }
                Err(LineError::Unsupported(version)) => {
                    return Err(journal_error(
                        &self.path,
                        &format!("line {line_no}"),
                        format!("unsupported schema_version={version}"),
                    ))
                }
            }
            offset += raw.len() + 1;
        }
        Ok(entries)
    }

    pub fn append(&self, entry: &LedgerJournalEntry) -> Result<(), StorageError> {
        self.write_synced(&encode_line(entry)?)
    }

    /// Replaces the journal with one `upsert` per row. The new file is synced
    /// under a sibling name and renamed over the old one, so a crash leaves
    /// either the old journal or the new one.
    pub fn compact<'a>(
        &self,
        rows: impl IntoIterator<Item = &'a TransactionLogRow>,
    ) -> Result<usize, StorageError> {
        let mut buf = Vec::new();
        let mut written = 0;
        for row in rows {
            buf.extend(encode_line(&LedgerJournalEntry::Upsert { row: row.clone() })?);
            written += 1;
        }
        let staged = self.compaction_path();
        let mut file =
            File::create(&staged).map_err(|err| journal_error(&staged, "create", err))?;
        file.write_all(&buf)
            .and_then(|_| file.sync_data())
            .map_err(|err| journal_error(&staged, "write", err))?;
        fs::rename(&staged, &self.path).map_err(|err| journal_error(&self.path, "replace", err))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
                debug!(path = %parent.display(), error = %err, "journal directory sync skipped");
            }
        }
        Ok(written)
    }

    fn compaction_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".compact");
        self.path.with_file_name(name)
    }

    fn write_synced(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|err| journal_error(&self.path, "open for append", err))?;
        file.write_all(bytes)
            .and_then(|_| file.sync_data())
            .map_err(|err| journal_error(&self.path, "append", err))
    }

    fn truncate(&self, len: u64) -> Result<(), StorageError> {
        OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|file| {
                file.set_len(len)?;
                file.sync_data()
            })
            .map_err(|err| journal_error(&self.path, "truncate torn tail", err))
    }
}
