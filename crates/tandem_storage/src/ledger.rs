#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use tandem_contracts::txlog::{
    FileHash, TransactionId, TransactionLogRow, TransactionLogRowInput, TransactionLogUpdate,
    TransactionState,
};
use tandem_contracts::{ContractViolation, TimestampNs, Validate};
use tracing::{debug, info, warn};

use crate::journal::{LedgerJournal, LedgerJournalEntry};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("row not found in {table}: {key}")]
    NotFound { table: &'static str, key: String },
    #[error("stale revision for {transaction_id}: expected {expected}, found {found}")]
    StaleRevision {
        transaction_id: TransactionId,
        expected: u64,
        found: u64,
    },
    #[error("illegal transition for {transaction_id}: {from} -> {to}")]
    IllegalTransition {
        transaction_id: TransactionId,
        from: TransactionState,
        to: TransactionState,
    },
    #[error("transaction {transaction_id} is {state} and can no longer change")]
    TerminalRowImmutable {
        transaction_id: TransactionId,
        state: TransactionState,
    },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
    #[error("{0}")]
    Journal(String),
}

const TXLOG_TABLE: &str = "transaction_log";

/// Transaction ledger: one row per import transaction plus the two lookups the
/// coordinator and sweeper need (by content hash, by staging key).
#[derive(Debug, Default)]
pub struct TransactionLedgerStore {
    rows: BTreeMap<TransactionId, TransactionLogRow>,
    file_hash_index: BTreeMap<FileHash, BTreeSet<TransactionId>>,
    staging_key_index: BTreeMap<String, TransactionId>,
    journal: Option<LedgerJournal>,
}

impl TransactionLedgerStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    /// Opens (or creates) a journal-backed ledger and replays it.
    pub fn open_with_journal(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let journal = LedgerJournal::open(path)?;
        let mut store = Self::default();
        let entries = journal.replay()?;
        let replayed = entries.len();
        for entry in entries {
            match entry {
                LedgerJournalEntry::Upsert { row } => {
                    row.validate()?;
                    store.put_row(row);
                }
                LedgerJournalEntry::Delete { transaction_id } => {
                    store.remove_row(&transaction_id);
                }
            }
        }
        info!(
            path = %journal.path().display(),
            entries = replayed,
            rows = store.rows.len(),
            "transaction ledger journal replayed"
        );
        store.journal = Some(journal);
        if replayed > store.rows.len() {
            store.compact_journal();
        }
        Ok(store)
    }

    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    pub fn insert_transaction_row(
        &mut self,
        input: TransactionLogRowInput,
    ) -> Result<TransactionLogRow, StorageError> {
        if self.rows.contains_key(&input.transaction_id) {
            return Err(StorageError::DuplicateKey {
                table: "transaction_log.transaction_id",
                key: input.transaction_id.to_string(),
            });
        }
        let row = TransactionLogRow::from_input_v1(input)?;
        self.write_journal(LedgerJournalEntry::Upsert { row: row.clone() })?;
        self.put_row(row.clone());
        Ok(row)
    }

    pub fn transaction_row(&self, transaction_id: &TransactionId) -> Option<&TransactionLogRow> {
        self.rows.get(transaction_id)
    }

    pub fn transaction_rows(&self) -> Vec<&TransactionLogRow> {
        self.rows.values().collect()
    }

    /// Oldest row carrying `file_hash` in `state`.
    pub fn transaction_row_by_hash_and_state(
        &self,
        file_hash: &FileHash,
        state: TransactionState,
    ) -> Option<&TransactionLogRow> {
        self.file_hash_index
            .get(file_hash)?
            .iter()
            .filter_map(|id| self.rows.get(id))
            .filter(|row| row.state == state)
            .min_by_key(|row| (row.created_at, row.transaction_id.clone()))
    }

    pub fn transaction_row_by_staging_key(&self, staging_key: &str) -> Option<&TransactionLogRow> {
        self.staging_key_index
            .get(staging_key)
            .and_then(|id| self.rows.get(id))
    }

    pub fn transaction_rows_by_state(&self, state: TransactionState) -> Vec<&TransactionLogRow> {
        let mut out: Vec<&TransactionLogRow> =
            self.rows.values().filter(|row| row.state == state).collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        out
    }

    /// Non-terminal rows whose deadline passed strictly before `now`, oldest first.
    pub fn timed_out_transaction_rows(&self, now: TimestampNs) -> Vec<&TransactionLogRow> {
        let mut out: Vec<&TransactionLogRow> =
            self.rows.values().filter(|row| row.is_timed_out(now)).collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        out
    }

    pub fn count_active_transaction_rows(&self) -> usize {
        self.rows.values().filter(|row| !row.is_terminal()).count()
    }

    /// Compare-and-set on `expected_revision`. Terminal rows never change and
    /// state moves must follow the transition table.
    pub fn apply_transaction_update(
        &mut self,
        update: TransactionLogUpdate,
        now: TimestampNs,
    ) -> Result<TransactionLogRow, StorageError> {
        let current = self
            .rows
            .get(&update.transaction_id)
            .ok_or_else(|| StorageError::NotFound {
                table: TXLOG_TABLE,
                key: update.transaction_id.to_string(),
            })?;
        if current.revision != update.expected_revision {
            return Err(StorageError::StaleRevision {
                transaction_id: update.transaction_id.clone(),
                expected: update.expected_revision,
                found: current.revision,
            });
        }
        if current.is_terminal() {
            return Err(StorageError::TerminalRowImmutable {
                transaction_id: update.transaction_id.clone(),
                state: current.state,
            });
        }
        if let Some(next) = update.next_state {
            if !current.state.can_transition_to(next) {
                return Err(StorageError::IllegalTransition {
                    transaction_id: update.transaction_id.clone(),
                    from: current.state,
                    to: next,
                });
            }
        }
        let next_row = update.apply_to(current, now)?;
        debug!(
            transaction_id = %next_row.transaction_id,
            from = %current.state,
            to = %next_row.state,
            revision = next_row.revision,
            "transaction ledger row updated"
        );
        self.write_journal(LedgerJournalEntry::Upsert {
            row: next_row.clone(),
        })?;
        self.put_row(next_row.clone());
        Ok(next_row)
    }

    /// Retention: drops COMMITTED/ABORTED rows last touched before `cutoff`.
    pub fn delete_terminal_rows_older_than(
        &mut self,
        cutoff: TimestampNs,
    ) -> Result<usize, StorageError> {
        let expired: Vec<TransactionId> = self
            .rows
            .values()
            .filter(|row| row.is_terminal() && row.updated_at < cutoff)
            .map(|row| row.transaction_id.clone())
            .collect();
        for transaction_id in &expired {
            self.write_journal(LedgerJournalEntry::Delete {
                transaction_id: transaction_id.clone(),
            })?;
            self.remove_row(transaction_id);
        }
        if !expired.is_empty() {
            self.compact_journal();
        }
        Ok(expired.len())
    }

    /// Tombstones are already durable, so a failed rewrite only costs space.
    fn compact_journal(&self) {
        let Some(journal) = &self.journal else {
            return;
        };
        match journal.compact(self.rows.values()) {
            Ok(rows) => debug!(path = %journal.path().display(), rows, "ledger journal compacted"),
            Err(e) => warn!(error = %e, "ledger journal compaction failed; keeping append log"),
        }
    }

    fn write_journal(&self, entry: LedgerJournalEntry) -> Result<(), StorageError> {
        match &self.journal {
            Some(journal) => journal.append(&entry),
            None => Ok(()),
        }
    }

    fn put_row(&mut self, row: TransactionLogRow) {
        self.file_hash_index
            .entry(row.file_hash.clone())
            .or_default()
            .insert(row.transaction_id.clone());
        if let Some(key) = &row.staging_object_key {
            self.staging_key_index
                .insert(key.clone(), row.transaction_id.clone());
        }
        self.rows.insert(row.transaction_id.clone(), row);
    }

    fn remove_row(&mut self, transaction_id: &TransactionId) {
        let Some(row) = self.rows.remove(transaction_id) else {
            return;
        };
        if let Some(ids) = self.file_hash_index.get_mut(&row.file_hash) {
            ids.remove(transaction_id);
            if ids.is_empty() {
                self.file_hash_index.remove(&row.file_hash);
            }
        }
        if let Some(key) = &row.staging_object_key {
            if self.staging_key_index.get(key) == Some(transaction_id) {
                self.staging_key_index.remove(key);
            }
        }
    }
}
