#![forbid(unsafe_code)]

use tandem_contracts::txlog::{
    FileHash, TransactionId, TransactionLogRow, TransactionLogRowInput, TransactionLogUpdate,
    TransactionState,
};
use tandem_contracts::TimestampNs;

use crate::ledger::{StorageError, TransactionLedgerStore};

/// Typed repository interface for the transaction ledger.
pub trait TransactionLedgerRepo {
    fn insert_transaction_row(
        &mut self,
        input: TransactionLogRowInput,
    ) -> Result<TransactionLogRow, StorageError>;

    fn apply_transaction_update(
        &mut self,
        update: TransactionLogUpdate,
        now: TimestampNs,
    ) -> Result<TransactionLogRow, StorageError>;

    fn delete_terminal_rows_older_than(&mut self, cutoff: TimestampNs)
        -> Result<usize, StorageError>;

    fn transaction_row(&self, transaction_id: &TransactionId) -> Option<&TransactionLogRow>;
    fn transaction_row_by_hash_and_state(
        &self,
        file_hash: &FileHash,
        state: TransactionState,
    ) -> Option<&TransactionLogRow>;
    fn transaction_row_by_staging_key(&self, staging_key: &str) -> Option<&TransactionLogRow>;
    fn transaction_rows_by_state(&self, state: TransactionState) -> Vec<&TransactionLogRow>;
    fn timed_out_transaction_rows(&self, now: TimestampNs) -> Vec<&TransactionLogRow>;
    fn transaction_rows(&self) -> Vec<&TransactionLogRow>;
}

impl TransactionLedgerRepo for TransactionLedgerStore {
    fn insert_transaction_row(
        &mut self,
        input: TransactionLogRowInput,
    ) -> Result<TransactionLogRow, StorageError> {
        TransactionLedgerStore::insert_transaction_row(self, input)
    }

    fn apply_transaction_update(
        &mut self,
        update: TransactionLogUpdate,
        now: TimestampNs,
    ) -> Result<TransactionLogRow, StorageError> {
        TransactionLedgerStore::apply_transaction_update(self, update, now)
    }

    fn delete_terminal_rows_older_than(
        &mut self,
        cutoff: TimestampNs,
    ) -> Result<usize, StorageError> {
        TransactionLedgerStore::delete_terminal_rows_older_than(self, cutoff)
    }

    fn transaction_row(&self, transaction_id: &TransactionId) -> Option<&TransactionLogRow> {
        TransactionLedgerStore::transaction_row(self, transaction_id)
    }

    fn transaction_row_by_hash_and_state(
        &self,
        file_hash: &FileHash,
        state: TransactionState,
    ) -> Option<&TransactionLogRow> {
        TransactionLedgerStore::transaction_row_by_hash_and_state(self, file_hash, state)
    }

    fn transaction_row_by_staging_key(&self, staging_key: &str) -> Option<&TransactionLogRow> {
        TransactionLedgerStore::transaction_row_by_staging_key(self, staging_key)
    }

    fn transaction_rows_by_state(&self, state: TransactionState) -> Vec<&TransactionLogRow> {
        TransactionLedgerStore::transaction_rows_by_state(self, state)
    }

    fn timed_out_transaction_rows(&self, now: TimestampNs) -> Vec<&TransactionLogRow> {
        TransactionLedgerStore::timed_out_transaction_rows(self, now)
    }

    fn transaction_rows(&self) -> Vec<&TransactionLogRow> {
        TransactionLedgerStore::transaction_rows(self)
    }
}
