use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tandem_contracts::txlog::{
    FileHash, TransactionId, TransactionLogRow, TransactionLogRowInput, TransactionLogUpdate,
    TransactionState,
};
use tandem_contracts::TimestampNs;
use tandem_storage::{StorageError, TransactionLedgerRepo, TransactionLedgerStore};

use crate::clock::ManualClock;
use crate::config::CoordinatorConfig;
use crate::coordinator::TransactionCoordinator;
use crate::storage::{ObjectBackend, ObjectStoreBackend, StorageParticipant, StorageParticipantError};

pub(crate) const T0: TimestampNs = TimestampNs(1_700_000_000_000_000_000);
pub(crate) const TIMEOUT: Duration = Duration::from_secs(600);

/// In-memory backend with switchable outages and call counters.
pub(crate) struct FaultyBackend {
    inner: ObjectStoreBackend,
    pub fail_put: AtomicBool,
    pub fail_copy: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_head: AtomicBool,
    pub fail_list: AtomicBool,
    pub put_calls: AtomicUsize,
    pub copy_calls: AtomicUsize,
}

impl FaultyBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: ObjectStoreBackend::in_memory(),
            fail_put: AtomicBool::new(false),
            fail_copy: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_head: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            put_calls: AtomicUsize::new(0),
            copy_calls: AtomicUsize::new(0),
        })
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<(), StorageParticipantError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageParticipantError::Unavailable(format!(
                "injected {op} outage"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for FaultyBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageParticipantError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_put, "put")?;
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageParticipantError> {
        self.inner.get(key).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageParticipantError> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_copy, "copy")?;
        self.inner.copy(from, to).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageParticipantError> {
        Self::check(&self.fail_delete, "delete")?;
        self.inner.delete(key).await
    }

    async fn head(&self, key: &str) -> Result<Option<u64>, StorageParticipantError> {
        Self::check(&self.fail_head, "head")?;
        self.inner.head(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageParticipantError> {
        Self::check(&self.fail_list, "list")?;
        self.inner.list(prefix).await
    }
}

/// Ledger whose next `fail_updates` updates fail like a lost journal.
#[derive(Default)]
pub(crate) struct FlakyLedger {
    inner: TransactionLedgerStore,
    pub fail_updates: usize,
}

impl TransactionLedgerRepo for FlakyLedger {
    fn insert_transaction_row(
        &mut self,
        input: TransactionLogRowInput,
    ) -> Result<TransactionLogRow, StorageError> {
        self.inner.insert_transaction_row(input)
    }

    fn apply_transaction_update(
        &mut self,
        update: TransactionLogUpdate,
        now: TimestampNs,
    ) -> Result<TransactionLogRow, StorageError> {
        if self.fail_updates > 0 {
            self.fail_updates -= 1;
            return Err(StorageError::Journal("injected journal outage".to_string()));
        }
        self.inner.apply_transaction_update(update, now)
    }

    fn delete_terminal_rows_older_than(
        &mut self,
        cutoff: TimestampNs,
    ) -> Result<usize, StorageError> {
        self.inner.delete_terminal_rows_older_than(cutoff)
    }

    fn transaction_row(&self, transaction_id: &TransactionId) -> Option<&TransactionLogRow> {
        self.inner.transaction_row(transaction_id)
    }

    fn transaction_row_by_hash_and_state(
        &self,
        file_hash: &FileHash,
        state: TransactionState,
    ) -> Option<&TransactionLogRow> {
        self.inner.transaction_row_by_hash_and_state(file_hash, state)
    }

    fn transaction_row_by_staging_key(&self, staging_key: &str) -> Option<&TransactionLogRow> {
        self.inner.transaction_row_by_staging_key(staging_key)
    }

    fn transaction_rows_by_state(&self, state: TransactionState) -> Vec<&TransactionLogRow> {
        self.inner.transaction_rows_by_state(state)
    }

    fn timed_out_transaction_rows(&self, now: TimestampNs) -> Vec<&TransactionLogRow> {
        self.inner.timed_out_transaction_rows(now)
    }

    fn transaction_rows(&self) -> Vec<&TransactionLogRow> {
        self.inner.transaction_rows()
    }
}

pub(crate) struct Harness<R = TransactionLedgerStore> {
    pub coordinator: TransactionCoordinator<R>,
    pub backend: Arc<FaultyBackend>,
    pub clock: Arc<ManualClock>,
}

pub(crate) fn harness() -> Harness {
    harness_with(TransactionLedgerStore::new_in_memory())
}

pub(crate) fn harness_with<R>(ledger: R) -> Harness<R>
where
    R: TransactionLedgerRepo + Send + 'static,
{
    let backend = FaultyBackend::new();
    let clock = Arc::new(ManualClock::new(T0));
    let coordinator = TransactionCoordinator::new(
        Arc::new(Mutex::new(ledger)),
        StorageParticipant::new(backend.clone(), "import-files"),
        clock.clone(),
        CoordinatorConfig {
            transaction_timeout: TIMEOUT,
        },
    );
    Harness {
        coordinator,
        backend,
        clock,
    }
}
