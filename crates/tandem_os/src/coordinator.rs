#![forbid(unsafe_code)]

//! Two-phase commit across the transaction ledger and the object store.
//!
//! Ledger writes happen under a short synchronous lock; object-store calls
//! happen outside it. Every operation re-reads its row and every update names
//! the revision it read, so a row touched concurrently (for example by the
//! recovery sweeper) surfaces as [`CoordinatorError::ConcurrentModification`]
//! instead of a lost update.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tandem_contracts::txlog::{
    final_object_key, TransactionId, TransactionLogRow, TransactionLogRowInput,
    TransactionLogUpdate, TransactionState,
};
use tandem_contracts::{ContractViolation, TimestampNs};
use tandem_storage::{StorageError, TransactionLedgerRepo};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::idempotency::{check_hash, file_hash_of, IdempotencyCheck};
use crate::storage::{CleanupOutcome, StorageParticipant, StorageParticipantError};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("prepare failed for {transaction_id}: {reason}")]
    PrepareFailure {
        transaction_id: TransactionId,
        reason: String,
    },
    #[error("transaction not found: {0}")]
    NotFound(TransactionId),
    #[error("{operation} rejected for {transaction_id}: state is {state}, expected {expected}")]
    InvalidState {
        transaction_id: TransactionId,
        operation: &'static str,
        state: TransactionState,
        expected: &'static str,
    },
    #[error("transaction {0} was modified concurrently")]
    ConcurrentModification(TransactionId),
    #[error("transaction ledger unavailable: {0}")]
    LedgerUnavailable(String),
    #[error(transparent)]
    Ledger(StorageError),
    #[error(transparent)]
    Storage(#[from] StorageParticipantError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

impl From<StorageError> for CoordinatorError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::StaleRevision { transaction_id, .. } => {
                CoordinatorError::ConcurrentModification(transaction_id)
            }
            StorageError::Journal(msg) => CoordinatorError::LedgerUnavailable(msg),
            other => CoordinatorError::Ledger(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    Started(TransactionLogRow),
    /// Identical bytes were committed before; the caller must not write again.
    AlreadyCommitted(TransactionLogRow),
}

impl BeginOutcome {
    pub fn row(&self) -> &TransactionLogRow {
        match self {
            BeginOutcome::Started(row) | BeginOutcome::AlreadyCommitted(row) => row,
        }
    }

    pub fn is_already_committed(&self) -> bool {
        matches!(self, BeginOutcome::AlreadyCommitted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(TransactionLogRow),
    /// The domain write is durable but storage finalize did not complete. The
    /// row stays COMMITTING and recovery will finish it.
    Uncertain {
        row: TransactionLogRow,
        reason: String,
    },
}

impl CommitOutcome {
    pub fn row(&self) -> &TransactionLogRow {
        match self {
            CommitOutcome::Committed(row) | CommitOutcome::Uncertain { row, .. } => row,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortOutcome {
    pub row: TransactionLogRow,
    /// `None` when no staging object was recorded or the row was already aborted.
    pub staging_cleanup: Option<CleanupOutcome>,
}

pub struct TransactionCoordinator<R> {
    ledger: Arc<Mutex<R>>,
    storage: StorageParticipant,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl<R> Clone for TransactionCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            storage: self.storage.clone(),
            clock: Arc::clone(&self.clock),
            config: self.config,
        }
    }
}

impl<R> TransactionCoordinator<R>
where
    R: TransactionLedgerRepo + Send + 'static,
{
    pub fn new(
        ledger: Arc<Mutex<R>>,
        storage: StorageParticipant,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            ledger,
            storage,
            clock,
            config,
        }
    }

    pub fn storage(&self) -> &StorageParticipant {
        &self.storage
    }

    pub fn now(&self) -> TimestampNs {
        self.clock.now()
    }

    /// Runs `f` under the ledger lock. Never hold the result across an await
    /// that needs the lock again.
    pub fn with_ledger<T>(&self, f: impl FnOnce(&mut R) -> T) -> Result<T, CoordinatorError> {
        let mut guard = self.ledger.lock().map_err(|_| {
            CoordinatorError::LedgerUnavailable("transaction ledger lock poisoned".to_string())
        })?;
        Ok(f(&mut *guard))
    }

    pub fn load(&self, transaction_id: &TransactionId) -> Result<TransactionLogRow, CoordinatorError> {
        self.with_ledger(|l| l.transaction_row(transaction_id).cloned())?
            .ok_or_else(|| CoordinatorError::NotFound(transaction_id.clone()))
    }

    /// Idempotency check plus a new PREPARING row. No storage I/O.
    pub fn begin_transaction(
        &self,
        data: &[u8],
        file_name: &str,
    ) -> Result<BeginOutcome, CoordinatorError> {
        let hash = file_hash_of(data)?;
        let hash = match self.with_ledger(|l| check_hash(&*l, hash))? {
            IdempotencyCheck::AlreadyCommitted(row) => {
                info!(
                    transaction_id = %row.transaction_id,
                    file_hash = %row.file_hash,
                    "identical file already committed"
                );
                return Ok(BeginOutcome::AlreadyCommitted(row));
            }
            IdempotencyCheck::Fresh(hash) => hash,
        };

        let now = self.now();
        let input = TransactionLogRowInput::v1(
            TransactionId::generate(),
            file_name.to_string(),
            data.len() as u64,
            hash,
            now,
            now.saturating_add(self.config.transaction_timeout),
        )?;
        let row = self.with_ledger(|l| l.insert_transaction_row(input))??;
        info!(
            transaction_id = %row.transaction_id,
            file_name = %row.file_name,
            file_size = row.file_size,
            "transaction started"
        );
        Ok(BeginOutcome::Started(row))
    }

    /// Uploads to staging and records the key. Any failure, including the
    /// ledger refusing the key, aborts the transaction and reports
    /// [`CoordinatorError::PrepareFailure`].
    pub async fn prepare_storage(
        &self,
        transaction_id: &TransactionId,
        data: Bytes,
    ) -> Result<TransactionLogRow, CoordinatorError> {
        let row = self.load(transaction_id)?;
        if row.state != TransactionState::Preparing {
            return Err(invalid_state(&row, "prepare_storage", "PREPARING"));
        }
        let key = match self
            .storage
            .upload_to_staging(data, transaction_id, &row.file_name)
            .await
        {
            Ok(key) => key,
            Err(e) => return Err(self.fail_storage_prepare(&row, e.to_string(), None).await),
        };
        match self.apply(TransactionLogUpdate::for_row(&row).with_staging_object_key(key.as_str())) {
            Ok(staged) => Ok(staged),
            Err(e) => Err(self
                .fail_storage_prepare(&row, e.to_string(), Some(key.as_str()))
                .await),
        }
    }

    /// Best-effort abort after a failed storage prepare. A row the ledger
    /// would not abort stays PREPARING and times out into the sweeper.
    async fn fail_storage_prepare(
        &self,
        row: &TransactionLogRow,
        reason: String,
        uploaded_key: Option<&str>,
    ) -> CoordinatorError {
        warn!(transaction_id = %row.transaction_id, reason = %reason, "storage prepare failed");
        if let Err(e) = self.transition(
            row,
            TransactionLogUpdate::for_row(row).transition(TransactionState::Aborted),
        ) {
            warn!(
                transaction_id = %row.transaction_id,
                error = %e,
                "abort after failed storage prepare not recorded; left for recovery"
            );
        }
        if let Some(key) = uploaded_key {
            let outcome = self.storage.delete_staging(key).await;
            if !outcome.is_settled() {
                warn!(
                    transaction_id = %row.transaction_id,
                    outcome = ?outcome,
                    "unrecorded staging upload left for orphan sweep"
                );
            }
        }
        CoordinatorError::PrepareFailure {
            transaction_id: row.transaction_id.clone(),
            reason,
        }
    }

    /// Captures the operation batch and moves to PREPARED. Requires a staged
    /// object; a rejected batch aborts the transaction.
    pub async fn prepare_database(
        &self,
        transaction_id: &TransactionId,
        operations: &str,
    ) -> Result<TransactionLogRow, CoordinatorError> {
        let row = self.load(transaction_id)?;
        match row.state {
            TransactionState::Prepared
                if row.validated_operations.as_deref() == Some(operations) =>
            {
                debug!(transaction_id = %transaction_id, "database already prepared");
                return Ok(row);
            }
            TransactionState::Preparing => {}
            _ => return Err(invalid_state(&row, "prepare_database", "PREPARING")),
        }
        if row.staging_object_key.is_none() {
            return Err(invalid_state(
                &row,
                "prepare_database",
                "PREPARING with a staged object",
            ));
        }
        if let Err(reason) = check_operations(operations) {
            warn!(transaction_id = %transaction_id, reason = %reason, "database prepare failed");
            self.abort_row(row).await?;
            return Err(CoordinatorError::PrepareFailure {
                transaction_id: transaction_id.clone(),
                reason,
            });
        }
        self.transition(
            &row,
            TransactionLogUpdate::for_row(&row)
                .with_validated_operations(operations)
                .transition(TransactionState::Prepared),
        )
    }

    /// Call only after the domain write is durable. Storage problems past the
    /// commit decision come back as [`CommitOutcome::Uncertain`], not errors.
    pub async fn commit(
        &self,
        transaction_id: &TransactionId,
        import_result_ref: &str,
    ) -> Result<CommitOutcome, CoordinatorError> {
        let row = self.load(transaction_id)?;
        match row.state {
            TransactionState::Committed => {
                debug!(transaction_id = %transaction_id, "already committed");
                return Ok(CommitOutcome::Committed(row));
            }
            TransactionState::Committing
                if row.import_result_ref.as_deref() == Some(import_result_ref) =>
            {
                return Ok(self.finish_commit(row).await);
            }
            TransactionState::Prepared => {}
            _ => return Err(invalid_state(&row, "commit", "PREPARED")),
        }
        let committing = self.transition(
            &row,
            TransactionLogUpdate::for_row(&row)
                .with_import_result_ref(import_result_ref)
                .transition(TransactionState::Committing),
        )?;
        Ok(self.finish_commit(committing).await)
    }

    pub async fn abort(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<AbortOutcome, CoordinatorError> {
        let row = self.load(transaction_id)?;
        self.abort_row(row).await
    }

    /// Abort starting from a row snapshot; updates carry the snapshot's revision.
    pub(crate) async fn abort_row(
        &self,
        row: TransactionLogRow,
    ) -> Result<AbortOutcome, CoordinatorError> {
        match row.state {
            TransactionState::Aborted => {
                debug!(transaction_id = %row.transaction_id, "already aborted");
                Ok(AbortOutcome {
                    row,
                    staging_cleanup: None,
                })
            }
            TransactionState::Committing | TransactionState::Committed => Err(invalid_state(
                &row,
                "abort",
                "PREPARING, PREPARED or ABORTING",
            )),
            TransactionState::Preparing => {
                let aborted = self.transition(
                    &row,
                    TransactionLogUpdate::for_row(&row).transition(TransactionState::Aborted),
                )?;
                let staging_cleanup = self.cleanup_staging(&aborted).await;
                Ok(AbortOutcome {
                    row: aborted,
                    staging_cleanup,
                })
            }
            TransactionState::Prepared => {
                let aborting = self.transition(
                    &row,
                    TransactionLogUpdate::for_row(&row).transition(TransactionState::Aborting),
                )?;
                self.finish_abort(aborting).await
            }
            TransactionState::Aborting => self.finish_abort(row).await,
        }
    }

    async fn finish_abort(&self, row: TransactionLogRow) -> Result<AbortOutcome, CoordinatorError> {
        let staging_cleanup = self.cleanup_staging(&row).await;
        let aborted = self.transition(
            &row,
            TransactionLogUpdate::for_row(&row).transition(TransactionState::Aborted),
        )?;
        Ok(AbortOutcome {
            row: aborted,
            staging_cleanup,
        })
    }

    /// Drives a COMMITTING row to COMMITTED. Never re-runs the domain write.
    pub(crate) async fn finish_commit(&self, row: TransactionLogRow) -> CommitOutcome {
        match self.try_finish_commit(&row).await {
            Ok(committed) => CommitOutcome::Committed(committed),
            Err(e) => match self.load(&row.transaction_id) {
                Ok(current) if current.state == TransactionState::Committed => {
                    debug!(transaction_id = %current.transaction_id, "commit finished elsewhere");
                    CommitOutcome::Committed(current)
                }
                current => {
                    warn!(
                        transaction_id = %row.transaction_id,
                        error = %e,
                        "commit uncertain; row left COMMITTING for recovery"
                    );
                    CommitOutcome::Uncertain {
                        row: current.unwrap_or(row),
                        reason: e.to_string(),
                    }
                }
            },
        }
    }

    async fn try_finish_commit(
        &self,
        row: &TransactionLogRow,
    ) -> Result<TransactionLogRow, CoordinatorError> {
        if row.state != TransactionState::Committing {
            return Err(invalid_state(row, "finish_commit", "COMMITTING"));
        }
        let staging_key = row
            .staging_object_key
            .as_deref()
            .ok_or_else(|| invalid_state(row, "finish_commit", "a staged object"))?;
        let final_key = final_object_key(&row.transaction_id, staging_key)?;

        if self.storage.exists(&final_key).await? {
            debug!(
                transaction_id = %row.transaction_id,
                final_key = %final_key,
                "final object present; skipping copy"
            );
        } else {
            match self
                .storage
                .copy_to_final(staging_key, &row.transaction_id)
                .await
            {
                Ok(_) => {}
                Err(StorageParticipantError::NotFound { key }) => {
                    error!(
                        transaction_id = %row.transaction_id,
                        staging_key = %staging_key,
                        final_key = %final_key,
                        "staging and final objects are both missing; cannot finalize"
                    );
                    return Err(StorageParticipantError::NotFound { key }.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.cleanup_staging(row).await;
        self.transition(
            row,
            TransactionLogUpdate::for_row(row)
                .with_final_object_key(final_key)
                .transition(TransactionState::Committed),
        )
    }

    async fn cleanup_staging(&self, row: &TransactionLogRow) -> Option<CleanupOutcome> {
        let key = row.staging_object_key.as_deref()?;
        let outcome = self.storage.delete_staging(key).await;
        if !outcome.is_settled() {
            warn!(
                transaction_id = %row.transaction_id,
                outcome = ?outcome,
                "staging cleanup left for orphan sweep"
            );
        }
        Some(outcome)
    }

    fn apply(&self, update: TransactionLogUpdate) -> Result<TransactionLogRow, CoordinatorError> {
        let now = self.now();
        Ok(self.with_ledger(|l| l.apply_transaction_update(update, now))??)
    }

    fn transition(
        &self,
        row: &TransactionLogRow,
        update: TransactionLogUpdate,
    ) -> Result<TransactionLogRow, CoordinatorError> {
        let next = self.apply(update)?;
        if next.state != row.state {
            info!(
                transaction_id = %next.transaction_id,
                from = %row.state,
                to = %next.state,
                "transaction state changed"
            );
        }
        Ok(next)
    }
}

fn invalid_state(
    row: &TransactionLogRow,
    operation: &'static str,
    expected: &'static str,
) -> CoordinatorError {
    CoordinatorError::InvalidState {
        transaction_id: row.transaction_id.clone(),
        operation,
        state: row.state,
        expected,
    }
}

/// Structural check only; semantic validation belongs to the domain writer.
fn check_operations(operations: &str) -> Result<(), String> {
    if operations.trim().is_empty() {
        return Err("operation batch is empty".to_string());
    }
    match serde_json::from_str::<serde_json::Value>(operations) {
        Ok(serde_json::Value::Null) => Err("operation batch is null".to_string()),
        Ok(_) => Ok(()),
        Err(e) => Err(format!("operation batch is not valid JSON: {e}")),
    }
}
