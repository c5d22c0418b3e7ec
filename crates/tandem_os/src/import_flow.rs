#![forbid(unsafe_code)]

use async_trait::async_trait;
use bytes::Bytes;
use tandem_contracts::txlog::{TransactionId, TransactionLogRow};
use tandem_storage::TransactionLedgerRepo;
use tracing::{info, warn};

use crate::coordinator::{BeginOutcome, CommitOutcome, CoordinatorError, TransactionCoordinator};

/// The relational side of an import. `apply` runs the operation batch in the
/// writer's own local transaction and returns a reference to the durable
/// result once that transaction has committed.
#[async_trait]
pub trait DomainWriter: Send + Sync {
    async fn apply(
        &self,
        transaction_id: &TransactionId,
        operations: &str,
    ) -> Result<String, DomainWriteError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DomainWriteError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported(TransactionLogRow),
    /// Same bytes were imported before; nothing was written.
    AlreadyImported(TransactionLogRow),
    /// Domain write is durable, archive finalize is pending recovery.
    CommitPending {
        row: TransactionLogRow,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("domain write failed for {transaction_id}: {source}")]
    DomainWrite {
        transaction_id: TransactionId,
        #[source]
        source: DomainWriteError,
    },
}

/// begin, prepare storage, prepare database, domain write, commit. Any failure
/// before the commit decision aborts the transaction.
pub async fn run_import<R>(
    coordinator: &TransactionCoordinator<R>,
    data: Bytes,
    file_name: &str,
    operations: &str,
    writer: &dyn DomainWriter,
) -> Result<ImportOutcome, ImportError>
where
    R: TransactionLedgerRepo + Send + 'static,
{
    let row = match coordinator.begin_transaction(&data, file_name)? {
        BeginOutcome::AlreadyCommitted(row) => return Ok(ImportOutcome::AlreadyImported(row)),
        BeginOutcome::Started(row) => row,
    };
    let transaction_id = row.transaction_id;

    // PrepareFailure already aborted the row.
    coordinator.prepare_storage(&transaction_id, data).await?;
    if let Err(e) = coordinator.prepare_database(&transaction_id, operations).await {
        if !matches!(e, CoordinatorError::PrepareFailure { .. }) {
            abort_quietly(coordinator, &transaction_id).await;
        }
        return Err(e.into());
    }

    let result_ref = match writer.apply(&transaction_id, operations).await {
        Ok(result_ref) => result_ref,
        Err(source) => {
            warn!(transaction_id = %transaction_id, error = %source, "domain write failed");
            abort_quietly(coordinator, &transaction_id).await;
            return Err(ImportError::DomainWrite {
                transaction_id,
                source,
            });
        }
    };

    match coordinator.commit(&transaction_id, &result_ref).await? {
        CommitOutcome::Committed(row) => {
            info!(transaction_id = %transaction_id, import_result_ref = %result_ref, "import committed");
            Ok(ImportOutcome::Imported(row))
        }
        CommitOutcome::Uncertain { row, reason } => Ok(ImportOutcome::CommitPending { row, reason }),
    }
}

async fn abort_quietly<R>(coordinator: &TransactionCoordinator<R>, transaction_id: &TransactionId)
where
    R: TransactionLedgerRepo + Send + 'static,
{
    if let Err(e) = coordinator.abort(transaction_id).await {
        warn!(transaction_id = %transaction_id, error = %e, "abort after failed import did not complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::harness;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tandem_contracts::txlog::TransactionState;

    #[derive(Default)]
    struct RecordingWriter {
        calls: AtomicUsize,
        fail_with: Mutex<Option<String>>,
    }

    #[async_trait]
    impl DomainWriter for RecordingWriter {
        async fn apply(
            &self,
            _transaction_id: &TransactionId,
            _operations: &str,
        ) -> Result<String, DomainWriteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail_with.lock().unwrap().clone() {
                Some(reason) => Err(DomainWriteError(reason)),
                None => Ok(format!("import-{n}")),
            }
        }
    }

    const OPS: &str = "[{\"op\":\"insert\"}]";

    #[tokio::test]
    async fn at_import_01_full_flow_then_resubmission() {
        let h = harness();
        let writer = RecordingWriter::default();
        let data = Bytes::from_static(b"{\"flats\":[]}");

        let first = run_import(&h.coordinator, data.clone(), "f.json", OPS, &writer)
            .await
            .unwrap();
        let ImportOutcome::Imported(row) = first else {
            panic!("expected import, got {first:?}");
        };
        assert_eq!(row.state, TransactionState::Committed);
        assert_eq!(row.import_result_ref.as_deref(), Some("import-1"));

        let second = run_import(&h.coordinator, data, "f.json", OPS, &writer)
            .await
            .unwrap();
        assert!(matches!(second, ImportOutcome::AlreadyImported(ref r) if r.transaction_id == row.transaction_id));
        assert_eq!(writer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn at_import_02_domain_failure_aborts_and_cleans_staging() {
        let h = harness();
        let writer = RecordingWriter::default();
        *writer.fail_with.lock().unwrap() = Some("constraint violated".to_string());

        let err = run_import(&h.coordinator, Bytes::from_static(b"x"), "f.json", OPS, &writer)
            .await
            .unwrap_err();
        let ImportError::DomainWrite { transaction_id, .. } = err else {
            panic!("expected domain write error, got {err:?}");
        };
        assert_eq!(
            h.coordinator.load(&transaction_id).unwrap().state,
            TransactionState::Aborted
        );
        assert!(h
            .coordinator
            .storage()
            .list_by_prefix("staging/")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn at_import_03_invalid_batch_never_reaches_writer() {
        let h = harness();
        let writer = RecordingWriter::default();
        let err = run_import(&h.coordinator, Bytes::from_static(b"y"), "f.json", "{oops", &writer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Coordinator(CoordinatorError::PrepareFailure { .. })
        ));
        assert_eq!(writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn at_import_04_storage_finalize_failure_is_pending_not_error() {
        let h = harness();
        let writer = RecordingWriter::default();
        h.backend.fail_copy.store(true, Ordering::SeqCst);
        let outcome = run_import(&h.coordinator, Bytes::from_static(b"z"), "f.json", OPS, &writer)
            .await
            .unwrap();
        let ImportOutcome::CommitPending { row, .. } = outcome else {
            panic!("expected pending commit");
        };
        assert_eq!(row.state, TransactionState::Committing);
    }
}
