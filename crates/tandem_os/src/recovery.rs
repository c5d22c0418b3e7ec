#![forbid(unsafe_code)]

//! Recovery sweeper: finishes or aborts timed-out transactions, removes
//! orphaned staging objects and prunes old terminal rows.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tandem_contracts::txlog::{
    transaction_id_from_object_key, TransactionId, TransactionLogRow, TransactionState,
    STAGING_PREFIX,
};
use tandem_contracts::TimestampNs;
use tandem_storage::TransactionLedgerRepo;
use tracing::{debug, info, warn};

use crate::coordinator::{AbortOutcome, CommitOutcome, CoordinatorError, TransactionCoordinator};
use crate::storage::CleanupOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RecoverySweepMetrics {
    pub timed_out_count: u32,
    pub aborted_count: u32,
    pub committed_count: u32,
    /// Rows that changed under the sweeper or were already terminal.
    pub skipped_count: u32,
    pub failed_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OrphanSweepMetrics {
    pub listed_count: u32,
    pub deleted_count: u32,
    pub retained_count: u32,
    pub failed_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStatusReport {
    pub generated_at: TimestampNs,
    pub counts_by_state: BTreeMap<String, u64>,
    pub active_count: u64,
    pub preparing: Vec<TransactionId>,
    pub committing: Vec<TransactionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryResolution {
    Aborted(AbortOutcome),
    Committed(TransactionLogRow),
    /// Finalize failed again; the row stays COMMITTING for the next cycle.
    StillCommitting {
        row: TransactionLogRow,
        reason: String,
    },
    AlreadyTerminal(TransactionLogRow),
}

impl RecoveryResolution {
    pub fn row(&self) -> &TransactionLogRow {
        match self {
            RecoveryResolution::Aborted(outcome) => &outcome.row,
            RecoveryResolution::Committed(row)
            | RecoveryResolution::StillCommitting { row, .. }
            | RecoveryResolution::AlreadyTerminal(row) => row,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecoveryResolution::Aborted(_) => "ABORTED",
            RecoveryResolution::Committed(_) => "COMMITTED",
            RecoveryResolution::StillCommitting { .. } => "STILL_COMMITTING",
            RecoveryResolution::AlreadyTerminal(_) => "ALREADY_TERMINAL",
        }
    }
}

pub struct RecoverySweeper<R> {
    coordinator: TransactionCoordinator<R>,
    retention: Duration,
}

impl<R> Clone for RecoverySweeper<R> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            retention: self.retention,
        }
    }
}

impl<R> RecoverySweeper<R>
where
    R: TransactionLedgerRepo + Send + 'static,
{
    pub fn new(coordinator: TransactionCoordinator<R>, retention: Duration) -> Self {
        Self {
            coordinator,
            retention,
        }
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<R> {
        &self.coordinator
    }

    /// One pass over rows whose deadline has passed. Each row is acted on
    /// with the revision it was read at; a row that moved meanwhile is skipped.
    pub async fn run_recovery_pass(&self) -> Result<RecoverySweepMetrics, CoordinatorError> {
        let now = self.coordinator.now();
        let due: Vec<TransactionLogRow> = self.coordinator.with_ledger(|l| {
            l.timed_out_transaction_rows(now)
                .into_iter()
                .cloned()
                .collect()
        })?;
        let mut metrics = RecoverySweepMetrics {
            timed_out_count: due.len() as u32,
            ..RecoverySweepMetrics::default()
        };

        for row in due {
            let transaction_id = row.transaction_id.clone();
            let state = row.state;
            match self.resolve(row).await {
                Ok(RecoveryResolution::Aborted(_)) => {
                    metrics.aborted_count = metrics.aborted_count.saturating_add(1)
                }
                Ok(RecoveryResolution::Committed(_)) => {
                    metrics.committed_count = metrics.committed_count.saturating_add(1)
                }
                Ok(RecoveryResolution::StillCommitting { reason, .. }) => {
                    warn!(transaction_id = %transaction_id, reason = %reason, "recovery could not finalize commit");
                    metrics.failed_count = metrics.failed_count.saturating_add(1);
                }
                Ok(RecoveryResolution::AlreadyTerminal(_)) => {
                    metrics.skipped_count = metrics.skipped_count.saturating_add(1)
                }
                Err(CoordinatorError::ConcurrentModification(_)) => {
                    warn!(transaction_id = %transaction_id, state = %state, "row changed during recovery; skipped");
                    metrics.skipped_count = metrics.skipped_count.saturating_add(1);
                }
                Err(e) => {
                    warn!(transaction_id = %transaction_id, state = %state, error = %e, "recovery failed; will retry next cycle");
                    metrics.failed_count = metrics.failed_count.saturating_add(1);
                }
            }
        }

        if metrics.timed_out_count > 0 {
            info!(
                timed_out = metrics.timed_out_count,
                aborted = metrics.aborted_count,
                committed = metrics.committed_count,
                skipped = metrics.skipped_count,
                failed = metrics.failed_count,
                "recovery pass finished"
            );
        }
        Ok(metrics)
    }

    /// Operator-driven recovery of one transaction, ignoring its deadline.
    pub async fn manual_recover(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<RecoveryResolution, CoordinatorError> {
        let row = self.coordinator.load(transaction_id)?;
        info!(transaction_id = %transaction_id, state = %row.state, "manual recovery requested");
        self.resolve(row).await
    }

    async fn resolve(
        &self,
        row: TransactionLogRow,
    ) -> Result<RecoveryResolution, CoordinatorError> {
        match row.state {
            TransactionState::Preparing
            | TransactionState::Prepared
            | TransactionState::Aborting => {
                Ok(RecoveryResolution::Aborted(self.coordinator.abort_row(row).await?))
            }
            TransactionState::Committing => Ok(match self.coordinator.finish_commit(row).await {
                CommitOutcome::Committed(row) => RecoveryResolution::Committed(row),
                CommitOutcome::Uncertain { row, reason } => {
                    RecoveryResolution::StillCommitting { row, reason }
                }
            }),
            TransactionState::Committed | TransactionState::Aborted => {
                Ok(RecoveryResolution::AlreadyTerminal(row))
            }
        }
    }

    /// Deletes staging objects with no ledger row or a terminal one. Objects
    /// are matched by recorded staging key first, then by the id in the key,
    /// so an upload whose key was not yet recorded is kept.
    pub async fn run_orphan_pass(&self) -> Result<OrphanSweepMetrics, CoordinatorError> {
        let keys = self
            .coordinator
            .storage()
            .list_by_prefix(STAGING_PREFIX)
            .await?;
        let mut metrics = OrphanSweepMetrics {
            listed_count: keys.len() as u32,
            ..OrphanSweepMetrics::default()
        };

        for key in keys {
            let owner = self.coordinator.with_ledger(|l| {
                let l: &R = &*l;
                l.transaction_row_by_staging_key(&key)
                    .or_else(|| {
                        transaction_id_from_object_key(&key).and_then(|id| l.transaction_row(&id))
                    })
                    .map(|row| row.state)
            })?;
            if let Some(state) = owner.filter(|s| !s.is_terminal()) {
                debug!(key = %key, state = %state, "staging object belongs to active transaction");
                metrics.retained_count = metrics.retained_count.saturating_add(1);
                continue;
            }
            match self.coordinator.storage().delete_staging(&key).await {
                CleanupOutcome::Deleted | CleanupOutcome::AlreadyAbsent => {
                    info!(key = %key, owner_state = ?owner, "orphaned staging object removed");
                    metrics.deleted_count = metrics.deleted_count.saturating_add(1);
                }
                CleanupOutcome::RetryLater { .. } | CleanupOutcome::Refused { .. } => {
                    metrics.failed_count = metrics.failed_count.saturating_add(1);
                }
            }
        }
        Ok(metrics)
    }

    /// Deletes COMMITTED/ABORTED rows last updated before the retention window.
    pub fn run_retention_pass(&self) -> Result<usize, CoordinatorError> {
        let cutoff = self.coordinator.now().saturating_sub(self.retention);
        let removed = self
            .coordinator
            .with_ledger(|l| l.delete_terminal_rows_older_than(cutoff))??;
        if removed > 0 {
            info!(removed, "expired terminal transactions deleted");
        }
        Ok(removed)
    }

    pub fn status_report(&self) -> Result<LedgerStatusReport, CoordinatorError> {
        let generated_at = self.coordinator.now();
        self.coordinator.with_ledger(|l| {
            let mut counts_by_state: BTreeMap<String, u64> = TransactionState::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect();
            let mut active_count = 0;
            for row in l.transaction_rows() {
                *counts_by_state
                    .entry(row.state.as_str().to_string())
                    .or_insert(0) += 1;
                if !row.is_terminal() {
                    active_count += 1;
                }
            }
            let ids = |state| {
                l.transaction_rows_by_state(state)
                    .into_iter()
                    .map(|row| row.transaction_id.clone())
                    .collect::<Vec<_>>()
            };
            LedgerStatusReport {
                generated_at,
                counts_by_state,
                active_count,
                preparing: ids(TransactionState::Preparing),
                committing: ids(TransactionState::Committing),
            }
        })
    }
}
