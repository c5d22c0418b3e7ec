#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod idempotency;
pub mod import_flow;
pub mod recovery;
pub mod retry;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{
    AbortOutcome, BeginOutcome, CommitOutcome, CoordinatorError, TransactionCoordinator,
};
pub use recovery::{LedgerStatusReport, RecoveryResolution, RecoverySweeper};
pub use storage::{CleanupOutcome, StorageParticipant, StorageParticipantError};
