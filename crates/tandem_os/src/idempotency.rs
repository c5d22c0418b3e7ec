#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use tandem_contracts::txlog::{FileHash, TransactionLogRow, TransactionState};
use tandem_contracts::ContractViolation;
use tandem_storage::TransactionLedgerRepo;

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn file_hash_of(data: &[u8]) -> Result<FileHash, ContractViolation> {
    FileHash::new(sha256_hex(data))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// Identical bytes were already committed; nothing new may be written.
    AlreadyCommitted(TransactionLogRow),
    Fresh(FileHash),
}

/// Read-only content lookup. Two concurrent submissions of the same bytes can
/// both observe `Fresh`; the ledger keeps no uniqueness constraint on hashes.
pub fn check_hash<R: TransactionLedgerRepo + ?Sized>(repo: &R, hash: FileHash) -> IdempotencyCheck {
    match repo.transaction_row_by_hash_and_state(&hash, TransactionState::Committed) {
        Some(row) => IdempotencyCheck::AlreadyCommitted(row.clone()),
        None => IdempotencyCheck::Fresh(hash),
    }
}
