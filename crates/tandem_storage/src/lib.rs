#![forbid(unsafe_code)]

pub mod journal;
pub mod ledger;
pub mod repo;

pub use ledger::{StorageError, TransactionLedgerStore};
pub use repo::TransactionLedgerRepo;
