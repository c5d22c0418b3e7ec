#![forbid(unsafe_code)]

pub mod common;
pub mod txlog;

pub use common::{ContractViolation, SchemaVersion, TimestampNs, Validate};
