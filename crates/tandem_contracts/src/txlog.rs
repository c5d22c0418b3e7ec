#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, SchemaVersion, TimestampNs, Validate};

pub const TXLOG_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const STAGING_PREFIX: &str = "staging/";
pub const FINAL_PREFIX: &str = "final/";
pub const DEFAULT_OBJECT_EXTENSION: &str = ".json";
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const MAX_EXTENSION_LEN: usize = 16;
const MAX_FILE_NAME_LEN: usize = 255;
const MAX_RESULT_REF_LEN: usize = 256;

fn validate_id(field: &'static str, value: &str, max_len: usize) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    Ok(())
}

fn validate_opt_id(
    field: &'static str,
    value: &Option<String>,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if let Some(v) = value {
        validate_id(field, v, max_len)?;
    }
    Ok(())
}

/// Opaque transaction identifier. Restricted to `[A-Za-z0-9_-]` so object keys
/// derived from it can be mapped back without ambiguity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_id("transaction_id", &v, 128)?;
        if !v
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_id",
                reason: "must contain only ascii alphanumerics, '-' or '_'",
            });
        }
        Ok(Self(v))
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for TransactionId {
    fn validate(&self) -> Result<(), ContractViolation> {
        Self::new(self.0.clone()).map(|_| ())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TransactionId {
    type Error = ContractViolation;

    fn try_from(v: String) -> Result<Self, Self::Error> {
        Self::new(v)
    }
}

impl From<TransactionId> for String {
    fn from(v: TransactionId) -> Self {
        v.0
    }
}

/// Lowercase hex SHA-256 digest of an uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileHash(String);

impl FileHash {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        if v.len() != 64 {
            return Err(ContractViolation::InvalidValue {
                field: "file_hash",
                reason: "must be 64 hex characters",
            });
        }
        if !v
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(ContractViolation::InvalidValue {
                field: "file_hash",
                reason: "must be lowercase hex",
            });
        }
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FileHash {
    type Error = ContractViolation;

    fn try_from(v: String) -> Result<Self, Self::Error> {
        Self::new(v)
    }
}

impl From<FileHash> for String {
    fn from(v: FileHash) -> Self {
        v.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TransactionState {
    pub const ALL: [TransactionState; 6] = [
        TransactionState::Preparing,
        TransactionState::Prepared,
        TransactionState::Committing,
        TransactionState::Committed,
        TransactionState::Aborting,
        TransactionState::Aborted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Preparing => "PREPARING",
            TransactionState::Prepared => "PREPARED",
            TransactionState::Committing => "COMMITTING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborting => "ABORTING",
            TransactionState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }

    /// The only edges a ledger row may take. Self-loops are not edges.
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        matches!(
            (self, next),
            (TransactionState::Preparing, TransactionState::Prepared)
                | (TransactionState::Preparing, TransactionState::Aborted)
                | (TransactionState::Prepared, TransactionState::Committing)
                | (TransactionState::Prepared, TransactionState::Aborting)
                | (TransactionState::Committing, TransactionState::Committed)
                | (TransactionState::Aborting, TransactionState::Aborted)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionState {
    type Err = ContractViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or(ContractViolation::InvalidValue {
                field: "transaction_state",
                reason: "unknown state",
            })
    }
}

/// Extension (with leading dot) of the uploaded file, `.json` when the name
/// carries none or an unusable one.
pub fn object_extension(file_name: &str) -> String {
    let base = file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(file_name);
    let Some(dot) = base.rfind('.') else {
        return DEFAULT_OBJECT_EXTENSION.to_string();
    };
    let ext = &base[dot + 1..];
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return DEFAULT_OBJECT_EXTENSION.to_string();
    }
    format!(".{ext}")
}

pub fn staging_object_key(transaction_id: &TransactionId, file_name: &str) -> String {
    format!(
        "{STAGING_PREFIX}{}{}",
        transaction_id.as_str(),
        object_extension(file_name)
    )
}

/// Final key for a staging key produced by [`staging_object_key`]; carries the
/// same extension.
pub fn final_object_key(
    transaction_id: &TransactionId,
    staging_key: &str,
) -> Result<String, ContractViolation> {
    let ext = staging_key
        .strip_prefix(STAGING_PREFIX)
        .and_then(|rest| rest.strip_prefix(transaction_id.as_str()))
        .ok_or(ContractViolation::InvalidValue {
            field: "staging_object_key",
            reason: "must be staging/{transaction_id}{ext}",
        })?;
    if !ext.is_empty() && !ext.starts_with('.') {
        return Err(ContractViolation::InvalidValue {
            field: "staging_object_key",
            reason: "must be staging/{transaction_id}{ext}",
        });
    }
    Ok(format!("{FINAL_PREFIX}{}{}", transaction_id.as_str(), ext))
}

/// Maps a `staging/` or `final/` key back to the transaction that produced it.
pub fn transaction_id_from_object_key(key: &str) -> Option<TransactionId> {
    let rest = key
        .strip_prefix(STAGING_PREFIX)
        .or_else(|| key.strip_prefix(FINAL_PREFIX))?;
    let stem = rest.split('.').next()?;
    TransactionId::new(stem).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLogRowInput {
    pub schema_version: SchemaVersion,
    pub transaction_id: TransactionId,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: FileHash,
    pub created_at: TimestampNs,
    pub timeout_at: TimestampNs,
}

impl TransactionLogRowInput {
    pub fn v1(
        transaction_id: TransactionId,
        file_name: String,
        file_size: u64,
        file_hash: FileHash,
        created_at: TimestampNs,
        timeout_at: TimestampNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: TXLOG_CONTRACT_VERSION,
            transaction_id,
            file_name,
            file_size,
            file_hash,
            created_at,
            timeout_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for TransactionLogRowInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != TXLOG_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_log_row_input.schema_version",
                reason: "must match TXLOG_CONTRACT_VERSION",
            });
        }
        self.transaction_id.validate()?;
        validate_id(
            "transaction_log_row_input.file_name",
            &self.file_name,
            MAX_FILE_NAME_LEN,
        )?;
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_log_row_input.created_at",
                reason: "must be > 0",
            });
        }
        if self.timeout_at <= self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_log_row_input.timeout_at",
                reason: "must be after created_at",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogRow {
    pub schema_version: SchemaVersion,
    pub transaction_id: TransactionId,
    pub state: TransactionState,
    /// Bumped on every accepted update; updates must name the revision they read.
    pub revision: u64,
    pub staging_object_key: Option<String>,
    pub final_object_key: Option<String>,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: FileHash,
    pub validated_operations: Option<String>,
    pub import_result_ref: Option<String>,
    pub created_at: TimestampNs,
    pub updated_at: TimestampNs,
    pub timeout_at: TimestampNs,
}

impl TransactionLogRow {
    pub fn from_input_v1(input: TransactionLogRowInput) -> Result<Self, ContractViolation> {
        input.validate()?;
        let r = Self {
            schema_version: TXLOG_CONTRACT_VERSION,
            transaction_id: input.transaction_id,
            state: TransactionState::Preparing,
            revision: 1,
            staging_object_key: None,
            final_object_key: None,
            file_name: input.file_name,
            file_size: input.file_size,
            file_hash: input.file_hash,
            validated_operations: None,
            import_result_ref: None,
            created_at: input.created_at,
            updated_at: input.created_at,
            timeout_at: input.timeout_at,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Eligible for sweeping strictly after `timeout_at`.
    pub fn is_timed_out(&self, now: TimestampNs) -> bool {
        !self.is_terminal() && self.timeout_at < now
    }
}

impl Validate for TransactionLogRow {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != TXLOG_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_log_row.schema_version",
                reason: "must match TXLOG_CONTRACT_VERSION",
            });
        }
        if self.revision == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_log_row.revision",
                reason: "must be > 0",
            });
        }
        self.transaction_id.validate()?;
        validate_id(
            "transaction_log_row.file_name",
            &self.file_name,
            MAX_FILE_NAME_LEN,
        )?;
        if self.created_at.0 == 0 || self.updated_at < self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_log_row.updated_at",
                reason: "must be >= created_at > 0",
            });
        }
        if self.timeout_at <= self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_log_row.timeout_at",
                reason: "must be after created_at",
            });
        }
        validate_opt_id(
            "transaction_log_row.import_result_ref",
            &self.import_result_ref,
            MAX_RESULT_REF_LEN,
        )?;
        validate_opt_id(
            "transaction_log_row.validated_operations",
            &self.validated_operations,
            usize::MAX,
        )?;

        if let Some(k) = &self.staging_object_key {
            let expected = format!("{STAGING_PREFIX}{}", self.transaction_id.as_str());
            if !k.starts_with(&expected) {
                return Err(ContractViolation::InvalidValue {
                    field: "transaction_log_row.staging_object_key",
                    reason: "must be staging/{transaction_id}{ext}",
                });
            }
        }
        if let Some(k) = &self.final_object_key {
            let expected = format!("{FINAL_PREFIX}{}", self.transaction_id.as_str());
            if !k.starts_with(&expected) {
                return Err(ContractViolation::InvalidValue {
                    field: "transaction_log_row.final_object_key",
                    reason: "must be final/{transaction_id}{ext}",
                });
            }
            if !matches!(
                self.state,
                TransactionState::Committing | TransactionState::Committed
            ) {
                return Err(ContractViolation::InvalidValue {
                    field: "transaction_log_row.final_object_key",
                    reason: "only set while COMMITTING or COMMITTED",
                });
            }
        }

        match self.state {
            TransactionState::Prepared
            | TransactionState::Committing
            | TransactionState::Committed => {
                if self.staging_object_key.is_none() || self.validated_operations.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "transaction_log_row.state",
                        reason: "PREPARED and later require staging key and validated operations",
                    });
                }
            }
            _ => {}
        }
        if matches!(
            self.state,
            TransactionState::Committing | TransactionState::Committed
        ) && self.import_result_ref.is_none()
        {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_log_row.import_result_ref",
                reason: "required once the commit decision is made",
            });
        }
        if self.state == TransactionState::Committed && self.final_object_key.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "transaction_log_row.final_object_key",
                reason: "required when COMMITTED",
            });
        }
        Ok(())
    }
}

/// One read-modify-write against a ledger row. Field setters only fill
/// values that are still unset (or re-set the same value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLogUpdate {
    pub transaction_id: TransactionId,
    pub expected_revision: u64,
    pub next_state: Option<TransactionState>,
    pub staging_object_key: Option<String>,
    pub final_object_key: Option<String>,
    pub validated_operations: Option<String>,
    pub import_result_ref: Option<String>,
}

impl TransactionLogUpdate {
    pub fn for_row(row: &TransactionLogRow) -> Self {
        Self {
            transaction_id: row.transaction_id.clone(),
            expected_revision: row.revision,
            next_state: None,
            staging_object_key: None,
            final_object_key: None,
            validated_operations: None,
            import_result_ref: None,
        }
    }

    pub fn transition(mut self, next: TransactionState) -> Self {
        self.next_state = Some(next);
        self
    }

    pub fn with_staging_object_key(mut self, key: impl Into<String>) -> Self {
        self.staging_object_key = Some(key.into());
        self
    }

    pub fn with_final_object_key(mut self, key: impl Into<String>) -> Self {
        self.final_object_key = Some(key.into());
        self
    }

    pub fn with_validated_operations(mut self, ops: impl Into<String>) -> Self {
        self.validated_operations = Some(ops.into());
        self
    }

    pub fn with_import_result_ref(mut self, result_ref: impl Into<String>) -> Self {
        self.import_result_ref = Some(result_ref.into());
        self
    }

    /// Field-level application; revision, terminal and transition checks are
    /// the store's job.
    pub fn apply_to(
        &self,
        row: &TransactionLogRow,
        now: TimestampNs,
    ) -> Result<TransactionLogRow, ContractViolation> {
        let mut next = row.clone();
        if let Some(state) = self.next_state {
            next.state = state;
        }
        set_once(
            "transaction_log_update.staging_object_key",
            &mut next.staging_object_key,
            &self.staging_object_key,
        )?;
        set_once(
            "transaction_log_update.final_object_key",
            &mut next.final_object_key,
            &self.final_object_key,
        )?;
        set_once(
            "transaction_log_update.validated_operations",
            &mut next.validated_operations,
            &self.validated_operations,
        )?;
        set_once(
            "transaction_log_update.import_result_ref",
            &mut next.import_result_ref,
            &self.import_result_ref,
        )?;
        next.revision = row.revision.saturating_add(1);
        next.updated_at = if now > row.updated_at {
            now
        } else {
            row.updated_at
        };
        next.validate()?;
        Ok(next)
    }
}

fn set_once(
    field: &'static str,
    slot: &mut Option<String>,
    value: &Option<String>,
) -> Result<(), ContractViolation> {
    let Some(v) = value else {
        return Ok(());
    };
    match slot {
        Some(existing) if *existing != *v => Err(ContractViolation::InvalidValue {
            field,
            reason: "already set to a different value",
        }),
        _ => {
            *slot = Some(v.clone());
            Ok(())
        }
    }
}
