#![forbid(unsafe_code)]

//! Object-store participant: the `staging/` and `final/` areas of one bucket.
//!
//! Keys are always derived from the transaction id, so every call here is
//! safe to repeat. Staging deletes never fail the caller; they report a
//! [`CleanupOutcome`] instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};
use tandem_contracts::txlog::{
    final_object_key, staging_object_key, TransactionId, FINAL_PREFIX, STAGING_PREFIX,
};
use tandem_contracts::ContractViolation;
use tracing::{debug, info, warn};

use crate::config::ObjectStoreConfig;
use crate::retry::{RetryExhausted, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum StorageParticipantError {
    #[error("object store error: {0}")]
    ObjectStore(#[source] object_store::Error),
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("key {key} is outside the {area} area")]
    OutsideArea { key: String, area: &'static str },
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

impl StorageParticipantError {
    fn from_store(key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Self::NotFound {
                key: key.to_string(),
            },
            other => Self::ObjectStore(other),
        }
    }
}

/// Result of a best-effort staging delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted,
    AlreadyAbsent,
    /// The store failed; the orphan pass will pick the object up later.
    RetryLater { reason: String },
    /// The key is not a staging key and was left alone.
    Refused { reason: String },
}

impl CleanupOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, CleanupOutcome::Deleted | CleanupOutcome::AlreadyAbsent)
    }
}

/// The object-store operations the participant needs, keyed by plain strings.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageParticipantError>;
    async fn get(&self, key: &str) -> Result<Bytes, StorageParticipantError>;
    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageParticipantError>;
    async fn delete(&self, key: &str) -> Result<(), StorageParticipantError>;
    /// Size of the object, `None` when absent.
    async fn head(&self, key: &str) -> Result<Option<u64>, StorageParticipantError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageParticipantError>;

    /// Pre-signed GET URL. Only stores that can sign requests support this.
    async fn signed_url(
        &self,
        key: &str,
        _expires_in: Duration,
    ) -> Result<String, StorageParticipantError> {
        Err(StorageParticipantError::Unavailable(format!(
            "object store cannot sign a download url for {key}"
        )))
    }
}

/// [`ObjectBackend`] over any `object_store` implementation.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            signer: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub fn s3_compatible(cfg: &ObjectStoreConfig, endpoint: &str) -> Result<Self, StorageParticipantError> {
        let store = AmazonS3Builder::new()
            .with_endpoint(endpoint)
            .with_bucket_name(&cfg.bucket)
            .with_access_key_id(&cfg.access_key)
            .with_secret_access_key(&cfg.secret_key)
            .with_region(&cfg.region)
            .with_allow_http(endpoint.starts_with("http://"))
            .build()
            .map_err(StorageParticipantError::ObjectStore)?;
        let store = Arc::new(store);
        Ok(Self {
            store: store.clone(),
            signer: Some(store),
        })
    }
}

#[async_trait]
impl ObjectBackend for ObjectStoreBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageParticipantError> {
        self.store
            .put(&Path::from(key), PutPayload::from_bytes(data))
            .await
            .map_err(|e| StorageParticipantError::from_store(key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageParticipantError> {
        let result = self
            .store
            .get(&Path::from(key))
            .await
            .map_err(|e| StorageParticipantError::from_store(key, e))?;
        result
            .bytes()
            .await
            .map_err(|e| StorageParticipantError::from_store(key, e))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageParticipantError> {
        self.store
            .copy(&Path::from(from), &Path::from(to))
            .await
            .map_err(|e| StorageParticipantError::from_store(from, e))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageParticipantError> {
        self.store
            .delete(&Path::from(key))
            .await
            .map_err(|e| StorageParticipantError::from_store(key, e))
    }

    async fn head(&self, key: &str) -> Result<Option<u64>, StorageParticipantError> {
        match self.store.head(&Path::from(key)).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(StorageParticipantError::ObjectStore(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageParticipantError> {
        let trimmed = prefix.trim_end_matches('/');
        let prefix_path = Path::from(trimmed);
        let mut stream = if trimmed.is_empty() {
            self.store.list(None)
        } else {
            self.store.list(Some(&prefix_path))
        };
        let mut keys = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(StorageParticipantError::ObjectStore)?;
            keys.push(meta.location.to_string());
        }
        keys.sort();
        Ok(keys)
    }

    async fn signed_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageParticipantError> {
        let Some(signer) = &self.signer else {
            return Err(StorageParticipantError::Unavailable(format!(
                "object store cannot sign a download url for {key}"
            )));
        };
        let url = signer
            .signed_url(http::Method::GET, &Path::from(key), expires_in)
            .await
            .map_err(|e| StorageParticipantError::from_store(key, e))?;
        Ok(url.to_string())
    }
}

#[derive(Clone)]
pub struct StorageParticipant {
    backend: Arc<dyn ObjectBackend>,
    bucket: String,
}

impl std::fmt::Debug for StorageParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageParticipant")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl StorageParticipant {
    pub fn new(backend: Arc<dyn ObjectBackend>, bucket: impl Into<String>) -> Self {
        Self {
            backend,
            bucket: bucket.into(),
        }
    }

    pub fn in_memory(bucket: impl Into<String>) -> Self {
        Self::new(Arc::new(ObjectStoreBackend::in_memory()), bucket)
    }

    /// S3-compatible store when an endpoint is configured, in-process otherwise.
    pub fn from_config(cfg: &ObjectStoreConfig) -> Result<Self, StorageParticipantError> {
        match &cfg.endpoint {
            Some(endpoint) => {
                let backend = ObjectStoreBackend::s3_compatible(cfg, endpoint)?;
                info!(endpoint = %endpoint, bucket = %cfg.bucket, "using s3-compatible object store");
                Ok(Self::new(Arc::new(backend), cfg.bucket.clone()))
            }
            None => {
                info!(bucket = %cfg.bucket, "using in-memory object store");
                Ok(Self::in_memory(cfg.bucket.clone()))
            }
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Probes the bucket until it answers a listing.
    pub async fn ensure_ready(
        &self,
        policy: &RetryPolicy,
    ) -> Result<(), RetryExhausted<StorageParticipantError>> {
        policy
            .retry_async(|attempt| async move {
                debug!(attempt, bucket = %self.bucket, "probing object store");
                self.backend.list(STAGING_PREFIX).await.map(|_| ())
            })
            .await?;
        info!(bucket = %self.bucket, "object store ready");
        Ok(())
    }

    /// Writes `staging/{id}{ext}`; a second upload for the same transaction
    /// overwrites the first.
    pub async fn upload_to_staging(
        &self,
        data: Bytes,
        transaction_id: &TransactionId,
        file_name: &str,
    ) -> Result<String, StorageParticipantError> {
        let key = staging_object_key(transaction_id, file_name);
        let size = data.len();
        self.backend.put(&key, data).await?;
        info!(transaction_id = %transaction_id, key = %key, size, "uploaded to staging");
        Ok(key)
    }

    /// One server-side copy to `final/{id}{ext}`. Staging is left in place.
    pub async fn copy_to_final(
        &self,
        staging_key: &str,
        transaction_id: &TransactionId,
    ) -> Result<String, StorageParticipantError> {
        let final_key = final_object_key(transaction_id, staging_key)?;
        self.backend.copy(staging_key, &final_key).await?;
        info!(transaction_id = %transaction_id, from = %staging_key, to = %final_key, "copied staging object to final");
        Ok(final_key)
    }

    pub async fn delete_staging(&self, key: &str) -> CleanupOutcome {
        if !key.starts_with(STAGING_PREFIX) {
            warn!(key = %key, "refusing to delete object outside staging area");
            return CleanupOutcome::Refused {
                reason: StorageParticipantError::OutsideArea {
                    key: key.to_string(),
                    area: STAGING_PREFIX,
                }
                .to_string(),
            };
        }
        match self.backend.head(key).await {
            Ok(None) => {
                debug!(key = %key, "staging object already absent");
                return CleanupOutcome::AlreadyAbsent;
            }
            Ok(Some(_)) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "staging delete deferred");
                return CleanupOutcome::RetryLater {
                    reason: e.to_string(),
                };
            }
        }
        match self.backend.delete(key).await {
            Ok(()) => {
                debug!(key = %key, "staging object deleted");
                CleanupOutcome::Deleted
            }
            Err(StorageParticipantError::NotFound { .. }) => CleanupOutcome::AlreadyAbsent,
            Err(e) => {
                warn!(key = %key, error = %e, "staging delete deferred");
                CleanupOutcome::RetryLater {
                    reason: e.to_string(),
                }
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageParticipantError> {
        Ok(self.backend.head(key).await?.is_some())
    }

    /// Keys under `prefix`, sorted. Only the two managed areas may be listed.
    pub async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageParticipantError> {
        let managed = [STAGING_PREFIX, FINAL_PREFIX]
            .iter()
            .any(|area| prefix.starts_with(area) || prefix == area.trim_end_matches('/'));
        if !managed {
            return Err(StorageParticipantError::OutsideArea {
                key: prefix.to_string(),
                area: "staging/ or final/",
            });
        }
        self.backend.list(prefix).await
    }

    pub async fn get(&self, key: &str) -> Result<Bytes, StorageParticipantError> {
        self.backend.get(key).await
    }

    /// Time-limited download link for an archived object under `final/`.
    pub async fn signed_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, StorageParticipantError> {
        if !key.starts_with(FINAL_PREFIX) {
            return Err(StorageParticipantError::OutsideArea {
                key: key.to_string(),
                area: FINAL_PREFIX,
            });
        }
        self.backend.signed_url(key, expires_in).await
    }
}
