#![forbid(unsafe_code)]

//! Environment configuration. Numeric values outside their bounds fall back to
//! the default; only values that cannot be used at all are errors.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tandem_contracts::txlog::DEFAULT_TRANSACTION_TIMEOUT;

pub const TX_TIMEOUT_SECS_ENV: &str = "TANDEM_TX_TIMEOUT_SECS";
pub const RECOVERY_INTERVAL_SECS_ENV: &str = "TANDEM_RECOVERY_INTERVAL_SECS";
pub const ORPHAN_SWEEP_INTERVAL_SECS_ENV: &str = "TANDEM_ORPHAN_SWEEP_INTERVAL_SECS";
pub const STATUS_REPORT_INTERVAL_SECS_ENV: &str = "TANDEM_STATUS_REPORT_INTERVAL_SECS";
pub const RETENTION_DAYS_ENV: &str = "TANDEM_RETENTION_DAYS";
pub const RECOVERY_WORKER_ENABLED_ENV: &str = "TANDEM_RECOVERY_WORKER_ENABLED";
pub const OBJECT_STORE_ENDPOINT_ENV: &str = "TANDEM_OBJECT_STORE_ENDPOINT";
pub const OBJECT_STORE_BUCKET_ENV: &str = "TANDEM_OBJECT_STORE_BUCKET";
pub const OBJECT_STORE_ACCESS_KEY_ENV: &str = "TANDEM_OBJECT_STORE_ACCESS_KEY";
pub const OBJECT_STORE_SECRET_KEY_ENV: &str = "TANDEM_OBJECT_STORE_SECRET_KEY";
pub const OBJECT_STORE_REGION_ENV: &str = "TANDEM_OBJECT_STORE_REGION";
pub const LEDGER_JOURNAL_PATH_ENV: &str = "TANDEM_LEDGER_JOURNAL_PATH";
pub const HTTP_BIND_ENV: &str = "TANDEM_HTTP_BIND";
pub const CONNECT_MAX_ATTEMPTS_ENV: &str = "TANDEM_CONNECT_MAX_ATTEMPTS";

pub const DEFAULT_BUCKET: &str = "import-files";
pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("{var} is unset and no default could be derived: {reason}")]
    Missing {
        var: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub transaction_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub worker_enabled: bool,
    pub recovery_interval: Duration,
    pub orphan_sweep_interval: Duration,
    pub status_report_interval: Duration,
    pub retention: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            worker_enabled: true,
            recovery_interval: Duration::from_secs(5 * 60),
            orphan_sweep_interval: Duration::from_secs(24 * 60 * 60),
            status_report_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// `endpoint = None` selects the in-process store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub connect_max_attempts: usize,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: DEFAULT_BUCKET.to_string(),
            access_key: "admin".to_string(),
            secret_key: "admin12345".to_string(),
            region: "us-east-1".to_string(),
            connect_max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TandemConfig {
    pub coordinator: CoordinatorConfig,
    pub recovery: RecoveryConfig,
    pub object_store: ObjectStoreConfig,
    pub ledger_journal_path: PathBuf,
    pub http_bind: SocketAddr,
}

impl TandemConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| env::var(key).ok())
    }

    pub fn from_env_with<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let coordinator = CoordinatorConfig {
            transaction_timeout: Duration::from_secs(bounded_u64(
                &get,
                TX_TIMEOUT_SECS_ENV,
                1..=86_400,
                DEFAULT_TRANSACTION_TIMEOUT.as_secs(),
            )),
        };

        let recovery_defaults = RecoveryConfig::default();
        let recovery = RecoveryConfig {
            worker_enabled: match non_empty(&get, RECOVERY_WORKER_ENABLED_ENV) {
                Some(v) => !matches!(
                    v.to_ascii_lowercase().as_str(),
                    "0" | "false" | "off" | "no"
                ),
                None => true,
            },
            recovery_interval: Duration::from_secs(bounded_u64(
                &get,
                RECOVERY_INTERVAL_SECS_ENV,
                1..=86_400,
                recovery_defaults.recovery_interval.as_secs(),
            )),
            orphan_sweep_interval: Duration::from_secs(bounded_u64(
                &get,
                ORPHAN_SWEEP_INTERVAL_SECS_ENV,
                1..=604_800,
                recovery_defaults.orphan_sweep_interval.as_secs(),
            )),
            status_report_interval: Duration::from_secs(bounded_u64(
                &get,
                STATUS_REPORT_INTERVAL_SECS_ENV,
                1..=86_400,
                recovery_defaults.status_report_interval.as_secs(),
            )),
            retention: Duration::from_secs(
                bounded_u64(&get, RETENTION_DAYS_ENV, 1..=3_650, 30) * 24 * 60 * 60,
            ),
        };

        let store_defaults = ObjectStoreConfig::default();
        let endpoint = non_empty(&get, OBJECT_STORE_ENDPOINT_ENV);
        if let Some(e) = &endpoint {
            if !(e.starts_with("http://") || e.starts_with("https://")) {
                return Err(ConfigError::InvalidValue {
                    var: OBJECT_STORE_ENDPOINT_ENV,
                    value: e.clone(),
                    reason: "must start with http:// or https://",
                });
            }
        }
        let object_store = ObjectStoreConfig {
            endpoint,
            bucket: non_empty(&get, OBJECT_STORE_BUCKET_ENV).unwrap_or(store_defaults.bucket),
            access_key: non_empty(&get, OBJECT_STORE_ACCESS_KEY_ENV)
                .unwrap_or(store_defaults.access_key),
            secret_key: non_empty(&get, OBJECT_STORE_SECRET_KEY_ENV)
                .unwrap_or(store_defaults.secret_key),
            region: non_empty(&get, OBJECT_STORE_REGION_ENV).unwrap_or(store_defaults.region),
            connect_max_attempts: bounded_u64(&get, CONNECT_MAX_ATTEMPTS_ENV, 1..=100, 5) as usize,
        };

        let ledger_journal_path = match non_empty(&get, LEDGER_JOURNAL_PATH_ENV) {
            Some(p) => PathBuf::from(p),
            None => match non_empty(&get, "HOME") {
                Some(home) => PathBuf::from(home)
                    .join(".tandem")
                    .join("ledger")
                    .join("transaction_log.jsonl"),
                None => {
                    return Err(ConfigError::Missing {
                        var: LEDGER_JOURNAL_PATH_ENV,
                        reason: "HOME is not set",
                    })
                }
            },
        };

        let bind = non_empty(&get, HTTP_BIND_ENV).unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let http_bind = bind.parse::<SocketAddr>().map_err(|_| ConfigError::InvalidValue {
            var: HTTP_BIND_ENV,
            value: bind.clone(),
            reason: "must be a socket address like 127.0.0.1:8080",
        })?;

        Ok(Self {
            coordinator,
            recovery,
            object_store,
            ledger_journal_path,
            http_bind,
        })
    }
}

fn non_empty<F>(get: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn bounded_u64<F>(get: &F, key: &str, bounds: std::ops::RangeInclusive<u64>, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| bounds.contains(v))
        .unwrap_or(default)
}
