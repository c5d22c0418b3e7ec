#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use tandem_contracts::txlog::TransactionId;
use tandem_contracts::ContractViolation;
use tandem_os::clock::{Clock, SystemClock};
use tandem_os::config::{ConfigError, TandemConfig};
use tandem_os::recovery::{LedgerStatusReport, OrphanSweepMetrics, RecoverySweepMetrics};
use tandem_os::retry::{RetryExhausted, RetryPolicy};
use tandem_os::{
    CoordinatorError, RecoverySweeper, StorageParticipant, StorageParticipantError,
    TransactionCoordinator,
};
use tandem_storage::{StorageError, TransactionLedgerStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ledger(#[from] StorageError),
    #[error(transparent)]
    ObjectStore(#[from] StorageParticipantError),
    #[error("object store not ready: {0}")]
    ObjectStoreNotReady(#[from] RetryExhausted<StorageParticipantError>),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
    #[error("recovery worker task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct RecoveryWorkerCounters {
    pub recovery_pass_count: u64,
    pub timed_out_total: u64,
    pub aborted_total: u64,
    pub committed_total: u64,
    pub skipped_total: u64,
    pub failed_total: u64,
    pub orphan_pass_count: u64,
    pub orphans_deleted_total: u64,
    pub orphans_failed_total: u64,
    pub retention_rows_deleted_total: u64,
    pub pass_errors_total: u64,
    pub last_recovery_pass_at_ns: Option<u64>,
    pub last_orphan_pass_at_ns: Option<u64>,
    pub last_error: Option<String>,
}

impl RecoveryWorkerCounters {
    fn record_recovery(&mut self, m: &RecoverySweepMetrics, now_ns: u64) {
        self.recovery_pass_count = self.recovery_pass_count.saturating_add(1);
        self.timed_out_total = self.timed_out_total.saturating_add(m.timed_out_count as u64);
        self.aborted_total = self.aborted_total.saturating_add(m.aborted_count as u64);
        self.committed_total = self.committed_total.saturating_add(m.committed_count as u64);
        self.skipped_total = self.skipped_total.saturating_add(m.skipped_count as u64);
        self.failed_total = self.failed_total.saturating_add(m.failed_count as u64);
        self.last_recovery_pass_at_ns = Some(now_ns);
    }

    fn record_orphans(&mut self, m: &OrphanSweepMetrics, now_ns: u64) {
        self.orphan_pass_count = self.orphan_pass_count.saturating_add(1);
        self.orphans_deleted_total = self.orphans_deleted_total.saturating_add(m.deleted_count as u64);
        self.orphans_failed_total = self.orphans_failed_total.saturating_add(m.failed_count as u64);
        self.last_orphan_pass_at_ns = Some(now_ns);
    }

    fn record_error(&mut self, reason: String) {
        self.pass_errors_total = self.pass_errors_total.saturating_add(1);
        self.last_error = Some(reason);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub bucket: String,
    pub ledger_durable: bool,
    pub ledger: Option<LedgerStatusReport>,
    pub worker: RecoveryWorkerCounters,
}

impl AdapterHealthResponse {
    pub fn unhealthy(reason: String) -> Self {
        Self {
            status: "error".to_string(),
            outcome: "UNHEALTHY".to_string(),
            reason: Some(reason),
            bucket: String::new(),
            ledger_durable: false,
            ledger: None,
            worker: RecoveryWorkerCounters::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManualRecoverResponse {
    pub status: String,
    pub outcome: String,
    pub transaction_id: String,
    pub state: Option<String>,
    pub reason: Option<String>,
}

impl ManualRecoverResponse {
    pub fn rejected(transaction_id: String, reason: String) -> Self {
        Self {
            status: "error".to_string(),
            outcome: "REJECTED".to_string(),
            transaction_id,
            state: None,
            reason: Some(reason),
        }
    }
}

/// Process-wide wiring: ledger, object store, coordinator, sweeper and the
/// recovery worker's counters. Cheap to clone.
#[derive(Clone)]
pub struct AdapterRuntime {
    config: TandemConfig,
    coordinator: TransactionCoordinator<TransactionLedgerStore>,
    sweeper: RecoverySweeper<TransactionLedgerStore>,
    counters: Arc<Mutex<RecoveryWorkerCounters>>,
    ledger_durable: bool,
}

impl AdapterRuntime {
    pub async fn default_from_env() -> Result<Self, AdapterError> {
        Self::from_config(TandemConfig::from_env()?).await
    }

    /// Replays the ledger journal and waits for the object store to answer.
    pub async fn from_config(config: TandemConfig) -> Result<Self, AdapterError> {
        let store = TransactionLedgerStore::open_with_journal(&config.ledger_journal_path)?;
        let storage = StorageParticipant::from_config(&config.object_store)?;
        storage
            .ensure_ready(&RetryPolicy::connect(
                config.object_store.connect_max_attempts,
            ))
            .await?;
        Ok(Self::new(config, store, storage, Arc::new(SystemClock)))
    }

    pub fn new(
        config: TandemConfig,
        store: TransactionLedgerStore,
        storage: StorageParticipant,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ledger_durable = store.is_durable();
        let coordinator = TransactionCoordinator::new(
            Arc::new(Mutex::new(store)),
            storage,
            clock,
            config.coordinator,
        );
        let sweeper = RecoverySweeper::new(coordinator.clone(), config.recovery.retention);
        Self {
            config,
            coordinator,
            sweeper,
            counters: Arc::new(Mutex::new(RecoveryWorkerCounters::default())),
            ledger_durable,
        }
    }

    pub fn config(&self) -> &TandemConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<TransactionLedgerStore> {
        &self.coordinator
    }

    pub fn sweeper(&self) -> &RecoverySweeper<TransactionLedgerStore> {
        &self.sweeper
    }

    pub fn counters(&self) -> Result<RecoveryWorkerCounters, AdapterError> {
        Ok(self
            .counters
            .lock()
            .map_err(|_| AdapterError::Poisoned("recovery worker counters"))?
            .clone())
    }

    pub fn health_report(&self) -> Result<AdapterHealthResponse, AdapterError> {
        let ledger = self.sweeper.status_report()?;
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            bucket: self.coordinator.storage().bucket().to_string(),
            ledger_durable: self.ledger_durable,
            ledger: Some(ledger),
            worker: self.counters()?,
        })
    }

    pub async fn manual_recover(
        &self,
        transaction_id: &str,
    ) -> Result<ManualRecoverResponse, AdapterError> {
        let id = TransactionId::new(transaction_id)?;
        let resolution = self.sweeper.manual_recover(&id).await?;
        let reason = match &resolution {
            tandem_os::RecoveryResolution::StillCommitting { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        Ok(ManualRecoverResponse {
            status: "ok".to_string(),
            outcome: resolution.label().to_string(),
            transaction_id: id.to_string(),
            state: Some(resolution.row().state.to_string()),
            reason,
        })
    }

    /// Worker entry points: failures are logged and counted, never returned.
    pub async fn run_recovery_pass(&self) {
        let now_ns = self.coordinator.now().0;
        match self.sweeper.run_recovery_pass().await {
            Ok(m) => self.update_counters(|c| c.record_recovery(&m, now_ns)),
            Err(e) => {
                warn!(error = %e, "recovery pass failed");
                self.update_counters(|c| c.record_error(e.to_string()));
            }
        }
    }

    pub async fn run_orphan_and_retention_pass(&self) {
        let now_ns = self.coordinator.now().0;
        match self.sweeper.run_orphan_pass().await {
            Ok(m) => self.update_counters(|c| c.record_orphans(&m, now_ns)),
            Err(e) => {
                warn!(error = %e, "orphan pass failed");
                self.update_counters(|c| c.record_error(e.to_string()));
            }
        }
        match self.sweeper.run_retention_pass() {
            Ok(removed) => self.update_counters(|c| {
                c.retention_rows_deleted_total =
                    c.retention_rows_deleted_total.saturating_add(removed as u64)
            }),
            Err(e) => {
                warn!(error = %e, "retention pass failed");
                self.update_counters(|c| c.record_error(e.to_string()));
            }
        }
    }

    pub fn log_status_report(&self) {
        match self.sweeper.status_report() {
            Ok(report) => info!(
                active = report.active_count,
                counts = ?report.counts_by_state,
                preparing = report.preparing.len(),
                committing = report.committing.len(),
                "transaction ledger status"
            ),
            Err(e) => warn!(error = %e, "status report failed"),
        }
    }

    fn update_counters(&self, f: impl FnOnce(&mut RecoveryWorkerCounters)) {
        match self.counters.lock() {
            Ok(mut counters) => f(&mut counters),
            Err(_) => warn!("recovery worker counters lock poisoned"),
        }
    }
}

/// Background task owning the recovery, orphan/retention and status timers.
/// Started and stopped by the process; nothing runs after [`stop`](Self::stop).
pub struct RecoveryWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RecoveryWorker {
    pub fn start(runtime: AdapterRuntime) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let cfg = runtime.config().recovery;
        let handle = tokio::spawn(async move {
            let mut recovery_tick = interval(cfg.recovery_interval);
            let mut orphan_tick = interval(cfg.orphan_sweep_interval);
            let mut status_tick = interval(cfg.status_report_interval);
            for ticker in [&mut recovery_tick, &mut orphan_tick, &mut status_tick] {
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
            info!(
                recovery_interval_secs = cfg.recovery_interval.as_secs(),
                orphan_sweep_interval_secs = cfg.orphan_sweep_interval.as_secs(),
                status_report_interval_secs = cfg.status_report_interval.as_secs(),
                "recovery worker started"
            );
            loop {
                tokio::select! {
                    _ = recovery_tick.tick() => runtime.run_recovery_pass().await,
                    _ = orphan_tick.tick() => runtime.run_orphan_and_retention_pass().await,
                    _ = status_tick.tick() => runtime.log_status_report(),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("recovery worker stopped");
        });
        Self { shutdown, handle }
    }

    pub async fn stop(self) -> Result<(), AdapterError> {
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| AdapterError::Worker(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use tandem_contracts::txlog::TransactionState;
    use tandem_contracts::TimestampNs;
    use tandem_os::clock::ManualClock;
    use tandem_os::config::{LEDGER_JOURNAL_PATH_ENV, RECOVERY_INTERVAL_SECS_ENV};

    const OPS: &str = "[{\"op\":\"insert\"}]";

    fn test_config(journal: &std::path::Path) -> TandemConfig {
        let journal = journal.to_string_lossy().to_string();
        TandemConfig::from_env_with(move |k| match k {
            LEDGER_JOURNAL_PATH_ENV => Some(journal.clone()),
            RECOVERY_INTERVAL_SECS_ENV => Some("1".to_string()),
            _ => None,
        })
        .unwrap()
    }

    fn temp_journal(tag: &str) -> std::path::PathBuf {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("tandem_adapter_{tag}_{seed}"))
            .join("transaction_log.jsonl")
    }

    fn in_memory_runtime(clock: Arc<ManualClock>) -> AdapterRuntime {
        AdapterRuntime::new(
            test_config(&temp_journal("unused")),
            TransactionLedgerStore::new_in_memory(),
            StorageParticipant::in_memory("import-files"),
            clock,
        )
    }

    async fn prepared(runtime: &AdapterRuntime, data: &'static [u8]) -> TransactionId {
        let c = runtime.coordinator();
        let id = c
            .begin_transaction(data, "import.json")
            .unwrap()
            .row()
            .transaction_id
            .clone();
        c.prepare_storage(&id, Bytes::from_static(data)).await.unwrap();
        c.prepare_database(&id, OPS).await.unwrap();
        id
    }

    #[tokio::test]
    async fn at_adapter_01_health_report_reflects_ledger() {
        let clock = Arc::new(ManualClock::new(TimestampNs(1_000)));
        let runtime = in_memory_runtime(clock);
        prepared(&runtime, b"one").await;

        let health = runtime.health_report().unwrap();
        assert_eq!(health.outcome, "HEALTHY");
        assert_eq!(health.bucket, "import-files");
        assert!(!health.ledger_durable);
        let ledger = health.ledger.unwrap();
        assert_eq!(ledger.active_count, 1);
        assert_eq!(ledger.counts_by_state["PREPARED"], 1);

        let json = serde_json::to_value(&runtime.health_report().unwrap()).unwrap();
        assert_eq!(json["ledger"]["counts_by_state"]["PREPARED"], 1);
    }

    #[tokio::test]
    async fn at_adapter_02_recovery_pass_updates_counters() {
        let clock = Arc::new(ManualClock::new(TimestampNs(1_000)));
        let runtime = in_memory_runtime(clock.clone());
        let id = prepared(&runtime, b"stuck").await;
        clock.advance(Duration::from_secs(601));

        runtime.run_recovery_pass().await;
        runtime.run_orphan_and_retention_pass().await;
        let counters = runtime.counters().unwrap();
        assert_eq!(counters.recovery_pass_count, 1);
        assert_eq!(counters.aborted_total, 1);
        assert_eq!(counters.orphan_pass_count, 1);
        assert_eq!(counters.pass_errors_total, 0);
        assert_eq!(
            runtime.coordinator().load(&id).unwrap().state,
            TransactionState::Aborted
        );
    }

    #[tokio::test]
    async fn at_adapter_03_manual_recover_reports_resolution() {
        let clock = Arc::new(ManualClock::new(TimestampNs(1_000)));
        let runtime = in_memory_runtime(clock);
        let id = prepared(&runtime, b"manual").await;

        let response = runtime.manual_recover(id.as_str()).await.unwrap();
        assert_eq!(response.outcome, "ABORTED");
        assert_eq!(response.state.as_deref(), Some("ABORTED"));

        assert!(matches!(
            runtime.manual_recover("missing").await,
            Err(AdapterError::Coordinator(CoordinatorError::NotFound(_)))
        ));
        assert!(matches!(
            runtime.manual_recover("bad/id").await,
            Err(AdapterError::Contract(_))
        ));
    }

    #[tokio::test]
    async fn at_adapter_04_ledger_survives_restart() {
        let journal = temp_journal("restart");
        let id = {
            let runtime = AdapterRuntime::from_config(test_config(&journal)).await.unwrap();
            assert!(runtime.health_report().unwrap().ledger_durable);
            let id = prepared(&runtime, b"durable").await;
            runtime.coordinator().commit(&id, "55").await.unwrap();
            id
        };

        let reopened = AdapterRuntime::from_config(test_config(&journal)).await.unwrap();
        let row = reopened.coordinator().load(&id).unwrap();
        assert_eq!(row.state, TransactionState::Committed);
        assert_eq!(row.import_result_ref.as_deref(), Some("55"));
        let again = reopened
            .coordinator()
            .begin_transaction(b"durable", "import.json")
            .unwrap();
        assert!(again.is_already_committed());

        if let Some(dir) = journal.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn at_adapter_05_worker_runs_passes_until_stopped() {
        let clock = Arc::new(ManualClock::new(TimestampNs(1_000)));
        let runtime = in_memory_runtime(clock);
        let worker = RecoveryWorker::start(runtime.clone());

        let mut passes = 0;
        for _ in 0..200 {
            passes = runtime.counters().unwrap().recovery_pass_count;
            if passes > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(passes > 0);

        worker.stop().await.unwrap();
        let after_stop = runtime.counters().unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(runtime.counters().unwrap(), after_stop);
    }
}
