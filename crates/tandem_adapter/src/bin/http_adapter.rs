#![forbid(unsafe_code)]

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tandem_adapter::{
    AdapterError, AdapterHealthResponse, AdapterRuntime, ManualRecoverResponse, RecoveryWorker,
};
use tandem_os::CoordinatorError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = AdapterRuntime::default_from_env().await?;
    let addr = runtime.config().http_bind;
    let worker_enabled = runtime.config().recovery.worker_enabled;
    let worker = worker_enabled.then(|| RecoveryWorker::start(runtime.clone()));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/recovery/:transaction_id", post(manual_recover))
        .with_state(runtime);

    info!(%addr, worker_enabled, "tandem_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(worker) = worker {
        worker.stop().await?;
    }
    info!("tandem_adapter_http stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}

async fn healthz(State(runtime): State<AdapterRuntime>) -> (StatusCode, Json<AdapterHealthResponse>) {
    match runtime.health_report() {
        Ok(report) => (StatusCode::OK, Json(report)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdapterHealthResponse::unhealthy(e.to_string())),
        ),
    }
}

async fn manual_recover(
    State(runtime): State<AdapterRuntime>,
    Path(transaction_id): Path<String>,
) -> (StatusCode, Json<ManualRecoverResponse>) {
    match runtime.manual_recover(&transaction_id).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(e) => {
            warn!(transaction_id = %transaction_id, error = %e, "manual recovery rejected");
            (
                status_for(&e),
                Json(ManualRecoverResponse::rejected(transaction_id, e.to_string())),
            )
        }
    }
}

fn status_for(e: &AdapterError) -> StatusCode {
    match e {
        AdapterError::Contract(_) => StatusCode::BAD_REQUEST,
        AdapterError::Coordinator(CoordinatorError::NotFound(_)) => StatusCode::NOT_FOUND,
        AdapterError::Coordinator(
            CoordinatorError::InvalidState { .. } | CoordinatorError::ConcurrentModification(_),
        ) => StatusCode::CONFLICT,
        AdapterError::Coordinator(CoordinatorError::LedgerUnavailable(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
