//! HTTP API for health checks, status, and atomic transaction broadcast

use crate::config::ApiConfig;
use crate::coordination::CoordinationEngine;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{AtomicTxRequest, AtomicTxResult, ChainId};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CoordinationEngine>,
    pub instance_id: String,
    pub started: Instant,
}

impl AppState {
    pub fn new(engine: Arc<CoordinationEngine>, instance_id: impl Into<String>) -> Self {
        Self {
            engine,
            instance_id: instance_id.into(),
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/chains", get(get_chains))
        .route("/atomic-tx", post(submit_atomic_tx))
        .with_state(state)
}

/// Run the HTTP API server until the engine's root scope is cancelled
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    let shutdown = state.engine.shutdown().clone();
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| CoordinatorError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Get node status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.instance_id.clone(),
        uptime_seconds: state.started.elapsed().as_secs(),
        lock_scope: format!("{:?}", state.engine.executor().scope()),
        chains: chain_status(&state),
    })
}

/// Get registered chains
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChainsResponse {
        chains: state.engine.registry().chain_ids(),
    })
}

/// Run an atomic transaction on every participant chain
async fn submit_atomic_tx(
    State(state): State<AppState>,
    Json(body): Json<AtomicTxBody>,
) -> Result<Json<AtomicTxResponse>, ApiError> {
    let txs = body
        .txs
        .iter()
        .enumerate()
        .map(|(index, tx)| {
            hex::decode(tx.trim_start_matches("0x")).map_err(|e| {
                CoordinatorError::DecodeFailure(format!("tx {} is not valid hex: {}", index, e))
            })
        })
        .collect::<CoordinatorResult<Vec<_>>>()?;

    let request = AtomicTxRequest::new(txs, body.chain_ids, body.leader_chain_id);
    let atomic_txhash = hex::encode(request.hash());
    let results = state.engine.broadcast_atomic_transaction(request).await?;

    Ok(Json(AtomicTxResponse {
        atomic_txhash,
        results,
    }))
}

fn chain_status(state: &AppState) -> Vec<ChainStatus> {
    let registry = state.engine.registry();
    registry
        .chain_ids()
        .into_iter()
        .filter_map(|chain_id| {
            let handle = registry.resolve(&chain_id).ok()?;
            Some(ChainStatus {
                name: handle.name().to_string(),
                height: handle.latest_height(),
                chain_id,
            })
        })
        .collect()
}

/// Coordinator errors rendered as JSON with a matching status code
pub struct ApiError(CoordinatorError);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_validation() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_aborted() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            match self.0 {
                CoordinatorError::ChainNotFound { .. } => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        };
        warn!("Atomic transaction request failed: {}", self.0);
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// Request and response types

#[derive(Debug, Deserialize)]
pub struct AtomicTxBody {
    /// Hex-encoded sub-transactions
    pub txs: Vec<String>,
    pub chain_ids: Vec<ChainId>,
    pub leader_chain_id: ChainId,
}

#[derive(Debug, Serialize)]
pub struct AtomicTxResponse {
    pub atomic_txhash: String,
    pub results: BTreeMap<ChainId, AtomicTxResult>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ChainStatus {
    chain_id: ChainId,
    name: String,
    height: u64,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    instance_id: String,
    uptime_seconds: u64,
    lock_scope: String,
    chains: Vec<ChainStatus>,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainId>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainHandle, ChainRegistry, EnvelopeRouter, LedgerApp, MultiStore, SubTxEnvelope};
    use crate::config::CoordinationConfig;
    use crate::shutdown::Shutdown;
    use chrono::Utc;
    use serde_json::json;

    fn state() -> AppState {
        let registry = ChainRegistry::new();
        for id in ["x", "y"] {
            let store = Arc::new(MultiStore::new());
            LedgerApp::new().seed(&store, &BTreeMap::from([("alice".to_string(), 10u64)]));
            store.init_genesis(1, Utc::now());
            registry.register(Arc::new(ChainHandle::new(id.into(), id, store, Arc::new(LedgerApp::new()))));
        }
        let engine = CoordinationEngine::new(
            Arc::new(registry),
            Arc::new(EnvelopeRouter),
            &CoordinationConfig::default(),
            Shutdown::new(),
        );
        AppState::new(Arc::new(engine), "test-node")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_atomic_tx() {
        let body = AtomicTxBody {
            txs: vec![
                hex::encode(SubTxEnvelope::new("x", json!({"op": "debit", "account": "alice", "amount": 4})).encode()),
                hex::encode(SubTxEnvelope::new("y", json!({"op": "credit", "account": "alice", "amount": 4})).encode()),
            ],
            chain_ids: vec!["x".into(), "y".into()],
            leader_chain_id: "x".into(),
        };

        let Json(response) = submit_atomic_tx(State(state()), Json(body)).await.ok().unwrap();
        assert_eq!(response.results.len(), 2);
        assert!(response.results.values().all(AtomicTxResult::all_succeeded));
        assert_eq!(response.atomic_txhash.len(), 64);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_hex() {
        let body = AtomicTxBody {
            txs: vec!["zz".to_string()],
            chain_ids: vec!["x".into()],
            leader_chain_id: "x".into(),
        };

        let err = submit_atomic_tx(State(state()), Json(body)).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_participant_is_not_found() {
        let body = AtomicTxBody {
            txs: vec![hex::encode(SubTxEnvelope::new("w", json!({})).encode())],
            chain_ids: vec!["w".into()],
            leader_chain_id: "w".into(),
        };

        let err = submit_atomic_tx(State(state()), Json(body)).await.err().unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_lists_chain_heights() {
        let state = state();
        let chains = chain_status(&state);
        assert_eq!(chains.len(), 2);
        assert!(chains.iter().all(|c| c.height == 1));
    }
}
