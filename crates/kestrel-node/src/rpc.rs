//! HTTP surface: peer message ingress, status, transactions and round control.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kestrel_consensus::{ConsensusError, ConsensusHandle};
use kestrel_core::{Block, ConsensusNodeState};
use kestrel_state::{ChainStore, StateError, Storage, TxPool};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::transport::MESSAGE_PATH;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Consensus worker unavailable")]
    Unavailable,

    #[error("State error: {0}")]
    State(#[from] StateError),
}

impl From<ConsensusError> for RpcError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::WorkerStopped => RpcError::Unavailable,
            other => RpcError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = match &self {
            RpcError::NotFound(_) => StatusCode::NOT_FOUND,
            RpcError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RpcError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            RpcError::State(
                StateError::PoolFull(_)
                | StateError::DuplicateTransaction(_)
                | StateError::TransactionTooLarge { .. },
            ) => StatusCode::BAD_REQUEST,
            RpcError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Shared with handlers
pub struct AppState<S: Storage> {
    pub chain_id: u64,
    pub consensus: ConsensusHandle,
    pub store: Arc<ChainStore<S>>,
    pub pool: Arc<TxPool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub chain_id: u64,
    pub height: u64,
    pub head_block_hash: String,
    pub pool_size: usize,
    pub consensus: ConsensusNodeState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockResponse {
    pub height: u64,
    pub hash: String,
    pub proposer: String,
    pub prev_state_hash: String,
    pub state_hash: String,
    pub tx_root: String,
    pub tx_count: usize,
    /// Round the block was decided in, for blocks after genesis
    pub commit_round: Option<u64>,
    pub commit_signers: usize,
}

impl BlockResponse {
    fn from_block(block: &Block) -> Result<Self, RpcError> {
        let qc = block.quorum_certificate.as_ref();
        Ok(BlockResponse {
            height: block.height(),
            hash: block.hash().map_err(StateError::from)?.to_hex(),
            proposer: block.header.proposer_address.to_hex(),
            prev_state_hash: block.header.prev_state_hash.to_hex(),
            state_hash: block.header.state_hash.to_hex(),
            tx_root: block.header.tx_root.to_hex(),
            tx_count: block.transactions.len(),
            commit_round: qc.map(|qc| qc.round),
            commit_signers: qc.map_or(0, |qc| qc.signer_count()),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxSubmitRequest {
    /// Transaction bytes (hex)
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxSubmitResponse {
    pub hash: String,
    pub status: String,
}

pub fn create_router<S: Storage + 'static>(state: Arc<AppState<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(MESSAGE_PATH, post(post_message::<S>))
        .route("/consensus/state", get(get_consensus_state::<S>))
        .route("/debug/next_view", post(post_next_view::<S>))
        .route("/debug/timeout", post(post_timeout::<S>))
        .route("/status", get(get_status::<S>))
        .route("/tx", post(submit_tx::<S>))
        .route("/block/{height}", get(get_block::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// POST /consensus/message - Bincode envelope from a peer
pub async fn post_message<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> Result<StatusCode, RpcError> {
    state.consensus.submit_bytes(&body).await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /consensus/state - Snapshot of the consensus pointer and QCs
pub async fn get_consensus_state<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<ConsensusNodeState>, RpcError> {
    Ok(Json(state.consensus.node_state().await?))
}

/// POST /debug/next_view
pub async fn post_next_view<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<StatusCode, RpcError> {
    state.consensus.trigger_next_view().await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /debug/timeout
pub async fn post_timeout<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<StatusCode, RpcError> {
    state.consensus.force_timeout().await?;
    Ok(StatusCode::ACCEPTED)
}

/// GET /status
pub async fn get_status<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<StatusResponse>, RpcError> {
    let head = state.store.head()?;
    let consensus = state.consensus.node_state().await?;
    Ok(Json(StatusResponse {
        chain_id: state.chain_id,
        height: head.height(),
        head_block_hash: head.hash().map_err(StateError::from)?.to_hex(),
        pool_size: state.pool.len(),
        consensus,
    }))
}

/// POST /tx - Queue a transaction for the next proposal
pub async fn submit_tx<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
    Json(request): Json<TxSubmitRequest>,
) -> Result<Json<TxSubmitResponse>, RpcError> {
    let data = hex::decode(&request.data)
        .map_err(|e| RpcError::BadRequest(format!("transaction is not hex: {}", e)))?;
    let hash = state.pool.add(data)?;
    debug!(tx = %hash.short(), "Transaction submitted");
    Ok(Json(TxSubmitResponse {
        hash: hash.to_hex(),
        status: "pending".to_string(),
    }))
}

/// GET /block/{height}
pub async fn get_block<S: Storage>(
    State(state): State<Arc<AppState<S>>>,
    Path(height): Path<u64>,
) -> Result<Json<BlockResponse>, RpcError> {
    match state.store.block_at(height)? {
        Some(block) => Ok(Json(BlockResponse::from_block(&block)?)),
        None => Err(RpcError::NotFound(format!(
            "Block at height {} not found",
            height
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_consensus::{
        spawn_consensus, Collaborators, ConsensusConfig, ConsensusMessage, PacemakerConfig,
        Transport,
    };
    use kestrel_core::{Address, GenesisConfig, KeyPair, Step, Validator};
    use kestrel_state::{BlockBuilder, BlockExecutor, MemoryStorage};
    use tokio::task::JoinHandle;

    struct NullTransport;

    impl Transport for NullTransport {
        fn broadcast(&self, _payload: Vec<u8>) {}
        fn send(&self, _to: &Address, _payload: Vec<u8>) {}
    }

    fn app() -> (Arc<AppState<MemoryStorage>>, JoinHandle<()>) {
        let keypair = KeyPair::from_seed_index(1);
        let store = Arc::new(ChainStore::open(MemoryStorage::new()).unwrap());
        store
            .init_genesis(&GenesisConfig {
                chain_id: 3,
                validators: vec![Validator::new(keypair.public, 1)],
            })
            .unwrap();
        let pool = Arc::new(TxPool::default());
        let collaborators = Collaborators::new(
            Arc::new(keypair),
            store.clone(),
            Box::new(BlockBuilder::new(store.clone(), pool.clone())),
            Box::new(BlockExecutor::new(store.clone(), pool.clone())),
            store.clone(),
        );
        let config = ConsensusConfig {
            pacemaker: PacemakerConfig {
                manual_mode: true,
                ..PacemakerConfig::default()
            },
            ..ConsensusConfig::default()
        };
        let (consensus, task) =
            spawn_consensus(config, collaborators, Arc::new(NullTransport), 1).unwrap();
        let state = Arc::new(AppState {
            chain_id: 3,
            consensus,
            store,
            pool,
        });
        (state, task)
    }

    #[tokio::test]
    async fn test_status_reports_genesis() {
        let (state, _task) = app();
        let Json(status) = get_status(State(state)).await.unwrap();
        assert_eq!(status.chain_id, 3);
        assert_eq!(status.height, 0);
        assert_eq!(
            (status.consensus.height, status.consensus.step),
            (1, Step::NewRound)
        );
    }

    #[tokio::test]
    async fn test_submit_tx_and_reject_duplicate() {
        let (state, _task) = app();
        let request = || TxSubmitRequest {
            data: hex::encode(b"payload"),
        };
        let Json(response) = submit_tx(State(state.clone()), Json(request())).await.unwrap();
        assert_eq!(response.status, "pending");
        assert_eq!(state.pool.len(), 1);

        let err = submit_tx(State(state.clone()), Json(request())).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let bad = TxSubmitRequest {
            data: "not hex".to_string(),
        };
        assert!(matches!(
            submit_tx(State(state), Json(bad)).await,
            Err(RpcError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_block_lookup() {
        let (state, _task) = app();
        let Json(genesis) = get_block(State(state.clone()), Path(0)).await.unwrap();
        assert_eq!(genesis.height, 0);
        assert_eq!(genesis.commit_round, None);

        let err = get_block(State(state), Path(5)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_message_ingress_and_round_control() {
        let (state, _task) = app();
        let garbage = post_message(State(state.clone()), Bytes::from_static(b"\xff\x01")).await;
        assert!(matches!(garbage, Err(RpcError::BadRequest(_))));

        // A loopback vote from ourselves is accepted at the boundary
        let keypair = KeyPair::from_seed_index(1);
        let mut vote = kestrel_core::HotstuffMessage::new(
            kestrel_core::MessageType::Vote,
            kestrel_core::View::new(1, 0, Step::NewRound),
            None,
            None,
        );
        let digest = vote.signing_hash().unwrap();
        vote.signature = Some(kestrel_core::PartialSignature {
            signer_address: keypair.address(),
            signature: kestrel_core::sign(&keypair.secret, digest.as_bytes()),
        });
        let bytes = ConsensusMessage::from(vote).encode().unwrap();
        let status = post_message(State(state.clone()), Bytes::from(bytes)).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        post_timeout(State(state.clone())).await.unwrap();
        let Json(snapshot) = get_consensus_state(State(state.clone())).await.unwrap();
        assert_eq!((snapshot.height, snapshot.round), (1, 1));

        post_next_view(State(state.clone())).await.unwrap();
        let Json(snapshot) = get_consensus_state(State(state)).await.unwrap();
        assert_eq!(snapshot.height, 1);
    }
}
