use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use groat_consensus::Validator;
use groat_core::{BlockchainError, MessageType, Transaction, MAX_HASH_RANGE};
use groat_mempool::Mempool;
use groat_network::{Envelope, PeerClient, PeerRegistry};
use groat_storage::ChainStore;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared handler context. Every dependency is explicit; handlers never
/// reach for globals.
#[derive(Clone)]
pub struct RpcState {
    pub store: Arc<ChainStore>,
    pub mempool: Arc<Mempool>,
    pub peers: Arc<PeerRegistry>,
    pub client: Arc<PeerClient>,
    pub validator: Validator,
    /// Canonical JSON of the local `network` config table.
    pub network: Arc<Value>,
    pub inbound: mpsc::Sender<Envelope>,
    pub own_host: String,
}

pub async fn serve(addr: SocketAddr, state: RpcState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Public and peer surfaces on one router; both are served from the node
/// port.
pub fn router(state: RpcState) -> Router {
    Router::new()
        // public
        .route("/status/", get(get_status))
        .route("/nodes/", get(get_nodes))
        .route("/address/:address/balance", get(get_balance))
        .route("/address/:address/transactions", get(get_history))
        .route("/transactions/", post(post_transaction))
        .route("/transactions/:tx_hash", get(get_transaction))
        .route("/unconfirmed_tx/", get(get_unconfirmed))
        .route("/unconfirmed_tx/count", get(get_unconfirmed_count))
        .route("/unconfirmed_tx/:tx_hash", get(get_unconfirmed_tx))
        // peer
        .route("/connect/", post(post_connect))
        .route("/inbox/", post(post_inbox))
        .route("/blocks/start/:start/end/:end", get(get_blocks_range))
        .route("/transactions/block_hash/:block_hash", get(get_block_txs))
        .route("/blocks/hash/:block_hash", get(get_block_by_hash))
        .route("/blocks/height/:height", get(get_block_by_height))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn store_failure(err: BlockchainError) -> Response {
    warn!(%err, "request failed against the store");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "reason": err.to_string()})),
    )
        .into_response()
}

fn not_found(reason: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "reason": reason})),
    )
        .into_response()
}

async fn get_status(State(state): State<RpcState>) -> Json<Value> {
    Json(state.network.as_ref().clone())
}

async fn get_nodes(State(state): State<RpcState>) -> Json<Value> {
    Json(json!({ "full_nodes": state.peers.get_all_peers() }))
}

async fn get_balance(
    State(state): State<RpcState>,
    Path(address): Path<String>,
) -> Response {
    match state.store.get_balance(&address) {
        Ok(balance) => Json(balance).into_response(),
        Err(err) => store_failure(err),
    }
}

async fn get_history(
    State(state): State<RpcState>,
    Path(address): Path<String>,
) -> Response {
    match state.store.get_transaction_history(&address) {
        Ok(history) => Json(history).into_response(),
        Err(err) => store_failure(err),
    }
}

/// Confirmed transactions first, then the mempool, so inventory pulls work
/// for both.
async fn get_transaction(
    State(state): State<RpcState>,
    Path(tx_hash): Path<String>,
) -> Response {
    match state.store.get_transaction_by_hash(&tx_hash) {
        Ok(Some((tx, _))) => Json(tx).into_response(),
        Ok(None) => match state.mempool.get(&tx_hash) {
            Some(tx) => Json(tx).into_response(),
            None => not_found("Transaction Not Found"),
        },
        Err(err) => store_failure(err),
    }
}

async fn post_transaction(
    State(state): State<RpcState>,
    Json(body): Json<Value>,
) -> Response {
    let Ok(tx) = serde_json::from_value::<Transaction>(body["transaction"].clone()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "reason": "Malformed transaction"})),
        )
            .into_response();
    };
    if tx.tx_hash != tx.calculate_hash() {
        warn!(claimed = %tx.tx_hash, "submitted transaction hash does not recompute");
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({"success": false, "reason": "Invalid transaction hash"})),
        )
            .into_response();
    }
    let already_known = state.mempool.contains(&tx.tx_hash)
        || match state.store.get_transaction_by_hash(&tx.tx_hash) {
            Ok(found) => found.is_some(),
            Err(err) => return store_failure(err),
        };
    if already_known {
        return (
            StatusCode::CONFLICT,
            Json(json!({"success": false, "reason": "Transaction already known"})),
        )
            .into_response();
    }
    if let Err(err) = state.validator.validate_transaction(&tx) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({"success": false, "reason": err.to_string()})),
        )
            .into_response();
    }
    let tx_hash = tx.tx_hash.clone();
    if !state.mempool.push(tx) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({"success": false, "reason": "Invalid transaction"})),
        )
            .into_response();
    }
    // announce to peers off the request path
    let announce = Envelope::new(
        MessageType::TransactionInv,
        tx_hash.clone(),
        &state.own_host,
    );
    let client = state.client.clone();
    let peers = state.peers.clone();
    tokio::spawn(async move { client.broadcast(&peers, &announce, None).await });
    Json(json!({"success": true, "tx_hash": tx_hash})).into_response()
}

async fn get_unconfirmed(State(state): State<RpcState>) -> Json<Vec<Transaction>> {
    Json(state.mempool.iter_all())
}

async fn get_unconfirmed_count(State(state): State<RpcState>) -> Json<usize> {
    Json(state.mempool.count())
}

async fn get_unconfirmed_tx(
    State(state): State<RpcState>,
    Path(tx_hash): Path<String>,
) -> Response {
    match state.mempool.get(&tx_hash) {
        Some(tx) => Json(tx).into_response(),
        None => not_found("Transaction Not Found"),
    }
}

async fn post_connect(
    State(state): State<RpcState>,
    Json(body): Json<Value>,
) -> Response {
    let Some(host) = body["host"].as_str() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "reason": "Missing host"})),
        )
            .into_response();
    };
    if state.client.status_matches(host, &state.network).await {
        state.peers.add_peer(host);
        Json(json!({"success": true})).into_response()
    } else {
        Json(json!({"success": false})).into_response()
    }
}

async fn post_inbox(
    State(state): State<RpcState>,
    Json(body): Json<Value>,
) -> Response {
    let Ok(envelope) = serde_json::from_value::<Envelope>(body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "reason": "Unknown message type"})),
        )
            .into_response();
    };
    if state.inbound.send(envelope).await.is_err() {
        return store_failure(BlockchainError::Store("inbound queue closed".into()));
    }
    Json(json!({"success": true})).into_response()
}

async fn get_blocks_range(
    State(state): State<RpcState>,
    Path((start, end)): Path<(u64, u64)>,
) -> Response {
    let end = end.min(start.saturating_add(MAX_HASH_RANGE));
    match state.store.get_hashes_range(start, end) {
        Ok(hashes) if !hashes.is_empty() => {
            Json(json!({ "block_hashes": hashes })).into_response()
        }
        Ok(_) => not_found("Invalid block range"),
        Err(err) => store_failure(err),
    }
}

async fn get_block_txs(
    State(state): State<RpcState>,
    Path(block_hash): Path<String>,
) -> Response {
    match state.store.get_transaction_hashes_by_block_hash(&block_hash) {
        Ok(Some(hashes)) => Json(json!({ "tx_hashes": hashes })).into_response(),
        Ok(None) => not_found("Transactions Not Found"),
        Err(err) => store_failure(err),
    }
}

async fn get_block_by_hash(
    State(state): State<RpcState>,
    Path(block_hash): Path<String>,
) -> Response {
    match state.store.get_header_by_hash(&block_hash) {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => not_found("Block Not Found"),
        Err(err) => store_failure(err),
    }
}

async fn get_block_by_height(
    State(state): State<RpcState>,
    Path(height): Path<String>,
) -> Response {
    let resolved = if height == "latest" {
        state.store.tip().map(Some)
    } else {
        match height.parse::<u64>() {
            Ok(h) => state.store.get_header_by_height(h),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"success": false, "reason": "Malformed height"})),
                )
                    .into_response()
            }
        }
    };
    match resolved {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => not_found("Block Not Found"),
        Err(err) => store_failure(err),
    }
}
