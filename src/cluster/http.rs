//! JSON gateway
//!
//! Serves one peer's KV surface over HTTP in the shape of the etcd v3 JSON
//! gateway: every call is a POST of the request message, keys and values
//! are base64. Errors come back as `{"error": kind, "message": text}`.

use crate::cluster::raft_node::RaftStatus;
use crate::common::Error;
use crate::store::{
    CompactionRequest, CompactionResponse, DeleteRangeRequest, DeleteRangeResponse,
    HashKvResponse, KvServer, LeaseGrantRequest, LeaseGrantResponse, LeaseRevokeRequest,
    LeaseRevokeResponse, PutRequest, PutResponse, RangeRequest, RangeResponse, TxnRequest,
    TxnResponse,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared state for handlers
#[derive(Clone)]
pub struct GatewayState {
    pub kv: KvServer,
    pub status: watch::Receiver<RaftStatus>,
}

/// Error wrapper rendering [`Error`] as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            tracing::warn!("gateway: {}", self.0);
        }
        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct HashKvRequest {
    #[serde(default)]
    revision: i64,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    health: String,
    reason: String,
}

/// Build the gateway router. `body_limit` caps request bodies; base64
/// inflates payloads, so callers pass a multiple of the request limit.
pub fn create_router(state: GatewayState, body_limit: usize) -> Router {
    Router::new()
        .route("/v3/kv/range", post(range))
        .route("/v3/kv/put", post(put))
        .route("/v3/kv/deleterange", post(delete_range))
        .route("/v3/kv/txn", post(txn))
        .route("/v3/kv/compaction", post(compaction))
        .route("/v3/lease/grant", post(lease_grant))
        .route("/v3/lease/revoke", post(lease_revoke))
        .route("/v3/maintenance/hashkv", post(hash_kv))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn range(State(state): State<GatewayState>, Json(req): Json<RangeRequest>) -> ApiResult<RangeResponse> {
    Ok(Json(state.kv.range(req).await?))
}

async fn put(State(state): State<GatewayState>, Json(req): Json<PutRequest>) -> ApiResult<PutResponse> {
    Ok(Json(state.kv.put(req).await?))
}

async fn delete_range(
    State(state): State<GatewayState>,
    Json(req): Json<DeleteRangeRequest>,
) -> ApiResult<DeleteRangeResponse> {
    Ok(Json(state.kv.delete_range(req).await?))
}

async fn txn(State(state): State<GatewayState>, Json(req): Json<TxnRequest>) -> ApiResult<TxnResponse> {
    Ok(Json(state.kv.txn(req).await?))
}

async fn compaction(
    State(state): State<GatewayState>,
    Json(req): Json<CompactionRequest>,
) -> ApiResult<CompactionResponse> {
    Ok(Json(state.kv.compact(req).await?))
}

async fn lease_grant(
    State(state): State<GatewayState>,
    Json(req): Json<LeaseGrantRequest>,
) -> ApiResult<LeaseGrantResponse> {
    Ok(Json(state.kv.lease_grant(req).await?))
}

async fn lease_revoke(
    State(state): State<GatewayState>,
    Json(req): Json<LeaseRevokeRequest>,
) -> ApiResult<LeaseRevokeResponse> {
    Ok(Json(state.kv.lease_revoke(req).await?))
}

async fn hash_kv(State(state): State<GatewayState>, Json(req): Json<HashKvRequest>) -> ApiResult<HashKvResponse> {
    Ok(Json(state.kv.hash_kv(req.revision).await?))
}

async fn status(State(state): State<GatewayState>) -> Json<RaftStatus> {
    Json(state.status.borrow().clone())
}

/// 200 while a leader is known
async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let leader = state.status.borrow().leader_id;
    if leader != 0 {
        (
            StatusCode::OK,
            Json(HealthResponse {
                health: "true".into(),
                reason: String::new(),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                health: "false".into(),
                reason: "no leader".into(),
            }),
        )
    }
}
