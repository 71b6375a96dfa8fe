use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Extension, FromRequest, Path, Request},
    http::{HeaderMap, HeaderName, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value as JsonValue, json};
use tokio::sync::Mutex;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::{
    cluster::{NodeConfig, node_url},
    protocol::{REPLICATE_PATH, ReplicationOp},
    replication::{ReplicationError, Replicator},
    store::{Store, Value},
};

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<NodeConfig>,
    pub store: Arc<Store>,
    pub replicator: Replicator,
    /// Used to relay follower writes to the leader.
    pub client: reqwest::Client,
    /// Held across "mutate, then replicate" so leader writes complete one at a time.
    pub write_gate: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(node: NodeConfig, store: Arc<Store>, client: reqwest::Client) -> Self {
        let replicator = Replicator::new(client.clone(), node.peers.clone());
        Self {
            node: Arc::new(node),
            store,
            replicator,
            client,
            write_gate: Arc::new(Mutex::new(())),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, JsonValue>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: JsonValue) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn no_such_key(key: &str) -> Self {
        Self::not_found(format!("no such key: '{key}'"))
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new("upstream_unavailable", StatusCode::BAD_GATEWAY, message)
    }

    pub fn replication_failed(message: impl Into<String>) -> Self {
        Self::new(
            "replication_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
        )
    }

    pub fn timeout() -> Self {
        Self::new(
            "timeout",
            StatusCode::REQUEST_TIMEOUT,
            "request did not complete in time",
        )
    }
}

impl From<ReplicationError> for ApiError {
    fn from(value: ReplicationError) -> Self {
        ApiError::replication_failed(value.to_string())
            .with_detail("peer", json!(value.peer))
            .with_detail("applied_peers", json!(value.applied))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
    code: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    details: Map<String, JsonValue>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            message: self.message,
            code: self.code.to_string(),
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

/// JSON body extractor that reports every failure as `invalid_request`.
///
/// Parses with `serde_json` directly so `RawValue` fields keep their exact text and
/// no particular `content-type` is required.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::invalid_request(format!("invalid json body: {e}")))?;
        Ok(Self(value))
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            message: "success".to_string(),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    fn success_empty() -> Self {
        Self {
            message: "success".to_string(),
            data: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct PutBody {
    pub value: Value,
}

/// [`build_router`] plus the per-request timeout and request tracing.
pub fn build_app(state: AppState, request_timeout: Duration) -> Router {
    build_router(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::map_response(timeout_error_body))
        .layer(TraceLayer::new_for_http())
}

// `TimeoutLayer` answers with a bare 408; give it the usual error body.
async fn timeout_error_body(response: Response) -> Response {
    if response.status() == StatusCode::REQUEST_TIMEOUT
        && !response.headers().contains_key(header::CONTENT_TYPE)
    {
        return ApiError::timeout().into_response();
    }
    response
}

pub fn build_router(state: AppState) -> Router {
    let writes = Router::new()
        .route("/put/", put(put_value))
        .route("/put/:key", put(put_value))
        .route("/delete/", delete(delete_value))
        .route("/delete/:key", delete(delete_value))
        .route_layer(middleware::from_fn(forward_follower_writes));

    Router::new()
        .route("/get/:key", get(get_value))
        .route(REPLICATE_PATH, post(apply_replicated))
        .route("/health", get(health))
        .merge(writes)
        .fallback(fallback_not_found)
        .layer(Extension(state))
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}

fn require_key(key: Option<Path<String>>) -> Result<String, ApiError> {
    match key {
        Some(Path(key)) if !key.is_empty() => Ok(key),
        _ => Err(ApiError::invalid_request("key must not be empty")),
    }
}

async fn health(Extension(state): Extension<AppState>) -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "role": if state.node.is_leader() { "leader" } else { "follower" },
        "self": state.node.self_addr,
        "leader": state.node.leader_addr,
        "peers": state.node.peers,
        "keys": state.store.len().await,
    }))
}

async fn get_value(
    Extension(state): Extension<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ApiResponse<KeyValue>>, ApiError> {
    let value = state
        .store
        .get(&key)
        .await
        .ok_or_else(|| ApiError::no_such_key(&key))?;
    Ok(Json(ApiResponse::success(KeyValue { key, value })))
}

/// Leader only: followers never reach this handler (see [`forward_follower_writes`]).
async fn put_value(
    Extension(state): Extension<AppState>,
    key: Option<Path<String>>,
    ApiJson(body): ApiJson<PutBody>,
) -> Result<Json<ApiResponse<KeyValue>>, ApiError> {
    let key = require_key(key)?;
    let op = ReplicationOp::put(key.clone(), body.value.clone());

    let _gate = state.write_gate.lock().await;
    state.store.put(key.clone(), body.value.clone()).await;
    // The local write stays applied even if a peer fails below.
    state.replicator.replicate(&op).await?;

    Ok(Json(ApiResponse::success(KeyValue {
        key,
        value: body.value,
    })))
}

async fn delete_value(
    Extension(state): Extension<AppState>,
    key: Option<Path<String>>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let key = require_key(key)?;

    let _gate = state.write_gate.lock().await;
    if !state.store.delete(&key).await {
        return Err(ApiError::no_such_key(&key));
    }
    state
        .replicator
        .replicate(&ReplicationOp::delete(key))
        .await?;

    Ok(Json(ApiResponse::success_empty()))
}

/// Applies an operation pushed by the leader straight to the local store. No
/// forwarding and no further replication happen here.
async fn apply_replicated(
    Extension(state): Extension<AppState>,
    ApiJson(op): ApiJson<ReplicationOp>,
) -> Result<StatusCode, ApiError> {
    op.validate().map_err(ApiError::invalid_request)?;
    let key = op.key.clone();
    let kind = op.kind;
    let outcome = state.store.apply(op).await;
    debug!(key = %key, op = kind.as_str(), ?outcome, "applied replicated operation");
    Ok(StatusCode::OK)
}

async fn forward_follower_writes(req: Request<Body>, next: Next) -> Response {
    let Some(state) = req.extensions().get::<AppState>().cloned() else {
        return ApiError::new(
            "internal",
            StatusCode::INTERNAL_SERVER_ERROR,
            "missing AppState extension",
        )
        .into_response();
    };
    if state.node.is_leader() {
        return next.run(req).await;
    }

    match forward_to_leader(&state.client, &state.node.leader_addr, req).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

const HOP_BY_HOP_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::HOST,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP_HEADERS {
        out.remove(name);
    }
    out.remove("keep-alive");
    out
}

/// Same as axum's default body limit, which the leader applies to writes.
const MAX_FORWARD_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Replays `req` against the leader and relays status, headers and body as-is.
pub async fn forward_to_leader(
    client: &reqwest::Client,
    leader_addr: &str,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let url = node_url(leader_addr, path_and_query);

    let body = axum::body::to_bytes(body, MAX_FORWARD_BODY_BYTES)
        .await
        .map_err(|e| ApiError::invalid_request(format!("read request body: {e}")))?;

    let upstream = client
        .request(parts.method.clone(), &url)
        .headers(end_to_end_headers(&parts.headers))
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!(leader = %leader_addr, url = %url, error = %e, "forward to leader failed");
            ApiError::upstream_unavailable(e.to_string())
        })?;

    let status = upstream.status();
    let headers = end_to_end_headers(upstream.headers());
    let bytes = upstream.bytes().await.map_err(|e| {
        warn!(leader = %leader_addr, url = %url, error = %e, "read leader response failed");
        ApiError::upstream_unavailable(e.to_string())
    })?;

    debug!(method = %parts.method, url = %url, %status, "forwarded write to leader");
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
