//! HTTP surface: REST admin CRUD under `/api`, the health probe and the
//! MCP endpoint at `POST /mcp`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::broker::Broker;
use crate::error::DextError;
use crate::mcp::{McpHandler, McpRequest, McpResponse};
use crate::types::{CreateServerInput, Pagination, ServerFilter, ServerView, UpdateServerInput};

/// Error wrapper mapping broker errors to HTTP responses
pub struct ApiError(DextError);

impl From<DextError> for ApiError {
    fn from(err: DextError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DextError::Validation(_) => StatusCode::BAD_REQUEST,
            DextError::Conflict(_) => StatusCode::CONFLICT,
            DextError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Serialize)]
struct ListEnvelope {
    data: Vec<ServerView>,
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    enabled: Option<bool>,
    server_type: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
    include_tools: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GetQuery {
    include_tools: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    strict: Option<bool>,
}

/// Build the full router
pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/api/mcp-servers", get(list_servers).post(create_server))
        .route(
            "/api/mcp-servers/:id",
            get(get_server).put(update_server).delete(delete_server),
        )
        .route("/health", get(health))
        .route("/mcp", post(mcp_endpoint))
        .with_state(broker)
}

/// Bind and serve until shutdown
pub async fn serve(broker: Arc<Broker>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(broker);

    tracing::info!("broker listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn list_servers(
    State(broker): State<Arc<Broker>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListEnvelope>, ApiError> {
    let kind = match query.server_type.as_deref() {
        Some(s) => Some(s.parse()?),
        None => None,
    };
    let filter = ServerFilter {
        enabled: query.enabled,
        kind,
    };

    let (data, pagination) = broker.list_server_views(
        &filter,
        query.page.unwrap_or(1),
        query.limit.unwrap_or(20),
        query.include_tools.unwrap_or(false),
    )?;
    Ok(Json(ListEnvelope { data, pagination }))
}

async fn get_server(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<i64>,
    Query(query): Query<GetQuery>,
) -> Result<Json<DataEnvelope<ServerView>>, ApiError> {
    let data = broker.get_server_view(id, query.include_tools.unwrap_or(true))?;
    Ok(Json(DataEnvelope { data }))
}

async fn create_server(
    State(broker): State<Arc<Broker>>,
    Query(query): Query<CreateQuery>,
    Json(input): Json<CreateServerInput>,
) -> Result<(StatusCode, Json<DataEnvelope<ServerView>>), ApiError> {
    let data = broker
        .create_server(&input, query.strict.unwrap_or(false))
        .await?;
    Ok((StatusCode::CREATED, Json(DataEnvelope { data })))
}

async fn update_server(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<i64>,
    Json(patch): Json<UpdateServerInput>,
) -> Result<Json<DataEnvelope<ServerView>>, ApiError> {
    let data = broker.update_server(id, &patch).await?;
    Ok(Json(DataEnvelope { data }))
}

async fn delete_server(
    State(broker): State<Arc<Broker>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = broker.delete_server(id).await?;
    Ok(Json(json!({
        "deleted_id": removed.id,
        "deleted_server_name": removed.name,
    })))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "server": "dext",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// The MCP endpoint: one JSON-RPC request per POST body. Each request gets
/// a fresh framing, so ids from different agents cannot collide.
async fn mcp_endpoint(
    State(broker): State<Arc<Broker>>,
    Json(request): Json<McpRequest>,
) -> Json<McpResponse> {
    let handler = broker.mcp_handler();
    Json(handler.handle_request(request).await)
}
