//! Live MCP client sessions to upstream servers
//!
//! One [`LiveClient`] exists per enabled server config. A client that fails
//! to connect stays registered in a disconnected state and serves an empty
//! tool list until a later mutation triggers a reconnection attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rmcp::{
    model::CallToolRequestParam,
    service::{DynService, RoleClient, RunningService, ServiceExt},
    transport::{
        sse_client::SseClientConfig,
        streamable_http_client::StreamableHttpClientTransportConfig, SseClientTransport,
        StreamableHttpClientTransport, TokioChildProcess,
    },
};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::subst::expand_env_map;
use crate::error::{DextError, Result};
use crate::types::{ServerConfig, ServerKind, UpstreamTool};

/// A running rmcp client session, type-erased over the transport
pub type ClientService = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

/// A live (or pending) connection to one upstream server
pub struct LiveClient {
    config: ServerConfig,
    service: Mutex<Option<ClientService>>,
    tools: RwLock<Vec<UpstreamTool>>,
    connected: AtomicBool,
}

impl LiveClient {
    /// Create a client in the disconnected state
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            service: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Snapshot of the upstream tool list; empty while disconnected
    pub fn tools(&self) -> Vec<UpstreamTool> {
        self.tools.read().clone()
    }

    /// Establish the upstream session and load its tool catalog
    pub async fn connect(&self) -> Result<()> {
        let service = establish_session(&self.config).await?;
        {
            let mut slot = self.service.lock().await;
            *slot = Some(service);
        }

        // A session whose catalog cannot be listed is torn down again so
        // the client is either fully usable or cleanly disconnected.
        if let Err(e) = self.refresh_tools().await {
            self.disconnect().await;
            return Err(e);
        }

        self.connected.store(true, Ordering::Release);
        info!(server = %self.config.name, kind = %self.config.kind, "connected to upstream");
        Ok(())
    }

    /// Clone the session's peer handle without holding the slot lock
    /// across upstream I/O.
    async fn peer(&self) -> Result<rmcp::service::Peer<RoleClient>> {
        let slot = self.service.lock().await;
        slot.as_ref()
            .map(|service| service.peer().clone())
            .ok_or_else(|| {
                DextError::Upstream(format!("server '{}' is not connected", self.config.name))
            })
    }

    /// Re-fetch the upstream tool list into the local cache
    pub async fn refresh_tools(&self) -> Result<Vec<UpstreamTool>> {
        let peer = self.peer().await?;

        let listed = peer.list_tools(Default::default()).await.map_err(|e| {
            DextError::Upstream(format!(
                "tools/list failed for server '{}': {e}",
                self.config.name
            ))
        })?;

        let tools: Vec<UpstreamTool> = listed.tools.into_iter().map(map_tool).collect();
        debug!(server = %self.config.name, count = tools.len(), "refreshed upstream tools");
        *self.tools.write() = tools.clone();
        Ok(tools)
    }

    /// Invoke an upstream tool under a deadline, surfacing its error verbatim
    pub async fn invoke(
        &self,
        tool_name: &str,
        params: serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value> {
        let peer = self.peer().await?;

        let arguments = match params {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            other => {
                return Err(DextError::Validation(format!(
                    "tool parameters must be a JSON object, got {other}"
                )))
            }
        };

        let call = peer.call_tool(CallToolRequestParam {
            name: tool_name.to_string().into(),
            arguments,
        });
        let result = tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| {
                DextError::Upstream(format!(
                    "tool '{tool_name}' on server '{}' timed out after {}s",
                    self.config.name,
                    deadline.as_secs()
                ))
            })?
            .map_err(|e| {
                DextError::Upstream(format!(
                    "tools/call failed for '{tool_name}' on server '{}': {e}",
                    self.config.name
                ))
            })?;

        if result.is_error.unwrap_or(false) {
            let message = extract_text(&result.content)
                .unwrap_or_else(|| "upstream tool returned an error result".to_string());
            return Err(DextError::Upstream(message));
        }

        Ok(serde_json::to_value(result)?)
    }

    /// Tear down the upstream session, if any
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.tools.write().clear();
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            if let Err(e) = service.cancel().await {
                warn!(server = %self.config.name, "error closing upstream session: {e}");
            }
        }
    }
}

async fn establish_session(config: &ServerConfig) -> Result<ClientService> {
    match config.kind {
        ServerKind::Stdio => {
            let command = config.command.as_deref().ok_or_else(|| {
                DextError::Validation(format!("stdio server '{}' has no command", config.name))
            })?;

            let mut cmd = Command::new(command);
            cmd.args(&config.args);
            for (k, v) in expand_env_map(&config.env) {
                cmd.env(k, v);
            }

            let transport = TokioChildProcess::new(cmd).map_err(|e| {
                DextError::Upstream(format!("failed to spawn '{}': {e}", config.name))
            })?;
            serve(config, transport).await
        }
        ServerKind::Sse => {
            let url = required_url(config)?;
            let client = http_client_with_headers(&config.headers)?;
            let transport = SseClientTransport::start_with_client(
                client,
                SseClientConfig {
                    sse_endpoint: url.into(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                DextError::Upstream(format!("SSE connect failed for '{}': {e}", config.name))
            })?;
            serve(config, transport).await
        }
        ServerKind::HttpStream => {
            let url = required_url(config)?;
            let client = http_client_with_headers(&config.headers)?;
            let transport = StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig {
                    uri: url.into(),
                    ..Default::default()
                },
            );
            serve(config, transport).await
        }
    }
}

async fn serve<T, E, A>(config: &ServerConfig, transport: T) -> Result<ClientService>
where
    T: rmcp::transport::IntoTransport<RoleClient, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    ().into_dyn().serve(transport).await.map_err(|e| {
        DextError::Upstream(format!(
            "failed to initialize MCP session with '{}': {e}",
            config.name
        ))
    })
}

fn required_url(config: &ServerConfig) -> Result<String> {
    config
        .url
        .clone()
        .ok_or_else(|| DextError::Validation(format!("server '{}' has no url", config.name)))
}

/// Build a reqwest client carrying the configured headers, with
/// `${VAR[:default]}` substitution applied to each value.
fn http_client_with_headers(headers: &HashMap<String, String>) -> Result<reqwest::Client> {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

    let mut header_map = HeaderMap::new();
    for (name, value) in expand_env_map(headers) {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DextError::Validation(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| DextError::Validation(format!("invalid header value: {e}")))?;
        header_map.insert(name, value);
    }

    Ok(reqwest::Client::builder()
        .default_headers(header_map)
        .build()?)
}

fn map_tool(tool: rmcp::model::Tool) -> UpstreamTool {
    UpstreamTool {
        name: tool.name.to_string(),
        description: tool
            .description
            .as_deref()
            .unwrap_or_default()
            .to_string(),
        input_schema: serde_json::Value::Object((*tool.input_schema).clone()),
        output_schema: None,
    }
}

fn extract_text(content: &[rmcp::model::Content]) -> Option<String> {
    let lines: Vec<String> = content
        .iter()
        .filter_map(|item| item.as_text().map(|t| t.text.clone()))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
