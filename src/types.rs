//! Core types for the broker

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{DextError, Result};

/// Unique identifier for a persisted server row
pub type ServerId = i64;

/// Unique identifier for a persisted tool record
pub type ToolId = i64;

/// Separator between server name and upstream tool name in a display name
pub const DISPLAY_NAME_SEPARATOR: &str = "__";

/// Length of generated session ids
pub const SESSION_ID_LEN: usize = 6;

/// Transport kind of an upstream MCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Stdio,
    Sse,
    HttpStream,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerKind::Stdio => write!(f, "stdio"),
            ServerKind::Sse => write!(f, "sse"),
            ServerKind::HttpStream => write!(f, "http_stream"),
        }
    }
}

impl std::str::FromStr for ServerKind {
    type Err = DextError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdio" => Ok(ServerKind::Stdio),
            "sse" => Ok(ServerKind::Sse),
            "http_stream" => Ok(ServerKind::HttpStream),
            other => Err(DextError::Validation(format!(
                "unknown server type: {other}"
            ))),
        }
    }
}

/// Persisted configuration of an upstream MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: ServerId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub url: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerConfig {
    /// Whether a patch changes anything the live connection depends on
    pub fn connection_relevant_change(&self, other: &ServerConfig) -> bool {
        self.kind != other.kind
            || self.url != other.url
            || self.command != other.command
            || self.args != other.args
            || self.headers != other.headers
            || self.env != other.env
    }
}

/// Input for creating a server row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServerInput {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub url: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl CreateServerInput {
    /// Enforce the per-kind invariants before any row is written
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DextError::Validation("server name must be non-empty".into()));
        }
        match self.kind {
            ServerKind::Stdio => {
                if self.command.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(DextError::Validation(
                        "stdio servers require a command".into(),
                    ));
                }
            }
            ServerKind::Sse | ServerKind::HttpStream => {
                let url = self.url.as_deref().unwrap_or("");
                if url.is_empty() {
                    return Err(DextError::Validation(format!(
                        "{} servers require a url",
                        self.kind
                    )));
                }
                reqwest::Url::parse(url)
                    .map_err(|e| DextError::Validation(format!("invalid url '{url}': {e}")))?;
            }
        }
        Ok(())
    }
}

/// Partial update of a server row; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateServerInput {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ServerKind>,
    pub url: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub headers: Option<HashMap<String, String>>,
    pub env: Option<HashMap<String, String>>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

/// Filter for listing server rows
#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub enabled: Option<bool>,
    pub kind: Option<ServerKind>,
}

/// A persisted tool catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: ToolId,
    pub tool_md5: String,
    pub model_name: String,
    pub display_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A tool as reported by a live upstream server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub output_schema: Option<serde_json::Value>,
}

/// A similarity hit from the vector index
#[derive(Debug, Clone, Serialize)]
pub struct SimilarTool {
    pub tool_id: ToolId,
    pub tool_md5: String,
    pub display_name: String,
    pub description: String,
    pub distance: f32,
    pub similarity: f32,
    pub created_at: DateTime<Utc>,
}

/// One row of session retrieval history
#[derive(Debug, Clone, Serialize)]
pub struct SessionHistoryEntry {
    pub session_id: String,
    pub tool_md5: String,
    pub tool_name: String,
    pub retrieved_at: DateTime<Utc>,
}

/// Aggregate statistics for a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub total_tools: usize,
    pub first_retrieved_at: Option<DateTime<Utc>>,
    pub last_retrieved_at: Option<DateTime<Utc>>,
}

/// A newly surfaced tool, rendered with full detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewToolEntry {
    pub rank: usize,
    pub tool_name: String,
    pub md5: String,
    pub description: String,
    pub similarity: f64,
    /// Serialized JSON of the upstream input schema
    pub input_schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// A tool the session has already been shown, rendered minimally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownToolEntry {
    pub rank: usize,
    pub tool_name: String,
    pub md5: String,
}

/// Per-query grouping of newly surfaced tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryNewTools {
    pub query_index: usize,
    pub query: String,
    pub tools: Vec<NewToolEntry>,
}

/// Per-query grouping of already-known tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryKnownTools {
    pub query_index: usize,
    pub query: String,
    pub tools: Vec<KnownToolEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSummary {
    pub new_tools_count: usize,
    pub known_tools_count: usize,
    pub session_history_count: usize,
}

/// The full result of one retrieval call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub session_id: String,
    pub new_tools: Vec<QueryNewTools>,
    pub known_tools: Vec<QueryKnownTools>,
    pub summary: RetrievalSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_description: Option<String>,
}

/// Catalog entry rendered for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct ToolView {
    pub tool_name: String,
    /// Upstream tool name with the `{server}__` prefix stripped
    pub display_name: String,
    pub tool_md5: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Server row rendered for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub config: ServerConfig,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolView>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    #[serde(rename = "totalPages")]
    pub total_pages: u64,
}

/// Compute the broker-level display name of an upstream tool
pub fn tool_display_name(server: &str, tool: &str) -> String {
    format!("{server}{DISPLAY_NAME_SEPARATOR}{tool}")
}

/// Compute the stable identity of a tool: the hex MD5 of
/// `display_name ∥ description` with surrounding whitespace trimmed.
pub fn tool_identity(display_name: &str, description: &str) -> String {
    let joined = format!("{display_name}{description}");
    format!("{:x}", md5::compute(joined.trim().as_bytes()))
}

/// Strip the `{server}__` prefix from a display name, if present
pub fn strip_server_prefix<'a>(display_name: &'a str, server: &str) -> &'a str {
    let prefix = format!("{server}{DISPLAY_NAME_SEPARATOR}");
    display_name.strip_prefix(&prefix).unwrap_or(display_name)
}

const SESSION_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a fresh six-character lowercase alphanumeric session id
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..SESSION_ID_ALPHABET.len());
            SESSION_ID_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_kind_round_trip() {
        for kind in [ServerKind::Stdio, ServerKind::Sse, ServerKind::HttpStream] {
            let parsed: ServerKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("websocket".parse::<ServerKind>().is_err());
    }

    #[test]
    fn test_create_input_validation() {
        let mut input = CreateServerInput {
            name: "files".into(),
            kind: ServerKind::Stdio,
            url: None,
            command: Some("npx".into()),
            args: vec!["-y".into(), "server-files".into()],
            headers: HashMap::new(),
            env: HashMap::new(),
            description: None,
            enabled: true,
        };
        assert!(input.validate().is_ok());

        input.command = None;
        assert!(input.validate().is_err());

        input.kind = ServerKind::Sse;
        input.url = Some("not a url".into());
        assert!(input.validate().is_err());

        input.url = Some("https://example.com/sse".into());
        assert!(input.validate().is_ok());

        input.name = "  ".into();
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_tool_identity_trims_surrounding_whitespace() {
        let a = tool_identity("srv__read", "hello world");
        let b = tool_identity("srv__read", "hello world ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let c = tool_identity("srv__read", "hello  world");
        assert_ne!(a, c);
    }

    #[test]
    fn test_tool_identity_is_stable() {
        // Locked value: changing the identity algorithm breaks every
        // persisted catalog, so this constant must never drift.
        assert_eq!(
            tool_identity("srv__t", "desc"),
            format!("{:x}", md5::compute(b"srv__tdesc"))
        );
    }

    #[test]
    fn test_generated_session_id_shape() {
        for _ in 0..50 {
            let id = generate_session_id();
            assert_eq!(id.len(), SESSION_ID_LEN);
            assert!(id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_strip_server_prefix() {
        assert_eq!(strip_server_prefix("notion__create_page", "notion"), "create_page");
        assert_eq!(strip_server_prefix("notion__create_page", "other"), "notion__create_page");
    }
}
