//! The broker's MCP request handler
//!
//! Exposes exactly two tools: `retriever` for semantic tool discovery and
//! `executor` for proxied invocation. Tool-call failures become
//! `isError=true` content blocks; only malformed JSON-RPC surfaces as a
//! protocol-level error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::protocol::{methods, InitializeResult, McpRequest, McpResponse, ToolCallResult, ToolDefinition};
use crate::error::{DextError, Result};
use crate::executor::Executor;
use crate::retrieval::RetrievalEngine;

/// Trait for handling MCP requests
#[async_trait]
pub trait McpHandler: Send + Sync {
    async fn handle_request(&self, request: McpRequest) -> McpResponse;
}

/// Definitions of the two broker tools
pub fn broker_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "retriever".to_string(),
            description: "Retrieve candidate tools for one or more natural-language task \
                          descriptions. Returns new tools with schemas plus the ids of tools \
                          this session has already been shown."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "descriptions": {
                        "type": "array",
                        "items": {"type": "string"},
                        "minItems": 1,
                        "description": "One task description per needed capability"
                    },
                    "sessionId": {
                        "type": "string",
                        "description": "Session id from a previous call; pass an empty string to start a new session"
                    },
                    "serverNames": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Restrict retrieval to these upstream servers"
                    }
                },
                "required": ["descriptions", "sessionId"]
            }),
        },
        ToolDefinition {
            name: "executor".to_string(),
            description: "Execute a previously retrieved tool by its md5 identity with the \
                          given parameters and return the upstream result."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "md5": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Tool identity returned by the retriever"
                    },
                    "parameters": {
                        "type": "object",
                        "description": "Arguments matching the tool's input schema"
                    }
                },
                "required": ["md5", "parameters"]
            }),
        },
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieverArgs {
    descriptions: Vec<String>,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    server_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ExecutorArgs {
    md5: String,
    #[serde(default)]
    parameters: Value,
}

/// Handler wiring the broker tools to the retrieval engine and executor
pub struct BrokerHandler {
    retrieval: Option<Arc<RetrievalEngine>>,
    executor: Arc<Executor>,
}

impl BrokerHandler {
    pub fn new(retrieval: Option<Arc<RetrievalEngine>>, executor: Arc<Executor>) -> Self {
        Self {
            retrieval,
            executor,
        }
    }

    async fn handle_tool_call(&self, name: &str, arguments: Value) -> ToolCallResult {
        let outcome = match name {
            "retriever" => self.call_retriever(arguments).await,
            "executor" => self.call_executor(arguments).await,
            other => Err(DextError::NotFound(format!("unknown tool: {other}"))),
        };

        outcome.unwrap_or_else(|e| {
            warn!(tool = name, "tool call failed: {e}");
            ToolCallResult::error(e.to_string())
        })
    }

    async fn call_retriever(&self, arguments: Value) -> Result<ToolCallResult> {
        let args: RetrieverArgs = serde_json::from_value(arguments)
            .map_err(|e| DextError::Validation(format!("invalid retriever arguments: {e}")))?;

        let retrieval = self.retrieval.as_ref().ok_or_else(|| {
            DextError::ConfigMissing(
                "retrieval is unavailable: EMBEDDING_API_KEY is not configured".into(),
            )
        })?;

        let session_id = (!args.session_id.is_empty()).then_some(args.session_id.as_str());
        let server_names = args.server_names.unwrap_or_default();
        let result = retrieval
            .retrieve(&args.descriptions, session_id, &server_names)
            .await?;

        let session_note = format!(
            "Session ID: {}. Pass this sessionId to later retriever calls so \
             tools you have already seen are not repeated.",
            result.session_id
        );
        Ok(ToolCallResult::text_blocks(vec![
            serde_json::to_string_pretty(&result)?,
            session_note,
        ]))
    }

    async fn call_executor(&self, arguments: Value) -> Result<ToolCallResult> {
        let args: ExecutorArgs = serde_json::from_value(arguments)
            .map_err(|e| DextError::Validation(format!("invalid executor arguments: {e}")))?;

        let result = self.executor.execute(&args.md5, args.parameters).await?;
        Ok(ToolCallResult::text(serde_json::to_string_pretty(&result)?))
    }
}

#[async_trait]
impl McpHandler for BrokerHandler {
    async fn handle_request(&self, request: McpRequest) -> McpResponse {
        match request.method.as_str() {
            methods::INITIALIZE => {
                let result = InitializeResult::default();
                McpResponse::success(request.id, json!(result))
            }
            methods::INITIALIZED => McpResponse::success(request.id, json!({})),
            methods::PING => McpResponse::success(request.id, json!({})),
            methods::LIST_TOOLS => {
                let tools = broker_tool_definitions();
                McpResponse::success(request.id, json!({ "tools": tools }))
            }
            methods::CALL_TOOL => {
                let name = request
                    .params
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let arguments = request
                    .params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                let result = self.handle_tool_call(name, arguments).await;
                McpResponse::success(request.id, json!(result))
            }
            _ => McpResponse::error(
                request.id,
                -32601,
                format!("Method not found: {}", request.method),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DEFAULT_EXECUTE_TIMEOUT;
    use crate::registry::UpstreamRegistry;
    use crate::storage::Storage;

    fn handler_without_embeddings() -> BrokerHandler {
        let registry = Arc::new(UpstreamRegistry::new(Storage::open_in_memory().unwrap()));
        let executor = Arc::new(Executor::new(registry, DEFAULT_EXECUTE_TIMEOUT));
        BrokerHandler::new(None, executor)
    }

    fn request(method: &str, params: Value) -> McpRequest {
        McpRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(1)),
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn test_initialize_and_list_tools() {
        let handler = handler_without_embeddings();

        let response = handler
            .handle_request(request(methods::INITIALIZE, Value::Null))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], json!("dext"));

        let response = handler
            .handle_request(request(methods::LIST_TOOLS, Value::Null))
            .await;
        let tools = response.result.unwrap();
        let names: Vec<&str> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["retriever", "executor"]);
    }

    #[tokio::test]
    async fn test_unknown_method_is_protocol_error() {
        let handler = handler_without_embeddings();
        let response = handler
            .handle_request(request("resources/list", Value::Null))
            .await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_executor_unknown_md5_is_error_block() {
        let handler = handler_without_embeddings();
        let response = handler
            .handle_request(request(
                methods::CALL_TOOL,
                json!({
                    "name": "executor",
                    "arguments": {"md5": "0123456789abcdef0123456789abcdef", "parameters": {}}
                }),
            ))
            .await;

        // Transport level succeeds; the failure is an isError block
        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(true));
    }

    #[tokio::test]
    async fn test_retriever_without_embedder_is_error_block() {
        let handler = handler_without_embeddings();
        let response = handler
            .handle_request(request(
                methods::CALL_TOOL,
                json!({
                    "name": "retriever",
                    "arguments": {"descriptions": ["q"], "sessionId": ""}
                }),
            ))
            .await;

        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("EMBEDDING_API_KEY"));
    }

    #[tokio::test]
    async fn test_malformed_tool_arguments_are_error_blocks() {
        let handler = handler_without_embeddings();
        let response = handler
            .handle_request(request(
                methods::CALL_TOOL,
                json!({"name": "executor", "arguments": {"parameters": {}}}),
            ))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(true));

        let response = handler
            .handle_request(request(
                methods::CALL_TOOL,
                json!({"name": "no_such_tool", "arguments": {}}),
            ))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(true));
    }
}
