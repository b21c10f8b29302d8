//! MCP surface of the broker
//!
//! JSON-RPC framing types plus the handler that exposes the `retriever` and
//! `executor` tools.

pub mod handler;
pub mod protocol;

pub use handler::{broker_tool_definitions, BrokerHandler, McpHandler};
pub use protocol::{
    methods, InitializeResult, McpError, McpRequest, McpResponse, ToolCallResult, ToolContent,
    ToolDefinition,
};
