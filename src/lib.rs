//! Dext - Tool-Retrieval Broker for MCP Agents
//!
//! Aggregates the tool catalogs of upstream MCP servers into a persistent
//! vector index and exposes two capabilities to an agent: semantic retrieval
//! of candidate tools for a natural-language intent, and proxied execution
//! of a chosen tool against the right upstream.

pub mod api;
pub mod broker;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod index;
pub mod mcp;
pub mod registry;
pub mod retrieval;
pub mod storage;
pub mod types;

pub use broker::{Broker, BrokerConfig};
pub use error::{DextError, Result};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
