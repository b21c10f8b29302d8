//! Proxied execution of a retrieved tool against its upstream server
//!
//! Resolution is identity-based: the md5 of `display_name ∥ description` is
//! recomputed over every live client's current tool list and the first match
//! is invoked. The persisted catalog is never consulted; it may lag behind
//! live state, and only the live set is authoritative for invocation.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{DextError, Result};
use crate::registry::UpstreamRegistry;

/// Default upstream invocation deadline
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(300);

/// Hard cap on the invocation deadline
pub const MAX_EXECUTE_TIMEOUT: Duration = Duration::from_secs(600);

/// Dispatches tool invocations to live upstream sessions
pub struct Executor {
    registry: Arc<UpstreamRegistry>,
    timeout: Duration,
}

impl Executor {
    pub fn new(registry: Arc<UpstreamRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout: timeout.min(MAX_EXECUTE_TIMEOUT),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke the live tool whose identity matches `tool_md5`.
    ///
    /// Upstream failures are surfaced verbatim; a missing identity is
    /// `NotFound`.
    pub async fn execute(&self, tool_md5: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let tool_md5 = tool_md5.trim();
        if tool_md5.is_empty() {
            return Err(DextError::Validation("md5 must be non-empty".into()));
        }

        let (client, tool) = self.registry.find_tool_by_md5(tool_md5).ok_or_else(|| {
            DextError::NotFound(format!("no live tool matches md5 {tool_md5}"))
        })?;

        debug!(
            server = %client.server_name(),
            tool = %tool.name,
            "executing upstream tool"
        );
        client.invoke(&tool.name, params, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_timeout_is_capped() {
        let registry = Arc::new(UpstreamRegistry::new(Storage::open_in_memory().unwrap()));
        let executor = Executor::new(registry, Duration::from_secs(10_000));
        assert_eq!(executor.timeout(), MAX_EXECUTE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unknown_md5_is_not_found() {
        let registry = Arc::new(UpstreamRegistry::new(Storage::open_in_memory().unwrap()));
        let executor = Executor::new(registry, DEFAULT_EXECUTE_TIMEOUT);

        let err = executor
            .execute("0123456789abcdef0123456789abcdef", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DextError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_md5_is_validation_error() {
        let registry = Arc::new(UpstreamRegistry::new(Storage::open_in_memory().unwrap()));
        let executor = Executor::new(registry, DEFAULT_EXECUTE_TIMEOUT);

        let err = executor
            .execute("  ", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DextError::Validation(_)));
    }
}
