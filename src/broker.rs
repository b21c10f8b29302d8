//! Composition root
//!
//! One [`Broker`] is constructed at startup and shared by reference with
//! every request handler; there are no ambient singletons. The broker wires
//! storage, the embedder, the upstream registry, the indexer, the retrieval
//! engine and the executor together and owns the catalog-refresh policy.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::embedding::{ArkEmbedder, Embedder, EmbeddingConfig};
use crate::error::{DextError, Result};
use crate::executor::Executor;
use crate::index::{CatalogIndexer, IndexReport};
use crate::mcp::BrokerHandler;
use crate::registry::UpstreamRegistry;
use crate::retrieval::{RetrievalEngine, RetrievalOptions};
use crate::storage::{tools, Storage};
use crate::types::{
    CreateServerInput, Pagination, ServerConfig, ServerFilter, ServerId, ServerView, ToolView,
    UpdateServerInput,
};

/// Broker-wide configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub db_path: String,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalOptions,
    pub executor_timeout: Duration,
}

/// The composition root shared by all request handlers
pub struct Broker {
    storage: Storage,
    registry: Arc<UpstreamRegistry>,
    indexer: Option<Arc<CatalogIndexer>>,
    handler: Arc<BrokerHandler>,
}

impl Broker {
    /// Wire up the broker. A missing embedding key leaves retrieval and
    /// indexing unavailable but the admin surface and executor still work.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let storage = Storage::open(&config.db_path)?;
        let registry = Arc::new(UpstreamRegistry::new(storage.clone()));

        let embedder: Option<Arc<dyn Embedder>> = match ArkEmbedder::new(&config.embedding) {
            Ok(embedder) => Some(Arc::new(embedder)),
            Err(DextError::ConfigMissing(msg)) => {
                warn!("{msg}; retrieval and indexing are disabled");
                None
            }
            Err(e) => return Err(e),
        };

        let indexer = embedder
            .clone()
            .map(|e| Arc::new(CatalogIndexer::new(storage.clone(), e)));
        let retrieval = embedder.clone().map(|e| {
            Arc::new(RetrievalEngine::new(
                storage.clone(),
                e,
                registry.clone(),
                config.retrieval,
            ))
        });
        let executor = Arc::new(Executor::new(registry.clone(), config.executor_timeout));
        let handler = Arc::new(BrokerHandler::new(retrieval, executor));

        Ok(Self {
            storage,
            registry,
            indexer,
            handler,
        })
    }

    /// Connect enabled upstreams and run the startup catalog refresh
    pub async fn boot(&self) {
        self.registry.boot().await;
        if let Err(e) = self.refresh_catalog().await {
            warn!("startup catalog refresh failed: {e}");
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    /// The shared MCP handler behind `POST /mcp`
    pub fn mcp_handler(&self) -> Arc<BrokerHandler> {
        self.handler.clone()
    }

    /// Re-index the live catalogs, when embeddings are configured
    pub async fn refresh_catalog(&self) -> Result<Option<IndexReport>> {
        match &self.indexer {
            Some(indexer) => {
                let report = self.registry.refresh_catalog(indexer).await?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }

    /// Create a server, connect it and fold its tools into the catalog
    pub async fn create_server(
        &self,
        input: &CreateServerInput,
        strict: bool,
    ) -> Result<ServerView> {
        let config = self.registry.create_server(input, strict).await?;
        info!(server = %config.name, "created upstream server");

        if config.enabled {
            if let Err(e) = self.refresh_catalog().await {
                warn!("catalog refresh after create failed: {e}");
            }
        }
        self.server_view(config, false)
    }

    /// Update a server and re-index when its connection changed
    pub async fn update_server(
        &self,
        id: ServerId,
        patch: &UpdateServerInput,
    ) -> Result<ServerView> {
        let config = self.registry.update_server(id, patch).await?;

        if let Err(e) = self.refresh_catalog().await {
            warn!("catalog refresh after update failed: {e}");
        }
        self.server_view(config, false)
    }

    /// Delete a server and prune its catalog entries
    pub async fn delete_server(&self, id: ServerId) -> Result<ServerConfig> {
        let removed = self.registry.delete_server(id).await?;

        let pruned = self
            .storage
            .with_transaction(|conn| tools::delete_tools_for_server(conn, &removed.name));
        match pruned {
            Ok(count) if count > 0 => {
                info!(server = %removed.name, count, "pruned catalog entries")
            }
            Ok(_) => {}
            Err(e) => warn!(server = %removed.name, "failed to prune catalog entries: {e}"),
        }
        Ok(removed)
    }

    pub fn get_server_view(&self, id: ServerId, include_tools: bool) -> Result<ServerView> {
        let config = self.registry.get_server(id)?;
        self.server_view(config, include_tools)
    }

    /// Paged server listing for the admin API
    pub fn list_server_views(
        &self,
        filter: &ServerFilter,
        page: u32,
        limit: u32,
        include_tools: bool,
    ) -> Result<(Vec<ServerView>, Pagination)> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);

        let configs = self.registry.list_servers(filter, page, limit)?;
        let total = self.registry.count_servers(filter)?;

        let views = configs
            .into_iter()
            .map(|config| self.server_view(config, include_tools))
            .collect::<Result<Vec<_>>>()?;

        let pagination = Pagination {
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit as u64),
        };
        Ok((views, pagination))
    }

    fn server_view(&self, config: ServerConfig, include_tools: bool) -> Result<ServerView> {
        let connected = self
            .registry
            .client_for(&config.name)
            .map(|c| c.is_connected())
            .unwrap_or(false);

        let tools = if include_tools {
            let records = self
                .storage
                .with_connection(|conn| tools::tools_for_server(conn, &config.name))?;
            Some(
                records
                    .into_iter()
                    .map(|record| ToolView {
                        tool_name: record.display_name.clone(),
                        display_name: crate::types::strip_server_prefix(
                            &record.display_name,
                            &config.name,
                        )
                        .to_string(),
                        tool_md5: record.tool_md5,
                        description: record.description,
                        created_at: record.created_at,
                    })
                    .collect(),
            )
        } else {
            None
        };

        Ok(ServerView {
            config,
            connected,
            tools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            db_path: ":memory:".into(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalOptions::default(),
            executor_timeout: Duration::from_secs(300),
        }
    }

    fn stdio_input(name: &str, enabled: bool) -> CreateServerInput {
        CreateServerInput {
            name: name.into(),
            kind: crate::types::ServerKind::Stdio,
            url: None,
            command: Some("/nonexistent-mcp-binary".into()),
            args: vec![],
            headers: HashMap::new(),
            env: HashMap::new(),
            description: None,
            enabled,
        }
    }

    #[tokio::test]
    async fn test_broker_without_key_still_serves_admin() {
        // No EMBEDDING_API_KEY in the config: indexing is off, CRUD works
        let broker = Broker::new(&test_config()).unwrap();
        broker.boot().await;

        assert!(broker.refresh_catalog().await.unwrap().is_none());

        let view = broker
            .create_server(&stdio_input("srv", false), false)
            .await
            .unwrap();
        assert_eq!(view.config.name, "srv");
        assert!(!view.connected);

        let (views, pagination) = broker
            .list_server_views(&ServerFilter::default(), 1, 20, true)
            .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(pagination.total, 1);
        assert_eq!(pagination.total_pages, 1);
        assert!(views[0].tools.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_returns_removed_config() {
        let broker = Broker::new(&test_config()).unwrap();
        let view = broker
            .create_server(&stdio_input("gone", false), false)
            .await
            .unwrap();

        let removed = broker.delete_server(view.config.id).await.unwrap();
        assert_eq!(removed.name, "gone");
        assert!(broker.get_server_view(view.config.id, false).is_err());
    }

    #[tokio::test]
    async fn test_pagination_clamps_limit() {
        let broker = Broker::new(&test_config()).unwrap();
        for i in 0..3 {
            broker
                .create_server(&stdio_input(&format!("s{i}"), false), false)
                .await
                .unwrap();
        }

        let (views, pagination) = broker
            .list_server_views(&ServerFilter::default(), 1, 2, false)
            .unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(pagination.total, 3);
        assert_eq!(pagination.total_pages, 2);

        let (views, _) = broker
            .list_server_views(&ServerFilter::default(), 2, 2, false)
            .unwrap();
        assert_eq!(views.len(), 1);
    }
}
