//! Upstream server registry: persisted configs plus live client sessions
//!
//! The registry owns every [`LiveClient`]. Reads take a lock-free snapshot
//! of the client map; mutations (connect, disconnect, replace) are
//! serialized. Connection failures are never fatal: the failing server is
//! kept as a disconnected entry and reconnection is attempted on the next
//! write to its row.

pub mod client;
pub mod subst;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::index::{CatalogIndexer, IndexReport};
use crate::storage::{servers, tools, Storage};
use crate::types::{
    CreateServerInput, ServerConfig, ServerFilter, ServerId, UpdateServerInput, UpstreamTool,
};
pub use client::LiveClient;

/// Registry over persisted server rows and their live sessions
pub struct UpstreamRegistry {
    storage: Storage,
    clients: RwLock<HashMap<String, Arc<LiveClient>>>,
    // Serializes map mutations; connects and disconnects await inside
    mutation_lock: Mutex<()>,
}

impl UpstreamRegistry {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            clients: RwLock::new(HashMap::new()),
            mutation_lock: Mutex::new(()),
        }
    }

    /// Connect every enabled server at process start. Never throws:
    /// failing servers are registered as disconnected entries.
    pub async fn boot(&self) {
        let configs = match self
            .storage
            .with_connection(servers::list_enabled_servers)
        {
            Ok(configs) => configs,
            Err(e) => {
                warn!("failed to load server configs: {e}");
                return;
            }
        };

        for config in configs {
            let _guard = self.mutation_lock.lock().await;
            self.install_client(config).await;
        }
    }

    /// Create and register a client for a config; the entry is kept even
    /// when the connection fails. Caller holds the mutation lock.
    async fn install_client(&self, config: ServerConfig) -> Option<crate::error::DextError> {
        let name = config.name.clone();
        let live = Arc::new(LiveClient::new(config));
        let error = match live.connect().await {
            Ok(()) => None,
            Err(e) => {
                warn!(server = %name, "connection failed, keeping disconnected entry: {e}");
                Some(e)
            }
        };
        self.clients.write().insert(name, live);
        error
    }

    async fn remove_client(&self, name: &str) {
        let removed = self.clients.write().remove(name);
        if let Some(live) = removed {
            live.disconnect().await;
        }
    }

    /// Create a server row and connect its client.
    ///
    /// By default the row persists when the connection fails and the error
    /// is surfaced through the client's disconnected state; in strict mode
    /// the row is rolled back instead.
    pub async fn create_server(
        &self,
        input: &CreateServerInput,
        strict: bool,
    ) -> Result<ServerConfig> {
        let config = self
            .storage
            .with_transaction(|conn| servers::create_server(conn, input))?;

        if !config.enabled {
            return Ok(config);
        }

        let _guard = self.mutation_lock.lock().await;
        if let Some(error) = self.install_client(config.clone()).await {
            if strict {
                self.remove_client(&config.name).await;
                self.storage
                    .with_transaction(|conn| servers::delete_server(conn, config.id))?;
                return Err(error);
            }
        }
        Ok(config)
    }

    /// Apply a partial update, reconnecting the live client when the
    /// enabled flag flips or any connection-relevant field changes.
    pub async fn update_server(
        &self,
        id: ServerId,
        patch: &UpdateServerInput,
    ) -> Result<ServerConfig> {
        let before = self.storage.with_connection(|conn| servers::get_server(conn, id))?;
        let after = self
            .storage
            .with_transaction(|conn| servers::update_server(conn, id, patch))?;

        let enabled_flipped = before.enabled != after.enabled;
        let relevant = before.connection_relevant_change(&after);
        let renamed = before.name != after.name;
        let currently_connected = self
            .client_for(&after.name)
            .map(|c| c.is_connected())
            .unwrap_or(false);

        let needs_reconnect =
            enabled_flipped || relevant || renamed || (after.enabled && !currently_connected);
        if !needs_reconnect {
            return Ok(after);
        }

        let _guard = self.mutation_lock.lock().await;
        self.remove_client(&before.name).await;
        if renamed {
            self.remove_client(&after.name).await;
        }
        if after.enabled {
            self.install_client(after.clone()).await;
        }
        Ok(after)
    }

    /// Disconnect then delete. A disconnect failure never blocks the
    /// row deletion.
    pub async fn delete_server(&self, id: ServerId) -> Result<ServerConfig> {
        let config = self.storage.with_connection(|conn| servers::get_server(conn, id))?;

        {
            let _guard = self.mutation_lock.lock().await;
            self.remove_client(&config.name).await;
        }

        let removed = self
            .storage
            .with_transaction(|conn| servers::delete_server(conn, id))?;
        info!(server = %removed.name, "deleted upstream server");
        Ok(removed)
    }

    /// Convenience over [`Self::update_server`]
    pub async fn toggle_server(&self, id: ServerId, enabled: bool) -> Result<ServerConfig> {
        self.update_server(
            id,
            &UpdateServerInput {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub fn get_server(&self, id: ServerId) -> Result<ServerConfig> {
        self.storage.with_connection(|conn| servers::get_server(conn, id))
    }

    pub fn list_servers(
        &self,
        filter: &ServerFilter,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ServerConfig>> {
        self.storage
            .with_connection(|conn| servers::list_servers(conn, filter, page, limit))
    }

    pub fn count_servers(&self, filter: &ServerFilter) -> Result<u64> {
        self.storage
            .with_connection(|conn| servers::count_servers(conn, filter))
    }

    /// Lock-free snapshot of the live client for one server
    pub fn client_for(&self, name: &str) -> Option<Arc<LiveClient>> {
        self.clients.read().get(name).cloned()
    }

    /// Lock-free snapshot of all live clients, ordered by server name
    pub fn clients(&self) -> Vec<Arc<LiveClient>> {
        let mut clients: Vec<Arc<LiveClient>> = self.clients.read().values().cloned().collect();
        clients.sort_by(|a, b| a.server_name().cmp(b.server_name()));
        clients
    }

    /// Current live tool lists, keyed by server name
    pub fn live_tools(&self) -> Vec<(String, Vec<UpstreamTool>)> {
        self.clients()
            .into_iter()
            .map(|c| (c.server_name().to_string(), c.tools()))
            .collect()
    }

    /// Resolve a tool identity against the live catalogs.
    ///
    /// Identities are recomputed from the live tool lists, so a stale
    /// persisted catalog can never route a call to the wrong upstream.
    pub fn find_tool_by_md5(&self, tool_md5: &str) -> Option<(Arc<LiveClient>, UpstreamTool)> {
        for client in self.clients() {
            for tool in client.tools() {
                let display_name =
                    crate::types::tool_display_name(client.server_name(), &tool.name);
                if crate::types::tool_identity(&display_name, &tool.description) == tool_md5 {
                    return Some((client, tool));
                }
            }
        }
        None
    }

    /// Walk every live client, hand its tools to the indexer and prune
    /// catalog records of servers that no longer exist.
    pub async fn refresh_catalog(&self, indexer: &CatalogIndexer) -> Result<IndexReport> {
        let mut report = IndexReport::default();

        for client in self.clients() {
            let tools = if client.is_connected() {
                match client.refresh_tools().await {
                    Ok(tools) => tools,
                    Err(e) => {
                        warn!(server = %client.server_name(), "refresh failed, using cached tools: {e}");
                        client.tools()
                    }
                }
            } else {
                client.tools()
            };

            let server_report = indexer.index_server_tools(client.server_name(), &tools).await;
            report.indexed += server_report.indexed;
            report.skipped += server_report.skipped;
            report.replaced += server_report.replaced;
            report.failed += server_report.failed;
        }

        let known_names = self.storage.with_connection(servers::all_server_names)?;
        let orphans = self
            .storage
            .with_connection(|conn| tools::orphaned_tools(conn, &known_names))?;
        for orphan in orphans {
            match self.storage.with_transaction(|conn| {
                tools::delete_tool_by_md5(conn, &orphan.tool_md5, Some(&orphan.model_name))
            }) {
                Ok(_) => info!(tool = %orphan.display_name, "pruned orphaned catalog entry"),
                Err(e) => warn!(tool = %orphan.display_name, "failed to prune: {e}"),
            }
        }

        info!(
            indexed = report.indexed,
            skipped = report.skipped,
            replaced = report.replaced,
            failed = report.failed,
            "catalog refresh complete"
        );
        Ok(report)
    }

    /// Enabled servers with their live tool names, for the retrieval
    /// engine's first-time session description
    pub fn server_summaries(&self) -> Vec<(ServerConfig, Vec<String>)> {
        self.clients()
            .into_iter()
            .filter(|c| c.config().enabled)
            .map(|c| {
                let names = c.tools().into_iter().map(|t| t.name).collect();
                (c.config().clone(), names)
            })
            .collect()
    }
}
