//! Catalog indexing: stable tool identities, incremental embedding and
//! near-duplicate replacement
//!
//! Indexing is idempotent: a tool whose `(tool_md5, model_name)` pair is
//! already present is skipped without touching the embedding endpoint.
//! Before a genuinely new tool is persisted, existing entries whose vectors
//! are nearly identical are treated as stale variants of the same tool and
//! removed, keeping the catalog free of renumbered or reworded duplicates.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::embedding::Embedder;
use crate::error::Result;
use crate::storage::{tools, Storage};
use crate::types::{tool_display_name, tool_identity, UpstreamTool};

/// Candidate pool size for the near-duplicate scan
pub const NEAR_DUP_SCAN_TOP_K: usize = 10;

/// Similarity floor for the near-duplicate scan
pub const NEAR_DUP_SCAN_THRESHOLD: f32 = 0.70;

/// Similarity at or above which an existing entry is superseded
pub const NEAR_DUP_REPLACE_THRESHOLD: f32 = 0.96;

/// Outcome counts of one indexing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped: usize,
    pub replaced: usize,
    pub failed: usize,
}

impl IndexReport {
    fn merge(&mut self, other: IndexReport) {
        self.indexed += other.indexed;
        self.skipped += other.skipped;
        self.replaced += other.replaced;
        self.failed += other.failed;
    }
}

/// Writes the tool catalog: the only component that touches
/// `tool_vectors`, `vec_tool_embeddings` and `tool_mapping`.
pub struct CatalogIndexer {
    storage: Storage,
    embedder: Arc<dyn Embedder>,
    // Serializes insertions so two concurrent indexing passes cannot both
    // observe the same tool as absent.
    insert_lock: Mutex<()>,
}

impl CatalogIndexer {
    pub fn new(storage: Storage, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            embedder,
            insert_lock: Mutex::new(()),
        }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Index one upstream tool. Returns counts for this tool only.
    pub async fn index_tool(&self, server: &str, tool: &UpstreamTool) -> Result<IndexReport> {
        let display_name = tool_display_name(server, &tool.name);
        let tool_md5 = tool_identity(&display_name, &tool.description);
        let model_name = self.embedder.model_name().to_string();

        let exists = self
            .storage
            .with_connection(|conn| tools::tool_exists(conn, &tool_md5, &model_name))?;
        if exists {
            debug!(tool = %display_name, "already indexed, skipping");
            return Ok(IndexReport {
                skipped: 1,
                ..Default::default()
            });
        }

        let text = format!("{display_name} {}", tool.description);
        let vector = self.embedder.embed_one(text.trim()).await?;

        let _guard = self.insert_lock.lock().await;

        // Re-check under the lock: a concurrent pass may have won the race.
        let exists = self
            .storage
            .with_connection(|conn| tools::tool_exists(conn, &tool_md5, &model_name))?;
        if exists {
            return Ok(IndexReport {
                skipped: 1,
                ..Default::default()
            });
        }

        let replaced = self.replace_near_duplicates(&vector, &tool_md5, &model_name);

        let dim = self.embedder.dimension();
        self.storage.with_transaction(|conn| {
            tools::upsert_tool_with_vector(
                conn,
                &display_name,
                &tool.description,
                &model_name,
                &tool_md5,
                &vector,
                dim,
            )
        })?;

        debug!(tool = %display_name, replaced, "indexed");
        Ok(IndexReport {
            indexed: 1,
            replaced,
            ..Default::default()
        })
    }

    /// Remove existing entries superseded by the incoming vector.
    ///
    /// Runs outside the new-tool transaction; each deletion is atomic on its
    /// own and a failure never blocks the insert.
    fn replace_near_duplicates(&self, vector: &[f32], tool_md5: &str, model_name: &str) -> usize {
        let candidates = match self.storage.with_connection(|conn| {
            tools::search_similar(
                conn,
                vector,
                model_name,
                NEAR_DUP_SCAN_TOP_K,
                NEAR_DUP_SCAN_THRESHOLD,
                &[],
            )
        }) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("near-duplicate scan failed: {e}");
                return 0;
            }
        };

        let mut replaced = 0;
        for candidate in candidates {
            if candidate.similarity < NEAR_DUP_REPLACE_THRESHOLD || candidate.tool_md5 == tool_md5 {
                continue;
            }
            match self.storage.with_transaction(|conn| {
                tools::delete_tool_by_md5(conn, &candidate.tool_md5, Some(model_name))
            }) {
                Ok(count) => {
                    info!(
                        superseded = %candidate.display_name,
                        similarity = candidate.similarity,
                        "removed near-duplicate tool"
                    );
                    replaced += count;
                }
                Err(e) => {
                    warn!(
                        superseded = %candidate.display_name,
                        "failed to remove near-duplicate: {e}"
                    );
                }
            }
        }
        replaced
    }

    /// Index a batch of tools from one server, sequentially per tool.
    ///
    /// Embedding failures abort only the failing tool.
    pub async fn index_server_tools(
        &self,
        server: &str,
        upstream_tools: &[UpstreamTool],
    ) -> IndexReport {
        let mut report = IndexReport::default();
        for tool in upstream_tools {
            match self.index_tool(server, tool).await {
                Ok(one) => report.merge(one),
                Err(e) => {
                    warn!(server, tool = %tool.name, "failed to index tool: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Wipe all records, vectors and mappings for one embedding model
    pub fn clear_index(&self, model_name: &str) -> Result<usize> {
        let removed = self
            .storage
            .with_transaction(|conn| tools::clear_index(conn, model_name))?;
        info!(model_name, removed, "cleared tool index");
        Ok(removed)
    }
}
