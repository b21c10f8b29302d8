//! Semantic retrieval over the indexed tool catalog
//!
//! A retrieval call embeds each intent description, ranks indexed tools by
//! cosine similarity, splits the hits into tools the session has already
//! been shown and genuinely new ones, and records the new ones so the next
//! call with the same session id will not surface them again.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::embedding::Embedder;
use crate::error::{DextError, Result};
use crate::registry::UpstreamRegistry;
use crate::storage::{sessions, tools, Storage};
use crate::types::{
    generate_session_id, KnownToolEntry, NewToolEntry, QueryKnownTools, QueryNewTools,
    RetrievalResult, RetrievalSummary,
};

/// Default number of candidates returned per query
pub const DEFAULT_TOP_K: usize = 5;

/// Default similarity floor
pub const DEFAULT_THRESHOLD: f32 = 0.10;

/// Tunable retrieval parameters
#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub threshold: f32,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// The retrieval engine: the only writer of session history
pub struct RetrievalEngine {
    storage: Storage,
    embedder: Arc<dyn Embedder>,
    registry: Arc<UpstreamRegistry>,
    options: RetrievalOptions,
}

impl RetrievalEngine {
    pub fn new(
        storage: Storage,
        embedder: Arc<dyn Embedder>,
        registry: Arc<UpstreamRegistry>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            storage,
            embedder,
            registry,
            options,
        }
    }

    /// Retrieve candidate tools for a sequence of intent descriptions.
    ///
    /// When `session_id` has no recorded history a fresh id is generated and
    /// the response carries a description of the connected servers; per-query
    /// output follows the order of `descriptions`.
    pub async fn retrieve(
        &self,
        descriptions: &[String],
        session_id: Option<&str>,
        server_names: &[String],
    ) -> Result<RetrievalResult> {
        if descriptions.is_empty() {
            return Err(DextError::Validation(
                "descriptions must contain at least one entry".into(),
            ));
        }
        if descriptions.iter().any(|d| d.trim().is_empty()) {
            return Err(DextError::Validation(
                "descriptions must be non-empty strings".into(),
            ));
        }

        // Session resolution: reuse the caller's id only when it has history
        let (session_id, first_time) = match session_id {
            Some(sid) if !sid.is_empty() => {
                let history = self
                    .storage
                    .with_connection(|conn| sessions::get_session_history(conn, sid))?;
                if history.is_empty() {
                    (generate_session_id(), true)
                } else {
                    (sid.to_string(), false)
                }
            }
            _ => (generate_session_id(), true),
        };

        let known_set: HashSet<String> = self
            .storage
            .with_connection(|conn| sessions::get_session_history(conn, &session_id))?
            .into_iter()
            .map(|entry| entry.tool_md5)
            .collect();

        let model_name = self.embedder.model_name().to_string();
        let mut new_tools: Vec<QueryNewTools> = Vec::new();
        let mut known_tools: Vec<QueryKnownTools> = Vec::new();
        let mut to_record: Vec<(String, String)> = Vec::new();

        for (query_index, description) in descriptions.iter().enumerate() {
            let vector = self.embedder.embed_one(description.trim()).await?;
            let candidates = self.storage.with_connection(|conn| {
                tools::search_similar(
                    conn,
                    &vector,
                    &model_name,
                    self.options.top_k,
                    self.options.threshold,
                    server_names,
                )
            })?;

            if candidates.is_empty() {
                debug!(query_index, "no candidates above threshold");
                continue;
            }

            let mut new_for_query: Vec<NewToolEntry> = Vec::new();
            let mut known_for_query: Vec<KnownToolEntry> = Vec::new();

            for (position, candidate) in candidates.iter().enumerate() {
                let rank = position + 1;
                if known_set.contains(&candidate.tool_md5) {
                    known_for_query.push(KnownToolEntry {
                        rank,
                        tool_name: candidate.display_name.clone(),
                        md5: candidate.tool_md5.clone(),
                    });
                } else {
                    let (input_schema, output_schema) =
                        self.live_schemas(&candidate.tool_md5)?;
                    new_for_query.push(NewToolEntry {
                        rank,
                        tool_name: candidate.display_name.clone(),
                        md5: candidate.tool_md5.clone(),
                        description: candidate.description.clone(),
                        similarity: round4(candidate.similarity),
                        input_schema,
                        output_schema,
                    });
                    to_record.push((
                        candidate.tool_md5.clone(),
                        candidate.display_name.clone(),
                    ));
                }
            }

            if !new_for_query.is_empty() {
                new_tools.push(QueryNewTools {
                    query_index,
                    query: description.clone(),
                    tools: new_for_query,
                });
            }
            if !known_for_query.is_empty() {
                known_tools.push(QueryKnownTools {
                    query_index,
                    query: description.clone(),
                    tools: known_for_query,
                });
            }
        }

        if !to_record.is_empty() {
            self.storage.with_transaction(|conn| {
                sessions::record_retrieved_batch(conn, &session_id, &to_record)
            })?;
        }

        let history_count = self
            .storage
            .with_connection(|conn| sessions::session_stats(conn, &session_id))?
            .total_tools;

        let summary = RetrievalSummary {
            new_tools_count: new_tools.iter().map(|q| q.tools.len()).sum(),
            known_tools_count: known_tools.iter().map(|q| q.tools.len()).sum(),
            session_history_count: history_count,
        };

        let server_description = first_time.then(|| self.render_server_description());

        Ok(RetrievalResult {
            session_id,
            new_tools,
            known_tools,
            summary,
            server_description,
        })
    }

    /// Fetch input/output schemas from the live tool list, matching the
    /// persisted identity back to an upstream tool. A catalog entry whose
    /// upstream has drifted since indexing falls back to an empty schema.
    fn live_schemas(&self, tool_md5: &str) -> Result<(String, Option<serde_json::Value>)> {
        match self.registry.find_tool_by_md5(tool_md5) {
            Some((_, tool)) => Ok((
                serde_json::to_string(&tool.input_schema)?,
                tool.output_schema,
            )),
            None => Ok(("{}".to_string(), None)),
        }
    }

    /// Render the first-time description of enabled servers and their tools
    fn render_server_description(&self) -> String {
        let summaries = self.registry.server_summaries();
        let mut out = String::new();

        if summaries.is_empty() {
            out.push_str("No upstream MCP servers are currently enabled.\n");
        } else {
            out.push_str("Connected MCP servers:\n");
            for (config, tool_names) in summaries {
                out.push_str(&format!("- {} ({} tools)", config.name, tool_names.len()));
                if let Some(description) = &config.description {
                    out.push_str(&format!(": {description}"));
                }
                if !tool_names.is_empty() {
                    out.push_str(&format!(" [{}]", tool_names.join(", ")));
                }
                out.push('\n');
            }
        }

        out.push_str(
            "\nUse the retriever to discover tools for each task and invoke them \
             through the executor; do not call upstream servers directly.",
        );
        out
    }
}

fn round4(value: f32) -> f64 {
    (value as f64 * 10000.0).round() / 10000.0
}
