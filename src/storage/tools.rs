//! Queries over the tool catalog: `tool_vectors`, `vec_tool_embeddings`
//! and `tool_mapping`
//!
//! Vectors are stored as float32 little-endian BLOBs, unit-normalized on
//! write. Similarity search is a cosine scan over the candidate rows, which
//! is sufficient for the expected catalog size.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::embedding::cosine_similarity;
use crate::error::{DextError, Result};
use crate::types::{SimilarTool, ToolId, ToolRecord, DISPLAY_NAME_SEPARATOR};

/// Encode a vector as a float32 little-endian BLOB
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Decode a float32 little-endian BLOB back into a vector
pub fn blob_to_vector(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(DextError::Internal(format!(
            "corrupt embedding blob of {} bytes",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Parse a tool record from a database row
pub fn tool_from_row(row: &Row) -> rusqlite::Result<ToolRecord> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(ToolRecord {
        id: row.get("id")?,
        tool_md5: row.get("tool_md5")?,
        model_name: row.get("model_name")?,
        display_name: row.get("display_name")?,
        description: row.get("description")?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

/// Check whether a tool identity is already indexed for a model
pub fn tool_exists(conn: &Connection, tool_md5: &str, model_name: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT COUNT(*) FROM tool_vectors WHERE tool_md5 = ? AND model_name = ?",
    )?;
    let count: i64 = stmt.query_row(params![tool_md5, model_name], |row| row.get(0))?;
    Ok(count > 0)
}

/// Insert or update a tool record together with its vector and mapping.
///
/// Must run inside a transaction: three tables change together. The vector
/// dimension is checked against `expected_dim` before anything is written.
pub fn upsert_tool_with_vector(
    conn: &Connection,
    display_name: &str,
    description: &str,
    model_name: &str,
    tool_md5: &str,
    vector: &[f32],
    expected_dim: usize,
) -> Result<ToolId> {
    if vector.len() != expected_dim {
        return Err(DextError::Shape {
            expected: expected_dim,
            actual: vector.len(),
        });
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO tool_vectors (tool_md5, model_name, display_name, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(tool_md5, model_name) DO UPDATE SET
             display_name = excluded.display_name,
             description = excluded.description,
             updated_at = excluded.updated_at",
        params![tool_md5, model_name, display_name, description, now],
    )?;

    let tool_id: i64 = conn.query_row(
        "SELECT id FROM tool_vectors WHERE tool_md5 = ? AND model_name = ?",
        params![tool_md5, model_name],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO vec_tool_embeddings (embedding) VALUES (?)",
        params![vector_to_blob(vector)],
    )?;
    let vec_rowid = conn.last_insert_rowid();

    // Keep exactly one vector per record: drop a superseded vector row
    // before repointing the mapping.
    let previous: Option<i64> = conn
        .query_row(
            "SELECT vec_rowid FROM tool_mapping WHERE tool_id = ?",
            params![tool_id],
            |row| row.get(0),
        )
        .ok();
    if let Some(old_rowid) = previous {
        conn.execute(
            "DELETE FROM vec_tool_embeddings WHERE rowid = ?",
            params![old_rowid],
        )?;
        conn.execute(
            "UPDATE tool_mapping SET vec_rowid = ? WHERE tool_id = ?",
            params![vec_rowid, tool_id],
        )?;
    } else {
        conn.execute(
            "INSERT INTO tool_mapping (vec_rowid, tool_id) VALUES (?, ?)",
            params![vec_rowid, tool_id],
        )?;
    }

    Ok(tool_id)
}

/// Delete tool records by identity, cascading vector and mapping rows.
///
/// Must run inside a transaction. Returns the number of records removed.
pub fn delete_tool_by_md5(
    conn: &Connection,
    tool_md5: &str,
    model_name: Option<&str>,
) -> Result<usize> {
    let ids: Vec<i64> = match model_name {
        Some(model) => {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM tool_vectors WHERE tool_md5 = ? AND model_name = ?",
            )?;
            let rows = stmt.query_map(params![tool_md5, model], |row| row.get(0))?;
            rows.filter_map(|r| r.ok()).collect()
        }
        None => {
            let mut stmt =
                conn.prepare_cached("SELECT id FROM tool_vectors WHERE tool_md5 = ?")?;
            let rows = stmt.query_map(params![tool_md5], |row| row.get(0))?;
            rows.filter_map(|r| r.ok()).collect()
        }
    };

    for id in &ids {
        delete_tool_rows(conn, *id)?;
    }
    Ok(ids.len())
}

fn delete_tool_rows(conn: &Connection, tool_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM vec_tool_embeddings WHERE rowid IN
             (SELECT vec_rowid FROM tool_mapping WHERE tool_id = ?)",
        params![tool_id],
    )?;
    conn.execute("DELETE FROM tool_mapping WHERE tool_id = ?", params![tool_id])?;
    conn.execute("DELETE FROM tool_vectors WHERE id = ?", params![tool_id])?;
    Ok(())
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Find the most similar indexed tools for a query vector.
///
/// Results are filtered to `similarity >= threshold`, ordered by ascending
/// cosine distance with ties broken by ascending tool id, and truncated to
/// `top_k`. When `server_prefixes` is non-empty only tools whose display
/// name starts with `{prefix}__` are considered; the match is exact on the
/// separator boundary, so prefix `a` never captures `aa__x`.
pub fn search_similar(
    conn: &Connection,
    query_vector: &[f32],
    model_name: &str,
    top_k: usize,
    threshold: f32,
    server_prefixes: &[String],
) -> Result<Vec<SimilarTool>> {
    let mut sql = String::from(
        "SELECT t.id, t.tool_md5, t.display_name, t.description, t.created_at, v.embedding
         FROM tool_vectors t
         JOIN tool_mapping m ON m.tool_id = t.id
         JOIN vec_tool_embeddings v ON v.rowid = m.vec_rowid
         WHERE t.model_name = ?",
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(model_name.to_string())];

    if !server_prefixes.is_empty() {
        let placeholders: Vec<&str> = server_prefixes
            .iter()
            .map(|_| "t.display_name LIKE ? ESCAPE '\\'")
            .collect();
        sql.push_str(&format!(" AND ({})", placeholders.join(" OR ")));
        for prefix in server_prefixes {
            let pattern = format!("{}{}%", escape_like(prefix), "\\_\\_");
            params.push(Box::new(pattern));
        }
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
        |row| {
            let id: i64 = row.get(0)?;
            let tool_md5: String = row.get(1)?;
            let display_name: String = row.get(2)?;
            let description: String = row.get(3)?;
            let created_at: String = row.get(4)?;
            let blob: Vec<u8> = row.get(5)?;
            Ok((id, tool_md5, display_name, description, created_at, blob))
        },
    )?;

    let mut scored: Vec<SimilarTool> = Vec::new();
    for row in rows {
        let (id, tool_md5, display_name, description, created_at, blob) = row?;
        let embedding = blob_to_vector(&blob)?;
        let similarity = cosine_similarity(query_vector, &embedding);
        if similarity >= threshold {
            scored.push(SimilarTool {
                tool_id: id,
                tool_md5,
                display_name,
                description,
                distance: 1.0 - similarity,
                similarity,
                created_at: parse_timestamp(&created_at),
            });
        }
    }

    scored.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.tool_id.cmp(&b.tool_id))
    });
    scored.truncate(top_k);

    Ok(scored)
}

/// Catalog records for one server, by display-name prefix
pub fn tools_for_server(conn: &Connection, server: &str) -> Result<Vec<ToolRecord>> {
    let pattern = format!("{}{}%", escape_like(server), "\\_\\_");
    let mut stmt = conn.prepare_cached(
        "SELECT id, tool_md5, model_name, display_name, description, created_at, updated_at
         FROM tool_vectors
         WHERE display_name LIKE ? ESCAPE '\\'
         ORDER BY display_name ASC",
    )?;
    let rows = stmt.query_map(params![pattern], tool_from_row)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Remove every catalog record belonging to a server prefix.
///
/// Must run inside a transaction. Returns the number of records removed.
pub fn delete_tools_for_server(conn: &Connection, server: &str) -> Result<usize> {
    let records = tools_for_server(conn, server)?;
    for record in &records {
        delete_tool_rows(conn, record.id)?;
    }
    Ok(records.len())
}

/// Wipe the whole index for one embedding model.
///
/// Must run inside a transaction. Returns the number of records removed.
pub fn clear_index(conn: &Connection, model_name: &str) -> Result<usize> {
    let mut stmt =
        conn.prepare_cached("SELECT id FROM tool_vectors WHERE model_name = ?")?;
    let ids: Vec<i64> = stmt
        .query_map(params![model_name], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    for id in &ids {
        delete_tool_rows(conn, *id)?;
    }
    Ok(ids.len())
}

/// Total number of indexed tools, optionally narrowed to one model
pub fn count_tools(conn: &Connection, model_name: Option<&str>) -> Result<u64> {
    let count: i64 = match model_name {
        Some(model) => conn.query_row(
            "SELECT COUNT(*) FROM tool_vectors WHERE model_name = ?",
            params![model],
            |row| row.get(0),
        )?,
        None => conn.query_row("SELECT COUNT(*) FROM tool_vectors", [], |row| row.get(0))?,
    };
    Ok(count as u64)
}

/// Number of stored vectors (used by the invariant checks in tests)
pub fn count_vectors(conn: &Connection) -> Result<u64> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM vec_tool_embeddings", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Tools whose display name does not belong to any of `server_names`
pub fn orphaned_tools(
    conn: &Connection,
    server_names: &[String],
) -> Result<Vec<ToolRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, tool_md5, model_name, display_name, description, created_at, updated_at
         FROM tool_vectors ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], tool_from_row)?;

    let mut orphans = Vec::new();
    for record in rows.filter_map(|r| r.ok()) {
        let owned = server_names.iter().any(|name| {
            record
                .display_name
                .starts_with(&format!("{name}{DISPLAY_NAME_SEPARATOR}"))
        });
        if !owned {
            orphans.push(record);
        }
    }
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::tool_identity;

    fn unit(v: &[f32]) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    fn insert(storage: &Storage, display_name: &str, description: &str, vector: &[f32]) -> ToolId {
        let md5 = tool_identity(display_name, description);
        storage
            .with_transaction(|conn| {
                upsert_tool_with_vector(
                    conn,
                    display_name,
                    description,
                    "test-model",
                    &md5,
                    vector,
                    vector.len(),
                )
            })
            .unwrap()
    }

    #[test]
    fn test_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0];
        let blob = vector_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_vector(&blob).unwrap(), v);
        assert!(blob_to_vector(&blob[..5]).is_err());
    }

    #[test]
    fn test_upsert_keeps_one_vector_per_record() {
        let storage = Storage::open_in_memory().unwrap();
        let v = unit(&[1.0, 0.0, 0.0]);

        let id1 = insert(&storage, "srv__read", "read a file", &v);
        let id2 = insert(&storage, "srv__read", "read a file", &v);
        assert_eq!(id1, id2);

        storage
            .with_connection(|conn| {
                assert_eq!(count_tools(conn, Some("test-model"))?, 1);
                assert_eq!(count_vectors(conn)?, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_upsert_rejects_wrong_dimension() {
        let storage = Storage::open_in_memory().unwrap();
        let err = storage
            .with_transaction(|conn| {
                upsert_tool_with_vector(conn, "srv__t", "d", "m", "ffff", &[1.0, 0.0], 3)
            })
            .unwrap_err();
        assert!(matches!(err, DextError::Shape { expected: 3, actual: 2 }));
    }

    #[test]
    fn test_search_orders_by_distance() {
        let storage = Storage::open_in_memory().unwrap();
        insert(&storage, "a__x", "north", &unit(&[1.0, 0.0, 0.0]));
        insert(&storage, "a__y", "northeast", &unit(&[1.0, 1.0, 0.0]));
        insert(&storage, "a__z", "east", &unit(&[0.0, 1.0, 0.0]));

        let query = unit(&[1.0, 0.1, 0.0]);
        let hits = storage
            .with_connection(|conn| search_similar(conn, &query, "test-model", 10, 0.0, &[]))
            .unwrap();

        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].display_name, "a__x");
        assert_eq!(hits[1].display_name, "a__y");
        assert_eq!(hits[2].display_name, "a__z");
        assert!(hits[0].similarity > hits[1].similarity);
        assert!((hits[0].distance - (1.0 - hits[0].similarity)).abs() < 1e-6);
    }

    #[test]
    fn test_search_threshold_and_top_k() {
        let storage = Storage::open_in_memory().unwrap();
        insert(&storage, "a__x", "same", &unit(&[1.0, 0.0, 0.0]));
        insert(&storage, "a__y", "orthogonal", &unit(&[0.0, 1.0, 0.0]));

        let query = unit(&[1.0, 0.0, 0.0]);
        let hits = storage
            .with_connection(|conn| search_similar(conn, &query, "test-model", 10, 0.5, &[]))
            .unwrap();
        assert_eq!(hits.len(), 1);

        let hits = storage
            .with_connection(|conn| search_similar(conn, &query, "test-model", 1, 0.0, &[]))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_prefix_filter_respects_separator_boundary() {
        let storage = Storage::open_in_memory().unwrap();
        let v = unit(&[1.0, 0.0, 0.0]);
        insert(&storage, "a__x", "tool on a", &v);
        insert(&storage, "aa__x", "tool on aa", &v);

        let hits = storage
            .with_connection(|conn| {
                search_similar(conn, &v, "test-model", 10, 0.0, &["a".to_string()])
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].display_name, "a__x");
    }

    #[test]
    fn test_delete_by_md5_cascades() {
        let storage = Storage::open_in_memory().unwrap();
        let v = unit(&[1.0, 0.0, 0.0]);
        insert(&storage, "srv__t", "desc", &v);
        let md5 = tool_identity("srv__t", "desc");

        let deleted = storage
            .with_transaction(|conn| delete_tool_by_md5(conn, &md5, Some("test-model")))
            .unwrap();
        assert_eq!(deleted, 1);

        storage
            .with_connection(|conn| {
                assert_eq!(count_tools(conn, None)?, 0);
                assert_eq!(count_vectors(conn)?, 0);
                let mappings: i64 =
                    conn.query_row("SELECT COUNT(*) FROM tool_mapping", [], |r| r.get(0))?;
                assert_eq!(mappings, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_orphaned_tools_and_server_cleanup() {
        let storage = Storage::open_in_memory().unwrap();
        let v = unit(&[1.0, 0.0, 0.0]);
        insert(&storage, "kept__t", "desc", &v);
        insert(&storage, "gone__t", "desc", &v);

        let orphans = storage
            .with_connection(|conn| orphaned_tools(conn, &["kept".to_string()]))
            .unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].display_name, "gone__t");

        let removed = storage
            .with_transaction(|conn| delete_tools_for_server(conn, "gone"))
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = storage
            .with_connection(|conn| count_tools(conn, None))
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn test_clear_index_scoped_to_model() {
        let storage = Storage::open_in_memory().unwrap();
        let v = unit(&[1.0, 0.0, 0.0]);
        insert(&storage, "srv__a", "one", &v);
        storage
            .with_transaction(|conn| {
                upsert_tool_with_vector(
                    conn,
                    "srv__b",
                    "two",
                    "other-model",
                    &tool_identity("srv__b", "two"),
                    &v,
                    3,
                )
            })
            .unwrap();

        let removed = storage
            .with_transaction(|conn| clear_index(conn, "test-model"))
            .unwrap();
        assert_eq!(removed, 1);
        storage
            .with_connection(|conn| {
                assert_eq!(count_tools(conn, Some("other-model"))?, 1);
                assert_eq!(count_vectors(conn)?, 1);
                Ok(())
            })
            .unwrap();
    }
}
