//! Database migrations
//!
//! Versioned and applied once each at open time. Migrations only add;
//! existing rows are never dropped on upgrade.

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Upstream server configurations
        CREATE TABLE IF NOT EXISTS mcp_servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL,
            url TEXT,
            command TEXT,
            args TEXT NOT NULL DEFAULT '[]',
            headers TEXT NOT NULL DEFAULT '{}',
            env TEXT NOT NULL DEFAULT '{}',
            description TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Tool catalog metadata; one row per (identity, embedding model)
        CREATE TABLE IF NOT EXISTS tool_vectors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tool_md5 TEXT NOT NULL,
            model_name TEXT NOT NULL,
            display_name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(tool_md5, model_name)
        );

        -- Embedding rows: float32 little-endian unit vectors
        CREATE TABLE IF NOT EXISTS vec_tool_embeddings (
            rowid INTEGER PRIMARY KEY AUTOINCREMENT,
            embedding BLOB NOT NULL
        );

        -- One-to-one link between a catalog row and its vector
        CREATE TABLE IF NOT EXISTS tool_mapping (
            vec_rowid INTEGER NOT NULL UNIQUE,
            tool_id INTEGER NOT NULL UNIQUE
        );

        -- Tools already surfaced to a retrieval session
        CREATE TABLE IF NOT EXISTS session_tool_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            tool_md5 TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            retrieved_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(session_id, tool_md5)
        );

        CREATE INDEX IF NOT EXISTS idx_servers_name ON mcp_servers(name);
        CREATE INDEX IF NOT EXISTS idx_servers_type ON mcp_servers(type);
        CREATE INDEX IF NOT EXISTS idx_servers_enabled ON mcp_servers(enabled);

        CREATE INDEX IF NOT EXISTS idx_tools_md5 ON tool_vectors(tool_md5);
        CREATE INDEX IF NOT EXISTS idx_tools_model ON tool_vectors(model_name);
        CREATE INDEX IF NOT EXISTS idx_tools_display ON tool_vectors(display_name);

        CREATE INDEX IF NOT EXISTS idx_session_history
            ON session_tool_history(session_id, tool_md5);

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;

    Ok(())
}
