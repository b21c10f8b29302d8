//! Queries over the `mcp_servers` table

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;

use crate::error::{DextError, Result};
use crate::types::{
    CreateServerInput, ServerConfig, ServerFilter, ServerId, ServerKind, UpdateServerInput,
};

/// Parse a server config from a database row
pub fn server_from_row(row: &Row) -> rusqlite::Result<ServerConfig> {
    let id: i64 = row.get("id")?;
    let name: String = row.get("name")?;
    let kind_str: String = row.get("type")?;
    let url: Option<String> = row.get("url")?;
    let command: Option<String> = row.get("command")?;
    let args_str: String = row.get("args")?;
    let headers_str: String = row.get("headers")?;
    let env_str: String = row.get("env")?;
    let description: Option<String> = row.get("description")?;
    let enabled: i32 = row.get("enabled")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let kind = kind_str.parse().unwrap_or(ServerKind::Stdio);
    let args: Vec<String> = serde_json::from_str(&args_str).unwrap_or_default();
    let headers: HashMap<String, String> = serde_json::from_str(&headers_str).unwrap_or_default();
    let env: HashMap<String, String> = serde_json::from_str(&env_str).unwrap_or_default();

    Ok(ServerConfig {
        id,
        name,
        kind,
        url,
        command,
        args,
        headers,
        env,
        description,
        enabled: enabled != 0,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const SERVER_COLUMNS: &str =
    "id, name, type, url, command, args, headers, env, description, enabled, created_at, updated_at";

/// Create a new server row; duplicate names are a conflict
pub fn create_server(conn: &Connection, input: &CreateServerInput) -> Result<ServerConfig> {
    input.validate()?;

    let now = Utc::now().to_rfc3339();
    let args_json = serde_json::to_string(&input.args)?;
    let headers_json = serde_json::to_string(&input.headers)?;
    let env_json = serde_json::to_string(&input.env)?;

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO mcp_servers
            (name, type, url, command, args, headers, env, description, enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            input.name,
            input.kind.to_string(),
            input.url,
            input.command,
            args_json,
            headers_json,
            env_json,
            input.description,
            input.enabled as i32,
            now,
        ],
    )?;

    if inserted == 0 {
        return Err(DextError::Conflict(format!(
            "server '{}' already exists",
            input.name
        )));
    }

    let id = conn.last_insert_rowid();
    get_server(conn, id)
}

/// Fetch a server row by id
pub fn get_server(conn: &Connection, id: ServerId) -> Result<ServerConfig> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE id = ?"
    ))?;

    stmt.query_row(params![id], server_from_row)
        .map_err(|_| DextError::NotFound(format!("server {id}")))
}

/// Fetch a server row by unique name
pub fn get_server_by_name(conn: &Connection, name: &str) -> Result<ServerConfig> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE name = ?"
    ))?;

    stmt.query_row(params![name], server_from_row)
        .map_err(|_| DextError::NotFound(format!("server '{name}'")))
}

fn filter_clause(filter: &ServerFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(enabled) = filter.enabled {
        conditions.push("enabled = ?".to_string());
        params.push(Box::new(enabled as i32));
    }
    if let Some(kind) = filter.kind {
        conditions.push("type = ?".to_string());
        params.push(Box::new(kind.to_string()));
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    (clause, params)
}

/// List server rows with 1-based pagination, ordered by id
pub fn list_servers(
    conn: &Connection,
    filter: &ServerFilter,
    page: u32,
    limit: u32,
) -> Result<Vec<ServerConfig>> {
    let (clause, mut params) = filter_clause(filter);
    let offset = (page.max(1) - 1) as i64 * limit as i64;
    params.push(Box::new(limit as i64));
    params.push(Box::new(offset));

    let sql = format!(
        "SELECT {SERVER_COLUMNS} FROM mcp_servers{clause} ORDER BY id ASC LIMIT ? OFFSET ?"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
        server_from_row,
    )?;

    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// List every enabled server row
pub fn list_enabled_servers(conn: &Connection) -> Result<Vec<ServerConfig>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE enabled = 1 ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([], server_from_row)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Count server rows matching a filter
pub fn count_servers(conn: &Connection, filter: &ServerFilter) -> Result<u64> {
    let (clause, params) = filter_clause(filter);
    let sql = format!("SELECT COUNT(*) FROM mcp_servers{clause}");
    let count: i64 = conn.query_row(
        &sql,
        rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Names of all server rows (for catalog pruning)
pub fn all_server_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached("SELECT name FROM mcp_servers ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Apply a partial update to a server row and return the new state
pub fn update_server(
    conn: &Connection,
    id: ServerId,
    input: &UpdateServerInput,
) -> Result<ServerConfig> {
    let existing = get_server(conn, id)?;

    let merged = CreateServerInput {
        name: input.name.clone().unwrap_or(existing.name),
        kind: input.kind.unwrap_or(existing.kind),
        url: input.url.clone().or(existing.url),
        command: input.command.clone().or(existing.command),
        args: input.args.clone().unwrap_or(existing.args),
        headers: input.headers.clone().unwrap_or(existing.headers),
        env: input.env.clone().unwrap_or(existing.env),
        description: input.description.clone().or(existing.description),
        enabled: input.enabled.unwrap_or(existing.enabled),
    };
    merged.validate()?;

    // Renaming onto another row's name is a conflict
    if let Ok(other) = get_server_by_name(conn, &merged.name) {
        if other.id != id {
            return Err(DextError::Conflict(format!(
                "server '{}' already exists",
                merged.name
            )));
        }
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE mcp_servers
         SET name = ?1, type = ?2, url = ?3, command = ?4, args = ?5,
             headers = ?6, env = ?7, description = ?8, enabled = ?9, updated_at = ?10
         WHERE id = ?11",
        params![
            merged.name,
            merged.kind.to_string(),
            merged.url,
            merged.command,
            serde_json::to_string(&merged.args)?,
            serde_json::to_string(&merged.headers)?,
            serde_json::to_string(&merged.env)?,
            merged.description,
            merged.enabled as i32,
            now,
            id,
        ],
    )?;

    get_server(conn, id)
}

/// Delete a server row, returning the removed config
pub fn delete_server(conn: &Connection, id: ServerId) -> Result<ServerConfig> {
    let existing = get_server(conn, id)?;
    conn.execute("DELETE FROM mcp_servers WHERE id = ?", params![id])?;
    Ok(existing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn stdio_input(name: &str) -> CreateServerInput {
        CreateServerInput {
            name: name.into(),
            kind: ServerKind::Stdio,
            url: None,
            command: Some("npx".into()),
            args: vec!["-y".into(), format!("@scope/{name}")],
            headers: HashMap::new(),
            env: HashMap::from([("TOKEN".into(), "${API_TOKEN:fallback}".into())]),
            description: Some("test server".into()),
            enabled: true,
        }
    }

    #[test]
    fn test_create_and_get_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        let created = storage
            .with_transaction(|conn| create_server(conn, &stdio_input("notion")))
            .unwrap();

        let fetched = storage
            .with_connection(|conn| get_server(conn, created.id))
            .unwrap();
        assert_eq!(fetched.name, "notion");
        assert_eq!(fetched.kind, ServerKind::Stdio);
        assert_eq!(fetched.args, vec!["-y", "@scope/notion"]);
        assert_eq!(fetched.env.get("TOKEN").unwrap(), "${API_TOKEN:fallback}");
        assert!(fetched.enabled);
    }

    #[test]
    fn test_duplicate_name_is_conflict() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_transaction(|conn| create_server(conn, &stdio_input("dup")))
            .unwrap();

        let err = storage
            .with_transaction(|conn| create_server(conn, &stdio_input("dup")))
            .unwrap_err();
        assert!(matches!(err, DextError::Conflict(_)));
    }

    #[test]
    fn test_list_filter_and_count() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_transaction(|conn| {
                create_server(conn, &stdio_input("a"))?;
                let mut b = stdio_input("b");
                b.enabled = false;
                create_server(conn, &b)?;
                let mut c = CreateServerInput {
                    kind: ServerKind::Sse,
                    url: Some("https://example.com/sse".into()),
                    command: None,
                    ..stdio_input("c")
                };
                c.args.clear();
                create_server(conn, &c)
            })
            .unwrap();

        let enabled_only = ServerFilter {
            enabled: Some(true),
            kind: None,
        };
        let listed = storage
            .with_connection(|conn| list_servers(conn, &enabled_only, 1, 10))
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(
            storage
                .with_connection(|conn| count_servers(conn, &enabled_only))
                .unwrap(),
            2
        );

        let sse_only = ServerFilter {
            enabled: None,
            kind: Some(ServerKind::Sse),
        };
        let listed = storage
            .with_connection(|conn| list_servers(conn, &sse_only, 1, 10))
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "c");
    }

    #[test]
    fn test_update_merges_and_validates() {
        let storage = Storage::open_in_memory().unwrap();
        let created = storage
            .with_transaction(|conn| create_server(conn, &stdio_input("srv")))
            .unwrap();

        let patch = UpdateServerInput {
            enabled: Some(false),
            description: Some("patched".into()),
            ..Default::default()
        };
        let updated = storage
            .with_transaction(|conn| update_server(conn, created.id, &patch))
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.description.as_deref(), Some("patched"));
        assert_eq!(updated.command.as_deref(), Some("npx"));

        // Switching to sse without a url must fail validation
        let bad = UpdateServerInput {
            kind: Some(ServerKind::Sse),
            ..Default::default()
        };
        assert!(storage
            .with_transaction(|conn| update_server(conn, created.id, &bad))
            .is_err());
    }

    #[test]
    fn test_delete_returns_removed_row() {
        let storage = Storage::open_in_memory().unwrap();
        let created = storage
            .with_transaction(|conn| create_server(conn, &stdio_input("gone")))
            .unwrap();

        let removed = storage
            .with_transaction(|conn| delete_server(conn, created.id))
            .unwrap();
        assert_eq!(removed.name, "gone");

        let err = storage
            .with_connection(|conn| get_server(conn, created.id))
            .unwrap_err();
        assert!(matches!(err, DextError::NotFound(_)));
    }
}
