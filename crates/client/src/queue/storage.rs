//! Local SQLite storage for offline queues. Every queue shares one table and is
//! told apart by its `queue` column; payloads and receipts are JSON text.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Result, Row};

const MIGRATIONS: &[(i32, &str)] = &[(1, MIGRATION_001)];

const MIGRATION_001: &str = "
CREATE TABLE IF NOT EXISTS queue_items (
    id              TEXT PRIMARY KEY,
    queue           TEXT NOT NULL,
    payload         TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    retries         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    last_attempt_at TEXT,
    last_error      TEXT,
    receipt         TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_items_queue_status
    ON queue_items (queue, status, created_at);
";

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )
}

pub fn open_queue_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure_connection(&conn)?;
    run_queue_migrations(&conn)?;
    Ok(conn)
}

pub fn open_queue_db_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure_connection(&conn)?;
    run_queue_migrations(&conn)?;
    Ok(conn)
}

pub fn run_queue_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _queue_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _queue_migrations",
        [],
        |row| row.get(0),
    )?;

    for &(version, sql) in MIGRATIONS {
        if version > current_version {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO _queue_migrations (version) VALUES (?1)",
                [version],
            )?;
            tx.commit()?;
        }
    }

    Ok(())
}

/// A queue row with its JSON columns still serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub id: String,
    pub payload: String,
    pub status: String,
    pub retries: i64,
    pub created_at: String,
    pub last_attempt_at: Option<String>,
    pub last_error: Option<String>,
    pub receipt: Option<String>,
}

const COLUMNS: &str =
    "id, payload, status, retries, created_at, last_attempt_at, last_error, receipt";

fn from_row(row: &Row<'_>) -> Result<StoredItem> {
    Ok(StoredItem {
        id: row.get(0)?,
        payload: row.get(1)?,
        status: row.get(2)?,
        retries: row.get(3)?,
        created_at: row.get(4)?,
        last_attempt_at: row.get(5)?,
        last_error: row.get(6)?,
        receipt: row.get(7)?,
    })
}

pub fn insert_item(
    conn: &Connection,
    queue: &str,
    id: &str,
    payload: &str,
    created_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO queue_items (id, queue, payload, status, retries, created_at)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4)",
        params![id, queue, payload, created_at],
    )?;
    Ok(())
}

pub fn get_item(conn: &Connection, queue: &str, id: &str) -> Result<Option<StoredItem>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM queue_items WHERE queue = ?1 AND id = ?2"),
        params![queue, id],
        from_row,
    )
    .optional()
}

/// Items in any of `statuses`, oldest first. An empty slice selects everything.
pub fn list_items(conn: &Connection, queue: &str, statuses: &[&str]) -> Result<Vec<StoredItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM queue_items WHERE queue = ?1 ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map([queue], from_row)?;
    let mut items = Vec::new();
    for row in rows {
        let item = row?;
        if statuses.is_empty() || statuses.contains(&item.status.as_str()) {
            items.push(item);
        }
    }
    Ok(items)
}

pub fn count_by_status(conn: &Connection, queue: &str, status: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM queue_items WHERE queue = ?1 AND status = ?2",
        params![queue, status],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn mark_processing(conn: &Connection, id: &str, attempted_at: &str) -> Result<()> {
    conn.execute(
        "UPDATE queue_items SET status = 'processing', last_attempt_at = ?2 WHERE id = ?1",
        params![id, attempted_at],
    )?;
    Ok(())
}

pub fn mark_completed(conn: &Connection, id: &str, receipt: &str) -> Result<()> {
    conn.execute(
        "UPDATE queue_items SET status = 'completed', last_error = NULL, receipt = ?2
         WHERE id = ?1",
        params![id, receipt],
    )?;
    Ok(())
}

pub fn record_failure(
    conn: &Connection,
    id: &str,
    status: &str,
    retries: i64,
    error: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE queue_items SET status = ?2, retries = ?3, last_error = ?4 WHERE id = ?1",
        params![id, status, retries, error],
    )?;
    Ok(())
}

pub fn set_status(conn: &Connection, id: &str, status: &str) -> Result<()> {
    conn.execute(
        "UPDATE queue_items SET status = ?2 WHERE id = ?1",
        params![id, status],
    )?;
    Ok(())
}

/// Moves every failed item of the queue back to pending with a clean slate.
pub fn reset_failed(conn: &Connection, queue: &str) -> Result<u64> {
    let changed = conn.execute(
        "UPDATE queue_items
         SET status = 'pending', retries = 0, last_attempt_at = NULL, last_error = NULL
         WHERE queue = ?1 AND status = 'failed'",
        [queue],
    )?;
    Ok(changed as u64)
}

pub fn delete_item(conn: &Connection, queue: &str, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM queue_items WHERE queue = ?1 AND id = ?2",
        params![queue, id],
    )?;
    Ok(changed > 0)
}

pub fn delete_by_status(conn: &Connection, queue: &str, status: &str) -> Result<u64> {
    let changed = conn.execute(
        "DELETE FROM queue_items WHERE queue = ?1 AND status = ?2",
        params![queue, status],
    )?;
    Ok(changed as u64)
}

pub fn delete_all(conn: &Connection, queue: &str) -> Result<u64> {
    let changed = conn.execute("DELETE FROM queue_items WHERE queue = ?1", [queue])?;
    Ok(changed as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn migrations_create_queue_table() {
        let conn = open_queue_db_in_memory().unwrap();
        assert!(table_exists(&conn, "queue_items"));
        assert!(table_exists(&conn, "_queue_migrations"));
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = open_queue_db_in_memory().unwrap();
        run_queue_migrations(&conn).unwrap();
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM _queue_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, MIGRATIONS.len() as i64);
    }

    #[test]
    fn file_backed_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let conn = open_queue_db(&path).unwrap();
            insert_item(&conn, "messages", "a", "{}", "2026-01-01T00:00:00.000000Z").unwrap();
        }
        let conn = open_queue_db(&path).unwrap();
        let item = get_item(&conn, "messages", "a").unwrap().unwrap();
        assert_eq!(item.status, "pending");
        assert_eq!(item.retries, 0);
    }

    #[test]
    fn queues_are_isolated_by_name() {
        let conn = open_queue_db_in_memory().unwrap();
        insert_item(&conn, "messages", "a", "{}", "2026-01-01T00:00:00.000000Z").unwrap();
        insert_item(&conn, "forms", "b", "{}", "2026-01-01T00:00:01.000000Z").unwrap();
        assert_eq!(count_by_status(&conn, "messages", "pending").unwrap(), 1);
        assert_eq!(delete_all(&conn, "forms").unwrap(), 1);
        assert_eq!(list_items(&conn, "messages", &[]).unwrap().len(), 1);
    }

    #[test]
    fn reset_failed_clears_retry_state() {
        let conn = open_queue_db_in_memory().unwrap();
        insert_item(&conn, "q", "a", "{}", "2026-01-01T00:00:00.000000Z").unwrap();
        mark_processing(&conn, "a", "2026-01-01T00:00:05.000000Z").unwrap();
        record_failure(&conn, "a", "failed", 5, "boom").unwrap();

        assert_eq!(reset_failed(&conn, "q").unwrap(), 1);
        let item = get_item(&conn, "q", "a").unwrap().unwrap();
        assert_eq!(item.status, "pending");
        assert_eq!(item.retries, 0);
        assert!(item.last_attempt_at.is_none());
        assert!(item.last_error.is_none());
    }
}
