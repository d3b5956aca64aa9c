//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            id INTEGER PRIMARY KEY,
            key TEXT NOT NULL,
            value REAL NOT NULL,
            z_score REAL NOT NULL,
            severity TEXT NOT NULL,
            result_json TEXT NOT NULL,
            observed_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS reports (
            id INTEGER PRIMARY KEY,
            report_id TEXT NOT NULL UNIQUE,
            trigger_kind TEXT NOT NULL,
            risk_level TEXT NOT NULL,
            total_anomalies INTEGER NOT NULL,
            generator TEXT NOT NULL,
            content_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY,
            report_id TEXT NOT NULL,
            recipient TEXT NOT NULL,
            subject TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            dispatched INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS recipients (
            email TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            notify_on_critical INTEGER NOT NULL DEFAULT 1,
            notify_on_high INTEGER NOT NULL DEFAULT 1,
            notify_on_medium INTEGER NOT NULL DEFAULT 0,
            notify_on_low INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_anomalies_observed ON anomalies(observed_at);
        CREATE INDEX IF NOT EXISTS idx_anomalies_key ON anomalies(key);
        CREATE INDEX IF NOT EXISTS idx_reports_created ON reports(created_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(dispatched);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["anomalies", "reports", "outbox", "recipients"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "table {} should start empty", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
