//! SQLite schema and migrations for the tier store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Idempotent: safe to call on every process start and from several
/// processes sharing one database file.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL lets concurrent workers read while one writes
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(5_000))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS tier_metrics (
            item_id TEXT PRIMARY KEY NOT NULL,
            tier TEXT NOT NULL DEFAULT 'L0' CHECK (tier IN ('L0', 'L1', 'L2', 'L3')),
            surprise_score REAL NOT NULL DEFAULT 0.0
                CHECK (surprise_score >= 0.0 AND surprise_score <= 1.0),
            retrieval_count_7d INTEGER NOT NULL DEFAULT 0 CHECK (retrieval_count_7d >= 0),
            retrieval_count_30d INTEGER NOT NULL DEFAULT 0 CHECK (retrieval_count_30d >= 0),
            validator_overlap REAL NOT NULL DEFAULT 0.0
                CHECK (validator_overlap >= 0.0 AND validator_overlap <= 1.0),
            last_promoted_at TEXT,
            last_demoted_at TEXT,
            last_update_cycle INTEGER NOT NULL DEFAULT 0 CHECK (last_update_cycle >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('promote', 'demote', 'skip', 'place')),
            from_tier TEXT CHECK (from_tier IS NULL OR from_tier IN ('L0', 'L1', 'L2', 'L3')),
            to_tier TEXT NOT NULL CHECK (to_tier IN ('L0', 'L1', 'L2', 'L3')),
            reason TEXT NOT NULL,
            surprise_score REAL NOT NULL,
            retrieval_count_7d INTEGER NOT NULL,
            validator_overlap REAL NOT NULL,
            performed_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS forgetting_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            regression_item_id TEXT NOT NULL,
            regression_query TEXT NOT NULL,
            recall_at_k_before REAL NOT NULL,
            recall_at_k_after REAL NOT NULL,
            forgetting_delta REAL NOT NULL,
            faithfulness_score REAL,
            overlap_score REAL,
            evaluation_timestamp TEXT NOT NULL,
            knowledge_update_timestamp TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_tier_metrics_tier ON tier_metrics(tier);
        CREATE INDEX IF NOT EXISTS idx_audit_item ON audit_log(item_id);
        CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);
        CREATE INDEX IF NOT EXISTS idx_forgetting_eval_ts
            ON forgetting_metrics(evaluation_timestamp);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);

        COMMIT;",
    )
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='tier_metrics'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_schema() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        assert!(is_initialized(&conn));
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        let rows: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_tier_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO tier_metrics (item_id, tier, created_at, updated_at)
             VALUES ('bad', 'L7', 'x', 'x')",
            [],
        );
        assert!(result.is_err());

        conn.execute(
            "INSERT INTO tier_metrics (item_id, tier, created_at, updated_at)
             VALUES ('ok', 'L2', 'x', 'x')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_item_id_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        let insert = "INSERT INTO tier_metrics (item_id, created_at, updated_at)
                      VALUES ('dup', 'x', 'x')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
