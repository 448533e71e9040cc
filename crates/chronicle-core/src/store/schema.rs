//! SQLite schema DDL and migration framework.
//!
//! One database hosts any number of named stores; every history table is
//! partitioned by its `store` column.

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::ChronicleResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Core DDL statements.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables ──────────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS vault_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS store_registry (
        name TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        parent TEXT,
        definition_json TEXT NOT NULL,
        schema_version INTEGER NOT NULL DEFAULT 1,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS entity_rows (
        store TEXT NOT NULL,
        surrogate_key TEXT NOT NULL,
        business_key_json TEXT NOT NULL,
        first_seen TEXT NOT NULL,
        source_tag TEXT NOT NULL,
        source_table TEXT,
        is_sentinel INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY(store, surrogate_key)
    );",
    "CREATE TABLE IF NOT EXISTS attribute_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        store TEXT NOT NULL,
        entity_key TEXT NOT NULL,
        diff_hash TEXT NOT NULL,
        load_time TEXT NOT NULL,
        source_tag TEXT NOT NULL,
        is_current INTEGER NOT NULL DEFAULT 1,
        end_time TEXT,
        payload_json TEXT NOT NULL,
        schema_version INTEGER NOT NULL,
        UNIQUE(store, entity_key, diff_hash, load_time)
    );",
    "CREATE TABLE IF NOT EXISTS relationship_rows (
        store TEXT NOT NULL,
        relationship_key TEXT NOT NULL,
        participants_json TEXT NOT NULL,
        attributes_json TEXT NOT NULL,
        load_time TEXT NOT NULL,
        source_tag TEXT NOT NULL,
        PRIMARY KEY(store, relationship_key)
    );",
    "CREATE TABLE IF NOT EXISTS relationship_participants (
        store TEXT NOT NULL,
        relationship_key TEXT NOT NULL,
        position INTEGER NOT NULL,
        role TEXT NOT NULL,
        entity_key TEXT NOT NULL,
        PRIMARY KEY(store, relationship_key, position)
    );",
    "CREATE TABLE IF NOT EXISTS validity_intervals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        store TEXT NOT NULL,
        relationship_key TEXT NOT NULL,
        driving_key TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        is_active INTEGER NOT NULL DEFAULT 1
    );",
    "CREATE TABLE IF NOT EXISTS pit_rows (
        pit TEXT NOT NULL,
        attribute_store TEXT NOT NULL,
        entity_key TEXT NOT NULL,
        snapshot_date TEXT NOT NULL,
        version_key TEXT,
        version_load_time TEXT,
        PRIMARY KEY(pit, entity_key, snapshot_date, attribute_store)
    );",
    // ── indexes ─────────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_attr_entity_load \
         ON attribute_versions(store, entity_key, load_time);",
    "CREATE INDEX IF NOT EXISTS idx_attr_current \
         ON attribute_versions(store, is_current);",
    "CREATE INDEX IF NOT EXISTS idx_rel_participant \
         ON relationship_participants(store, entity_key);",
    "CREATE INDEX IF NOT EXISTS idx_validity_driving \
         ON validity_intervals(store, driving_key, start_time);",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_validity_one_active \
         ON validity_intervals(store, driving_key) WHERE is_active = 1;",
    "CREATE INDEX IF NOT EXISTS idx_pit_snapshot ON pit_rows(pit, snapshot_date);",
];

// ─── Migration framework ────────────────────────────────────────────────────

type MigrationStep = fn(&Connection) -> ChronicleResult<()>;

/// Steps indexed by the version they produce.
const MIGRATIONS: &[(i32, MigrationStep)] = &[
    (1, migrate_to_v1 as MigrationStep),
    (2, migrate_to_v2 as MigrationStep),
];

/// Bring the vault up to [`SCHEMA_VERSION`]. Each step runs under its own
/// savepoint; a failing step is rolled back, logged to `migration_history`
/// and returned, leaving earlier steps committed.
pub fn migrate_schema(conn: &Connection) -> ChronicleResult<()> {
    let stored = get_schema_version(conn);
    for &(target, step) in MIGRATIONS.iter().filter(|(v, _)| *v > stored && *v <= SCHEMA_VERSION) {
        let from = target - 1;
        if let Err(e) = run_step(conn, target, step) {
            let _ = log_step(conn, from, target, Err(&e.to_string()));
            return Err(e);
        }
        log_step(conn, from, target, Ok(()))?;
    }
    Ok(())
}

fn run_step(conn: &Connection, target: i32, step: MigrationStep) -> ChronicleResult<()> {
    conn.execute_batch("SAVEPOINT chronicle_migrate_step;")?;
    let applied = step(conn).and_then(|()| set_schema_version(conn, target));
    match applied {
        Ok(()) => {
            conn.execute_batch("RELEASE SAVEPOINT chronicle_migrate_step;")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch(
                "ROLLBACK TO SAVEPOINT chronicle_migrate_step; RELEASE SAVEPOINT chronicle_migrate_step;",
            );
            Err(e)
        }
    }
}

/// Stored schema version; 0 for a vault that predates versioning.
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM vault_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .ok()
    .flatten()
    .and_then(|raw| raw.parse().ok())
    .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: i32) -> ChronicleResult<()> {
    conn.execute(
        "INSERT INTO vault_meta(key, value) VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![version.to_string()],
    )?;
    Ok(())
}

fn log_step(conn: &Connection, from: i32, to: i32, outcome: Result<(), &str>) -> ChronicleResult<()> {
    let (status, detail) = match outcome {
        Ok(()) => ("success", None),
        Err(message) => ("failed", Some(message)),
    };
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        params![from, to, status, detail],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline, no-op.
fn migrate_to_v1(_conn: &Connection) -> ChronicleResult<()> {
    Ok(())
}

/// v1 -> v2: load-cycle audit tables.
fn migrate_to_v2(conn: &Connection) -> ChronicleResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS load_cycles (
            cycle_id TEXT PRIMARY KEY,
            store TEXT NOT NULL,
            kind TEXT NOT NULL,
            source_tag TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            rows_seen INTEGER NOT NULL,
            rows_rejected INTEGER NOT NULL,
            report_json TEXT NOT NULL
        );",
    )?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS load_rejections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cycle_id TEXT NOT NULL,
            store TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            category TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
        );",
    )?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_load_cycles_store_started \
         ON load_cycles(store, started_at);",
    )?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_load_rejections_cycle \
         ON load_rejections(cycle_id, row_index);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        conn
    }

    #[test]
    fn migrate_fresh_database() {
        let conn = fresh();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        let audit_tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master \
                 WHERE type = 'table' AND name IN ('load_cycles', 'load_rejections');",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(audit_tables, 2);
    }

    #[test]
    fn migrate_idempotent() {
        let conn = fresh();
        migrate_schema(&conn).unwrap();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        let steps: i64 = conn
            .query_row("SELECT COUNT(*) FROM migration_history;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(steps, i64::from(SCHEMA_VERSION));
    }

    #[test]
    fn one_active_interval_per_driving_key_is_enforced() {
        let conn = fresh();
        let insert = "INSERT INTO validity_intervals(store, relationship_key, driving_key, start_time, is_active) \
                      VALUES ('eff', ?1, 'd', '2024-01-01T00:00:00.000000Z', 1);";
        conn.execute(insert, ["r1"]).unwrap();
        assert!(conn.execute(insert, ["r2"]).is_err());
    }
}
