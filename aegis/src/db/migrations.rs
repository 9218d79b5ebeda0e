//! Forward-only, idempotent schema migrations.
//!
//! Every statement is safe to re-run: tables use `CREATE TABLE IF NOT
//! EXISTS`, columns are added with `ALTER TABLE` and a tolerated
//! duplicate-column error. There is no down path.

use rusqlite::Connection;

use aegis_shared::errors::{AegisError, AegisResult};

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS instances (
    id          TEXT PRIMARY KEY,
    handle      TEXT UNIQUE,
    state       TEXT NOT NULL,
    enabled     INTEGER NOT NULL,
    record_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS secrets (
    name            TEXT PRIMARY KEY,
    encrypted_value BLOB NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tether_frames (
    instance_id TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    frame_json  TEXT NOT NULL,
    PRIMARY KEY (instance_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_instances_state ON instances (state);
";

/// Columns added after the initial schema shipped. Re-running against a
/// current database yields a duplicate-column error, which is tolerated.
const ADDITIVE_COLUMNS: &[&str] = &[
    "ALTER TABLE instances ADD COLUMN stopped_at INTEGER",
];

pub(super) fn apply(conn: &Connection) -> AegisResult<()> {
    conn.execute_batch(CREATE_TABLES)
        .map_err(|e| AegisError::Fatal(format!("registry migration: {e}")))?;

    for stmt in ADDITIVE_COLUMNS {
        if let Err(e) = conn.execute_batch(stmt) {
            if is_duplicate_column(&e) {
                continue;
            }
            return Err(AegisError::Fatal(format!("registry migration: {e}")));
        }
    }
    Ok(())
}

fn is_duplicate_column(e: &rusqlite::Error) -> bool {
    e.to_string().contains("duplicate column name")
}
