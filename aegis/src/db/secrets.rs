//! Secret rows: name → encrypted value. Values never leave this table
//! unencrypted; the vault layer seals and opens them.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use aegis_shared::errors::AegisResult;

use super::Database;

/// One persisted secret.
#[derive(Debug, Clone)]
pub struct SecretRow {
    pub name: String,
    pub encrypted_value: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Store for the `secrets` table.
#[derive(Clone)]
pub struct SecretStore {
    db: Database,
}

impl SecretStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Atomic insert-or-replace. `created_at` is preserved across upserts of
    /// the same name.
    pub fn upsert(&self, name: &str, encrypted_value: &[u8]) -> AegisResult<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO secrets (name, encrypted_value, created_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(name) DO UPDATE SET encrypted_value = excluded.encrypted_value",
                params![name, encrypted_value, now],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, name: &str) -> AegisResult<Option<SecretRow>> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT name, encrypted_value, created_at FROM secrets WHERE name = ?1",
                params![name],
                |row| {
                    Ok(SecretRow {
                        name: row.get(0)?,
                        encrypted_value: row.get(1)?,
                        created_at: parse_ts(&row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()
        })
    }

    /// Delete by name; absent names are a no-op. Returns whether a row
    /// existed.
    pub fn delete(&self, name: &str) -> AegisResult<bool> {
        let n = self
            .db
            .with(|conn| conn.execute("DELETE FROM secrets WHERE name = ?1", params![name]))?;
        Ok(n > 0)
    }

    /// Names and creation times only — listing never returns values.
    pub fn list(&self) -> AegisResult<Vec<(String, DateTime<Utc>)>> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT name, created_at FROM secrets ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, parse_ts(&row.get::<_, String>(1)?)))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}
