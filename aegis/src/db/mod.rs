//! Durable registry — single-file SQLite database in WAL mode.
//!
//! One connection behind a mutex; all writes are single transactions, all
//! reads snapshot-consistent. Stores borrow the shared handle:
//! `InstanceStore::new(db.clone())`.

mod migrations;

pub mod instances;
pub mod secrets;
pub mod tether;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use aegis_shared::errors::{AegisError, AegisResult};

pub use instances::InstanceStore;
pub use secrets::{SecretRow, SecretStore};
pub use tether::TetherFrameStore;

/// Shared registry handle. Cheap to clone; serializes access internally.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if absent) and migrate the registry.
    pub fn open(path: &Path) -> AegisResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| AegisError::Fatal(format!("open registry {}: {e}", path.display())))?;
        Self::init(conn)
    }

    /// In-memory registry for tests.
    pub fn open_in_memory() -> AegisResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AegisError::Fatal(format!("open in-memory registry: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AegisResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AegisError::Fatal(format!("enable WAL: {e}")))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| AegisError::Fatal(format!("set busy_timeout: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| AegisError::Fatal(format!("enable foreign keys: {e}")))?;

        migrations::apply(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure with the connection. Keep closures short — this is the
    /// registry's global serialization point.
    pub(crate) fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> AegisResult<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(map_sqlite_error)
    }
}

/// Map rusqlite failures onto the error taxonomy: constraint violations are
/// state conflicts (duplicate handle, duplicate seq), corruption is fatal,
/// the rest is transient registry I/O.
fn map_sqlite_error(e: rusqlite::Error) -> AegisError {
    use rusqlite::ErrorCode;

    match &e {
        rusqlite::Error::SqliteFailure(f, _) => match f.code {
            ErrorCode::ConstraintViolation => AegisError::Conflict(e.to_string()),
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                AegisError::Fatal(format!("registry corrupt: {e}"))
            }
            _ => AegisError::Io(format!("registry: {e}")),
        },
        _ => AegisError::Io(format!("registry: {e}")),
    }
}
