//! Persisted tether frames. The in-memory ring calls [`TetherFrameStore`]
//! through the persistence callback on every append; boot-time recovery
//! loads the tail back into the ring.

use rusqlite::params;

use aegis_shared::errors::AegisResult;

use super::Database;

/// Store for the `tether_frames` table.
#[derive(Clone)]
pub struct TetherFrameStore {
    db: Database,
}

impl TetherFrameStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write or overwrite one `(instance, seq)` frame.
    pub fn upsert_frame(&self, instance_id: &str, seq: u64, frame_json: &str) -> AegisResult<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO tether_frames (instance_id, seq, frame_json) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(instance_id, seq) DO UPDATE SET frame_json = excluded.frame_json",
                params![instance_id, seq as i64, frame_json],
            )?;
            Ok(())
        })
    }

    /// All frames for one instance in `seq` order.
    pub fn load(&self, instance_id: &str) -> AegisResult<Vec<(u64, String)>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, frame_json FROM tether_frames WHERE instance_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![instance_id], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Drop everything persisted for an instance (destroy/prune path).
    pub fn delete_for_instance(&self, instance_id: &str) -> AegisResult<()> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM tether_frames WHERE instance_id = ?1",
                params![instance_id],
            )?;
            Ok(())
        })
    }
}
