//! Instance rows: the durable shadow of the lifecycle manager's state.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use aegis_shared::errors::{AegisError, AegisResult};

use crate::types::{InstanceRecord, InstanceState};

use super::Database;

/// Store for the `instances` table.
#[derive(Clone)]
pub struct InstanceStore {
    db: Database,
}

impl InstanceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a fresh row. Fails with a conflict if the id or handle is
    /// already taken — the UNIQUE index is the authority on handle races.
    pub fn insert(&self, record: &InstanceRecord) -> AegisResult<()> {
        let json = serde_json::to_string(record)?;
        let result = self.db.with(|conn| {
            conn.execute(
                "INSERT INTO instances (id, handle, state, enabled, stopped_at, record_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.as_str(),
                    record.handle,
                    record.state.as_str(),
                    record.enabled,
                    record.stopped_at.map(|t| t.timestamp()),
                    json,
                ],
            )
        });
        match result {
            Ok(_) => Ok(()),
            Err(AegisError::Conflict(_)) => match &record.handle {
                Some(handle) => Err(AegisError::Conflict(format!(
                    "handle \"{handle}\" already exists"
                ))),
                None => Err(AegisError::Conflict(format!(
                    "instance {} already exists",
                    record.id
                ))),
            },
            Err(e) => Err(e),
        }
    }

    /// Overwrite an existing row with the manager's current copy.
    pub fn save(&self, record: &InstanceRecord) -> AegisResult<()> {
        let json = serde_json::to_string(record)?;
        let updated = self.db.with(|conn| {
            conn.execute(
                "UPDATE instances SET handle = ?2, state = ?3, enabled = ?4, stopped_at = ?5, \
                 record_json = ?6 WHERE id = ?1",
                params![
                    record.id.as_str(),
                    record.handle,
                    record.state.as_str(),
                    record.enabled,
                    record.stopped_at.map(|t| t.timestamp()),
                    json,
                ],
            )
        })?;
        if updated == 0 {
            return Err(AegisError::NotFound(format!(
                "instance {} vanished from registry",
                record.id
            )));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> AegisResult<Option<InstanceRecord>> {
        let json: Option<String> = self.db.with(|conn| {
            conn.query_row(
                "SELECT record_json FROM instances WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        })?;
        json.map(|j| decode(&j)).transpose()
    }

    pub fn get_by_handle(&self, handle: &str) -> AegisResult<Option<InstanceRecord>> {
        let json: Option<String> = self.db.with(|conn| {
            conn.query_row(
                "SELECT record_json FROM instances WHERE handle = ?1",
                params![handle],
                |row| row.get(0),
            )
            .optional()
        })?;
        json.map(|j| decode(&j)).transpose()
    }

    /// Resolve an `{id|handle}` path segment, ids winning ties.
    pub fn resolve(&self, id_or_handle: &str) -> AegisResult<Option<InstanceRecord>> {
        if let Some(record) = self.get(id_or_handle)? {
            return Ok(Some(record));
        }
        self.get_by_handle(id_or_handle)
    }

    pub fn list(&self, state: Option<InstanceState>) -> AegisResult<Vec<InstanceRecord>> {
        let rows: Vec<String> = self.db.with(|conn| {
            let mut out = Vec::new();
            match state {
                Some(state) => {
                    let mut stmt = conn.prepare(
                        "SELECT record_json FROM instances WHERE state = ?1 ORDER BY id",
                    )?;
                    let mapped = stmt.query_map(params![state.as_str()], |row| row.get(0))?;
                    for row in mapped {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT record_json FROM instances ORDER BY id")?;
                    let mapped = stmt.query_map([], |row| row.get(0))?;
                    for row in mapped {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })?;
        rows.iter().map(|j| decode(j)).collect()
    }

    /// Stopped instances whose stop time precedes the cutoff — prune
    /// candidates.
    pub fn list_stopped_before(&self, cutoff: DateTime<Utc>) -> AegisResult<Vec<InstanceRecord>> {
        let rows: Vec<String> = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record_json FROM instances \
                 WHERE state = 'stopped' AND stopped_at IS NOT NULL AND stopped_at < ?1",
            )?;
            let mapped = stmt.query_map(params![cutoff.timestamp()], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            Ok(out)
        })?;
        rows.iter().map(|j| decode(j)).collect()
    }

    /// Delete the row and the instance's persisted tether frames in one
    /// transaction. Returns whether a row existed.
    pub fn delete(&self, id: &str) -> AegisResult<bool> {
        self.db.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM tether_frames WHERE instance_id = ?1",
                params![id],
            )?;
            let deleted = tx.execute("DELETE FROM instances WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(deleted > 0)
        })
    }
}

fn decode(json: &str) -> AegisResult<InstanceRecord> {
    serde_json::from_str(json)
        .map_err(|e| AegisError::Fatal(format!("registry holds undecodable instance row: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceId;
    use std::collections::{BTreeMap, BTreeSet};

    fn record(handle: Option<&str>) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            id: InstanceId::new(),
            handle: handle.map(str::to_string),
            state: InstanceState::Stopped,
            enabled: true,
            command: vec!["sleep".into(), "infinity".into()],
            image_ref: "alpine:3.20".into(),
            kit: None,
            workspace: None,
            env: BTreeMap::new(),
            secret_refs: BTreeSet::new(),
            memory_mb: 512,
            vcpus: 1,
            expose_ports: BTreeMap::new(),
            endpoints: Vec::new(),
            vm_handle: None,
            hypervisor_pid: None,
            sidecar_pids: Vec::new(),
            subnet_slot: None,
            created_at: now,
            updated_at: now,
            stopped_at: Some(now),
            last_active_at: None,
            lease: None,
        }
    }

    #[test]
    fn insert_get_round_trip() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let rec = record(Some("web"));
        store.insert(&rec).unwrap();

        let loaded = store.get(rec.id.as_str()).unwrap().unwrap();
        assert_eq!(loaded.handle.as_deref(), Some("web"));
        assert_eq!(loaded.command, rec.command);
        assert_eq!(loaded.state, InstanceState::Stopped);

        let by_handle = store.get_by_handle("web").unwrap().unwrap();
        assert_eq!(by_handle.id, rec.id);
    }

    #[test]
    fn duplicate_handle_is_conflict() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        store.insert(&record(Some("web"))).unwrap();

        let err = store.insert(&record(Some("web"))).unwrap_err();
        match err {
            AegisError::Conflict(msg) => assert!(msg.contains("web"), "{msg}"),
            other => panic!("expected conflict, got {other}"),
        }
    }

    #[test]
    fn two_instances_without_handles_coexist() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        store.insert(&record(None)).unwrap();
        store.insert(&record(None)).unwrap();
        assert_eq!(store.list(None).unwrap().len(), 2);
    }

    #[test]
    fn delete_removes_row_and_frames() {
        let db = Database::open_in_memory().unwrap();
        let store = InstanceStore::new(db.clone());
        let rec = record(None);
        store.insert(&rec).unwrap();
        db.with(|conn| {
            conn.execute(
                "INSERT INTO tether_frames (instance_id, seq, frame_json) VALUES (?1, 1, '{}')",
                params![rec.id.as_str()],
            )
        })
        .unwrap();

        assert!(store.delete(rec.id.as_str()).unwrap());
        assert!(store.get(rec.id.as_str()).unwrap().is_none());
        let frames: i64 = db
            .with(|conn| conn.query_row("SELECT COUNT(*) FROM tether_frames", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(frames, 0);

        // Second delete is a no-op.
        assert!(!store.delete(rec.id.as_str()).unwrap());
    }

    #[test]
    fn list_filters_by_state() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let mut a = record(None);
        a.state = InstanceState::Running;
        a.vm_handle = Some("vm-1".into());
        store.insert(&a).unwrap();
        store.insert(&record(None)).unwrap();

        assert_eq!(
            store.list(Some(InstanceState::Running)).unwrap().len(),
            1
        );
        assert_eq!(store.list(Some(InstanceState::Failed)).unwrap().len(), 0);
        assert_eq!(store.list(None).unwrap().len(), 2);
    }

    #[test]
    fn prune_cutoff_selects_old_stopped_rows() {
        let store = InstanceStore::new(Database::open_in_memory().unwrap());
        let mut old = record(None);
        old.stopped_at = Some(Utc::now() - chrono::Duration::hours(48));
        store.insert(&old).unwrap();
        store.insert(&record(None)).unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let candidates = store.list_stopped_before(cutoff).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, old.id);
    }
}
