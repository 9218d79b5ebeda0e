//! Secret vault: keyed byte store sealed with a process-level master key.
//!
//! The cipher is deliberately minimal — a SHA-256-derived keystream over a
//! random per-value nonce. Swapping in an AEAD is a local change behind
//! `seal`/`open`. The contract that matters here: atomic upsert, delete by
//! name, listing never returns values, and plaintext leaves the vault only
//! when injected into a starting VM's env map.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

use aegis_shared::errors::{AegisError, AegisResult};

use crate::db::SecretStore;

const NONCE_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Process-wide secret vault backed by the registry.
#[derive(Clone)]
pub struct SecretVault {
    key: [u8; KEY_LEN],
    store: SecretStore,
}

impl SecretVault {
    /// Open the vault, creating `master.key` (0600) on first run.
    pub fn open(master_key_path: &Path, store: SecretStore) -> AegisResult<Self> {
        let key = load_or_create_key(master_key_path)?;
        Ok(Self { key, store })
    }

    /// Atomic insert-or-replace.
    pub fn put(&self, name: &str, value: &[u8]) -> AegisResult<()> {
        if name.is_empty() {
            return Err(AegisError::Validation("secret name is empty".into()));
        }
        let sealed = self.seal(value);
        self.store.upsert(name, &sealed)
    }

    /// Delete by name; absent is a no-op. Returns whether a row existed.
    pub fn delete(&self, name: &str) -> AegisResult<bool> {
        self.store.delete(name)
    }

    /// Names and creation times only.
    pub fn list(&self) -> AegisResult<Vec<(String, DateTime<Utc>)>> {
        self.store.list()
    }

    pub fn exists(&self, name: &str) -> AegisResult<Option<DateTime<Utc>>> {
        Ok(self.store.get(name)?.map(|row| row.created_at))
    }

    /// Resolve secret references into env entries for a starting VM. The
    /// only path on which plaintext leaves the vault.
    pub fn inject(&self, refs: &BTreeSet<String>) -> AegisResult<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        for name in refs {
            let row = self.store.get(name)?.ok_or_else(|| {
                AegisError::NotFound(format!("secret \"{name}\" is not defined"))
            })?;
            let plain = self.open_sealed(&row.encrypted_value)?;
            let value = String::from_utf8(plain).map_err(|_| {
                AegisError::Validation(format!("secret \"{name}\" is not valid UTF-8"))
            })?;
            env.insert(name.clone(), value);
        }
        Ok(env)
    }

    fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce: [u8; NONCE_LEN] = rand::rng().random();
        let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);
        xor_keystream(&self.key, &nonce, &mut out[NONCE_LEN..]);
        out
    }

    fn open_sealed(&self, sealed: &[u8]) -> AegisResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(AegisError::Fatal(
                "sealed secret shorter than its nonce".into(),
            ));
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        let mut out = body.to_vec();
        xor_keystream(&self.key, nonce, &mut out);
        Ok(out)
    }
}

/// XOR `buf` with SHA-256(key ‖ nonce ‖ block counter) blocks.
fn xor_keystream(key: &[u8; KEY_LEN], nonce: &[u8], buf: &mut [u8]) {
    for (block_index, chunk) in buf.chunks_mut(32).enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(nonce);
        hasher.update((block_index as u64).to_be_bytes());
        let block = hasher.finalize();
        for (byte, pad) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= pad;
        }
    }
}

fn load_or_create_key(path: &Path) -> AegisResult<[u8; KEY_LEN]> {
    if path.exists() {
        let raw = std::fs::read(path)
            .map_err(|e| AegisError::Fatal(format!("read {}: {e}", path.display())))?;
        let key: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
            AegisError::Fatal(format!(
                "{} is {} bytes, expected {KEY_LEN}",
                path.display(),
                raw.len()
            ))
        })?;
        return Ok(key);
    }

    let key: [u8; KEY_LEN] = rand::rng().random();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AegisError::Fatal(format!("create {}: {e}", parent.display())))?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| AegisError::Fatal(format!("create {}: {e}", path.display())))?;
    file.write_all(&key)
        .map_err(|e| AegisError::Fatal(format!("write {}: {e}", path.display())))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn vault(dir: &Path) -> SecretVault {
        let db = Database::open_in_memory().unwrap();
        SecretVault::open(&dir.join("master.key"), SecretStore::new(db)).unwrap()
    }

    #[test]
    fn seal_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path());
        let sealed = v.seal(b"hunter2");
        assert_ne!(&sealed[NONCE_LEN..], b"hunter2");
        assert_eq!(v.open_sealed(&sealed).unwrap(), b"hunter2");
    }

    #[test]
    fn inject_resolves_refs() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path());
        v.put("API_KEY", b"abc123").unwrap();

        let refs: BTreeSet<String> = ["API_KEY".to_string()].into();
        let env = v.inject(&refs).unwrap();
        assert_eq!(env["API_KEY"], "abc123");

        let missing: BTreeSet<String> = ["NOPE".to_string()].into();
        assert!(matches!(
            v.inject(&missing),
            Err(AegisError::NotFound(_))
        ));
    }

    #[test]
    fn key_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let key_path = dir.path().join("master.key");

        let first = SecretVault::open(&key_path, SecretStore::new(db.clone())).unwrap();
        first.put("k", b"v").unwrap();

        // New vault instance over the same key file and store decrypts.
        let second = SecretVault::open(&key_path, SecretStore::new(db)).unwrap();
        let refs: BTreeSet<String> = ["k".to_string()].into();
        assert_eq!(second.inject(&refs).unwrap()["k"], "v");
    }

    #[test]
    fn list_never_returns_values() {
        let dir = tempfile::tempdir().unwrap();
        let v = vault(dir.path());
        v.put("token", b"secret-bytes").unwrap();
        let listed = v.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "token");
    }
}
