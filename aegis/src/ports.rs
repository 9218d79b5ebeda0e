//! Port-expose layer: `(instance, guest_port)` → live public listener.
//!
//! `expose` binds first, inserts second, all under one lock, so concurrent
//! calls for the same pair converge on exactly one listener. Idempotent for
//! an identical `(guest_port, protocol)` pair; a public port owned by a
//! foreign binding (or another process) is `port_in_use`. Listener accept
//! loops hand every connection to the router.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use aegis_shared::errors::{AegisError, AegisResult};

use crate::router::Router;
use crate::types::{PortBinding, PortProtocol};

/// One live public binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedPort {
    pub instance_id: String,
    pub guest_port: u16,
    pub public_port: u16,
    pub protocol: PortProtocol,
}

struct BindingEntry {
    public_port: u16,
    protocol: PortProtocol,
    accept_task: JoinHandle<()>,
}

impl BindingEntry {
    /// Close the listener and wait until the port is actually released, so
    /// an immediate rebind cannot race the dying accept task.
    async fn shutdown(mut self) {
        self.accept_task.abort();
        let _ = (&mut self.accept_task).await;
    }
}

impl Drop for BindingEntry {
    fn drop(&mut self) {
        // Aborting the accept task closes the listener.
        self.accept_task.abort();
    }
}

/// All public listeners, keyed by `(instance, guest_port)`.
pub struct ExposeTable {
    router: Router,
    bindings: Mutex<HashMap<(String, u16), BindingEntry>>,
}

impl ExposeTable {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Bind a public listener for a guest port. `requested.public_port == 0`
    /// lets the OS choose. Re-exposing an identical `(guest_port, protocol)`
    /// returns the existing binding unchanged.
    pub async fn expose(
        &self,
        instance_id: &str,
        guest_port: u16,
        requested: PortBinding,
    ) -> AegisResult<ExposedPort> {
        let key = (instance_id.to_string(), guest_port);

        if let Some(existing) = self.bindings.lock().get(&key) {
            if existing.protocol == requested.protocol
                && (requested.public_port == 0 || requested.public_port == existing.public_port)
            {
                return Ok(ExposedPort {
                    instance_id: instance_id.to_string(),
                    guest_port,
                    public_port: existing.public_port,
                    protocol: existing.protocol,
                });
            }
            return Err(AegisError::Conflict(format!(
                "guest port {guest_port} already exposed on public port {} as {:?}",
                existing.public_port, existing.protocol
            )));
        }

        // Bind outside the map lock: the OS does the real arbitration, and a
        // losing concurrent caller simply finds the entry on re-check.
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, requested.public_port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                AegisError::Conflict(format!("port_in_use: public port {}", requested.public_port))
            } else {
                AegisError::Backend(format!("bind public port {}: {e}", requested.public_port))
            }
        })?;
        let public_port = listener
            .local_addr()
            .map_err(|e| AegisError::Backend(format!("resolve bound port: {e}")))?
            .port();

        let mut bindings = self.bindings.lock();
        if let Some(existing) = bindings.get(&key) {
            // Lost the race; the freshly bound listener drops here.
            return Ok(ExposedPort {
                instance_id: instance_id.to_string(),
                guest_port,
                public_port: existing.public_port,
                protocol: existing.protocol,
            });
        }

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.router.clone(),
            instance_id.to_string(),
            guest_port,
        ));
        bindings.insert(
            key,
            BindingEntry {
                public_port,
                protocol: requested.protocol,
                accept_task,
            },
        );

        tracing::info!(
            instance = instance_id,
            guest_port,
            public_port,
            "public port exposed"
        );
        Ok(ExposedPort {
            instance_id: instance_id.to_string(),
            guest_port,
            public_port,
            protocol: requested.protocol,
        })
    }

    /// Close and remove a binding; a missing entry is a no-op.
    pub async fn unexpose(&self, instance_id: &str, guest_port: u16) -> bool {
        let removed = self
            .bindings
            .lock()
            .remove(&(instance_id.to_string(), guest_port));
        match removed {
            Some(entry) => {
                entry.shutdown().await;
                tracing::info!(instance = instance_id, guest_port, "public port closed");
                true
            }
            None => false,
        }
    }

    /// Close every listener an instance owns (stop/destroy path).
    pub async fn unexpose_all(&self, instance_id: &str) -> usize {
        let removed: Vec<BindingEntry> = {
            let mut bindings = self.bindings.lock();
            let keys: Vec<_> = bindings
                .keys()
                .filter(|(id, _)| id == instance_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| bindings.remove(&key))
                .collect()
        };
        let n = removed.len();
        for entry in removed {
            entry.shutdown().await;
        }
        n
    }

    pub fn get(&self, instance_id: &str, guest_port: u16) -> Option<ExposedPort> {
        self.bindings
            .lock()
            .get(&(instance_id.to_string(), guest_port))
            .map(|entry| ExposedPort {
                instance_id: instance_id.to_string(),
                guest_port,
                public_port: entry.public_port,
                protocol: entry.protocol,
            })
    }

    pub fn list(&self, instance_id: &str) -> Vec<ExposedPort> {
        self.bindings
            .lock()
            .iter()
            .filter(|((id, _), _)| id == instance_id)
            .map(|((_, guest_port), entry)| ExposedPort {
                instance_id: instance_id.to_string(),
                guest_port: *guest_port,
                public_port: entry.public_port,
                protocol: entry.protocol,
            })
            .collect()
    }
}

async fn accept_loop(listener: TcpListener, router: Router, instance_id: String, guest_port: u16) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(instance = %instance_id, guest_port, %peer, "public connection accepted");
                let router = router.clone();
                let instance_id = instance_id.clone();
                tokio::spawn(async move {
                    router.dispatch(&instance_id, guest_port, stream).await;
                });
            }
            Err(e) => {
                tracing::debug!(instance = %instance_id, guest_port, error = %e, "accept failed");
                // Transient accept errors (EMFILE etc.); keep serving.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ExposeTable {
        ExposeTable::new(Router::new())
    }

    #[tokio::test]
    async fn expose_allocates_ephemeral_port() {
        let table = table();
        let binding = table
            .expose("i-1", 80, PortBinding { public_port: 0, protocol: PortProtocol::Http })
            .await
            .unwrap();
        assert_ne!(binding.public_port, 0);
        assert_eq!(table.get("i-1", 80).unwrap(), binding);
    }

    #[tokio::test]
    async fn expose_is_idempotent_for_same_pair() {
        let table = table();
        let first = table
            .expose("i-1", 80, PortBinding { public_port: 0, protocol: PortProtocol::Tcp })
            .await
            .unwrap();
        let second = table
            .expose("i-1", 80, PortBinding { public_port: 0, protocol: PortProtocol::Tcp })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(table.list("i-1").len(), 1);
    }

    #[tokio::test]
    async fn foreign_public_port_is_port_in_use() {
        let table = table();
        let first = table
            .expose("i-1", 80, PortBinding { public_port: 0, protocol: PortProtocol::Tcp })
            .await
            .unwrap();

        let err = table
            .expose(
                "i-1",
                81,
                PortBinding { public_port: first.public_port, protocol: PortProtocol::Tcp },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("port_in_use"), "{err}");

        // The first binding still serves: its listener is still installed.
        assert!(table.get("i-1", 80).is_some());
        assert!(table.get("i-1", 81).is_none());
    }

    #[tokio::test]
    async fn unexpose_tolerates_absent_mapping() {
        let table = table();
        assert!(!table.unexpose("i-1", 9999).await);
        let binding = table
            .expose("i-1", 80, PortBinding { public_port: 0, protocol: PortProtocol::Tcp })
            .await
            .unwrap();
        assert!(table.unexpose("i-1", 80).await);
        assert!(table.get("i-1", 80).is_none());

        // Port is free for rebinding afterwards.
        let again = table
            .expose(
                "i-1",
                80,
                PortBinding { public_port: binding.public_port, protocol: PortProtocol::Tcp },
            )
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn unexpose_all_closes_instance_listeners_only() {
        let table = table();
        table
            .expose("a", 80, PortBinding { public_port: 0, protocol: PortProtocol::Tcp })
            .await
            .unwrap();
        table
            .expose("a", 81, PortBinding { public_port: 0, protocol: PortProtocol::Tcp })
            .await
            .unwrap();
        table
            .expose("b", 80, PortBinding { public_port: 0, protocol: PortProtocol::Tcp })
            .await
            .unwrap();

        assert_eq!(table.unexpose_all("a").await, 2);
        assert!(table.list("a").is_empty());
        assert_eq!(table.list("b").len(), 1);
    }

    #[tokio::test]
    async fn concurrent_expose_converges_on_one_listener() {
        let table = Arc::new(table());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                table
                    .expose("i-1", 80, PortBinding { public_port: 0, protocol: PortProtocol::Tcp })
                    .await
            }));
        }
        let mut ports = std::collections::HashSet::new();
        for handle in handles {
            ports.insert(handle.await.unwrap().unwrap().public_port);
        }
        assert_eq!(ports.len(), 1, "all callers share one binding");
    }
}
