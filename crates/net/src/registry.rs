//! Device registry: who is currently connected on the server side
//!
//! Mutated only by the session server (insert on handshake, remove on
//! disconnect). Everyone else sees copy-on-read snapshots.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Per-connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Unknown,
    Connecting,
    Connected,
    Disconnected,
}

/// Snapshot of one connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDevice {
    /// Peer's self-assigned id from the handshake
    pub id: String,
    /// Remote address of the connection
    pub addr: SocketAddr,
    pub status: ConnectionStatus,
}

struct PeerEntry {
    device: PeerDevice,
    /// Outbound queue for this connection's writer task
    tx: mpsc::Sender<Frame>,
}

/// Registry of handshaken peers, keyed by peer id
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Fails without modifying the registry when the
    /// id is already taken; the existing registration stays untouched.
    pub async fn insert(
        &self,
        id: &str,
        addr: SocketAddr,
        tx: mpsc::Sender<Frame>,
    ) -> Result<()> {
        let mut map = self.inner.write().await;
        if map.contains_key(id) {
            return Err(Error::DuplicateId(id.to_string()));
        }
        map.insert(
            id.to_string(),
            PeerEntry {
                device: PeerDevice {
                    id: id.to_string(),
                    addr,
                    status: ConnectionStatus::Connected,
                },
                tx,
            },
        );
        Ok(())
    }

    /// Remove a peer; returns whether it was present
    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    /// Copy-on-read snapshot of all connected devices
    pub async fn snapshot(&self) -> Vec<PeerDevice> {
        self.inner
            .read()
            .await
            .values()
            .map(|e| e.device.clone())
            .collect()
    }

    /// Outbound queue for a peer's connection, if registered
    pub async fn sender(&self, id: &str) -> Option<mpsc::Sender<Frame>> {
        self.inner.read().await.get(id).map(|e| e.tx.clone())
    }

    /// Outbound queues for every registered peer
    pub async fn senders(&self) -> Vec<(String, mpsc::Sender<Frame>)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.tx.clone()))
            .collect()
    }

    /// Drop every registration. Dropping the entries closes their
    /// outbound queues, which ends the writer tasks.
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
