//! Facade over the discovery-and-session subsystem
//!
//! A [`LinkManager`] is explicitly constructed and owned by the host
//! layer; there is no process-wide instance. It selects the mode once
//! at start, wires the discovery and session layers to the dispatch
//! loop, and exposes the send surface.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::info;
use uuid::Uuid;

use crate::client::SessionClient;
use crate::config::LinkConfig;
use crate::discovery::{local_ipv4, Announcer, DiscoveryListener, StopHandle};
use crate::error::{Error, Result};
use crate::protocol::{Advertisement, Frame};
use crate::registry::PeerDevice;
use crate::router::{
    dispatch_loop, ClientCallback, ClientHandler, ServerHandler, ServiceCallback,
};
use crate::server::SessionServer;

/// Which side of the protocol this endpoint runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Accept peers, advertise over multicast
    Server,
    /// Discover a server and connect to it
    Client,
}

/// Running subsystem state, one variant per mode
enum Active {
    Server {
        server: SessionServer,
        discovery_stop: StopHandle,
        shutdown_tx: broadcast::Sender<()>,
    },
    Client {
        client: SessionClient,
        discovery_stop: StopHandle,
        shutdown_tx: broadcast::Sender<()>,
    },
}

/// Coordinator owning mode selection, lifecycle, and the send surface
pub struct LinkManager {
    config: LinkConfig,
    client_callback: Option<Arc<dyn ClientCallback>>,
    service_callback: Option<Arc<dyn ServiceCallback>>,
    active: Option<Active>,
}

impl LinkManager {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            client_callback: None,
            service_callback: None,
            active: None,
        }
    }

    /// Register the client-mode notification sink. Takes effect at the
    /// next `start`.
    pub fn set_client_callback(&mut self, callback: Arc<dyn ClientCallback>) {
        self.client_callback = Some(callback);
    }

    /// Register the server-mode notification sink. Takes effect at the
    /// next `start`.
    pub fn set_service_callback(&mut self, callback: Arc<dyn ServiceCallback>) {
        self.service_callback = Some(callback);
    }

    /// Start the subsystem in the given mode.
    ///
    /// Server mode: bind the TCP listener first, then let the
    /// `ServiceReady` command start the announcer, so discovery never
    /// advertises before the transport accepts. Client mode: join the
    /// multicast group and wait for an announcement to connect.
    pub async fn start(&mut self, mode: Mode) -> Result<()> {
        if self.active.is_some() {
            return Err(Error::AlreadyStarted);
        }
        info!(mode = ?mode, "Starting lanlink");

        let (command_tx, command_rx) = mpsc::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);

        let active = match mode {
            Mode::Server => {
                let master_id = self
                    .config
                    .master_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());

                let server = SessionServer::start(self.config.tcp_port, command_tx).await?;

                let advertisement = Advertisement {
                    ip: local_ipv4(),
                    tcp_port: server.local_port(),
                    master_id,
                };
                let announcer = Announcer::new(&self.config, advertisement);
                let discovery_stop = announcer.stop_handle();

                let handler = ServerHandler::new(announcer, self.service_callback.clone());
                tokio::spawn(dispatch_loop(handler, command_rx, shutdown_tx.subscribe()));

                Active::Server {
                    server,
                    discovery_stop,
                    shutdown_tx,
                }
            }
            Mode::Client => {
                let client_id = self
                    .config
                    .client_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());

                let client = SessionClient::new(client_id, command_tx.clone());

                let listener = DiscoveryListener::new(&self.config);
                listener.start(command_tx).await?;
                let discovery_stop = listener.stop_handle();

                let handler = ClientHandler::new(client.clone(), self.client_callback.clone());
                tokio::spawn(dispatch_loop(handler, command_rx, shutdown_tx.subscribe()));

                Active::Client {
                    client,
                    discovery_stop,
                    shutdown_tx,
                }
            }
        };

        self.active = Some(active);
        Ok(())
    }

    /// Stop everything. Idempotent: stopping an already-stopped
    /// manager is a no-op. Blocked accepts/reads/receives are
    /// signalled to unblock; the dispatch loop drains and exits once
    /// the producers are gone.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        match active {
            Active::Server {
                server,
                discovery_stop,
                shutdown_tx,
            } => {
                discovery_stop.stop();
                server.stop();
                let _ = shutdown_tx.send(());
            }
            Active::Client {
                client,
                discovery_stop,
                shutdown_tx,
            } => {
                discovery_stop.stop();
                client.stop();
                let _ = shutdown_tx.send(());
            }
        }
        info!("lanlink stopped");
    }

    /// Send text to the server (client mode). Returns whether the
    /// connection existed and accepted the write.
    pub async fn send_to_server(&self, text: &str) -> bool {
        self.client_send(Frame::text(text)).await
    }

    /// Send a binary payload to the server (client mode)
    pub async fn send_bytes_to_server(&self, bytes: Vec<u8>) -> bool {
        self.client_send(Frame::binary(bytes)).await
    }

    /// Send text to one connected peer (server mode)
    pub async fn send_to_peer(&self, text: &str, peer_id: &str) -> bool {
        self.server_send(Frame::text(text), peer_id).await
    }

    /// Send a binary payload to one connected peer (server mode)
    pub async fn send_bytes_to_peer(&self, bytes: Vec<u8>, peer_id: &str) -> bool {
        self.server_send(Frame::binary(bytes), peer_id).await
    }

    /// Send text to every connected peer (server mode)
    pub async fn broadcast(&self, text: &str) -> bool {
        match &self.active {
            Some(Active::Server { server, .. }) => {
                server.broadcast(Frame::text(text)).await;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of connected peers; empty unless running as server
    pub async fn devices(&self) -> Vec<PeerDevice> {
        match &self.active {
            Some(Active::Server { server, .. }) => server.registry().snapshot().await,
            _ => Vec::new(),
        }
    }

    /// Bound TCP port while running as server
    pub fn server_port(&self) -> Option<u16> {
        match &self.active {
            Some(Active::Server { server, .. }) => Some(server.local_port()),
            _ => None,
        }
    }

    async fn client_send(&self, frame: Frame) -> bool {
        match &self.active {
            Some(Active::Client { client, .. }) => client.send(frame).await.is_ok(),
            _ => false,
        }
    }

    async fn server_send(&self, frame: Frame, peer_id: &str) -> bool {
        match &self.active {
            Some(Active::Server { server, .. }) => {
                server.send_to_peer(peer_id, frame).await.is_ok()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionStatus;
    use std::sync::Mutex;

    fn test_config() -> LinkConfig {
        LinkConfig {
            tcp_port: 0,
            master_id: Some("test-master".to_string()),
            ..LinkConfig::default()
        }
    }

    #[derive(Default)]
    struct RecordingService {
        texts: Mutex<Vec<(String, String)>>,
        device_counts: Mutex<Vec<usize>>,
    }

    impl ServiceCallback for RecordingService {
        fn on_devices_change(&self, devices: &[PeerDevice]) {
            self.device_counts.lock().unwrap().push(devices.len());
        }
        fn on_text(&self, text: &str, peer_id: &str) {
            self.texts
                .lock()
                .unwrap()
                .push((peer_id.to_string(), text.to_string()));
        }
        fn on_binary(&self, _bytes: &[u8], _peer_id: &str) {}
    }

    #[tokio::test]
    async fn test_stop_idempotent() {
        let mut manager = LinkManager::new(test_config());

        // Stop before start is a no-op
        manager.stop();

        manager.start(Mode::Server).await.unwrap();
        manager.stop();
        manager.stop();
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mut manager = LinkManager::new(test_config());
        manager.start(Mode::Server).await.unwrap();
        assert!(matches!(
            manager.start(Mode::Server).await,
            Err(Error::AlreadyStarted)
        ));
        manager.stop();
    }

    #[tokio::test]
    async fn test_send_surface_returns_false_when_stopped() {
        let manager = LinkManager::new(test_config());
        assert!(!manager.send_to_server("x").await);
        assert!(!manager.send_to_peer("x", "phone-1").await);
        assert!(!manager.send_bytes_to_server(vec![1]).await);
        assert!(!manager.send_bytes_to_peer(vec![1], "phone-1").await);
    }

    #[tokio::test]
    async fn test_server_mode_delivers_peer_traffic_to_callback() {
        let callback = Arc::new(RecordingService::default());

        let mut manager = LinkManager::new(test_config());
        manager.set_service_callback(callback.clone());
        manager.start(Mode::Server).await.unwrap();
        let port = manager.server_port().unwrap();

        // Drive a session client straight at the listener; discovery
        // is exercised separately
        let (client_tx, mut client_rx) = mpsc::channel(64);
        let client = SessionClient::new("phone-1".to_string(), client_tx);
        client
            .connect(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port)
            .await;
        loop {
            if let Some(crate::router::Command::StatusChanged { status }) = client_rx.recv().await
            {
                if status == ConnectionStatus::Connected {
                    break;
                }
            }
        }

        client.send(Frame::text("hello master")).await.unwrap();

        // The dispatch loop runs on its own task; poll the callback
        for _ in 0..100 {
            if !callback.texts.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            callback.texts.lock().unwrap().as_slice(),
            &[("phone-1".to_string(), "hello master".to_string())]
        );
        assert!(callback
            .device_counts
            .lock()
            .unwrap()
            .contains(&1));

        // Reply through the manager surface
        assert!(manager.send_to_peer("hello phone", "phone-1").await);
        loop {
            if let Some(crate::router::Command::ServerText { text }) = client_rx.recv().await {
                assert_eq!(text, "hello phone");
                break;
            }
        }

        assert_eq!(manager.devices().await.len(), 1);
        manager.stop();
    }
}
