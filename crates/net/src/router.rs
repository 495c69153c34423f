//! Command routing
//!
//! Every event the discovery and session layers produce funnels into
//! one [`Command`] channel drained by a single dispatch loop, so
//! commands are processed in arrival order. The loop feeds exactly one
//! mode handler, selected at start; commands addressed to the other
//! mode are ignored.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

use crate::client::SessionClient;
use crate::discovery::Announcer;
use crate::registry::{ConnectionStatus, PeerDevice};

/// Closed set of events produced by the discovery and session layers.
///
/// Message-carrying commands hold exactly one payload kind: text or
/// bytes, never both.
#[derive(Debug, Clone)]
pub enum Command {
    // Observed in server mode
    /// TCP listener bound and accepting
    ServiceReady { port: u16 },
    /// Registry membership changed; carries a full snapshot
    PeersChanged { devices: Vec<PeerDevice> },
    /// Text message from a connected peer
    PeerText { peer_id: String, text: String },
    /// Binary payload from a connected peer
    PeerBinary { peer_id: String, bytes: Vec<u8> },

    // Observed in client mode
    /// A server advertisement was parsed off the multicast group
    Discovered {
        ip: IpAddr,
        port: u16,
        master_id: String,
    },
    /// Text message from the server
    ServerText { text: String },
    /// Binary payload from the server
    ServerBinary { bytes: Vec<u8> },
    /// Client connection lifecycle transition
    StatusChanged { status: ConnectionStatus },
}

/// Notifications delivered to the host layer in client mode
pub trait ClientCallback: Send + Sync {
    fn on_text(&self, text: &str);
    fn on_binary(&self, bytes: &[u8]);
    fn on_status_change(&self, status: ConnectionStatus);
}

/// Notifications delivered to the host layer in server mode
pub trait ServiceCallback: Send + Sync {
    fn on_devices_change(&self, devices: &[PeerDevice]);
    fn on_text(&self, text: &str, peer_id: &str);
    fn on_binary(&self, bytes: &[u8], peer_id: &str);
}

/// One mode's view of the command stream
pub trait CommandSink: Send {
    fn handle(&mut self, cmd: Command) -> impl std::future::Future<Output = ()> + Send;
}

/// Drain the command channel into the active mode handler.
///
/// Single consumer: commands are handled one at a time in the order
/// they were enqueued. Exits on shutdown or when every producer has
/// dropped its sender.
pub async fn dispatch_loop<S: CommandSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<Command>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => sink.handle(cmd).await,
                    None => break,
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("Dispatch loop exited");
}

/// Handles server-mode commands: starts discovery once the transport
/// is ready and forwards peer activity to the service callback.
pub struct ServerHandler {
    announcer: Announcer,
    callback: Option<Arc<dyn ServiceCallback>>,
}

impl ServerHandler {
    pub fn new(announcer: Announcer, callback: Option<Arc<dyn ServiceCallback>>) -> Self {
        Self {
            announcer,
            callback,
        }
    }
}

impl CommandSink for ServerHandler {
    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::ServiceReady { port } => {
                // Discovery must not advertise before the listener is up
                self.announcer.set_tcp_port(port);
                if let Err(e) = self.announcer.start().await {
                    error!(error = %e, "Failed to start announcer");
                }
            }
            Command::PeersChanged { devices } => {
                if let Some(cb) = &self.callback {
                    cb.on_devices_change(&devices);
                }
            }
            Command::PeerText { peer_id, text } => {
                if let Some(cb) = &self.callback {
                    cb.on_text(&text, &peer_id);
                }
            }
            Command::PeerBinary { peer_id, bytes } => {
                if let Some(cb) = &self.callback {
                    cb.on_binary(&bytes, &peer_id);
                }
            }
            other => {
                debug!(command = ?other, "Ignoring client-mode command in server mode");
            }
        }
    }
}

/// Handles client-mode commands: drives connection attempts off
/// discovery announcements and forwards server activity to the client
/// callback.
pub struct ClientHandler {
    client: SessionClient,
    callback: Option<Arc<dyn ClientCallback>>,
}

impl ClientHandler {
    pub fn new(client: SessionClient, callback: Option<Arc<dyn ClientCallback>>) -> Self {
        Self { client, callback }
    }
}

impl CommandSink for ClientHandler {
    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Discovered {
                ip,
                port,
                master_id,
            } => {
                debug!(ip = %ip, port = port, master_id = %master_id, "Discovery announcement");
                // connect() is a no-op while connecting or connected,
                // so repeated announcements do not stack attempts
                self.client.connect(ip, port).await;
            }
            Command::ServerText { text } => {
                if let Some(cb) = &self.callback {
                    cb.on_text(&text);
                }
            }
            Command::ServerBinary { bytes } => {
                if let Some(cb) = &self.callback {
                    cb.on_binary(&bytes);
                }
            }
            Command::StatusChanged { status } => {
                if let Some(cb) = &self.callback {
                    cb.on_status_change(status);
                }
            }
            other => {
                debug!(command = ?other, "Ignoring server-mode command in client mode");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingService {
        texts: Mutex<Vec<(String, String)>>,
        snapshots: Mutex<Vec<usize>>,
    }

    impl ServiceCallback for RecordingService {
        fn on_devices_change(&self, devices: &[PeerDevice]) {
            self.snapshots.lock().unwrap().push(devices.len());
        }
        fn on_text(&self, text: &str, peer_id: &str) {
            self.texts
                .lock()
                .unwrap()
                .push((peer_id.to_string(), text.to_string()));
        }
        fn on_binary(&self, _bytes: &[u8], _peer_id: &str) {}
    }

    #[derive(Default)]
    struct RecordingClient {
        texts: Mutex<Vec<String>>,
        statuses: Mutex<Vec<ConnectionStatus>>,
    }

    impl ClientCallback for RecordingClient {
        fn on_text(&self, text: &str) {
            self.texts.lock().unwrap().push(text.to_string());
        }
        fn on_binary(&self, _bytes: &[u8]) {}
        fn on_status_change(&self, status: ConnectionStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    #[tokio::test]
    async fn test_server_handler_dispatch_and_cross_mode_ignore() {
        let config = crate::config::LinkConfig::default();
        let ad = crate::protocol::Advertisement {
            ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            tcp_port: 0,
            master_id: "m".to_string(),
        };
        let callback = Arc::new(RecordingService::default());
        let mut handler = ServerHandler::new(
            Announcer::new(&config, ad),
            Some(callback.clone() as Arc<dyn ServiceCallback>),
        );

        handler
            .handle(Command::PeerText {
                peer_id: "phone-1".to_string(),
                text: "hi".to_string(),
            })
            .await;
        handler
            .handle(Command::PeersChanged { devices: vec![] })
            .await;
        // Client-mode command must be ignored, not an error
        handler
            .handle(Command::ServerText {
                text: "nope".to_string(),
            })
            .await;

        assert_eq!(
            callback.texts.lock().unwrap().as_slice(),
            &[("phone-1".to_string(), "hi".to_string())]
        );
        assert_eq!(callback.snapshots.lock().unwrap().as_slice(), &[0]);
    }

    #[tokio::test]
    async fn test_client_handler_dispatch_and_cross_mode_ignore() {
        let (command_tx, _command_rx) = mpsc::channel(8);
        let client = SessionClient::new("phone-1".to_string(), command_tx);
        let callback = Arc::new(RecordingClient::default());
        let mut handler =
            ClientHandler::new(client, Some(callback.clone() as Arc<dyn ClientCallback>));

        handler
            .handle(Command::ServerText {
                text: "hello".to_string(),
            })
            .await;
        handler
            .handle(Command::StatusChanged {
                status: ConnectionStatus::Connected,
            })
            .await;
        // Server-mode command must be ignored
        handler
            .handle(Command::PeerText {
                peer_id: "x".to_string(),
                text: "nope".to_string(),
            })
            .await;

        assert_eq!(
            callback.texts.lock().unwrap().as_slice(),
            &["hello".to_string()]
        );
        assert_eq!(
            callback.statuses.lock().unwrap().as_slice(),
            &[ConnectionStatus::Connected]
        );
    }

    #[tokio::test]
    async fn test_dispatch_loop_preserves_order() {
        let (command_tx, command_rx) = mpsc::channel(16);
        let callback = Arc::new(RecordingClient::default());
        let (dummy_tx, _dummy_rx) = mpsc::channel(8);
        let client = SessionClient::new("c".to_string(), dummy_tx);
        let handler =
            ClientHandler::new(client, Some(callback.clone() as Arc<dyn ClientCallback>));

        for i in 0..10 {
            command_tx
                .send(Command::ServerText {
                    text: i.to_string(),
                })
                .await
                .unwrap();
        }
        drop(command_tx);

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        dispatch_loop(handler, command_rx, shutdown_rx).await;

        let texts = callback.texts.lock().unwrap();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(texts.as_slice(), expected.as_slice());
    }
}
