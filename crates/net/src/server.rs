//! TCP session, server side
//!
//! Accepts connections indefinitely. Each peer identifies itself with
//! a handshake frame and lives in the device registry until its
//! connection drops; inbound frames are re-emitted as commands tagged
//! with the peer's id.

use std::net::SocketAddr;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Frame, FrameKind};
use crate::registry::DeviceRegistry;
use crate::router::Command;

/// Server-side session handle
pub struct SessionServer {
    local_addr: SocketAddr,
    registry: DeviceRegistry,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionServer {
    /// Bind the listener and start accepting.
    ///
    /// `ServiceReady` is emitted only after a successful bind, so
    /// discovery never advertises an endpoint that cannot accept. A
    /// bind failure surfaces as `Error::Io` with no retry.
    pub async fn start(port: u16, command_tx: mpsc::Sender<Command>) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Session server started");

        let _ = command_tx
            .send(Command::ServiceReady {
                port: local_addr.port(),
            })
            .await;

        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = DeviceRegistry::new();

        tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            command_tx,
            shutdown_tx.clone(),
        ));

        Ok(SessionServer {
            local_addr,
            registry,
            shutdown_tx,
        })
    }

    /// Port the listener is bound to
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The registry of handshaken peers
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Queue a frame on one peer's connection.
    ///
    /// Succeeds iff the peer is registered and its writer is alive;
    /// this says nothing about peer-side delivery.
    pub async fn send_to_peer(&self, peer_id: &str, frame: Frame) -> Result<()> {
        let tx = self
            .registry
            .sender(peer_id)
            .await
            .ok_or(Error::NotConnected)?;
        tx.send(frame).await.map_err(|_| Error::NotConnected)
    }

    /// Queue a frame on every registered peer's connection
    pub async fn broadcast(&self, frame: Frame) {
        for (peer_id, tx) in self.registry.senders().await {
            if tx.send(frame.clone()).await.is_err() {
                debug!(peer_id = %peer_id, "Failed to queue frame for peer");
            }
        }
    }

    /// Stop accepting and tear down all peer connections. Idempotent;
    /// blocked accept/read operations are signalled, not timed out.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Session server shutdown initiated");
    }
}

/// Accept incoming connections until shutdown
async fn accept_loop(
    listener: TcpListener,
    registry: DeviceRegistry,
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            registry.clone(),
                            command_tx.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }

    // Connection tasks remove their own entries on the way out, but a
    // task cancelled before that path runs would leave a stale entry.
    registry.clear().await;
}

/// Handle a single peer connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: DeviceRegistry,
    command_tx: mpsc::Sender<Command>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = tokio::io::split(stream);

    // First frame must be the handshake carrying the peer's id. A
    // duplicate id closes this connection and leaves the existing
    // registration untouched.
    let peer_id = match handle_handshake(&mut reader, addr, &registry).await {
        Ok((id, writer_rx)) => {
            tokio::spawn(writer_task(writer, writer_rx));
            id
        }
        Err(e) => {
            warn!(addr = %addr, error = %e, "Handshake failed");
            return;
        }
    };

    info!(addr = %addr, peer_id = %peer_id, "Peer joined");

    let devices = registry.snapshot().await;
    let _ = command_tx.send(Command::PeersChanged { devices }).await;

    // Read loop: frames arrive in socket order and are forwarded in
    // that order
    loop {
        tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(frame) => match frame.kind {
                        FrameKind::Text => {
                            let Ok(text) = frame.as_text() else {
                                warn!(peer_id = %peer_id, "Dropping peer: non-UTF-8 text frame");
                                break;
                            };
                            let _ = command_tx
                                .send(Command::PeerText {
                                    peer_id: peer_id.clone(),
                                    text: text.to_string(),
                                })
                                .await;
                        }
                        FrameKind::Binary => {
                            let _ = command_tx
                                .send(Command::PeerBinary {
                                    peer_id: peer_id.clone(),
                                    bytes: frame.payload,
                                })
                                .await;
                        }
                        FrameKind::Handshake => {
                            warn!(peer_id = %peer_id, "Dropping peer: handshake frame mid-stream");
                            break;
                        }
                    },
                    Err(Error::ConnectionClosed) => {
                        debug!(peer_id = %peer_id, "Connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(peer_id = %peer_id, "Connection shutting down");
                break;
            }
        }
    }

    // Removing the registry entry drops the writer queue, which ends
    // the writer task
    registry.remove(&peer_id).await;
    let devices = registry.snapshot().await;
    let _ = command_tx.send(Command::PeersChanged { devices }).await;

    info!(peer_id = %peer_id, "Peer disconnected");
}

/// Read and validate the handshake, registering the peer on success
async fn handle_handshake(
    reader: &mut ReadHalf<TcpStream>,
    addr: SocketAddr,
    registry: &DeviceRegistry,
) -> Result<(String, mpsc::Receiver<Frame>)> {
    let frame = read_frame(reader).await?;
    if frame.kind != FrameKind::Handshake {
        return Err(Error::Protocol("Expected handshake frame".into()));
    }
    let peer_id = frame.as_text()?.to_string();

    let (tx, rx) = mpsc::channel(64);
    registry.insert(&peer_id, addr, tx).await?;

    Ok((peer_id, rx))
}

/// Writer task: drains one connection's outbound queue. Exactly one
/// writer per socket, so concurrent sends to the same peer serialize
/// here.
async fn writer_task(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}
