//! TCP session, client side
//!
//! Connects to a discovered server endpoint, identifies itself with a
//! handshake frame, then exchanges frames until the connection drops.
//! The status machine is Unknown -> Connecting -> Connected ->
//! Disconnected; every transition emits exactly one `StatusChanged`
//! command. There is no automatic reconnect: a later discovery
//! announcement drives a fresh attempt.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Frame, FrameKind};
use crate::registry::ConnectionStatus;
use crate::router::Command;

struct Inner {
    status: ConnectionStatus,
    /// Outbound queue of the live connection, if any
    writer_tx: Option<mpsc::Sender<Frame>>,
    /// Stop signal for the live connection's read loop
    stop_tx: Option<watch::Sender<bool>>,
}

/// Client-side session handle
#[derive(Clone)]
pub struct SessionClient {
    client_id: String,
    command_tx: mpsc::Sender<Command>,
    inner: Arc<Mutex<Inner>>,
}

impl SessionClient {
    pub fn new(client_id: String, command_tx: mpsc::Sender<Command>) -> Self {
        Self {
            client_id,
            command_tx,
            inner: Arc::new(Mutex::new(Inner {
                status: ConnectionStatus::Unknown,
                writer_tx: None,
                stop_tx: None,
            })),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().unwrap().status
    }

    /// Attempt a connection to the given endpoint.
    ///
    /// No-op while already connecting or connected, so repeated
    /// discovery announcements for the same (or another) server do not
    /// stack attempts or tear down a live session.
    pub async fn connect(&self, ip: IpAddr, port: u16) {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.status {
                ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                    debug!(status = ?inner.status, "Ignoring announcement, session active");
                    return;
                }
                _ => inner.status = ConnectionStatus::Connecting,
            }
        }
        self.emit_status(ConnectionStatus::Connecting).await;

        let addr = SocketAddr::new(ip, port);
        let client_id = self.client_id.clone();
        let command_tx = self.command_tx.clone();
        let inner = self.inner.clone();
        tokio::spawn(connection_task(addr, client_id, inner, command_tx));
    }

    /// Queue a frame on the live connection
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let tx = {
            let inner = self.inner.lock().unwrap();
            if inner.status != ConnectionStatus::Connected {
                return Err(Error::NotConnected);
            }
            inner.writer_tx.clone().ok_or(Error::NotConnected)?
        };
        tx.send(frame).await.map_err(|_| Error::NotConnected)
    }

    /// Drop the live connection, if any. Idempotent; the blocked read
    /// is signalled to unblock rather than timing out.
    pub fn stop(&self) {
        let aborted_connect = {
            let mut inner = self.inner.lock().unwrap();
            let aborted = inner.status == ConnectionStatus::Connecting;
            if aborted {
                // Connect still in flight; the task re-checks status
                // before promoting the connection
                inner.status = ConnectionStatus::Disconnected;
            }
            inner.writer_tx = None;
            if let Some(stop_tx) = inner.stop_tx.take() {
                let _ = stop_tx.send(true);
            }
            aborted
        };
        if aborted_connect {
            // The aborted task never reaches its disconnect emit, so
            // this transition's event is ours to send
            let _ = self.command_tx.try_send(Command::StatusChanged {
                status: ConnectionStatus::Disconnected,
            });
        }
    }

    async fn emit_status(&self, status: ConnectionStatus) {
        let _ = self
            .command_tx
            .send(Command::StatusChanged { status })
            .await;
    }
}

async fn set_status(
    inner: &Arc<Mutex<Inner>>,
    command_tx: &mpsc::Sender<Command>,
    status: ConnectionStatus,
) {
    inner.lock().unwrap().status = status;
    let _ = command_tx.send(Command::StatusChanged { status }).await;
}

/// Fail a connect attempt. If stop() already moved the state to
/// Disconnected, that transition's event was emitted there and this
/// one emits nothing.
async fn fail_connect(inner: &Arc<Mutex<Inner>>, command_tx: &mpsc::Sender<Command>) {
    {
        let mut guard = inner.lock().unwrap();
        if guard.status != ConnectionStatus::Connecting {
            return;
        }
        guard.status = ConnectionStatus::Disconnected;
    }
    let _ = command_tx
        .send(Command::StatusChanged {
            status: ConnectionStatus::Disconnected,
        })
        .await;
}

/// Owns one connection end to end: connect, handshake, then a single
/// loop multiplexing inbound frames and the outbound queue.
async fn connection_task(
    addr: SocketAddr,
    client_id: String,
    inner: Arc<Mutex<Inner>>,
    command_tx: mpsc::Sender<Command>,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Connect failed");
            fail_connect(&inner, &command_tx).await;
            return;
        }
    };

    let (mut reader, mut writer) = tokio::io::split(stream);

    // Identify ourselves; the server registers us under this id
    if let Err(e) = write_frame(&mut writer, &Frame::handshake(&client_id)).await {
        warn!(error = %e, "Handshake failed");
        fail_connect(&inner, &command_tx).await;
        return;
    }

    let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(64);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    {
        let mut guard = inner.lock().unwrap();
        if guard.status != ConnectionStatus::Connecting {
            debug!("Session stopped before connect completed");
            return;
        }
        guard.writer_tx = Some(writer_tx);
        guard.stop_tx = Some(stop_tx);
        // Promote under the same lock so stop() can never interleave
        // between registration and the status flip
        guard.status = ConnectionStatus::Connected;
    }
    let _ = command_tx
        .send(Command::StatusChanged {
            status: ConnectionStatus::Connected,
        })
        .await;
    info!(addr = %addr, client_id = %client_id, "Connected to server");

    // One writer per socket: sends serialize through this task
    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "Write failed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            // Inbound frame from the server
            result = read_frame(&mut reader) => {
                match result {
                    Ok(frame) => match frame.kind {
                        FrameKind::Text => {
                            let Ok(text) = frame.as_text() else {
                                warn!("Dropping connection: non-UTF-8 text frame");
                                break;
                            };
                            let _ = command_tx
                                .send(Command::ServerText { text: text.to_string() })
                                .await;
                        }
                        FrameKind::Binary => {
                            let _ = command_tx
                                .send(Command::ServerBinary { bytes: frame.payload })
                                .await;
                        }
                        FrameKind::Handshake => {
                            warn!("Dropping connection: handshake frame mid-stream");
                            break;
                        }
                    },
                    Err(Error::ConnectionClosed) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Read error");
                        break;
                    }
                }
            }

            // stop() was called
            _ = stop_rx.changed() => {
                debug!("Session stopped locally");
                break;
            }
        }
    }

    writer_handle.abort();
    {
        let mut guard = inner.lock().unwrap();
        guard.writer_tx = None;
        guard.stop_tx = None;
    }
    set_status(&inner, &command_tx, ConnectionStatus::Disconnected).await;
    info!(addr = %addr, "Disconnected from server");
}
