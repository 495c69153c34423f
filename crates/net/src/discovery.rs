//! UDP multicast discovery
//!
//! The server periodically multicasts an [`Advertisement`] naming its
//! TCP endpoint; a client joins the same group and forwards every
//! datagram that parses as [`Command::Discovered`]. Neither side
//! treats a dead network as fatal: no datagrams simply means no
//! announcements.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::error::Result;
use crate::protocol::Advertisement;
use crate::router::Command;

/// Maximum datagram size we send or accept
const MAX_DATAGRAM_SIZE: usize = 1400;

/// Detached shutdown signal for a discovery endpoint
#[derive(Clone)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    /// Signal shutdown; idempotent and non-blocking
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

/// Periodically multicasts the server's advertisement
pub struct Announcer {
    group: SocketAddrV4,
    interval_ms: u64,
    advertisement: Advertisement,
    shutdown_tx: watch::Sender<bool>,
}

impl Announcer {
    /// Prepare an announcer for the given advertisement. Nothing is
    /// sent until [`start`](Self::start) is called.
    pub fn new(config: &LinkConfig, advertisement: Advertisement) -> Self {
        let group = SocketAddrV4::new(config.multicast_group, config.multicast_port);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            group,
            interval_ms: config.announce_interval_ms,
            advertisement,
            shutdown_tx,
        }
    }

    /// Override the advertised TCP port. The listener may have bound
    /// an ephemeral port that is only known after startup.
    pub fn set_tcp_port(&mut self, port: u16) {
        self.advertisement.tcp_port = port;
    }

    /// Spawn the send loop on its own task
    pub async fn start(&self) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_loop_v4(true)?;

        let socket = Arc::new(socket);
        let group = self.group;
        let advertisement = self.advertisement.clone();
        let interval_ms = self.interval_ms;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(group = %group, master_id = %advertisement.master_id, "Announcer started");

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let bytes = match advertisement.to_bytes() {
                            Ok(b) => b,
                            Err(e) => {
                                warn!(error = %e, "Failed to encode advertisement");
                                continue;
                            }
                        };
                        match socket.send_to(&bytes, group).await {
                            Ok(n) => trace!(bytes = n, "Advertisement sent"),
                            Err(e) => warn!(error = %e, "Failed to send advertisement"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Announcer shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Signal shutdown; idempotent and non-blocking
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown signal usable after the announcer has been moved into
    /// its handler
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.shutdown_tx.clone())
    }
}

/// Listens on the multicast group and forwards valid advertisements
pub struct DiscoveryListener {
    group: Ipv4Addr,
    port: u16,
    shutdown_tx: watch::Sender<bool>,
}

impl DiscoveryListener {
    pub fn new(config: &LinkConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            group: config.multicast_group,
            port: config.multicast_port,
            shutdown_tx,
        }
    }

    /// Join the group and spawn the receive loop. Runs until stopped;
    /// there is no receive timeout.
    pub async fn start(&self, command_tx: mpsc::Sender<Command>) -> Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        socket.join_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED)?;

        let group = self.group;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(group = %group, port = self.port, "Discovery listener started");

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, src_addr)) => {
                                // Malformed datagrams are dropped silently
                                let Some(ad) = Advertisement::from_bytes(&buf[..len]) else {
                                    trace!(addr = %src_addr, len = len, "Ignoring unrecognized datagram");
                                    continue;
                                };
                                debug!(
                                    ip = %ad.ip,
                                    tcp_port = ad.tcp_port,
                                    master_id = %ad.master_id,
                                    "Server advertisement received"
                                );
                                let cmd = Command::Discovered {
                                    ip: ad.ip,
                                    port: ad.tcp_port,
                                    master_id: ad.master_id,
                                };
                                if command_tx.send(cmd).await.is_err() {
                                    debug!("Command channel closed, listener exiting");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Error receiving discovery datagram");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Discovery listener shutting down");
                            let _ = socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED);
                            break;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Signal shutdown; idempotent and non-blocking
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.shutdown_tx.clone())
    }
}

/// Best-effort guess at this host's LAN-reachable IPv4 address.
///
/// Opens a UDP socket "towards" a public address to learn which local
/// interface would carry the traffic; no packet is actually sent.
pub fn local_ipv4() -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") else {
        return fallback;
    };
    if socket.connect("8.8.8.8:80").is_err() {
        return fallback;
    }
    socket
        .local_addr()
        .map(|addr: SocketAddr| addr.ip())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_announcer_stop_idempotent() {
        let config = LinkConfig::default();
        let ad = Advertisement {
            ip: local_ipv4(),
            tcp_port: 6761,
            master_id: "master-1".to_string(),
        };
        let announcer = Announcer::new(&config, ad);
        announcer.start().await.unwrap();

        announcer.stop();
        announcer.stop();
    }

    #[tokio::test]
    async fn test_listener_forwards_valid_datagram() {
        // Point-to-point loopback instead of a real multicast group so
        // the test does not depend on network interface policy.
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let listen_addr = socket.local_addr().unwrap();

        let (command_tx, mut command_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = watch::channel(false);
        let mut shutdown_rx = shutdown_tx.subscribe();

        // Same receive loop body the listener runs after joining
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        let Ok((len, _)) = result else { break };
                        if let Some(ad) = Advertisement::from_bytes(&buf[..len]) {
                            let _ = command_tx.send(Command::Discovered {
                                ip: ad.ip,
                                port: ad.tcp_port,
                                master_id: ad.master_id,
                            }).await;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        // Garbage first: must be dropped without producing a command
        sender.send_to(b"not an advertisement", listen_addr).await.unwrap();

        let ad = Advertisement {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            tcp_port: 7000,
            master_id: "master-1".to_string(),
        };
        sender
            .send_to(&ad.to_bytes().unwrap(), listen_addr)
            .await
            .unwrap();

        match command_rx.recv().await.unwrap() {
            Command::Discovered { ip, port, master_id } => {
                assert_eq!(ip, ad.ip);
                assert_eq!(port, 7000);
                assert_eq!(master_id, "master-1");
            }
            other => panic!("Expected Discovered, got {:?}", other),
        }

        let _ = shutdown_tx.send(true);
    }
}
