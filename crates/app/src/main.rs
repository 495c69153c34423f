//! lanlink console host
//!
//! Minimal host layer over the lanlink coordinator: pick a mode on the
//! command line, print whatever arrives, send whatever is typed.
//!
//! Usage:
//!   lanlink-app server            # accept peers, advertise
//!   lanlink-app client            # discover and connect
//!
//! Reads `lanlink.toml` from the working directory when present.
//! Server mode sends typed lines to every connected peer; client mode
//! sends them to the server. `/peers` lists connections, `/quit`
//! exits.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lanlink_net::{
    ClientCallback, ConnectionStatus, LinkConfig, LinkManager, Mode, PeerDevice, ServiceCallback,
};

struct PrintingClient;

impl ClientCallback for PrintingClient {
    fn on_text(&self, text: &str) {
        println!("server: {}", text);
    }
    fn on_binary(&self, bytes: &[u8]) {
        println!("server: <{} bytes>", bytes.len());
    }
    fn on_status_change(&self, status: ConnectionStatus) {
        println!("* status: {:?}", status);
    }
}

struct PrintingService;

impl ServiceCallback for PrintingService {
    fn on_devices_change(&self, devices: &[PeerDevice]) {
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        println!("* peers: [{}]", ids.join(", "));
    }
    fn on_text(&self, text: &str, peer_id: &str) {
        println!("{}: {}", peer_id, text);
    }
    fn on_binary(&self, bytes: &[u8], peer_id: &str) {
        println!("{}: <{} bytes>", peer_id, bytes.len());
    }
}

fn usage() -> ! {
    eprintln!("usage: lanlink-app <server|client>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mode = match std::env::args().nth(1).as_deref() {
        Some("server") => Mode::Server,
        Some("client") => Mode::Client,
        _ => usage(),
    };

    let config_path = Path::new("lanlink.toml");
    let config = if config_path.exists() {
        match LinkConfig::load(config_path) {
            Ok(c) => {
                info!(path = %config_path.display(), "Loaded config");
                c
            }
            Err(e) => {
                error!(path = %config_path.display(), error = %e, "Failed to load config");
                std::process::exit(1);
            }
        }
    } else {
        LinkConfig::default()
    };

    let mut manager = LinkManager::new(config);
    match mode {
        Mode::Server => manager.set_service_callback(Arc::new(PrintingService)),
        Mode::Client => manager.set_client_callback(Arc::new(PrintingClient)),
    }

    info!(mode = ?mode, "Starting");
    if let Err(e) = manager.start(mode).await {
        error!(error = %e, "Failed to start");
        std::process::exit(1);
    }
    if let Some(port) = manager.server_port() {
        println!("* listening on port {}, advertising over multicast", port);
    } else {
        println!("* waiting for a server advertisement");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" => break,
            "/peers" => {
                for device in manager.devices().await {
                    println!("  {} ({:?}, {})", device.id, device.status, device.addr);
                }
            }
            text => {
                let sent = match mode {
                    Mode::Server => manager.broadcast(text).await,
                    Mode::Client => manager.send_to_server(text).await,
                };
                if !sent {
                    println!("* not connected, message dropped");
                }
            }
        }
    }

    info!("Shutting down");
    manager.stop();
}
