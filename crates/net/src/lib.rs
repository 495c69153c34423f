//! lanlink: LAN discovery and messaging between a master and peers
//!
//! One endpoint runs as the server: it accepts TCP connections,
//! tracks which peers are connected, and advertises its endpoint over
//! UDP multicast. Any number of clients discover the advertisement,
//! connect, and exchange text and binary messages with the server
//! over length-prefixed frames. No IP or port is ever configured by
//! hand on the client side.
//!
//! # Architecture
//!
//! - **Discovery** ([`discovery`]): multicast announcer (server) and
//!   listener (client)
//! - **Session** ([`server`], [`client`]): framed TCP with a handshake
//!   identifying each peer
//! - **Registry** ([`registry`]): who is connected, server side
//! - **Router** ([`router`]): one ordered command stream into the
//!   active mode's handler
//! - **Manager** ([`manager`]): the facade the host layer drives
//!
//! # Usage
//!
//! ```ignore
//! let mut manager = LinkManager::new(LinkConfig::default());
//! manager.set_service_callback(callback);
//! manager.start(Mode::Server).await?;
//!
//! // ... peers discover us, connect, and messages arrive on the
//! // callback; reply per peer:
//! manager.send_to_peer("hello", "phone-1").await;
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
mod frame;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use client::SessionClient;
pub use config::LinkConfig;
pub use error::{Error, Result};
pub use manager::{LinkManager, Mode};
pub use protocol::{Advertisement, Frame, FrameKind};
pub use registry::{ConnectionStatus, DeviceRegistry, PeerDevice};
pub use router::{ClientCallback, Command, ServiceCallback};
pub use server::SessionServer;
