//! Wire types: TCP frames and the UDP discovery advertisement
//!
//! TCP frames are a tag byte plus a length-prefixed opaque payload so
//! binary payloads (images) never pass through a text codec. The
//! discovery datagram is magic-prefixed JSON.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Magic bytes identifying a lanlink discovery datagram
pub const MAGIC_BYTES: &[u8; 4] = b"LLNK";

/// Discovery protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame payload kind, encoded as a single tag byte on the wire.
///
/// Exactly one payload interpretation applies per frame: a frame is
/// text or binary, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// First frame on a new connection; payload is the sender's id
    Handshake = 0x01,
    /// UTF-8 text message
    Text = 0x02,
    /// Opaque binary payload
    Binary = 0x03,
}

impl FrameKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(FrameKind::Handshake),
            0x02 => Some(FrameKind::Text),
            0x03 => Some(FrameKind::Binary),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// One unit of data on a TCP connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a handshake frame carrying the sender's id
    pub fn handshake(id: &str) -> Self {
        Frame {
            kind: FrameKind::Handshake,
            payload: id.as_bytes().to_vec(),
        }
    }

    /// Build a text frame
    pub fn text(msg: &str) -> Self {
        Frame {
            kind: FrameKind::Text,
            payload: msg.as_bytes().to_vec(),
        }
    }

    /// Build a binary frame
    pub fn binary(bytes: Vec<u8>) -> Self {
        Frame {
            kind: FrameKind::Binary,
            payload: bytes,
        }
    }

    /// Interpret the payload as UTF-8 text
    pub fn as_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|_| Error::Protocol("Frame payload is not valid UTF-8".into()))
    }
}

/// Discovery advertisement broadcast by the server over multicast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Address the server's TCP listener is reachable at
    pub ip: IpAddr,
    /// Port the TCP listener is bound to
    pub tcp_port: u16,
    /// Identifier of the advertising master
    pub master_id: String,
}

impl Advertisement {
    /// Serialize with magic header and version byte
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;
        let mut bytes = Vec::with_capacity(MAGIC_BYTES.len() + 1 + json.len());
        bytes.extend_from_slice(MAGIC_BYTES);
        bytes.push(PROTOCOL_VERSION);
        bytes.extend(json);
        Ok(bytes)
    }

    /// Deserialize, validating magic header and version.
    ///
    /// Returns `None` for anything that is not a valid advertisement;
    /// the listener drops such datagrams without raising an error.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let header_len = MAGIC_BYTES.len() + 1;
        if bytes.len() < header_len {
            return None;
        }
        if &bytes[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return None;
        }
        if bytes[MAGIC_BYTES.len()] != PROTOCOL_VERSION {
            return None;
        }
        serde_json::from_slice(&bytes[header_len..]).ok()
    }
}
