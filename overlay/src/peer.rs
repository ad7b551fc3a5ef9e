// Copyright (c) 2024 Botho Foundation

//! Peer identity types.
//!
//! A peer is identified on the overlay by an opaque [`PeerId`], but two
//! addresses are considered the same peer when they share an endpoint
//! (`host`, `port`). The id only travels along for logging and for the
//! application payload handler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier chosen by each node instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The (host, port) pair a peer listens on.
pub type Endpoint = (String, u16);

/// Address of a peer on the overlay: `(id, host, port)`.
///
/// Registry bookkeeping keys peers by endpoint only, see
/// [`PeerAddress::same_endpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Node id of the peer
    pub id: PeerId,

    /// Host (IP address or resolvable name) the peer listens on
    pub host: String,

    /// Port the peer listens on
    pub port: u16,
}

impl PeerAddress {
    /// Create a new peer address.
    pub fn new(id: impl Into<PeerId>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// Address of a node known only by its endpoint, as learned from a
    /// `NODE_CON_ADDR(ip,port)` announcement. The id is `host:port`.
    pub fn from_endpoint(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: PeerId::new(format!("{host}:{port}")),
            host,
            port,
        }
    }

    /// Whether this address listens on the given host and port.
    pub fn is_at(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }

    /// Whether both addresses point at the same endpoint, regardless of id.
    pub fn same_endpoint(&self, other: &PeerAddress) -> bool {
        self.is_at(&other.host, other.port)
    }

    /// The endpoint key used by the registry.
    pub fn endpoint(&self) -> Endpoint {
        (self.host.clone(), self.port)
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn socket_target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}
