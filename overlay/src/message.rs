// Copyright (c) 2024 Botho Foundation

//! Overlay protocol messages.
//!
//! Each message travels as one [`Frame`]: the command tag names the message
//! and the payload carries its fields. Structured payloads are JSON and are
//! decoded into typed structs, so a malformed payload is rejected here with a
//! [`MessageError`] instead of surfacing deep inside dispatch.
//!
//! | Command          | Payload                               |
//! |------------------|---------------------------------------|
//! | `NODE_JOIN`      | joiner's [`PeerAddress`]              |
//! | `NODE_QUERY`     | asker's [`PeerAddress`]               |
//! | `NODE_PEER_LIST` | array of [`PeerAddress`]              |
//! | `NODE_CON_ADDR`  | `ip,port` of a node with no peers     |
//! | `NODE_HELLO`     | greeter's [`PeerAddress`]             |
//! | `NODE_DATA`      | [`DataPacket`]                        |
//! | `NODE_LEAVE`     | leaver's [`PeerAddress`]              |

use crate::{codec::Frame, peer::PeerAddress};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Join request sent to the rendezvous node.
pub const CMD_JOIN: &str = "NODE_JOIN";
/// Peer-list request that does not register the asker.
pub const CMD_QUERY: &str = "NODE_QUERY";
/// Gossip response carrying a list of peers.
pub const CMD_PEER_LIST: &str = "NODE_PEER_LIST";
/// Gossip response of a node that knows no peers yet.
pub const CMD_CON_ADDR: &str = "NODE_CON_ADDR";
/// Greeting sent to newly learned peers.
pub const CMD_HELLO: &str = "NODE_HELLO";
/// Application payload.
pub const CMD_DATA: &str = "NODE_DATA";
/// Explicit disconnect.
pub const CMD_LEAVE: &str = "NODE_LEAVE";

/// Errors turning a frame into a [`Message`] or back.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The command tag is not part of the protocol.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The payload does not match the schema of its command.
    #[error("invalid {command} payload: {reason}")]
    InvalidPayload {
        command: &'static str,
        reason: String,
    },

    /// A peer address in the payload is unusable.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    /// The message could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Application payload together with the identity of its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPacket {
    /// Node that sent the payload
    pub sender: PeerAddress,

    /// Opaque application payload
    pub body: String,
}

/// A decoded overlay protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A node asks to join through us and wants a gossip response.
    Join(PeerAddress),

    /// A node asks for a gossip response without joining.
    Query(PeerAddress),

    /// Gossip response: a random subset of the responder's peers.
    PeerList(Vec<PeerAddress>),

    /// Gossip response of a node with no peers: its own endpoint.
    Announce { host: String, port: u16 },

    /// Greeting from a node that learned about us.
    Hello(PeerAddress),

    /// Application data.
    Data(DataPacket),

    /// The sender is leaving the overlay.
    Leave(PeerAddress),
}

impl Message {
    /// The command tag this message is sent under.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Join(_) => CMD_JOIN,
            Message::Query(_) => CMD_QUERY,
            Message::PeerList(_) => CMD_PEER_LIST,
            Message::Announce { .. } => CMD_CON_ADDR,
            Message::Hello(_) => CMD_HELLO,
            Message::Data(_) => CMD_DATA,
            Message::Leave(_) => CMD_LEAVE,
        }
    }

    /// Whether this message is one of the two gossip response shapes.
    pub fn is_gossip_response(&self) -> bool {
        matches!(self, Message::PeerList(_) | Message::Announce { .. })
    }

    /// Render the message as a frame.
    pub fn to_frame(&self) -> Result<Frame, MessageError> {
        let payload = match self {
            Message::Join(peer)
            | Message::Query(peer)
            | Message::Hello(peer)
            | Message::Leave(peer) => serde_json::to_string(peer)?,
            Message::PeerList(peers) => serde_json::to_string(peers)?,
            Message::Announce { host, port } => format!("{host},{port}"),
            Message::Data(packet) => serde_json::to_string(packet)?,
        };
        Ok(Frame::new(self.command(), payload))
    }

    /// Parse and validate a frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        let payload = frame.payload.as_str();
        let message = match frame.command.as_str() {
            CMD_JOIN => Message::Join(parse_peer(CMD_JOIN, payload)?),
            CMD_QUERY => Message::Query(parse_peer(CMD_QUERY, payload)?),
            CMD_HELLO => Message::Hello(parse_peer(CMD_HELLO, payload)?),
            CMD_LEAVE => Message::Leave(parse_peer(CMD_LEAVE, payload)?),
            CMD_PEER_LIST => {
                let peers: Vec<PeerAddress> = parse_json(CMD_PEER_LIST, payload)?;
                for peer in &peers {
                    validate_peer(peer)?;
                }
                Message::PeerList(peers)
            }
            CMD_CON_ADDR => {
                let (host, port) = parse_con_addr(payload)?;
                Message::Announce { host, port }
            }
            CMD_DATA => {
                let packet: DataPacket = parse_json(CMD_DATA, payload)?;
                validate_peer(&packet.sender)?;
                Message::Data(packet)
            }
            other => return Err(MessageError::UnknownCommand(other.to_string())),
        };
        Ok(message)
    }
}

impl TryFrom<Frame> for Message {
    type Error = MessageError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        Message::from_frame(&frame)
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    command: &'static str,
    payload: &str,
) -> Result<T, MessageError> {
    serde_json::from_str(payload).map_err(|e| MessageError::InvalidPayload {
        command,
        reason: e.to_string(),
    })
}

fn parse_peer(command: &'static str, payload: &str) -> Result<PeerAddress, MessageError> {
    let peer: PeerAddress = parse_json(command, payload)?;
    validate_peer(&peer)?;
    Ok(peer)
}

fn validate_peer(peer: &PeerAddress) -> Result<(), MessageError> {
    if peer.host.trim().is_empty() {
        return Err(MessageError::InvalidAddress(format!(
            "{}: empty host",
            peer.id
        )));
    }
    if peer.port == 0 {
        return Err(MessageError::InvalidAddress(format!("{}: port 0", peer.id)));
    }
    Ok(())
}

fn parse_con_addr(payload: &str) -> Result<(String, u16), MessageError> {
    let invalid = |reason: &str| MessageError::InvalidPayload {
        command: CMD_CON_ADDR,
        reason: format!("{reason}: {payload:?}"),
    };

    let (host, port) = payload
        .rsplit_once(',')
        .ok_or_else(|| invalid("expected ip,port"))?;
    let host = host.trim();
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    let port: u16 = port.trim().parse().map_err(|_| invalid("bad port"))?;
    if port == 0 {
        return Err(invalid("port 0"));
    }
    Ok((host.to_string(), port))
}
