// Copyright (c) 2024 Botho Foundation

//! Error types for the overlay node.

use crate::{codec::FrameError, message::MessageError, node::NodeState};
use displaydoc::Display;
use std::{io, time::Duration};
use thiserror::Error;

/// Failure talking to a single peer.
///
/// These never propagate past the operation that hit them: a broadcast keeps
/// going with the remaining peers and bootstrap moves on to the next peer.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Opening the connection failed.
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// An operation did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Reading or writing a frame failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The peer sent a frame that is not a valid message.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The peer closed the connection before answering.
    #[error("connection closed before a response arrived")]
    Closed,

    /// The peer answered with the wrong kind of message.
    #[error("unexpected {0} response")]
    UnexpectedResponse(&'static str),
}

impl ConnectError {
    /// Whether the peer answered with something undecodable, as opposed to
    /// being unreachable.
    pub fn is_protocol_error(&self) -> bool {
        match self {
            ConnectError::Frame(err) => err.is_framing(),
            ConnectError::Message(_) | ConnectError::UnexpectedResponse(_) => true,
            _ => false,
        }
    }

    /// Whether the peer could not be reached or dropped the connection.
    ///
    /// Errors raised locally before anything was written, such as a message
    /// too large to encode, do not count.
    pub fn is_unreachable(&self) -> bool {
        match self {
            ConnectError::Connect { .. } | ConnectError::Timeout { .. } | ConnectError::Closed => {
                true
            }
            ConnectError::Frame(FrameError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Joining through the rendezvous node failed. Fatal for the node.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The rendezvous address could not be parsed.
    #[error("invalid rendezvous address {0:?}")]
    InvalidAddress(String),

    /// The rendezvous node could not be reached.
    #[error("rendezvous {target} unreachable: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: ConnectError,
    },

    /// The rendezvous node answered with something that is not a peer list.
    #[error("rendezvous {target} sent an invalid peer list: {reason}")]
    InvalidResponse { target: String, reason: String },
}

/// Errors that can occur operating a node.
#[derive(Debug, Display, Error)]
pub enum NodeError {
    /// Failed to bind listener on {addr}: {source}
    Bind { addr: String, source: io::Error },

    /// Bootstrap failed: {0}
    Bootstrap(#[from] BootstrapError),

    /// Connection error: {0}
    Connect(#[from] ConnectError),

    /// Invalid configuration: {0}
    Config(String),

    /// Operation not allowed while the node is {0}
    InvalidState(NodeState),

    /// Node is not running
    NotRunning,

    /// I/O error: {0}
    Io(#[from] io::Error),
}

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
