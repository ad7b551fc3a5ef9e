// Copyright (c) 2024 Botho Foundation

//! Events published by a running node.

use crate::peer::PeerAddress;

/// Capacity of the node event channel. Slow subscribers miss the oldest
/// events rather than blocking the node.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened on the node, delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A peer was added to the registry.
    PeerAdded(PeerAddress),

    /// A peer was removed from the registry.
    PeerRemoved(PeerAddress),

    /// An application payload arrived.
    DataReceived {
        /// Node that sent the payload
        sender: PeerAddress,
        /// The payload
        body: String,
    },

    /// Bootstrap finished and the node is part of the network.
    Joined {
        /// Peers known after bootstrap
        peers: usize,
    },

    /// Bootstrap failed; the node is shutting down.
    BootstrapFailed(String),

    /// The node stopped.
    Stopped,
}
