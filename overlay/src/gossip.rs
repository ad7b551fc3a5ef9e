// Copyright (c) 2024 Botho Foundation

//! Gossip responses sent to joining and querying nodes.
//!
//! A node answers a join or query with a random subset of the peers it knows
//! plus itself, so membership knowledge spreads gradually instead of every
//! node shipping its full peer set. A node that knows nobody yet has nothing
//! to sample from and answers with a `NODE_CON_ADDR` announcement of its own
//! endpoint instead. Both shapes are kept distinct in [`GossipResponse`].

use crate::{message::Message, peer::PeerAddress, registry::SharedRegistry};
use rand::Rng;
use tracing::debug;

/// Answer to a join or peer-list query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipResponse {
    /// The responder knows no peers; this is its own address.
    Announcement(PeerAddress),

    /// Random subset of the responder's peers, possibly including itself.
    PeerList(Vec<PeerAddress>),
}

impl GossipResponse {
    /// Whether this is the no-peers announcement.
    pub fn is_announcement(&self) -> bool {
        matches!(self, GossipResponse::Announcement(_))
    }

    /// Number of addresses carried.
    pub fn len(&self) -> usize {
        match self {
            GossipResponse::Announcement(_) => 1,
            GossipResponse::PeerList(peers) => peers.len(),
        }
    }

    /// Whether no addresses are carried. Only an empty peer list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All carried addresses, flattening the announcement into a list.
    pub fn into_addresses(self) -> Vec<PeerAddress> {
        match self {
            GossipResponse::Announcement(addr) => vec![addr],
            GossipResponse::PeerList(peers) => peers,
        }
    }

    /// The protocol message carrying this response.
    pub fn into_message(self) -> Message {
        match self {
            GossipResponse::Announcement(addr) => Message::Announce {
                host: addr.host,
                port: addr.port,
            },
            GossipResponse::PeerList(peers) => Message::PeerList(peers),
        }
    }
}

impl TryFrom<Message> for GossipResponse {
    type Error = Message;

    /// Interpret a received message as a gossip response; any other message
    /// is handed back unchanged.
    fn try_from(message: Message) -> Result<Self, Message> {
        match message {
            Message::Announce { host, port } => Ok(GossipResponse::Announcement(
                PeerAddress::from_endpoint(host, port),
            )),
            Message::PeerList(peers) => Ok(GossipResponse::PeerList(peers)),
            other => Err(other),
        }
    }
}

/// Builds gossip responses from a node's registry.
#[derive(Debug, Clone)]
pub struct GossipSelector {
    registry: SharedRegistry,
}

impl GossipSelector {
    /// Create a selector over the given registry.
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    /// Build the response for `asker`.
    pub fn respond(&self, asker: &PeerAddress) -> GossipResponse {
        self.respond_with(asker, &mut rand::thread_rng())
    }

    /// [`GossipSelector::respond`] with a caller-supplied rng.
    pub fn respond_with<R: Rng>(&self, asker: &PeerAddress, rng: &mut R) -> GossipResponse {
        let response = self.registry.sample_subset_with(rng);
        match &response {
            GossipResponse::Announcement(_) => {
                debug!(%asker, "No peers known, announcing own address");
            }
            GossipResponse::PeerList(peers) => {
                debug!(
                    %asker,
                    known = self.registry.size(),
                    shared = peers.len(),
                    "Sharing peer subset"
                );
            }
        }
        response
    }
}
