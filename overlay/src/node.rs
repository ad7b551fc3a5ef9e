// Copyright (c) 2024 Botho Foundation

//! The overlay node.
//!
//! A [`Node`] owns a listener, a peer registry and every connection task.
//! Constructing it binds the listener; [`Node::start`] begins accepting
//! connections and, if a rendezvous is configured, joins the network through
//! it. A node without a rendezvous starts a new network that others can join.

use crate::{
    bootstrap::{Bootstrap, BootstrapReport},
    config::NodeConfig,
    connection::{BroadcastReport, ConnectionManager},
    error::{ConnectError, NodeError, NodeResult},
    event::{NodeEvent, EVENT_CHANNEL_CAPACITY},
    gossip::GossipResponse,
    handler::{DataHandler, LoggingHandler},
    message::{DataPacket, Message},
    peer::PeerAddress,
};
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Listener bound, not accepting yet
    Created,
    /// Accepting connections
    Running,
    /// Accepting connections and joined through a rendezvous
    Joined,
    /// Joining failed; the node was shut down
    Failed,
    /// Shut down
    Stopped,
}

impl NodeState {
    /// Whether the node accepts connections and can talk to peers.
    pub fn is_active(&self) -> bool {
        matches!(self, NodeState::Running | NodeState::Joined)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Created => "created",
            NodeState::Running => "running",
            NodeState::Joined => "joined",
            NodeState::Failed => "failed",
            NodeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A peer on the overlay network.
pub struct Node {
    config: NodeConfig,
    manager: Arc<ConnectionManager>,
    state: RwLock<NodeState>,
    events: broadcast::Sender<NodeEvent>,
}

impl Node {
    /// Create a node that logs received payloads.
    pub async fn new(config: NodeConfig) -> NodeResult<Self> {
        Self::with_handler(config, LoggingHandler).await
    }

    /// Create a node that hands received payloads to `handler`.
    pub async fn with_handler(config: NodeConfig, handler: impl DataHandler) -> NodeResult<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = ConnectionManager::bind(&config, Arc::new(handler), events.clone()).await?;

        Ok(Self {
            config,
            manager: Arc::new(manager),
            state: RwLock::new(NodeState::Created),
            events,
        })
    }

    /// Our own address as advertised to peers.
    pub fn address(&self) -> &PeerAddress {
        self.manager.identity()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// The configuration the node was created with.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Subscribe to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the known peers.
    pub fn peers(&self) -> Vec<PeerAddress> {
        self.manager.registry().peers()
    }

    /// A random known peer, or our own address when none are known.
    pub fn random_peer(&self) -> PeerAddress {
        self.manager.registry().sample_one()
    }

    fn set_state(&self, next: NodeState) -> NodeState {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            debug!(identity = %self.address(), from = %prev, to = %next, "Node state changed");
        }
        prev
    }

    fn ensure_active(&self) -> NodeResult<()> {
        let state = self.state();
        if state.is_active() {
            Ok(())
        } else {
            Err(NodeError::InvalidState(state))
        }
    }

    /// Start accepting connections and join the network if a rendezvous is
    /// configured.
    ///
    /// A failed join is fatal: the node shuts down, its listener is closed and
    /// the error is returned. Returns the join report, or `None` when the node
    /// started a new network.
    pub async fn start(&self) -> NodeResult<Option<BootstrapReport>> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Created {
                return Err(NodeError::InvalidState(*state));
            }
            *state = NodeState::Running;
        }

        self.manager.listen()?;
        info!(identity = %self.address(), "Node started");

        let Some((host, port)) = self.config.bootstrap_endpoint()? else {
            info!(identity = %self.address(), "No rendezvous configured, starting a new network");
            return Ok(None);
        };

        let mut bootstrap = Bootstrap::new(
            host,
            port,
            self.config.retry_count,
            self.config.retry_delay(),
        );
        match bootstrap.run(&self.manager).await {
            Ok(report) => {
                self.set_state(NodeState::Joined);
                self.emit(NodeEvent::Joined {
                    peers: self.manager.registry().size(),
                });
                Ok(Some(report))
            }
            Err(err) => {
                error!(
                    identity = %self.address(),
                    error = %err,
                    "Could not join network, shutting down"
                );
                self.emit(NodeEvent::BootstrapFailed(err.to_string()));
                self.manager.registry().clear();
                self.manager.shutdown().await;
                self.set_state(NodeState::Failed);
                Err(err.into())
            }
        }
    }

    /// Send a payload to one peer.
    pub async fn send(&self, peer: &PeerAddress, payload: impl Into<String>) -> NodeResult<()> {
        self.ensure_active()?;
        let message = self.data_message(payload);
        Ok(self.manager.send_to(peer, &message).await?)
    }

    /// Send a payload to every known peer.
    pub async fn broadcast(&self, payload: impl Into<String>) -> NodeResult<BroadcastReport> {
        self.ensure_active()?;
        let message = self.data_message(payload);
        Ok(self.manager.broadcast(&message).await)
    }

    fn data_message(&self, payload: impl Into<String>) -> Message {
        Message::Data(DataPacket {
            sender: self.address().clone(),
            body: payload.into(),
        })
    }

    /// Ask the node at `host:port` for a gossip response without joining.
    pub async fn query(&self, host: &str, port: u16) -> NodeResult<GossipResponse> {
        self.ensure_active()?;
        let response = self
            .manager
            .request(host, port, &Message::Query(self.address().clone()))
            .await?;
        GossipResponse::try_from(response)
            .map_err(|other| ConnectError::UnexpectedResponse(other.command()).into())
    }

    /// Tell a peer we are leaving and forget it.
    ///
    /// The peer is removed locally even if the notice cannot be delivered.
    pub async fn disconnect(&self, peer: &PeerAddress) -> NodeResult<()> {
        self.ensure_active()?;
        let leave = Message::Leave(self.address().clone());
        if let Err(err) = self.manager.dial(peer, &leave).await {
            warn!(
                peer_id = %peer.id,
                host = %peer.host,
                port = peer.port,
                error = %err,
                "Leave notice not delivered"
            );
        }
        if self.manager.registry().remove_peer(peer) {
            self.emit(NodeEvent::PeerRemoved(peer.clone()));
        }
        Ok(())
    }

    /// Leave the network and stop the node.
    ///
    /// Peers are notified on a best-effort basis, the registry is cleared and
    /// in-flight connections get the configured grace period. Calling this
    /// more than once is a no-op.
    pub async fn shutdown(&self) {
        let prev = self.state();
        if matches!(prev, NodeState::Stopped | NodeState::Failed) {
            return;
        }
        self.set_state(NodeState::Stopped);

        if prev.is_active() {
            let report = self
                .manager
                .broadcast(&Message::Leave(self.address().clone()))
                .await;
            debug!(
                notified = report.delivered.len(),
                failed = report.failed.len(),
                "Sent leave notices"
            );
        }

        for peer in self.manager.registry().clear() {
            self.emit(NodeEvent::PeerRemoved(peer));
        }
        self.manager.shutdown().await;
        self.emit(NodeEvent::Stopped);
        info!(identity = %self.address(), "Node stopped");
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Stop accepting even if shutdown was never awaited.
        self.manager.cancel();
    }
}
