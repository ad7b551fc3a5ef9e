// Copyright (c) 2024 Botho Foundation

//! Joining an existing network through a rendezvous node.
//!
//! ```text
//! Init ─> Dialing ─> AwaitingPeerList ─> PopulatingRegistry ─> DialingPeers ─> Joined
//!            │               │
//!            └───────────────┴──> Failed
//! ```
//!
//! The joiner sends `NODE_JOIN` to the rendezvous, merges the gossip response
//! into its registry and greets every learned peer with `NODE_HELLO`. Only the
//! rendezvous exchange can fail the join; a peer that cannot be greeted is
//! reported and skipped.

use crate::{
    connection::ConnectionManager,
    error::{BootstrapError, ConnectError},
    gossip::GossipResponse,
    message::Message,
    peer::PeerAddress,
    registry::ConnectionDirection,
};
use futures::future::join_all;
use std::{fmt, time::Duration};
use tracing::{debug, error, info};

/// Step of the join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Not started
    Init,
    /// Connecting to the rendezvous
    Dialing,
    /// Join sent, waiting for the gossip response
    AwaitingPeerList,
    /// Merging the response into the registry
    PopulatingRegistry,
    /// Greeting learned peers
    DialingPeers,
    /// Done
    Joined,
    /// The rendezvous exchange failed
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapState::Init => "init",
            BootstrapState::Dialing => "dialing",
            BootstrapState::AwaitingPeerList => "awaiting-peer-list",
            BootstrapState::PopulatingRegistry => "populating-registry",
            BootstrapState::DialingPeers => "dialing-peers",
            BootstrapState::Joined => "joined",
            BootstrapState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a successful join.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Peers that were new to the registry
    pub learned: Vec<PeerAddress>,

    /// Peers that accepted our greeting
    pub connected: Vec<PeerAddress>,

    /// Peers that could not be greeted after every retry
    pub unreachable: Vec<PeerAddress>,
}

/// One run of the join protocol against a rendezvous node.
#[derive(Debug)]
pub struct Bootstrap {
    host: String,
    port: u16,
    retry_count: u32,
    retry_delay: Duration,
    history: Vec<BootstrapState>,
}

impl Bootstrap {
    /// Prepare to join through the rendezvous at `host:port`.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        retry_count: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            retry_count,
            retry_delay,
            history: vec![BootstrapState::Init],
        }
    }

    /// `host:port` of the rendezvous.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Current state.
    pub fn state(&self) -> BootstrapState {
        self.history
            .last()
            .copied()
            .unwrap_or(BootstrapState::Init)
    }

    /// Every state visited so far, in order.
    pub fn history(&self) -> &[BootstrapState] {
        &self.history
    }

    fn transition(&mut self, next: BootstrapState) {
        let from = self.state();
        info!(rendezvous = %self.target(), %from, to = %next, "Bootstrap state changed");
        self.history.push(next);
    }

    fn fail(&mut self, err: BootstrapError) -> BootstrapError {
        error!(
            rendezvous = %self.target(),
            state = %self.state(),
            error = %err,
            "Bootstrap failed"
        );
        self.transition(BootstrapState::Failed);
        err
    }

    fn classify(&self, source: ConnectError) -> BootstrapError {
        if source.is_protocol_error() {
            BootstrapError::InvalidResponse {
                target: self.target(),
                reason: source.to_string(),
            }
        } else {
            BootstrapError::Unreachable {
                target: self.target(),
                source,
            }
        }
    }

    /// Run the join protocol on behalf of `manager`'s node.
    pub async fn run(
        &mut self,
        manager: &ConnectionManager,
    ) -> Result<BootstrapReport, BootstrapError> {
        let identity = manager.identity().clone();

        self.transition(BootstrapState::Dialing);
        let mut channel = match manager.connect(&self.host, self.port).await {
            Ok(channel) => channel,
            Err(err) => {
                let err = self.classify(err);
                return Err(self.fail(err));
            }
        };

        if let Err(err) = channel.send(&Message::Join(identity.clone())).await {
            let err = self.classify(err);
            return Err(self.fail(err));
        }
        self.transition(BootstrapState::AwaitingPeerList);

        let reply = match channel.recv().await {
            Ok(reply) => reply,
            Err(err) => {
                let err = self.classify(err);
                return Err(self.fail(err));
            }
        };
        drop(channel);

        let response = match GossipResponse::try_from(reply) {
            Ok(response) => response,
            Err(other) => {
                let err = BootstrapError::InvalidResponse {
                    target: self.target(),
                    reason: format!("expected a gossip response, got {}", other.command()),
                };
                return Err(self.fail(err));
            }
        };

        self.transition(BootstrapState::PopulatingRegistry);
        let registry = manager.registry();
        let learned = registry.merge(response.into_addresses());
        debug!(learned = learned.len(), known = registry.size(), "Merged rendezvous peer list");

        self.transition(BootstrapState::DialingPeers);
        let hello = Message::Hello(identity);
        let (attempts, delay) = (self.retry_count, self.retry_delay);
        let peers = registry.peers();
        let outcomes = join_all(peers.into_iter().map(|peer| {
            let hello = &hello;
            async move {
                let result = manager.dial_with_retry(&peer, hello, attempts, delay).await;
                (peer, result.is_ok())
            }
        }))
        .await;

        let mut report = BootstrapReport {
            learned,
            ..Default::default()
        };
        for (peer, greeted) in outcomes {
            if greeted {
                registry.attach_connection(&peer.host, peer.port, ConnectionDirection::Outbound);
                report.connected.push(peer);
            } else {
                report.unreachable.push(peer);
            }
        }

        self.transition(BootstrapState::Joined);
        info!(
            rendezvous = %self.target(),
            learned = report.learned.len(),
            connected = report.connected.len(),
            unreachable = report.unreachable.len(),
            "Joined network"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::FrameCodec,
        config::NodeConfigBuilder,
        connection::PeerChannel,
        event::NodeEvent,
        handler::LoggingHandler,
    };
    use std::sync::Arc;
    use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};

    async fn joiner() -> ConnectionManager {
        let config = NodeConfigBuilder::new()
            .node_id("joiner")
            .port(0)
            .connect_timeout(Duration::from_secs(2))
            .io_timeout(Duration::from_secs(2))
            .build();
        let (events, _) = broadcast::channel::<NodeEvent>(16);
        ConnectionManager::bind(&config, Arc::new(LoggingHandler), events)
            .await
            .unwrap()
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// A rendezvous stand-in that answers the first frame with `reply(port)`
    /// and then accepts greetings until dropped.
    async fn fake_rendezvous<F>(reply: F) -> (u16, JoinHandle<Vec<Message>>)
    where
        F: FnOnce(u16) -> Message + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let task = tokio::spawn(async move {
            let mut received = Vec::new();
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel =
                PeerChannel::new(stream, FrameCodec::default(), Duration::from_secs(2));
            received.push(channel.recv().await.unwrap());
            channel.send(&reply(port)).await.unwrap();

            if let Ok(Ok((stream, _))) =
                tokio::time::timeout(Duration::from_millis(500), listener.accept()).await
            {
                let mut channel =
                    PeerChannel::new(stream, FrameCodec::default(), Duration::from_secs(2));
                received.push(channel.recv().await.unwrap());
            }
            received
        });

        (port, task)
    }

    #[tokio::test]
    async fn test_refused_rendezvous_fails() {
        let manager = joiner().await;
        let mut bootstrap = Bootstrap::new("127.0.0.1", free_port().await, 3, Duration::ZERO);

        let err = bootstrap.run(&manager).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Unreachable { .. }));
        assert_eq!(
            bootstrap.history(),
            &[
                BootstrapState::Init,
                BootstrapState::Dialing,
                BootstrapState::Failed
            ]
        );
    }

    #[tokio::test]
    async fn test_join_through_empty_rendezvous() {
        let manager = joiner().await;
        let (port, rendezvous) = fake_rendezvous(|port| Message::Announce {
            host: "127.0.0.1".into(),
            port,
        })
        .await;

        let mut bootstrap = Bootstrap::new("127.0.0.1", port, 3, Duration::ZERO);
        let report = bootstrap.run(&manager).await.unwrap();

        assert_eq!(bootstrap.state(), BootstrapState::Joined);
        assert_eq!(bootstrap.history().len(), 6);
        assert_eq!(report.learned.len(), 1);
        assert_eq!(report.connected.len(), 1);
        assert!(report.unreachable.is_empty());

        let registry = manager.registry();
        assert!(registry.contains("127.0.0.1", port));
        let conn = registry.connection("127.0.0.1", port).unwrap();
        assert_eq!(conn.direction, ConnectionDirection::Outbound);

        let received = rendezvous.await.unwrap();
        assert_eq!(received[0], Message::Join(manager.identity().clone()));
        assert_eq!(received[1], Message::Hello(manager.identity().clone()));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_skipped() {
        let manager = joiner().await;
        let dead = PeerAddress::new("dead", "127.0.0.1", free_port().await);
        let own = manager.identity().clone();
        let listed = vec![dead.clone(), own];
        let (port, _rendezvous) = fake_rendezvous(move |port| {
            let mut peers = listed;
            peers.push(PeerAddress::new("rendezvous", "127.0.0.1", port));
            Message::PeerList(peers)
        })
        .await;

        let mut bootstrap = Bootstrap::new("127.0.0.1", port, 2, Duration::from_millis(10));
        let report = bootstrap.run(&manager).await.unwrap();

        // Our own address is never merged.
        assert_eq!(report.learned.len(), 2);
        assert_eq!(report.unreachable, vec![dead]);
        assert_eq!(report.connected.len(), 1);
        assert_eq!(manager.registry().size(), 2);
        assert_eq!(manager.registry().connected_count(), 1);
    }

    #[tokio::test]
    async fn test_wrong_response_is_invalid() {
        let manager = joiner().await;
        let (port, _rendezvous) =
            fake_rendezvous(|_| Message::Hello(PeerAddress::new("x", "127.0.0.1", 1))).await;

        let mut bootstrap = Bootstrap::new("127.0.0.1", port, 3, Duration::ZERO);
        let err = bootstrap.run(&manager).await.unwrap_err();

        assert!(matches!(err, BootstrapError::InvalidResponse { .. }));
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
        assert!(manager.registry().is_empty());
    }
}
