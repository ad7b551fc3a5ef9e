// Copyright (c) 2024 Botho Foundation

//! TCP connection handling for a node.
//!
//! Every exchange on the overlay is short-lived: a dialer opens a connection,
//! writes one frame and closes it. The only exception is a join or query,
//! which gets exactly one gossip response on the same connection.
//!
//! # Architecture
//!
//! ```text
//!   listener ──accept──> accept loop ──spawn──> handle_inbound ──> registry
//!                            │                       │              handler
//!                     CancellationToken         TaskTracker
//!
//!   send_to / broadcast / request ──dial──> PeerChannel ──> remote node
//! ```
//!
//! Shutdown cancels the accept loop, which drops the listener, then waits a
//! bounded grace period for in-flight handler tasks.

use crate::{
    codec::{FrameCodec, FrameError},
    config::NodeConfig,
    error::{ConnectError, NodeError, NodeResult},
    event::NodeEvent,
    gossip::GossipSelector,
    handler::DataHandler,
    message::Message,
    peer::PeerAddress,
    registry::{new_shared_registry, ConnectionDirection, SharedRegistry},
};
use futures::{future::join_all, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{broadcast, Semaphore},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::{codec::Framed, sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// One framed connection to a peer.
pub struct PeerChannel<S> {
    framed: Framed<S, FrameCodec>,
    timeout: Duration,
}

impl<S> PeerChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream with the given codec and per-frame timeout.
    pub fn new(stream: S, codec: FrameCodec, timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, codec),
            timeout,
        }
    }

    /// Send one message.
    pub async fn send(&mut self, message: &Message) -> Result<(), ConnectError> {
        let frame = message.to_frame()?;
        timeout(self.timeout, self.framed.send(frame))
            .await
            .map_err(|_| ConnectError::Timeout {
                operation: "send",
                after: self.timeout,
            })??;
        Ok(())
    }

    /// Receive one message.
    pub async fn recv(&mut self) -> Result<Message, ConnectError> {
        match timeout(self.timeout, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Ok(Message::try_from(frame)?),
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(None) => Err(ConnectError::Closed),
            Err(_) => Err(ConnectError::Timeout {
                operation: "recv",
                after: self.timeout,
            }),
        }
    }

    /// Flush and close the connection.
    pub async fn close(mut self) -> Result<(), ConnectError> {
        timeout(self.timeout, self.framed.close())
            .await
            .map_err(|_| ConnectError::Timeout {
                operation: "close",
                after: self.timeout,
            })??;
        Ok(())
    }
}

/// Connection parameters taken from [`NodeConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Frame codec for every connection
    pub codec: FrameCodec,

    /// Timeout for opening a connection
    pub connect_timeout: Duration,

    /// Timeout for reading or writing a frame
    pub io_timeout: Duration,

    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace: Duration,

    /// Maximum number of inbound connections handled at once
    pub max_inbound_connections: usize,

    /// Remove peers that cannot be reached
    pub evict_unreachable_peers: bool,
}

impl From<&NodeConfig> for ConnectionSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            codec: config.codec(),
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
            shutdown_grace: config.shutdown_grace(),
            max_inbound_connections: config.max_inbound_connections,
            evict_unreachable_peers: config.evict_unreachable_peers,
        }
    }
}

/// Outcome of sending one message to every known peer.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Peers the message was written to
    pub delivered: Vec<PeerAddress>,

    /// Peers that could not be reached, with the reason
    pub failed: Vec<(PeerAddress, ConnectError)>,
}

impl BroadcastReport {
    /// Whether every peer received the message.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the listener, the registry and all connection tasks of a node.
pub struct ConnectionManager {
    identity: PeerAddress,
    settings: ConnectionSettings,
    registry: SharedRegistry,
    gossip: GossipSelector,
    handler: Arc<dyn DataHandler>,
    events: broadcast::Sender<NodeEvent>,

    running: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
    inbound_limit: Arc<Semaphore>,

    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Bind the listener described by `config`.
    ///
    /// With port 0 the OS picks a free port, and the bound port becomes the
    /// node's advertised port.
    pub async fn bind(
        config: &NodeConfig,
        handler: Arc<dyn DataHandler>,
        events: broadcast::Sender<NodeEvent>,
    ) -> NodeResult<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let port = listener.local_addr()?.port();

        let identity = PeerAddress::new(
            config.node_id.as_str(),
            config.advertised_host(),
            port,
        );
        info!(%identity, listen = %addr, "Listener bound");

        let registry = new_shared_registry(identity.clone());
        let settings = ConnectionSettings::from(config);

        Ok(Self {
            gossip: GossipSelector::new(Arc::clone(&registry)),
            inbound_limit: Arc::new(Semaphore::new(settings.max_inbound_connections)),
            identity,
            settings,
            registry,
            handler,
            events,
            running: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
        })
    }

    /// Our own address as advertised to peers.
    pub fn identity(&self) -> &PeerAddress {
        &self.identity
    }

    /// The registry of known peers.
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Connection parameters in use.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Whether the manager has not been shut down.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of inbound handler tasks still running.
    pub fn inflight(&self) -> usize {
        self.tracker.len()
    }

    /// Start accepting connections in a background task.
    pub fn listen(self: &Arc<Self>) -> NodeResult<()> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }
        let listener = self.listener.lock().take().ok_or(NodeError::NotRunning)?;

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.accept_loop(listener).await });
        *self.accept_task.lock() = Some(handle);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        info!(identity = %self.identity, "Accepting connections");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => self.spawn_inbound(stream, remote),
                    Err(err) => {
                        warn!(error = %err, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        debug!(identity = %self.identity, "Accept loop stopped, listener closed");
    }

    fn spawn_inbound(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let permit = match Arc::clone(&self.inbound_limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    %remote,
                    limit = self.settings.max_inbound_connections,
                    "Inbound connection limit reached, dropping connection"
                );
                return;
            }
        };

        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            let _permit = permit;
            if let Err(err) = manager.handle_inbound(stream, remote).await {
                debug!(%remote, error = %err, "Inbound connection failed");
            }
        });
    }

    /// Serve one inbound connection: read a frame, dispatch it, close.
    pub async fn handle_inbound<S>(
        &self,
        stream: S,
        remote: SocketAddr,
    ) -> Result<(), ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut channel = PeerChannel::new(stream, self.settings.codec, self.settings.io_timeout);
        let message = channel.recv().await?;
        trace!(%remote, command = message.command(), "Received message");

        match message {
            Message::Join(peer) => {
                let response = self.gossip.respond(&peer);
                channel.send(&response.into_message()).await?;
                self.register(peer, ConnectionDirection::Inbound);
            }
            Message::Query(peer) => {
                let response = self.gossip.respond(&peer);
                channel.send(&response.into_message()).await?;
            }
            Message::Hello(peer) => {
                self.register(peer, ConnectionDirection::Inbound);
            }
            Message::Data(packet) => {
                // Peers learned from NODE_CON_ADDR only carry a placeholder id.
                self.registry.refresh_id(&packet.sender);
                self.registry.touch(&packet.sender.host, packet.sender.port);
                self.handler.on_data(&packet.sender, &packet.body);
                self.emit(NodeEvent::DataReceived {
                    sender: packet.sender,
                    body: packet.body,
                });
            }
            Message::Leave(peer) => {
                if self.registry.remove_peer(&peer) {
                    info!(%peer, "Peer left");
                    self.emit(NodeEvent::PeerRemoved(peer));
                }
            }
            unsolicited @ (Message::PeerList(_) | Message::Announce { .. }) => {
                debug!(
                    %remote,
                    command = unsolicited.command(),
                    "Ignoring unsolicited gossip response"
                );
            }
        }

        channel.close().await
    }

    fn register(&self, peer: PeerAddress, direction: ConnectionDirection) {
        let added = self.registry.add(peer.clone());
        self.registry.attach_connection(&peer.host, peer.port, direction);
        if added {
            info!(%peer, ?direction, "Peer added");
            self.emit(NodeEvent::PeerAdded(peer));
        }
    }

    /// Open a connection to `host:port`.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<PeerChannel<TcpStream>, ConnectError> {
        let target = format!("{host}:{port}");
        let stream = timeout(self.settings.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| ConnectError::Timeout {
                operation: "connect",
                after: self.settings.connect_timeout,
            })?
            .map_err(|source| ConnectError::Connect { target, source })?;
        // Frames are small and sent one at a time.
        let _ = stream.set_nodelay(true);

        Ok(PeerChannel::new(
            stream,
            self.settings.codec,
            self.settings.io_timeout,
        ))
    }

    /// Check that `message` fits the configured framing, without opening a
    /// connection.
    pub fn check_encodable(&self, message: &Message) -> Result<(), ConnectError> {
        let frame = message.to_frame()?;
        self.settings
            .codec
            .check(&frame.command, &frame.payload)
            .map_err(FrameError::from)?;
        Ok(())
    }

    /// Connect to `peer`, write one message and close.
    ///
    /// A message that cannot be encoded fails before any connection is made.
    pub async fn dial(&self, peer: &PeerAddress, message: &Message) -> Result<(), ConnectError> {
        self.check_encodable(message)?;
        let mut channel = self.connect(&peer.host, peer.port).await?;
        channel.send(message).await?;
        channel.close().await?;
        trace!(%peer, command = message.command(), "Message sent");
        Ok(())
    }

    /// [`ConnectionManager::dial`], trying up to `attempts` times with
    /// `delay` between attempts. Returns the last error if every attempt
    /// fails.
    pub async fn dial_with_retry(
        &self,
        peer: &PeerAddress,
        message: &Message,
        attempts: u32,
        delay: Duration,
    ) -> Result<(), ConnectError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.dial(peer, message).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= attempts => {
                    warn!(
                        peer_id = %peer.id,
                        host = %peer.host,
                        port = peer.port,
                        command = message.command(),
                        attempts,
                        error = %err,
                        "Giving up on peer"
                    );
                    return Err(err);
                }
                Err(err) => {
                    debug!(
                        peer_id = %peer.id,
                        host = %peer.host,
                        port = peer.port,
                        command = message.command(),
                        attempt,
                        error = %err,
                        "Dial failed, retrying"
                    );
                }
            }
            attempt += 1;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Write one message to `host:port` and read the single response.
    pub async fn request(
        &self,
        host: &str,
        port: u16,
        message: &Message,
    ) -> Result<Message, ConnectError> {
        self.check_encodable(message)?;
        let mut channel = self.connect(host, port).await?;
        channel.send(message).await?;
        let response = channel.recv().await?;
        trace!(%host, port, command = response.command(), "Response received");
        Ok(response)
    }

    /// Deliver a message to a known peer.
    ///
    /// A peer that cannot be reached is evicted from the registry when
    /// `evict_unreachable_peers` is set. Encoding failures leave the registry
    /// alone.
    pub async fn send_to(
        &self,
        peer: &PeerAddress,
        message: &Message,
    ) -> Result<(), ConnectError> {
        match self.dial(peer, message).await {
            Ok(()) => {
                self.registry.touch(&peer.host, peer.port);
                Ok(())
            }
            Err(err) => {
                warn!(
                    peer_id = %peer.id,
                    host = %peer.host,
                    port = peer.port,
                    command = message.command(),
                    error = %err,
                    "Send failed"
                );
                if self.settings.evict_unreachable_peers
                    && err.is_unreachable()
                    && self.registry.remove_peer(peer)
                {
                    self.emit(NodeEvent::PeerRemoved(peer.clone()));
                }
                Err(err)
            }
        }
    }

    /// Send a message to every known peer concurrently.
    ///
    /// Works on a snapshot of the registry; a failure on one peer never
    /// affects delivery to the others.
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let peers = self.registry.peers();
        let results = join_all(peers.into_iter().map(|peer| async move {
            let result = self.send_to(&peer, message).await;
            (peer, result)
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (peer, result) in results {
            match result {
                Ok(()) => report.delivered.push(peer),
                Err(err) => report.failed.push((peer, err)),
            }
        }

        debug!(
            command = message.command(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast finished"
        );
        report
    }

    /// Stop accepting connections and wait for in-flight handlers.
    ///
    /// Handlers still running after the grace period are left to finish on
    /// their own. Calling this more than once is a no-op.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        // Never listened: drop the listener here.
        drop(self.listener.lock().take());

        let accept_task = self.accept_task.lock().take();
        if let Some(handle) = accept_task {
            if let Err(err) = handle.await {
                warn!(error = %err, "Accept loop task failed");
            }
        }

        self.tracker.close();
        let grace = self.settings.shutdown_grace;
        if timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                inflight = self.inflight(),
                ?grace,
                "Shutdown grace period elapsed with handlers still running"
            );
        }

        info!(identity = %self.identity, "Connection manager stopped");
    }

    /// Signal the accept loop to stop without waiting for it.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
