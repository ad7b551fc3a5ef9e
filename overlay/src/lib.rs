// Copyright (c) 2024 Botho Foundation

//! Minimal peer-to-peer overlay node.
//!
//! Each node keeps a registry of known peers, joins an existing network
//! through a rendezvous node, shares random subsets of its peers (gossip) and
//! relays opaque application payloads to them over plain TCP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Node                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────┐  ┌──────────────┐  │
//! │  │ConnectionManager │  │ PeerRegistry │  │  Bootstrap   │  │
//! │  │ (accept / dial)  │  │   (peers)    │  │   (join)     │  │
//! │  └──────────────────┘  └──────────────┘  └──────────────┘  │
//! │  ┌──────────────────┐  ┌──────────────┐                    │
//! │  │   FrameCodec     │  │GossipSelector│                    │
//! │  │  (wire format)   │  │  (sampling)  │                    │
//! │  └──────────────────┘  └──────────────┘                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use bth_overlay::{Node, NodeConfig};
//!
//! // First node starts a new network
//! let a = Node::new(NodeConfig::new("a", "127.0.0.1", 5050)).await?;
//! a.start().await?;
//!
//! // Second node joins through the first
//! let b_config = NodeConfig::new("b", "127.0.0.1", 5051).with_bootstrap("127.0.0.1:5050");
//! let b = Node::new(b_config).await?;
//! b.start().await?;
//!
//! b.broadcast("hello").await?;
//! ```
//!
//! # Wire Format
//!
//! Every message is one frame: a fixed-width, space-padded decimal length
//! followed by a UTF-8 body of the form `COMMAND(payload)`. See [`codec`] for
//! the envelope and [`message`] for the command set.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod bootstrap;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod gossip;
pub mod handler;
pub mod message;
pub mod node;
pub mod peer;
pub mod registry;

// Re-export main types for convenience
pub use bootstrap::{Bootstrap, BootstrapReport, BootstrapState};
pub use codec::{Frame, FrameCodec, FrameError};
pub use config::{NodeConfig, NodeConfigBuilder};
pub use connection::{BroadcastReport, ConnectionManager, PeerChannel};
pub use error::{BootstrapError, ConnectError, NodeError, NodeResult};
pub use event::NodeEvent;
pub use gossip::{GossipResponse, GossipSelector};
pub use handler::{DataHandler, LoggingHandler};
pub use message::{DataPacket, Message, MessageError};
pub use node::{Node, NodeState};
pub use peer::{PeerAddress, PeerId};
pub use registry::{new_shared_registry, PeerRegistry, SharedRegistry};
