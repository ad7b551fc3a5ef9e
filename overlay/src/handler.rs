// Copyright (c) 2024 Botho Foundation

//! Delivery of application payloads.

use crate::peer::PeerAddress;
use tracing::info;

/// Receives the payload of every `NODE_DATA` message a node accepts.
///
/// Called from the connection task that read the message, so implementations
/// should hand off anything slow.
pub trait DataHandler: Send + Sync + 'static {
    /// A payload arrived from `sender`.
    fn on_data(&self, sender: &PeerAddress, payload: &str);
}

impl<F> DataHandler for F
where
    F: Fn(&PeerAddress, &str) + Send + Sync + 'static,
{
    fn on_data(&self, sender: &PeerAddress, payload: &str) {
        self(sender, payload)
    }
}

/// Default handler: logs each payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl DataHandler for LoggingHandler {
    fn on_data(&self, sender: &PeerAddress, payload: &str) {
        info!(
            peer_id = %sender.id,
            host = %sender.host,
            port = sender.port,
            %payload,
            "Received data"
        );
    }
}
