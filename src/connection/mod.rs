//! Connections between peers and the transports that carry them.
//!
//! Every transport produces a [`RawConnection`]: a backend that can send and
//! close plus a receiver of [`ConnectionEvent`]s. The
//! [`ConnectionManager`] runs the handshake on top of that and multiplexes
//! RPCs over the result, one logical connection per remote node.
//!
//! - [`websocket`]: client and server over `tokio-tungstenite`.
//! - [`quic`]: NAT-traversing transport on an `iroh` endpoint.
//! - [`crate::simulator`]: in-memory transport with modelled latency.
//!
//! Which transport is used for a given peer is decided by
//! [`select_transport`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod connectivity;
pub mod facade;
pub mod handshake;
pub mod manager;
pub mod quic;
pub mod websocket;

pub use facade::{
    select_transport, ConnectOutcome, ConnectorFacade, DefaultConnectorFacade,
    SimulatorConnectorFacade, TransportChoice,
};
pub use manager::{ConnectionManager, ConnectionState};

/// What a transport reports about an open connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    Data(Vec<u8>),
    Disconnected,
}

/// Sending half of a transport connection.
#[async_trait]
pub trait ConnectionBackend: Send + Sync + 'static {
    async fn send(&self, data: Vec<u8>) -> Result<()>;

    async fn close(&self);
}

/// A transport connection before the handshake.
pub struct RawConnection {
    pub backend: std::sync::Arc<dyn ConnectionBackend>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl RawConnection {
    /// Wrap a backend and the receiver its reader task feeds.
    pub fn new(
        backend: std::sync::Arc<dyn ConnectionBackend>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self { backend, events }
    }
}

/// Channel on which transports hand inbound connections to the manager.
pub type IncomingSender = mpsc::UnboundedSender<RawConnection>;
