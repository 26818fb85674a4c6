//! Transport selection and the facades that own the transports.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tracing::{debug, info};

use super::connectivity::check_connectivity;
use super::quic::QuicTransport;
use super::websocket::{self, WebSocketServer};
use super::{IncomingSender, RawConnection};
use crate::config::ConnectionManagerConfig;
use crate::descriptor::{NodeType, PeerDescriptor};
use crate::error::{DhtError, Result};
use crate::identifier::NodeId;
use crate::simulator::Simulator;

const BIND_HOST: &str = "0.0.0.0";

/// How to reach a peer, given what both sides advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportChoice {
    WebSocketClient,
    NatTraversal,
    /// Ask the target, through the overlay, to dial our WebSocket server.
    WebSocketReverse,
    Unreachable,
}

/// WebSocket whenever either side can accept one, NAT traversal only when
/// both sides run an endpoint for it.
pub fn select_transport(local: &PeerDescriptor, target: &PeerDescriptor) -> TransportChoice {
    if target.websocket.is_some() {
        TransportChoice::WebSocketClient
    } else if local.websocket.is_some() {
        TransportChoice::WebSocketReverse
    } else if target.nat_addr.is_some() && local.nat_addr.is_some() {
        TransportChoice::NatTraversal
    } else {
        TransportChoice::Unreachable
    }
}

/// Result of asking a facade for a connection.
pub enum ConnectOutcome {
    Direct(RawConnection),
    /// The connection will arrive as an inbound one once the target dials us.
    Reverse,
}

/// Owns the transports of one node.
#[async_trait]
pub trait ConnectorFacade: Send + Sync + 'static {
    /// Start accepting connections into `incoming` and return the local
    /// descriptor to advertise.
    async fn start(&self, node_id: NodeId, incoming: IncomingSender) -> Result<PeerDescriptor>;

    async fn connect(&self, local: &PeerDescriptor, target: &PeerDescriptor) -> Result<ConnectOutcome>;

    async fn stop(&self);
}

struct RunningTransports {
    websocket: Option<WebSocketServer>,
    quic: Option<Arc<QuicTransport>>,
}

/// WebSocket server and client plus the optional NAT-traversing endpoint.
pub struct DefaultConnectorFacade {
    config: ConnectionManagerConfig,
    running: StdMutex<Option<RunningTransports>>,
}

impl DefaultConnectorFacade {
    pub fn new(config: ConnectionManagerConfig) -> Self {
        Self {
            config,
            running: StdMutex::new(None),
        }
    }

    fn quic(&self) -> Option<Arc<QuicTransport>> {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(|r| r.quic.clone())
    }
}

#[async_trait]
impl ConnectorFacade for DefaultConnectorFacade {
    async fn start(&self, node_id: NodeId, incoming: IncomingSender) -> Result<PeerDescriptor> {
        let mut local = PeerDescriptor::new(node_id);
        local.node_type = NodeType::Native;
        local.region = self.config.region;

        let websocket = match self.config.websocket_port_range {
            Some(range) => {
                let server = WebSocketServer::start(BIND_HOST, range, incoming.clone()).await?;
                let connectivity = check_connectivity(&self.config, server.port()).await;
                local.websocket = connectivity.websocket;
                Some(server)
            }
            None => None,
        };

        let quic = if self.config.nat_traversal {
            let transport = QuicTransport::bind(incoming).await?;
            local.nat_addr = Some(transport.local_addr()?);
            Some(Arc::new(transport))
        } else {
            None
        };

        info!(
            node = %local.short_id(),
            websocket = ?local.websocket.as_ref().map(|w| w.url()),
            nat_traversal = local.nat_addr.is_some(),
            "connector facade started"
        );
        *self.running.lock().unwrap_or_else(|p| p.into_inner()) = Some(RunningTransports { websocket, quic });
        Ok(local)
    }

    async fn connect(&self, local: &PeerDescriptor, target: &PeerDescriptor) -> Result<ConnectOutcome> {
        let choice = select_transport(local, target);
        debug!(peer = %target.short_id(), ?choice, "connecting");
        match choice {
            TransportChoice::WebSocketClient => {
                let Some(method) = target.websocket.as_ref() else {
                    return Err(DhtError::Unreachable(target.short_id()));
                };
                let raw = websocket::connect(&method.url(), self.config.handshake_timeout).await?;
                Ok(ConnectOutcome::Direct(raw))
            }
            TransportChoice::NatTraversal => {
                let Some(quic) = self.quic() else {
                    return Err(DhtError::Unreachable("NAT traversal is not enabled".into()));
                };
                let raw = quic.connect(target, self.config.handshake_timeout).await?;
                Ok(ConnectOutcome::Direct(raw))
            }
            TransportChoice::WebSocketReverse => Ok(ConnectOutcome::Reverse),
            TransportChoice::Unreachable => Err(DhtError::Unreachable(format!(
                "no transport reaches {}",
                target.short_id()
            ))),
        }
    }

    async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(running) = running {
            if let Some(server) = running.websocket {
                server.stop();
            }
            if let Some(quic) = running.quic {
                quic.shutdown().await;
            }
        }
    }
}

/// Attaches a node to a [`Simulator`].
pub struct SimulatorConnectorFacade {
    simulator: Arc<Simulator>,
    region: Option<u32>,
    node_id: StdMutex<Option<NodeId>>,
}

impl SimulatorConnectorFacade {
    pub fn new(simulator: Arc<Simulator>, region: Option<u32>) -> Self {
        Self {
            simulator,
            region,
            node_id: StdMutex::new(None),
        }
    }
}

#[async_trait]
impl ConnectorFacade for SimulatorConnectorFacade {
    async fn start(&self, node_id: NodeId, incoming: IncomingSender) -> Result<PeerDescriptor> {
        if self.simulator.is_stopped() {
            return Err(DhtError::Stopped);
        }
        self.simulator.add_connector(node_id, self.region, incoming);
        *self.node_id.lock().unwrap_or_else(|p| p.into_inner()) = Some(node_id);
        let mut local = PeerDescriptor::new(node_id);
        local.region = self.region;
        Ok(local)
    }

    async fn connect(&self, local: &PeerDescriptor, target: &PeerDescriptor) -> Result<ConnectOutcome> {
        let raw = self
            .simulator
            .connect(local.node_id, local.region, target)
            .await?;
        Ok(ConnectOutcome::Direct(raw))
    }

    async fn stop(&self) {
        let node_id = self.node_id.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(node_id) = node_id {
            self.simulator.remove_connector(&node_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ConnectivityMethod;

    fn ws() -> ConnectivityMethod {
        ConnectivityMethod {
            host: "127.0.0.1".into(),
            port: 4000,
            tls: false,
        }
    }

    #[test]
    fn target_websocket_is_preferred() {
        let local = PeerDescriptor::new([1u8; 32]);
        let mut target = PeerDescriptor::new([2u8; 32]).with_websocket(ws());
        target.nat_addr = Some("{}".into());
        assert_eq!(select_transport(&local, &target), TransportChoice::WebSocketClient);
    }

    #[test]
    fn nat_traversal_needs_both_endpoints() {
        let mut local = PeerDescriptor::new([1u8; 32]);
        let mut target = PeerDescriptor::new([2u8; 32]);
        target.nat_addr = Some("{}".into());
        assert_eq!(select_transport(&local, &target), TransportChoice::Unreachable);
        local.nat_addr = Some("{}".into());
        assert_eq!(select_transport(&local, &target), TransportChoice::NatTraversal);
    }

    #[test]
    fn reachable_local_server_beats_nat_traversal() {
        let mut local = PeerDescriptor::new([1u8; 32]).with_websocket(ws());
        local.nat_addr = Some("{}".into());
        let mut target = PeerDescriptor::new([2u8; 32]);
        target.nat_addr = Some("{}".into());
        assert_eq!(select_transport(&local, &target), TransportChoice::WebSocketReverse);
    }

    #[test]
    fn private_target_is_asked_to_dial_back() {
        let local = PeerDescriptor::new([1u8; 32]).with_websocket(ws());
        let target = PeerDescriptor::new([2u8; 32]);
        assert_eq!(select_transport(&local, &target), TransportChoice::WebSocketReverse);
    }

    #[test]
    fn nothing_advertised_is_unreachable() {
        let local = PeerDescriptor::new([1u8; 32]);
        let target = PeerDescriptor::new([2u8; 32]);
        assert_eq!(select_transport(&local, &target), TransportChoice::Unreachable);
    }
}
