//! NAT-traversing transport on an iroh QUIC endpoint.
//!
//! iroh handles hole punching and relay fallback. Each DHT connection is one
//! QUIC connection negotiated with [`DHT_ALPN`] carrying a single
//! bi-directional stream of length-prefixed frames. Peers advertise their
//! JSON-serialised [`EndpointAddr`] in [`PeerDescriptor::nat_addr`].

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, RelayMode};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{ConnectionBackend, ConnectionEvent, IncomingSender, RawConnection};
use crate::descriptor::PeerDescriptor;
use crate::error::{DhtError, Result};
use crate::framing::{read_frame, write_frame};

/// ALPN protocol identifier for DHT connections.
pub const DHT_ALPN: &[u8] = b"mesh-dht/1";

struct QuicBackend {
    connection: Connection,
    send: Mutex<SendStream>,
}

#[async_trait]
impl ConnectionBackend for QuicBackend {
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        let mut send = self.send.lock().await;
        write_frame(&mut *send, &data)
            .await
            .map_err(|err| DhtError::Unreachable(format!("quic send failed: {err}")))
    }

    async fn close(&self) {
        let _ = self.send.lock().await.finish();
        self.connection.close(0u32.into(), b"closed");
    }
}

fn into_raw(connection: Connection, send: SendStream, recv: RecvStream) -> RawConnection {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_loop(recv, events_tx));
    let backend = QuicBackend {
        connection,
        send: Mutex::new(send),
    };
    RawConnection::new(std::sync::Arc::new(backend), events_rx)
}

async fn read_loop(mut recv: RecvStream, events: mpsc::UnboundedSender<ConnectionEvent>) {
    loop {
        match read_frame(&mut recv).await {
            Ok(Some(frame)) => {
                if events.send(ConnectionEvent::Data(frame)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                trace!(error = %err, "quic read failed");
                break;
            }
        }
    }
    let _ = events.send(ConnectionEvent::Disconnected);
}

/// Router entry point for inbound [`DHT_ALPN`] connections.
#[derive(Clone)]
struct DhtProtocolHandler {
    incoming: IncomingSender,
}

impl fmt::Debug for DhtProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtProtocolHandler").finish()
    }
}

impl ProtocolHandler for DhtProtocolHandler {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = std::result::Result<(), AcceptError>> + Send {
        let incoming = self.incoming.clone();
        async move {
            let (send, recv) = connection
                .accept_bi()
                .await
                .map_err(|err| AcceptError::from_err(io::Error::new(io::ErrorKind::Other, err)))?;
            let closed = connection.clone();
            incoming
                .send(into_raw(connection, send, recv))
                .map_err(|_| {
                    AcceptError::from_err(io::Error::new(io::ErrorKind::Other, "manager stopped"))
                })?;
            // Keep the handler alive for as long as the connection is.
            closed.closed().await;
            Ok(())
        }
    }
}

/// A bound iroh endpoint accepting DHT connections.
pub struct QuicTransport {
    endpoint: Endpoint,
    router: Router,
}

impl QuicTransport {
    pub async fn bind(incoming: IncomingSender) -> Result<Self> {
        let endpoint = Endpoint::builder()
            .alpns(vec![DHT_ALPN.to_vec()])
            .relay_mode(RelayMode::Default)
            .bind()
            .await
            .map_err(|err| DhtError::Configuration(format!("iroh endpoint: {err}")))?;
        let router = Router::builder(endpoint.clone())
            .accept(DHT_ALPN, DhtProtocolHandler { incoming })
            .spawn();
        debug!(endpoint = %endpoint.id(), "quic endpoint bound");
        Ok(Self { endpoint, router })
    }

    /// JSON form of the local address, as advertised in descriptors.
    pub fn local_addr(&self) -> Result<String> {
        let addr: EndpointAddr = self.endpoint.addr();
        Ok(serde_json::to_string(&addr)?)
    }

    pub async fn connect(&self, target: &PeerDescriptor, connect_timeout: Duration) -> Result<RawConnection> {
        let Some(raw_addr) = target.nat_addr.as_deref() else {
            return Err(DhtError::Unreachable(format!(
                "{} has no NAT traversal address",
                target.short_id()
            )));
        };
        let addr: EndpointAddr = serde_json::from_str(raw_addr)?;
        let dial = async {
            let connection = self
                .endpoint
                .connect(addr, DHT_ALPN)
                .await
                .map_err(|err| DhtError::Unreachable(format!("quic connect: {err}")))?;
            let (send, recv) = connection
                .open_bi()
                .await
                .map_err(|err| DhtError::Unreachable(format!("quic open stream: {err}")))?;
            Ok::<_, DhtError>(into_raw(connection, send, recv))
        };
        timeout(connect_timeout, dial)
            .await
            .map_err(|_| DhtError::Timeout("quic connect"))?
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.router.shutdown().await {
            debug!(error = %err, "quic router shutdown failed");
        }
        self.endpoint.close().await;
    }
}
