//! WebSocket transport over `tokio-tungstenite`.
//!
//! The server answers three kinds of upgrade requests, told apart by the
//! query string: plain DHT connections, `connectivityRequest` (an entry
//! point is asked to probe the caller back) and `connectivityProbe` (the
//! probe itself, closed right after the upgrade).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{debug, trace, warn};

use super::{ConnectionBackend, ConnectionEvent, IncomingSender, RawConnection};
use crate::config::PortRange;
use crate::descriptor::{ConnectivityResponse, NatType};
use crate::error::{DhtError, Result};
use crate::protocol::{probed_websocket, ConnectivityRequest};

pub const CONNECTIVITY_REQUEST_QUERY: &str = "connectivityRequest";
pub const CONNECTIVITY_PROBE_QUERY: &str = "connectivityProbe";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sending half of a WebSocket, shared by client and server connections.
struct WebSocketBackend<S> {
    sink: Mutex<S>,
}

#[async_trait]
impl<S> ConnectionBackend for WebSocketBackend<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(data))
            .await
            .map_err(|err| DhtError::Unreachable(format!("websocket send failed: {err}")))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

/// Split `socket` into a [`RawConnection`] and spawn its reader.
fn into_raw<T>(socket: WebSocketStream<T>) -> RawConnection
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_loop(stream, events_tx));
    let backend: Arc<dyn ConnectionBackend> = Arc::new(WebSocketBackend::<SplitSink<_, Message>> {
        sink: Mutex::new(sink),
    });
    RawConnection::new(backend, events_rx)
}

async fn read_loop<S>(mut stream: S, events: mpsc::UnboundedSender<ConnectionEvent>)
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                trace!(error = %err, "websocket read failed");
                break;
            }
        };
        if events.send(ConnectionEvent::Data(data)).is_err() {
            return;
        }
    }
    let _ = events.send(ConnectionEvent::Disconnected);
}

/// Dial `url` and return the connection before the DHT handshake.
pub async fn connect(url: &str, connect_timeout: Duration) -> Result<RawConnection> {
    let (socket, _) = timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| DhtError::Timeout("websocket connect"))?
        .map_err(|err| DhtError::Unreachable(format!("{url}: {err}")))?;
    trace!(url, "websocket connected");
    Ok(into_raw(socket))
}

/// Ask the entry point at `url` to probe our server on `request.port`.
pub async fn request_connectivity(
    url: &str,
    request: &ConnectivityRequest,
    request_timeout: Duration,
) -> Result<ConnectivityResponse> {
    let url = format!("{url}/?{CONNECTIVITY_REQUEST_QUERY}");
    let exchange = async {
        let (mut socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| DhtError::Unreachable(format!("{url}: {err}")))?;
        let body = serde_json::to_vec(request)?;
        socket
            .send(Message::Binary(body))
            .await
            .map_err(|err| DhtError::Unreachable(err.to_string()))?;
        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    let _ = socket.close(None).await;
                    return Ok(serde_json::from_slice(&data)?);
                }
                Ok(Message::Text(text)) => {
                    let _ = socket.close(None).await;
                    return Ok(serde_json::from_str(&text)?);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => return Err(DhtError::Unreachable(err.to_string())),
            }
        }
        Err(DhtError::Protocol("connectivity check closed without an answer".into()))
    };
    timeout(request_timeout, exchange)
        .await
        .map_err(|_| DhtError::Timeout("connectivity request"))?
}

/// Listening WebSocket server.
pub struct WebSocketServer {
    port: u16,
    accept_task: JoinHandle<()>,
}

impl WebSocketServer {
    /// Bind the first free port of `range` on `bind_host`.
    pub async fn start(bind_host: &str, range: PortRange, incoming: IncomingSender) -> Result<Self> {
        let mut last_error = None;
        for port in range.min..=range.max {
            match TcpListener::bind((bind_host, port)).await {
                Ok(listener) => {
                    let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    debug!(port, "websocket server listening");
                    let accept_task = tokio::spawn(accept_loop(listener, incoming));
                    return Ok(Self { port, accept_task });
                }
                Err(err) => {
                    trace!(port, error = %err, "port unavailable");
                    last_error = Some(err);
                }
            }
        }
        Err(match last_error {
            Some(err) => DhtError::Io(err),
            None => DhtError::Configuration(format!(
                "empty websocket port range {}..={}",
                range.min, range.max
            )),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, incoming: IncomingSender) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "websocket accept failed");
                continue;
            }
        };
        let incoming = incoming.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(stream, remote, incoming).await {
                trace!(%remote, error = %err, "inbound websocket dropped");
            }
        });
    }
}

async fn serve(stream: TcpStream, remote: SocketAddr, incoming: IncomingSender) -> Result<()> {
    let mut query = None;
    let capture_query = |request: &Request,
                         response: Response|
     -> std::result::Result<Response, ErrorResponse> {
        query = request.uri().query().map(str::to_string);
        Ok(response)
    };
    let socket = accept_hdr_async(stream, capture_query)
    .await
    .map_err(|err| DhtError::Unreachable(format!("websocket upgrade failed: {err}")))?;

    match query.as_deref() {
        Some(q) if q.starts_with(CONNECTIVITY_REQUEST_QUERY) => {
            answer_connectivity_request(socket, remote).await
        }
        Some(q) if q.starts_with(CONNECTIVITY_PROBE_QUERY) => {
            let mut socket = socket;
            let _ = socket.close(None).await;
            Ok(())
        }
        _ => incoming
            .send(into_raw(socket))
            .map_err(|_| DhtError::Stopped),
    }
}

/// Entry-point side of the connectivity check.
async fn answer_connectivity_request(
    mut socket: WebSocketStream<TcpStream>,
    remote: SocketAddr,
) -> Result<()> {
    let request: ConnectivityRequest = loop {
        match socket.next().await {
            Some(Ok(Message::Binary(data))) => break serde_json::from_slice(&data)?,
            Some(Ok(Message::Text(text))) => break serde_json::from_str(&text)?,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(DhtError::Unreachable(err.to_string())),
        }
    };

    let observed = remote.ip().to_string();
    let method = probed_websocket(&observed, &request);
    let probe_url = format!("{}/?{CONNECTIVITY_PROBE_QUERY}", method.url());
    let reachable = match timeout(PROBE_TIMEOUT, connect_async(probe_url.as_str())).await {
        Ok(Ok((mut probe, _))) => {
            let _ = probe.close(None).await;
            true
        }
        Ok(Err(err)) => {
            debug!(url = %probe_url, error = %err, "connectivity probe failed");
            false
        }
        Err(_) => false,
    };

    let response = if reachable {
        ConnectivityResponse {
            open_internet: true,
            host: observed,
            nat_type: NatType::OpenInternet,
            websocket: Some(method),
        }
    } else {
        ConnectivityResponse {
            host: observed,
            ..ConnectivityResponse::unknown()
        }
    };
    socket
        .send(Message::Binary(serde_json::to_vec(&response)?))
        .await
        .map_err(|err| DhtError::Unreachable(err.to_string()))?;
    let _ = socket.close(None).await;
    Ok(())
}
