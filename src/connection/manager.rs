//! One logical connection per remote node, with RPC multiplexing on top.
//!
//! Outbound attempts to the same peer are coalesced: the first caller spawns
//! the transport connect and the handshake, later callers wait for its
//! outcome. Simultaneous connects from both sides are resolved by the
//! responder: while its own attempt is pending it accepts the inbound
//! handshake only from a peer with a greater node id, so exactly one of the
//! two connections survives and the loser's caller is handed the winner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::facade::{ConnectOutcome, ConnectorFacade};
use super::handshake;
use super::{ConnectionBackend, ConnectionEvent, RawConnection};
use crate::config::ConnectionManagerConfig;
use crate::descriptor::PeerDescriptor;
use crate::error::{DhtError, HandshakeError, Result};
use crate::identifier::NodeId;
use crate::network::{DhtRpc, RpcHandler};
use crate::protocol::{RpcRequest, RpcResponse, WireMessage};

/// Lifecycle of the logical connection to one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Connected,
    Closed,
}

type PendingReply = oneshot::Sender<std::result::Result<RpcResponse, String>>;
type Waiter = oneshot::Sender<Option<Arc<ManagedConnection>>>;

/// An established, handshaken connection.
pub struct ManagedConnection {
    peer: PeerDescriptor,
    backend: Arc<dyn ConnectionBackend>,
    pending: StdMutex<HashMap<u64, PendingReply>>,
    last_used: StdMutex<Instant>,
    closed: AtomicBool,
}

impl ManagedConnection {
    fn new(peer: PeerDescriptor, backend: Arc<dyn ConnectionBackend>) -> Self {
        Self {
            peer,
            backend,
            pending: StdMutex::new(HashMap::new()),
            last_used: StdMutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_since(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn send_wire(&self, message: &WireMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DhtError::Unreachable("connection closed".into()));
        }
        self.backend.send(message.encode()?).await
    }

    fn register(&self, request_id: u64, reply: PendingReply) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(request_id, reply);
    }

    fn take_pending(&self, request_id: u64) -> Option<PendingReply> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&request_id)
    }

    /// Mark closed and drop every pending reply, failing its caller.
    fn shut(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
        first
    }

    async fn close(&self) {
        if self.shut() {
            self.backend.close().await;
        }
    }
}

enum PeerState {
    Connecting {
        waiters: Vec<Waiter>,
        reverse: bool,
        handshaking: bool,
    },
    Connected(Arc<ManagedConnection>),
}

fn notify_waiters(waiters: Vec<Waiter>, connection: Option<Arc<ManagedConnection>>) {
    for waiter in waiters {
        let _ = waiter.send(connection.clone());
    }
}

pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    local: PeerDescriptor,
    facade: Arc<dyn ConnectorFacade>,
    handler: StdMutex<Option<Weak<dyn RpcHandler>>>,
    peers: Mutex<HashMap<NodeId, PeerState>>,
    locks: StdMutex<HashMap<NodeId, HashMap<String, usize>>>,
    next_request_id: AtomicU64,
    stopped: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    me: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Start the facade's transports and the background loops.
    pub async fn start(
        config: ConnectionManagerConfig,
        node_id: NodeId,
        facade: Arc<dyn ConnectorFacade>,
    ) -> Result<Arc<Self>> {
        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<RawConnection>();
        let mut local = facade.start(node_id, incoming_tx).await?;
        if local.region.is_none() {
            local.region = config.region;
        }
        let gc_interval = config.gc_interval;

        let manager = Arc::new_cyclic(|me| Self {
            config,
            local,
            facade,
            handler: StdMutex::new(None),
            peers: Mutex::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
            me: me.clone(),
        });

        let weak = manager.me.clone();
        let accept_task = tokio::spawn(async move {
            while let Some(raw) = incoming_rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move { manager.accept_inbound(raw).await });
            }
        });

        let weak = manager.me.clone();
        let gc_task = tokio::spawn(async move {
            let mut ticker = interval(gc_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.collect_idle().await;
            }
        });
        manager.track(accept_task);
        manager.track(gc_task);

        info!(node = %manager.local.short_id(), "connection manager started");
        Ok(manager)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
    }

    /// Register the DHT that serves inbound requests.
    pub fn set_handler(&self, handler: Weak<dyn RpcHandler>) {
        *self.handler.lock().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn RpcHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn local(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn connection_state(&self, peer: &NodeId) -> ConnectionState {
        match self.peers.lock().await.get(peer) {
            Some(PeerState::Connecting {
                handshaking: true, ..
            }) => ConnectionState::Handshaking,
            Some(PeerState::Connecting { .. }) => ConnectionState::Connecting,
            Some(PeerState::Connected(_)) => ConnectionState::Connected,
            None => ConnectionState::Closed,
        }
    }

    pub async fn connected_peers(&self) -> Vec<PeerDescriptor> {
        self.peers
            .lock()
            .await
            .values()
            .filter_map(|state| match state {
                PeerState::Connected(connection) => Some(connection.peer.clone()),
                PeerState::Connecting { .. } => None,
            })
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.peers
            .lock()
            .await
            .values()
            .filter(|state| matches!(state, PeerState::Connected(_)))
            .count()
    }

    /// Return the connection to `peer`, establishing it if needed.
    ///
    /// The attempt runs in its own task, so a caller that gives up does not
    /// leave the peer stuck in `Connecting`.
    pub async fn connect(&self, peer: &PeerDescriptor) -> Result<Arc<ManagedConnection>> {
        if self.is_stopped() {
            return Err(DhtError::Stopped);
        }
        if peer.node_id == self.local.node_id {
            return Err(DhtError::Protocol("refusing to connect to self".into()));
        }
        let waiting = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(&peer.node_id) {
                Some(PeerState::Connected(connection)) => return Ok(connection.clone()),
                Some(PeerState::Connecting { waiters, .. }) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    peers.insert(
                        peer.node_id,
                        PeerState::Connecting {
                            waiters: Vec::new(),
                            reverse: false,
                            handshaking: false,
                        },
                    );
                    None
                }
            }
        };
        if let Some(rx) = waiting {
            return match timeout(self.attempt_budget(), rx).await {
                Ok(Ok(Some(connection))) => Ok(connection),
                Ok(_) => Err(DhtError::Unreachable(format!(
                    "connection attempt to {} failed",
                    peer.short_id()
                ))),
                Err(_) => Err(DhtError::Timeout("connection attempt")),
            };
        }

        let Some(manager) = self.me.upgrade() else {
            self.fail_attempt(&peer.node_id).await;
            return Err(DhtError::Stopped);
        };
        let target = peer.clone();
        let attempt = tokio::spawn(async move { manager.originate(&target).await });
        match timeout(self.attempt_budget(), attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(peer = %peer.short_id(), error = %err, "connection attempt aborted");
                self.fail_attempt(&peer.node_id).await;
                Err(DhtError::Unreachable(peer.short_id()))
            }
            Err(_) => Err(DhtError::Timeout("connection attempt")),
        }
    }

    /// Upper bound on one attempt: transport connect, handshake, and either a
    /// wait for the winning inbound handshake or a routed reverse request.
    fn attempt_budget(&self) -> std::time::Duration {
        self.config.handshake_timeout * 3 + self.config.rpc_timeout * 2
    }

    async fn originate(&self, peer: &PeerDescriptor) -> Result<Arc<ManagedConnection>> {
        let outcome = timeout(
            self.config.handshake_timeout,
            self.facade.connect(&self.local, peer),
        )
        .await
        .unwrap_or(Err(DhtError::Timeout("transport connect")));
        match outcome {
            Ok(ConnectOutcome::Direct(raw)) => {
                self.set_handshaking(&peer.node_id).await;
                let result = self.handshake_outbound(peer, raw).await;
                self.complete_outbound(peer, result).await
            }
            Ok(ConnectOutcome::Reverse) => self.connect_reverse(peer).await,
            Err(err) => {
                debug!(peer = %peer.short_id(), error = %err, "transport connect failed");
                self.fail_attempt(&peer.node_id).await;
                Err(err)
            }
        }
    }

    async fn set_handshaking(&self, peer: &NodeId) {
        if let Some(PeerState::Connecting { handshaking, .. }) = self.peers.lock().await.get_mut(peer) {
            *handshaking = true;
        }
    }

    async fn handshake_outbound(
        &self,
        peer: &PeerDescriptor,
        raw: RawConnection,
    ) -> Result<(Arc<ManagedConnection>, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let RawConnection { backend, mut events } = raw;
        let request = handshake::request(&self.local, peer, &self.config.protocol_version);
        let exchange = async {
            backend.send(request.encode()?).await?;
            match handshake::next_message(&mut events).await? {
                WireMessage::HandshakeResponse { source, error } => {
                    handshake::check_response(peer, &source, error)?;
                    Ok(source)
                }
                other => Err(DhtError::Protocol(format!(
                    "expected a handshake response, got {other:?}"
                ))),
            }
        };
        match timeout(self.config.handshake_timeout, exchange).await {
            Ok(Ok(responder)) => {
                trace!(peer = %responder.short_id(), "outbound handshake complete");
                Ok((Arc::new(ManagedConnection::new(responder, backend)), events))
            }
            Ok(Err(err)) => {
                backend.close().await;
                Err(err)
            }
            Err(_) => {
                backend.close().await;
                Err(DhtError::Timeout("handshake"))
            }
        }
    }

    async fn complete_outbound(
        &self,
        peer: &PeerDescriptor,
        result: Result<(Arc<ManagedConnection>, mpsc::UnboundedReceiver<ConnectionEvent>)>,
    ) -> Result<Arc<ManagedConnection>> {
        match result {
            Ok((connection, events)) => {
                if self.is_stopped() {
                    connection.close().await;
                    return Err(DhtError::Stopped);
                }
                let waiters = {
                    let mut peers = self.peers.lock().await;
                    if let Some(PeerState::Connected(existing)) = peers.get(&peer.node_id) {
                        let existing = existing.clone();
                        drop(peers);
                        connection.close().await;
                        return Ok(existing);
                    }
                    match peers.insert(peer.node_id, PeerState::Connected(connection.clone())) {
                        Some(PeerState::Connecting { waiters, .. }) => waiters,
                        _ => Vec::new(),
                    }
                };
                notify_waiters(waiters, Some(connection.clone()));
                self.established(connection.clone(), events).await;
                Ok(connection)
            }
            Err(DhtError::Handshake(HandshakeError::DuplicateConnection)) => {
                debug!(peer = %peer.short_id(), "duplicate connection, waiting for the inbound one");
                self.await_inbound(peer, self.config.handshake_timeout)
                    .await
                    .map_err(|_| DhtError::Handshake(HandshakeError::DuplicateConnection))
            }
            Err(err) => {
                debug!(peer = %peer.short_id(), error = %err, "outbound connection failed");
                self.fail_attempt(&peer.node_id).await;
                Err(err)
            }
        }
    }

    /// Ask `peer` through the overlay to dial us and wait for it to do so.
    async fn connect_reverse(&self, peer: &PeerDescriptor) -> Result<Arc<ManagedConnection>> {
        let rx = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(&peer.node_id) {
                Some(PeerState::Connected(connection)) => return Ok(connection.clone()),
                Some(PeerState::Connecting { waiters, reverse, .. }) => {
                    *reverse = true;
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => return Err(DhtError::Unreachable("connection attempt abandoned".into())),
            }
        };
        let Some(handler) = self.handler() else {
            self.fail_attempt(&peer.node_id).await;
            return Err(DhtError::Unreachable("no handler to route a connection request".into()));
        };
        debug!(peer = %peer.short_id(), "requesting reverse connection");
        if let Err(err) = handler.route_connection_request(peer, &self.local).await {
            self.fail_attempt(&peer.node_id).await;
            return Err(err);
        }
        match timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(Some(connection))) => Ok(connection),
            Ok(_) => Err(DhtError::Unreachable(peer.short_id())),
            Err(_) => {
                self.fail_attempt(&peer.node_id).await;
                Err(DhtError::Timeout("reverse connection"))
            }
        }
    }

    /// Wait until an inbound handshake resolves the pending entry for `peer`.
    async fn await_inbound(
        &self,
        peer: &PeerDescriptor,
        within: std::time::Duration,
    ) -> Result<Arc<ManagedConnection>> {
        let rx = {
            let mut peers = self.peers.lock().await;
            match peers.get_mut(&peer.node_id) {
                Some(PeerState::Connected(connection)) => return Ok(connection.clone()),
                Some(PeerState::Connecting { waiters, .. }) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => return Err(DhtError::Unreachable("connection attempt abandoned".into())),
            }
        };
        match timeout(within, rx).await {
            Ok(Ok(Some(connection))) => Ok(connection),
            Ok(_) => Err(DhtError::Unreachable(peer.short_id())),
            Err(_) => {
                self.fail_attempt(&peer.node_id).await;
                Err(DhtError::Timeout("inbound connection"))
            }
        }
    }

    /// Drop a pending attempt and fail everyone waiting on it.
    async fn fail_attempt(&self, peer: &NodeId) {
        let waiters = {
            let mut peers = self.peers.lock().await;
            match peers.get(peer) {
                Some(PeerState::Connecting { .. }) => match peers.remove(peer) {
                    Some(PeerState::Connecting { waiters, .. }) => waiters,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            }
        };
        notify_waiters(waiters, None);
    }

    async fn accept_inbound(self: Arc<Self>, raw: RawConnection) {
        let RawConnection { backend, mut events } = raw;
        let first = timeout(
            self.config.handshake_timeout,
            handshake::next_message(&mut events),
        )
        .await;
        let (source, target, version) = match first {
            Ok(Ok(WireMessage::HandshakeRequest {
                source,
                target,
                protocol_version,
            })) => (source, target, protocol_version),
            Ok(Ok(other)) => {
                debug!(message = ?other, "inbound connection did not start with a handshake");
                backend.close().await;
                return;
            }
            Ok(Err(err)) => {
                trace!(error = %err, "inbound handshake failed");
                backend.close().await;
                return;
            }
            Err(_) => {
                trace!("inbound handshake timed out");
                backend.close().await;
                return;
            }
        };
        if self.is_stopped() {
            backend.close().await;
            return;
        }

        let local = &self.local;
        if let Err(error) =
            handshake::check_request(local, &self.config.protocol_version, &version, target.as_ref())
        {
            debug!(peer = %source.short_id(), %error, "rejecting inbound handshake");
            self.reject(&backend, error).await;
            return;
        }

        let reserved = {
            let mut peers = self.peers.lock().await;
            let decision = match peers.get(&source.node_id) {
                Some(PeerState::Connected(_)) => Err(HandshakeError::DuplicateConnection),
                Some(PeerState::Connecting { reverse: true, .. }) => Ok(false),
                Some(PeerState::Connecting { .. }) if source.node_id > local.node_id => Ok(false),
                Some(PeerState::Connecting { .. }) => Err(HandshakeError::DuplicateConnection),
                None => Ok(true),
            };
            if let Ok(true) = decision {
                // hold the slot so local connects wait for this handshake
                peers.insert(
                    source.node_id,
                    PeerState::Connecting {
                        waiters: Vec::new(),
                        reverse: false,
                        handshaking: true,
                    },
                );
            }
            match decision {
                Ok(reserved) => reserved,
                Err(error) => {
                    drop(peers);
                    debug!(peer = %source.short_id(), %error, "rejecting inbound handshake");
                    self.reject(&backend, error).await;
                    return;
                }
            }
        };

        let sent = match handshake::response(local, None).encode() {
            Ok(bytes) => timeout(self.config.handshake_timeout, backend.send(bytes))
                .await
                .unwrap_or(Err(DhtError::Timeout("handshake response"))),
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            debug!(peer = %source.short_id(), error = %err, "handshake response failed");
            if reserved {
                self.fail_attempt(&source.node_id).await;
            }
            backend.close().await;
            return;
        }

        let connection = Arc::new(ManagedConnection::new(source.clone(), backend.clone()));
        let waiters = {
            let mut peers = self.peers.lock().await;
            if self.is_stopped() || matches!(peers.get(&source.node_id), Some(PeerState::Connected(_))) {
                drop(peers);
                debug!(peer = %source.short_id(), "inbound connection superseded");
                backend.close().await;
                return;
            }
            match peers.insert(source.node_id, PeerState::Connected(connection.clone())) {
                Some(PeerState::Connecting { waiters, .. }) => waiters,
                _ => Vec::new(),
            }
        };
        trace!(peer = %source.short_id(), "inbound handshake complete");
        notify_waiters(waiters, Some(connection.clone()));
        self.established(connection, events).await;
    }

    async fn reject(&self, backend: &Arc<dyn ConnectionBackend>, error: HandshakeError) {
        if let Ok(bytes) = handshake::response(&self.local, Some(error)).encode() {
            let _ = backend.send(bytes).await;
        }
        backend.close().await;
    }

    /// Start the reader for a freshly registered connection.
    async fn established(
        &self,
        connection: Arc<ManagedConnection>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let weak = self.me.clone();
        let reader_connection = connection.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let ConnectionEvent::Data(bytes) = event else {
                    break;
                };
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                manager.on_wire_data(&reader_connection, &bytes);
            }
            if let Some(manager) = weak.upgrade() {
                manager.on_transport_closed(&reader_connection).await;
            }
        });
        if let Some(handler) = self.handler() {
            handler.on_connected(&connection.peer).await;
        }
    }

    fn on_wire_data(&self, connection: &Arc<ManagedConnection>, bytes: &[u8]) {
        connection.touch();
        let message = match WireMessage::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(peer = %connection.peer.short_id(), error = %err, "undecodable message");
                return;
            }
        };
        match message {
            WireMessage::Request { request_id, body } => {
                let handler = self.handler();
                let connection = connection.clone();
                tokio::spawn(async move {
                    trace!(peer = %connection.peer.short_id(), request = body.name(), "serving request");
                    let result = match handler {
                        Some(handler) => handler
                            .handle_request(&connection.peer, body)
                            .await
                            .map_err(|err| err.to_string()),
                        None => Err("no request handler".to_string()),
                    };
                    let reply = WireMessage::Response {
                        request_id,
                        body: result,
                    };
                    if let Err(err) = connection.send_wire(&reply).await {
                        trace!(peer = %connection.peer.short_id(), error = %err, "response not sent");
                    }
                });
            }
            WireMessage::Response { request_id, body } => match connection.take_pending(request_id) {
                Some(reply) => {
                    let _ = reply.send(body);
                }
                None => trace!(request_id, "response for an unknown request"),
            },
            WireMessage::Notification { body } => {
                let Some(handler) = self.handler() else {
                    return;
                };
                let peer = connection.peer.clone();
                tokio::spawn(async move {
                    if let Err(err) = handler.handle_request(&peer, body).await {
                        trace!(peer = %peer.short_id(), error = %err, "notification failed");
                    }
                });
            }
            WireMessage::HandshakeRequest { .. } | WireMessage::HandshakeResponse { .. } => {
                debug!(peer = %connection.peer.short_id(), "handshake on an established connection");
            }
        }
    }

    async fn on_transport_closed(&self, connection: &Arc<ManagedConnection>) {
        let was_current = self.forget(connection).await;
        connection.close().await;
        if was_current {
            debug!(peer = %connection.peer.short_id(), "peer disconnected");
            if let Some(handler) = self.handler() {
                handler.on_disconnected(&connection.peer).await;
            }
        }
    }

    /// Remove `connection` if it is still the registered one for its peer.
    async fn forget(&self, connection: &Arc<ManagedConnection>) -> bool {
        let mut peers = self.peers.lock().await;
        let current = matches!(
            peers.get(&connection.peer.node_id),
            Some(PeerState::Connected(existing)) if Arc::ptr_eq(existing, connection)
        );
        if current {
            peers.remove(&connection.peer.node_id);
        }
        current
    }

    /// Close the connection to `peer`, if any.
    pub async fn close_connection(&self, peer: &NodeId) {
        let removed = match self.peers.lock().await.remove(peer) {
            Some(PeerState::Connected(connection)) => Some(connection),
            Some(PeerState::Connecting { waiters, .. }) => {
                notify_waiters(waiters, None);
                None
            }
            None => None,
        };
        if let Some(connection) = removed {
            connection.close().await;
            if let Some(handler) = self.handler() {
                handler.on_disconnected(&connection.peer).await;
            }
        }
    }

    /// Send one request and wait for its response.
    pub async fn request(&self, to: &PeerDescriptor, body: RpcRequest) -> Result<RpcResponse> {
        if self.is_stopped() {
            return Err(DhtError::Stopped);
        }
        let connection = self.connect(to).await?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        connection.register(request_id, tx);
        connection.touch();
        trace!(peer = %to.short_id(), request = body.name(), request_id, "sending request");
        if let Err(err) = connection
            .send_wire(&WireMessage::Request { request_id, body })
            .await
        {
            connection.take_pending(request_id);
            return Err(err);
        }
        match timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(remote))) => Err(DhtError::Remote(remote)),
            Ok(Err(_)) => Err(DhtError::Unreachable(format!(
                "connection to {} closed",
                to.short_id()
            ))),
            Err(_) => {
                connection.take_pending(request_id);
                Err(DhtError::Timeout("rpc"))
            }
        }
    }

    /// Fire-and-forget message over an existing or new connection.
    pub async fn notify(&self, to: &PeerDescriptor, body: RpcRequest) -> Result<()> {
        let connection = self.connect(to).await?;
        connection.touch();
        connection
            .send_wire(&WireMessage::Notification { body })
            .await
    }

    /// Take a lock on the connection to `peer` for `reason`, connecting if
    /// needed. A failed connect leaves the lock in place.
    pub async fn lock(&self, peer: &PeerDescriptor, reason: &str) {
        if self.is_stopped() || peer.node_id == self.local.node_id {
            return;
        }
        {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            *locks
                .entry(peer.node_id)
                .or_default()
                .entry(reason.to_string())
                .or_insert(0) += 1;
        }
        if let Err(err) = self.connect(peer).await {
            debug!(peer = %peer.short_id(), reason, error = %err, "could not connect locked peer");
        }
    }

    pub fn unlock(&self, peer: &NodeId, reason: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let Some(reasons) = locks.get_mut(peer) else {
            return;
        };
        if let Some(count) = reasons.get_mut(reason) {
            *count -= 1;
            if *count == 0 {
                reasons.remove(reason);
            }
        }
        if reasons.is_empty() {
            locks.remove(peer);
        }
    }

    pub fn is_locked(&self, peer: &NodeId) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(peer)
    }

    /// Total number of locks held on `peer` across all reasons.
    pub fn lock_count(&self, peer: &NodeId) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(peer)
            .map(|reasons| reasons.values().sum())
            .unwrap_or(0)
    }

    /// Close unlocked connections unused for longer than `idle_timeout`.
    pub async fn collect_idle(&self) {
        if self.is_stopped() {
            return;
        }
        let now = Instant::now();
        let idle: Vec<NodeId> = self
            .peers
            .lock()
            .await
            .iter()
            .filter_map(|(id, state)| match state {
                PeerState::Connected(connection)
                    if now.duration_since(connection.idle_since()) >= self.config.idle_timeout =>
                {
                    Some(*id)
                }
                _ => None,
            })
            .filter(|id| !self.is_locked(id))
            .collect();
        for peer in idle {
            trace!(peer = %crate::identifier::short_id(&peer), "closing idle connection");
            self.close_connection(&peer).await;
        }
    }

    /// Say goodbye to connected peers, close everything and stop the
    /// transports. Later requests fail with [`DhtError::Stopped`].
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let connections: Vec<Arc<ManagedConnection>> = {
            let mut peers = self.peers.lock().await;
            peers
                .drain()
                .filter_map(|(_, state)| match state {
                    PeerState::Connected(connection) => Some(connection),
                    PeerState::Connecting { waiters, .. } => {
                        notify_waiters(waiters, None);
                        None
                    }
                })
                .collect()
        };
        info!(connections = connections.len(), "stopping connection manager");
        join_all(connections.iter().map(|connection| async move {
            let leave = WireMessage::Notification {
                body: RpcRequest::Leave,
            };
            let _ = connection.send_wire(&leave).await;
            connection.close().await;
        }))
        .await;
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).clear();
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
        self.facade.stop().await;
    }
}

#[async_trait]
impl DhtRpc for ConnectionManager {
    fn local_peer(&self) -> PeerDescriptor {
        self.local.clone()
    }

    async fn call(&self, to: &PeerDescriptor, request: RpcRequest) -> Result<RpcResponse> {
        self.request(to, request).await
    }

    async fn lock_connection(&self, peer: &PeerDescriptor, reason: &str) {
        self.lock(peer, reason).await;
    }

    async fn unlock_connection(&self, peer: &PeerDescriptor, reason: &str) {
        self.unlock(&peer.node_id, reason);
    }

    async fn accept_connection_request(&self, requester: &PeerDescriptor) -> bool {
        if self.is_stopped() || requester.websocket.is_none() {
            return false;
        }
        let Some(manager) = self.me.upgrade() else {
            return false;
        };
        let requester = requester.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.connect(&requester).await {
                debug!(peer = %requester.short_id(), error = %err, "dialing back requester failed");
            }
        });
        true
    }

    async fn stop(&self) {
        ConnectionManager::stop(self).await;
    }
}
