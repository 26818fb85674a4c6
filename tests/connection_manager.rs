use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mesh_dht::connection::{
    ConnectOutcome, ConnectionBackend, ConnectionEvent, ConnectionState, ConnectorFacade,
    IncomingSender, RawConnection, SimulatorConnectorFacade,
};
use mesh_dht::protocol::{RpcRequest, RpcResponse, WireMessage};
use mesh_dht::{
    ConnectionManager, ConnectionManagerConfig, DhtError, HandshakeError, LatencyType, NodeId,
    PeerDescriptor, RpcHandler, Simulator,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Answers pings and records what the manager hands it.
#[derive(Default)]
struct Recorder {
    requests: StdMutex<Vec<(NodeId, &'static str)>>,
    connected: StdMutex<Vec<NodeId>>,
    disconnected: StdMutex<Vec<NodeId>>,
    delay: Option<Duration>,
}

impl Recorder {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn saw(&self, from: &NodeId, rpc: &str) -> bool {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .any(|(peer, name)| peer == from && *name == rpc)
    }
}

#[async_trait]
impl RpcHandler for Recorder {
    async fn handle_request(&self, from: &PeerDescriptor, request: RpcRequest) -> mesh_dht::Result<RpcResponse> {
        self.requests.lock().unwrap().push((from.node_id, request.name()));
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        match request {
            RpcRequest::Ping | RpcRequest::Leave => Ok(RpcResponse::Pong),
            other => Err(DhtError::Protocol(format!("{} not served here", other.name()))),
        }
    }

    async fn on_connected(&self, peer: &PeerDescriptor) {
        self.connected.lock().unwrap().push(peer.node_id);
    }

    async fn on_disconnected(&self, peer: &PeerDescriptor) {
        self.disconnected.lock().unwrap().push(peer.node_id);
    }
}

struct Peer {
    manager: Arc<ConnectionManager>,
    recorder: Arc<Recorder>,
    // keeps the weak handler registration alive
    _handler: Arc<dyn RpcHandler>,
}

impl Peer {
    fn descriptor(&self) -> PeerDescriptor {
        self.manager.local().clone()
    }

    fn id(&self) -> NodeId {
        self.manager.local().node_id
    }
}

fn config() -> ConnectionManagerConfig {
    ConnectionManagerConfig {
        handshake_timeout: Duration::from_secs(2),
        rpc_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(10),
        ..ConnectionManagerConfig::default()
    }
}

fn simulator() -> Arc<Simulator> {
    Simulator::new(LatencyType::Fixed, Some(Duration::from_millis(10)), 7).expect("simulator")
}

async fn start_peer(
    simulator: &Arc<Simulator>,
    byte: u8,
    config: ConnectionManagerConfig,
    recorder: Recorder,
) -> Peer {
    let facade = Arc::new(SimulatorConnectorFacade::new(simulator.clone(), None));
    let manager = ConnectionManager::start(config, [byte; 32], facade)
        .await
        .expect("manager starts");
    let recorder = Arc::new(recorder);
    let handler: Arc<dyn RpcHandler> = recorder.clone();
    manager.set_handler(Arc::downgrade(&handler));
    Peer {
        manager,
        recorder,
        _handler: handler,
    }
}

#[tokio::test(start_paused = true)]
async fn requests_travel_over_one_connection() -> Result<()> {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    let b = start_peer(&sim, 2, config(), Recorder::default()).await;

    let response = a.manager.request(&b.descriptor(), RpcRequest::Ping).await?;
    assert!(matches!(response, RpcResponse::Pong));
    a.manager.request(&b.descriptor(), RpcRequest::Ping).await?;

    assert_eq!(a.manager.connection_count().await, 1);
    assert_eq!(b.manager.connection_count().await, 1);
    assert_eq!(a.manager.connection_state(&b.id()).await, ConnectionState::Connected);
    assert_eq!(b.manager.connection_state(&a.id()).await, ConnectionState::Connected);
    assert!(b.recorder.saw(&a.id(), "ping"));
    assert_eq!(a.recorder.connected.lock().unwrap().as_slice(), &[b.id()]);
    assert_eq!(b.recorder.connected.lock().unwrap().as_slice(), &[a.id()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn handler_errors_come_back_as_remote_errors() {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    let b = start_peer(&sim, 2, config(), Recorder::default()).await;

    let result = a
        .manager
        .request(&b.descriptor(), RpcRequest::FindNode { target: [9u8; 32] })
        .await;
    assert!(matches!(result, Err(DhtError::Remote(_))));
}

#[tokio::test(start_paused = true)]
async fn slow_handlers_time_out() {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    let b = start_peer(&sim, 2, config(), Recorder::slow(Duration::from_secs(5))).await;

    let result = a.manager.request(&b.descriptor(), RpcRequest::Ping).await;
    assert!(matches!(result, Err(DhtError::Timeout(_))));
    // the connection itself survives
    assert_eq!(a.manager.connection_state(&b.id()).await, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn unknown_peers_are_unreachable() {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    let ghost = PeerDescriptor::new([9u8; 32]);

    let result = a.manager.request(&ghost, RpcRequest::Ping).await;
    assert!(matches!(result, Err(DhtError::Unreachable(_))));
    assert_eq!(a.manager.connection_state(&ghost.node_id).await, ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn connecting_to_yourself_is_refused() {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    assert!(matches!(
        a.manager.connect(&a.descriptor()).await,
        Err(DhtError::Protocol(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn version_mismatch_fails_the_handshake() {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    let newer = ConnectionManagerConfig {
        protocol_version: "2.0".into(),
        ..config()
    };
    let b = start_peer(&sim, 2, newer, Recorder::default()).await;

    let result = a.manager.connect(&b.descriptor()).await;
    assert!(matches!(
        result,
        Err(DhtError::Handshake(HandshakeError::UnsupportedVersion))
    ));
    assert_eq!(a.manager.connection_count().await, 0);
    assert_eq!(b.manager.connection_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn handshakes_naming_another_node_are_rejected() -> Result<()> {
    let sim = simulator();
    let b = start_peer(&sim, 2, config(), Recorder::default()).await;
    let dialer = PeerDescriptor::new([5u8; 32]);

    let mut raw = sim.connect(dialer.node_id, None, &b.descriptor()).await?;
    let request = WireMessage::HandshakeRequest {
        source: dialer.clone(),
        target: Some(PeerDescriptor::new([6u8; 32])),
        protocol_version: "1.0".into(),
    };
    raw.backend.send(request.encode()?).await?;

    let Some(ConnectionEvent::Data(bytes)) = raw.events.recv().await else {
        panic!("expected a handshake response");
    };
    match WireMessage::decode(&bytes)? {
        WireMessage::HandshakeResponse { source, error } => {
            assert_eq!(source.node_id, b.id());
            assert_eq!(error, Some(HandshakeError::InvalidPresumedPeerDescriptor));
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert!(matches!(raw.events.recv().await, Some(ConnectionEvent::Disconnected)));
    assert_eq!(b.manager.connection_count().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn simultaneous_connects_settle_on_one_connection() -> Result<()> {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    let b = start_peer(&sim, 2, config(), Recorder::default()).await;

    let (b_desc, a_desc) = (b.descriptor(), a.descriptor());
    let (from_a, from_b) = tokio::join!(
        a.manager.connect(&b_desc),
        b.manager.connect(&a_desc)
    );
    assert_eq!(from_a?.peer().node_id, b.id());
    assert_eq!(from_b?.peer().node_id, a.id());

    sleep(Duration::from_secs(1)).await;
    assert_eq!(a.manager.connection_count().await, 1);
    assert_eq!(b.manager.connection_count().await, 1);
    assert!(matches!(a.manager.request(&b.descriptor(), RpcRequest::Ping).await?, RpcResponse::Pong));
    assert!(matches!(b.manager.request(&a.descriptor(), RpcRequest::Ping).await?, RpcResponse::Pong));
    assert_eq!(sim.associations_graph().values().map(|n| n.len()).sum::<usize>(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() -> Result<()> {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    let b = start_peer(&sim, 2, config(), Recorder::default()).await;

    let (b_desc1, b_desc2) = (b.descriptor(), b.descriptor());
    let (first, second) = tokio::join!(
        a.manager.connect(&b_desc1),
        a.manager.connect(&b_desc2)
    );
    assert!(Arc::ptr_eq(&first?, &second?));
    assert_eq!(b.recorder.connected.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn locked_connections_survive_idle_collection() -> Result<()> {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    let b = start_peer(&sim, 2, config(), Recorder::default()).await;

    a.manager.lock(&b.descriptor(), "join").await;
    a.manager.lock(&b.descriptor(), "store").await;
    a.manager.lock(&b.descriptor(), "store").await;
    assert_eq!(a.manager.lock_count(&b.id()), 3);
    assert_eq!(a.manager.connection_count().await, 1);

    sleep(Duration::from_secs(20)).await;
    a.manager.collect_idle().await;
    assert_eq!(a.manager.connection_count().await, 1);

    a.manager.unlock(&b.id(), "store");
    a.manager.unlock(&b.id(), "join");
    assert!(a.manager.is_locked(&b.id()));
    a.manager.unlock(&b.id(), "store");
    assert!(!a.manager.is_locked(&b.id()));
    // unlocking what is not locked is a no-op
    a.manager.unlock(&b.id(), "store");

    a.manager.collect_idle().await;
    assert_eq!(a.manager.connection_count().await, 0);
    assert_eq!(a.recorder.disconnected.lock().unwrap().as_slice(), &[b.id()]);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(b.manager.connection_count().await, 0);
    assert_eq!(b.recorder.disconnected.lock().unwrap().as_slice(), &[a.id()]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopping_says_goodbye_and_refuses_requests() -> Result<()> {
    let sim = simulator();
    let a = start_peer(&sim, 1, config(), Recorder::default()).await;
    let b = start_peer(&sim, 2, config(), Recorder::default()).await;
    a.manager.request(&b.descriptor(), RpcRequest::Ping).await?;
    a.manager.lock(&b.descriptor(), "join").await;

    a.manager.stop().await;
    assert!(a.manager.is_stopped());
    assert!(!a.manager.is_locked(&b.id()));
    assert!(matches!(
        a.manager.request(&b.descriptor(), RpcRequest::Ping).await,
        Err(DhtError::Stopped)
    ));

    sleep(Duration::from_secs(1)).await;
    assert!(b.recorder.saw(&a.id(), "leaveNotice"));
    assert_eq!(b.manager.connection_count().await, 0);
    // a stopped node no longer accepts simulated connections
    assert!(matches!(
        b.manager.request(&a.descriptor(), RpcRequest::Ping).await,
        Err(DhtError::Unreachable(_))
    ));
    Ok(())
}

/// Dials succeed at the transport level, then the far end never answers.
#[derive(Default)]
struct SilentFacade {
    open: StdMutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

struct Swallow;

#[async_trait]
impl ConnectionBackend for Swallow {
    async fn send(&self, _data: Vec<u8>) -> mesh_dht::Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

#[async_trait]
impl ConnectorFacade for SilentFacade {
    async fn start(&self, node_id: NodeId, _incoming: IncomingSender) -> mesh_dht::Result<PeerDescriptor> {
        Ok(PeerDescriptor::new(node_id))
    }

    async fn connect(&self, _local: &PeerDescriptor, _target: &PeerDescriptor) -> mesh_dht::Result<ConnectOutcome> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.open.lock().unwrap().push(tx);
        Ok(ConnectOutcome::Direct(RawConnection::new(Arc::new(Swallow), rx)))
    }

    async fn stop(&self) {}
}

#[tokio::test(start_paused = true)]
async fn abandoned_connects_do_not_wedge_later_requests() -> Result<()> {
    let manager = ConnectionManager::start(config(), [1u8; 32], Arc::new(SilentFacade::default())).await?;
    let silent = PeerDescriptor::new([2u8; 32]);

    let first = timeout(Duration::from_secs(1), manager.request(&silent, RpcRequest::Ping)).await;
    assert!(first.is_err());
    assert_eq!(manager.connection_state(&silent.node_id).await, ConnectionState::Handshaking);

    let second = timeout(Duration::from_secs(60), manager.request(&silent, RpcRequest::Ping))
        .await
        .expect("the second request gives up on its own");
    assert!(second.is_err());
    assert_eq!(manager.connection_state(&silent.node_id).await, ConnectionState::Closed);

    // a fresh attempt starts from scratch and fails the same way
    let third = manager.request(&silent, RpcRequest::Ping).await;
    assert!(matches!(third, Err(DhtError::Timeout(_))));
    Ok(())
}

/// Hands every inbound connection to the test instead of a transport.
#[derive(Default)]
struct ManualFacade {
    incoming: StdMutex<Option<IncomingSender>>,
}

struct Stuck;

#[async_trait]
impl ConnectionBackend for Stuck {
    async fn send(&self, _data: Vec<u8>) -> mesh_dht::Result<()> {
        std::future::pending().await
    }

    async fn close(&self) {}
}

#[async_trait]
impl ConnectorFacade for ManualFacade {
    async fn start(&self, node_id: NodeId, incoming: IncomingSender) -> mesh_dht::Result<PeerDescriptor> {
        *self.incoming.lock().unwrap() = Some(incoming);
        Ok(PeerDescriptor::new(node_id))
    }

    async fn connect(&self, _local: &PeerDescriptor, target: &PeerDescriptor) -> mesh_dht::Result<ConnectOutcome> {
        Err(DhtError::Unreachable(target.short_id()))
    }

    async fn stop(&self) {}
}

#[tokio::test(start_paused = true)]
async fn slow_inbound_peers_do_not_block_the_manager() -> Result<()> {
    let facade = Arc::new(ManualFacade::default());
    let manager = ConnectionManager::start(config(), [1u8; 32], facade.clone()).await?;
    let slow = PeerDescriptor::new([3u8; 32]);

    let (tx, rx) = mpsc::unbounded_channel();
    let request = WireMessage::HandshakeRequest {
        source: slow.clone(),
        target: Some(manager.local().clone()),
        protocol_version: "1.0".into(),
    };
    tx.send(ConnectionEvent::Data(request.encode()?))?;
    let incoming = facade.incoming.lock().unwrap().clone().expect("facade started");
    assert!(incoming.send(RawConnection::new(Arc::new(Stuck), rx)).is_ok());
    sleep(Duration::from_millis(100)).await;

    // the reply to the slow peer is still in flight
    let state = timeout(Duration::from_secs(1), manager.connection_state(&slow.node_id))
        .await
        .expect("peer table is not held during the reply");
    assert_eq!(state, ConnectionState::Handshaking);
    let other = timeout(Duration::from_secs(1), manager.connect(&PeerDescriptor::new([4u8; 32])))
        .await
        .expect("other connects proceed");
    assert!(matches!(other, Err(DhtError::Unreachable(_))));

    sleep(Duration::from_secs(3)).await;
    assert_eq!(manager.connection_state(&slow.node_id).await, ConnectionState::Closed);
    drop(tx);
    Ok(())
}
