#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mesh_dht::protocol::{RpcRequest, RpcResponse};
use mesh_dht::{DhtError, DhtNode, DhtNodeConfig, DhtRpc, NodeId, PeerDescriptor, RpcHandler};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

/// In-memory transport: calls go straight to the target node's handler.
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    local: PeerDescriptor,
    latencies: Mutex<HashMap<NodeId, Duration>>,
    failures: Mutex<HashSet<NodeId>>,
    calls: Mutex<Vec<(NodeId, &'static str)>>,
    locks: Mutex<HashMap<NodeId, usize>>,
    stopped: AtomicBool,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, local: PeerDescriptor) -> Self {
        Self {
            registry,
            local,
            latencies: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub async fn set_latency(&self, node: NodeId, latency: Duration) {
        self.latencies.lock().await.insert(node, latency);
    }

    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    /// Requests sent to `node`, by RPC name.
    pub async fn calls_to(&self, node: &NodeId, rpc: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(to, name)| to == node && *name == rpc)
            .count()
    }

    pub async fn lock_count(&self, node: &NodeId) -> usize {
        self.locks.lock().await.get(node).copied().unwrap_or(0)
    }

    async fn maybe_sleep(&self, node: &NodeId) {
        let latency = self.latencies.lock().await.get(node).copied();
        if let Some(latency) = latency {
            sleep(latency).await;
        }
    }
}

#[async_trait]
impl DhtRpc for TestNetwork {
    fn local_peer(&self) -> PeerDescriptor {
        self.local.clone()
    }

    async fn call(&self, to: &PeerDescriptor, request: RpcRequest) -> mesh_dht::Result<RpcResponse> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DhtError::Stopped);
        }
        self.calls.lock().await.push((to.node_id, request.name()));
        if self.failures.lock().await.contains(&to.node_id) {
            return Err(DhtError::Unreachable("injected failure".into()));
        }
        self.maybe_sleep(&to.node_id).await;
        let Some(peer) = self.registry.get(&to.node_id).await else {
            return Err(DhtError::Unreachable(to.short_id()));
        };
        peer.handle_request(&self.local, request).await
    }

    async fn lock_connection(&self, peer: &PeerDescriptor, _reason: &str) {
        *self.locks.lock().await.entry(peer.node_id).or_default() += 1;
    }

    async fn unlock_connection(&self, peer: &PeerDescriptor, _reason: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(count) = locks.get_mut(&peer.node_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                locks.remove(&peer.node_id);
            }
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.registry.unregister(&self.local.node_id).await;
    }
}

/// Every node reachable through [`TestNetwork`].
#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, Arc<DhtNode<TestNetwork>>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: Arc<DhtNode<TestNetwork>>) {
        self.peers.write().await.insert(node.node_id(), node);
    }

    pub async fn unregister(&self, id: &NodeId) {
        self.peers.write().await.remove(id);
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<DhtNode<TestNetwork>>> {
        self.peers.read().await.get(id).cloned()
    }
}

pub struct TestNode {
    pub node: Arc<DhtNode<TestNetwork>>,
    pub network: Arc<TestNetwork>,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, config: DhtNodeConfig) -> Self {
        Self::with_id(registry, make_node_id(index), config).await
    }

    pub async fn with_id(registry: Arc<NetworkRegistry>, id: NodeId, config: DhtNodeConfig) -> Self {
        let network = Arc::new(TestNetwork::new(registry.clone(), PeerDescriptor::new(id)));
        let node = DhtNode::new(network.clone(), config).expect("valid config");
        registry.register(node.clone()).await;
        Self { node, network }
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        self.node.local_peer().clone()
    }

    pub fn id(&self) -> NodeId {
        self.node.node_id()
    }
}

/// Small timeouts so tests finish quickly; random joins off for determinism.
pub fn test_config() -> DhtNodeConfig {
    DhtNodeConfig {
        k: 8,
        parallelism: 3,
        redundancy_factor: 3,
        join_timeout: Duration::from_secs(5),
        rejoin_delay: Duration::from_millis(200),
        recovery_interval: Duration::from_secs(3600),
        find_timeout: Duration::from_secs(5),
        random_join: false,
        ..DhtNodeConfig::default()
    }
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    id
}

pub fn make_descriptor(index: u32) -> PeerDescriptor {
    PeerDescriptor::new(make_node_id(index))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
