//! Discrete-event network simulator.
//!
//! Simulated connections are pairs of one-way *associations*. Every connect,
//! send and close becomes an [`Operation`] in a time-ordered queue that a
//! single driver task executes on tokio's clock, so runs under a paused clock
//! are reproducible. Operations on the same association never overtake each
//! other: each is scheduled no earlier than the previous one.
//!
//! Closing is two-phase. The closer's operation notifies the other side,
//! which schedules its own close; that second close removes both
//! associations.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use crate::connection::{ConnectionEvent, IncomingSender, RawConnection};
use crate::descriptor::PeerDescriptor;
use crate::error::{DhtError, Result};
use crate::identifier::{short_id, NodeId};

mod connector;
pub mod latency;

pub use connector::SimulatorConnection;
pub use latency::{region_latency, LatencyType, REGION_COUNT};

use latency::LatencyModel;

/// Operations executed per batch before the driver yields.
const MAX_LOOPS: usize = 1000;

/// Index of one end of a simulated connection.
pub type ConnectionId = u64;

#[derive(Debug)]
enum OperationKind {
    Connect { target: NodeId },
    Send { data: Vec<u8> },
    Close,
}

#[derive(Debug)]
struct Operation {
    at: Instant,
    seq: u64,
    source: ConnectionId,
    kind: OperationKind,
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Operation {}

impl PartialOrd for Operation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Operation {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: earliest time, then lowest sequence, wins.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Connector {
    region: Option<u32>,
    incoming: IncomingSender,
}

struct Endpoint {
    node: NodeId,
    region: Option<u32>,
    inbox: mpsc::UnboundedSender<ConnectionEvent>,
}

struct Association {
    destination: Option<ConnectionId>,
    last_operation_at: Instant,
    closing: bool,
    connected: Option<oneshot::Sender<Result<()>>>,
}

struct SimulatorState {
    shared: Weak<Shared>,
    latency: LatencyModel,
    rng: StdRng,
    connectors: HashMap<NodeId, Connector>,
    endpoints: HashMap<ConnectionId, Endpoint>,
    associations: HashMap<ConnectionId, Association>,
    queue: BinaryHeap<Operation>,
    next_seq: u64,
    next_connection: ConnectionId,
    delivered: u64,
}

impl SimulatorState {
    fn allocate_connection(&mut self) -> ConnectionId {
        let id = self.next_connection;
        self.next_connection += 1;
        id
    }

    /// Execution time for the next operation on `source`'s association.
    fn execution_time(
        &mut self,
        source: ConnectionId,
        from: Option<u32>,
        to: Option<u32>,
    ) -> Result<Instant> {
        let delay = self.latency.sample(&mut self.rng, from, to)?;
        let mut at = Instant::now() + delay;
        if let Some(association) = self.associations.get_mut(&source) {
            if association.last_operation_at > at {
                at = association.last_operation_at;
            }
            association.last_operation_at = at;
        }
        Ok(at)
    }

    fn push(&mut self, at: Instant, source: ConnectionId, kind: OperationKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Operation {
            at,
            seq,
            source,
            kind,
        });
    }

    fn regions(&self, source: ConnectionId) -> (Option<u32>, Option<u32>) {
        let from = self.endpoints.get(&source).and_then(|e| e.region);
        let to = self
            .associations
            .get(&source)
            .and_then(|a| a.destination)
            .and_then(|d| self.endpoints.get(&d))
            .and_then(|e| e.region);
        (from, to)
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        if let Some(mut association) = self.associations.remove(&id) {
            if let Some(callback) = association.connected.take() {
                let _ = callback.send(Err(DhtError::Unreachable("connection closed".into())));
            }
        }
        self.endpoints.remove(&id);
    }

    fn schedule_close(&mut self, source: ConnectionId) -> Result<()> {
        let Some(association) = self.associations.get_mut(&source) else {
            return Ok(());
        };
        association.closing = true;
        let (from, to) = self.regions(source);
        let at = self.execution_time(source, from, to)?;
        self.push(at, source, OperationKind::Close);
        Ok(())
    }

    fn execute(&mut self, operation: Operation) {
        match operation.kind {
            OperationKind::Connect { target } => self.execute_connect(operation.source, target),
            OperationKind::Send { data } => self.execute_send(operation.source, data),
            OperationKind::Close => self.execute_close(operation.source),
        }
    }

    fn execute_connect(&mut self, source: ConnectionId, target: NodeId) {
        let Some(source_node) = self.endpoints.get(&source).map(|e| e.node) else {
            return;
        };
        let Some((region, incoming)) = self
            .connectors
            .get(&target)
            .map(|c| (c.region, c.incoming.clone()))
        else {
            trace!(target = %short_id(&target), "target connector not found");
            self.remove_connection(source);
            return;
        };

        let accepted = self.allocate_connection();
        let (inbox, events) = mpsc::unbounded_channel();
        self.endpoints.insert(
            accepted,
            Endpoint {
                node: target,
                region,
                inbox,
            },
        );
        self.associations.insert(
            accepted,
            Association {
                destination: Some(source),
                last_operation_at: Instant::now(),
                closing: false,
                connected: None,
            },
        );
        let raw = RawConnection::new(
            Arc::new(SimulatorConnection::new(self.shared.clone(), accepted, source_node)),
            events,
        );
        if incoming.send(raw).is_err() {
            self.remove_connection(accepted);
            self.remove_connection(source);
            return;
        }
        if let Some(association) = self.associations.get_mut(&source) {
            association.destination = Some(accepted);
            if let Some(callback) = association.connected.take() {
                let _ = callback.send(Ok(()));
            }
        }
    }

    fn execute_send(&mut self, source: ConnectionId, data: Vec<u8>) {
        let Some(destination) = self.associations.get(&source).and_then(|a| a.destination) else {
            return;
        };
        if let Some(endpoint) = self.endpoints.get(&destination) {
            if endpoint.inbox.send(ConnectionEvent::Data(data)).is_ok() {
                self.delivered += 1;
            }
        }
    }

    fn execute_close(&mut self, source: ConnectionId) {
        let destination = self.associations.get(&source).and_then(|a| a.destination);
        let counter_closing = destination
            .and_then(|d| self.associations.get(&d))
            .map(|a| a.closing);
        match (destination, counter_closing) {
            (Some(destination), Some(false)) => {
                if let Some(endpoint) = self.endpoints.get(&destination) {
                    let _ = endpoint.inbox.send(ConnectionEvent::Disconnected);
                }
                if let Err(err) = self.schedule_close(destination) {
                    debug!(error = %err, "could not schedule close acknowledgement");
                    self.remove_connection(destination);
                    self.remove_connection(source);
                }
            }
            (Some(destination), Some(true)) => {
                self.remove_connection(destination);
                self.remove_connection(source);
            }
            _ => self.remove_connection(source),
        }
    }
}

/// State reachable from the driver task and from every simulated connection.
pub(crate) struct Shared {
    state: StdMutex<SimulatorState>,
    notify: Notify,
    stopped: AtomicBool,
}

enum Wake {
    Yield,
    At(Instant),
    Idle,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimulatorState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(AtomicOrdering::SeqCst)
    }

    async fn connect(
        self: &Arc<Self>,
        source: NodeId,
        source_region: Option<u32>,
        target: &PeerDescriptor,
    ) -> Result<RawConnection> {
        if self.is_stopped() {
            return Err(DhtError::Stopped);
        }
        let (connected_tx, connected_rx) = oneshot::channel();
        let (inbox, events) = mpsc::unbounded_channel();
        let id = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let target_region = target.region.or_else(|| {
                state
                    .connectors
                    .get(&target.node_id)
                    .and_then(|c| c.region)
            });
            let delay = state.latency.sample(&mut state.rng, source_region, target_region)?;
            let at = Instant::now() + delay;
            let id = state.allocate_connection();
            state.endpoints.insert(
                id,
                Endpoint {
                    node: source,
                    region: source_region,
                    inbox,
                },
            );
            state.associations.insert(
                id,
                Association {
                    destination: None,
                    last_operation_at: at,
                    closing: false,
                    connected: Some(connected_tx),
                },
            );
            state.push(
                at,
                id,
                OperationKind::Connect {
                    target: target.node_id,
                },
            );
            id
        };
        self.notify.notify_one();

        match connected_rx.await {
            Ok(Ok(())) => Ok(RawConnection::new(
                Arc::new(SimulatorConnection::new(Arc::downgrade(self), id, target.node_id)),
                events,
            )),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DhtError::Stopped),
        }
    }

    fn send(&self, source: ConnectionId, data: Vec<u8>) -> Result<()> {
        if self.is_stopped() {
            return Err(DhtError::Stopped);
        }
        {
            let mut state = self.lock();
            match state.associations.get(&source) {
                Some(association) if !association.closing && association.destination.is_some() => {}
                _ => return Err(DhtError::Unreachable("connection closed".into())),
            }
            let (from, to) = state.regions(source);
            let at = state.execution_time(source, from, to)?;
            state.push(at, source, OperationKind::Send { data });
        }
        self.notify.notify_one();
        Ok(())
    }

    fn close(&self, source: ConnectionId) {
        if self.is_stopped() {
            return;
        }
        if let Err(err) = self.lock().schedule_close(source) {
            debug!(connection = source, error = %err, "could not schedule close");
        }
        self.notify.notify_one();
    }

    /// Execute every due operation, at most `MAX_LOOPS` at a time.
    fn execute_due(&self) -> Wake {
        let mut executed = 0;
        loop {
            if self.is_stopped() {
                return Wake::Idle;
            }
            let mut state = self.lock();
            match state.queue.peek().map(|op| op.at) {
                Some(at) if at <= Instant::now() => {
                    if let Some(operation) = state.queue.pop() {
                        state.execute(operation);
                    }
                    executed += 1;
                    if executed >= MAX_LOOPS {
                        return Wake::Yield;
                    }
                }
                Some(at) => return Wake::At(at),
                None => return Wake::Idle,
            }
        }
    }
}

async fn drive(shared: Arc<Shared>) {
    while !shared.is_stopped() {
        match shared.execute_due() {
            Wake::Yield => tokio::task::yield_now().await,
            Wake::At(at) => {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = sleep_until(at) => {}
                }
            }
            Wake::Idle => shared.notify.notified().await,
        }
    }
    trace!("simulator driver exited");
}

/// A simulated network shared by any number of nodes.
///
/// Must be created inside a tokio runtime. Dropping the last handle stops
/// the simulation.
pub struct Simulator {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl Simulator {
    pub fn new(
        latency_type: LatencyType,
        fixed_latency: Option<Duration>,
        seed: u64,
    ) -> Result<Arc<Self>> {
        let latency = LatencyModel::new(latency_type, fixed_latency)?;
        let shared = Arc::new_cyclic(|weak| Shared {
            state: StdMutex::new(SimulatorState {
                shared: weak.clone(),
                latency,
                rng: StdRng::seed_from_u64(seed),
                connectors: HashMap::new(),
                endpoints: HashMap::new(),
                associations: HashMap::new(),
                queue: BinaryHeap::new(),
                next_seq: 0,
                next_connection: 0,
                delivered: 0,
            }),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
        });
        let driver = tokio::spawn(drive(shared.clone()));
        info!(?latency_type, seed, "simulator started");
        Ok(Arc::new(Self { shared, driver }))
    }

    /// Register `node` so that it can accept simulated connections.
    pub fn add_connector(&self, node: NodeId, region: Option<u32>, incoming: IncomingSender) {
        self.shared
            .lock()
            .connectors
            .insert(node, Connector { region, incoming });
    }

    pub fn remove_connector(&self, node: &NodeId) {
        self.shared.lock().connectors.remove(node);
    }

    /// Open a connection from `source` to `target`, resolving once the
    /// connect operation has executed.
    pub async fn connect(
        &self,
        source: NodeId,
        source_region: Option<u32>,
        target: &PeerDescriptor,
    ) -> Result<RawConnection> {
        self.shared.connect(source, source_region, target).await
    }

    pub fn stop(&self) {
        if self.shared.stopped.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let associations = self.shared.lock().associations.len();
        info!(associations, "simulator stopped");
        self.shared.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Messages handed to a receiving endpoint so far.
    pub fn delivered_messages(&self) -> u64 {
        self.shared.lock().delivered
    }

    pub fn pending_operations(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Undirected node graph of the established associations.
    pub fn associations_graph(&self) -> BTreeMap<NodeId, BTreeSet<NodeId>> {
        let state = self.shared.lock();
        let mut graph: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for (id, association) in &state.associations {
            let Some(destination) = association.destination else {
                continue;
            };
            let (Some(a), Some(b)) = (state.endpoints.get(id), state.endpoints.get(&destination))
            else {
                continue;
            };
            let (low, high) = if a.node <= b.node {
                (a.node, b.node)
            } else {
                (b.node, a.node)
            };
            graph.entry(low).or_default().insert(high);
        }
        graph
    }

    /// Connected components over registered nodes and established
    /// associations. A node with no associations is its own component.
    pub fn connected_components(&self) -> usize {
        let graph = self.associations_graph();
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in self.shared.lock().connectors.keys() {
            adjacency.entry(*node).or_default();
        }
        for (a, neighbours) in &graph {
            for b in neighbours {
                adjacency.entry(*a).or_default().push(*b);
                adjacency.entry(*b).or_default().push(*a);
            }
        }

        let mut seen = HashSet::new();
        let mut components = 0;
        for start in adjacency.keys() {
            if !seen.insert(*start) {
                continue;
            }
            components += 1;
            let mut stack = vec![*start];
            while let Some(node) = stack.pop() {
                for next in adjacency.get(&node).into_iter().flatten() {
                    if seen.insert(*next) {
                        stack.push(*next);
                    }
                }
            }
        }
        components
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.stop();
        self.driver.abort();
    }
}
