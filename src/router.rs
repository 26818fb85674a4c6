//! Multi-hop message routing towards a destination node id.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::join_all;
use lru::LruCache;
use tracing::{debug, trace};

use crate::context::NodeContext;
use crate::descriptor::PeerDescriptor;
use crate::error::{DhtError, Result};
use crate::events::DhtEvent;
use crate::identifier::closer_to;
use crate::network::DhtRpc;
use crate::protocol::{RouteMessageWrapper, RpcRequest};

const DUPLICATE_DETECTOR_SIZE: usize = 10_000;

pub const LOOP_DETECTED: &str = "loop";
pub const DUPLICATE: &str = "duplicate";
pub const NO_ROUTE: &str = "no route";

/// Draw a fresh routing request id.
pub fn new_request_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

pub struct Router<N: DhtRpc> {
    ctx: Arc<NodeContext<N>>,
    seen: StdMutex<LruCache<String, ()>>,
}

impl<N: DhtRpc> Router<N> {
    pub(crate) fn new(ctx: Arc<NodeContext<N>>) -> Self {
        let cap = NonZeroUsize::new(DUPLICATE_DETECTOR_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            ctx,
            seen: StdMutex::new(LruCache::new(cap)),
        }
    }

    /// Returns true if `request_id` was already seen, recording it otherwise.
    fn check_duplicate(&self, request_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        if seen.contains(request_id) {
            return true;
        }
        seen.put(request_id.to_string(), ());
        false
    }

    /// Originate a routed message carrying `payload` to `destination`.
    pub async fn send(&self, destination: &PeerDescriptor, payload: Vec<u8>) -> Result<()> {
        self.originate(destination, payload, false).await
    }

    /// Like [`send`](Self::send) but never hands the message to the
    /// destination directly, for peers we cannot dial.
    pub async fn send_indirect(&self, destination: &PeerDescriptor, payload: Vec<u8>) -> Result<()> {
        self.originate(destination, payload, true).await
    }

    async fn originate(
        &self,
        destination: &PeerDescriptor,
        payload: Vec<u8>,
        indirect: bool,
    ) -> Result<()> {
        let message = RouteMessageWrapper {
            destination: destination.clone(),
            source: self.ctx.local.clone(),
            previous: None,
            request_id: new_request_id(),
            routing_path: Vec::new(),
            reachable_through: Vec::new(),
            message: payload,
        };
        self.check_duplicate(&message.request_id);
        match self.route_onward(message, false, indirect).await {
            None => Ok(()),
            Some(reason) => Err(DhtError::Unreachable(reason)),
        }
    }

    /// Route `payload` to `destination`, entering the network through `via`.
    ///
    /// `via` unwraps the outer envelope and routes the inner one.
    pub async fn forward_through(
        &self,
        via: &PeerDescriptor,
        destination: &PeerDescriptor,
        payload: Vec<u8>,
    ) -> Result<()> {
        let local = self.ctx.local.clone();
        let inner = RouteMessageWrapper {
            destination: destination.clone(),
            source: local.clone(),
            previous: None,
            request_id: new_request_id(),
            routing_path: Vec::new(),
            reachable_through: vec![via.clone()],
            message: payload,
        };
        let outer = RouteMessageWrapper {
            destination: via.clone(),
            source: local.clone(),
            previous: Some(local.clone()),
            request_id: new_request_id(),
            routing_path: vec![local],
            reachable_through: Vec::new(),
            message: serde_json::to_vec(&inner)?,
        };
        match self.ctx.rpc.forward_message(via, outer).await? {
            None => Ok(()),
            Some(reason) => Err(DhtError::Unreachable(reason)),
        }
    }

    /// Handle an inbound `routeMessage` or `forwardMessage`.
    ///
    /// Returns `None` on success or the negative acknowledgement reason.
    pub async fn handle(&self, message: RouteMessageWrapper, forwarding: bool) -> Option<String> {
        let ctx = &self.ctx;
        if ctx.is_stopped() {
            return Some(DhtError::Stopped.to_string());
        }
        if message.has_visited(ctx.local_id()) {
            trace!(request_id = %message.request_id, "routing loop detected");
            return Some(LOOP_DETECTED.to_string());
        }
        if self.check_duplicate(&message.request_id) {
            return Some(DUPLICATE.to_string());
        }

        if &message.destination.node_id != ctx.local_id() {
            return self.route_onward(message, false, false).await;
        }
        if forwarding {
            return match serde_json::from_slice::<RouteMessageWrapper>(&message.message) {
                Ok(inner) => {
                    self.check_duplicate(&inner.request_id);
                    self.route_onward(inner, true, false).await
                }
                Err(err) => Some(format!("malformed forwarded message: {err}")),
            };
        }
        self.deliver(message).await;
        None
    }

    async fn deliver(&self, message: RouteMessageWrapper) {
        let ctx = &self.ctx;
        trace!(source = %message.source.short_id(), "routed message delivered");
        if let Ok(RpcRequest::WebSocketConnectionRequest { requester }) =
            serde_json::from_slice::<RpcRequest>(&message.message)
        {
            let accepted = ctx.rpc.accept_connection_request(&requester).await;
            debug!(requester = %requester.short_id(), accepted, "connection request delivered");
            return;
        }
        ctx.events.publish(DhtEvent::Message(message));
    }

    /// Forward to up to `parallelism` contacts closer to the destination than
    /// the local node. Succeeds if any hop accepts.
    async fn route_onward(
        &self,
        mut message: RouteMessageWrapper,
        allow_farther: bool,
        indirect: bool,
    ) -> Option<String> {
        let ctx = &self.ctx;
        let destination = message.destination.node_id;
        let local_id = *ctx.local_id();
        message.previous = Some(ctx.local.clone());
        if !message.has_visited(&local_id) {
            message.routing_path.push(ctx.local.clone());
        }

        let hops: Vec<PeerDescriptor> = ctx
            .closest_contacts(&destination, ctx.config.k)
            .await
            .into_iter()
            .filter(|p| {
                p.node_id == destination
                    || allow_farther
                    || closer_to(&destination, &p.node_id, &local_id).is_lt()
            })
            .filter(|p| !(indirect && p.node_id == destination))
            .filter(|p| !message.has_visited(&p.node_id))
            .take(ctx.config.parallelism)
            .collect();
        if hops.is_empty() {
            return Some(NO_ROUTE.to_string());
        }

        let attempts = join_all(
            hops.iter()
                .map(|hop| ctx.rpc.route_message(hop, message.clone())),
        )
        .await;
        let mut last_error = NO_ROUTE.to_string();
        for (hop, attempt) in hops.iter().zip(attempts) {
            match attempt {
                Ok(None) => return None,
                Ok(Some(reason)) if reason == DUPLICATE && hop.node_id == destination => return None,
                Ok(Some(reason)) => last_error = reason,
                Err(err) => {
                    trace!(peer = %hop.short_id(), error = %err, "routing hop failed");
                    last_error = err.to_string();
                }
            }
        }
        Some(last_error)
    }
}
