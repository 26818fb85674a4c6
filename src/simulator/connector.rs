use std::sync::Weak;

use async_trait::async_trait;

use super::{ConnectionId, Shared};
use crate::connection::ConnectionBackend;
use crate::error::{DhtError, Result};
use crate::identifier::NodeId;

/// One end of a simulated connection.
pub struct SimulatorConnection {
    shared: Weak<Shared>,
    id: ConnectionId,
    remote: NodeId,
}

impl SimulatorConnection {
    pub(crate) fn new(shared: Weak<Shared>, id: ConnectionId, remote: NodeId) -> Self {
        Self { shared, id, remote }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Node at the other end, as known to the simulator.
    pub fn remote(&self) -> &NodeId {
        &self.remote
    }
}

#[async_trait]
impl ConnectionBackend for SimulatorConnection {
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        match self.shared.upgrade() {
            Some(shared) => shared.send(self.id, data),
            None => Err(DhtError::Stopped),
        }
    }

    async fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.close(self.id);
        }
    }
}
