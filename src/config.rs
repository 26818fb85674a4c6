//! Tunables for the DHT node and the connection manager.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::PeerDescriptor;
use crate::error::{DhtError, Result};

/// Durations are (de)serialised as milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Parameters of the Kademlia layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtNodeConfig {
    /// Bucket capacity.
    pub k: usize,
    /// Peers queried concurrently per lookup round.
    pub parallelism: usize,
    /// Rounds without a closer peer before a join session ends.
    pub join_no_progress_limit: usize,
    #[serde(with = "millis")]
    pub join_timeout: Duration,
    pub get_closest_contacts_limit: usize,
    /// Live replicas kept per key.
    pub redundancy_factor: usize,
    /// Upper bound on TTLs accepted from remote storers.
    #[serde(with = "millis")]
    pub max_ttl: Duration,
    /// TTL this node attaches to its own stores.
    #[serde(with = "millis")]
    pub highest_ttl: Duration,
    #[serde(with = "millis")]
    pub rpc_timeout: Duration,
    #[serde(with = "millis")]
    pub rejoin_delay: Duration,
    #[serde(with = "millis")]
    pub recovery_interval: Duration,
    #[serde(with = "millis")]
    pub find_timeout: Duration,
    pub max_stored_keys: usize,
    #[serde(with = "millis")]
    pub ttl_sweep_interval: Duration,
    /// Run a second join session towards a random id.
    pub random_join: bool,
    pub service_id: String,
}

impl Default for DhtNodeConfig {
    fn default() -> Self {
        Self {
            k: 8,
            parallelism: 3,
            join_no_progress_limit: 4,
            join_timeout: Duration::from_secs(60),
            get_closest_contacts_limit: 5,
            redundancy_factor: 5,
            max_ttl: Duration::from_secs(300),
            highest_ttl: Duration::from_secs(300),
            rpc_timeout: Duration::from_secs(10),
            rejoin_delay: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(60),
            find_timeout: Duration::from_secs(10),
            max_stored_keys: 100_000,
            ttl_sweep_interval: Duration::from_secs(60),
            random_join: true,
            service_id: "layer0".to_string(),
        }
    }
}

impl DhtNodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::Configuration("k must be non-zero".into()));
        }
        if self.parallelism == 0 {
            return Err(DhtError::Configuration("parallelism must be non-zero".into()));
        }
        if self.redundancy_factor == 0 {
            return Err(DhtError::Configuration(
                "redundancy_factor must be non-zero".into(),
            ));
        }
        if self.max_stored_keys == 0 {
            return Err(DhtError::Configuration(
                "max_stored_keys must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Inclusive port range for the WebSocket server.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

/// Parameters of the connection layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionManagerConfig {
    pub protocol_version: String,
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    #[serde(with = "millis")]
    pub rpc_timeout: Duration,
    /// Unlocked connections unused for this long are closed.
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    #[serde(with = "millis")]
    pub gc_interval: Duration,
    pub websocket_host: Option<String>,
    pub websocket_port_range: Option<PortRange>,
    pub entry_points: Vec<PeerDescriptor>,
    pub connectivity_attempts: usize,
    #[serde(with = "millis")]
    pub connectivity_retry_delay: Duration,
    /// Start the NAT-traversing QUIC endpoint.
    pub nat_traversal: bool,
    pub region: Option<u32>,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            protocol_version: "1.0".to_string(),
            handshake_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            gc_interval: Duration::from_secs(30),
            websocket_host: None,
            websocket_port_range: None,
            entry_points: Vec::new(),
            connectivity_attempts: 5,
            connectivity_retry_delay: Duration::from_secs(2),
            nat_traversal: false,
            region: None,
        }
    }
}

/// Combined file format read by the binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfigFile {
    pub dht: DhtNodeConfig,
    pub connection: ConnectionManagerConfig,
}

impl NodeConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: Self = serde_json::from_str(&raw)?;
        parsed.dht.validate()?;
        Ok(parsed)
    }
}
