//! Startup self-check of the local WebSocket server's reachability.

use rand::seq::SliceRandom;
use tokio::time::sleep;
use tracing::{info, warn};

use super::websocket::request_connectivity;
use crate::config::ConnectionManagerConfig;
use crate::descriptor::{ConnectivityMethod, ConnectivityResponse, NatType, PeerDescriptor};
use crate::protocol::ConnectivityRequest;

const DEFAULT_HOST: &str = "127.0.0.1";

/// Decide what WebSocket address, if any, the local node may advertise.
///
/// Without entry points the configured host is trusted. Otherwise a randomly
/// sampled entry point is asked to probe us back, up to
/// `connectivity_attempts` times; if none succeeds the node is reported as
/// behind an unknown NAT.
pub async fn check_connectivity(
    config: &ConnectionManagerConfig,
    local_port: u16,
) -> ConnectivityResponse {
    let host = config
        .websocket_host
        .clone()
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let entry_points: Vec<&PeerDescriptor> = config
        .entry_points
        .iter()
        .filter(|e| e.websocket.is_some())
        .collect();
    if entry_points.is_empty() {
        return ConnectivityResponse {
            open_internet: true,
            host: host.clone(),
            nat_type: NatType::OpenInternet,
            websocket: Some(ConnectivityMethod {
                host,
                port: local_port,
                tls: false,
            }),
        };
    }

    let request = ConnectivityRequest {
        port: local_port,
        tls: false,
        host: config.websocket_host.clone(),
    };
    for attempt in 1..=config.connectivity_attempts.max(1) {
        let entry = entry_points.choose(&mut rand::thread_rng()).copied();
        let Some(method) = entry.and_then(|e| e.websocket.as_ref()) else {
            break;
        };
        match request_connectivity(&method.url(), &request, config.handshake_timeout * 2).await {
            Ok(response) if response.open_internet => {
                info!(host = %response.host, port = local_port, "connectivity check passed");
                return response;
            }
            Ok(response) => {
                warn!(attempt, host = %response.host, "entry point could not reach us");
            }
            Err(err) => {
                warn!(attempt, entry = %method.url(), error = %err, "connectivity check failed");
            }
        }
        if attempt < config.connectivity_attempts {
            sleep(config.connectivity_retry_delay).await;
        }
    }
    warn!("connectivity checks exhausted, not advertising a websocket address");
    ConnectivityResponse::unknown()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn without_entry_points_the_configured_host_is_trusted() {
        let config = ConnectionManagerConfig {
            websocket_host: Some("10.0.0.7".into()),
            ..ConnectionManagerConfig::default()
        };
        let response = check_connectivity(&config, 4100).await;
        assert!(response.open_internet);
        assert_eq!(response.nat_type, NatType::OpenInternet);
        assert_eq!(response.websocket.map(|w| w.url()), Some("ws://10.0.0.7:4100".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_entry_points_fall_back_to_unknown() {
        let entry = PeerDescriptor::new([9u8; 32]).with_websocket(ConnectivityMethod {
            host: "127.0.0.1".into(),
            port: 1,
            tls: false,
        });
        let config = ConnectionManagerConfig {
            entry_points: vec![entry],
            connectivity_attempts: 2,
            ..ConnectionManagerConfig::default()
        };
        let response = check_connectivity(&config, 4100).await;
        assert_eq!(response.nat_type, NatType::Unknown);
        assert!(response.websocket.is_none());
    }
}
