//! Handshake messages and the checks each side applies.

use tokio::sync::mpsc;

use super::ConnectionEvent;
use crate::descriptor::PeerDescriptor;
use crate::error::{DhtError, HandshakeError, Result};
use crate::protocol::WireMessage;

pub fn request(local: &PeerDescriptor, target: &PeerDescriptor, protocol_version: &str) -> WireMessage {
    WireMessage::HandshakeRequest {
        source: local.clone(),
        target: Some(target.clone()),
        protocol_version: protocol_version.to_string(),
    }
}

pub fn response(local: &PeerDescriptor, error: Option<HandshakeError>) -> WireMessage {
    WireMessage::HandshakeResponse {
        source: local.clone(),
        error,
    }
}

/// Responder side checks that do not depend on existing connections.
pub fn check_request(
    local: &PeerDescriptor,
    protocol_version: &str,
    requested_version: &str,
    presumed_target: Option<&PeerDescriptor>,
) -> std::result::Result<(), HandshakeError> {
    if requested_version != protocol_version {
        return Err(HandshakeError::UnsupportedVersion);
    }
    match presumed_target {
        Some(target) if target.node_id != local.node_id => {
            Err(HandshakeError::InvalidPresumedPeerDescriptor)
        }
        _ => Ok(()),
    }
}

/// Dialer side: accept the answer only from the peer we meant to reach.
pub fn check_response(
    expected: &PeerDescriptor,
    responder: &PeerDescriptor,
    error: Option<HandshakeError>,
) -> Result<()> {
    if let Some(error) = error {
        return Err(DhtError::Handshake(error));
    }
    if responder.node_id != expected.node_id {
        return Err(DhtError::Handshake(
            HandshakeError::InvalidPresumedPeerDescriptor,
        ));
    }
    Ok(())
}

/// Wait for the next wire message on a connection that is not yet handed to
/// a reader task.
pub async fn next_message(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Result<WireMessage> {
    match events.recv().await {
        Some(ConnectionEvent::Data(data)) => WireMessage::decode(&data),
        Some(ConnectionEvent::Disconnected) | None => Err(DhtError::Unreachable(
            "disconnected during handshake".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_is_rejected() {
        let local = PeerDescriptor::new([1u8; 32]);
        assert_eq!(
            check_request(&local, "1.0", "2.0", None),
            Err(HandshakeError::UnsupportedVersion)
        );
        assert_eq!(check_request(&local, "1.0", "1.0", None), Ok(()));
    }

    #[test]
    fn presumed_target_must_be_the_responder() {
        let local = PeerDescriptor::new([1u8; 32]);
        let other = PeerDescriptor::new([2u8; 32]);
        assert_eq!(
            check_request(&local, "1.0", "1.0", Some(&other)),
            Err(HandshakeError::InvalidPresumedPeerDescriptor)
        );
        assert_eq!(check_request(&local, "1.0", "1.0", Some(&local)), Ok(()));
    }

    #[test]
    fn dialer_rejects_an_unexpected_responder() {
        let expected = PeerDescriptor::new([1u8; 32]);
        let actual = PeerDescriptor::new([2u8; 32]);
        assert!(matches!(
            check_response(&expected, &actual, None),
            Err(DhtError::Handshake(HandshakeError::InvalidPresumedPeerDescriptor))
        ));
        assert!(matches!(
            check_response(&expected, &expected, Some(HandshakeError::DuplicateConnection)),
            Err(DhtError::Handshake(HandshakeError::DuplicateConnection))
        ));
        assert!(check_response(&expected, &expected, None).is_ok());
    }

    #[tokio::test]
    async fn disconnect_before_the_first_message_is_unreachable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ConnectionEvent::Disconnected).expect("send");
        assert!(matches!(next_message(&mut rx).await, Err(DhtError::Unreachable(_))));
    }
}
