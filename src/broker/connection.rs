//! Broker-side connection lifecycle as a statum typestate
//!
//! ```text
//! Connecting ──accept──► Connected ──disconnect──► Disconnected
//!     │
//!     └──reject──► (no connection, ConnectionRejected)
//! ```
//!
//! A `Connection<Connected>` only exists between successful registration in the
//! topic registry and the end of its read loop.

use statum::{machine, state};
use std::fmt;
use tracing::{debug, info, warn};

use super::registry::ConnectionId;
use super::supervisor::{ConnectionRejected, RejectReason};
use super::validator::ValidationContext;

#[state]
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[machine]
#[derive(Debug)]
pub struct Connection<S: ConnectionState> {
    id: ConnectionId,
    client_id: String,
    endpoint: String,
    clean_session: bool,
}

/// Why a connected session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent DISCONNECT
    Graceful,
    /// Transport closed without DISCONNECT
    PeerClosed,
    TransportFailure(String),
    ProtocolViolation(String),
    /// Superseded by a newer connection with the same client id
    Evicted,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Graceful => write!(f, "client disconnected"),
            DisconnectReason::PeerClosed => write!(f, "peer closed the transport"),
            DisconnectReason::TransportFailure(e) => write!(f, "transport failure: {}", e),
            DisconnectReason::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            DisconnectReason::Evicted => write!(f, "evicted by a newer session"),
            DisconnectReason::Shutdown => write!(f, "broker shutdown"),
        }
    }
}

impl<S: ConnectionState> Connection<S> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }
}

impl Connection<Connecting> {
    pub fn create(id: ConnectionId, client_id: String, endpoint: String, clean_session: bool) -> Self {
        debug!("Handshake from {} as '{}'", endpoint, client_id);
        Self::new(id, client_id, endpoint, clean_session)
    }

    /// Replaces an empty client id with a broker-generated one
    pub fn assign_client_id(&mut self, client_id: String) {
        debug!("Assigned client id {} to {}", client_id, self.endpoint);
        self.client_id = client_id;
    }

    pub fn context(&self) -> ValidationContext {
        ValidationContext {
            client_id: self.client_id.clone(),
            endpoint: self.endpoint.clone(),
            clean_session: self.clean_session,
        }
    }

    pub fn accept(self) -> Connection<Connected> {
        info!(
            "Connection {} accepted: {} from {}",
            self.id, self.client_id, self.endpoint
        );
        self.transition()
    }

    /// Consumes the attempt; no connection object survives a rejection
    pub fn reject(self, reason: RejectReason) -> ConnectionRejected {
        warn!(
            "Connection rejected: ClientId = {}, Endpoint = {}, Reason = {}",
            self.client_id, self.endpoint, reason
        );
        ConnectionRejected {
            client_id: Some(self.client_id),
            endpoint: self.endpoint,
            reason,
        }
    }
}

impl Connection<Connected> {
    pub fn disconnect(self, reason: &DisconnectReason) -> Connection<Disconnected> {
        match reason {
            DisconnectReason::TransportFailure(_) | DisconnectReason::ProtocolViolation(_) => {
                warn!("Connection {} ({}) lost: {}", self.id, self.client_id, reason)
            }
            _ => info!("Connection {} ({}) closed: {}", self.id, self.client_id, reason),
        }
        self.transition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_keeps_identity() {
        let mut connecting = Connection::create(7, String::new(), "127.0.0.1:9".to_string(), true);
        connecting.assign_client_id("relay-7".to_string());
        assert_eq!(connecting.context().client_id, "relay-7");

        let connected = connecting.accept();
        assert_eq!(connected.id(), 7);
        assert_eq!(connected.client_id(), "relay-7");

        let closed = connected.disconnect(&DisconnectReason::Graceful);
        assert_eq!(closed.endpoint(), "127.0.0.1:9");
        assert!(closed.clean_session());
    }

    #[test]
    fn rejection_carries_the_attempt() {
        let connecting = Connection::create(1, "blocked".to_string(), "10.0.0.1:1".to_string(), false);
        let rejected = connecting.reject(RejectReason::Validation("blocked".to_string()));
        assert_eq!(rejected.client_id.as_deref(), Some("blocked"));
        assert_eq!(rejected.endpoint, "10.0.0.1:1");
    }
}
