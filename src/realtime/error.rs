#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde_json::Value;

use super::config::NON_RETRYABLE_CODES;
use super::protocol::SubscriptionId;
use crate::retry::RetryError;

/// Realtime transport error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum RealtimeError {
    /// Error connecting to or communicating with the WebSocket gateway
    Socket(tokio_tungstenite::tungstenite::Error),
    /// The socket closed while a handshake or subscription was in flight
    SocketClosed,
    /// No `connection_ack` arrived within the handshake window
    HandshakeTimeout {
        /// How long the handshake waited
        waited: Duration,
    },
    /// The gateway answered the handshake with a `connection_error` frame
    HandshakeRejected {
        /// Gateway-reported error type
        error_type: String,
        /// Gateway-reported error code
        error_code: u16,
    },
    /// No `start_ack` arrived within the subscription ack window
    SubscriptionTimeout {
        /// The affected subscription
        id: SubscriptionId,
    },
    /// The gateway answered a subscription with an `error` frame
    SubscriptionServerError {
        /// The affected subscription
        id: SubscriptionId,
        /// The error frame's payload, verbatim
        payload: Value,
    },
    /// The subscription was cancelled before it ever connected
    SubscriptionNeverConnected {
        /// The affected subscription
        id: SubscriptionId,
    },
    /// Failed to serialize an outbound frame
    Serialize(serde_json::Error),
    /// The client and its connection task have shut down
    TransportClosed,
}

impl RealtimeError {
    /// Whether a failed handshake attempt may be retried. Explicit
    /// gateway rejections with a client-error code are terminal.
    pub(crate) fn is_retryable_handshake(&self) -> bool {
        match self {
            Self::HandshakeRejected { error_code, .. } => !NON_RETRYABLE_CODES.contains(error_code),
            _ => true,
        }
    }
}

impl fmt::Display for RealtimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "WebSocket error: {e}"),
            Self::SocketClosed => write!(f, "WebSocket connection closed"),
            Self::HandshakeTimeout { waited } => {
                write!(f, "connection ack not received within {waited:?}")
            }
            Self::HandshakeRejected {
                error_type,
                error_code,
            } => write!(f, "connection rejected: {error_type} (code {error_code})"),
            Self::SubscriptionTimeout { id } => write!(f, "subscription {id} timed out"),
            Self::SubscriptionServerError { id, payload } => {
                write!(f, "subscription {id} failed: {payload}")
            }
            Self::SubscriptionNeverConnected { id } => {
                write!(f, "subscription {id} never connected")
            }
            Self::Serialize(e) => write!(f, "failed to serialize frame: {e}"),
            Self::TransportClosed => write!(f, "realtime transport closed"),
        }
    }
}

impl StdError for RealtimeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Socket(e) => Some(e),
            Self::Serialize(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<RealtimeError> for crate::error::Error {
    fn from(e: RealtimeError) -> Self {
        let kind = match &e {
            RealtimeError::Socket(_) | RealtimeError::SocketClosed | RealtimeError::TransportClosed => {
                crate::error::Kind::WebSocket
            }
            RealtimeError::HandshakeTimeout { .. } | RealtimeError::HandshakeRejected { .. } => {
                crate::error::Kind::Handshake
            }
            RealtimeError::SubscriptionTimeout { .. }
            | RealtimeError::SubscriptionServerError { .. }
            | RealtimeError::SubscriptionNeverConnected { .. } => crate::error::Kind::Subscription,
            RealtimeError::Serialize(_) => crate::error::Kind::Internal,
        };
        crate::error::Error::with_source(kind, e)
    }
}

impl From<RetryError<RealtimeError>> for crate::error::Error {
    fn from(e: RetryError<RealtimeError>) -> Self {
        match e {
            RetryError::Operation(inner) => inner.into(),
            other => crate::error::Error::with_source(crate::error::Kind::Retry, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Kind};

    #[test]
    fn rejection_with_client_code_is_terminal() {
        let rejected = RealtimeError::HandshakeRejected {
            error_type: "UnauthorizedException".to_owned(),
            error_code: 401,
        };
        assert!(!rejected.is_retryable_handshake());

        let transient = RealtimeError::HandshakeRejected {
            error_type: "InternalFailure".to_owned(),
            error_code: 500,
        };
        assert!(transient.is_retryable_handshake());
        assert!(RealtimeError::SocketClosed.is_retryable_handshake());
    }

    #[test]
    fn kinds_map_by_variant() {
        let id = SubscriptionId::new_v4();

        let error: Error = RealtimeError::SubscriptionTimeout { id }.into();
        assert_eq!(error.kind(), Kind::Subscription);

        let error: Error = RealtimeError::HandshakeTimeout {
            waited: Duration::from_secs(15),
        }
        .into();
        assert_eq!(error.kind(), Kind::Handshake);
    }

    #[test]
    fn retry_terminal_errors_keep_their_kind() {
        let error: Error = RetryError::<RealtimeError>::AttemptsExhausted { attempts: 6 }.into();
        assert_eq!(error.kind(), Kind::Retry);

        let error: Error = RetryError::Operation(RealtimeError::SocketClosed).into();
        assert_eq!(error.kind(), Kind::WebSocket, "operation errors surface verbatim");
    }
}
