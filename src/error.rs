use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

/// Failures reported by an identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("no account matches this identifier")]
    NotFound,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("display name already taken: {0}")]
    DuplicateDisplayName(String),

    #[error("email already registered: {0}")]
    DuplicateEmail(String),

    #[error("identity backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Admin-only action attempted by a non-admin.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Join attempted after the room was ended.
    #[error("room has ended: {0}")]
    RoomInactive(String),

    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The requested transport address is held by another live handle.
    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("transport confirmed address {confirmed} but {requested} was requested")]
    AddressMismatch { requested: String, confirmed: String },

    #[error("call to {peer} failed: {reason}")]
    CallFailed { peer: String, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("media error: {0}")]
    Media(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The room session has already been torn down.
    #[error("room session closed")]
    SessionClosed,
}

impl Error {
    pub fn call_failed(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::CallFailed {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure is a transient connectivity problem worth retrying,
    /// as opposed to an authorization or room-lifecycle verdict.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportUnavailable(_) | Error::CallFailed { .. } | Error::Store(_)
        )
    }
}

impl From<WebRTCError> for Error {
    fn from(err: WebRTCError) -> Self {
        Error::TransportUnavailable(format!("WebRTC error: {err}"))
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Error::TransportUnavailable(format!("WebSocket error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(format!("malformed document: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_are_retryable() {
        assert!(Error::TransportUnavailable("down".into()).is_retryable());
        assert!(Error::call_failed("addr-b", "timeout").is_retryable());
        assert!(Error::Store("unavailable".into()).is_retryable());
    }

    #[test]
    fn lifecycle_and_authorization_errors_are_terminal() {
        assert!(!Error::NotAuthorized("end room".into()).is_retryable());
        assert!(!Error::RoomNotFound("R1".into()).is_retryable());
        assert!(!Error::RoomInactive("R1".into()).is_retryable());
        assert!(!Error::NotAuthenticated.is_retryable());
        assert!(!Error::AddressInUse("u1".into()).is_retryable());
    }

    #[test]
    fn identity_errors_convert() {
        let err: Error = IdentityError::InvalidCredential.into();
        assert!(matches!(err, Error::Identity(IdentityError::InvalidCredential)));
        assert_eq!(err.to_string(), "invalid credential");
    }
}
