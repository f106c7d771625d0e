//! Call transport contract.
//!
//! An address-based call/answer primitive. The mesh manager chooses session
//! ids; transports echo them back in events so late events from a replaced
//! call can be told apart from the live one.

use crate::error::Result;
use crate::media::{LocalStream, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type SessionId = String;

pub fn new_session_id() -> SessionId {
    format!("mc_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Media received from a remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub peer: String,
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// An offer from a remote peer awaiting `answer` or `reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCall {
    pub session: SessionId,
    pub remote: String,
}

#[derive(Debug)]
pub enum TransportEvent {
    IncomingCall(InboundCall),
    /// Remote media arrived or its track set changed.
    RemoteStream {
        session: SessionId,
        stream: RemoteStream,
    },
    CallClosed {
        session: SessionId,
        remote: String,
    },
    /// The local handle lost its signaling connection; calls may survive.
    Disconnected,
    Error(String),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// One established (or negotiating) call.
#[async_trait]
pub trait CallLink: Send + Sync {
    fn session(&self) -> &str;

    fn remote(&self) -> &str;

    /// Substitutes outbound tracks in place, without renegotiating.
    async fn replace_tracks(&self, stream: &LocalStream) -> Result<()>;

    /// Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait CallTransport: Send + Sync {
    /// Claims `local_id` and returns the address the transport confirmed.
    async fn register(&self, local_id: &str, events: TransportEvents) -> Result<String>;

    /// Restores the signaling connection after `Disconnected`.
    async fn reconnect(&self) -> Result<()>;

    async fn call(
        &self,
        session: &str,
        remote: &str,
        stream: &LocalStream,
    ) -> Result<Arc<dyn CallLink>>;

    /// `stream` is `None` for a receive-only answer.
    async fn answer(
        &self,
        inbound: &InboundCall,
        stream: Option<&LocalStream>,
    ) -> Result<Arc<dyn CallLink>>;

    async fn reject(&self, inbound: &InboundCall);

    /// Drops the local address and closes every call. Idempotent.
    async fn release(&self);
}
