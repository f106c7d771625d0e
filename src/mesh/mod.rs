//! Peer mesh: one call session per remote participant.
//!
//! The [`MeshManager`] owns the local transport handle and a registry keyed by
//! remote address. Each address is `Pending` (call placed or answered, no
//! media yet), `Active` (remote media flowing) or `Absent`. Concurrent
//! `call_peer`s for one address share the in-flight attempt.
//!
//! When both sides call each other at once, the call placed by the lower
//! address wins: the lower side rejects the inbound offer, the higher side
//! drops its own attempt and hands its waiters to the inbound session.

pub mod loopback;
pub mod monitor;
pub mod signaling;
pub mod transport;
pub mod webrtc;

pub use loopback::{LoopbackHub, LoopbackTransport};
pub use monitor::{TransportMonitor, TransportState, TransportStatus};
pub use transport::{
    new_session_id, CallLink, CallTransport, InboundCall, RemoteStream, RemoteTrack, SessionId,
    TransportEvent,
};
pub use webrtc::WebRtcTransport;

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::media::LocalStream;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Notifications raised by the mesh.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Remote media became available or changed.
    RemoteStream { peer: String, stream: RemoteStream },
    PeerDisconnected { peer: String },
    /// Transport-level failure; never fatal to the process.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outbound,
    Inbound,
}

type Waiter = oneshot::Sender<Result<RemoteStream>>;

struct Session {
    id: SessionId,
    direction: Direction,
    link: Option<Arc<dyn CallLink>>,
    stream: Option<RemoteStream>,
    waiters: Vec<Waiter>,
}

impl Session {
    fn new(id: SessionId, direction: Direction) -> Self {
        Self {
            id,
            direction,
            link: None,
            stream: None,
            waiters: Vec::new(),
        }
    }

    fn state(&self) -> SessionState {
        if self.stream.is_some() {
            SessionState::Active
        } else {
            SessionState::Pending
        }
    }

    fn fail_waiters(&mut self, peer: &str, reason: &str) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(Error::call_failed(peer, reason)));
        }
    }

    /// Fails outstanding waiters and closes the link.
    async fn discard(mut self, peer: &str, reason: &str) {
        self.fail_waiters(peer, reason);
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }
}

#[derive(Default)]
struct MeshState {
    local_address: Option<String>,
    local_media: Option<LocalStream>,
    sessions: HashMap<String, Session>,
    destroyed: bool,
    reconnecting: bool,
    pump_cancel: Option<CancellationToken>,
}

struct Inner {
    transport: Arc<dyn CallTransport>,
    config: MeshConfig,
    state: Mutex<MeshState>,
    events: mpsc::UnboundedSender<MeshEvent>,
    monitor: TransportMonitor,
}

/// Cheaply cloneable handle; clones share one registry.
#[derive(Clone)]
pub struct MeshManager {
    inner: Arc<Inner>,
}

impl MeshManager {
    pub fn new(
        transport: Arc<dyn CallTransport>,
        config: MeshConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            transport,
            config,
            state: Mutex::new(MeshState::default()),
            events,
            monitor: TransportMonitor::new(),
        });
        (Self { inner }, rx)
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Status of the local transport handle.
    pub fn transport_status(&self) -> watch::Receiver<TransportStatus> {
        self.inner.monitor.subscribe()
    }

    /// Registers the local handle under `local_id`.
    ///
    /// The confirmed address must equal `local_id`: remote participants call
    /// the principal id directly.
    #[instrument(skip(self))]
    pub async fn initialize(&self, local_id: &str) -> Result<String> {
        {
            let state = self.inner.state.lock().await;
            if state.local_address.is_some() {
                return Err(Error::InvalidRequest(
                    "mesh already initialized; destroy it first".to_string(),
                ));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.monitor.update_state(TransportState::Connecting);
        let confirmed = match self.inner.transport.register(local_id, tx).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                self.inner.monitor.set_error(e.to_string());
                return Err(e);
            }
        };
        if confirmed != local_id {
            self.inner.transport.release().await;
            let err = Error::AddressMismatch {
                requested: local_id.to_string(),
                confirmed,
            };
            self.inner.monitor.set_error(err.to_string());
            return Err(err);
        }

        let cancel = CancellationToken::new();
        {
            let mut state = self.inner.state.lock().await;
            state.local_address = Some(confirmed.clone());
            state.destroyed = false;
            state.pump_cancel = Some(cancel.clone());
        }
        self.inner.monitor.connected(&confirmed);
        tokio::spawn(pump(Arc::downgrade(&self.inner), rx, cancel));
        info!(address = %confirmed, "mesh handle open");
        Ok(confirmed)
    }

    pub async fn local_address(&self) -> Option<String> {
        self.inner.state.lock().await.local_address.clone()
    }

    /// Stream offered on future outbound calls and used to answer inbound
    /// ones. Open sessions are unaffected.
    pub async fn set_local_media(&self, stream: LocalStream) {
        self.inner.state.lock().await.local_media = Some(stream);
    }

    pub async fn session_state(&self, peer: &str) -> SessionState {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(peer)
            .map_or(SessionState::Absent, Session::state)
    }

    /// Addresses with a pending or active session.
    pub async fn session_addresses(&self) -> Vec<String> {
        self.inner.state.lock().await.sessions.keys().cloned().collect()
    }

    pub async fn remote_stream(&self, peer: &str) -> Option<RemoteStream> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(peer)
            .and_then(|s| s.stream.clone())
    }

    /// Calls `peer` unless a session already exists, resolving with the
    /// remote stream. Callers racing on one address share a single attempt.
    #[instrument(skip(self))]
    pub async fn call_peer(&self, peer: &str) -> Result<RemoteStream> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            if state.destroyed || state.local_address.is_none() {
                return Err(Error::call_failed(peer, "mesh not initialized"));
            }
            if state.local_address.as_deref() == Some(peer) {
                return Err(Error::InvalidRequest("cannot call the local address".to_string()));
            }
            let media = state
                .local_media
                .clone()
                .ok_or_else(|| Error::call_failed(peer, "local media not set"))?;

            if let Some(existing) = state.sessions.get_mut(peer) {
                if let Some(stream) = &existing.stream {
                    return Ok(stream.clone());
                }
                debug!(session = %existing.id, "joining in-flight call");
                existing.waiters.push(tx);
                drop(state);
                return self.await_outcome(peer, rx).await;
            }

            // Placed under the registry lock so an inbound call from `peer`
            // never races a reservation that has not reached the wire yet.
            let session_id = new_session_id();
            let link = self
                .inner
                .transport
                .call(&session_id, peer, &media)
                .await
                .map_err(|e| match e {
                    Error::CallFailed { .. } => e,
                    other => Error::call_failed(peer, other.to_string()),
                })?;
            let mut session = Session::new(session_id, Direction::Outbound);
            session.link = Some(link);
            session.waiters.push(tx);
            state.sessions.insert(peer.to_string(), session);
        }

        self.await_outcome(peer, rx).await
    }

    async fn await_outcome(
        &self,
        peer: &str,
        rx: oneshot::Receiver<Result<RemoteStream>>,
    ) -> Result<RemoteStream> {
        match tokio::time::timeout(self.inner.config.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::call_failed(peer, "session discarded")),
            Err(_) => {
                let stale = {
                    let mut state = self.inner.state.lock().await;
                    match state.sessions.get(peer).map(Session::state) {
                        Some(SessionState::Pending) => state.sessions.remove(peer),
                        _ => None,
                    }
                };
                if let Some(session) = stale {
                    warn!(peer, session = %session.id, "call negotiation timed out");
                    session.discard(peer, "timed out").await;
                }
                Err(Error::call_failed(peer, "timed out"))
            }
        }
    }

    /// Swaps outbound tracks on every open session and makes `stream` the
    /// default for future calls.
    pub async fn replace_local_media(&self, stream: LocalStream) {
        let links: Vec<Arc<dyn CallLink>> = {
            let mut state = self.inner.state.lock().await;
            state.local_media = Some(stream.clone());
            state
                .sessions
                .values()
                .filter_map(|s| s.link.clone())
                .collect()
        };
        for link in links {
            if let Err(e) = link.replace_tracks(&stream).await {
                warn!(peer = %link.remote(), error = %e, "track replacement failed");
            }
        }
    }

    /// Closes the session to `peer`, if any.
    pub async fn close_session(&self, peer: &str) {
        let removed = self.inner.state.lock().await.sessions.remove(peer);
        if let Some(session) = removed {
            debug!(peer, session = %session.id, "closing session");
            session.discard(peer, "session closed").await;
        }
    }

    /// Closes every session, releases the local handle and stops local media.
    /// Idempotent.
    #[instrument(skip(self))]
    pub async fn destroy(&self) {
        let (sessions, cancel, media, was_open) = {
            let mut state = self.inner.state.lock().await;
            let was_open = state.local_address.take().is_some();
            state.destroyed = true;
            (
                std::mem::take(&mut state.sessions),
                state.pump_cancel.take(),
                state.local_media.take(),
                was_open,
            )
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        for (peer, session) in sessions {
            session.discard(&peer, "mesh destroyed").await;
        }
        if was_open {
            self.inner.transport.release().await;
            self.inner.monitor.closed();
            info!("mesh handle released");
        }
        if let Some(media) = media {
            media.stop();
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingCall(inbound) => self.handle_inbound(inbound).await,
            TransportEvent::RemoteStream { session, stream } => {
                let peer = stream.peer.clone();
                let mut state = self.inner.state.lock().await;
                let Some(entry) = state.sessions.get_mut(&peer) else {
                    return;
                };
                if entry.id != session {
                    debug!(%peer, %session, "media for a replaced session ignored");
                    return;
                }
                entry.stream = Some(stream.clone());
                for waiter in entry.waiters.drain(..) {
                    let _ = waiter.send(Ok(stream.clone()));
                }
                drop(state);
                self.emit(MeshEvent::RemoteStream { peer, stream });
            }
            TransportEvent::CallClosed { session, remote } => {
                let removed = {
                    let mut state = self.inner.state.lock().await;
                    let owned = matches!(state.sessions.get(&remote), Some(s) if s.id == session);
                    if owned {
                        state.sessions.remove(&remote)
                    } else {
                        None
                    }
                };
                if let Some(session) = removed {
                    info!(peer = %remote, "peer disconnected");
                    session.discard(&remote, "remote closed the call").await;
                    self.emit(MeshEvent::PeerDisconnected { peer: remote });
                }
            }
            TransportEvent::Disconnected => self.schedule_reconnect().await,
            TransportEvent::Error(message) => {
                warn!(%message, "transport error");
                self.emit(MeshEvent::Error(message));
            }
        }
    }

    async fn handle_inbound(&self, inbound: InboundCall) {
        let peer = inbound.remote.clone();
        let (media, displaced) = {
            let mut state = self.inner.state.lock().await;
            if state.destroyed {
                drop(state);
                self.inner.transport.reject(&inbound).await;
                return;
            }
            let local = state.local_address.clone().unwrap_or_default();
            // Glare only concerns calls still negotiating. A fresh call over
            // an established one means the peer reconnected.
            let keep_ours = matches!(
                state.sessions.get(&peer),
                Some(s) if s.direction == Direction::Outbound
                    && s.state() == SessionState::Pending
                    && local.as_str() < peer.as_str()
            );
            if keep_ours {
                drop(state);
                debug!(%peer, "simultaneous calls: keeping our outbound call");
                self.inner.transport.reject(&inbound).await;
                return;
            }

            let mut session = Session::new(inbound.session.clone(), Direction::Inbound);
            let mut displaced = state.sessions.remove(&peer);
            if let Some(old) = displaced.as_mut() {
                session.waiters = std::mem::take(&mut old.waiters);
            }
            state.sessions.insert(peer.clone(), session);
            (state.local_media.clone(), displaced)
        };

        if let Some(old) = displaced {
            debug!(%peer, old = %old.id, new = %inbound.session, "inbound call replaces session");
            old.discard(&peer, "replaced by inbound call").await;
        }

        info!(%peer, session = %inbound.session, "answering inbound call");
        match self.inner.transport.answer(&inbound, media.as_ref()).await {
            Ok(link) => {
                let mut state = self.inner.state.lock().await;
                match state.sessions.get_mut(&peer) {
                    Some(session) if session.id == inbound.session => session.link = Some(link),
                    _ => {
                        drop(state);
                        link.close().await;
                    }
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "answer failed");
                let removed = {
                    let mut state = self.inner.state.lock().await;
                    let owned = matches!(state.sessions.get(&peer), Some(s) if s.id == inbound.session);
                    if owned {
                        state.sessions.remove(&peer)
                    } else {
                        None
                    }
                };
                if let Some(session) = removed {
                    session.discard(&peer, &e.to_string()).await;
                }
                self.emit(MeshEvent::Error(e.to_string()));
            }
        }
    }

    async fn schedule_reconnect(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.destroyed || state.reconnecting {
                return;
            }
            state.reconnecting = true;
        }
        warn!("transport disconnected, attempting reconnect");

        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.reconnect_delay;
        let max_attempts = self.inner.config.max_reconnect_attempts;
        tokio::spawn(async move {
            for attempt in 1..=max_attempts {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let address = {
                    let mut state = inner.state.lock().await;
                    if state.destroyed {
                        state.reconnecting = false;
                        return;
                    }
                    state.local_address.clone().unwrap_or_default()
                };
                inner.monitor.reconnect_attempt(attempt);
                match inner.transport.reconnect().await {
                    Ok(()) => {
                        info!(attempt, "transport reconnected");
                        inner.monitor.connected(&address);
                        inner.state.lock().await.reconnecting = false;
                        return;
                    }
                    Err(e) => warn!(attempt, error = %e, "reconnect failed"),
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().await.reconnecting = false;
                inner.monitor.set_error("transport reconnection abandoned");
                let _ = inner
                    .events
                    .send(MeshEvent::Error("transport reconnection abandoned".to_string()));
            }
        });
    }
}

async fn pump(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        MeshManager { inner }.handle_transport_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaSource, SyntheticCapture, TrackKind};
    use std::time::Duration;

    fn config() -> MeshConfig {
        MeshConfig {
            call_timeout: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: 3,
            snapshot_timeout: Duration::from_secs(1),
        }
    }

    async fn local_media() -> LocalStream {
        MediaSource::new(Arc::new(SyntheticCapture::new()))
            .acquire(false, true)
            .await
            .unwrap()
    }

    async fn peer(
        hub: &Arc<LoopbackHub>,
        address: &str,
    ) -> (MeshManager, mpsc::UnboundedReceiver<MeshEvent>) {
        let (mesh, events) =
            MeshManager::new(Arc::new(LoopbackTransport::new(hub.clone())), config());
        mesh.initialize(address).await.unwrap();
        mesh.set_local_media(local_media().await).await;
        (mesh, events)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<MeshEvent>) -> MeshEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timed out")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn address_in_use_is_fatal_to_initialize() {
        let hub = LoopbackHub::new();
        let _first = peer(&hub, "u1").await;
        let (second, _) = MeshManager::new(Arc::new(LoopbackTransport::new(hub.clone())), config());
        assert!(matches!(
            second.initialize("u1").await,
            Err(Error::AddressInUse(_))
        ));
    }

    #[tokio::test]
    async fn call_and_auto_answer() {
        let hub = LoopbackHub::new();
        let (a, _a_events) = peer(&hub, "addr-a").await;
        let (b, mut b_events) = peer(&hub, "addr-b").await;

        let stream = a.call_peer("addr-b").await.unwrap();
        assert_eq!(stream.peer, "addr-b");
        assert!(stream.has(TrackKind::Audio));
        assert!(stream.has(TrackKind::Video));
        assert_eq!(a.session_state("addr-b").await, SessionState::Active);

        match next_event(&mut b_events).await {
            MeshEvent::RemoteStream { peer, .. } => assert_eq!(peer, "addr-a"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(b.session_state("addr-a").await, SessionState::Active);
        assert_eq!(hub.open_calls_between("addr-a", "addr-b"), 1);
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_session() {
        let hub = LoopbackHub::new();
        let (a, _a_events) = peer(&hub, "addr-a").await;
        let (_b, _b_events) = peer(&hub, "addr-b").await;

        let (first, second) = tokio::join!(a.call_peer("addr-b"), a.call_peer("addr-b"));
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(hub.calls_placed(), 1);
        assert_eq!(a.session_addresses().await, vec!["addr-b".to_string()]);

        // A live session turns further calls into no-ops.
        a.call_peer("addr-b").await.unwrap();
        assert_eq!(hub.calls_placed(), 1);
    }

    #[tokio::test]
    async fn simultaneous_calls_converge_to_one_session() {
        let hub = LoopbackHub::new();
        let (a, _a_events) = peer(&hub, "addr-a").await;
        let (b, _b_events) = peer(&hub, "addr-b").await;

        let (from_a, from_b) = tokio::join!(a.call_peer("addr-b"), b.call_peer("addr-a"));
        assert_eq!(from_a.unwrap().peer, "addr-b");
        assert_eq!(from_b.unwrap().peer, "addr-a");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.open_calls_between("addr-a", "addr-b"), 1);
        assert_eq!(a.session_state("addr-b").await, SessionState::Active);
        assert_eq!(b.session_state("addr-a").await, SessionState::Active);
    }

    #[tokio::test]
    async fn fresh_call_replaces_an_established_session() {
        let hub = LoopbackHub::new();
        let (a, mut a_events) = peer(&hub, "addr-a").await;
        // The far end is driven by hand so its first call is never reported closed.
        let far = LoopbackTransport::new(hub.clone());
        let (tx, mut far_events) = mpsc::unbounded_channel();
        far.register("addr-b", tx).await.unwrap();
        let media = local_media().await;

        let calling = {
            let a = a.clone();
            tokio::spawn(async move { a.call_peer("addr-b").await })
        };
        let first = match far_events.recv().await {
            Some(TransportEvent::IncomingCall(inbound)) => inbound,
            other => panic!("unexpected event {other:?}"),
        };
        let _first_link = far.answer(&first, Some(&media)).await.unwrap();
        calling.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut a_events).await, MeshEvent::RemoteStream { .. }));
        assert_eq!(a.session_state("addr-b").await, SessionState::Active);

        // addr-b sorts after addr-a, so only a live session is at stake here.
        let second = new_session_id();
        let _second_link = far.call(&second, "addr-a", &media).await.unwrap();

        match next_event(&mut a_events).await {
            MeshEvent::RemoteStream { peer, .. } => assert_eq!(peer, "addr-b"),
            other => panic!("unexpected event {other:?}"),
        }
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match far_events.recv().await {
                    Some(TransportEvent::CallClosed { session, .. }) => break session,
                    Some(_) => continue,
                    None => panic!("transport events closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(closed, first.session);
        assert_eq!(hub.open_calls_between("addr-a", "addr-b"), 1);
        assert_eq!(a.session_state("addr-b").await, SessionState::Active);
        assert_eq!(a.session_addresses().await, vec!["addr-b".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_peer_fails_and_leaves_no_session() {
        let hub = LoopbackHub::new();
        let (a, _a_events) = peer(&hub, "addr-a").await;

        let err = a.call_peer("ghost").await.unwrap_err();
        assert!(matches!(err, Error::CallFailed { .. }));
        assert_eq!(a.session_state("ghost").await, SessionState::Absent);
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let hub = LoopbackHub::new();
        let (a, _a_events) = peer(&hub, "addr-a").await;
        // Registered but nobody processes its events, so the offer is never answered.
        let silent = LoopbackTransport::new(hub.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        silent.register("silent", tx).await.unwrap();

        let err = a.call_peer("silent").await.unwrap_err();
        assert!(matches!(err, Error::CallFailed { ref reason, .. } if reason == "timed out"));
        assert_eq!(a.session_state("silent").await, SessionState::Absent);
        assert_eq!(hub.open_calls_between("addr-a", "silent"), 0);
    }

    #[tokio::test]
    async fn remote_close_raises_disconnect() {
        let hub = LoopbackHub::new();
        let (a, mut a_events) = peer(&hub, "addr-a").await;
        let (b, _b_events) = peer(&hub, "addr-b").await;
        a.call_peer("addr-b").await.unwrap();
        assert!(matches!(next_event(&mut a_events).await, MeshEvent::RemoteStream { .. }));

        b.close_session("addr-a").await;
        assert_eq!(
            next_event(&mut a_events).await,
            MeshEvent::PeerDisconnected {
                peer: "addr-b".to_string()
            }
        );
        assert_eq!(a.session_state("addr-b").await, SessionState::Absent);
        // Closing again is a no-op.
        b.close_session("addr-a").await;
    }

    #[tokio::test]
    async fn replace_media_reaches_open_sessions() {
        let hub = LoopbackHub::new();
        let (a, _a_events) = peer(&hub, "addr-a").await;
        let (b, mut b_events) = peer(&hub, "addr-b").await;
        a.call_peer("addr-b").await.unwrap();
        let before = match next_event(&mut b_events).await {
            MeshEvent::RemoteStream { stream, .. } => stream,
            other => panic!("unexpected event {other:?}"),
        };

        let mut source = MediaSource::new(Arc::new(SyntheticCapture::new()));
        let replacement = source.acquire(true, true).await.unwrap();
        a.replace_local_media(replacement.clone()).await;

        let after = match next_event(&mut b_events).await {
            MeshEvent::RemoteStream { stream, .. } => stream,
            other => panic!("unexpected event {other:?}"),
        };
        assert_ne!(before.tracks, after.tracks);
        assert_eq!(after.id, replacement.id());
        assert_eq!(b.remote_stream("addr-a").await, Some(after));
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_releases_everything() {
        let hub = LoopbackHub::new();
        let (a, _a_events) = peer(&hub, "addr-a").await;
        let (b, mut b_events) = peer(&hub, "addr-b").await;
        a.call_peer("addr-b").await.unwrap();
        assert!(matches!(next_event(&mut b_events).await, MeshEvent::RemoteStream { .. }));

        a.destroy().await;
        a.destroy().await;
        assert!(!hub.is_registered("addr-a"));
        assert!(a.session_addresses().await.is_empty());
        assert!(matches!(
            next_event(&mut b_events).await,
            MeshEvent::PeerDisconnected { .. }
        ));
        assert_eq!(b.session_state("addr-a").await, SessionState::Absent);
        assert!(a.call_peer("addr-b").await.is_err());

        // The address can be claimed again after an explicit destroy.
        a.initialize("addr-a").await.unwrap();
        assert!(hub.is_registered("addr-a"));
    }

    #[tokio::test]
    async fn reconnects_after_transient_disconnect_but_not_after_destroy() {
        let hub = LoopbackHub::new();
        let (a, _a_events) = peer(&hub, "addr-a").await;

        let status = a.transport_status();
        assert_eq!(status.borrow().state, TransportState::Connected);

        hub.disconnect("addr-a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hub.reconnects("addr-a"), 1);
        assert_eq!(status.borrow().state, TransportState::Connected);
        assert_eq!(status.borrow().address.as_deref(), Some("addr-a"));

        a.destroy().await;
        assert_eq!(status.borrow().state, TransportState::Closed);
        hub.disconnect("addr-a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!hub.is_registered("addr-a"));
    }
}
