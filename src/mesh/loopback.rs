//! In-process call transport.
//!
//! Every [`LoopbackTransport`] attached to the same [`LoopbackHub`] can call
//! every other. Media is delivered as track listings; nothing is encoded.

use super::transport::{
    CallLink, CallTransport, InboundCall, RemoteStream, RemoteTrack, SessionId, TransportEvent,
    TransportEvents,
};
use crate::error::{Error, Result};
use crate::media::LocalStream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

struct Endpoint {
    events: TransportEvents,
    connected: bool,
    reconnects: usize,
}

struct LoopbackCall {
    session: SessionId,
    caller: String,
    callee: String,
    caller_media: Mutex<Option<LocalStream>>,
    callee_media: Mutex<Option<LocalStream>>,
    answered: AtomicBool,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

impl LoopbackCall {
    fn media(&self, side: Side) -> MutexGuard<'_, Option<LocalStream>> {
        let slot = match side {
            Side::Caller => &self.caller_media,
            Side::Callee => &self.callee_media,
        };
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn address(&self, side: Side) -> &str {
        match side {
            Side::Caller => &self.caller,
            Side::Callee => &self.callee,
        }
    }
}

fn opposite(side: Side) -> Side {
    match side {
        Side::Caller => Side::Callee,
        Side::Callee => Side::Caller,
    }
}

fn remote_stream(peer: &str, media: &LocalStream) -> RemoteStream {
    RemoteStream {
        peer: peer.to_string(),
        id: media.id().to_string(),
        tracks: media
            .tracks()
            .iter()
            .map(|t| RemoteTrack {
                id: t.id().to_string(),
                kind: t.kind(),
            })
            .collect(),
    }
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<String, Endpoint>,
    calls: HashMap<SessionId, Arc<LoopbackCall>>,
    calls_placed: usize,
}

impl HubState {
    fn send(&self, address: &str, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(address) {
            let _ = endpoint.events.send(event);
        }
    }

    /// Delivers `from`'s media to the other side of the call.
    fn deliver(&self, call: &LoopbackCall, from: Side) {
        let media = call.media(from).clone();
        if let Some(media) = media {
            let to = opposite(from);
            self.send(
                call.address(to),
                TransportEvent::RemoteStream {
                    session: call.session.clone(),
                    stream: remote_stream(call.address(from), &media),
                },
            );
        }
    }

    fn close(&mut self, session: &str) {
        let Some(call) = self.calls.remove(session) else {
            return;
        };
        if call.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session, caller = %call.caller, callee = %call.callee, "loopback call closed");
        self.send(
            &call.caller,
            TransportEvent::CallClosed {
                session: call.session.clone(),
                remote: call.callee.clone(),
            },
        );
        self.send(
            &call.callee,
            TransportEvent::CallClosed {
                session: call.session.clone(),
                remote: call.caller.clone(),
            },
        );
    }
}

/// Shared switchboard for loopback transports.
#[derive(Default)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.lock().endpoints.contains_key(address)
    }

    /// Total calls ever placed through the hub.
    pub fn calls_placed(&self) -> usize {
        self.lock().calls_placed
    }

    /// Calls currently open between `a` and `b`, in either direction.
    pub fn open_calls_between(&self, a: &str, b: &str) -> usize {
        self.lock()
            .calls
            .values()
            .filter(|c| {
                (c.caller == a && c.callee == b) || (c.caller == b && c.callee == a)
            })
            .count()
    }

    /// Simulates a dropped signaling connection for `address`.
    pub fn disconnect(&self, address: &str) {
        let mut state = self.lock();
        if let Some(endpoint) = state.endpoints.get_mut(address) {
            endpoint.connected = false;
            let _ = endpoint.events.send(TransportEvent::Disconnected);
        }
    }

    pub fn reconnects(&self, address: &str) -> usize {
        self.lock()
            .endpoints
            .get(address)
            .map_or(0, |e| e.reconnects)
    }
}

pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    local: Mutex<Option<String>>,
}

impl LoopbackTransport {
    pub fn new(hub: Arc<LoopbackHub>) -> Self {
        Self {
            hub,
            local: Mutex::new(None),
        }
    }

    fn local(&self) -> Option<String> {
        self.local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_local(&self, address: Option<String>) {
        *self
            .local
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = address;
    }
}

struct LoopbackLink {
    hub: Arc<LoopbackHub>,
    call: Arc<LoopbackCall>,
    side: Side,
}

#[async_trait]
impl CallLink for LoopbackLink {
    fn session(&self) -> &str {
        &self.call.session
    }

    fn remote(&self) -> &str {
        self.call.address(opposite(self.side))
    }

    async fn replace_tracks(&self, stream: &LocalStream) -> Result<()> {
        if self.call.closed.load(Ordering::SeqCst) {
            return Err(Error::call_failed(self.remote(), "call closed"));
        }
        *self.call.media(self.side) = Some(stream.clone());
        if self.call.answered.load(Ordering::SeqCst) {
            self.hub.lock().deliver(&self.call, self.side);
        }
        Ok(())
    }

    async fn close(&self) {
        self.hub.lock().close(&self.call.session);
    }
}

#[async_trait]
impl CallTransport for LoopbackTransport {
    async fn register(&self, local_id: &str, events: TransportEvents) -> Result<String> {
        let mut state = self.hub.lock();
        if state.endpoints.contains_key(local_id) {
            return Err(Error::AddressInUse(local_id.to_string()));
        }
        state.endpoints.insert(
            local_id.to_string(),
            Endpoint {
                events,
                connected: true,
                reconnects: 0,
            },
        );
        drop(state);
        self.set_local(Some(local_id.to_string()));
        Ok(local_id.to_string())
    }

    async fn reconnect(&self) -> Result<()> {
        let local = self
            .local()
            .ok_or_else(|| Error::TransportUnavailable("not registered".to_string()))?;
        let mut state = self.hub.lock();
        let endpoint = state
            .endpoints
            .get_mut(&local)
            .ok_or_else(|| Error::TransportUnavailable("handle released".to_string()))?;
        endpoint.connected = true;
        endpoint.reconnects += 1;
        Ok(())
    }

    async fn call(
        &self,
        session: &str,
        remote: &str,
        stream: &LocalStream,
    ) -> Result<Arc<dyn CallLink>> {
        let local = self
            .local()
            .ok_or_else(|| Error::TransportUnavailable("not registered".to_string()))?;
        let mut state = self.hub.lock();
        match state.endpoints.get(&local) {
            Some(endpoint) if endpoint.connected => {}
            _ => return Err(Error::TransportUnavailable("signaling offline".to_string())),
        }
        match state.endpoints.get(remote) {
            Some(endpoint) if endpoint.connected => {}
            _ => return Err(Error::call_failed(remote, "peer unavailable")),
        }

        let call = Arc::new(LoopbackCall {
            session: session.to_string(),
            caller: local.clone(),
            callee: remote.to_string(),
            caller_media: Mutex::new(Some(stream.clone())),
            callee_media: Mutex::new(None),
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        state.calls.insert(session.to_string(), call.clone());
        state.calls_placed += 1;
        state.send(
            remote,
            TransportEvent::IncomingCall(InboundCall {
                session: session.to_string(),
                remote: local,
            }),
        );
        Ok(Arc::new(LoopbackLink {
            hub: self.hub.clone(),
            call,
            side: Side::Caller,
        }))
    }

    async fn answer(
        &self,
        inbound: &InboundCall,
        stream: Option<&LocalStream>,
    ) -> Result<Arc<dyn CallLink>> {
        let state = self.hub.lock();
        let call = state
            .calls
            .get(&inbound.session)
            .cloned()
            .ok_or_else(|| Error::call_failed(&inbound.remote, "offer withdrawn"))?;
        *call.media(Side::Callee) = stream.cloned();
        call.answered.store(true, Ordering::SeqCst);
        state.deliver(&call, Side::Caller);
        state.deliver(&call, Side::Callee);
        Ok(Arc::new(LoopbackLink {
            hub: self.hub.clone(),
            call,
            side: Side::Callee,
        }))
    }

    async fn reject(&self, inbound: &InboundCall) {
        let mut state = self.hub.lock();
        if let Some(call) = state.calls.remove(&inbound.session) {
            if !call.closed.swap(true, Ordering::SeqCst) {
                state.send(
                    &call.caller,
                    TransportEvent::CallClosed {
                        session: call.session.clone(),
                        remote: call.callee.clone(),
                    },
                );
            }
        }
    }

    async fn release(&self) {
        let Some(local) = self.local() else {
            return;
        };
        self.set_local(None);
        let mut state = self.hub.lock();
        let sessions: Vec<SessionId> = state
            .calls
            .values()
            .filter(|c| c.caller == local || c.callee == local)
            .map(|c| c.session.clone())
            .collect();
        for session in sessions {
            state.close(&session);
        }
        state.endpoints.remove(&local);
    }
}
