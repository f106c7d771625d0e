//! `webrtc`-crate call transport.
//!
//! One `RTCPeerConnection` per call, negotiated through a PeerJS-compatible
//! signaling server. Local tracks are published as `TrackLocalStaticSample`s
//! (opus / VP8); swapping a track uses `RTCRtpSender::replace_track`, so no
//! renegotiation is needed. Samples are written by the capture pipeline
//! through [`WebRtcLink::local_track`].

use super::signaling::{SignalMessage, SignalingClient};
use super::transport::{
    CallLink, CallTransport, InboundCall, RemoteStream, RemoteTrack, SessionId, TransportEvent,
    TransportEvents,
};
use crate::config::SignalingConfig;
use crate::error::{Error, Result};
use crate::media::{LocalStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    RTCRtpCodecCapability {
        mime_type: mime_type.to_owned(),
        ..Default::default()
    }
}

fn track_kind(codec: RTPCodecType) -> Option<TrackKind> {
    match codec {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

fn local_track(track: &MediaTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        codec_for(track.kind()),
        track.id().to_string(),
        stream_id.to_string(),
    ))
}

/// Inbound offer waiting for `answer` / `reject`.
struct PendingOffer {
    remote: String,
    sdp: RTCSessionDescription,
    candidates: Vec<RTCIceCandidateInit>,
}

struct Shared {
    api: API,
    config: SignalingConfig,
    local: StdMutex<Option<String>>,
    events: StdMutex<Option<TransportEvents>>,
    signaling: StdMutex<Option<SignalingClient>>,
    /// Bumped per signaling socket so a stale reader stays quiet.
    generation: AtomicU64,
    calls: StdMutex<HashMap<SessionId, Arc<WebRtcLink>>>,
    offers: StdMutex<HashMap<SessionId, PendingOffer>>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    fn send(&self, msg: SignalMessage) -> Result<()> {
        match lock(&self.signaling).as_ref() {
            Some(client) => client.send(msg),
            None => Err(Error::TransportUnavailable("signaling offline".into())),
        }
    }

    fn local(&self) -> Result<String> {
        lock(&self.local)
            .clone()
            .ok_or_else(|| Error::TransportUnavailable("not registered".into()))
    }

    fn call(&self, session: &str) -> Option<Arc<WebRtcLink>> {
        lock(&self.calls).get(session).cloned()
    }

    /// Drops every call and pending offer involving `remote`.
    async fn drop_peer(&self, remote: &str) {
        lock(&self.offers).retain(|_, offer| offer.remote != remote);
        let links: Vec<Arc<WebRtcLink>> = lock(&self.calls)
            .values()
            .filter(|link| link.remote == remote)
            .cloned()
            .collect();
        for link in links {
            link.close().await;
        }
    }

    async fn handle_message(&self, msg: SignalMessage) {
        match msg {
            SignalMessage::Offer {
                src: Some(src),
                payload,
                ..
            } => {
                debug!(peer = %src, session = %payload.connection_id, "offer received");
                lock(&self.offers).insert(
                    payload.connection_id.clone(),
                    PendingOffer {
                        remote: src.clone(),
                        sdp: payload.sdp,
                        candidates: Vec::new(),
                    },
                );
                self.emit(TransportEvent::IncomingCall(InboundCall {
                    session: payload.connection_id,
                    remote: src,
                }));
            }
            SignalMessage::Answer { payload, .. } => {
                let Some(link) = self.call(&payload.connection_id) else {
                    debug!(session = %payload.connection_id, "answer for unknown call");
                    return;
                };
                if let Err(e) = link.accept_answer(payload.sdp).await {
                    warn!(session = %link.session, error = %e, "could not apply answer");
                    link.close().await;
                }
            }
            SignalMessage::Candidate { payload, .. } => {
                if let Some(link) = self.call(&payload.connection_id) {
                    link.add_candidate(payload.candidate).await;
                } else if let Some(offer) = lock(&self.offers).get_mut(&payload.connection_id) {
                    offer.candidates.push(payload.candidate);
                }
            }
            SignalMessage::Leave { src: Some(src), .. } => {
                info!(peer = %src, "peer left signaling server");
                self.drop_peer(&src).await;
            }
            SignalMessage::Expire { src: Some(src), .. } => {
                warn!(peer = %src, "signaling message expired undelivered");
                self.drop_peer(&src).await;
            }
            SignalMessage::Error { payload } | SignalMessage::InvalidKey { payload } => {
                let message = payload.map(|p| p.msg).unwrap_or_default();
                self.emit(TransportEvent::Error(message));
            }
            SignalMessage::Heartbeat | SignalMessage::Open | SignalMessage::IdTaken { .. } => {}
            other => debug!(?other, "ignoring signaling message"),
        }
    }
}

/// Feeds relayed messages into the transport until the socket drops.
fn spawn_reader(
    shared: Weak<Shared>,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<SignalMessage>,
) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.handle_message(msg).await;
        }
        if let Some(shared) = shared.upgrade() {
            let current = shared.generation.load(Ordering::SeqCst) == generation;
            let registered = lock(&shared.local).is_some();
            if current && registered {
                warn!("signaling socket dropped");
                shared.emit(TransportEvent::Disconnected);
            }
        }
    });
}

pub struct WebRtcLink {
    session: SessionId,
    remote: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<(TrackKind, Arc<RTCRtpSender>)>>,
    local_tracks: StdMutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    remote_tracks: StdMutex<Vec<RemoteTrack>>,
    buffered: Mutex<Vec<RTCIceCandidateInit>>,
    closed: AtomicBool,
    shared: Weak<Shared>,
}

impl WebRtcLink {
    /// Sample sink for the local `track_id`, while it is published.
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        lock(&self.local_tracks).get(track_id).cloned()
    }

    async fn publish(&self, stream: &LocalStream) -> Result<()> {
        let mut senders = self.senders.lock().await;
        for track in stream.tracks() {
            let local = local_track(&track, stream.id());
            let sender = self
                .pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            lock(&self.local_tracks).insert(track.id().to_string(), local);
            senders.push((track.kind(), sender));
        }
        Ok(())
    }

    async fn accept_answer(&self, sdp: RTCSessionDescription) -> Result<()> {
        self.pc.set_remote_description(sdp).await?;
        let pending: Vec<RTCIceCandidateInit> = self.buffered.lock().await.drain(..).collect();
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                debug!(session = %self.session, error = %e, "dropping candidate");
            }
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: RTCIceCandidateInit) {
        if self.pc.remote_description().await.is_none() {
            self.buffered.lock().await.push(candidate);
            return;
        }
        if let Err(e) = self.pc.add_ice_candidate(candidate).await {
            debug!(session = %self.session, error = %e, "dropping candidate");
        }
    }

    fn remote_stream(&self, stream_id: String) -> RemoteStream {
        RemoteStream {
            peer: self.remote.clone(),
            id: stream_id,
            tracks: lock(&self.remote_tracks).clone(),
        }
    }
}

#[async_trait]
impl CallLink for WebRtcLink {
    fn session(&self) -> &str {
        &self.session
    }

    fn remote(&self) -> &str {
        &self.remote
    }

    async fn replace_tracks(&self, stream: &LocalStream) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::call_failed(&self.remote, "call closed"));
        }
        let senders = self.senders.lock().await;
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let replacement = stream.first_track(kind);
            for (_, sender) in senders.iter().filter(|(k, _)| *k == kind) {
                let next = replacement.as_ref().map(|track| {
                    let local = local_track(track, stream.id());
                    lock(&self.local_tracks).insert(track.id().to_string(), local.clone());
                    local as Arc<dyn TrackLocal + Send + Sync>
                });
                sender.replace_track(next).await?;
            }
        }
        debug!(session = %self.session, "outbound tracks replaced");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            debug!(session = %self.session, error = %e, "peer connection close failed");
        }
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.calls).remove(&self.session);
            shared.emit(TransportEvent::CallClosed {
                session: self.session.clone(),
                remote: self.remote.clone(),
            });
        }
    }
}

pub struct WebRtcTransport {
    shared: Arc<Shared>,
}

impl WebRtcTransport {
    pub fn new(config: SignalingConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            shared: Arc::new(Shared {
                api,
                config,
                local: StdMutex::new(None),
                events: StdMutex::new(None),
                signaling: StdMutex::new(None),
                generation: AtomicU64::new(0),
                calls: StdMutex::new(HashMap::new()),
                offers: StdMutex::new(HashMap::new()),
            }),
        })
    }

    async fn open_signaling(&self, id: &str) -> Result<()> {
        let (client, rx) = SignalingClient::open(&self.shared.config, id).await?;
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.shared.signaling) = Some(client);
        spawn_reader(Arc::downgrade(&self.shared), generation, rx);
        Ok(())
    }

    /// New peer connection with candidate, track and state handlers wired to
    /// `session`.
    async fn new_link(&self, session: &str, remote: &str) -> Result<Arc<WebRtcLink>> {
        let config = RTCConfiguration {
            ice_servers: self.shared.config.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(self.shared.api.new_peer_connection(config).await?);
        let link = Arc::new(WebRtcLink {
            session: session.to_string(),
            remote: remote.to_string(),
            pc: pc.clone(),
            senders: Mutex::new(Vec::new()),
            local_tracks: StdMutex::new(HashMap::new()),
            remote_tracks: StdMutex::new(Vec::new()),
            buffered: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            shared: Arc::downgrade(&self.shared),
        });

        let shared = Arc::downgrade(&self.shared);
        let (session_id, peer) = (session.to_string(), remote.to_string());
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let shared = shared.clone();
            let (session_id, peer) = (session_id.clone(), peer.clone());
            Box::pin(async move {
                let (Some(candidate), Some(shared)) = (candidate, shared.upgrade()) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let msg = SignalMessage::candidate(&peer, &session_id, init);
                        if let Err(e) = shared.send(msg) {
                            debug!(session = %session_id, error = %e, "candidate not sent");
                        }
                    }
                    Err(e) => debug!(session = %session_id, error = %e, "bad local candidate"),
                }
            })
        }));

        let weak_link = Arc::downgrade(&link);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let weak_link = weak_link.clone();
                Box::pin(async move {
                    let Some(link) = weak_link.upgrade() else {
                        return;
                    };
                    let Some(kind) = track_kind(track.kind()) else {
                        return;
                    };
                    lock(&link.remote_tracks).push(RemoteTrack {
                        id: track.id(),
                        kind,
                    });
                    debug!(session = %link.session, ?kind, "remote track");
                    let stream = link.remote_stream(track.stream_id());
                    if let Some(shared) = link.shared.upgrade() {
                        shared.emit(TransportEvent::RemoteStream {
                            session: link.session.clone(),
                            stream,
                        });
                    }
                })
            },
        ));

        let weak_link = Arc::downgrade(&link);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak_link = weak_link.clone();
            Box::pin(async move {
                let Some(link) = weak_link.upgrade() else {
                    return;
                };
                debug!(session = %link.session, %state, "peer connection state");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    link.close().await;
                }
            })
        }));

        Ok(link)
    }
}

#[async_trait]
impl CallTransport for WebRtcTransport {
    async fn register(&self, local_id: &str, events: TransportEvents) -> Result<String> {
        if lock(&self.shared.local).is_some() {
            return Err(Error::InvalidRequest("transport already registered".into()));
        }
        *lock(&self.shared.events) = Some(events);
        if let Err(e) = self.open_signaling(local_id).await {
            *lock(&self.shared.events) = None;
            return Err(e);
        }
        *lock(&self.shared.local) = Some(local_id.to_string());
        info!(id = local_id, "registered with signaling server");
        Ok(local_id.to_string())
    }

    async fn reconnect(&self) -> Result<()> {
        let local = self.shared.local()?;
        if let Some(old) = lock(&self.shared.signaling).take() {
            old.close();
        }
        self.open_signaling(&local).await
    }

    async fn call(
        &self,
        session: &str,
        remote: &str,
        stream: &LocalStream,
    ) -> Result<Arc<dyn CallLink>> {
        self.shared.local()?;
        let link = self.new_link(session, remote).await?;
        let negotiated = async {
            link.publish(stream).await?;
            let offer = link.pc.create_offer(None).await?;
            link.pc.set_local_description(offer.clone()).await?;
            lock(&self.shared.calls).insert(session.to_string(), link.clone());
            self.shared.send(SignalMessage::offer(remote, session, offer))
        }
        .await;
        if let Err(e) = negotiated {
            lock(&self.shared.calls).remove(session);
            if let Err(e) = link.pc.close().await {
                debug!(%session, error = %e, "peer connection close failed");
            }
            return Err(Error::call_failed(remote, e.to_string()));
        }
        Ok(link)
    }

    async fn answer(
        &self,
        inbound: &InboundCall,
        stream: Option<&LocalStream>,
    ) -> Result<Arc<dyn CallLink>> {
        let offer = lock(&self.shared.offers)
            .remove(&inbound.session)
            .ok_or_else(|| Error::call_failed(&inbound.remote, "offer withdrawn"))?;
        let link = self.new_link(&inbound.session, &inbound.remote).await?;
        let negotiated = async {
            if let Some(stream) = stream {
                link.publish(stream).await?;
            }
            link.pc.set_remote_description(offer.sdp).await?;
            let answer = link.pc.create_answer(None).await?;
            link.pc.set_local_description(answer.clone()).await?;
            lock(&self.shared.calls).insert(inbound.session.clone(), link.clone());
            self.shared
                .send(SignalMessage::answer(&inbound.remote, &inbound.session, answer))?;
            for candidate in offer.candidates {
                link.add_candidate(candidate).await;
            }
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = negotiated {
            lock(&self.shared.calls).remove(&inbound.session);
            if let Err(e) = link.pc.close().await {
                debug!(session = %inbound.session, error = %e, "peer connection close failed");
            }
            return Err(Error::call_failed(&inbound.remote, e.to_string()));
        }
        Ok(link)
    }

    /// PeerJS has no per-call rejection; the caller's attempt lapses on its
    /// own timeout.
    async fn reject(&self, inbound: &InboundCall) {
        lock(&self.shared.offers).remove(&inbound.session);
    }

    async fn release(&self) {
        if lock(&self.shared.local).take().is_none() {
            return;
        }
        lock(&self.shared.offers).clear();
        let links: Vec<Arc<WebRtcLink>> = lock(&self.shared.calls).values().cloned().collect();
        for link in links {
            link.close().await;
        }
        if let Some(client) = lock(&self.shared.signaling).take() {
            client.close();
        }
        *lock(&self.shared.events) = None;
        info!("released signaling registration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use serde_json::json;

    fn offer(src: &str, session: &str) -> SignalMessage {
        serde_json::from_value(json!({
            "type": "OFFER",
            "src": src,
            "payload": {
                "sdp": { "type": "offer", "sdp": "v=0\r\n" },
                "type": "media",
                "connectionId": session
            }
        }))
        .unwrap()
    }

    fn candidate(src: &str, session: &str) -> SignalMessage {
        serde_json::from_value(json!({
            "type": "CANDIDATE",
            "src": src,
            "payload": {
                "candidate": { "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0 },
                "type": "media",
                "connectionId": session
            }
        }))
        .unwrap()
    }

    fn transport_with_events() -> (WebRtcTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = WebRtcTransport::new(SignalingConfig::default()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&transport.shared.events) = Some(tx);
        *lock(&transport.shared.local) = Some("u1".to_string());
        (transport, rx)
    }

    #[test]
    fn codecs_follow_track_kind() {
        assert_eq!(codec_for(TrackKind::Audio).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(TrackKind::Video).mime_type, MIME_TYPE_VP8);
        assert_eq!(track_kind(RTPCodecType::Video), Some(TrackKind::Video));
        assert_eq!(track_kind(RTPCodecType::Unspecified), None);

        let track = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone);
        let local = local_track(&track, "stream-1");
        assert_eq!(local.id(), track.id());
        assert_eq!(local.stream_id(), "stream-1");
    }

    #[tokio::test]
    async fn offer_surfaces_as_incoming_call_and_buffers_candidates() {
        let (transport, mut events) = transport_with_events();
        transport.shared.handle_message(offer("u2", "mc_1")).await;
        transport.shared.handle_message(candidate("u2", "mc_1")).await;

        match events.recv().await {
            Some(TransportEvent::IncomingCall(call)) => {
                assert_eq!(call.session, "mc_1");
                assert_eq!(call.remote, "u2");
            }
            other => panic!("unexpected {other:?}"),
        }
        let offers = lock(&transport.shared.offers);
        assert_eq!(offers["mc_1"].candidates.len(), 1);
    }

    #[tokio::test]
    async fn leave_and_reject_drop_pending_offers() {
        let (transport, _events) = transport_with_events();
        transport.shared.handle_message(offer("u2", "mc_1")).await;
        transport.shared.handle_message(offer("u3", "mc_2")).await;

        transport
            .shared
            .handle_message(SignalMessage::Leave {
                src: Some("u2".into()),
                dst: None,
            })
            .await;
        assert!(!lock(&transport.shared.offers).contains_key("mc_1"));

        transport
            .reject(&InboundCall {
                session: "mc_2".into(),
                remote: "u3".into(),
            })
            .await;
        assert!(lock(&transport.shared.offers).is_empty());
    }

    #[tokio::test]
    async fn calls_require_registration() {
        let transport = WebRtcTransport::new(SignalingConfig::default()).unwrap();
        let stream = LocalStream::new(Vec::new());
        let err = match transport.call("mc_1", "u2", &stream).await {
            Err(e) => e,
            Ok(_) => panic!("call succeeded without registration"),
        };
        assert!(matches!(err, Error::TransportUnavailable(_)));
        assert!(transport.reconnect().await.is_err());
    }
}
