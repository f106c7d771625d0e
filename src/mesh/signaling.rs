//! PeerJS-compatible signaling client.
//!
//! The signaling server only relays offers, answers and ICE candidates between
//! registered ids; media never passes through it. A heartbeat keeps the socket
//! from being reaped by the server's idle timer.

use crate::config::SignalingConfig;
use crate::error::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection kind carried in every relayed payload.
pub const MEDIA_CONNECTION: &str = "media";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerNotice {
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    pub sdp: RTCSessionDescription,
    #[serde(rename = "type")]
    pub kind: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: RTCIceCandidateInit,
    #[serde(rename = "type")]
    pub kind: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum SignalMessage {
    Open,
    IdTaken {
        #[serde(default)]
        payload: Option<ServerNotice>,
    },
    InvalidKey {
        #[serde(default)]
        payload: Option<ServerNotice>,
    },
    Error {
        #[serde(default)]
        payload: Option<ServerNotice>,
    },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: SdpPayload,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: SdpPayload,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: CandidatePayload,
    },
    /// The peer at `src` left the server.
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
    },
    /// A message we sent to `src` could not be delivered.
    Expire {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
    },
    Heartbeat,
}

impl SignalMessage {
    pub fn offer(dst: &str, connection_id: &str, sdp: RTCSessionDescription) -> Self {
        SignalMessage::Offer {
            src: None,
            dst: Some(dst.to_string()),
            payload: SdpPayload {
                sdp,
                kind: MEDIA_CONNECTION.to_string(),
                connection_id: connection_id.to_string(),
            },
        }
    }

    pub fn answer(dst: &str, connection_id: &str, sdp: RTCSessionDescription) -> Self {
        SignalMessage::Answer {
            src: None,
            dst: Some(dst.to_string()),
            payload: SdpPayload {
                sdp,
                kind: MEDIA_CONNECTION.to_string(),
                connection_id: connection_id.to_string(),
            },
        }
    }

    pub fn candidate(dst: &str, connection_id: &str, candidate: RTCIceCandidateInit) -> Self {
        SignalMessage::Candidate {
            src: None,
            dst: Some(dst.to_string()),
            payload: CandidatePayload {
                candidate,
                kind: MEDIA_CONNECTION.to_string(),
                connection_id: connection_id.to_string(),
            },
        }
    }
}

fn notice(payload: Option<ServerNotice>) -> String {
    payload.map(|p| p.msg).unwrap_or_default()
}

/// Random token the server uses to tell reconnects of one id apart.
pub fn session_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Open socket to the signaling server.
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<SignalMessage>,
    cancel: CancellationToken,
}

impl SignalingClient {
    /// Connects and claims `id`. Resolves once the server confirms with
    /// `OPEN`; `ID-TAKEN` maps to [`Error::AddressInUse`].
    ///
    /// The returned receiver yields relayed messages and closes when the
    /// socket drops.
    pub async fn open(
        config: &SignalingConfig,
        id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>)> {
        let url = config.socket_url(id, &session_token());
        let (client, mut rx) = Self::connect(&url).await?;

        let first = tokio::time::timeout(OPEN_TIMEOUT, rx.recv())
            .await
            .map_err(|_| Error::TransportUnavailable("signaling server did not answer".into()))?;
        match first {
            Some(SignalMessage::Open) => {
                debug!(id, host = %config.host, "signaling open");
                Ok((client, rx))
            }
            Some(SignalMessage::IdTaken { .. }) => {
                client.close();
                Err(Error::AddressInUse(id.to_string()))
            }
            Some(SignalMessage::InvalidKey { payload }) | Some(SignalMessage::Error { payload }) => {
                client.close();
                Err(Error::TransportUnavailable(notice(payload)))
            }
            Some(other) => {
                client.close();
                Err(Error::TransportUnavailable(format!(
                    "unexpected first message: {other:?}"
                )))
            }
            None => Err(Error::TransportUnavailable(
                "signaling socket closed during handshake".into(),
            )),
        }
    }

    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>)> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, outgoing_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (incoming_tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Outgoing messages and heartbeat
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut outgoing_rx = outgoing_rx;
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                let msg = tokio::select! {
                    () = writer_cancel.cancelled() => break,
                    _ = heartbeat.tick() => SignalMessage::Heartbeat,
                    msg = outgoing_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "could not encode signaling message");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // Incoming messages
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    frame = read.next() => frame,
                };
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "signaling socket error");
                        break;
                    }
                };
                match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(signal) => {
                        if incoming_tx.send(signal).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring signaling message"),
                }
            }
            reader_cancel.cancel();
        });

        Ok((Self { tx, cancel }, rx))
    }

    pub fn send(&self, msg: SignalMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::TransportUnavailable("signaling socket closed".into()))
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
