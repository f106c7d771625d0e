//! Client configuration.
//!
//! Loaded from environment variables with defaults matching a public
//! PeerJS-compatible signaling server and public STUN/TURN relays. The TURN
//! credential is redacted in Debug output.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_PEER_HOST: &str = "0.peerjs.com";
pub const DEFAULT_PEER_PORT: u16 = 443;
pub const DEFAULT_PEER_PATH: &str = "/";
pub const DEFAULT_PEER_KEY: &str = "peerjs";

pub const DEFAULT_STUN_URLS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

pub const DEFAULT_TURN_URLS: [&str; 2] = [
    "turn:openrelay.metered.ca:80",
    "turn:openrelay.metered.ca:443",
];
pub const DEFAULT_TURN_USERNAME: &str = "openrelayproject";
pub const DEFAULT_TURN_CREDENTIAL: &str = "openrelayproject";

/// Call negotiation timeout; expiry is reported as `CallFailed`.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_SNAPSHOT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Which call transport the demo binary wires into the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Loopback,
    WebRtc,
}

/// Signaling server and relay settings for the WebRTC transport.
#[derive(Clone)]
pub struct SignalingConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
    pub key: String,
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_username: String,
    pub turn_credential: String,
}

impl fmt::Debug for SignalingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("key", &self.key)
            .field("stun_urls", &self.stun_urls)
            .field("turn_urls", &self.turn_urls)
            .field("turn_username", &self.turn_username)
            .field("turn_credential", &"[REDACTED]")
            .finish()
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PEER_HOST.to_string(),
            port: DEFAULT_PEER_PORT,
            path: DEFAULT_PEER_PATH.to_string(),
            secure: true,
            key: DEFAULT_PEER_KEY.to_string(),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            turn_urls: DEFAULT_TURN_URLS.iter().map(|s| s.to_string()).collect(),
            turn_username: DEFAULT_TURN_USERNAME.to_string(),
            turn_credential: DEFAULT_TURN_CREDENTIAL.to_string(),
        }
    }
}

impl SignalingConfig {
    /// WebSocket URL for registering `id` with the signaling server.
    pub fn socket_url(&self, id: &str, token: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut path = self.path.clone();
        if !path.ends_with('/') {
            path.push('/');
        }
        format!(
            "{scheme}://{}:{}{path}peerjs?key={}&id={id}&token={token}",
            self.host, self.port, self.key
        )
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers: Vec<RTCIceServer> = self
            .stun_urls
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        if !self.turn_urls.is_empty() {
            servers.push(RTCIceServer {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
                ..Default::default()
            });
        }
        servers
    }
}

/// Timing knobs for the mesh and the room reconciler.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub call_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub snapshot_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            snapshot_timeout: Duration::from_secs(DEFAULT_SNAPSHOT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub mesh: MeshConfig,
    pub transport: TransportKind,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = SignalingConfig::default();

        let port = match vars.get("PEER_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("PEER_PORT={raw}")))?,
            None => defaults.port,
        };

        let secure = match vars.get("PEER_SECURE").map(|s| s.to_ascii_lowercase()) {
            Some(v) if v == "true" || v == "1" => true,
            Some(v) if v == "false" || v == "0" => false,
            Some(v) => return Err(ConfigError::InvalidValue(format!("PEER_SECURE={v}"))),
            None => defaults.secure,
        };

        let signaling = SignalingConfig {
            host: vars.get("PEER_HOST").cloned().unwrap_or(defaults.host),
            port,
            path: vars.get("PEER_PATH").cloned().unwrap_or(defaults.path),
            secure,
            key: vars.get("PEER_KEY").cloned().unwrap_or(defaults.key),
            stun_urls: vars
                .get("PEER_STUN_URLS")
                .map(|s| split_list(s))
                .unwrap_or(defaults.stun_urls),
            turn_urls: vars
                .get("PEER_TURN_URLS")
                .map(|s| split_list(s))
                .unwrap_or(defaults.turn_urls),
            turn_username: vars
                .get("PEER_TURN_USERNAME")
                .cloned()
                .unwrap_or(defaults.turn_username),
            turn_credential: vars
                .get("PEER_TURN_CREDENTIAL")
                .cloned()
                .unwrap_or(defaults.turn_credential),
        };

        let call_timeout_secs = vars
            .get("MESH_CALL_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS);
        if call_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_CALL_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        let mesh = MeshConfig {
            call_timeout: Duration::from_secs(call_timeout_secs),
            reconnect_delay: Duration::from_millis(
                vars.get("MESH_RECONNECT_DELAY_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
            max_reconnect_attempts: vars
                .get("MESH_MAX_RECONNECT_ATTEMPTS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            snapshot_timeout: Duration::from_secs(
                vars.get("ROOM_SNAPSHOT_TIMEOUT_SECS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_SNAPSHOT_TIMEOUT_SECS),
            ),
        };

        let transport = match vars.get("MESHROOM_TRANSPORT").map(String::as_str) {
            None | Some("loopback") => TransportKind::Loopback,
            Some("webrtc") => TransportKind::WebRtc,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "MESHROOM_TRANSPORT={other}"
                )))
            }
        };

        Ok(Config {
            signaling,
            mesh,
            transport,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
