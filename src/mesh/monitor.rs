use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of the local transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    Offline,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Offline => write!(f, "Offline"),
            TransportState::Connecting => write!(f, "Connecting"),
            TransportState::Connected => write!(f, "Connected"),
            TransportState::Reconnecting => write!(f, "Reconnecting"),
            TransportState::Failed => write!(f, "Failed"),
            TransportState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportStatus {
    pub state: TransportState,
    pub address: Option<String>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self {
            state: TransportState::Offline,
            address: None,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Clone)]
pub struct TransportMonitor {
    status: Arc<watch::Sender<TransportStatus>>,
    receiver: watch::Receiver<TransportStatus>,
}

impl Default for TransportMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(TransportStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_state(&self, state: TransportState) {
        self.status.send_modify(|status| {
            status.state = state;
        });
    }

    pub fn connected(&self, address: &str) {
        self.status.send_modify(|status| {
            status.state = TransportState::Connected;
            status.address = Some(address.to_string());
            status.reconnect_attempts = 0;
        });
    }

    pub fn reconnect_attempt(&self, attempt: u32) {
        self.status.send_modify(|status| {
            status.state = TransportState::Reconnecting;
            status.reconnect_attempts = attempt;
        });
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.status.send_modify(|status| {
            status.last_error = Some(error.into());
            status.state = TransportState::Failed;
        });
    }

    pub fn closed(&self) {
        self.status.send_modify(|status| {
            status.state = TransportState::Closed;
            status.address = None;
        });
    }

    pub fn current(&self) -> TransportStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportStatus> {
        self.receiver.clone()
    }
}
