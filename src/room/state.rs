use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a room session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Voluntary,
    /// Our participant record disappeared while connected.
    Kicked,
    /// The room was marked inactive.
    RoomEnded,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaveReason::Voluntary => write!(f, "voluntary"),
            LeaveReason::Kicked => write!(f, "kicked"),
            LeaveReason::RoomEnded => write!(f, "room ended"),
        }
    }
}

/// Lifecycle of one room membership.
///
/// `Disconnected -> Joining -> Connected -> Leaving -> Left`, with `Kicked`
/// and `RoomEnded` entered from `Connected` on the way to `Leaving`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum RoomState {
    Disconnected,
    Joining,
    Connected,
    Kicked,
    RoomEnded,
    Leaving(LeaveReason),
    Left(LeaveReason),
}

impl RoomState {
    pub fn is_connected(&self) -> bool {
        matches!(self, RoomState::Connected)
    }

    pub fn leave_reason(&self) -> Option<LeaveReason> {
        match self {
            RoomState::Kicked => Some(LeaveReason::Kicked),
            RoomState::RoomEnded => Some(LeaveReason::RoomEnded),
            RoomState::Leaving(reason) | RoomState::Left(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomState::Disconnected => write!(f, "Disconnected"),
            RoomState::Joining => write!(f, "Joining"),
            RoomState::Connected => write!(f, "Connected"),
            RoomState::Kicked => write!(f, "Kicked"),
            RoomState::RoomEnded => write!(f, "RoomEnded"),
            RoomState::Leaving(reason) => write!(f, "Leaving ({reason})"),
            RoomState::Left(reason) => write!(f, "Left ({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_carry_reason() {
        assert!(RoomState::Connected.is_connected());
        assert_eq!(RoomState::Connected.leave_reason(), None);
        assert_eq!(RoomState::Kicked.leave_reason(), Some(LeaveReason::Kicked));
        assert_eq!(
            RoomState::Left(LeaveReason::RoomEnded).leave_reason(),
            Some(LeaveReason::RoomEnded)
        );
        assert_eq!(
            RoomState::Leaving(LeaveReason::Voluntary).to_string(),
            "Leaving (voluntary)"
        );
    }

    #[test]
    fn serializes_with_reason() {
        let json = serde_json::to_value(RoomState::Left(LeaveReason::Kicked)).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "left", "reason": "kicked" }));
        let json = serde_json::to_value(RoomState::Connected).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "connected" }));
    }
}
