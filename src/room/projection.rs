//! Presentation projection of a room.
//!
//! The admin sorts first; everyone else keeps the store's arrival order.

use crate::mesh::RemoteStream;
use crate::media::LocalStream;
use crate::presence::ParticipantRecord;
use std::collections::HashMap;

/// Best-known live media for one participant.
#[derive(Debug, Clone)]
pub enum StreamRef {
    Local(LocalStream),
    Remote(RemoteStream),
}

#[derive(Debug, Clone)]
pub struct ProjectionEntry {
    pub participant: ParticipantRecord,
    pub is_local: bool,
    pub is_muted: bool,
    pub is_camera_off: bool,
    pub stream: Option<StreamRef>,
}

#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub entries: Vec<ProjectionEntry>,
}

impl Projection {
    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.participant.id.as_str()).collect()
    }

    pub fn entry(&self, id: &str) -> Option<&ProjectionEntry> {
        self.entries.iter().find(|e| e.participant.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The local participant's view of its own media.
pub struct LocalView<'a> {
    pub id: &'a str,
    pub stream: Option<&'a LocalStream>,
    pub is_muted: bool,
    pub is_camera_off: bool,
}

/// Local flags come from the local device; remote flags from the store.
/// Remote streams are keyed by transport address, falling back to the
/// participant id.
pub fn project(
    participants: &[ParticipantRecord],
    local: &LocalView<'_>,
    remote_streams: &HashMap<String, RemoteStream>,
) -> Projection {
    let mut ordered: Vec<&ParticipantRecord> = participants.iter().collect();
    ordered.sort_by_key(|p| !p.is_admin());

    let entries = ordered
        .into_iter()
        .map(|p| {
            if p.id == local.id {
                ProjectionEntry {
                    participant: p.clone(),
                    is_local: true,
                    is_muted: local.is_muted,
                    is_camera_off: local.is_camera_off,
                    stream: local.stream.cloned().map(StreamRef::Local),
                }
            } else {
                let stream = remote_streams
                    .get(&p.peer_id)
                    .filter(|_| p.has_address())
                    .or_else(|| remote_streams.get(&p.id))
                    .cloned()
                    .map(StreamRef::Remote);
                ProjectionEntry {
                    participant: p.clone(),
                    is_local: false,
                    is_muted: p.is_muted,
                    is_camera_off: p.is_camera_off,
                    stream,
                }
            }
        })
        .collect();
    Projection { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Principal, Profile, Role};

    fn record(id: &str, role: Role) -> ParticipantRecord {
        let principal = Principal {
            id: id.to_string(),
            profile: Profile {
                display_name: format!("{id}-name"),
                role,
            },
        };
        let mut record = ParticipantRecord::new(&principal, role);
        record.peer_id = format!("addr-{id}");
        record
    }

    fn remote(peer: &str) -> RemoteStream {
        RemoteStream {
            peer: peer.to_string(),
            id: format!("stream-{peer}"),
            tracks: Vec::new(),
        }
    }

    #[test]
    fn admin_first_then_arrival_order() {
        let list = vec![
            record("u2", Role::User),
            record("u1", Role::User),
            record("adm", Role::Admin),
            record("u3", Role::User),
        ];
        let local = LocalView {
            id: "u1",
            stream: None,
            is_muted: false,
            is_camera_off: true,
        };
        let projection = project(&list, &local, &HashMap::new());
        assert_eq!(projection.ids(), vec!["adm", "u2", "u1", "u3"]);
    }

    #[test]
    fn pairs_local_and_remote_streams() {
        let mut muted_remote = record("u2", Role::User);
        muted_remote.is_muted = true;
        let mut stale_local = record("u1", Role::User);
        stale_local.is_muted = true;
        let list = vec![record("adm", Role::Admin), stale_local, muted_remote];

        let stream = LocalStream::new(Vec::new());
        let local = LocalView {
            id: "u1",
            stream: Some(&stream),
            is_muted: false,
            is_camera_off: false,
        };
        let mut streams = HashMap::new();
        streams.insert("addr-adm".to_string(), remote("addr-adm"));

        let projection = project(&list, &local, &streams);

        let me = projection.entry("u1").unwrap();
        assert!(me.is_local);
        assert!(!me.is_muted);
        assert!(!me.is_camera_off);
        assert!(matches!(&me.stream, Some(StreamRef::Local(s)) if s.same_stream(&stream)));

        let adm = projection.entry("adm").unwrap();
        assert!(matches!(&adm.stream, Some(StreamRef::Remote(s)) if s.peer == "addr-adm"));

        let u2 = projection.entry("u2").unwrap();
        assert!(u2.is_muted);
        assert!(u2.stream.is_none());
    }

    #[test]
    fn falls_back_to_participant_id() {
        let mut pending = record("u2", Role::User);
        pending.peer_id.clear();
        let local = LocalView {
            id: "u1",
            stream: None,
            is_muted: false,
            is_camera_off: true,
        };
        let mut streams = HashMap::new();
        streams.insert("u2".to_string(), remote("u2"));
        let projection = project(&[pending], &local, &streams);
        assert!(projection.entry("u2").unwrap().stream.is_some());
    }
}
