//! Typed room-presence adapter over a [`DocumentStore`].
//!
//! Layout:
//! - Room: `rooms/{roomCode}`
//! - Participant: `rooms/{roomCode}/participants/{principalId}`
//!
//! Membership is the existence of the participant document.

use crate::error::{Error, Result};
use crate::identity::{Principal, Role};
use crate::store::{
    to_document, DocPath, Document, DocumentSet, DocumentStore, Snapshot, Subscription,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const ROOMS: &str = "rooms";
pub const ROOM_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const ROOM_CODE_LEN: usize = 6;
const MAX_CODE_ATTEMPTS: usize = 8;

pub fn room_path(code: &str) -> DocPath {
    DocPath::new(ROOMS, code)
}

pub fn participants_collection(code: &str) -> String {
    format!("{ROOMS}/{code}/participants")
}

pub fn participant_path(code: &str, principal_id: &str) -> DocPath {
    DocPath::new(participants_collection(code), principal_id)
}

/// Trims and uppercases a typed room code.
pub fn normalize_room_code(raw: &str) -> Result<String> {
    let code = raw.trim().to_uppercase();
    if code.is_empty() || code.contains('/') {
        return Err(Error::InvalidRoomCode(raw.to_string()));
    }
    Ok(code)
}

pub fn generate_room_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_CHARSET[rng.gen_range(0..ROOM_CODE_CHARSET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    #[serde(skip)]
    pub code: String,
    pub admin_uid: String,
    pub admin_username: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

fn default_camera_off() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "username")]
    pub display_name: String,
    /// Transport address; empty until the participant's mesh handle opens.
    #[serde(default)]
    pub peer_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default = "default_camera_off")]
    pub is_camera_off: bool,
    #[serde(default)]
    pub forced_unmute: bool,
}

impl ParticipantRecord {
    pub fn new(principal: &Principal, role: Role) -> Self {
        Self {
            id: principal.id.clone(),
            display_name: principal.profile.display_name.clone(),
            peer_id: String::new(),
            role,
            joined_at: Utc::now(),
            is_muted: false,
            is_camera_off: true,
            forced_unmute: false,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn has_address(&self) -> bool {
        !self.peer_id.is_empty()
    }
}

/// Partial participant update; only the `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_camera_off: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_unmute: Option<bool>,
}

impl ParticipantPatch {
    pub fn media(is_muted: bool, is_camera_off: bool) -> Self {
        Self {
            is_muted: Some(is_muted),
            is_camera_off: Some(is_camera_off),
            ..Default::default()
        }
    }
}

fn decode_room(code: &str, doc: Document) -> Result<RoomRecord> {
    let mut room: RoomRecord = serde_json::from_value(serde_json::Value::Object(doc))?;
    room.code = code.to_string();
    Ok(room)
}

fn decode_participants(set: DocumentSet) -> Result<Vec<ParticipantRecord>> {
    set.into_iter()
        .map(|(id, doc)| {
            let mut record: ParticipantRecord =
                serde_json::from_value(serde_json::Value::Object(doc))?;
            record.id = id;
            Ok(record)
        })
        .collect()
}

/// Room document subscription.
pub struct RoomWatch {
    code: String,
    inner: Subscription<Option<Document>>,
}

impl RoomWatch {
    /// A room document that fails to decode is reported as `Unavailable`.
    pub async fn changed(&mut self) -> Result<Snapshot<Option<RoomRecord>>> {
        let snapshot = self.inner.changed().await?;
        Ok(self.decode(snapshot))
    }

    /// Most recent snapshot, whether or not it has been observed.
    pub fn latest(&self) -> Snapshot<Option<RoomRecord>> {
        self.decode(self.inner.latest())
    }

    fn decode(&self, snapshot: Snapshot<Option<Document>>) -> Snapshot<Option<RoomRecord>> {
        match snapshot {
            Snapshot::Ready(Some(doc)) => match decode_room(&self.code, doc) {
                Ok(room) => Snapshot::Ready(Some(room)),
                Err(e) => Snapshot::Unavailable(e.to_string()),
            },
            other => other.map(|_| None),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

/// Participant collection subscription.
pub struct ParticipantsWatch {
    inner: Subscription<DocumentSet>,
}

impl ParticipantsWatch {
    pub async fn changed(&mut self) -> Result<Snapshot<Vec<ParticipantRecord>>> {
        let snapshot = self.inner.changed().await?;
        Ok(match snapshot {
            Snapshot::Ready(set) => match decode_participants(set) {
                Ok(list) => Snapshot::Ready(list),
                Err(e) => Snapshot::Unavailable(e.to_string()),
            },
            Snapshot::Pending => Snapshot::Pending,
            Snapshot::Unavailable(reason) => Snapshot::Unavailable(reason),
        })
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

#[derive(Clone)]
pub struct PresenceStore {
    store: Arc<dyn DocumentStore>,
}

impl PresenceStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Creates an active room owned by `owner` under a fresh code.
    #[instrument(skip_all, fields(owner = %owner.id))]
    pub async fn create_room(&self, owner: &Principal) -> Result<RoomRecord> {
        if !owner.is_admin() {
            return Err(Error::NotAuthorized(
                "only admins can create rooms".to_string(),
            ));
        }

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_room_code(&mut rand::thread_rng());
            if self.store.get(&room_path(&code)).await?.is_some() {
                continue;
            }
            let room = RoomRecord {
                code: code.clone(),
                admin_uid: owner.id.clone(),
                admin_username: owner.profile.display_name.clone(),
                active: true,
                created_at: Utc::now(),
                ended_at: None,
            };
            self.store.set(&room_path(&code), to_document(&room)?).await?;
            info!(room = %code, "room created");
            return Ok(room);
        }
        Err(Error::Store("could not allocate a free room code".to_string()))
    }

    pub async fn room(&self, code: &str) -> Result<Option<RoomRecord>> {
        match self.store.get(&room_path(code)).await? {
            Some(doc) => Ok(Some(decode_room(code, doc)?)),
            None => Ok(None),
        }
    }

    /// Checks the room accepts members and writes a fresh participant record.
    /// The room owner joins as `admin`, everyone else as `user`.
    #[instrument(skip_all, fields(room = %code, principal = %principal.id))]
    pub async fn join_room(
        &self,
        code: &str,
        principal: &Principal,
    ) -> Result<(RoomRecord, ParticipantRecord)> {
        let room = self
            .room(code)
            .await?
            .ok_or_else(|| Error::RoomNotFound(code.to_string()))?;
        if !room.active {
            return Err(Error::RoomInactive(code.to_string()));
        }

        let role = if room.admin_uid == principal.id {
            Role::Admin
        } else {
            Role::User
        };
        let record = ParticipantRecord::new(principal, role);
        self.store
            .set(&participant_path(code, &principal.id), to_document(&record)?)
            .await?;
        Ok((room, record))
    }

    pub async fn participants(&self, code: &str) -> Result<Vec<ParticipantRecord>> {
        decode_participants(self.store.list(&participants_collection(code)).await?)
    }

    pub async fn update_participant(
        &self,
        code: &str,
        principal_id: &str,
        patch: &ParticipantPatch,
    ) -> Result<()> {
        self.store
            .update(&participant_path(code, principal_id), to_document(patch)?)
            .await
    }

    pub async fn set_peer_address(&self, code: &str, principal_id: &str, address: &str) -> Result<()> {
        let patch = ParticipantPatch {
            peer_id: Some(address.to_string()),
            ..Default::default()
        };
        self.update_participant(code, principal_id, &patch).await
    }

    /// Deletes a participant record (voluntary leave or admin removal).
    pub async fn remove_participant(&self, code: &str, principal_id: &str) -> Result<()> {
        self.store.delete(&participant_path(code, principal_id)).await
    }

    pub async fn force_unmute(&self, code: &str, principal_id: &str) -> Result<()> {
        let patch = ParticipantPatch {
            is_muted: Some(false),
            forced_unmute: Some(true),
            ..Default::default()
        };
        self.update_participant(code, principal_id, &patch).await
    }

    /// Marks the room inactive, then deletes every participant record.
    ///
    /// Only the flag write is fatal; records left behind by a failed delete
    /// are evicted by their owners observing `active = false`.
    #[instrument(skip(self))]
    pub async fn end_room(&self, code: &str) -> Result<()> {
        let mut fields = Document::new();
        fields.insert("active".to_string(), serde_json::Value::Bool(false));
        fields.insert(
            "endedAt".to_string(),
            serde_json::to_value(Utc::now())?,
        );
        self.store.update(&room_path(code), fields).await?;

        let collection = participants_collection(code);
        let members = match self.store.list(&collection).await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "could not list participants of ended room");
                return Ok(());
            }
        };
        let paths: Vec<DocPath> = members
            .iter()
            .map(|(id, _)| participant_path(code, id))
            .collect();
        let deletions = paths.iter().map(|path| self.store.delete(path));
        for (result, (id, _)) in futures::future::join_all(deletions)
            .await
            .into_iter()
            .zip(members.iter())
        {
            if let Err(e) = result {
                warn!(participant = %id, error = %e, "participant record left behind");
            }
        }
        info!("room ended");
        Ok(())
    }

    pub async fn subscribe_room(&self, code: &str) -> Result<RoomWatch> {
        Ok(RoomWatch {
            code: code.to_string(),
            inner: self.store.subscribe_document(&room_path(code)).await?,
        })
    }

    pub async fn subscribe_participants(&self, code: &str) -> Result<ParticipantsWatch> {
        Ok(ParticipantsWatch {
            inner: self
                .store
                .subscribe_collection(&participants_collection(code))
                .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Profile;
    use crate::store::MemoryStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn principal(id: &str, role: Role) -> Principal {
        Principal {
            id: id.to_string(),
            profile: Profile {
                display_name: format!("{id}-name"),
                role,
            },
        }
    }

    fn presence() -> (Arc<MemoryStore>, PresenceStore) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), PresenceStore::new(store))
    }

    #[test]
    fn room_codes() {
        let mut rng = StdRng::seed_from_u64(7);
        let code = generate_room_code(&mut rng);
        assert_eq!(code.len(), ROOM_CODE_LEN);
        assert!(code.bytes().all(|b| ROOM_CODE_CHARSET.contains(&b)));

        assert_eq!(normalize_room_code("  ab12cd ").unwrap(), "AB12CD");
        assert_eq!(normalize_room_code("a much longer code").unwrap(), "A MUCH LONGER CODE");
        assert!(matches!(normalize_room_code("   "), Err(Error::InvalidRoomCode(_))));
    }

    #[test]
    fn participant_wire_shape() {
        let record = ParticipantRecord::new(&principal("u1", Role::User), Role::User);
        let doc = to_document(&record).unwrap();
        assert_eq!(doc["username"], json!("u1-name"));
        assert_eq!(doc["peerId"], json!(""));
        assert_eq!(doc["role"], json!("user"));
        assert_eq!(doc["isMuted"], json!(false));
        assert_eq!(doc["isCameraOff"], json!(true));
        assert!(doc.get("id").is_none());

        let patch = to_document(&ParticipantPatch::media(true, false)).unwrap();
        assert_eq!(patch.len(), 2);
    }

    #[tokio::test]
    async fn only_admins_create_rooms() {
        let (store, presence) = presence();
        let err = presence
            .create_room(&principal("u1", Role::User))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAuthorized(_)));
        assert!(store.journal().await.is_empty());

        let room = presence.create_room(&principal("adm", Role::Admin)).await.unwrap();
        assert!(room.active);
        let stored = presence.room(&room.code).await.unwrap().unwrap();
        assert_eq!(stored.admin_uid, "adm");
        assert_eq!(stored.code, room.code);
    }

    #[tokio::test]
    async fn join_checks_room_lifecycle_and_assigns_roles() {
        let (_store, presence) = presence();
        let adm = principal("adm", Role::Admin);
        let u1 = principal("u1", Role::User);

        assert!(matches!(
            presence.join_room("NOPE00", &u1).await,
            Err(Error::RoomNotFound(_))
        ));

        let room = presence.create_room(&adm).await.unwrap();
        let (_, admin_record) = presence.join_room(&room.code, &adm).await.unwrap();
        let (_, user_record) = presence.join_room(&room.code, &u1).await.unwrap();
        assert_eq!(admin_record.role, Role::Admin);
        assert_eq!(user_record.role, Role::User);
        assert!(!user_record.is_muted);
        assert!(user_record.is_camera_off);

        presence.end_room(&room.code).await.unwrap();
        assert!(matches!(
            presence.join_room(&room.code, &u1).await,
            Err(Error::RoomInactive(_))
        ));
    }

    #[tokio::test]
    async fn end_room_deactivates_and_clears_participants() {
        let (_store, presence) = presence();
        let adm = principal("adm", Role::Admin);
        let room = presence.create_room(&adm).await.unwrap();
        presence.join_room(&room.code, &adm).await.unwrap();
        presence.join_room(&room.code, &principal("u1", Role::User)).await.unwrap();

        presence.end_room(&room.code).await.unwrap();
        let ended = presence.room(&room.code).await.unwrap().unwrap();
        assert!(!ended.active);
        assert!(ended.ended_at.is_some());
        assert!(presence.participants(&room.code).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn patches_do_not_resurrect_removed_participants() {
        let (_store, presence) = presence();
        let adm = principal("adm", Role::Admin);
        let room = presence.create_room(&adm).await.unwrap();
        presence.join_room(&room.code, &principal("u1", Role::User)).await.unwrap();

        presence.set_peer_address(&room.code, "u1", "u1").await.unwrap();
        presence.force_unmute(&room.code, "u1").await.unwrap();
        let list = presence.participants(&room.code).await.unwrap();
        assert_eq!(list[0].peer_id, "u1");
        assert!(list[0].forced_unmute);

        presence.remove_participant(&room.code, "u1").await.unwrap();
        assert!(presence
            .update_participant(&room.code, "u1", &ParticipantPatch::media(true, true))
            .await
            .is_err());
        assert!(presence.participants(&room.code).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watches_decode_typed_snapshots() {
        let (_store, presence) = presence();
        let adm = principal("adm", Role::Admin);
        let room = presence.create_room(&adm).await.unwrap();

        let mut room_watch = presence.subscribe_room(&room.code).await.unwrap();
        let mut members = presence.subscribe_participants(&room.code).await.unwrap();
        assert!(room_watch.changed().await.unwrap().ready().unwrap().unwrap().active);
        assert_eq!(members.changed().await.unwrap(), Snapshot::Ready(vec![]));

        presence.join_room(&room.code, &adm).await.unwrap();
        let list = members.changed().await.unwrap().ready().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "adm");
        assert!(list[0].is_admin());
    }
}
