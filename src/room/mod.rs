//! Room presence reconciler.
//!
//! One actor task per joined room. It serializes store snapshots, mesh
//! notifications, call outcomes and local commands, and drives the mesh
//! toward the participant set the store declares. Convergence is level
//! triggered: it diffs the latest snapshot against the mesh registry, so
//! running it twice with nothing changed does nothing.
//!
//! An `Unavailable` snapshot means the store state is unknown and is never
//! read as "everyone left". A delivered list that lacks us is a kick.

pub mod projection;
pub mod state;

pub use projection::{LocalView, Projection, ProjectionEntry, StreamRef};
pub use state::{LeaveReason, RoomState};

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::identity::{AuthSession, Principal, Role};
use crate::media::{MediaCapture, MediaSource};
use crate::mesh::{CallTransport, MeshEvent, MeshManager, RemoteStream, TransportStatus};
use crate::presence::{
    normalize_room_code, ParticipantPatch, ParticipantRecord, ParticipantsWatch, PresenceStore,
    RoomRecord, RoomWatch,
};
use crate::store::{DocumentStore, Snapshot};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const COMMAND_CHANNEL_BUFFER: usize = 64;

/// Collaborators for one room session.
#[derive(Clone)]
pub struct RoomDeps {
    pub store: Arc<dyn DocumentStore>,
    pub transport: Arc<dyn CallTransport>,
    pub capture: Arc<dyn MediaCapture>,
    pub config: MeshConfig,
}

enum Command {
    ToggleMute {
        respond_to: oneshot::Sender<Result<bool>>,
    },
    ToggleCamera {
        respond_to: oneshot::Sender<Result<bool>>,
    },
    EndRoom {
        respond_to: oneshot::Sender<Result<()>>,
    },
    RemoveParticipant {
        participant_id: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    ForceUnmute {
        participant_id: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Leave {
        respond_to: oneshot::Sender<()>,
    },
}

/// Entry point for joining rooms.
pub struct RoomReconciler;

impl RoomReconciler {
    /// Joins `room_code` as the signed-in principal.
    ///
    /// Media is acquired, the participant record written, the mesh opened
    /// under the principal id, the address published, and the room and
    /// participant subscriptions opened. Resolves once the first participant
    /// snapshot arrives. Any failure aborts the join and undoes what it can.
    #[instrument(skip_all, fields(room = %room_code))]
    pub async fn join(deps: RoomDeps, session: &AuthSession, room_code: &str) -> Result<RoomHandle> {
        let principal = session.require()?.clone();
        let code = normalize_room_code(room_code)?;
        let presence = PresenceStore::new(deps.store.clone());
        let (state_tx, state_rx) = watch::channel(RoomState::Disconnected);
        state_tx.send_replace(RoomState::Joining);

        let mut media = MediaSource::new(deps.capture.clone());
        let stream = media.acquire(false, true).await?;

        let (room, record) = match presence.join_room(&code, &principal).await {
            Ok(joined) => joined,
            Err(e) => {
                media.stop();
                return Err(e);
            }
        };

        let (mesh, mesh_events) = MeshManager::new(deps.transport.clone(), deps.config.clone());
        let connected = async {
            mesh.initialize(&principal.id).await?;
            mesh.set_local_media(stream.clone()).await;
            presence
                .set_peer_address(&code, &principal.id, &principal.id)
                .await?;
            let room_watch = presence.subscribe_room(&code).await?;
            let mut participants_watch = presence.subscribe_participants(&code).await?;
            let first = wait_for_participants(&mut participants_watch, &deps.config).await?;
            Ok::<_, Error>((room_watch, participants_watch, first))
        }
        .await;

        let (room_watch, participants_watch, first) = match connected {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "join failed, rolling back");
                if let Err(e) = presence.remove_participant(&code, &principal.id).await {
                    warn!(error = %e, "could not remove partial participant record");
                }
                mesh.destroy().await;
                media.stop();
                return Err(e);
            }
        };

        info!(principal = %principal.id, role = ?record.role, "joined room");
        state_tx.send_replace(RoomState::Connected);

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (projection_tx, projection_rx) = watch::channel(Projection::default());

        let mut actor = RoomActor {
            code: code.clone(),
            principal,
            role: record.role,
            room,
            presence,
            mesh: mesh.clone(),
            media,
            participants: Vec::new(),
            remote_streams: HashMap::new(),
            attempting: HashSet::new(),
            forced_unmute_acked: false,
            commands: commands_rx,
            room_watch,
            participants_watch,
            room_live: true,
            participants_live: true,
            mesh_events,
            outcomes_tx,
            outcomes: outcomes_rx,
            calls_cancel: CancellationToken::new(),
            state_tx,
            projection_tx,
        };
        actor.handle_participants(first).await;
        let task = tokio::spawn(actor.run());

        Ok(RoomHandle {
            code,
            commands: commands_tx,
            state: state_rx,
            projection: projection_rx,
            mesh,
            task,
        })
    }
}

async fn wait_for_participants(
    watch: &mut ParticipantsWatch,
    config: &MeshConfig,
) -> Result<Snapshot<Vec<ParticipantRecord>>> {
    let first = async {
        loop {
            match watch.changed().await? {
                ready @ Snapshot::Ready(_) => return Ok::<_, Error>(ready),
                Snapshot::Unavailable(reason) => {
                    debug!(%reason, "participant snapshot unavailable, waiting")
                }
                Snapshot::Pending => {}
            }
        }
    };
    tokio::time::timeout(config.snapshot_timeout, first)
        .await
        .map_err(|_| Error::Store("timed out waiting for the participant list".to_string()))?
}

/// Handle to a joined room. Dropping it leaves the room.
pub struct RoomHandle {
    code: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<RoomState>,
    projection: watch::Receiver<Projection>,
    mesh: MeshManager,
    task: JoinHandle<()>,
}

impl RoomHandle {
    pub fn room_code(&self) -> &str {
        &self.code
    }

    pub fn state(&self) -> RoomState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<RoomState> {
        self.state.clone()
    }

    pub fn projection(&self) -> Projection {
        self.projection.borrow().clone()
    }

    pub fn projection_watch(&self) -> watch::Receiver<Projection> {
        self.projection.clone()
    }

    /// Addresses the mesh currently holds sessions for.
    pub async fn session_addresses(&self) -> Vec<String> {
        self.mesh.session_addresses().await
    }

    pub fn transport_status(&self) -> watch::Receiver<TransportStatus> {
        self.mesh.transport_status()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Returns the new `is_muted`.
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.request(|respond_to| Command::ToggleMute { respond_to })
            .await
    }

    /// Returns the new `is_camera_off`.
    pub async fn toggle_camera(&self) -> Result<bool> {
        self.request(|respond_to| Command::ToggleCamera { respond_to })
            .await
    }

    pub async fn end_room(&self) -> Result<()> {
        self.request(|respond_to| Command::EndRoom { respond_to })
            .await
    }

    pub async fn remove_participant(&self, participant_id: &str) -> Result<()> {
        let participant_id = participant_id.to_string();
        self.request(|respond_to| Command::RemoveParticipant {
            participant_id,
            respond_to,
        })
        .await
    }

    pub async fn force_unmute(&self, participant_id: &str) -> Result<()> {
        let participant_id = participant_id.to_string();
        self.request(|respond_to| Command::ForceUnmute {
            participant_id,
            respond_to,
        })
        .await
    }

    /// Leaves voluntarily. A session that already ended is left as is.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Leave { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Waits until teardown completes and returns why the session ended.
    pub async fn wait_until_left(&mut self) -> Option<LeaveReason> {
        loop {
            if let RoomState::Left(reason) = *self.state.borrow_and_update() {
                return Some(reason);
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().leave_reason();
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct RoomActor {
    code: String,
    principal: Principal,
    role: Role,
    room: RoomRecord,
    presence: PresenceStore,
    mesh: MeshManager,
    media: MediaSource,
    /// Latest delivered participant list, in arrival order.
    participants: Vec<ParticipantRecord>,
    /// Remote media keyed by transport address.
    remote_streams: HashMap<String, RemoteStream>,
    /// Addresses with a `call_peer` in flight.
    attempting: HashSet<String>,
    forced_unmute_acked: bool,
    commands: mpsc::Receiver<Command>,
    room_watch: RoomWatch,
    participants_watch: ParticipantsWatch,
    room_live: bool,
    participants_live: bool,
    mesh_events: mpsc::UnboundedReceiver<MeshEvent>,
    outcomes_tx: mpsc::UnboundedSender<(String, Result<RemoteStream>)>,
    outcomes: mpsc::UnboundedReceiver<(String, Result<RemoteStream>)>,
    calls_cancel: CancellationToken,
    state_tx: watch::Sender<RoomState>,
    projection_tx: watch::Sender<Projection>,
}

impl RoomActor {
    fn state(&self) -> RoomState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: RoomState) {
        debug!(room = %self.code, %state, "room state");
        self.state_tx.send_replace(state);
    }

    #[instrument(skip_all, name = "room.actor", fields(room = %self.code, principal = %self.principal.id))]
    async fn run(mut self) {
        let reason = loop {
            if let Some(reason) = self.state().leave_reason() {
                break reason;
            }
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break LeaveReason::Voluntary,
                },

                snapshot = self.participants_watch.changed(), if self.participants_live => {
                    match snapshot {
                        Ok(snapshot) => self.handle_participants(snapshot).await,
                        Err(e) => {
                            warn!(error = %e, "participant subscription closed");
                            self.participants_live = false;
                        }
                    }
                }

                snapshot = self.room_watch.changed(), if self.room_live => {
                    match snapshot {
                        Ok(snapshot) => self.handle_room(snapshot),
                        Err(e) => {
                            warn!(error = %e, "room subscription closed");
                            self.room_live = false;
                        }
                    }
                }

                Some(event) = self.mesh_events.recv() => self.handle_mesh_event(event).await,

                Some((address, outcome)) = self.outcomes.recv() => {
                    self.handle_call_outcome(address, outcome);
                }
            }
        };
        self.leave(reason).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ToggleMute { respond_to } => {
                let result = self.media.toggle_mute();
                if result.is_ok() {
                    self.publish_projection();
                    self.mirror_media_flags().await;
                }
                let _ = respond_to.send(result);
            }
            Command::ToggleCamera { respond_to } => {
                let result = self.media.toggle_camera().await;
                if result.is_ok() {
                    if let Some(stream) = self.media.stream().cloned() {
                        self.mesh.replace_local_media(stream).await;
                    }
                    self.publish_projection();
                    self.mirror_media_flags().await;
                }
                let _ = respond_to.send(result);
            }
            Command::EndRoom { respond_to } => {
                let result = match self.require_admin("end the room") {
                    Ok(()) => self.presence.end_room(&self.code).await,
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }
            Command::RemoveParticipant {
                participant_id,
                respond_to,
            } => {
                let result = self.remove_participant(&participant_id).await;
                let _ = respond_to.send(result);
            }
            Command::ForceUnmute {
                participant_id,
                respond_to,
            } => {
                let result = match self.require_admin("force unmute") {
                    Ok(()) => {
                        info!(participant = %participant_id, "forcing unmute");
                        self.presence
                            .force_unmute(&self.code, &participant_id)
                            .await
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }
            Command::Leave { respond_to } => {
                self.leave(LeaveReason::Voluntary).await;
                let _ = respond_to.send(());
            }
        }
    }

    fn require_admin(&self, action: &str) -> Result<()> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            Err(Error::NotAuthorized(format!(
                "only the room admin can {action}"
            )))
        }
    }

    async fn remove_participant(&mut self, participant_id: &str) -> Result<()> {
        self.require_admin("remove participants")?;
        if participant_id == self.principal.id {
            return Err(Error::InvalidRequest(
                "use leave to remove yourself".to_string(),
            ));
        }
        self.presence
            .remove_participant(&self.code, participant_id)
            .await?;
        info!(participant = %participant_id, "participant removed");

        let address = self
            .participants
            .iter()
            .find(|p| p.id == participant_id)
            .filter(|p| p.has_address())
            .map_or_else(|| participant_id.to_string(), |p| p.peer_id.clone());
        self.mesh.close_session(&address).await;
        self.attempting.remove(&address);
        self.remote_streams.remove(&address);
        self.publish_projection();
        Ok(())
    }

    /// Writes the local media flags to our record. Failures are logged only.
    async fn mirror_media_flags(&self) {
        let patch = ParticipantPatch::media(self.media.is_muted(), self.media.is_camera_off());
        if let Err(e) = self
            .presence
            .update_participant(&self.code, &self.principal.id, &patch)
            .await
        {
            warn!(error = %e, "could not mirror media flags");
        }
    }

    async fn handle_participants(&mut self, snapshot: Snapshot<Vec<ParticipantRecord>>) {
        if !self.state().is_connected() {
            return;
        }
        let list = match snapshot {
            Snapshot::Ready(list) => list,
            Snapshot::Unavailable(reason) => {
                debug!(%reason, "participant state unknown, holding");
                return;
            }
            Snapshot::Pending => return,
        };

        let Some(own) = list.iter().find(|p| p.id == self.principal.id).cloned() else {
            self.participants = list;
            // Ending a room deletes every record after clearing `active`.
            if self.room_has_ended() {
                info!("room was ended");
                self.set_state(RoomState::RoomEnded);
            } else {
                info!("our participant record is gone");
                self.set_state(RoomState::Kicked);
            }
            return;
        };
        self.role = own.role;
        self.participants = list;

        self.handle_forced_unmute(&own).await;
        self.converge().await;
        self.publish_projection();
    }

    /// Acknowledges a forced unmute once per `false -> true` transition.
    async fn handle_forced_unmute(&mut self, own: &ParticipantRecord) {
        if !own.forced_unmute {
            self.forced_unmute_acked = false;
            return;
        }
        if self.forced_unmute_acked {
            return;
        }
        info!("admin forced unmute");
        if let Err(e) = self.media.force_unmute() {
            warn!(error = %e, "could not re-enable audio");
        }
        self.forced_unmute_acked = true;

        let ack = ParticipantPatch {
            forced_unmute: Some(false),
            ..Default::default()
        };
        if let Err(e) = self
            .presence
            .update_participant(&self.code, &self.principal.id, &ack)
            .await
        {
            warn!(error = %e, "forced unmute acknowledgement failed");
            self.forced_unmute_acked = false;
        }
    }

    fn room_has_ended(&self) -> bool {
        match self.room_watch.latest() {
            Snapshot::Ready(Some(room)) => !room.active,
            Snapshot::Ready(None) => true,
            _ => false,
        }
    }

    fn handle_room(&mut self, snapshot: Snapshot<Option<RoomRecord>>) {
        if !self.state().is_connected() {
            return;
        }
        match snapshot {
            Snapshot::Ready(Some(room)) => {
                let ended = !room.active;
                self.room = room;
                if ended {
                    info!("room was ended");
                    self.set_state(RoomState::RoomEnded);
                }
            }
            Snapshot::Ready(None) => {
                info!("room document is gone");
                self.set_state(RoomState::RoomEnded);
            }
            Snapshot::Unavailable(reason) => debug!(%reason, "room state unknown, holding"),
            Snapshot::Pending => {}
        }
    }

    async fn handle_mesh_event(&mut self, event: MeshEvent) {
        if !self.state().is_connected() {
            return;
        }
        match event {
            MeshEvent::RemoteStream { peer, stream } => {
                debug!(%peer, "remote stream available");
                self.remote_streams.insert(peer, stream);
                self.publish_projection();
            }
            MeshEvent::PeerDisconnected { peer } => {
                debug!(%peer, "peer disconnected");
                self.remote_streams.remove(&peer);
                self.attempting.remove(&peer);
                // A participant still listed is called again.
                self.converge().await;
                self.publish_projection();
            }
            MeshEvent::Error(message) => warn!(%message, "mesh error"),
        }
    }

    fn handle_call_outcome(&mut self, address: String, outcome: Result<RemoteStream>) {
        self.attempting.remove(&address);
        if !self.state().is_connected() {
            return;
        }
        match outcome {
            Ok(stream) => {
                self.remote_streams.insert(address, stream);
                self.publish_projection();
            }
            Err(e) => debug!(peer = %address, error = %e, "call failed, retrying on next change"),
        }
    }

    /// Addresses the store says we should be connected to.
    fn desired_addresses(&self) -> HashSet<String> {
        self.participants
            .iter()
            .filter(|p| p.id != self.principal.id && p.has_address())
            .filter(|p| p.peer_id != self.principal.id)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    async fn converge(&mut self) {
        let current = self.desired_addresses();
        let mut active: HashSet<String> = self.mesh.session_addresses().await.into_iter().collect();
        active.extend(self.attempting.iter().cloned());

        for address in current.difference(&active) {
            debug!(peer = %address, "calling");
            self.attempting.insert(address.clone());
            let mesh = self.mesh.clone();
            let outcomes = self.outcomes_tx.clone();
            let cancel = self.calls_cancel.clone();
            let address = address.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    outcome = mesh.call_peer(&address) => {
                        let _ = outcomes.send((address, outcome));
                    }
                }
            });
        }

        for address in active.difference(&current) {
            debug!(peer = %address, "closing session");
            self.attempting.remove(address);
            self.remote_streams.remove(address);
            self.mesh.close_session(address).await;
        }
    }

    fn publish_projection(&self) {
        let local = LocalView {
            id: &self.principal.id,
            stream: self.media.stream(),
            is_muted: self.media.is_muted(),
            is_camera_off: self.media.is_camera_off(),
        };
        let projection = projection::project(&self.participants, &local, &self.remote_streams);
        self.projection_tx.send_replace(projection);
    }

    /// Tears the session down. Runs at most once; every step is best effort.
    async fn leave(&mut self, reason: LeaveReason) {
        if matches!(self.state(), RoomState::Leaving(_) | RoomState::Left(_)) {
            return;
        }
        info!(%reason, "leaving room");
        self.set_state(RoomState::Leaving(reason));

        self.room_watch.cancel();
        self.participants_watch.cancel();
        self.room_live = false;
        self.participants_live = false;
        self.calls_cancel.cancel();

        if let Err(e) = self
            .presence
            .remove_participant(&self.code, &self.principal.id)
            .await
        {
            warn!(error = %e, "could not delete our participant record");
        }
        self.mesh.destroy().await;
        self.media.stop();

        self.attempting.clear();
        self.remote_streams.clear();
        self.participants.clear();
        self.projection_tx.send_replace(Projection::default());
        self.set_state(RoomState::Left(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Profile;
    use crate::media::SyntheticCapture;
    use crate::mesh::{LoopbackHub, LoopbackTransport};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn principal(id: &str, role: Role) -> Principal {
        Principal {
            id: id.to_string(),
            profile: Profile {
                display_name: format!("{id}-name"),
                role,
            },
        }
    }

    fn deps(store: &Arc<MemoryStore>, hub: &Arc<LoopbackHub>) -> RoomDeps {
        RoomDeps {
            store: store.clone(),
            transport: Arc::new(LoopbackTransport::new(hub.clone())),
            capture: Arc::new(SyntheticCapture::new()),
            config: MeshConfig {
                call_timeout: Duration::from_secs(2),
                reconnect_delay: Duration::from_millis(10),
                max_reconnect_attempts: 2,
                snapshot_timeout: Duration::from_secs(2),
            },
        }
    }

    async fn room(store: &Arc<MemoryStore>, owner: &Principal) -> String {
        PresenceStore::new(store.clone())
            .create_room(owner)
            .await
            .unwrap()
            .code
    }

    #[tokio::test]
    async fn join_requires_sign_in() {
        let store = Arc::new(MemoryStore::new());
        let hub = LoopbackHub::new();
        let err = RoomReconciler::join(deps(&store, &hub), &AuthSession::signed_out(), "ABC123")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotAuthenticated));
    }

    #[tokio::test]
    async fn join_missing_or_ended_room_fails_cleanly() {
        let store = Arc::new(MemoryStore::new());
        let hub = LoopbackHub::new();
        let adm = principal("adm", Role::Admin);
        let user = AuthSession::signed_in(principal("u1", Role::User));

        let err = RoomReconciler::join(deps(&store, &hub), &user, "nope42")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::RoomNotFound(ref code) if code == "NOPE42"));

        let code = room(&store, &adm).await;
        PresenceStore::new(store.clone()).end_room(&code).await.unwrap();
        let err = RoomReconciler::join(deps(&store, &hub), &user, &code.to_lowercase())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::RoomInactive(_)));
        assert!(!err.is_retryable());
        assert!(!hub.is_registered("u1"));
    }

    #[tokio::test]
    async fn address_in_use_rolls_back_the_record() {
        let store = Arc::new(MemoryStore::new());
        let hub = LoopbackHub::new();
        let adm = principal("adm", Role::Admin);
        let code = room(&store, &adm).await;

        // Someone else already holds the address.
        let squatter = LoopbackTransport::new(hub.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        squatter.register("u1", tx).await.unwrap();

        let user = AuthSession::signed_in(principal("u1", Role::User));
        let err = RoomReconciler::join(deps(&store, &hub), &user, &code)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::AddressInUse(_)));
        let remaining = PresenceStore::new(store.clone())
            .participants(&code)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn joined_record_carries_defaults_and_address() {
        let store = Arc::new(MemoryStore::new());
        let hub = LoopbackHub::new();
        let adm = principal("adm", Role::Admin);
        let code = room(&store, &adm).await;

        let handle = RoomReconciler::join(
            deps(&store, &hub),
            &AuthSession::signed_in(principal("u1", Role::User)),
            &code,
        )
        .await
        .unwrap();
        assert_eq!(handle.state(), RoomState::Connected);

        let records = PresenceStore::new(store.clone())
            .participants(&code)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.peer_id, "u1");
        assert_eq!(record.role, Role::User);
        assert!(!record.is_muted);
        assert!(record.is_camera_off);
        assert!(!record.forced_unmute);

        let projection = handle.projection();
        assert_eq!(projection.ids(), vec!["u1"]);
        assert!(matches!(
            projection.entry("u1").unwrap().stream,
            Some(StreamRef::Local(_))
        ));
    }

    #[tokio::test]
    async fn toggles_mirror_flags_even_when_store_rejects() {
        let store = Arc::new(MemoryStore::new());
        let hub = LoopbackHub::new();
        let adm = principal("adm", Role::Admin);
        let code = room(&store, &adm).await;
        let handle = RoomReconciler::join(deps(&store, &hub), &AuthSession::signed_in(adm), &code)
            .await
            .unwrap();

        assert!(handle.toggle_mute().await.unwrap());
        assert!(!handle.toggle_camera().await.unwrap());
        let presence = PresenceStore::new(store.clone());
        let record = presence.participants(&code).await.unwrap().remove(0);
        assert!(record.is_muted);
        assert!(!record.is_camera_off);

        store.fail_writes(Some("offline")).await;
        assert!(!handle.toggle_mute().await.unwrap());
        store.fail_writes(None).await;

        let record = presence.participants(&code).await.unwrap().remove(0);
        assert!(record.is_muted, "store keeps the last mirrored value");
        assert!(!handle.projection().entry("adm").unwrap().is_muted);
        assert_eq!(handle.state(), RoomState::Connected);
    }

    #[tokio::test]
    async fn dropping_the_handle_leaves() {
        let store = Arc::new(MemoryStore::new());
        let hub = LoopbackHub::new();
        let adm = principal("adm", Role::Admin);
        let code = room(&store, &adm).await;
        let handle = RoomReconciler::join(deps(&store, &hub), &AuthSession::signed_in(adm), &code)
            .await
            .unwrap();
        let mut state = handle.state_watch();
        drop(handle);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !matches!(*state.borrow_and_update(), RoomState::Left(_)) {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(*state.borrow(), RoomState::Left(LeaveReason::Voluntary));
        assert!(!hub.is_registered("adm"));
        assert!(PresenceStore::new(store.clone())
            .participants(&code)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn commands_after_leave_report_closed_session() {
        let store = Arc::new(MemoryStore::new());
        let hub = LoopbackHub::new();
        let adm = principal("adm", Role::Admin);
        let code = room(&store, &adm).await;
        let mut handle =
            RoomReconciler::join(deps(&store, &hub), &AuthSession::signed_in(adm), &code)
                .await
                .unwrap();

        handle.leave().await;
        assert_eq!(handle.wait_until_left().await, Some(LeaveReason::Voluntary));
        assert!(matches!(handle.toggle_mute().await, Err(Error::SessionClosed)));
        handle.leave().await;
    }
}
