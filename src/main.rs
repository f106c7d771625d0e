//! Meshroom demo
//!
//! Runs a two-participant room in one process:
//! 1. Register an admin and a user with the in-memory identity provider
//! 2. The admin creates a room; both participants join it
//! 3. Wait for the mesh to converge and log the projection
//! 4. Exercise the admin commands, then end the room
//!
//! `MESHROOM_TRANSPORT=webrtc` swaps the loopback hub for real peer
//! connections negotiated through the configured signaling server.

use anyhow::{bail, Context};
use meshroom::config::{Config, TransportKind};
use meshroom::mesh::{CallTransport, LoopbackHub, LoopbackTransport, WebRtcTransport};
use meshroom::room::{RoomDeps, RoomHandle, RoomReconciler, StreamRef};
use meshroom::{
    AuthSession, IdentityProvider, MemoryIdentityProvider, MemoryStore, PresenceStore,
    SyntheticCapture,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(30);

fn transport(config: &Config, hub: &Arc<LoopbackHub>) -> anyhow::Result<Arc<dyn CallTransport>> {
    Ok(match config.transport {
        TransportKind::Loopback => Arc::new(LoopbackTransport::new(hub.clone())),
        TransportKind::WebRtc => Arc::new(WebRtcTransport::new(config.signaling.clone())?),
    })
}

async fn wait_for_peers(handle: &RoomHandle, expected: usize) -> anyhow::Result<()> {
    let mut projection = handle.projection_watch();
    tokio::time::timeout(CONVERGENCE_TIMEOUT, async {
        loop {
            let streams = projection
                .borrow_and_update()
                .entries
                .iter()
                .filter(|e| e.stream.is_some())
                .count();
            if streams >= expected {
                return Ok(());
            }
            if projection.changed().await.is_err() {
                bail!("room session closed before converging");
            }
        }
    })
    .await
    .context("mesh did not converge")?
}

fn log_projection(who: &str, handle: &RoomHandle) {
    for entry in handle.projection().entries {
        let stream = match &entry.stream {
            Some(StreamRef::Local(stream)) => format!("local {}", stream.id()),
            Some(StreamRef::Remote(stream)) => {
                format!("remote {} ({} tracks)", stream.id, stream.tracks.len())
            }
            None => "no stream".to_string(),
        };
        info!(
            view = who,
            participant = %entry.participant.display_name,
            role = ?entry.participant.role,
            muted = entry.is_muted,
            camera_off = entry.is_camera_off,
            %stream,
            "projection"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshroom=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!(transport = ?config.transport, signaling = ?config.signaling, "starting");

    let identity = MemoryIdentityProvider::new();
    let admin = identity
        .register("host@example.com", "host", "host-secret")
        .await?;
    identity.promote(&admin.id).await?;
    identity
        .register("guest@example.com", "guest", "guest-secret")
        .await?;
    let admin_session = AuthSession::sign_in(&identity, "host", "host-secret").await?;
    let guest_session = AuthSession::sign_in(&identity, "guest@example.com", "guest-secret").await?;

    let store = Arc::new(MemoryStore::new());
    let room = PresenceStore::new(store.clone())
        .create_room(admin_session.require()?)
        .await?;
    info!(room = %room.code, "room created");

    let hub = LoopbackHub::new();
    let deps = |transport| RoomDeps {
        store: store.clone(),
        transport,
        capture: Arc::new(SyntheticCapture::new()),
        config: config.mesh.clone(),
    };

    let mut host =
        RoomReconciler::join(deps(transport(&config, &hub)?), &admin_session, &room.code).await?;
    let mut guest =
        RoomReconciler::join(deps(transport(&config, &hub)?), &guest_session, &room.code).await?;

    wait_for_peers(&host, 2).await?;
    wait_for_peers(&guest, 2).await?;
    log_projection("host", &host);
    log_projection("guest", &guest);

    guest.toggle_mute().await?;
    let camera_off = guest.toggle_camera().await?;
    info!(camera_off, "guest toggled media");

    let guest_id = guest_session.require()?.id.clone();
    host.force_unmute(&guest_id).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    log_projection("guest", &guest);

    host.end_room().await?;
    let host_reason = host.wait_until_left().await;
    let guest_reason = guest.wait_until_left().await;
    info!(?host_reason, ?guest_reason, "room closed");
    Ok(())
}
