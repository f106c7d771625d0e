//! Peer-mesh room client.
//!
//! Participants join a room, publish their transport address through a shared
//! document store, and a per-room reconciler drives a full mesh of peer calls
//! toward the membership the store declares. The room admin can end the room,
//! remove participants and force-unmute them.

pub mod config;
pub mod error;
pub mod identity;
pub mod media;
pub mod mesh;
pub mod presence;
pub mod room;
pub mod store;

pub use config::Config;
pub use error::{Error, IdentityError, Result};
pub use identity::{AuthSession, IdentityProvider, MemoryIdentityProvider, Principal, Role};
pub use media::{LocalStream, MediaCapture, MediaSource, SyntheticCapture};
pub use mesh::{CallTransport, LoopbackHub, LoopbackTransport, MeshEvent, MeshManager, WebRtcTransport};
pub use presence::PresenceStore;
pub use room::{LeaveReason, Projection, RoomDeps, RoomHandle, RoomReconciler, RoomState};
pub use store::{DocumentStore, MemoryStore};
