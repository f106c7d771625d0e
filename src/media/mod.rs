//! Local media: streams, tracks and the capture boundary.
//!
//! A [`LocalStream`] is a shared handle mutated in place: swapping a track is
//! visible to every holder (the mesh's outbound offers, the local preview)
//! without re-subscribing. Only [`MediaSource`] mutates it.

pub mod synthetic;

pub use synthetic::SyntheticCapture;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    /// Synthetic blank frames standing in for a camera.
    Placeholder,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                source,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Releases the underlying device. Irreversible.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

struct StreamInner {
    id: String,
    tracks: Mutex<Vec<MediaTrack>>,
}

/// Shared, in-place mutable local stream.
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.tracks())
            .finish()
    }
}

impl LocalStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: uuid::Uuid::new_v4().to_string(),
                tracks: Mutex::new(tracks),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MediaTrack>> {
        self.inner
            .tracks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether both handles refer to the same underlying stream.
    pub fn same_stream(&self, other: &LocalStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.lock().clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.lock().iter().filter(|t| t.kind() == kind).cloned().collect()
    }

    pub fn first_track(&self, kind: TrackKind) -> Option<MediaTrack> {
        self.lock().iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn add_track(&self, track: MediaTrack) {
        self.lock().push(track);
    }

    pub fn remove_track(&self, id: &str) -> Option<MediaTrack> {
        let mut tracks = self.lock();
        let index = tracks.iter().position(|t| t.id() == id)?;
        Some(tracks.remove(index))
    }

    /// Stops and removes every track of `kind`.
    pub fn drop_tracks(&self, kind: TrackKind) {
        self.lock().retain(|t| {
            if t.kind() == kind {
                t.set_enabled(false);
                t.stop();
                false
            } else {
                true
            }
        });
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.lock().iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&self) {
        for track in self.lock().iter() {
            track.stop();
        }
    }
}

/// Capture device boundary.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Opens the requested devices. The returned stream may lack a video
    /// track; [`MediaSource`] fills in a placeholder.
    async fn acquire(&self, want_video: bool, want_audio: bool) -> Result<LocalStream>;

    async fn open_camera(&self) -> Result<MediaTrack>;

    fn placeholder_video(&self) -> MediaTrack;
}

/// Owner of the local stream and its mute/camera state.
pub struct MediaSource {
    capture: Arc<dyn MediaCapture>,
    stream: Option<LocalStream>,
    is_muted: bool,
    is_camera_off: bool,
}

impl MediaSource {
    pub fn new(capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            capture,
            stream: None,
            is_muted: false,
            is_camera_off: true,
        }
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted
    }

    pub fn is_camera_off(&self) -> bool {
        self.is_camera_off
    }

    /// Opens local devices. The resulting stream always carries a video
    /// track; a placeholder stands in when video is not requested or denied.
    /// A failed capture falls back to audio only, and then to the
    /// placeholder alone.
    pub async fn acquire(&mut self, want_video: bool, want_audio: bool) -> Result<LocalStream> {
        let stream = match self.capture.acquire(want_video, want_audio).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "media capture failed, falling back");
                let fallback = LocalStream::new(Vec::new());
                if want_audio {
                    match self.capture.acquire(false, true).await {
                        Ok(audio) => {
                            for track in audio.tracks_of(TrackKind::Audio) {
                                fallback.add_track(track);
                            }
                        }
                        Err(e) => warn!(error = %e, "could not get audio"),
                    }
                }
                fallback
            }
        };

        let has_camera = stream
            .tracks_of(TrackKind::Video)
            .iter()
            .any(|t| t.source() == TrackSource::Camera);
        if stream.first_track(TrackKind::Video).is_none() {
            stream.add_track(self.capture.placeholder_video());
        }

        self.is_camera_off = !has_camera;
        self.is_muted = stream.first_track(TrackKind::Audio).is_none();
        self.stream = Some(stream.clone());
        debug!(stream = %stream.id(), camera = has_camera, "local media acquired");
        Ok(stream)
    }

    fn require_stream(&self) -> Result<&LocalStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| Error::Media("local media not acquired".to_string()))
    }

    /// Flips the audio tracks' enabled state and returns the new `is_muted`.
    pub fn toggle_mute(&mut self) -> Result<bool> {
        let stream = self.require_stream()?;
        let muted = !self.is_muted;
        stream.set_enabled(TrackKind::Audio, !muted);
        self.is_muted = muted;
        Ok(muted)
    }

    /// Re-enables audio regardless of the local mute state.
    pub fn force_unmute(&mut self) -> Result<()> {
        let stream = self.require_stream()?;
        stream.set_enabled(TrackKind::Audio, true);
        self.is_muted = false;
        Ok(())
    }

    /// Swaps the video track in place and returns the new `is_camera_off`.
    ///
    /// If the camera cannot be opened the placeholder stays and the error is
    /// returned with the camera still off.
    pub async fn toggle_camera(&mut self) -> Result<bool> {
        let stream = self.require_stream()?.clone();
        if self.is_camera_off {
            let camera = self.capture.open_camera().await?;
            stream.drop_tracks(TrackKind::Video);
            stream.add_track(camera);
            self.is_camera_off = false;
        } else {
            stream.drop_tracks(TrackKind::Video);
            stream.add_track(self.capture.placeholder_video());
            self.is_camera_off = true;
        }
        Ok(self.is_camera_off)
    }

    /// Stops every track and forgets the stream.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            debug!(stream = %stream.id(), "local media stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_defaults_to_mic_and_placeholder() {
        let mut source = MediaSource::new(Arc::new(SyntheticCapture::new()));
        let stream = source.acquire(false, true).await.unwrap();

        assert!(!source.is_muted());
        assert!(source.is_camera_off());
        let video = stream.first_track(TrackKind::Video).unwrap();
        assert_eq!(video.source(), TrackSource::Placeholder);
        assert!(stream.first_track(TrackKind::Audio).is_some());
    }

    #[tokio::test]
    async fn denied_capture_still_yields_video_track() {
        let capture = SyntheticCapture::new().deny_camera().deny_microphone();
        let mut source = MediaSource::new(Arc::new(capture));
        let stream = source.acquire(true, true).await.unwrap();

        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(
            stream.first_track(TrackKind::Video).unwrap().source(),
            TrackSource::Placeholder
        );
        assert!(source.is_camera_off());
        assert!(source.is_muted());
    }

    #[tokio::test]
    async fn camera_denied_falls_back_to_audio() {
        let capture = SyntheticCapture::new().deny_camera();
        let mut source = MediaSource::new(Arc::new(capture));
        let stream = source.acquire(true, true).await.unwrap();
        assert!(stream.first_track(TrackKind::Audio).is_some());
        assert!(!source.is_muted());
        assert!(source.is_camera_off());
    }

    #[tokio::test]
    async fn toggle_mute_flips_audio_tracks() {
        let mut source = MediaSource::new(Arc::new(SyntheticCapture::new()));
        let stream = source.acquire(false, true).await.unwrap();
        let audio = stream.first_track(TrackKind::Audio).unwrap();

        assert!(source.toggle_mute().unwrap());
        assert!(!audio.is_enabled());
        assert!(!source.toggle_mute().unwrap());
        assert!(audio.is_enabled());

        source.toggle_mute().unwrap();
        source.force_unmute().unwrap();
        assert!(!source.is_muted());
        assert!(audio.is_enabled());
    }

    #[tokio::test]
    async fn toggle_camera_swaps_track_in_place() {
        let mut source = MediaSource::new(Arc::new(SyntheticCapture::new()));
        let stream = source.acquire(false, true).await.unwrap();
        let preview = stream.clone();
        let placeholder = stream.first_track(TrackKind::Video).unwrap();

        assert!(!source.toggle_camera().await.unwrap());
        assert!(placeholder.is_stopped());
        let camera = preview.first_track(TrackKind::Video).unwrap();
        assert_eq!(camera.source(), TrackSource::Camera);
        assert_eq!(preview.tracks_of(TrackKind::Video).len(), 1);

        assert!(source.toggle_camera().await.unwrap());
        assert!(camera.is_stopped());
        assert_eq!(
            preview.first_track(TrackKind::Video).unwrap().source(),
            TrackSource::Placeholder
        );
        assert!(source.stream().unwrap().same_stream(&preview));
    }

    #[tokio::test]
    async fn camera_failure_keeps_camera_off() {
        let mut source = MediaSource::new(Arc::new(SyntheticCapture::new().deny_camera()));
        let stream = source.acquire(false, true).await.unwrap();
        assert!(source.toggle_camera().await.is_err());
        assert!(source.is_camera_off());
        assert_eq!(
            stream.first_track(TrackKind::Video).unwrap().source(),
            TrackSource::Placeholder
        );
    }

    #[tokio::test]
    async fn stop_releases_all_tracks() {
        let mut source = MediaSource::new(Arc::new(SyntheticCapture::new()));
        let stream = source.acquire(false, true).await.unwrap();
        source.stop();
        assert!(source.stream().is_none());
        assert!(stream.tracks().iter().all(MediaTrack::is_stopped));
        assert!(source.toggle_mute().is_err());
    }
}
