//! Synthetic capture device.
//!
//! Produces tracks without touching hardware. Either device can be marked as
//! denied to exercise the fallback paths.

use super::{LocalStream, MediaCapture, MediaTrack, TrackKind, TrackSource};
use crate::error::{Error, Result};
use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture {
    camera_denied: bool,
    microphone_denied: bool,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_camera(mut self) -> Self {
        self.camera_denied = true;
        self
    }

    pub fn deny_microphone(mut self) -> Self {
        self.microphone_denied = true;
        self
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(&self, want_video: bool, want_audio: bool) -> Result<LocalStream> {
        if want_video && self.camera_denied {
            return Err(Error::Media("camera permission denied".to_string()));
        }
        if want_audio && self.microphone_denied {
            return Err(Error::Media("microphone permission denied".to_string()));
        }

        let mut tracks = Vec::new();
        if want_audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone));
        }
        if want_video {
            tracks.push(MediaTrack::new(TrackKind::Video, TrackSource::Camera));
        }
        Ok(LocalStream::new(tracks))
    }

    async fn open_camera(&self) -> Result<MediaTrack> {
        if self.camera_denied {
            return Err(Error::Media("camera permission denied".to_string()));
        }
        Ok(MediaTrack::new(TrackKind::Video, TrackSource::Camera))
    }

    fn placeholder_video(&self) -> MediaTrack {
        MediaTrack::new(TrackKind::Video, TrackSource::Placeholder)
    }
}
