//! Local and remote media tracks.
//!
//! Capture and rendering live outside this crate; a [`MediaTrack`] only carries the state the
//! negotiation layer needs: identity, kind, the `enabled` flag and an end-of-track signal.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Arc<Self> {
        Self::with_id(Uuid::new_v4().to_string(), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Arc<Self> {
        let (ended, _) = watch::channel(false);
        Arc::new(Self {
            id: id.into(),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            ended,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip `enabled` and return the new value.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// End the track. Stopping twice is harmless.
    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolves once the track has ended, whoever stopped it.
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

/// The endpoint's outgoing tracks, one slot per role.
#[derive(Debug, Clone, Default)]
pub struct LocalTracks {
    pub video: Option<Arc<MediaTrack>>,
    pub audio: Option<Arc<MediaTrack>>,
}

impl LocalTracks {
    pub fn new(video: Option<Arc<MediaTrack>>, audio: Option<Arc<MediaTrack>>) -> Self {
        Self { video, audio }
    }

    /// A camera and a microphone track with fresh ids.
    pub fn camera_and_microphone() -> Self {
        Self::new(
            Some(MediaTrack::new(TrackKind::Video, "camera")),
            Some(MediaTrack::new(TrackKind::Audio, "microphone")),
        )
    }

    pub fn get(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        }
    }

    /// Put `track` in its kind's slot and return whatever was there.
    pub fn set(&mut self, track: Arc<MediaTrack>) -> Option<Arc<MediaTrack>> {
        let slot = match track.kind() {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        };
        slot.replace(track)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.video.iter().chain(self.audio.iter())
    }

    pub fn toggle(&self, kind: TrackKind) -> Result<bool, SessionError> {
        self.get(kind)
            .map(|track| track.toggle())
            .ok_or(SessionError::NoLocalTrack(kind))
    }
}

/// Present only while the screen stands in for the camera.
#[derive(Debug, Clone)]
pub struct TrackSwap {
    pub original: Arc<MediaTrack>,
    pub screen: Arc<MediaTrack>,
}
