//! Seam to the real-time media SDK.
//!
//! Signaling, negotiation, transport and track lifecycle all live behind
//! these traits. The call view only ever sees handles and lifecycle events.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::errors::CallError;
use crate::events::{TrackInfo, TrackKind};
use crate::surface::MediaElement;
use crate::token::AccessToken;

/// Stream of lifecycle events for one room connection.
pub type RoomEvents = UnboundedReceiver<RoomEvent>;

/// Which devices to capture for the local preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub audio: bool,
    pub video: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub room_name: String,
    /// Already captured local tracks to publish instead of capturing again.
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

/// A single audio or video stream.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn sid(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn name(&self) -> &str;
    /// Create a new element rendering this track.
    fn attach(&self) -> MediaElement;
    /// Forget every element this track is rendering into and return them so
    /// the caller can take them off screen.
    fn detach(&self) -> Vec<MediaElement>;
    /// Release the underlying capture device.
    fn stop(&self);
}

/// A participant's announcement of a track.
pub trait TrackPublication: Send + Sync + fmt::Debug {
    /// Same as the sid of the track being announced.
    fn sid(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn name(&self) -> &str;
    fn is_subscribed(&self) -> bool;
    /// The media, present only while subscribed.
    fn track(&self) -> Option<Arc<dyn MediaTrack>>;
}

pub trait Participant: Send + Sync + fmt::Debug {
    fn sid(&self) -> &str;
    fn identity(&self) -> &str;
    fn track_publications(&self) -> Vec<Arc<dyn TrackPublication>>;
}

/// A joined session.
pub trait RoomConnection: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn local_participant(&self) -> Arc<dyn Participant>;
    fn remote_participants(&self) -> Vec<Arc<dyn Participant>>;
    /// Leave the room. The SDK follows up with `RoomEvent::Disconnected`.
    fn disconnect(&self);
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    ParticipantConnected(Arc<dyn Participant>),
    ParticipantDisconnected(Arc<dyn Participant>),
    TrackPublished {
        participant: Arc<dyn Participant>,
        publication: Arc<dyn TrackPublication>,
    },
    TrackUnpublished {
        participant: Arc<dyn Participant>,
        publication: Arc<dyn TrackPublication>,
    },
    TrackSubscribed {
        participant: Arc<dyn Participant>,
        publication: Arc<dyn TrackPublication>,
        track: Arc<dyn MediaTrack>,
    },
    TrackUnsubscribed {
        participant: Arc<dyn Participant>,
        publication: Arc<dyn TrackPublication>,
        track: Arc<dyn MediaTrack>,
    },
    Disconnected {
        reason: Option<String>,
    },
}

#[async_trait]
pub trait MediaService: Send + Sync {
    /// Capture local camera and microphone tracks.
    async fn create_local_tracks(
        &self,
        options: CaptureOptions,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, CallError>;

    /// Exchange a token for a live room connection.
    async fn connect(
        &self,
        token: &AccessToken,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn RoomConnection>, RoomEvents), CallError>;
}

pub(crate) fn track_info(track: &dyn MediaTrack, participant_sid: Option<&str>) -> TrackInfo {
    TrackInfo {
        sid: track.sid().to_string(),
        participant_sid: participant_sid.map(str::to_string),
        kind: track.kind(),
        name: track.name().to_string(),
    }
}

pub(crate) fn publication_info(
    publication: &dyn TrackPublication,
    participant_sid: &str,
) -> TrackInfo {
    TrackInfo {
        sid: publication.sid().to_string(),
        participant_sid: Some(participant_sid.to_string()),
        kind: publication.kind(),
        name: publication.name().to_string(),
    }
}
