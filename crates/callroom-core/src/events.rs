use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::surface::{MediaElement, Region};

/// Events emitted by the call view to UI listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CallEvent {
    StateChanged(CallState),
    PreviewReady(Vec<TrackInfo>),
    MediaAccessFailed(String),
    JoinFailed(String),
    Joined { room: String, identity: String },
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(String), // participant SID
    TrackAttached { region: Region, track: TrackInfo, element: MediaElement },
    TrackDetached { region: Region, track: TrackInfo },
    TrackUnpublished(TrackInfo),
    Left(LeaveReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Previewing,
    Joining,
    InRoom,
    Leaving,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// The user pressed Leave.
    Local,
    /// The room went away underneath us (network loss, room closed, kicked).
    Remote(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantInfo {
    pub sid: String,
    pub identity: String,
    pub attached_track_sids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub sid: String,
    /// `None` for the local participant's own tracks.
    pub participant_sid: Option<String>,
    pub kind: TrackKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait CallEventListener: Send + Sync {
    fn on_event(&self, event: CallEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn CallEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: CallEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
