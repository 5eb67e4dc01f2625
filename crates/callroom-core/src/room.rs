use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{CallConfig, CallSettings};
use crate::errors::CallError;
use crate::events::{
    CallEvent, CallEventListener, CallState, EventEmitter, LeaveReason, ParticipantInfo,
};
use crate::media::{
    ConnectOptions, MediaService, MediaTrack, Participant, RoomConnection, RoomEvent, RoomEvents,
    TrackPublication, publication_info, track_info,
};
use crate::participants::{AttachedTrack, ParticipantManager};
use crate::surface::{MediaElement, MediaSurface, Region};
use crate::token::TokenProvider;

/// The call page: local preview, remote grid and a Leave action, kept in
/// sync with one room connection.
pub struct CallView {
    service: Arc<dyn MediaService>,
    tokens: TokenProvider,
    settings: CallSettings,
    emitter: EventEmitter,
    inner: Arc<Mutex<CallInner>>,
}

impl CallView {
    pub fn new(service: Arc<dyn MediaService>, tokens: TokenProvider, settings: CallSettings) -> Self {
        let emitter = EventEmitter::new();
        Self {
            service,
            tokens,
            settings,
            inner: Arc::new(Mutex::new(CallInner::new(emitter.clone()))),
            emitter,
        }
    }

    pub fn from_config(service: Arc<dyn MediaService>, config: &CallConfig) -> Self {
        Self::new(service, config.token_provider(), config.settings.clone())
    }

    /// Register a listener for call events.
    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    /// Identity minted for the current session.
    pub async fn identity(&self) -> Option<String> {
        self.inner.lock().await.identity.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connection.is_some()
    }

    /// Snapshot of the remote participants.
    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        self.inner.lock().await.participants.participants()
    }

    pub async fn local_elements(&self) -> Vec<MediaElement> {
        self.elements(Region::LocalPreview).await
    }

    pub async fn remote_elements(&self) -> Vec<MediaElement> {
        self.elements(Region::RemoteGrid).await
    }

    /// Number of captured local tracks still held (and running).
    pub async fn local_track_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .preview_tracks
            .as_ref()
            .map_or(0, Vec::len)
    }

    async fn elements(&self, region: Region) -> Vec<MediaElement> {
        self.inner.lock().await.surface.elements(region).to_vec()
    }

    /// Mount the call: preview local media, then join the configured room.
    ///
    /// Also the retry action after a failed join; held preview tracks are
    /// reused rather than captured again. Failures are logged and emitted
    /// as events before being returned.
    pub async fn start(&self) -> Result<(), CallError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            if inner.state != CallState::Idle {
                return Err(CallError::Room(format!(
                    "cannot start a call while {:?}",
                    inner.state
                )));
            }
            inner.set_state(CallState::Previewing);
            inner.epoch
        };

        let tracks = match self.preview(epoch).await {
            Ok(tracks) => tracks,
            Err(CallError::MediaAccess(reason)) if self.settings.join_without_local_media => {
                tracing::warn!("joining without local media: {reason}");
                Vec::new()
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch {
                    inner.set_state(CallState::Idle);
                }
                return Err(e);
            }
        };

        self.join(epoch, tracks).await
    }

    /// Leave the room and release everything on screen.
    ///
    /// Safe to call at any time, any number of times.
    pub async fn leave(&self) {
        let mut inner = self.inner.lock().await;
        inner.epoch += 1;
        if let Some(handle) = inner.event_loop.take() {
            handle.abort();
        }
        let connection = inner.connection.take();
        if let Some(room) = &connection {
            tracing::info!("leaving room '{}'", room.name());
            room.disconnect();
        }
        inner.teardown(connection, LeaveReason::Local);
    }

    async fn preview(&self, epoch: u64) -> Result<Vec<Arc<dyn MediaTrack>>, CallError> {
        let held = self.inner.lock().await.preview_tracks.clone();
        let reused = held.is_some();
        let result = match held {
            Some(tracks) => Ok(tracks),
            None => self.service.create_local_tracks(self.settings.capture).await,
        };

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            if let Ok(tracks) = &result {
                if !reused {
                    tracks.iter().for_each(|t| t.stop());
                }
            }
            return Err(CallError::Room("call left during preview".into()));
        }

        match result {
            Ok(tracks) => {
                inner.preview_tracks = Some(tracks.clone());
                if !inner.surface.has_video(Region::LocalPreview) {
                    inner.attach_local(&tracks);
                }
                let infos = tracks.iter().map(|t| track_info(t.as_ref(), None)).collect();
                inner.emitter.emit(CallEvent::PreviewReady(infos));
                Ok(tracks)
            }
            Err(e) => {
                tracing::error!("unable to access local media: {e}");
                inner.emitter.emit(CallEvent::MediaAccessFailed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn join(&self, epoch: u64, tracks: Vec<Arc<dyn MediaTrack>>) -> Result<(), CallError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return Err(CallError::Room("call left before joining".into()));
            }
            inner.set_state(CallState::Joining);
        }

        let room_name = self.settings.room_name.clone();
        let token = match self.tokens.mint(&room_name) {
            Ok(token) => token,
            Err(e) => return self.join_failed(epoch, e).await,
        };
        tracing::info!(identity = token.identity(), room = %room_name, "connecting to room");

        let options = ConnectOptions {
            room_name,
            tracks,
        };
        let (connection, events) = match self.service.connect(&token, options).await {
            Ok(connected) => connected,
            Err(e) => return self.join_failed(epoch, e).await,
        };

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            tracing::warn!("call left while joining; dropping connection to '{}'", connection.name());
            connection.disconnect();
            return Err(CallError::Room("call left while joining".into()));
        }

        inner.room_joined(connection, token.identity());
        let handle = tokio::spawn(Self::event_loop(events, self.inner.clone(), epoch));
        inner.event_loop = Some(handle);
        Ok(())
    }

    async fn join_failed(&self, epoch: u64, error: CallError) -> Result<(), CallError> {
        tracing::error!("unable to connect to room: {error}");
        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch {
            inner.emitter.emit(CallEvent::JoinFailed(error.to_string()));
            inner.set_state(CallState::Idle);
        }
        Err(error)
    }

    async fn event_loop(mut events: RoomEvents, inner: Arc<Mutex<CallInner>>, epoch: u64) {
        while let Some(event) = events.recv().await {
            let mut call = inner.lock().await;
            if call.epoch != epoch {
                tracing::debug!("dropping room event from a finished session");
                return;
            }
            if call.handle_room_event(event) {
                tracing::info!("room event loop ended");
                return;
            }
        }

        let mut call = inner.lock().await;
        if call.epoch == epoch && call.connection.is_some() {
            tracing::warn!("room event stream closed without a disconnect");
            call.epoch += 1;
            call.event_loop = None;
            let connection = call.connection.take();
            call.teardown(connection, LeaveReason::Remote(Some("event stream closed".into())));
        }
    }
}

/// Mutable call state. Only touched while holding the view's lock.
struct CallInner {
    emitter: EventEmitter,
    state: CallState,
    surface: MediaSurface,
    participants: ParticipantManager,
    preview_tracks: Option<Vec<Arc<dyn MediaTrack>>>,
    local_attached: Vec<AttachedTrack>,
    connection: Option<Arc<dyn RoomConnection>>,
    identity: Option<String>,
    /// Bumped whenever a session ends so late results and stale event
    /// loops can tell they no longer apply.
    epoch: u64,
    event_loop: Option<JoinHandle<()>>,
}

impl CallInner {
    fn new(emitter: EventEmitter) -> Self {
        Self {
            emitter,
            state: CallState::Idle,
            surface: MediaSurface::new(),
            participants: ParticipantManager::new(),
            preview_tracks: None,
            local_attached: Vec::new(),
            connection: None,
            identity: None,
            epoch: 0,
            event_loop: None,
        }
    }

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            tracing::debug!("call state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emitter.emit(CallEvent::StateChanged(state));
        }
    }

    fn room_joined(&mut self, connection: Arc<dyn RoomConnection>, identity: &str) {
        let local = connection.local_participant();
        self.participants.set_local_sid(local.sid().to_string());
        self.identity = Some(identity.to_string());
        self.connection = Some(connection.clone());
        self.emitter.emit(CallEvent::Joined {
            room: connection.name().to_string(),
            identity: identity.to_string(),
        });

        if !self.surface.has_video(Region::LocalPreview) {
            self.attach_local(&fetch_tracks(local.as_ref()));
        }

        for participant in connection.remote_participants() {
            tracing::info!("already in room: '{}'", participant.identity());
            self.participant_connected(participant);
        }

        self.set_state(CallState::InRoom);
    }

    /// Returns true once the session is over.
    fn handle_room_event(&mut self, event: RoomEvent) -> bool {
        match event {
            RoomEvent::ParticipantConnected(participant) => {
                tracing::info!("joining: '{}'", participant.identity());
                self.participant_connected(participant);
            }

            RoomEvent::ParticipantDisconnected(participant) => {
                tracing::info!("participant '{}' left the room", participant.identity());
                self.participant_disconnected(participant.as_ref());
            }

            RoomEvent::TrackPublished { participant, publication } => {
                self.track_published(participant.sid(), publication.as_ref());
            }

            RoomEvent::TrackUnpublished { participant, publication } => {
                self.track_unpublished(participant.sid(), publication.as_ref());
            }

            RoomEvent::TrackSubscribed { participant, publication, track } => {
                tracing::info!("subscribed to {:?} track {}", publication.kind(), publication.sid());
                self.attach_remote(participant.sid(), track);
            }

            RoomEvent::TrackUnsubscribed { participant, publication, track } => {
                tracing::info!("unsubscribed from {:?} track {}", publication.kind(), publication.sid());
                self.detach_remote(participant.sid(), track.as_ref());
            }

            RoomEvent::Disconnected { reason } => {
                tracing::info!("room disconnected: {reason:?}");
                self.epoch += 1;
                self.event_loop = None;
                let connection = self.connection.take();
                self.teardown(connection, LeaveReason::Remote(reason));
                return true;
            }
        }
        false
    }

    fn participant_connected(&mut self, participant: Arc<dyn Participant>) {
        if self.participants.local_sid() == Some(participant.sid()) {
            tracing::debug!("ignoring connect event for the local participant");
            return;
        }
        if !self.participants.add_participant(participant.clone()) {
            tracing::debug!("participant '{}' already known", participant.identity());
            return;
        }
        if let Some(info) = self.participants.participant(participant.sid()) {
            self.emitter.emit(CallEvent::ParticipantJoined(info));
        }
        for publication in participant.track_publications() {
            self.track_published(participant.sid(), publication.as_ref());
        }
    }

    fn participant_disconnected(&mut self, participant: &dyn Participant) {
        let Some(leftovers) = self.participants.remove_participant(participant.sid()) else {
            tracing::warn!("disconnect for unknown participant '{}'", participant.identity());
            return;
        };
        for attached in leftovers {
            self.release(Region::RemoteGrid, Some(participant.sid()), attached);
        }
        // Anything the SDK still reports as rendered for this participant.
        for track in fetch_tracks(participant) {
            self.remove_elements(track.as_ref(), Vec::new());
        }
        self.emitter
            .emit(CallEvent::ParticipantLeft(participant.sid().to_string()));
    }

    fn track_published(&mut self, participant_sid: &str, publication: &dyn TrackPublication) {
        if !self.participants.contains(participant_sid) {
            tracing::warn!("track {} published by unknown participant {participant_sid}", publication.sid());
            return;
        }
        match publication.track().filter(|_| publication.is_subscribed()) {
            Some(track) => self.attach_remote(participant_sid, track),
            None => tracing::debug!(
                "waiting for subscription to {:?} track {}",
                publication.kind(),
                publication.sid()
            ),
        }
    }

    fn track_unpublished(&mut self, participant_sid: &str, publication: &dyn TrackPublication) {
        tracing::info!("{:?} track {} was unpublished", publication.kind(), publication.sid());
        self.emitter
            .emit(CallEvent::TrackUnpublished(publication_info(publication, participant_sid)));
        if let Some(attached) = self.participants.take_attached(participant_sid, publication.sid()) {
            self.release(Region::RemoteGrid, Some(participant_sid), attached);
        }
    }

    fn attach_remote(&mut self, participant_sid: &str, track: Arc<dyn MediaTrack>) {
        if !self.participants.contains(participant_sid) {
            tracing::warn!("track {} subscribed for unknown participant {participant_sid}", track.sid());
            return;
        }
        if self.participants.is_attached(participant_sid, track.sid()) {
            tracing::debug!("track {} already attached", track.sid());
            return;
        }

        let element = track.attach();
        self.surface.append(Region::RemoteGrid, element.clone());
        self.emitter.emit(CallEvent::TrackAttached {
            region: Region::RemoteGrid,
            track: track_info(track.as_ref(), Some(participant_sid)),
            element: element.clone(),
        });
        self.participants.record_attached(
            participant_sid,
            AttachedTrack {
                track,
                elements: vec![element],
            },
        );
    }

    fn detach_remote(&mut self, participant_sid: &str, track: &dyn MediaTrack) {
        let recorded = self
            .participants
            .take_attached(participant_sid, track.sid())
            .map(|a| a.elements)
            .unwrap_or_default();
        if self.remove_elements(track, recorded) > 0 {
            self.emitter.emit(CallEvent::TrackDetached {
                region: Region::RemoteGrid,
                track: track_info(track, Some(participant_sid)),
            });
        }
    }

    fn attach_local(&mut self, tracks: &[Arc<dyn MediaTrack>]) {
        for track in tracks {
            if self.local_attached.iter().any(|a| a.track.sid() == track.sid()) {
                continue;
            }
            let element = track.attach();
            self.surface.append(Region::LocalPreview, element.clone());
            self.emitter.emit(CallEvent::TrackAttached {
                region: Region::LocalPreview,
                track: track_info(track.as_ref(), None),
                element: element.clone(),
            });
            self.local_attached.push(AttachedTrack {
                track: track.clone(),
                elements: vec![element],
            });
        }
    }

    /// Take a recorded attachment off screen.
    fn release(&mut self, region: Region, participant_sid: Option<&str>, attached: AttachedTrack) {
        let AttachedTrack { track, elements } = attached;
        if self.remove_elements(track.as_ref(), elements) > 0 {
            self.emitter.emit(CallEvent::TrackDetached {
                region,
                track: track_info(track.as_ref(), participant_sid),
            });
        }
    }

    /// Detach `track` and remove its elements, plus any `recorded` ones the
    /// track itself may have forgotten. Returns how many left the surface.
    fn remove_elements(&mut self, track: &dyn MediaTrack, mut recorded: Vec<MediaElement>) -> usize {
        recorded.extend(track.detach());
        let mut removed = 0;
        for element in &recorded {
            if self.surface.remove(element) {
                removed += 1;
            }
        }
        removed
    }

    /// Release everything the session holds and return to `Idle`.
    fn teardown(&mut self, connection: Option<Arc<dyn RoomConnection>>, reason: LeaveReason) {
        let preview = self.preview_tracks.take();
        let has_work = connection.is_some()
            || preview.is_some()
            || !self.local_attached.is_empty()
            || self.participants.participant_count() > 0
            || !self.surface.is_empty();
        if !has_work {
            tracing::debug!("leave: nothing to tear down");
            self.set_state(CallState::Idle);
            return;
        }

        self.set_state(CallState::Leaving);

        if let Some(tracks) = preview {
            for track in &tracks {
                track.stop();
            }
            tracing::info!("stopped {} local tracks", tracks.len());
        }

        for attached in std::mem::take(&mut self.local_attached) {
            self.release(Region::LocalPreview, None, attached);
        }
        for (participant_sid, attached) in self.participants.clear() {
            self.release(Region::RemoteGrid, Some(&participant_sid), attached);
        }

        if let Some(room) = &connection {
            for track in fetch_tracks(room.local_participant().as_ref()) {
                self.remove_elements(track.as_ref(), Vec::new());
            }
            for participant in room.remote_participants() {
                for track in fetch_tracks(participant.as_ref()) {
                    self.remove_elements(track.as_ref(), Vec::new());
                }
            }
        }

        let stray = self.surface.drain();
        if !stray.is_empty() {
            tracing::warn!("{} media elements were still on screen after leave", stray.len());
        }

        self.identity = None;
        self.set_state(CallState::Idle);
        tracing::info!("left: {reason:?}");
        self.emitter.emit(CallEvent::Left(reason));
    }
}

/// Tracks of a participant's publications that currently carry media.
fn fetch_tracks(participant: &dyn Participant) -> Vec<Arc<dyn MediaTrack>> {
    participant
        .track_publications()
        .iter()
        .filter_map(|publication| publication.track())
        .collect()
}
