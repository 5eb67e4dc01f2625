//! In-process media service.
//!
//! Implements the SDK seam without any network or devices: rooms live in a
//! registry keyed by name, and remote participants are driven by hand
//! through [`LoopbackRoom`]. Used by the demo shell and by tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::errors::CallError;
use crate::events::TrackKind;
use crate::media::{
    CaptureOptions, ConnectOptions, MediaService, MediaTrack, Participant, RoomConnection,
    RoomEvent, RoomEvents, TrackPublication,
};
use crate::surface::MediaElement;
use crate::token::AccessToken;

static NEXT_SID: AtomicU64 = AtomicU64::new(1);

fn next_sid(prefix: &str) -> String {
    format!("{prefix}{:08}", NEXT_SID.fetch_add(1, Ordering::Relaxed))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tracks
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LoopbackTrack {
    sid: String,
    kind: TrackKind,
    name: String,
    elements: Mutex<Vec<MediaElement>>,
    attach_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl LoopbackTrack {
    pub fn new(kind: TrackKind, name: &str) -> Arc<Self> {
        Arc::new(Self {
            sid: next_sid("MT"),
            kind,
            name: name.to_string(),
            elements: Mutex::new(Vec::new()),
            attach_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        })
    }

    pub fn attach_count(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_count() > 0
    }

    /// Elements created by `attach` and not yet detached.
    pub fn rendered_elements(&self) -> Vec<MediaElement> {
        lock(&self.elements).clone()
    }
}

impl MediaTrack for LoopbackTrack {
    fn sid(&self) -> &str {
        &self.sid
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self) -> MediaElement {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        let element = MediaElement::new(self.sid.clone(), self.kind);
        lock(&self.elements).push(element.clone());
        element
    }

    fn detach(&self) -> Vec<MediaElement> {
        std::mem::take(&mut *lock(&self.elements))
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Publications and participants
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LoopbackPublication {
    track: Arc<dyn MediaTrack>,
    subscribed: AtomicBool,
}

impl LoopbackPublication {
    fn new(track: Arc<dyn MediaTrack>, subscribed: bool) -> Arc<Self> {
        Arc::new(Self {
            track,
            subscribed: AtomicBool::new(subscribed),
        })
    }
}

impl TrackPublication for LoopbackPublication {
    fn sid(&self) -> &str {
        self.track.sid()
    }

    fn kind(&self) -> TrackKind {
        self.track.kind()
    }

    fn name(&self) -> &str {
        self.track.name()
    }

    fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    fn track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.is_subscribed().then(|| self.track.clone())
    }
}

#[derive(Debug)]
pub struct LoopbackParticipant {
    sid: String,
    identity: String,
    publications: Mutex<Vec<Arc<LoopbackPublication>>>,
}

impl LoopbackParticipant {
    pub fn new(identity: &str) -> Arc<Self> {
        Arc::new(Self {
            sid: next_sid("PA"),
            identity: identity.to_string(),
            publications: Mutex::new(Vec::new()),
        })
    }

    fn add_publication(&self, publication: Arc<LoopbackPublication>) {
        lock(&self.publications).push(publication);
    }

    fn remove_publication(&self, sid: &str) {
        lock(&self.publications).retain(|p| p.sid() != sid);
    }
}

impl Participant for LoopbackParticipant {
    fn sid(&self) -> &str {
        &self.sid
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn track_publications(&self) -> Vec<Arc<dyn TrackPublication>> {
        lock(&self.publications)
            .iter()
            .map(|p| p.clone() as Arc<dyn TrackPublication>)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

pub struct LoopbackConnection {
    room: Arc<LoopbackRoom>,
    local: Arc<LoopbackParticipant>,
    events: UnboundedSender<RoomEvent>,
    connected: AtomicBool,
}

impl fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("room", &self.room.name)
            .field("local", &self.local.identity)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl LoopbackConnection {
    fn close(&self, reason: Option<String>) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        let _ = self.events.send(RoomEvent::Disconnected { reason });
        true
    }
}

impl RoomConnection for LoopbackConnection {
    fn name(&self) -> &str {
        &self.room.name
    }

    fn local_participant(&self) -> Arc<dyn Participant> {
        self.local.clone()
    }

    fn remote_participants(&self) -> Vec<Arc<dyn Participant>> {
        lock(&self.room.remotes)
            .iter()
            .map(|p| p.clone() as Arc<dyn Participant>)
            .collect()
    }

    fn disconnect(&self) {
        if self.close(None) {
            tracing::debug!(room = %self.room.name, "loopback connection closed by client");
        }
        self.room.forget_connection(self);
    }
}

/// A named room whose remote side is scripted by the caller.
///
/// Changes made while nobody is connected are visible to the next joiner
/// through enumeration but produce no events.
#[derive(Debug)]
pub struct LoopbackRoom {
    name: String,
    remotes: Mutex<Vec<Arc<LoopbackParticipant>>>,
    connection: Mutex<Option<Arc<LoopbackConnection>>>,
}

impl LoopbackRoom {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            remotes: Mutex::new(Vec::new()),
            connection: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.connection).is_some()
    }

    /// Identity of the connected local participant.
    pub fn local_identity(&self) -> Option<String> {
        lock(&self.connection)
            .as_ref()
            .map(|c| c.local.identity.clone())
    }

    /// Tracks the connected local participant published.
    pub fn local_track_sids(&self) -> Vec<String> {
        lock(&self.connection)
            .as_ref()
            .map(|c| {
                c.local
                    .track_publications()
                    .iter()
                    .map(|p| p.sid().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A remote participant enters the room.
    pub fn join(&self, identity: &str) -> Arc<LoopbackParticipant> {
        let participant = LoopbackParticipant::new(identity);
        lock(&self.remotes).push(participant.clone());
        self.emit(RoomEvent::ParticipantConnected(participant.clone()));
        participant
    }

    /// A remote participant leaves without unsubscribing anything first.
    pub fn leave(&self, participant: &Arc<LoopbackParticipant>) {
        lock(&self.remotes).retain(|p| p.sid != participant.sid);
        self.emit(RoomEvent::ParticipantDisconnected(participant.clone()));
    }

    /// Publish a track the local viewer is not subscribed to yet.
    pub fn publish(
        &self,
        participant: &Arc<LoopbackParticipant>,
        kind: TrackKind,
        name: &str,
    ) -> (Arc<LoopbackTrack>, Arc<LoopbackPublication>) {
        let track = LoopbackTrack::new(kind, name);
        let publication = LoopbackPublication::new(track.clone(), false);
        participant.add_publication(publication.clone());
        self.emit(RoomEvent::TrackPublished {
            participant: participant.clone(),
            publication: publication.clone(),
        });
        (track, publication)
    }

    /// Publish a track and immediately subscribe the local viewer to it.
    pub fn publish_subscribed(
        &self,
        participant: &Arc<LoopbackParticipant>,
        kind: TrackKind,
        name: &str,
    ) -> (Arc<LoopbackTrack>, Arc<LoopbackPublication>) {
        let (track, publication) = self.publish(participant, kind, name);
        self.subscribe(participant, &publication);
        (track, publication)
    }

    pub fn subscribe(
        &self,
        participant: &Arc<LoopbackParticipant>,
        publication: &Arc<LoopbackPublication>,
    ) {
        if publication.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(RoomEvent::TrackSubscribed {
            participant: participant.clone(),
            publication: publication.clone(),
            track: publication.track.clone(),
        });
    }

    pub fn unsubscribe(
        &self,
        participant: &Arc<LoopbackParticipant>,
        publication: &Arc<LoopbackPublication>,
    ) {
        if !publication.subscribed.swap(false, Ordering::SeqCst) {
            return;
        }
        self.emit(RoomEvent::TrackUnsubscribed {
            participant: participant.clone(),
            publication: publication.clone(),
            track: publication.track.clone(),
        });
    }

    /// Withdraw a publication, unsubscribing first as the service would.
    pub fn unpublish(
        &self,
        participant: &Arc<LoopbackParticipant>,
        publication: &Arc<LoopbackPublication>,
    ) {
        self.unsubscribe(participant, publication);
        participant.remove_publication(publication.sid());
        self.emit(RoomEvent::TrackUnpublished {
            participant: participant.clone(),
            publication: publication.clone(),
        });
    }

    /// Drop the connected client from the service side.
    pub fn close(&self, reason: &str) {
        if let Some(connection) = lock(&self.connection).take() {
            connection.close(Some(reason.to_string()));
        }
    }

    fn emit(&self, event: RoomEvent) {
        if let Some(connection) = lock(&self.connection).as_ref() {
            if connection.connected.load(Ordering::SeqCst) {
                let _ = connection.events.send(event);
            }
        }
    }

    fn forget_connection(&self, connection: &LoopbackConnection) {
        let mut current = lock(&self.connection);
        if current
            .as_ref()
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), connection))
        {
            *current = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LoopbackService {
    rooms: Mutex<HashMap<String, Arc<LoopbackRoom>>>,
    media_failure: Mutex<Option<String>>,
    connect_failure: Mutex<Option<String>>,
    captured: Mutex<Vec<Arc<LoopbackTrack>>>,
    connect_attempts: AtomicUsize,
    capture_gate: Mutex<Option<Arc<Notify>>>,
    connect_gate: Mutex<Option<Arc<Notify>>>,
}

impl LoopbackService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The room with this name, created on first use.
    pub fn room(&self, name: &str) -> Arc<LoopbackRoom> {
        lock(&self.rooms)
            .entry(name.to_string())
            .or_insert_with(|| LoopbackRoom::new(name))
            .clone()
    }

    /// Make local capture fail, as when the camera permission is denied.
    pub fn deny_media_access(&self, reason: &str) {
        *lock(&self.media_failure) = Some(reason.to_string());
    }

    pub fn allow_media_access(&self) {
        *lock(&self.media_failure) = None;
    }

    /// Make every connect fail, as with a full room or a network error.
    pub fn reject_connections(&self, reason: &str) {
        *lock(&self.connect_failure) = Some(reason.to_string());
    }

    pub fn accept_connections(&self) {
        *lock(&self.connect_failure) = None;
    }

    /// Park capture requests until [`LoopbackService::release_capture`].
    pub fn hold_capture(&self) {
        *lock(&self.capture_gate) = Some(Arc::new(Notify::new()));
    }

    pub fn release_capture(&self) {
        open_gate(&self.capture_gate);
    }

    /// Park connect requests until [`LoopbackService::release_connections`].
    pub fn hold_connections(&self) {
        *lock(&self.connect_gate) = Some(Arc::new(Notify::new()));
    }

    pub fn release_connections(&self) {
        open_gate(&self.connect_gate);
    }

    /// Every local track handed out so far.
    pub fn captured_tracks(&self) -> Vec<Arc<LoopbackTrack>> {
        lock(&self.captured).clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }
}

fn open_gate(gate: &Mutex<Option<Arc<Notify>>>) {
    if let Some(notify) = lock(gate).take() {
        notify.notify_one();
    }
}

async fn pass_gate(gate: &Mutex<Option<Arc<Notify>>>) {
    let notify = lock(gate).clone();
    if let Some(notify) = notify {
        notify.notified().await;
    }
}

#[async_trait]
impl MediaService for LoopbackService {
    async fn create_local_tracks(
        &self,
        options: CaptureOptions,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, CallError> {
        pass_gate(&self.capture_gate).await;
        if let Some(reason) = lock(&self.media_failure).clone() {
            return Err(CallError::MediaAccess(reason));
        }

        let mut tracks = Vec::new();
        if options.audio {
            tracks.push(LoopbackTrack::new(TrackKind::Audio, "microphone"));
        }
        if options.video {
            tracks.push(LoopbackTrack::new(TrackKind::Video, "camera"));
        }
        if tracks.is_empty() {
            return Err(CallError::MediaAccess("no capture device requested".into()));
        }

        lock(&self.captured).extend(tracks.iter().cloned());
        Ok(tracks
            .into_iter()
            .map(|t| t as Arc<dyn MediaTrack>)
            .collect())
    }

    async fn connect(
        &self,
        token: &AccessToken,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn RoomConnection>, RoomEvents), CallError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        pass_gate(&self.connect_gate).await;

        if let Some(reason) = lock(&self.connect_failure).clone() {
            return Err(CallError::Connection(reason));
        }
        if token.room() != options.room_name {
            return Err(CallError::Connection(format!(
                "token does not grant access to room '{}'",
                options.room_name
            )));
        }

        let room = self.room(&options.room_name);
        let local = LoopbackParticipant::new(token.identity());
        for track in options.tracks {
            local.add_publication(LoopbackPublication::new(track, true));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(LoopbackConnection {
            room: room.clone(),
            local,
            events: tx,
            connected: AtomicBool::new(true),
        });

        if let Some(previous) = lock(&room.connection).replace(connection.clone()) {
            previous.close(Some("replaced by a newer connection".into()));
        }

        tracing::debug!(room = %room.name, identity = token.identity(), "loopback connection opened");
        Ok((connection as Arc<dyn RoomConnection>, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{ApiCredentials, DEFAULT_TOKEN_TTL, TokenProvider};

    fn token(room: &str) -> AccessToken {
        TokenProvider::new(
            ApiCredentials {
                account_sid: "AC1".into(),
                api_key_sid: "SK1".into(),
                api_key_secret: "secret".into(),
            },
            DEFAULT_TOKEN_TTL,
        )
        .mint(room)
        .unwrap()
    }

    #[test]
    fn attach_and_detach_track_elements() {
        let track = LoopbackTrack::new(TrackKind::Video, "camera");
        let a = track.attach();
        let b = track.attach();
        assert_eq!(track.attach_count(), 2);
        assert_eq!(track.rendered_elements(), vec![a.clone(), b.clone()]);

        assert_eq!(track.detach(), vec![a, b]);
        assert!(track.detach().is_empty());
    }

    #[test]
    fn publication_exposes_track_only_while_subscribed() {
        let track = LoopbackTrack::new(TrackKind::Audio, "mic");
        let publication = LoopbackPublication::new(track.clone(), false);
        assert!(publication.track().is_none());
        assert_eq!(publication.sid(), track.sid());

        publication.subscribed.store(true, Ordering::SeqCst);
        assert_eq!(publication.track().unwrap().sid(), track.sid());
    }

    #[tokio::test]
    async fn capture_honours_options_and_failures() {
        let service = LoopbackService::new();
        let tracks = service
            .create_local_tracks(CaptureOptions {
                audio: false,
                video: true,
            })
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind(), TrackKind::Video);

        service.deny_media_access("permission denied");
        let err = service
            .create_local_tracks(CaptureOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, CallError::MediaAccess("permission denied".into()));
    }

    #[tokio::test]
    async fn connect_checks_the_room_grant() {
        let service = LoopbackService::new();
        let err = service
            .connect(
                &token("R1"),
                ConnectOptions {
                    room_name: "R2".into(),
                    tracks: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Connection(_)));
    }

    #[tokio::test]
    async fn room_events_reach_the_connection() {
        let service = LoopbackService::new();
        let room = service.room("R1");
        let early = room.join("early");

        let (connection, mut events) = service
            .connect(
                &token("R1"),
                ConnectOptions {
                    room_name: "R1".into(),
                    tracks: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(connection.remote_participants()[0].sid(), early.sid());
        assert!(events.try_recv().is_err());

        let late = room.join("late");
        let (_, publication) = room.publish_subscribed(&late, TrackKind::Video, "camera");
        room.unpublish(&late, &publication);
        room.close("room ended");

        let kinds: Vec<&'static str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| match e {
                RoomEvent::ParticipantConnected(_) => "connected",
                RoomEvent::TrackPublished { .. } => "published",
                RoomEvent::TrackSubscribed { .. } => "subscribed",
                RoomEvent::TrackUnsubscribed { .. } => "unsubscribed",
                RoomEvent::TrackUnpublished { .. } => "unpublished",
                RoomEvent::ParticipantDisconnected(_) => "disconnected",
                RoomEvent::Disconnected { .. } => "room-closed",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "connected",
                "published",
                "subscribed",
                "unsubscribed",
                "unpublished",
                "room-closed"
            ]
        );
        assert!(!room.is_connected());
    }

    #[tokio::test]
    async fn held_capture_waits_for_release() {
        let service = LoopbackService::new();
        service.hold_capture();
        let capture = tokio::spawn({
            let service = service.clone();
            async move { service.create_local_tracks(CaptureOptions::default()).await }
        });
        tokio::task::yield_now().await;
        assert!(service.captured_tracks().is_empty());

        service.release_capture();
        assert_eq!(capture.await.unwrap().unwrap().len(), 2);
        assert_eq!(service.captured_tracks().len(), 2);
    }

    #[tokio::test]
    async fn client_disconnect_emits_once() {
        let service = LoopbackService::new();
        let (connection, mut events) = service
            .connect(
                &token("R1"),
                ConnectOptions {
                    room_name: "R1".into(),
                    tracks: Vec::new(),
                },
            )
            .await
            .unwrap();
        connection.disconnect();
        connection.disconnect();
        assert!(matches!(
            events.try_recv(),
            Ok(RoomEvent::Disconnected { reason: None })
        ));
        assert!(events.try_recv().is_err());
        assert!(!service.room("R1").is_connected());
    }
}
