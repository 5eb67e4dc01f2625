use std::collections::HashMap;
use std::sync::Arc;

use crate::events::ParticipantInfo;
use crate::media::{MediaTrack, Participant};
use crate::surface::MediaElement;

/// A track currently rendered on the surface and the elements it produced.
#[derive(Debug, Clone)]
pub struct AttachedTrack {
    pub track: Arc<dyn MediaTrack>,
    pub elements: Vec<MediaElement>,
}

#[derive(Debug)]
struct ParticipantEntry {
    handle: Arc<dyn Participant>,
    /// track SID -> attachment, kept independently of the SDK's publication
    /// set so cleanup never has to re-derive it.
    attached: HashMap<String, AttachedTrack>,
}

/// Remote participants of the current room and what is attached for each.
///
/// Updated by the room event relay. Read by UI layers through snapshots.
#[derive(Debug, Default)]
pub struct ParticipantManager {
    participants: Vec<ParticipantEntry>,
    local_sid: Option<String>,
}

impl ParticipantManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The local participant is never tracked as remote.
    pub fn set_local_sid(&mut self, sid: String) {
        self.local_sid = Some(sid);
    }

    pub fn local_sid(&self) -> Option<&str> {
        self.local_sid.as_deref()
    }

    /// Register a participant. Returns false if it was already known.
    pub fn add_participant(&mut self, handle: Arc<dyn Participant>) -> bool {
        if self.contains(handle.sid()) {
            return false;
        }
        self.participants.push(ParticipantEntry {
            handle,
            attached: HashMap::new(),
        });
        true
    }

    /// Forget a participant, handing back whatever was still attached for it.
    pub fn remove_participant(&mut self, sid: &str) -> Option<Vec<AttachedTrack>> {
        let pos = self.participants.iter().position(|p| p.handle.sid() == sid)?;
        let entry = self.participants.remove(pos);
        Some(entry.attached.into_values().collect())
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.participants.iter().any(|p| p.handle.sid() == sid)
    }

    pub fn is_attached(&self, participant_sid: &str, track_sid: &str) -> bool {
        self.entry(participant_sid)
            .is_some_and(|p| p.attached.contains_key(track_sid))
    }

    /// Record an attachment. Returns false if the participant is unknown or
    /// the track is already attached.
    pub fn record_attached(&mut self, participant_sid: &str, attached: AttachedTrack) -> bool {
        let Some(entry) = self.entry_mut(participant_sid) else {
            return false;
        };
        let track_sid = attached.track.sid().to_string();
        if entry.attached.contains_key(&track_sid) {
            return false;
        }
        entry.attached.insert(track_sid, attached);
        true
    }

    pub fn take_attached(&mut self, participant_sid: &str, track_sid: &str) -> Option<AttachedTrack> {
        self.entry_mut(participant_sid)?.attached.remove(track_sid)
    }

    pub fn participant(&self, sid: &str) -> Option<ParticipantInfo> {
        self.entry(sid).map(Self::info)
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.participants.iter().map(Self::info).collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Reset and return every attachment still recorded, with the SID of
    /// the participant it belonged to.
    pub fn clear(&mut self) -> Vec<(String, AttachedTrack)> {
        self.local_sid = None;
        self.participants
            .drain(..)
            .flat_map(|p| {
                let sid = p.handle.sid().to_string();
                p.attached
                    .into_values()
                    .map(move |attached| (sid.clone(), attached))
            })
            .collect()
    }

    fn entry(&self, sid: &str) -> Option<&ParticipantEntry> {
        self.participants.iter().find(|p| p.handle.sid() == sid)
    }

    fn entry_mut(&mut self, sid: &str) -> Option<&mut ParticipantEntry> {
        self.participants.iter_mut().find(|p| p.handle.sid() == sid)
    }

    fn info(entry: &ParticipantEntry) -> ParticipantInfo {
        let mut attached_track_sids: Vec<String> = entry.attached.keys().cloned().collect();
        attached_track_sids.sort();
        ParticipantInfo {
            sid: entry.handle.sid().to_string(),
            identity: entry.handle.identity().to_string(),
            attached_track_sids,
        }
    }
}
