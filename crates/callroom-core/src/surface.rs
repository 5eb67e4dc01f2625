use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::events::TrackKind;

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// One of the two rendering regions of the call page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    LocalPreview,
    RemoteGrid,
}

/// A renderable media element produced by attaching a track.
///
/// Ids are unique for the lifetime of the process, so an element can be
/// removed without knowing which region it was appended to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaElement {
    pub id: u64,
    pub track_sid: String,
    pub kind: TrackKind,
}

impl MediaElement {
    pub fn new(track_sid: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed),
            track_sid: track_sid.into(),
            kind,
        }
    }
}

/// The local preview and remote grid containers.
#[derive(Debug, Default)]
pub struct MediaSurface {
    local: Vec<MediaElement>,
    remote: Vec<MediaElement>,
}

impl MediaSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element to a region. An element already on the surface is
    /// left where it is.
    pub fn append(&mut self, region: Region, element: MediaElement) -> bool {
        if self.contains(element.id) {
            return false;
        }
        self.region_mut(region).push(element);
        true
    }

    /// Remove an element from whichever region holds it.
    pub fn remove(&mut self, element: &MediaElement) -> bool {
        for region in [Region::LocalPreview, Region::RemoteGrid] {
            let elements = self.region_mut(region);
            if let Some(pos) = elements.iter().position(|e| e.id == element.id) {
                elements.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn elements(&self, region: Region) -> &[MediaElement] {
        match region {
            Region::LocalPreview => &self.local,
            Region::RemoteGrid => &self.remote,
        }
    }

    pub fn has_video(&self, region: Region) -> bool {
        self.elements(region).iter().any(|e| e.kind == TrackKind::Video)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.local.iter().chain(self.remote.iter()).any(|e| e.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    /// Remove and return everything still on the surface.
    pub fn drain(&mut self) -> Vec<MediaElement> {
        let mut drained = std::mem::take(&mut self.local);
        drained.append(&mut self.remote);
        drained
    }

    fn region_mut(&mut self, region: Region) -> &mut Vec<MediaElement> {
        match region {
            Region::LocalPreview => &mut self.local,
            Region::RemoteGrid => &mut self.remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_ids_are_unique() {
        let a = MediaElement::new("t1", TrackKind::Video);
        let b = MediaElement::new("t1", TrackKind::Video);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn append_ignores_duplicates() {
        let mut surface = MediaSurface::new();
        let el = MediaElement::new("t1", TrackKind::Video);
        assert!(surface.append(Region::RemoteGrid, el.clone()));
        assert!(!surface.append(Region::RemoteGrid, el.clone()));
        assert!(!surface.append(Region::LocalPreview, el));
        assert_eq!(surface.elements(Region::RemoteGrid).len(), 1);
        assert!(surface.elements(Region::LocalPreview).is_empty());
    }

    #[test]
    fn remove_finds_element_in_any_region() {
        let mut surface = MediaSurface::new();
        let local = MediaElement::new("l1", TrackKind::Audio);
        let remote = MediaElement::new("r1", TrackKind::Video);
        surface.append(Region::LocalPreview, local.clone());
        surface.append(Region::RemoteGrid, remote.clone());

        assert!(surface.remove(&remote));
        assert!(!surface.remove(&remote));
        assert!(surface.remove(&local));
        assert!(surface.is_empty());
    }

    #[test]
    fn has_video_ignores_audio_elements() {
        let mut surface = MediaSurface::new();
        surface.append(Region::LocalPreview, MediaElement::new("mic", TrackKind::Audio));
        assert!(!surface.has_video(Region::LocalPreview));
        surface.append(Region::LocalPreview, MediaElement::new("cam", TrackKind::Video));
        assert!(surface.has_video(Region::LocalPreview));
        assert!(!surface.has_video(Region::RemoteGrid));
    }

    #[test]
    fn drain_empties_both_regions() {
        let mut surface = MediaSurface::new();
        surface.append(Region::LocalPreview, MediaElement::new("a", TrackKind::Audio));
        surface.append(Region::RemoteGrid, MediaElement::new("b", TrackKind::Video));
        assert_eq!(surface.drain().len(), 2);
        assert!(surface.is_empty());
    }
}
