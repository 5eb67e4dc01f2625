//! Callroom core: a single-room video call view.
//!
//! Mints a room access token, previews local camera and microphone, joins
//! the room and keeps the on-screen surface in sync with the remote
//! participants until the user leaves or the service ends the call.
//!
//! The real-time media service sits behind the [`media::MediaService`]
//! trait. [`loopback`] provides an in-process implementation.

pub mod config;
pub mod errors;
pub mod events;
pub mod loopback;
pub mod media;
pub mod participants;
pub mod room;
pub mod surface;
pub mod token;

pub use config::{CallConfig, CallSettings, ConfigError};
pub use errors::CallError;
pub use events::{
    CallEvent, CallEventListener, CallState, LeaveReason, ParticipantInfo, TrackInfo, TrackKind,
};
pub use media::{CaptureOptions, MediaService};
pub use room::CallView;
pub use surface::{MediaElement, Region};
pub use token::{AccessToken, ApiCredentials, TokenProvider};
