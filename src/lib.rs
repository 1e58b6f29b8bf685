//! stacknote-voice - mesh WebRTC voice channels
//!
//! This crate provides the real-time voice subsystem of the StackNote client:
//!
//! - WebSocket signaling client with room-scoped envelopes
//! - Full-mesh peer management (one WebRTC connection per remote participant)
//! - ICE candidate reconciliation for out-of-order signaling
//! - Speaking detection from per-participant frequency analysis
//! - Per-participant playback with mute / deafen / local mute
//! - Roster polling, plus a development relay serving both signaling and roster
//!
//! Microphone capture, audio output and audio decoding are supplied by the
//! host through the traits in [`media`] and [`audio`].

pub mod audio;
pub mod config;
pub mod error;
pub mod ice;
pub mod identity;
pub mod media;
pub mod peer;
pub mod roster;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use audio::{AudioContext, AudioOutput, AudioOutputFactory};
pub use config::{AnalyserConfig, VoiceConfig};
pub use error::VoiceError;
pub use ice::{default_stun_servers, IceServerConfig};
pub use identity::{LocalIdentity, ParticipantIdentity};
pub use media::{AudioDecoder, AudioFrame, DecoderFactory, MediaDevices, MediaStream, MediaTrack};
pub use peer::RtcConnector;
pub use roster::{RosterClient, RosterEndpoint, RosterEntry, RosterPoller};
pub use session::{
    ChannelSessionManager, LocalVoiceState, ManagerState, PeerInfo, VoiceClient, VoiceEnvironment, VoiceSnapshot,
};
pub use signaling::{SignalingEnvelope, SignalingLink, SignalingRelay, WsDialer};
