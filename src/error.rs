//! Error type for the voice subsystem.
//!
//! Nothing in this crate is fatal to the host application: every variant is
//! logged and degrades the voice feature to "no audio".

use thiserror::Error;

/// Errors that can occur during voice channel operations
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Microphone capture unavailable: {0}")]
    Capture(String),

    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid signaling envelope: {0}")]
    Envelope(String),

    #[error("Audio context is closed")]
    AudioContextClosed,

    #[error("Audio output unavailable: {0}")]
    AudioOutput(String),

    #[error("Failed to decode audio: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Roster request failed: {0}")]
    Roster(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    /// Short label used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::Capture(_) => "capture",
            VoiceError::Transport(_) => "transport",
            VoiceError::Negotiation(_) => "negotiation",
            VoiceError::Envelope(_) => "envelope",
            VoiceError::AudioContextClosed => "audio-context",
            VoiceError::AudioOutput(_) => "audio-output",
            VoiceError::Decode(_) => "decode",
            VoiceError::Config(_) => "config",
            VoiceError::Roster(_) => "roster",
            VoiceError::Json(_) => "json",
        }
    }
}
