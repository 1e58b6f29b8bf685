//! Media connection seam between peer sessions and the WebRTC stack.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::VoiceError;
use crate::media::{MediaStream, MediaTrack};
use crate::signaling::{IceCandidate, SessionDescription};

/// Transport state of one connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Debug)]
pub enum PeerEventKind {
    /// A local candidate was gathered and should be trickled to the remote
    LocalCandidate(IceCandidate),
    /// The remote started sending media
    Track(MediaStream),
    StateChanged(ConnectionState),
}

/// Event raised by a connection, tagged with the session that owns it
#[derive(Clone, Debug)]
pub struct PeerEvent {
    pub remote_id: String,
    /// Session generation; events from replaced sessions are stale
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// One negotiated media connection to one remote participant
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Send a local track. The track is shared, never stopped by the connection.
    async fn add_track(&self, track: &Arc<MediaTrack>) -> Result<(), VoiceError>;

    async fn create_offer(&self) -> Result<SessionDescription, VoiceError>;

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError>;

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), VoiceError>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), VoiceError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), VoiceError>;

    async fn close(&self) -> Result<(), VoiceError>;
}

/// Creates media connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a connection whose events are delivered on `events`
    async fn connect(
        &self,
        remote_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn MediaConnection>, VoiceError>;
}
