//! One negotiated connection to one remote participant.
//!
//! Remote ICE candidates are only applied once a remote description is in
//! place. Until then they wait in `pending_candidates`, which is drained
//! exactly once, in receipt order, when the description lands.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::connection::{MediaConnection, PeerConnector, PeerEvent};
use crate::error::VoiceError;
use crate::media::MediaTrack;
use crate::signaling::{IceCandidate, SessionDescription};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    /// Observed the remote's `user_joined` and sent the offer
    Initiator,
    /// Created on receipt of an unsolicited offer
    Responder,
}

/// What happened to a remote candidate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
    /// The session has no connection
    Dropped,
}

pub struct PeerSession {
    remote_id: String,
    generation: u64,
    role: PeerRole,
    /// None once negotiation failed or the session was closed
    connection: Option<Box<dyn MediaConnection>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl PeerSession {
    async fn open(
        connector: &dyn PeerConnector,
        remote_id: &str,
        generation: u64,
        role: PeerRole,
        local_tracks: &[Arc<MediaTrack>],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let mut session = Self {
            remote_id: remote_id.to_string(),
            generation,
            role,
            connection: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        };

        let connection = match connector.connect(remote_id, generation, events).await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("[PeerSession] {}: connection creation failed: {}", remote_id, e);
                return session;
            }
        };

        for track in local_tracks {
            if let Err(e) = connection.add_track(track).await {
                log::warn!("[PeerSession] {}: failed to attach track {}: {}", remote_id, track.id(), e);
                let _ = connection.close().await;
                return session;
            }
        }

        session.connection = Some(connection);
        session
    }

    /// Create a session that offers. Returns the offer to send, if negotiation got that far.
    pub async fn create_as_initiator(
        connector: &dyn PeerConnector,
        remote_id: &str,
        generation: u64,
        local_tracks: &[Arc<MediaTrack>],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> (Self, Option<SessionDescription>) {
        let mut session = Self::open(connector, remote_id, generation, PeerRole::Initiator, local_tracks, events).await;

        let result = match &session.connection {
            Some(connection) => Some(make_offer(connection.as_ref()).await),
            None => None,
        };
        let offer = match result {
            Some(Ok(offer)) => Some(offer),
            Some(Err(e)) => {
                session.abandon("offer", e).await;
                None
            }
            None => None,
        };

        (session, offer)
    }

    /// Create a session answering `offer`. `early` candidates are queued
    /// ahead of the offer so they drain once it is applied.
    pub async fn create_as_responder(
        connector: &dyn PeerConnector,
        remote_id: &str,
        generation: u64,
        local_tracks: &[Arc<MediaTrack>],
        events: mpsc::UnboundedSender<PeerEvent>,
        offer: &SessionDescription,
        early: Vec<IceCandidate>,
    ) -> (Self, Option<SessionDescription>) {
        let mut session = Self::open(connector, remote_id, generation, PeerRole::Responder, local_tracks, events).await;
        session.pending_candidates = early;
        let answer = session.accept_offer(offer).await;
        (session, answer)
    }

    /// Apply a remote offer and produce the answer
    pub async fn accept_offer(&mut self, offer: &SessionDescription) -> Option<SessionDescription> {
        let connection = self.connection.as_ref()?;

        let applied = connection.set_remote_description(offer).await;
        if let Err(e) = applied {
            self.abandon("offer", e).await;
            return None;
        }
        self.remote_description_set = true;
        self.drain_pending().await;

        let connection = self.connection.as_ref()?;
        let result = make_answer(connection.as_ref()).await;
        match result {
            Ok(answer) => Some(answer),
            Err(e) => {
                self.abandon("answer", e).await;
                None
            }
        }
    }

    /// Apply the remote answer to our offer
    pub async fn apply_answer(&mut self, answer: &SessionDescription) -> Result<(), VoiceError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| VoiceError::Negotiation(format!("{} has no connection", self.remote_id)))?;

        let applied = connection.set_remote_description(answer).await;
        if let Err(e) = applied {
            let message = e.to_string();
            self.abandon("answer", e).await;
            return Err(VoiceError::Negotiation(message));
        }
        self.remote_description_set = true;
        self.drain_pending().await;
        Ok(())
    }

    /// Apply a remote candidate now, or hold it until the remote description is set
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        let Some(connection) = &self.connection else {
            log::debug!("[PeerSession] {}: dropping candidate, no connection", self.remote_id);
            return CandidateDisposition::Dropped;
        };

        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return CandidateDisposition::Queued;
        }

        if let Err(e) = connection.add_ice_candidate(&candidate).await {
            log::warn!("[PeerSession] {}: ice_candidate rejected: {}", self.remote_id, e);
        }
        CandidateDisposition::Applied
    }

    /// Apply every queued candidate in receipt order; the queue is emptied.
    pub async fn drain_pending(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_candidates);
        let Some(connection) = &self.connection else {
            return 0;
        };

        if !pending.is_empty() {
            log::debug!("[PeerSession] {}: applying {} queued candidate(s)", self.remote_id, pending.len());
        }
        for candidate in &pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                log::warn!("[PeerSession] {}: queued ice_candidate rejected: {}", self.remote_id, e);
            }
        }
        pending.len()
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        self.pending_candidates.clear();
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                log::warn!("[PeerSession] {}: close failed: {}", self.remote_id, e);
            }
        }
    }

    /// Negotiation failed: leave the session connection-less until it is destroyed
    async fn abandon(&mut self, envelope_type: &str, error: VoiceError) {
        log::warn!("[PeerSession] {}: negotiation failed on '{}': {}", self.remote_id, envelope_type, error);
        self.close().await;
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_count(&self) -> usize {
        self.pending_candidates.len()
    }
}

async fn make_offer(connection: &dyn MediaConnection) -> Result<SessionDescription, VoiceError> {
    let offer = connection.create_offer().await?;
    connection.set_local_description(&offer).await?;
    Ok(offer)
}

async fn make_answer(connection: &dyn MediaConnection) -> Result<SessionDescription, VoiceError> {
    let answer = connection.create_answer().await?;
    connection.set_local_description(&answer).await?;
    Ok(answer)
}
