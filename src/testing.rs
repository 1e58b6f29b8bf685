//! Test doubles for the host and network seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::audio::{AudioOutput, AudioOutputFactory};
use crate::error::VoiceError;
use crate::media::{AudioFrame, MediaDevices, MediaStream, MediaTrack};
use crate::peer::{ConnectionState, MediaConnection, PeerConnector, PeerEvent, PeerEventKind};
use crate::signaling::{
    IceCandidate, LinkEvent, LinkEvents, SdpKind, SessionDescription, SignalingChannel, SignalingDialer,
    SignalingEnvelope,
};

// ============================================================================
// Peer connections
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnCall {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

type CallLog = Arc<Mutex<Vec<(String, ConnCall)>>>;

/// Records every connection call, keyed by remote id
#[derive(Default)]
pub struct FakeConnector {
    log: CallLog,
    connects: AtomicUsize,
    fail_connect: AtomicBool,
    fail_remote: Arc<AtomicBool>,
    events: Mutex<HashMap<String, (u64, mpsc::UnboundedSender<PeerEvent>)>>,
}

impl FakeConnector {
    pub fn calls(&self, remote_id: &str) -> Vec<ConnCall> {
        self.log
            .lock()
            .iter()
            .filter(|(id, _)| id == remote_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    /// Generation of the latest connection made for `remote_id`
    pub fn generation(&self, remote_id: &str) -> Option<u64> {
        self.events.lock().get(remote_id).map(|(generation, _)| *generation)
    }

    /// Raise an event from the latest connection for `remote_id`
    pub fn emit(&self, remote_id: &str, kind: PeerEventKind) {
        if let Some((generation, tx)) = self.events.lock().get(remote_id) {
            let _ = tx.send(PeerEvent {
                remote_id: remote_id.to_string(),
                generation: *generation,
                kind,
            });
        }
    }

    pub fn emit_track(&self, remote_id: &str, stream: MediaStream) {
        self.emit(remote_id, PeerEventKind::Track(stream));
    }

    pub fn emit_state(&self, remote_id: &str, state: ConnectionState) {
        self.emit(remote_id, PeerEventKind::StateChanged(state));
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        remote_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn MediaConnection>, VoiceError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(VoiceError::Negotiation("connect refused".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .insert(remote_id.to_string(), (generation, events));
        Ok(Box::new(FakeConnection {
            remote_id: remote_id.to_string(),
            log: self.log.clone(),
            fail_remote: self.fail_remote.clone(),
        }))
    }
}

pub struct FakeConnection {
    remote_id: String,
    log: CallLog,
    fail_remote: Arc<AtomicBool>,
}

impl FakeConnection {
    fn record(&self, call: ConnCall) {
        self.log.lock().push((self.remote_id.clone(), call));
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn add_track(&self, track: &Arc<MediaTrack>) -> Result<(), VoiceError> {
        self.record(ConnCall::AddTrack(track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, VoiceError> {
        self.record(ConnCall::CreateOffer);
        Ok(SessionDescription::offer(format!("v=0 offer for {}", self.remote_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError> {
        self.record(ConnCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0 answer for {}", self.remote_id)))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), VoiceError> {
        self.record(ConnCall::SetLocal(description.kind));
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), VoiceError> {
        self.record(ConnCall::SetRemote(description.kind));
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(VoiceError::Negotiation("malformed description".to_string()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), VoiceError> {
        self.record(ConnCall::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.record(ConnCall::Close);
        Ok(())
    }
}

// ============================================================================
// Microphone
// ============================================================================

/// Grants (or refuses) a fresh single-track stream per request
pub struct FakeDevices {
    deny: bool,
    streams: Mutex<Vec<MediaStream>>,
}

impl FakeDevices {
    pub fn granted() -> Self {
        Self { deny: false, streams: Mutex::new(Vec::new()) }
    }

    pub fn denied() -> Self {
        Self { deny: true, streams: Mutex::new(Vec::new()) }
    }

    pub fn acquired(&self) -> Vec<MediaStream> {
        self.streams.lock().clone()
    }

    pub fn last(&self) -> Option<MediaStream> {
        self.streams.lock().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire_microphone(&self) -> Result<MediaStream, VoiceError> {
        if self.deny {
            return Err(VoiceError::Capture("permission denied".to_string()));
        }
        let stream = MediaStream::single_track();
        self.streams.lock().push(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// Signaling
// ============================================================================

/// Test-side view of one dialed link
#[derive(Clone)]
pub struct FakeLinkHandle {
    pub room_id: String,
    pub session_id: String,
    sent: Arc<Mutex<Vec<SignalingEnvelope>>>,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl FakeLinkHandle {
    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<SignalingEnvelope> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn push(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}

struct FakeLink {
    sent: Arc<Mutex<Vec<SignalingEnvelope>>>,
    closed: Arc<AtomicBool>,
}

impl SignalingChannel for FakeLink {
    fn send(&self, envelope: &SignalingEnvelope) {
        if !self.closed.load(Ordering::SeqCst) {
            self.sent.lock().push(envelope.clone());
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeDialer {
    links: Mutex<Vec<FakeLinkHandle>>,
}

impl FakeDialer {
    pub fn links(&self) -> Vec<FakeLinkHandle> {
        self.links.lock().clone()
    }

    pub fn last(&self) -> Option<FakeLinkHandle> {
        self.links.lock().last().cloned()
    }
}

impl SignalingDialer for FakeDialer {
    fn dial(&self, room_id: &str, session_id: &str) -> Result<(Box<dyn SignalingChannel>, LinkEvents), VoiceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = FakeLinkHandle {
            room_id: room_id.to_string(),
            session_id: session_id.to_string(),
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            events: tx,
        };
        let link = FakeLink {
            sent: handle.sent.clone(),
            closed: handle.closed.clone(),
        };
        self.links.lock().push(handle);
        Ok((Box::new(link), rx))
    }
}

// ============================================================================
// Audio output
// ============================================================================

#[derive(Default)]
pub struct FakeOutput {
    frames: AtomicUsize,
    muted: AtomicBool,
    paused: AtomicBool,
}

impl FakeOutput {
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl AudioOutput for FakeOutput {
    fn render(&self, _frame: &AudioFrame) {
        self.frames.fetch_add(1, Ordering::SeqCst);
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeOutputs {
    fail: bool,
    created: AtomicUsize,
    outputs: Mutex<HashMap<String, Arc<FakeOutput>>>,
}

impl FakeOutputs {
    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Most recent output created for `remote_id`
    pub fn get(&self, remote_id: &str) -> Option<Arc<FakeOutput>> {
        self.outputs.lock().get(remote_id).cloned()
    }
}

impl AudioOutputFactory for FakeOutputs {
    fn create(&self, remote_id: &str) -> Result<Arc<dyn AudioOutput>, VoiceError> {
        if self.fail {
            return Err(VoiceError::AudioOutput("no output device".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let output = Arc::new(FakeOutput::default());
        self.outputs.lock().insert(remote_id.to_string(), output.clone());
        Ok(output)
    }
}
