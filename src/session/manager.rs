//! Channel session manager.
//!
//! Owns everything belonging to one channel membership: the signaling link,
//! microphone capture, the audio context and analysis taps, playback sinks,
//! and one `PeerSession` per remote participant. All inputs (commands, link
//! events, peer events, speaking ticks) are applied one at a time by a single
//! owner, normally the `VoiceClient` driver task.
//!
//! ```text
//! Idle -> Acquiring -> Connecting -> Joined -> Leaving -> Idle
//! ```
//!
//! Only the participant that observes `user_joined` offers; the joiner creates
//! its sessions reactively when offers arrive.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::speaking::SpeakingLoop;
use super::state::{LocalVoiceState, ManagerState, PeerInfo, VoiceSnapshot};
use crate::audio::{AudioAnalysisPipeline, AudioContext, AudioOutputFactory, PlaybackSinks};
use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::identity::{LocalIdentity, ParticipantIdentity};
use crate::media::{DecoderFactory, MediaDevices, MediaStream, MediaTrack};
use crate::peer::{ConnectionState, PeerConnector, PeerEvent, PeerEventKind, PeerSession, RtcConnector};
use crate::signaling::{
    IceCandidate, LinkEvent, LinkEvents, SessionDescription, Signal, SignalingChannel, SignalingDialer,
    SignalingEnvelope, WsDialer,
};

/// Analysis key of the local participant
pub const LOCAL_TAP: &str = "local";

/// Candidates held per sender before any session exists for it
pub const EARLY_CANDIDATE_LIMIT: usize = 128;

/// Host collaborators used by the manager
#[derive(Clone)]
pub struct VoiceEnvironment {
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
    pub dialer: Arc<dyn SignalingDialer>,
    pub outputs: Arc<dyn AudioOutputFactory>,
}

impl VoiceEnvironment {
    /// Production wiring: webrtc-rs connections and WebSocket signaling from `config`
    pub fn webrtc(
        config: &VoiceConfig,
        devices: Arc<dyn MediaDevices>,
        outputs: Arc<dyn AudioOutputFactory>,
        decoders: DecoderFactory,
    ) -> Result<Self, VoiceError> {
        config.validate()?;
        let connector = RtcConnector::new(config.ice_servers.clone(), decoders)?;
        Ok(Self {
            devices,
            connector: Arc::new(connector),
            dialer: Arc::new(WsDialer::new(config.signaling_url.clone())),
            outputs,
        })
    }
}

/// One input for the manager, as returned by [`ChannelSessionManager::next_event`]
#[derive(Debug)]
pub enum ManagerEvent {
    Link(LinkEvent),
    Peer(PeerEvent),
    Tick,
}

pub struct ChannelSessionManager {
    config: VoiceConfig,
    local: LocalIdentity,
    env: VoiceEnvironment,

    state: ManagerState,
    channel: Option<String>,
    identity: Option<ParticipantIdentity>,

    capture: Option<MediaStream>,
    mic_muted: bool,
    deafened: bool,
    speaking: bool,

    link: Option<Box<dyn SignalingChannel>>,
    link_events: Option<LinkEvents>,

    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    sessions: HashMap<String, PeerSession>,
    peers: BTreeMap<String, PeerInfo>,
    early_candidates: HashMap<String, Vec<IceCandidate>>,
    next_generation: u64,

    context: Option<AudioContext>,
    analysis: AudioAnalysisPipeline,
    playback: PlaybackSinks,
    speaking_loop: SpeakingLoop,
}

impl ChannelSessionManager {
    /// Build an idle manager. Fails if `config` does not validate.
    pub fn new(config: VoiceConfig, local: LocalIdentity, env: VoiceEnvironment) -> Result<Self, VoiceError> {
        config.validate()?;
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let analysis = AudioAnalysisPipeline::new(config.analyser.clone());
        let playback = PlaybackSinks::new(env.outputs.clone());
        let speaking_loop = SpeakingLoop::new(config.tick_interval());

        Ok(Self {
            config,
            local,
            env,
            state: ManagerState::Idle,
            channel: None,
            identity: None,
            capture: None,
            mic_muted: false,
            deafened: false,
            speaking: false,
            link: None,
            link_events: None,
            peer_events_tx,
            peer_events_rx,
            sessions: HashMap::new(),
            peers: BTreeMap::new(),
            early_candidates: HashMap::new(),
            next_generation: 1,
            context: None,
            analysis,
            playback,
            speaking_loop,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Join `channel_id`, leaving any other channel first.
    ///
    /// Joining the current channel again is a no-op. If the microphone is
    /// refused the manager stays in `Acquiring` without opening a socket.
    pub async fn join(&mut self, channel_id: &str) -> Result<(), VoiceError> {
        if self.state != ManagerState::Idle && self.channel.as_deref() == Some(channel_id) {
            log::debug!("[ChannelSession] Already in '{}' ({})", channel_id, self.state.as_str());
            return Ok(());
        }
        if self.state != ManagerState::Idle {
            self.leave().await;
        }

        let identity = ParticipantIdentity::join(&self.local);
        log::info!(
            "[ChannelSession] Joining '{}' as {} ({})",
            channel_id,
            identity.display_name(),
            identity.session_id()
        );
        self.channel = Some(channel_id.to_string());
        self.identity = Some(identity.clone());
        self.state = ManagerState::Acquiring;

        let capture = match self.env.devices.acquire_microphone().await {
            Ok(stream) => stream,
            Err(e) => {
                let e = match e {
                    VoiceError::Capture(_) => e,
                    other => VoiceError::Capture(other.to_string()),
                };
                log::error!("[ChannelSession] Microphone unavailable for '{}': {}", channel_id, e);
                return Err(e);
            }
        };
        for track in capture.tracks() {
            track.set_enabled(!self.mic_muted);
        }
        self.state = ManagerState::Connecting;

        // Self is analysed before any peer exists
        let context = self.ensure_audio_context();
        if let Err(e) = self.analysis.attach(LOCAL_TAP, &capture, &context) {
            log::warn!("[ChannelSession] Local speaking detection unavailable: {}", e);
        }
        self.capture = Some(capture);
        self.speaking_loop.start();

        match self.env.dialer.dial(channel_id, identity.session_id()) {
            Ok((link, events)) => {
                self.link = Some(link);
                self.link_events = Some(events);
                Ok(())
            }
            Err(e) => {
                log::error!("[ChannelSession] Failed to open signaling for '{}': {}", channel_id, e);
                self.leave().await;
                Err(e)
            }
        }
    }

    /// Tear the membership down. Every step runs; safe to call in any state.
    pub async fn leave(&mut self) {
        if self.state != ManagerState::Idle {
            log::info!(
                "[ChannelSession] Leaving '{}' ({} session(s))",
                self.channel.as_deref().unwrap_or(""),
                self.sessions.len()
            );
        }
        self.state = ManagerState::Leaving;

        if let Some(link) = self.link.take() {
            link.close();
        }
        self.link_events = None;

        if let Some(capture) = self.capture.take() {
            let stopped = capture.stop_all();
            log::debug!("[ChannelSession] Stopped {} capture track(s)", stopped);
        }

        self.speaking_loop.cancel();

        self.analysis.release_all();
        if let Some(context) = self.context.take() {
            context.close();
        }

        let sessions: Vec<PeerSession> = self.sessions.drain().map(|(_, s)| s).collect();
        for mut session in sessions {
            session.close().await;
        }

        self.playback.release_all();

        self.peers.clear();
        self.early_candidates.clear();
        self.identity = None;
        self.channel = None;
        self.speaking = false;
        self.state = ManagerState::Idle;
    }

    fn ensure_audio_context(&mut self) -> AudioContext {
        match &self.context {
            Some(context) if context.is_open() => context.clone(),
            _ => {
                let context = AudioContext::new();
                self.context = Some(context.clone());
                context
            }
        }
    }

    // ========================================================================
    // Event intake
    // ========================================================================

    /// Wait for the next link event, peer event or speaking tick
    pub async fn next_event(&mut self) -> ManagerEvent {
        let link_events = &mut self.link_events;
        let peer_events = &mut self.peer_events_rx;
        let speaking_loop = &self.speaking_loop;

        tokio::select! {
            event = recv_link(link_events) => ManagerEvent::Link(event),
            Some(event) = peer_events.recv() => ManagerEvent::Peer(event),
            _ = speaking_loop.wait() => ManagerEvent::Tick,
        }
    }

    pub async fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Link(event) => self.handle_link_event(event).await,
            ManagerEvent::Peer(event) => self.handle_peer_event(event).await,
            ManagerEvent::Tick => {
                self.tick();
            }
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened => {
                if self.state != ManagerState::Connecting {
                    log::debug!("[ChannelSession] Ignoring link open in state {}", self.state.as_str());
                    return;
                }
                self.state = ManagerState::Joined;
                log::info!("[ChannelSession] Joined '{}'", self.channel.as_deref().unwrap_or(""));

                if let Some(identity) = &self.identity {
                    let announce = SignalingEnvelope::identify(
                        identity.session_id(),
                        identity.display_name(),
                        identity.stable_user_id(),
                    );
                    self.send(announce);
                }
            }
            LinkEvent::Message(envelope) => {
                if self.state != ManagerState::Joined {
                    log::debug!(
                        "[ChannelSession] Dropping '{}' received in state {}",
                        envelope.type_name(),
                        self.state.as_str()
                    );
                    return;
                }
                self.dispatch(envelope).await;
            }
            LinkEvent::Closed(reason) => {
                if !matches!(self.state, ManagerState::Connecting | ManagerState::Joined) {
                    return;
                }
                match reason {
                    Some(reason) => log::error!("[ChannelSession] Signaling closed: {}", reason),
                    None => log::info!("[ChannelSession] Signaling closed"),
                }
                self.leave().await;
            }
        }
    }

    /// Route one inbound envelope
    pub async fn dispatch(&mut self, envelope: SignalingEnvelope) {
        let Some(own_id) = self.identity.as_ref().map(|i| i.session_id().to_string()) else {
            return;
        };
        let kind = envelope.type_name();

        let Some(sender) = envelope.sender().map(str::to_string) else {
            log::warn!("[ChannelSession] Dropping '{}' without sender", kind);
            return;
        };
        if sender == own_id {
            log::debug!("[ChannelSession] Ignoring own '{}'", kind);
            return;
        }
        match envelope.target() {
            Some(target) if target != own_id => {
                log::debug!("[ChannelSession] Dropping '{}' from {} addressed to {}", kind, sender, target);
                return;
            }
            // A broadcast offer or candidate only counts for a peer we already negotiate with
            None if envelope.signal().is_peer_directed() && !self.sessions.contains_key(&sender) => {
                log::warn!("[ChannelSession] Dropping untargeted '{}' from unknown peer {}", kind, sender);
                return;
            }
            _ => {}
        }

        log::debug!("[ChannelSession] '{}' from {}", kind, sender);

        match envelope.into_signal() {
            Signal::Identify { display_name, request_reply, .. } => {
                self.on_identify(&sender, display_name, request_reply);
            }
            Signal::UserJoined => self.on_user_joined(&sender).await,
            Signal::UserLeft => self.remove_peer(&sender).await,
            Signal::Offer(offer) => self.on_offer(&sender, offer).await,
            Signal::Answer(answer) => self.on_answer(&sender, answer).await,
            Signal::IceCandidate(candidate) => self.on_remote_candidate(&sender, candidate).await,
        }
    }

    /// Apply an event raised by one of the peer connections
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let current = self.sessions.get(&event.remote_id).map(|s| s.generation());
        if current != Some(event.generation) {
            log::debug!(
                "[ChannelSession] Ignoring stale event from {} (generation {})",
                event.remote_id,
                event.generation
            );
            return;
        }

        let remote_id = event.remote_id;
        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                if let Some(own_id) = self.own_session_id() {
                    self.send(SignalingEnvelope::ice_candidate(&own_id, &remote_id, candidate));
                }
            }
            PeerEventKind::Track(stream) => self.wire_inbound(&remote_id, stream),
            PeerEventKind::StateChanged(state) => {
                log::info!("[ChannelSession] Connection to {} is {:?}", remote_id, state);
                if state == ConnectionState::Closed {
                    self.destroy_session(&remote_id).await;
                }
            }
        }
    }

    /// Sample every tap once and reschedule. Returns true if any flag changed.
    pub fn tick(&mut self) -> bool {
        if !self.speaking_loop.is_active() {
            return false;
        }

        let threshold = self.config.speaking_threshold;
        let mut changed = false;

        if let Some(level) = self.analysis.sample(LOCAL_TAP) {
            let speaking = level > threshold;
            if speaking != self.speaking {
                self.speaking = speaking;
                changed = true;
            }
        }

        for (remote_id, info) in self.peers.iter_mut() {
            let speaking = self
                .analysis
                .sample(remote_id)
                .map(|level| level > threshold)
                .unwrap_or(false);
            if speaking != info.is_speaking {
                info.is_speaking = speaking;
                changed = true;
            }
        }

        self.speaking_loop.reschedule();
        changed
    }

    // ========================================================================
    // Local controls
    // ========================================================================

    /// Enable or disable capture tracks. Tracks stay live; nothing is renegotiated.
    pub fn set_muted(&mut self, muted: bool) {
        self.mic_muted = muted;
        if let Some(capture) = &self.capture {
            for track in capture.tracks() {
                track.set_enabled(!muted);
            }
        }
        log::info!("[ChannelSession] Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    /// Mute or unmute all playback. Never touches capture.
    pub fn set_deafened(&mut self, deafened: bool) {
        self.deafened = deafened;
        self.playback.set_muted(deafened);
        log::info!("[ChannelSession] {}", if deafened { "Deafened" } else { "Undeafened" });
    }

    /// Mute one remote participant locally. Returns false for unknown participants.
    pub fn set_peer_muted(&mut self, remote_id: &str, muted: bool) -> bool {
        let Some(info) = self.peers.get_mut(remote_id) else {
            return false;
        };
        info.is_locally_muted = muted;
        self.playback.set_locally_muted(remote_id, muted);
        true
    }

    // ========================================================================
    // Envelope handlers
    // ========================================================================

    fn on_identify(&mut self, sender: &str, display_name: String, request_reply: bool) {
        self.peers.entry(sender.to_string()).or_default().display_name = Some(display_name);

        if request_reply {
            if let Some(reply) = self.identify_to(sender, false) {
                self.send(reply);
            }
        }
    }

    async fn on_user_joined(&mut self, remote_id: &str) {
        if self.sessions.contains_key(remote_id) {
            log::debug!("[ChannelSession] Duplicate user_joined for {}", remote_id);
            return;
        }
        log::info!("[ChannelSession] {} joined, offering", remote_id);

        if let Some(hello) = self.identify_to(remote_id, true) {
            self.send(hello);
        }
        self.peers.entry(remote_id.to_string()).or_default();

        let generation = self.take_generation();
        let connector = self.env.connector.clone();
        let tracks = self.local_tracks();
        let (mut session, offer) = PeerSession::create_as_initiator(
            connector.as_ref(),
            remote_id,
            generation,
            &tracks,
            self.peer_events_tx.clone(),
        )
        .await;

        if let Some(early) = self.early_candidates.remove(remote_id) {
            for candidate in early {
                session.add_remote_candidate(candidate).await;
            }
        }
        self.sessions.insert(remote_id.to_string(), session);

        if let (Some(offer), Some(own_id)) = (offer, self.own_session_id()) {
            self.send(SignalingEnvelope::offer(&own_id, remote_id, offer));
        }
    }

    async fn on_offer(&mut self, remote_id: &str, offer: SessionDescription) {
        self.peers.entry(remote_id.to_string()).or_default();

        let answer = if let Some(session) = self.sessions.get_mut(remote_id) {
            session.accept_offer(&offer).await
        } else {
            let generation = self.take_generation();
            let connector = self.env.connector.clone();
            let tracks = self.local_tracks();
            let early = self.early_candidates.remove(remote_id).unwrap_or_default();
            let (session, answer) = PeerSession::create_as_responder(
                connector.as_ref(),
                remote_id,
                generation,
                &tracks,
                self.peer_events_tx.clone(),
                &offer,
                early,
            )
            .await;
            self.sessions.insert(remote_id.to_string(), session);
            answer
        };

        if let (Some(answer), Some(own_id)) = (answer, self.own_session_id()) {
            self.send(SignalingEnvelope::answer(&own_id, remote_id, answer));
        }
    }

    async fn on_answer(&mut self, remote_id: &str, answer: SessionDescription) {
        match self.sessions.get_mut(remote_id) {
            Some(session) => {
                if let Err(e) = session.apply_answer(&answer).await {
                    log::debug!("[ChannelSession] Answer from {} not applied: {}", remote_id, e);
                }
            }
            None => log::warn!("[ChannelSession] Dropping 'answer' from {}: no session", remote_id),
        }
    }

    async fn on_remote_candidate(&mut self, remote_id: &str, candidate: IceCandidate) {
        if let Some(session) = self.sessions.get_mut(remote_id) {
            session.add_remote_candidate(candidate).await;
            return;
        }

        let early = self.early_candidates.entry(remote_id.to_string()).or_default();
        if early.len() >= EARLY_CANDIDATE_LIMIT {
            log::warn!("[ChannelSession] Dropping 'ice_candidate' from {}: early buffer full", remote_id);
            return;
        }
        early.push(candidate);
        log::debug!("[ChannelSession] Holding early candidate from {} ({} held)", remote_id, early.len());
    }

    /// `user_left`: forget the participant entirely
    async fn remove_peer(&mut self, remote_id: &str) {
        self.peers.remove(remote_id);
        self.early_candidates.remove(remote_id);
        if let Some(mut session) = self.sessions.remove(remote_id) {
            session.close().await;
        }
        self.analysis.release(remote_id);
        self.playback.release(remote_id);
        log::info!("[ChannelSession] {} left", remote_id);
    }

    /// Connection-level close: drop the session, keep the participant listed
    async fn destroy_session(&mut self, remote_id: &str) {
        if let Some(mut session) = self.sessions.remove(remote_id) {
            session.close().await;
        }
        self.analysis.release(remote_id);
        self.playback.release(remote_id);
        if let Some(info) = self.peers.get_mut(remote_id) {
            info.is_speaking = false;
        }
    }

    /// Inbound media goes to one analysis tap and one playback sink, separately
    fn wire_inbound(&mut self, remote_id: &str, stream: MediaStream) {
        let context = self.ensure_audio_context();
        if let Err(e) = self.analysis.attach(remote_id, &stream, &context) {
            log::warn!("[ChannelSession] Speaking detection unavailable for {}: {}", remote_id, e);
        }

        match self.playback.bind(remote_id, &stream) {
            Ok(()) => {
                if self.peers.get(remote_id).map(|p| p.is_locally_muted).unwrap_or(false) {
                    self.playback.set_locally_muted(remote_id, true);
                }
            }
            Err(e) => log::warn!("[ChannelSession] Playback unavailable for {}: {}", remote_id, e),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn send(&self, envelope: SignalingEnvelope) {
        match &self.link {
            Some(link) => {
                log::debug!("[ChannelSession] Sending '{}' to {:?}", envelope.type_name(), envelope.target());
                link.send(&envelope);
            }
            None => log::debug!("[ChannelSession] No link for '{}'", envelope.type_name()),
        }
    }

    fn identify_to(&self, target: &str, request_reply: bool) -> Option<SignalingEnvelope> {
        self.identity.as_ref().map(|identity| {
            SignalingEnvelope::identify_to(
                identity.session_id(),
                target,
                identity.display_name(),
                identity.stable_user_id(),
                request_reply,
            )
        })
    }

    fn own_session_id(&self) -> Option<String> {
        self.identity.as_ref().map(|i| i.session_id().to_string())
    }

    fn local_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.capture
            .as_ref()
            .map(|c| c.tracks().to_vec())
            .unwrap_or_default()
    }

    fn take_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn identity(&self) -> Option<&ParticipantIdentity> {
        self.identity.as_ref()
    }

    pub fn session(&self, remote_id: &str) -> Option<&PeerSession> {
        self.sessions.get(remote_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn peer(&self, remote_id: &str) -> Option<&PeerInfo> {
        self.peers.get(remote_id)
    }

    pub fn early_candidate_count(&self, remote_id: &str) -> usize {
        self.early_candidates.get(remote_id).map(Vec::len).unwrap_or(0)
    }

    pub fn analysis(&self) -> &AudioAnalysisPipeline {
        &self.analysis
    }

    pub fn playback(&self) -> &PlaybackSinks {
        &self.playback
    }

    pub fn audio_context(&self) -> Option<&AudioContext> {
        self.context.as_ref()
    }

    pub fn capture(&self) -> Option<&MediaStream> {
        self.capture.as_ref()
    }

    pub fn is_link_open(&self) -> bool {
        self.link.as_ref().map(|l| l.is_open()).unwrap_or(false)
    }

    pub fn local_state(&self) -> LocalVoiceState {
        LocalVoiceState {
            capture: self.capture.is_some(),
            mic_muted: self.mic_muted,
            deafened: self.deafened,
            speaking: self.speaking,
        }
    }

    pub fn snapshot(&self) -> VoiceSnapshot {
        VoiceSnapshot {
            state: self.state,
            channel: self.channel.clone(),
            session_id: self.own_session_id(),
            local: self.local_state(),
            peers: self.peers.clone(),
        }
    }

    /// Apply every peer event already queued
    #[cfg(test)]
    pub(crate) async fn drain_peer_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.peer_events_rx.try_recv() {
            self.handle_peer_event(event).await;
            handled += 1;
        }
        handled
    }
}

async fn recv_link(events: &mut Option<LinkEvents>) -> LinkEvent {
    match events {
        // A dropped sender counts as a close
        Some(rx) => rx.recv().await.unwrap_or(LinkEvent::Closed(None)),
        None => std::future::pending().await,
    }
}
