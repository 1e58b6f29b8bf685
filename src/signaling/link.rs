//! WebSocket signaling link.
//!
//! One persistent socket per channel membership, addressed as
//! `{signaling_url}/{room_id}/{session_id}`. Opening returns immediately; the
//! connection is established by a background task which reports
//! `LinkEvent::Opened`, then every decoded envelope, then `LinkEvent::Closed`.
//! There is no reconnect: a closed link ends the membership.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::envelope::SignalingEnvelope;
use crate::error::VoiceError;

const LINK_CONNECTING: u8 = 0;
const LINK_OPEN: u8 = 1;
const LINK_CLOSED: u8 = 2;

/// Events produced by a signaling link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The socket reached the open state
    Opened,
    /// A decoded envelope from the relay
    Message(SignalingEnvelope),
    /// The socket closed (locally, remotely, or never opened)
    Closed(Option<String>),
}

/// Receiving half of a link
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// Sending half of a link, as seen by the channel manager
pub trait SignalingChannel: Send + Sync {
    /// Send an envelope. Dropped silently unless the link is open.
    fn send(&self, envelope: &SignalingEnvelope);

    /// Close the socket. Safe to call more than once.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Opens signaling links
pub trait SignalingDialer: Send + Sync {
    fn dial(&self, room_id: &str, session_id: &str)
        -> Result<(Box<dyn SignalingChannel>, LinkEvents), VoiceError>;
}

/// Build the socket address for one room and session
pub fn link_url(base: &str, room_id: &str, session_id: &str) -> Result<Url, VoiceError> {
    let mut url = Url::parse(base).map_err(|e| VoiceError::Transport(format!("Invalid signaling URL: {}", e)))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(VoiceError::Transport(format!("Signaling URL must be ws:// or wss://: {}", base)));
    }

    url.path_segments_mut()
        .map_err(|_| VoiceError::Transport(format!("Signaling URL cannot be a base: {}", base)))?
        .pop_if_empty()
        .push(room_id)
        .push(session_id);

    Ok(url)
}

enum Outbound {
    Frame(Message),
    Close,
}

/// Persistent WebSocket connection to the signaling relay
pub struct SignalingLink {
    url: Url,
    state: Arc<AtomicU8>,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl SignalingLink {
    /// Start connecting. Must be called within a tokio runtime.
    pub fn open(base: &str, room_id: &str, session_id: &str) -> Result<(Self, LinkEvents), VoiceError> {
        let url = link_url(base, room_id, session_id)?;

        let state = Arc::new(AtomicU8::new(LINK_CONNECTING));
        let (events_tx, events_rx) = mpsc::unbounded_channel::<LinkEvent>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Outbound>();

        let task = tokio::spawn(run_link(url.clone(), state.clone(), outbound_rx, events_tx));

        Ok((
            Self {
                url,
                state,
                outbound: outbound_tx,
                task,
            },
            events_rx,
        ))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl SignalingChannel for SignalingLink {
    fn send(&self, envelope: &SignalingEnvelope) {
        if self.state.load(Ordering::SeqCst) != LINK_OPEN {
            log::debug!("[SignalingLink] Dropping '{}' sent while link is not open", envelope.type_name());
            return;
        }

        match envelope.to_json() {
            Ok(json) => {
                let _ = self.outbound.send(Outbound::Frame(Message::Text(json)));
            }
            Err(e) => {
                log::warn!("[SignalingLink] Failed to encode '{}': {}", envelope.type_name(), e);
            }
        }
    }

    fn close(&self) {
        let previous = self.state.swap(LINK_CLOSED, Ordering::SeqCst);
        if previous == LINK_CLOSED {
            return;
        }
        if previous == LINK_CONNECTING {
            // Nothing to flush yet
            self.task.abort();
            return;
        }
        let _ = self.outbound.send(Outbound::Close);
    }

    fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == LINK_OPEN
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        SignalingChannel::close(self);
    }
}

/// Socket task: connect, then pump frames both ways until either side closes
async fn run_link(
    url: Url,
    state: Arc<AtomicU8>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            log::error!("[SignalingLink] Failed to connect to {}: {}", url, e);
            state.store(LINK_CLOSED, Ordering::SeqCst);
            let _ = events.send(LinkEvent::Closed(Some(e.to_string())));
            return;
        }
    };

    // close() may have raced the handshake
    if state
        .compare_exchange(LINK_CONNECTING, LINK_OPEN, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        let (mut ws_sender, _) = ws_stream.split();
        let _ = ws_sender.send(Message::Close(None)).await;
        let _ = events.send(LinkEvent::Closed(None));
        return;
    }

    log::info!("[SignalingLink] Connected to {}", url);
    let _ = events.send(LinkEvent::Opened);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut reason: Option<String> = None;

    loop {
        tokio::select! {
            out = outbound.recv() => {
                match out {
                    Some(Outbound::Frame(msg)) => {
                        if let Err(e) = ws_sender.send(msg).await {
                            reason = Some(e.to_string());
                            break;
                        }
                    }
                    // Explicit close, or every sender dropped
                    Some(Outbound::Close) | None => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match SignalingEnvelope::from_json(&text) {
                            Ok(envelope) => {
                                log::debug!("[SignalingLink] Received '{}' from {:?}",
                                            envelope.type_name(), envelope.sender());
                                let _ = events.send(LinkEvent::Message(envelope));
                            }
                            Err(e) => {
                                log::warn!("[SignalingLink] Skipping malformed envelope: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("[SignalingLink] WebSocket error: {}", e);
                        reason = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.store(LINK_CLOSED, Ordering::SeqCst);
    log::info!("[SignalingLink] Link to {} closed", url);
    let _ = events.send(LinkEvent::Closed(reason));
}

/// Production dialer: opens a `SignalingLink` against a fixed relay URL
#[derive(Clone, Debug)]
pub struct WsDialer {
    base_url: String,
}

impl WsDialer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }
}

impl SignalingDialer for WsDialer {
    fn dial(&self, room_id: &str, session_id: &str)
        -> Result<(Box<dyn SignalingChannel>, LinkEvents), VoiceError>
    {
        let (link, events) = SignalingLink::open(&self.base_url, room_id, session_id)?;
        Ok((Box::new(link), events))
    }
}
