//! Two channel managers negotiating through a loopback relay with real
//! webrtc-rs connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stacknote_voice::audio::{AudioOutput, AudioOutputFactory};
use stacknote_voice::media::{AudioDecoder, AudioFrame, DecoderFactory, MediaDevices, MediaStream};
use stacknote_voice::session::{ChannelSessionManager, ManagerState, VoiceEnvironment};
use stacknote_voice::signaling::SignalingRelay;
use stacknote_voice::{LocalIdentity, RtcConnector, VoiceConfig, VoiceError, WsDialer};

struct Microphone;

#[async_trait]
impl MediaDevices for Microphone {
    async fn acquire_microphone(&self) -> Result<MediaStream, VoiceError> {
        Ok(MediaStream::single_track())
    }
}

struct Silence;

impl AudioOutput for Silence {
    fn render(&self, _frame: &AudioFrame) {}
    fn set_muted(&self, _muted: bool) {}
    fn pause(&self) {}
}

struct Speakers;

impl AudioOutputFactory for Speakers {
    fn create(&self, _remote_id: &str) -> Result<Arc<dyn AudioOutput>, VoiceError> {
        Ok(Arc::new(Silence))
    }
}

struct Zeros;

impl AudioDecoder for Zeros {
    fn decode(&mut self, _payload: &[u8]) -> Result<Vec<f32>, VoiceError> {
        Ok(vec![0.0; 960])
    }
}

fn manager(signaling: &str, user_id: &str, name: &str) -> ChannelSessionManager {
    let decoders: DecoderFactory = Arc::new(|_, _| Ok(Box::new(Zeros) as Box<dyn AudioDecoder>));
    let env = VoiceEnvironment {
        devices: Arc::new(Microphone),
        // Host candidates only
        connector: Arc::new(RtcConnector::new(Vec::new(), decoders).unwrap()),
        dialer: Arc::new(WsDialer::new(signaling)),
        outputs: Arc::new(Speakers),
    };
    let config = VoiceConfig {
        signaling_url: signaling.to_string(),
        ice_servers: Vec::new(),
        ..Default::default()
    };
    ChannelSessionManager::new(config, LocalIdentity::new(user_id, name), env).unwrap()
}

/// Drive both managers until `done` holds or five seconds pass
async fn run_until<F>(a: &mut ChannelSessionManager, b: &mut ChannelSessionManager, done: F) -> bool
where
    F: Fn(&ChannelSessionManager, &ChannelSessionManager) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done(a, b) {
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::select! {
            event = a.next_event() => a.handle_event(event).await,
            event = b.next_event() => b.handle_event(event).await,
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
    true
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_participants_negotiate_through_relay() {
    let relay = SignalingRelay::bind("127.0.0.1:0").await.unwrap();
    let signaling = format!("ws://{}/ws", relay.local_addr());
    let stop = relay.stop_handle();
    tokio::spawn(async move { relay.run().await });

    let mut alice = manager(&signaling, "user-alice", "Alice");
    let mut bob = manager(&signaling, "user-bob", "Bob");

    alice.join("general").await.unwrap();
    let joined = run_until(&mut alice, &mut bob, |a, _| a.state() == ManagerState::Joined).await;
    assert!(joined);

    bob.join("general").await.unwrap();
    let alice_id = alice.identity().unwrap().session_id().to_string();
    let bob_id = bob.identity().unwrap().session_id().to_string();

    let negotiated = run_until(&mut alice, &mut bob, |a, b| {
        a.session(&bob_id).map(|s| s.remote_description_set()).unwrap_or(false)
            && b.session(&alice_id).map(|s| s.remote_description_set()).unwrap_or(false)
            && a.peer(&bob_id).and_then(|p| p.display_name.clone()).as_deref() == Some("Bob")
            && b.peer(&alice_id).and_then(|p| p.display_name.clone()).as_deref() == Some("Alice")
    })
    .await;
    assert!(negotiated);

    // Only the participant that saw the join offered
    assert_eq!(
        alice.session(&bob_id).unwrap().role(),
        stacknote_voice::peer::PeerRole::Initiator
    );
    assert_eq!(
        bob.session(&alice_id).unwrap().role(),
        stacknote_voice::peer::PeerRole::Responder
    );

    bob.leave().await;
    let departed = run_until(&mut alice, &mut bob, |a, _| a.session(&bob_id).is_none()).await;
    assert!(departed);
    assert!(alice.peer(&bob_id).is_none());

    alice.leave().await;
    stop.store(false, std::sync::atomic::Ordering::SeqCst);
}
