//! webrtc-rs backed media connections.
//!
//! Every connection created by one `RtcConnector` shares a single
//! `TrackLocalStaticSample` per capture track, so the microphone is encoded
//! once and fanned out to the whole mesh.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::connection::{ConnectionState, MediaConnection, PeerConnector, PeerEvent, PeerEventKind};
use crate::error::VoiceError;
use crate::ice::IceServerConfig;
use crate::media::{AudioFrame, DecoderFactory, FrameSink, MediaStream, MediaTrack};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

struct EncodedFrame {
    data: Bytes,
    duration: std::time::Duration,
}

/// Forwards encoded capture frames to the pump task
struct EncodedForwarder {
    tx: mpsc::UnboundedSender<EncodedFrame>,
}

impl FrameSink for EncodedForwarder {
    fn on_frame(&self, frame: &AudioFrame) {
        // Disabled tracks publish silence without a payload: nothing is sent
        if let Some(data) = &frame.encoded {
            let _ = self.tx.send(EncodedFrame {
                data: data.clone(),
                duration: frame.duration,
            });
        }
    }
}

struct SharedTrack {
    source: Arc<MediaTrack>,
    rtc_track: Arc<TrackLocalStaticSample>,
}

/// Capture track id -> RTP track shared by every connection
#[derive(Default)]
struct SharedTracks {
    tracks: Mutex<HashMap<String, SharedTrack>>,
}

impl SharedTracks {
    fn get_or_create(&self, source: &Arc<MediaTrack>) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock();
        tracks.retain(|_, shared| !shared.source.is_stopped());

        if let Some(shared) = tracks.get(source.id()) {
            return shared.rtc_track.clone();
        }

        // 48kHz stereo OPUS, as negotiated by browsers
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            source.id().to_owned(),
            "stacknote-voice".to_owned(),
        ));

        let (tx, mut rx) = mpsc::unbounded_channel::<EncodedFrame>();
        source.connect(Arc::new(EncodedForwarder { tx }));

        // Ends when the capture track stops and drops the forwarder
        let pump_track = rtc_track.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let sample = Sample {
                    data: frame.data,
                    duration: frame.duration,
                    ..Default::default()
                };
                if let Err(e) = pump_track.write_sample(&sample).await {
                    log::debug!("[RtcConnector] write_sample failed: {}", e);
                }
            }
        });

        tracks.insert(
            source.id().to_string(),
            SharedTrack {
                source: source.clone(),
                rtc_track: rtc_track.clone(),
            },
        );
        rtc_track
    }
}

/// Builds peer connections against a shared webrtc-rs API instance
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<IceServerConfig>,
    decoder_factory: DecoderFactory,
    shared: Arc<SharedTracks>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<IceServerConfig>, decoder_factory: DecoderFactory) -> Result<Self, VoiceError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| VoiceError::Negotiation(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| VoiceError::Negotiation(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers,
            decoder_factory,
            shared: Arc::new(SharedTracks::default()),
        })
    }

    fn build_rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|s| s.to_rtc_ice_server())
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        remote_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn MediaConnection>, VoiceError> {
        let peer_connection = self
            .api
            .new_peer_connection(self.build_rtc_config())
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to create peer connection: {}", e)))?;
        let peer_connection = Arc::new(peer_connection);

        // Trickle: forward every gathered candidate straight away
        let ice_events = events.clone();
        let ice_remote = remote_id.to_string();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = ice_events.send(PeerEvent {
                            remote_id: ice_remote.clone(),
                            generation,
                            kind: PeerEventKind::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                        });
                    }
                    Err(e) => log::warn!("[RtcConnector] Failed to serialize candidate for {}: {}", ice_remote, e),
                }
            }
            Box::pin(async {})
        }));

        let state_events = events.clone();
        let state_remote = remote_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = match s {
                RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                RTCPeerConnectionState::Connected => ConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
                _ => ConnectionState::New,
            };
            let _ = state_events.send(PeerEvent {
                remote_id: state_remote.clone(),
                generation,
                kind: PeerEventKind::StateChanged(state),
            });
            Box::pin(async {})
        }));

        let track_events = events;
        let track_remote = remote_id.to_string();
        let decoder_factory = self.decoder_factory.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let codec = track.codec();
                if !codec.capability.mime_type.to_lowercase().contains("opus") {
                    log::debug!("[RtcConnector] Ignoring {} track from {}", codec.capability.mime_type, track_remote);
                    return Box::pin(async {});
                }

                let media_track = Arc::new(MediaTrack::new(track.id()));
                let stream = MediaStream::new(track.stream_id(), vec![media_track.clone()]);
                let _ = track_events.send(PeerEvent {
                    remote_id: track_remote.clone(),
                    generation,
                    kind: PeerEventKind::Track(stream),
                });

                let remote = track_remote.clone();
                let factory = decoder_factory.clone();
                tokio::spawn(async move {
                    read_remote_track(remote, track, media_track, factory).await;
                });
                Box::pin(async {})
            },
        ));

        Ok(Box::new(RtcConnection {
            remote_id: remote_id.to_string(),
            peer_connection,
            shared: self.shared.clone(),
        }))
    }
}

/// Read RTP from a remote track, decode, and publish PCM on `media_track`
async fn read_remote_track(
    remote_id: String,
    track: Arc<TrackRemote>,
    media_track: Arc<MediaTrack>,
    decoder_factory: DecoderFactory,
) {
    let codec = track.codec();
    let sample_rate = codec.capability.clock_rate;
    let channels = codec.capability.channels.max(1);

    let mut decoder = match decoder_factory(sample_rate, channels) {
        Ok(d) => d,
        Err(e) => {
            log::error!("[RtcConnector] No decoder for {}: {}", remote_id, e);
            return;
        }
    };

    loop {
        match track.read_rtp().await {
            Ok((rtp_packet, _attributes)) => {
                if rtp_packet.payload.is_empty() {
                    continue;
                }
                match decoder.decode(&rtp_packet.payload) {
                    Ok(pcm) => {
                        let frame = AudioFrame::pcm(pcm, sample_rate, channels).with_encoded(rtp_packet.payload.clone());
                        media_track.publish(&frame);
                    }
                    Err(e) => log::debug!("[RtcConnector] Decode error from {}: {}", remote_id, e),
                }
            }
            Err(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("eof") || err_str.contains("closed") {
                    break;
                }
                log::warn!("[RtcConnector] RTP read error from {}: {}", remote_id, e);
            }
        }
    }

    media_track.stop();
    log::debug!("[RtcConnector] Track reader for {} finished", remote_id);
}

struct RtcConnection {
    remote_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    shared: Arc<SharedTracks>,
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription, VoiceError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    parsed.map_err(|e| VoiceError::Negotiation(format!("Invalid SDP: {}", e)))
}

#[async_trait]
impl MediaConnection for RtcConnection {
    async fn add_track(&self, track: &Arc<MediaTrack>) -> Result<(), VoiceError> {
        let rtc_track = self.shared.get_or_create(track);
        self.peer_connection
            .add_track(rtc_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to add track: {}", e)))?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, VoiceError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, VoiceError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), VoiceError> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), VoiceError> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), VoiceError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), VoiceError> {
        log::debug!("[RtcConnector] Closing connection to {}", self.remote_id);
        self.peer_connection
            .close()
            .await
            .map_err(|e| VoiceError::Negotiation(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::AudioDecoder;

    struct Passthrough;

    impl AudioDecoder for Passthrough {
        fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, VoiceError> {
            Ok(payload.iter().map(|b| *b as f32 / 255.0).collect())
        }
    }

    fn connector() -> RtcConnector {
        let factory: DecoderFactory = Arc::new(|_, _| Ok(Box::new(Passthrough) as Box<dyn AudioDecoder>));
        // Host candidates only; no STUN lookups from tests
        RtcConnector::new(Vec::new(), factory).unwrap()
    }

    #[tokio::test]
    async fn test_shared_track_reused_across_connections() {
        let connector = connector();
        let mic = Arc::new(MediaTrack::new("mic"));

        let a = connector.shared.get_or_create(&mic);
        let b = connector.shared.get_or_create(&mic);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mic.sink_count(), 1);

        mic.stop();
        let replacement = Arc::new(MediaTrack::new("mic"));
        let c = connector.shared.get_or_create(&replacement);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_connections() {
        let connector = connector();
        let mic = Arc::new(MediaTrack::new("mic"));
        let (tx, _rx) = mpsc::unbounded_channel();

        let a = connector.connect("b", 1, tx.clone()).await.unwrap();
        let b = connector.connect("a", 1, tx).await.unwrap();
        a.add_track(&mic).await.unwrap();
        b.add_track(&mic).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("opus"));
        a.set_local_description(&offer).await.unwrap();

        b.set_remote_description(&offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(&answer).await.unwrap();
        a.set_remote_description(&answer).await.unwrap();

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_sdp_is_negotiation_error() {
        let connector = connector();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = connector.connect("b", 1, tx).await.unwrap();

        let err = conn
            .set_remote_description(&SessionDescription::offer("not sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Negotiation(_)));
        conn.close().await.unwrap();
    }
}
