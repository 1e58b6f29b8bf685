//! Signaling envelopes exchanged through the relay.
//!
//! On the wire every envelope is one flat JSON object with a `type`
//! discriminator (see the relay for routing rules):
//!
//! ```json
//! {"type":"offer","sender_user_id":"a1","target_user_id":"b2","sdp":{"type":"offer","sdp":"v=0..."}}
//! {"type":"user_joined","user_id":"b2"}
//! ```
//!
//! Relay-originated `user_joined` / `user_left` name the participant in
//! `user_id`; client envelopes carry their sender in `sender_user_id`.

use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

/// Kind of an SDP session description
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP session description (`{"type": "offer", "sdp": "..."}`)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate for signaling
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Envelope payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Announce a display name. `request_reply` asks the receiver to answer
    /// with its own (targeted, non-requesting) identify.
    Identify {
        display_name: String,
        stable_user_id: Option<String>,
        request_reply: bool,
    },
    UserJoined,
    UserLeft,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl Signal {
    /// Wire discriminator
    pub fn type_name(&self) -> &'static str {
        match self {
            Signal::Identify { .. } => "identify",
            Signal::UserJoined => "user_joined",
            Signal::UserLeft => "user_left",
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice_candidate",
        }
    }

    /// Offers, answers and candidates only make sense for one peer
    pub fn is_peer_directed(&self) -> bool {
        matches!(self, Signal::Offer(_) | Signal::Answer(_) | Signal::IceCandidate(_))
    }
}

/// An immutable signaling envelope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct SignalingEnvelope {
    sender: Option<String>,
    target: Option<String>,
    signal: Signal,
}

impl SignalingEnvelope {
    pub fn new(sender: Option<String>, target: Option<String>, signal: Signal) -> Self {
        Self { sender, target, signal }
    }

    /// Broadcast identify announcing `display_name`
    pub fn identify(sender: &str, display_name: &str, stable_user_id: &str) -> Self {
        Self::new(
            Some(sender.to_string()),
            None,
            Signal::Identify {
                display_name: display_name.to_string(),
                stable_user_id: Some(stable_user_id.to_string()),
                request_reply: false,
            },
        )
    }

    /// Identify addressed to one participant
    pub fn identify_to(
        sender: &str,
        target: &str,
        display_name: &str,
        stable_user_id: &str,
        request_reply: bool,
    ) -> Self {
        Self::new(
            Some(sender.to_string()),
            Some(target.to_string()),
            Signal::Identify {
                display_name: display_name.to_string(),
                stable_user_id: Some(stable_user_id.to_string()),
                request_reply,
            },
        )
    }

    pub fn offer(sender: &str, target: &str, description: SessionDescription) -> Self {
        Self::new(Some(sender.to_string()), Some(target.to_string()), Signal::Offer(description))
    }

    pub fn answer(sender: &str, target: &str, description: SessionDescription) -> Self {
        Self::new(Some(sender.to_string()), Some(target.to_string()), Signal::Answer(description))
    }

    pub fn ice_candidate(sender: &str, target: &str, candidate: IceCandidate) -> Self {
        Self::new(
            Some(sender.to_string()),
            Some(target.to_string()),
            Signal::IceCandidate(candidate),
        )
    }

    pub fn user_joined(session_id: &str) -> Self {
        Self::new(Some(session_id.to_string()), None, Signal::UserJoined)
    }

    pub fn user_left(session_id: &str) -> Self {
        Self::new(Some(session_id.to_string()), None, Signal::UserLeft)
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn into_signal(self) -> Signal {
        self.signal
    }

    pub fn type_name(&self) -> &'static str {
        self.signal.type_name()
    }

    /// Serialize to the JSON text frame sent over the link
    pub fn to_json(&self) -> Result<String, VoiceError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame received from the link
    pub fn from_json(text: &str) -> Result<Self, VoiceError> {
        serde_json::from_str(text).map_err(|e| VoiceError::Envelope(e.to_string()))
    }
}

/// Flat wire representation
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stable_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    request_reply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
}

impl TryFrom<WireEnvelope> for SignalingEnvelope {
    type Error = String;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        // Relay-originated notices use `user_id`; everything else `sender_user_id`
        let sender = wire.sender_user_id.or(wire.user_id);

        let signal = match wire.kind.as_str() {
            "identify" => Signal::Identify {
                display_name: wire
                    .username
                    .or_else(|| sender.clone())
                    .ok_or_else(|| "identify without username or sender".to_string())?,
                stable_user_id: wire.stable_user_id,
                request_reply: wire.request_reply,
            },
            "user_joined" => Signal::UserJoined,
            "user_left" => Signal::UserLeft,
            "offer" => {
                let sdp = wire.sdp.ok_or_else(|| "offer without sdp".to_string())?;
                if sdp.kind != SdpKind::Offer {
                    return Err("offer carries a non-offer description".to_string());
                }
                Signal::Offer(sdp)
            }
            "answer" => {
                let sdp = wire.sdp.ok_or_else(|| "answer without sdp".to_string())?;
                if sdp.kind != SdpKind::Answer {
                    return Err("answer carries a non-answer description".to_string());
                }
                Signal::Answer(sdp)
            }
            "ice_candidate" => Signal::IceCandidate(
                wire.candidate
                    .ok_or_else(|| "ice_candidate without candidate".to_string())?,
            ),
            other => return Err(format!("unknown envelope type '{}'", other)),
        };

        Ok(SignalingEnvelope {
            sender,
            target: wire.target_user_id,
            signal,
        })
    }
}

impl From<SignalingEnvelope> for WireEnvelope {
    fn from(envelope: SignalingEnvelope) -> Self {
        let mut wire = WireEnvelope {
            kind: envelope.signal.type_name().to_string(),
            target_user_id: envelope.target,
            ..Default::default()
        };

        match envelope.signal {
            Signal::UserJoined | Signal::UserLeft => wire.user_id = envelope.sender,
            _ => wire.sender_user_id = envelope.sender,
        }

        match envelope.signal {
            Signal::Identify { display_name, stable_user_id, request_reply } => {
                wire.username = Some(display_name);
                wire.stable_user_id = stable_user_id;
                wire.request_reply = request_reply;
            }
            Signal::Offer(sdp) | Signal::Answer(sdp) => wire.sdp = Some(sdp),
            Signal::IceCandidate(candidate) => wire.candidate = Some(candidate),
            Signal::UserJoined | Signal::UserLeft => {}
        }

        wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_serialize() {
        let env = SignalingEnvelope::offer("a1", "b2", SessionDescription::offer("v=0\r\n"));
        let json = env.to_json().unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"sender_user_id\":\"a1\""));
        assert!(json.contains("\"target_user_id\":\"b2\""));
        assert!(json.contains("\"sdp\":{\"type\":\"offer\",\"sdp\":\"v=0\\r\\n\"}"));
        assert!(!json.contains("request_reply"));
    }

    #[test]
    fn test_relay_user_joined_deserialize() {
        let json = r#"{"type":"user_joined","user_id":"b2","msg":"User b2 joined room r"}"#;
        let env = SignalingEnvelope::from_json(json).unwrap();
        assert_eq!(env.sender(), Some("b2"));
        assert_eq!(env.target(), None);
        assert_eq!(env.signal(), &Signal::UserJoined);
    }

    #[test]
    fn test_user_left_round_trips_through_user_id() {
        let json = SignalingEnvelope::user_left("c3").to_json().unwrap();
        assert!(json.contains("\"user_id\":\"c3\""));
        assert!(!json.contains("sender_user_id"));
    }

    #[test]
    fn test_ice_candidate_deserialize() {
        let json = r#"{"type":"ice_candidate","sender_user_id":"a1","target_user_id":"b2",
            "candidate":{"candidate":"candidate:1 1 UDP 2130706431 192.168.1.1 8189 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let env = SignalingEnvelope::from_json(json).unwrap();
        match env.signal() {
            Signal::IceCandidate(c) => {
                assert!(c.candidate.starts_with("candidate:"));
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            other => panic!("Expected IceCandidate, got {:?}", other),
        }
    }

    #[test]
    fn test_identify_reply_flag() {
        let env = SignalingEnvelope::identify_to("a1", "b2", "Alice", "user-1", true);
        let json = env.to_json().unwrap();
        assert!(json.contains("\"request_reply\":true"));
        assert!(json.contains("\"username\":\"Alice\""));

        let parsed = SignalingEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_identify_without_flag_defaults_false() {
        let env = SignalingEnvelope::from_json(
            r#"{"type":"identify","sender_user_id":"a1","username":"Alice"}"#,
        )
        .unwrap();
        assert_eq!(
            env.signal(),
            &Signal::Identify {
                display_name: "Alice".to_string(),
                stable_user_id: None,
                request_reply: false,
            }
        );
    }

    #[test]
    fn test_malformed_envelopes_rejected() {
        assert!(SignalingEnvelope::from_json(r#"{"type":"answer","sender_user_id":"a1"}"#).is_err());
        assert!(SignalingEnvelope::from_json(r#"{"type":"chat","sender_user_id":"a1"}"#).is_err());
        assert!(SignalingEnvelope::from_json(
            r#"{"type":"offer","sender_user_id":"a1","sdp":{"type":"answer","sdp":"v=0"}}"#
        )
        .is_err());
        assert!(SignalingEnvelope::from_json("not json").is_err());
    }

    #[test]
    fn test_peer_directed_classification() {
        assert!(Signal::Answer(SessionDescription::answer("v=0")).is_peer_directed());
        assert!(!Signal::UserJoined.is_peer_directed());
    }
}
