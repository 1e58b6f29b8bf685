//! Presentation state published by the channel manager.

use std::collections::BTreeMap;

use serde::Serialize;

/// Lifecycle of one channel membership
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    Idle,
    /// Waiting for microphone capture; stays here if capture is refused
    Acquiring,
    /// Capture acquired, socket opening
    Connecting,
    Joined,
    Leaving,
}

impl ManagerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerState::Idle => "idle",
            ManagerState::Acquiring => "acquiring",
            ManagerState::Connecting => "connecting",
            ManagerState::Joined => "joined",
            ManagerState::Leaving => "leaving",
        }
    }
}

/// What the local participant is doing
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LocalVoiceState {
    /// Microphone capture is held
    pub capture: bool,
    pub mic_muted: bool,
    pub deafened: bool,
    pub speaking: bool,
}

/// Observational state about one remote participant
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub display_name: Option<String>,
    pub is_speaking: bool,
    pub is_locally_muted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VoiceSnapshot {
    pub state: ManagerState,
    pub channel: Option<String>,
    pub session_id: Option<String>,
    pub local: LocalVoiceState,
    pub peers: BTreeMap<String, PeerInfo>,
}

impl Default for VoiceSnapshot {
    fn default() -> Self {
        Self {
            state: ManagerState::Idle,
            channel: None,
            session_id: None,
            local: LocalVoiceState::default(),
            peers: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_lowercase_state() {
        let mut snapshot = VoiceSnapshot::default();
        snapshot.state = ManagerState::Joined;
        snapshot.peers.insert(
            "b2".to_string(),
            PeerInfo {
                display_name: Some("Bob".to_string()),
                ..Default::default()
            },
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "joined");
        assert_eq!(json["peers"]["b2"]["display_name"], "Bob");
        assert_eq!(ManagerState::Acquiring.as_str(), "acquiring");
    }
}
