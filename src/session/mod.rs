//! Channel membership: the session manager, its driver and published state.

mod client;
mod manager;
mod speaking;
mod state;

pub use client::VoiceClient;
pub use manager::{ChannelSessionManager, ManagerEvent, VoiceEnvironment, EARLY_CANDIDATE_LIMIT, LOCAL_TAP};
pub use speaking::SpeakingLoop;
pub use state::{LocalVoiceState, ManagerState, PeerInfo, VoiceSnapshot};
