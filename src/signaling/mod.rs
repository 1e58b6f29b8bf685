//! Signaling: envelope codec, the client link, and a development relay.

pub mod envelope;
pub mod link;
pub mod relay;

pub use envelope::{IceCandidate, SdpKind, SessionDescription, Signal, SignalingEnvelope};
pub use link::{link_url, LinkEvent, LinkEvents, SignalingChannel, SignalingDialer, SignalingLink, WsDialer};
pub use relay::{RelayRoster, SignalingRelay};
