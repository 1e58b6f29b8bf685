//! Peer connections for the voice mesh.

pub mod connection;
pub mod rtc;
pub mod session;

pub use connection::{ConnectionState, MediaConnection, PeerConnector, PeerEvent, PeerEventKind};
pub use rtc::RtcConnector;
pub use session::{CandidateDisposition, PeerRole, PeerSession};
