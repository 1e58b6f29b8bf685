//! Participant identities.
//!
//! A human is identified by a stable user id; each join from a tab or device
//! gets its own ephemeral session id so the same person can sit in a channel
//! twice without collisions. The relay keys sockets by session id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the local user, available synchronously from the host's auth layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub user_id: String,
    pub display_name: String,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Identity of one channel membership. Immutable for the connection's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantIdentity {
    stable_user_id: String,
    display_name: String,
    session_id: String,
}

impl ParticipantIdentity {
    /// Mint a new identity with a fresh ephemeral session id
    pub fn join(local: &LocalIdentity) -> Self {
        Self::with_session_id(local, Uuid::new_v4().to_string())
    }

    /// Build an identity around a known session id
    pub fn with_session_id(local: &LocalIdentity, session_id: impl Into<String>) -> Self {
        Self {
            stable_user_id: local.user_id.clone(),
            display_name: local.display_name.clone(),
            session_id: session_id.into(),
        }
    }

    pub fn stable_user_id(&self) -> &str {
        &self.stable_user_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}
