use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::internal::transport::MediaSession;

/// uniquely identifies peers. allocated by the signalling broker
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// identifies one media session. transport events carry it so that events from a
/// replaced session can be told apart from the current one
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// identifies one data channel
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

/// identifies one mesh edge within a Controller. never reused
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub(crate) u64);

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// one direct connection attempt/session to a single peer
pub struct MeshEdge {
    pub id: EdgeId,
    pub peer: PeerId,
    /// None while the outbound dial is still in flight
    pub session: Option<Arc<dyn MediaSession>>,
}

impl MeshEdge {
    pub fn new(id: EdgeId, peer: PeerId) -> Self {
        Self {
            id,
            peer,
            session: None,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id())
    }

    pub fn info(&self, state: ConnectionState) -> EdgeInfo {
        EdgeInfo {
            id: self.id,
            peer: self.peer.clone(),
            state,
        }
    }
}

/// what callers get back from call_peer/answer_call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeInfo {
    pub id: EdgeId,
    pub peer: PeerId,
    pub state: ConnectionState,
}

/// milliseconds since the unix epoch. used for message and roster timestamps
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
