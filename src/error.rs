use thiserror::Error;

use crate::PeerId;

/// Failures surfaced by the mesh. Every variant is scoped to a single peer (or to the
/// local device) and never aborts work on other peers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    #[error("invalid peer id: {0:?}")]
    InvalidPeer(String),
    /// microphone/speaker unavailable or permission denied
    #[error("failed to access media device: {0}")]
    DeviceAccess(String),
    #[error("transport error with peer {peer}: {reason}")]
    Transport { peer: PeerId, reason: String },
    #[error("no open data channel for peer {0}")]
    ChannelUnavailable(PeerId),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("mesh task has shut down")]
    Shutdown,
}

impl MeshError {
    pub fn transport(peer: &PeerId, reason: impl ToString) -> Self {
        MeshError::Transport {
            peer: peer.clone(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::MalformedMessage(e.to_string())
    }
}
