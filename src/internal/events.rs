use std::sync::Arc;

use crate::error::MeshError;
use crate::internal::data_types::{ChannelId, ConnectionState, EdgeId, PeerId, SessionId};
use crate::internal::media::MediaStream;
use crate::internal::presence::RosterEntry;
use crate::internal::transport::{DataChannel, MediaSession};

/// Notifications from the transport (and from tasks the Controller spawns). They are
/// all handled by `Controller::handle_transport_event`, one at a time.
pub enum TransportEvent {
    /// a spawned dial finished. `edge` is the edge that requested it
    DialCompleted {
        peer: PeerId,
        edge: EdgeId,
        result: Result<Arc<dyn MediaSession>, String>,
    },
    /// a remote peer is calling us
    IncomingSession { session: Arc<dyn MediaSession> },
    /// remote media arrived on a session
    Stream {
        peer: PeerId,
        session: SessionId,
        stream: MediaStream,
    },
    SessionClosed { peer: PeerId, session: SessionId },
    SessionError {
        peer: PeerId,
        session: SessionId,
        reason: String,
    },
    /// the connect timer for `edge` fired
    ConnectTimeout { peer: PeerId, edge: EdgeId },
    /// a spawned connect_data finished
    ChannelCreated {
        peer: PeerId,
        result: Result<Arc<dyn DataChannel>, String>,
    },
    /// a remote peer opened a data channel to us
    IncomingChannel {
        peer: PeerId,
        channel: Arc<dyn DataChannel>,
    },
    ChannelOpen { peer: PeerId, channel: ChannelId },
    ChannelClosed { peer: PeerId, channel: ChannelId },
    ChannelError {
        peer: PeerId,
        channel: ChannelId,
        reason: String,
    },
    ChannelMessage {
        peer: PeerId,
        channel: ChannelId,
        payload: String,
    },
    /// the broker connection dropped
    BrokerDisconnected,
}

impl TransportEvent {
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            TransportEvent::DialCompleted { peer, .. }
            | TransportEvent::Stream { peer, .. }
            | TransportEvent::SessionClosed { peer, .. }
            | TransportEvent::SessionError { peer, .. }
            | TransportEvent::ConnectTimeout { peer, .. }
            | TransportEvent::ChannelCreated { peer, .. }
            | TransportEvent::IncomingChannel { peer, .. }
            | TransportEvent::ChannelOpen { peer, .. }
            | TransportEvent::ChannelClosed { peer, .. }
            | TransportEvent::ChannelError { peer, .. }
            | TransportEvent::ChannelMessage { peer, .. } => Some(peer),
            TransportEvent::IncomingSession { session } => Some(session.peer()),
            TransportEvent::BrokerDisconnected => None,
        }
    }
}

/// Emitted to the display layer
#[derive(Debug, Clone)]
pub enum EmittedEvents {
    ConnectionStateChanged {
        peer: PeerId,
        state: ConnectionState,
    },
    /// a remote stream is now playing (or waiting for a user gesture to play)
    StreamAttached { peer: PeerId },
    /// every resource for the peer was released
    PeerDisconnected { peer: PeerId },
    PeerError { peer: PeerId, error: MeshError },
    RosterChanged { roster: Vec<RosterEntry> },
    ChatReceived {
        peer: PeerId,
        sender: String,
        text: String,
        timestamp: u64,
    },
    ReactionReceived {
        peer: PeerId,
        emoji: String,
        timestamp: u64,
    },
    /// more edges than the recommended mesh size are active
    PeerLimitWarning { active: usize },
}
