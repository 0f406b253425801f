use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::internal::data_types::{ChannelId, PeerId, SessionId};
use crate::internal::media::{MediaStream, MediaTrack};

/// The Controller's view of the signalling broker and of the connections it sets up.
///
/// Implementations never call back into the Controller. Everything that happens later
/// (remote media, closes, errors, incoming sessions, channel traffic) is posted as a
/// `TransportEvent` on the channel the implementation was built with.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// the identifier the broker allocated for this client, if any yet
    fn local_id(&self) -> Option<PeerId>;
    /// asks the broker for an identifier
    async fn allocate_identifier(&self) -> Result<PeerId>;
    /// starts an outbound media session carrying `local` to `peer`
    async fn dial(&self, peer: &PeerId, local: &MediaStream) -> Result<Arc<dyn MediaSession>>;
    /// starts an outbound data connection to `peer`
    async fn connect_data(&self, peer: &PeerId) -> Result<Arc<dyn DataChannel>>;
    /// re-registers with the broker after it dropped us
    async fn reconnect(&self) -> Result<()>;
}

/// one media session with one remote peer
#[async_trait]
pub trait MediaSession: Send + Sync {
    fn id(&self) -> SessionId;
    fn peer(&self) -> &PeerId;
    /// accepts an incoming session, sending `local` back
    async fn answer(&self, local: &MediaStream) -> Result<()>;
    /// swaps the outbound track of the matching kind
    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// an ordered, reliable message channel with one remote peer
pub trait DataChannel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn is_open(&self) -> bool;
    /// queues `text` for delivery. must not block; ordering per channel is preserved
    fn try_send(&self, text: String) -> Result<()>;
    /// closes the channel in the background
    fn close(&self);
}

/// creates playback sinks for remote streams
pub trait AudioOutput: Send + Sync {
    fn create_sink(&self, peer: &PeerId, stream: &MediaStream) -> Result<Box<dyn AudioSink>>;
}

/// plays back exactly one remote stream
pub trait AudioSink: Send {
    /// may fail, e.g. when the output device refuses to start. the sink stays usable
    fn play(&mut self) -> Result<()>;
    fn set_volume(&mut self, volume: f32);
    fn set_muted(&mut self, muted: bool);
    /// stops playback and frees the device
    fn release(&mut self);
}
