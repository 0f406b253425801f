use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MeshError;
use crate::internal::data_types::{now_millis, ChannelId, PeerId};
use crate::internal::presence::{PeerStatus, RosterEntry};
use crate::internal::transport::DataChannel;

/// Payloads exchanged over data channels, JSON encoded with a `type` tag.
/// `timestamp` is ms since epoch, set by the sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Presence {
        payload: Vec<RosterEntry>,
        timestamp: u64,
    },
    Chat {
        text: String,
        sender: String,
        timestamp: u64,
    },
    StatusUpdate {
        status: PeerStatus,
        timestamp: u64,
    },
    Reaction {
        emoji: String,
        timestamp: u64,
    },
}

impl Message {
    pub fn presence(payload: Vec<RosterEntry>) -> Self {
        Message::Presence {
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn chat(text: impl Into<String>, sender: impl Into<String>) -> Self {
        Message::Chat {
            text: text.into(),
            sender: sender.into(),
            timestamp: now_millis(),
        }
    }

    pub fn status_update(status: PeerStatus) -> Self {
        Message::StatusUpdate {
            status,
            timestamp: now_millis(),
        }
    }

    pub fn reaction(emoji: impl Into<String>) -> Self {
        Message::Reaction {
            emoji: emoji.into(),
            timestamp: now_millis(),
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Message::Presence { timestamp, .. }
            | Message::Chat { timestamp, .. }
            | Message::StatusUpdate { timestamp, .. }
            | Message::Reaction { timestamp, .. } => *timestamp,
        }
    }

    pub fn encode(&self) -> Result<String, MeshError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self, MeshError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// One data channel per peer, whether we opened it or the remote side did.
///
/// The registry never blocks and never fails loudly: sends report success as a bool and
/// undecodable payloads are dropped.
#[derive(Default)]
pub struct DataChannelRegistry {
    channels: HashMap<PeerId, Arc<dyn DataChannel>>,
}

impl DataChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// registers a channel we opened
    pub fn create_channel(&mut self, peer: &PeerId, channel: Arc<dyn DataChannel>) {
        log::info!("data channel created for peer {}", peer);
        self.register(peer, channel);
    }

    /// registers a channel the remote side opened
    pub fn handle_incoming_channel(&mut self, peer: &PeerId, channel: Arc<dyn DataChannel>) {
        log::info!("data channel received from peer {}", peer);
        self.register(peer, channel);
    }

    fn register(&mut self, peer: &PeerId, channel: Arc<dyn DataChannel>) {
        if let Some(old) = self.channels.insert(peer.clone(), channel) {
            log::info!("replacing data channel {} for peer {}", old.id(), peer);
            old.close();
        }
    }

    pub fn send_to_peer(&self, peer: &PeerId, message: &Message) -> bool {
        match message.encode() {
            Ok(text) => self.send_text(peer, text),
            Err(e) => {
                log::error!("failed to encode message for {}: {}", peer, e);
                false
            }
        }
    }

    fn send_text(&self, peer: &PeerId, text: String) -> bool {
        let channel = match self.channels.get(peer) {
            Some(c) if c.is_open() => c,
            _ => {
                log::warn!("{}", MeshError::ChannelUnavailable(peer.clone()));
                return false;
            }
        };
        match channel.try_send(text) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("failed to send to {}: {}", peer, e);
                false
            }
        }
    }

    /// sends to every open channel. returns the number of successful sends
    pub fn broadcast(&self, message: &Message) -> usize {
        let text = match message.encode() {
            Ok(t) => t,
            Err(e) => {
                log::error!("failed to encode broadcast: {}", e);
                return 0;
            }
        };
        let sent = self
            .channels
            .keys()
            .filter(|peer| self.send_text(peer, text.clone()))
            .count();
        log::debug!("broadcast to {}/{} peers", sent, self.channels.len());
        sent
    }

    /// parses an inbound payload. malformed payloads are logged and dropped
    pub fn receive(&self, peer: &PeerId, payload: &str) -> Option<Message> {
        match Message::decode(payload) {
            Ok(m) => Some(m),
            Err(e) => {
                log::warn!("dropping message from {}: {}", peer, e);
                None
            }
        }
    }

    pub fn is_current(&self, peer: &PeerId, channel: ChannelId) -> bool {
        self.channels
            .get(peer)
            .map(|c| c.id() == channel)
            .unwrap_or(false)
    }

    /// forgets the channel only if it is still the registered one
    pub fn remove_if_current(&mut self, peer: &PeerId, channel: ChannelId) -> bool {
        if self.is_current(peer, channel) {
            self.channels.remove(peer);
            log::info!("data channel closed with {}", peer);
            true
        } else {
            false
        }
    }

    pub fn remove_channel(&mut self, peer: &PeerId) -> bool {
        match self.channels.remove(peer) {
            Some(c) => {
                c.close();
                log::info!("data channel removed for {}", peer);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for (_, c) in self.channels.drain() {
            c.close();
        }
        log::info!("all data channels closed");
    }

    pub fn has_channel(&self, peer: &PeerId) -> bool {
        self.channels.contains_key(peer)
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.channels.get(peer).map(|c| c.is_open()).unwrap_or(false)
    }

    pub fn open_count(&self) -> usize {
        self.channels.values().filter(|c| c.is_open()).count()
    }
}
