use std::collections::HashMap;

use crate::internal::data_types::{ConnectionState, PeerId};

/// peer id -> connection state. holds no logic; the Controller is the only writer.
/// a peer that is not in the map is Disconnected
#[derive(Default)]
pub struct ConnectionStateStore {
    states: HashMap<PeerId, ConnectionState>,
}

impl ConnectionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &PeerId) -> ConnectionState {
        self.states.get(peer).copied().unwrap_or_default()
    }

    /// returns the previous state
    pub fn set(&mut self, peer: &PeerId, state: ConnectionState) -> ConnectionState {
        self.states
            .insert(peer.clone(), state)
            .unwrap_or_default()
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<ConnectionState> {
        self.states.remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.states.contains_key(peer)
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// sorted by peer id so snapshots are stable for the display layer
    pub fn snapshot(&self) -> Vec<(PeerId, ConnectionState)> {
        let mut v: Vec<_> = self
            .states
            .iter()
            .map(|(peer, state)| (peer.clone(), *state))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }
}
