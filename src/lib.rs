use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

mod config;
mod error;
mod internal;
pub mod media;
mod settings;

#[cfg(feature = "test-server")]
pub mod testing;

use crate::internal::audio::AudioManager;
use crate::internal::data_channels::DataChannelRegistry;
use crate::internal::presence::Roster;
use crate::internal::state_store::ConnectionStateStore;

// public exports
pub use config::MeshConfig;
pub use error::MeshError;
pub use internal::background_thread::{run, spawn, MeshCmd, MeshHandle};
pub use internal::data_channels::Message;
pub use internal::data_types::*;
pub use internal::events::*;
pub use internal::media::*;
pub use internal::presence::{
    generate_room_code, normalize_room_code, LocalProfile, PeerStatus, RosterEntry,
};
pub use internal::transport::*;
pub use internal::webrtc_transport::{PeerSignal, SessionPurpose, SignalEnvelope, WebRtcTransport};
pub use settings::{LocalSettings, RecentRoom};

/// simple-mesh
/// Builds and maintains a full mesh of direct audio/data connections between a handful of
/// peers, hopefully simplifying the process of talking to several people at once.
///
/// Only connection-setup metadata goes through a signalling broker. The `Controller` owns
/// one `MeshEdge` per remote peer, the connection state of every peer, the playback sinks
/// and the data channels, and keeps a roster of presence records gossiped over the data
/// channels.
///
/// The Controller is single-writer: UI calls take `&mut self` and transport notifications
/// arrive as `TransportEvent`s which must be fed to `handle_transport_event` from the same
/// control flow. `spawn` does exactly that on a tokio task and hands back a `MeshHandle`.
pub struct Controller {
    /// client's id
    id: PeerId,
    config: MeshConfig,
    signaling: Arc<dyn SignalingClient>,
    /// at most one edge per peer
    edges: HashMap<PeerId, MeshEdge>,
    states: ConnectionStateStore,
    audio: AudioManager,
    channels: DataChannelRegistry,
    roster: Roster,
    profile: LocalProfile,
    /// answered/dialed with. set by call_peer, cleared by end_call
    local_stream: Option<MediaStream>,
    next_edge: u64,
    /// spawned dials and timers report back through here
    transport_event_chan: mpsc::UnboundedSender<TransportEvent>,
    /// used to emit events
    emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
}

// a lazy version of the builder pattern
pub struct InitArgs {
    pub id: PeerId,
    pub profile: LocalProfile,
    pub config: MeshConfig,
    pub signaling: Arc<dyn SignalingClient>,
    pub audio_output: Arc<dyn AudioOutput>,
    /// the same channel the transport posts its events to
    pub transport_event_chan: mpsc::UnboundedSender<TransportEvent>,
    pub emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
}

/// what upsert_edge does when the peer already has an edge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    /// return the existing edge untouched
    KeepExisting,
    /// tear the existing edge down and start a fresh one
    Replace,
}

/// The following functions are driven by the UI:
/// call_peer
/// connect_data
/// remove_peer
/// end_all_calls / end_call
/// replace_outbound_track
/// send_message / send_reaction / broadcast_presence / set_status
///
/// The following are driven by the transport
/// handle_transport_event (which calls answer_call for incoming sessions)
impl Controller {
    pub fn init(args: InitArgs) -> Result<Self, MeshError> {
        if args.id.is_empty() {
            return Err(MeshError::InvalidPeer(args.id.to_string()));
        }
        // the broker addresses us by the id it allocated
        if let Some(allocated) = args.signaling.local_id() {
            if allocated != args.id {
                log::error!("broker knows us as {}, not {}", allocated, args.id);
                return Err(MeshError::InvalidPeer(args.id.to_string()));
            }
        }
        let mut roster = Roster::new();
        roster.upsert(args.profile.to_entry(&args.id));

        Ok(Self {
            id: args.id,
            config: args.config,
            signaling: args.signaling,
            edges: HashMap::new(),
            states: ConnectionStateStore::new(),
            audio: AudioManager::new(args.audio_output),
            channels: DataChannelRegistry::new(),
            roster,
            profile: args.profile,
            local_stream: None,
            next_edge: 0,
            transport_event_chan: args.transport_event_chan,
            emitted_event_chan: args.emitted_event_chan,
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// starts a call to `peer`. if an edge to `peer` already exists it is returned as is.
    /// the dial itself runs in the background; its outcome comes back as
    /// TransportEvent::DialCompleted
    pub async fn call_peer(
        &mut self,
        peer: PeerId,
        local: MediaStream,
    ) -> Result<EdgeInfo, MeshError> {
        self.validate_peer(&peer)?;
        self.local_stream = Some(local.clone());

        let (edge, created) = self.upsert_edge(&peer, Upsert::KeepExisting).await;
        if !created {
            log::warn!("already connected to peer {}", peer);
            return Ok(edge);
        }
        self.warn_if_crowded();

        let signaling = self.signaling.clone();
        let tx = self.transport_event_chan.clone();
        let edge_id = edge.id;
        let dest = peer.clone();
        tokio::spawn(async move {
            let result = signaling
                .dial(&dest, &local)
                .await
                .map_err(|e| e.to_string());
            if tx
                .send(TransportEvent::DialCompleted {
                    peer: dest.clone(),
                    edge: edge_id,
                    result,
                })
                .is_err()
            {
                log::debug!("controller gone before dial to {} completed", dest);
            }
        });
        self.arm_connect_timeout(&peer, edge_id);

        log::info!("calling peer {}", peer);
        Ok(edge)
    }

    /// accepts an incoming session. a fresh incoming session always wins over an existing
    /// edge to the same peer
    pub async fn answer_call(
        &mut self,
        session: Arc<dyn MediaSession>,
        local: MediaStream,
    ) -> Result<EdgeInfo, MeshError> {
        let peer = session.peer().clone();
        if let Err(e) = self.validate_peer(&peer) {
            log::warn!("rejecting incoming session: {}", e);
            if let Err(e) = session.close().await {
                log::warn!("failed to close rejected session: {}", e);
            }
            return Err(e);
        }

        let (edge, _) = self.upsert_edge(&peer, Upsert::Replace).await;
        if let Some(e) = self.edges.get_mut(&peer) {
            e.session = Some(session.clone());
        }

        if let Err(e) = session.answer(&local).await {
            log::error!("failed to answer call from {}: {}", peer, e);
            let err = MeshError::transport(&peer, e);
            self.fail_edge(&peer, err.clone()).await;
            return Err(err);
        }

        self.warn_if_crowded();
        self.arm_connect_timeout(&peer, edge.id);
        log::info!("answered call from peer {}", peer);
        Ok(edge)
    }

    /// the single place where edges are created. with KeepExisting an existing edge is
    /// returned unchanged; with Replace it is torn down first. a peer left in Failed is
    /// evicted before the new edge is added. returns the edge and whether it is new
    pub async fn upsert_edge(&mut self, peer: &PeerId, policy: Upsert) -> (EdgeInfo, bool) {
        if let Some(edge) = self.edges.get(peer) {
            match policy {
                Upsert::KeepExisting => return (edge.info(self.states.get(peer)), false),
                Upsert::Replace => {
                    log::info!("replacing existing edge with {}", peer);
                    self.teardown(peer).await;
                }
            }
        }
        if self.states.get(peer) == ConnectionState::Failed {
            self.states.remove(peer);
        }

        self.next_edge += 1;
        let edge = MeshEdge::new(EdgeId(self.next_edge), peer.clone());
        let info = edge.info(ConnectionState::Connecting);
        self.edges.insert(peer.clone(), edge);
        self.set_state(peer, ConnectionState::Connecting);
        (info, true)
    }

    /// tears down every resource held for `peer` and forgets its state. removing a peer
    /// that is not known is a no-op
    pub async fn remove_peer(&mut self, peer: &PeerId) {
        if self.teardown(peer).await {
            log::info!("removed peer {}", peer);
        }
    }

    /// tears down every edge. safe to call with none
    pub async fn end_all_calls(&mut self) {
        log::info!("ending all calls");
        let edges: Vec<(PeerId, MeshEdge)> = self.edges.drain().collect();

        let closing = edges.iter().filter_map(|(peer, edge)| {
            edge.session.clone().map(|s| {
                let peer = peer.clone();
                async move {
                    if let Err(e) = s.close().await {
                        log::warn!("error closing call with {}: {}", peer, e);
                    }
                }
            })
        });
        join_all(closing).await;

        for (peer, _) in edges {
            self.audio.remove_stream(&peer);
            self.channels.remove_channel(&peer);
            self.states.remove(&peer);
            self.emit(EmittedEvents::ConnectionStateChanged {
                peer: peer.clone(),
                state: ConnectionState::Disconnected,
            });
            self.emit(EmittedEvents::PeerDisconnected { peer });
        }
        // leftover Failed entries have no edge
        for (peer, _) in self.states.snapshot() {
            self.emit(EmittedEvents::ConnectionStateChanged {
                peer,
                state: ConnectionState::Disconnected,
            });
        }
        self.states.clear();
    }

    /// full session shutdown: every call, sink and channel goes, and the local stream
    /// is stopped
    pub async fn end_call(&mut self) {
        self.end_all_calls().await;
        self.audio.remove_all_streams();
        self.channels.close_all();
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
    }

    /// swaps the outbound track on every edge (e.g. microphone -> screen). a failure on
    /// one edge does not stop the others. returns how many edges took the new track
    pub async fn replace_outbound_track(&mut self, track: Arc<dyn MediaTrack>) -> usize {
        let sessions: Vec<(PeerId, Arc<dyn MediaSession>)> = self
            .edges
            .iter()
            .filter_map(|(peer, edge)| edge.session.clone().map(|s| (peer.clone(), s)))
            .collect();

        let results = join_all(sessions.into_iter().map(|(peer, session)| {
            let track = track.clone();
            async move { (peer, session.replace_track(track).await) }
        }))
        .await;

        results
            .into_iter()
            .filter(|(peer, r)| match r {
                Ok(_) => true,
                Err(e) => {
                    log::error!("failed to replace track for {}: {}", peer, e);
                    false
                }
            })
            .count()
    }

    /// opens a data channel to `peer` in the background. a peer that already has an open
    /// channel is left alone
    pub fn connect_data(&mut self, peer: PeerId) -> Result<(), MeshError> {
        self.validate_peer(&peer)?;
        if self.channels.is_open(&peer) {
            log::info!("data channel to {} already open", peer);
            return Ok(());
        }

        let signaling = self.signaling.clone();
        let tx = self.transport_event_chan.clone();
        tokio::spawn(async move {
            let result = signaling
                .connect_data(&peer)
                .await
                .map_err(|e| e.to_string());
            if tx
                .send(TransportEvent::ChannelCreated {
                    peer: peer.clone(),
                    result,
                })
                .is_err()
            {
                log::debug!("controller gone before data connection to {} completed", peer);
            }
        });
        Ok(())
    }

    pub fn send_to(&self, peer: &PeerId, message: &Message) -> bool {
        self.channels.send_to_peer(peer, message)
    }

    /// sends a chat line to every open channel
    pub fn send_message(&self, text: &str) -> usize {
        let msg = Message::chat(text, self.profile.display_label());
        self.channels.broadcast(&msg)
    }

    pub fn send_reaction(&self, emoji: &str) -> usize {
        self.channels.broadcast(&Message::reaction(emoji))
    }

    /// sends our own roster entry to every open channel
    pub fn broadcast_presence(&mut self) -> usize {
        let entry = self.refresh_own_entry();
        let sent = self.channels.broadcast(&Message::presence(vec![entry]));
        log::info!("presence sent to {} peers", sent);
        sent
    }

    /// changes our status and tells every neighbour with a lightweight status-update
    pub fn set_status(&mut self, status: PeerStatus) -> usize {
        self.profile.status = status;
        self.emit_roster();
        self.channels.broadcast(&Message::status_update(status))
    }

    pub fn set_label(&mut self, label: &str) -> usize {
        self.profile.label = label.trim().to_string();
        self.emit_roster();
        self.broadcast_presence()
    }

    pub fn set_room_code(&mut self, code: Option<&str>) -> Option<String> {
        self.profile.room_code = code.and_then(normalize_room_code);
        self.emit_roster();
        self.broadcast_presence();
        self.profile.room_code.clone()
    }

    /// picks a fresh room code and advertises it
    pub fn create_room(&mut self) -> String {
        let code = generate_room_code();
        log::info!("room created: {}", code);
        self.set_room_code(Some(&code));
        code
    }

    pub fn profile(&self) -> &LocalProfile {
        &self.profile
    }

    pub fn set_volume(&mut self, peer: &PeerId, volume: f32) {
        self.audio.set_volume(peer, volume);
    }

    pub fn volume(&self, peer: &PeerId) -> f32 {
        self.audio.volume(peer)
    }

    pub fn set_muted(&mut self, peer: &PeerId, muted: bool) {
        self.audio.set_muted(peer, muted);
    }

    pub fn is_muted(&self, peer: &PeerId) -> bool {
        self.audio.is_muted(peer)
    }

    pub fn toggle_mute(&mut self, peer: &PeerId) -> bool {
        self.audio.toggle_mute(peer)
    }

    /// retries playback for every sink, e.g. after a user gesture
    pub fn resume_playback(&mut self) -> usize {
        self.audio
            .active_peers()
            .iter()
            .filter(|peer| self.audio.resume(peer))
            .count()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.roster.snapshot()
    }

    pub fn connection_states(&self) -> Vec<(PeerId, ConnectionState)> {
        self.states.snapshot()
    }

    pub fn connection_state(&self, peer: &PeerId) -> ConnectionState {
        self.states.get(peer)
    }

    pub fn active_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.edges.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_connected_to(&self, peer: &PeerId) -> bool {
        self.edges.contains_key(peer) && self.states.get(peer) == ConnectionState::Connected
    }

    pub fn has_sink(&self, peer: &PeerId) -> bool {
        self.audio.has_sink(peer)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.open_count()
    }

    /// applies one transport notification
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DialCompleted { peer, edge, result } => {
                self.on_dial_completed(peer, edge, result).await
            }
            TransportEvent::IncomingSession { session } => self.on_incoming_session(session).await,
            TransportEvent::Stream {
                peer,
                session,
                stream,
            } => self.on_stream(peer, session, stream),
            TransportEvent::SessionClosed { peer, session } => {
                if self.is_current_session(&peer, session) {
                    log::info!("call closed with peer {}", peer);
                    self.remove_peer(&peer).await;
                } else {
                    log::debug!("ignoring close of stale session {} from {}", session, peer);
                }
            }
            TransportEvent::SessionError {
                peer,
                session,
                reason,
            } => {
                if self.is_current_session(&peer, session) {
                    log::error!("call error with peer {}: {}", peer, reason);
                    self.fail_edge(&peer, MeshError::transport(&peer, reason))
                        .await;
                } else {
                    log::debug!("ignoring error from stale session {}: {}", session, reason);
                }
            }
            TransportEvent::ConnectTimeout { peer, edge } => {
                let stalled = self.edges.get(&peer).map(|e| e.id) == Some(edge)
                    && self.states.get(&peer) == ConnectionState::Connecting;
                if stalled {
                    log::warn!("connection to {} timed out", peer);
                    self.fail_edge(&peer, MeshError::transport(&peer, "connection timed out"))
                        .await;
                }
            }
            TransportEvent::ChannelCreated { peer, result } => match result {
                Ok(channel) => self.channels.create_channel(&peer, channel),
                Err(reason) => {
                    log::error!("failed to open data channel to {}: {}", peer, reason);
                    self.emit(EmittedEvents::PeerError {
                        error: MeshError::transport(&peer, reason),
                        peer,
                    });
                }
            },
            TransportEvent::IncomingChannel { peer, channel } => {
                self.channels.handle_incoming_channel(&peer, channel)
            }
            TransportEvent::ChannelOpen { peer, channel } => {
                if self.channels.is_current(&peer, channel) {
                    log::info!("data channel opened with {}", peer);
                    let entry = self.refresh_own_entry();
                    self.channels
                        .send_to_peer(&peer, &Message::presence(vec![entry]));
                }
            }
            TransportEvent::ChannelClosed { peer, channel } => {
                self.channels.remove_if_current(&peer, channel);
            }
            TransportEvent::ChannelError {
                peer,
                channel,
                reason,
            } => {
                log::error!("data channel {} error with {}: {}", channel, peer, reason);
            }
            TransportEvent::ChannelMessage { peer, payload, .. } => {
                if let Some(message) = self.channels.receive(&peer, &payload) {
                    self.dispatch_message(peer, message);
                }
            }
            TransportEvent::BrokerDisconnected => {
                log::warn!("signalling broker disconnected, reconnecting");
                let signaling = self.signaling.clone();
                tokio::spawn(async move {
                    if let Err(e) = signaling.reconnect().await {
                        log::error!("failed to reconnect to broker: {}", e);
                    }
                });
            }
        }
    }

    async fn on_dial_completed(
        &mut self,
        peer: PeerId,
        edge: EdgeId,
        result: Result<Arc<dyn MediaSession>, String>,
    ) {
        let current = self.edges.get(&peer).map(|e| e.id) == Some(edge);
        match (current, result) {
            (true, Ok(session)) => {
                if let Some(e) = self.edges.get_mut(&peer) {
                    e.session = Some(session);
                }
            }
            (true, Err(reason)) => {
                log::error!("failed to call peer {}: {}", peer, reason);
                self.fail_edge(&peer, MeshError::transport(&peer, reason))
                    .await;
            }
            (false, Ok(session)) => {
                log::debug!("dial to {} outlived its edge, closing", peer);
                if let Err(e) = session.close().await {
                    log::warn!("failed to close orphaned session: {}", e);
                }
            }
            (false, Err(_)) => {}
        }
    }

    async fn on_incoming_session(&mut self, session: Arc<dyn MediaSession>) {
        log::info!("incoming call from {}", session.peer());
        let local = self.local_stream.clone();
        match local {
            Some(local) => {
                // failures were already reported as PeerError
                let _ = self.answer_call(session, local).await;
            }
            None => {
                log::warn!("not in a call, rejecting incoming call");
                if let Err(e) = session.close().await {
                    log::warn!("failed to reject call: {}", e);
                }
            }
        }
    }

    fn on_stream(&mut self, peer: PeerId, session: SessionId, stream: MediaStream) {
        if !self.is_current_session(&peer, session) {
            log::debug!("ignoring stream from stale session {}", session);
            stream.stop_all();
            return;
        }
        log::info!("received stream from peer {}", peer);
        self.set_state(&peer, ConnectionState::Connected);
        match self.audio.add_stream(&peer, stream) {
            Ok(_) => self.emit(EmittedEvents::StreamAttached { peer }),
            Err(error) => self.emit(EmittedEvents::PeerError { peer, error }),
        }
    }

    fn dispatch_message(&mut self, peer: PeerId, message: Message) {
        match message {
            Message::Presence { payload, .. } => {
                let own = &self.id;
                let entries = payload.into_iter().filter(|e| &e.id != own);
                if self.roster.merge(entries) {
                    self.emit_roster();
                }
            }
            Message::StatusUpdate { status, .. } => {
                log::info!("status update from {}: {:?}", peer, status);
                // stamped with our clock, a sender running ahead must not pin last_seen
                if peer != self.id && self.roster.update_status(&peer, status, now_millis()) {
                    self.emit_roster();
                }
            }
            Message::Chat {
                text,
                sender,
                timestamp,
            } => self.emit(EmittedEvents::ChatReceived {
                peer,
                sender,
                text,
                timestamp,
            }),
            Message::Reaction { emoji, timestamp } => {
                self.emit(EmittedEvents::ReactionReceived {
                    peer,
                    emoji,
                    timestamp,
                })
            }
        }
    }

    /// releases the edge's resources and leaves the peer in Failed
    async fn fail_edge(&mut self, peer: &PeerId, error: MeshError) {
        self.release_peer_resources(peer).await;
        self.set_state(peer, ConnectionState::Failed);
        self.emit(EmittedEvents::PeerError {
            peer: peer.clone(),
            error,
        });
    }

    /// returns true if there was anything to tear down
    async fn teardown(&mut self, peer: &PeerId) -> bool {
        let had_resources = self.release_peer_resources(peer).await;
        let had_state = self.states.remove(peer).is_some();
        if !(had_resources || had_state) {
            return false;
        }
        self.emit(EmittedEvents::ConnectionStateChanged {
            peer: peer.clone(),
            state: ConnectionState::Disconnected,
        });
        self.emit(EmittedEvents::PeerDisconnected { peer: peer.clone() });
        true
    }

    /// closes the session, the sink and the data channel. the state entry is left alone
    async fn release_peer_resources(&mut self, peer: &PeerId) -> bool {
        let edge = self.edges.remove(peer);
        let had_edge = edge.is_some();
        if let Some(session) = edge.and_then(|e| e.session) {
            if let Err(e) = session.close().await {
                log::warn!("error closing call with {}: {}", peer, e);
            }
        }
        let had_sink = self.audio.remove_stream(peer);
        let had_channel = self.channels.remove_channel(peer);
        had_edge || had_sink || had_channel
    }

    fn arm_connect_timeout(&self, peer: &PeerId, edge: EdgeId) {
        let Some(timeout) = self.config.connect_timeout() else {
            return;
        };
        let tx = self.transport_event_chan.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(TransportEvent::ConnectTimeout { peer, edge });
        });
    }

    fn is_current_session(&self, peer: &PeerId, session: SessionId) -> bool {
        self.edges.get(peer).and_then(|e| e.session_id()) == Some(session)
    }

    fn validate_peer(&self, peer: &PeerId) -> Result<(), MeshError> {
        if peer.is_empty() || *peer == self.id {
            log::warn!("invalid peer id: {:?}", peer.as_str());
            return Err(MeshError::InvalidPeer(peer.to_string()));
        }
        Ok(())
    }

    fn warn_if_crowded(&self) {
        let active = self.edges.len();
        if active > self.config.warning_threshold {
            log::warn!(
                "{} active peers; meshes above {} may perform poorly (limit {})",
                active,
                self.config.warning_threshold,
                self.config.max_peers
            );
            self.emit(EmittedEvents::PeerLimitWarning { active });
        }
    }

    fn refresh_own_entry(&mut self) -> RosterEntry {
        let entry = self.profile.to_entry(&self.id);
        self.roster.upsert(entry.clone());
        entry
    }

    fn set_state(&mut self, peer: &PeerId, state: ConnectionState) {
        self.states.set(peer, state);
        self.emit(EmittedEvents::ConnectionStateChanged {
            peer: peer.clone(),
            state,
        });
    }

    fn emit_roster(&mut self) {
        self.refresh_own_entry();
        self.emit(EmittedEvents::RosterChanged {
            roster: self.roster.snapshot(),
        });
    }

    fn emit(&self, event: EmittedEvents) {
        if self.emitted_event_chan.send(event).is_err() {
            log::debug!("no listener for emitted events");
        }
    }
}
