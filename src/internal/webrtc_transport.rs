//! The transport the Controller uses outside of tests: one RTCPeerConnection per
//! session, signalled through `SignalEnvelope`s.
//!
//! Outgoing signals are written to the `outbox` channel and must be delivered to
//! `envelope.dest` by the application (see `testing::send_signal`). Signals addressed to
//! this client are handed to `recv_signal`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MeshConfig;
use crate::internal::data_types::{ChannelId, PeerId, SessionId};
use crate::internal::events::TransportEvent;
use crate::internal::media::{MediaStream, MediaTrack, TrackKind};
use crate::internal::transport::{DataChannel, MediaSession, SignalingClient};
use crate::media::{LocalRtpTrack, RemoteRtpTrack};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPurpose {
    /// audio call
    Media,
    /// message channel only
    Data,
}

/// exchanged with the remote peer through the broker
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PeerSignal {
    Offer {
        session: SessionId,
        purpose: SessionPurpose,
        sdp: RTCSessionDescription,
    },
    Answer {
        session: SessionId,
        sdp: RTCSessionDescription,
    },
    Ice {
        session: SessionId,
        candidate: RTCIceCandidateInit,
    },
    /// the sender closed the session
    Hangup { session: SessionId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub src: PeerId,
    pub dest: PeerId,
    pub signal: PeerSignal,
}

#[derive(Clone)]
struct Signaller {
    src: PeerId,
    outbox: mpsc::UnboundedSender<SignalEnvelope>,
}

impl Signaller {
    fn send(&self, dest: &PeerId, signal: PeerSignal) {
        let envelope = SignalEnvelope {
            src: self.src.clone(),
            dest: dest.clone(),
            signal,
        };
        if let Err(e) = self.outbox.send(envelope) {
            log::error!("failed to queue signal for peer {}: {}", dest, e);
        }
    }
}

#[derive(Clone)]
struct Link {
    peer: PeerId,
    purpose: SessionPurpose,
    pc: Arc<RTCPeerConnection>,
}

type Links = Arc<Mutex<HashMap<SessionId, Link>>>;

pub struct WebRtcTransport {
    id: PeerId,
    api: webrtc::api::API,
    ice_servers: Vec<String>,
    data_label: String,
    links: Links,
    signaller: Signaller,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebRtcTransport {
    pub fn init(
        id: PeerId,
        config: &MeshConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
        outbox: mpsc::UnboundedSender<SignalEnvelope>,
    ) -> Result<Self> {
        Ok(Self {
            api: create_api()?,
            ice_servers: config.ice_servers.clone(),
            data_label: config.data_channel_label.clone(),
            links: Arc::new(Mutex::new(HashMap::new())),
            signaller: Signaller {
                src: id.clone(),
                outbox,
            },
            events,
            id,
        })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    /// applies a signal received from the broker
    pub async fn recv_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        if envelope.dest != self.id {
            bail!("signal for {} delivered to {}", envelope.dest, self.id);
        }
        let peer = envelope.src;
        match envelope.signal {
            PeerSignal::Offer {
                session,
                purpose,
                sdp,
            } => {
                log::debug!("signal: offer ({:?}) from {}", purpose, peer);
                let result = match purpose {
                    SessionPurpose::Media => self.accept_media_offer(&peer, session, sdp).await,
                    SessionPurpose::Data => self.accept_data_offer(&peer, session, sdp).await,
                };
                if result.is_err() {
                    self.drop_link(session).await;
                    self.signaller.send(&peer, PeerSignal::Hangup { session });
                }
                result
            }
            PeerSignal::Answer { session, sdp } => {
                log::debug!("signal: answer from {}", peer);
                let link = self.link(session).await?;
                link.pc.set_remote_description(sdp).await?;
                Ok(())
            }
            PeerSignal::Ice { session, candidate } => {
                let link = self.link(session).await?;
                link.pc.add_ice_candidate(candidate).await?;
                Ok(())
            }
            PeerSignal::Hangup { session } => {
                log::debug!("signal: hangup from {}", peer);
                let link = match self.links.lock().await.remove(&session) {
                    Some(l) => l,
                    None => return Ok(()),
                };
                if link.purpose == SessionPurpose::Media {
                    self.post(TransportEvent::SessionClosed {
                        peer: link.peer.clone(),
                        session,
                    });
                }
                link.pc.close().await?;
                Ok(())
            }
        }
    }

    /// closes every connection. used on shutdown
    pub async fn close_all(&self) {
        let links: Vec<(SessionId, Link)> = self.links.lock().await.drain().collect();
        for (session, link) in links {
            self.signaller.send(&link.peer, PeerSignal::Hangup { session });
            if let Err(e) = link.pc.close().await {
                log::warn!("failed to close connection to {}: {}", link.peer, e);
            }
        }
    }

    async fn accept_media_offer(
        &self,
        peer: &PeerId,
        session: SessionId,
        sdp: RTCSessionDescription,
    ) -> Result<()> {
        let pc = self.new_link(peer, session, SessionPurpose::Media).await?;
        pc.set_remote_description(sdp).await?;
        let session = self.media_session(peer, session, pc);
        self.post(TransportEvent::IncomingSession { session });
        Ok(())
    }

    async fn accept_data_offer(
        &self,
        peer: &PeerId,
        session: SessionId,
        sdp: RTCSessionDescription,
    ) -> Result<()> {
        let pc = self.new_link(peer, session, SessionPurpose::Data).await?;

        let events = self.events.clone();
        let src = peer.clone();
        let weak_pc = Arc::downgrade(&pc);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = events.clone();
            let src = src.clone();
            let weak_pc = weak_pc.clone();
            Box::pin(async move {
                log::debug!("data channel '{}' opened by {}", dc.label(), src);
                let channel = WebRtcChannel::new(dc.clone(), weak_pc);
                let id = channel.id;
                // registered before the handlers so that ChannelOpen can't overtake it
                if let Err(e) = events.send(TransportEvent::IncomingChannel {
                    peer: src.clone(),
                    channel,
                }) {
                    log::error!("failed to send incoming channel for peer {}: {}", &src, e);
                }
                wire_channel(&dc, id, &src, &events);
            })
        }));

        pc.set_remote_description(sdp).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        self.signaller.send(
            peer,
            PeerSignal::Answer {
                session,
                sdp: answer,
            },
        );
        Ok(())
    }

    /// creates a peer connection, wires its callbacks and registers it under `session`
    async fn new_link(
        &self,
        peer: &PeerId,
        session: SessionId,
        purpose: SessionPurpose,
    ) -> Result<Arc<RTCPeerConnection>> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config()).await?);

        // send discovered ice candidates (for self) to remote peer
        let signaller = self.signaller.clone();
        let dest = peer.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let signaller = signaller.clone();
            let dest = dest.clone();
            Box::pin(async move {
                if let Some(candidate) = c {
                    match candidate.to_json() {
                        Ok(candidate) => {
                            signaller.send(&dest, PeerSignal::Ice { session, candidate })
                        }
                        Err(e) => log::error!("failed to serialize ice candidate: {}", e),
                    }
                }
            })
        }));

        let events = self.events.clone();
        let src = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            log::info!("connection state for peer {} has changed {}", &src, s);
            let evt = match (purpose, s) {
                (SessionPurpose::Media, RTCPeerConnectionState::Failed) => {
                    Some(TransportEvent::SessionError {
                        peer: src.clone(),
                        session,
                        reason: "peer connection failed".into(),
                    })
                }
                (SessionPurpose::Media, RTCPeerConnectionState::Closed) => {
                    Some(TransportEvent::SessionClosed {
                        peer: src.clone(),
                        session,
                    })
                }
                _ => None,
            };
            if let Some(evt) = evt {
                if let Err(e) = events.send(evt) {
                    log::error!("failed to send session event for peer {}: {}", &src, e);
                }
            }
            Box::pin(async {})
        }));

        if purpose == SessionPurpose::Media {
            let events = self.events.clone();
            let src = peer.clone();
            pc.on_track(Box::new(
                move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
                    let events = events.clone();
                    let src = src.clone();
                    Box::pin(async move {
                        if let Some(track) = track {
                            forward_remote_track(track, src, session, events).await;
                        }
                    })
                },
            ));
        }

        let replaced = self.links.lock().await.insert(
            session,
            Link {
                peer: peer.clone(),
                purpose,
                pc: pc.clone(),
            },
        );
        if let Some(old) = replaced {
            log::warn!("overwriting connection for session {}", session);
            let _ = old.pc.close().await;
        }
        Ok(pc)
    }

    async fn link(&self, session: SessionId) -> Result<Link> {
        self.links
            .lock()
            .await
            .get(&session)
            .cloned()
            .ok_or_else(|| anyhow!("session {} not found", session))
    }

    async fn drop_link(&self, session: SessionId) {
        let link = self.links.lock().await.remove(&session);
        if let Some(link) = link {
            let _ = link.pc.close().await;
        }
    }

    fn media_session(
        &self,
        peer: &PeerId,
        session: SessionId,
        pc: Arc<RTCPeerConnection>,
    ) -> Arc<dyn MediaSession> {
        Arc::new(WebRtcSession {
            id: session,
            peer: peer.clone(),
            pc,
            signaller: self.signaller.clone(),
            links: self.links.clone(),
        })
    }

    async fn start_media(
        &self,
        peer: &PeerId,
        session: SessionId,
        local: &MediaStream,
    ) -> Result<Arc<dyn MediaSession>> {
        let pc = self.new_link(peer, session, SessionPurpose::Media).await?;
        add_local_tracks(&pc, local).await?;
        let offer = pc.create_offer(None).await?;
        // Sets the LocalDescription, and starts our UDP listeners
        pc.set_local_description(offer.clone()).await?;
        self.signaller.send(
            peer,
            PeerSignal::Offer {
                session,
                purpose: SessionPurpose::Media,
                sdp: offer,
            },
        );
        Ok(self.media_session(peer, session, pc))
    }

    async fn start_data(&self, peer: &PeerId, session: SessionId) -> Result<Arc<dyn DataChannel>> {
        let pc = self.new_link(peer, session, SessionPurpose::Data).await?;
        let dc = pc
            .create_data_channel(
                &self.data_label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        let channel = WebRtcChannel::new(dc.clone(), Arc::downgrade(&pc));
        wire_channel(&dc, channel.id, peer, &self.events);

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        self.signaller.send(
            peer,
            PeerSignal::Offer {
                session,
                purpose: SessionPurpose::Data,
                sdp: offer,
            },
        );
        Ok(channel)
    }

    fn post(&self, evt: TransportEvent) {
        if self.events.send(evt).is_err() {
            log::debug!("no receiver for transport events");
        }
    }
}

#[async_trait]
impl SignalingClient for WebRtcTransport {
    fn local_id(&self) -> Option<PeerId> {
        Some(self.id.clone())
    }

    // peers are addressed by the identifier they were configured with
    async fn allocate_identifier(&self) -> Result<PeerId> {
        Ok(self.id.clone())
    }

    async fn dial(&self, peer: &PeerId, local: &MediaStream) -> Result<Arc<dyn MediaSession>> {
        let session = SessionId::new();
        match self.start_media(peer, session, local).await {
            Ok(s) => Ok(s),
            Err(e) => {
                self.drop_link(session).await;
                Err(e)
            }
        }
    }

    async fn connect_data(&self, peer: &PeerId) -> Result<Arc<dyn DataChannel>> {
        let session = SessionId::new();
        match self.start_data(peer, session).await {
            Ok(c) => Ok(c),
            Err(e) => {
                self.drop_link(session).await;
                Err(e)
            }
        }
    }

    async fn reconnect(&self) -> Result<()> {
        // signals are posted per request, there is no registration to restore
        log::info!("signalling for {} needs no reconnect", self.id);
        Ok(())
    }
}

/// wraps a remote track in a one-track stream and hands it to the Controller
async fn forward_remote_track(
    track: Arc<TrackRemote>,
    peer: PeerId,
    session: SessionId,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let remote = RemoteRtpTrack::from_remote(track).await;
    if remote.kind() != TrackKind::Audio {
        log::info!("ignoring {} track from {}", remote.mime_type(), peer);
        return;
    }
    let stream_id = format!("{}-{}", peer, remote.id());
    let tracks: Vec<Arc<dyn MediaTrack>> = vec![remote as Arc<dyn MediaTrack>];
    if let Err(e) = events.send(TransportEvent::Stream {
        peer: peer.clone(),
        session,
        stream: MediaStream::new(stream_id, tracks),
    }) {
        log::error!("failed to send track added event for peer {}: {}", &peer, e);
    }
}

async fn add_local_tracks(pc: &Arc<RTCPeerConnection>, local: &MediaStream) -> Result<()> {
    for track in local.tracks() {
        let rtp: Arc<dyn TrackLocal + Send + Sync> =
            match track.as_any().downcast_ref::<LocalRtpTrack>() {
                Some(t) => t.rtp_track(),
                None => {
                    log::warn!("skipping track {}: not an rtp track", track.id());
                    continue;
                }
            };
        let sender = pc.add_track(rtp).await?;
        // RTCP has to be read for interceptors (NACK etc) to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });
    }
    Ok(())
}

/// forwards the data channel callbacks as events tagged with `id`
fn wire_channel(
    dc: &RTCDataChannel,
    id: ChannelId,
    peer: &PeerId,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let tx = events.clone();
    let src = peer.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelOpen {
                peer: src,
                channel: id,
            });
        })
    }));

    let tx = events.clone();
    let src = peer.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        let src = src.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelClosed {
                peer: src,
                channel: id,
            });
        })
    }));

    let tx = events.clone();
    let src = peer.clone();
    dc.on_error(Box::new(move |e: webrtc::Error| {
        let tx = tx.clone();
        let src = src.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelError {
                peer: src,
                channel: id,
                reason: e.to_string(),
            });
        })
    }));

    let tx = events.clone();
    let src = peer.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        let src = src.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(payload) => {
                    let _ = tx.send(TransportEvent::ChannelMessage {
                        peer: src,
                        channel: id,
                        payload,
                    });
                }
                Err(_) => log::warn!("dropping binary message from {}", src),
            }
        })
    }));
}

enum ChannelCmd {
    Send(String),
    Close,
}

/// Writes go through a single task per channel so they leave in the order they were
/// queued. Dropping the last handle closes the channel and its connection.
pub struct WebRtcChannel {
    id: ChannelId,
    dc: Arc<RTCDataChannel>,
    writer: mpsc::UnboundedSender<ChannelCmd>,
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>, pc: Weak<RTCPeerConnection>) -> Arc<Self> {
        let (writer, mut rx) = mpsc::unbounded_channel::<ChannelCmd>();
        let writer_dc = dc.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    ChannelCmd::Send(text) => {
                        if let Err(e) = writer_dc.send_text(text).await {
                            log::warn!("failed to write to data channel: {}", e);
                        }
                    }
                    ChannelCmd::Close => break,
                }
            }
            if let Err(e) = writer_dc.close().await {
                log::warn!("failed to close data channel: {}", e);
            }
            if let Some(pc) = pc.upgrade() {
                let _ = pc.close().await;
            }
        });
        Arc::new(Self {
            id: ChannelId::new(),
            dc,
            writer,
        })
    }
}

impl DataChannel for WebRtcChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn try_send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            bail!("data channel not open: {}", self.dc.ready_state());
        }
        self.writer
            .send(ChannelCmd::Send(text))
            .map_err(|_| anyhow!("data channel writer stopped"))
    }

    fn close(&self) {
        let _ = self.writer.send(ChannelCmd::Close);
    }
}

pub struct WebRtcSession {
    id: SessionId,
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
    signaller: Signaller,
    links: Links,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn peer(&self) -> &PeerId {
        &self.peer
    }

    async fn answer(&self, local: &MediaStream) -> Result<()> {
        add_local_tracks(&self.pc, local).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        self.signaller.send(
            &self.peer,
            PeerSignal::Answer {
                session: self.id,
                sdp: answer,
            },
        );
        Ok(())
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        let local = track
            .as_any()
            .downcast_ref::<LocalRtpTrack>()
            .ok_or_else(|| anyhow!("track {} is not an rtp track", track.id()))?;
        let want = match local.kind() {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        let rtp: Arc<dyn TrackLocal + Send + Sync> = local.rtp_track();

        let senders = self.pc.get_senders().await;
        for sender in &senders {
            if let Some(current) = sender.track().await {
                if current.kind() == want {
                    sender.replace_track(Some(rtp)).await?;
                    return Ok(());
                }
            }
        }
        match senders.first() {
            Some(sender) => {
                sender.replace_track(Some(rtp)).await?;
                Ok(())
            }
            None => bail!("no outbound sender for session {}", self.id),
        }
    }

    async fn close(&self) -> Result<()> {
        self.links.lock().await.remove(&self.id);
        self.signaller
            .send(&self.peer, PeerSignal::Hangup { session: self.id });
        self.pc.close().await?;
        Ok(())
    }
}

// todo: add support for more codecs. perhaps make it configurable
fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;

    // NACKs, RTCP reports and the other default interceptors
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(
        id: &str,
    ) -> (
        WebRtcTransport,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedReceiver<SignalEnvelope>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let config = MeshConfig {
            ice_servers: vec![],
            ..Default::default()
        };
        let t = WebRtcTransport::init(id.into(), &config, events_tx, outbox_tx).unwrap();
        (t, events_rx, outbox_rx)
    }

    #[test]
    fn envelope_wire_format() {
        let session = SessionId::new();
        let env = SignalEnvelope {
            src: "a".into(),
            dest: "b".into(),
            signal: PeerSignal::Hangup { session },
        };
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["src"], "a");
        assert_eq!(json["signal"]["kind"], "hangup");
        assert_eq!(json["signal"]["session"], session.to_string());

        let offer = r#"{"src":"a","dest":"b","signal":{"kind":"offer","session":"6a1f0b52-4b0e-4bd2-8c0e-2f3d9a7f1c11","purpose":"data","sdp":{"type":"offer","sdp":"v=0"}}}"#;
        let env: SignalEnvelope = serde_json::from_str(offer).unwrap();
        assert!(matches!(
            env.signal,
            PeerSignal::Offer {
                purpose: SessionPurpose::Data,
                ..
            }
        ));
    }

    #[test]
    fn ice_servers_become_one_rtc_server() {
        let (mut t, _, _) = transport("a");
        assert!(t.rtc_config().ice_servers.is_empty());
        t.ice_servers = MeshConfig::default().ice_servers;
        let config = t.rtc_config();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls.len(), 3);
    }

    #[tokio::test]
    async fn misaddressed_and_unknown_signals_are_rejected() {
        let (t, _, _) = transport("a");
        let session = SessionId::new();
        let wrong_dest = SignalEnvelope {
            src: "b".into(),
            dest: "c".into(),
            signal: PeerSignal::Hangup { session },
        };
        assert!(t.recv_signal(wrong_dest).await.is_err());

        let unknown = SignalEnvelope {
            src: "b".into(),
            dest: "a".into(),
            signal: PeerSignal::Ice {
                session,
                candidate: RTCIceCandidateInit::default(),
            },
        };
        assert!(t.recv_signal(unknown).await.is_err());
    }

    #[tokio::test]
    async fn connect_data_sends_an_offer_and_hangup_forgets_it() {
        let (t, _events, mut outbox) = transport("a");
        let channel = t.connect_data(&"b".into()).await.unwrap();
        assert!(!channel.is_open());
        assert!(channel.try_send("early".into()).is_err());

        let mut offered = None;
        while let Ok(env) = outbox.try_recv() {
            if let PeerSignal::Offer {
                session, purpose, ..
            } = env.signal
            {
                assert_eq!(env.dest, PeerId::from("b"));
                assert_eq!(purpose, SessionPurpose::Data);
                offered = Some(session);
            }
        }
        let session = offered.unwrap();
        assert_eq!(t.links.lock().await.len(), 1);

        t.recv_signal(SignalEnvelope {
            src: "b".into(),
            dest: "a".into(),
            signal: PeerSignal::Hangup { session },
        })
        .await
        .unwrap();
        assert!(t.links.lock().await.is_empty());
    }
}
