//! In-memory doubles for the transport seam. Every double records what was done to it.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::internal::data_types::{ChannelId, PeerId, SessionId};
use crate::internal::media::{MediaStream, MediaTrack, TrackKind};
use crate::internal::transport::{
    AudioOutput, AudioSink, DataChannel, MediaSession, SignalingClient,
};

pub struct MockTrack {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> String {
        self.id.clone()
    }
    fn kind(&self) -> TrackKind {
        self.kind
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// a stream with a single audio track, plus the track for inspection
pub fn mock_stream(id: &str) -> (MediaStream, Arc<MockTrack>) {
    let track = MockTrack::new(&format!("{}-audio", id), TrackKind::Audio);
    let tracks: Vec<Arc<dyn MediaTrack>> = vec![track.clone()];
    (MediaStream::new(id, tracks), track)
}

pub struct MockSession {
    id: SessionId,
    peer: PeerId,
    closed: AtomicBool,
    answered_with: Mutex<Option<String>>,
    replaced: Mutex<Vec<String>>,
    fail_answer: AtomicBool,
    fail_replace: AtomicBool,
}

impl MockSession {
    pub fn new(peer: &str) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(),
            peer: peer.into(),
            closed: AtomicBool::new(false),
            answered_with: Mutex::new(None),
            replaced: Mutex::new(Vec::new()),
            fail_answer: AtomicBool::new(false),
            fail_replace: AtomicBool::new(false),
        })
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn answered_with(&self) -> Option<String> {
        self.answered_with.lock().unwrap().clone()
    }

    pub fn replaced(&self) -> Vec<String> {
        self.replaced.lock().unwrap().clone()
    }

    pub fn fail_answer(&self, fail: bool) {
        self.fail_answer.store(fail, Ordering::SeqCst);
    }

    pub fn fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSession for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn peer(&self) -> &PeerId {
        &self.peer
    }

    async fn answer(&self, local: &MediaStream) -> Result<()> {
        if self.fail_answer.load(Ordering::SeqCst) {
            bail!("answer rejected");
        }
        *self.answered_with.lock().unwrap() = Some(local.id().to_string());
        Ok(())
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        if self.fail_replace.load(Ordering::SeqCst) {
            bail!("no sender for track");
        }
        self.replaced.lock().unwrap().push(track.id());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockChannel {
    id: ChannelId,
    open: AtomicBool,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockChannel {
    fn with_state(open: bool) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::new(),
            open: AtomicBool::new(open),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn open() -> Arc<Self> {
        Self::with_state(true)
    }

    pub fn closed() -> Arc<Self> {
        Self::with_state(false)
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DataChannel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn try_send(&self, text: String) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("buffer full");
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// hands out MockSessions/MockChannels and keeps them for inspection
#[derive(Default)]
pub struct MockSignaling {
    fail_dial: AtomicBool,
    fail_connect: AtomicBool,
    reconnects: AtomicU32,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    channels: Mutex<Vec<(PeerId, Arc<MockChannel>)>>,
}

impl MockSignaling {
    pub fn fail_dial(&self, fail: bool) {
        self.fail_dial.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn dials_to(&self, peer: &str) -> Vec<Arc<MockSession>> {
        self.sessions()
            .into_iter()
            .filter(|s| s.peer().as_str() == peer)
            .collect()
    }

    pub fn channels(&self) -> Vec<(PeerId, Arc<MockChannel>)> {
        self.channels.lock().unwrap().clone()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingClient for MockSignaling {
    fn local_id(&self) -> Option<PeerId> {
        Some("me".into())
    }

    async fn allocate_identifier(&self) -> Result<PeerId> {
        Ok("me".into())
    }

    async fn dial(&self, peer: &PeerId, _local: &MediaStream) -> Result<Arc<dyn MediaSession>> {
        if self.fail_dial.load(Ordering::SeqCst) {
            bail!("peer-unavailable");
        }
        let session = MockSession::new(peer.as_str());
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }

    async fn connect_data(&self, peer: &PeerId) -> Result<Arc<dyn DataChannel>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            bail!("network");
        }
        let channel = MockChannel::closed();
        self.channels
            .lock()
            .unwrap()
            .push((peer.clone(), channel.clone()));
        Ok(channel)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct SinkState {
    volume: f32,
    muted: bool,
    playing: bool,
    released: bool,
}

/// shared view of one MockSink
#[derive(Clone)]
pub struct SinkRecord {
    pub peer: PeerId,
    pub stream_id: String,
    state: Arc<Mutex<SinkState>>,
}

impl SinkRecord {
    pub fn volume(&self) -> f32 {
        self.state.lock().unwrap().volume
    }
    pub fn muted(&self) -> bool {
        self.state.lock().unwrap().muted
    }
    pub fn playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }
    pub fn released(&self) -> bool {
        self.state.lock().unwrap().released
    }
}

struct MockSink {
    state: Arc<Mutex<SinkState>>,
    fail_play: Arc<AtomicBool>,
}

impl AudioSink for MockSink {
    fn play(&mut self) -> Result<()> {
        if self.fail_play.load(Ordering::SeqCst) {
            bail!("autoplay blocked");
        }
        self.state.lock().unwrap().playing = true;
        Ok(())
    }
    fn set_volume(&mut self, volume: f32) {
        self.state.lock().unwrap().volume = volume;
    }
    fn set_muted(&mut self, muted: bool) {
        self.state.lock().unwrap().muted = muted;
    }
    fn release(&mut self) {
        let mut s = self.state.lock().unwrap();
        s.playing = false;
        s.released = true;
    }
}

#[derive(Default)]
pub struct MockAudioOutput {
    fail_create: AtomicBool,
    fail_play: Arc<AtomicBool>,
    sinks: Mutex<Vec<SinkRecord>>,
}

impl MockAudioOutput {
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_play(&self, fail: bool) {
        self.fail_play.store(fail, Ordering::SeqCst);
    }

    /// every sink ever created, oldest first
    pub fn sinks(&self) -> Vec<SinkRecord> {
        self.sinks.lock().unwrap().clone()
    }

    pub fn live_sinks(&self, peer: &str) -> usize {
        self.sinks()
            .iter()
            .filter(|s| s.peer.as_str() == peer && !s.released())
            .count()
    }
}

impl AudioOutput for MockAudioOutput {
    fn create_sink(&self, peer: &PeerId, stream: &MediaStream) -> Result<Box<dyn AudioSink>> {
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("no output device");
        }
        let state = Arc::new(Mutex::new(SinkState::default()));
        self.sinks.lock().unwrap().push(SinkRecord {
            peer: peer.clone(),
            stream_id: stream.id().to_string(),
            state: state.clone(),
        });
        Ok(Box::new(MockSink {
            state,
            fail_play: self.fail_play.clone(),
        }))
    }
}
