use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::MeshError;
use crate::internal::data_types::PeerId;
use crate::internal::media::MediaStream;
use crate::internal::transport::{AudioOutput, AudioSink};

const DEFAULT_VOLUME: f32 = 1.0;

struct PlaybackSlot {
    stream: MediaStream,
    sink: Box<dyn AudioSink>,
}

/// Owns one playback sink per peer with remote audio.
///
/// Volume and mute are per-peer preferences that live independently of the sinks: they
/// can be set before a stream arrives and survive sink replacement.
pub struct AudioManager {
    output: Arc<dyn AudioOutput>,
    sinks: HashMap<PeerId, PlaybackSlot>,
    volumes: HashMap<PeerId, f32>,
    muted: HashSet<PeerId>,
}

impl AudioManager {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            sinks: HashMap::new(),
            volumes: HashMap::new(),
            muted: HashSet::new(),
        }
    }

    /// binds `stream` to a fresh sink for `peer`, releasing the previous one first.
    /// a sink that refuses to start playing is kept; a later user gesture can resume it
    pub fn add_stream(&mut self, peer: &PeerId, stream: MediaStream) -> Result<(), MeshError> {
        self.remove_stream(peer);

        let mut sink = match self.output.create_sink(peer, &stream) {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to create audio sink for peer {}: {}", peer, e);
                stream.stop_all();
                return Err(MeshError::DeviceAccess(e.to_string()));
            }
        };
        sink.set_volume(self.volume(peer));
        sink.set_muted(self.is_muted(peer));
        if let Err(e) = sink.play() {
            log::warn!("playback blocked for peer {}: {}", peer, e);
        }

        log::info!("added audio stream {} for peer {}", stream.id(), peer);
        self.sinks.insert(peer.clone(), PlaybackSlot { stream, sink });
        Ok(())
    }

    /// retries playback, e.g. after a user gesture
    pub fn resume(&mut self, peer: &PeerId) -> bool {
        match self.sinks.get_mut(peer) {
            Some(slot) => match slot.sink.play() {
                Ok(_) => true,
                Err(e) => {
                    log::warn!("playback still blocked for peer {}: {}", peer, e);
                    false
                }
            },
            None => false,
        }
    }

    /// stops the peer's tracks and releases its sink. returns false if there was none
    pub fn remove_stream(&mut self, peer: &PeerId) -> bool {
        match self.sinks.remove(peer) {
            Some(mut slot) => {
                slot.stream.stop_all();
                slot.sink.release();
                log::info!("removed audio stream for peer {}", peer);
                true
            }
            None => false,
        }
    }

    /// releases every sink. volume and mute preferences are kept for the session
    pub fn remove_all_streams(&mut self) {
        let peers: Vec<PeerId> = self.sinks.keys().cloned().collect();
        for peer in peers {
            self.remove_stream(&peer);
        }
    }

    pub fn set_volume(&mut self, peer: &PeerId, volume: f32) {
        // NaN clamps to nothing, treat it as silence
        let volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, 1.0)
        };
        self.volumes.insert(peer.clone(), volume);
        if let Some(slot) = self.sinks.get_mut(peer) {
            slot.sink.set_volume(volume);
        }
    }

    pub fn volume(&self, peer: &PeerId) -> f32 {
        self.volumes.get(peer).copied().unwrap_or(DEFAULT_VOLUME)
    }

    pub fn set_muted(&mut self, peer: &PeerId, muted: bool) {
        if muted {
            self.muted.insert(peer.clone());
        } else {
            self.muted.remove(peer);
        }
        if let Some(slot) = self.sinks.get_mut(peer) {
            slot.sink.set_muted(muted);
        }
    }

    pub fn is_muted(&self, peer: &PeerId) -> bool {
        self.muted.contains(peer)
    }

    /// returns the new mute state
    pub fn toggle_mute(&mut self, peer: &PeerId) -> bool {
        let muted = !self.is_muted(peer);
        self.set_muted(peer, muted);
        muted
    }

    pub fn has_sink(&self, peer: &PeerId) -> bool {
        self.sinks.contains_key(peer)
    }

    /// id of the stream currently bound to the peer's sink
    pub fn stream_id(&self, peer: &PeerId) -> Option<&str> {
        self.sinks.get(peer).map(|slot| slot.stream.id())
    }

    pub fn active_peers(&self) -> Vec<PeerId> {
        self.sinks.keys().cloned().collect()
    }

    pub fn stream_count(&self) -> usize {
        self.sinks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::media::MediaTrack;
    use crate::internal::test_support::{mock_stream, MockAudioOutput};

    fn manager() -> (AudioManager, Arc<MockAudioOutput>) {
        let output = Arc::new(MockAudioOutput::default());
        (AudioManager::new(output.clone()), output)
    }

    #[test]
    fn volume_is_clamped() {
        let (mut audio, _) = manager();
        let p = PeerId::from("p");
        audio.set_volume(&p, 1.5);
        assert_eq!(audio.volume(&p), 1.0);
        audio.set_volume(&p, -1.0);
        assert_eq!(audio.volume(&p), 0.0);
        audio.set_volume(&p, 0.25);
        assert_eq!(audio.volume(&p), 0.25);
    }

    #[test]
    fn unknown_peer_has_full_volume() {
        let (audio, _) = manager();
        assert_eq!(audio.volume(&"p".into()), 1.0);
    }

    #[test]
    fn replacing_a_stream_stops_the_old_tracks() {
        let (mut audio, output) = manager();
        let p = PeerId::from("p");
        let (s1, t1) = mock_stream("s1");
        let (s2, t2) = mock_stream("s2");

        audio.add_stream(&p, s1).unwrap();
        audio.add_stream(&p, s2).unwrap();

        assert_eq!(audio.stream_count(), 1);
        assert_eq!(audio.stream_id(&p), Some("s2"));
        assert!(t1.is_stopped());
        assert!(!t2.is_stopped());

        let sinks = output.sinks();
        assert_eq!(sinks.len(), 2);
        assert!(sinks[0].released());
        assert!(!sinks[1].released());
    }

    #[test]
    fn volume_set_before_stream_is_applied() {
        let (mut audio, output) = manager();
        let p = PeerId::from("p");
        audio.set_volume(&p, 0.3);
        audio.set_muted(&p, true);
        audio.add_stream(&p, mock_stream("s").0).unwrap();

        let sink = &output.sinks()[0];
        assert_eq!(sink.volume(), 0.3);
        assert!(sink.muted());
    }

    #[test]
    fn mute_survives_sink_replacement() {
        let (mut audio, output) = manager();
        let p = PeerId::from("p");
        audio.add_stream(&p, mock_stream("s1").0).unwrap();
        assert!(audio.toggle_mute(&p));
        audio.add_stream(&p, mock_stream("s2").0).unwrap();

        assert!(audio.is_muted(&p));
        assert!(output.sinks()[1].muted());
        assert!(!audio.toggle_mute(&p));
        assert!(!output.sinks()[1].muted());
    }

    #[test]
    fn blocked_playback_keeps_the_sink() {
        let (mut audio, output) = manager();
        output.fail_play(true);
        let p = PeerId::from("p");
        audio.add_stream(&p, mock_stream("s").0).unwrap();
        assert!(audio.has_sink(&p));
        assert!(!audio.resume(&p));

        output.fail_play(false);
        assert!(audio.resume(&p));
    }

    #[test]
    fn sink_creation_failure_is_reported() {
        let (mut audio, output) = manager();
        output.fail_create(true);
        let p = PeerId::from("p");
        let (stream, track) = mock_stream("s");
        assert!(matches!(
            audio.add_stream(&p, stream),
            Err(MeshError::DeviceAccess(_))
        ));
        assert!(!audio.has_sink(&p));
        assert!(track.is_stopped());
    }

    #[test]
    fn remove_is_idempotent() {
        let (mut audio, _) = manager();
        let p = PeerId::from("p");
        audio.add_stream(&p, mock_stream("s").0).unwrap();
        assert!(audio.remove_stream(&p));
        assert!(!audio.remove_stream(&p));
    }

    #[test]
    fn remove_all_keeps_preferences() {
        let (mut audio, _) = manager();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        audio.add_stream(&a, mock_stream("sa").0).unwrap();
        audio.add_stream(&b, mock_stream("sb").0).unwrap();
        audio.set_volume(&a, 0.5);
        audio.remove_all_streams();
        assert_eq!(audio.stream_count(), 0);
        assert_eq!(audio.volume(&a), 0.5);
    }
}
