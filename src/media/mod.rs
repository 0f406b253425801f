use anyhow::Result;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::{MediaTrack, MimeType, TrackKind};

mod opus_sink;
mod opus_source;
pub use opus_sink::{CpalAudioOutput, OpusSink};
pub use opus_source::{capture_microphone, MicrophoneSource, OpusFramer};

pub const OPUS_SAMPLE_RATE: u32 = 48000;

pub fn opus_capability(channels: opus::Channels) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MimeType::OPUS.to_string(),
        clock_rate: OPUS_SAMPLE_RATE,
        channels: channels as u16,
        ..Default::default()
    }
}

/// outbound track. RTP packets written to `rtp_track()` reach every peer connection the
/// track was added to
pub struct LocalRtpTrack {
    rtp: Arc<TrackLocalStaticRTP>,
    kind: TrackKind,
    stopped: AtomicBool,
}

impl LocalRtpTrack {
    pub fn new(codec: RTCRtpCodecCapability, id: &str, stream_id: &str) -> Result<Arc<Self>> {
        let kind = MimeType::from_string(&codec.mime_type)?.kind();
        Ok(Arc::new(Self {
            rtp: Arc::new(TrackLocalStaticRTP::new(codec, id.into(), stream_id.into())),
            kind,
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.rtp.clone()
    }
}

impl MediaTrack for LocalRtpTrack {
    fn id(&self) -> String {
        self.rtp.id().to_string()
    }
    fn kind(&self) -> TrackKind {
        self.kind
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// inbound track. the playback sink reads RTP from `remote()` until the track is stopped
pub struct RemoteRtpTrack {
    remote: Arc<TrackRemote>,
    id: String,
    kind: TrackKind,
    mime_type: String,
    stopped: Arc<AtomicBool>,
}

impl RemoteRtpTrack {
    pub async fn from_remote(remote: Arc<TrackRemote>) -> Arc<Self> {
        let kind = match remote.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        Arc::new(Self {
            id: remote.id().await,
            mime_type: remote.codec().await.capability.mime_type,
            remote,
            kind,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn remote(&self) -> Arc<TrackRemote> {
        self.remote.clone()
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// shared with the decoder task so it can stop reading
    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }
}

impl MediaTrack for RemoteRtpTrack {
    fn id(&self) -> String {
        self.id.clone()
    }
    fn kind(&self) -> TrackKind {
        self.kind
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_track_kind_follows_codec() {
        let track = LocalRtpTrack::new(opus_capability(opus::Channels::Mono), "mic", "local")
            .unwrap();
        assert_eq!(track.kind(), TrackKind::Audio);
        assert_eq!(track.id(), "mic");
        assert!(!track.is_stopped());
        track.stop();
        assert!(track.is_stopped());
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let codec = RTCRtpCodecCapability {
            mime_type: "audio/unknown".into(),
            ..Default::default()
        };
        assert!(LocalRtpTrack::new(codec, "x", "y").is_err());
    }

    #[test]
    fn downcasts_through_media_track() {
        let track: Arc<dyn MediaTrack> =
            LocalRtpTrack::new(opus_capability(opus::Channels::Mono), "mic", "local").unwrap();
        assert!(track.as_any().downcast_ref::<LocalRtpTrack>().is_some());
    }
}
