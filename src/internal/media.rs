use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use webrtc::api::media_engine::{
    MIME_TYPE_AV1, MIME_TYPE_G722, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU,
    MIME_TYPE_VP8, MIME_TYPE_VP9,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// represents the MIME types from webrtc::api::media_engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimeType {
    H264,
    VP8,
    VP9,
    AV1,
    // the only codec the playback sink decodes
    OPUS,
    G722,
    // G.711 µ-law
    PCMU,
    // G.711 A-law
    PCMA,
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MimeType::H264 => MIME_TYPE_H264,
            MimeType::VP8 => MIME_TYPE_VP8,
            MimeType::VP9 => MIME_TYPE_VP9,
            MimeType::AV1 => MIME_TYPE_AV1,
            MimeType::OPUS => MIME_TYPE_OPUS,
            MimeType::G722 => MIME_TYPE_G722,
            MimeType::PCMU => MIME_TYPE_PCMU,
            MimeType::PCMA => MIME_TYPE_PCMA,
        };
        f.write_str(s)
    }
}

impl MimeType {
    /// mime types are compared case-insensitively; browsers send "audio/opus",
    /// webrtc-rs uses "audio/opus" as well but SDP allows "audio/OPUS"
    pub fn from_string(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let all = [
            MimeType::H264,
            MimeType::VP8,
            MimeType::VP9,
            MimeType::AV1,
            MimeType::OPUS,
            MimeType::G722,
            MimeType::PCMU,
            MimeType::PCMA,
        ];
        match all
            .into_iter()
            .find(|m| m.to_string().to_ascii_lowercase() == lower)
        {
            Some(m) => Ok(m),
            None => bail!("invalid mime type: {}", s),
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self {
            MimeType::OPUS | MimeType::G722 | MimeType::PCMU | MimeType::PCMA => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

/// a single local or remote media track. implemented by the webrtc adapter
/// (media::LocalRtpTrack, media::RemoteRtpTrack) and by test doubles
pub trait MediaTrack: Send + Sync + Any {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    /// stops producing/consuming media. idempotent
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    /// lets adapters recover their concrete track type
    fn as_any(&self) -> &dyn Any;
}

/// a group of tracks delivered or sent together, like a browser MediaStream
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.iter().map(|t| t.id()).collect::<Vec<_>>())
            .finish()
    }
}
