use anyhow::{anyhow, Result};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rand::prelude::*;
use std::sync::{mpsc as std_mpsc, Arc};
use tokio::sync::mpsc;
use webrtc::rtp::{self, packetizer::Packetizer};
use webrtc::track::track_local::TrackLocalWriter;

use super::{opus_capability, LocalRtpTrack, OPUS_SAMPLE_RATE};
use crate::{MediaStream, MediaTrack, MeshError};

/// 20ms at 48kHz
const FRAME_SIZE: usize = 960;
const MAX_OPUS_PACKET: usize = 1500;
const RTP_MTU: usize = 1200;
// dynamic payload type; the real one is negotiated in SDP
const OPUS_PAYLOAD_TYPE: u8 = 111;

/// groups raw samples into opus frames
pub struct OpusFramer {
    encoder: opus::Encoder,
    // queues samples, to build a frame
    raw_samples: Vec<i16>,
    opus_out: Vec<u8>,
    // number of samples in a frame
    frame_size: usize,
}

impl OpusFramer {
    pub fn init(frame_size: usize, sample_rate: u32, channels: opus::Channels) -> Result<Self> {
        let encoder = opus::Encoder::new(sample_rate, channels, opus::Application::Voip)?;
        Ok(Self {
            encoder,
            raw_samples: Vec::with_capacity(frame_size),
            opus_out: vec![0; MAX_OPUS_PACKET],
            frame_size,
        })
    }

    /// returns an encoded frame once `frame_size` samples have been queued
    pub fn frame(&mut self, sample: i16) -> Option<Bytes> {
        self.raw_samples.push(sample);
        if self.raw_samples.len() < self.frame_size {
            return None;
        }
        let encoded = self
            .encoder
            .encode(&self.raw_samples, self.opus_out.as_mut_slice());
        self.raw_samples.clear();
        match encoded {
            Ok(size) => Some(Bytes::copy_from_slice(&self.opus_out[..size])),
            Err(e) => {
                log::error!("OpusFramer failed to encode: {}", e);
                None
            }
        }
    }
}

/// Captures the default input device into a LocalRtpTrack.
///
/// Capture stops when the source is dropped. Stopping the track only silences it: the
/// device stays open until the source goes away.
pub struct MicrophoneSource {
    stop_tx: std_mpsc::Sender<()>,
    track: Arc<LocalRtpTrack>,
}

impl MicrophoneSource {
    pub fn start(track: Arc<LocalRtpTrack>, channels: opus::Channels) -> Result<Self, MeshError> {
        let (producer, mut consumer) = mpsc::unbounded_channel::<Bytes>();
        let ssrc: u32 = rand::thread_rng().gen();
        let mut packetizer = rtp::packetizer::new_packetizer(
            RTP_MTU,
            OPUS_PAYLOAD_TYPE,
            // randomly generated and uniquely identifies the source
            ssrc,
            Box::new(rtp::codecs::opus::OpusPayloader {}),
            Box::new(rtp::sequence::new_random_sequencer()),
            OPUS_SAMPLE_RATE,
        );

        let rtp_track = track.rtp_track();
        tokio::spawn(async move {
            while let Some(bytes) = consumer.recv().await {
                match packetizer.packetize(&bytes, FRAME_SIZE as u32).await {
                    Ok(packets) => {
                        for packet in &packets {
                            if let Err(e) = rtp_track.write_rtp(packet).await {
                                log::error!("failed to send RTP packet: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("failed to packetize for opus: {}", e);
                    }
                }
            }
            log::debug!("microphone packetizer stopped");
        });

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (init_tx, init_rx) = std_mpsc::channel::<Result<(), String>>();
        let capture_track = track.clone();
        std::thread::Builder::new()
            .name("audio-in".into())
            .spawn(move || {
                let stream = match build_input_stream(capture_track, producer, channels) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = init_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = init_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = init_tx.send(Ok(()));
                // blocks until the source is dropped
                let _ = stop_rx.recv();
                log::debug!("microphone released");
            })
            .map_err(|e| MeshError::DeviceAccess(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop_tx, track }),
            Ok(Err(e)) => Err(MeshError::DeviceAccess(e)),
            Err(_) => Err(MeshError::DeviceAccess("capture thread exited".into())),
        }
    }

    pub fn track(&self) -> Arc<LocalRtpTrack> {
        self.track.clone()
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.track.stop();
        let _ = self.stop_tx.send(());
    }
}

fn build_input_stream(
    track: Arc<LocalRtpTrack>,
    producer: mpsc::UnboundedSender<Bytes>,
    channels: opus::Channels,
) -> Result<cpal::Stream> {
    let mut framer = OpusFramer::init(FRAME_SIZE, OPUS_SAMPLE_RATE, channels)?;
    let input_data_fn = move |data: &[i16], _: &cpal::InputCallbackInfo| {
        if track.is_stopped() {
            return;
        }
        for sample in data {
            if let Some(bytes) = framer.frame(*sample) {
                if let Err(e) = producer.send(bytes) {
                    log::error!("failed to queue opus frame: {}", e);
                }
            }
        }
    };

    let host = cpal::default_host();
    let input_device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("couldn't find default input device"))?;
    let config = cpal::StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(OPUS_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let input_stream = input_device.build_input_stream(&config, input_data_fn, err_fn)?;
    Ok(input_stream)
}

fn err_fn(err: cpal::StreamError) {
    log::error!("an error occurred on stream: {}", err);
}

/// opens the default microphone and returns a one-track stream ready for `call_peer`.
/// keep the source alive for as long as the stream is in use
pub fn capture_microphone(stream_id: &str) -> Result<(MediaStream, MicrophoneSource), MeshError> {
    let track = LocalRtpTrack::new(opus_capability(opus::Channels::Mono), "microphone", stream_id)
        .map_err(|e| MeshError::DeviceAccess(e.to_string()))?;
    let source = MicrophoneSource::start(track.clone(), opus::Channels::Mono)?;
    let tracks: Vec<Arc<dyn MediaTrack>> = vec![track as Arc<dyn MediaTrack>];
    Ok((MediaStream::new(stream_id, tracks), source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_emits_one_packet_per_frame() {
        let mut framer = OpusFramer::init(FRAME_SIZE, OPUS_SAMPLE_RATE, opus::Channels::Mono)
            .unwrap();
        let mut packets = 0;
        for i in 0..(FRAME_SIZE * 3 + 10) {
            let sample = ((i as f32 * 0.05).sin() * 8000.0) as i16;
            if let Some(bytes) = framer.frame(sample) {
                assert!(!bytes.is_empty());
                packets += 1;
            }
        }
        assert_eq!(packets, 3);
    }
}
