use anyhow::{anyhow, bail, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use webrtc::{
    media::io::sample_builder::SampleBuilder,
    rtp::{self, packetizer::Depacketizer},
    track::track_remote::TrackRemote,
    util::Unmarshal,
};

use super::{RemoteRtpTrack, OPUS_SAMPLE_RATE};
use crate::{AudioOutput, AudioSink, MediaStream, MimeType, PeerId};

const PLAY_TIMEOUT: Duration = Duration::from_secs(1);

/// plays remote opus tracks on the default output device
#[derive(Default)]
pub struct CpalAudioOutput {}

impl CpalAudioOutput {
    pub fn new() -> Self {
        Self {}
    }
}

impl AudioOutput for CpalAudioOutput {
    fn create_sink(&self, peer: &PeerId, stream: &MediaStream) -> Result<Box<dyn AudioSink>> {
        let track = stream
            .audio_tracks()
            .find_map(|t| t.as_any().downcast_ref::<RemoteRtpTrack>())
            .ok_or_else(|| anyhow!("stream {} has no remote audio track", stream.id()))?;
        match MimeType::from_string(track.mime_type())? {
            MimeType::OPUS => Ok(Box::new(OpusSink::init(peer.clone(), track)?)),
            _ => bail!("unhandled mime type: {}", track.mime_type()),
        }
    }
}

/// read by the cpal callback on every buffer
struct PlaybackControls {
    volume: AtomicU32,
    muted: AtomicBool,
}

impl PlaybackControls {
    fn gain(&self) -> f32 {
        if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            f32::from_bits(self.volume.load(Ordering::Relaxed))
        }
    }
}

enum StreamCmd {
    Play(std_mpsc::Sender<Result<(), String>>),
    Release,
}

/// Decodes one remote opus track and plays it.
///
/// cpal streams can't leave the thread that built them, so each sink owns a thread that
/// holds the stream and waits for commands. The RTP reader/decoder runs on tokio and
/// hands samples to the cpal callback through a channel.
pub struct OpusSink {
    peer: PeerId,
    controls: Arc<PlaybackControls>,
    cmd_tx: std_mpsc::Sender<StreamCmd>,
    track_stopped: Arc<AtomicBool>,
}

impl OpusSink {
    pub fn init(peer: PeerId, track: &RemoteRtpTrack) -> Result<Self> {
        let (producer, consumer) = mpsc::unbounded_channel::<i16>();
        let controls = Arc::new(PlaybackControls {
            volume: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
        });

        let (cmd_tx, cmd_rx) = std_mpsc::channel::<StreamCmd>();
        let (init_tx, init_rx) = std_mpsc::channel::<Result<(), String>>();
        let thread_controls = controls.clone();
        let thread_peer = peer.clone();
        std::thread::Builder::new()
            .name(format!("audio-out-{}", peer))
            .spawn(move || {
                let stream = match build_output_stream(consumer, thread_controls) {
                    Ok(s) => {
                        let _ = init_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        StreamCmd::Play(reply) => {
                            let _ = reply.send(stream.play().map_err(|e| e.to_string()));
                        }
                        StreamCmd::Release => break,
                    }
                }
                log::debug!("audio output for {} released", thread_peer);
            })?;

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => bail!("failed to open output device: {}", e),
            Err(_) => bail!("audio output thread exited"),
        }

        let sample_builder = SampleBuilder::new(
            480,
            rtp::codecs::opus::OpusPacket::default(),
            OPUS_SAMPLE_RATE,
        );
        let remote = track.remote();
        let stopped = track.stopped_flag();
        let decoder_peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = decode_media_stream(remote, sample_builder, producer, stopped).await
            {
                log::error!("error decoding media stream from {}: {}", decoder_peer, e);
            }
            log::debug!("stopped decoding media stream from {}", decoder_peer);
        });

        Ok(Self {
            peer,
            controls,
            cmd_tx,
            track_stopped: track.stopped_flag(),
        })
    }
}

impl AudioSink for OpusSink {
    fn play(&mut self) -> Result<()> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.cmd_tx
            .send(StreamCmd::Play(reply_tx))
            .map_err(|_| anyhow!("audio output for {} is gone", self.peer))?;
        match reply_rx.recv_timeout(PLAY_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => bail!("failed to start playback: {}", e),
            Err(_) => bail!("audio output for {} did not respond", self.peer),
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.controls
            .volume
            .store(volume.to_bits(), Ordering::Relaxed);
    }

    fn set_muted(&mut self, muted: bool) {
        self.controls.muted.store(muted, Ordering::Relaxed);
    }

    fn release(&mut self) {
        self.track_stopped.store(true, Ordering::Relaxed);
        let _ = self.cmd_tx.send(StreamCmd::Release);
    }
}

impl Drop for OpusSink {
    fn drop(&mut self) {
        self.release();
    }
}

fn build_output_stream(
    mut consumer: mpsc::UnboundedReceiver<i16>,
    controls: Arc<PlaybackControls>,
) -> Result<cpal::Stream> {
    let output_data_fn = move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
        let gain = controls.gain();
        let mut input_fell_behind = false;
        for sample in data {
            *sample = match consumer.try_recv() {
                Ok(s) => (s as f32 * gain) as i16,
                Err(TryRecvError::Empty) => {
                    input_fell_behind = true;
                    0
                }
                Err(TryRecvError::Disconnected) => 0,
            }
        }
        if input_fell_behind {
            log::trace!("output stream is ahead of the decoder");
        }
    };

    let host = cpal::default_host();
    let output_device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("couldn't find default output device"))?;
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(OPUS_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let output_stream = output_device.build_output_stream(&config, output_data_fn, err_fn)?;
    Ok(output_stream)
}

/// reads RTP packets, reassembles opus frames and sends the decoded samples
async fn decode_media_stream<T>(
    track: Arc<TrackRemote>,
    mut sample_builder: SampleBuilder<T>,
    producer: mpsc::UnboundedSender<i16>,
    stopped: Arc<AtomicBool>,
) -> Result<()>
where
    T: Depacketizer,
{
    let mut decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono)?;
    let mut decoder_output_buf = [0; 4096];
    let mut b = [0u8; 4096];
    while !stopped.load(Ordering::Relaxed) {
        let (siz, _attr) = match track.read(&mut b).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("closing track: {}", e);
                break;
            }
        };
        let mut buf = &b[..siz];
        let rtp_packet = match rtp::packet::Packet::unmarshal(&mut buf) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("dropping malformed rtp packet: {}", e);
                continue;
            }
        };

        sample_builder.push(rtp_packet);
        while let Some(media_sample) = sample_builder.pop() {
            match decoder.decode(media_sample.data.as_ref(), &mut decoder_output_buf, false) {
                Ok(siz) => {
                    for audio_sample in decoder_output_buf.iter().take(siz) {
                        if producer.send(*audio_sample).is_err() {
                            // output side is gone
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    log::error!("decode error: {}", e);
                    continue;
                }
            }
        }
    }

    Ok(())
}

fn err_fn(err: cpal::StreamError) {
    log::error!("an error occurred on stream: {}", err);
}
