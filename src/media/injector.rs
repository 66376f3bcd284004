//! Auxiliary audio injection
//!
//! Maintains a dedicated local audio track that always carries media: Opus
//! silence when idle, decoded audio clips on demand. Keeping the track fed
//! avoids negotiation stalls on sessions where the caller has no microphone
//! track of their own. The injector owns only its own track; caller tracks
//! are never touched.

use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::{Error, Result};

/// Injector output rate; Opus operates natively at 48 kHz
const SAMPLE_RATE: u32 = 48_000;
/// 20 ms of mono audio at 48 kHz
const FRAME_SAMPLES: usize = 960;
const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Upper bound for one encoded Opus frame
const MAX_PACKET: usize = 4000;

/// A decoded audio clip, mono 48 kHz
#[derive(Debug, Clone)]
pub struct AudioClip {
    samples: Vec<i16>,
}

impl AudioClip {
    /// Build a clip from raw samples at an arbitrary rate and channel count
    pub fn from_samples(samples: &[i16], sample_rate: u32, channels: u16) -> Result<Self> {
        if channels == 0 {
            return Err(Error::MediaTrackError(
                "audio clip with zero channels".to_string(),
            ));
        }
        let mono: Vec<f32> = samples
            .chunks(channels as usize)
            .map(|frame| {
                frame.iter().map(|&s| s as f32 / 32768.0).sum::<f32>() / channels as f32
            })
            .collect();
        Ok(Self {
            samples: resample_to_48k(&mono, sample_rate),
        })
    }

    /// Decode a WAV file held in memory
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes))
            .map_err(|e| Error::MediaTrackError(format!("invalid WAV data: {}", e)))?;
        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(Error::MediaTrackError(
                "WAV data with zero channels".to_string(),
            ));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::MediaTrackError(format!("WAV decode failed: {}", e)))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| Error::MediaTrackError(format!("WAV decode failed: {}", e)))?
            }
        };

        let channels = spec.channels as usize;
        let mono: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        Ok(Self {
            samples: resample_to_48k(&mono, spec.sample_rate),
        })
    }

    /// Clip length
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / SAMPLE_RATE as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Resolves when the associated clip finishes or is stopped
pub struct Playback {
    done: oneshot::Receiver<()>,
}

impl Playback {
    /// Wait for playback to end; resolves immediately if already over
    pub async fn finished(self) {
        let _ = self.done.await;
    }
}

enum Command {
    Play {
        samples: Vec<i16>,
        done: oneshot::Sender<()>,
    },
    Stop,
    Shutdown,
}

/// Audio injector feeding a dedicated Opus track
pub struct AudioInjector {
    track: Arc<TrackLocalStaticSample>,
    commands: mpsc::UnboundedSender<Command>,
}

impl AudioInjector {
    /// Create the injector and start feeding silence. Must be called inside
    /// a Tokio runtime.
    pub fn new() -> Result<Self> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "aux-audio".to_string(),
            "morphstream".to_string(),
        ));

        let encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Audio)
                .map_err(|e| Error::MediaTrackError(format!("opus encoder init failed: {}", e)))?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(track.clone(), encoder, command_rx));

        Ok(Self { track, commands })
    }

    /// The injector's track, for attachment to a [`super::LocalMediaSource`]
    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Play a clip, superseding any clip currently playing
    pub fn play(&self, clip: AudioClip) -> Result<Playback> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Play {
                samples: clip.samples,
                done: done_tx,
            })
            .map_err(|_| Error::MediaTrackError("audio injector stopped".to_string()))?;
        Ok(Playback { done: done_rx })
    }

    /// Stop the current clip and revert to silence
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Stop the writer task; the track goes quiet but is not stopped
    pub fn cleanup(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl Drop for AudioInjector {
    fn drop(&mut self) {
        self.cleanup();
    }
}

struct ActiveClip {
    samples: Vec<i16>,
    pos: usize,
    done: oneshot::Sender<()>,
}

impl ActiveClip {
    /// Copy up to one frame into `out`, leaving the tail zeroed
    fn fill(&mut self, out: &mut [i16; FRAME_SAMPLES]) {
        let end = (self.pos + FRAME_SAMPLES).min(self.samples.len());
        let chunk = &self.samples[self.pos..end];
        out[..chunk.len()].copy_from_slice(chunk);
        self.pos = end;
    }

    fn exhausted(&self) -> bool {
        self.pos >= self.samples.len()
    }
}

async fn writer_task(
    track: Arc<TrackLocalStaticSample>,
    mut encoder: opus::Encoder,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut interval = tokio::time::interval(FRAME_DURATION);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut current: Option<ActiveClip> = None;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Play { samples, done }) => {
                    if let Some(old) = current.take() {
                        let _ = old.done.send(());
                    }
                    current = Some(ActiveClip { samples, pos: 0, done });
                }
                Some(Command::Stop) => {
                    if let Some(old) = current.take() {
                        let _ = old.done.send(());
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            _ = interval.tick() => {
                let mut frame = [0i16; FRAME_SAMPLES];
                if let Some(active) = current.as_mut() {
                    active.fill(&mut frame);
                    if active.exhausted() {
                        if let Some(finished) = current.take() {
                            let _ = finished.done.send(());
                        }
                    }
                }
                match encoder.encode_vec(&frame, MAX_PACKET) {
                    Ok(data) => {
                        let sample = Sample {
                            data: Bytes::from(data),
                            duration: FRAME_DURATION,
                            ..Default::default()
                        };
                        if let Err(e) = track.write_sample(&sample).await {
                            debug!("aux audio write failed: {}", e);
                        }
                    }
                    Err(e) => warn!("opus encode failed: {}", e),
                }
            }
        }
    }
    debug!("audio injector writer stopped");
}

/// Linear resample to 48 kHz with clamping to the i16 range
fn resample_to_48k(input: &[f32], from_rate: u32) -> Vec<i16> {
    let to_i16 = |v: f32| (v.clamp(-1.0, 1.0) * 32767.0) as i16;

    if input.is_empty() || from_rate == 0 {
        return Vec::new();
    }
    if from_rate == SAMPLE_RATE {
        return input.iter().copied().map(to_i16).collect();
    }

    let ratio = from_rate as f64 / SAMPLE_RATE as f64;
    let out_len = (input.len() as f64 / ratio).round() as usize;
    let last = input.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = input[idx];
            let b = input[(idx + 1).min(last)];
            to_i16(a + (b - a) * frac)
        })
        .collect()
}
