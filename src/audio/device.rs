// Microphone capture and speaker playback through cpal
//
// cpal streams are not Send on every platform, so each stream lives on a
// dedicated thread that owns it until told to stop. The device callbacks
// only copy samples into a channel or read from a shared buffer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::backend::{CaptureConfig, CaptureSource, PcmFrame};
use super::decode::{decode_clip, AudioClip};
use super::playback::{AudioPlayer, PlaybackControl, PlaybackEvent, PlaybackHandle, PlaybackId};
use crate::error::{DeviceError, Result, VoiceError};

fn build_error(e: cpal::BuildStreamError) -> DeviceError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            DeviceError::Unavailable("device disconnected".into())
        }
        other => DeviceError::Failed(other.to_string()),
    }
}

/// Default input device
pub struct MicrophoneSource {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneSource {
    pub fn new() -> Self {
        Self {
            stop_tx: None,
            thread: None,
        }
    }
}

impl Default for MicrophoneSource {
    fn default() -> Self {
        Self::new()
    }
}

fn input_config(device: &cpal::Device, sample_rate: u32) -> Result<cpal::SupportedStreamConfig> {
    let preferred = device
        .supported_input_configs()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .find(|c| c.min_sample_rate().0 <= sample_rate && c.max_sample_rate().0 >= sample_rate)
        .map(|c| c.with_sample_rate(cpal::SampleRate(sample_rate)));

    match preferred {
        Some(config) => Ok(config),
        None => device
            .default_input_config()
            .map_err(|e| DeviceError::Unavailable(e.to_string()).into()),
    }
}

fn run_input_stream(
    config: CaptureConfig,
    frames_tx: mpsc::UnboundedSender<PcmFrame>,
    ready_tx: oneshot::Sender<Result<()>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) {
    let opened = (|| -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| DeviceError::Unavailable("no default input device".into()))?;
        let supported = input_config(&device, config.sample_rate)?;
        let sample_format = supported.sample_format();
        let stream_config: cpal::StreamConfig = supported.into();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels;
        let started = Instant::now();

        info!(
            "Opening input device {} ({}Hz, {} channels, {:?})",
            device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate,
            channels,
            sample_format
        );

        let err_fn = |e| error!("Input stream error: {}", e);
        let stream = match sample_format {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = frames_tx.send(PcmFrame {
                        samples: data.to_vec(),
                        sample_rate,
                        channels,
                        timestamp_ms: started.elapsed().as_millis() as u64,
                    });
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let _ = frames_tx.send(PcmFrame {
                        samples: data.iter().map(|&s| s as f32 / 32768.0).collect(),
                        sample_rate,
                        channels,
                        timestamp_ms: started.elapsed().as_millis() as u64,
                    });
                },
                err_fn,
                None,
            ),
            other => {
                return Err(DeviceError::Failed(format!("unsupported sample format {other:?}")).into())
            }
        }
        .map_err(build_error)?;

        stream
            .play()
            .map_err(|e| DeviceError::Failed(e.to_string()))?;
        Ok(stream)
    })();

    match opened {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            // Blocks until stop() sends or drops the sender
            let _ = stop_rx.recv();
            drop(stream);
            info!("Input device released");
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

#[async_trait::async_trait]
impl CaptureSource for MicrophoneSource {
    async fn start(&mut self, config: &CaptureConfig) -> Result<mpsc::UnboundedReceiver<PcmFrame>> {
        if self.thread.is_some() {
            return Err(VoiceError::AlreadyRecording);
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel();
        let config = *config;

        let thread = std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || run_input_stream(config, frames_tx, ready_tx, stop_rx))
            .map_err(|e| DeviceError::Failed(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(thread);
                Ok(frames_rx)
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::Failed("capture thread exited".into()).into())
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| DeviceError::Failed(e.to_string()))?
                .map_err(|_| DeviceError::Failed("capture thread panicked".into()))?;
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.thread.is_some()
    }

    fn name(&self) -> &str {
        "microphone"
    }
}

/// Default output device
pub struct DevicePlayer {
    tick: Duration,
}

impl DevicePlayer {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(10)),
        }
    }
}

/// Silences the output callback at once, then wakes and joins the speaker
/// thread so the stream is dropped before `stop` returns.
struct DeviceControl {
    stopped: Arc<AtomicBool>,
    wake_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackControl for DeviceControl {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        drop(self.wake_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Speaker thread panicked");
            }
        }
    }
}

fn fill<T>(
    out: &mut [T],
    samples: &[f32],
    position: &AtomicUsize,
    stopped: &AtomicBool,
    convert: impl Fn(f32) -> T,
) {
    if stopped.load(Ordering::SeqCst) {
        for slot in out.iter_mut() {
            *slot = convert(0.0);
        }
        return;
    }
    let start = position.fetch_add(out.len(), Ordering::SeqCst);
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = convert(samples.get(start + i).copied().unwrap_or(0.0));
    }
}

fn open_output(
    samples: Arc<Vec<f32>>,
    position: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
    sample_rate: u32,
    channels: u16,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| DeviceError::Unavailable("no default output device".into()))?;
    let sample_format = device
        .default_output_config()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?
        .sample_format();
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let err_fn = |e| error!("Output stream error: {}", e);

    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_output_stream(
            &config,
            move |out: &mut [i16], _: &cpal::OutputCallbackInfo| {
                fill(out, &samples, &position, &stopped, super::artifact::to_pcm16)
            },
            err_fn,
            None,
        ),
        _ => device.build_output_stream(
            &config,
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                fill(out, &samples, &position, &stopped, |s| s)
            },
            err_fn,
            None,
        ),
    }
    .map_err(build_error)?;

    stream
        .play()
        .map_err(|e| DeviceError::Failed(e.to_string()))?;
    Ok(stream)
}

struct SpeakerJob {
    id: PlaybackId,
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    channels: u16,
    duration: Duration,
    tick: Duration,
    stopped: Arc<AtomicBool>,
    events: mpsc::Sender<PlaybackEvent>,
}

/// Owns the output stream until stopped or the clip is consumed.
///
/// Never blocks on `events`: the receiver is drained by the same task that
/// joins this thread on stop.
fn run_speaker(
    job: SpeakerJob,
    ready_tx: oneshot::Sender<Result<()>>,
    wake_rx: std::sync::mpsc::Receiver<()>,
) {
    let position = Arc::new(AtomicUsize::new(0));
    let total = job.samples.len();
    let per_second = job.sample_rate as f64 * job.channels.max(1) as f64;

    let stream = match open_output(
        job.samples,
        Arc::clone(&position),
        Arc::clone(&job.stopped),
        job.sample_rate,
        job.channels,
    ) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut ended = false;
    loop {
        match wake_rx.recv_timeout(job.tick) {
            Err(RecvTimeoutError::Timeout) => {}
            // Woken by stop()
            _ => break,
        }
        if job.stopped.load(Ordering::SeqCst) {
            break;
        }

        let consumed = position.load(Ordering::SeqCst).min(total);
        let event = if consumed >= total {
            ended = true;
            PlaybackEvent::Ended { id: job.id }
        } else {
            PlaybackEvent::Progress {
                id: job.id,
                position: Duration::from_secs_f64(consumed as f64 / per_second),
                duration: job.duration,
            }
        };

        match job.events.try_send(event) {
            Ok(()) if ended => break,
            Ok(()) => {}
            Err(TrySendError::Full(_)) if ended => {
                // Retry the end report on the next tick
                ended = false;
            }
            Err(TrySendError::Full(_)) => debug!("Dropping progress tick, receiver is behind"),
            Err(TrySendError::Closed(_)) => break,
        }
    }

    drop(stream);
    debug!("Output stream for {:?} released", job.id);
}

#[async_trait::async_trait]
impl AudioPlayer for DevicePlayer {
    async fn play(
        &mut self,
        id: PlaybackId,
        clip: AudioClip,
        events: mpsc::Sender<PlaybackEvent>,
    ) -> Result<PlaybackHandle> {
        let decoded = tokio::task::spawn_blocking(move || decode_clip(&clip))
            .await
            .map_err(|e| VoiceError::Decode(format!("decoder task failed: {e}")))??;
        let duration = decoded.duration();

        let stopped = Arc::new(AtomicBool::new(false));
        let job = SpeakerJob {
            id,
            samples: Arc::new(decoded.samples),
            sample_rate: decoded.sample_rate,
            channels: decoded.channels,
            duration,
            tick: self.tick,
            stopped: Arc::clone(&stopped),
            events,
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let (wake_tx, wake_rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("speaker".into())
            .spawn(move || run_speaker(job, ready_tx, wake_rx))
            .map_err(|e| DeviceError::Failed(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(PlaybackHandle::new(
                id,
                duration,
                Box::new(DeviceControl {
                    stopped,
                    wake_tx: Some(wake_tx),
                    thread: Some(thread),
                }),
            )),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                warn!("Speaker thread exited before opening the device");
                Err(DeviceError::Failed("speaker thread exited".into()).into())
            }
        }
    }
}
