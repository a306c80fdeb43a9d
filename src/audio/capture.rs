use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::artifact::AudioArtifact;
use super::backend::{CaptureConfig, CaptureSource, PcmFrame};
use crate::error::{DeviceError, Result, VoiceError};

/// Owns a capture source and turns one start/stop cycle into an artifact.
///
/// At most one recording session exists at a time; `start` while a session
/// is active fails with `AlreadyRecording` rather than queuing.
pub struct AudioCaptureEngine {
    source: Box<dyn CaptureSource>,
    session: Option<RecordingSession>,
}

/// Transient state between `start` and `stop`
struct RecordingSession {
    config: CaptureConfig,
    started_at: DateTime<Utc>,
    /// Drains the source channel into an ordered frame buffer
    collector: JoinHandle<Vec<PcmFrame>>,
}

impl AudioCaptureEngine {
    pub fn new(source: Box<dyn CaptureSource>) -> Self {
        Self {
            source,
            session: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Acquire the input device and start buffering frames
    pub async fn start(&mut self, config: CaptureConfig) -> Result<()> {
        if self.session.is_some() {
            return Err(VoiceError::AlreadyRecording);
        }
        config.validate()?;

        info!(
            "Starting capture from {} ({}Hz)",
            self.source.name(),
            config.sample_rate
        );

        let frames_rx = self.source.start(&config).await?;
        let collector = tokio::spawn(collect_frames(frames_rx));

        self.session = Some(RecordingSession {
            config,
            started_at: Utc::now(),
            collector,
        });

        Ok(())
    }

    /// Halt delivery, release the device and finalize the buffered frames
    pub async fn stop(&mut self) -> Result<AudioArtifact> {
        let session = self.session.take().ok_or(VoiceError::NotRecording)?;
        let config = session.config;
        let frames = self.release(session).await?;

        let mut samples = Vec::new();
        for frame in frames {
            samples.extend(normalize_frame(frame, config.sample_rate));
        }

        let artifact = AudioArtifact::encode(&samples, config.sample_rate)?;

        info!(
            "Capture finalized: {:.2}s, {} bytes",
            artifact.duration().as_secs_f64(),
            artifact.len()
        );

        Ok(artifact)
    }

    /// Stop capturing and discard everything buffered so far
    pub async fn abort(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let frames = self.release(session).await?;
        info!("Capture aborted, discarded {} frames", frames.len());
        Ok(())
    }

    /// Release the device on every path, then collect what was buffered
    async fn release(&mut self, session: RecordingSession) -> Result<Vec<PcmFrame>> {
        let elapsed = Utc::now().signed_duration_since(session.started_at);

        if let Err(e) = self.source.stop().await {
            error!("Failed to stop {}: {}", self.source.name(), e);
            session.collector.abort();
            return Err(e);
        }

        let frames = session
            .collector
            .await
            .map_err(|e| DeviceError::Failed(format!("frame collector failed: {e}")))?;

        info!(
            "Capture from {} released after {:.1}s ({} frames)",
            self.source.name(),
            elapsed.num_milliseconds() as f64 / 1000.0,
            frames.len()
        );

        Ok(frames)
    }
}

impl Drop for AudioCaptureEngine {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("Capture engine dropped while recording; discarding frames");
            session.collector.abort();
        }
    }
}

async fn collect_frames(mut frames_rx: mpsc::UnboundedReceiver<PcmFrame>) -> Vec<PcmFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = frames_rx.recv().await {
        frames.push(frame);
    }
    frames
}

/// Bring a frame to mono at the target rate
fn normalize_frame(frame: PcmFrame, target_sample_rate: u32) -> Vec<f32> {
    let mut processed = frame;

    if processed.channels > 1 {
        processed = downmix_to_mono(processed);
    }

    if processed.sample_rate != target_sample_rate {
        processed = downsample_frame(processed, target_sample_rate);
    }

    processed.samples
}

/// Average interleaved channels into one
fn downmix_to_mono(frame: PcmFrame) -> PcmFrame {
    let channels = frame.channels.max(1) as usize;
    let mono_samples = frame
        .samples
        .chunks_exact(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect();

    PcmFrame {
        samples: mono_samples,
        sample_rate: frame.sample_rate,
        channels: 1,
        timestamp_ms: frame.timestamp_ms,
    }
}

/// Downsample by decimation
fn downsample_frame(frame: PcmFrame, target_rate: u32) -> PcmFrame {
    let ratio = frame.sample_rate / target_rate.max(1);
    if ratio <= 1 || frame.sample_rate % target_rate != 0 {
        warn!(
            "Cannot convert {}Hz frame to {}Hz; keeping samples as-is",
            frame.sample_rate, target_rate
        );
        return frame;
    }

    PcmFrame {
        samples: frame.samples.iter().step_by(ratio as usize).copied().collect(),
        sample_rate: target_rate,
        channels: frame.channels,
        timestamp_ms: frame.timestamp_ms,
    }
}
