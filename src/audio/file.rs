use std::path::{Path, PathBuf};
use std::time::Duration;

use hound::{SampleFormat, WavReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::backend::{CaptureConfig, CaptureSource, PcmFrame};
use crate::error::{DeviceError, Result, VoiceError};

/// Decoded WAV file, samples as f32 interleaved
pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        let duration_seconds =
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels.max(1) as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }
}

/// Capture source that replays a WAV file as a stream of frames
pub struct FileSource {
    path: PathBuf,
    /// Deliver frames at wall-clock speed instead of as fast as possible
    realtime: bool,
    task: Option<JoinHandle<()>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            realtime: false,
            task: None,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

#[async_trait::async_trait]
impl CaptureSource for FileSource {
    async fn start(&mut self, config: &CaptureConfig) -> Result<mpsc::UnboundedReceiver<PcmFrame>> {
        if self.task.is_some() {
            return Err(VoiceError::AlreadyRecording);
        }

        let audio = AudioFile::open(&self.path).map_err(|e| {
            DeviceError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;

        let channels = audio.channels.max(1);
        let frame_len = audio.sample_rate as usize * config.frame_ms.max(1) as usize / 1000
            * channels as usize;
        let frame_len = frame_len.max(channels as usize);
        let frame_duration = Duration::from_millis(config.frame_ms.max(1));
        let realtime = self.realtime;

        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            for (i, chunk) in audio.samples.chunks(frame_len).enumerate() {
                let frame = PcmFrame {
                    samples: chunk.to_vec(),
                    sample_rate: audio.sample_rate,
                    channels,
                    timestamp_ms: i as u64 * frame_duration.as_millis() as u64,
                };
                if tx.send(frame).is_err() {
                    break;
                }
                if realtime {
                    tokio::time::sleep(frame_duration).await;
                }
            }
        });

        self.task = Some(task);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        if self.realtime {
            // Stop mid-file: dropping the task drops the sender
            task.abort();
        }
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!("File source task failed: {}", e);
            }
        }

        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "wav file"
    }
}
