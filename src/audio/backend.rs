use tokio::sync::mpsc;

use crate::error::{Result, VoiceError};

/// Chunk of captured samples as delivered by a capture source
#[derive(Debug, Clone)]
pub struct PcmFrame {
    /// Raw samples (f32, nominal range [-1, 1], interleaved)
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl PcmFrame {
    pub fn mono(samples: Vec<f32>, sample_rate: u32, timestamp_ms: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
            timestamp_ms,
        }
    }
}

/// Capture format requested from a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Target sample rate in Hz
    pub sample_rate: u32,
    /// Channel count of the finalized artifact (always 1)
    pub channels: u16,
    /// Bit depth of the finalized artifact (always 16)
    pub bit_depth: u16,
    /// Frame size in milliseconds (affects latency)
    pub frame_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
            frame_ms: 100,
        }
    }
}

impl CaptureConfig {
    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(VoiceError::InvalidConfig("sample rate must be positive".into()));
        }
        if self.channels != 1 {
            return Err(VoiceError::InvalidConfig(format!(
                "only mono capture is supported, got {} channels",
                self.channels
            )));
        }
        if self.bit_depth != 16 {
            return Err(VoiceError::InvalidConfig(format!(
                "only 16-bit artifacts are supported, got {} bits",
                self.bit_depth
            )));
        }
        Ok(())
    }

    /// Samples per frame at the configured rate
    pub fn frame_len(&self) -> usize {
        ((self.sample_rate as u64 * self.frame_ms.max(1)) / 1000).max(1) as usize
    }
}

/// Push-based frame source behind the capture engine
///
/// Implementations:
/// - `FileSource`: replays a WAV file (tests, batch use)
/// - `MicrophoneSource`: default input device via cpal (`device-audio` feature)
///
/// The delivery path must only push into the returned channel: it never
/// blocks on network or UI work. Frames are delivered in capture order and
/// the channel closes once `stop` has released the device.
#[async_trait::async_trait]
pub trait CaptureSource: Send + Sync {
    /// Acquire the device exclusively and start delivering frames
    async fn start(&mut self, config: &CaptureConfig) -> Result<mpsc::UnboundedReceiver<PcmFrame>>;

    /// Halt delivery and release the device
    async fn stop(&mut self) -> Result<()>;

    /// Check if the source is currently capturing
    fn is_capturing(&self) -> bool;

    /// Source name for logging
    fn name(&self) -> &str;
}
