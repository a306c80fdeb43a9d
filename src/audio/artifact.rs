use std::io::Cursor;
use std::time::Duration;

use crate::error::Result;

/// Size of the canonical PCM container header
pub const WAV_HEADER_LEN: usize = 44;

/// Finalized capture: canonical WAV header + 16-bit mono PCM data.
///
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioArtifact {
    bytes: Vec<u8>,
    sample_rate: u32,
    sample_count: usize,
}

impl AudioArtifact {
    /// Encode mono float samples at `sample_rate`.
    pub fn encode(samples: &[f32], sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut bytes = Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2);
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)?;
            for &sample in samples {
                writer.write_sample(to_pcm16(sample))?;
            }
            writer.finalize()?;
        }

        Ok(Self {
            bytes,
            sample_rate,
            sample_count: samples.len(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Total artifact size, header included
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// Length of the PCM data section
    pub fn data_len(&self) -> usize {
        self.sample_count * 2
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.sample_count as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Clamp to [-1, 1] and scale to i16, asymmetric around zero.
pub fn to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}
