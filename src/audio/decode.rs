//! Decoding of synthesized reply audio.

use std::io::Cursor;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use crate::error::{Result, VoiceError};

pub const DEFAULT_MEDIA_TYPE: &str = "audio/mpeg";

/// Encoded reply audio as received from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        Self {
            bytes,
            media_type: media_type.into(),
        }
    }

    pub fn mpeg(bytes: Vec<u8>) -> Self {
        Self::new(bytes, DEFAULT_MEDIA_TYPE)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn extension(&self) -> Option<&'static str> {
        match self.media_type.as_str() {
            "audio/mpeg" | "audio/mp3" => Some("mp3"),
            "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
            "audio/ogg" => Some("ogg"),
            "audio/flac" => Some("flac"),
            "audio/aac" | "audio/mp4" => Some("m4a"),
            _ => None,
        }
    }
}

/// Interleaved f32 PCM
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Decode a clip to PCM
pub fn decode_clip(clip: &AudioClip) -> Result<DecodedAudio> {
    if clip.is_empty() {
        return Err(VoiceError::Decode("empty audio clip".into()));
    }

    let mut hint = Hint::new();
    if let Some(ext) = clip.extension() {
        hint.with_extension(ext);
    }

    let media_source = MediaSourceStream::new(
        Box::new(Cursor::new(clip.bytes.clone())),
        Default::default(),
    );
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            media_source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| VoiceError::Decode(format!("probe failed: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| VoiceError::Decode("no default audio track".into()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| VoiceError::Decode(format!("no decoder: {e}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                return Err(VoiceError::Decode("stream reset is not supported".into()));
            }
            Err(err) => return Err(VoiceError::Decode(format!("reading packets: {err}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(err) => return Err(VoiceError::Decode(format!("decoding packet: {err}"))),
        };

        if sample_rate == 0 {
            sample_rate = decoded.spec().rate;
        }
        if channels == 0 {
            channels = decoded.spec().channels.count() as u16;
        }

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    if sample_rate == 0 || channels == 0 {
        return Err(VoiceError::Decode("missing stream parameters".into()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Playback duration of a clip
pub fn probe_duration(clip: &AudioClip) -> Result<Duration> {
    Ok(decode_clip(clip)?.duration())
}
