pub mod artifact;
pub mod backend;
pub mod capture;
pub mod decode;
pub mod file;
pub mod playback;

#[cfg(feature = "device-audio")]
pub mod device;

pub use artifact::{to_pcm16, AudioArtifact, WAV_HEADER_LEN};
pub use backend::{CaptureConfig, CaptureSource, PcmFrame};
pub use capture::AudioCaptureEngine;
pub use decode::{decode_clip, probe_duration, AudioClip, DecodedAudio, DEFAULT_MEDIA_TYPE};
pub use file::{AudioFile, FileSource};
pub use playback::{
    AudioPlayer, ClockPlayer, PlaybackControl, PlaybackEvent, PlaybackHandle, PlaybackId,
};

#[cfg(feature = "device-audio")]
pub use device::{DevicePlayer, MicrophoneSource};
