use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::decode::{probe_duration, AudioClip};
use crate::error::{Result, VoiceError};

/// Identifies one playback; events carrying another id are stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Periodic position report
    Progress {
        id: PlaybackId,
        position: Duration,
        duration: Duration,
    },
    /// Playback reached the end of the clip
    Ended { id: PlaybackId },
}

impl PlaybackEvent {
    pub fn id(&self) -> PlaybackId {
        match self {
            PlaybackEvent::Progress { id, .. } | PlaybackEvent::Ended { id } => *id,
        }
    }
}

/// Stops an output and releases its timers and buffers
pub trait PlaybackControl: Send {
    fn stop(&mut self);
}

/// The one active output. Stopping or dropping it releases the output.
pub struct PlaybackHandle {
    id: PlaybackId,
    duration: Duration,
    control: Option<Box<dyn PlaybackControl>>,
}

impl PlaybackHandle {
    pub fn new(id: PlaybackId, duration: Duration, control: Box<dyn PlaybackControl>) -> Self {
        Self {
            id,
            duration,
            control: Some(control),
        }
    }

    pub fn id(&self) -> PlaybackId {
        self.id
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn stop(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(mut control) = self.control.take() {
            debug!("Releasing playback {:?}", self.id);
            control.stop();
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PlaybackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackHandle")
            .field("id", &self.id)
            .field("duration", &self.duration)
            .finish()
    }
}

/// Audio output behind the orchestrator
///
/// Implementations:
/// - `ClockPlayer`: no device, progress driven by a timer
/// - `DevicePlayer`: default output device via cpal (`device-audio` feature)
#[async_trait]
pub trait AudioPlayer: Send {
    /// Start playing `clip`, reporting progress on `events`
    async fn play(
        &mut self,
        id: PlaybackId,
        clip: AudioClip,
        events: mpsc::Sender<PlaybackEvent>,
    ) -> Result<PlaybackHandle>;
}

/// Headless player: emits progress against the clip's decoded duration
pub struct ClockPlayer {
    tick: Duration,
}

impl ClockPlayer {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(1)),
        }
    }
}

impl Default for ClockPlayer {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

struct TaskControl(JoinHandle<()>);

impl PlaybackControl for TaskControl {
    fn stop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl AudioPlayer for ClockPlayer {
    async fn play(
        &mut self,
        id: PlaybackId,
        clip: AudioClip,
        events: mpsc::Sender<PlaybackEvent>,
    ) -> Result<PlaybackHandle> {
        let duration = tokio::task::spawn_blocking(move || probe_duration(&clip))
            .await
            .map_err(|e| VoiceError::Decode(format!("decoder task failed: {e}")))??;
        let tick = self.tick;

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut interval = tokio::time::interval(tick);

            loop {
                interval.tick().await;
                let position = started.elapsed().min(duration);

                if position >= duration {
                    let _ = events.send(PlaybackEvent::Ended { id }).await;
                    break;
                }

                let progress = PlaybackEvent::Progress {
                    id,
                    position,
                    duration,
                };
                if events.send(progress).await.is_err() {
                    break;
                }
            }
        });

        Ok(PlaybackHandle::new(id, duration, Box::new(TaskControl(task))))
    }
}
