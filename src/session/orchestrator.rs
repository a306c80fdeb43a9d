use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::caption::CaptionState;
use super::epoch::Epoch;
use super::exchange::{ExchangeEvent, SpeechSource, TurnExchange};
use super::turn::ConversationTurn;
use crate::audio::{
    AudioCaptureEngine, AudioClip, AudioPlayer, CaptureConfig, PlaybackEvent, PlaybackHandle,
    PlaybackId,
};
use crate::error::{Notice, NoticeKind, Result, VoiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Recording,
    Awaiting,
    Speaking,
    Replaying,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Recording => "recording",
            TurnState::Awaiting => "awaiting a reply",
            TurnState::Speaking => "speaking",
            TurnState::Replaying => "replaying",
        }
    }
}

/// User intents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    BeginCapture,
    EndCapture,
    Cancel,
    /// Replay a past turn's reply; selecting the replaying turn again stops it
    SelectReplay(usize),
    StopPlayback,
    DeleteTurn(usize),
    ClearAll,
    /// Re-open the exchange transport after it closed
    Reconnect,
}

/// Everything the orchestrator reacts to, in arrival order
#[derive(Debug)]
pub enum Input {
    Command(Command),
    Exchange { epoch: Epoch, event: ExchangeEvent },
    /// Synthesized audio for a replay request
    Replay {
        epoch: Epoch,
        turn: usize,
        result: Result<AudioClip>,
    },
    /// The capture tail after `EndCapture` has elapsed
    FinishCapture { epoch: Epoch },
    Shutdown,
}

/// Outbound notifications for whatever renders the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: TurnState, to: TurnState },
    TurnAppended(ConversationTurn),
    TurnsChanged { count: usize },
    Caption(CaptionState),
    Status(String),
    Notice(Notice),
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub capture: CaptureConfig,
    /// Artifacts smaller than this are rejected as too short
    pub min_artifact_bytes: usize,
    /// Keep capturing this long after `EndCapture` so trailing speech is kept
    pub capture_tail: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            min_artifact_bytes: 100,
            capture_tail: Duration::ZERO,
        }
    }
}

/// Cloneable sender of commands into a running orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    inputs: mpsc::UnboundedSender<Input>,
}

impl OrchestratorHandle {
    pub fn new(inputs: mpsc::UnboundedSender<Input>) -> Self {
        Self { inputs }
    }

    /// Returns false once the orchestrator is gone
    pub fn send(&self, command: Command) -> bool {
        self.inputs.send(Input::Command(command)).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.inputs.send(Input::Shutdown).is_ok()
    }
}

struct PendingTurn {
    epoch: Epoch,
    user_text: String,
    agent_text: String,
    committed: bool,
}

/// Sequences capture, exchange, playback and caption sync for one session.
///
/// All state is owned by the one task driving `run` (or calling `dispatch`
/// directly); capture callbacks, exchange answers and playback progress only
/// reach it as queued inputs. Every message is tagged with the epoch it was
/// requested under and is ignored unless that epoch is still live.
pub struct TurnOrchestrator {
    config: OrchestratorConfig,
    engine: AudioCaptureEngine,
    exchange: Box<dyn TurnExchange>,
    speech: Arc<dyn SpeechSource>,
    player: Box<dyn AudioPlayer>,

    inputs: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<SessionEvent>,
    playback_tx: mpsc::Sender<PlaybackEvent>,
    playback_rx: Option<mpsc::Receiver<PlaybackEvent>>,

    state: TurnState,
    epoch: Epoch,
    turns: Vec<ConversationTurn>,
    pending: Option<PendingTurn>,
    caption: Option<CaptionState>,
    playback: Option<PlaybackHandle>,
    playback_seq: u64,
    replaying: Option<usize>,
    /// `EndCapture` seen, waiting out the capture tail
    finishing: bool,
}

impl TurnOrchestrator {
    /// `inputs` must be the sender half of the channel later passed to `run`
    pub fn new(
        config: OrchestratorConfig,
        engine: AudioCaptureEngine,
        exchange: Box<dyn TurnExchange>,
        speech: Arc<dyn SpeechSource>,
        player: Box<dyn AudioPlayer>,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::channel(64);

        let orchestrator = Self {
            config,
            engine,
            exchange,
            speech,
            player,
            inputs,
            events,
            playback_tx,
            playback_rx: Some(playback_rx),
            state: TurnState::Idle,
            epoch: Epoch::ZERO,
            turns: Vec::new(),
            pending: None,
            caption: None,
            playback: None,
            playback_seq: 0,
            replaying: None,
            finishing: false,
        };

        (orchestrator, events_rx)
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle::new(self.inputs.clone())
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn caption(&self) -> Option<&CaptionState> {
        self.caption.as_ref()
    }

    pub fn active_playback(&self) -> Option<PlaybackId> {
        self.playback.as_ref().map(PlaybackHandle::id)
    }

    /// Index of the turn being replayed
    pub fn replaying(&self) -> Option<usize> {
        self.replaying
    }

    /// Drain inputs and playback events until `Shutdown` or every sender is gone
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) -> Self {
        let Some(mut playback_rx) = self.playback_rx.take() else {
            error!("Orchestrator is already running");
            return self;
        };

        info!("Voice session started ({} exchange)", self.exchange.name());

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(Input::Shutdown) | None => break,
                    Some(input) => self.dispatch(input).await,
                },
                Some(event) = playback_rx.recv() => self.handle_playback(event),
            }
        }

        self.shutdown().await;
        self.playback_rx = Some(playback_rx);
        info!("Voice session ended with {} turn(s)", self.turns.len());
        self
    }

    /// Apply one input
    pub async fn dispatch(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.command(command).await,
            Input::Exchange { epoch, event } => self.on_exchange(epoch, event).await,
            Input::Replay {
                epoch,
                turn,
                result,
            } => self.on_replay_audio(epoch, turn, result).await,
            Input::FinishCapture { epoch } => self.on_capture_tail(epoch).await,
            Input::Shutdown => self.shutdown().await,
        }
    }

    async fn command(&mut self, command: Command) {
        debug!("Command {:?} in state {:?}", command, self.state);
        match command {
            Command::BeginCapture => self.begin_capture().await,
            Command::EndCapture => self.end_capture().await,
            Command::Cancel => self.cancel().await,
            Command::SelectReplay(index) => self.select_replay(index),
            Command::StopPlayback => self.stop_playback(),
            Command::DeleteTurn(index) => self.delete_turn(index),
            Command::ClearAll => self.clear_all(),
            Command::Reconnect => self.reconnect().await,
        }
    }

    async fn begin_capture(&mut self) {
        match self.state {
            TurnState::Recording | TurnState::Awaiting => {
                return self.report(VoiceError::Busy {
                    state: self.state.as_str(),
                })
            }
            TurnState::Replaying => self.advance_epoch(),
            TurnState::Idle | TurnState::Speaking => {}
        }

        self.release_playback();
        self.replaying = None;

        match self.engine.start(self.config.capture).await {
            Ok(()) => self.set_state(TurnState::Recording),
            Err(e) => {
                self.report(e);
                self.set_state(TurnState::Idle);
            }
        }
    }

    async fn end_capture(&mut self) {
        if self.state != TurnState::Recording {
            return self.report(VoiceError::NotRecording);
        }

        if self.config.capture_tail.is_zero() {
            return self.finish_capture().await;
        }
        if self.finishing {
            debug!("Capture is already finishing");
            return;
        }

        // Keep the device open for the tail; other inputs are handled meanwhile
        self.finishing = true;
        let epoch = self.epoch;
        let tail = self.config.capture_tail;
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tail).await;
            let _ = inputs.send(Input::FinishCapture { epoch });
        });
    }

    async fn on_capture_tail(&mut self, epoch: Epoch) {
        if epoch != self.epoch || !self.finishing || self.state != TurnState::Recording {
            debug!("Discarding capture tail from epoch {}", epoch);
            return;
        }
        self.finish_capture().await;
    }

    async fn finish_capture(&mut self) {
        self.finishing = false;

        let artifact = match self.engine.stop().await {
            Ok(artifact) => artifact,
            Err(e) => {
                self.report(e);
                return self.set_state(TurnState::Idle);
            }
        };

        if artifact.len() < self.config.min_artifact_bytes {
            self.report(VoiceError::RecordingTooShort {
                bytes: artifact.len(),
                threshold: self.config.min_artifact_bytes,
            });
            return self.set_state(TurnState::Idle);
        }

        self.advance_epoch();
        let epoch = self.epoch;
        self.pending = Some(PendingTurn {
            epoch,
            user_text: String::new(),
            agent_text: String::new(),
            committed: false,
        });
        self.set_state(TurnState::Awaiting);

        info!(
            "Submitting {} bytes via {} exchange (epoch {})",
            artifact.len(),
            self.exchange.name(),
            epoch
        );
        if let Err(e) = self.exchange.submit(epoch, artifact).await {
            self.pending = None;
            self.report(e);
            self.set_state(TurnState::Idle);
        }
    }

    async fn cancel(&mut self) {
        self.advance_epoch();
        self.finishing = false;

        if self.engine.is_recording() {
            if let Err(e) = self.engine.abort().await {
                self.report(e);
            }
        }
        self.release_playback();
        self.exchange.cancel().await;
        self.replaying = None;

        info!("Cancelled; now at epoch {}", self.epoch);
        self.set_state(TurnState::Idle);
    }

    fn select_replay(&mut self, index: usize) {
        match self.state {
            TurnState::Recording | TurnState::Awaiting => {
                return self.report(VoiceError::Busy {
                    state: self.state.as_str(),
                })
            }
            TurnState::Replaying if self.replaying == Some(index) => {
                self.advance_epoch();
                self.release_playback();
                self.replaying = None;
                return self.set_state(TurnState::Idle);
            }
            _ => {}
        }

        let Some(turn) = self.turns.get(index) else {
            return self.notify(Notice::new(
                NoticeKind::Playback,
                format!("There is no turn {index}"),
            ));
        };
        if turn.agent_text.is_empty() {
            return self.notify(Notice::new(
                NoticeKind::Playback,
                format!("Turn {index} has no reply to replay"),
            ));
        }
        let text = turn.agent_text.clone();

        self.release_playback();
        self.advance_epoch();
        self.replaying = Some(index);
        self.set_state(TurnState::Replaying);

        let epoch = self.epoch;
        let speech = Arc::clone(&self.speech);
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = speech.synthesize(&text).await;
            let _ = inputs.send(Input::Replay {
                epoch,
                turn: index,
                result,
            });
        });
    }

    async fn on_replay_audio(&mut self, epoch: Epoch, turn: usize, result: Result<AudioClip>) {
        if epoch != self.epoch || self.state != TurnState::Replaying {
            debug!("Discarding replay audio for turn {} from epoch {}", turn, epoch);
            return;
        }

        let started = match result {
            Ok(clip) => self.start_playback(clip).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.report(e);
            self.replaying = None;
            self.set_state(TurnState::Idle);
        }
    }

    fn stop_playback(&mut self) {
        match self.state {
            TurnState::Speaking => {}
            TurnState::Replaying => self.advance_epoch(),
            _ => return,
        }
        self.release_playback();
        self.replaying = None;
        self.set_state(TurnState::Idle);
    }

    fn delete_turn(&mut self, index: usize) {
        if index >= self.turns.len() {
            warn!("Delete of turn {} ignored, {} turn(s) exist", index, self.turns.len());
            return;
        }
        self.turns.remove(index);

        match self.replaying {
            Some(replaying) if replaying == index => {
                self.advance_epoch();
                self.release_playback();
                self.replaying = None;
                if self.state == TurnState::Replaying {
                    self.set_state(TurnState::Idle);
                }
            }
            Some(replaying) if replaying > index => self.replaying = Some(replaying - 1),
            _ => {}
        }

        self.emit(SessionEvent::TurnsChanged {
            count: self.turns.len(),
        });
    }

    fn clear_all(&mut self) {
        self.turns.clear();
        if self.state == TurnState::Replaying {
            self.advance_epoch();
        }
        self.release_playback();
        self.replaying = None;
        if matches!(self.state, TurnState::Speaking | TurnState::Replaying) {
            self.set_state(TurnState::Idle);
        }

        self.emit(SessionEvent::TurnsChanged { count: 0 });
    }

    async fn reconnect(&mut self) {
        if self.state != TurnState::Idle {
            return self.report(VoiceError::Busy {
                state: self.state.as_str(),
            });
        }
        match self.exchange.reconnect().await {
            Ok(()) => self.emit(SessionEvent::Status("Reconnected".into())),
            Err(e) => self.report(e),
        }
    }

    async fn shutdown(&mut self) {
        self.finishing = false;
        if self.engine.is_recording() {
            if let Err(e) = self.engine.abort().await {
                warn!("Failed to abort capture on shutdown: {}", e);
            }
        }
        self.release_playback();
        self.exchange.cancel().await;
        self.advance_epoch();
        self.replaying = None;
        self.set_state(TurnState::Idle);
    }

    async fn on_exchange(&mut self, epoch: Epoch, event: ExchangeEvent) {
        if epoch != self.epoch {
            debug!("Discarding stale {:?} from epoch {}", event, epoch);
            return;
        }

        match event {
            ExchangeEvent::Status(message) => self.emit(SessionEvent::Status(message)),
            ExchangeEvent::Transcript(text) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.user_text = text;
                }
            }
            ExchangeEvent::Response(text) => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.agent_text = text.clone();
                }
                self.commit_turn();
                let caption = CaptionState::new(text);
                self.emit(SessionEvent::Caption(caption.clone()));
                self.caption = Some(caption);
            }
            ExchangeEvent::Audio(clip) => {
                self.commit_turn();
                if self.state != TurnState::Awaiting {
                    debug!("Reply audio arrived while {}", self.state.as_str());
                    return;
                }
                match self.start_playback(clip).await {
                    Ok(()) => self.set_state(TurnState::Speaking),
                    Err(e) => self.report(e),
                }
            }
            ExchangeEvent::Finished => {
                self.commit_turn();
                self.pending = None;
                if self.state == TurnState::Awaiting {
                    self.set_state(TurnState::Idle);
                }
            }
            ExchangeEvent::Failed(notice) => {
                self.commit_turn();
                self.pending = None;
                self.notify(notice);
                if self.state == TurnState::Awaiting {
                    self.set_state(TurnState::Idle);
                }
            }
        }
    }

    /// Apply playback progress; events for anything but the active output are ignored
    pub fn handle_playback(&mut self, event: PlaybackEvent) {
        if self.active_playback() != Some(event.id()) {
            debug!("Ignoring event for inactive playback {:?}", event.id());
            return;
        }

        match event {
            PlaybackEvent::Progress {
                position, duration, ..
            } => {
                if self.state != TurnState::Speaking {
                    return;
                }
                if let Some(caption) = self.caption.as_mut() {
                    caption.update(position, duration);
                    let snapshot = caption.clone();
                    self.emit(SessionEvent::Caption(snapshot));
                }
            }
            PlaybackEvent::Ended { id } => {
                debug!("Playback {:?} ended", id);
                self.release_playback();
                if self.state == TurnState::Speaking {
                    if let Some(caption) = self.caption.as_mut() {
                        caption.complete();
                        let snapshot = caption.clone();
                        self.emit(SessionEvent::Caption(snapshot));
                    }
                }
                self.replaying = None;
                if matches!(self.state, TurnState::Speaking | TurnState::Replaying) {
                    self.set_state(TurnState::Idle);
                }
            }
        }
    }

    /// Release whatever is playing, then start `clip` as the only output
    async fn start_playback(&mut self, clip: AudioClip) -> Result<()> {
        self.release_playback();

        self.playback_seq += 1;
        let id = PlaybackId(self.playback_seq);
        let handle = self
            .player
            .play(id, clip, self.playback_tx.clone())
            .await?;

        info!(
            "Playing {:?} ({:.1}s)",
            id,
            handle.duration().as_secs_f64()
        );
        self.playback = Some(handle);
        Ok(())
    }

    fn release_playback(&mut self) {
        if let Some(handle) = self.playback.take() {
            handle.stop();
        }
    }

    fn commit_turn(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.committed {
            return;
        }
        pending.committed = true;

        let turn = ConversationTurn::new(
            pending.user_text.clone(),
            pending.agent_text.clone(),
            pending.epoch,
        );
        match turn {
            Some(turn) => {
                info!("Turn {} committed (epoch {})", self.turns.len(), turn.epoch);
                self.turns.push(turn.clone());
                self.emit(SessionEvent::TurnAppended(turn));
            }
            None => debug!("Empty exchange, no turn recorded"),
        }
    }

    /// Invalidate everything tagged with the current epoch
    fn advance_epoch(&mut self) {
        self.epoch = self.epoch.next();
        self.pending = None;
    }

    fn set_state(&mut self, next: TurnState) {
        if self.state == next {
            return;
        }
        debug!("State {:?} -> {:?}", self.state, next);
        let from = std::mem::replace(&mut self.state, next);
        self.emit(SessionEvent::StateChanged { from, to: next });
    }

    fn report(&mut self, err: VoiceError) {
        match err.notice() {
            Some(notice) => self.notify(notice),
            None => debug!("Silent error: {}", err),
        }
    }

    fn notify(&mut self, notice: Notice) {
        warn!("{:?}: {}", notice.kind, notice.message);
        self.emit(SessionEvent::Notice(notice));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
