// Integration tests for the turn orchestrator
//
// Most tests drive the state machine directly with fake exchange, speech and
// player implementations; the last ones run the full event loop against the
// mock backend.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_voice::audio::{
    AudioArtifact, AudioCaptureEngine, AudioClip, AudioPlayer, CaptureConfig, CaptureSource,
    ClockPlayer, PcmFrame, PlaybackControl, PlaybackEvent, PlaybackHandle, PlaybackId,
};
use agent_voice::error::{DeviceError, Notice, NoticeKind, Result as VoiceResult, VoiceError};
use agent_voice::protocol::{BackendClient, ClientConfig, ConnectionState, ProtocolClient};
use agent_voice::session::{
    Command, Epoch, ExchangeEvent, Input, OrchestratorConfig, RequestExchange, SessionEvent,
    SpeechSource, StreamingExchange, TurnExchange, TurnOrchestrator, TurnState,
};
use anyhow::Result;
use async_trait::async_trait;
use common::{within, MockBackend, Mode, AGENT_TEXT, TOKEN, USER_TEXT};
use tokio::sync::mpsc;

/// Delivers `seconds` of low-level tone on every start
struct ToneSource {
    seconds: f64,
    capturing: bool,
}

impl ToneSource {
    fn new(seconds: f64) -> Self {
        Self {
            seconds,
            capturing: false,
        }
    }
}

#[async_trait]
impl CaptureSource for ToneSource {
    async fn start(&mut self, config: &CaptureConfig) -> VoiceResult<mpsc::UnboundedReceiver<PcmFrame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let total = (self.seconds * config.sample_rate as f64) as usize;
        let samples: Vec<f32> = (0..total).map(|i| ((i % 40) as f32 - 20.0) / 200.0).collect();
        for (i, chunk) in samples.chunks(config.frame_len()).enumerate() {
            let _ = tx.send(PcmFrame::mono(chunk.to_vec(), config.sample_rate, i as u64 * 100));
        }
        self.capturing = true;
        Ok(rx)
    }

    async fn stop(&mut self) -> VoiceResult<()> {
        self.capturing = false;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn name(&self) -> &str {
        "tone"
    }
}

#[derive(Clone, Default)]
struct FakeExchange {
    submitted: Arc<Mutex<Vec<(Epoch, usize)>>>,
    cancels: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl TurnExchange for FakeExchange {
    async fn submit(&self, epoch: Epoch, artifact: AudioArtifact) -> VoiceResult<()> {
        if self.fail {
            return Err(VoiceError::NotConnected {
                state: ConnectionState::Closed,
            });
        }
        self.submitted.lock().unwrap().push((epoch, artifact.len()));
        Ok(())
    }

    async fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[derive(Clone, Default)]
struct FakeSpeech {
    requests: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

#[async_trait]
impl SpeechSource for FakeSpeech {
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioClip> {
        self.requests.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(VoiceError::Backend {
                status: 500,
                detail: "TTS unavailable".into(),
            });
        }
        Ok(AudioClip::new(vec![1, 2, 3], "audio/wav"))
    }
}

struct FakeControl(Arc<AtomicBool>);

impl PlaybackControl for FakeControl {
    fn stop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Records every playback and whether it has been released
#[derive(Clone, Default)]
struct FakePlayer {
    plays: Arc<Mutex<Vec<(PlaybackId, Arc<AtomicBool>)>>>,
}

impl FakePlayer {
    fn released(&self) -> Vec<bool> {
        self.plays
            .lock()
            .unwrap()
            .iter()
            .map(|(_, stopped)| stopped.load(Ordering::SeqCst))
            .collect()
    }
}

#[async_trait]
impl AudioPlayer for FakePlayer {
    async fn play(
        &mut self,
        id: PlaybackId,
        _clip: AudioClip,
        _events: mpsc::Sender<PlaybackEvent>,
    ) -> VoiceResult<PlaybackHandle> {
        let stopped = Arc::new(AtomicBool::new(false));
        self.plays.lock().unwrap().push((id, Arc::clone(&stopped)));
        Ok(PlaybackHandle::new(
            id,
            Duration::from_secs(2),
            Box::new(FakeControl(stopped)),
        ))
    }
}

struct Harness {
    orchestrator: TurnOrchestrator,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    inputs: mpsc::UnboundedReceiver<Input>,
    exchange: FakeExchange,
    speech: FakeSpeech,
    player: FakePlayer,
}

impl Harness {
    fn new() -> Self {
        Self::build(0.6, FakeExchange::default(), FakeSpeech::default())
    }

    fn build(seconds: f64, exchange: FakeExchange, speech: FakeSpeech) -> Self {
        Self::with_config(OrchestratorConfig::default(), seconds, exchange, speech)
    }

    fn with_config(
        config: OrchestratorConfig,
        seconds: f64,
        exchange: FakeExchange,
        speech: FakeSpeech,
    ) -> Self {
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let player = FakePlayer::default();
        let (orchestrator, events) = TurnOrchestrator::new(
            config,
            AudioCaptureEngine::new(Box::new(ToneSource::new(seconds))),
            Box::new(exchange.clone()),
            Arc::new(speech.clone()),
            Box::new(player.clone()),
            inputs_tx,
        );

        Self {
            orchestrator,
            events,
            inputs,
            exchange,
            speech,
            player,
        }
    }

    async fn command(&mut self, command: Command) {
        self.orchestrator.dispatch(Input::Command(command)).await;
    }

    async fn answer(&mut self, epoch: Epoch, event: ExchangeEvent) {
        self.orchestrator
            .dispatch(Input::Exchange { epoch, event })
            .await;
    }

    /// Forward the next queued input (replay audio or a capture tail)
    async fn pump_input(&mut self) {
        let input = within(self.inputs.recv()).await.expect("input channel open");
        self.orchestrator.dispatch(input).await;
    }

    fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn notices(&mut self) -> Vec<Notice> {
        self.drain()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Notice(notice) => Some(notice),
                _ => None,
            })
            .collect()
    }

    async fn capture(&mut self) -> Epoch {
        self.command(Command::BeginCapture).await;
        self.command(Command::EndCapture).await;
        self.orchestrator.epoch()
    }

    /// Capture and receive a full spoken reply; ends in `Speaking`
    async fn spoken_turn(&mut self, user: &str, agent: &str) -> Epoch {
        let epoch = self.capture().await;
        self.answer(epoch, ExchangeEvent::Transcript(user.into())).await;
        self.answer(epoch, ExchangeEvent::Response(agent.into())).await;
        self.answer(epoch, ExchangeEvent::Audio(AudioClip::mpeg(vec![0; 8]))).await;
        self.answer(epoch, ExchangeEvent::Finished).await;
        epoch
    }

    fn end_playback(&mut self) {
        let id = self.orchestrator.active_playback().expect("playing");
        self.orchestrator.handle_playback(PlaybackEvent::Ended { id });
    }
}

#[tokio::test]
async fn test_capture_is_submitted_under_new_epoch() {
    let mut h = Harness::new();

    h.command(Command::BeginCapture).await;
    assert_eq!(h.orchestrator.state(), TurnState::Recording);

    h.command(Command::EndCapture).await;
    assert_eq!(h.orchestrator.state(), TurnState::Awaiting);
    assert_eq!(h.orchestrator.epoch().value(), 1);

    let submitted = h.exchange.submitted.lock().unwrap().clone();
    assert_eq!(submitted, vec![(h.orchestrator.epoch(), 19244)]);
}

fn tail_harness() -> Harness {
    let config = OrchestratorConfig {
        capture_tail: Duration::from_millis(50),
        ..Default::default()
    };
    Harness::with_config(config, 0.6, FakeExchange::default(), FakeSpeech::default())
}

#[tokio::test]
async fn test_capture_tail_delays_submission() {
    let mut h = tail_harness();

    h.command(Command::BeginCapture).await;
    h.command(Command::EndCapture).await;
    h.command(Command::EndCapture).await;
    assert_eq!(h.orchestrator.state(), TurnState::Recording);
    assert!(h.exchange.submitted.lock().unwrap().is_empty());

    h.pump_input().await;
    assert_eq!(h.orchestrator.state(), TurnState::Awaiting);
    assert_eq!(h.exchange.submitted.lock().unwrap().len(), 1);
    assert!(h.notices().is_empty());
}

#[tokio::test]
async fn test_cancel_during_capture_tail_is_immediate() {
    let mut h = tail_harness();

    h.command(Command::BeginCapture).await;
    h.command(Command::EndCapture).await;
    h.command(Command::Cancel).await;
    assert_eq!(h.orchestrator.state(), TurnState::Idle);

    // The elapsed tail finds nothing to finish
    h.pump_input().await;
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert!(h.exchange.submitted.lock().unwrap().is_empty());

    h.command(Command::BeginCapture).await;
    assert_eq!(h.orchestrator.state(), TurnState::Recording);
}

#[tokio::test]
async fn test_short_capture_is_rejected() {
    let mut h = Harness::build(0.001, FakeExchange::default(), FakeSpeech::default());

    h.command(Command::BeginCapture).await;
    h.command(Command::EndCapture).await;

    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.epoch(), Epoch::ZERO);
    assert!(h.exchange.submitted.lock().unwrap().is_empty());

    let notices = h.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::RecordingTooShort);
}

#[tokio::test]
async fn test_spoken_reply_drives_caption() {
    let mut h = Harness::new();
    h.spoken_turn(USER_TEXT, AGENT_TEXT).await;

    assert_eq!(h.orchestrator.state(), TurnState::Speaking);
    let turns = h.orchestrator.turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].user_text, USER_TEXT);
    assert_eq!(turns[0].agent_text, AGENT_TEXT);

    let id = h.orchestrator.active_playback().unwrap();
    h.orchestrator.handle_playback(PlaybackEvent::Progress {
        id,
        position: Duration::from_secs(1),
        duration: Duration::from_secs(2),
    });
    let caption = h.orchestrator.caption().unwrap();
    assert_eq!(caption.token_count(), 3);
    assert_eq!(caption.highlighted_count(), 1);

    h.end_playback();
    assert_eq!(h.orchestrator.caption().unwrap().highlighted_count(), 3);
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.active_playback(), None);
    assert_eq!(h.player.released(), vec![true]);
}

#[tokio::test]
async fn test_reply_without_audio_returns_to_idle() {
    let mut h = Harness::new();
    let epoch = h.capture().await;

    h.answer(epoch, ExchangeEvent::Transcript(USER_TEXT.into())).await;
    h.answer(epoch, ExchangeEvent::Response(AGENT_TEXT.into())).await;
    assert_eq!(h.orchestrator.state(), TurnState::Awaiting);

    h.answer(epoch, ExchangeEvent::Finished).await;
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.turns().len(), 1);
    assert!(h.player.plays.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_exchange_appends_no_turn() {
    let mut h = Harness::new();
    let epoch = h.capture().await;

    h.answer(epoch, ExchangeEvent::Transcript(String::new())).await;
    h.answer(epoch, ExchangeEvent::Response(String::new())).await;
    h.answer(epoch, ExchangeEvent::Finished).await;

    assert!(h.orchestrator.turns().is_empty());
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert!(!h
        .drain()
        .iter()
        .any(|e| matches!(e, SessionEvent::TurnAppended(_))));
}

#[tokio::test]
async fn test_failure_keeps_partial_turn() {
    let mut h = Harness::new();
    let epoch = h.capture().await;
    h.drain();

    h.answer(epoch, ExchangeEvent::Transcript("hi".into())).await;
    h.answer(
        epoch,
        ExchangeEvent::Failed(Notice::new(NoticeKind::Backend, "LLM timed out")),
    )
    .await;

    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    let turns = h.orchestrator.turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].user_text, "hi");
    assert!(turns[0].agent_text.is_empty());

    let notices = h.notices();
    assert_eq!(notices, vec![Notice::new(NoticeKind::Backend, "LLM timed out")]);
}

#[tokio::test]
async fn test_cancel_makes_late_answers_inert() {
    let mut h = Harness::new();
    let stale = h.capture().await;

    h.command(Command::Cancel).await;
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert!(h.orchestrator.epoch() > stale);
    assert_eq!(h.exchange.cancels.load(Ordering::SeqCst), 1);
    h.drain();

    h.answer(stale, ExchangeEvent::Transcript(USER_TEXT.into())).await;
    h.answer(stale, ExchangeEvent::Response(AGENT_TEXT.into())).await;
    h.answer(stale, ExchangeEvent::Audio(AudioClip::mpeg(vec![0; 8]))).await;
    h.answer(stale, ExchangeEvent::Finished).await;

    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert!(h.orchestrator.turns().is_empty());
    assert!(h.orchestrator.caption().is_none());
    assert!(h.player.plays.lock().unwrap().is_empty());
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_cancel_while_recording_releases_capture() {
    let mut h = Harness::new();

    h.command(Command::BeginCapture).await;
    h.command(Command::Cancel).await;
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert!(h.exchange.submitted.lock().unwrap().is_empty());

    // Device is free again
    h.command(Command::BeginCapture).await;
    assert_eq!(h.orchestrator.state(), TurnState::Recording);
    assert!(h.notices().is_empty());
}

#[tokio::test]
async fn test_busy_while_awaiting() {
    let mut h = Harness::new();
    h.capture().await;
    h.drain();

    h.command(Command::BeginCapture).await;
    h.command(Command::SelectReplay(0)).await;

    assert_eq!(h.orchestrator.state(), TurnState::Awaiting);
    let kinds: Vec<NoticeKind> = h.notices().into_iter().map(|n| n.kind).collect();
    assert_eq!(kinds, vec![NoticeKind::Busy, NoticeKind::Busy]);
}

#[tokio::test]
async fn test_begin_capture_interrupts_playback() {
    let mut h = Harness::new();
    h.spoken_turn(USER_TEXT, AGENT_TEXT).await;

    h.command(Command::BeginCapture).await;

    assert_eq!(h.orchestrator.state(), TurnState::Recording);
    assert_eq!(h.orchestrator.active_playback(), None);
    assert_eq!(h.player.released(), vec![true]);
}

#[tokio::test]
async fn test_replay_replaces_active_playback() {
    let mut h = Harness::new();
    h.spoken_turn(USER_TEXT, AGENT_TEXT).await;
    let first = h.orchestrator.active_playback().unwrap();

    h.command(Command::SelectReplay(0)).await;
    assert_eq!(h.orchestrator.state(), TurnState::Replaying);
    assert_eq!(h.player.released(), vec![true]);

    h.pump_input().await;
    let second = h.orchestrator.active_playback().unwrap();
    assert_ne!(first, second);
    assert_eq!(h.player.released(), vec![true, false]);
    assert_eq!(h.speech.requests.lock().unwrap().clone(), vec![AGENT_TEXT.to_string()]);

    // Events from the released output change nothing
    h.orchestrator.handle_playback(PlaybackEvent::Ended { id: first });
    assert_eq!(h.orchestrator.state(), TurnState::Replaying);

    h.end_playback();
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.replaying(), None);
}

#[tokio::test]
async fn test_selecting_replaying_turn_toggles_off() {
    let mut h = Harness::new();
    h.spoken_turn(USER_TEXT, AGENT_TEXT).await;
    h.end_playback();

    h.command(Command::SelectReplay(0)).await;
    h.pump_input().await;
    assert_eq!(h.orchestrator.replaying(), Some(0));

    h.command(Command::SelectReplay(0)).await;
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.active_playback(), None);
    assert_eq!(h.player.released(), vec![true, true]);
}

#[tokio::test]
async fn test_replay_does_not_touch_caption() {
    let mut h = Harness::new();
    h.spoken_turn(USER_TEXT, "first reply").await;
    h.end_playback();
    h.spoken_turn(USER_TEXT, "second reply here").await;
    h.end_playback();

    h.command(Command::SelectReplay(0)).await;
    h.pump_input().await;
    let id = h.orchestrator.active_playback().unwrap();
    h.orchestrator.handle_playback(PlaybackEvent::Progress {
        id,
        position: Duration::from_millis(100),
        duration: Duration::from_secs(2),
    });

    let caption = h.orchestrator.caption().unwrap();
    assert_eq!(caption.full_text(), "second reply here");
    assert!(caption.is_complete());
}

#[tokio::test]
async fn test_replay_synthesis_failure_returns_idle() {
    let speech = FakeSpeech {
        fail: true,
        ..Default::default()
    };
    let mut h = Harness::build(0.6, FakeExchange::default(), speech);
    h.spoken_turn(USER_TEXT, AGENT_TEXT).await;
    h.end_playback();
    h.drain();

    h.command(Command::SelectReplay(0)).await;
    h.pump_input().await;

    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    let notices = h.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::Backend);
    assert!(notices[0].message.contains("TTS unavailable"));
}

#[tokio::test]
async fn test_replay_of_missing_turn_is_a_notice() {
    let mut h = Harness::new();

    h.command(Command::SelectReplay(3)).await;

    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.notices()[0].kind, NoticeKind::Playback);
}

#[tokio::test]
async fn test_stale_replay_audio_is_dropped() {
    let mut h = Harness::new();
    h.spoken_turn(USER_TEXT, AGENT_TEXT).await;
    h.end_playback();

    h.command(Command::SelectReplay(0)).await;
    h.command(Command::StopPlayback).await;
    assert_eq!(h.orchestrator.state(), TurnState::Idle);

    h.pump_input().await;
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.active_playback(), None);
    assert_eq!(h.player.plays.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_deleting_replaying_turn_stops_it() {
    let mut h = Harness::new();
    h.spoken_turn("one", "first").await;
    h.end_playback();
    h.spoken_turn("two", "second").await;
    h.end_playback();

    h.command(Command::SelectReplay(1)).await;
    h.pump_input().await;

    h.command(Command::DeleteTurn(1)).await;
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.replaying(), None);
    assert_eq!(h.orchestrator.active_playback(), None);
    assert_eq!(h.orchestrator.turns().len(), 1);
    assert_eq!(h.orchestrator.turns()[0].agent_text, "first");
}

#[tokio::test]
async fn test_deleting_earlier_turn_shifts_replay_index() {
    let mut h = Harness::new();
    h.spoken_turn("one", "first").await;
    h.end_playback();
    h.spoken_turn("two", "second").await;
    h.end_playback();

    h.command(Command::SelectReplay(1)).await;
    h.pump_input().await;
    let playing = h.orchestrator.active_playback();

    h.command(Command::DeleteTurn(0)).await;
    assert_eq!(h.orchestrator.state(), TurnState::Replaying);
    assert_eq!(h.orchestrator.replaying(), Some(0));
    assert_eq!(h.orchestrator.active_playback(), playing);

    let counts: Vec<usize> = h
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::TurnsChanged { count } => Some(count),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![1]);
}

#[tokio::test]
async fn test_clear_all_stops_playback() {
    let mut h = Harness::new();
    h.spoken_turn(USER_TEXT, AGENT_TEXT).await;

    h.command(Command::ClearAll).await;

    assert!(h.orchestrator.turns().is_empty());
    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    assert_eq!(h.orchestrator.active_playback(), None);
    assert_eq!(h.player.released(), vec![true]);
}

#[tokio::test]
async fn test_submit_failure_is_a_transport_notice() {
    let exchange = FakeExchange {
        fail: true,
        ..Default::default()
    };
    let mut h = Harness::build(0.6, exchange, FakeSpeech::default());

    h.capture().await;

    assert_eq!(h.orchestrator.state(), TurnState::Idle);
    let notices = h.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::Transport);
}

#[tokio::test]
async fn test_device_failure_keeps_session_usable() {
    struct DeadSource;

    #[async_trait]
    impl CaptureSource for DeadSource {
        async fn start(&mut self, _: &CaptureConfig) -> VoiceResult<mpsc::UnboundedReceiver<PcmFrame>> {
            Err(DeviceError::Unavailable("no input device".into()).into())
        }
        async fn stop(&mut self) -> VoiceResult<()> {
            Ok(())
        }
        fn is_capturing(&self) -> bool {
            false
        }
        fn name(&self) -> &str {
            "dead"
        }
    }

    let (inputs_tx, _inputs) = mpsc::unbounded_channel();
    let (mut orchestrator, mut events) = TurnOrchestrator::new(
        OrchestratorConfig::default(),
        AudioCaptureEngine::new(Box::new(DeadSource)),
        Box::new(FakeExchange::default()),
        Arc::new(FakeSpeech::default()),
        Box::new(FakePlayer::default()),
        inputs_tx,
    );

    orchestrator
        .dispatch(Input::Command(Command::BeginCapture))
        .await;
    assert_eq!(orchestrator.state(), TurnState::Idle);
    match events.try_recv() {
        Ok(SessionEvent::Notice(notice)) => assert_eq!(notice.kind, NoticeKind::Device),
        other => panic!("expected device notice, got {other:?}"),
    }
}

/// Collect session events until the reply has finished playing
async fn until_spoken(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = within(events.recv()).await.expect("session running");
        let done = matches!(
            event,
            SessionEvent::StateChanged {
                from: TurnState::Speaking,
                to: TurnState::Idle
            }
        );
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn assert_full_turn(events: &[SessionEvent]) {
    let turn = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::TurnAppended(turn) => Some(turn.clone()),
            _ => None,
        })
        .expect("turn appended");
    assert_eq!(turn.user_text, USER_TEXT);
    assert_eq!(turn.agent_text, AGENT_TEXT);

    let last_caption = events
        .iter()
        .rev()
        .find_map(|e| match e {
            SessionEvent::Caption(caption) => Some(caption.clone()),
            _ => None,
        })
        .expect("caption");
    assert_eq!(last_caption.highlighted_count(), 3);
}

#[tokio::test]
async fn test_request_exchange_end_to_end() -> Result<()> {
    let mock = MockBackend::start(Mode::Chunks).await;
    let backend = BackendClient::new(mock.http_url(), "a1").with_token(TOKEN);
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

    let (orchestrator, mut events) = TurnOrchestrator::new(
        OrchestratorConfig::default(),
        AudioCaptureEngine::new(Box::new(ToneSource::new(0.6))),
        Box::new(RequestExchange::new(backend.clone(), inputs_tx.clone())),
        Arc::new(backend),
        Box::new(ClockPlayer::new(Duration::from_millis(10))),
        inputs_tx,
    );
    let handle = orchestrator.handle();
    let session = tokio::spawn(orchestrator.run(inputs_rx));

    handle.send(Command::BeginCapture);
    handle.send(Command::EndCapture);
    let seen = until_spoken(&mut events).await;
    assert_full_turn(&seen);
    assert!(seen.contains(&SessionEvent::Status("Processing...".into())));

    // Replay goes through the speech endpoint with the exact reply text
    handle.send(Command::SelectReplay(0));
    loop {
        let event = within(events.recv()).await.expect("session running");
        if event
            == (SessionEvent::StateChanged {
                from: TurnState::Replaying,
                to: TurnState::Idle,
            })
        {
            break;
        }
    }
    assert_eq!(
        mock.recorded.spoken.lock().unwrap().clone(),
        vec![AGENT_TEXT.to_string()]
    );

    handle.shutdown();
    let orchestrator = within(session).await?;
    assert_eq!(orchestrator.turns().len(), 1);
    assert_eq!(orchestrator.state(), TurnState::Idle);
    Ok(())
}

#[tokio::test]
async fn test_streaming_exchange_end_to_end() -> Result<()> {
    let mock = MockBackend::start(Mode::Speech).await;
    let client = Arc::new(ProtocolClient::new(ClientConfig {
        ws_url: mock.ws_url(),
        agent_id: "a1".into(),
        token: TOKEN.into(),
    }));
    let server_events = client.connect().await?;
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

    let exchange = StreamingExchange::new(Arc::clone(&client), server_events, inputs_tx.clone());
    let (orchestrator, mut events) = TurnOrchestrator::new(
        OrchestratorConfig::default(),
        AudioCaptureEngine::new(Box::new(ToneSource::new(0.6))),
        Box::new(exchange),
        Arc::new(BackendClient::new(mock.http_url(), "a1").with_token(TOKEN)),
        Box::new(ClockPlayer::new(Duration::from_millis(10))),
        inputs_tx,
    );
    let handle = orchestrator.handle();
    let session = tokio::spawn(orchestrator.run(inputs_rx));

    handle.send(Command::BeginCapture);
    handle.send(Command::EndCapture);
    let seen = until_spoken(&mut events).await;
    assert_full_turn(&seen);

    let sent = mock.ws_messages();
    assert_eq!(sent[0]["type"], "auth");
    assert_eq!(sent[1]["type"], "audio");

    handle.shutdown();
    within(session).await?;
    client.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_streaming_connection_loss_fails_outstanding_turn() -> Result<()> {
    let mock = MockBackend::start(Mode::CloseAfterAuth).await;
    let client = Arc::new(ProtocolClient::new(ClientConfig {
        ws_url: mock.ws_url(),
        agent_id: "a1".into(),
        token: TOKEN.into(),
    }));
    let server_events = client.connect().await?;
    let (inputs_tx, mut inputs_rx) = mpsc::unbounded_channel();
    let exchange = StreamingExchange::new(Arc::clone(&client), server_events, inputs_tx);

    let mut state = client.watch_state();
    within(state.wait_for(|s| *s == ConnectionState::Closed)).await?;

    // Closed before the capture went out: fails locally
    let artifact = AudioArtifact::encode(&[0.0; 1600], 16000)?;
    let err = exchange.submit(Epoch::ZERO.next(), artifact).await.unwrap_err();
    assert!(matches!(err, VoiceError::NotConnected { .. }));
    assert_eq!(exchange.outstanding().await, 0);

    // Nothing was outstanding when the socket closed
    assert!(inputs_rx.try_recv().is_err());
    Ok(())
}
