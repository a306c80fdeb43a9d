use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_voice::config::DEFAULT_CONFIG_PATH;
use agent_voice::{
    AudioCaptureEngine, AudioPlayer, CaptureSource, Command, Config, FileSource, ProtocolClient,
    RequestExchange, SessionEvent, StreamingExchange, Transport, TurnExchange, TurnOrchestrator,
    TurnState,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::info;

#[derive(Parser)]
#[command(name = "agent-voice", version, about = "Voice conversations with an AI agent")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hold a spoken conversation with an agent
    Chat {
        /// Agent to talk to
        #[arg(long)]
        agent: String,

        /// Read speech from a WAV file instead of the microphone
        #[arg(long)]
        input: Option<PathBuf>,

        /// Override the configured transport
        #[arg(long, value_enum)]
        transport: Option<Transport>,
    },
    /// Capture speech and write the canonical WAV artifact
    Record {
        /// Where to write the artifact
        #[arg(long)]
        output: PathBuf,

        /// Read speech from a WAV file instead of the microphone
        #[arg(long)]
        input: Option<PathBuf>,

        /// How long to capture
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    match cli.command {
        Commands::Chat {
            agent,
            input,
            transport,
        } => chat(cfg, agent, input, transport).await,
        Commands::Record {
            output,
            input,
            seconds,
        } => record(cfg, output, input, seconds).await,
    }
}

fn capture_source(input: Option<PathBuf>) -> Result<Box<dyn CaptureSource>> {
    match input {
        Some(path) => Ok(Box::new(FileSource::new(path))),
        None => microphone(),
    }
}

#[cfg(feature = "device-audio")]
fn microphone() -> Result<Box<dyn CaptureSource>> {
    Ok(Box::new(agent_voice::audio::MicrophoneSource::new()))
}

#[cfg(not(feature = "device-audio"))]
fn microphone() -> Result<Box<dyn CaptureSource>> {
    bail!("built without the device-audio feature; pass --input <file.wav>")
}

#[cfg(feature = "device-audio")]
fn player(cfg: &Config) -> Box<dyn AudioPlayer> {
    Box::new(agent_voice::audio::DevicePlayer::new(cfg.playback_tick()))
}

#[cfg(not(feature = "device-audio"))]
fn player(cfg: &Config) -> Box<dyn AudioPlayer> {
    Box::new(agent_voice::ClockPlayer::new(cfg.playback_tick()))
}

async fn record(cfg: Config, output: PathBuf, input: Option<PathBuf>, seconds: f64) -> Result<()> {
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("--seconds must be positive");
    }

    let mut engine = AudioCaptureEngine::new(capture_source(input)?);
    engine
        .start(cfg.capture_config())
        .await
        .context("Failed to start capture")?;

    info!("Recording for {:.1}s from {}", seconds, engine.source_name());
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;

    let artifact = engine.stop().await.context("Failed to finalize capture")?;
    tokio::fs::write(&output, artifact.as_bytes())
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        "Wrote {} ({} bytes, {:.2}s)",
        output.display(),
        artifact.len(),
        artifact.duration().as_secs_f64()
    );
    Ok(())
}

async fn chat(
    cfg: Config,
    agent: String,
    input: Option<PathBuf>,
    transport: Option<Transport>,
) -> Result<()> {
    let transport = transport.unwrap_or(cfg.session.transport);
    let backend = cfg.backend_client(&agent);
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

    let exchange: Box<dyn TurnExchange> = match transport {
        Transport::Streaming => {
            let client = Arc::new(ProtocolClient::new(cfg.client_config(&agent)));
            let events = client
                .connect()
                .await
                .context("Failed to open voice session")?;
            if let Some(name) = client.identity().await {
                println!("Connected to {name}");
            }
            Box::new(StreamingExchange::new(client, events, inputs_tx.clone()))
        }
        Transport::Request => Box::new(RequestExchange::new(backend.clone(), inputs_tx.clone())),
    };

    let engine = AudioCaptureEngine::new(capture_source(input)?);
    let (orchestrator, mut events) = TurnOrchestrator::new(
        cfg.orchestrator_config(),
        engine,
        exchange,
        Arc::new(backend),
        player(&cfg),
        inputs_tx,
    );
    let handle = orchestrator.handle();
    let session = tokio::spawn(orchestrator.run(inputs_rx));

    let (state_tx, state_rx) = watch::channel(TurnState::Idle);
    let printer = tokio::spawn(async move {
        let mut shown = None;
        while let Some(event) = events.recv().await {
            render(event, &state_tx, &mut shown);
        }
    });

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let command = match line.split_once(' ') {
            None if line.is_empty() => match *state_rx.borrow() {
                TurnState::Recording => Command::EndCapture,
                _ => Command::BeginCapture,
            },
            None if line == "q" || line == "quit" => break,
            None if line == "c" => Command::Cancel,
            None if line == "s" => Command::StopPlayback,
            None if line == "clear" => Command::ClearAll,
            None if line == "reconnect" => Command::Reconnect,
            Some(("r", n)) => match n.trim().parse() {
                Ok(index) => Command::SelectReplay(index),
                Err(_) => {
                    println!("usage: r <turn>");
                    continue;
                }
            },
            Some(("d", n)) => match n.trim().parse() {
                Ok(index) => Command::DeleteTurn(index),
                Err(_) => {
                    println!("usage: d <turn>");
                    continue;
                }
            },
            _ => {
                print_help();
                continue;
            }
        };

        if !handle.send(command) {
            break;
        }
    }

    handle.shutdown();
    let orchestrator = session.await.context("Voice session task failed")?;
    drop(orchestrator);
    let _ = printer.await;
    Ok(())
}

fn print_help() {
    println!("Enter: start/stop speaking | c: cancel | s: stop audio | r N: replay | d N: delete | clear | reconnect | q: quit");
}

fn render(event: SessionEvent, state: &watch::Sender<TurnState>, shown: &mut Option<usize>) {
    match event {
        SessionEvent::StateChanged { to, .. } => {
            state.send_replace(to);
            match to {
                TurnState::Recording => println!("* listening... (Enter to send)"),
                TurnState::Awaiting => println!("* thinking..."),
                _ => {}
            }
        }
        SessionEvent::TurnAppended(turn) => {
            if !turn.user_text.is_empty() {
                println!("you:   {}", turn.user_text);
            }
            if !turn.agent_text.is_empty() {
                println!("agent: {}", turn.agent_text);
            }
        }
        SessionEvent::TurnsChanged { count } => println!("* {count} turn(s)"),
        SessionEvent::Caption(caption) => {
            if *shown == Some(caption.highlighted_count()) {
                return;
            }
            *shown = Some(caption.highlighted_count());
            if caption.highlighted_count() == 0 {
                return;
            }
            let spoken: Vec<&str> = caption
                .segments()
                .filter(|(_, highlighted)| *highlighted)
                .map(|(word, _)| word)
                .collect();
            println!(
                "  [{}/{}] {}",
                caption.highlighted_count(),
                caption.token_count(),
                spoken.join(" ")
            );
        }
        SessionEvent::Status(message) => println!("* {message}"),
        SessionEvent::Notice(notice) => println!("! {}", notice.message),
    }
}
