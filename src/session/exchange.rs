use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::epoch::Epoch;
use super::orchestrator::Input;
use crate::audio::{AudioArtifact, AudioClip};
use crate::error::{Notice, NoticeKind, Result};
use crate::protocol::{BackendClient, ProtocolClient, ServerEvent};

/// What an exchange reports back for one submitted capture
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    Status(String),
    Transcript(String),
    Response(String),
    /// Synthesized reply audio
    Audio(AudioClip),
    /// No more events will follow for this epoch
    Finished,
    /// The request failed; no more events will follow for this epoch
    Failed(Notice),
}

/// Sends a finalized capture to the backend and feeds the answer back to
/// the orchestrator as `Input::Exchange` tagged with the request epoch.
///
/// Implementations:
/// - `StreamingExchange`: persistent socket, chunked audio
/// - `RequestExchange`: one HTTP request per turn
#[async_trait]
pub trait TurnExchange: Send + Sync {
    async fn submit(&self, epoch: Epoch, artifact: AudioArtifact) -> Result<()>;

    /// Abandon in-flight work. Late answers are still tagged with their epoch.
    async fn cancel(&self);

    /// Re-establish the transport after it closed
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// Text-to-speech used to replay a past reply
#[async_trait]
pub trait SpeechSource: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioClip>;
}

#[async_trait]
impl SpeechSource for BackendClient {
    async fn synthesize(&self, text: &str) -> Result<AudioClip> {
        self.speak(text).await
    }
}

fn forward(inputs: &mpsc::UnboundedSender<Input>, epoch: Epoch, event: ExchangeEvent) -> bool {
    inputs.send(Input::Exchange { epoch, event }).is_ok()
}

/// Exchange over the streaming protocol.
///
/// The server answers requests in the order they were sent, so inbound
/// messages belong to the oldest request still outstanding. A request is
/// retired when its audio completes, the server reports an error, or its
/// chunk sequence cannot be reassembled.
pub struct StreamingExchange {
    client: Arc<ProtocolClient>,
    outstanding: Arc<Mutex<VecDeque<Epoch>>>,
    inputs: mpsc::UnboundedSender<Input>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingExchange {
    /// Wrap a client that is already `Ready`, draining its event stream
    pub fn new(
        client: Arc<ProtocolClient>,
        events: mpsc::Receiver<ServerEvent>,
        inputs: mpsc::UnboundedSender<Input>,
    ) -> Self {
        let outstanding = Arc::new(Mutex::new(VecDeque::new()));
        let pump = spawn_pump(events, Arc::clone(&outstanding), inputs.clone());

        Self {
            client,
            outstanding,
            inputs,
            pump: Mutex::new(Some(pump)),
        }
    }

    pub fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    /// Requests sent and not yet answered
    pub async fn outstanding(&self) -> usize {
        self.outstanding.lock().await.len()
    }
}

impl Drop for StreamingExchange {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.try_lock() {
            if let Some(pump) = pump.take() {
                pump.abort();
            }
        }
    }
}

fn spawn_pump(
    mut events: mpsc::Receiver<ServerEvent>,
    outstanding: Arc<Mutex<VecDeque<Epoch>>>,
    inputs: mpsc::UnboundedSender<Input>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let mut queue = outstanding.lock().await;

            let (epoch, event) = match event {
                ServerEvent::Closed(reason) => {
                    for epoch in queue.drain(..) {
                        let notice = Notice::new(
                            NoticeKind::Connection,
                            format!("Connection lost: {reason}"),
                        );
                        forward(&inputs, epoch, ExchangeEvent::Failed(notice));
                    }
                    break;
                }
                ServerEvent::Transcript(text) => (queue.front().copied(), ExchangeEvent::Transcript(text)),
                ServerEvent::Response(text) => (queue.front().copied(), ExchangeEvent::Response(text)),
                ServerEvent::Status(message) => (queue.front().copied(), ExchangeEvent::Status(message)),
                ServerEvent::Audio(bytes) => {
                    let Some(epoch) = queue.pop_front() else {
                        debug!("Dropping unsolicited audio ({} bytes)", bytes.len());
                        continue;
                    };
                    if !bytes.is_empty() {
                        forward(&inputs, epoch, ExchangeEvent::Audio(AudioClip::mpeg(bytes)));
                    }
                    (Some(epoch), ExchangeEvent::Finished)
                }
                ServerEvent::Error(message) => (
                    queue.pop_front(),
                    ExchangeEvent::Failed(Notice::new(NoticeKind::Backend, message)),
                ),
                ServerEvent::ProtocolError(message) => (
                    queue.pop_front(),
                    ExchangeEvent::Failed(Notice::new(NoticeKind::Protocol, message)),
                ),
            };
            drop(queue);

            match epoch {
                Some(epoch) => {
                    if !forward(&inputs, epoch, event) {
                        break;
                    }
                }
                None => debug!("Dropping {:?} with no request outstanding", event),
            }
        }
        debug!("Streaming exchange pump stopped");
    })
}

#[async_trait]
impl TurnExchange for StreamingExchange {
    async fn submit(&self, epoch: Epoch, artifact: AudioArtifact) -> Result<()> {
        // Queue before sending so an immediate answer finds its epoch
        self.outstanding.lock().await.push_back(epoch);

        if let Err(e) = self.client.send_audio(&artifact).await {
            self.outstanding.lock().await.retain(|queued| *queued != epoch);
            return Err(e);
        }
        Ok(())
    }

    async fn cancel(&self) {
        // The server still answers; those answers keep their old epoch
        debug!(
            "Cancel with {} request(s) outstanding",
            self.outstanding.lock().await.len()
        );
    }

    async fn reconnect(&self) -> Result<()> {
        let events = self.client.connect().await?;

        let mut queue = self.outstanding.lock().await;
        for epoch in queue.drain(..) {
            let notice = Notice::new(NoticeKind::Connection, "Connection was reset");
            forward(&self.inputs, epoch, ExchangeEvent::Failed(notice));
        }
        drop(queue);

        let pump = spawn_pump(events, Arc::clone(&self.outstanding), self.inputs.clone());
        if let Some(old) = self.pump.lock().await.replace(pump) {
            old.abort();
        }
        info!("Streaming exchange reconnected");
        Ok(())
    }

    fn name(&self) -> &str {
        "streaming"
    }
}

/// Exchange over the request/response endpoint, one request per turn
pub struct RequestExchange {
    backend: BackendClient,
    inputs: mpsc::UnboundedSender<Input>,
    inflight: Mutex<Option<JoinHandle<()>>>,
}

impl RequestExchange {
    pub fn new(backend: BackendClient, inputs: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            backend,
            inputs,
            inflight: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TurnExchange for RequestExchange {
    async fn submit(&self, epoch: Epoch, artifact: AudioArtifact) -> Result<()> {
        let backend = self.backend.clone();
        let inputs = self.inputs.clone();

        let task = tokio::spawn(async move {
            forward(&inputs, epoch, ExchangeEvent::Status("Processing...".into()));

            let reply = match backend.voice_chat(&artifact).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Voice chat request failed: {}", e);
                    if let Some(notice) = e.notice() {
                        forward(&inputs, epoch, ExchangeEvent::Failed(notice));
                    }
                    return;
                }
            };

            forward(&inputs, epoch, ExchangeEvent::Transcript(reply.user_text.clone()));
            forward(&inputs, epoch, ExchangeEvent::Response(reply.agent_response.clone()));

            match reply.audio() {
                Ok(Some(clip)) => {
                    forward(&inputs, epoch, ExchangeEvent::Audio(clip));
                }
                Ok(None) => debug!("Reply carried no audio"),
                Err(e) => {
                    if let Some(notice) = e.notice() {
                        forward(&inputs, epoch, ExchangeEvent::Failed(notice));
                    }
                    return;
                }
            }
            forward(&inputs, epoch, ExchangeEvent::Finished);
        });

        if let Some(previous) = self.inflight.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn cancel(&self) {
        if let Some(task) = self.inflight.lock().await.take() {
            task.abort();
            debug!("Aborted in-flight voice chat request");
        }
    }

    fn name(&self) -> &str {
        "request"
    }
}
