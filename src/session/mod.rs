//! Session lifecycle manager for a voice client.
//!
//! ## Architecture
//!
//! ```text
//! Microphone ─▸ uplink (meter, gate, encode) ─▸ writer ─▸ transport ─▸ relay
//! Speaker ◂─ playback queue ◂─ downlink (parse, decode, transcript) ◂─┘
//! ```
//!
//! [`VoiceSession`] decides when capture starts and stops and exposes
//! status, activity flags, the running transcript and the microphone
//! noise gate. Encoding lives in [`crate::audio`], wire shapes in the
//! provider adapter, and topic decisions on the relay side.
//!
//! Disconnect tears down in a fixed order: microphone, transport,
//! transcript flush, playback. The same teardown runs when the transport
//! ends on its own. In-flight sends are abandoned, never surfaced as
//! errors.

pub mod transport;

pub use transport::{FrameSink, FrameStream, TransportConnector, WsConnector};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{decode_pcm, encode_outbound_at, rms_level, AudioOutput, PlaybackQueue};
use crate::error::VoiceError;
use crate::orchestrator::state::{ConnectionStatus, ConversationState, TranscriptMessage};
use crate::store::SessionStore;
use crate::voice::provider::COMPLETE_TOPIC_TOOL;
use crate::voice::{CloseInfo, Frame, ProviderAdapter, ToolCall, VoiceEvent};

/// Default noise-gate threshold (RMS, 0.0 to 1.0).
pub const DEFAULT_MIC_SENSITIVITY: f32 = 0.01;

const OUTBOUND_QUEUE: usize = 256;
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ── Device and collaborator seams ────────────────────────────────

/// Capture device. Chunks are mono float samples at [`Microphone::sample_rate`].
#[async_trait]
pub trait Microphone: Send {
    fn sample_rate(&self) -> u32;

    async fn start(&mut self) -> anyhow::Result<mpsc::Receiver<Vec<f32>>>;

    /// Stop capture and release the device. Must be idempotent.
    fn stop(&mut self);
}

/// Where the transcript goes when the session ends.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn flush(&self, messages: &[TranscriptMessage]) -> anyhow::Result<()>;
}

/// Flushes into a [`SessionStore`] session.
pub struct StoreTranscriptSink {
    store: Arc<dyn SessionStore>,
    session_id: String,
}

impl StoreTranscriptSink {
    pub fn new(store: Arc<dyn SessionStore>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl TranscriptSink for StoreTranscriptSink {
    async fn flush(&self, messages: &[TranscriptMessage]) -> anyhow::Result<()> {
        self.store.append_messages(&self.session_id, messages).await
    }
}

// ── Shared state ─────────────────────────────────────────────────

/// Direction of the most recent audio activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Activity {
    #[default]
    Idle,
    /// Agent audio arrived.
    Inbound,
    /// User audio above the gate was sent.
    Outbound,
}

struct Shared {
    state: Mutex<ConversationState>,
    activity: Mutex<Activity>,
    gate: Mutex<f32>,
    ended: AtomicBool,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().status = status;
    }

    fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    fn set_activity(&self, activity: Activity) {
        *self.activity.lock() = activity;
    }
}

type Playback = Arc<Mutex<PlaybackQueue<Box<dyn AudioOutput>>>>;
type SharedMicrophone = Arc<tokio::sync::Mutex<Box<dyn Microphone>>>;

struct Running {
    /// Caller asked for the ordered teardown.
    shutdown: CancellationToken,
    /// Transport ended on its own (peer close, error, failed send).
    closed: CancellationToken,
    capture: CancellationToken,
    transport: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Everything the ordered teardown releases. Owned by the supervisor task
/// so it runs whether the caller disconnects or the transport ends first.
struct Teardown {
    sid: String,
    microphone: SharedMicrophone,
    playback: Playback,
    transcript_sink: Option<Arc<dyn TranscriptSink>>,
    shared: Arc<Shared>,
    capture: CancellationToken,
    transport: CancellationToken,
    uplink: JoinHandle<()>,
    writer: JoinHandle<()>,
    downlink: JoinHandle<()>,
}

impl Teardown {
    /// Microphone, transport, transcript flush, playback. Never fails.
    async fn run(self, end_status: ConnectionStatus) {
        let sid = self.sid;
        tracing::info!(session_id = %sid, "Voice session disconnecting");

        self.microphone.lock().await.stop();
        self.capture.cancel();
        join_task(&sid, "uplink", self.uplink).await;

        self.transport.cancel();
        join_task(&sid, "writer", self.writer).await;
        self.downlink.abort();
        join_task(&sid, "downlink", self.downlink).await;

        let transcript = {
            let mut state = self.shared.state.lock();
            state.commit_turn();
            state.transcript.clone()
        };
        if let Some(sink) = &self.transcript_sink {
            if let Err(e) = sink.flush(&transcript).await {
                tracing::warn!(session_id = %sid, error = %e, "Transcript flush failed");
            }
        }

        self.playback.lock().close();

        self.shared.ended.store(true, Ordering::SeqCst);
        self.shared.set_activity(Activity::Idle);
        self.shared.set_status(end_status);
        tracing::info!(session_id = %sid, messages = transcript.len(), status = ?end_status, "Voice session ended");
    }
}

async fn supervise(teardown: Teardown, shutdown: CancellationToken, closed: CancellationToken) {
    let end_status = tokio::select! {
        () = shutdown.cancelled() => ConnectionStatus::Disconnected,
        () = closed.cancelled() => {
            tracing::info!(session_id = %teardown.sid, "Transport ended, releasing devices");
            match teardown.shared.status() {
                ConnectionStatus::Error => ConnectionStatus::Error,
                _ => ConnectionStatus::Disconnected,
            }
        }
    };
    teardown.run(end_status).await;
}

// ── Session ──────────────────────────────────────────────────────

/// One voice connection. Devices are held from `connect` until
/// `disconnect`, the end of the transport, or drop; a session is not
/// reusable once ended.
pub struct VoiceSession {
    session_id: String,
    adapter: Arc<dyn ProviderAdapter>,
    connector: Arc<dyn TransportConnector>,
    microphone: SharedMicrophone,
    playback: Playback,
    transcript_sink: Option<Arc<dyn TranscriptSink>>,
    shared: Arc<Shared>,
    close_timeout: Duration,
    running: Option<Running>,
}

impl VoiceSession {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        connector: Arc<dyn TransportConnector>,
        microphone: Box<dyn Microphone>,
        output: Box<dyn AudioOutput>,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            adapter,
            connector,
            microphone: Arc::new(tokio::sync::Mutex::new(microphone)),
            playback: Arc::new(Mutex::new(PlaybackQueue::new(output))),
            transcript_sink: None,
            shared: Arc::new(Shared {
                state: Mutex::new(ConversationState::new()),
                activity: Mutex::new(Activity::Idle),
                gate: Mutex::new(DEFAULT_MIC_SENSITIVITY),
                ended: AtomicBool::new(false),
            }),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            running: None,
        }
    }

    pub fn with_transcript_sink(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.transcript_sink = Some(sink);
        self
    }

    /// Upper bound on the best-effort close handshake during disconnect.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// The session has been torn down and released its devices.
    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }

    /// Agent audio is the latest activity.
    pub fn is_speaking(&self) -> bool {
        self.status() == ConnectionStatus::Connected
            && *self.shared.activity.lock() == Activity::Inbound
    }

    /// User speech is the latest activity.
    pub fn is_listening(&self) -> bool {
        self.status() == ConnectionStatus::Connected
            && *self.shared.activity.lock() == Activity::Outbound
    }

    pub fn transcript(&self) -> Vec<TranscriptMessage> {
        self.shared.state.lock().transcript.clone()
    }

    pub fn mic_level(&self) -> f32 {
        self.shared.state.lock().mic_level
    }

    pub fn mic_sensitivity(&self) -> f32 {
        *self.shared.gate.lock()
    }

    /// Noise-gate threshold, clamped to `0.0..=1.0`.
    pub fn set_mic_sensitivity(&self, threshold: f32) {
        let threshold = if threshold.is_nan() {
            DEFAULT_MIC_SENSITIVITY
        } else {
            threshold.clamp(0.0, 1.0)
        };
        *self.shared.gate.lock() = threshold;
    }

    pub async fn connect(&mut self) -> Result<(), VoiceError> {
        let live = self
            .running
            .as_ref()
            .map(|running| !running.closed.is_cancelled());
        if self.is_ended() || live == Some(false) {
            return Err(VoiceError::Connection("session already ended".into()));
        }
        if live == Some(true) {
            return Ok(());
        }

        let sid = self.session_id.clone();
        self.shared.set_status(ConnectionStatus::Connecting);
        tracing::info!(session_id = %sid, provider = %self.adapter.kind(), "Voice session connecting");

        let (started, mic_rate) = {
            let mut microphone = self.microphone.lock().await;
            (microphone.start().await, microphone.sample_rate())
        };
        let chunks = match started {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!(session_id = %sid, error = %e, "Microphone unavailable");
                self.shared.set_status(ConnectionStatus::Error);
                return Err(VoiceError::Connection(format!("microphone unavailable: {e}")));
            }
        };

        let (sink, stream) = match self.connector.connect().await {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(session_id = %sid, error = %e, "Transport connect failed");
                self.microphone.lock().await.stop();
                self.shared.set_status(ConnectionStatus::Error);
                return Err(VoiceError::Connection(e.to_string()));
            }
        };

        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();
        let capture = CancellationToken::new();
        let transport = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let writer = tokio::spawn(write_loop(
            sid.clone(),
            sink,
            out_rx,
            transport.clone(),
            closed.clone(),
            Arc::clone(&self.shared),
            self.close_timeout,
        ));
        let uplink = tokio::spawn(uplink_loop(
            sid.clone(),
            Arc::clone(&self.adapter),
            chunks,
            mic_rate,
            out_tx.clone(),
            capture.clone(),
            Arc::clone(&self.shared),
        ));
        let downlink = tokio::spawn(downlink_loop(
            sid.clone(),
            Arc::clone(&self.adapter),
            stream,
            out_tx,
            Arc::clone(&self.playback),
            Arc::clone(&self.shared),
            closed.clone(),
            transport.clone(),
        ));

        let teardown = Teardown {
            sid,
            microphone: Arc::clone(&self.microphone),
            playback: Arc::clone(&self.playback),
            transcript_sink: self.transcript_sink.clone(),
            shared: Arc::clone(&self.shared),
            capture: capture.clone(),
            transport: transport.clone(),
            uplink,
            writer,
            downlink,
        };
        let supervisor = tokio::spawn(supervise(teardown, shutdown.clone(), closed.clone()));

        self.running = Some(Running {
            shutdown,
            closed,
            capture,
            transport,
            supervisor,
        });
        Ok(())
    }

    /// Ordered teardown. Never fails; problems are logged. Waits for a
    /// teardown already started by the end of the transport.
    pub async fn disconnect(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.cancel();
        join_task(&self.session_id, "supervisor", running.supervisor).await;
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.supervisor.abort();
            running.capture.cancel();
            running.transport.cancel();
            if let Ok(mut microphone) = self.microphone.try_lock() {
                microphone.stop();
            }
            self.playback.lock().close();
        }
    }
}

async fn join_task(session_id: &str, name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        if !e.is_cancelled() {
            tracing::warn!(session_id = %session_id, task = name, error = %e, "Session task failed");
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────────

async fn write_loop(
    sid: String,
    mut sink: FrameSink,
    mut out_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    closed: CancellationToken,
    shared: Arc<Shared>,
    close_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(session_id = %sid, "Send abandoned on disconnect");
                break;
            }
            result = sink.send(frame) => {
                if let Err(e) = result {
                    tracing::warn!(session_id = %sid, error = %e, "Transport send failed");
                    shared.set_status(ConnectionStatus::Error);
                    closed.cancel();
                    break;
                }
            }
        }
    }

    let close = async {
        let info = CloseInfo::normal("client disconnect");
        if let Err(e) = sink.send(Frame::Close(Some(info))).await {
            tracing::debug!(session_id = %sid, error = %e, "Close frame not delivered");
        }
        sink.close().await
    };
    match tokio::time::timeout(close_timeout, close).await {
        Ok(Ok(())) => tracing::debug!(session_id = %sid, "Transport closed"),
        Ok(Err(e)) => tracing::debug!(session_id = %sid, error = %e, "Transport close failed"),
        Err(_) => tracing::debug!(session_id = %sid, "Transport close timed out"),
    }
}

async fn uplink_loop(
    sid: String,
    adapter: Arc<dyn ProviderAdapter>,
    mut chunks: mpsc::Receiver<Vec<f32>>,
    mic_rate: u32,
    out_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
) {
    let target_rate = adapter.input_sample_rate();
    let mut sent: u64 = 0;
    loop {
        let samples = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            chunk = chunks.recv() => match chunk {
                Some(samples) => samples,
                None => {
                    tracing::debug!(session_id = %sid, "Microphone stream ended");
                    break;
                }
            },
        };

        let level = rms_level(&samples);
        let gate = *shared.gate.lock();
        shared.state.lock().mic_level = level;

        let wire = if level > 0.0 && level >= gate {
            shared.set_activity(Activity::Outbound);
            encode_outbound_at(&samples, mic_rate, target_rate)
        } else {
            // gated chunks go out as silence so server-side VAD still sees the pause
            encode_outbound_at(&vec![0.0; samples.len()], mic_rate, target_rate)
        };
        let frame = Frame::json(&adapter.audio_input(&wire));

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = out_tx.send(frame) => {
                if result.is_err() {
                    tracing::debug!(session_id = %sid, "Transport writer gone, stopping uplink");
                    break;
                }
            }
        }

        sent += 1;
        if sent == 1 || sent.is_multiple_of(50) {
            tracing::debug!(session_id = %sid, chunks = sent, level, "Mic → transport");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn downlink_loop(
    sid: String,
    adapter: Arc<dyn ProviderAdapter>,
    mut stream: FrameStream,
    out_tx: mpsc::Sender<Frame>,
    playback: Playback,
    shared: Arc<Shared>,
    closed: CancellationToken,
    transport: CancellationToken,
) {
    let output_rate = adapter.output_sample_rate();
    let mut audio_chunks: u64 = 0;

    let end_status = loop {
        let next = tokio::select! {
            biased;
            () = transport.cancelled() => return,
            next = stream.next() => next,
        };
        let frame = match next {
            Some(Ok(Frame::Close(info))) => {
                tracing::info!(
                    session_id = %sid,
                    code = info.as_ref().map(|i| i.code),
                    reason = info.as_ref().map(|i| i.reason.as_str()).unwrap_or(""),
                    "Transport closed by peer"
                );
                break ConnectionStatus::Disconnected;
            }
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(session_id = %sid, error = %e, "Transport error");
                break ConnectionStatus::Error;
            }
            None => {
                tracing::info!(session_id = %sid, "Transport ended");
                break ConnectionStatus::Disconnected;
            }
        };

        let value = match frame.parse_json() {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                tracing::warn!(session_id = %sid, error = %e, "Dropping malformed frame");
                continue;
            }
            None => {
                tracing::debug!(session_id = %sid, len = frame.len(), "Ignoring non-JSON frame");
                continue;
            }
        };

        for event in adapter.parse_events(&value) {
            match &event {
                VoiceEvent::Audio { data } => match decode_pcm(data, output_rate) {
                    Ok(buffer) => {
                        playback.lock().enqueue(&buffer);
                        shared.set_activity(Activity::Inbound);
                        audio_chunks += 1;
                        if audio_chunks == 1 || audio_chunks.is_multiple_of(50) {
                            tracing::debug!(session_id = %sid, chunks = audio_chunks, "Agent audio → playback");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %sid, error = %e, "Dropping undecodable audio chunk");
                    }
                },
                VoiceEvent::Interrupted => {
                    playback.lock().clear();
                    shared.set_activity(Activity::Outbound);
                }
                VoiceEvent::ToolCall(call) => {
                    for reply in adapter.tool_response(call, &tool_output(call)) {
                        tokio::select! {
                            biased;
                            () = transport.cancelled() => return,
                            result = out_tx.send(Frame::json(&reply)) => {
                                if result.is_err() {
                                    tracing::debug!(session_id = %sid, tool = %call.name, "Tool response not sent");
                                }
                            }
                        }
                    }
                }
                VoiceEvent::Error { message } => {
                    tracing::warn!(session_id = %sid, error = %message, "Provider reported an error");
                }
                _ => {}
            }
            shared.state.lock().record(&event);
        }
    };

    shared.set_status(end_status);
    shared.set_activity(Activity::Idle);
    closed.cancel();
}

/// Acknowledgment returned for a model tool call.
fn tool_output(call: &ToolCall) -> serde_json::Value {
    if call.name == COMPLETE_TOPIC_TOOL {
        serde_json::json!({ "ok": true })
    } else {
        serde_json::json!({ "ok": false, "error": format!("unsupported tool {}", call.name) })
    }
}
