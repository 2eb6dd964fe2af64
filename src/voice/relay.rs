//! Duplex relay between a client channel and the upstream speech endpoint.
//!
//! ## Protocol Overview
//!
//! ```text
//! Client ──frames──▸ Relay ──frames──▸ Upstream (Gemini Live / OpenAI Realtime)
//!        ◂─frames───       ◂─frames───
//! ```
//!
//! 1. **Setup**: on start the relay sends exactly one setup frame upstream
//! 2. **Ack**: the setup-complete acknowledgment is forwarded to the client
//!    verbatim; after a short delay an opening turn is sent upstream so the
//!    agent speaks first
//! 3. **Forward**: every other frame passes through unmodified, keeping
//!    its text/binary kind; setup-phase messages are intercepted and
//!    malformed upstream frames are logged and dropped
//! 4. **Close**: closing either side closes the other; nothing is retried
//!
//! Behavior steering happens through [`RelayHooks`]: hooks observe parsed
//! upstream control events (audio is never decoded here), client frames
//! and a periodic tick, and return
//! [`RelayCommand`]s. Commands reach upstream before the frame that
//! triggered them is forwarded, and before the next frame is read.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;

use super::provider::{ProviderAdapter, SessionSetup};
use super::{CloseInfo, Frame, VoiceEvent};

/// Default pause between setup-complete and the synthesized opening turn.
pub const DEFAULT_OPENING_DELAY: Duration = Duration::from_millis(500);

const TICK_INTERVAL: Duration = Duration::from_secs(1);

// ── Hooks ──────────────────────────────────────────────────────────

/// Instruction the relay applies to the upstream channel on behalf of a hook.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayCommand {
    /// Replace the system instruction (topic transition).
    UpdateInstructions(String),
    /// Inject a steering note; `respond` asks for an immediate reaction.
    Inject { text: String, respond: bool },
    /// Close both channels normally.
    Close { reason: String },
}

/// Synchronous observation points inside the relay loop.
pub trait RelayHooks: Send {
    fn on_upstream_events(&mut self, _events: &[VoiceEvent]) -> Vec<RelayCommand> {
        Vec::new()
    }

    fn on_client_frame(&mut self, _frame: &Frame) -> Vec<RelayCommand> {
        Vec::new()
    }

    fn on_tick(&mut self, _stats: &RelayStats) -> Vec<RelayCommand> {
        Vec::new()
    }
}

/// Plain pass-through.
impl RelayHooks for () {}

// ── Stats / outcome ────────────────────────────────────────────────

/// Diagnostic counters. The relay never enforces timeouts from these.
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub started_at: Instant,
    pub last_activity: Instant,
    pub frames_from_client: u64,
    pub frames_from_upstream: u64,
    pub dropped: u64,
    pub intercepted: u64,
}

impl RelayStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            last_activity: now,
            frames_from_client: 0,
            frames_from_upstream: 0,
            dropped: 0,
            intercepted: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Which side ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Upstream,
    /// A hook returned [`RelayCommand::Close`].
    Policy,
}

#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub closed_by: ClosedBy,
    /// Close code and reason observed on the closing side, if any.
    pub close: Option<CloseInfo>,
    pub setup_completed: bool,
    pub stats: RelayStats,
}

// ── Relay ──────────────────────────────────────────────────────────

pub struct Relay<H> {
    session_id: String,
    adapter: Arc<dyn ProviderAdapter>,
    setup: SessionSetup,
    hooks: H,
    opening_delay: Duration,
    tick_interval: Duration,
}

/// Result of applying a batch of hook commands.
enum Applied {
    Continue,
    Close(String),
}

impl<H: RelayHooks> Relay<H> {
    pub fn new(
        session_id: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
        setup: SessionSetup,
        hooks: H,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            adapter,
            setup,
            hooks,
            opening_delay: DEFAULT_OPENING_DELAY,
            tick_interval: TICK_INTERVAL,
        }
    }

    pub fn with_opening_delay(mut self, delay: Duration) -> Self {
        self.opening_delay = delay;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Run until either side closes. Returns the hooks so the caller can
    /// read whatever state they accumulated.
    pub async fn run<CS, CR, CE, US, UR, UE>(
        mut self,
        mut client_tx: CS,
        mut client_rx: CR,
        mut upstream_tx: US,
        mut upstream_rx: UR,
    ) -> (H, RelayOutcome)
    where
        CS: Sink<Frame> + Unpin,
        CS::Error: Display,
        CR: Stream<Item = Result<Frame, CE>> + Unpin,
        CE: Display,
        US: Sink<Frame> + Unpin,
        US::Error: Display,
        UR: Stream<Item = Result<Frame, UE>> + Unpin,
        UE: Display,
    {
        let sid = self.session_id.clone();
        let mut stats = RelayStats::new();
        let mut setup_completed = false;

        let setup = self.adapter.setup_frame(&self.setup);
        tracing::info!(
            session_id = %sid,
            provider = %self.adapter.kind(),
            model = self.adapter.model(),
            instruction_len = self.setup.system_instruction.len(),
            "Relay: sending setup frame"
        );
        if let Err(e) = send(&mut upstream_tx, Frame::json(&setup)).await {
            tracing::error!(session_id = %sid, error = %e, "Relay: setup frame send failed");
            let info = CloseInfo {
                code: CloseInfo::INTERNAL_ERROR,
                reason: "upstream setup failed".into(),
            };
            close_sink(&mut client_tx, Some(info.clone())).await;
            return (
                self.hooks,
                RelayOutcome {
                    closed_by: ClosedBy::Upstream,
                    close: Some(info),
                    setup_completed,
                    stats,
                },
            );
        }

        let opening = tokio::time::sleep(self.opening_delay);
        tokio::pin!(opening);
        let mut opening_armed = false;

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (closed_by, close) = loop {
            tokio::select! {
                upstream = upstream_rx.next() => {
                    let frame = match upstream {
                        Some(Ok(Frame::Close(info))) => {
                            tracing::info!(
                                session_id = %sid,
                                code = info.as_ref().map(|i| i.code),
                                reason = info.as_ref().map(|i| i.reason.as_str()).unwrap_or(""),
                                "Relay: upstream closed"
                            );
                            close_sink(&mut client_tx, info.clone()).await;
                            close_sink(&mut upstream_tx, None).await;
                            break (ClosedBy::Upstream, info);
                        }
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            tracing::warn!(session_id = %sid, error = %e, "Relay: upstream error");
                            let info = CloseInfo {
                                code: CloseInfo::INTERNAL_ERROR,
                                reason: "upstream error".into(),
                            };
                            close_sink(&mut client_tx, Some(info.clone())).await;
                            break (ClosedBy::Upstream, Some(info));
                        }
                        None => {
                            tracing::info!(session_id = %sid, "Relay: upstream stream ended");
                            close_sink(&mut client_tx, Some(CloseInfo::normal("upstream ended"))).await;
                            break (ClosedBy::Upstream, None);
                        }
                    };
                    stats.frames_from_upstream += 1;
                    stats.touch();

                    let value = match frame.parse_json() {
                        Some(Ok(value)) => value,
                        Some(Err(e)) => {
                            stats.dropped += 1;
                            tracing::warn!(session_id = %sid, error = %e, len = frame.len(), "Relay: dropping malformed upstream frame");
                            continue;
                        }
                        None => {
                            stats.dropped += 1;
                            tracing::warn!(session_id = %sid, len = frame.len(), "Relay: dropping non-JSON upstream frame");
                            continue;
                        }
                    };

                    if self.adapter.is_setup_phase(&value) {
                        stats.intercepted += 1;
                        tracing::debug!(session_id = %sid, "Relay: intercepted setup-phase message");
                        continue;
                    }

                    let is_ack = !setup_completed && self.adapter.is_setup_complete(&value);
                    // audio is forwarded as-is; hooks only need control events
                    let events = self.adapter.parse_control_events(&value);
                    let commands = if events.is_empty() {
                        Vec::new()
                    } else {
                        self.hooks.on_upstream_events(&events)
                    };

                    match apply(&sid, self.adapter.as_ref(), &mut upstream_tx, commands).await {
                        Ok(Applied::Continue) => {}
                        Ok(Applied::Close(reason)) => {
                            let info = CloseInfo::normal(reason);
                            close_sink(&mut upstream_tx, Some(info.clone())).await;
                            close_sink(&mut client_tx, Some(info.clone())).await;
                            break (ClosedBy::Policy, Some(info));
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %sid, error = %e, "Relay: upstream send failed");
                            close_sink(&mut client_tx, Some(CloseInfo::normal("upstream unavailable"))).await;
                            break (ClosedBy::Upstream, None);
                        }
                    }

                    if let Err(e) = send(&mut client_tx, frame).await {
                        tracing::info!(session_id = %sid, error = %e, "Relay: client gone");
                        close_sink(&mut upstream_tx, Some(CloseInfo::normal("client gone"))).await;
                        break (ClosedBy::Client, None);
                    }

                    if is_ack {
                        setup_completed = true;
                        tracing::info!(session_id = %sid, "Relay: setup complete, scheduling opening turn");
                        opening.as_mut().reset(Instant::now() + self.opening_delay);
                        opening_armed = true;
                    }
                }

                client = client_rx.next() => {
                    let frame = match client {
                        Some(Ok(Frame::Close(info))) => {
                            tracing::info!(
                                session_id = %sid,
                                code = info.as_ref().map(|i| i.code),
                                reason = info.as_ref().map(|i| i.reason.as_str()).unwrap_or(""),
                                "Relay: client closed"
                            );
                            close_sink(&mut upstream_tx, Some(CloseInfo::normal("client closed"))).await;
                            break (ClosedBy::Client, info);
                        }
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            tracing::info!(session_id = %sid, error = %e, "Relay: client error");
                            close_sink(&mut upstream_tx, Some(CloseInfo::normal("client error"))).await;
                            break (ClosedBy::Client, None);
                        }
                        None => {
                            close_sink(&mut upstream_tx, Some(CloseInfo::normal("client gone"))).await;
                            break (ClosedBy::Client, None);
                        }
                    };
                    stats.frames_from_client += 1;
                    stats.touch();
                    let n = stats.frames_from_client;
                    if n == 1 || n.is_multiple_of(50) {
                        tracing::debug!(session_id = %sid, frames = n, bytes = frame.len(), "Relay: client → upstream");
                    }

                    let commands = self.hooks.on_client_frame(&frame);
                    let applied = apply(&sid, self.adapter.as_ref(), &mut upstream_tx, commands).await;
                    let applied = match applied {
                        Ok(Applied::Continue) => send(&mut upstream_tx, frame).await.map(|()| Applied::Continue),
                        other => other,
                    };
                    match applied {
                        Ok(Applied::Continue) => {}
                        Ok(Applied::Close(reason)) => {
                            let info = CloseInfo::normal(reason);
                            close_sink(&mut upstream_tx, Some(info.clone())).await;
                            close_sink(&mut client_tx, Some(info.clone())).await;
                            break (ClosedBy::Policy, Some(info));
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %sid, error = %e, "Relay: upstream send failed");
                            close_sink(&mut client_tx, Some(CloseInfo::normal("upstream unavailable"))).await;
                            break (ClosedBy::Upstream, None);
                        }
                    }
                }

                () = &mut opening, if opening_armed => {
                    opening_armed = false;
                    tracing::debug!(session_id = %sid, "Relay: sending opening turn");
                    let mut failed = None;
                    for frame in self.adapter.opening_turn() {
                        if let Err(e) = send(&mut upstream_tx, Frame::json(&frame)).await {
                            failed = Some(e);
                            break;
                        }
                    }
                    if let Some(e) = failed {
                        tracing::warn!(session_id = %sid, error = %e, "Relay: opening turn send failed");
                        close_sink(&mut client_tx, Some(CloseInfo::normal("upstream unavailable"))).await;
                        break (ClosedBy::Upstream, None);
                    }
                }

                _ = ticker.tick() => {
                    let commands = self.hooks.on_tick(&stats);
                    match apply(&sid, self.adapter.as_ref(), &mut upstream_tx, commands).await {
                        Ok(Applied::Continue) => {}
                        Ok(Applied::Close(reason)) => {
                            let info = CloseInfo::normal(reason);
                            close_sink(&mut upstream_tx, Some(info.clone())).await;
                            close_sink(&mut client_tx, Some(info.clone())).await;
                            break (ClosedBy::Policy, Some(info));
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %sid, error = %e, "Relay: upstream send failed");
                            close_sink(&mut client_tx, Some(CloseInfo::normal("upstream unavailable"))).await;
                            break (ClosedBy::Upstream, None);
                        }
                    }
                }
            }
        };

        tracing::info!(
            session_id = %sid,
            closed_by = ?closed_by,
            elapsed_s = stats.elapsed().as_secs(),
            from_client = stats.frames_from_client,
            from_upstream = stats.frames_from_upstream,
            dropped = stats.dropped,
            "Relay finished"
        );

        (
            self.hooks,
            RelayOutcome {
                closed_by,
                close,
                setup_completed,
                stats,
            },
        )
    }

}

/// Translate hook commands into upstream frames and send them in order.
async fn apply<US>(
    session_id: &str,
    adapter: &dyn ProviderAdapter,
    upstream_tx: &mut US,
    commands: Vec<RelayCommand>,
) -> anyhow::Result<Applied>
where
    US: Sink<Frame> + Unpin,
    US::Error: Display,
{
    for command in commands {
        let frames = match command {
            RelayCommand::UpdateInstructions(text) => {
                tracing::info!(session_id, len = text.len(), "Relay: updating instructions");
                adapter.instruction_update(&text)
            }
            RelayCommand::Inject { text, respond } => {
                tracing::info!(session_id, respond, "Relay: injecting guidance");
                adapter.inject_instruction(&text, respond)
            }
            RelayCommand::Close { reason } => {
                tracing::info!(session_id, reason = %reason, "Relay: closing on policy");
                return Ok(Applied::Close(reason));
            }
        };
        for frame in frames {
            send(upstream_tx, Frame::json(&frame)).await?;
        }
    }
    Ok(Applied::Continue)
}

async fn send<S>(sink: &mut S, frame: Frame) -> anyhow::Result<()>
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    sink.send(frame)
        .await
        .map_err(|e| anyhow::anyhow!("send failed: {e}"))
}

/// Best-effort close; the peer may already be gone.
async fn close_sink<S>(sink: &mut S, info: Option<CloseInfo>)
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    if let Err(e) = sink.send(Frame::Close(info)).await {
        tracing::debug!(error = %e, "Close frame not delivered");
    }
    let _ = sink.close().await;
}

// ── Upstream connection ────────────────────────────────────────────

/// Open the upstream WebSocket and expose it as a frame sink/stream pair.
pub async fn connect_upstream(
    adapter: &dyn ProviderAdapter,
    credential: &str,
) -> anyhow::Result<(
    impl Sink<Frame, Error = tungstenite::Error> + Unpin,
    impl Stream<Item = Result<Frame, tungstenite::Error>> + Unpin,
)> {
    let request = adapter.upstream_request(credential)?;
    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {e}", adapter.kind()))?;

    let (sink, stream) = ws_stream.split();
    let sink = sink.with(|frame: Frame| {
        futures_util::future::ready(Ok::<_, tungstenite::Error>(frame.into_ws()))
    });
    let stream = stream.filter_map(|msg| {
        futures_util::future::ready(match msg {
            Ok(msg) => Frame::from_ws(msg).map(Ok),
            Err(e) => Some(Err(e)),
        })
    });
    Ok((sink, stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::gemini_live::{GeminiLiveAdapter, VadConfig};
    use crate::voice::openai_realtime::OpenAiRealtimeAdapter;
    use serde_json::json;
    use std::convert::Infallible;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_util::sync::PollSender;

    struct Harness {
        /// What the relay sent to the client.
        to_client: mpsc::Receiver<Frame>,
        /// Feed frames as if the client sent them.
        from_client: mpsc::Sender<Frame>,
        /// What the relay sent upstream.
        to_upstream: mpsc::Receiver<Frame>,
        /// Feed frames as if upstream sent them.
        from_upstream: mpsc::Sender<Frame>,
    }

    fn setup() -> SessionSetup {
        SessionSetup {
            system_instruction: "You are Luna.".into(),
            voice: "Aoede".into(),
            language_code: "en-US".into(),
            vad: VadConfig::default(),
            topic_tool: false,
        }
    }

    fn spawn_relay<H: RelayHooks + 'static>(
        adapter: Arc<dyn ProviderAdapter>,
        hooks: H,
    ) -> (Harness, tokio::task::JoinHandle<(H, RelayOutcome)>) {
        let (client_out_tx, to_client) = mpsc::channel(64);
        let (from_client, client_in_rx) = mpsc::channel(64);
        let (upstream_out_tx, to_upstream) = mpsc::channel(64);
        let (from_upstream, upstream_in_rx) = mpsc::channel(64);

        let relay = Relay::new("test", adapter, setup(), hooks)
            .with_opening_delay(Duration::from_millis(20))
            .with_tick_interval(Duration::from_millis(10));
        let handle = tokio::spawn(relay.run(
            PollSender::new(client_out_tx),
            ReceiverStream::new(client_in_rx).map(Ok::<_, Infallible>),
            PollSender::new(upstream_out_tx),
            ReceiverStream::new(upstream_in_rx).map(Ok::<_, Infallible>),
        ));
        (
            Harness {
                to_client,
                from_client,
                to_upstream,
                from_upstream,
            },
            handle,
        )
    }

    fn json_of(frame: &Frame) -> serde_json::Value {
        frame.parse_json().unwrap().unwrap()
    }

    #[tokio::test]
    async fn sends_setup_then_forwards_ack_then_opening_turn() {
        let (mut h, _handle) = spawn_relay(Arc::new(GeminiLiveAdapter::new(None)), ());

        let setup_frame = h.to_upstream.recv().await.unwrap();
        assert_eq!(
            json_of(&setup_frame)["setup"]["systemInstruction"]["parts"][0]["text"],
            "You are Luna."
        );

        let ack = Frame::Binary(br#"{"setupComplete":{}}"#.to_vec());
        h.from_upstream.send(ack.clone()).await.unwrap();
        assert_eq!(h.to_client.recv().await.unwrap(), ack);

        let opening = h.to_upstream.recv().await.unwrap();
        assert_eq!(json_of(&opening)["clientContent"]["turnComplete"], true);
    }

    #[tokio::test]
    async fn setup_phase_messages_are_intercepted() {
        let (mut h, _handle) = spawn_relay(Arc::new(OpenAiRealtimeAdapter::new(None)), ());
        h.to_upstream.recv().await.unwrap();

        h.from_upstream
            .send(Frame::Text(json!({"type": "session.created"}).to_string()))
            .await
            .unwrap();
        let updated = Frame::Text(json!({"type": "session.updated"}).to_string());
        h.from_upstream.send(updated.clone()).await.unwrap();

        // the first thing the client sees is the ack, not session.created
        assert_eq!(h.to_client.recv().await.unwrap(), updated);
        assert_eq!(
            json_of(&h.to_upstream.recv().await.unwrap())["type"],
            "response.create"
        );
    }

    #[tokio::test]
    async fn malformed_upstream_frames_are_dropped_without_closing() {
        let (mut h, _handle) = spawn_relay(Arc::new(GeminiLiveAdapter::new(None)), ());
        h.to_upstream.recv().await.unwrap();

        h.from_upstream.send(Frame::Text("{not json".into())).await.unwrap();
        h.from_upstream.send(Frame::Binary(vec![0, 1, 2])).await.unwrap();
        let good = Frame::Text(json!({"serverContent": {"turnComplete": true}}).to_string());
        h.from_upstream.send(good.clone()).await.unwrap();

        assert_eq!(h.to_client.recv().await.unwrap(), good);
    }

    #[tokio::test]
    async fn client_frames_pass_through_unmodified() {
        let (mut h, _handle) = spawn_relay(Arc::new(GeminiLiveAdapter::new(None)), ());
        h.to_upstream.recv().await.unwrap();

        let audio = Frame::Text(r#"{"realtimeInput":{"mediaChunks":[]}}"#.into());
        let raw = Frame::Binary(vec![7, 7, 7]);
        h.from_client.send(audio.clone()).await.unwrap();
        h.from_client.send(raw.clone()).await.unwrap();

        assert_eq!(h.to_upstream.recv().await.unwrap(), audio);
        assert_eq!(h.to_upstream.recv().await.unwrap(), raw);
    }

    #[tokio::test]
    async fn client_close_closes_upstream() {
        let (mut h, handle) = spawn_relay(Arc::new(GeminiLiveAdapter::new(None)), ());
        h.to_upstream.recv().await.unwrap();

        h.from_client
            .send(Frame::Close(Some(CloseInfo::normal("bye"))))
            .await
            .unwrap();

        assert!(h.to_upstream.recv().await.unwrap().is_close());
        let (_, outcome) = handle.await.unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Client);
        assert_eq!(outcome.close.unwrap().reason, "bye");
    }

    #[tokio::test]
    async fn upstream_close_code_reaches_client() {
        let (mut h, handle) = spawn_relay(Arc::new(GeminiLiveAdapter::new(None)), ());
        h.to_upstream.recv().await.unwrap();

        let info = CloseInfo {
            code: 1008,
            reason: "quota exceeded".into(),
        };
        h.from_upstream.send(Frame::Close(Some(info.clone()))).await.unwrap();

        assert_eq!(h.to_client.recv().await.unwrap(), Frame::Close(Some(info)));
        let (_, outcome) = handle.await.unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Upstream);
        assert!(!outcome.setup_completed);
    }

    /// Steers on the first turn-complete it sees.
    #[derive(Default)]
    struct SteerOnTurn {
        seen: Vec<VoiceEvent>,
        fired: bool,
    }

    impl RelayHooks for SteerOnTurn {
        fn on_upstream_events(&mut self, events: &[VoiceEvent]) -> Vec<RelayCommand> {
            self.seen.extend_from_slice(events);
            if !self.fired && events.contains(&VoiceEvent::TurnComplete) {
                self.fired = true;
                return vec![RelayCommand::UpdateInstructions("Now discuss values.".into())];
            }
            Vec::new()
        }
    }

    #[tokio::test]
    async fn instruction_update_reaches_upstream_before_frame_is_forwarded() {
        let (mut h, handle) = spawn_relay(
            Arc::new(GeminiLiveAdapter::new(None)),
            SteerOnTurn::default(),
        );
        h.to_upstream.recv().await.unwrap();

        let turn = Frame::Text(json!({"serverContent": {"turnComplete": true}}).to_string());
        h.from_upstream.send(turn.clone()).await.unwrap();

        assert_eq!(h.to_client.recv().await.unwrap(), turn);
        // already queued upstream by the time the client saw the frame
        let update = h.to_upstream.try_recv().unwrap();
        assert!(json_of(&update)["clientContent"]["turns"][0]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Now discuss values."));

        drop(h.from_client);
        let (hooks, _) = handle.await.unwrap();
        assert_eq!(hooks.seen, vec![VoiceEvent::TurnComplete]);
    }

    struct CloseOnTick;

    impl RelayHooks for CloseOnTick {
        fn on_tick(&mut self, stats: &RelayStats) -> Vec<RelayCommand> {
            if stats.elapsed() >= Duration::from_millis(30) {
                vec![RelayCommand::Close {
                    reason: "session limit".into(),
                }]
            } else {
                Vec::new()
            }
        }
    }

    #[tokio::test]
    async fn close_command_closes_both_sides() {
        let (mut h, handle) = spawn_relay(Arc::new(GeminiLiveAdapter::new(None)), CloseOnTick);
        h.to_upstream.recv().await.unwrap();

        let (_, outcome) = handle.await.unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Policy);
        assert!(h.to_upstream.recv().await.unwrap().is_close());
        assert!(h.to_client.recv().await.unwrap().is_close());
    }

    struct InjectOnClientText;

    impl RelayHooks for InjectOnClientText {
        fn on_client_frame(&mut self, frame: &Frame) -> Vec<RelayCommand> {
            match frame {
                Frame::Text(_) => vec![RelayCommand::Inject {
                    text: "be brief".into(),
                    respond: false,
                }],
                _ => Vec::new(),
            }
        }
    }

    #[tokio::test]
    async fn client_frame_commands_precede_the_frame() {
        let (mut h, _handle) = spawn_relay(
            Arc::new(GeminiLiveAdapter::new(None)),
            InjectOnClientText,
        );
        h.to_upstream.recv().await.unwrap();

        let frame = Frame::Text("{}".into());
        h.from_client.send(frame.clone()).await.unwrap();

        let injected = h.to_upstream.recv().await.unwrap();
        assert!(json_of(&injected)["clientContent"].is_object());
        assert_eq!(h.to_upstream.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn dropped_upstream_sink_ends_relay() {
        let (mut h, handle) = spawn_relay(Arc::new(GeminiLiveAdapter::new(None)), ());
        h.to_upstream.recv().await.unwrap();
        drop(h.from_upstream);

        let (_, outcome) = handle.await.unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Upstream);
        assert!(h.to_client.recv().await.unwrap().is_close());
    }

    /// `Cell` keeps this `Send` but not `Sync`.
    #[derive(Default)]
    struct EventTally {
        events: std::cell::Cell<usize>,
        audio: std::cell::Cell<usize>,
    }

    impl RelayHooks for EventTally {
        fn on_upstream_events(&mut self, events: &[VoiceEvent]) -> Vec<RelayCommand> {
            self.events.set(self.events.get() + events.len());
            let audio = events
                .iter()
                .filter(|e| matches!(e, VoiceEvent::Audio { .. }))
                .count();
            self.audio.set(self.audio.get() + audio);
            Vec::new()
        }
    }

    #[tokio::test]
    async fn hooks_see_control_events_while_audio_passes_through() {
        let (mut h, handle) =
            spawn_relay(Arc::new(GeminiLiveAdapter::new(None)), EventTally::default());
        h.to_upstream.recv().await.unwrap();

        let frame = Frame::Text(
            json!({"serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQIDBA=="}}]},
                "outputTranscription": {"text": "Hello"}
            }})
            .to_string(),
        );
        h.from_upstream.send(frame.clone()).await.unwrap();
        assert_eq!(h.to_client.recv().await.unwrap(), frame);

        drop(h.from_client);
        let (tally, outcome) = handle.await.unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Client);
        assert_eq!(tally.events.get(), 1);
        assert_eq!(tally.audio.get(), 0);
    }
}
