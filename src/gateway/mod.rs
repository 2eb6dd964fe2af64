//! Axum-based HTTP gateway for browser and native voice clients.
//!
//! ## Routes
//!
//! - `GET /health`: liveness plus the configured provider
//! - `GET /api/scenarios`: topic catalog, optionally with progress (`?completed=a,b`)
//! - `POST /api/voice/token`: short-lived credential for direct upstream connections
//! - `GET /api/voice/live?user_id=...`: WebSocket relayed to the speech provider
//!
//! A live connection runs the whole session lifecycle: prior context is
//! loaded, the orchestrator builds the opening instruction, the relay
//! runs until either side closes, and the post-session pipeline persists
//! the transcript, topic progress, cost estimate and profile.

use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::analysis::{complete_session, HttpProfileAnalyzer, Profile, ProfileAnalyzer, ProfileStatus};
use crate::config::Config;
use crate::error::VoiceError;
use crate::orchestrator::memory::SessionMemory;
use crate::orchestrator::{LiveConversation, LiveSummary, Orchestrator};
use crate::scenarios::ScenarioCatalog;
use crate::store::{InMemorySessionStore, SessionEnd, SessionRecord, SessionStore};
use crate::voice::relay::connect_upstream;
use crate::voice::{create_adapter, ClosedBy, Frame, ProviderAdapter, Relay, SessionSetup};

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<ScenarioCatalog>,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub store: Arc<dyn SessionStore>,
    pub analyzer: Option<Arc<dyn ProfileAnalyzer>>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn from_config(config: Config) -> Result<Self> {
        let adapter = create_adapter(&config.voice);
        let analyzer = HttpProfileAnalyzer::from_config(&config.analysis)?
            .map(|a| Arc::new(a) as Arc<dyn ProfileAnalyzer>);
        if analyzer.is_none() {
            tracing::info!("No analysis endpoint configured, profiles will be stored as degraded");
        }
        Ok(Self {
            config: Arc::new(config),
            catalog: Arc::new(ScenarioCatalog::builtin()),
            adapter,
            store: Arc::new(InMemorySessionStore::new()),
            analyzer,
            http: reqwest::Client::new(),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_analyzer(mut self, analyzer: Option<Arc<dyn ProfileAnalyzer>>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    fn credential(&self) -> Result<String, VoiceError> {
        self.adapter
            .resolve_credential(self.config.voice.api_key.as_deref())
    }
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let local = listener.local_addr()?;
    let state = AppState::from_config(config)?;

    if let Err(e) = state.credential() {
        tracing::warn!(error = %e, "No provider credential; live sessions will be refused");
    }
    tracing::info!(
        addr = %local,
        provider = %state.adapter.kind(),
        model = state.adapter.model(),
        "Luna gateway listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.gateway.allowed_origins);
    let body_limit = state.config.gateway.max_body_bytes;

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/scenarios", get(handle_scenarios))
        .route("/api/voice/token", post(handle_voice_token))
        .route("/api/voice/live", get(handle_voice_live))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(body_limit))
}

/// `*` allows any origin; an empty list allows none (same-origin only).
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }
    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(list))
}

fn error_response(status: StatusCode, message: impl Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
        .into_response()
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "provider": state.adapter.kind(),
        "model": state.adapter.model(),
        "credential": state.credential().is_ok(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ScenarioQuery {
    /// Comma-separated completed topic ids.
    completed: Option<String>,
}

/// GET /api/scenarios
async fn handle_scenarios(
    State(state): State<AppState>,
    Query(query): Query<ScenarioQuery>,
) -> impl IntoResponse {
    let completed: Vec<&str> = query
        .completed
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    Json(serde_json::json!({
        "topics": state.catalog.topics(),
        "next": state.catalog.next_topic(&completed).map(|t| t.id.as_str()),
        "remaining": state
            .catalog
            .remaining(&completed)
            .iter()
            .map(|t| t.id.as_str())
            .collect::<Vec<_>>(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct TokenRequest {
    user_id: Option<String>,
    voice: Option<String>,
}

/// POST /api/voice/token
async fn handle_voice_token(
    State(state): State<AppState>,
    body: Option<Json<TokenRequest>>,
) -> Response {
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let credential = match state.credential() {
        Ok(c) => c,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    };

    let user_id = request.user_id.as_deref().unwrap_or("anonymous");
    let prepared = match prepare_session(&state, user_id, request.voice.as_deref()).await {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Failed to prepare session for token");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };

    match state
        .adapter
        .acquire_token(&state.http, &credential, &prepared.setup)
        .await
    {
        Ok(token) => {
            tracing::info!(user_id, provider = %token.provider, "Issued client token");
            Json(token).into_response()
        }
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Token acquisition failed");
            error_response(StatusCode::BAD_GATEWAY, e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct LiveQuery {
    user_id: String,
    voice: Option<String>,
}

/// GET /api/voice/live (WebSocket)
async fn handle_voice_live(
    State(state): State<AppState>,
    Query(query): Query<LiveQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = query.user_id.trim().to_string();
    if user_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "user_id must not be empty");
    }
    let credential = match state.credential() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Refusing live session");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, e);
        }
    };

    ws.on_upgrade(move |socket| {
        handle_live_socket(state, user_id, query.voice, credential, socket)
    })
}

async fn handle_live_socket(
    state: AppState,
    user_id: String,
    voice: Option<String>,
    credential: String,
    mut socket: WebSocket,
) {
    let prepared = match prepare_session(&state, &user_id, voice.as_deref()).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "Failed to prepare voice session");
            close_with_error(&mut socket, "session setup failed").await;
            return;
        }
    };

    let (upstream_tx, upstream_rx) =
        match connect_upstream(state.adapter.as_ref(), &credential).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Upstream connection failed");
                close_with_error(&mut socket, "voice provider unavailable").await;
                return;
            }
        };

    let (ws_tx, ws_rx) = socket.split();
    let client_tx = ws_tx.with(|frame: Frame| {
        futures_util::future::ready(Ok::<_, axum::Error>(frame.into_axum()))
    });
    let client_rx = ws_rx.filter_map(|msg| {
        futures_util::future::ready(match msg {
            Ok(msg) => Frame::from_axum(msg).map(Ok),
            Err(e) => Some(Err(e)),
        })
    });

    if let Err(e) = run_session(
        &state,
        &user_id,
        prepared,
        client_tx,
        client_rx,
        upstream_tx,
        upstream_rx,
    )
    .await
    {
        tracing::error!(user_id = %user_id, error = %e, "Voice session failed");
    }
}

async fn close_with_error(socket: &mut WebSocket, reason: &str) {
    let frame = CloseFrame {
        code: crate::voice::CloseInfo::INTERNAL_ERROR,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Client already gone");
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// SESSION LIFECYCLE
// ══════════════════════════════════════════════════════════════════════════════

/// Orchestrator and provider setup for a session that has not started yet.
pub struct PreparedSession {
    pub orchestrator: Orchestrator,
    pub setup: SessionSetup,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub closed_by: ClosedBy,
    pub messages: usize,
    pub profile: ProfileStatus,
}

/// Seed memory from stored context and build the opening setup.
pub async fn prepare_session(
    state: &AppState,
    user_id: &str,
    voice: Option<&str>,
) -> Result<PreparedSession> {
    let previous = state.store.previous_context(user_id).await?;
    let memory = SessionMemory::from_previous(&previous);
    let orchestrator = Orchestrator::new(
        Arc::clone(&state.catalog),
        memory,
        state.config.orchestrator.clone(),
    );

    let voice_config = &state.config.voice;
    let setup = SessionSetup {
        system_instruction: orchestrator.system_instruction()?,
        voice: select_voice(
            state.adapter.as_ref(),
            voice.or(voice_config.voice.as_deref()),
        ),
        language_code: voice_config.language_code.clone(),
        vad: voice_config.vad.clone(),
        topic_tool: state.config.orchestrator.dynamic_topic_switching,
    };
    tracing::debug!(
        user_id,
        session_number = previous.session_count + 1,
        voice = %setup.voice,
        "Prepared voice session"
    );
    Ok(PreparedSession {
        orchestrator,
        setup,
    })
}

/// Requested voice when the provider offers it, else the provider default.
fn select_voice(adapter: &dyn ProviderAdapter, requested: Option<&str>) -> String {
    match requested {
        Some(voice) if adapter.is_valid_voice(voice) => voice.to_string(),
        Some(voice) => {
            tracing::warn!(voice, provider = %adapter.kind(), "Unknown voice, using provider default");
            adapter.default_voice().to_string()
        }
        None => adapter.default_voice().to_string(),
    }
}

/// Create the session record, relay until either side closes, then run
/// the post-session pipeline.
#[allow(clippy::too_many_arguments)]
pub async fn run_session<CS, CR, CE, US, UR, UE>(
    state: &AppState,
    user_id: &str,
    prepared: PreparedSession,
    client_tx: CS,
    client_rx: CR,
    upstream_tx: US,
    upstream_rx: UR,
) -> Result<SessionReport>
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
    let record = state
        .store
        .create_session(user_id, state.adapter.kind())
        .await?;
    tracing::info!(
        session_id = %record.id,
        user_id,
        sequence = record.sequence,
        "Voice session started"
    );

    let live = LiveConversation::new(record.id.clone(), prepared.orchestrator);
    let relay = Relay::new(
        record.id.clone(),
        Arc::clone(&state.adapter),
        prepared.setup,
        live,
    )
    .with_opening_delay(state.config.voice.opening_delay());

    let (live, outcome) = relay
        .run(client_tx, client_rx, upstream_tx, upstream_rx)
        .await;
    tracing::info!(
        session_id = %record.id,
        closed_by = ?outcome.closed_by,
        close_code = outcome.close.as_ref().map(|c| c.code),
        setup_completed = outcome.setup_completed,
        from_client = outcome.stats.frames_from_client,
        from_upstream = outcome.stats.frames_from_upstream,
        dropped = outcome.stats.dropped,
        "Relay finished"
    );

    let summary = live.finish();
    let messages = summary.state.transcript.len();
    let profile = finish_session(state, user_id, &record, summary, outcome.stats.elapsed()).await;

    Ok(SessionReport {
        session_id: record.id,
        closed_by: outcome.closed_by,
        messages,
        profile: profile.status,
    })
}

/// Persist transcript, progress and cost, then analyze. Store failures
/// are logged; the profile is always produced.
pub async fn finish_session(
    state: &AppState,
    user_id: &str,
    record: &SessionRecord,
    summary: LiveSummary,
    duration: Duration,
) -> Profile {
    let sid = record.id.as_str();
    let transcript = summary.state.transcript;

    if let Err(e) = state.store.append_messages(sid, &transcript).await {
        tracing::warn!(session_id = %sid, error = %e, "Failed to persist transcript");
    }

    let progress = summary.orchestrator.progress_updates();
    if !progress.is_empty() {
        if let Err(e) = state.store.save_progress(user_id, &progress).await {
            tracing::warn!(session_id = %sid, error = %e, "Failed to persist topic progress");
        }
    }

    let end = SessionEnd::estimate(
        duration,
        state.adapter.kind(),
        state.adapter.cost_per_minute_usd(),
    );
    tracing::info!(
        session_id = %sid,
        duration_secs = duration.as_secs(),
        cost_usd = end.cost_usd,
        topics_completed = summary.state.completed.len(),
        "Voice session ended"
    );
    if let Err(e) = state.store.end_session(sid, end).await {
        tracing::warn!(session_id = %sid, error = %e, "Failed to record session end");
    }

    let profile = complete_session(state.analyzer.as_deref(), &transcript).await;
    if let Err(e) = state.store.save_profile(user_id, &profile).await {
        tracing::warn!(session_id = %sid, error = %e, "Failed to persist profile");
    }
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::TranscriptMessage;
    use crate::voice::gemini_live::GeminiLiveAdapter;
    use crate::voice::VoiceProviderKind;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_util::sync::PollSender;

    struct NamingAnalyzer;

    #[async_trait]
    impl ProfileAnalyzer for NamingAnalyzer {
        async fn analyze(&self, messages: &[TranscriptMessage]) -> Result<Value, VoiceError> {
            assert!(!messages.is_empty());
            Ok(json!({
                "basicInfo": {"name": "Mina"},
                "summary": "Warm and direct.",
                "keyInsights": ["Lives in Busan"]
            }))
        }
    }

    fn state(api_key: Option<&str>) -> (AppState, Arc<InMemorySessionStore>) {
        let mut config = Config::default();
        config.voice.api_key = api_key.map(str::to_string);
        config.voice.opening_delay_ms = 10;
        let store = Arc::new(InMemorySessionStore::new());
        let state = AppState::from_config(config)
            .unwrap()
            .with_adapter(Arc::new(GeminiLiveAdapter::new(None)))
            .with_store(store.clone());
        (state, store)
    }

    async fn serve(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn json_of(frame: &Frame) -> Value {
        frame.parse_json().unwrap().unwrap()
    }

    fn text(value: Value) -> Frame {
        Frame::Text(value.to_string())
    }

    #[tokio::test]
    async fn health_reports_provider() {
        let (state, _) = state(Some("k"));
        let base = serve(state).await;
        let body: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["credential"], true);
    }

    #[tokio::test]
    async fn scenarios_honour_completed_list() {
        let (state, _) = state(None);
        let base = serve(state).await;
        let body: Value = reqwest::get(format!("{base}/api/scenarios?completed=intro"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["next"], "love_history");
        assert!(body["topics"].as_array().unwrap().len() > 1);
        assert!(!body["remaining"]
            .as_array()
            .unwrap()
            .iter()
            .any(|id| id == "intro"));
    }

    #[tokio::test]
    async fn token_is_minted_and_never_echoes_server_key() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mint = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth_tokens"))
            .and(header("x-goog-api-key", "SERVER-MASTER-KEY"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"name": "auth_tokens/short"})),
            )
            .mount(&mint)
            .await;

        let (state, _) = state(Some("SERVER-MASTER-KEY"));
        let state =
            state.with_adapter(Arc::new(GeminiLiveAdapter::new(None).with_api_base(mint.uri())));
        let base = serve(state).await;
        let response = reqwest::Client::new()
            .post(format!("{base}/api/voice/token"))
            .json(&json!({"user_id": "u1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let raw = response.text().await.unwrap();
        assert!(!raw.contains("SERVER-MASTER-KEY"));
        let body: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(body["token"], "auth_tokens/short");
        assert!(body["expires_at"].is_i64());
    }

    #[tokio::test]
    async fn token_mint_failure_is_bad_gateway_without_key() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mint = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mint)
            .await;

        let (state, _) = state(Some("SERVER-MASTER-KEY"));
        let state =
            state.with_adapter(Arc::new(GeminiLiveAdapter::new(None).with_api_base(mint.uri())));
        let base = serve(state).await;
        let response = reqwest::Client::new()
            .post(format!("{base}/api/voice/token"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
        assert!(!response.text().await.unwrap().contains("SERVER-MASTER-KEY"));
    }

    #[tokio::test]
    async fn live_without_user_id_is_rejected() {
        let (state, _) = state(Some("k"));
        let base = serve(state).await.replace("http://", "ws://");
        let err = tokio_tungstenite::connect_async(format!("{base}/api/voice/live?user_id=%20"))
            .await
            .err()
            .unwrap();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), 400);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn unknown_voice_falls_back_to_default() {
        let adapter = GeminiLiveAdapter::new(None);
        assert_eq!(select_voice(&adapter, Some("Nope")), adapter.default_voice());
        assert_eq!(select_voice(&adapter, None), adapter.default_voice());
        let valid = adapter.voices()[0];
        assert_eq!(select_voice(&adapter, Some(valid)), valid);
    }

    #[tokio::test]
    async fn relayed_session_persists_and_seeds_the_next_one() {
        let (state, store) = state(Some("k"));
        let state = state.with_analyzer(Some(Arc::new(NamingAnalyzer)));

        let prepared = prepare_session(&state, "u1", None).await.unwrap();
        assert!(prepared.setup.topic_tool);
        assert!(prepared
            .setup
            .system_instruction
            .contains("first conversation"));

        let (client_out_tx, mut to_client) = mpsc::channel(64);
        let (from_client, client_in_rx) = mpsc::channel::<Frame>(64);
        let (upstream_out_tx, mut to_upstream) = mpsc::channel(64);
        let (from_upstream, upstream_in_rx) = mpsc::channel::<Frame>(64);

        let relay_state = state.clone();
        let handle = tokio::spawn(async move {
            run_session(
                &relay_state,
                "u1",
                prepared,
                PollSender::new(client_out_tx),
                ReceiverStream::new(client_in_rx).map(Ok::<_, Infallible>),
                PollSender::new(upstream_out_tx),
                ReceiverStream::new(upstream_in_rx).map(Ok::<_, Infallible>),
            )
            .await
        });

        let setup = to_upstream.recv().await.unwrap();
        assert!(json_of(&setup)["setup"]["tools"].is_array());
        from_upstream
            .send(text(json!({"setupComplete": {}})))
            .await
            .unwrap();
        to_client.recv().await.unwrap();
        let opening = to_upstream.recv().await.unwrap();
        assert_eq!(json_of(&opening)["clientContent"]["turnComplete"], true);

        from_upstream
            .send(text(json!({"serverContent": {
                "inputTranscription": {"text": "I'm Mina, from Busan."},
                "outputTranscription": {"text": "Lovely to meet you, Mina."},
                "turnComplete": true
            }})))
            .await
            .unwrap();
        from_upstream
            .send(text(json!({"toolCall": {"functionCalls": [{
                "id": "fc-1",
                "name": "complete_topic",
                "args": {"topic_id": "intro", "summary": "Mina, Busan", "confidence": "high"}
            }]}})))
            .await
            .unwrap();
        let update = to_upstream.recv().await.unwrap();
        assert!(json_of(&update)["clientContent"]["turns"][0]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Updated instructions"));

        drop(from_client);
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.closed_by, ClosedBy::Client);
        assert_eq!(report.messages, 2);
        assert_eq!(report.profile, ProfileStatus::Analyzed);

        let record = store.session(&report.session_id).unwrap();
        assert_eq!(record.provider, VoiceProviderKind::GeminiLive);
        assert!(record.ended_at.is_some());
        assert!(record.cost_usd.is_some());
        assert_eq!(store.messages(&report.session_id).len(), 2);

        let context = store.previous_context("u1").await.unwrap();
        assert_eq!(context.session_count, 1);
        assert!(context.topic_progress["intro"].explored);
        assert_eq!(context.known_name.as_deref(), Some("Mina"));

        let next = prepare_session(&state, "u1", None).await.unwrap();
        let prompt = next.setup.system_instruction;
        assert!(prompt.contains("conversation number 2 with Mina"));
        assert!(!prompt.contains("first conversation"));
    }

    #[tokio::test]
    async fn empty_session_stores_placeholder_profile() {
        let (state, store) = state(Some("k"));
        let prepared = prepare_session(&state, "quiet", None).await.unwrap();

        let (client_out_tx, _to_client) = mpsc::channel(64);
        let (from_client, client_in_rx) = mpsc::channel::<Frame>(64);
        let (upstream_out_tx, mut to_upstream) = mpsc::channel(64);
        let (_from_upstream, upstream_in_rx) = mpsc::channel::<Frame>(64);

        let relay_state = state.clone();
        let handle = tokio::spawn(async move {
            run_session(
                &relay_state,
                "quiet",
                prepared,
                PollSender::new(client_out_tx),
                ReceiverStream::new(client_in_rx).map(Ok::<_, Infallible>),
                PollSender::new(upstream_out_tx),
                ReceiverStream::new(upstream_in_rx).map(Ok::<_, Infallible>),
            )
            .await
        });
        to_upstream.recv().await.unwrap();
        drop(from_client);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.messages, 0);
        assert_eq!(report.profile, ProfileStatus::NoContent);
        assert_eq!(store.profiles("quiet")[0].status, ProfileStatus::NoContent);
    }
}
