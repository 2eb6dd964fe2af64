//! OpenAI Realtime adapter.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: WebSocket to `wss://api.openai.com/v1/realtime?model=...`
//!    with `Authorization: Bearer` and `OpenAI-Beta: realtime=v1`
//! 2. **Setup**: upstream greets with `session.created` (intercepted);
//!    we send `session.update` with instructions, voice, VAD and tools;
//!    `session.updated` is the acknowledgment
//! 3. **Stream**: send `input_audio_buffer.append` (Base64 PCM16 24kHz),
//!    receive `response.audio.delta` (Base64 PCM16 24kHz)
//! 4. **Tools**: `response.function_call_arguments.done` carries a call,
//!    answered with a `function_call_output` item plus `response.create`

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use super::gemini_live::{EndSensitivity, VadConfig};
use super::provider::{
    complete_topic_parameters, ClientToken, ProviderAdapter, SessionSetup, VoiceProviderKind,
    COMPLETE_TOPIC_DESCRIPTION, COMPLETE_TOPIC_TOOL,
};
use super::{ToolCall, VoiceEvent};
use crate::audio::WireFrame;

// ── Constants ──────────────────────────────────────────────────────

/// OpenAI Realtime WebSocket endpoint.
const OPENAI_REALTIME_WS_URL: &str = "wss://api.openai.com/v1/realtime";

/// REST base for minting ephemeral client secrets.
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI Realtime uses 24kHz for both input and output (unlike Gemini's 16kHz input).
pub const SAMPLE_RATE: u32 = 24_000;

const VOICES: &[&str] = &[
    "coral", "shimmer", "sage", "alloy", "ash", "ballad", "echo", "verse",
];

// ── Session configuration ──────────────────────────────────────────

/// Map the shared VAD block onto semantic VAD. End-of-speech sensitivity
/// drives eagerness; a disabled detector turns server-side turns off.
fn turn_detection(vad: &VadConfig) -> serde_json::Value {
    if vad.disabled {
        return serde_json::Value::Null;
    }
    let eagerness = match vad.end_sensitivity {
        EndSensitivity::High => "high",
        EndSensitivity::Low => "low",
    };
    serde_json::json!({
        "type": "semantic_vad",
        "eagerness": eagerness,
    })
}

fn session_config(setup: &SessionSetup) -> serde_json::Value {
    let mut session = serde_json::json!({
        "modalities": ["audio", "text"],
        "instructions": setup.system_instruction,
        "voice": setup.voice,
        "input_audio_format": "pcm16",
        "output_audio_format": "pcm16",
        "input_audio_transcription": {
            "model": "gpt-4o-mini-transcribe",
            "language": setup.language_code.split('-').next().unwrap_or("en"),
        },
        "turn_detection": turn_detection(&setup.vad),
    });
    if setup.topic_tool {
        session["tools"] = serde_json::json!([{
            "type": "function",
            "name": COMPLETE_TOPIC_TOOL,
            "description": COMPLETE_TOPIC_DESCRIPTION,
            "parameters": complete_topic_parameters(),
        }]);
        session["tool_choice"] = serde_json::json!("auto");
    }
    session
}

fn build_session_update(setup: &SessionSetup) -> serde_json::Value {
    serde_json::json!({
        "type": "session.update",
        "session": session_config(setup),
    })
}

fn response_create() -> serde_json::Value {
    serde_json::json!({"type": "response.create"})
}

fn system_item(text: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "system",
            "content": [{ "type": "input_text", "text": text }]
        }
    })
}

// ── Server event parsing ───────────────────────────────────────────

/// Parse an OpenAI Realtime server event into VoiceEvents.
pub fn parse_server_event(value: &serde_json::Value) -> Vec<VoiceEvent> {
    parse_event(value, true)
}

/// [`parse_server_event`] without audio deltas.
pub fn parse_control_event(value: &serde_json::Value) -> Vec<VoiceEvent> {
    parse_event(value, false)
}

fn parse_event(value: &serde_json::Value, decode_audio: bool) -> Vec<VoiceEvent> {
    let mut events = Vec::new();
    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "session.updated" => events.push(VoiceEvent::SetupComplete),

        "response.audio.delta" if decode_audio => {
            if let Some(delta_b64) = value.get("delta").and_then(|v| v.as_str()) {
                match base64::engine::general_purpose::STANDARD.decode(delta_b64) {
                    Ok(data) => events.push(VoiceEvent::Audio { data }),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping OpenAI audio delta: bad base64");
                    }
                }
            }
        }

        "response.audio_transcript.delta" => {
            if let Some(text) = value.get("delta").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(VoiceEvent::OutputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }

        "conversation.item.input_audio_transcription.completed" => {
            if let Some(text) = value.get("transcript").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(VoiceEvent::InputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }

        "response.function_call_arguments.done" => {
            let args = value
                .get("arguments")
                .and_then(|v| v.as_str())
                .map(|raw| {
                    serde_json::from_str(raw).unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "Tool call arguments are not valid JSON");
                        serde_json::Value::Null
                    })
                })
                .unwrap_or(serde_json::Value::Null);
            events.push(VoiceEvent::ToolCall(ToolCall {
                id: value
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: value
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                args,
            }));
        }

        "response.done" => events.push(VoiceEvent::TurnComplete),

        // server VAD heard the user while audio may still be playing
        "input_audio_buffer.speech_started" | "response.cancelled" => {
            events.push(VoiceEvent::Interrupted);
        }

        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown OpenAI error");
            events.push(VoiceEvent::Error {
                message: message.to_string(),
            });
        }

        _ => {
            tracing::trace!(event_type = event_type, "OpenAI Realtime event (unhandled)");
        }
    }

    events
}

// ── Ephemeral token ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RealtimeSessionResponse {
    client_secret: ClientSecret,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    expires_at: Option<i64>,
}

// ── Adapter ────────────────────────────────────────────────────────

pub struct OpenAiRealtimeAdapter {
    model: String,
    api_base: String,
}

impl OpenAiRealtimeAdapter {
    pub fn new(model: Option<String>) -> Self {
        Self {
            model: model
                .unwrap_or_else(|| VoiceProviderKind::OpenAiRealtime.model_id().to_string()),
            api_base: OPENAI_API_BASE.to_string(),
        }
    }

    /// Point token minting at a different REST base.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiRealtimeAdapter {
    fn kind(&self) -> VoiceProviderKind {
        VoiceProviderKind::OpenAiRealtime
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn voices(&self) -> &'static [&'static str] {
        VOICES
    }

    fn default_voice(&self) -> &'static str {
        "coral"
    }

    fn input_sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn output_sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn cost_per_minute_usd(&self) -> f64 {
        0.15
    }

    fn upstream_request(&self, credential: &str) -> anyhow::Result<Request> {
        let mut request = format!("{OPENAI_REALTIME_WS_URL}?model={}", self.model)
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("Failed to build WebSocket request: {e}"))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {credential}")
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid auth header: {e}"))?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1"
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid header: {e}"))?,
        );
        Ok(request)
    }

    fn setup_frame(&self, setup: &SessionSetup) -> serde_json::Value {
        build_session_update(setup)
    }

    fn is_setup_complete(&self, msg: &serde_json::Value) -> bool {
        msg.get("type").and_then(|v| v.as_str()) == Some("session.updated")
    }

    fn is_setup_phase(&self, msg: &serde_json::Value) -> bool {
        msg.get("type").and_then(|v| v.as_str()) == Some("session.created")
    }

    fn opening_turn(&self) -> Vec<serde_json::Value> {
        vec![response_create()]
    }

    fn instruction_update(&self, system_instruction: &str) -> Vec<serde_json::Value> {
        vec![serde_json::json!({
            "type": "session.update",
            "session": { "instructions": system_instruction },
        })]
    }

    fn inject_instruction(&self, text: &str, respond: bool) -> Vec<serde_json::Value> {
        let mut frames = vec![system_item(text)];
        if respond {
            frames.push(response_create());
        }
        frames
    }

    fn audio_input(&self, frame: &WireFrame) -> serde_json::Value {
        serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": frame.data,
        })
    }

    fn tool_response(&self, call: &ToolCall, output: &serde_json::Value) -> Vec<serde_json::Value> {
        vec![
            serde_json::json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "function_call_output",
                    "call_id": call.id,
                    "output": output.to_string(),
                }
            }),
            response_create(),
        ]
    }

    fn parse_events(&self, msg: &serde_json::Value) -> Vec<VoiceEvent> {
        parse_server_event(msg)
    }

    fn parse_control_events(&self, msg: &serde_json::Value) -> Vec<VoiceEvent> {
        parse_control_event(msg)
    }

    async fn acquire_token(
        &self,
        http: &reqwest::Client,
        credential: &str,
        setup: &SessionSetup,
    ) -> anyhow::Result<ClientToken> {
        let mut body = session_config(setup);
        body["model"] = serde_json::json!(self.model);

        let response = http
            .post(format!("{}/realtime/sessions", self.api_base))
            .bearer_auth(credential)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI session mint failed ({status}): {text}");
        }

        let minted: RealtimeSessionResponse = response.json().await?;
        Ok(ClientToken {
            provider: VoiceProviderKind::OpenAiRealtime,
            model: self.model.clone(),
            token: minted.client_secret.value,
            expires_at: minted.client_secret.expires_at,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────
