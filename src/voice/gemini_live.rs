//! Gemini Live adapter.
//!
//! Speaks the bidirectional streaming protocol of Google's Gemini Live
//! API (BidiGenerateContent).
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open WebSocket to the Gemini Live endpoint (`?key=`)
//! 2. **Setup**: send the setup frame (model, voice, VAD, system prompt, tools)
//! 3. **Ack**: upstream answers `{"setupComplete": {}}`
//! 4. **Stream**: audio goes up as `realtimeInput`, speech and transcripts
//!    come back as `serverContent`; tool calls arrive as `toolCall`
//!
//! ## Binary Frame Protocol
//!
//! Gemini Live sends **all** messages as WebSocket Binary frames,
//! including JSON control messages like `setupComplete`. Callers detect
//! JSON in Binary frames (content starting with `{`) via
//! [`Frame::parse_json`](super::Frame::parse_json).

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use super::provider::{
    complete_topic_parameters, ClientToken, ProviderAdapter, SessionSetup, VoiceProviderKind,
    COMPLETE_TOPIC_DESCRIPTION, COMPLETE_TOPIC_TOOL,
};
use super::{ToolCall, VoiceEvent};
use crate::audio::{WireFrame, PLAYBACK_SAMPLE_RATE, WIRE_SAMPLE_RATE};

// ── Constants ──────────────────────────────────────────────────────

/// Gemini Live WebSocket endpoint.
const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// REST base for minting ephemeral client tokens.
const GEMINI_AUTH_API_BASE: &str = "https://generativelanguage.googleapis.com/v1alpha";

/// Lifetime of a minted client token.
const CLIENT_TOKEN_TTL_SECS: i64 = 30 * 60;

/// Window in which a minted token may open its single session.
const CLIENT_TOKEN_OPEN_WINDOW_SECS: i64 = 60;

/// Prebuilt voices offered by the native-audio models.
const VOICES: &[&str] = &[
    "Aoede", "Kore", "Leda", "Zephyr", "Puck", "Charon", "Fenrir", "Orus",
];

/// Opening nudge so the agent greets the user first.
const OPENING_TURN_TEXT: &str = "(The user has just joined the call. Greet them warmly and begin.)";

// ── VAD Configuration ──────────────────────────────────────────────

/// Voice Activity Detection sensitivity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VadSensitivity {
    #[serde(rename = "START_SENSITIVITY_HIGH", alias = "high")]
    High,
    #[serde(rename = "START_SENSITIVITY_LOW", alias = "low")]
    Low,
}

/// End-of-speech detection sensitivity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndSensitivity {
    #[serde(rename = "END_SENSITIVITY_HIGH", alias = "high")]
    High,
    #[serde(rename = "END_SENSITIVITY_LOW", alias = "low")]
    Low,
}

/// Automatic Activity Detection (VAD) configuration.
///
/// Start and end sensitivity are tuned separately: a low start sensitivity
/// ignores background chatter, a low end sensitivity lets the user pause
/// to think without the agent jumping in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Whether automatic activity detection is disabled.
    pub disabled: bool,
    /// How sensitive the start-of-speech detector is.
    #[serde(rename = "startOfSpeechSensitivity", alias = "start_sensitivity")]
    pub start_sensitivity: VadSensitivity,
    /// How sensitive the end-of-speech detector is.
    #[serde(rename = "endOfSpeechSensitivity", alias = "end_sensitivity")]
    pub end_sensitivity: EndSensitivity,
    /// Milliseconds of audio before detected speech start to include.
    #[serde(rename = "prefixPaddingMs", alias = "prefix_padding_ms")]
    pub prefix_padding_ms: u32,
    /// Milliseconds of silence before declaring speech ended.
    #[serde(rename = "silenceDurationMs", alias = "silence_duration_ms")]
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            start_sensitivity: VadSensitivity::Low,
            end_sensitivity: EndSensitivity::Low,
            prefix_padding_ms: 20,
            silence_duration_ms: 800,
        }
    }
}

// ── Setup message (JSON sent as first frame) ───────────────────────

/// Top-level setup message for Gemini Live session initialization.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction")]
    pub system_instruction: SystemInstruction,
    #[serde(rename = "realtimeInputConfig")]
    pub realtime_input_config: RealtimeInputConfig,
    #[serde(rename = "inputAudioTranscription")]
    pub input_audio_transcription: TranscriptionConfig,
    #[serde(rename = "outputAudioTranscription")]
    pub output_audio_transcription: TranscriptionConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
    #[serde(rename = "languageCode")]
    pub language_code: String,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInputConfig {
    #[serde(rename = "automaticActivityDetection")]
    pub automatic_activity_detection: VadConfig,
}

/// Empty object enabling transcription of one audio direction.
#[derive(Debug, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Serialize)]
pub struct Tool {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Build the setup message for an onboarding session.
pub fn build_setup_message(model: &str, setup: &SessionSetup) -> SetupMessage {
    let model = if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    };

    let tools = if setup.topic_tool {
        vec![Tool {
            function_declarations: vec![FunctionDeclaration {
                name: COMPLETE_TOPIC_TOOL.to_string(),
                description: COMPLETE_TOPIC_DESCRIPTION.to_string(),
                parameters: complete_topic_parameters(),
            }],
        }]
    } else {
        Vec::new()
    };

    SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                    language_code: setup.language_code.clone(),
                },
            },
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: setup.vad.clone(),
            },
            input_audio_transcription: TranscriptionConfig {},
            output_audio_transcription: TranscriptionConfig {},
            tools,
        },
    }
}

// ── Client content ─────────────────────────────────────────────────

/// Text turn sent as `clientContent`. With `turn_complete` false the model
/// folds it into context without answering.
fn client_text(text: &str, turn_complete: bool) -> serde_json::Value {
    serde_json::json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }]
            }],
            "turnComplete": turn_complete,
        }
    })
}

/// Build a realtime audio input message.
///
/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}`
///
/// `mediaChunks` is marked deprecated in favor of `audio`, but the
/// official SDKs still emit `mediaChunks` on the wire.
pub fn build_audio_message(frame: &WireFrame) -> serde_json::Value {
    serde_json::json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": frame.mime_type(),
                "data": frame.data,
            }]
        }
    })
}

// ── Server message parsing ─────────────────────────────────────────

/// Parse one Gemini Live server message into events.
///
/// A single server message can contain multiple events (e.g., audio
/// chunks + transcription in the same frame).
pub fn parse_server_message(value: &serde_json::Value) -> Vec<VoiceEvent> {
    parse_message(value, true)
}

/// [`parse_server_message`] without audio parts.
pub fn parse_control_message(value: &serde_json::Value) -> Vec<VoiceEvent> {
    parse_message(value, false)
}

fn parse_message(value: &serde_json::Value, decode_audio: bool) -> Vec<VoiceEvent> {
    let mut events = Vec::new();

    if value.get("setupComplete").is_some() {
        events.push(VoiceEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::Interrupted);
        }
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(data_b64) = part
                    .pointer("/inlineData/data")
                    .and_then(|v| v.as_str())
                    .filter(|_| decode_audio)
                {
                    match base64::engine::general_purpose::STANDARD.decode(data_b64) {
                        Ok(data) => events.push(VoiceEvent::Audio { data }),
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping Gemini audio part: bad base64");
                        }
                    }
                }
                // native-audio models emit thought text parts; only
                // outputTranscription is the spoken transcript
                if part.get("thought").and_then(|v| v.as_bool()) != Some(true) {
                    if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                        events.push(VoiceEvent::OutputTranscript {
                            text: text.to_string(),
                        });
                    }
                }
            }
        }
        for (key, is_input) in [("inputTranscription", true), ("outputTranscription", false)] {
            if let Some(text) = content
                .get(key)
                .and_then(|t| t.get("text"))
                .and_then(|v| v.as_str())
                .filter(|t| !t.is_empty())
            {
                events.push(if is_input {
                    VoiceEvent::InputTranscript { text: text.to_string() }
                } else {
                    VoiceEvent::OutputTranscript { text: text.to_string() }
                });
            }
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::TurnComplete);
        }
    }

    if let Some(calls) = value
        .pointer("/toolCall/functionCalls")
        .and_then(|v| v.as_array())
    {
        for call in calls {
            let Some(name) = call.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            events.push(VoiceEvent::ToolCall(ToolCall {
                id: call
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: name.to_string(),
                args: call.get("args").cloned().unwrap_or(serde_json::Value::Null),
            }));
        }
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(VoiceEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

// ── Adapter ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthTokenResponse {
    /// `auth_tokens/...`; the whole name is the client credential.
    name: String,
}

pub struct GeminiLiveAdapter {
    model: String,
    api_base: String,
}

impl GeminiLiveAdapter {
    pub fn new(model: Option<String>) -> Self {
        Self {
            model: model.unwrap_or_else(|| VoiceProviderKind::GeminiLive.model_id().to_string()),
            api_base: GEMINI_AUTH_API_BASE.to_string(),
        }
    }

    /// Point token minting at a different REST base.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Body for a single-use token locked to this model and session setup.
    fn auth_token_request(&self, setup: &SessionSetup, now: DateTime<Utc>) -> serde_json::Value {
        let setup = build_setup_message(&self.model, setup).setup;
        let expire = now + chrono::Duration::seconds(CLIENT_TOKEN_TTL_SECS);
        let open_by = now + chrono::Duration::seconds(CLIENT_TOKEN_OPEN_WINDOW_SECS);
        serde_json::json!({
            "uses": 1,
            "expireTime": expire.to_rfc3339_opts(SecondsFormat::Secs, true),
            "newSessionExpireTime": open_by.to_rfc3339_opts(SecondsFormat::Secs, true),
            "liveConnectConstraints": {
                "model": setup.model,
                "config": {
                    "generationConfig": setup.generation_config,
                    "systemInstruction": setup.system_instruction,
                },
            },
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiLiveAdapter {
    fn kind(&self) -> VoiceProviderKind {
        VoiceProviderKind::GeminiLive
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn voices(&self) -> &'static [&'static str] {
        VOICES
    }

    fn default_voice(&self) -> &'static str {
        "Aoede"
    }

    fn input_sample_rate(&self) -> u32 {
        WIRE_SAMPLE_RATE
    }

    fn output_sample_rate(&self) -> u32 {
        PLAYBACK_SAMPLE_RATE
    }

    fn cost_per_minute_usd(&self) -> f64 {
        0.023
    }

    fn upstream_request(&self, credential: &str) -> anyhow::Result<Request> {
        let mut url = reqwest::Url::parse(GEMINI_LIVE_WS_URL)?;
        url.query_pairs_mut().append_pair("key", credential);
        url.as_str()
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("Failed to build Gemini Live request: {e}"))
    }

    fn setup_frame(&self, setup: &SessionSetup) -> serde_json::Value {
        serde_json::to_value(build_setup_message(&self.model, setup))
            .unwrap_or(serde_json::Value::Null)
    }

    fn is_setup_complete(&self, msg: &serde_json::Value) -> bool {
        msg.get("setupComplete").is_some()
    }

    fn opening_turn(&self) -> Vec<serde_json::Value> {
        vec![client_text(OPENING_TURN_TEXT, true)]
    }

    fn instruction_update(&self, system_instruction: &str) -> Vec<serde_json::Value> {
        // systemInstruction is fixed once setup completes; updated behavior
        // goes in as silent context instead
        vec![client_text(
            &format!("[Updated instructions: follow these from now on]\n{system_instruction}"),
            false,
        )]
    }

    fn inject_instruction(&self, text: &str, respond: bool) -> Vec<serde_json::Value> {
        vec![client_text(&format!("[Guidance] {text}"), respond)]
    }

    fn audio_input(&self, frame: &WireFrame) -> serde_json::Value {
        build_audio_message(frame)
    }

    fn tool_response(&self, call: &ToolCall, output: &serde_json::Value) -> Vec<serde_json::Value> {
        vec![serde_json::json!({
            "toolResponse": {
                "functionResponses": [{
                    "id": call.id,
                    "name": call.name,
                    "response": output,
                }]
            }
        })]
    }

    fn parse_events(&self, msg: &serde_json::Value) -> Vec<VoiceEvent> {
        parse_server_message(msg)
    }

    fn parse_control_events(&self, msg: &serde_json::Value) -> Vec<VoiceEvent> {
        parse_control_message(msg)
    }

    async fn acquire_token(
        &self,
        http: &reqwest::Client,
        credential: &str,
        setup: &SessionSetup,
    ) -> anyhow::Result<ClientToken> {
        let now = Utc::now();
        let response = http
            .post(format!("{}/auth_tokens", self.api_base))
            .header("x-goog-api-key", credential)
            .json(&self.auth_token_request(setup, now))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini token mint failed ({status}): {text}");
        }

        let minted: AuthTokenResponse = response.json().await?;
        if minted.name.is_empty() || minted.name == credential {
            anyhow::bail!("Gemini token mint returned no usable token");
        }
        Ok(ClientToken {
            provider: VoiceProviderKind::GeminiLive,
            model: self.model.clone(),
            token: minted.name,
            expires_at: Some(now.timestamp() + CLIENT_TOKEN_TTL_SECS),
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────
