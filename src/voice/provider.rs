//! Upstream provider abstraction.
//!
//! Everything vendor-specific about the live speech endpoint (handshake
//! shape, event vocabulary, audio rates, credential placement, voice
//! catalog) lives behind [`ProviderAdapter`]. The relay, the orchestrator
//! and the client session are written once against this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use super::gemini_live::{GeminiLiveAdapter, VadConfig};
use super::openai_realtime::OpenAiRealtimeAdapter;
use super::{ToolCall, VoiceEvent};
use crate::audio::WireFrame;
use crate::config::VoiceConfig;
use crate::error::VoiceError;

/// Name of the function tool the model calls when it has finished a topic.
pub const COMPLETE_TOPIC_TOOL: &str = "complete_topic";

// ── Provider kind ────────────────────────────────────────────────

/// Kind of voice provider backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VoiceProviderKind {
    /// Gemini 2.5 Flash Native Audio Dialog.
    #[default]
    #[serde(rename = "gemini")]
    GeminiLive,
    /// OpenAI GPT-4o Realtime.
    #[serde(rename = "openai")]
    OpenAiRealtime,
}

impl VoiceProviderKind {
    /// Get the model identifier string for API calls.
    pub fn model_id(self) -> &'static str {
        match self {
            Self::GeminiLive => "gemini-2.5-flash-native-audio-preview-12-2025",
            Self::OpenAiRealtime => "gpt-4o-realtime-preview",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GeminiLive => "gemini",
            Self::OpenAiRealtime => "openai",
        }
    }

    /// Environment variables consulted, in order, when no key is configured.
    pub fn credential_env_vars(self) -> &'static [&'static str] {
        match self {
            Self::GeminiLive => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            Self::OpenAiRealtime => &["OPENAI_API_KEY"],
        }
    }
}

impl std::fmt::Display for VoiceProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VoiceProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "gemini_live" | "google" => Ok(Self::GeminiLive),
            "openai" | "openai_realtime" => Ok(Self::OpenAiRealtime),
            other => anyhow::bail!("unknown voice provider '{other}' (expected gemini or openai)"),
        }
    }
}

// ── Session setup ────────────────────────────────────────────────

/// Everything the setup frame needs, independent of vendor wire shape.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    /// Fully assembled system instruction from the orchestrator.
    pub system_instruction: String,
    pub voice: String,
    /// BCP-47 language code for speech output, e.g. `en-US`.
    pub language_code: String,
    pub vad: VadConfig,
    /// Declare the `complete_topic` function tool.
    pub topic_tool: bool,
}

/// Short-lived credential handed to a client that connects upstream directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientToken {
    pub provider: VoiceProviderKind,
    pub model: String,
    pub token: String,
    /// Unix seconds; `None` when the provider reports no expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

// ── Adapter trait ────────────────────────────────────────────────

/// Vendor capability interface used by the relay and the client session.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> VoiceProviderKind;

    /// Model identifier sent upstream.
    fn model(&self) -> &str;

    /// Voices this provider can speak with.
    fn voices(&self) -> &'static [&'static str];

    fn default_voice(&self) -> &'static str;

    /// Sample rate the provider expects for microphone audio.
    fn input_sample_rate(&self) -> u32;

    /// Sample rate of audio the provider returns.
    fn output_sample_rate(&self) -> u32;

    /// Approximate blended audio price, used for session cost estimates.
    fn cost_per_minute_usd(&self) -> f64;

    /// Build the authenticated WebSocket request for the upstream endpoint.
    fn upstream_request(&self, credential: &str) -> anyhow::Result<Request>;

    /// The single setup frame sent when the upstream channel opens.
    fn setup_frame(&self, setup: &SessionSetup) -> serde_json::Value;

    /// Whether `msg` acknowledges the setup frame.
    fn is_setup_complete(&self, msg: &serde_json::Value) -> bool;

    /// Setup-phase messages are consumed by the relay, never forwarded.
    fn is_setup_phase(&self, _msg: &serde_json::Value) -> bool {
        false
    }

    /// Frames that make the agent speak first.
    fn opening_turn(&self) -> Vec<serde_json::Value>;

    /// Replace the behavior instructions mid-session.
    fn instruction_update(&self, system_instruction: &str) -> Vec<serde_json::Value>;

    /// Inject a one-off steering note; `respond` asks the model to react now.
    fn inject_instruction(&self, text: &str, respond: bool) -> Vec<serde_json::Value>;

    fn audio_input(&self, frame: &WireFrame) -> serde_json::Value;

    fn tool_response(&self, call: &ToolCall, output: &serde_json::Value) -> Vec<serde_json::Value>;

    /// Parse one upstream JSON message into provider-agnostic events.
    fn parse_events(&self, msg: &serde_json::Value) -> Vec<VoiceEvent>;

    /// Like [`parse_events`](Self::parse_events) but never yields
    /// [`VoiceEvent::Audio`], so audio payloads are not decoded.
    fn parse_control_events(&self, msg: &serde_json::Value) -> Vec<VoiceEvent> {
        self.parse_events(msg)
            .into_iter()
            .filter(|e| !matches!(e, VoiceEvent::Audio { .. }))
            .collect()
    }

    /// Mint a short-lived credential the client may use. The configured
    /// key itself is never handed out.
    async fn acquire_token(
        &self,
        http: &reqwest::Client,
        credential: &str,
        setup: &SessionSetup,
    ) -> anyhow::Result<ClientToken>;

    /// Resolve the secret from config, then from the provider's env vars.
    fn resolve_credential(&self, configured: Option<&str>) -> Result<String, VoiceError> {
        resolve_credential_with(self.kind(), configured, |name| std::env::var(name).ok())
    }

    fn is_valid_voice(&self, voice: &str) -> bool {
        self.voices().iter().any(|v| v.eq_ignore_ascii_case(voice))
    }
}

/// Credential lookup with an injectable environment, so tests stay hermetic.
pub fn resolve_credential_with(
    kind: VoiceProviderKind,
    configured: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<String, VoiceError> {
    if let Some(key) = configured.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    kind.credential_env_vars()
        .iter()
        .filter_map(|name| env(name))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .ok_or_else(|| VoiceError::MissingCredential {
            provider: kind.as_str(),
            env_vars: kind.credential_env_vars().join(", "),
        })
}

/// JSON-schema parameters of the `complete_topic` tool, shared by both vendors.
pub fn complete_topic_parameters() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "topic_id": {
                "type": "string",
                "description": "Identifier of the topic that was just explored."
            },
            "summary": {
                "type": "string",
                "description": "Two or three sentences on what was learned."
            },
            "key_findings": {
                "type": "array",
                "items": { "type": "string" }
            },
            "patterns": {
                "type": "array",
                "items": { "type": "string" }
            },
            "confidence": {
                "type": "string",
                "enum": ["low", "medium", "high"]
            }
        },
        "required": ["topic_id"]
    })
}

pub const COMPLETE_TOPIC_DESCRIPTION: &str =
    "Call when the current topic has been explored enough and you are about to move on naturally.";

/// Build the adapter for the configured provider.
pub fn create_adapter(config: &VoiceConfig) -> Arc<dyn ProviderAdapter> {
    let model = config.model.clone();
    match config.provider {
        VoiceProviderKind::GeminiLive => Arc::new(GeminiLiveAdapter::new(model)),
        VoiceProviderKind::OpenAiRealtime => Arc::new(OpenAiRealtimeAdapter::new(model)),
    }
}
