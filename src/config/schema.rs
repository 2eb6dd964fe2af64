use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::voice::gemini_live::VadConfig;
use crate::voice::VoiceProviderKind;

// ── Root ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where this config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    pub gateway: GatewayConfig,
    pub voice: VoiceConfig,
    pub orchestrator: OrchestratorConfig,
    pub analysis: AnalysisConfig,
}

// ── Gateway ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Browser origins allowed by CORS. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
    /// Request body limit for the JSON endpoints.
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            allowed_origins: Vec::new(),
            max_body_bytes: 64 * 1024,
        }
    }
}

// ── Voice ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Upstream provider: `gemini` or `openai`.
    pub provider: VoiceProviderKind,
    /// Model override; the provider default is used when unset.
    pub model: Option<String>,
    /// Provider secret. Falls back to GEMINI_API_KEY / GOOGLE_API_KEY / OPENAI_API_KEY.
    pub api_key: Option<String>,
    /// Voice name; the provider default is used when unset or unknown.
    pub voice: Option<String>,
    pub language_code: String,
    /// Pause between setup-complete and the opening turn.
    pub opening_delay_ms: u64,
    pub vad: VadConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            provider: VoiceProviderKind::default(),
            model: None,
            api_key: None,
            voice: None,
            language_code: "en-US".into(),
            opening_delay_ms: 500,
            vad: VadConfig::default(),
        }
    }
}

impl VoiceConfig {
    pub fn opening_delay(&self) -> Duration {
        Duration::from_millis(self.opening_delay_ms)
    }
}

// ── Orchestrator ───────────────────────────────────────────────────

/// What happens when the session runs past `max_session_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardLimitPolicy {
    /// Only the in-character wrap-up instructions; the socket stays open.
    #[default]
    Advisory,
    /// Close both channels once the grace period after the limit expires.
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_session_secs: u64,
    /// Remaining-time thresholds (seconds) at which a wrap-up instruction fires.
    pub wrap_up_thresholds_secs: Vec<u64>,
    pub hard_limit: HardLimitPolicy,
    /// Extra time after the limit before an enforced close.
    pub hard_limit_grace_secs: u64,
    /// Declare the `complete_topic` tool and let the agent switch topics itself.
    pub dynamic_topic_switching: bool,
    pub disengagement: DisengagementConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_session_secs: 15 * 60,
            wrap_up_thresholds_secs: vec![120, 30],
            hard_limit: HardLimitPolicy::Advisory,
            hard_limit_grace_secs: 60,
            dynamic_topic_switching: true,
            disengagement: DisengagementConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisengagementConfig {
    pub enabled: bool,
    /// Consecutive low-content replies that count as disengaged.
    pub low_content_run: usize,
    /// Replies with at most this many words are low-content.
    pub max_low_content_words: usize,
    /// Trailing window (replies) for the flatness check.
    pub window: usize,
    /// Mean words per reply below which a full window is flat.
    pub min_mean_words: f32,
}

impl Default for DisengagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_content_run: 3,
            max_low_content_words: 2,
            window: 5,
            min_mean_words: 4.0,
        }
    }
}

// ── Analysis ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Profile analysis endpoint. Without it every session yields a
    /// degraded profile carrying the raw transcript.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: 60,
        }
    }
}
