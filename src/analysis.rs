//! Post-session profile analysis.
//!
//! The analysis itself is a collaborator ([`ProfileAnalyzer`]). This
//! module owns the terminal rules around it: an empty transcript yields a
//! `no_content` placeholder without calling the analyzer, and an analyzer
//! failure yields a `degraded` profile carrying the raw transcript. The
//! calling flow always gets a profile back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::AnalysisConfig;
use crate::error::VoiceError;
use crate::orchestrator::state::{Role, TranscriptMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Analyzed,
    /// Nothing was said; placeholder only.
    NoContent,
    /// Analysis failed; the transcript is kept for a later retry.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub status: ProfileStatus,
    /// Free-form analysis output (basic info, traits, insights, keywords).
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transcript: Vec<TranscriptMessage>,
    pub generated_at: DateTime<Utc>,
}

impl Profile {
    pub fn analyzed(body: Value) -> Self {
        Self {
            status: ProfileStatus::Analyzed,
            body,
            error: None,
            transcript: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: ProfileStatus::NoContent,
            body: serde_json::json!({
                "placeholder": true,
                "message": "No conversation was captured in this session."
            }),
            error: None,
            transcript: Vec::new(),
            generated_at: Utc::now(),
        }
    }

    pub fn degraded(error: impl Into<String>, transcript: Vec<TranscriptMessage>) -> Self {
        Self {
            status: ProfileStatus::Degraded,
            body: serde_json::json!({ "placeholder": true }),
            error: Some(error.into()),
            transcript,
            generated_at: Utc::now(),
        }
    }

    pub fn is_analyzed(&self) -> bool {
        self.status == ProfileStatus::Analyzed
    }

    /// Name from `basicInfo.name` (or `basic_info.name`, or top-level `name`).
    pub fn known_name(&self) -> Option<String> {
        ["basicInfo", "basic_info"]
            .iter()
            .find_map(|k| self.body.get(k).and_then(|b| b.get("name")))
            .or_else(|| self.body.get("name"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    }

    pub fn summary(&self) -> Option<String> {
        self.body
            .get("summary")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn key_insights(&self) -> Vec<String> {
        ["keyInsights", "key_insights"]
            .iter()
            .find_map(|k| self.body.get(k).and_then(Value::as_array))
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── Analyzer ─────────────────────────────────────────────────────

#[async_trait]
pub trait ProfileAnalyzer: Send + Sync {
    async fn analyze(&self, messages: &[TranscriptMessage]) -> Result<Value, VoiceError>;
}

#[derive(Serialize)]
struct AnalysisRequest<'a> {
    messages: Vec<AnalysisMessage<'a>>,
}

#[derive(Serialize)]
struct AnalysisMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// POSTs `{messages: [{role, content}]}` and takes the JSON reply as the
/// profile (unwrapping a top-level `profile` field when present).
pub struct HttpProfileAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpProfileAnalyzer {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &AnalysisConfig) -> anyhow::Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Ok(None);
        };
        Self::new(
            endpoint,
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
        .map(Some)
    }
}

#[async_trait]
impl ProfileAnalyzer for HttpProfileAnalyzer {
    async fn analyze(&self, messages: &[TranscriptMessage]) -> Result<Value, VoiceError> {
        let body = AnalysisRequest {
            messages: messages
                .iter()
                .map(|m| AnalysisMessage {
                    role: match m.role {
                        Role::User => "user",
                        Role::Agent => "agent",
                    },
                    content: &m.content,
                })
                .collect(),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VoiceError::Analysis(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VoiceError::Analysis(format!(
                "endpoint returned {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let mut value: Value = response
            .json()
            .await
            .map_err(|e| VoiceError::Analysis(format!("invalid response body: {e}")))?;
        if let Some(profile) = value.get_mut("profile").map(Value::take) {
            value = profile;
        }
        if !value.is_object() {
            return Err(VoiceError::Analysis("profile is not a JSON object".into()));
        }
        Ok(value)
    }
}

/// Turn a finished transcript into a profile. Never fails.
pub async fn complete_session(
    analyzer: Option<&dyn ProfileAnalyzer>,
    transcript: &[TranscriptMessage],
) -> Profile {
    if transcript.iter().all(|m| m.content.trim().is_empty()) {
        tracing::info!("Empty transcript, producing placeholder profile");
        return Profile::no_content();
    }

    let Some(analyzer) = analyzer else {
        tracing::warn!("No analyzer configured, producing degraded profile");
        return Profile::degraded("analysis not configured", transcript.to_vec());
    };

    match analyzer.analyze(transcript).await {
        Ok(body) => {
            tracing::info!(messages = transcript.len(), "Profile analyzed");
            Profile::analyzed(body)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Profile analysis failed, keeping transcript");
            Profile::degraded(e.to_string(), transcript.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingAnalyzer(AtomicUsize);

    #[async_trait]
    impl ProfileAnalyzer for CountingAnalyzer {
        async fn analyze(&self, _messages: &[TranscriptMessage]) -> Result<Value, VoiceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({}))
        }
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl ProfileAnalyzer for FailingAnalyzer {
        async fn analyze(&self, _messages: &[TranscriptMessage]) -> Result<Value, VoiceError> {
            Err(VoiceError::Analysis("model overloaded".into()))
        }
    }

    fn transcript() -> Vec<TranscriptMessage> {
        vec![
            TranscriptMessage::new(Role::Agent, "Hi, I'm Luna. What should I call you?"),
            TranscriptMessage::new(Role::User, "Mina is fine."),
        ]
    }

    #[tokio::test]
    async fn empty_transcript_skips_the_analyzer() {
        let analyzer = CountingAnalyzer(AtomicUsize::new(0));
        let blank = vec![TranscriptMessage::new(Role::User, "  ")];
        for t in [Vec::new(), blank] {
            let profile = complete_session(Some(&analyzer), &t).await;
            assert_eq!(profile.status, ProfileStatus::NoContent);
            assert_eq!(profile.body["placeholder"], true);
        }
        assert_eq!(analyzer.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn analyzer_failure_degrades_with_transcript() {
        let profile = complete_session(Some(&FailingAnalyzer), &transcript()).await;
        assert_eq!(profile.status, ProfileStatus::Degraded);
        assert!(profile.error.unwrap().contains("model overloaded"));
        assert_eq!(profile.transcript.len(), 2);
    }

    #[tokio::test]
    async fn missing_analyzer_degrades() {
        let profile = complete_session(None, &transcript()).await;
        assert_eq!(profile.status, ProfileStatus::Degraded);
        assert!(!profile.is_analyzed());
    }

    #[tokio::test]
    async fn http_analyzer_posts_messages_and_unwraps_profile() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(header("authorization", "Bearer an-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "profile": {
                    "basicInfo": {"name": "Mina"},
                    "keyInsights": ["Prefers calm evenings"]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let analyzer = HttpProfileAnalyzer::new(
            format!("{}/analyze", server.uri()),
            Some("an-key".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let profile = complete_session(Some(&analyzer), &transcript()).await;

        assert!(profile.is_analyzed());
        assert_eq!(profile.known_name().as_deref(), Some("Mina"));

        let requests = server.received_requests().await.unwrap();
        let sent: Value = requests[0].body_json().unwrap();
        assert_eq!(sent["messages"][0]["role"], "agent");
        assert_eq!(sent["messages"][1]["role"], "user");
        assert_eq!(sent["messages"][1]["content"], "Mina is fine.");
        assert_eq!(profile.key_insights(), vec!["Prefers calm evenings".to_string()]);
    }

    #[tokio::test]
    async fn http_error_status_becomes_degraded_profile() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let analyzer =
            HttpProfileAnalyzer::new(server.uri(), None, Duration::from_secs(5)).unwrap();
        let profile = complete_session(Some(&analyzer), &transcript()).await;
        assert_eq!(profile.status, ProfileStatus::Degraded);
        assert!(profile.error.unwrap().contains("502"));
    }

    #[test]
    fn from_config_without_endpoint_is_none() {
        assert!(HttpProfileAnalyzer::from_config(&AnalysisConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn profile_status_serializes_snake_case() {
        let json = serde_json::to_value(Profile::no_content()).unwrap();
        assert_eq!(json["status"], "no_content");
        assert!(json.get("transcript").is_none());
    }
}
