//! Session persistence collaborator.
//!
//! The core reads prior context to seed memory and writes transcript and
//! session-end events; the schema behind [`SessionStore`] belongs to the
//! host application. [`InMemorySessionStore`] backs the gateway and tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::analysis::Profile;
use crate::orchestrator::memory::TopicProgress;
use crate::orchestrator::state::TranscriptMessage;
use crate::voice::VoiceProviderKind;

/// Everything the orchestrator needs from earlier sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviousContext {
    pub session_count: u32,
    pub known_name: Option<String>,
    pub profile_summary: Option<String>,
    pub key_insights: Vec<String>,
    pub topic_progress: BTreeMap<String, TopicProgress>,
    pub last_transcript: Vec<TranscriptMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    /// 1-based sequence number per user.
    pub sequence: u32,
    pub provider: VoiceProviderKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEnd {
    pub duration: Duration,
    pub provider: VoiceProviderKind,
    pub cost_usd: f64,
}

impl SessionEnd {
    /// Duration times the provider's per-minute rate.
    pub fn estimate(duration: Duration, provider: VoiceProviderKind, per_minute_usd: f64) -> Self {
        Self {
            duration,
            provider,
            cost_usd: duration.as_secs_f64() / 60.0 * per_minute_usd,
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, user_id: &str, provider: VoiceProviderKind)
        -> Result<SessionRecord>;

    async fn append_messages(&self, session_id: &str, messages: &[TranscriptMessage]) -> Result<()>;

    async fn end_session(&self, session_id: &str, end: SessionEnd) -> Result<()>;

    /// Context from sessions that already exist for `user_id`.
    async fn previous_context(&self, user_id: &str) -> Result<PreviousContext>;

    async fn save_progress(
        &self,
        user_id: &str,
        progress: &BTreeMap<String, TopicProgress>,
    ) -> Result<()>;

    async fn save_profile(&self, user_id: &str, profile: &Profile) -> Result<()>;
}

// ── In-memory implementation ─────────────────────────────────────

#[derive(Default)]
struct UserData {
    sessions: Vec<String>,
    known_name: Option<String>,
    profile_summary: Option<String>,
    key_insights: Vec<String>,
    progress: BTreeMap<String, TopicProgress>,
    profiles: Vec<Profile>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserData>,
    sessions: HashMap<String, SessionRecord>,
    messages: HashMap<String, Vec<TranscriptMessage>>,
}

#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Mutex<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    pub fn messages(&self, session_id: &str) -> Vec<TranscriptMessage> {
        self.inner
            .lock()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn profiles(&self, user_id: &str) -> Vec<Profile> {
        self.inner
            .lock()
            .users
            .get(user_id)
            .map(|u| u.profiles.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        user_id: &str,
        provider: VoiceProviderKind,
    ) -> Result<SessionRecord> {
        let mut inner = self.inner.lock();
        let user = inner.users.entry(user_id.to_string()).or_default();
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            sequence: u32::try_from(user.sessions.len())
                .unwrap_or(u32::MAX)
                .saturating_add(1),
            provider,
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: None,
            cost_usd: None,
        };
        user.sessions.push(record.id.clone());
        inner.sessions.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn append_messages(&self, session_id: &str, messages: &[TranscriptMessage]) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(session_id) {
            anyhow::bail!("unknown session {session_id}");
        }
        inner
            .messages
            .entry(session_id.to_string())
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    async fn end_session(&self, session_id: &str, end: SessionEnd) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session {session_id}"))?;
        record.ended_at = Some(Utc::now());
        record.duration_secs = Some(end.duration.as_secs());
        record.provider = end.provider;
        record.cost_usd = Some(end.cost_usd);
        Ok(())
    }

    async fn previous_context(&self, user_id: &str) -> Result<PreviousContext> {
        let inner = self.inner.lock();
        let Some(user) = inner.users.get(user_id) else {
            return Ok(PreviousContext::default());
        };
        let last_transcript = user
            .sessions
            .last()
            .and_then(|id| inner.messages.get(id))
            .cloned()
            .unwrap_or_default();
        Ok(PreviousContext {
            session_count: u32::try_from(user.sessions.len()).unwrap_or(u32::MAX),
            known_name: user.known_name.clone(),
            profile_summary: user.profile_summary.clone(),
            key_insights: user.key_insights.clone(),
            topic_progress: user.progress.clone(),
            last_transcript,
        })
    }

    async fn save_progress(
        &self,
        user_id: &str,
        progress: &BTreeMap<String, TopicProgress>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let user = inner.users.entry(user_id.to_string()).or_default();
        for (id, record) in progress {
            user.progress.insert(id.clone(), record.clone());
        }
        Ok(())
    }

    async fn save_profile(&self, user_id: &str, profile: &Profile) -> Result<()> {
        let mut inner = self.inner.lock();
        let user = inner.users.entry(user_id.to_string()).or_default();
        if profile.is_analyzed() {
            if let Some(name) = profile.known_name() {
                user.known_name = Some(name);
            }
            if let Some(summary) = profile.summary() {
                user.profile_summary = Some(summary);
            }
            let insights = profile.key_insights();
            if !insights.is_empty() {
                user.key_insights = insights;
            }
        }
        user.profiles.push(profile.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::memory::Confidence;
    use crate::orchestrator::state::Role;

    #[tokio::test]
    async fn sessions_are_numbered_per_user() {
        let store = InMemorySessionStore::new();
        let a = store
            .create_session("u1", VoiceProviderKind::GeminiLive)
            .await
            .unwrap();
        let b = store
            .create_session("u1", VoiceProviderKind::GeminiLive)
            .await
            .unwrap();
        let other = store
            .create_session("u2", VoiceProviderKind::OpenAiRealtime)
            .await
            .unwrap();
        assert_eq!((a.sequence, b.sequence, other.sequence), (1, 2, 1));
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn previous_context_reflects_last_session() {
        let store = InMemorySessionStore::new();
        assert_eq!(
            store.previous_context("new").await.unwrap(),
            PreviousContext::default()
        );

        let first = store
            .create_session("u1", VoiceProviderKind::GeminiLive)
            .await
            .unwrap();
        store
            .append_messages(&first.id, &[TranscriptMessage::new(Role::User, "old")])
            .await
            .unwrap();
        let second = store
            .create_session("u1", VoiceProviderKind::GeminiLive)
            .await
            .unwrap();
        store
            .append_messages(&second.id, &[TranscriptMessage::new(Role::Agent, "new")])
            .await
            .unwrap();

        let mut progress = BTreeMap::new();
        progress.insert(
            "intro".to_string(),
            TopicProgress {
                explored: true,
                confidence: Confidence::Medium,
                ..TopicProgress::default()
            },
        );
        store.save_progress("u1", &progress).await.unwrap();

        let ctx = store.previous_context("u1").await.unwrap();
        assert_eq!(ctx.session_count, 2);
        assert_eq!(ctx.last_transcript.len(), 1);
        assert_eq!(ctx.last_transcript[0].content, "new");
        assert_eq!(ctx.topic_progress["intro"].confidence, Confidence::Medium);
    }

    #[tokio::test]
    async fn end_session_records_duration_and_cost() {
        let store = InMemorySessionStore::new();
        let record = store
            .create_session("u1", VoiceProviderKind::GeminiLive)
            .await
            .unwrap();
        let end = SessionEnd::estimate(
            Duration::from_secs(120),
            VoiceProviderKind::GeminiLive,
            0.05,
        );
        store.end_session(&record.id, end).await.unwrap();

        let stored = store.session(&record.id).unwrap();
        assert_eq!(stored.duration_secs, Some(120));
        assert!((stored.cost_usd.unwrap() - 0.10).abs() < 1e-9);
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn unknown_sessions_are_errors() {
        let store = InMemorySessionStore::new();
        assert!(store.append_messages("nope", &[]).await.is_err());
        let end = SessionEnd::estimate(Duration::ZERO, VoiceProviderKind::GeminiLive, 0.0);
        assert!(store.end_session("nope", end).await.is_err());
    }

    #[tokio::test]
    async fn analyzed_profile_seeds_name_and_insights() {
        let store = InMemorySessionStore::new();
        let profile = Profile::analyzed(serde_json::json!({
            "basicInfo": { "name": "Mina" },
            "summary": "Warm, direct, family-oriented.",
            "keyInsights": ["Wants a slow start", "Values honesty"]
        }));
        store.save_profile("u1", &profile).await.unwrap();
        store
            .save_profile("u1", &Profile::no_content())
            .await
            .unwrap();

        let ctx = store.previous_context("u1").await.unwrap();
        assert_eq!(ctx.known_name.as_deref(), Some("Mina"));
        assert_eq!(ctx.key_insights.len(), 2);
        assert_eq!(store.profiles("u1").len(), 2);
    }
}
