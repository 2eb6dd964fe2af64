//! Per-user memory carried between sessions.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::store::PreviousContext;

/// Qualitative certainty about what has been learned on a topic.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Case-insensitive parse; anything unrecognised is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "med" | "moderate" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Per-user, per-topic record. Created the first time a topic is touched,
/// updated after every session that touches it, never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicProgress {
    pub explored: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub confidence: Confidence,
}

impl TopicProgress {
    /// Fold a completion signal into this record and mark it explored.
    ///
    /// Unspecified confidence defaults to low on first exploration and is
    /// left alone when revisiting.
    pub fn apply(&mut self, signal: &TopicSignal) {
        self.confidence = match signal.confidence {
            Some(c) => c,
            None if self.explored => self.confidence,
            None => Confidence::Low,
        };
        self.explored = true;

        if let Some(summary) = signal.summary.as_deref().map(str::trim) {
            if !summary.is_empty() {
                self.summary = summary.to_string();
            }
        }
        merge_unique(&mut self.key_findings, &signal.key_findings);
        merge_unique(&mut self.patterns, &signal.patterns);
    }

    /// Disengagement on an unexplored topic never leaves it above low.
    pub fn cap_unexplored(&mut self) {
        if !self.explored {
            self.confidence = Confidence::Low;
        }
    }
}

fn merge_unique(into: &mut Vec<String>, from: &[String]) {
    for item in from {
        let item = item.trim();
        if !item.is_empty() && !into.iter().any(|existing| existing == item) {
            into.push(item.to_string());
        }
    }
}

/// Payload of a `complete_topic` control event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TopicSignal {
    pub topic_id: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence: Option<Confidence>,
}

impl TopicSignal {
    pub fn bare(topic_id: impl Into<String>) -> Self {
        Self {
            topic_id: topic_id.into(),
            ..Self::default()
        }
    }

    pub fn from_tool_args(args: &serde_json::Value) -> anyhow::Result<Self> {
        let signal: Self = serde_json::from_value(args.clone())?;
        if signal.topic_id.trim().is_empty() {
            anyhow::bail!("complete_topic called without topic_id");
        }
        Ok(signal)
    }
}

fn lenient_confidence<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Confidence>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.as_deref().and_then(Confidence::parse))
}

/// Condensed memory used to seed the orchestrator for one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMemory {
    pub known_name: Option<String>,
    /// 1-based number of the session about to start.
    pub session_number: u32,
    pub profile_summary: Option<String>,
    pub key_insights: Vec<String>,
    pub progress: BTreeMap<String, TopicProgress>,
}

impl SessionMemory {
    pub fn first_session() -> Self {
        Self {
            known_name: None,
            session_number: 1,
            profile_summary: None,
            key_insights: Vec::new(),
            progress: BTreeMap::new(),
        }
    }

    pub fn from_previous(ctx: &PreviousContext) -> Self {
        Self {
            known_name: ctx.known_name.clone().filter(|n| !n.trim().is_empty()),
            session_number: ctx.session_count.saturating_add(1),
            profile_summary: ctx.profile_summary.clone(),
            key_insights: ctx.key_insights.clone(),
            progress: ctx.topic_progress.clone(),
        }
    }

    pub fn is_returning(&self) -> bool {
        self.session_number > 1
    }

    pub fn explored_ids(&self) -> Vec<String> {
        self.progress
            .iter()
            .filter(|(_, p)| p.explored)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn confidence_of(&self, topic_id: &str) -> Confidence {
        self.progress
            .get(topic_id)
            .map(|p| p.confidence)
            .unwrap_or_default()
    }
}
