//! Live conversation state for one connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::voice::VoiceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Accumulates streaming transcript fragments until the turn completes.
///
/// Fragments can arrive in any interleaving; committing always yields the
/// user's words before the agent's reply.
#[derive(Debug, Default, Clone)]
pub struct TurnBuffer {
    user: String,
    agent: String,
}

impl TurnBuffer {
    pub fn push_user(&mut self, fragment: &str) {
        self.user.push_str(fragment);
    }

    pub fn push_agent(&mut self, fragment: &str) {
        self.agent.push_str(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.user.trim().is_empty() && self.agent.trim().is_empty()
    }

    pub fn commit(&mut self) -> Vec<TranscriptMessage> {
        let mut out = Vec::with_capacity(2);
        for (role, text) in [
            (Role::User, std::mem::take(&mut self.user)),
            (Role::Agent, std::mem::take(&mut self.agent)),
        ] {
            let text = text.trim();
            if !text.is_empty() {
                out.push(TranscriptMessage::new(role, text));
            }
        }
        out
    }
}

/// Mutable state of one active connection.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub current_topic: Option<String>,
    /// Topics completed during this connection, in completion order.
    pub completed: Vec<String>,
    pub transcript: Vec<TranscriptMessage>,
    pub status: ConnectionStatus,
    /// Last metered microphone RMS level (0.0 to 1.0).
    pub mic_level: f32,
    clock: Duration,
    turn: TurnBuffer,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session clock; never moves backwards.
    pub fn clock(&self) -> Duration {
        self.clock
    }

    pub fn advance_clock(&mut self, elapsed: Duration) -> Duration {
        self.clock = self.clock.max(elapsed);
        self.clock
    }

    /// Route transcript events into the turn buffer. Returns the messages
    /// committed by a turn-complete or barge-in, in transcript order.
    pub fn record(&mut self, event: &VoiceEvent) -> Vec<TranscriptMessage> {
        match event {
            VoiceEvent::InputTranscript { text } => {
                self.turn.push_user(text);
                Vec::new()
            }
            VoiceEvent::OutputTranscript { text } => {
                self.turn.push_agent(text);
                Vec::new()
            }
            // a cut-off reply is still a finished turn; the interrupting
            // words belong to the next one
            VoiceEvent::TurnComplete | VoiceEvent::Interrupted => self.commit_turn(),
            VoiceEvent::SetupComplete => {
                self.status = ConnectionStatus::Connected;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn commit_turn(&mut self) -> Vec<TranscriptMessage> {
        let committed = self.turn.commit();
        self.transcript.extend(committed.iter().cloned());
        committed
    }

    pub fn has_pending_turn(&self) -> bool {
        !self.turn.is_empty()
    }

    pub fn mark_completed(&mut self, topic_id: &str) {
        if !self.completed.iter().any(|c| c == topic_id) {
            self.completed.push(topic_id.to_string());
        }
    }
}
