//! Orchestrator wired into the relay loop.
//!
//! [`LiveConversation`] is the relay's hook set for one connection: it
//! owns the [`ConversationState`], feeds committed user turns through
//! disengagement detection, applies `complete_topic` tool calls, and runs
//! the time box off the relay ticker.

use super::memory::TopicSignal;
use super::state::{ConversationState, Role, TranscriptMessage};
use super::Orchestrator;
use crate::voice::provider::COMPLETE_TOPIC_TOOL;
use crate::voice::{RelayCommand, RelayHooks, RelayStats, ToolCall, VoiceEvent};

pub struct LiveConversation {
    session_id: String,
    orchestrator: Orchestrator,
    state: ConversationState,
}

/// What a finished connection leaves behind.
pub struct LiveSummary {
    pub orchestrator: Orchestrator,
    pub state: ConversationState,
}

impl LiveConversation {
    pub fn new(session_id: impl Into<String>, orchestrator: Orchestrator) -> Self {
        let mut state = ConversationState::new();
        state.current_topic = orchestrator.active_topic_id().map(str::to_string);
        Self {
            session_id: session_id.into(),
            orchestrator,
            state,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn transcript(&self) -> &[TranscriptMessage] {
        &self.state.transcript
    }

    /// Commit whatever partial turn is buffered and hand back the parts.
    pub fn finish(mut self) -> LiveSummary {
        if self.state.has_pending_turn() {
            let flushed = self.state.commit_turn();
            tracing::debug!(
                session_id = %self.session_id,
                messages = flushed.len(),
                "Committed partial turn at session end"
            );
        }
        LiveSummary {
            orchestrator: self.orchestrator,
            state: self.state,
        }
    }

    fn on_tool_call(&mut self, call: &ToolCall) -> Vec<RelayCommand> {
        if call.name != COMPLETE_TOPIC_TOOL {
            tracing::debug!(session_id = %self.session_id, tool = %call.name, "Ignoring unknown tool call");
            return Vec::new();
        }

        let transition = TopicSignal::from_tool_args(&call.args).and_then(|signal| {
            self.orchestrator
                .complete_topic(signal)
                .map_err(anyhow::Error::from)
        });
        match transition {
            Ok(transition) => {
                self.state.mark_completed(&transition.completed);
                self.state.current_topic = transition.next.clone();
                transition.commands
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Rejected complete_topic call");
                Vec::new()
            }
        }
    }
}

impl RelayHooks for LiveConversation {
    fn on_upstream_events(&mut self, events: &[VoiceEvent]) -> Vec<RelayCommand> {
        let mut commands = Vec::new();
        for event in events {
            match event {
                VoiceEvent::ToolCall(call) => commands.extend(self.on_tool_call(call)),
                VoiceEvent::Error { message } => {
                    tracing::warn!(session_id = %self.session_id, error = %message, "Upstream reported an error");
                }
                _ => {}
            }

            for message in self.state.record(event) {
                if message.role == Role::User {
                    let pivot = self.orchestrator.on_user_utterance(&message.content);
                    if !pivot.is_empty() {
                        self.state.current_topic =
                            self.orchestrator.active_topic_id().map(str::to_string);
                        commands.extend(pivot);
                    }
                }
            }
        }
        commands
    }

    fn on_tick(&mut self, stats: &RelayStats) -> Vec<RelayCommand> {
        let elapsed = self.state.advance_clock(stats.elapsed());
        self.orchestrator.tick(elapsed)
    }
}
