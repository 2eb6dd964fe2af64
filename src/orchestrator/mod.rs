//! Conversation orchestrator: the topic state machine behind a live session.
//!
//! ## Modes
//!
//! ```text
//!   Discovery ──(every topic explored)──▸ Deepening
//!      │  ▲                                  │
//!      └──┘ complete_topic / disengagement   └─ lowest confidence first,
//!                                               ties rotated per session
//! ```
//!
//! Exactly one topic is active while the catalog is non-empty. A topic
//! marked explored only becomes active again through deepening. Every
//! transition yields a rebuilt system instruction that the relay delivers
//! upstream before forwarding anything else.

pub mod disengagement;
pub mod live;
pub mod memory;
pub mod prompt;
pub mod state;
pub mod timebox;

pub use disengagement::{DisengagementDetector, DisengagementReason};
pub use live::{LiveConversation, LiveSummary};
pub use memory::{Confidence, SessionMemory, TopicProgress, TopicSignal};
pub use prompt::{PromptContext, PromptSection, SystemPromptBuilder};
pub use state::{ConnectionStatus, ConversationState, Role, TranscriptMessage};
pub use timebox::{TimeBox, TimeBoxAction};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::error::VoiceError;
use crate::scenarios::{ScenarioCatalog, Topic};
use crate::voice::RelayCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Walking the catalog for topics not yet explored.
    Discovery,
    /// Everything explored once; revisiting to raise confidence.
    Deepening,
}

/// Result of a topic completion.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicTransition {
    pub completed: String,
    pub next: Option<String>,
    pub mode: Mode,
    /// Commands for the relay, instruction update first.
    pub commands: Vec<RelayCommand>,
}

pub struct Orchestrator {
    catalog: Arc<ScenarioCatalog>,
    memory: SessionMemory,
    config: OrchestratorConfig,
    builder: SystemPromptBuilder,
    mode: Mode,
    active: Option<String>,
    /// Completed during this connection, in order.
    completed: Vec<String>,
    /// Abandoned on disengagement during this connection.
    skipped: Vec<String>,
    /// Topics whose progress record changed during this connection.
    touched: BTreeSet<String>,
    detector: DisengagementDetector,
    timebox: TimeBox,
    wrap_up: Option<String>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<ScenarioCatalog>,
        memory: SessionMemory,
        config: OrchestratorConfig,
    ) -> Self {
        let detector = DisengagementDetector::new(config.disengagement.clone());
        let timebox = TimeBox::new(&config);
        let mut orchestrator = Self {
            catalog,
            memory,
            config,
            builder: SystemPromptBuilder::with_defaults(),
            mode: Mode::Discovery,
            active: None,
            completed: Vec::new(),
            skipped: Vec::new(),
            touched: BTreeSet::new(),
            detector,
            timebox,
            wrap_up: None,
        };
        orchestrator.advance(None);
        tracing::info!(
            session_number = orchestrator.memory.session_number,
            mode = ?orchestrator.mode,
            topic = orchestrator.active.as_deref().unwrap_or("-"),
            "Orchestrator ready"
        );
        orchestrator
    }

    pub fn with_builder(mut self, builder: SystemPromptBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn active_topic(&self) -> Option<&Topic> {
        self.active.as_deref().and_then(|id| self.catalog.get(id))
    }

    pub fn active_topic_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    pub fn memory(&self) -> &SessionMemory {
        &self.memory
    }

    pub fn catalog(&self) -> &ScenarioCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Progress records changed during this connection, for persistence.
    pub fn progress_updates(&self) -> BTreeMap<String, TopicProgress> {
        self.touched
            .iter()
            .filter_map(|id| self.memory.progress.get(id).map(|p| (id.clone(), p.clone())))
            .collect()
    }

    /// Topics covered so far, across sessions and this connection.
    fn covered(&self) -> Vec<String> {
        let mut covered = self.memory.explored_ids();
        for id in &self.completed {
            if !covered.contains(id) {
                covered.push(id.clone());
            }
        }
        covered
    }

    /// Assemble the full system instruction for the current state.
    pub fn system_instruction(&self) -> anyhow::Result<String> {
        let covered = self.covered();
        let ctx = PromptContext {
            catalog: &self.catalog,
            memory: &self.memory,
            active_topic: self.active_topic(),
            mode: self.mode,
            completed: &covered,
            dynamic_switching: self.config.dynamic_topic_switching,
        };
        let mut prompt = self.builder.build(&ctx)?;
        if let Some(note) = &self.wrap_up {
            prompt.push_str("\n\n## Wrapping up\n\n");
            prompt.push_str(note);
        }
        Ok(prompt)
    }

    /// Record a finished topic and move on.
    pub fn complete_topic(&mut self, signal: TopicSignal) -> Result<TopicTransition, VoiceError> {
        let id = signal.topic_id.trim().to_string();
        if !self.catalog.contains(&id) {
            return Err(VoiceError::InvalidTopic(id));
        }

        self.memory
            .progress
            .entry(id.clone())
            .or_default()
            .apply(&signal);
        self.touched.insert(id.clone());
        if !self.completed.contains(&id) {
            self.completed.push(id.clone());
        }

        let was_active = self.active.as_deref() == Some(id.as_str());
        if was_active {
            self.advance(Some(&id));
            self.detector.reset();
        }

        tracing::info!(
            topic = %id,
            confidence = self.memory.confidence_of(&id).as_str(),
            next = self.active.as_deref().unwrap_or("-"),
            mode = ?self.mode,
            "Topic completed"
        );

        Ok(TopicTransition {
            completed: id,
            next: self.active.clone(),
            mode: self.mode,
            commands: self.instruction_update().into_iter().collect(),
        })
    }

    /// Feed one committed user reply through disengagement detection.
    pub fn on_user_utterance(&mut self, text: &str) -> Vec<RelayCommand> {
        let Some(reason) = self.detector.observe(text) else {
            return Vec::new();
        };
        let Some(current) = self.active.clone() else {
            return Vec::new();
        };

        let progress = self.memory.progress.entry(current.clone()).or_default();
        progress.cap_unexplored();
        self.touched.insert(current.clone());
        if !self.skipped.contains(&current) {
            self.skipped.push(current.clone());
        }

        self.advance(Some(&current));
        tracing::info!(
            topic = %current,
            reason = %reason,
            next = self.active.as_deref().unwrap_or("-"),
            "Disengagement detected, pivoting"
        );

        let mut commands: Vec<RelayCommand> = self.instruction_update().into_iter().collect();
        commands.push(RelayCommand::Inject {
            text: self.pivot_note(&current, &reason),
            respond: true,
        });
        commands
    }

    /// Time-box check against the session clock.
    pub fn tick(&mut self, elapsed: Duration) -> Vec<RelayCommand> {
        let mut commands = Vec::new();
        for action in self.timebox.check(elapsed) {
            match action {
                TimeBoxAction::WrapUp {
                    remaining,
                    final_notice,
                } => {
                    tracing::info!(
                        remaining_s = remaining.as_secs(),
                        final_notice,
                        "Time box: wrap-up"
                    );
                    let text =
                        timebox::wrap_up_instruction(final_notice, self.memory.known_name.as_deref());
                    self.wrap_up = Some(text.clone());
                    commands.push(RelayCommand::Inject {
                        text,
                        respond: false,
                    });
                }
                TimeBoxAction::HardStop => {
                    tracing::warn!(elapsed_s = elapsed.as_secs(), "Time box: enforced stop");
                    commands.push(RelayCommand::Close {
                        reason: "session time limit".into(),
                    });
                }
            }
        }
        commands
    }

    fn instruction_update(&self) -> Option<RelayCommand> {
        match self.system_instruction() {
            Ok(text) => Some(RelayCommand::UpdateInstructions(text)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to rebuild system instruction");
                None
            }
        }
    }

    fn pivot_note(&self, current: &str, reason: &DisengagementReason) -> String {
        let name = self
            .catalog
            .get(current)
            .map_or(current, |t| t.name.as_str());
        let covered = self.covered();
        let open: Vec<&str> = self
            .catalog
            .remaining(&covered)
            .into_iter()
            .filter(|t| t.id != current)
            .map(|t| t.name.as_str())
            .collect();

        let mut note = format!(
            "They seem ready for something else ({reason}). Do not press further on {name}. \
             Acknowledge it lightly, without making it awkward, and offer a natural change of \
             direction."
        );
        if !open.is_empty() {
            note.push_str(" Subjects still open: ");
            note.push_str(&open.join(", "));
            note.push('.');
        }
        note
    }

    /// Pick the next active topic. `leaving` is the topic just finished or
    /// abandoned.
    fn advance(&mut self, leaving: Option<&str>) {
        let covered = self.covered();

        let mut avoid = covered.clone();
        avoid.extend(self.skipped.iter().cloned());
        if let Some(topic) = self.catalog.next_topic(&avoid) {
            self.mode = Mode::Discovery;
            self.active = Some(topic.id.clone());
            return;
        }

        let mut exclude = self.completed.clone();
        exclude.extend(self.skipped.iter().cloned());
        let fallback: Vec<&str> = leaving.into_iter().collect();
        let deepening = select_deepening_topic(
            &self.catalog,
            &self.memory.progress,
            self.memory.session_number,
            &exclude,
        )
        .or_else(|| {
            select_deepening_topic(
                &self.catalog,
                &self.memory.progress,
                self.memory.session_number,
                &fallback,
            )
        });
        if let Some(topic) = deepening {
            self.mode = Mode::Deepening;
            self.active = Some(topic.id.clone());
            return;
        }

        // Only abandoned, never-explored topics are left.
        self.mode = Mode::Discovery;
        self.active = self.catalog.next_topic(&covered).map(|t| t.id.clone());
    }
}

/// Choose a topic to revisit: lowest confidence first, ties rotated by
/// `(session_number - 1) % tied` so consecutive sessions cycle through
/// equally weak topics. Non-deepenable and unexplored topics never qualify.
pub fn select_deepening_topic<'a, S: AsRef<str>>(
    catalog: &'a ScenarioCatalog,
    progress: &BTreeMap<String, TopicProgress>,
    session_number: u32,
    exclude: &[S],
) -> Option<&'a Topic> {
    let candidates: Vec<(&Topic, Confidence)> = catalog
        .topics()
        .iter()
        .filter(|t| t.deepenable)
        .filter(|t| !exclude.iter().any(|e| e.as_ref() == t.id))
        .filter_map(|t| {
            progress
                .get(&t.id)
                .filter(|p| p.explored)
                .map(|p| (t, p.confidence))
        })
        .collect();

    let lowest = candidates.iter().map(|(_, c)| *c).min()?;
    let tied: Vec<&Topic> = candidates
        .into_iter()
        .filter(|(_, c)| *c == lowest)
        .map(|(t, _)| t)
        .collect();
    let index = session_number.saturating_sub(1) as usize % tied.len();
    Some(tied[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisengagementConfig, HardLimitPolicy};
    use crate::scenarios::INTRO_TOPIC;

    fn small_catalog() -> Arc<ScenarioCatalog> {
        Arc::new(ScenarioCatalog::new(vec![
            Topic::new("intro", "Intro", 1).required().script("Say hi."),
            Topic::new("love_history", "Love history", 2)
                .required()
                .script("Ask about the past."),
            Topic::new("values", "Values", 3).required().script("Ask about values."),
        ]))
    }

    fn explored(confidence: Confidence) -> TopicProgress {
        TopicProgress {
            explored: true,
            confidence,
            ..TopicProgress::default()
        }
    }

    fn orchestrator(memory: SessionMemory) -> Orchestrator {
        Orchestrator::new(small_catalog(), memory, OrchestratorConfig::default())
    }

    fn signal(id: &str, confidence: Option<Confidence>) -> TopicSignal {
        TopicSignal {
            confidence,
            ..TopicSignal::bare(id)
        }
    }

    #[test]
    fn walks_catalog_then_enters_deepening() {
        let mut orch = orchestrator(SessionMemory::first_session());
        assert_eq!(orch.mode(), Mode::Discovery);
        assert_eq!(orch.active_topic_id(), Some("intro"));

        orch.complete_topic(signal("intro", None)).unwrap();
        let t = orch
            .complete_topic(signal("love_history", Some(Confidence::Low)))
            .unwrap();
        assert_eq!(t.next.as_deref(), Some("values"));
        assert_eq!(t.mode, Mode::Discovery);

        let t = orch
            .complete_topic(signal("values", Some(Confidence::Medium)))
            .unwrap();
        assert_eq!(t.mode, Mode::Deepening);
        assert_eq!(t.next.as_deref(), Some("love_history"));
        assert!(matches!(t.commands[0], RelayCommand::UpdateInstructions(_)));
    }

    #[test]
    fn deepening_picks_lowest_confidence_and_skips_intro() {
        let catalog = small_catalog();
        let mut progress = BTreeMap::new();
        progress.insert("intro".to_string(), explored(Confidence::Low));
        progress.insert("love_history".to_string(), explored(Confidence::Low));
        progress.insert("values".to_string(), explored(Confidence::Medium));

        let topic = select_deepening_topic::<&str>(&catalog, &progress, 1, &[]).unwrap();
        assert_eq!(topic.id, "love_history");
        for session in 1..10 {
            let topic = select_deepening_topic::<&str>(&catalog, &progress, session, &[]).unwrap();
            assert_ne!(topic.id, INTRO_TOPIC);
        }
    }

    #[test]
    fn deepening_rotates_through_ties_across_sessions() {
        let catalog = ScenarioCatalog::builtin();
        let progress: BTreeMap<String, TopicProgress> = catalog
            .topics()
            .iter()
            .map(|t| (t.id.clone(), explored(Confidence::Low)))
            .collect();
        let n = catalog.topics().iter().filter(|t| t.deepenable).count() as u32;

        let picks: Vec<String> = (1..=n)
            .map(|s| {
                select_deepening_topic::<&str>(&catalog, &progress, s, &[])
                    .unwrap()
                    .id
                    .clone()
            })
            .collect();
        let unique: BTreeSet<&String> = picks.iter().collect();
        assert_eq!(unique.len(), n as usize);

        let wrapped = select_deepening_topic::<&str>(&catalog, &progress, n + 1, &[]).unwrap();
        assert_eq!(wrapped.id, picks[0]);
    }

    #[test]
    fn returning_user_resumes_where_they_left_off() {
        let mut memory = SessionMemory::first_session();
        memory.session_number = 2;
        memory
            .progress
            .insert("intro".into(), explored(Confidence::High));
        let orch = orchestrator(memory);
        assert_eq!(orch.active_topic_id(), Some("love_history"));
        let prompt = orch.system_instruction().unwrap();
        assert!(prompt.contains("Ask about the past."));
        assert!(prompt.contains("## Already covered"));
    }

    #[test]
    fn fully_explored_user_starts_in_deepening() {
        let mut memory = SessionMemory::first_session();
        memory.session_number = 4;
        for id in ["intro", "love_history", "values"] {
            memory.progress.insert(id.into(), explored(Confidence::High));
        }
        let orch = orchestrator(memory);
        assert_eq!(orch.mode(), Mode::Deepening);
        assert!(orch.active_topic().is_some());
        assert_ne!(orch.active_topic_id(), Some(INTRO_TOPIC));
    }

    #[test]
    fn deepening_never_leaves_without_an_active_topic() {
        let mut memory = SessionMemory::first_session();
        memory.session_number = 2;
        for id in ["intro", "love_history", "values"] {
            memory.progress.insert(id.into(), explored(Confidence::Low));
        }
        let mut orch = orchestrator(memory);
        for _ in 0..4 {
            let current = orch.active_topic_id().unwrap().to_string();
            let t = orch
                .complete_topic(signal(&current, Some(Confidence::High)))
                .unwrap();
            assert!(t.next.is_some());
            assert_eq!(t.mode, Mode::Deepening);
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let mut orch = orchestrator(SessionMemory::first_session());
        let err = orch.complete_topic(signal("astrology", None)).unwrap_err();
        assert!(matches!(err, VoiceError::InvalidTopic(_)));
        assert_eq!(orch.active_topic_id(), Some("intro"));
    }

    #[test]
    fn completing_a_non_active_topic_keeps_the_active_one() {
        let mut orch = orchestrator(SessionMemory::first_session());
        let t = orch.complete_topic(signal("values", None)).unwrap();
        assert_eq!(t.next.as_deref(), Some("intro"));
        assert_eq!(orch.completed(), ["values".to_string()]);
    }

    #[test]
    fn disengagement_pivots_and_caps_confidence() {
        let mut memory = SessionMemory::first_session();
        memory.progress.insert(
            "intro".into(),
            TopicProgress {
                confidence: Confidence::Medium,
                ..TopicProgress::default()
            },
        );
        let mut orch = orchestrator(memory);

        assert!(orch.on_user_utterance("yeah").is_empty());
        assert!(orch.on_user_utterance("ok").is_empty());
        let commands = orch.on_user_utterance("sure");
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0], RelayCommand::UpdateInstructions(_)));
        match &commands[1] {
            RelayCommand::Inject { text, respond } => {
                assert!(*respond);
                assert!(text.contains("Love history"));
                assert!(text.contains("Values"));
            }
            other => panic!("expected inject, got {other:?}"),
        }

        assert_eq!(orch.active_topic_id(), Some("love_history"));
        let progress = orch.progress_updates();
        assert_eq!(progress["intro"].confidence, Confidence::Low);
        assert!(!progress["intro"].explored);
    }

    #[test]
    fn disengaging_from_every_topic_falls_back_to_unexplored() {
        let config = OrchestratorConfig {
            disengagement: DisengagementConfig {
                low_content_run: 1,
                ..DisengagementConfig::default()
            },
            ..OrchestratorConfig::default()
        };
        let mut orch =
            Orchestrator::new(small_catalog(), SessionMemory::first_session(), config);
        for _ in 0..5 {
            orch.on_user_utterance("no");
            assert!(orch.active_topic().is_some());
            assert_eq!(orch.mode(), Mode::Discovery);
        }
    }

    #[test]
    fn wrap_up_fires_once_and_sticks_to_the_instruction() {
        let config = OrchestratorConfig {
            max_session_secs: 300,
            wrap_up_thresholds_secs: vec![60],
            ..OrchestratorConfig::default()
        };
        let mut orch =
            Orchestrator::new(small_catalog(), SessionMemory::first_session(), config);

        assert!(orch.tick(Duration::from_secs(100)).is_empty());
        let commands = orch.tick(Duration::from_secs(245));
        assert!(matches!(
            commands.as_slice(),
            [RelayCommand::Inject { respond: false, .. }]
        ));
        assert!(orch.tick(Duration::from_secs(250)).is_empty());
        assert!(orch.system_instruction().unwrap().contains("## Wrapping up"));
    }

    #[test]
    fn enforced_limit_closes_the_session() {
        let config = OrchestratorConfig {
            max_session_secs: 300,
            wrap_up_thresholds_secs: vec![60],
            hard_limit: HardLimitPolicy::Enforce,
            hard_limit_grace_secs: 30,
            ..OrchestratorConfig::default()
        };
        let mut orch =
            Orchestrator::new(small_catalog(), SessionMemory::first_session(), config);
        let commands = orch.tick(Duration::from_secs(400));
        assert!(commands
            .iter()
            .any(|c| matches!(c, RelayCommand::Close { .. })));
    }

    #[test]
    fn empty_catalog_has_no_active_topic() {
        let orch = Orchestrator::new(
            Arc::new(ScenarioCatalog::new(Vec::new())),
            SessionMemory::first_session(),
            OrchestratorConfig::default(),
        );
        assert!(orch.active_topic().is_none());
        assert!(orch.system_instruction().unwrap().contains("## Who you are"));
    }
}
