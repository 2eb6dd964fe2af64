//! Deterministic disengagement detection over the user's committed replies.
//!
//! Complements the soft, model-driven contract in the prompt: a run of
//! low-content replies, an explicit request to change subject, or a flat
//! trailing window of short answers.

use std::collections::VecDeque;
use std::fmt;

use crate::config::DisengagementConfig;

/// Replies that carry no content on their own.
const FILLERS: &[&str] = &[
    "yeah", "yes", "yep", "no", "nope", "ok", "okay", "sure", "fine", "maybe", "idk", "dunno",
    "hmm", "um", "uh", "mhm", "whatever", "i guess", "not really", "nothing", "i don't know",
    "i dont know", "not sure", "no idea", "kind of", "sort of",
];

/// Phrases that ask to leave the current topic.
const CHANGE_SUBJECT: &[&str] = &[
    "change the subject",
    "talk about something else",
    "something else please",
    "next question",
    "next topic",
    "move on",
    "skip this",
    "skip that",
    "don't want to talk about",
    "dont want to talk about",
    "rather not talk",
    "rather not say",
    "prefer not to",
];

#[derive(Debug, Clone, PartialEq)]
pub enum DisengagementReason {
    /// This many low-content replies in a row.
    LowContentRun(usize),
    ExplicitRequest,
    /// Mean words per reply over the trailing window.
    FlatResponses { mean_words: f32 },
}

impl fmt::Display for DisengagementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowContentRun(n) => write!(f, "{n} very short replies in a row"),
            Self::ExplicitRequest => f.write_str("asked to change the subject"),
            Self::FlatResponses { mean_words } => {
                write!(f, "consistently short answers (about {mean_words:.1} words)")
            }
        }
    }
}

#[derive(Debug)]
pub struct DisengagementDetector {
    config: DisengagementConfig,
    recent: VecDeque<usize>,
    low_run: usize,
}

impl DisengagementDetector {
    pub fn new(config: DisengagementConfig) -> Self {
        Self {
            config,
            recent: VecDeque::new(),
            low_run: 0,
        }
    }

    /// Feed one committed user reply. A detection resets the detector so
    /// the same streak does not fire twice.
    pub fn observe(&mut self, utterance: &str) -> Option<DisengagementReason> {
        if !self.config.enabled {
            return None;
        }

        let normalized = normalize(utterance);
        if normalized.is_empty() {
            return None;
        }

        if CHANGE_SUBJECT.iter().any(|p| normalized.contains(p)) {
            self.reset();
            return Some(DisengagementReason::ExplicitRequest);
        }

        let words = normalized.split_whitespace().count();
        let low_content =
            words <= self.config.max_low_content_words || FILLERS.contains(&normalized.as_str());
        self.low_run = if low_content { self.low_run + 1 } else { 0 };

        self.recent.push_back(words);
        while self.recent.len() > self.config.window {
            self.recent.pop_front();
        }

        if self.low_run >= self.config.low_content_run {
            let run = self.low_run;
            self.reset();
            return Some(DisengagementReason::LowContentRun(run));
        }

        if self.recent.len() == self.config.window {
            let mean = self.recent.iter().sum::<usize>() as f32 / self.recent.len() as f32;
            if mean < self.config.min_mean_words {
                self.reset();
                return Some(DisengagementReason::FlatResponses { mean_words: mean });
            }
        }

        None
    }

    /// Forget history, e.g. after a topic change.
    pub fn reset(&mut self) {
        self.recent.clear();
        self.low_run = 0;
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> DisengagementDetector {
        DisengagementDetector::new(DisengagementConfig::default())
    }

    #[test]
    fn run_of_short_replies_is_detected() {
        let mut d = detector();
        assert!(d.observe("Yeah.").is_none());
        assert!(d.observe("I guess").is_none());
        assert_eq!(d.observe("ok"), Some(DisengagementReason::LowContentRun(3)));
        // streak was consumed
        assert!(d.observe("fine").is_none());
    }

    #[test]
    fn a_real_answer_breaks_the_run() {
        let mut d = detector();
        d.observe("yeah");
        d.observe("sure");
        assert!(d
            .observe("Actually my last relationship taught me a lot about patience and trust")
            .is_none());
        assert!(d.observe("mhm").is_none());
    }

    #[test]
    fn explicit_request_fires_immediately() {
        let mut d = detector();
        assert_eq!(
            d.observe("Honestly, can we talk about something else?"),
            Some(DisengagementReason::ExplicitRequest)
        );
    }

    #[test]
    fn flat_window_is_detected() {
        let mut d = detector();
        let replies = [
            "I like hiking",
            "Pretty close to them",
            "Not much really",
            "Mostly at home",
            "Work is fine",
        ];
        let mut result = None;
        for r in replies {
            result = d.observe(r);
        }
        assert!(matches!(
            result,
            Some(DisengagementReason::FlatResponses { mean_words }) if mean_words < 4.0
        ));
    }

    #[test]
    fn disabled_detector_never_fires() {
        let mut d = DisengagementDetector::new(DisengagementConfig {
            enabled: false,
            ..DisengagementConfig::default()
        });
        for _ in 0..10 {
            assert!(d.observe("no").is_none());
        }
    }

    #[test]
    fn punctuation_only_is_ignored() {
        let mut d = detector();
        assert!(d.observe("...").is_none());
        assert!(d.observe("").is_none());
    }
}
