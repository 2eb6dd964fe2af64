//! Session time-boxing.
//!
//! Each configured "seconds remaining" threshold produces exactly one
//! wrap-up instruction. Under [`HardLimitPolicy::Enforce`] a single hard
//! stop follows once the limit plus grace has passed.

use std::time::Duration;

use crate::config::{HardLimitPolicy, OrchestratorConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeBoxAction {
    /// Ask the agent to start ending the conversation in character.
    WrapUp {
        remaining: Duration,
        /// The last configured threshold; the agent should say goodbye now.
        final_notice: bool,
    },
    /// Enforced limit reached; close the session.
    HardStop,
}

#[derive(Debug, Clone)]
pub struct TimeBox {
    max: Duration,
    /// Remaining-time thresholds, largest first.
    thresholds: Vec<Duration>,
    fired: usize,
    policy: HardLimitPolicy,
    grace: Duration,
    stopped: bool,
}

impl TimeBox {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let mut thresholds: Vec<Duration> = config
            .wrap_up_thresholds_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .filter(|t| *t < config.max_session())
            .collect();
        thresholds.sort_unstable_by(|a, b| b.cmp(a));
        thresholds.dedup();

        Self {
            max: config.max_session(),
            thresholds,
            fired: 0,
            policy: config.hard_limit,
            grace: Duration::from_secs(config.hard_limit_grace_secs),
            stopped: false,
        }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.max.saturating_sub(elapsed)
    }

    /// Actions due at `elapsed`. Several thresholds crossed at once collapse
    /// into one wrap-up for the most urgent of them.
    pub fn check(&mut self, elapsed: Duration) -> Vec<TimeBoxAction> {
        let mut actions = Vec::new();
        let remaining = self.remaining(elapsed);

        let crossed = self.thresholds[self.fired..]
            .iter()
            .take_while(|t| remaining <= **t)
            .count();
        if crossed > 0 {
            self.fired += crossed;
            actions.push(TimeBoxAction::WrapUp {
                remaining,
                final_notice: self.fired == self.thresholds.len(),
            });
        }

        if self.policy == HardLimitPolicy::Enforce
            && !self.stopped
            && elapsed >= self.max + self.grace
        {
            self.stopped = true;
            actions.push(TimeBoxAction::HardStop);
        }

        actions
    }
}

/// Steering text for a wrap-up. Never mentions a time limit.
pub fn wrap_up_instruction(final_notice: bool, known_name: Option<&str>) -> String {
    let name = known_name
        .map(|n| format!(" with {n}"))
        .unwrap_or_default();
    if final_notice {
        format!(
            "Begin saying goodbye now. Finish your current thought, then give a natural, \
             in-character reason you need to pause for today (for example that you want to \
             let everything they shared sink in). Never mention a time limit, a timer or a \
             system rule. Tell them sincerely how much you enjoyed talking{name}, mention one \
             thing they shared that stayed with you, and warmly invite them to come back and \
             continue another time."
        )
    } else {
        format!(
            "Start steering the conversation gently toward a natural pause. Do not open any \
             new topic. Within the next couple of exchanges, find an in-character reason to \
             wind down. Never mention a time limit. Let them feel you have enjoyed this \
             conversation{name} and that you look forward to continuing it."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(hard_limit: HardLimitPolicy) -> OrchestratorConfig {
        OrchestratorConfig {
            max_session_secs: 600,
            wrap_up_thresholds_secs: vec![30, 120],
            hard_limit,
            hard_limit_grace_secs: 60,
            ..OrchestratorConfig::default()
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn each_threshold_fires_once() {
        let mut tb = TimeBox::new(&config(HardLimitPolicy::Advisory));
        assert!(tb.check(secs(100)).is_empty());
        assert_eq!(
            tb.check(secs(480)),
            vec![TimeBoxAction::WrapUp {
                remaining: secs(120),
                final_notice: false
            }]
        );
        assert!(tb.check(secs(481)).is_empty());
        assert!(tb.check(secs(560)).is_empty());
        assert_eq!(
            tb.check(secs(575)),
            vec![TimeBoxAction::WrapUp {
                remaining: secs(25),
                final_notice: true
            }]
        );
        assert!(tb.check(secs(590)).is_empty());
    }

    #[test]
    fn simultaneous_crossings_collapse_into_one() {
        let mut tb = TimeBox::new(&config(HardLimitPolicy::Advisory));
        let actions = tb.check(secs(590));
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            TimeBoxAction::WrapUp { final_notice: true, .. }
        ));
        assert!(tb.check(secs(595)).is_empty());
    }

    #[test]
    fn advisory_policy_never_stops() {
        let mut tb = TimeBox::new(&config(HardLimitPolicy::Advisory));
        tb.check(secs(599));
        assert!(tb.check(secs(10_000)).is_empty());
    }

    #[test]
    fn enforce_policy_stops_once_after_grace() {
        let mut tb = TimeBox::new(&config(HardLimitPolicy::Enforce));
        tb.check(secs(599));
        assert!(tb.check(secs(650)).is_empty());
        assert_eq!(tb.check(secs(660)), vec![TimeBoxAction::HardStop]);
        assert!(tb.check(secs(700)).is_empty());
    }

    #[test]
    fn thresholds_beyond_max_are_ignored() {
        let mut tb = TimeBox::new(&OrchestratorConfig {
            max_session_secs: 60,
            wrap_up_thresholds_secs: vec![90, 10],
            ..OrchestratorConfig::default()
        });
        assert!(tb.check(secs(1)).is_empty());
        assert_eq!(tb.check(secs(50)).len(), 1);
    }

    #[test]
    fn instruction_never_mentions_the_limit_as_a_reason() {
        for final_notice in [false, true] {
            let text = wrap_up_instruction(final_notice, Some("Mina"));
            assert!(text.contains("Never mention a time limit"));
            assert!(text.contains("enjoyed"));
            assert!(text.contains("Mina"));
        }
        assert!(wrap_up_instruction(true, None).contains("come back"));
    }
}
