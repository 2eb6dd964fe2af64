//! Discovery topic catalog.
//!
//! Topics are immutable records: ordering rank, required/sensitive flags,
//! discovery goals and a natural-language behavior script consumed by
//! the speech model. Selection is a pure function of the completed set.

mod catalog;

use serde::Serialize;

/// Identifier of the first-meeting topic, never revisited in deepening mode.
pub const INTRO_TOPIC: &str = "intro";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
    /// Position in the canonical exploration order (ascending).
    pub rank: u32,
    pub required: bool,
    /// Approach with maximum gentleness; never force.
    pub sensitive: bool,
    /// Whether the topic may be revisited once everything has been covered.
    pub deepenable: bool,
    pub goals: Vec<String>,
    /// Behavior instructions for the agent while this topic is active.
    pub script: String,
}

impl Topic {
    pub fn new(id: &str, name: &str, rank: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            rank,
            required: false,
            sensitive: false,
            deepenable: id != INTRO_TOPIC,
            goals: Vec::new(),
            script: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn goals(mut self, goals: &[&str]) -> Self {
        self.goals = goals.iter().map(|g| (*g).to_string()).collect();
        self
    }

    pub fn script(mut self, script: &str) -> Self {
        self.script = script.trim().to_string();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioCatalog {
    topics: Vec<Topic>,
}

impl ScenarioCatalog {
    /// Build a catalog; topics are kept in canonical (rank) order.
    pub fn new(mut topics: Vec<Topic>) -> Self {
        topics.sort_by_key(|t| t.rank);
        Self { topics }
    }

    /// The Luna interview topics.
    pub fn builtin() -> Self {
        Self::new(catalog::builtin_topics())
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn get(&self, id: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// First uncompleted required topic in canonical order; otherwise the
    /// first uncompleted topic of any kind; `None` once everything is done.
    ///
    /// Sensitivity never changes the order.
    pub fn next_topic<S: AsRef<str>>(&self, completed: &[S]) -> Option<&Topic> {
        let done = |t: &&Topic| completed.iter().any(|c| c.as_ref() == t.id);
        self.topics
            .iter()
            .filter(|t| t.required)
            .find(|t| !done(t))
            .or_else(|| self.topics.iter().find(|t| !done(t)))
    }

    /// Topics not yet in `completed`, in canonical order.
    pub fn remaining<S: AsRef<str>>(&self, completed: &[S]) -> Vec<&Topic> {
        self.topics
            .iter()
            .filter(|t| !completed.iter().any(|c| c.as_ref() == t.id))
            .collect()
    }
}

impl Default for ScenarioCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_required() -> ScenarioCatalog {
        ScenarioCatalog::new(vec![
            Topic::new("values", "Values", 3).required(),
            Topic::new("intro", "Intro", 1).required(),
            Topic::new("love_history", "Love history", 2).required(),
        ])
    }

    #[test]
    fn walks_required_topics_in_canonical_order() {
        let catalog = three_required();
        assert_eq!(catalog.next_topic::<&str>(&[]).unwrap().id, "intro");
        assert_eq!(
            catalog.next_topic(&["intro", "love_history"]).unwrap().id,
            "values"
        );
        assert!(catalog
            .next_topic(&["intro", "love_history", "values"])
            .is_none());
    }

    #[test]
    fn required_topics_win_regardless_of_rank() {
        let catalog = ScenarioCatalog::new(vec![
            Topic::new("intro", "Intro", 1).required(),
            Topic::new("hobbies", "Hobbies", 2),
            Topic::new("values", "Values", 3).required(),
        ]);
        assert_eq!(catalog.next_topic(&["intro"]).unwrap().id, "values");
        assert_eq!(catalog.next_topic(&["intro", "values"]).unwrap().id, "hobbies");
    }

    #[test]
    fn sensitive_topics_keep_their_position() {
        let catalog = ScenarioCatalog::new(vec![
            Topic::new("intro", "Intro", 1).required(),
            Topic::new("childhood", "Childhood", 2).sensitive(),
            Topic::new("hobbies", "Hobbies", 3),
        ]);
        assert_eq!(catalog.next_topic(&["intro"]).unwrap().id, "childhood");
        assert_eq!(
            catalog.next_topic(&["intro", "childhood"]).unwrap().id,
            "hobbies"
        );
    }

    #[test]
    fn selection_is_deterministic_and_never_returns_completed_required() {
        let catalog = ScenarioCatalog::builtin();
        let required: Vec<&str> = catalog
            .topics()
            .iter()
            .filter(|t| t.required)
            .map(|t| t.id.as_str())
            .collect();

        let first = catalog.next_topic(&required).map(|t| t.id.clone());
        for _ in 0..5 {
            assert_eq!(catalog.next_topic(&required).map(|t| t.id.clone()), first);
        }
        if let Some(topic) = catalog.next_topic(&required) {
            assert!(!topic.required);
        }
    }

    #[test]
    fn builtin_catalog_is_well_formed() {
        let catalog = ScenarioCatalog::builtin();
        assert_eq!(catalog.topics()[0].id, INTRO_TOPIC);
        assert!(!catalog.get(INTRO_TOPIC).unwrap().deepenable);
        for topic in catalog.topics() {
            assert!(!topic.script.is_empty(), "{} has no script", topic.id);
            assert!(!topic.goals.is_empty(), "{} has no goals", topic.id);
        }
        let mut ranks: Vec<u32> = catalog.topics().iter().map(|t| t.rank).collect();
        ranks.dedup();
        assert_eq!(ranks.len(), catalog.len());
        assert!(catalog.topics().iter().any(|t| t.sensitive));
    }

    #[test]
    fn remaining_preserves_order() {
        let catalog = three_required();
        let ids: Vec<&str> = catalog
            .remaining(&["love_history"])
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(ids, vec!["intro", "values"]);
    }
}
