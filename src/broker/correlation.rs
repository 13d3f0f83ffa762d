//! Most recent inquiry per topic, used to tell respondents which query they
//! are answering.

use super::topics::best_keyword_match;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentTopicEntry {
    pub topic: String,
    pub text: String,
    pub issued_at: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CorrelationIndex {
    entries: BTreeMap<String, RecentTopicEntry>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, RecentTopicEntry>) -> Self {
        Self { entries }
    }

    /// Newer issuance for the same topic replaces the older entry.
    pub fn record(&mut self, entry: RecentTopicEntry) {
        self.entries.insert(entry.topic.clone(), entry);
    }

    /// Guess which recent inquiry a respondent's message refers to.
    ///
    /// A keyword mentioned in the text wins; otherwise the most recently
    /// issued entry is returned.
    pub fn detect(&self, text: &str) -> Option<&RecentTopicEntry> {
        if let Some(topic) = best_keyword_match(text, self.entries.keys().map(String::as_str)) {
            return self.entries.get(topic);
        }
        self.entries.values().max_by_key(|entry| entry.issued_at)
    }

    /// Remove entries issued strictly before `cutoff`; returns the removed topics.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.issued_at < cutoff)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in &stale {
            self.entries.remove(topic);
        }
        stale
    }

    pub fn entries(&self) -> &BTreeMap<String, RecentTopicEntry> {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
