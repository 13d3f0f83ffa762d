//! Static topic configuration: keyword → ordered destination channels.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Keywords written to a freshly seeded `topics.json`.
pub const TEMPLATE_TOPICS: &[&str] = &["LAPTOP", "MONITOR", "MOUSE", "PENDRIVE"];

/// Pick the keyword that occurs in `text`, ignoring case.
///
/// When several keywords occur, the longest one wins ("USB PENDRIVE" beats
/// "PENDRIVE"); equal lengths fall back to ascending keyword order. Empty
/// keywords never match.
pub fn best_keyword_match<'a, I>(text: &str, keywords: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let haystack = text.to_uppercase();
    keywords
        .into_iter()
        .filter(|keyword| !keyword.trim().is_empty())
        .filter(|keyword| haystack.contains(&keyword.to_uppercase()))
        .max_by(|a, b| {
            a.chars()
                .count()
                .cmp(&b.chars().count())
                .then_with(|| b.cmp(a))
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRegistry {
    topics: BTreeMap<String, Vec<String>>,
}

impl TopicRegistry {
    pub fn new(topics: BTreeMap<String, Vec<String>>) -> Self {
        Self { topics }
    }

    /// Read `topics.json`, seeding it with an empty template when absent.
    pub async fn load_or_seed(path: &Path) -> Result<Self> {
        if !path.exists() {
            let template: BTreeMap<String, Vec<String>> = TEMPLATE_TOPICS
                .iter()
                .map(|keyword| ((*keyword).to_string(), Vec::new()))
                .collect();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create topics directory: {}", parent.display())
                })?;
            }
            let body = serde_json::to_string_pretty(&template)?;
            tokio::fs::write(path, body)
                .await
                .with_context(|| format!("Failed to write topics template: {}", path.display()))?;
            tracing::warn!(
                "{} not found; created a template. Add destination ids for each topic.",
                path.display()
            );
            return Ok(Self::new(template));
        }

        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let topics: BTreeMap<String, Vec<String>> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        tracing::info!(
            topics = ?topics.keys().collect::<Vec<_>>(),
            "Topics loaded"
        );
        Ok(Self::new(topics))
    }

    /// Topic keyword mentioned in `text`, if any.
    pub fn resolve(&self, text: &str) -> Option<&str> {
        best_keyword_match(text, self.topics.keys().map(String::as_str))
    }

    pub fn destinations(&self, topic: &str) -> &[String] {
        self.topics.get(topic).map_or(&[], Vec::as_slice)
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.topics
            .iter()
            .map(|(keyword, destinations)| (keyword.as_str(), destinations.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }
}
