//! Durable broker state: the inquiry counter, the ledger and the recent-topic
//! index. Conversations are transient and never stored.

pub mod json;
pub mod memory;

pub use json::JsonFileStore;
pub use memory::InMemoryStore;

use crate::broker::correlation::RecentTopicEntry;
use crate::broker::ledger::InquiryRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub counter: u64,
    #[serde(default)]
    pub inquiries: BTreeMap<u64, InquiryRecord>,
    #[serde(default)]
    pub recent_topics: BTreeMap<String, RecentTopicEntry>,
}

/// Persistence backend for [`BrokerSnapshot`].
///
/// Writes are synchronous and cheap; callers log failures and carry on.
pub trait StateStore: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> anyhow::Result<Option<BrokerSnapshot>>;

    fn save(&self, snapshot: &BrokerSnapshot) -> anyhow::Result<()>;
}
