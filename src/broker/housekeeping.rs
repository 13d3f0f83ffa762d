//! Periodic expiry of idle conversations and stale topic entries.

use super::correlation::CorrelationIndex;
use super::Broker;
use crate::store::BrokerSnapshot;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "housekeeping";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Respondent identities whose conversations expired.
    pub expired: Vec<String>,
    /// Topics whose recent-inquiry entry was dropped.
    pub pruned_topics: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.pruned_topics.is_empty()
    }
}

/// Drop stale topic entries from a persisted snapshot. Conversations are not
/// persisted, so this is all an offline sweep can do.
pub fn prune_snapshot(snapshot: &mut BrokerSnapshot, cutoff: DateTime<Utc>) -> Vec<String> {
    let mut index = CorrelationIndex::from_entries(std::mem::take(&mut snapshot.recent_topics));
    let pruned = index.prune_older_than(cutoff);
    snapshot.recent_topics = index.entries().clone();
    pruned
}

/// Sweep every `every` until `cancel` fires. The first sweep runs after one
/// full interval.
pub async fn run(broker: Arc<Broker>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    crate::health::mark_component_ok(COMPONENT);
    tracing::info!(every_secs = every.as_secs(), "Housekeeping started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                broker.sweep();
                crate::health::mark_component_ok(COMPONENT);
            }
        }
    }

    tracing::info!("Housekeeping stopped");
}
