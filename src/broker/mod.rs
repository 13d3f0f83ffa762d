//! Inquiry broker core.
//!
//! The requester issues inquiries by keyword; each inquiry is fanned out to
//! the topic's groups. Respondents answer privately, their text and media
//! are collected in a per-identity conversation, and a confirmed
//! conversation is forwarded to the requester as one report.
//!
//! Locking: events of one identity are serialized end-to-end by a
//! per-identity async lock. Ledger, index and conversations share one
//! synchronous lock that is never held across an `.await`.

pub mod clock;
pub mod conversation;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod housekeeping;
pub mod ledger;
pub mod normalizer;
pub mod report;
pub mod router;
pub mod topics;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conversation::{ConversationRecord, ConversationState};
pub use dispatch::{DispatchFailureKind, DispatchReport};
pub use error::BrokerError;
pub use housekeeping::SweepReport;
pub use ledger::{CloseOutcome, InquiryRecord, InquiryStatus};
pub use normalizer::TextNormalizer;
pub use router::{SenderPolicy, SenderRole};
pub use topics::TopicRegistry;

use crate::channels::{Channel, ChannelMessage, SendMessage};
use crate::config::{Config, HousekeepingConfig};
use crate::store::{BrokerSnapshot, StateStore};
use crate::util::truncate_with_ellipsis;
use chrono::{DateTime, Utc};
use conversation::{AttachmentRecord, ConversationBook, ConversationEvent, Effect};
use correlation::{CorrelationIndex, RecentTopicEntry};
use dispatch::Dispatcher;
use ledger::InquiryLedger;
use normalizer::RawTextNormalizer;
use parking_lot::Mutex;
use report::{ReportAssembler, RESPONDENT_FAILURE_NOTICE};
use router::RequesterCommand;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Age limits applied by the housekeeping sweep.
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    pub conversation_ttl: chrono::Duration,
    pub topic_retention: chrono::Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &HousekeepingConfig) -> Self {
        Self {
            conversation_ttl: config.conversation_ttl(),
            topic_retention: config.topic_retention(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from_config(&HousekeepingConfig::default())
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    ledger: InquiryLedger,
    index: CorrelationIndex,
    conversations: ConversationBook,
}

impl BrokerState {
    fn restore(snapshot: BrokerSnapshot) -> Self {
        Self {
            ledger: InquiryLedger::from_parts(snapshot.counter, snapshot.inquiries),
            index: CorrelationIndex::from_entries(snapshot.recent_topics),
            conversations: ConversationBook::new(),
        }
    }

    fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            counter: self.ledger.counter(),
            inquiries: self.ledger.records().clone(),
            recent_topics: self.index.entries().clone(),
        }
    }
}

/// One async lock per sender identity.
#[derive(Debug, Default)]
struct SenderLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SenderLocks {
    async fn acquire(&self, identity: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(identity.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on.
    fn prune(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

pub struct BrokerBuilder {
    channel: Arc<dyn Channel>,
    topics: TopicRegistry,
    store: Arc<dyn StateStore>,
    policy: SenderPolicy,
    normalizer: Arc<dyn TextNormalizer>,
    clock: Arc<dyn Clock>,
    send_delay: Duration,
    settings: BrokerSettings,
}

impl BrokerBuilder {
    pub fn policy(mut self, policy: SenderPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<dyn TextNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Pause between forwarded attachments.
    pub fn send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    pub fn settings(mut self, settings: BrokerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Apply `[broker]` and `[housekeeping]` from the loaded config.
    pub fn config(self, config: &Config) -> Self {
        self.policy(SenderPolicy::from_config(&config.broker))
            .send_delay(config.broker.attachment_send_delay())
            .settings(BrokerSettings::from_config(&config.housekeeping))
    }

    /// Build the broker, restoring persisted state. An unreadable store is
    /// logged and the broker starts empty.
    pub fn build(self) -> Broker {
        let state = match self.store.load() {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    store = self.store.name(),
                    counter = snapshot.counter,
                    inquiries = snapshot.inquiries.len(),
                    recent_topics = snapshot.recent_topics.len(),
                    "Broker state restored"
                );
                BrokerState::restore(snapshot)
            }
            Ok(None) => BrokerState::default(),
            Err(e) => {
                let err = BrokerError::Persistence(format!("{e:#}"));
                tracing::error!(store = self.store.name(), "{err}; starting with empty state");
                BrokerState::default()
            }
        };

        Broker {
            dispatcher: Dispatcher::new(Arc::clone(&self.channel)),
            assembler: ReportAssembler::new(
                Arc::clone(&self.channel),
                self.normalizer,
                self.policy.requester().to_string(),
                self.send_delay,
            ),
            channel: self.channel,
            topics: self.topics,
            store: self.store,
            clock: self.clock,
            policy: self.policy,
            settings: self.settings,
            state: Mutex::new(state),
            sender_locks: SenderLocks::default(),
        }
    }
}

pub struct Broker {
    channel: Arc<dyn Channel>,
    topics: TopicRegistry,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    policy: SenderPolicy,
    dispatcher: Dispatcher,
    assembler: ReportAssembler,
    settings: BrokerSettings,
    state: Mutex<BrokerState>,
    sender_locks: SenderLocks,
}

impl Broker {
    pub fn builder(
        channel: Arc<dyn Channel>,
        topics: TopicRegistry,
        store: Arc<dyn StateStore>,
    ) -> BrokerBuilder {
        BrokerBuilder {
            channel,
            topics,
            store,
            policy: SenderPolicy::new("", "@g.us", vec!["status@broadcast".to_string()]),
            normalizer: Arc::new(RawTextNormalizer),
            clock: Arc::new(SystemClock),
            send_delay: Duration::from_millis(1500),
            settings: BrokerSettings::default(),
        }
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    /// Route one inbound message. Errors are answered in-channel, never returned.
    pub async fn handle_message(&self, msg: ChannelMessage) {
        let role = self.policy.classify(&msg.sender);
        if role == SenderRole::Ignored {
            tracing::debug!(sender = %msg.sender, "Ignoring message from group or system sender");
            return;
        }

        let _guard = self.sender_locks.acquire(&msg.sender).await;
        tracing::info!(
            sender = %msg.sender,
            ?role,
            attachment = msg.attachment.is_some(),
            "Message: {}",
            truncate_with_ellipsis(&msg.content, 80)
        );

        match role {
            SenderRole::Requester => self.handle_requester(&msg).await,
            SenderRole::Respondent => self.handle_respondent(&msg).await,
            SenderRole::Ignored => {}
        }
    }

    async fn handle_requester(&self, msg: &ChannelMessage) {
        // Empty bodies (e.g. uncaptioned media) fall through to the topic list.
        let body = msg.content.trim();
        match router::parse_requester_command(body, &self.topics) {
            RequesterCommand::Restart => {
                self.restart();
                self.reply(&msg.sender, router::RESTART_REPLY).await;
            }
            RequesterCommand::Close(None) => {
                tracing::warn!("{}", BrokerError::InvalidCommand(body.to_string()));
                self.reply(&msg.sender, router::INVALID_CLOSE_REPLY).await;
            }
            RequesterCommand::Close(Some(sequence)) => match self.close_inquiry(sequence) {
                Ok(outcome) => {
                    self.reply(&msg.sender, &router::closed_reply(sequence, &outcome.topic))
                        .await;
                }
                Err(e) => {
                    tracing::warn!("{e}");
                    self.reply(&msg.sender, &router::not_found_reply(sequence)).await;
                }
            },
            RequesterCommand::Issue { topic } => {
                let report = self.issue_inquiry(&topic, body).await;
                for reply in router::dispatch_replies(&report) {
                    self.reply(&msg.sender, &reply).await;
                }
            }
            RequesterCommand::Unknown => {
                tracing::info!("{}", BrokerError::InvalidCommand(body.to_string()));
                self.reply(
                    &msg.sender,
                    &router::unknown_command_reply(body, &self.topics),
                )
                .await;
            }
        }
    }

    async fn handle_respondent(&self, msg: &ChannelMessage) {
        let identity = msg.sender.as_str();
        let event = match &msg.attachment {
            Some(attachment) => {
                let caption = msg.content.trim().to_string();
                let collecting = self.state.lock().conversations.active_state(identity)
                    == Some(ConversationState::Collecting);
                if collecting {
                    match self.channel.fetch_attachment(attachment).await {
                        Ok(media) => ConversationEvent::Attachment(AttachmentRecord {
                            mime_type: if media.mime_type.is_empty() {
                                attachment
                                    .mime_type
                                    .clone()
                                    .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string())
                            } else {
                                media.mime_type
                            },
                            payload: media.data,
                            caption,
                            received_at: self.clock.now(),
                        }),
                        Err(e) => {
                            tracing::warn!(
                                respondent = identity,
                                media_id = %attachment.id,
                                "Attachment download failed: {e:#}"
                            );
                            ConversationEvent::AttachmentUnavailable { caption }
                        }
                    }
                } else {
                    ConversationEvent::AttachmentUnavailable { caption }
                }
            }
            None => ConversationEvent::Text(msg.content.clone()),
        };

        let now = self.clock.now();
        let effects = {
            let mut guard = self.state.lock();
            let BrokerState {
                index,
                conversations,
                ..
            } = &mut *guard;
            conversations.on_message(identity, event, now, || {
                index.detect(&msg.content).cloned()
            })
        };

        for effect in effects {
            match effect {
                Effect::Reply(text) => self.reply(identity, &text).await,
                Effect::AssembleReport(record) => self.complete(record).await,
            }
        }
    }

    async fn complete(&self, record: ConversationRecord) {
        let completed_at = self.clock.now();
        match self.assembler.assemble(&record, completed_at).await {
            Ok(outcome) => {
                let snapshot = {
                    let mut state = self.state.lock();
                    let marked = state
                        .conversations
                        .mark_completed(&record.identity, record.started_at);
                    let linked = record.linked.as_ref().filter(|_| marked);
                    linked
                        .is_some_and(|entry| {
                            state.ledger.record_response(entry.sequence, &record.identity)
                        })
                        .then(|| state.snapshot())
                };
                if let Some(snapshot) = snapshot {
                    self.persist(&snapshot);
                }
                tracing::info!(
                    respondent = %record.identity,
                    media_sent = outcome.media_sent,
                    media_failed = outcome.media_failed,
                    normalized = outcome.normalized,
                    "Report delivered to requester"
                );
            }
            Err(e) => {
                tracing::error!(respondent = %record.identity, "{e}");
                self.reply(&record.identity, RESPONDENT_FAILURE_NOTICE).await;
            }
        }
    }

    /// Record a new inquiry for `topic` and fan it out to the topic's groups.
    pub async fn issue_inquiry(&self, topic: &str, body: &str) -> DispatchReport {
        let now = self.clock.now();
        let (sequence, snapshot) = {
            let mut state = self.state.lock();
            let sequence = state.ledger.issue(topic, body, now).sequence;
            state.index.record(RecentTopicEntry {
                topic: topic.to_string(),
                text: body.to_string(),
                issued_at: now,
                sequence,
            });
            (sequence, state.snapshot())
        };
        self.persist(&snapshot);

        let destinations = self.topics.destinations(topic);
        tracing::info!(
            sequence,
            topic,
            destinations = destinations.len(),
            "Inquiry issued"
        );
        let report = self
            .dispatcher
            .broadcast(topic, sequence, body, destinations)
            .await;
        if let Some(condition) = report.failure_condition() {
            tracing::warn!(sequence, topic, ?condition, "Inquiry reached no group");
        }
        report
    }

    pub fn close_inquiry(&self, sequence: u64) -> Result<CloseOutcome, BrokerError> {
        let (outcome, snapshot) = {
            let mut state = self.state.lock();
            let outcome = state.ledger.close(sequence)?;
            let snapshot = (!outcome.already_closed).then(|| state.snapshot());
            (outcome, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot);
        }
        tracing::info!(sequence, topic = %outcome.topic, "Inquiry closed");
        Ok(outcome)
    }

    /// Wipe ledger, counter, recent topics and conversations.
    pub fn restart(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            state.ledger.reset();
            state.index.clear();
            state.conversations.clear();
            state.snapshot()
        };
        self.persist(&snapshot);
        tracing::warn!("Broker state reset by requester");
    }

    /// Expire idle conversations and forget stale topics; persists once.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let conversation_cutoff = now
            .checked_sub_signed(self.settings.conversation_ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let topic_cutoff = now
            .checked_sub_signed(self.settings.topic_retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let (report, snapshot) = {
            let mut state = self.state.lock();
            let report = SweepReport {
                expired: state.conversations.expire_stale(conversation_cutoff),
                pruned_topics: state.index.prune_older_than(topic_cutoff),
            };
            (report, state.snapshot())
        };
        self.persist(&snapshot);
        let released = self.sender_locks.prune();

        if report.is_empty() {
            tracing::debug!(released_locks = released, "Housekeeping: nothing to do");
        } else {
            tracing::info!(
                expired = ?report.expired,
                pruned_topics = ?report.pruned_topics,
                "Housekeeping sweep"
            );
        }
        report
    }

    /// Write the current state to the store.
    pub fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.state.lock().snapshot();
        self.store.save(&snapshot)
    }

    /// Flush without blocking; `false` if the state lock is busy or the
    /// write failed. Safe to call from a panic hook.
    pub fn try_flush(&self) -> bool {
        let Some(state) = self.state.try_lock() else {
            return false;
        };
        let snapshot = state.snapshot();
        drop(state);
        self.store.save(&snapshot).is_ok()
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        self.state.lock().snapshot()
    }

    pub fn conversation(&self, identity: &str) -> Option<ConversationRecord> {
        self.state.lock().conversations.get(identity).cloned()
    }

    pub fn inquiry(&self, sequence: u64) -> Option<InquiryRecord> {
        self.state.lock().ledger.get(sequence).cloned()
    }

    async fn reply(&self, recipient: &str, text: &str) {
        if let Err(e) = self.channel.send(&SendMessage::new(text, recipient)).await {
            tracing::error!(recipient, "Failed to send reply: {e:#}");
        }
    }

    fn persist(&self, snapshot: &BrokerSnapshot) {
        if let Err(e) = self.store.save(snapshot) {
            let err = BrokerError::Persistence(format!("{e:#}"));
            tracing::error!(store = self.store.name(), "{err}");
        }
    }
}
