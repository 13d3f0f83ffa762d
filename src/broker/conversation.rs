//! Respondent conversations.
//!
//! Each respondent identity owns at most one non-terminal
//! [`ConversationRecord`]. Inbound events are classified into an [`Input`],
//! fed through the pure [`transition`] function, and the resulting [`Action`]
//! is applied to the record by [`ConversationBook::on_message`]. Report
//! assembly is the only action with I/O; it is handed back to the caller as
//! [`Effect::AssembleReport`] and confirmed later via
//! [`ConversationBook::mark_completed`].

use super::correlation::RecentTopicEntry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Collecting,
    AwaitingConfirmation,
    Completed,
    Expired,
}

impl ConversationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub payload: Vec<u8>,
    pub mime_type: String,
    pub caption: String,
    pub received_at: DateTime<Utc>,
}

impl fmt::Debug for AttachmentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentRecord")
            .field("payload_len", &self.payload.len())
            .field("mime_type", &self.mime_type)
            .field("caption", &self.caption)
            .field("received_at", &self.received_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub identity: String,
    pub state: ConversationState,
    pub started_at: DateTime<Utc>,
    pub text: String,
    pub attachments: Vec<AttachmentRecord>,
    pub linked: Option<RecentTopicEntry>,
}

impl ConversationRecord {
    fn begin(identity: &str, started_at: DateTime<Utc>, linked: Option<RecentTopicEntry>) -> Self {
        Self {
            identity: identity.to_string(),
            state: ConversationState::Collecting,
            started_at,
            text: String::new(),
            attachments: Vec::new(),
            linked,
        }
    }

    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.attachments.is_empty()
    }

    fn append_text(&mut self, text: &str) {
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        self.text.push_str(text);
    }
}

/// One inbound respondent event, after any attachment download.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Text(String),
    Attachment(AttachmentRecord),
    /// The message carried an attachment that was not downloaded.
    AttachmentUnavailable { caption: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Attachment,
    AttachmentUnavailable,
    Finished,
    Confirm,
    Cancel,
    Text,
    Empty,
}

impl Input {
    pub fn classify(event: &ConversationEvent) -> Self {
        match event {
            ConversationEvent::Attachment(_) => Self::Attachment,
            ConversationEvent::AttachmentUnavailable { .. } => Self::AttachmentUnavailable,
            ConversationEvent::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    Self::Empty
                } else if text.eq_ignore_ascii_case("finished") {
                    Self::Finished
                } else if text.eq_ignore_ascii_case("confirm") {
                    Self::Confirm
                } else if text.eq_ignore_ascii_case("cancel") {
                    Self::Cancel
                } else {
                    Self::Text
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start a fresh record and send the welcome.
    Begin,
    StoreAttachment,
    RetryAttachment,
    AppendText,
    Summarize,
    RejectEmpty,
    Assemble,
    Reset,
    Reprompt,
    Ignore,
}

/// Next state and action for `input`, given the current state (`None` when
/// the identity has no record) and whether anything has been collected.
pub fn transition(
    state: Option<ConversationState>,
    collected: bool,
    input: Input,
) -> (ConversationState, Action) {
    use ConversationState::{AwaitingConfirmation, Collecting};

    match state {
        None | Some(ConversationState::Completed | ConversationState::Expired) => {
            (Collecting, Action::Begin)
        }
        Some(Collecting) => match input {
            Input::Attachment => (Collecting, Action::StoreAttachment),
            Input::AttachmentUnavailable => (Collecting, Action::RetryAttachment),
            Input::Finished if collected => (AwaitingConfirmation, Action::Summarize),
            Input::Finished => (Collecting, Action::RejectEmpty),
            Input::Confirm | Input::Cancel | Input::Text => (Collecting, Action::AppendText),
            Input::Empty => (Collecting, Action::Ignore),
        },
        // Completion is applied once the report is delivered.
        Some(AwaitingConfirmation) => match input {
            Input::Confirm => (AwaitingConfirmation, Action::Assemble),
            Input::Cancel => (Collecting, Action::Reset),
            _ => (AwaitingConfirmation, Action::Reprompt),
        },
    }
}

/// What the broker must do after a conversation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Text reply to the respondent.
    Reply(String),
    /// Deliver the report for this snapshot of the record.
    AssembleReport(ConversationRecord),
}

pub fn welcome_text(linked: Option<&RecentTopicEntry>) -> String {
    let mut text = String::from("Thanks for replying privately from the group!\n\n");
    if let Some(entry) = linked {
        text.push_str(&format!(
            "📋 *Query you're responding to:*\n\"{}\"\n\n",
            entry.text
        ));
    }
    text.push_str(
        "Please send:\n\n\
         • 💰 Price details\n\
         • ⭐ Quality information\n\
         • 🚚 Delivery time\n\
         • 🏢 Company name\n\
         • 📸 Product photos (if available)\n\n\
         *You can send text and images in any order. When you're done, type \"FINISHED\" to submit everything.*",
    );
    text
}

pub fn attachment_ack_text(total: usize) -> String {
    format!(
        "📸 Image received! ({total} total)\n\nSend more details/images or type \"FINISHED\" when done."
    )
}

pub fn summary_text(record: &ConversationRecord) -> String {
    let has_text = if record.text.is_empty() { "None" } else { "Yes" };
    format!(
        "📋 *SUMMARY OF YOUR RESPONSE:*\n\n\
         📝 *Text Details:* {has_text}\n\
         📸 *Images:* {} photo(s)\n\n\
         Type \"CONFIRM\" to send this to the buyer, or \"CANCEL\" to start over.",
        record.attachments.len()
    )
}

pub const TEXT_ACK: &str =
    "✅ Information received!\n\nSend more details/images or type \"FINISHED\" when done.";
pub const REJECT_EMPTY: &str =
    "❌ Please provide some information (text or images) before finishing.";
pub const RESET_NOTICE: &str = "🔄 Response cleared. Please provide your details again.\n\nSend text and images, then type \"FINISHED\" when done.";
pub const REPROMPT: &str =
    "Please type \"CONFIRM\" to send your response or \"CANCEL\" to start over.";
pub const ATTACHMENT_RETRY: &str = "❌ Failed to receive image. Please try again.";

/// All conversations keyed by respondent identity.
#[derive(Debug, Default)]
pub struct ConversationBook {
    records: HashMap<String, ConversationRecord>,
}

impl ConversationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one inbound event. `correlate` is only called when a new
    /// conversation begins.
    pub fn on_message<F>(
        &mut self,
        identity: &str,
        event: ConversationEvent,
        now: DateTime<Utc>,
        correlate: F,
    ) -> Vec<Effect>
    where
        F: FnOnce() -> Option<RecentTopicEntry>,
    {
        let current = self.records.get(identity);
        let state = current.map(|record| record.state);
        let collected = current.is_some_and(ConversationRecord::has_content);
        let (next, action) = transition(state, collected, Input::classify(&event));

        tracing::debug!(
            identity,
            from = state.map_or("absent", ConversationState::as_str),
            to = next.as_str(),
            ?action,
            "Conversation transition"
        );

        if action == Action::Begin {
            let record = ConversationRecord::begin(identity, now, correlate());
            let welcome = welcome_text(record.linked.as_ref());
            self.records.insert(identity.to_string(), record);
            return vec![Effect::Reply(welcome)];
        }

        let Some(record) = self.records.get_mut(identity) else {
            return Vec::new();
        };
        record.state = next;

        match action {
            Action::Begin => Vec::new(),
            Action::StoreAttachment => {
                if let ConversationEvent::Attachment(attachment) = event {
                    record.attachments.push(attachment);
                }
                vec![Effect::Reply(attachment_ack_text(record.attachments.len()))]
            }
            Action::RetryAttachment => vec![Effect::Reply(ATTACHMENT_RETRY.to_string())],
            Action::AppendText => {
                if let ConversationEvent::Text(text) = &event {
                    record.append_text(text.trim());
                }
                vec![Effect::Reply(TEXT_ACK.to_string())]
            }
            Action::Summarize => vec![Effect::Reply(summary_text(record))],
            Action::RejectEmpty => vec![Effect::Reply(REJECT_EMPTY.to_string())],
            Action::Assemble => vec![Effect::AssembleReport(record.clone())],
            Action::Reset => {
                record.text.clear();
                record.attachments.clear();
                vec![Effect::Reply(RESET_NOTICE.to_string())]
            }
            Action::Reprompt => vec![Effect::Reply(REPROMPT.to_string())],
            Action::Ignore => Vec::new(),
        }
    }

    /// State of the identity's current record, if it is non-terminal.
    pub fn active_state(&self, identity: &str) -> Option<ConversationState> {
        self.records
            .get(identity)
            .map(|record| record.state)
            .filter(|state| !state.is_terminal())
    }

    pub fn get(&self, identity: &str) -> Option<&ConversationRecord> {
        self.records.get(identity)
    }

    /// Mark the conversation that started at `started_at` as completed.
    ///
    /// Only a record still awaiting confirmation completes. Returns `false`
    /// when it expired meanwhile, or the identity has moved on to another
    /// conversation (or was wiped by a restart).
    pub fn mark_completed(&mut self, identity: &str, started_at: DateTime<Utc>) -> bool {
        match self.records.get_mut(identity) {
            Some(record)
                if record.started_at == started_at
                    && record.state == ConversationState::AwaitingConfirmation =>
            {
                record.state = ConversationState::Completed;
                true
            }
            _ => false,
        }
    }

    /// Expire every non-terminal record started before `cutoff`; returns the
    /// affected identities.
    pub fn expire_stale(&mut self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        for (identity, record) in &mut self.records {
            if !record.state.is_terminal() && record.started_at < cutoff {
                record.state = ConversationState::Expired;
                expired.push(identity.clone());
            }
        }
        expired.sort();
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationRecord> {
        self.records.values()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const SELLER: &str = "15550001111@c.us";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn text(body: &str) -> ConversationEvent {
        ConversationEvent::Text(body.to_string())
    }

    fn photo(caption: &str) -> ConversationEvent {
        ConversationEvent::Attachment(AttachmentRecord {
            payload: vec![0xFF, 0xD8, 0xFF],
            mime_type: "image/jpeg".into(),
            caption: caption.into(),
            received_at: t0(),
        })
    }

    fn linked() -> RecentTopicEntry {
        RecentTopicEntry {
            topic: "LAPTOP".into(),
            text: "need 5 laptops".into(),
            issued_at: t0(),
            sequence: 3,
        }
    }

    fn replies(effects: &[Effect]) -> Vec<&str> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Reply(text) => Some(text.as_str()),
                Effect::AssembleReport(_) => None,
            })
            .collect()
    }

    fn started_book() -> ConversationBook {
        let mut book = ConversationBook::new();
        book.on_message(SELLER, text("hi"), t0(), || None);
        book
    }

    #[test]
    fn classify_is_case_insensitive_and_trimmed() {
        assert_eq!(Input::classify(&text("  FINISHED ")), Input::Finished);
        assert_eq!(Input::classify(&text("Confirm")), Input::Confirm);
        assert_eq!(Input::classify(&text("cancel")), Input::Cancel);
        assert_eq!(Input::classify(&text("   ")), Input::Empty);
        assert_eq!(Input::classify(&text("finished now")), Input::Text);
        assert_eq!(Input::classify(&photo("")), Input::Attachment);
    }

    #[test]
    fn transition_table() {
        use ConversationState::*;

        assert_eq!(transition(None, false, Input::Text), (Collecting, Action::Begin));
        assert_eq!(
            transition(Some(Completed), true, Input::Confirm),
            (Collecting, Action::Begin)
        );
        assert_eq!(
            transition(Some(Collecting), true, Input::Finished),
            (AwaitingConfirmation, Action::Summarize)
        );
        assert_eq!(
            transition(Some(Collecting), false, Input::Finished),
            (Collecting, Action::RejectEmpty)
        );
        assert_eq!(
            transition(Some(Collecting), false, Input::Confirm),
            (Collecting, Action::AppendText)
        );
        assert_eq!(
            transition(Some(AwaitingConfirmation), true, Input::Confirm),
            (AwaitingConfirmation, Action::Assemble)
        );
        assert_eq!(
            transition(Some(AwaitingConfirmation), true, Input::Cancel),
            (Collecting, Action::Reset)
        );
        assert_eq!(
            transition(Some(AwaitingConfirmation), true, Input::Attachment),
            (AwaitingConfirmation, Action::Reprompt)
        );
    }

    #[test]
    fn first_message_welcomes_with_correlated_query() {
        let mut book = ConversationBook::new();
        let effects = book.on_message(SELLER, text("about laptops"), t0(), || Some(linked()));

        let reply = replies(&effects);
        assert_eq!(reply.len(), 1);
        assert!(reply[0].starts_with("Thanks for replying privately"));
        assert!(reply[0].contains("\"need 5 laptops\""));

        let record = book.get(SELLER).unwrap();
        assert_eq!(record.state, ConversationState::Collecting);
        assert!(record.text.is_empty());
        assert_eq!(record.linked.as_ref().unwrap().sequence, 3);
    }

    #[test]
    fn active_record_is_reused_and_correlation_skipped() {
        let mut book = started_book();
        book.on_message(SELLER, text("price 500"), t0(), || {
            panic!("correlation must not run for an active conversation")
        });
        assert_eq!(book.len(), 1);
        assert_eq!(book.get(SELLER).unwrap().text, "price 500");
    }

    #[test]
    fn text_is_joined_with_blank_lines() {
        let mut book = started_book();
        book.on_message(SELLER, text("price 500"), t0(), || None);
        let effects = book.on_message(SELLER, text("delivery 3 days"), t0(), || None);
        assert_eq!(replies(&effects), vec![TEXT_ACK]);
        assert_eq!(book.get(SELLER).unwrap().text, "price 500\n\ndelivery 3 days");
    }

    #[test]
    fn attachments_are_counted() {
        let mut book = started_book();
        book.on_message(SELLER, photo("front"), t0(), || None);
        let effects = book.on_message(SELLER, photo(""), t0(), || None);
        assert!(replies(&effects)[0].contains("(2 total)"));
        assert_eq!(book.get(SELLER).unwrap().attachments[0].caption, "front");
    }

    #[test]
    fn unavailable_attachment_leaves_record_unchanged() {
        let mut book = started_book();
        let before = book.get(SELLER).unwrap().clone();
        let effects = book.on_message(
            SELLER,
            ConversationEvent::AttachmentUnavailable {
                caption: "x".into(),
            },
            t0(),
            || None,
        );
        assert_eq!(replies(&effects), vec![ATTACHMENT_RETRY]);
        assert_eq!(book.get(SELLER).unwrap(), &before);
    }

    #[test]
    fn empty_text_is_ignored_silently() {
        let mut book = started_book();
        assert!(book.on_message(SELLER, text("  "), t0(), || None).is_empty());
    }

    #[test]
    fn finished_with_nothing_collected_is_rejected() {
        let mut book = started_book();
        let effects = book.on_message(SELLER, text("finished"), t0(), || None);
        assert_eq!(replies(&effects), vec![REJECT_EMPTY]);
        assert_eq!(book.active_state(SELLER), Some(ConversationState::Collecting));
    }

    #[test]
    fn finished_summarizes_counts() {
        let mut book = started_book();
        book.on_message(SELLER, photo(""), t0(), || None);
        book.on_message(SELLER, text("price 500"), t0(), || None);
        let effects = book.on_message(SELLER, text("FINISHED"), t0(), || None);

        let summary = replies(&effects)[0];
        assert!(summary.contains("*Text Details:* Yes"));
        assert!(summary.contains("*Images:* 1 photo(s)"));
        assert_eq!(
            book.active_state(SELLER),
            Some(ConversationState::AwaitingConfirmation)
        );
    }

    #[test]
    fn cancel_clears_collected_content() {
        let mut book = started_book();
        book.on_message(SELLER, photo(""), t0(), || None);
        book.on_message(SELLER, text("price 500"), t0(), || None);
        book.on_message(SELLER, text("finished"), t0(), || None);
        let effects = book.on_message(SELLER, text("cancel"), t0(), || None);

        assert_eq!(replies(&effects), vec![RESET_NOTICE]);
        let record = book.get(SELLER).unwrap();
        assert_eq!(record.state, ConversationState::Collecting);
        assert!(record.text.is_empty());
        assert!(record.attachments.is_empty());
    }

    #[test]
    fn confirm_hands_back_snapshot_and_completion_is_explicit() {
        let mut book = started_book();
        book.on_message(SELLER, text("price 500"), t0(), || None);
        book.on_message(SELLER, text("finished"), t0(), || None);

        let effects = book.on_message(SELLER, text("confirm"), t0(), || None);
        let Some(Effect::AssembleReport(snapshot)) = effects.first() else {
            panic!("expected an assembly effect, got {effects:?}");
        };
        assert_eq!(snapshot.text, "price 500");
        assert_eq!(
            book.active_state(SELLER),
            Some(ConversationState::AwaitingConfirmation)
        );

        assert!(book.mark_completed(SELLER, snapshot.started_at));
        assert_eq!(book.get(SELLER).unwrap().state, ConversationState::Completed);
        assert!(book.active_state(SELLER).is_none());
        assert!(!book.mark_completed(SELLER, snapshot.started_at));
    }

    #[test]
    fn anything_else_while_awaiting_reprompts() {
        let mut book = started_book();
        book.on_message(SELLER, text("price 500"), t0(), || None);
        book.on_message(SELLER, text("finished"), t0(), || None);
        let effects = book.on_message(SELLER, text("what?"), t0(), || None);
        assert_eq!(replies(&effects), vec![REPROMPT]);
    }

    #[test]
    fn mark_completed_ignores_newer_conversation() {
        let mut book = started_book();
        let old_start = t0();
        book.expire_stale(t0() + Duration::minutes(1));
        book.on_message(SELLER, text("hello again"), t0() + Duration::hours(3), || None);
        assert!(!book.mark_completed(SELLER, old_start));
    }

    #[test]
    fn expired_record_is_not_completed() {
        let mut book = started_book();
        book.on_message(SELLER, text("price 500"), t0(), || None);
        book.on_message(SELLER, text("finished"), t0(), || None);
        book.on_message(SELLER, text("confirm"), t0(), || None);

        book.expire_stale(t0() + Duration::hours(3));
        assert!(!book.mark_completed(SELLER, t0()));
        assert_eq!(book.get(SELLER).unwrap().state, ConversationState::Expired);
    }

    #[test]
    fn expire_stale_spares_completed_and_fresh_records() {
        let mut book = ConversationBook::new();
        book.on_message("a@c.us", text("hi"), t0(), || None);
        book.on_message("b@c.us", text("hi"), t0(), || None);
        book.on_message("c@c.us", text("hi"), t0() + Duration::hours(2), || None);

        book.on_message("b@c.us", text("price"), t0(), || None);
        book.on_message("b@c.us", text("finished"), t0(), || None);
        book.mark_completed("b@c.us", t0());

        let expired = book.expire_stale(t0() + Duration::hours(1));
        assert_eq!(expired, vec!["a@c.us".to_string()]);
        assert_eq!(book.get("a@c.us").unwrap().state, ConversationState::Expired);
        assert_eq!(book.get("b@c.us").unwrap().state, ConversationState::Completed);
        assert_eq!(book.get("c@c.us").unwrap().state, ConversationState::Collecting);
    }

    #[test]
    fn expired_record_keeps_data_until_next_conversation() {
        let mut book = started_book();
        book.on_message(SELLER, text("price 500"), t0(), || None);
        book.expire_stale(t0() + Duration::hours(3));
        assert_eq!(book.get(SELLER).unwrap().text, "price 500");

        book.on_message(SELLER, text("hello"), t0() + Duration::hours(4), || None);
        let record = book.get(SELLER).unwrap();
        assert_eq!(record.state, ConversationState::Collecting);
        assert!(record.text.is_empty());
    }
}
