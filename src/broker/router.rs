//! Sender classification and requester command parsing.

use super::dispatch::{DispatchFailureKind, DispatchReport};
use super::topics::TopicRegistry;
use crate::config::BrokerConfig;
use crate::util::display_identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderRole {
    Requester,
    Respondent,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct SenderPolicy {
    requester: String,
    group_suffix: String,
    ignored_senders: Vec<String>,
}

impl SenderPolicy {
    pub fn new(
        requester: impl Into<String>,
        group_suffix: impl Into<String>,
        ignored_senders: Vec<String>,
    ) -> Self {
        Self {
            requester: requester.into(),
            group_suffix: group_suffix.into(),
            ignored_senders,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            config.requester.clone(),
            config.group_suffix.clone(),
            config.ignored_senders.clone(),
        )
    }

    pub fn requester(&self) -> &str {
        &self.requester
    }

    pub fn classify(&self, sender: &str) -> SenderRole {
        let sender = sender.trim();
        if sender.is_empty()
            || self.ignored_senders.iter().any(|ignored| ignored == sender)
            || (!self.group_suffix.is_empty() && sender.ends_with(&self.group_suffix))
        {
            return SenderRole::Ignored;
        }
        if !self.requester.trim().is_empty()
            && display_identity(sender) == display_identity(self.requester.trim())
        {
            return SenderRole::Requester;
        }
        SenderRole::Respondent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequesterCommand {
    Restart,
    /// `None` when the argument is missing or not a number.
    Close(Option<u64>),
    Issue { topic: String },
    Unknown,
}

/// Commands are tried in order: `restart`, `close <n>`, topic keyword.
pub fn parse_requester_command(body: &str, topics: &TopicRegistry) -> RequesterCommand {
    let trimmed = body.trim();
    if trimmed.eq_ignore_ascii_case("restart") {
        return RequesterCommand::Restart;
    }

    let mut tokens = trimmed.split_whitespace();
    if tokens
        .next()
        .is_some_and(|first| first.eq_ignore_ascii_case("close"))
    {
        let sequence = match (tokens.next(), tokens.next()) {
            (Some(arg), None) => arg.trim_start_matches('#').parse::<u64>().ok(),
            _ => None,
        };
        return RequesterCommand::Close(sequence);
    }

    match topics.resolve(trimmed) {
        Some(topic) => RequesterCommand::Issue {
            topic: topic.to_string(),
        },
        None => RequesterCommand::Unknown,
    }
}

pub const RESTART_REPLY: &str = "🔄 **SYSTEM RESTARTED**\n\n\
     ✅ Query counter reset to 0\n\
     ✅ All active queries cleared\n\
     ✅ Recent queries cleared\n\
     ✅ Seller conversations reset\n\n\
     🚀 Ready for fresh start!";

pub const INVALID_CLOSE_REPLY: &str =
    "❌ Invalid command. Use \"close <number>\" (e.g., \"close 12\").";

pub fn closed_reply(sequence: u64, topic: &str) -> String {
    format!("✅ Query #{sequence} ({topic}) has been closed.")
}

pub fn not_found_reply(sequence: u64) -> String {
    format!("❌ Query #{sequence} not found. Use \"close <number>\" with an issued query number.")
}

pub fn unknown_command_reply(body: &str, topics: &TopicRegistry) -> String {
    format!(
        "🤖 No valid product keyword found in \"{body}\". Available: {}",
        topics.keywords().collect::<Vec<_>>().join(", ")
    )
}

/// Requester-facing replies for one issuance.
pub fn dispatch_replies(report: &DispatchReport) -> Vec<String> {
    match report.failure_condition() {
        Some(DispatchFailureKind::NoDestinations) => vec![format!(
            "❌ No groups configured for \"{}\". Please add group IDs to topics.json",
            report.topic
        )],
        condition => {
            let mut replies = vec![format!(
                "👍 Query #{} for \"{}\" sent to {}/{} groups.",
                report.sequence,
                report.topic,
                report.delivered(),
                report.attempted()
            )];
            if condition == Some(DispatchFailureKind::AllFailed) {
                replies.push(
                    "⚠️ Warning: Message was not sent to any groups. Please check your group IDs in topics.json"
                        .to_string(),
                );
            }
            replies
        }
    }
}
