//! Turns a confirmed conversation into messages for the requester.

use super::conversation::{AttachmentRecord, ConversationRecord};
use super::error::BrokerError;
use super::normalizer::{normalize_or_raw, TextNormalizer};
use crate::channels::{Channel, MediaPayload, SendMessage};
use crate::util::display_identity;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub const RESPONDENT_ACK: &str =
    "✅ Perfect! Your response has been sent to the buyer. Thank you for your submission!";
pub const RESPONDENT_FAILURE_NOTICE: &str =
    "❌ Sorry, there was an error processing your response. Please try again.";

const REPORT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyOutcome {
    pub media_sent: usize,
    pub media_failed: usize,
    pub normalized: bool,
    pub acknowledged: bool,
}

pub fn attachment_caption(
    record: &ConversationRecord,
    index: usize,
    attachment: &AttachmentRecord,
) -> String {
    let mut caption = format!(
        "📸 Image {}/{} from {}\n",
        index + 1,
        record.attachments.len(),
        display_identity(&record.identity)
    );
    if let Some(linked) = &record.linked {
        caption.push_str(&format!("📋 Reply to: \"{}\"\n", linked.text));
    }
    caption.push_str("(seller replied privately from group)");
    if !attachment.caption.is_empty() {
        caption.push_str(&format!("\n📝 Caption: {}", attachment.caption));
    }
    caption
}

pub fn attachment_file_name(index: usize, mime_type: &str) -> String {
    let extension = mime_guess::get_mime_extensions_str(mime_type)
        .and_then(|exts| exts.iter().find(|ext| **ext == "jpg").or_else(|| exts.first()))
        .copied()
        .unwrap_or("bin");
    let stem = if mime_type.starts_with("image/") {
        "image"
    } else {
        "file"
    };
    format!("{stem}_{}.{extension}", index + 1)
}

pub fn report_text(
    record: &ConversationRecord,
    processed: &str,
    completed_at: DateTime<Utc>,
) -> String {
    let mut report = format!(
        "SELLER RESPONSE\n\nFrom: {}\n\n",
        display_identity(&record.identity)
    );
    if let Some(linked) = &record.linked {
        report.push_str(&format!("📋 *Original Query:*\n\"{}\"\n\n", linked.text));
    }
    let original = if record.text.is_empty() {
        "No text provided"
    } else {
        record.text.as_str()
    };
    report.push_str(&format!(
        "Product Information\n\n{processed}\n\n---\nOriginal Message:\n\"{original}\"\n\n\
         Images: {} photo(s)\nTimestamp: {}",
        record.attachments.len(),
        completed_at.format(REPORT_TIMESTAMP_FORMAT)
    ));
    report
}

pub struct ReportAssembler {
    channel: Arc<dyn Channel>,
    normalizer: Arc<dyn TextNormalizer>,
    requester: String,
    send_delay: Duration,
}

impl ReportAssembler {
    pub fn new(
        channel: Arc<dyn Channel>,
        normalizer: Arc<dyn TextNormalizer>,
        requester: impl Into<String>,
        send_delay: Duration,
    ) -> Self {
        Self {
            channel,
            normalizer,
            requester: requester.into(),
            send_delay,
        }
    }

    /// Forward attachments, normalize the text, send the report, then
    /// acknowledge the respondent.
    ///
    /// Only a failed report send is an error; the conversation may then be
    /// confirmed again.
    pub async fn assemble(
        &self,
        record: &ConversationRecord,
        completed_at: DateTime<Utc>,
    ) -> Result<AssemblyOutcome, BrokerError> {
        let mut outcome = AssemblyOutcome::default();
        let respondent = record.identity.as_str();

        for (index, attachment) in record.attachments.iter().enumerate() {
            let message = SendMessage::new(
                attachment_caption(record, index, attachment),
                self.requester.clone(),
            )
            .with_media(MediaPayload {
                mime_type: attachment.mime_type.clone(),
                data: attachment.payload.clone(),
                file_name: Some(attachment_file_name(index, &attachment.mime_type)),
            });

            match self.channel.send(&message).await {
                Ok(()) => {
                    outcome.media_sent += 1;
                    tracing::info!(
                        respondent,
                        index = index + 1,
                        total = record.attachments.len(),
                        "Attachment forwarded"
                    );
                }
                Err(e) => {
                    outcome.media_failed += 1;
                    tracing::error!(
                        respondent,
                        index = index + 1,
                        "Failed to forward attachment: {e:#}"
                    );
                }
            }

            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
        }

        let processed = if record.text.is_empty() {
            "No text details provided".to_string()
        } else {
            let (text, normalized) = normalize_or_raw(self.normalizer.as_ref(), &record.text).await;
            outcome.normalized = normalized;
            text
        };

        let report = SendMessage::new(
            report_text(record, &processed, completed_at),
            self.requester.clone(),
        );
        self.channel
            .send(&report)
            .await
            .map_err(|e| BrokerError::Assembly(format!("report delivery failed: {e:#}")))?;

        match self
            .channel
            .send(&SendMessage::new(RESPONDENT_ACK, respondent))
            .await
        {
            Ok(()) => outcome.acknowledged = true,
            Err(e) => tracing::warn!(respondent, "Report sent but acknowledgment failed: {e:#}"),
        }

        Ok(outcome)
    }
}
