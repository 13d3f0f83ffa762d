//! Sequence-numbered inquiries issued by the requester.

use super::error::BrokerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InquiryStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InquiryRecord {
    pub sequence: u64,
    pub topic: String,
    pub body: String,
    pub issued_at: DateTime<Utc>,
    pub status: InquiryStatus,
    /// Respondent identities whose reports referenced this inquiry.
    #[serde(default)]
    pub responses: Vec<String>,
}

impl InquiryRecord {
    pub fn is_active(&self) -> bool {
        self.status == InquiryStatus::Active
    }
}

/// Result of closing an inquiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOutcome {
    pub topic: String,
    pub already_closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InquiryLedger {
    counter: u64,
    records: BTreeMap<u64, InquiryRecord>,
}

impl InquiryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted parts. The counter never lags behind the
    /// highest stored sequence, so a hand-edited state file cannot cause reuse.
    pub fn from_parts(counter: u64, records: BTreeMap<u64, InquiryRecord>) -> Self {
        let highest = records.keys().next_back().copied().unwrap_or(0);
        Self {
            counter: counter.max(highest),
            records,
        }
    }

    /// Allocate the next sequence number and store an active record.
    pub fn issue(&mut self, topic: &str, body: &str, issued_at: DateTime<Utc>) -> &InquiryRecord {
        self.counter += 1;
        let sequence = self.counter;
        self.records.entry(sequence).or_insert(InquiryRecord {
            sequence,
            topic: topic.to_string(),
            body: body.to_string(),
            issued_at,
            status: InquiryStatus::Active,
            responses: Vec::new(),
        })
    }

    pub fn close(&mut self, sequence: u64) -> Result<CloseOutcome, BrokerError> {
        let record = self
            .records
            .get_mut(&sequence)
            .ok_or(BrokerError::NotFound(sequence))?;
        let already_closed = record.status == InquiryStatus::Closed;
        record.status = InquiryStatus::Closed;
        Ok(CloseOutcome {
            topic: record.topic.clone(),
            already_closed,
        })
    }

    /// Append a response reference; unknown sequences are ignored.
    pub fn record_response(&mut self, sequence: u64, reference: &str) -> bool {
        match self.records.get_mut(&sequence) {
            Some(record) => {
                record.responses.push(reference.to_string());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, sequence: u64) -> Option<&InquiryRecord> {
        self.records.get(&sequence)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn records(&self) -> &BTreeMap<u64, InquiryRecord> {
        &self.records
    }

    pub fn active(&self) -> impl Iterator<Item = &InquiryRecord> {
        self.records.values().filter(|record| record.is_active())
    }

    /// Drop every record and restart numbering from 1.
    pub fn reset(&mut self) {
        self.counter = 0;
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_increments_counter_once_and_creates_active_record() {
        let mut ledger = InquiryLedger::new();
        let now = Utc::now();

        let first = ledger.issue("LAPTOP", "need 5 laptops", now).sequence;
        assert_eq!(first, 1);
        assert_eq!(ledger.counter(), 1);

        let second = ledger.issue("MOUSE", "need mice", now).clone();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.status, InquiryStatus::Active);
        assert!(second.responses.is_empty());
        assert_eq!(ledger.records().len(), 2);
        assert_eq!(ledger.active().count(), 2);
    }

    #[test]
    fn close_unknown_sequence_leaves_ledger_untouched() {
        let mut ledger = InquiryLedger::new();
        ledger.issue("LAPTOP", "need laptops", Utc::now());
        let before = ledger.records().clone();

        assert_eq!(ledger.close(42), Err(BrokerError::NotFound(42)));
        assert_eq!(ledger.records(), &before);
        assert_eq!(ledger.counter(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let mut ledger = InquiryLedger::new();
        ledger.issue("LAPTOP", "need laptops", Utc::now());

        let first = ledger.close(1).unwrap();
        assert_eq!(first.topic, "LAPTOP");
        assert!(!first.already_closed);

        let second = ledger.close(1).unwrap();
        assert!(second.already_closed);
        assert_eq!(ledger.get(1).unwrap().status, InquiryStatus::Closed);
        assert_eq!(ledger.active().count(), 0);
    }

    #[test]
    fn from_parts_never_reuses_stored_sequences() {
        let mut records = BTreeMap::new();
        records.insert(
            7,
            InquiryRecord {
                sequence: 7,
                topic: "MONITOR".into(),
                body: "27 inch".into(),
                issued_at: Utc::now(),
                status: InquiryStatus::Closed,
                responses: vec![],
            },
        );
        let mut ledger = InquiryLedger::from_parts(3, records);
        assert_eq!(ledger.counter(), 7);
        assert_eq!(ledger.issue("MONITOR", "again", Utc::now()).sequence, 8);
    }

    #[test]
    fn reset_restarts_numbering() {
        let mut ledger = InquiryLedger::new();
        ledger.issue("LAPTOP", "a", Utc::now());
        ledger.issue("LAPTOP", "b", Utc::now());
        ledger.reset();
        assert_eq!(ledger.counter(), 0);
        assert!(ledger.records().is_empty());
        assert_eq!(ledger.issue("LAPTOP", "c", Utc::now()).sequence, 1);
    }

    #[test]
    fn responses_are_appended_in_order() {
        let mut ledger = InquiryLedger::new();
        ledger.issue("LAPTOP", "a", Utc::now());
        assert!(ledger.record_response(1, "111@c.us"));
        assert!(ledger.record_response(1, "222@c.us"));
        assert!(!ledger.record_response(9, "333@c.us"));
        assert_eq!(ledger.get(1).unwrap().responses, vec!["111@c.us", "222@c.us"]);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&InquiryStatus::Active).unwrap(),
            "\"active\""
        );
    }
}
