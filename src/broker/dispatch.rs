//! Concurrent fan-out of an inquiry to every destination of its topic.

use super::error::BrokerError;
use crate::channels::{Channel, SendMessage};
use futures_util::future::join_all;
use std::sync::Arc;

pub fn inquiry_broadcast_text(body: &str) -> String {
    format!("I am looking for : {body} if you have Reply Privately")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationOutcome {
    pub destination: String,
    pub result: Result<(), BrokerError>,
}

/// Why a fan-out delivered nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchFailureKind {
    NoDestinations,
    AllFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub topic: String,
    pub sequence: u64,
    pub outcomes: Vec<DestinationOutcome>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .count()
    }

    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DestinationOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }

    /// Set when nothing was delivered; a partial fan-out is a success.
    pub fn failure_condition(&self) -> Option<DispatchFailureKind> {
        if self.outcomes.is_empty() {
            Some(DispatchFailureKind::NoDestinations)
        } else if self.delivered() == 0 {
            Some(DispatchFailureKind::AllFailed)
        } else {
            None
        }
    }
}

pub struct Dispatcher {
    channel: Arc<dyn Channel>,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// Send the inquiry to every destination at once and collect each result.
    pub async fn broadcast(
        &self,
        topic: &str,
        sequence: u64,
        body: &str,
        destinations: &[String],
    ) -> DispatchReport {
        let text = inquiry_broadcast_text(body);
        let sends = destinations.iter().map(|destination| {
            let message = SendMessage::new(text.clone(), destination.clone());
            let channel = Arc::clone(&self.channel);
            async move {
                let result = channel.send(&message).await.map_err(|e| BrokerError::Dispatch {
                    destination: message.recipient.clone(),
                    reason: format!("{e:#}"),
                });
                match &result {
                    Ok(()) => tracing::info!(sequence, destination = %message.recipient, "Inquiry delivered"),
                    Err(e) => tracing::warn!(sequence, "{e}"),
                }
                DestinationOutcome {
                    destination: message.recipient,
                    result,
                }
            }
        });

        DispatchReport {
            topic: topic.to_string(),
            sequence,
            outcomes: join_all(sends).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelMessage;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FlakyChannel {
        failing: Vec<String>,
        sent: Mutex<Vec<SendMessage>>,
    }

    #[async_trait]
    impl Channel for FlakyChannel {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
            if self.failing.contains(&message.recipient) {
                anyhow::bail!("group {} unreachable", message.recipient);
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }

        async fn listen(&self, _tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn destinations(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn broadcast_text_matches_template() {
        assert_eq!(
            inquiry_broadcast_text("need 5 laptops"),
            "I am looking for : need 5 laptops if you have Reply Privately"
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let channel = Arc::new(FlakyChannel {
            failing: vec!["g1@g.us".into()],
            ..FlakyChannel::default()
        });
        let dispatcher = Dispatcher::new(channel.clone());

        let report = dispatcher
            .broadcast("LAPTOP", 1, "need laptops", &destinations(&["g1@g.us", "g2@g.us"]))
            .await;

        assert_eq!(report.delivered(), 1);
        assert_eq!(report.attempted(), 2);
        assert!(report.failure_condition().is_none());
        assert_eq!(report.outcomes[0].destination, "g1@g.us");
        assert!(matches!(
            report.outcomes[0].result,
            Err(BrokerError::Dispatch { ref destination, .. }) if destination == "g1@g.us"
        ));
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn empty_destination_set_is_a_condition_not_an_error() {
        let dispatcher = Dispatcher::new(Arc::new(FlakyChannel::default()));
        let report = dispatcher.broadcast("MOUSE", 2, "mice", &[]).await;
        assert_eq!(
            report.failure_condition(),
            Some(DispatchFailureKind::NoDestinations)
        );
    }

    #[tokio::test]
    async fn total_failure_is_reported() {
        let dispatcher = Dispatcher::new(Arc::new(FlakyChannel {
            failing: destinations(&["g1", "g2"]),
            ..FlakyChannel::default()
        }));
        let report = dispatcher
            .broadcast("MOUSE", 3, "mice", &destinations(&["g1", "g2"]))
            .await;
        assert_eq!(report.failure_condition(), Some(DispatchFailureKind::AllFailed));
        assert_eq!(report.failures().count(), 2);
    }
}
