pub mod traits;
pub mod whatsapp;

pub use traits::{AttachmentRef, Channel, ChannelMessage, MediaPayload, SendMessage};
pub use whatsapp::WhatsAppChannel;

use crate::broker::Broker;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "dispatch";

fn log_worker_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        tracing::error!("Channel message worker crashed: {error}");
    }
}

type Backlogs = Arc<Mutex<HashMap<String, VecDeque<ChannelMessage>>>>;

/// Next queued message of `sender`; when there is none the sender's entry is
/// removed so the next message starts a new worker.
fn next_for_sender(backlogs: &Backlogs, sender: &str) -> Option<ChannelMessage> {
    let mut backlogs = backlogs.lock();
    let next = backlogs.get_mut(sender).and_then(VecDeque::pop_front);
    if next.is_none() {
        backlogs.remove(sender);
    }
    next
}

/// Drops a crashed worker's backlog so the sender's next message starts a
/// fresh worker.
struct BacklogGuard {
    backlogs: Backlogs,
    sender: String,
}

impl Drop for BacklogGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if let Some(lost) = self.backlogs.lock().remove(&self.sender) {
                tracing::warn!(
                    sender = %self.sender,
                    dropped = lost.len(),
                    "Discarding backlog of crashed worker"
                );
            }
        }
    }
}

/// Feed queued messages to the broker with at most `max_in_flight_messages`
/// senders served at once. Each sender has at most one worker, which handles
/// that sender's messages in arrival order; messages for a busy sender wait in
/// its backlog without taking a slot.
pub async fn run_message_dispatch_loop(
    rx: &mut mpsc::Receiver<ChannelMessage>,
    broker: Arc<Broker>,
    max_in_flight_messages: usize,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(max_in_flight_messages.max(1)));
    let mut workers = tokio::task::JoinSet::new();
    let backlogs: Backlogs = Arc::default();
    crate::health::mark_component_ok(COMPONENT);

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        {
            let mut pending = backlogs.lock();
            if let Some(queue) = pending.get_mut(&msg.sender) {
                queue.push_back(msg);
                continue;
            }
            pending.insert(msg.sender.clone(), VecDeque::new());
        }

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let worker_broker = Arc::clone(&broker);
        let worker_backlogs = Arc::clone(&backlogs);
        workers.spawn(async move {
            let _permit = permit;
            let guard = BacklogGuard {
                backlogs: worker_backlogs,
                sender: msg.sender.clone(),
            };
            let mut next = Some(msg);
            while let Some(msg) = next {
                worker_broker.handle_message(msg).await;
                next = next_for_sender(&guard.backlogs, &guard.sender);
            }
        });

        while let Some(result) = workers.try_join_next() {
            log_worker_join_result(result);
        }
        crate::health::mark_component_ok(COMPONENT);
    }

    while let Some(result) = workers.join_next().await {
        log_worker_join_result(result);
    }
    tracing::info!("Message dispatch loop stopped");
}
