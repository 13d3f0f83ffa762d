/// Failures surfaced by the broker core.
///
/// Only `NotFound` and `InvalidCommand` are returned to callers as hard
/// errors; the rest describe conditions that are logged and recovered from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to deliver to {destination}: {reason}")]
    Dispatch { destination: String, reason: String },

    #[error("inquiry #{0} not found")]
    NotFound(u64),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("text normalization failed: {0}")]
    Normalization(String),

    #[error("report assembly failed: {0}")]
    Assembly(String),

    #[error("state persistence failed: {0}")]
    Persistence(String),
}
