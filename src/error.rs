use thiserror::Error;

/// Why a frame could not be turned into a `Reading`. Frames that fail are
/// logged and counted, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("node {node_id} is not a known greenhouse node")]
    UnknownNode { node_id: u16 },
    #[error("node {node_id} expects a {expected}-byte frame, got {actual} bytes")]
    LengthMismatch {
        node_id: u16,
        expected: usize,
        actual: usize,
    },
    #[error("field {field} is not a finite number")]
    FieldOutOfRange { field: &'static str },
    #[error(
        "frame header says greenhouse {frame_greenhouse_id} node {frame_node_id}, \
         topic says greenhouse {greenhouse_id} node {node_id}"
    )]
    HeaderMismatch {
        greenhouse_id: u16,
        node_id: u16,
        frame_greenhouse_id: u16,
        frame_node_id: u16,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("broker refused subscription to {topic}")]
    SubscriptionRefused { topic: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A window held readings of a different layout than its node's kind. This
/// is a programming error and stops the aggregation task.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "window for greenhouse {greenhouse_id} node {node_id} holds {expected} readings, \
     received {actual}"
)]
pub struct AggregationInvariantViolation {
    pub greenhouse_id: u16,
    pub node_id: u16,
    pub expected: &'static str,
    pub actual: &'static str,
}
