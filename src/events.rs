use crate::ingest::AverageRecord;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Fan-out of derived averages to live consumers. Publishing never waits on
/// subscribers; a subscriber that falls behind skips ahead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AverageRecord>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, record: AverageRecord) {
        // Only fails when nobody is subscribed.
        let _ = self.tx.send(record);
    }

    pub fn subscribe(&self) -> BroadcastStream<AverageRecord> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

/// Logs every derived event as JSON until the bus closes.
pub async fn run_event_log(mut events: BroadcastStream<AverageRecord>) {
    while let Some(item) = events.next().await {
        match item {
            Ok(record) => match serde_json::to_string(&record) {
                Ok(payload) => {
                    tracing::debug!(event = record.event_name(), payload = %payload, "derived event")
                }
                Err(err) => tracing::warn!(error=%err, "failed to serialize derived event"),
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event log fell behind; skipping ahead");
            }
        }
    }
}
