use super::decode::decode_frame;
use super::greenhouse::combine_all;
use super::state::NodeAggregator;
use super::types::AverageRecord;
use crate::error::AggregationInvariantViolation;
use crate::events::EventBus;
use crate::pipeline::{IngestStats, PipelineHandle};
use crate::telemetry::RawFrame;
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// Owns all rolling windows. Only the aggregation task touches it, so no
/// locking is needed.
pub struct Aggregator {
    period: Duration,
    nodes: NodeAggregator,
    stats: Arc<IngestStats>,
}

impl Aggregator {
    pub fn new(period: Duration, window_capacity: usize, stats: Arc<IngestStats>) -> Self {
        Self {
            period,
            nodes: NodeAggregator::new(period, window_capacity),
            stats,
        }
    }

    /// Decodes and records one frame. Undecodable frames are logged and
    /// counted; only a window invariant violation is returned.
    pub fn ingest(&mut self, frame: RawFrame) -> Result<(), AggregationInvariantViolation> {
        match decode_frame(&frame) {
            Ok(reading) => self.nodes.record(reading.received_at, reading),
            Err(err) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    topic = %frame.topic,
                    len = frame.payload.len(),
                    error = %err,
                    "dropping undecodable frame"
                );
                Ok(())
            }
        }
    }

    /// Node averages for every node with data, followed by one average per
    /// greenhouse. All share the tick timestamp.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<AverageRecord> {
        let nodes = self.nodes.tick(now);
        let greenhouses = combine_all(now, &nodes);
        tracing::debug!(
            nodes = nodes.len(),
            greenhouses = greenhouses.len(),
            tracked_nodes = self.nodes.tracked_nodes(),
            buffered = self.nodes.buffered_readings(),
            "aggregation tick"
        );
        nodes
            .into_iter()
            .map(AverageRecord::Node)
            .chain(greenhouses.into_iter().map(AverageRecord::Greenhouse))
            .collect()
    }
}

/// Consumes frames until the channel closes, emitting averages every period
/// to the event bus and the storage worker.
pub async fn run_aggregator(
    mut aggregator: Aggregator,
    mut frames: mpsc::Receiver<RawFrame>,
    pipeline: PipelineHandle,
    events: EventBus,
) -> Result<(), AggregationInvariantViolation> {
    let period = aggregator.period;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(frame) => aggregator.ingest(frame)?,
                    None => break,
                }
            }
            _ = ticker.tick() => {
                for record in aggregator.tick(Utc::now()) {
                    events.publish(record.clone());
                    if let Err(err) = pipeline.enqueue(record).await {
                        tracing::warn!(error=%err, "storage worker unavailable; average not persisted");
                    }
                }
                aggregator.stats.log_progress();
            }
        }
    }

    if let Err(err) = pipeline.flush().await {
        tracing::warn!(error=%err, "final flush request failed");
    }
    tracing::info!("frame channel closed; aggregation task stopped");
    Ok(())
}
