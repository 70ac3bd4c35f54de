use super::types::{NodeFields, NodeKey, NodeKind, OutdoorFields, Payload, StandardFields};
use crate::error::AggregationInvariantViolation;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug)]
struct TimedPayload {
    timestamp: DateTime<Utc>,
    payload: Payload,
}

/// Time- and count-bounded buffer of one node's readings.
#[derive(Debug)]
pub(in crate::ingest) struct RollingWindow {
    key: NodeKey,
    kind: NodeKind,
    period: ChronoDuration,
    capacity: usize,
    buffer: VecDeque<TimedPayload>,
}

impl RollingWindow {
    pub(in crate::ingest) fn new(
        key: NodeKey,
        kind: NodeKind,
        period: ChronoDuration,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            key,
            kind,
            period,
            capacity,
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a reading, drops everything older than `timestamp - period`
    /// and then evicts the oldest entries beyond capacity.
    pub(in crate::ingest) fn push(
        &mut self,
        timestamp: DateTime<Utc>,
        payload: Payload,
    ) -> Result<(), AggregationInvariantViolation> {
        if payload.kind() != self.kind {
            return Err(AggregationInvariantViolation {
                greenhouse_id: self.key.greenhouse_id,
                node_id: self.key.node_id,
                expected: self.kind.as_str(),
                actual: payload.kind().as_str(),
            });
        }
        self.buffer.push_back(TimedPayload { timestamp, payload });
        self.prune(timestamp);
        while self.buffer.len() > self.capacity {
            self.buffer.pop_front();
        }
        Ok(())
    }

    pub(in crate::ingest) fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.period;
        while let Some(front) = self.buffer.front() {
            if front.timestamp < cutoff {
                self.buffer.pop_front();
            } else {
                break;
            }
        }
    }

    pub(in crate::ingest) fn len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub(in crate::ingest) fn oldest(&self) -> Option<DateTime<Utc>> {
        self.buffer.front().map(|entry| entry.timestamp)
    }

    /// Field-wise mean of the buffered readings with the sample count, or
    /// `None` when the window is empty.
    pub(in crate::ingest) fn mean(&self) -> Option<(NodeFields, u32)> {
        match self.kind {
            NodeKind::Standard => {
                let rows = self.buffer.iter().filter_map(|entry| match entry.payload {
                    Payload::Standard(reading) => Some(reading.values()),
                    Payload::Outdoor(_) => None,
                });
                mean_of(rows).map(|(values, count)| {
                    (NodeFields::Standard(StandardFields::from_values(values)), count)
                })
            }
            NodeKind::Outdoor => {
                let rows = self.buffer.iter().filter_map(|entry| match entry.payload {
                    Payload::Outdoor(reading) => Some(reading.values()),
                    Payload::Standard(_) => None,
                });
                mean_of(rows).map(|(values, count)| {
                    (NodeFields::Outdoor(OutdoorFields::from_values(values)), count)
                })
            }
        }
    }
}

pub(in crate::ingest) fn mean_of<const N: usize>(
    rows: impl Iterator<Item = [f64; N]>,
) -> Option<([f64; N], u32)> {
    let mut sums = [0.0f64; N];
    let mut count = 0u32;
    for row in rows {
        for (sum, value) in sums.iter_mut().zip(row) {
            *sum += value;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    for sum in &mut sums {
        *sum /= count as f64;
    }
    Some((sums, count))
}
