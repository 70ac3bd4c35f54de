use super::rolling::RollingWindow;
use super::types::{NodeAverage, NodeKey, NodeKind, Reading};
use crate::error::AggregationInvariantViolation;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Rolling windows for every node seen so far, keyed by greenhouse and node.
#[derive(Debug)]
pub(in crate::ingest) struct NodeAggregator {
    period: ChronoDuration,
    capacity: usize,
    windows: BTreeMap<NodeKey, RollingWindow>,
}

impl NodeAggregator {
    pub(in crate::ingest) fn new(period: Duration, capacity: usize) -> Self {
        let period = ChronoDuration::from_std(period).unwrap_or(ChronoDuration::seconds(60));
        Self {
            period,
            capacity,
            windows: BTreeMap::new(),
        }
    }

    pub(in crate::ingest) fn record(
        &mut self,
        timestamp: DateTime<Utc>,
        reading: Reading,
    ) -> Result<(), AggregationInvariantViolation> {
        let key = reading.key();
        let (period, capacity) = (self.period, self.capacity);
        let window = self.windows.entry(key).or_insert_with(|| {
            let kind = NodeKind::for_node(key.node_id).unwrap_or(reading.payload.kind());
            RollingWindow::new(key, kind, period, capacity)
        });
        window.push(timestamp, reading.payload)
    }

    /// Prunes every window to `now` and returns one average per node that
    /// still holds readings, ordered by greenhouse then node.
    pub(in crate::ingest) fn tick(&mut self, now: DateTime<Utc>) -> Vec<NodeAverage> {
        let mut averages = Vec::new();
        for (key, window) in self.windows.iter_mut() {
            window.prune(now);
            let Some((fields, sample_count)) = window.mean() else {
                continue;
            };
            averages.push(NodeAverage {
                ts: now,
                greenhouse_id: key.greenhouse_id,
                node_id: key.node_id,
                sample_count,
                fields,
            });
        }
        averages
    }

    pub(in crate::ingest) fn tracked_nodes(&self) -> usize {
        self.windows.len()
    }

    pub(in crate::ingest) fn buffered_readings(&self) -> usize {
        self.windows.values().map(RollingWindow::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{NodeFields, OutdoorReading, Payload, OUTDOOR_NODE_ID};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    fn outdoor(greenhouse_id: u16, air_temp_c: f32) -> Reading {
        Reading {
            greenhouse_id,
            node_id: OUTDOOR_NODE_ID,
            received_at: t0(),
            payload: Payload::Outdoor(OutdoorReading {
                air_temp_c,
                air_rh_pct: 50.0,
                par_value: 10,
                ea_air_kpa: 1.0,
                es_kpa: 2.0,
            }),
        }
    }

    #[test]
    fn windows_are_isolated_per_greenhouse() {
        let mut nodes = NodeAggregator::new(Duration::from_secs(60), 64);
        nodes.record(t0(), outdoor(1, 10.0)).unwrap();
        nodes.record(t0(), outdoor(2, 30.0)).unwrap();
        assert_eq!(nodes.tracked_nodes(), 2);

        let averages = nodes.tick(t0() + ChronoDuration::seconds(1));
        assert_eq!(averages.len(), 2);
        assert_eq!(averages[0].greenhouse_id, 1);
        assert_eq!(averages[1].greenhouse_id, 2);
        let NodeFields::Outdoor(first) = averages[0].fields else {
            panic!("expected outdoor fields");
        };
        assert_eq!(first.air_temp_c, 10.0);
    }

    #[test]
    fn silent_node_stops_producing_averages() {
        let mut nodes = NodeAggregator::new(Duration::from_secs(60), 64);
        nodes.record(t0(), outdoor(1, 10.0)).unwrap();

        assert_eq!(nodes.tick(t0() + ChronoDuration::seconds(60)).len(), 1);
        assert!(nodes.tick(t0() + ChronoDuration::seconds(61)).is_empty());
        assert_eq!(nodes.buffered_readings(), 0);
    }
}
