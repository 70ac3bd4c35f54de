use super::rolling::mean_of;
use super::types::{GreenhouseAverage, NodeAverage, NodeFields, StandardFields};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Averages the standard nodes of `greenhouse_id` that produced a value this
/// tick. Each node counts once regardless of how many samples it buffered.
/// The outdoor node never contributes.
pub(in crate::ingest) fn combine(
    greenhouse_id: u16,
    ts: DateTime<Utc>,
    averages: &[NodeAverage],
) -> Option<GreenhouseAverage> {
    let rows = averages
        .iter()
        .filter(|avg| avg.greenhouse_id == greenhouse_id)
        .filter_map(|avg| match avg.fields {
            NodeFields::Standard(fields) => Some(fields.values()),
            NodeFields::Outdoor(_) => None,
        });
    let (values, node_count) = mean_of(rows)?;
    Some(GreenhouseAverage {
        ts,
        greenhouse_id,
        node_count,
        fields: StandardFields::from_values(values),
    })
}

/// One greenhouse average per greenhouse present in `averages`.
pub(in crate::ingest) fn combine_all(
    ts: DateTime<Utc>,
    averages: &[NodeAverage],
) -> Vec<GreenhouseAverage> {
    let greenhouses: BTreeSet<u16> = averages.iter().map(|avg| avg.greenhouse_id).collect();
    greenhouses
        .into_iter()
        .filter_map(|greenhouse_id| combine(greenhouse_id, ts, averages))
        .collect()
}
