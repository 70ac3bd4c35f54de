mod aggregator;
mod decode;
mod greenhouse;
mod rolling;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use aggregator::{run_aggregator, Aggregator};
pub use types::{
    node_label, AverageRecord, GreenhouseAverage, NodeAverage, NodeKind, OUTDOOR_NODE_ID,
    STANDARD_FIELDS, STANDARD_NODE_IDS,
};

#[cfg(test)]
pub use types::{NodeFields, OutdoorFields, StandardFields};
