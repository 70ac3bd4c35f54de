use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::RangeInclusive;

pub const STANDARD_NODE_IDS: RangeInclusive<u16> = 1..=12;
pub const OUTDOOR_NODE_ID: u16 = 65001;

/// Column order shared by node/greenhouse averages, storage and events.
pub const STANDARD_FIELDS: [&str; 15] = [
    "air_temp_c",
    "leaf_temp_c",
    "bag_temp_c",
    "air_rh_pct",
    "bag_rh1_pct",
    "bag_rh2_pct",
    "bag_rh3_pct",
    "bag_rh4_pct",
    "bag_rh_avg_pct",
    "par_value",
    "weight_g",
    "ea_air_kpa",
    "ea_leaf_kpa",
    "es_kpa",
    "vpd_kpa",
];

/// Positions of the outdoor fields inside `STANDARD_FIELDS`.
const OUTDOOR_COLUMNS: [usize; 5] = [0, 3, 9, 11, 13];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub greenhouse_id: u16,
    pub node_id: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Standard,
    Outdoor,
}

impl NodeKind {
    pub fn for_node(node_id: u16) -> Option<Self> {
        if node_id == OUTDOOR_NODE_ID {
            Some(NodeKind::Outdoor)
        } else if STANDARD_NODE_IDS.contains(&node_id) {
            Some(NodeKind::Standard)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Standard => "standard",
            NodeKind::Outdoor => "outdoor",
        }
    }
}

pub fn node_label(node_id: u16) -> String {
    if node_id == OUTDOOR_NODE_ID {
        return "Outdoor_Node".to_string();
    }
    format!("node{node_id:02}")
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StandardReading {
    pub air_temp_c: f32,
    pub leaf_temp_c: f32,
    pub bag_temp_c: f32,
    pub air_rh_pct: f32,
    pub bag_rh1_pct: f32,
    pub bag_rh2_pct: f32,
    pub bag_rh3_pct: f32,
    pub bag_rh4_pct: f32,
    pub bag_rh_avg_pct: f32,
    pub par_value: u16,
    pub weight_g: u16,
    pub ea_air_kpa: f32,
    pub ea_leaf_kpa: f32,
    pub es_kpa: f32,
    pub vpd_kpa: f32,
}

impl StandardReading {
    pub(in crate::ingest) fn values(&self) -> [f64; 15] {
        [
            self.air_temp_c as f64,
            self.leaf_temp_c as f64,
            self.bag_temp_c as f64,
            self.air_rh_pct as f64,
            self.bag_rh1_pct as f64,
            self.bag_rh2_pct as f64,
            self.bag_rh3_pct as f64,
            self.bag_rh4_pct as f64,
            self.bag_rh_avg_pct as f64,
            self.par_value as f64,
            self.weight_g as f64,
            self.ea_air_kpa as f64,
            self.ea_leaf_kpa as f64,
            self.es_kpa as f64,
            self.vpd_kpa as f64,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutdoorReading {
    pub air_temp_c: f32,
    pub air_rh_pct: f32,
    pub par_value: u16,
    pub ea_air_kpa: f32,
    pub es_kpa: f32,
}

impl OutdoorReading {
    pub(in crate::ingest) fn values(&self) -> [f64; 5] {
        [
            self.air_temp_c as f64,
            self.air_rh_pct as f64,
            self.par_value as f64,
            self.ea_air_kpa as f64,
            self.es_kpa as f64,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Payload {
    Standard(StandardReading),
    Outdoor(OutdoorReading),
}

impl Payload {
    pub fn kind(&self) -> NodeKind {
        match self {
            Payload::Standard(_) => NodeKind::Standard,
            Payload::Outdoor(_) => NodeKind::Outdoor,
        }
    }
}

/// One decoded frame. The header ids come from the frame itself and have
/// already been checked against the routing topic.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub greenhouse_id: u16,
    pub node_id: u16,
    pub received_at: DateTime<Utc>,
    pub payload: Payload,
}

impl Reading {
    pub fn key(&self) -> NodeKey {
        NodeKey {
            greenhouse_id: self.greenhouse_id,
            node_id: self.node_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StandardFields {
    pub air_temp_c: f64,
    pub leaf_temp_c: f64,
    pub bag_temp_c: f64,
    pub air_rh_pct: f64,
    pub bag_rh1_pct: f64,
    pub bag_rh2_pct: f64,
    pub bag_rh3_pct: f64,
    pub bag_rh4_pct: f64,
    pub bag_rh_avg_pct: f64,
    pub par_value: f64,
    pub weight_g: f64,
    pub ea_air_kpa: f64,
    pub ea_leaf_kpa: f64,
    pub es_kpa: f64,
    pub vpd_kpa: f64,
}

impl StandardFields {
    pub fn from_values(v: [f64; 15]) -> Self {
        Self {
            air_temp_c: v[0],
            leaf_temp_c: v[1],
            bag_temp_c: v[2],
            air_rh_pct: v[3],
            bag_rh1_pct: v[4],
            bag_rh2_pct: v[5],
            bag_rh3_pct: v[6],
            bag_rh4_pct: v[7],
            bag_rh_avg_pct: v[8],
            par_value: v[9],
            weight_g: v[10],
            ea_air_kpa: v[11],
            ea_leaf_kpa: v[12],
            es_kpa: v[13],
            vpd_kpa: v[14],
        }
    }

    pub fn values(&self) -> [f64; 15] {
        [
            self.air_temp_c,
            self.leaf_temp_c,
            self.bag_temp_c,
            self.air_rh_pct,
            self.bag_rh1_pct,
            self.bag_rh2_pct,
            self.bag_rh3_pct,
            self.bag_rh4_pct,
            self.bag_rh_avg_pct,
            self.par_value,
            self.weight_g,
            self.ea_air_kpa,
            self.ea_leaf_kpa,
            self.es_kpa,
            self.vpd_kpa,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct OutdoorFields {
    pub air_temp_c: f64,
    pub air_rh_pct: f64,
    pub par_value: f64,
    pub ea_air_kpa: f64,
    pub es_kpa: f64,
}

impl OutdoorFields {
    pub fn from_values(v: [f64; 5]) -> Self {
        Self {
            air_temp_c: v[0],
            air_rh_pct: v[1],
            par_value: v[2],
            ea_air_kpa: v[3],
            es_kpa: v[4],
        }
    }

    pub fn values(&self) -> [f64; 5] {
        [
            self.air_temp_c,
            self.air_rh_pct,
            self.par_value,
            self.ea_air_kpa,
            self.es_kpa,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NodeFields {
    Standard(StandardFields),
    Outdoor(OutdoorFields),
}

impl NodeFields {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeFields::Standard(_) => NodeKind::Standard,
            NodeFields::Outdoor(_) => NodeKind::Outdoor,
        }
    }

    /// Values laid out in `STANDARD_FIELDS` order; fields the variant does
    /// not carry are `None`.
    pub fn column_values(&self) -> [Option<f64>; 15] {
        match self {
            NodeFields::Standard(fields) => fields.values().map(Some),
            NodeFields::Outdoor(fields) => {
                let mut out = [None; 15];
                for (column, value) in OUTDOOR_COLUMNS.iter().zip(fields.values()) {
                    out[*column] = Some(value);
                }
                out
            }
        }
    }
}

/// Per-node mean over the rolling window at one tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeAverage {
    pub ts: DateTime<Utc>,
    pub greenhouse_id: u16,
    pub node_id: u16,
    pub sample_count: u32,
    #[serde(flatten)]
    pub fields: NodeFields,
}

/// Mean across the standard nodes of one greenhouse that reported this tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GreenhouseAverage {
    pub ts: DateTime<Utc>,
    pub greenhouse_id: u16,
    pub node_count: u32,
    #[serde(flatten)]
    pub fields: StandardFields,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AverageRecord {
    Node(NodeAverage),
    Greenhouse(GreenhouseAverage),
}

impl AverageRecord {
    pub const NODE_EVENT: &'static str = "node_avg";
    pub const GREENHOUSE_EVENT: &'static str = "gh_avg";

    pub fn event_name(&self) -> &'static str {
        match self {
            AverageRecord::Node(_) => Self::NODE_EVENT,
            AverageRecord::Greenhouse(_) => Self::GREENHOUSE_EVENT,
        }
    }

    pub fn greenhouse_id(&self) -> u16 {
        match self {
            AverageRecord::Node(avg) => avg.greenhouse_id,
            AverageRecord::Greenhouse(avg) => avg.greenhouse_id,
        }
    }

    pub fn node_id(&self) -> Option<u16> {
        match self {
            AverageRecord::Node(avg) => Some(avg.node_id),
            AverageRecord::Greenhouse(_) => None,
        }
    }
}
