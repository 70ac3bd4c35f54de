use chrono::{DateTime, Utc};

use crate::error::DecodeError;
use crate::telemetry::RawFrame;

use super::types::{NodeKind, OutdoorReading, Payload, Reading, StandardReading};

pub(in crate::ingest) const STANDARD_FRAME_LEN: usize = 60;
pub(in crate::ingest) const OUTDOOR_FRAME_LEN: usize = 22;

fn frame_len(kind: NodeKind) -> usize {
    match kind {
        NodeKind::Standard => STANDARD_FRAME_LEN,
        NodeKind::Outdoor => OUTDOOR_FRAME_LEN,
    }
}

/// Decodes a frame and checks that the header ids agree with the topic it
/// arrived on.
pub(in crate::ingest) fn decode_frame(frame: &RawFrame) -> Result<Reading, DecodeError> {
    let reading = decode(&frame.payload, frame.node_id, frame.received_at)?;
    if reading.greenhouse_id != frame.greenhouse_id {
        return Err(DecodeError::HeaderMismatch {
            greenhouse_id: frame.greenhouse_id,
            node_id: frame.node_id,
            frame_greenhouse_id: reading.greenhouse_id,
            frame_node_id: reading.node_id,
        });
    }
    Ok(reading)
}

/// Decodes one little-endian frame for `node_id`. The layout is picked from
/// the node id alone; the buffer must match that layout's length exactly.
pub(in crate::ingest) fn decode(
    raw: &[u8],
    node_id: u16,
    received_at: DateTime<Utc>,
) -> Result<Reading, DecodeError> {
    let kind = NodeKind::for_node(node_id).ok_or(DecodeError::UnknownNode { node_id })?;
    let expected = frame_len(kind);
    if raw.len() != expected {
        return Err(DecodeError::LengthMismatch {
            node_id,
            expected,
            actual: raw.len(),
        });
    }

    let greenhouse_id = read_u16(raw, 0);
    let frame_node_id = read_u16(raw, 2);
    if frame_node_id != node_id {
        return Err(DecodeError::HeaderMismatch {
            greenhouse_id,
            node_id,
            frame_greenhouse_id: greenhouse_id,
            frame_node_id,
        });
    }

    let payload = match kind {
        NodeKind::Standard => Payload::Standard(StandardReading {
            air_temp_c: read_f32(raw, 4, "air_temp_c")?,
            leaf_temp_c: read_f32(raw, 8, "leaf_temp_c")?,
            bag_temp_c: read_f32(raw, 12, "bag_temp_c")?,
            air_rh_pct: read_f32(raw, 16, "air_rh_pct")?,
            bag_rh1_pct: read_f32(raw, 20, "bag_rh1_pct")?,
            bag_rh2_pct: read_f32(raw, 24, "bag_rh2_pct")?,
            bag_rh3_pct: read_f32(raw, 28, "bag_rh3_pct")?,
            bag_rh4_pct: read_f32(raw, 32, "bag_rh4_pct")?,
            bag_rh_avg_pct: read_f32(raw, 36, "bag_rh_avg_pct")?,
            par_value: read_u16(raw, 40),
            weight_g: read_u16(raw, 42),
            ea_air_kpa: read_f32(raw, 44, "ea_air_kpa")?,
            ea_leaf_kpa: read_f32(raw, 48, "ea_leaf_kpa")?,
            es_kpa: read_f32(raw, 52, "es_kpa")?,
            vpd_kpa: read_f32(raw, 56, "vpd_kpa")?,
        }),
        NodeKind::Outdoor => Payload::Outdoor(OutdoorReading {
            air_temp_c: read_f32(raw, 4, "air_temp_c")?,
            air_rh_pct: read_f32(raw, 8, "air_rh_pct")?,
            par_value: read_u16(raw, 12),
            ea_air_kpa: read_f32(raw, 14, "ea_air_kpa")?,
            es_kpa: read_f32(raw, 18, "es_kpa")?,
        }),
    };

    Ok(Reading {
        greenhouse_id,
        node_id,
        received_at,
        payload,
    })
}

// Callers check the length first, so the offsets are always in bounds.
fn read_u16(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([raw[offset], raw[offset + 1]])
}

fn read_f32(raw: &[u8], offset: usize, field: &'static str) -> Result<f32, DecodeError> {
    let value = f32::from_le_bytes([
        raw[offset],
        raw[offset + 1],
        raw[offset + 2],
        raw[offset + 3],
    ]);
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DecodeError::FieldOutOfRange { field })
    }
}

/// Inverse of `decode`, used to build frames in tests.
#[cfg(test)]
pub(in crate::ingest) fn encode(greenhouse_id: u16, node_id: u16, payload: &Payload) -> Vec<u8> {
    let mut out = Vec::with_capacity(STANDARD_FRAME_LEN);
    out.extend_from_slice(&greenhouse_id.to_le_bytes());
    out.extend_from_slice(&node_id.to_le_bytes());
    match payload {
        Payload::Standard(r) => {
            for value in [
                r.air_temp_c,
                r.leaf_temp_c,
                r.bag_temp_c,
                r.air_rh_pct,
                r.bag_rh1_pct,
                r.bag_rh2_pct,
                r.bag_rh3_pct,
                r.bag_rh4_pct,
                r.bag_rh_avg_pct,
            ] {
                out.extend_from_slice(&value.to_le_bytes());
            }
            out.extend_from_slice(&r.par_value.to_le_bytes());
            out.extend_from_slice(&r.weight_g.to_le_bytes());
            for value in [r.ea_air_kpa, r.ea_leaf_kpa, r.es_kpa, r.vpd_kpa] {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Payload::Outdoor(r) => {
            out.extend_from_slice(&r.air_temp_c.to_le_bytes());
            out.extend_from_slice(&r.air_rh_pct.to_le_bytes());
            out.extend_from_slice(&r.par_value.to_le_bytes());
            out.extend_from_slice(&r.ea_air_kpa.to_le_bytes());
            out.extend_from_slice(&r.es_kpa.to_le_bytes());
        }
    }
    out
}
