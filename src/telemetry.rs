use anyhow::{bail, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Undecoded payload handed from the listener to the aggregation task. The
/// ids come from the topic the frame arrived on.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub topic: String,
    pub greenhouse_id: u16,
    pub node_id: u16,
    pub received_at: DateTime<Utc>,
    pub payload: Bytes,
}

const GREENHOUSE_PLACEHOLDER: &str = "{greenhouse}";
const NODE_PLACEHOLDER: &str = "{node}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Greenhouse,
    Node,
}

/// Topic layout such as `greenhouse/{greenhouse}/node/{node}/data`. Each
/// placeholder fills one whole topic level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    segments: Vec<Segment>,
}

impl TopicTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let template = template.trim();
        let mut segments = Vec::new();
        let (mut greenhouse, mut node) = (0, 0);
        for level in template.split('/') {
            let segment = match level {
                GREENHOUSE_PLACEHOLDER => {
                    greenhouse += 1;
                    Segment::Greenhouse
                }
                NODE_PLACEHOLDER => {
                    node += 1;
                    Segment::Node
                }
                other if other.contains('+') || other.contains('#') => {
                    bail!("topic template {template:?} must not contain MQTT wildcards");
                }
                other if other.contains('{') || other.contains('}') => {
                    bail!("topic template {template:?} has an unknown placeholder in {other:?}");
                }
                other => Segment::Literal(other.to_string()),
            };
            segments.push(segment);
        }
        if greenhouse != 1 || node != 1 {
            bail!(
                "topic template {template:?} needs exactly one {GREENHOUSE_PLACEHOLDER} and one {NODE_PLACEHOLDER} level"
            );
        }
        Ok(Self { segments })
    }

    pub fn topic_for(&self, greenhouse_id: u16, node_id: u16) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.clone(),
                Segment::Greenhouse => greenhouse_id.to_string(),
                Segment::Node => node_id.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Returns `(greenhouse_id, node_id)` when `topic` fits the template.
    pub fn match_topic(&self, topic: &str) -> Option<(u16, u16)> {
        let mut levels = topic.split('/');
        let mut greenhouse_id = None;
        let mut node_id = None;
        for segment in &self.segments {
            let level = levels.next()?;
            match segment {
                Segment::Literal(text) => {
                    if level != text {
                        return None;
                    }
                }
                Segment::Greenhouse => greenhouse_id = Some(parse_id(level)?),
                Segment::Node => node_id = Some(parse_id(level)?),
            }
        }
        if levels.next().is_some() {
            return None;
        }
        Some((greenhouse_id?, node_id?))
    }

    pub fn parse_frame(
        &self,
        topic: String,
        payload: Bytes,
        received_at: DateTime<Utc>,
    ) -> Option<RawFrame> {
        let (greenhouse_id, node_id) = self.match_topic(&topic)?;
        Some(RawFrame {
            topic,
            greenhouse_id,
            node_id,
            received_at,
            payload,
        })
    }
}

fn parse_id(level: &str) -> Option<u16> {
    if level.is_empty() || !level.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    level.parse().ok()
}
