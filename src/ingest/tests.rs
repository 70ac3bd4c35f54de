use super::decode::encode;
use super::state::NodeAggregator;
use super::types::{NodeFields, OutdoorReading, Payload, Reading, StandardReading, OUTDOOR_NODE_ID};
use super::{run_aggregator, Aggregator, AverageRecord};
use crate::events::EventBus;
use crate::pipeline::{BatchCommand, IngestStats, PipelineHandle};
use crate::telemetry::RawFrame;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

fn standard(air_temp_c: f32) -> Payload {
    Payload::Standard(StandardReading {
        air_temp_c,
        leaf_temp_c: 22.0,
        bag_temp_c: 21.0,
        air_rh_pct: 60.0,
        bag_rh1_pct: 40.0,
        bag_rh2_pct: 40.0,
        bag_rh3_pct: 40.0,
        bag_rh4_pct: 40.0,
        bag_rh_avg_pct: 40.0,
        par_value: 500,
        weight_g: 2000,
        ea_air_kpa: 1.5,
        ea_leaf_kpa: 1.4,
        es_kpa: 2.8,
        vpd_kpa: 1.3,
    })
}

fn outdoor(air_temp_c: f32) -> Payload {
    Payload::Outdoor(OutdoorReading {
        air_temp_c,
        air_rh_pct: 80.0,
        par_value: 1200,
        ea_air_kpa: 1.1,
        es_kpa: 1.9,
    })
}

fn frame(greenhouse_id: u16, node_id: u16, payload: Payload, received_at: DateTime<Utc>) -> RawFrame {
    RawFrame {
        topic: format!("greenhouse/{greenhouse_id}/node/{node_id}/data"),
        greenhouse_id,
        node_id,
        received_at,
        payload: Bytes::from(encode(greenhouse_id, node_id, &payload)),
    }
}

fn aggregator() -> (Aggregator, Arc<IngestStats>) {
    let stats = Arc::new(IngestStats::new());
    (
        Aggregator::new(Duration::from_secs(60), 64, stats.clone()),
        stats,
    )
}

#[test]
fn one_tick_emits_nodes_then_greenhouse_average() {
    let (mut aggregator, _stats) = aggregator();
    let start = Utc::now();

    // Nodes 1 and 2 report 23.5C once per second; node 3 never reports.
    for i in 0..10 {
        let at = start + ChronoDuration::seconds(i);
        aggregator.ingest(frame(1, 1, standard(23.5), at)).unwrap();
        aggregator.ingest(frame(1, 2, standard(23.5), at)).unwrap();
    }
    aggregator
        .ingest(frame(1, OUTDOOR_NODE_ID, outdoor(12.0), start))
        .unwrap();

    let tick_at = start + ChronoDuration::seconds(30);
    let records = aggregator.tick(tick_at);
    assert_eq!(records.len(), 4);

    let names: Vec<&str> = records.iter().map(AverageRecord::event_name).collect();
    assert_eq!(names, vec!["node_avg", "node_avg", "node_avg", "gh_avg"]);

    let node_ids: Vec<Option<u16>> = records.iter().map(AverageRecord::node_id).collect();
    assert_eq!(node_ids, vec![Some(1), Some(2), Some(OUTDOOR_NODE_ID), None]);

    let AverageRecord::Node(first) = &records[0] else {
        panic!("expected node average first");
    };
    assert_eq!(first.sample_count, 10);
    assert_eq!(first.ts, tick_at);

    let AverageRecord::Greenhouse(gh) = &records[3] else {
        panic!("expected greenhouse average last");
    };
    assert_eq!(gh.node_count, 2);
    assert_eq!(gh.fields.air_temp_c, 23.5);
    assert_eq!(gh.ts, tick_at);
}

#[test]
fn single_frame_flows_to_node_and_greenhouse_events() {
    let (mut aggregator, _stats) = aggregator();
    let now = Utc::now();
    aggregator.ingest(frame(1, 1, standard(23.5), now)).unwrap();

    let records = aggregator.tick(now + ChronoDuration::seconds(60));
    let node = serde_json::to_value(&records[0]).unwrap();
    assert_eq!(node["greenhouse_id"], 1);
    assert_eq!(node["node_id"], 1);
    assert_eq!(node["air_temp_c"], 23.5);
    assert_eq!(node["sample_count"], 1);

    let gh = serde_json::to_value(&records[1]).unwrap();
    assert_eq!(records[1].event_name(), "gh_avg");
    assert_eq!(gh["greenhouse_id"], 1);
    assert_eq!(gh["air_temp_c"], 23.5);
    assert_eq!(gh["node_count"], 1);
    assert_eq!(gh["ts"], node["ts"]);
}

#[test]
fn no_data_means_no_records() {
    let (mut aggregator, _stats) = aggregator();
    assert!(aggregator.tick(Utc::now()).is_empty());

    let start = Utc::now();
    aggregator.ingest(frame(1, 4, standard(20.0), start)).unwrap();
    assert_eq!(aggregator.tick(start + ChronoDuration::seconds(1)).len(), 2);
    assert!(aggregator
        .tick(start + ChronoDuration::seconds(120))
        .is_empty());
}

#[test]
fn outdoor_only_greenhouse_has_no_greenhouse_average() {
    let (mut aggregator, _stats) = aggregator();
    let start = Utc::now();
    aggregator
        .ingest(frame(2, OUTDOOR_NODE_ID, outdoor(5.0), start))
        .unwrap();

    let records = aggregator.tick(start + ChronoDuration::seconds(1));
    assert_eq!(records.len(), 1);
    let AverageRecord::Node(avg) = &records[0] else {
        panic!("expected node average");
    };
    let NodeFields::Outdoor(fields) = avg.fields else {
        panic!("expected outdoor fields");
    };
    assert_eq!(fields.air_temp_c, 5.0);
}

#[test]
fn undecodable_frames_are_counted_and_skipped() {
    let (mut aggregator, stats) = aggregator();
    let now = Utc::now();

    let mut short = frame(1, 1, standard(20.0), now);
    short.payload = short.payload.slice(..22);
    aggregator.ingest(short).unwrap();

    let mut unknown = frame(1, 1, standard(20.0), now);
    unknown.node_id = 99;
    aggregator.ingest(unknown).unwrap();

    let mut mismatched = frame(1, 1, standard(20.0), now);
    mismatched.greenhouse_id = 2;
    aggregator.ingest(mismatched).unwrap();

    assert_eq!(stats.decode_failures.load(Ordering::Relaxed), 3);
    assert!(aggregator.tick(now).is_empty());
}

#[test]
fn layout_mismatch_in_window_is_fatal() {
    let mut nodes = NodeAggregator::new(Duration::from_secs(60), 64);
    let now = Utc::now();
    let wrong = Reading {
        greenhouse_id: 1,
        node_id: 3,
        received_at: now,
        payload: outdoor(10.0),
    };
    let err = nodes.record(now, wrong).unwrap_err();
    assert_eq!(err.node_id, 3);
    assert_eq!(err.expected, "standard");
}

#[tokio::test(start_paused = true)]
async fn aggregation_task_ticks_and_drains_on_close() {
    let (aggregator, stats) = aggregator();
    let (frame_tx, frame_rx) = mpsc::channel(16);
    let (batch_tx, mut batch_rx) = mpsc::channel::<BatchCommand>(16);
    let pipeline = PipelineHandle::new(batch_tx, stats.clone());
    let events = EventBus::new(16);
    let mut live = events.subscribe();

    let task = tokio::spawn(run_aggregator(aggregator, frame_rx, pipeline, events.clone()));
    tokio::task::yield_now().await;

    frame_tx
        .send(frame(1, 1, standard(23.5), Utc::now()))
        .await
        .unwrap();
    frame_tx
        .send(frame(1, 2, standard(24.5), Utc::now()))
        .await
        .unwrap();

    // Nothing is emitted before the first full period.
    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(batch_rx.try_recv().is_err());

    tokio::time::advance(Duration::from_secs(1)).await;
    let mut stored = Vec::new();
    for _ in 0..3 {
        match batch_rx.recv().await {
            Some(BatchCommand::Record(record)) => stored.push(record),
            other => panic!("unexpected batch command {other:?}"),
        }
    }
    let names: Vec<&str> = stored.iter().map(AverageRecord::event_name).collect();
    assert_eq!(names, vec!["node_avg", "node_avg", "gh_avg"]);
    let AverageRecord::Greenhouse(gh) = &stored[2] else {
        panic!("expected greenhouse average");
    };
    assert_eq!(gh.fields.air_temp_c, 24.0);

    let mut published = Vec::new();
    for _ in 0..3 {
        published.push(live.next().await.unwrap().unwrap());
    }
    assert_eq!(published, stored);

    // Closing the frame channel asks the storage worker for a final flush.
    drop(frame_tx);
    match batch_rx.recv().await {
        Some(BatchCommand::Flush(done)) => {
            let _ = done.send(());
        }
        other => panic!("expected flush request, got {other:?}"),
    }
    assert!(task.await.unwrap().is_ok());
}
