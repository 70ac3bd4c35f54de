mod backoff;
mod config;
mod error;
mod events;
mod ingest;
mod mqtt;
mod pipeline;
mod storage;
mod telemetry;

use crate::config::Config;
use crate::events::EventBus;
use crate::ingest::{run_aggregator, Aggregator};
use crate::pipeline::{spawn_worker, BatchCommand, IngestStats, PipelineHandle};
use crate::storage::SqliteStore;
use crate::telemetry::RawFrame;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,greenhouse_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "greenhouse-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, config_warnings) = Config::from_env()?;
    init_tracing(&config)?;
    for warning in &config_warnings {
        tracing::warn!("{warning}");
    }
    tracing::info!(
        database = %config.database_url,
        broker = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        greenhouses = ?config.greenhouse_ids,
        window_secs = config.window_secs,
        "starting greenhouse ingest"
    );

    let store = SqliteStore::connect(&config.database_url, config.db_pool_size, config.window_secs)
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    let stats = Arc::new(IngestStats::new());
    let (batch_tx, batch_rx) = mpsc::channel::<BatchCommand>(config.max_queue);
    let pipeline = PipelineHandle::new(batch_tx, stats.clone());
    let worker_handle = spawn_worker(
        store,
        batch_rx,
        stats.clone(),
        config.batch_size,
        config.flush_interval(),
    );

    let events = EventBus::new(config.event_capacity);
    if config.event_log {
        tokio::spawn(events::run_event_log(events.subscribe()));
    }

    // The aggregation task owns the only pipeline handle, so the storage
    // worker drains and exits right after it.
    let (frame_tx, frame_rx) = mpsc::channel::<RawFrame>(config.frame_queue);
    let aggregator = Aggregator::new(config.window(), config.window_capacity, stats.clone());
    let mut aggregator_handle =
        tokio::spawn(run_aggregator(aggregator, frame_rx, pipeline, events));

    let shutdown = CancellationToken::new();
    let mut mqtt_handle = tokio::spawn(mqtt::run_listener(
        config.clone(),
        frame_tx,
        stats.clone(),
        shutdown.clone(),
    ));

    let mut aggregator_done = false;
    let mut mqtt_done = false;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                tracing::error!(error=%err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
        }
        res = &mut aggregator_handle => {
            aggregator_done = true;
            match res {
                Ok(Ok(())) => tracing::warn!("aggregation task exited"),
                Ok(Err(err)) => tracing::error!(error=%err, "aggregation invariant violated; shutting down"),
                Err(err) => tracing::error!(error=%err, "aggregation task panicked"),
            }
        }
        res = &mut mqtt_handle => {
            mqtt_done = true;
            if let Err(err) = res {
                tracing::error!(error=%err, "MQTT listener panicked");
            }
        }
    }

    shutdown.cancel();
    if !mqtt_done {
        if let Err(err) = mqtt_handle.await {
            tracing::error!(error=%err, "MQTT listener panicked");
        }
    }
    if !aggregator_done {
        match aggregator_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error=%err, "aggregation invariant violated"),
            Err(err) => tracing::error!(error=%err, "aggregation task panicked"),
        }
    }
    if let Err(err) = worker_handle.await {
        tracing::error!(error=%err, "storage worker panicked");
    }

    stats.log_summary();
    Ok(())
}
