use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::TransportError;
use crate::pipeline::IngestStats;
use crate::telemetry::RawFrame;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, SubscribeReasonCode};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

enum SessionEnd {
    Dropped {
        subscribed_at: Option<Instant>,
        error: TransportError,
    },
    PipelineClosed,
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

/// A session that stayed subscribed for `stable_after` earns a fresh backoff.
fn held_long_enough(subscribed_at: Option<Instant>, stable_after: Duration) -> bool {
    subscribed_at.is_some_and(|at| at.elapsed() >= stable_after)
}

/// Keeps one MQTT session alive, reconnecting with backoff, and hands every
/// matching publish to the aggregation task. Returns when `shutdown` fires or
/// the aggregation task goes away.
pub async fn run_listener(
    config: Config,
    frames: mpsc::Sender<RawFrame>,
    stats: Arc<IngestStats>,
    shutdown: CancellationToken,
) {
    let topics = config.subscription_topics();
    let mut backoff = Backoff::new(config.reconnect_base(), config.reconnect_max());
    let mut state = ConnectionState::Disconnected;
    tracing::info!(topics = topics.len(), ?state, "MQTT listener starting");

    loop {
        state = ConnectionState::Connecting;
        tracing::debug!(host = %config.mqtt_host, port = config.mqtt_port, ?state, "connecting to MQTT broker");

        let end = tokio::select! {
            end = run_session(&config, &topics, &frames, &stats, &mut state) => end,
            _ = shutdown.cancelled() => break,
        };
        stats.set_mqtt_connected(false);
        state = ConnectionState::Disconnected;

        let (subscribed_at, error) = match end {
            SessionEnd::Dropped {
                subscribed_at,
                error,
            } => (subscribed_at, error),
            SessionEnd::PipelineClosed => {
                tracing::info!("frame channel closed; MQTT listener stopping");
                break;
            }
        };
        if held_long_enough(subscribed_at, config.reconnect_stable()) {
            backoff.reset();
        }

        let delay = backoff.next_delay();
        tracing::warn!(
            error = %error,
            attempt = backoff.failures(),
            delay_ms = delay.as_millis() as u64,
            ?state,
            "MQTT connection dropped; reconnecting"
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    stats.set_mqtt_connected(false);
    tracing::info!("MQTT listener stopped");
}

async fn run_session(
    config: &Config,
    topics: &[String],
    frames: &mpsc::Sender<RawFrame>,
    stats: &IngestStats,
    state: &mut ConnectionState,
) -> SessionEnd {
    // A fresh client per session re-issues every subscription on reconnect.
    // Requests queue until the event loop is polled, so size for all of them.
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), topics.len() + 32);
    for topic in topics {
        if let Err(err) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
            return SessionEnd::Dropped {
                subscribed_at: None,
                error: err.into(),
            };
        }
    }

    let mut pending_acks = topics.len();
    let mut subscribed_at = None;
    loop {
        let event = match eventloop.poll().await {
            Ok(event) => event,
            Err(err) => {
                return SessionEnd::Dropped {
                    subscribed_at,
                    error: err.into(),
                }
            }
        };

        match event {
            Event::Incoming(Incoming::ConnAck(_)) => {
                tracing::debug!("MQTT connection acknowledged");
            }
            Event::Incoming(Incoming::SubAck(suback)) => {
                // Acks arrive in request order.
                let refused = suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if refused {
                    let topic = topics
                        .get(topics.len() - pending_acks)
                        .cloned()
                        .unwrap_or_default();
                    return SessionEnd::Dropped {
                        subscribed_at,
                        error: TransportError::SubscriptionRefused { topic },
                    };
                }
                pending_acks = pending_acks.saturating_sub(1);
                if pending_acks == 0 && *state != ConnectionState::Subscribed {
                    *state = ConnectionState::Subscribed;
                    subscribed_at = Some(Instant::now());
                    stats.set_mqtt_connected(true);
                    tracing::info!(
                        topics = topics.len(),
                        first_topic = topics.first().map(String::as_str).unwrap_or_default(),
                        "subscribed to greenhouse telemetry"
                    );
                }
            }
            Event::Incoming(Incoming::Publish(publish)) => {
                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                let Some(frame) =
                    config
                        .topic_template
                        .parse_frame(publish.topic, publish.payload, Utc::now())
                else {
                    tracing::debug!("ignoring publish on unexpected topic");
                    continue;
                };
                // The event loop is not polled while this waits, so the
                // timeout must stay well under the keep-alive.
                match frames.send_timeout(frame, config.handoff_timeout()).await {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(frame)) => {
                        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            topic = %frame.topic,
                            timeout_ms = config.handoff_timeout_ms,
                            "aggregation queue full; dropping frame"
                        );
                    }
                    Err(SendTimeoutError::Closed(_)) => return SessionEnd::PipelineClosed,
                }
            }
            _ => {}
        }
    }
}
