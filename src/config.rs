use crate::ingest::{OUTDOOR_NODE_ID, STANDARD_NODE_IDS};
use crate::telemetry::TopicTemplate;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "config/greenhouse.json";
const DEFAULT_DATABASE_URL: &str = "sqlite://data/greenhouse.db";
const DEFAULT_TOPIC_TEMPLATE: &str = "greenhouse/{greenhouse}/node/{node}/data";

fn setup_config_path() -> PathBuf {
    env_string("GREENHOUSE_SETUP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
}

/// Reads the setup file at `path`. A missing file is not an error; an
/// unreadable or malformed one yields a message for the caller to log.
fn read_setup_overrides(path: &Path) -> Result<Option<SetupConfigOverrides>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path).map_err(|err| {
        format!(
            "failed to read setup config {}: {err}; using env defaults",
            path.display()
        )
    })?;
    parse_setup_overrides(contents).map(Some).map_err(|err| {
        format!(
            "failed to parse setup config {}: {err}; using env defaults",
            path.display()
        )
    })
}

fn parse_setup_overrides(contents: String) -> Result<SetupConfigOverrides, simd_json::Error> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
}

/// Applies non-empty setup file values for keys whose env var is unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_is_set: impl Fn(&str) -> bool,
) {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if !env_is_set("GREENHOUSE_DATABASE_URL") {
        if let Some(url) = non_empty(&overrides.database_url) {
            config.database_url = normalize_database_url(url);
        }
    }
    if !env_is_set("GREENHOUSE_MQTT_HOST") {
        if let Some(host) = non_empty(&overrides.mqtt_host) {
            config.mqtt_host = host;
        }
    }
    if !env_is_set("GREENHOUSE_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if !env_is_set("GREENHOUSE_MQTT_USERNAME") {
        if let Some(username) = non_empty(&overrides.mqtt_username) {
            config.mqtt_username = Some(username);
        }
    }
    if !env_is_set("GREENHOUSE_MQTT_PASSWORD") {
        if let Some(password) = non_empty(&overrides.mqtt_password) {
            config.mqtt_password = Some(password);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub topic_template: TopicTemplate,
    pub greenhouse_ids: Vec<u16>,
    pub node_ids: Vec<u16>,
    pub window_secs: u64,
    pub window_capacity: usize,
    pub frame_queue: usize,
    pub handoff_timeout_ms: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub event_capacity: usize,
    pub event_log: bool,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_stable_secs: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Loads the config along with setup-file warnings, which are returned
    /// rather than logged because tracing is not initialised yet.
    pub fn from_env() -> Result<(Self, Vec<String>)> {
        dotenv().ok();

        let mut warnings = Vec::new();
        let setup_overrides = match read_setup_overrides(&setup_config_path()) {
            Ok(overrides) => overrides,
            Err(warning) => {
                warnings.push(warning);
                None
            }
        };

        let database_url = normalize_database_url(
            env_string("GREENHOUSE_DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
        );
        let db_pool_size = env_parse("GREENHOUSE_DB_POOL_SIZE").unwrap_or(4);

        let mqtt_host =
            env_string("GREENHOUSE_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = env_parse("GREENHOUSE_MQTT_PORT").unwrap_or(1883);
        let mqtt_username = env_string("GREENHOUSE_MQTT_USERNAME");
        let mqtt_password = env_string("GREENHOUSE_MQTT_PASSWORD");
        let mqtt_client_id = env_string("GREENHOUSE_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("greenhouse-ingest-{}", std::process::id()));
        let mqtt_keepalive_secs = env_parse("GREENHOUSE_MQTT_KEEPALIVE_SECS").unwrap_or(30);

        let template = env_string("GREENHOUSE_MQTT_TOPIC_TEMPLATE")
            .unwrap_or_else(|| DEFAULT_TOPIC_TEMPLATE.to_string());
        let topic_template = TopicTemplate::parse(&template)
            .context("GREENHOUSE_MQTT_TOPIC_TEMPLATE is invalid")?;

        let greenhouse_ids = match env_string("GREENHOUSE_IDS") {
            Some(raw) => parse_id_list(&raw).context("GREENHOUSE_IDS must list u16 ids")?,
            None => vec![1],
        };
        let node_ids = match env_string("GREENHOUSE_NODE_IDS") {
            Some(raw) => parse_id_list(&raw).context("GREENHOUSE_NODE_IDS must list u16 ids")?,
            None => default_node_ids(),
        };

        let window_secs = env_parse::<u64>("GREENHOUSE_WINDOW_SECS")
            .unwrap_or(60)
            .max(1);
        let window_capacity = env_parse::<usize>("GREENHOUSE_WINDOW_CAPACITY")
            .unwrap_or(64)
            .max(1);
        let frame_queue = env_parse::<usize>("GREENHOUSE_FRAME_QUEUE")
            .unwrap_or(256)
            .max(1);
        let handoff_timeout_ms = env_parse("GREENHOUSE_HANDOFF_TIMEOUT_MS").unwrap_or(250);

        let batch_size = env_parse::<usize>("GREENHOUSE_BATCH_SIZE")
            .unwrap_or(512)
            .max(1);
        let flush_interval_ms = env_parse::<u64>("GREENHOUSE_FLUSH_INTERVAL_MS")
            .unwrap_or(1000)
            .max(1);
        let max_queue = env_parse::<usize>("GREENHOUSE_MAX_QUEUE")
            .unwrap_or(batch_size.saturating_mul(4))
            .max(1);
        let event_capacity = env_parse::<usize>("GREENHOUSE_EVENT_CAPACITY")
            .unwrap_or(128)
            .max(1);
        let event_log = env_flag("GREENHOUSE_EVENT_LOG").unwrap_or(false);

        let reconnect_base_ms = env_parse("GREENHOUSE_RECONNECT_BASE_MS").unwrap_or(250);
        let reconnect_max_ms = env_parse("GREENHOUSE_RECONNECT_MAX_MS").unwrap_or(10_000);
        let reconnect_stable_secs = env_parse("GREENHOUSE_RECONNECT_STABLE_SECS").unwrap_or(10);
        let otlp_endpoint = env_string("OTEL_EXPORTER_OTLP_ENDPOINT");

        let mut config = Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive_secs,
            topic_template,
            greenhouse_ids,
            node_ids,
            window_secs,
            window_capacity,
            frame_queue,
            handoff_timeout_ms,
            batch_size,
            flush_interval_ms,
            max_queue,
            event_capacity,
            event_log,
            reconnect_base_ms,
            reconnect_max_ms,
            reconnect_stable_secs,
            otlp_endpoint,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| env_string(key).is_some());
        }

        Ok((config, warnings))
    }

    /// One topic per configured (greenhouse, node) pair.
    pub fn subscription_topics(&self) -> Vec<String> {
        let mut topics = Vec::with_capacity(self.greenhouse_ids.len() * self.node_ids.len());
        for greenhouse_id in &self.greenhouse_ids {
            for node_id in &self.node_ids {
                topics.push(self.topic_template.topic_for(*greenhouse_id, *node_id));
            }
        }
        topics
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn reconnect_stable(&self) -> Duration {
        Duration::from_secs(self.reconnect_stable_secs)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env_string(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn default_node_ids() -> Vec<u16> {
    STANDARD_NODE_IDS.chain([OUTDOOR_NODE_ID]).collect()
}

fn parse_id_list(raw: &str) -> Result<Vec<u16>> {
    let mut ids = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id = part
            .parse::<u16>()
            .with_context(|| format!("invalid id {part:?}"))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        anyhow::bail!("id list {raw:?} is empty");
    }
    Ok(ids)
}

/// Accepts bare file paths as well as `sqlite:` urls.
fn normalize_database_url(url: String) -> String {
    if url.starts_with("sqlite:") {
        return url;
    }
    format!("sqlite://{url}")
}
