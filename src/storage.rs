use crate::error::StorageError;
use crate::ingest::{
    node_label, AverageRecord, GreenhouseAverage, NodeAverage, NodeKind, STANDARD_FIELDS,
};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

// SQLite caps bound parameters per statement; 20 columns x 256 rows stays
// well below it.
const ROWS_PER_STATEMENT: usize = 256;

/// Destination for one flushed batch. A call either commits every record or
/// none of them.
#[async_trait]
pub trait AverageStore: Send + Sync + 'static {
    async fn write_batch(&self, records: &[AverageRecord]) -> Result<(), StorageError>;
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    window_secs: i64,
}

impl SqliteStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        window_secs: u64,
    ) -> Result<Self, StorageError> {
        let pool = build_pool(database_url, max_connections).await?;
        ensure_schema(&pool).await?;
        Ok(Self {
            pool,
            window_secs: window_secs as i64,
        })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl AverageStore for SqliteStore {
    async fn write_batch(&self, records: &[AverageRecord]) -> Result<(), StorageError> {
        let mut nodes = Vec::new();
        let mut greenhouses = Vec::new();
        for record in records {
            match record {
                AverageRecord::Node(avg) => nodes.push(avg),
                AverageRecord::Greenhouse(avg) => greenhouses.push(avg),
            }
        }

        let mut tx = self.pool.begin().await?;
        upsert_nodes(&mut tx, &nodes).await?;
        for chunk in nodes.chunks(ROWS_PER_STATEMENT) {
            insert_node_averages(&mut tx, chunk, self.window_secs).await?;
        }
        for chunk in greenhouses.chunks(ROWS_PER_STATEMENT) {
            insert_greenhouse_averages(&mut tx, chunk, self.window_secs).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, StorageError> {
    if let Some(parent) = database_path(database_url).and_then(|path| path.parent().map(PathBuf::from)) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(&parent)?;
        }
    }
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// File path behind a `sqlite:` url, or `None` for in-memory databases.
fn database_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

fn field_columns(sql_type: &str) -> String {
    STANDARD_FIELDS
        .iter()
        .map(|field| format!("    {field} {sql_type}"))
        .collect::<Vec<_>>()
        .join(",\n")
}

fn schema_statements() -> Vec<String> {
    vec![
        "CREATE TABLE IF NOT EXISTS node (
    greenhouse_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    label TEXT NOT NULL,
    kind TEXT NOT NULL,
    PRIMARY KEY (greenhouse_id, node_id)
)"
        .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS node_average (
    greenhouse_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL,
    ts_ms INTEGER NOT NULL,
    sample_count INTEGER NOT NULL,
    window_sec INTEGER NOT NULL,
{},
    PRIMARY KEY (greenhouse_id, node_id, ts_ms),
    FOREIGN KEY (greenhouse_id, node_id) REFERENCES node (greenhouse_id, node_id)
)",
            field_columns("REAL")
        ),
        "CREATE INDEX IF NOT EXISTS idx_node_average_ts ON node_average (ts_ms)".to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS greenhouse_average (
    greenhouse_id INTEGER NOT NULL,
    ts_ms INTEGER NOT NULL,
    node_count INTEGER NOT NULL,
    window_sec INTEGER NOT NULL,
{},
    PRIMARY KEY (greenhouse_id, ts_ms)
)",
            field_columns("REAL NOT NULL")
        ),
        "CREATE INDEX IF NOT EXISTS idx_greenhouse_average_ts ON greenhouse_average (ts_ms)"
            .to_string(),
    ]
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for statement in schema_statements() {
        sqlx::query(&statement).execute(pool).await?;
    }
    Ok(())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

async fn upsert_nodes(
    conn: &mut SqliteConnection,
    averages: &[&NodeAverage],
) -> Result<(), StorageError> {
    let mut seen: BTreeMap<(u16, u16), NodeKind> = BTreeMap::new();
    for avg in averages {
        seen.insert((avg.greenhouse_id, avg.node_id), avg.fields.kind());
    }
    if seen.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT INTO node (greenhouse_id, node_id, label, kind) ");
    builder.push_values(seen.iter(), |mut b, ((greenhouse_id, node_id), kind)| {
        b.push_bind(*greenhouse_id as i64)
            .push_bind(*node_id as i64)
            .push_bind(node_label(*node_id))
            .push_bind(kind.as_str());
    });
    builder.push(" ON CONFLICT DO NOTHING");
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

async fn insert_node_averages(
    conn: &mut SqliteConnection,
    averages: &[&NodeAverage],
    window_secs: i64,
) -> Result<(), StorageError> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO node_average (greenhouse_id, node_id, ts_ms, sample_count, window_sec, {}) ",
        STANDARD_FIELDS.join(", ")
    ));
    builder.push_values(averages.iter(), |mut b, avg| {
        b.push_bind(avg.greenhouse_id as i64)
            .push_bind(avg.node_id as i64)
            .push_bind(avg.ts.timestamp_millis())
            .push_bind(avg.sample_count as i64)
            .push_bind(window_secs);
        for value in avg.fields.column_values() {
            b.push_bind(value.map(round2));
        }
    });
    builder.push(" ON CONFLICT DO NOTHING");

    let result = builder.build().execute(&mut *conn).await?;
    let inserted = result.rows_affected() as usize;
    if inserted < averages.len() {
        tracing::warn!(
            inserted,
            skipped = averages.len().saturating_sub(inserted),
            "skipped duplicate node average rows"
        );
    }
    Ok(())
}

async fn insert_greenhouse_averages(
    conn: &mut SqliteConnection,
    averages: &[&GreenhouseAverage],
    window_secs: i64,
) -> Result<(), StorageError> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO greenhouse_average (greenhouse_id, ts_ms, node_count, window_sec, {}) ",
        STANDARD_FIELDS.join(", ")
    ));
    builder.push_values(averages.iter(), |mut b, avg| {
        b.push_bind(avg.greenhouse_id as i64)
            .push_bind(avg.ts.timestamp_millis())
            .push_bind(avg.node_count as i64)
            .push_bind(window_secs);
        for value in avg.fields.values() {
            b.push_bind(round2(value));
        }
    });
    builder.push(" ON CONFLICT DO NOTHING");

    let result = builder.build().execute(&mut *conn).await?;
    let inserted = result.rows_affected() as usize;
    if inserted < averages.len() {
        tracing::warn!(
            inserted,
            skipped = averages.len().saturating_sub(inserted),
            "skipped duplicate greenhouse average rows"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{NodeFields, OutdoorFields, StandardFields, OUTDOOR_NODE_ID};
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_060, 0).single().unwrap()
    }

    fn sample_batch() -> Vec<AverageRecord> {
        let mut values = [10.0; 15];
        values[0] = 23.456;
        vec![
            AverageRecord::Node(NodeAverage {
                ts: ts(),
                greenhouse_id: 1,
                node_id: 3,
                sample_count: 12,
                fields: NodeFields::Standard(StandardFields::from_values(values)),
            }),
            AverageRecord::Node(NodeAverage {
                ts: ts(),
                greenhouse_id: 1,
                node_id: OUTDOOR_NODE_ID,
                sample_count: 6,
                fields: NodeFields::Outdoor(OutdoorFields::from_values([
                    18.0, 70.0, 1500.0, 1.2, 2.4,
                ])),
            }),
            AverageRecord::Greenhouse(GreenhouseAverage {
                ts: ts(),
                greenhouse_id: 1,
                node_count: 1,
                fields: StandardFields::from_values(values),
            }),
        ]
    }

    async fn open(dir: &TempDir) -> SqliteStore {
        let url = format!("sqlite://{}", dir.path().join("nested/greenhouse.db").display());
        SqliteStore::connect(&url, 1, 60).await.expect("open sqlite store")
    }

    #[test]
    fn database_path_handles_url_forms() {
        assert_eq!(
            database_path("sqlite://data/greenhouse.db"),
            Some(PathBuf::from("data/greenhouse.db"))
        );
        assert_eq!(
            database_path("sqlite:/var/lib/gh.db?mode=rwc"),
            Some(PathBuf::from("/var/lib/gh.db"))
        );
        assert_eq!(database_path("sqlite::memory:"), None);
        assert_eq!(database_path("postgres://localhost/db"), None);
    }

    #[test]
    fn rounds_to_two_decimals() {
        assert_eq!(round2(23.456), 23.46);
        assert_eq!(round2(-1.234), -1.23);
        assert_eq!(round2(7.0), 7.0);
    }

    #[tokio::test]
    async fn opens_in_wal_mode_and_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        assert!(dir.path().join("nested").is_dir());

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn writes_node_greenhouse_and_registry_rows() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.write_batch(&sample_batch()).await.unwrap();

        let node_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM node_average")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(node_rows, 2);

        let (air_temp, sample_count, window_sec): (f64, i64, i64) = sqlx::query_as(
            "SELECT air_temp_c, sample_count, window_sec FROM node_average WHERE node_id = 3",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(air_temp, 23.46);
        assert_eq!(sample_count, 12);
        assert_eq!(window_sec, 60);

        let (leaf, par): (Option<f64>, Option<f64>) = sqlx::query_as(
            "SELECT leaf_temp_c, par_value FROM node_average WHERE node_id = ?",
        )
        .bind(OUTDOOR_NODE_ID as i64)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(leaf, None);
        assert_eq!(par, Some(1500.0));

        let (node_count, ts_ms): (i64, i64) =
            sqlx::query_as("SELECT node_count, ts_ms FROM greenhouse_average")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(node_count, 1);
        assert_eq!(ts_ms, ts().timestamp_millis());

        let labels: Vec<(String, String)> =
            sqlx::query_as("SELECT label, kind FROM node ORDER BY node_id")
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert_eq!(
            labels,
            vec![
                ("node03".to_string(), "standard".to_string()),
                ("Outdoor_Node".to_string(), "outdoor".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn rewriting_a_batch_does_not_duplicate_rows() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let batch = sample_batch();
        store.write_batch(&batch).await.unwrap();
        store.write_batch(&batch).await.unwrap();

        let node_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM node_average")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let gh_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM greenhouse_average")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!((node_rows, gh_rows), (2, 1));
    }
}
