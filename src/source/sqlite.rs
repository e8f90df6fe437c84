//! SQLite-backed partition source
//!
//! Each subscription polls its day in the `flow_samples` table and reports
//! the full day whenever the result set differs from the previous poll.
//! Node watches poll one row of `store_nodes` the same way.

use super::{NodeEvent, NodeFeed, PartitionSource, SourceEvent, Subscription};
use crate::error::SourceError;
use crate::partition::PartitionKey;
use crate::pipeline::types::Sample;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS flow_samples (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id  TEXT    NOT NULL,
    year        INTEGER NOT NULL,
    month       INTEGER NOT NULL,
    day         INTEGER NOT NULL,
    ts          INTEGER NOT NULL,
    volume_ml   REAL    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_flow_samples_day
    ON flow_samples (patient_id, year, month, day);

CREATE TABLE IF NOT EXISTS store_nodes (
    path        TEXT PRIMARY KEY,
    body        TEXT NOT NULL
);
"#;

/// Create the `flow_samples` table if missing. Idempotent.
pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode reports the resulting mode as a row
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::debug!("SQLite journal mode: {}", mode);
    conn.execute_batch(SCHEMA)
}

/// Append one sample to `key`'s day. `ts` is stored as epoch milliseconds.
pub fn insert_sample(
    conn: &Connection,
    patient_id: &str,
    key: PartitionKey,
    sample: &Sample,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO flow_samples (patient_id, year, month, day, ts, volume_ml)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            patient_id,
            key.year,
            key.month,
            key.day,
            sample.epoch_millis(),
            sample.value
        ],
    )?;
    Ok(())
}

/// Write (or overwrite) the JSON node at `path`
pub fn put_node(conn: &Connection, path: &str, node: &Value) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO store_nodes (path, body) VALUES (?1, ?2)
         ON CONFLICT(path) DO UPDATE SET body = excluded.body",
        params![path, node.to_string()],
    )?;
    Ok(())
}

pub fn delete_node(conn: &Connection, path: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM store_nodes WHERE path = ?1", params![path])?;
    Ok(())
}

fn query_node(conn: &Connection, path: &str) -> Result<Option<Value>, SourceError> {
    let body: Option<String> = conn
        .query_row("SELECT body FROM store_nodes WHERE path = ?1", params![path], |row| row.get(0))
        .optional()?;

    body.map(|body| {
        serde_json::from_str(&body)
            .map_err(|e| SourceError::Database(format!("node {} is not valid JSON: {}", path, e)))
    })
    .transpose()
}

fn query_day(conn: &Connection, patient_id: &str, key: PartitionKey) -> rusqlite::Result<Vec<Sample>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, volume_ml FROM flow_samples
         WHERE patient_id = ?1 AND year = ?2 AND month = ?3 AND day = ?4
         ORDER BY id ASC",
    )?;

    let rows = stmt.query_map(params![patient_id, key.year, key.month, key.day], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?))
    })?;

    let mut samples = Vec::new();
    for row in rows {
        let (ts, value) = row?;
        match Utc.timestamp_millis_opt(ts).single() {
            Some(timestamp) => samples.push(Sample::new(timestamp, value.unwrap_or(0.0))),
            None => log::debug!("Skipping row in {} with out-of-range ts {}", key, ts),
        }
    }
    Ok(samples)
}

/// Day-partitioned sample store in a SQLite database
#[derive(Clone)]
pub struct SqliteSource {
    conn: Arc<Mutex<Connection>>,
    patient_id: String,
    poll_interval: Duration,
}

impl SqliteSource {
    pub fn open(
        db_path: impl AsRef<Path>,
        patient_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self, SourceError> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, patient_id, poll_interval)
    }

    /// Wrap an existing connection, creating the schema when needed
    pub fn from_connection(
        conn: Connection,
        patient_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self, SourceError> {
        ensure_schema(&conn)?;
        let source = Self {
            conn: Arc::new(Mutex::new(conn)),
            patient_id: patient_id.into(),
            poll_interval,
        };
        log::info!(
            "📂 SQLite source ready: patient={}, poll={}ms",
            source.patient_id,
            source.poll_interval.as_millis()
        );
        Ok(source)
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// Current content of one day
    pub async fn load_day(&self, key: PartitionKey) -> Result<Vec<Sample>, SourceError> {
        load_blocking(self.conn.clone(), self.patient_id.clone(), key).await
    }
}

impl std::fmt::Debug for SqliteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSource")
            .field("patient_id", &self.patient_id)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

async fn load_blocking(
    conn: Arc<Mutex<Connection>>,
    patient_id: String,
    key: PartitionKey,
) -> Result<Vec<Sample>, SourceError> {
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        query_day(&conn, &patient_id, key)
    })
    .await
    .map_err(|e| SourceError::Unavailable(format!("query task failed: {}", e)))?
    .map_err(SourceError::from)
}

async fn load_node_blocking(conn: Arc<Mutex<Connection>>, path: String) -> Result<Option<Value>, SourceError> {
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        query_node(&conn, &path)
    })
    .await
    .map_err(|e| SourceError::Unavailable(format!("query task failed: {}", e)))?
}

/// Re-run `load` every `poll_interval` and report results that differ from
/// the last one reported. A failed poll is reported as an error and forces
/// the next successful poll to be reported.
fn spawn_poller<T, E, F, Fut, R>(
    label: String,
    poll_interval: Duration,
    initial: T,
    load: F,
    report: R,
    tx: mpsc::UnboundedSender<E>,
    mut stop_rx: oneshot::Receiver<()>,
) where
    T: PartialEq + Clone + Send + 'static,
    E: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, SourceError>> + Send,
    R: Fn(Result<T, SourceError>) -> E + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        let mut last = Some(initial);

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {}
            }

            let event = match load().await {
                Ok(current) => {
                    if last.as_ref() == Some(&current) {
                        continue;
                    }
                    last = Some(current.clone());
                    report(Ok(current))
                }
                Err(e) => {
                    log::warn!("⚠️  Poll failed for {}: {}", label, e);
                    // Force a full report once the store recovers
                    last = None;
                    report(Err(e))
                }
            };

            if tx.send(event).is_err() {
                break;
            }
        }

        log::debug!("SQLite poller for {} stopped", label);
    });
}

#[async_trait]
impl PartitionSource for SqliteSource {
    async fn subscribe(&self, key: PartitionKey) -> Result<Subscription, SourceError> {
        let initial = self.load_day(key).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        // Receiver is alive, so the initial report cannot fail
        let _ = tx.send(SourceEvent::Replace(initial.clone()));

        let conn = self.conn.clone();
        let patient_id = self.patient_id.clone();
        spawn_poller(
            key.to_string(),
            self.poll_interval,
            initial,
            move || load_blocking(conn.clone(), patient_id.clone(), key),
            |polled| match polled {
                Ok(samples) => SourceEvent::Replace(samples),
                Err(e) => SourceEvent::Error(e),
            },
            tx,
            stop_rx,
        );

        Ok(Subscription::new(rx, move || {
            let _ = stop_tx.send(());
        }))
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[async_trait]
impl NodeFeed for SqliteSource {
    async fn watch(&self, path: &str) -> Result<Subscription<NodeEvent>, SourceError> {
        let initial = load_node_blocking(self.conn.clone(), path.to_string()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let _ = tx.send(NodeEvent::Snapshot(initial.clone()));

        let conn = self.conn.clone();
        let node_path = path.to_string();
        spawn_poller(
            path.to_string(),
            self.poll_interval,
            initial,
            move || load_node_blocking(conn.clone(), node_path.clone()),
            |polled| match polled {
                Ok(node) => NodeEvent::Snapshot(node),
                Err(e) => NodeEvent::Error(e),
            },
            tx,
            stop_rx,
        );

        Ok(Subscription::new(rx, move || {
            let _ = stop_tx.send(());
        }))
    }

    fn feed_name(&self) -> &'static str {
        "sqlite"
    }
}
