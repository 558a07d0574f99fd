use crate::metrics::{Sample, SampleMeta, SamplePoint};
use anyhow::anyhow;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Fixed-width so that text order in SQL matches time order
fn db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A stored measurement as served by `/history`
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub server: Option<String>,
}

/// SQLite-backed store behind the companion telemetry server
pub struct TelemetryStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl TelemetryStore {
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;
        let store = Self {
            db_path,
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.db_path
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("storage connection lock poisoned"))
    }

    fn initialize_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Raw measurements, one row per received value
            CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                value REAL NOT NULL,
                server TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON readings(timestamp);

            -- Named snapshots of a client's live series
            CREATE TABLE IF NOT EXISTS samples (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                data_points INTEGER NOT NULL,
                data JSON NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_samples_timestamp ON samples(timestamp);
            "#,
        )?;

        Ok(())
    }

    pub fn insert_reading(&self, value: f64, server: Option<&str>) -> anyhow::Result<Reading> {
        self.insert_reading_at(Utc::now(), value, server)
    }

    pub fn insert_reading_at(
        &self,
        timestamp: DateTime<Utc>,
        value: f64,
        server: Option<&str>,
    ) -> anyhow::Result<Reading> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO readings (timestamp, value, server) VALUES (?1, ?2, ?3)",
            params![db_time(timestamp), value, server],
        )?;
        debug!(value, "Stored reading");
        Ok(Reading {
            timestamp,
            value,
            server: server.map(str::to_string),
        })
    }

    /// Most recent values, newest first
    pub fn latest_values(&self, limit: u32) -> anyhow::Result<Vec<f64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM readings ORDER BY timestamp DESC, id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], |row| row.get::<_, f64>(0))?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    /// Readings at or after `since`, oldest first
    pub fn readings_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Reading>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, value, server FROM readings WHERE timestamp >= ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![db_time(since)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut readings = Vec::new();
        for row in rows {
            let (timestamp, value, server) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc);
            readings.push(Reading {
                timestamp,
                value,
                server,
            });
        }
        Ok(readings)
    }

    pub fn save_sample(
        &self,
        name: &str,
        data: &[SamplePoint],
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<SampleMeta> {
        let id = Uuid::new_v4().to_string();
        let json = serde_json::to_string(data)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO samples (id, name, timestamp, data_points, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, db_time(timestamp), data.len() as i64, json],
        )?;
        debug!(%id, name, "Saved sample");

        Ok(SampleMeta {
            id,
            name: name.to_string(),
            timestamp,
            data_points: data.len(),
        })
    }

    /// Newest first
    pub fn list_samples(&self) -> anyhow::Result<Vec<SampleMeta>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, timestamp, data_points FROM samples ORDER BY timestamp DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut samples = Vec::new();
        for row in rows {
            let (id, name, timestamp, data_points) = row?;
            samples.push(SampleMeta {
                id,
                name,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
                data_points: data_points.max(0) as usize,
            });
        }
        Ok(samples)
    }

    pub fn get_sample(&self, id: &str) -> anyhow::Result<Option<Sample>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, timestamp, data FROM samples WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, timestamp, data)) = row else {
            return Ok(None);
        };
        Ok(Some(Sample {
            id,
            name,
            data: serde_json::from_str(&data)?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
        }))
    }

    /// `false` when no sample had that id
    pub fn delete_sample(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM samples WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}
