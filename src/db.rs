use crate::models::{AggregatePoint, Device, SensorReading};
use log::{error, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("timestamp out of range: {0}")]
    Time(#[from] time::error::ComponentRange),
    #[error("timestamp formatting failed: {0}")]
    Format(#[from] time::error::Format),
}

/// Invalid historical-query parameters, rejected at the API boundary before
/// any store access. Distinct from the empty result an unknown device or an
/// empty window produces.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("durationMinutes must be a positive integer")]
    InvalidDuration,
    #[error("aggregateSeconds must be a positive integer")]
    InvalidBucket,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct HistoryParams {
    #[serde(rename = "durationMinutes")]
    pub duration_minutes: i64,
    #[serde(rename = "aggregateSeconds")]
    pub aggregate_seconds: i64,
}

impl HistoryParams {
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.duration_minutes <= 0 {
            return Err(QueryError::InvalidDuration);
        }
        if self.aggregate_seconds <= 0 {
            return Err(QueryError::InvalidBucket);
        }
        Ok(())
    }
}

pub struct DatabaseService {
    conn: Mutex<Connection>,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` and ensures the database connection is valid.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let service = Self {
            conn: Mutex::new(conn),
        };
        service.initialize_db()?;
        Ok(service)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            ts INTEGER NOT NULL,
            temperature REAL NOT NULL,
            turbidity REAL NOT NULL,
            water_quality TEXT NOT NULL,
            ph REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_readings_device_ts
            ON readings (device_id, ts);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    // ---- device registry rows ----

    pub fn create_device(&self, device_id: &str, name: &str) -> Result<Device, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices (device_id, name) VALUES (?1, ?2)",
            params![device_id, name],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Device {
            id,
            device_id: device_id.to_string(),
            name: name.to_string(),
        })
    }

    pub fn get_device(&self, id: i64) -> Result<Option<Device>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let device = conn
            .query_row(
                "SELECT id, device_id, name FROM devices WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Device {
                        id: row.get(0)?,
                        device_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(device)
    }

    pub fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, device_id, name FROM devices ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Device {
                id: row.get(0)?,
                device_id: row.get(1)?,
                name: row.get(2)?,
            })
        })?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    pub fn device_exists(&self, device_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM devices WHERE device_id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn update_device(&self, id: i64, device_id: &str, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET device_id = ?1, name = ?2 WHERE id = ?3",
            params![device_id, name, id],
        )?;
        Ok(())
    }

    pub fn delete_device(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Registry snapshot used for bulk resubscription after a fresh connect.
    pub fn device_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT device_id FROM devices")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ---- time-series readings ----

    pub fn insert_reading(&self, reading: &SensorReading) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO readings (device_id, ts, temperature, turbidity, water_quality, ph)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                reading.device_id,
                reading.timestamp,
                reading.temperature,
                reading.turbidity,
                reading.water_quality,
                reading.ph
            ],
        )?;
        Ok(())
    }

    /// Downsampled history over `[now - duration, now]`, bucketed to
    /// `aggregate_seconds`. Parameters are assumed validated (`HistoryParams`).
    pub fn sensor_history(
        &self,
        device_id: &str,
        duration_minutes: i64,
        aggregate_seconds: i64,
    ) -> Result<Vec<AggregatePoint>, StoreError> {
        let end = OffsetDateTime::now_utc().unix_timestamp();
        let start = end - duration_minutes * 60;
        self.history_between(device_id, start, end, aggregate_seconds)
    }

    /// Bucket boundaries are aligned to `start`. Numeric fields carry the
    /// arithmetic mean of the raw points in the bucket and are always present,
    /// since ingestion coerces missing numerics to zero before storage.
    /// `water_quality` is the last non-empty value seen in the bucket and is
    /// omitted when no point reported one. Buckets without points are omitted.
    pub(crate) fn history_between(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
        bucket_seconds: i64,
    ) -> Result<Vec<AggregatePoint>, StoreError> {
        let rows = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                r#"
                SELECT ts, temperature, turbidity, water_quality, ph
                FROM readings
                WHERE device_id = ?1 AND ts >= ?2 AND ts <= ?3
                ORDER BY ts ASC
                "#,
            )?;
            let mapped = stmt.query_map(params![device_id, start, end], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            })?;

            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };

        let mut points = Vec::new();
        let mut current: Option<BucketAccumulator> = None;

        for (ts, temperature, turbidity, water_quality, ph) in rows {
            let index = (ts - start) / bucket_seconds;
            match current.as_mut() {
                Some(acc) if acc.index == index => {
                    acc.add(temperature, turbidity, water_quality, ph)
                }
                _ => {
                    if let Some(done) = current.take() {
                        points.push(done.finish(start, bucket_seconds)?);
                    }
                    let mut acc = BucketAccumulator::new(index);
                    acc.add(temperature, turbidity, water_quality, ph);
                    current = Some(acc);
                }
            }
        }
        if let Some(done) = current.take() {
            points.push(done.finish(start, bucket_seconds)?);
        }

        Ok(points)
    }
}

struct BucketAccumulator {
    index: i64,
    count: u32,
    temperature_sum: f64,
    turbidity_sum: f64,
    ph_sum: f64,
    water_quality: String,
}

impl BucketAccumulator {
    fn new(index: i64) -> Self {
        Self {
            index,
            count: 0,
            temperature_sum: 0.0,
            turbidity_sum: 0.0,
            ph_sum: 0.0,
            water_quality: String::new(),
        }
    }

    fn add(&mut self, temperature: f64, turbidity: f64, water_quality: String, ph: f64) {
        self.count += 1;
        self.temperature_sum += temperature;
        self.turbidity_sum += turbidity;
        self.ph_sum += ph;
        // An empty string means the device omitted the field.
        if !water_quality.is_empty() {
            self.water_quality = water_quality;
        }
    }

    fn finish(self, start: i64, bucket_seconds: i64) -> Result<AggregatePoint, StoreError> {
        let bucket_start = start + self.index * bucket_seconds;
        let time = OffsetDateTime::from_unix_timestamp(bucket_start)?.format(&Rfc3339)?;
        let n = f64::from(self.count);
        let water_quality = if self.water_quality.is_empty() {
            None
        } else {
            Some(self.water_quality)
        };
        Ok(AggregatePoint {
            time,
            temperature: Some(self.temperature_sum / n),
            turbidity: Some(self.turbidity_sum / n),
            water_quality,
            ph: Some(self.ph_sum / n),
        })
    }
}

/// Drains the bounded write buffer into the store on a dedicated task so a
/// slow database never stalls broker message consumption. On shutdown the
/// buffered backlog is drained under `drain_timeout`, then abandoned.
pub fn spawn_reading_writer(
    db: Arc<DatabaseService>,
    mut rx: mpsc::Receiver<SensorReading>,
    mut shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_reading = rx.recv() => match maybe_reading {
                    Some(reading) => write_one(&db, &reading),
                    None => break,
                },
                _ = shutdown.changed() => {
                    drain(&db, &mut rx, drain_timeout).await;
                    break;
                }
            }
        }
        info!("Store writer stopped.");
    })
}

fn write_one(db: &DatabaseService, reading: &SensorReading) {
    // Reading is lost on failure; durability beyond the store's own is a non-goal.
    if let Err(e) = db.insert_reading(reading) {
        error!(
            "Failed to persist reading from '{}': {}",
            reading.device_id, e
        );
    }
}

async fn drain(
    db: &DatabaseService,
    rx: &mut mpsc::Receiver<SensorReading>,
    drain_timeout: Duration,
) {
    let deadline = Instant::now() + drain_timeout;
    rx.close();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!("Abandoning {} pending write(s) at shutdown.", rx.len());
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(reading)) => write_one(db, &reading),
            Ok(None) => break,
            Err(_) => {
                warn!("Abandoning {} pending write(s) at shutdown.", rx.len());
                break;
            }
        }
    }
}
