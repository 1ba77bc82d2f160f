use crate::frame_store::StoreError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::{debug, instrument};

/// A single environmental reading from a sensor node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub id: i64,
    pub stream_id: i64,
    pub recorded_at: DateTime<Utc>,
    /// Air temperature in °C
    pub temperature: f64,
    /// Relative air humidity in %
    pub humidity: f64,
    /// Soil moisture in %
    pub soil_humidity: f64,
}

#[derive(Debug, FromRow)]
struct SensorRow {
    id: i64,
    stream_id: i64,
    recorded_at: NaiveDateTime,
    temperature: f64,
    humidity: f64,
    soil_humidity: f64,
}

impl From<SensorRow> for SensorReading {
    fn from(row: SensorRow) -> Self {
        Self {
            id: row.id,
            stream_id: row.stream_id,
            recorded_at: row.recorded_at.and_utc(),
            temperature: row.temperature,
            humidity: row.humidity,
            soil_humidity: row.soil_humidity,
        }
    }
}

/// Query parameters for reading listings
#[derive(Debug, Clone, Default)]
pub struct SensorQuery {
    pub stream_id: i64,
    /// Start time (inclusive)
    pub start_time: Option<DateTime<Utc>>,
    /// End time (inclusive)
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Order by timestamp (true = ascending, false = descending)
    pub ascending: bool,
}

/// Averages over the most recent readings of a stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSummary {
    pub samples: usize,
    pub avg_temperature: f64,
    pub avg_humidity: f64,
    pub avg_soil_humidity: f64,
    /// Leaf vapour-pressure deficit in kPa
    pub vpd_kpa: f64,
}

/// Saturated vapour pressure in kPa (Tetens)
pub fn saturated_vapour_pressure(temp_c: f64) -> f64 {
    0.61078 * ((17.27 * temp_c) / (temp_c + 237.3)).exp()
}

/// Leaf vapour-pressure deficit in kPa
pub fn vapour_pressure_deficit(air_temp_c: f64, leaf_temp_c: f64, relative_humidity: f64) -> f64 {
    let actual = saturated_vapour_pressure(air_temp_c) * (relative_humidity / 100.0);
    saturated_vapour_pressure(leaf_temp_c) - actual
}

const SENSOR_COLUMNS: &str = "id, stream_id, recorded_at, temperature, humidity, soil_humidity";

/// Sensor reading storage in SQLite
#[derive(Clone)]
pub struct SensorStore {
    pool: SqlitePool,
}

impl SensorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn record(
        &self,
        stream_id: i64,
        recorded_at: DateTime<Utc>,
        temperature: f64,
        humidity: f64,
        soil_humidity: f64,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query(
            "INSERT INTO sensor_readings (stream_id, recorded_at, temperature, humidity, soil_humidity) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(stream_id)
        .bind(recorded_at.naive_utc())
        .bind(temperature)
        .bind(humidity)
        .bind(soil_humidity)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        debug!(reading_id = id, "Sensor reading recorded");
        Ok(id)
    }

    pub async fn list(&self, query: &SensorQuery) -> Result<Vec<SensorReading>, StoreError> {
        let mut sql = format!("SELECT {SENSOR_COLUMNS} FROM sensor_readings WHERE stream_id = ?");
        push_filters(&mut sql, query);

        if query.ascending {
            sql.push_str(" ORDER BY recorded_at ASC, id ASC");
        } else {
            sql.push_str(" ORDER BY recorded_at DESC, id DESC");
        }
        if query.limit.is_some() || query.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query_builder = sqlx::query_as::<_, SensorRow>(&sql).bind(query.stream_id);
        if let Some(start_time) = query.start_time {
            query_builder = query_builder.bind(start_time.naive_utc());
        }
        if let Some(end_time) = query.end_time {
            query_builder = query_builder.bind(end_time.naive_utc());
        }
        if query.limit.is_some() || query.offset.is_some() {
            query_builder = query_builder
                .bind(query.limit.unwrap_or(-1))
                .bind(query.offset.unwrap_or(0));
        }

        let rows = query_builder.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn count(&self, query: &SensorQuery) -> Result<i64, StoreError> {
        let mut sql = String::from("SELECT COUNT(*) FROM sensor_readings WHERE stream_id = ?");
        push_filters(&mut sql, query);

        let mut query_builder = sqlx::query_scalar::<_, i64>(&sql).bind(query.stream_id);
        if let Some(start_time) = query.start_time {
            query_builder = query_builder.bind(start_time.naive_utc());
        }
        if let Some(end_time) = query.end_time {
            query_builder = query_builder.bind(end_time.naive_utc());
        }

        Ok(query_builder.fetch_one(&self.pool).await?)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, stream_id: i64, reading_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sensor_readings WHERE id = ? AND stream_id = ?")
            .bind(reading_id)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Averages of the newest `last_n` readings; `None` without readings.
    ///
    /// The leaf temperature defaults to the air temperature.
    pub async fn summary(
        &self,
        stream_id: i64,
        last_n: i64,
        leaf_temperature: Option<f64>,
    ) -> Result<Option<SensorSummary>, StoreError> {
        let readings = self
            .list(&SensorQuery {
                stream_id,
                limit: Some(last_n.max(1)),
                ..Default::default()
            })
            .await?;

        if readings.is_empty() {
            return Ok(None);
        }

        let n = readings.len() as f64;
        let avg_temperature = readings.iter().map(|r| r.temperature).sum::<f64>() / n;
        let avg_humidity = readings.iter().map(|r| r.humidity).sum::<f64>() / n;
        let avg_soil_humidity = readings.iter().map(|r| r.soil_humidity).sum::<f64>() / n;
        let leaf = leaf_temperature.unwrap_or(avg_temperature);

        Ok(Some(SensorSummary {
            samples: readings.len(),
            avg_temperature,
            avg_humidity,
            avg_soil_humidity,
            vpd_kpa: vapour_pressure_deficit(avg_temperature, leaf, avg_humidity),
        }))
    }
}

fn push_filters(sql: &mut String, query: &SensorQuery) {
    if query.start_time.is_some() {
        sql.push_str(" AND recorded_at >= ?");
    }
    if query.end_time.is_some() {
        sql.push_str(" AND recorded_at <= ?");
    }
}
