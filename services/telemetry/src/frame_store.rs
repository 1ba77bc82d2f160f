use crate::classifier::Classification;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors surfaced by the SQLite-backed stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(sqlx::Error),

    #[error("Record not found")]
    NotFound,

    /// A unique column already holds the value
    #[error("Conflicting record: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(db.message().to_string()),
            e => StoreError::Unavailable(e),
        }
    }
}

/// A persisted long-term frame
///
/// Frames are append-only; ordering is `(captured_at, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub id: i64,
    pub stream_id: i64,
    pub captured_at: DateTime<Utc>,
    pub storage_path: String,
    pub classification: Classification,
}

/// Timestamps are stored timezone-naive and read back as UTC
#[derive(Debug, FromRow)]
struct FrameRow {
    id: i64,
    stream_id: i64,
    captured_at: NaiveDateTime,
    storage_path: String,
    classification: Classification,
}

impl From<FrameRow> for Frame {
    fn from(row: FrameRow) -> Self {
        Self {
            id: row.id,
            stream_id: row.stream_id,
            captured_at: row.captured_at.and_utc(),
            storage_path: row.storage_path,
            classification: row.classification,
        }
    }
}

/// Query parameters for frame listing
#[derive(Debug, Clone, Default)]
pub struct FrameQuery {
    /// Stream the frames belong to
    pub stream_id: i64,
    /// Start time (inclusive)
    pub start_time: Option<DateTime<Utc>>,
    /// End time (inclusive)
    pub end_time: Option<DateTime<Utc>>,
    /// Filter by day/night label
    pub classification: Option<Classification>,
    /// Maximum number of results
    pub limit: Option<i64>,
    /// Offset for pagination
    pub offset: Option<i64>,
    /// Order by timestamp (true = ascending, false = descending)
    pub ascending: bool,
}

/// Ordered, queryable record store for persisted frames
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameStore: Send + Sync {
    /// Append a frame unconditionally
    async fn insert(
        &self,
        stream_id: i64,
        captured_at: DateTime<Utc>,
        storage_path: &str,
        classification: Classification,
    ) -> Result<i64, StoreError>;

    /// Append a frame only if the stream has no frame captured within
    /// `min_interval` before (or any time after) `captured_at`.
    ///
    /// Returns `None` when a conflicting frame exists.
    async fn insert_if_idle(
        &self,
        stream_id: i64,
        captured_at: DateTime<Utc>,
        storage_path: &str,
        classification: Classification,
        min_interval: Duration,
    ) -> Result<Option<i64>, StoreError>;

    /// Capture time of the newest persisted frame of a stream
    async fn latest_persisted_timestamp(&self, stream_id: i64) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Earliest frame with the given label captured at or after `after_or_at`
    async fn find_earliest(
        &self,
        stream_id: i64,
        classification: Classification,
        after_or_at: DateTime<Utc>,
    ) -> Result<Option<Frame>, StoreError>;

    /// Number of persisted frames of a stream
    async fn count_frames(&self, stream_id: i64) -> Result<u64, StoreError>;
}

const FRAME_COLUMNS: &str = "id, stream_id, captured_at, storage_path, classification";

/// Frame store in SQLite
#[derive(Clone)]
pub struct SqliteFrameStore {
    pool: SqlitePool,
}

impl SqliteFrameStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a frame by ID
    pub async fn get_frame(&self, stream_id: i64, frame_id: i64) -> Result<Option<Frame>, StoreError> {
        let row = sqlx::query_as::<_, FrameRow>(&format!(
            "SELECT {FRAME_COLUMNS} FROM frames WHERE id = ? AND stream_id = ?"
        ))
        .bind(frame_id)
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Query frames with filters
    #[instrument(skip(self))]
    pub async fn list_frames(&self, query: &FrameQuery) -> Result<Vec<Frame>, StoreError> {
        let mut sql = format!("SELECT {FRAME_COLUMNS} FROM frames WHERE stream_id = ?");
        push_filters(&mut sql, query);

        // Order by timestamp
        if query.ascending {
            sql.push_str(" ORDER BY captured_at ASC, id ASC");
        } else {
            sql.push_str(" ORDER BY captured_at DESC, id DESC");
        }

        // Limit and offset; SQLite needs a LIMIT before an OFFSET
        if query.limit.is_some() || query.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query_builder = sqlx::query_as::<_, FrameRow>(&sql).bind(query.stream_id);

        if let Some(start_time) = query.start_time {
            query_builder = query_builder.bind(start_time.naive_utc());
        }
        if let Some(end_time) = query.end_time {
            query_builder = query_builder.bind(end_time.naive_utc());
        }
        if let Some(classification) = query.classification {
            query_builder = query_builder.bind(classification);
        }
        if query.limit.is_some() || query.offset.is_some() {
            query_builder = query_builder
                .bind(query.limit.unwrap_or(-1))
                .bind(query.offset.unwrap_or(0));
        }

        let rows = query_builder.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Count frames matching the filters of a query (ignoring paging)
    pub async fn count_matching(&self, query: &FrameQuery) -> Result<i64, StoreError> {
        let mut sql = String::from("SELECT COUNT(*) FROM frames WHERE stream_id = ?");
        push_filters(&mut sql, query);

        let mut query_builder = sqlx::query_scalar::<_, i64>(&sql).bind(query.stream_id);
        if let Some(start_time) = query.start_time {
            query_builder = query_builder.bind(start_time.naive_utc());
        }
        if let Some(end_time) = query.end_time {
            query_builder = query_builder.bind(end_time.naive_utc());
        }
        if let Some(classification) = query.classification {
            query_builder = query_builder.bind(classification);
        }

        Ok(query_builder.fetch_one(&self.pool).await?)
    }

    /// Delete a frame record, returning it so the caller can drop the blob
    #[instrument(skip(self))]
    pub async fn delete_frame(&self, stream_id: i64, frame_id: i64) -> Result<Frame, StoreError> {
        let frame = self
            .get_frame(stream_id, frame_id)
            .await?
            .ok_or(StoreError::NotFound)?;

        sqlx::query("DELETE FROM frames WHERE id = ? AND stream_id = ?")
            .bind(frame_id)
            .bind(stream_id)
            .execute(&self.pool)
            .await?;

        info!(frame_id, stream_id, "Frame deleted");
        Ok(frame)
    }
}

fn push_filters(sql: &mut String, query: &FrameQuery) {
    if query.start_time.is_some() {
        sql.push_str(" AND captured_at >= ?");
    }
    if query.end_time.is_some() {
        sql.push_str(" AND captured_at <= ?");
    }
    if query.classification.is_some() {
        sql.push_str(" AND classification = ?");
    }
}

#[async_trait]
impl FrameStore for SqliteFrameStore {
    #[instrument(skip(self))]
    async fn insert(
        &self,
        stream_id: i64,
        captured_at: DateTime<Utc>,
        storage_path: &str,
        classification: Classification,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query(
            "INSERT INTO frames (stream_id, captured_at, storage_path, classification) VALUES (?, ?, ?, ?)",
        )
        .bind(stream_id)
        .bind(captured_at.naive_utc())
        .bind(storage_path)
        .bind(classification)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        debug!(frame_id = id, stream_id, "Frame inserted");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn insert_if_idle(
        &self,
        stream_id: i64,
        captured_at: DateTime<Utc>,
        storage_path: &str,
        classification: Classification,
        min_interval: Duration,
    ) -> Result<Option<i64>, StoreError> {
        // A single statement, so the check and the append cannot interleave
        // with another writer.
        let window_start = (captured_at - min_interval).naive_utc();
        let result = sqlx::query(
            r#"
            INSERT INTO frames (stream_id, captured_at, storage_path, classification)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM frames WHERE stream_id = ? AND captured_at >= ?
            )
            "#,
        )
        .bind(stream_id)
        .bind(captured_at.naive_utc())
        .bind(storage_path)
        .bind(classification)
        .bind(stream_id)
        .bind(window_start)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(stream_id, "Conditional frame insert found a newer frame");
            return Ok(None);
        }

        let id = result.last_insert_rowid();
        debug!(frame_id = id, stream_id, "Frame inserted");
        Ok(Some(id))
    }

    async fn latest_persisted_timestamp(&self, stream_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest = sqlx::query_scalar::<_, NaiveDateTime>(
            "SELECT captured_at FROM frames WHERE stream_id = ? ORDER BY captured_at DESC, id DESC LIMIT 1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(latest.map(|t| t.and_utc()))
    }

    async fn find_earliest(
        &self,
        stream_id: i64,
        classification: Classification,
        after_or_at: DateTime<Utc>,
    ) -> Result<Option<Frame>, StoreError> {
        let row = sqlx::query_as::<_, FrameRow>(&format!(
            "SELECT {FRAME_COLUMNS} FROM frames \
             WHERE stream_id = ? AND classification = ? AND captured_at >= ? \
             ORDER BY captured_at ASC, id ASC LIMIT 1"
        ))
        .bind(stream_id)
        .bind(classification)
        .bind(after_or_at.naive_utc())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn count_frames(&self, stream_id: i64) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM frames WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}
