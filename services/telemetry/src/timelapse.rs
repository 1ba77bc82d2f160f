//! Daily timelapse reconstruction.
//!
//! Starting from an instant, the reconstructor repeatedly asks the frame store
//! for the earliest daytime frame at or after a cursor, emits it, and moves the
//! cursor one step (an hour by default) past that frame. The scan ends when no
//! further daytime frame exists. Each iteration moves the cursor strictly
//! forward and the store is finite, so the scan terminates; a guard sized from
//! the store's frame count turns a misbehaving store into an error instead of
//! a hang.
//!
//! Output is a pure function of the start instant and the store contents.

use crate::classifier::Classification;
use crate::frame_store::{FrameStore, StoreError};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Errors that can occur while reconstructing a timelapse.
#[derive(Debug, Error)]
pub enum TimelapseError {
    #[error("Invalid start instant: {0}")]
    InvalidArgument(String),

    #[error("Frame store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Timelapse reconstruction exceeded its deadline")]
    Cancelled,

    #[error("Scan stalled: {0}")]
    ScanStalled(String),
}

/// One frame of a reconstructed timelapse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelapseEntry {
    pub frame_id: i64,
    pub captured_at: DateTime<Utc>,
    pub storage_path: String,
    /// 1-based count of elapsed days since the start instant
    pub day_index: i64,
}

/// Parse a start instant supplied by a caller.
///
/// Accepts RFC 3339 (`2024-05-01T12:00:00Z`, `...+02:00`) and naive ISO 8601
/// date-times or dates, which are taken as UTC.
pub fn parse_start_instant(input: &str) -> Result<DateTime<Utc>, TimelapseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TimelapseError::InvalidArgument("empty timestamp".to_string()));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = trimmed.trim_end_matches('Z');
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(naive, format) {
            return Ok(parsed.and_utc());
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(TimelapseError::InvalidArgument(format!(
        "'{}' is not an ISO 8601 timestamp",
        input
    )))
}

/// Day index of a frame relative to the start instant
pub fn day_index(start: DateTime<Utc>, captured_at: DateTime<Utc>) -> i64 {
    captured_at.signed_duration_since(start).num_days() + 1
}

/// Repeated forward-scan timelapse reconstructor
pub struct TimelapseReconstructor {
    store: Arc<dyn FrameStore>,
    step: Duration,
}

impl TimelapseReconstructor {
    pub fn new(store: Arc<dyn FrameStore>) -> Self {
        Self::with_step(store, Duration::hours(1))
    }

    pub fn with_step(store: Arc<dyn FrameStore>, step: Duration) -> Self {
        Self { store, step }
    }

    /// Reconstruct from a caller-supplied timestamp string
    pub async fn reconstruct_from_str(
        &self,
        stream_id: i64,
        start: &str,
    ) -> Result<Vec<TimelapseEntry>, TimelapseError> {
        let start = parse_start_instant(start)?;
        self.reconstruct(stream_id, start).await
    }

    /// Reconstruct the timelapse of a stream beginning at `start`
    pub async fn reconstruct(
        &self,
        stream_id: i64,
        start: DateTime<Utc>,
    ) -> Result<Vec<TimelapseEntry>, TimelapseError> {
        self.scan(stream_id, start, None).await
    }

    /// Like [`reconstruct`](Self::reconstruct), giving up once `deadline` passes.
    ///
    /// Entries found before the deadline are discarded along with the scan.
    pub async fn reconstruct_with_deadline(
        &self,
        stream_id: i64,
        start: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<Vec<TimelapseEntry>, TimelapseError> {
        match tokio::time::timeout_at(deadline, self.scan(stream_id, start, Some(deadline))).await {
            Ok(result) => result,
            Err(_) => Err(TimelapseError::Cancelled),
        }
    }

    #[instrument(skip(self, deadline))]
    async fn scan(
        &self,
        stream_id: i64,
        start: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<Vec<TimelapseEntry>, TimelapseError> {
        if self.step <= Duration::zero() {
            return Err(TimelapseError::InvalidArgument(
                "scan step must be positive".to_string(),
            ));
        }

        let max_iterations = self.store.count_frames(stream_id).await?.saturating_add(1);
        let mut entries = Vec::new();
        let mut cursor = start;

        for _ in 0..max_iterations {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TimelapseError::Cancelled);
            }

            let Some(frame) = self
                .store
                .find_earliest(stream_id, Classification::Day, cursor)
                .await?
            else {
                info!(entries = entries.len(), "Timelapse reconstructed");
                metrics::counter!("telemetry.timelapse.reconstructed").increment(1);
                return Ok(entries);
            };

            if frame.captured_at < cursor || frame.classification != Classification::Day {
                return Err(TimelapseError::ScanStalled(format!(
                    "store returned frame {} at {} for cursor {}",
                    frame.id, frame.captured_at, cursor
                )));
            }

            let entry = TimelapseEntry {
                frame_id: frame.id,
                captured_at: frame.captured_at,
                day_index: day_index(start, frame.captured_at),
                storage_path: frame.storage_path,
            };
            debug!(frame_id = entry.frame_id, day = entry.day_index, "Timelapse frame selected");
            entries.push(entry);

            cursor = frame.captured_at + self.step;
        }

        Err(TimelapseError::ScanStalled(format!(
            "no end of scan after {} iterations",
            max_iterations
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_store::{Frame, MockFrameStore};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    fn frame(id: i64, at: DateTime<Utc>) -> Frame {
        Frame {
            id,
            stream_id: 1,
            captured_at: at,
            storage_path: format!("user_1/{id}.jpg"),
            classification: Classification::Day,
        }
    }

    #[test]
    fn test_parse_start_instant_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();

        assert_eq!(parse_start_instant("2024-04-01T12:00:00Z").unwrap(), expected);
        assert_eq!(parse_start_instant("2024-04-01T14:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_start_instant("2024-04-01T12:00:00").unwrap(), expected);
        assert_eq!(parse_start_instant("2024-04-01T12:00:00.000Z").unwrap(), expected);
        assert_eq!(parse_start_instant("2024-04-01 12:00:00").unwrap(), expected);
        assert_eq!(
            parse_start_instant("2024-04-01").unwrap(),
            Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_start_instant_rejects_garbage() {
        for input in ["", "   ", "yesterday", "2024-13-01T00:00:00Z", "2024-04-01T25:00"] {
            assert!(
                matches!(parse_start_instant(input), Err(TimelapseError::InvalidArgument(_))),
                "accepted {input:?}"
            );
        }
    }

    #[test]
    fn test_day_index() {
        assert_eq!(day_index(t0(), t0()), 1);
        assert_eq!(day_index(t0(), t0() + Duration::hours(23)), 1);
        assert_eq!(day_index(t0(), t0() + Duration::hours(24)), 2);
        assert_eq!(day_index(t0(), t0() + Duration::hours(50)), 3);
    }

    #[tokio::test]
    async fn test_malformed_start_never_queries_store() {
        let mut store = MockFrameStore::new();
        store.expect_count_frames().never();
        store.expect_find_earliest().never();

        let reconstructor = TimelapseReconstructor::new(Arc::new(store));
        let result = reconstructor.reconstruct_from_str(1, "not-a-date").await;

        assert!(matches!(result, Err(TimelapseError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_store_failure_discards_partial_results() {
        let mut store = MockFrameStore::new();
        store.expect_count_frames().returning(|_| Ok(5));
        store
            .expect_find_earliest()
            .returning(|_, _, cursor| {
                if cursor == t0() {
                    Ok(Some(frame(1, t0() + Duration::hours(2))))
                } else {
                    Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut))
                }
            });

        let reconstructor = TimelapseReconstructor::new(Arc::new(store));
        let result = reconstructor.reconstruct(1, t0()).await;

        assert!(matches!(result, Err(TimelapseError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_store_returning_stale_frame_is_detected() {
        let mut store = MockFrameStore::new();
        store.expect_count_frames().returning(|_| Ok(3));
        // Ignores the cursor and keeps answering with the same frame
        store
            .expect_find_earliest()
            .returning(|_, _, _| Ok(Some(frame(1, t0() + Duration::hours(2)))));

        let reconstructor = TimelapseReconstructor::new(Arc::new(store));
        let result = reconstructor.reconstruct(1, t0()).await;

        assert!(matches!(result, Err(TimelapseError::ScanStalled(_))));
    }

    #[tokio::test]
    async fn test_iteration_guard_trips_on_endless_store() {
        let mut store = MockFrameStore::new();
        // Claims two frames but never runs out of them
        store.expect_count_frames().returning(|_| Ok(2));
        store
            .expect_find_earliest()
            .times(3)
            .returning(|_, _, cursor| Ok(Some(frame(9, cursor))));

        let reconstructor = TimelapseReconstructor::new(Arc::new(store));
        let result = reconstructor.reconstruct(1, t0()).await;

        assert!(matches!(result, Err(TimelapseError::ScanStalled(_))));
    }

    #[tokio::test]
    async fn test_expired_deadline_cancels() {
        let mut store = MockFrameStore::new();
        store.expect_count_frames().returning(|_| Ok(1));
        store.expect_find_earliest().returning(|_, _, _| Ok(None));

        let reconstructor = TimelapseReconstructor::new(Arc::new(store));
        let deadline = Instant::now() - std::time::Duration::from_millis(1);
        let result = reconstructor.reconstruct_with_deadline(1, t0(), deadline).await;

        assert!(matches!(result, Err(TimelapseError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cursor_advances_by_step() {
        let mut store = MockFrameStore::new();
        store.expect_count_frames().returning(|_| Ok(10));
        store
            .expect_find_earliest()
            .withf(|_, class, _| *class == Classification::Day)
            .returning(|_, _, cursor| {
                // Frames every 30 minutes for two hours
                let end = t0() + Duration::hours(2);
                if cursor > end {
                    return Ok(None);
                }
                let offset = (cursor - t0()).num_minutes();
                let next = t0() + Duration::minutes((offset + 29) / 30 * 30);
                Ok(if next > end { None } else { Some(frame(offset, next)) })
            });

        let reconstructor = TimelapseReconstructor::new(Arc::new(store));
        let entries = reconstructor.reconstruct(1, t0()).await.unwrap();
        let times: Vec<_> = entries.iter().map(|e| e.captured_at).collect();

        assert_eq!(
            times,
            vec![t0(), t0() + Duration::hours(1), t0() + Duration::hours(2)]
        );
    }
}
