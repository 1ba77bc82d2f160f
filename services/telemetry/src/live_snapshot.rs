use crate::blob_store::{content_type, file_extension};
use crate::classifier::Classification;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Most recently received image of a stream, whether or not it was persisted
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    pub data: Bytes,
    pub content_type: &'static str,
    pub received_at: DateTime<Utc>,
    pub classification: Option<Classification>,
}

/// One overwrite-only slot per stream
///
/// Last write wins; concurrent writers may interleave arbitrarily.
#[derive(Default)]
pub struct LiveSnapshots {
    slots: RwLock<HashMap<i64, LiveSnapshot>>,
}

impl LiveSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot of a stream
    pub fn update(&self, stream_id: i64, data: Bytes, received_at: DateTime<Utc>) {
        let snapshot = LiveSnapshot {
            content_type: content_type(file_extension(&data)),
            data,
            received_at,
            classification: None,
        };
        self.slots.write().insert(stream_id, snapshot);
    }

    /// Attach a label to the snapshot, unless a newer image replaced it
    pub fn label(&self, stream_id: i64, received_at: DateTime<Utc>, classification: Classification) {
        if let Some(snapshot) = self.slots.write().get_mut(&stream_id) {
            if snapshot.received_at == received_at {
                snapshot.classification = Some(classification);
            }
        }
    }

    pub fn latest(&self, stream_id: i64) -> Option<LiveSnapshot> {
        self.slots.read().get(&stream_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_last_write_wins() {
        let snapshots = LiveSnapshots::new();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        assert!(snapshots.latest(1).is_none());

        snapshots.update(1, Bytes::from_static(b"first"), t0);
        snapshots.update(1, Bytes::from_static(b"second"), t0 + Duration::minutes(1));

        let latest = snapshots.latest(1).unwrap();
        assert_eq!(latest.data, Bytes::from_static(b"second"));
        assert_eq!(latest.content_type, "application/octet-stream");
        assert!(snapshots.latest(2).is_none());
    }

    #[test]
    fn test_label_ignores_stale_writes() {
        let snapshots = LiveSnapshots::new();
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        snapshots.update(1, Bytes::from_static(b"a"), t0);
        snapshots.update(1, Bytes::from_static(b"b"), t0 + Duration::seconds(5));
        snapshots.label(1, t0, Classification::Night);
        assert_eq!(snapshots.latest(1).unwrap().classification, None);

        snapshots.label(1, t0 + Duration::seconds(5), Classification::Day);
        assert_eq!(
            snapshots.latest(1).unwrap().classification,
            Some(Classification::Day)
        );
    }
}
