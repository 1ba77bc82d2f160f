//! Frame ingestion.
//!
//! Every inbound image refreshes the live snapshot of its stream. It is then
//! classified and handed to the retention throttle; frames the throttle keeps
//! are written to the blob store and appended to the frame store.
//!
//! The read-decide-write sequence runs under a per-stream lock, and the
//! append itself is a conditional insert, so two ingestions racing on one
//! stream (in this process or another one sharing the database) cannot both
//! clear the throttle window.

use crate::blob_store::BlobStore;
use crate::classifier::{Classification, FrameClassifier};
use crate::frame_store::{FrameStore, StoreError};
use crate::live_snapshot::LiveSnapshots;
use crate::throttle::{RetentionDecision, RetentionThrottle};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while ingesting a frame.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Frame store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Failed to write image: {0:#}")]
    BlobWrite(anyhow::Error),

    #[error("Retention window for stream {stream_id} was taken by a concurrent ingestion")]
    ConcurrencyViolation { stream_id: i64 },
}

/// One inbound image, consumed by [`IngestionService::ingest`].
#[derive(Debug, Clone)]
pub struct IngestionEvent {
    pub stream_id: i64,
    pub image: Bytes,
    pub received_at: DateTime<Utc>,
}

/// What happened to an ingested image.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    /// ID of the persisted frame; absent when only the snapshot was refreshed
    pub frame_id: Option<i64>,
    pub storage_path: Option<String>,
    pub classification: Classification,
    pub brightness: Option<f64>,
    pub reason: String,
}

impl IngestOutcome {
    pub fn persisted(&self) -> bool {
        self.frame_id.is_some()
    }
}

/// Classifier + throttle + stores, wired together.
pub struct IngestionService {
    classifier: FrameClassifier,
    throttle: RetentionThrottle,
    frames: Arc<dyn FrameStore>,
    blobs: Arc<dyn BlobStore>,
    snapshots: Arc<LiveSnapshots>,
    /// Single-writer lock per stream
    stream_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl IngestionService {
    pub fn new(
        classifier: FrameClassifier,
        throttle: RetentionThrottle,
        frames: Arc<dyn FrameStore>,
        blobs: Arc<dyn BlobStore>,
        snapshots: Arc<LiveSnapshots>,
    ) -> Self {
        Self {
            classifier,
            throttle,
            frames,
            blobs,
            snapshots,
            stream_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshots(&self) -> &Arc<LiveSnapshots> {
        &self.snapshots
    }

    fn stream_lock(&self, stream_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.stream_locks
            .lock()
            .entry(stream_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ingest one image
    #[instrument(skip(self, event), fields(stream_id = event.stream_id, size_bytes = event.image.len()))]
    pub async fn ingest(&self, event: IngestionEvent) -> Result<IngestOutcome, IngestError> {
        let IngestionEvent {
            stream_id,
            image,
            received_at,
        } = event;

        self.snapshots.update(stream_id, image.clone(), received_at);

        let label = self.classifier.classify_off_runtime(image.clone()).await;
        self.snapshots.label(stream_id, received_at, label.classification);

        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        // A lost conditional insert is retried once with a fresh read.
        for attempt in 0..2 {
            let last_persisted_at = self.frames.latest_persisted_timestamp(stream_id).await?;

            let reason = match self.throttle.decide(received_at, last_persisted_at) {
                RetentionDecision::Persist { reason } => reason,
                RetentionDecision::Skip { reason } => {
                    debug!(reason = %reason, "Skipping frame storage");
                    metrics::counter!("telemetry.frames.skipped").increment(1);
                    return Ok(IngestOutcome {
                        frame_id: None,
                        storage_path: None,
                        classification: label.classification,
                        brightness: label.brightness,
                        reason,
                    });
                }
            };

            let storage_path = self
                .blobs
                .put(stream_id, received_at, &image)
                .await
                .map_err(IngestError::BlobWrite)?;

            let inserted = self
                .frames
                .insert_if_idle(
                    stream_id,
                    received_at,
                    &storage_path,
                    label.classification,
                    self.throttle.min_interval(),
                )
                .await;

            match inserted {
                Ok(Some(frame_id)) => {
                    info!(
                        frame_id,
                        storage_path = %storage_path,
                        classification = %label.classification,
                        reason = %reason,
                        "Frame persisted"
                    );
                    metrics::counter!("telemetry.frames.persisted").increment(1);
                    return Ok(IngestOutcome {
                        frame_id: Some(frame_id),
                        storage_path: Some(storage_path),
                        classification: label.classification,
                        brightness: label.brightness,
                        reason,
                    });
                }
                Ok(None) => {
                    warn!(attempt, "Concurrent ingestion claimed the retention window");
                    self.discard_blob(&storage_path).await;
                }
                Err(e) => {
                    self.discard_blob(&storage_path).await;
                    return Err(e.into());
                }
            }
        }

        metrics::counter!("telemetry.frames.conflicts").increment(1);
        Err(IngestError::ConcurrencyViolation { stream_id })
    }

    async fn discard_blob(&self, storage_path: &str) {
        if let Err(e) = self.blobs.delete(storage_path).await {
            warn!(error = %e, storage_path = %storage_path, "Failed to remove orphaned image");
        }
    }
}
