//! Greenhouse Telemetry Service
//!
//! Backend for greenhouse camera and sensor nodes. Devices push images and
//! environmental readings over HTTP; the service keeps a thinned-out image
//! history per user and rebuilds daily timelapses from it.
//!
//! ## Features
//!
//! - **Day/Night Classification**: Every received image is labelled by its
//!   mean luminance
//! - **Retention Throttling**: At most one persisted frame per minimum
//!   interval, while the live view always shows the newest image
//! - **Timelapse Reconstruction**: One daytime frame per elapsed day since a
//!   start date (usually the germination date)
//! - **Sensor History**: Temperature and humidity readings with VPD summaries
//!
//! ## Architecture
//!
//! ```text
//!  Camera node                                    SQLite
//! ┌──────────────┐     ┌──────────────┐          ┌──────────────┐
//! │ POST         │────▶│ Frame        │          │ users        │
//! │ /upload_     │     │ Classifier   │          │ frames       │
//! │ picture      │     └──────────────┘          │ sensor_      │
//! └──────────────┘            │                  │ readings     │
//!                             ▼                  └──────────────┘
//!                      ┌──────────────┐                 ▲
//!                      │ Retention    │─── persist ─────┤
//!                      │ Throttle     │                 │
//!                      └──────────────┘                 │
//!                             │                         │
//!                             ▼                         │
//!                      ┌──────────────┐          ┌──────────────┐
//!                      │ Live         │          │ Timelapse    │
//!                      │ Snapshots    │          │ Reconstructor│
//!                      └──────────────┘          └──────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod blob_store;
pub mod classifier;
pub mod config;
pub mod database;
pub mod extract;
pub mod frame_store;
pub mod ingest;
pub mod live_snapshot;
pub mod sensor_store;
pub mod throttle;
pub mod timelapse;
pub mod user_store;

pub use api::{create_router, start_api_server, ApiError, AppState};
pub use blob_store::{BlobStore, FilesystemBlobStore};
pub use classifier::{Classification, FrameClassifier, FrameLabel};
pub use config::Config;
pub use database::Database;
pub use frame_store::{Frame, FrameQuery, FrameStore, SqliteFrameStore, StoreError};
pub use ingest::{IngestError, IngestOutcome, IngestionEvent, IngestionService};
pub use live_snapshot::{LiveSnapshot, LiveSnapshots};
pub use sensor_store::{SensorReading, SensorStore, SensorSummary};
pub use throttle::{RetentionDecision, RetentionThrottle, RetentionThrottleBuilder};
pub use timelapse::{TimelapseEntry, TimelapseError, TimelapseReconstructor};
pub use user_store::{Role, User, UserStore};
