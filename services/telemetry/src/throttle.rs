use chrono::{DateTime, Duration, Utc};

/// Decision on whether to keep a frame long-term
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionDecision {
    /// Persist the frame with given reason
    Persist { reason: String },
    /// Only refresh the live snapshot, with given reason
    Skip { reason: String },
}

impl RetentionDecision {
    pub fn is_persist(&self) -> bool {
        matches!(self, RetentionDecision::Persist { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            RetentionDecision::Persist { reason } | RetentionDecision::Skip { reason } => reason,
        }
    }
}

/// Retention throttle that spaces out persisted frames
///
/// A frame is persisted when the stream has no persisted frame yet, or when
/// strictly more than `min_interval` has elapsed since the last one. The
/// throttle holds no state; the caller supplies the last persisted timestamp.
#[derive(Debug, Clone, Copy)]
pub struct RetentionThrottle {
    min_interval: Duration,
}

impl RetentionThrottle {
    /// Create a new throttle with the given minimum inter-frame interval
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Determine if a frame arriving at `now` should be persisted
    pub fn should_persist(&self, now: DateTime<Utc>, last_persisted_at: Option<DateTime<Utc>>) -> bool {
        match last_persisted_at {
            None => true,
            Some(last) => now.signed_duration_since(last) > self.min_interval,
        }
    }

    /// Same as [`should_persist`](Self::should_persist), with a reason for logging
    pub fn decide(&self, now: DateTime<Utc>, last_persisted_at: Option<DateTime<Utc>>) -> RetentionDecision {
        let Some(last) = last_persisted_at else {
            return RetentionDecision::Persist {
                reason: "No frame persisted yet".to_string(),
            };
        };

        let elapsed = now.signed_duration_since(last);
        if self.should_persist(now, last_persisted_at) {
            RetentionDecision::Persist {
                reason: format!(
                    "{}s since last frame > interval {}s",
                    elapsed.num_seconds(),
                    self.min_interval.num_seconds()
                ),
            }
        } else {
            RetentionDecision::Skip {
                reason: format!(
                    "{}s since last frame <= interval {}s",
                    elapsed.num_seconds(),
                    self.min_interval.num_seconds()
                ),
            }
        }
    }
}

/// Builder for creating RetentionThrottle with custom settings
pub struct RetentionThrottleBuilder {
    min_interval: Duration,
}

impl RetentionThrottleBuilder {
    pub fn new() -> Self {
        Self {
            min_interval: Duration::seconds(1740),
        }
    }

    pub fn min_interval_secs(mut self, secs: i64) -> Self {
        self.min_interval = Duration::seconds(secs);
        self
    }

    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn build(self) -> RetentionThrottle {
        RetentionThrottle::new(self.min_interval)
    }
}

impl Default for RetentionThrottleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
