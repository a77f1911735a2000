use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

/// Keepalive interval for progress streams; proxies tend to drop idle
/// connections well before a long crawl finishes.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// The latest-state snapshot a job publishes while it runs. Only the
/// newest snapshot is kept; consumers poll or stream it, they never get
/// history.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProgressSnapshot {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_keywords: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listings_found: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl ProgressSnapshot {
    pub fn running(message: &str) -> Self {
        ProgressSnapshot {
            status: "running".to_string(),
            message: Some(message.to_string()),
            timestamp: Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed.unwrap_or(false)
            || self.status == "completed"
            || self.status == "failed"
    }
}

/// Where running jobs publish their snapshots. A trait so the scheduler can
/// be exercised without a database.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn record(&self, snapshot: &ProgressSnapshot);
}

/// Persists snapshots onto the job row. Failures are logged and swallowed;
/// losing a progress update must never fail the scrape itself.
pub struct DbProgressSink {
    pool: PgPool,
    job_id: Uuid,
}

impl DbProgressSink {
    pub fn new(pool: PgPool, job_id: Uuid) -> Self {
        DbProgressSink { pool, job_id }
    }
}

#[async_trait]
impl ProgressSink for DbProgressSink {
    async fn record(&self, snapshot: &ProgressSnapshot) {
        if let Err(e) = crate::db::save_progress(&self.pool, self.job_id, snapshot).await {
            warn!("Failed to save progress for job {}: {}", self.job_id, e);
        }
    }
}

/// What a progress stream should emit for one observation of the stored
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEmit {
    /// A new snapshot: event name and its JSON payload.
    Event { name: &'static str, payload: String },
    /// Nothing changed but the keepalive interval elapsed.
    Ping,
    /// Nothing to send.
    Idle,
}

/// Change-detection and keepalive state for one progress stream.
///
/// Pure state machine over (payload, now) so the dedup and keepalive
/// behavior is unit-testable with synthetic clocks.
#[derive(Debug)]
pub struct StreamState {
    last_payload: Option<String>,
    last_activity: Instant,
}

impl StreamState {
    pub fn new(now: Instant) -> Self {
        StreamState {
            last_payload: None,
            last_activity: now,
        }
    }

    /// Observe the currently stored snapshot. Emits an event only when the
    /// serialized payload differs from the last one sent, a ping when the
    /// stream has been silent for the keepalive interval, and nothing
    /// otherwise.
    pub fn observe(&mut self, payload: &str, terminal: bool, now: Instant) -> StreamEmit {
        if self.last_payload.as_deref() != Some(payload) {
            self.last_payload = Some(payload.to_string());
            self.last_activity = now;
            let name = if terminal { "complete" } else { "progress" };
            return StreamEmit::Event {
                name,
                payload: payload.to_string(),
            };
        }

        if now.duration_since(self.last_activity) >= KEEPALIVE_INTERVAL {
            self.last_activity = now;
            return StreamEmit::Ping;
        }

        StreamEmit::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_emits_progress_event() {
        let start = Instant::now();
        let mut state = StreamState::new(start);
        let emit = state.observe(r#"{"status":"running"}"#, false, start);
        assert_eq!(
            emit,
            StreamEmit::Event {
                name: "progress",
                payload: r#"{"status":"running"}"#.to_string()
            }
        );
    }

    #[test]
    fn unchanged_payload_is_suppressed() {
        let start = Instant::now();
        let mut state = StreamState::new(start);
        state.observe("a", false, start);
        assert_eq!(state.observe("a", false, start + Duration::from_secs(1)), StreamEmit::Idle);
        assert_eq!(state.observe("a", false, start + Duration::from_secs(2)), StreamEmit::Idle);
    }

    #[test]
    fn changed_payload_emits_again() {
        let start = Instant::now();
        let mut state = StreamState::new(start);
        state.observe("a", false, start);
        let emit = state.observe("b", false, start + Duration::from_secs(1));
        assert!(matches!(emit, StreamEmit::Event { name: "progress", .. }));
    }

    #[test]
    fn keepalive_fires_after_thirty_idle_seconds() {
        let start = Instant::now();
        let mut state = StreamState::new(start);
        state.observe("a", false, start);
        assert_eq!(
            state.observe("a", false, start + Duration::from_secs(29)),
            StreamEmit::Idle
        );
        assert_eq!(
            state.observe("a", false, start + Duration::from_secs(30)),
            StreamEmit::Ping
        );
        // A ping counts as activity; the next window starts fresh.
        assert_eq!(
            state.observe("a", false, start + Duration::from_secs(31)),
            StreamEmit::Idle
        );
        assert_eq!(
            state.observe("a", false, start + Duration::from_secs(60)),
            StreamEmit::Ping
        );
    }

    #[test]
    fn terminal_snapshot_emits_complete_event() {
        let start = Instant::now();
        let mut state = StreamState::new(start);
        state.observe("a", false, start);
        let emit = state.observe("b", true, start + Duration::from_secs(1));
        assert!(matches!(emit, StreamEmit::Event { name: "complete", .. }));
    }

    #[test]
    fn event_resets_keepalive_timer() {
        let start = Instant::now();
        let mut state = StreamState::new(start);
        state.observe("a", false, start + Duration::from_secs(25));
        assert_eq!(
            state.observe("a", false, start + Duration::from_secs(35)),
            StreamEmit::Idle
        );
    }

    #[test]
    fn terminal_detection_covers_status_and_flag() {
        let mut snap = ProgressSnapshot::running("working");
        assert!(!snap.is_terminal());
        snap.completed = Some(true);
        assert!(snap.is_terminal());

        let failed = ProgressSnapshot {
            status: "failed".to_string(),
            ..Default::default()
        };
        assert!(failed.is_terminal());
    }
}
