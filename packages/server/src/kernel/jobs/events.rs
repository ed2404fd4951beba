//! Batch lifecycle events published to observers.
//!
//! These are facts about what already happened, not commands. They are
//! best-effort freshness hints: observers that miss one resynchronize by
//! re-reading job status from the store.

use serde::{Deserialize, Serialize};

use super::BatchSummary;

/// Events emitted by the worker pool as a batch progresses.
///
/// Published on the `batch:{batch_id}` topic, and additionally on
/// `library:{name}` when the batch belongs to a library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    BatchStarted {
        batch_id: String,
        total_jobs: usize,
    },
    JobStarted {
        batch_id: String,
        job_id: i64,
    },
    JobCompleted {
        batch_id: String,
        job_id: i64,
    },
    JobFailed {
        batch_id: String,
        job_id: i64,
        error: String,
    },
    /// All jobs ran and the worker exited cleanly.
    BatchCompleted {
        batch_id: String,
        summary: BatchSummary,
    },
    /// The worker terminated abnormally; incomplete jobs were failed.
    BatchFailed {
        batch_id: String,
        reason: String,
    },
}

impl BatchEvent {
    /// The batch this event concerns.
    pub fn batch_id(&self) -> &str {
        match self {
            BatchEvent::BatchStarted { batch_id, .. }
            | BatchEvent::JobStarted { batch_id, .. }
            | BatchEvent::JobCompleted { batch_id, .. }
            | BatchEvent::JobFailed { batch_id, .. }
            | BatchEvent::BatchCompleted { batch_id, .. }
            | BatchEvent::BatchFailed { batch_id, .. } => batch_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_started_serializes() {
        let event = BatchEvent::BatchStarted {
            batch_id: "b1".into(),
            total_jobs: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"batch_started\""));
        assert!(json.contains("\"total_jobs\":3"));
    }

    #[test]
    fn job_failed_serializes() {
        let event = BatchEvent::JobFailed {
            batch_id: "b1".into(),
            job_id: 42,
            error: "HTTP 404".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"job_failed\""));
        assert!(json.contains("HTTP 404"));
    }

    #[test]
    fn batch_failed_serializes() {
        let event = BatchEvent::BatchFailed {
            batch_id: "b1".into(),
            reason: "worker terminated abnormally".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("batch_failed"));
        assert!(json.contains("worker terminated abnormally"));
    }

    #[test]
    fn events_expose_batch_id() {
        let events = vec![
            BatchEvent::BatchStarted {
                batch_id: "b1".into(),
                total_jobs: 1,
            },
            BatchEvent::JobStarted {
                batch_id: "b1".into(),
                job_id: 1,
            },
            BatchEvent::JobCompleted {
                batch_id: "b1".into(),
                job_id: 1,
            },
            BatchEvent::BatchCompleted {
                batch_id: "b1".into(),
                summary: BatchSummary::default(),
            },
        ];
        for event in &events {
            assert_eq!(event.batch_id(), "b1");
        }
    }

    #[test]
    fn events_roundtrip() {
        let event = BatchEvent::BatchCompleted {
            batch_id: "b1".into(),
            summary: BatchSummary {
                total: 3,
                pending: 0,
                processing: 0,
                completed: 2,
                failed: 1,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: BatchEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.batch_id(), "b1");
    }
}
