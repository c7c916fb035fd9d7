use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use serde_json::{json, Value};

use crate::search::ApiError;

/// Server-pushed ingestion event. Progress events carry only the blended
/// fraction; the terminal events are tagged so clients can tell them apart.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress(f64),
    Completed,
    Failed(String),
}

impl JobEvent {
    pub fn to_payload(&self) -> Value {
        match self {
            JobEvent::Progress(progress) => json!({ "progress": progress }),
            JobEvent::Completed => json!({ "type": "completed" }),
            JobEvent::Failed(message) => json!({ "type": "failed", "message": message }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStateTag {
    Queued,
    Uploading,
    Indexing,
    Done,
    Failed,
}

/// Point-query view of a job, for subscribers that attach after the fact.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub state: JobStateTag,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_study_uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type JobEventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

#[async_trait]
pub trait IngestProvider: Send + Sync + 'static {
    /// Accepts an ingestion request and returns the minted job id without
    /// waiting for the pipeline.
    async fn enqueue(&self, files: Vec<PathBuf>) -> Result<String, ApiError>;

    /// Remaining event sequence for a job; `None` for ids the runner does
    /// not know, so callers can 404 instead of waiting on silence.
    fn subscribe(&self, job_id: &str) -> Option<JobEventStream>;

    fn job(&self, job_id: &str) -> Option<JobSnapshot>;

    /// Requests cancellation of an in-flight job. Returns false for unknown
    /// ids or jobs that already reached a terminal state.
    fn cancel(&self, job_id: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payloads_match_wire_shape() {
        assert_eq!(
            JobEvent::Progress(0.25).to_payload(),
            json!({ "progress": 0.25 })
        );
        assert_eq!(JobEvent::Completed.to_payload(), json!({ "type": "completed" }));
        assert_eq!(
            JobEvent::Failed("upload failed".to_string()).to_payload(),
            json!({ "type": "failed", "message": "upload failed" })
        );
    }

    #[test]
    fn only_progress_is_non_terminal() {
        assert!(!JobEvent::Progress(0.0).is_terminal());
        assert!(JobEvent::Completed.is_terminal());
        assert!(JobEvent::Failed(String::new()).is_terminal());
    }
}
