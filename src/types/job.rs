//! Generation job types
//!
//! A job is one worksheet request travelling through the generation queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::catalog::{Grade, Topic};

/// Stable identifier of a job (and of its stored result)
pub type JobId = Uuid;

/// Lifecycle status of a generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl JobStatus {
    /// `success`, `error` and `cancelled` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error | JobStatus::Cancelled)
    }

    /// `pending` or `running`
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// One worksheet generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub id: JobId,
    pub status: JobStatus,
    /// Snapshot of the catalog topic at enqueue time
    pub topic: Topic,
    pub grade: Grade,
    pub subject_id: String,
    /// Model the user asked for when enqueuing, if any
    #[serde(default)]
    pub model_hint: Option<String>,
    /// One concrete prompt chosen instead of the topic's sample prompts
    #[serde(default)]
    pub specific_prompt: Option<String>,
    /// Model that ran (or is running) this job
    pub model_id: Option<String>,
    pub output: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GenerationJob {
    pub fn new(
        topic: Topic,
        grade: Grade,
        subject_id: impl Into<String>,
        model_hint: Option<String>,
        specific_prompt: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            topic,
            grade,
            subject_id: subject_id.into(),
            model_hint,
            specific_prompt,
            model_id: None,
            output: String::new(),
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// Archived snapshot of a successfully completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub topic: Topic,
    pub grade: Grade,
    pub subject_id: String,
    pub model_id: String,
    pub output: String,
}

impl StoredResult {
    pub fn from_job(job: &GenerationJob, model_id: &str, output: &str) -> Self {
        Self {
            id: job.id,
            created_at: job.created_at,
            topic: job.topic.clone(),
            grade: job.grade,
            subject_id: job.subject_id.clone(),
            model_id: model_id.to_string(),
            output: output.to_string(),
        }
    }
}
