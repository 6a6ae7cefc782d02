// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The job entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocator::{Allocation, ResourceRequest};

/// A job's position in its lifecycle. Terminal once `Completed`, `Failed`,
/// or `Cancelled` — no job ever transitions out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the priority queue, never yet allocated.
    Queued,
    /// Waiting in the priority queue after a failed attempt; `retry_count > 0`.
    Retrying,
    /// Holds a live `Allocation`.
    Running,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: exhausted retries, or failed validation, or timed out.
    Failed,
    /// Terminal: cancelled by request.
    Cancelled,
}

impl JobStatus {
    /// Whether a job in this state belongs in the priority queue.
    #[must_use]
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }

    /// Whether this state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A submitted unit of work, its request, and its current lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique id, assigned on submit if the caller left it blank.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Human-readable name.
    pub name: String,
    /// Job type tag (e.g. `"fine-tune"`, `"serve"`).
    pub job_type: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Scheduling priority; higher runs first.
    pub priority: i64,
    /// Resource shape this job needs.
    pub request: ResourceRequest,
    /// Free-form config blob, opaque to the orchestrator.
    pub config: serde_json::Value,
    /// The live allocation, present if and only if `status == Running`.
    pub allocation: Option<Allocation>,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Maximum attempts before giving up permanently.
    pub max_retries: u32,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the job most recently started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Reason the job failed or was denied, if applicable.
    pub error: Option<String>,
}

/// Fields a caller provides when submitting a job; everything else is
/// derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmissionRequest {
    /// Caller-supplied id; a fresh id is assigned if blank.
    #[serde(default)]
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Human-readable name.
    pub name: String,
    /// Job type tag.
    pub job_type: String,
    /// Scheduling priority; higher runs first.
    #[serde(default)]
    pub priority: i64,
    /// Resource shape this job needs.
    pub request: ResourceRequest,
    /// Free-form config blob.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Maximum attempts before giving up permanently. Defaults to zero.
    #[serde(default)]
    pub max_retries: u32,
}

impl Job {
    /// Build a freshly submitted job: `Queued`, no allocation, no retries
    /// consumed.
    #[must_use]
    pub fn from_submission(submission: JobSubmissionRequest, now: DateTime<Utc>) -> Self {
        let id = if submission.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            submission.id
        };
        Self {
            id,
            tenant_id: submission.tenant_id,
            name: submission.name,
            job_type: submission.job_type,
            status: JobStatus::Queued,
            priority: submission.priority,
            request: submission.request,
            config: submission.config,
            allocation: None,
            retry_count: 0,
            max_retries: submission.max_retries,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Transition to `Running` with `allocation`, stamping `started_at`.
    pub fn mark_running(&mut self, allocation: Allocation, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.allocation = Some(allocation);
        self.started_at = Some(now);
    }

    /// Transition to `Completed`, releasing the allocation reference.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.allocation = None;
        self.completed_at = Some(now);
    }

    /// Transition to `Cancelled`, releasing the allocation reference.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.allocation = None;
        self.completed_at = Some(now);
    }

    /// Record a failed attempt. Re-enqueues as `Retrying` at the same
    /// priority if `retry_count < max_retries`; otherwise transitions to
    /// the terminal `Failed` state.
    pub fn mark_failed_or_retry(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.allocation = None;
        self.error = Some(error.into());
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = JobStatus::Retrying;
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
        }
    }
}
