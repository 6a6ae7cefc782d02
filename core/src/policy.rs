// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The pluggable allow/deny hook consulted before a job is admitted.
//!
//! The orchestrator carries no policy-decision engine of its own; it
//! consumes a verdict from an external evaluator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The subset of a job submission a policy evaluator is shown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Tenant requesting the job.
    pub tenant_id: String,
    /// Job type tag.
    pub job_type: String,
    /// Free-form config blob, as submitted.
    pub config: serde_json::Value,
}

/// The verdict a [`PolicyEvaluator`] returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    /// The submission may proceed.
    Allow,
    /// The submission is rejected, with a human-readable reason.
    Deny(String),
}

/// Consulted by `Scheduler::submit` before a job is admitted to the queue.
///
/// An `Err` means the evaluator itself could not be reached; it is distinct
/// from `Ok(PolicyDecision::Deny(..))`, which is a considered verdict.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Evaluate `submission` and return a verdict, or an error describing
    /// why the evaluator could not be reached.
    async fn evaluate(&self, submission: &JobSubmission) -> Result<PolicyDecision, String>;
}

/// Allows every submission. Used in tests and when no evaluator is
/// configured.
#[derive(Debug, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyEvaluator for AllowAllPolicy {
    async fn evaluate(&self, _submission: &JobSubmission) -> Result<PolicyDecision, String> {
        Ok(PolicyDecision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_always_allows() {
        let policy = AllowAllPolicy;
        let submission = JobSubmission {
            tenant_id: "t1".into(),
            job_type: "fine-tune".into(),
            config: serde_json::json!({}),
        };
        assert_eq!(policy.evaluate(&submission).await, Ok(PolicyDecision::Allow));
    }
}
