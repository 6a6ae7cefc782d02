// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types shared by every component of the orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// The single error enum surfaced by Inventory, Quota, Allocator, Scheduler,
/// and the control surface.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum OrchestratorError {
    /// Missing required fields, negative counts, unknown state filter.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Job or node id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Tenant quota would be violated by this request.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No healthy node fits the request. Internal only — the scheduling
    /// tick catches this and re-queues the job rather than surfacing it.
    #[error("no suitable node available")]
    NoSuitableNode,

    /// The queued-phase wall-clock timeout (`max_wait_secs`) elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An allocator invariant was violated. Fatal for the current tick but
    /// never crashes the process.
    #[error("allocator invariant violated: {0}")]
    AllocatorInvariantViolated(String),

    /// A consulted dependency (policy evaluator) is unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The policy evaluator returned a deny verdict.
    #[error("policy denied: {0}")]
    PolicyDenied(String),
}

impl OrchestratorError {
    /// The HTTP status code this error maps to, per the error-handling design.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::QuotaExceeded(_) | Self::PolicyDenied(_) => 409,
            Self::NoSuitableNode | Self::DeadlineExceeded => 500,
            Self::AllocatorInvariantViolated(_) => 500,
            Self::Unavailable(_) => 503,
        }
    }

    /// A short machine-readable kind, used by the RPC layer and for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::NoSuitableNode => "no_suitable_node",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::AllocatorInvariantViolated(_) => "allocator_invariant_violated",
            Self::Unavailable(_) => "unavailable",
            Self::PolicyDenied(_) => "policy_denied",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_design() {
        assert_eq!(OrchestratorError::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(OrchestratorError::NotFound("x".into()).status_code(), 404);
        assert_eq!(OrchestratorError::QuotaExceeded("x".into()).status_code(), 409);
        assert_eq!(OrchestratorError::Unavailable("x".into()).status_code(), 503);
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(OrchestratorError::NotFound("j1".into()).kind(), "not_found");
    }
}
