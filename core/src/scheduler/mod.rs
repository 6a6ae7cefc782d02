// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The Scheduler: owns the job registry, runs the periodic scheduling
//! tick, and mediates the job lifecycle.

mod job;
mod queue;

pub use job::{Job, JobStatus, JobSubmissionRequest};
pub use queue::JobQueue;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::allocator::{Allocation, Allocator, ResourceRequest};
use crate::audit::{AuditEmitter, AuditEventKind};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::policy::{JobSubmission, PolicyDecision, PolicyEvaluator};
use crate::quota::QuotaLedger;

/// `L_sched`: the job registry and the priority queue, held together.
struct SchedulerInner {
    jobs: HashMap<String, Job>,
    queue: JobQueue,
}

/// Owns the job registry, runs the scheduling tick, and mediates the job
/// lifecycle described by [`JobStatus`].
pub struct Scheduler {
    allocator: Arc<Allocator>,
    quota: Arc<QuotaLedger>,
    policy: Arc<dyn PolicyEvaluator>,
    policy_fail_open: bool,
    audit: Arc<AuditEmitter>,
    inner: Mutex<SchedulerInner>,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
}

impl Scheduler {
    /// Build a scheduler over shared allocator, quota, policy, and audit
    /// state.
    #[must_use]
    pub fn new(
        allocator: Arc<Allocator>,
        quota: Arc<QuotaLedger>,
        policy: Arc<dyn PolicyEvaluator>,
        policy_fail_open: bool,
        audit: Arc<AuditEmitter>,
    ) -> Self {
        Self {
            allocator,
            quota,
            policy,
            policy_fail_open,
            audit,
            inner: Mutex::new(SchedulerInner {
                jobs: HashMap::new(),
                queue: JobQueue::new(),
            }),
            last_tick_at: RwLock::new(None),
        }
    }

    /// Admit `submission`: consults the policy hook, rejects requests that
    /// cannot possibly fit the tenant's quota maxima, then pushes the job
    /// onto the queue. Returns the assigned job id.
    pub async fn submit(&self, submission: JobSubmissionRequest) -> OrchestratorResult<String> {
        let verdict = JobSubmission {
            tenant_id: submission.tenant_id.clone(),
            job_type: submission.job_type.clone(),
            config: submission.config.clone(),
        };
        match self.policy.evaluate(&verdict).await {
            Ok(PolicyDecision::Allow) => {}
            Ok(PolicyDecision::Deny(reason)) => return Err(OrchestratorError::PolicyDenied(reason)),
            Err(reason) if self.policy_fail_open => {
                tracing::warn!(%reason, "policy evaluator unreachable, failing open");
            }
            Err(reason) => return Err(OrchestratorError::Unavailable(reason)),
        }

        if self
            .quota
            .exceeds_maxima(&submission.tenant_id, submission.request.gpus, submission.request.memory_gb)
        {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "tenant {} quota cannot satisfy this request at all",
                submission.tenant_id
            )));
        }

        let now = Utc::now();
        let job = Job::from_submission(submission, now);
        let job_id = job.id.clone();

        let mut inner = self.inner.lock();
        inner.queue.push(job_id.clone(), job.priority, job.created_at);
        inner.jobs.insert(job_id.clone(), job);
        drop(inner);

        self.audit.emit(&job_id, AuditEventKind::JobSubmitted, json!({}));
        Ok(job_id)
    }

    /// Cancel `job_id`. Legal from `Queued`, `Retrying`, or `Running`. If
    /// running, the allocation is released before the handler returns.
    pub fn cancel(&self, job_id: &str) -> OrchestratorResult<()> {
        let status = {
            let inner = self.inner.lock();
            inner
                .jobs
                .get(job_id)
                .map(|j| j.status)
                .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))?
        };

        if status.is_terminal() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "job {job_id} is already in a terminal state"
            )));
        }

        if status.is_queued() {
            let mut inner = self.inner.lock();
            inner.queue.remove(job_id);
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.mark_cancelled(Utc::now());
            }
        } else {
            // status == Running: release the allocation with L_sched
            // dropped, then reacquire it to record the terminal state.
            let allocation_id = {
                let inner = self.inner.lock();
                inner.jobs.get(job_id).and_then(|j| j.allocation.as_ref()).map(|a| a.id.clone())
            };
            if let Some(allocation_id) = allocation_id {
                self.allocator.release(&allocation_id)?;
            }
            let mut inner = self.inner.lock();
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.mark_cancelled(Utc::now());
            }
        }

        self.audit.emit(job_id, AuditEventKind::JobCancelled, json!({}));
        Ok(())
    }

    /// Record the outcome of a running job, called by the worker or by the
    /// reaper. A no-op, idempotent `NotFound` if the job is not currently
    /// `Running` (e.g. it was already cancelled).
    pub fn complete(&self, job_id: &str, error: Option<String>) -> OrchestratorResult<()> {
        let allocation = {
            let inner = self.inner.lock();
            match inner.jobs.get(job_id) {
                Some(job) if job.status == JobStatus::Running => job.allocation.clone(),
                _ => return Err(OrchestratorError::NotFound(format!("running job {job_id}"))),
            }
        };

        if let Some(allocation) = allocation {
            self.allocator.release(&allocation.id)?;
        }

        let now = Utc::now();
        match error {
            None => {
                let mut inner = self.inner.lock();
                if let Some(job) = inner.jobs.get_mut(job_id) {
                    job.mark_completed(now);
                }
                self.audit.emit(job_id, AuditEventKind::JobCompleted, json!({}));
            }
            Some(reason) => {
                let mut inner = self.inner.lock();
                if let Some(job) = inner.jobs.get_mut(job_id) {
                    job.mark_failed_or_retry(reason, now);
                    if job.status == JobStatus::Retrying {
                        inner.queue.push(job_id.to_string(), job.priority, job.created_at);
                    }
                }
                self.audit.emit(job_id, AuditEventKind::JobFailed, json!({}));
            }
        }
        Ok(())
    }

    /// Repopulate the job registry and queue from a checkpoint. Jobs whose
    /// status is `Queued` or `Retrying` are pushed onto the heap at their
    /// original priority and `created_at`, preserving ordering; `Running`
    /// and terminal jobs are registered but not re-queued — a `Running` job
    /// is reconciled the same way any other node-loss job would be, via the
    /// reaper, once its node either re-heartbeats or is reaped.
    pub fn restore(&self, jobs: Vec<Job>) {
        let mut inner = self.inner.lock();
        for job in jobs {
            if job.status.is_queued() {
                inner.queue.push(job.id.clone(), job.priority, job.created_at);
            }
            inner.jobs.insert(job.id.clone(), job);
        }
    }

    /// Look up a job by id.
    #[must_use]
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.lock().jobs.get(job_id).cloned()
    }

    /// All jobs, optionally filtered by status.
    #[must_use]
    pub fn list(&self, status_filter: Option<JobStatus>) -> Vec<Job> {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|j| status_filter.is_none_or_eq(j.status))
            .cloned()
            .collect()
    }

    /// Whether the scheduling tick has run within the last 5 seconds, used
    /// by the liveness probe.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.last_tick_at
            .read()
            .is_some_and(|t| (Utc::now() - t).num_seconds() < 5)
    }

    /// Run one scheduling tick: drain the queue in priority order, stopping
    /// at the first `NoSuitableNode` (head-of-line blocking) but skipping
    /// past `QuotaExceeded` (tenant-local, must not block others).
    pub fn tick(&self) {
        let now = Utc::now();

        loop {
            let job_id = {
                let mut inner = self.inner.lock();
                inner.queue.pop()
            };
            let Some(job_id) = job_id else { break };

            let job = {
                let inner = self.inner.lock();
                inner.jobs.get(&job_id).cloned()
            };
            let Some(job) = job else { continue };

            if let Some(max_wait) = job.request.max_wait_secs {
                if (now - job.created_at).num_seconds() as u64 > max_wait {
                    self.finish_as_deadline_exceeded(&job_id, now);
                    continue;
                }
            }

            // L_sched is released above; allocate() acquires L_alloc here,
            // never both locks at once except by this release/reacquire.
            match self.allocator.allocate(&job.request, &job.tenant_id, &job_id) {
                Ok(allocation) => self.finish_as_running(&job_id, allocation, now),
                Err(OrchestratorError::NoSuitableNode) => {
                    self.requeue(&job_id, job.priority, job.created_at);
                    break;
                }
                Err(OrchestratorError::QuotaExceeded(reason)) => {
                    tracing::debug!(job_id = %job_id, %reason, "quota exceeded, trying next job");
                    self.requeue(&job_id, job.priority, job.created_at);
                }
                Err(OrchestratorError::InvalidRequest(reason)) => {
                    self.finish_as_failed(&job_id, reason, now);
                }
                Err(other) => {
                    tracing::error!(job_id = %job_id, error = %other, "unexpected allocator error during tick");
                    self.requeue(&job_id, job.priority, job.created_at);
                }
            }
        }

        *self.last_tick_at.write() = Some(now);
    }

    fn requeue(&self, job_id: &str, priority: i64, created_at: DateTime<Utc>) {
        self.inner.lock().queue.push(job_id.to_string(), priority, created_at);
    }

    fn finish_as_running(&self, job_id: &str, allocation: Allocation, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.mark_running(allocation, now);
        }
        drop(inner);
        self.audit.emit(job_id, AuditEventKind::JobStarted, json!({}));
    }

    fn finish_as_failed(&self, job_id: &str, reason: String, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.error = Some(reason);
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
        }
        drop(inner);
        self.audit.emit(job_id, AuditEventKind::JobFailed, json!({}));
    }

    fn finish_as_deadline_exceeded(&self, job_id: &str, now: DateTime<Utc>) {
        self.finish_as_failed(job_id, "deadline_exceeded".to_string(), now);
    }

    /// The worker-pull path: pop the first queued job whose request fits
    /// `available` on `node_id`, binding an allocation to that node.
    /// Functionally equivalent to `tick`'s push path, parameterized by the
    /// caller's declared capacity instead of a scan over Inventory.
    pub fn dequeue_for_worker(
        &self,
        node_id: &str,
        available: &ResourceRequest,
    ) -> OrchestratorResult<Option<Job>> {
        let mut deferred = Vec::new();
        let candidate = loop {
            let job_id = {
                let mut inner = self.inner.lock();
                inner.queue.pop()
            };
            let Some(job_id) = job_id else { break None };
            let job = {
                let inner = self.inner.lock();
                inner.jobs.get(&job_id).cloned()
            };
            let Some(job) = job else { continue };

            if fits(&job.request, available) {
                break Some(job);
            }
            deferred.push((job_id, job.priority, job.created_at));
        };

        for (job_id, priority, created_at) in deferred {
            self.requeue(&job_id, priority, created_at);
        }

        let Some(job) = candidate else { return Ok(None) };

        match self.allocator.allocate_on_node(node_id, &job.request, &job.tenant_id, &job.id) {
            Ok(allocation) => {
                let now = Utc::now();
                self.finish_as_running(&job.id, allocation, now);
                Ok(self.get(&job.id))
            }
            Err(err) => {
                self.requeue(&job.id, job.priority, job.created_at);
                Err(err)
            }
        }
    }
}

fn fits(request: &ResourceRequest, available: &ResourceRequest) -> bool {
    let type_ok = match (&request.gpu_type, &available.gpu_type) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(req_t), Some(avail_t)) => req_t == avail_t,
    };
    type_ok && request.gpus <= available.gpus && request.memory_gb <= available.memory_gb && request.cpus <= available.cpus
}

trait OptionStatusExt {
    fn is_none_or_eq(&self, status: JobStatus) -> bool;
}

impl OptionStatusExt for Option<JobStatus> {
    fn is_none_or_eq(&self, status: JobStatus) -> bool {
        match self {
            None => true,
            Some(s) => *s == status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEmitter;
    use crate::inventory::{Accelerator, AcceleratorType, Inventory, Node};
    use crate::policy::AllowAllPolicy;

    fn accel(id: &str, node_id: &str) -> Accelerator {
        Accelerator {
            id: id.into(),
            node_id: node_id.into(),
            accelerator_type: AcceleratorType::A100,
            memory_gb: 80,
            allocated: false,
            holding_job_id: None,
        }
    }

    fn request(gpus: u32) -> ResourceRequest {
        ResourceRequest {
            gpus,
            gpu_type: None,
            memory_gb: 0,
            cpus: 0,
            max_wait_secs: None,
        }
    }

    fn submission(name: &str, tenant: &str, priority: i64, gpus: u32) -> JobSubmissionRequest {
        JobSubmissionRequest {
            id: String::new(),
            tenant_id: tenant.into(),
            name: name.into(),
            job_type: "fine-tune".into(),
            priority,
            request: request(gpus),
            config: serde_json::json!({}),
            max_retries: 0,
        }
    }

    fn scheduler_with_node(gpus: usize) -> Scheduler {
        let inventory = Arc::new(Inventory::new());
        let now = Utc::now();
        let accelerators: Vec<_> = (0..gpus).map(|i| accel(&format!("g{i}"), "n1")).collect();
        inventory.register_node(Node::new("n1", "addr", accelerators, 512, 64, now), now);
        let quota = Arc::new(QuotaLedger::new());
        let audit = Arc::new(AuditEmitter::default());
        let allocator = Arc::new(Allocator::new(inventory, quota.clone(), audit.clone()));
        Scheduler::new(allocator, quota, Arc::new(AllowAllPolicy), false, audit)
    }

    #[tokio::test]
    async fn happy_path_single_job_runs_after_one_tick() {
        let scheduler = scheduler_with_node(4);
        let id = scheduler.submit(submission("j1", "t1", 1, 2)).await.unwrap();

        scheduler.tick();
        let job = scheduler.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Running);

        scheduler.complete(&id, None).unwrap();
        assert_eq!(scheduler.get(&id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn higher_priority_runs_first_on_single_gpu_node() {
        let scheduler = scheduler_with_node(1);
        let a = scheduler.submit(submission("jA", "t1", 1, 1)).await.unwrap();
        let b = scheduler.submit(submission("jB", "t1", 5, 1)).await.unwrap();
        let c = scheduler.submit(submission("jC", "t1", 5, 1)).await.unwrap();

        scheduler.tick();
        assert_eq!(scheduler.get(&b).unwrap().status, JobStatus::Running);
        assert_eq!(scheduler.get(&a).unwrap().status, JobStatus::Queued);
        assert_eq!(scheduler.get(&c).unwrap().status, JobStatus::Queued);

        scheduler.complete(&b, None).unwrap();
        scheduler.tick();
        assert_eq!(scheduler.get(&c).unwrap().status, JobStatus::Running, "jC has higher priority than jA");
    }

    #[tokio::test]
    async fn head_of_line_block_on_no_suitable_node() {
        let scheduler = scheduler_with_node(1);
        let big = scheduler.submit(submission("jBig", "t1", 5, 2)).await.unwrap();
        let small = scheduler.submit(submission("jSmall", "t1", 1, 1)).await.unwrap();

        scheduler.tick();
        assert_eq!(scheduler.get(&big).unwrap().status, JobStatus::Queued);
        assert_eq!(scheduler.get(&small).unwrap().status, JobStatus::Queued, "blocked behind jBig");
    }

    #[tokio::test]
    async fn quota_exceeded_does_not_block_other_tenants() {
        let scheduler = scheduler_with_node(2);
        scheduler.quota.set_quota("t1", crate::quota::Quota::new(0, 1_000_000));

        let blocked = scheduler.submit(submission("j1", "t1", 5, 1)).await.unwrap();
        let other = scheduler.submit(submission("j2", "t2", 1, 1)).await.unwrap();

        scheduler.tick();
        assert_eq!(scheduler.get(&blocked).unwrap().status, JobStatus::Queued);
        assert_eq!(scheduler.get(&other).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn cancel_while_running_releases_allocation_and_completion_is_idempotent() {
        let scheduler = scheduler_with_node(1);
        let id = scheduler.submit(submission("j1", "t1", 1, 1)).await.unwrap();
        scheduler.tick();
        assert_eq!(scheduler.get(&id).unwrap().status, JobStatus::Running);

        scheduler.cancel(&id).unwrap();
        assert_eq!(scheduler.get(&id).unwrap().status, JobStatus::Cancelled);

        let err = scheduler.complete(&id, None).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn restore_requeues_only_queued_and_retrying_jobs() {
        let scheduler = scheduler_with_node(4);
        let mut queued = Job::from_submission(submission("queued", "t1", 1, 1), Utc::now());
        queued.status = JobStatus::Queued;
        let mut completed = Job::from_submission(submission("done", "t1", 1, 1), Utc::now());
        completed.status = JobStatus::Completed;
        completed.completed_at = Some(Utc::now());

        scheduler.restore(vec![queued.clone(), completed.clone()]);

        assert_eq!(scheduler.get(&queued.id).unwrap().status, JobStatus::Queued);
        assert_eq!(scheduler.get(&completed.id).unwrap().status, JobStatus::Completed);

        scheduler.tick();
        assert_eq!(scheduler.get(&queued.id).unwrap().status, JobStatus::Running, "restored queued job is schedulable");
    }

    #[tokio::test]
    async fn retry_reenqueues_at_same_priority() {
        let scheduler = scheduler_with_node(1);
        let mut sub = submission("j1", "t1", 3, 1);
        sub.max_retries = 1;
        let id = scheduler.submit(sub).await.unwrap();

        scheduler.tick();
        scheduler.complete(&id, Some("transient".into())).unwrap();
        assert_eq!(scheduler.get(&id).unwrap().status, JobStatus::Retrying);
        assert_eq!(scheduler.get(&id).unwrap().retry_count, 1);

        scheduler.tick();
        assert_eq!(scheduler.get(&id).unwrap().status, JobStatus::Running, "retried job is re-admitted");
    }
}
