// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Request and response bodies for the HTTP and RPC control surfaces.
//! Both surfaces share these shapes; the RPC layer carries the same fields
//! over protobuf messages with analogous names.

use serde::{Deserialize, Serialize};

use crate::allocator::ResourceRequest;
use crate::inventory::{Accelerator, InventorySnapshot, Node};
use crate::scheduler::{Job, JobStatus};

/// `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"healthy"` if the scheduling tick has run within the last 5s.
    pub status: String,
}

/// `GET /status` response: an aggregated cluster snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatusResponse {
    /// Inventory-wide capacity and utilization snapshot.
    pub inventory: InventorySnapshot,
    /// Count of jobs in each terminal/non-terminal state.
    pub jobs_by_status: JobStatusCounts,
}

/// A per-status tally of jobs, used in cluster status responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatusCounts {
    /// Jobs waiting in the queue, never yet allocated.
    pub queued: usize,
    /// Jobs waiting in the queue after a failed attempt.
    pub retrying: usize,
    /// Jobs holding a live allocation.
    pub running: usize,
    /// Jobs that finished successfully.
    pub completed: usize,
    /// Jobs that exhausted retries or failed validation.
    pub failed: usize,
    /// Jobs cancelled by request.
    pub cancelled: usize,
}

impl JobStatusCounts {
    /// Tally `jobs` into per-status counts.
    #[must_use]
    pub fn tally(jobs: &[Job]) -> Self {
        let mut counts = Self::default();
        for job in jobs {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Retrying => counts.retrying += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

/// `GET /jobs?state=<state>` query parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ListJobsQuery {
    /// Optional status filter, matched case-sensitively against the
    /// lowercase `snake_case` status name (e.g. `"running"`).
    pub state: Option<String>,
}

/// `POST /jobs/submit` response.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitJobResponse {
    /// The id assigned to the newly queued job.
    pub job_id: String,
}

/// `POST /jobs/cancel` response.
#[derive(Debug, Clone, Serialize)]
pub struct CancelJobResponse {
    /// Whether the cancel request succeeded.
    pub success: bool,
}

/// The capacity a worker declares when pulling work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableCapacity {
    /// Accelerators the worker can offer right now.
    pub gpus: u32,
    /// Memory, in gigabytes, the worker can offer right now.
    pub memory_gb: u32,
    /// CPU cores the worker can offer right now.
    pub cpus: u32,
}

impl From<AvailableCapacity> for ResourceRequest {
    fn from(value: AvailableCapacity) -> Self {
        Self {
            gpus: value.gpus,
            gpu_type: None,
            memory_gb: value.memory_gb,
            cpus: value.cpus,
            max_wait_secs: None,
        }
    }
}

/// `POST /jobs/dequeue` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct DequeueRequest {
    /// The worker asking for work.
    pub worker_id: String,
    /// The node the worker runs on; the allocation, if any, binds here.
    pub node_id: String,
    /// What the worker can currently offer.
    pub available: AvailableCapacity,
}

/// `POST /jobs/dequeue` response. `job` is `null` if nothing fit.
#[derive(Debug, Clone, Serialize)]
pub struct DequeueResponse {
    /// The job bound to this worker's node, if one was found.
    pub job: Option<Job>,
}

/// `POST /jobs/complete` request body — the worker's completion callback.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteJobRequest {
    /// Present and non-empty on failure; absent on success.
    pub error: Option<String>,
}

/// An accelerator as declared at node-registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorSpec {
    /// Unique id, scoped to the node.
    pub id: String,
    /// Device kind.
    pub accelerator_type: crate::inventory::AcceleratorType,
    /// Onboard memory, in gigabytes.
    pub memory_gb: u32,
}

/// `POST /nodes/register` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterNodeRequest {
    /// Unique id. Re-registering an existing id is idempotent.
    pub id: String,
    /// Network address.
    pub address: String,
    /// Accelerators attached to this node.
    pub accelerators: Vec<AcceleratorSpec>,
    /// Total memory, in gigabytes.
    pub total_memory_gb: u32,
    /// Total CPU cores.
    pub total_cpus: u32,
}

impl RegisterNodeRequest {
    /// Build the [`Node`] this request describes, stamping fresh
    /// accelerator state (any prior allocation flags are preserved by
    /// `Inventory::register_node`, not by this conversion).
    #[must_use]
    pub fn into_node(self, now: chrono::DateTime<chrono::Utc>) -> Node {
        let accelerators = self
            .accelerators
            .into_iter()
            .map(|spec| Accelerator {
                id: spec.id,
                node_id: self.id.clone(),
                accelerator_type: spec.accelerator_type,
                memory_gb: spec.memory_gb,
                allocated: false,
                holding_job_id: None,
            })
            .collect();
        Node::new(self.id, self.address, accelerators, self.total_memory_gb, self.total_cpus, now)
    }
}

/// `POST /nodes/register` response.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterNodeResponse {
    /// Echoes the registered node's id.
    pub node_id: String,
}

/// `GET /nodes` / `GET /workers` response: nodes sorted by id.
#[derive(Debug, Clone, Serialize)]
pub struct ListNodesResponse {
    /// Every known node.
    pub nodes: Vec<Node>,
}
