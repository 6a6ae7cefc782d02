// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The RPC control surface: the same operations as the HTTP surface,
//! carried over protobuf messages with analogous field names, delegating
//! to the same in-process Scheduler and Allocator.

use std::sync::Arc;

use chrono::Utc;
use tonic::{Request, Response, Status};

use crate::allocator::{Allocation, ResourceRequest};
use crate::audit::{AuditEmitter, AuditEventKind};
use crate::error::OrchestratorError;
use crate::inventory::{Accelerator, AcceleratorType, Inventory, Node};
use crate::scheduler::{Job, JobStatus, JobSubmissionRequest, Scheduler};

#[allow(clippy::all, clippy::pedantic, clippy::nursery, missing_docs)]
pub mod proto {
    tonic::include_proto!("openlora.orchestrator.v1");
}

pub use proto::orchestrator_server::{Orchestrator, OrchestratorServer};

/// Implements the generated [`Orchestrator`] trait over the same Scheduler
/// and Inventory the HTTP surface delegates to.
pub struct OrchestratorRpc {
    scheduler: Arc<Scheduler>,
    inventory: Arc<Inventory>,
    audit: Arc<AuditEmitter>,
}

impl OrchestratorRpc {
    /// Build an RPC service over shared scheduler, inventory, and audit
    /// state.
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>, inventory: Arc<Inventory>, audit: Arc<AuditEmitter>) -> Self {
        Self { scheduler, inventory, audit }
    }

    /// Wrap `self` in the generated tonic server, ready to be added to a
    /// `tonic::transport::Server`.
    #[must_use]
    pub fn into_server(self) -> OrchestratorServer<Self> {
        OrchestratorServer::new(self)
    }
}

impl From<OrchestratorError> for Status {
    fn from(err: OrchestratorError) -> Self {
        let code = match &err {
            OrchestratorError::InvalidRequest(_) => tonic::Code::InvalidArgument,
            OrchestratorError::NotFound(_) => tonic::Code::NotFound,
            OrchestratorError::QuotaExceeded(_) | OrchestratorError::PolicyDenied(_) => tonic::Code::FailedPrecondition,
            OrchestratorError::Unavailable(_) => tonic::Code::Unavailable,
            OrchestratorError::NoSuitableNode
            | OrchestratorError::DeadlineExceeded
            | OrchestratorError::AllocatorInvariantViolated(_) => tonic::Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, Status> {
    match raw {
        "queued" => Ok(JobStatus::Queued),
        "retrying" => Ok(JobStatus::Retrying),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(Status::invalid_argument(format!("unknown state filter: {other}"))),
    }
}

fn status_tag(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Retrying => "retrying",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

impl From<proto::ResourceRequest> for ResourceRequest {
    fn from(value: proto::ResourceRequest) -> Self {
        Self {
            gpus: value.gpus,
            gpu_type: if value.gpu_type.is_empty() { None } else { Some(parse_accelerator_type(&value.gpu_type)) },
            memory_gb: value.memory_gb,
            cpus: value.cpus,
            max_wait_secs: if value.max_wait_secs == 0 { None } else { Some(value.max_wait_secs) },
        }
    }
}

fn parse_accelerator_type(raw: &str) -> AcceleratorType {
    match raw {
        "a100" => AcceleratorType::A100,
        "h100" => AcceleratorType::H100,
        "l40s" => AcceleratorType::L40S,
        "tpu_v4" => AcceleratorType::TpuV4,
        other => AcceleratorType::Other(other.to_string()),
    }
}

fn accelerator_type_tag(kind: &AcceleratorType) -> String {
    match kind {
        AcceleratorType::A100 => "a100".to_string(),
        AcceleratorType::H100 => "h100".to_string(),
        AcceleratorType::L40S => "l40s".to_string(),
        AcceleratorType::TpuV4 => "tpu_v4".to_string(),
        AcceleratorType::Other(other) => other.clone(),
    }
}

fn allocation_to_proto(allocation: &Allocation) -> proto::Allocation {
    proto::Allocation {
        id: allocation.id.clone(),
        job_id: allocation.job_id.clone(),
        tenant_id: allocation.tenant_id.clone(),
        node_id: allocation.node_id.clone(),
        accelerator_ids: allocation.accelerator_ids.clone(),
        memory_gb: allocation.memory_gb,
        cpus: allocation.cpus,
        created_at: allocation.created_at.to_rfc3339(),
    }
}

fn job_to_proto(job: &Job) -> proto::Job {
    proto::Job {
        id: job.id.clone(),
        tenant_id: job.tenant_id.clone(),
        name: job.name.clone(),
        job_type: job.job_type.clone(),
        status: status_tag(job.status).to_string(),
        priority: job.priority,
        request: Some(proto::ResourceRequest {
            gpus: job.request.gpus,
            gpu_type: job.request.gpu_type.as_ref().map(accelerator_type_tag).unwrap_or_default(),
            memory_gb: job.request.memory_gb,
            cpus: job.request.cpus,
            max_wait_secs: job.request.max_wait_secs.unwrap_or(0),
        }),
        config_json: job.config.to_string(),
        allocation: job.allocation.as_ref().map(allocation_to_proto),
        retry_count: job.retry_count,
        max_retries: job.max_retries,
        created_at: job.created_at.to_rfc3339(),
        started_at: job.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        completed_at: job.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        error: job.error.clone().unwrap_or_default(),
    }
}

#[tonic::async_trait]
impl Orchestrator for OrchestratorRpc {
    async fn health(&self, _request: Request<proto::HealthRequest>) -> Result<Response<proto::HealthResponse>, Status> {
        let status = if self.scheduler.is_live() { "healthy" } else { "degraded" };
        Ok(Response::new(proto::HealthResponse { status: status.to_string() }))
    }

    async fn submit_job(
        &self,
        request: Request<proto::SubmitJobRequest>,
    ) -> Result<Response<proto::SubmitJobResponse>, Status> {
        let req = request.into_inner();
        let config = if req.config_json.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&req.config_json)
                .map_err(|e| Status::invalid_argument(format!("invalid config_json: {e}")))?
        };
        let submission = JobSubmissionRequest {
            id: req.id,
            tenant_id: req.tenant_id,
            name: req.name,
            job_type: req.job_type,
            priority: req.priority,
            request: req.request.ok_or_else(|| Status::invalid_argument("request is required"))?.into(),
            config,
            max_retries: req.max_retries,
        };
        let job_id = self.scheduler.submit(submission).await?;
        Ok(Response::new(proto::SubmitJobResponse { job_id }))
    }

    async fn get_job(&self, request: Request<proto::GetJobRequest>) -> Result<Response<proto::Job>, Status> {
        let req = request.into_inner();
        let job = self
            .scheduler
            .get(&req.job_id)
            .ok_or_else(|| Status::from(OrchestratorError::NotFound(format!("job {}", req.job_id))))?;
        Ok(Response::new(job_to_proto(&job)))
    }

    async fn list_jobs(
        &self,
        request: Request<proto::ListJobsRequest>,
    ) -> Result<Response<proto::ListJobsResponse>, Status> {
        let req = request.into_inner();
        let filter = if req.state.is_empty() { None } else { Some(parse_status(&req.state)?) };
        let jobs = self.scheduler.list(filter).iter().map(job_to_proto).collect();
        Ok(Response::new(proto::ListJobsResponse { jobs }))
    }

    async fn cancel_job(
        &self,
        request: Request<proto::CancelJobRequest>,
    ) -> Result<Response<proto::CancelJobResponse>, Status> {
        let req = request.into_inner();
        self.scheduler.cancel(&req.job_id)?;
        Ok(Response::new(proto::CancelJobResponse { success: true }))
    }

    async fn complete_job(
        &self,
        request: Request<proto::CompleteJobRequest>,
    ) -> Result<Response<proto::CompleteJobResponse>, Status> {
        let req = request.into_inner();
        let error = if req.error.is_empty() { None } else { Some(req.error) };
        self.scheduler.complete(&req.job_id, error)?;
        Ok(Response::new(proto::CompleteJobResponse { success: true }))
    }

    async fn dequeue_job(
        &self,
        request: Request<proto::DequeueJobRequest>,
    ) -> Result<Response<proto::DequeueJobResponse>, Status> {
        let req = request.into_inner();
        let available: ResourceRequest =
            req.available.ok_or_else(|| Status::invalid_argument("available is required"))?.into();
        let job = self.scheduler.dequeue_for_worker(&req.node_id, &available)?;
        Ok(Response::new(proto::DequeueJobResponse { job: job.as_ref().map(job_to_proto) }))
    }

    async fn register_node(
        &self,
        request: Request<proto::RegisterNodeRequest>,
    ) -> Result<Response<proto::RegisterNodeResponse>, Status> {
        let req = request.into_inner();
        let node_id = req.id.clone();
        let now = Utc::now();
        let accelerators = req
            .accelerators
            .into_iter()
            .map(|spec| Accelerator {
                id: spec.id,
                node_id: node_id.clone(),
                accelerator_type: parse_accelerator_type(&spec.accelerator_type),
                memory_gb: spec.memory_gb,
                allocated: false,
                holding_job_id: None,
            })
            .collect();
        let node = Node::new(req.id, req.address, accelerators, req.total_memory_gb, req.total_cpus, now);
        self.inventory.register_node(node, now);
        self.audit.emit(&node_id, AuditEventKind::NodeRegistered, serde_json::json!({"node_id": node_id}));
        Ok(Response::new(proto::RegisterNodeResponse { node_id }))
    }

    async fn cluster_status(
        &self,
        _request: Request<proto::ClusterStatusRequest>,
    ) -> Result<Response<proto::ClusterStatusResponse>, Status> {
        let snapshot = self.inventory.snapshot();
        let jobs = self.scheduler.list(None);
        let counts = crate::api::models::JobStatusCounts::tally(&jobs);
        Ok(Response::new(proto::ClusterStatusResponse {
            total_accelerators: snapshot.total_accelerators as u64,
            used_accelerators: snapshot.used_accelerators as u64,
            healthy_nodes: snapshot.healthy_nodes as u64,
            total_nodes: snapshot.total_nodes as u64,
            utilization: snapshot.utilization,
            queued: counts.queued as u32,
            retrying: counts.retrying as u32,
            running: counts.running as u32,
            completed: counts.completed as u32,
            failed: counts.failed as u32,
            cancelled: counts.cancelled as u32,
        }))
    }
}
