// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The HTTP control surface: JSON over HTTP/1.1, delegating to the same
//! in-process Scheduler and Allocator the RPC surface uses.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::error::ApiResult;
use crate::api::models::{
    CancelJobResponse, ClusterStatusResponse, CompleteJobRequest, DequeueRequest, DequeueResponse, HealthResponse,
    JobStatusCounts, ListJobsQuery, ListNodesResponse, RegisterNodeRequest, RegisterNodeResponse, SubmitJobResponse,
};
use crate::audit::{AuditEmitter, AuditEventKind};
use crate::error::OrchestratorError;
use crate::inventory::Inventory;
use crate::scheduler::{Job, JobStatus, JobSubmissionRequest, Scheduler};

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    /// The scheduler every handler delegates to.
    pub scheduler: Arc<Scheduler>,
    /// The inventory backing node registration and status queries.
    pub inventory: Arc<Inventory>,
    /// Emits `node_registered` on successful registration; every other
    /// audited state change already happens inside the Scheduler/Allocator.
    pub audit: Arc<AuditEmitter>,
}

/// Build the HTTP router. Bind it with `axum::serve` at `HTTP_PORT`.
///
/// This is an in-cluster control surface, not a public API gateway — CORS is
/// wide open rather than origin-restricted, and `TraceLayer` gives every
/// request a span correlated with the rest of the orchestrator's structured
/// logs.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/jobs", get(list_jobs))
        .route("/jobs/submit", post(submit_job))
        .route("/jobs/dequeue", post(dequeue_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/complete", post(complete_job))
        .route("/nodes/register", post(register_node))
        .route("/nodes", get(list_nodes))
        .route("/workers", get(list_nodes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.scheduler.is_live() { "healthy" } else { "degraded" };
    Json(HealthResponse { status: status.to_string() })
}

async fn status(State(state): State<AppState>) -> Json<ClusterStatusResponse> {
    let jobs = state.scheduler.list(None);
    Json(ClusterStatusResponse {
        inventory: state.inventory.snapshot(),
        jobs_by_status: JobStatusCounts::tally(&jobs),
    })
}

async fn list_jobs(State(state): State<AppState>, Query(query): Query<ListJobsQuery>) -> ApiResult<Json<Vec<Job>>> {
    let filter = query.state.map(|s| parse_status(&s)).transpose()?;
    Ok(Json(state.scheduler.list(filter)))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    state
        .scheduler
        .get(&id)
        .map(Json)
        .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")).into())
}

async fn submit_job(
    State(state): State<AppState>,
    Json(submission): Json<JobSubmissionRequest>,
) -> ApiResult<Json<SubmitJobResponse>> {
    let job_id = state.scheduler.submit(submission).await?;
    Ok(Json(SubmitJobResponse { job_id }))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<CancelJobResponse>> {
    state.scheduler.cancel(&id)?;
    Ok(Json(CancelJobResponse { success: true }))
}

async fn complete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CompleteJobRequest>,
) -> ApiResult<Json<CancelJobResponse>> {
    state.scheduler.complete(&id, body.error)?;
    Ok(Json(CancelJobResponse { success: true }))
}

async fn dequeue_job(
    State(state): State<AppState>,
    Json(request): Json<DequeueRequest>,
) -> ApiResult<Json<DequeueResponse>> {
    let job = state
        .scheduler
        .dequeue_for_worker(&request.node_id, &request.available.into())?;
    Ok(Json(DequeueResponse { job }))
}

async fn register_node(
    State(state): State<AppState>,
    Json(request): Json<RegisterNodeRequest>,
) -> Json<RegisterNodeResponse> {
    let node_id = request.id.clone();
    state.inventory.register_node(request.into_node(Utc::now()), Utc::now());
    state.audit.emit(&node_id, AuditEventKind::NodeRegistered, serde_json::json!({"node_id": node_id}));
    Json(RegisterNodeResponse { node_id })
}

async fn list_nodes(State(state): State<AppState>) -> Json<ListNodesResponse> {
    Json(ListNodesResponse { nodes: state.inventory.list_sorted() })
}

fn parse_status(raw: &str) -> Result<JobStatus, OrchestratorError> {
    match raw {
        "queued" => Ok(JobStatus::Queued),
        "retrying" => Ok(JobStatus::Retrying),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "cancelled" => Ok(JobStatus::Cancelled),
        other => Err(OrchestratorError::InvalidRequest(format!("unknown state filter: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{Allocator, ResourceRequest};
    use crate::audit::AuditEmitter;
    use crate::inventory::{Accelerator, AcceleratorType, Node};
    use crate::policy::AllowAllPolicy;
    use crate::quota::QuotaLedger;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let inventory = Arc::new(Inventory::new());
        let now = Utc::now();
        inventory.register_node(
            Node::new(
                "n1",
                "addr",
                vec![Accelerator {
                    id: "g0".into(),
                    node_id: "n1".into(),
                    accelerator_type: AcceleratorType::A100,
                    memory_gb: 80,
                    allocated: false,
                    holding_job_id: None,
                }],
                512,
                64,
                now,
            ),
            now,
        );
        let quota = Arc::new(QuotaLedger::new());
        let audit = Arc::new(AuditEmitter::default());
        let allocator = Arc::new(Allocator::new(inventory.clone(), quota.clone(), audit.clone()));
        let scheduler = Arc::new(Scheduler::new(allocator, quota, Arc::new(AllowAllPolicy), false, audit.clone()));
        AppState { scheduler, inventory, audit }
    }

    #[tokio::test]
    async fn health_reports_degraded_before_first_tick() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_then_get_round_trips() {
        let state = test_state();
        let app = router(state.clone());

        let submission = JobSubmissionRequest {
            id: String::new(),
            tenant_id: "t1".into(),
            name: "j1".into(),
            job_type: "fine-tune".into(),
            priority: 1,
            request: ResourceRequest { gpus: 1, gpu_type: None, memory_gb: 0, cpus: 0, max_wait_secs: None },
            config: serde_json::json!({}),
            max_retries: 0,
        };
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs/submit")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&submission).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: SubmitJobResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(state.scheduler.get(&parsed.job_id).is_some());
    }

    #[tokio::test]
    async fn get_unknown_job_is_404() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/jobs/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_jobs_rejects_unknown_state() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/jobs?state=bogus").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_node_emits_audit_event() {
        use crate::audit::{AuditEventKind, ChannelAuditSink};

        let (sink, mut rx) = ChannelAuditSink::new();
        let mut state = test_state();
        state.audit = Arc::new(AuditEmitter::new(Arc::new(sink)));
        let app = router(state);

        let body = serde_json::json!({
            "id": "n2",
            "address": "10.0.0.2:9000",
            "accelerators": [],
            "total_memory_gb": 128,
            "total_cpus": 16,
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/nodes/register")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, AuditEventKind::NodeRegistered);
        assert_eq!(event.stream, "n2");
    }
}
