// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Background workers that keep node health and job liveness honest:
//! the heartbeat sweeper (`T_health`) and the unhealthy-node reaper
//! (`T_reap`).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;

use crate::audit::{AuditEmitter, AuditEventKind};
use crate::inventory::Inventory;
use crate::scheduler::{JobStatus, Scheduler};

/// Marks nodes unhealthy once `now - last_heartbeat > T_health`.
pub struct HeartbeatSweeper {
    inventory: Arc<Inventory>,
    audit: Arc<AuditEmitter>,
    timeout: Duration,
    period: StdDuration,
}

impl HeartbeatSweeper {
    /// Build a sweeper over `inventory`, checking every `period` for nodes
    /// stale by more than `timeout`.
    #[must_use]
    pub fn new(inventory: Arc<Inventory>, audit: Arc<AuditEmitter>, timeout: StdDuration, period: StdDuration) -> Self {
        Self {
            inventory,
            audit,
            timeout: Duration::from_std(timeout).unwrap_or(Duration::seconds(30)),
            period,
        }
    }

    /// Run one sweep, returning the ids of nodes newly marked unhealthy.
    pub fn sweep_once(&self) -> Vec<String> {
        let newly_unhealthy = self.inventory.sweep_unhealthy(self.timeout, Utc::now());
        for node_id in &newly_unhealthy {
            self.audit.emit(node_id, AuditEventKind::NodeUnhealthy, json!({"node_id": node_id}));
        }
        newly_unhealthy
    }

    /// Run forever on `self.period`, sweeping each tick. Intended to be
    /// spawned as a background task; never returns.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.period);
        loop {
            interval.tick().await;
            let unhealthy = self.sweep_once();
            if !unhealthy.is_empty() {
                tracing::warn!(nodes = ?unhealthy, "nodes marked unhealthy by heartbeat sweeper");
            }
        }
    }
}

/// After `T_reap` elapses on an unhealthy node, jobs still running there are
/// forced into `failed` and their allocations released — this avoids
/// double-scheduling while a transient agent restart is in progress, but
/// eventually treats the node as permanently lost.
pub struct Reaper {
    inventory: Arc<Inventory>,
    scheduler: Arc<Scheduler>,
    reap_after: Duration,
    period: StdDuration,
}

impl Reaper {
    /// Build a reaper: a job on an unhealthy node is failed once that node
    /// has been unhealthy for longer than `reap_after`.
    #[must_use]
    pub fn new(inventory: Arc<Inventory>, scheduler: Arc<Scheduler>, reap_after: StdDuration, period: StdDuration) -> Self {
        Self {
            inventory,
            scheduler,
            reap_after: Duration::from_std(reap_after).unwrap_or(Duration::seconds(600)),
            period,
        }
    }

    /// Run one reap pass: find jobs running on nodes that have been
    /// unhealthy longer than `T_reap`, and force them to `failed`.
    pub fn reap_once(&self) {
        let now = Utc::now();
        let unhealthy_nodes: std::collections::HashSet<String> = self
            .inventory
            .list_sorted()
            .into_iter()
            .filter(|n| !n.healthy && now - n.last_heartbeat > self.reap_after)
            .map(|n| n.id)
            .collect();
        if unhealthy_nodes.is_empty() {
            return;
        }

        for job in self.scheduler.list(Some(JobStatus::Running)) {
            let Some(allocation) = &job.allocation else { continue };
            if unhealthy_nodes.contains(&allocation.node_id) {
                if let Err(err) = self.scheduler.complete(&job.id, Some("node_lost".to_string())) {
                    tracing::warn!(job_id = %job.id, error = %err, "reaper failed to complete lost job");
                }
            }
        }
    }

    /// Run forever on `self.period`. Intended to be spawned as a background
    /// task; never returns.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.period);
        loop {
            interval.tick().await;
            self.reap_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{Allocator, ResourceRequest};
    use crate::inventory::{Accelerator, AcceleratorType, Node};
    use crate::policy::AllowAllPolicy;
    use crate::quota::QuotaLedger;

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

    #[test]
    fn sweep_marks_stale_node_unhealthy_and_emits_audit() {
        let inventory = Arc::new(Inventory::new());
        let stale = Utc::now() - Duration::seconds(120);
        inventory.register_node(Node::new("n1", "addr", vec![], 1, 1, stale), stale);
        inventory.with_node_mut("n1", |n| n.last_heartbeat = stale);

        let audit = Arc::new(AuditEmitter::default());
        let sweeper = HeartbeatSweeper::new(inventory.clone(), audit, StdDuration::from_secs(30), StdDuration::from_secs(1));

        let changed = sweeper.sweep_once();
        assert_eq!(changed, vec!["n1".to_string()]);
        assert!(!inventory.get("n1").unwrap().healthy);
    }

    #[tokio::test]
    async fn reap_fails_jobs_on_nodes_unhealthy_past_reap_window() {
        let inventory = Arc::new(Inventory::new());
        let now = Utc::now();
        inventory.register_node(Node::new("n1", "addr", vec![accel("g0", "n1")], 512, 64, now), now);

        let quota = Arc::new(QuotaLedger::new());
        let audit = Arc::new(AuditEmitter::default());
        let allocator = Arc::new(Allocator::new(inventory.clone(), quota.clone(), audit.clone()));
        let scheduler = Arc::new(Scheduler::new(allocator, quota, Arc::new(AllowAllPolicy), false, audit));

        let id = scheduler
            .submit(crate::scheduler::JobSubmissionRequest {
                id: String::new(),
                tenant_id: "t1".into(),
                name: "j1".into(),
                job_type: "fine-tune".into(),
                priority: 1,
                request: ResourceRequest { gpus: 1, gpu_type: None, memory_gb: 0, cpus: 0, max_wait_secs: None },
                config: serde_json::json!({}),
                max_retries: 0,
            })
            .await
            .unwrap();
        scheduler.tick();
        assert_eq!(scheduler.get(&id).unwrap().status, JobStatus::Running);

        let long_ago = Utc::now() - Duration::seconds(700);
        inventory.with_node_mut("n1", |n| {
            n.healthy = false;
            n.last_heartbeat = long_ago;
        });

        let reaper = Reaper::new(inventory, scheduler.clone(), StdDuration::from_secs(600), StdDuration::from_secs(1));
        reaper.reap_once();

        assert_eq!(scheduler.get(&id).unwrap().status, JobStatus::Failed);
    }
}
