// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The Allocator: admission control binding a [`ResourceRequest`] to a node
//! without violating node capacity, quotas, or node-health rules.
//!
//! All writes — inventory and quota — happen under a single mutex so a
//! decision is atomic. Splitting that lock is tempting and wrong: double
//! allocation bugs live there.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::{AuditEmitter, AuditEventKind};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::inventory::{AcceleratorType, Inventory};
use crate::quota::QuotaLedger;

/// What a caller wants: a slice of accelerators plus memory and CPU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Number of accelerators required.
    pub gpus: u32,
    /// Restrict placement to this accelerator type, if set.
    pub gpu_type: Option<AcceleratorType>,
    /// Memory required, in gigabytes.
    pub memory_gb: u32,
    /// CPU cores required.
    pub cpus: u32,
    /// Optional wall-clock budget, in seconds, for the queued phase.
    pub max_wait_secs: Option<u64>,
}

impl ResourceRequest {
    fn validate(&self) -> OrchestratorResult<()> {
        if self.gpus == 0 && self.memory_gb == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "request must ask for at least one gpu or some memory".into(),
            ));
        }
        Ok(())
    }
}

/// A concrete reservation of resources on one node for one job. Created by
/// the allocator on success; destroyed by `release`; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// Unique id.
    pub id: String,
    /// The job this allocation belongs to.
    pub job_id: String,
    /// The tenant that owns the job.
    pub tenant_id: String,
    /// The node the allocation lives on.
    pub node_id: String,
    /// Accelerators claimed by this allocation, ascending by id.
    pub accelerator_ids: Vec<String>,
    /// Memory charged, in gigabytes.
    pub memory_gb: u32,
    /// CPU cores charged.
    pub cpus: u32,
    /// When the allocation was created.
    pub created_at: DateTime<Utc>,
}

/// Binds [`ResourceRequest`]s to nodes, keeping Inventory, Quota, and the
/// live-allocation map atomically consistent.
pub struct Allocator {
    inventory: Arc<Inventory>,
    quota: Arc<QuotaLedger>,
    audit: Arc<AuditEmitter>,
    allocations: Mutex<HashMap<String, Allocation>>,
    /// `L_alloc`: held for the full duration of every admission decision and
    /// every release. Never held while blocking on external I/O.
    l_alloc: Mutex<()>,
}

impl Allocator {
    /// Build an allocator over shared inventory, quota, and audit state.
    #[must_use]
    pub fn new(inventory: Arc<Inventory>, quota: Arc<QuotaLedger>, audit: Arc<AuditEmitter>) -> Self {
        Self {
            inventory,
            quota,
            audit,
            allocations: Mutex::new(HashMap::new()),
            l_alloc: Mutex::new(()),
        }
    }

    /// Attempt to satisfy `request` for `job_id` owned by `tenant_id`.
    ///
    /// Errors with `InvalidRequest` (zero gpus and zero memory),
    /// `QuotaExceeded` (tenant quota would be violated), or
    /// `NoSuitableNode` (no healthy node fits) — the latter is internal and
    /// the scheduling tick is expected to catch it and re-queue the job.
    pub fn allocate(
        &self,
        request: &ResourceRequest,
        tenant_id: &str,
        job_id: &str,
    ) -> OrchestratorResult<Allocation> {
        request.validate()?;

        let _guard = self.l_alloc.lock();

        if self.quota.would_exceed(tenant_id, request.gpus, request.memory_gb) {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "tenant {tenant_id} would exceed quota"
            )));
        }

        let chosen = self.select_node(request)?;
        Ok(self.commit(chosen, request, tenant_id, job_id))
    }

    /// The worker-pull variant: parameterized by the caller's declared
    /// `available` capacity on `node_id` rather than discovered by scanning
    /// Inventory. Allocation bookkeeping — accelerator flags, node
    /// counters, quota charge, the live-allocation map — is identical to
    /// `allocate`; only node selection is skipped in favor of the caller's
    /// choice.
    pub fn allocate_on_node(
        &self,
        node_id: &str,
        request: &ResourceRequest,
        tenant_id: &str,
        job_id: &str,
    ) -> OrchestratorResult<Allocation> {
        request.validate()?;

        let _guard = self.l_alloc.lock();

        if self.quota.would_exceed(tenant_id, request.gpus, request.memory_gb) {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "tenant {tenant_id} would exceed quota"
            )));
        }

        let node = self
            .inventory
            .get(node_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {node_id}")))?;
        if !node.healthy {
            return Err(OrchestratorError::NoSuitableNode);
        }
        if node.free_memory_gb() < request.memory_gb || node.free_cpus() < request.cpus {
            return Err(OrchestratorError::NoSuitableNode);
        }
        if (node.free_accelerators(request.gpu_type.as_ref()).len() as u32) < request.gpus {
            return Err(OrchestratorError::NoSuitableNode);
        }

        Ok(self.commit(node_id.to_string(), request, tenant_id, job_id))
    }

    /// Claim the first N eligible accelerators on `node_id` (ascending by
    /// id), charge node and quota counters, and record the allocation.
    /// Caller must already hold `l_alloc` and must already know `node_id`
    /// has sufficient capacity.
    fn commit(&self, node_id: String, request: &ResourceRequest, tenant_id: &str, job_id: &str) -> Allocation {
        let accelerator_ids: Vec<String> = self
            .inventory
            .get(&node_id)
            .expect("node existed during selection")
            .free_accelerators(request.gpu_type.as_ref())
            .into_iter()
            .map(|a| a.id.clone())
            .take(request.gpus as usize)
            .collect();

        self.inventory.with_node_mut(&node_id, |node| {
            node.used_memory_gb += request.memory_gb;
            node.used_cpus += request.cpus;
            for accelerator in &mut node.accelerators {
                if accelerator_ids.contains(&accelerator.id) {
                    accelerator.allocated = true;
                    accelerator.holding_job_id = Some(job_id.to_string());
                }
            }
        });

        self.quota.charge(tenant_id, request.gpus, request.memory_gb);

        let allocation = Allocation {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            node_id,
            accelerator_ids,
            memory_gb: request.memory_gb,
            cpus: request.cpus,
            created_at: Utc::now(),
        };
        self.allocations.lock().insert(allocation.id.clone(), allocation.clone());

        self.audit.emit(
            job_id,
            AuditEventKind::AllocationCreated,
            json!({"allocation_id": allocation.id, "node_id": allocation.node_id}),
        );

        allocation
    }

    /// Node selection: healthy nodes in ascending-id order; skip any that
    /// lack memory, CPU, or accelerator capacity; prefer the node leaving
    /// the smallest residual free-accelerator count, ties by id.
    fn select_node(&self, request: &ResourceRequest) -> OrchestratorResult<String> {
        let mut best: Option<(String, usize)> = None;

        for node in self.inventory.list_sorted() {
            if !node.healthy {
                continue;
            }
            if node.free_memory_gb() < request.memory_gb || node.free_cpus() < request.cpus {
                continue;
            }
            let free = node.free_accelerators(request.gpu_type.as_ref());
            if (free.len() as u32) < request.gpus {
                continue;
            }
            let residual = free.len() - request.gpus as usize;
            let replace = match &best {
                None => true,
                Some((_, current)) => residual < *current,
            };
            if replace {
                best = Some((node.id.clone(), residual));
            }
        }

        best.map(|(id, _)| id)
            .ok_or(OrchestratorError::NoSuitableNode)
    }

    /// Release `allocation_id`: clears accelerator flags, decrements node
    /// and quota counters, removes the allocation record. Idempotent —
    /// releasing an unknown id returns `NotFound` but has no side effects.
    pub fn release(&self, allocation_id: &str) -> OrchestratorResult<()> {
        let _guard = self.l_alloc.lock();

        let allocation = self
            .allocations
            .lock()
            .remove(allocation_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("allocation {allocation_id}")))?;

        self.inventory.with_node_mut(&allocation.node_id, |node| {
            node.used_memory_gb = node.used_memory_gb.saturating_sub(allocation.memory_gb);
            node.used_cpus = node.used_cpus.saturating_sub(allocation.cpus);
            for accelerator in &mut node.accelerators {
                if allocation.accelerator_ids.contains(&accelerator.id) {
                    accelerator.allocated = false;
                    accelerator.holding_job_id = None;
                }
            }
        });

        self.quota
            .release(&allocation.tenant_id, allocation.accelerator_ids.len() as u32, allocation.memory_gb);

        self.audit.emit(
            &allocation.job_id,
            AuditEventKind::AllocationReleased,
            json!({"allocation_id": allocation.id, "node_id": allocation.node_id}),
        );

        Ok(())
    }

    /// Look up a live allocation by id.
    #[must_use]
    pub fn get(&self, allocation_id: &str) -> Option<Allocation> {
        self.allocations.lock().get(allocation_id).cloned()
    }

    /// Every live allocation, for checkpointing.
    #[must_use]
    pub fn list(&self) -> Vec<Allocation> {
        self.allocations.lock().values().cloned().collect()
    }

    /// Repopulate the live-allocation map from a checkpoint. The restored
    /// `Node`s already carry their accelerators' `allocated` flags and usage
    /// counters, so this does not re-charge Inventory — only the tenant
    /// quota counters, which the checkpoint does not cover, are recharged
    /// here to stay consistent with whatever quota an administrator
    /// reconfigures after restart.
    pub fn restore(&self, allocations: Vec<Allocation>) {
        let _guard = self.l_alloc.lock();
        let mut map = self.allocations.lock();
        for allocation in allocations {
            self.quota.charge(&allocation.tenant_id, allocation.accelerator_ids.len() as u32, allocation.memory_gb);
            map.insert(allocation.id.clone(), allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Accelerator, Node};
    use crate::quota::Quota;

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

    fn request(gpus: u32, memory_gb: u32, cpus: u32) -> ResourceRequest {
        ResourceRequest {
            gpus,
            gpu_type: None,
            memory_gb,
            cpus,
            max_wait_secs: None,
        }
    }

    fn allocator_with_one_node() -> Allocator {
        let inventory = Arc::new(Inventory::new());
        let now = Utc::now();
        inventory.register_node(
            Node::new(
                "n1",
                "10.0.0.1:9000",
                vec![accel("g0", "n1"), accel("g1", "n1"), accel("g2", "n1"), accel("g3", "n1")],
                512,
                64,
                now,
            ),
            now,
        );
        Allocator::new(inventory, Arc::new(QuotaLedger::new()), Arc::new(AuditEmitter::default()))
    }

    #[test]
    fn zero_gpus_and_zero_memory_is_invalid() {
        let allocator = allocator_with_one_node();
        let err = allocator.allocate(&request(0, 0, 1), "t1", "j1").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }

    #[test]
    fn happy_path_allocates_and_charges_node() {
        let allocator = allocator_with_one_node();
        let allocation = allocator.allocate(&request(2, 64, 8), "t1", "j1").unwrap();
        assert_eq!(allocation.accelerator_ids, vec!["g0".to_string(), "g1".to_string()]);

        let snap = allocator.inventory.snapshot();
        assert_eq!(snap.used_accelerators, 2);
    }

    #[test]
    fn no_suitable_node_when_capacity_exceeded() {
        let allocator = allocator_with_one_node();
        let err = allocator.allocate(&request(10, 0, 0), "t1", "j1").unwrap_err();
        assert!(matches!(err, OrchestratorError::NoSuitableNode));
    }

    #[test]
    fn quota_exceeded_is_checked_before_node_selection() {
        let allocator = allocator_with_one_node();
        allocator.quota.set_quota("t1", Quota::new(1, 1_000));
        let err = allocator.allocate(&request(2, 0, 0), "t1", "j1").unwrap_err();
        assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));
    }

    #[test]
    fn release_is_idempotent_and_reverses_charges() {
        let allocator = allocator_with_one_node();
        let allocation = allocator.allocate(&request(1, 32, 4), "t1", "j1").unwrap();

        allocator.release(&allocation.id).unwrap();
        let snap = allocator.inventory.snapshot();
        assert_eq!(snap.used_accelerators, 0);

        let err = allocator.release(&allocation.id).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[test]
    fn best_fit_minimizes_residual_free_accelerators() {
        let inventory = Arc::new(Inventory::new());
        let now = Utc::now();
        // n1 has 4 free accelerators, n2 has 2 free: requesting 2 should
        // land on n2 (residual 0) rather than n1 (residual 2).
        inventory.register_node(
            Node::new("n1", "a1", vec![accel("a", "n1"), accel("b", "n1"), accel("c", "n1"), accel("d", "n1")], 512, 64, now),
            now,
        );
        inventory.register_node(
            Node::new("n2", "a2", vec![accel("e", "n2"), accel("f", "n2")], 512, 64, now),
            now,
        );
        let allocator = Allocator::new(inventory, Arc::new(QuotaLedger::new()), Arc::new(AuditEmitter::default()));

        let allocation = allocator.allocate(&request(2, 0, 0), "t1", "j1").unwrap();
        assert_eq!(allocation.node_id, "n2");
    }

    #[test]
    fn restore_repopulates_allocation_map_and_recharges_quota() {
        let allocator = allocator_with_one_node();
        allocator.quota.set_quota("t1", Quota::new(4, 1_000));
        let allocation = Allocation {
            id: "a1".into(),
            job_id: "j1".into(),
            tenant_id: "t1".into(),
            node_id: "n1".into(),
            accelerator_ids: vec!["g0".into()],
            memory_gb: 32,
            cpus: 4,
            created_at: Utc::now(),
        };

        allocator.restore(vec![allocation.clone()]);

        assert_eq!(allocator.get("a1").unwrap().id, "a1");
        assert_eq!(allocator.quota.get("t1").unwrap().used_gpus, 1);
        assert_eq!(allocator.list().len(), 1);
    }

    #[test]
    fn allocate_on_node_skips_selection_but_still_enforces_capacity() {
        let allocator = allocator_with_one_node();
        let allocation = allocator.allocate_on_node("n1", &request(1, 32, 4), "t1", "j1").unwrap();
        assert_eq!(allocation.node_id, "n1");

        let err = allocator.allocate_on_node("n1", &request(10, 0, 0), "t1", "j2").unwrap_err();
        assert!(matches!(err, OrchestratorError::NoSuitableNode));

        let err = allocator.allocate_on_node("ghost", &request(1, 0, 0), "t1", "j3").unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }
}
