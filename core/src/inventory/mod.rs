// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Resource Inventory: the authoritative catalogue of nodes and
//! accelerators, with thread-safe mutation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

/// An open-set tag identifying the kind of accelerator a device is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorType {
    /// NVIDIA A100.
    A100,
    /// NVIDIA H100.
    H100,
    /// NVIDIA L40S.
    L40S,
    /// Google TPU v4.
    TpuV4,
    /// Any accelerator type not covered above, named explicitly.
    Other(String),
}

/// A single accelerator device, addressable as one allocation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accelerator {
    /// Unique id, scoped to the owning node.
    pub id: String,
    /// The node this accelerator belongs to.
    pub node_id: String,
    /// Device kind.
    pub accelerator_type: AcceleratorType,
    /// Onboard memory, in gigabytes.
    pub memory_gb: u32,
    /// Whether a live allocation currently holds this accelerator.
    pub allocated: bool,
    /// The job holding this accelerator, if `allocated`.
    pub holding_job_id: Option<String>,
}

/// A compute node: an address, its accelerators, and its memory/CPU pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique id.
    pub id: String,
    /// Network address workers and the control surface use to reach it.
    pub address: String,
    /// Accelerators attached to this node.
    pub accelerators: Vec<Accelerator>,
    /// Total memory, in gigabytes.
    pub total_memory_gb: u32,
    /// Memory currently charged to live allocations, in gigabytes.
    pub used_memory_gb: u32,
    /// Total CPU cores.
    pub total_cpus: u32,
    /// CPU cores currently charged to live allocations.
    pub used_cpus: u32,
    /// Whether the node is currently considered healthy.
    pub healthy: bool,
    /// Last time a heartbeat was received for this node.
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    /// Construct a newly registered node: healthy, no usage, no heartbeat
    /// history beyond `now`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        accelerators: Vec<Accelerator>,
        total_memory_gb: u32,
        total_cpus: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            accelerators,
            total_memory_gb,
            used_memory_gb: 0,
            total_cpus,
            used_cpus: 0,
            healthy: true,
            last_heartbeat: now,
        }
    }

    /// Free memory, in gigabytes.
    #[must_use]
    pub fn free_memory_gb(&self) -> u32 {
        self.total_memory_gb.saturating_sub(self.used_memory_gb)
    }

    /// Free CPU cores.
    #[must_use]
    pub fn free_cpus(&self) -> u32 {
        self.total_cpus.saturating_sub(self.used_cpus)
    }

    /// Accelerators not currently allocated, optionally filtered by type.
    pub fn free_accelerators(&self, accelerator_type: Option<&AcceleratorType>) -> Vec<&Accelerator> {
        self.accelerators
            .iter()
            .filter(|a| !a.allocated)
            .filter(|a| accelerator_type.map_or(true, |t| &a.accelerator_type == t))
            .collect()
    }
}

/// A consistent, read-only view of cluster-wide inventory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventorySnapshot {
    /// Total accelerators across every known node.
    pub total_accelerators: usize,
    /// Accelerators currently held by a live allocation.
    pub used_accelerators: usize,
    /// Number of nodes currently marked healthy.
    pub healthy_nodes: usize,
    /// Total known nodes.
    pub total_nodes: usize,
    /// Fraction of accelerators in use, `0.0..=1.0`.
    pub utilization: f64,
}

/// The authoritative catalogue of nodes and accelerators.
#[derive(Debug, Default)]
pub struct Inventory {
    nodes: DashMap<String, Node>,
}

impl Inventory {
    /// Build an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node`. Idempotent on `node.id`: re-registering an existing
    /// node rebinds address and heartbeat but preserves existing allocation
    /// state on its accelerators, so a restarted agent never loses
    /// outstanding leases.
    pub fn register_node(&self, mut node: Node, now: DateTime<Utc>) {
        node.healthy = true;
        node.last_heartbeat = now;
        if let Some(existing) = self.nodes.get(&node.id) {
            node.used_memory_gb = existing.used_memory_gb;
            node.used_cpus = existing.used_cpus;
            let existing_by_id: std::collections::HashMap<_, _> = existing
                .accelerators
                .iter()
                .map(|a| (a.id.clone(), a.clone()))
                .collect();
            for accelerator in &mut node.accelerators {
                if let Some(prior) = existing_by_id.get(&accelerator.id) {
                    accelerator.allocated = prior.allocated;
                    accelerator.holding_job_id = prior.holding_job_id.clone();
                }
            }
        }
        self.nodes.insert(node.id.clone(), node);
    }

    /// Record a heartbeat for `node_id`, marking it healthy if it was not.
    pub fn heartbeat(&self, node_id: &str, ts: DateTime<Utc>) -> OrchestratorResult<()> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {node_id}")))?;
        node.last_heartbeat = ts;
        node.healthy = true;
        Ok(())
    }

    /// Flip `healthy = false`. Existing allocations on the node remain but
    /// become ineligible for new placement.
    pub fn mark_unhealthy(&self, node_id: &str) -> OrchestratorResult<()> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {node_id}")))?;
        node.healthy = false;
        Ok(())
    }

    /// Nodes whose last heartbeat is older than `timeout` relative to `now`,
    /// marked unhealthy as a side effect. Returns the ids that changed.
    pub fn sweep_unhealthy(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut newly_unhealthy = Vec::new();
        for mut entry in self.nodes.iter_mut() {
            if entry.healthy && now - entry.last_heartbeat > timeout {
                entry.healthy = false;
                newly_unhealthy.push(entry.id.clone());
            }
        }
        newly_unhealthy
    }

    /// Look up a node by id.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    /// All known nodes, sorted by id ascending for deterministic iteration.
    #[must_use]
    pub fn list_sorted(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Apply `f` to the node `node_id` under the map's per-entry lock.
    /// Used by the allocator to commit accelerator/capacity changes.
    pub fn with_node_mut<R>(&self, node_id: &str, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        self.nodes.get_mut(node_id).map(|mut n| f(&mut n))
    }

    /// A consistent cluster-wide snapshot.
    #[must_use]
    pub fn snapshot(&self) -> InventorySnapshot {
        let nodes: Vec<Node> = self.nodes.iter().map(|n| n.clone()).collect();
        let total_accelerators: usize = nodes.iter().map(|n| n.accelerators.len()).sum();
        let used_accelerators: usize = nodes
            .iter()
            .flat_map(|n| n.accelerators.iter())
            .filter(|a| a.allocated)
            .count();
        let healthy_nodes = nodes.iter().filter(|n| n.healthy).count();
        let utilization = if total_accelerators == 0 {
            0.0
        } else {
            used_accelerators as f64 / total_accelerators as f64
        };
        InventorySnapshot {
            total_accelerators,
            used_accelerators,
            healthy_nodes,
            total_nodes: nodes.len(),
            utilization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn register_is_idempotent_and_preserves_allocation_flags() {
        let inventory = Inventory::new();
        let now = Utc::now();
        let mut node = Node::new("n1", "10.0.0.1:9000", vec![accel("g0", "n1"), accel("g1", "n1")], 512, 64, now);
        inventory.register_node(node.clone(), now);

        inventory.with_node_mut("n1", |n| {
            n.accelerators[0].allocated = true;
            n.accelerators[0].holding_job_id = Some("j1".into());
            n.used_memory_gb = 64;
        });

        node.address = "10.0.0.1:9100".into();
        inventory.register_node(node, Utc::now());

        let after = inventory.get("n1").unwrap();
        assert_eq!(after.address, "10.0.0.1:9100");
        assert!(after.accelerators[0].allocated);
        assert_eq!(after.accelerators[0].holding_job_id.as_deref(), Some("j1"));
        assert_eq!(after.used_memory_gb, 64, "usage counters survive re-register too");
    }

    #[test]
    fn heartbeat_revives_unhealthy_node() {
        let inventory = Inventory::new();
        let now = Utc::now();
        inventory.register_node(Node::new("n1", "addr", vec![], 1, 1, now), now);
        inventory.mark_unhealthy("n1").unwrap();
        assert!(!inventory.get("n1").unwrap().healthy);

        inventory.heartbeat("n1", Utc::now()).unwrap();
        assert!(inventory.get("n1").unwrap().healthy);
    }

    #[test]
    fn heartbeat_on_unknown_node_is_not_found() {
        let inventory = Inventory::new();
        let err = inventory.heartbeat("ghost", Utc::now()).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[test]
    fn sweep_marks_stale_nodes_unhealthy() {
        let inventory = Inventory::new();
        let stale_time = Utc::now() - chrono::Duration::seconds(60);
        inventory.register_node(Node::new("n1", "addr", vec![], 1, 1, stale_time), stale_time);
        // register_node always stamps healthy/now; force the heartbeat back.
        inventory.with_node_mut("n1", |n| n.last_heartbeat = stale_time);

        let changed = inventory.sweep_unhealthy(chrono::Duration::seconds(30), Utc::now());
        assert_eq!(changed, vec!["n1".to_string()]);
        assert!(!inventory.get("n1").unwrap().healthy);
    }

    #[test]
    fn snapshot_reports_utilization() {
        let inventory = Inventory::new();
        let now = Utc::now();
        inventory.register_node(Node::new("n1", "addr", vec![accel("g0", "n1"), accel("g1", "n1")], 1, 1, now), now);
        inventory.with_node_mut("n1", |n| n.accelerators[0].allocated = true);

        let snap = inventory.snapshot();
        assert_eq!(snap.total_accelerators, 2);
        assert_eq!(snap.used_accelerators, 1);
        assert!((snap.utilization - 0.5).abs() < f64::EPSILON);
    }
}
