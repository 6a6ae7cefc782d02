// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-tenant quota accounting.
//!
//! Quota records are created and adjusted by an administrative path that is
//! out of scope here; this module only tracks and enforces them. Quota
//! state is read and mutated atomically with allocator decisions, under the
//! allocator's single lock — this ledger provides no locking of its own
//! beyond what `DashMap` gives for the administrative set/get path.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A tenant's resource cap and current usage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quota {
    /// Maximum accelerators the tenant may hold simultaneously.
    pub max_gpus: u32,
    /// Maximum memory, in gigabytes, the tenant may hold simultaneously.
    pub max_memory_gb: u32,
    /// Accelerators currently held by this tenant's live allocations.
    pub used_gpus: u32,
    /// Memory currently held by this tenant's live allocations, in gigabytes.
    pub used_memory_gb: u32,
}

impl Quota {
    /// Construct a fresh quota record with zero current usage.
    #[must_use]
    pub fn new(max_gpus: u32, max_memory_gb: u32) -> Self {
        Self {
            max_gpus,
            max_memory_gb,
            used_gpus: 0,
            used_memory_gb: 0,
        }
    }

    /// Whether charging `gpus`/`memory_gb` more would exceed this quota.
    #[must_use]
    pub fn would_exceed(&self, gpus: u32, memory_gb: u32) -> bool {
        self.used_gpus + gpus > self.max_gpus || self.used_memory_gb + memory_gb > self.max_memory_gb
    }

    fn charge(&mut self, gpus: u32, memory_gb: u32) {
        self.used_gpus += gpus;
        self.used_memory_gb += memory_gb;
    }

    fn release(&mut self, gpus: u32, memory_gb: u32) {
        self.used_gpus = self.used_gpus.saturating_sub(gpus);
        self.used_memory_gb = self.used_memory_gb.saturating_sub(memory_gb);
    }
}

/// Tracks every tenant's [`Quota`]. Tenants with no record are unlimited.
#[derive(Debug, Default)]
pub struct QuotaLedger {
    quotas: DashMap<String, Quota>,
}

impl QuotaLedger {
    /// Build an empty ledger; every tenant starts unlimited.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the quota record for `tenant_id`. Administrative;
    /// out of scope for the control surface proper.
    pub fn set_quota(&self, tenant_id: impl Into<String>, quota: Quota) {
        self.quotas.insert(tenant_id.into(), quota);
    }

    /// The current quota record for `tenant_id`, if one is set.
    #[must_use]
    pub fn get(&self, tenant_id: &str) -> Option<Quota> {
        self.quotas.get(tenant_id).map(|q| *q)
    }

    /// Whether charging `gpus`/`memory_gb` to `tenant_id` would exceed its
    /// quota. Tenants with no quota record are treated as unlimited.
    #[must_use]
    pub fn would_exceed(&self, tenant_id: &str, gpus: u32, memory_gb: u32) -> bool {
        self.quotas
            .get(tenant_id)
            .is_some_and(|q| q.would_exceed(gpus, memory_gb))
    }

    /// Whether `gpus`/`memory_gb` alone (independent of current usage)
    /// exceed `tenant_id`'s quota maxima. Used for the synchronous submit
    /// check: a request that can never fit is rejected immediately rather
    /// than being discovered later at allocation time.
    #[must_use]
    pub fn exceeds_maxima(&self, tenant_id: &str, gpus: u32, memory_gb: u32) -> bool {
        self.quotas
            .get(tenant_id)
            .is_some_and(|q| gpus > q.max_gpus || memory_gb > q.max_memory_gb)
    }

    /// Charge `gpus`/`memory_gb` against `tenant_id`. A no-op for tenants
    /// with no quota record.
    pub fn charge(&self, tenant_id: &str, gpus: u32, memory_gb: u32) {
        if let Some(mut quota) = self.quotas.get_mut(tenant_id) {
            quota.charge(gpus, memory_gb);
        }
    }

    /// Release a prior charge against `tenant_id`. A no-op for tenants with
    /// no quota record.
    pub fn release(&self, tenant_id: &str, gpus: u32, memory_gb: u32) {
        if let Some(mut quota) = self.quotas.get_mut(tenant_id) {
            quota.release(gpus, memory_gb);
        }
    }
}
