// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Fire-and-forget audit event emission.
//!
//! The orchestrator never reads these events back and never hash-chains
//! them; that is the audit collaborator's job. This module's only
//! obligation is to hand out monotonically increasing sequence numbers per
//! stream so the collaborator can chain what it receives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of state change an [`AuditEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// A job was admitted to the queue.
    JobSubmitted,
    /// A job transitioned to `running`.
    JobStarted,
    /// A job transitioned to `completed`.
    JobCompleted,
    /// A job transitioned to `failed`.
    JobFailed,
    /// A job transitioned to `cancelled`.
    JobCancelled,
    /// An allocation was created.
    AllocationCreated,
    /// An allocation was released.
    AllocationReleased,
    /// A node was registered with the inventory.
    NodeRegistered,
    /// A node was marked unhealthy.
    NodeUnhealthy,
}

/// A single audit record, fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Logical stream the event belongs to (e.g. a job id or `"cluster"`).
    pub stream: String,
    /// Monotonically increasing sequence number within `stream`.
    pub sequence: u64,
    /// What happened.
    pub kind: AuditEventKind,
    /// Event-specific payload.
    pub payload: Value,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Sink for audit events. Implementations must not block the caller for
/// long; this is consulted from inside locked sections.
pub trait AuditSink: Send + Sync {
    /// Record an event. Fire-and-forget: no acknowledgement, no retry.
    fn record(&self, event: AuditEvent);
}

/// Assigns per-stream monotonic sequence numbers starting at 1.
#[derive(Debug, Default)]
struct SequenceAllocator {
    counters: DashMap<String, AtomicU64>,
}

impl SequenceAllocator {
    fn next(&self, stream: &str) -> u64 {
        self.counters
            .entry(stream.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }
}

/// Emits events to an injected [`AuditSink`], stamping sequence numbers.
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
    sequences: SequenceAllocator,
}

impl AuditEmitter {
    /// Build an emitter backed by `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            sequences: SequenceAllocator::default(),
        }
    }

    /// Emit `kind` on `stream` with `payload`, stamping the next sequence
    /// number for that stream.
    pub fn emit(&self, stream: &str, kind: AuditEventKind, payload: Value) {
        let event = AuditEvent {
            stream: stream.to_string(),
            sequence: self.sequences.next(stream),
            kind,
            payload,
            timestamp: Utc::now(),
        };
        self.sink.record(event);
    }
}

impl Default for AuditEmitter {
    fn default() -> Self {
        Self::new(Arc::new(NullAuditSink))
    }
}

/// Drops every event after logging it at `debug`. The default sink.
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::debug!(stream = %event.stream, sequence = event.sequence, kind = ?event.kind, "audit event dropped (no sink configured)");
    }
}

/// Forwards events over an unbounded channel for a collaborator process to
/// drain.
pub struct ChannelAuditSink {
    sender: tokio::sync::mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Build a sink and return it paired with the receiving half.
    #[must_use]
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<AuditEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        // Receiver drop just means nobody is draining audit events; that is
        // not this orchestrator's problem.
        let _ = self.sender.send(event);
    }
}
