// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Orchestrator configuration.
//!
//! The orchestrator has no opinion on training internals or policy text, so
//! its entire configuration surface is a handful of environment variables.
//! There is deliberately no file-based config loader here: every field is a
//! `clap` argument bound to an environment variable with a sane default.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Runtime configuration for the orchestrator process.
#[derive(Debug, Clone, Parser)]
#[command(name = "openlora-orchestrator", version)]
#[command(about = "Job scheduler, GPU allocator, and control surface for OpenLoRA", long_about = None)]
pub struct OrchestratorConfig {
    /// HTTP control-surface listen port.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8081)]
    pub http_port: u16,

    /// RPC control-surface listen port.
    #[arg(long, env = "GRPC_PORT", default_value_t = 50051)]
    pub grpc_port: u16,

    /// Scheduling tick interval, in milliseconds.
    #[arg(long, env = "TICK_INTERVAL_MS", default_value_t = 1000)]
    pub tick_interval_ms: u64,

    /// Seconds without a heartbeat before a node is marked unhealthy.
    #[arg(long, env = "HEARTBEAT_TIMEOUT_S", default_value_t = 30)]
    pub heartbeat_timeout_s: u64,

    /// Seconds an unhealthy node's jobs may linger before they are reaped.
    #[arg(long, env = "REAP_AFTER_S", default_value_t = 600)]
    pub reap_after_s: u64,

    /// If the policy evaluator is unreachable, admit the job instead of
    /// failing closed. Defaults to fail-closed (`false`).
    #[arg(long, env = "POLICY_EVALUATOR_FAIL_OPEN", default_value_t = false)]
    pub policy_evaluator_fail_open: bool,

    /// Optional path to a checkpoint file. When set, the orchestrator
    /// replays a fresh checkpoint on boot and saves one on clean shutdown.
    #[arg(long, env = "CHECKPOINT_PATH")]
    pub checkpoint_path: Option<PathBuf>,
}

impl OrchestratorConfig {
    /// The scheduling tick interval as a [`Duration`].
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// The heartbeat timeout as a [`Duration`].
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_s)
    }

    /// The reap timeout as a [`Duration`].
    #[must_use]
    pub fn reap_after(&self) -> Duration {
        Duration::from_secs(self.reap_after_s)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            http_port: 8081,
            grpc_port: 50051,
            tick_interval_ms: 1000,
            heartbeat_timeout_s: 30,
            reap_after_s: 600,
            policy_evaluator_fail_open: false,
            checkpoint_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.http_port, 8081);
        assert_eq!(cfg.grpc_port, 50051);
        assert_eq!(cfg.tick_interval(), Duration::from_secs(1));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.reap_after(), Duration::from_secs(600));
        assert!(!cfg.policy_evaluator_fail_open);
    }
}
