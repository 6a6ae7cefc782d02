// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The dual control surface: JSON-over-HTTP and RPC, carrying identical
//! semantics over the same in-process [`crate::scheduler::Scheduler`] and
//! [`crate::inventory::Inventory`]. Neither surface owns state; both are
//! thin adapters that translate wire shapes into calls on the shared
//! collaborators passed in at construction.

pub mod error;
pub mod http;
pub mod models;
pub mod rpc;

pub use error::{ApiError, ApiResult};
pub use http::{router, AppState};
pub use rpc::{Orchestrator, OrchestratorRpc, OrchestratorServer};
