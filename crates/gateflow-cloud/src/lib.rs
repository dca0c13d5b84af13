//! GateFlow provisioning engine
//!
//! Plans and applies a [`ResourceGraph`](gateflow_core::ResourceGraph)
//! against a cloud control plane.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  GateFlow CLI                    │
//! │           (gate plan/apply/destroy)              │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                gateflow-cloud                    │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐   │
//! │  │ Reconciler │ │  Executor  │ │  Outputs   │   │
//! │  └────────────┘ └────────────┘ └────────────┘   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │          Provider Abstraction             │   │
//! │  │  trait ResourceProvider { ... }           │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │ Retry / Poll │  │  State Mgmt  │            │
//! │  └──────────────┘  └──────────────┘            │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │      aws      │ │   simulated   │
//! │   provider    │ │   provider    │
//! └───────────────┘ └───────────────┘
//! ```

pub mod action;
pub mod error;
pub mod executor;
pub mod outputs;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod simulator;
pub mod state;
pub mod waiter;

// Re-exports
pub use action::{
    Action, ActionResult, ActionType, ApplyResult, AttributeChange, Plan, PlanSummary,
    ReplaceStrategy,
};
pub use error::{CloudError, Result};
pub use executor::{ApplyOutcome, Executor, ExecutorConfig};
pub use outputs::OutputProjector;
pub use provider::{
    AuthStatus, ProviderResource, Readiness, ResourceProvider, ResourceRequest, ResourceSchema,
};
pub use reconciler::plan;
pub use retry::{RetryConfig, with_retry};
pub use simulator::{CallCounts, SimulatedProvider};
pub use state::{
    DeposedCopy, ResourceState, ResourceStatus, StateLock, StateManager, StateSnapshot,
};
pub use waiter::{PollConfig, wait_until_ready};
