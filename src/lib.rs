//! # lockstep-ecs
//!
//! Statically configured, automatically parallelized Entity-Component-System
//! runtime.
//!
//! A user declares, ahead of execution, the closed set of component kinds,
//! the closed set of systems, each system's read/write component access,
//! its dependencies on other systems, and an optional inner-parallelism
//! policy. From that declaration the engine derives a dependency DAG and
//! an execution schedule that runs independent systems concurrently and,
//! when permitted, splits an individual system's subscribed entity range
//! across worker threads.
//!
//! ## Design Goals
//! - Dependency-driven outer parallelism across systems
//! - Policy-driven inner parallelism within a system
//! - Construction-time rejection of conflicting schedules
//! - A strict serialization point (the refresh) after every step
//!
//! ## A step
//!
//! ```ignore
//! engine.step(|proxy| {
//!     proxy.execute_systems().run(&adapters)?;
//!     Ok(())
//! })?;
//! ```
//!
//! The body runs to completion, then the refresh pipeline integrates
//! deferred mutations, reclaims killed entities, and re-matches changed
//! entities to systems.

#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod engine;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (Public API)
// ─────────────────────────────────────────────────────────────────────────────

pub use engine::runtime::Engine;

pub use engine::declare::{EngineDeclaration, SystemDeclaration};

pub use engine::entity::Handle;

pub use engine::proxy::{DataProxy, InstanceExecutor, StepProxy, SystemRunner};

pub use engine::refresh::RefreshHandlers;

pub use engine::sparse::SparseSet;

pub use engine::storage::Component;

pub use engine::system::{Adapter, Adapters, SubtaskState};

pub use engine::sync::{CounterLatch, WorkerPool};

pub use engine::error::{
    CapacityError,
    ConfigError,
    EngineError,
    EngineResult,
    ExecutionError,
    InvalidHandleError,
    StaleEntityError,
    StoreError,
};

pub use engine::types::{
    ComponentId,
    EntityId,
    EntityStorage,
    Generation,
    InnerParallelism,
    InnerParallelismMode,
    SchedulerKind,
    Signature,
    StorageKind,
    SystemId,
    COMPONENT_CAP,
    INVALID_ENTITY,
};

// ─────────────────────────────────────────────────────────────────────────────
// Prelude (Optional but recommended)
// ─────────────────────────────────────────────────────────────────────────────

/// Commonly used engine types.
///
/// Import with:
/// ```rust
/// use lockstep_ecs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Adapter,
        Adapters,
        DataProxy,
        Engine,
        EngineDeclaration,
        EngineResult,
        EntityStorage,
        Handle,
        InnerParallelism,
        InnerParallelismMode,
        RefreshHandlers,
        StepProxy,
        StorageKind,
        SystemDeclaration,
    };
}
