//! Error types for engine construction, entity lifecycle, and execution.
//!
//! This module declares focused, composable error types used across the
//! execution engine. Each error carries enough context to make failures
//! actionable while remaining small and cheap to pass around or convert
//! into the aggregate [`EngineError`].
//!
//! ## Goals
//! * **Specificity:** Each error type models a single failure mode (e.g.
//!   dependency cycles, exhausted entity capacity, stale handles).
//! * **Ergonomics:** All errors implement [`std::error::Error`] and
//!   [`fmt::Display`], and provide `From<T>` conversions into
//!   [`EngineError`] so call sites can use `?`.
//! * **Actionability:** Structured fields (offending system names,
//!   requested vs. available capacity, component names) make logs useful
//!   without reproducing the failure.
//!
//! ## Typical flow
//! Low-level operations return small, dedicated error types (e.g.
//! [`StoreError`]). Orchestration code uses `?` to bubble failures into
//! [`EngineError`], which surfaces at the nearest step boundary.
//!
//! ## Display vs. Debug
//! * [`fmt::Display`] is optimized for operator logs (short, imperative
//!   phrasing).
//! * [`fmt::Debug`] (derived) retains full structure for diagnostics.

use std::fmt;

use crate::engine::types::EntityId;

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Returned when the engine declaration is internally inconsistent.
///
/// All variants are surfaced by [`Engine::new`](crate::Engine::new), except
/// [`ConfigError::MissingAdapter`], which is raised when a runner binds
/// adapters to the reachable subgraph — before any system executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The dependency relation contains a cycle through the named system.
    CyclicDependency {
        /// A system on the cycle.
        system: &'static str,
    },

    /// Two systems without a dependency path between them conflict on
    /// component access (write vs. read-or-write).
    AccessConflict {
        /// First conflicting system.
        first: &'static str,
        /// Second conflicting system.
        second: &'static str,
    },

    /// A read/write/required list referenced a component id that was not
    /// issued by this declaration.
    UnknownComponent {
        /// System whose declaration is broken.
        system: &'static str,
    },

    /// A dependency or root list referenced a system id that was not issued
    /// by this declaration.
    UnknownSystem {
        /// Referencing system, or the runner call site for bad roots.
        context: &'static str,
    },

    /// A reachable system has no matching adapter.
    MissingAdapter {
        /// System left unbound.
        system: &'static str,
    },

    /// More component kinds were declared than the signature width allows.
    TooManyComponents {
        /// Number of declared component kinds.
        declared: usize,
        /// Maximum supported.
        cap: usize,
    },

    /// The same Rust type was declared as a component twice.
    DuplicateComponent {
        /// Component type name.
        name: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::CyclicDependency { system } => {
                write!(f, "dependency cycle through system `{}`", system)
            }
            ConfigError::AccessConflict { first, second } => write!(
                f,
                "systems `{}` and `{}` have no dependency path but conflicting component access",
                first, second
            ),
            ConfigError::UnknownComponent { system } => {
                write!(f, "system `{}` references an unknown component id", system)
            }
            ConfigError::UnknownSystem { context } => {
                write!(f, "`{}` references an unknown system id", context)
            }
            ConfigError::MissingAdapter { system } => {
                write!(f, "no adapter matches system `{}`", system)
            }
            ConfigError::TooManyComponents { declared, cap } => {
                write!(f, "{} component kinds declared (cap {})", declared, cap)
            }
            ConfigError::DuplicateComponent { name } => {
                write!(f, "component type `{}` declared twice", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Returned when entity creation cannot be satisfied because the entity
/// table has insufficient capacity.
///
/// Arises in fixed-capacity mode once every slot is alive; dynamic tables
/// grow instead.
///
/// ### Fields
/// * `entities_needed` — Total number of slots the operation required.
/// * `capacity` — The bound that prevented the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError {
    /// Total slots the operation required.
    pub entities_needed: u64,
    /// Current capacity limiting the operation.
    pub capacity: u64,
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entity limit reached ({} needed; capacity {})",
            self.entities_needed, self.capacity
        )
    }
}

impl std::error::Error for CapacityError {}

/// Returned when a handle no longer resolves — the entity was reclaimed and
/// the slot generation moved past the handle's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidHandleError {
    /// Entity id carried by the handle.
    pub id: EntityId,
}

impl fmt::Display for InvalidHandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle to entity {} is no longer valid", self.id)
    }
}

impl std::error::Error for InvalidHandleError {}

/// Returned when an operation targets a dead or reclaimed entity id.
///
/// Use this to prevent use-after-free style logic errors at the API
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleEntityError {
    /// Offending entity id.
    pub id: EntityId,
}

impl fmt::Display for StaleEntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity {} is dead or stale", self.id)
    }
}

impl std::error::Error for StaleEntityError {}

/// Component-store contract violations.
///
/// These indicate logic errors in user code: adding a component that is
/// already present, removing or reading one that is absent. The proxies
/// check presence through the entity's committed component bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// `add_component` on an entity that already holds the component.
    DoubleAdd {
        /// Component type name.
        component: &'static str,
        /// Target entity.
        entity: EntityId,
    },

    /// `remove_component` on an entity that does not hold the component.
    DoubleRemove {
        /// Component type name.
        component: &'static str,
        /// Target entity.
        entity: EntityId,
    },

    /// Read of a component the entity does not hold.
    MissingComponent {
        /// Component type name.
        component: &'static str,
        /// Target entity.
        entity: EntityId,
    },

    /// A component type was used that the declaration never registered.
    UnregisteredComponent {
        /// Component type name.
        component: &'static str,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DoubleAdd { component, entity } => {
                write!(f, "component `{}` already present on entity {}", component, entity)
            }
            StoreError::DoubleRemove { component, entity } => {
                write!(f, "component `{}` not present on entity {} (remove)", component, entity)
            }
            StoreError::MissingComponent { component, entity } => {
                write!(f, "component `{}` missing on entity {}", component, entity)
            }
            StoreError::UnregisteredComponent { component } => {
                write!(f, "component type `{}` was never declared", component)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Failures raised while driving the system DAG.
///
/// An error *returned* by a user adapter is already an [`EngineError`] and
/// surfaces unchanged; only caught panics need a representation of their
/// own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// A user closure panicked inside a subtask or instance adapter. The
    /// engine caught the panic; the message is the stringified payload.
    Panicked {
        /// System whose closure panicked.
        system: &'static str,
        /// Stringified panic payload.
        message: String,
    },
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::Panicked { system, message } => {
                write!(f, "system `{}` panicked: {}", system, message)
            }
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Aggregate error surfaced at the step boundary.
///
/// `From<T>` conversions are implemented for every low-level error so call
/// sites can write `?` and still return a single, expressive type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Declaration-level inconsistency.
    Config(ConfigError),

    /// Entity capacity exhausted.
    Capacity(CapacityError),

    /// A handle failed to resolve.
    InvalidHandle(InvalidHandleError),

    /// An operation targeted a dead entity.
    StaleEntity(StaleEntityError),

    /// Component-store contract violation.
    Store(StoreError),

    /// A user closure panicked or failed during DAG execution.
    Execution(ExecutionError),

    /// Free-form failure raised by user code through a proxy.
    Message(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(e) => write!(f, "{e}"),
            EngineError::Capacity(e) => write!(f, "{e}"),
            EngineError::InvalidHandle(e) => write!(f, "{e}"),
            EngineError::StaleEntity(e) => write!(f, "{e}"),
            EngineError::Store(e) => write!(f, "{e}"),
            EngineError::Execution(e) => write!(f, "{e}"),
            EngineError::Message(m) => f.write_str(m),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e)
    }
}
impl From<CapacityError> for EngineError {
    fn from(e: CapacityError) -> Self {
        EngineError::Capacity(e)
    }
}
impl From<InvalidHandleError> for EngineError {
    fn from(e: InvalidHandleError) -> Self {
        EngineError::InvalidHandle(e)
    }
}
impl From<StaleEntityError> for EngineError {
    fn from(e: StaleEntityError) -> Self {
        EngineError::StaleEntity(e)
    }
}
impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}
impl From<ExecutionError> for EngineError {
    fn from(e: ExecutionError) -> Self {
        EngineError::Execution(e)
    }
}
impl From<String> for EngineError {
    fn from(m: String) -> Self {
        EngineError::Message(m)
    }
}
impl From<&str> for EngineError {
    fn from(m: &str) -> Self {
        EngineError::Message(m.to_string())
    }
}
