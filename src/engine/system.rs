//! System instances, subtask state, and user-overload adapters.
//!
//! A **system instance** bundles everything mutable about one declared
//! system: its owned user state, its subscription set, and one
//! [`SubtaskState`] per inner-parallelism slice of the current execution.
//!
//! ## Subtask isolation
//!
//! Subtasks of one system run concurrently and unordered. Each owns its
//! state record exclusively — its output buffer, its kill set, and its
//! deferred-closure queue — and must never touch a sibling's. The refresh
//! pipeline reads the records afterwards and clears the kill and deferred
//! buffers; output buffers stay readable until the next execution recreates
//! them.
//!
//! ## Adapters
//!
//! User processing code is matched to systems through adapters: a tag set
//! plus a closure. When a runner starts, each reachable system is bound to
//! the **first** adapter whose tag set contains it; a reachable system with
//! no match is a configuration error raised before anything runs. Two
//! closure shapes exist:
//!
//! - **subtask adapters** run once per subtask with shared access to the
//!   system's user state (`&S`) — the common case;
//! - **instance adapters** run once per system execution with exclusive
//!   access to the user state (`&mut S`) and drive the subtask fan-out
//!   themselves, which lets them fold subtask outputs back into the state.

use std::any::{type_name, Any};

use crate::engine::declare::OutputFactory;
use crate::engine::error::{ConfigError, EngineResult};
use crate::engine::proxy::{DataProxy, InstanceExecutor, StepProxy};
use crate::engine::sparse::SparseSet;
use crate::engine::types::SystemId;

/// Closure queued by a subtask for execution during refresh.
pub type DeferredFn = Box<dyn FnOnce(&mut StepProxy<'_>) -> EngineResult<()> + Send>;

/// Per-subtask mutable record: output buffer, kill set, deferred queue.
pub struct SubtaskState {
    pub(crate) output: Option<Box<dyn Any + Send>>,
    pub(crate) kill_set: SparseSet,
    pub(crate) deferred: Vec<DeferredFn>,
}

impl SubtaskState {
    fn new(output_factory: Option<&OutputFactory>) -> Self {
        Self {
            output: output_factory.map(|factory| factory()),
            kill_set: SparseSet::new(),
            deferred: Vec::new(),
        }
    }
}

/// Mutable runtime record of one declared system.
pub(crate) struct SystemInstance {
    /// Owned user state (`()` when none was declared).
    pub(crate) state: Box<dyn Any + Send + Sync>,
    /// Entity ids currently matched to the system's required signature.
    pub(crate) subscribed: SparseSet,
    /// One record per subtask of the current or most recent execution.
    pub(crate) subtasks: Vec<SubtaskState>,
}

impl SystemInstance {
    pub(crate) fn new(state: Box<dyn Any + Send + Sync>) -> Self {
        Self { state, subscribed: SparseSet::new(), subtasks: Vec::new() }
    }

    /// Discards previous subtask records and installs `count` fresh ones.
    pub(crate) fn prepare_subtasks(&mut self, count: usize, output_factory: Option<&OutputFactory>) {
        self.subtasks.clear();
        self.subtasks.reserve(count);
        for _ in 0..count {
            self.subtasks.push(SubtaskState::new(output_factory));
        }
    }
}

/// Subtask-form processing closure, type-erased over the user state.
pub(crate) type SubtaskFn<'a> =
    Box<dyn Fn(&dyn Any, &mut DataProxy<'_>) -> EngineResult<()> + Send + Sync + 'a>;

/// Instance-form processing closure, type-erased over the user state.
pub(crate) type InstanceFn<'a> =
    Box<dyn Fn(&mut dyn Any, &mut InstanceExecutor<'_>) -> EngineResult<()> + Send + Sync + 'a>;

pub(crate) enum AdapterKind<'a> {
    Subtasks(SubtaskFn<'a>),
    Instance(InstanceFn<'a>),
}

/// One `(tag set, processing closure)` pair.
pub struct Adapter<'a> {
    tags: Vec<SystemId>,
    pub(crate) kind: AdapterKind<'a>,
}

impl<'a> Adapter<'a> {
    /// Subtask-form adapter for the systems in `tags`.
    ///
    /// `f` runs once per subtask, concurrently with the system's other
    /// subtasks, with shared access to the user state. Every tagged system
    /// must carry a state of type `S` (use `()` for stateless systems).
    pub fn for_subtasks<S, F>(tags: &[SystemId], f: F) -> Self
    where
        S: Any + Send + Sync,
        F: Fn(&S, &mut DataProxy<'_>) -> EngineResult<()> + Send + Sync + 'a,
    {
        let run = move |state: &dyn Any, data: &mut DataProxy<'_>| -> EngineResult<()> {
            let state = state
                .downcast_ref::<S>()
                .unwrap_or_else(|| panic!("adapter expected state `{}`", type_name::<S>()));
            f(state, data)
        };
        Self { tags: tags.to_vec(), kind: AdapterKind::Subtasks(Box::new(run)) }
    }

    /// Instance-form adapter for a single system.
    ///
    /// `f` runs once per execution with exclusive access to the user state
    /// and an executor to drive the subtask fan-out and visit the produced
    /// outputs.
    pub fn for_instance<S, F>(tag: SystemId, f: F) -> Self
    where
        S: Any + Send + Sync,
        F: Fn(&mut S, &mut InstanceExecutor<'_>) -> EngineResult<()> + Send + Sync + 'a,
    {
        let run = move |state: &mut dyn Any, executor: &mut InstanceExecutor<'_>| -> EngineResult<()> {
            let state = state
                .downcast_mut::<S>()
                .unwrap_or_else(|| panic!("adapter expected state `{}`", type_name::<S>()));
            f(state, executor)
        };
        Self { tags: vec![tag], kind: AdapterKind::Instance(Box::new(run)) }
    }

    #[inline]
    fn matches(&self, system: SystemId) -> bool {
        self.tags.contains(&system)
    }
}

/// Ordered collection of adapters handed to a runner.
#[derive(Default)]
pub struct Adapters<'a> {
    entries: Vec<Adapter<'a>>,
}

impl<'a> Adapters<'a> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Appends an adapter; earlier adapters win on overlapping tags.
    pub fn with(mut self, adapter: Adapter<'a>) -> Self {
        self.entries.push(adapter);
        self
    }

    /// Binds every reachable system to its first matching adapter.
    pub(crate) fn bind(
        &self,
        names: &[&'static str],
        reachable: impl Fn(usize) -> bool,
    ) -> Result<Vec<Option<&AdapterKind<'a>>>, ConfigError> {
        let mut bound = Vec::with_capacity(names.len());
        for (index, &name) in names.iter().enumerate() {
            if !reachable(index) {
                bound.push(None);
                continue;
            }
            let entry = self
                .entries
                .iter()
                .find(|adapter| adapter.matches(index as SystemId))
                .map(|adapter| &adapter.kind);
            if entry.is_none() {
                return Err(ConfigError::MissingAdapter { system: name });
            }
            bound.push(entry);
        }
        Ok(bound)
    }
}
