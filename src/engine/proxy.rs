//! Step-level and system-level data proxies.
//!
//! User code never touches the engine core directly; it works through two
//! restricted views:
//!
//! - [`StepProxy`] is handed to the step body (and to deferred closures
//!   during refresh). It permits immediate critical operations — entity
//!   creation and killing, component add/remove, handle management — and
//!   starts DAG execution through [`SystemRunner`].
//! - [`DataProxy`] is handed to a system's processing closure, one per
//!   subtask. It exposes the subtask's entity slice, component access
//!   validated against the system's declared read/write sets, the
//!   subtask-owned output buffer, kill set, and deferred queue, and
//!   read-only views of completed dependencies.
//!
//! Structural mutation through a [`StepProxy`] is *recorded*: killed ids
//! and ids whose bitset changed land in the pending refresh state, and the
//! subscription sets catch up when the step's refresh runs. Between those
//! points the subscription index stays consistent with the committed
//! bitsets.

use std::any::{type_name, Any};

use crate::engine::entity::Handle;
use crate::engine::error::{EngineResult, StaleEntityError, StoreError};
use crate::engine::runtime::EngineCore;
use crate::engine::scheduler;
use crate::engine::storage::{slot_mut, slot_ref, Component};
use crate::engine::system::{Adapters, SubtaskState};
use crate::engine::types::{ComponentId, EntityId, SystemId};

/// Mutating view handed to the step body and to deferred closures.
pub struct StepProxy<'a> {
    core: &'a EngineCore,
    in_refresh: bool,
}

impl<'a> StepProxy<'a> {
    pub(crate) fn new(core: &'a EngineCore, in_refresh: bool) -> Self {
        Self { core, in_refresh }
    }

    fn component_id<T: Component>(&self) -> EngineResult<ComponentId> {
        self.core
            .registry
            .id_of::<T>()
            .ok_or_else(|| StoreError::UnregisteredComponent { component: type_name::<T>() }.into())
    }

    /// Allocates a fresh entity id, alive immediately.
    ///
    /// Fails with a capacity error in fixed-capacity mode once the table
    /// is full; existing entities are untouched by the failure.
    pub fn create_entity(&mut self) -> EngineResult<EntityId> {
        let id = {
            // SAFETY: step proxies run in exclusive phases.
            let entities = unsafe { self.core.entities_mut() };
            entities.create()?
        };
        // SAFETY: exclusive phase.
        unsafe { self.core.pending_mut() }.to_rematch.add(id);
        Ok(id)
    }

    /// Marks an alive entity for reclamation at the next refresh.
    ///
    /// The entity stays alive (and its handles valid) until the refresh
    /// runs; marking twice is harmless.
    pub fn kill_entity(&mut self, id: EntityId) -> EngineResult<()> {
        // SAFETY: exclusive phase; read-only use.
        if !unsafe { self.core.entities() }.alive(id) {
            return Err(StaleEntityError { id }.into());
        }
        // SAFETY: exclusive phase.
        unsafe { self.core.pending_mut() }.to_kill.add(id);
        Ok(())
    }

    /// Adds component `T` to `id`, default-constructed, and returns it for
    /// initialization. The entity is re-matched at the next refresh.
    pub fn add_component<T: Component>(&mut self, id: EntityId) -> EngineResult<&mut T> {
        let kind = self.component_id::<T>()?;
        {
            // SAFETY: exclusive phase.
            let entities = unsafe { self.core.entities_mut() };
            if !entities.alive(id) {
                return Err(StaleEntityError { id }.into());
            }
            if entities.bitset(id).has(kind) {
                return Err(StoreError::DoubleAdd {
                    component: self.core.registry.name(kind),
                    entity: id,
                }
                .into());
            }
            entities.bitset_mut(id).set(kind);
        }
        // SAFETY: exclusive phase.
        unsafe { self.core.pending_mut() }.to_rematch.add(id);
        // SAFETY: exclusive phase; the bit was clear, so the slot is free.
        let pointer = unsafe { self.core.store_mut(kind) }.add_default(id);
        // SAFETY: freshly constructed slot of type `T`.
        Ok(unsafe { &mut *(pointer as *mut T) })
    }

    /// Removes component `T` from `id`. The entity is re-matched at the
    /// next refresh.
    pub fn remove_component<T: Component>(&mut self, id: EntityId) -> EngineResult<()> {
        let kind = self.component_id::<T>()?;
        {
            // SAFETY: exclusive phase.
            let entities = unsafe { self.core.entities_mut() };
            if !entities.alive(id) {
                return Err(StaleEntityError { id }.into());
            }
            if !entities.bitset(id).has(kind) {
                return Err(StoreError::DoubleRemove {
                    component: self.core.registry.name(kind),
                    entity: id,
                }
                .into());
            }
            entities.bitset_mut(id).clear(kind);
        }
        // SAFETY: exclusive phase.
        unsafe { self.core.pending_mut() }.to_rematch.add(id);
        // SAFETY: exclusive phase; the bit was set, so the slot is live.
        unsafe { self.core.store_mut(kind) }.remove(id);
        Ok(())
    }

    /// Reads component `T` of `id`.
    pub fn get_component<T: Component>(&self, id: EntityId) -> EngineResult<&T> {
        let kind = self.component_id::<T>()?;
        // SAFETY: exclusive phase; read-only use.
        let entities = unsafe { self.core.entities() };
        if !entities.alive(id) {
            return Err(StaleEntityError { id }.into());
        }
        if !entities.bitset(id).has(kind) {
            return Err(StoreError::MissingComponent {
                component: self.core.registry.name(kind),
                entity: id,
            }
            .into());
        }
        // SAFETY: presence checked through the committed bitset.
        Ok(unsafe { slot_ref::<T>(self.core.store(kind), id) })
    }

    /// Mutable access to component `T` of `id`.
    pub fn get_component_mut<T: Component>(&mut self, id: EntityId) -> EngineResult<&mut T> {
        let kind = self.component_id::<T>()?;
        // SAFETY: exclusive phase; read-only use of the table.
        let entities = unsafe { self.core.entities() };
        if !entities.alive(id) {
            return Err(StaleEntityError { id }.into());
        }
        if !entities.bitset(id).has(kind) {
            return Err(StoreError::MissingComponent {
                component: self.core.registry.name(kind),
                entity: id,
            }
            .into());
        }
        // SAFETY: exclusive phase; presence checked above.
        Ok(unsafe { slot_mut::<T>(self.core.store(kind), id) })
    }

    /// Creates a handle to an alive entity.
    pub fn create_handle(&self, id: EntityId) -> EngineResult<Handle> {
        // SAFETY: exclusive phase; read-only use.
        let entities = unsafe { self.core.entities() };
        if !entities.alive(id) {
            return Err(StaleEntityError { id }.into());
        }
        Ok(entities.handle(id))
    }

    /// Returns `true` if `handle` still resolves.
    pub fn valid_handle(&self, handle: Handle) -> bool {
        // SAFETY: exclusive phase; read-only use.
        unsafe { self.core.entities() }.valid_handle(handle)
    }

    /// Resolves `handle` to its entity id.
    pub fn access(&self, handle: Handle) -> EngineResult<EntityId> {
        // SAFETY: exclusive phase; read-only use.
        Ok(unsafe { self.core.entities() }.access(handle)?)
    }

    /// Returns `true` if `id` is alive.
    pub fn alive(&self, id: EntityId) -> bool {
        // SAFETY: exclusive phase; read-only use.
        unsafe { self.core.entities() }.alive(id)
    }

    /// Number of alive entities.
    pub fn alive_count(&self) -> usize {
        // SAFETY: exclusive phase; read-only use.
        unsafe { self.core.entities() }.alive_count()
    }

    /// Read-only access to a system's user state.
    pub fn system<S: Any>(&self, system: SystemId) -> &S {
        // SAFETY: exclusive phase; no system is executing.
        let instance = unsafe { self.core.instance(system as usize) };
        instance
            .state
            .downcast_ref::<S>()
            .unwrap_or_else(|| panic!("system state is not `{}`", type_name::<S>()))
    }

    /// Exclusive access to a system's user state.
    pub fn system_mut<S: Any>(&mut self, system: SystemId) -> &mut S {
        // SAFETY: exclusive phase; no system is executing.
        let instance = unsafe { self.core.instance_mut(system as usize) };
        instance
            .state
            .downcast_mut::<S>()
            .unwrap_or_else(|| panic!("system state is not `{}`", type_name::<S>()))
    }

    /// Visits the output buffer of every subtask of `system`'s most recent
    /// execution, in subtask order.
    pub fn for_system_outputs<O: Any, F: FnMut(&mut O)>(&mut self, system: SystemId, mut f: F) {
        // SAFETY: exclusive phase; no system is executing.
        let instance = unsafe { self.core.instance_mut(system as usize) };
        for state in &mut instance.subtasks {
            if let Some(output) = state.output.as_mut() {
                let output = output
                    .downcast_mut::<O>()
                    .unwrap_or_else(|| panic!("system output is not `{}`", type_name::<O>()));
                f(output);
            }
        }
    }

    /// Prepares a runner over the whole DAG (every root system).
    pub fn execute_systems(&mut self) -> SystemRunner<'_, 'a> {
        assert!(!self.in_refresh, "cannot execute systems from a deferred closure");
        SystemRunner { proxy: self, roots: RootSelection::All }
    }

    /// Prepares a runner over the subgraph reachable from `roots`.
    pub fn execute_systems_from(&mut self, roots: &[SystemId]) -> SystemRunner<'_, 'a> {
        assert!(!self.in_refresh, "cannot execute systems from a deferred closure");
        SystemRunner { proxy: self, roots: RootSelection::From(roots.to_vec()) }
    }
}

enum RootSelection {
    All,
    From(Vec<SystemId>),
}

/// One prepared DAG execution; consumed by [`SystemRunner::run`].
pub struct SystemRunner<'p, 'a> {
    proxy: &'p mut StepProxy<'a>,
    roots: RootSelection,
}

impl SystemRunner<'_, '_> {
    /// Binds `adapters` to the reachable systems and drives the DAG to
    /// completion, blocking until every reachable system finished.
    pub fn run(self, adapters: &Adapters<'_>) -> EngineResult<()> {
        let core = self.proxy.core;
        let roots: Vec<usize> = match self.roots {
            RootSelection::All => core.graph.roots.clone(),
            RootSelection::From(ids) => {
                let count = core.graph.len();
                let mut roots = Vec::with_capacity(ids.len());
                for id in ids {
                    if (id as usize) >= count {
                        return Err(crate::engine::error::ConfigError::UnknownSystem {
                            context: "execute_systems_from",
                        }
                        .into());
                    }
                    roots.push(id as usize);
                }
                roots
            }
        };
        scheduler::execute_from(core, &roots, adapters)
    }
}

/// Restricted view handed to a system's processing closure, one per
/// subtask, covering one contiguous slice of the subscription set.
pub struct DataProxy<'a> {
    core: &'a EngineCore,
    system_index: usize,
    slice: &'a [EntityId],
    state: &'a mut SubtaskState,
}

impl<'a> DataProxy<'a> {
    pub(crate) fn new(
        core: &'a EngineCore,
        system_index: usize,
        slice: &'a [EntityId],
        state: &'a mut SubtaskState,
    ) -> Self {
        Self { core, system_index, slice, state }
    }

    fn component_id<T: Component>(&self) -> ComponentId {
        self.core
            .registry
            .id_of::<T>()
            .unwrap_or_else(|| panic!("component type `{}` was never declared", type_name::<T>()))
    }

    /// Number of entities in this subtask's slice.
    #[inline]
    pub fn entity_count(&self) -> usize {
        self.slice.len()
    }

    /// The entity id at slice position `index`.
    #[inline]
    pub fn entity(&self, index: usize) -> EntityId {
        self.slice[index]
    }

    /// Invokes `f` for every entity in this subtask's slice.
    pub fn for_entities<F: FnMut(&mut DataProxy<'a>, EntityId)>(&mut self, mut f: F) {
        for index in 0..self.slice.len() {
            let id = self.slice[index];
            f(&mut *self, id);
        }
    }

    /// Reads component `T` of `id`.
    ///
    /// `T` must be in the system's declared read or write set; the check is
    /// unconditional because the schedule's non-conflict guarantee rests on
    /// it. Presence on the entity is a debug assertion.
    pub fn get<T: Component>(&self, id: EntityId) -> &T {
        let kind = self.component_id::<T>();
        let declaration = &self.core.graph.systems[self.system_index];
        assert!(
            declaration.reads.has(kind) || declaration.writes.has(kind),
            "system `{}` did not declare access to `{}`",
            declaration.name,
            type_name::<T>()
        );
        // SAFETY: bitsets are not mutated during execution.
        debug_assert!(unsafe { self.core.entities() }.bitset(id).has(kind));
        // SAFETY: read access covered by the schedule's non-conflict
        // guarantee; presence enforced by the store.
        unsafe { slot_ref::<T>(self.core.store(kind), id) }
    }

    /// Mutable access to component `T` of `id`.
    ///
    /// `T` must be in the system's declared write set; the check is
    /// unconditional because an undeclared writer would race systems the
    /// scheduler considers independent. Per-entity disjointness across
    /// subtasks makes the access exclusive.
    pub fn get_mut<T: Component>(&mut self, id: EntityId) -> &mut T {
        let kind = self.component_id::<T>();
        let declaration = &self.core.graph.systems[self.system_index];
        assert!(
            declaration.writes.has(kind),
            "system `{}` did not declare write access to `{}`",
            declaration.name,
            type_name::<T>()
        );
        // SAFETY: bitsets are not mutated during execution.
        debug_assert!(unsafe { self.core.entities() }.bitset(id).has(kind));
        // SAFETY: write access covered by the schedule; one writer system
        // at a time, disjoint ids across its subtasks.
        unsafe { slot_mut::<T>(self.core.store(kind), id) }
    }

    /// Adds `id` to this subtask's kill set; the entity is reclaimed at
    /// the step's refresh.
    pub fn kill_entity(&mut self, id: EntityId) {
        // SAFETY: bitsets and liveness are not mutated during execution.
        debug_assert!(unsafe { self.core.entities() }.alive(id), "killing a dead entity");
        self.state.kill_set.add(id);
    }

    /// Queues a closure for sequential execution during the step's
    /// refresh, with a step-level proxy for immediate operations.
    pub fn defer<F>(&mut self, f: F)
    where
        F: FnOnce(&mut StepProxy<'_>) -> EngineResult<()> + Send + 'static,
    {
        self.state.deferred.push(Box::new(f));
    }

    /// Mutable access to this subtask's output buffer.
    pub fn output<O: Any>(&mut self) -> &mut O {
        self.state
            .output
            .as_mut()
            .expect("system declared no output buffer")
            .downcast_mut::<O>()
            .unwrap_or_else(|| panic!("system output is not `{}`", type_name::<O>()))
    }

    /// Visits the output buffer every subtask of `dependency` produced, in
    /// subtask order. `dependency` must be a (transitive) dependency of
    /// this system, so its execution is complete and visible.
    pub fn for_previous_outputs<O: Any, F: FnMut(&O)>(&self, dependency: SystemId, mut f: F) {
        self.assert_dependency(dependency);
        // SAFETY: the dependency completed before this system started.
        let instance = unsafe { self.core.instance(dependency as usize) };
        for state in &instance.subtasks {
            if let Some(output) = state.output.as_ref() {
                let output = output
                    .downcast_ref::<O>()
                    .unwrap_or_else(|| panic!("system output is not `{}`", type_name::<O>()));
                f(output);
            }
        }
    }

    /// Read-only access to a dependency's user state.
    pub fn system<S: Any>(&self, dependency: SystemId) -> &S {
        self.assert_dependency(dependency);
        // SAFETY: the dependency completed before this system started.
        let instance = unsafe { self.core.instance(dependency as usize) };
        instance
            .state
            .downcast_ref::<S>()
            .unwrap_or_else(|| panic!("system state is not `{}`", type_name::<S>()))
    }

    fn assert_dependency(&self, dependency: SystemId) {
        let graph = &self.core.graph;
        assert!(
            graph.ancestors[self.system_index].has(dependency as usize),
            "system `{}` is not a dependency of `{}`",
            graph.systems[dependency as usize].name,
            graph.systems[self.system_index].name
        );
    }
}

/// Exclusive per-execution view handed to an instance adapter.
///
/// Drives the subtask fan-out explicitly and visits the outputs the
/// subtasks produced, so user state can be prepared before and folded
/// after — the pattern a spatial-partition system needs.
pub struct InstanceExecutor<'a> {
    core: &'a EngineCore,
    system_index: usize,
    subtask_count: usize,
}

impl<'a> InstanceExecutor<'a> {
    pub(crate) fn new(core: &'a EngineCore, system_index: usize, subtask_count: usize) -> Self {
        Self { core, system_index, subtask_count }
    }

    /// Number of subtasks this execution was sliced into.
    #[inline]
    pub fn subtask_count(&self) -> usize {
        self.subtask_count
    }

    /// Runs `f` over every subtask slice, in parallel per the system's
    /// policy, and blocks until all slices completed.
    pub fn for_subtasks<F>(&mut self, f: F) -> EngineResult<()>
    where
        F: Fn(&mut DataProxy<'_>) -> EngineResult<()> + Send + Sync,
    {
        static UNIT: () = ();
        let run = move |_state: &dyn Any, data: &mut DataProxy<'_>| f(data);
        crate::engine::executor::fan_out(
            self.core,
            self.system_index,
            self.subtask_count,
            &UNIT as &(dyn Any + Send + Sync) as *const _,
            &run,
        )
    }

    /// Visits the output buffer of every subtask, in subtask order. Call
    /// after [`InstanceExecutor::for_subtasks`] to fold results into the
    /// user state.
    pub fn for_outputs<O: Any, F: FnMut(&mut O)>(&mut self, mut f: F) {
        // SAFETY: field projection; the adapter holds the `state` field,
        // this touches only `subtasks`, and the fan-out has completed.
        let subtasks = unsafe { &mut (*self.core.instance_ptr(self.system_index)).subtasks };
        for state in subtasks {
            if let Some(output) = state.output.as_mut() {
                let output = output
                    .downcast_mut::<O>()
                    .unwrap_or_else(|| panic!("system output is not `{}`", type_name::<O>()));
                f(output);
            }
        }
    }
}
