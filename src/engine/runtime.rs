//! Engine construction, the shared core, and the step entry point.
//!
//! [`Engine::new`] compiles a declaration into the immutable system graph,
//! allocates the component stores and system instances, and spins up the
//! worker pool. [`Engine::step`] runs one step: the user body (which may
//! drive the DAG through a runner) followed unconditionally by the refresh
//! pipeline.
//!
//! ## Interior mutability and phase discipline
//!
//! The engine core is shared by reference with pool workers while a runner
//! is in flight, so its mutable parts live in `UnsafeCell` wrappers. Safety
//! rests on the engine's phase discipline rather than on locks:
//!
//! - **Step body** (exclusive): the step proxy mutates the entity table,
//!   stores, and pending refresh state; no worker touches the core.
//! - **DAG execution** (shared): workers mutate only per-system instances
//!   they were scheduled exclusively for, and component slots allowed by
//!   the statically checked read/write sets; the table, the subscription
//!   sets, and the pending state are read-only.
//! - **Refresh** (exclusive, with internally disjoint parallel loops).
//!
//! `Engine::step` takes `&mut self`, so phases never overlap across
//! threads of the embedding application.

use std::any::TypeId;
use std::cell::UnsafeCell;
use std::collections::HashMap;

use crate::engine::declare::{EngineDeclaration, SystemGraph};
use crate::engine::entity::{EntityTable, Handle};
use crate::engine::error::{ConfigError, EngineResult};
use crate::engine::proxy::StepProxy;
use crate::engine::refresh::{self, RefreshHandlers, RefreshState};
use crate::engine::storage::{Component, ErasedStore};
use crate::engine::sync::WorkerPool;
use crate::engine::system::SystemInstance;
use crate::engine::types::{
    ComponentId, EntityId, InnerParallelismMode, SystemId, COMPONENT_CAP,
};

/// Per-engine mapping from component types to dense ids.
pub(crate) struct ComponentRegistry {
    names: Vec<&'static str>,
    by_type: HashMap<TypeId, ComponentId>,
}

impl ComponentRegistry {
    /// Dense id of component type `T`, if declared.
    #[inline]
    pub(crate) fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Diagnostic name of a component kind.
    #[inline]
    pub(crate) fn name(&self, id: ComponentId) -> &'static str {
        self.names[id as usize]
    }
}

// The cells below wrap the core's phase-disciplined mutable state. Their
// `Sync` impls are what allow a `&EngineCore` to cross into pool workers;
// the module-level discipline is the safety argument.

pub(crate) struct TableCell(pub(crate) UnsafeCell<EntityTable>);
// SAFETY: mutated only in exclusive phases; read-only while shared.
unsafe impl Sync for TableCell {}

pub(crate) struct StoreCell(pub(crate) UnsafeCell<Box<dyn ErasedStore>>);
// SAFETY: structural mutation only in exclusive phases; element access
// during execution follows the statically checked read/write sets.
unsafe impl Sync for StoreCell {}

pub(crate) struct InstanceCell(pub(crate) UnsafeCell<SystemInstance>);
// SAFETY: the scheduler runs each system at most once per call and carves
// disjoint subtask records; dependents read only after completion.
unsafe impl Sync for InstanceCell {}

pub(crate) struct PendingCell(pub(crate) UnsafeCell<RefreshState>);
// SAFETY: mutated only in exclusive phases.
unsafe impl Sync for PendingCell {}

/// Everything the engine owns, shared by reference with pool workers.
pub(crate) struct EngineCore {
    pub(crate) graph: SystemGraph,
    pub(crate) registry: ComponentRegistry,
    pub(crate) entities: TableCell,
    pub(crate) stores: Vec<StoreCell>,
    pub(crate) instances: Vec<InstanceCell>,
    pub(crate) pending: PendingCell,
    pub(crate) pool: WorkerPool,
    pub(crate) inner_mode: InnerParallelismMode,
}

impl EngineCore {
    /// Shared view of the entity table.
    ///
    /// # Safety
    /// No exclusive access to the table may exist for the returned
    /// lifetime (guaranteed outside the step proxy's mutating calls).
    pub(crate) unsafe fn entities(&self) -> &EntityTable {
        unsafe { &*self.entities.0.get() }
    }

    /// Exclusive view of the entity table.
    ///
    /// # Safety
    /// Caller must be in an exclusive phase (step body or refresh).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn entities_mut(&self) -> &mut EntityTable {
        unsafe { &mut *self.entities.0.get() }
    }

    /// Shared view of a component store.
    ///
    /// # Safety
    /// No structural mutation of the store may be in flight.
    pub(crate) unsafe fn store(&self, id: ComponentId) -> &dyn ErasedStore {
        unsafe { (*self.stores[id as usize].0.get()).as_ref() }
    }

    /// Exclusive view of a component store.
    ///
    /// # Safety
    /// Caller must be in an exclusive phase.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn store_mut(&self, id: ComponentId) -> &mut dyn ErasedStore {
        unsafe { (*self.stores[id as usize].0.get()).as_mut() }
    }

    /// Shared view of a completed (or never-started) system instance.
    ///
    /// # Safety
    /// The instance must not be executing.
    pub(crate) unsafe fn instance(&self, index: usize) -> &SystemInstance {
        unsafe { &*self.instances[index].0.get() }
    }

    /// Exclusive view of a system instance.
    ///
    /// # Safety
    /// Caller must be the instance's scheduled task or an exclusive phase.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn instance_mut(&self, index: usize) -> &mut SystemInstance {
        unsafe { &mut *self.instances[index].0.get() }
    }

    /// Raw pointer to a system instance, for subtask borrow carving.
    #[inline]
    pub(crate) fn instance_ptr(&self, index: usize) -> *mut SystemInstance {
        self.instances[index].0.get()
    }

    /// Exclusive view of the pending refresh state.
    ///
    /// # Safety
    /// Caller must be in an exclusive phase.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn pending_mut(&self) -> &mut RefreshState {
        unsafe { &mut *self.pending.0.get() }
    }

    /// Worker thread count.
    #[inline]
    pub(crate) fn workers(&self) -> usize {
        self.pool.size()
    }
}

/// The execution engine.
///
/// Owns the compiled system DAG, the entity table, the component stores,
/// the system instances, and the worker pool. Multiple engines are allowed
/// and fully independent.
pub struct Engine {
    core: EngineCore,
}

impl Engine {
    /// Compiles `declaration` and builds a ready engine.
    ///
    /// All [`ConfigError`]s except adapter completeness surface here.
    pub fn new(mut declaration: EngineDeclaration) -> EngineResult<Engine> {
        if let Some(name) = declaration.duplicate_component {
            return Err(ConfigError::DuplicateComponent { name }.into());
        }
        if declaration.components.len() > COMPONENT_CAP {
            return Err(ConfigError::TooManyComponents {
                declared: declaration.components.len(),
                cap: COMPONENT_CAP,
            }
            .into());
        }

        let graph = SystemGraph::compile(&mut declaration.systems, declaration.components.len())?;

        let entities = EntityTable::new(declaration.entity_storage);
        let initial_capacity = entities.capacity();

        let mut names = Vec::with_capacity(declaration.components.len());
        let mut by_type = HashMap::with_capacity(declaration.components.len());
        let mut stores = Vec::with_capacity(declaration.components.len());
        for (index, component) in declaration.components.drain(..).enumerate() {
            names.push(component.name);
            by_type.insert(component.type_id, index as ComponentId);
            let mut store = (component.factory)();
            store.ensure_capacity(initial_capacity);
            stores.push(StoreCell(UnsafeCell::new(store)));
        }

        let instances = declaration
            .systems
            .drain(..)
            .map(|system| InstanceCell(UnsafeCell::new(SystemInstance::new(system.state))))
            .collect();

        let workers = declaration.workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
        });

        log::debug!(
            "engine built: {} components, {} systems, {} workers, {:?} scheduler",
            names.len(),
            graph.len(),
            workers,
            declaration.scheduler
        );

        Ok(Engine {
            core: EngineCore {
                graph,
                registry: ComponentRegistry { names, by_type },
                entities: TableCell(UnsafeCell::new(entities)),
                stores,
                instances,
                pending: PendingCell(UnsafeCell::new(RefreshState::default())),
                pool: WorkerPool::new(workers),
                inner_mode: declaration.inner_mode,
            },
        })
    }

    /// Runs one step: the body, then the refresh pipeline.
    ///
    /// Refresh runs even when the body fails, so the engine's invariants
    /// hold afterwards either way; the body's error takes precedence in the
    /// returned result.
    pub fn step<F>(&mut self, body: F) -> EngineResult<()>
    where
        F: FnOnce(&mut StepProxy<'_>) -> EngineResult<()>,
    {
        self.step_with(&RefreshHandlers::default(), body)
    }

    /// As [`Engine::step`], invoking `handlers` on subscription and reclaim
    /// events during the refresh.
    pub fn step_with<F>(&mut self, handlers: &RefreshHandlers<'_>, body: F) -> EngineResult<()>
    where
        F: FnOnce(&mut StepProxy<'_>) -> EngineResult<()>,
    {
        let body_result = {
            let mut proxy = StepProxy::new(&self.core, false);
            body(&mut proxy)
        };
        if body_result.is_err() {
            log::warn!("step body failed; refresh still runs to restore invariants");
        }
        let refresh_result = refresh::run(&mut self.core, handlers);
        body_result.and(refresh_result)
    }

    /// Worker thread count.
    pub fn workers(&self) -> usize {
        self.core.workers()
    }

    /// Number of alive entities.
    pub fn alive_count(&self) -> usize {
        // SAFETY: `&self` access between steps; no mutation in flight.
        unsafe { self.core.entities() }.alive_count()
    }

    /// Returns `true` if `id` is alive.
    pub fn alive(&self, id: EntityId) -> bool {
        // SAFETY: as `alive_count`.
        unsafe { self.core.entities() }.alive(id)
    }

    /// Returns `true` if `handle` still resolves.
    pub fn valid_handle(&self, handle: Handle) -> bool {
        // SAFETY: as `alive_count`.
        unsafe { self.core.entities() }.valid_handle(handle)
    }

    /// Returns `true` if `id` is currently subscribed to `system`.
    pub fn is_subscribed(&self, system: SystemId, id: EntityId) -> bool {
        // SAFETY: `&self` access between steps; instances are quiescent.
        unsafe { self.core.instance(system as usize) }.subscribed.contains(id)
    }

    /// Number of entities currently subscribed to `system`.
    pub fn subscription_count(&self, system: SystemId) -> usize {
        // SAFETY: as `is_subscribed`.
        unsafe { self.core.instance(system as usize) }.subscribed.len()
    }
}
