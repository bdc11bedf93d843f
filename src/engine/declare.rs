//! Engine declaration and construction-time validation.
//!
//! Everything the engine executes is declared ahead of time: the closed set
//! of component kinds with their storage bindings, the closed set of
//! systems with their read/write sets, dependencies, inner-parallelism
//! policies, optional typed output buffers, and optional owned state.
//!
//! [`Engine::new`](crate::Engine::new) compiles an [`EngineDeclaration`]
//! into an immutable [`SystemGraph`]: it validates identifiers, rejects
//! dependency cycles, checks that systems without a dependency path never
//! conflict on component access, and precomputes per-root reachability and
//! per-system ancestor sets (the DAG is static, so this happens exactly
//! once).

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;

use crate::engine::error::ConfigError;
use crate::engine::storage::{new_store, Component, ErasedStore};
use crate::engine::types::{
    build_signature, ComponentId, EntityStorage, InnerParallelism, InnerParallelismMode,
    SchedulerKind, Signature, StorageKind, SystemId,
};

/// Factory for a per-subtask output buffer.
pub(crate) type OutputFactory = Box<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Factory for a component store.
pub(crate) type StoreFactory = Box<dyn FnOnce() -> Box<dyn ErasedStore>>;

pub(crate) struct ComponentDecl {
    pub(crate) name: &'static str,
    pub(crate) type_id: TypeId,
    pub(crate) factory: StoreFactory,
}

/// Static declaration of one system.
///
/// Built fluently and handed to [`EngineDeclaration::system`]:
///
/// ```ignore
/// let collide = decl.system(
///     SystemDeclaration::new("collision")
///         .reads(&[circle])
///         .writes(&[position, velocity])
///         .depends_on(&[partition])
///         .parallelism(InnerParallelism::SplitEvenlyCores)
///         .output::<Vec<Contact>>(),
/// );
/// ```
pub struct SystemDeclaration {
    pub(crate) name: &'static str,
    pub(crate) reads: Vec<ComponentId>,
    pub(crate) writes: Vec<ComponentId>,
    pub(crate) dependencies: Vec<SystemId>,
    pub(crate) parallelism: InnerParallelism,
    pub(crate) output_factory: Option<OutputFactory>,
    pub(crate) state: Box<dyn Any + Send + Sync>,
}

impl SystemDeclaration {
    /// Starts a declaration for a system named `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            reads: Vec::new(),
            writes: Vec::new(),
            dependencies: Vec::new(),
            parallelism: InnerParallelism::None,
            output_factory: None,
            state: Box::new(()),
        }
    }

    /// Component kinds this system reads.
    pub fn reads(mut self, components: &[ComponentId]) -> Self {
        self.reads.extend_from_slice(components);
        self
    }

    /// Component kinds this system writes.
    pub fn writes(mut self, components: &[ComponentId]) -> Self {
        self.writes.extend_from_slice(components);
        self
    }

    /// Systems that must complete before this one starts within a step.
    pub fn depends_on(mut self, systems: &[SystemId]) -> Self {
        self.dependencies.extend_from_slice(systems);
        self
    }

    /// Inner-parallelism policy (defaults to [`InnerParallelism::None`]).
    pub fn parallelism(mut self, policy: InnerParallelism) -> Self {
        self.parallelism = policy;
        self
    }

    /// Declares a per-subtask output buffer of type `O`.
    ///
    /// A fresh default `O` is created for every subtask at the start of each
    /// execution; dependents read the buffers through
    /// [`DataProxy::for_previous_outputs`](crate::DataProxy::for_previous_outputs).
    pub fn output<O: Default + Send + 'static>(mut self) -> Self {
        self.output_factory = Some(Box::new(|| Box::new(O::default())));
        self
    }

    /// Owned user state for this system (e.g. a spatial-partition grid).
    ///
    /// Shared (`&S`) inside subtask adapters; exclusive (`&mut S`) inside
    /// instance adapters and from the step proxy.
    pub fn state<S: Any + Send + Sync>(mut self, state: S) -> Self {
        self.state = Box::new(state);
        self
    }
}

/// Builder for a complete engine configuration.
pub struct EngineDeclaration {
    pub(crate) components: Vec<ComponentDecl>,
    pub(crate) by_type: HashMap<TypeId, ComponentId>,
    pub(crate) duplicate_component: Option<&'static str>,
    pub(crate) systems: Vec<SystemDeclaration>,
    pub(crate) entity_storage: EntityStorage,
    pub(crate) workers: Option<usize>,
    pub(crate) inner_mode: InnerParallelismMode,
    pub(crate) scheduler: SchedulerKind,
}

impl Default for EngineDeclaration {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineDeclaration {
    /// Creates an empty declaration.
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            by_type: HashMap::new(),
            duplicate_component: None,
            systems: Vec::new(),
            entity_storage: EntityStorage::default(),
            workers: None,
            inner_mode: InnerParallelismMode::Allow,
            scheduler: SchedulerKind::AtomicCounter,
        }
    }

    /// Declares a component kind with its storage binding and returns its
    /// dense id. Ids are assigned in declaration order.
    pub fn component<T: Component>(&mut self, storage: StorageKind) -> ComponentId {
        let id = self.components.len() as ComponentId;
        let type_id = TypeId::of::<T>();
        if self.by_type.insert(type_id, id).is_some() && self.duplicate_component.is_none() {
            self.duplicate_component = Some(type_name::<T>());
        }
        self.components.push(ComponentDecl {
            name: type_name::<T>(),
            type_id,
            factory: Box::new(move || new_store::<T>(storage)),
        });
        id
    }

    /// Declares a system and returns its dense id.
    pub fn system(&mut self, declaration: SystemDeclaration) -> SystemId {
        let id = self.systems.len() as SystemId;
        self.systems.push(declaration);
        id
    }

    /// Sets the entity table sizing mode.
    pub fn entity_storage(&mut self, mode: EntityStorage) -> &mut Self {
        self.entity_storage = mode;
        self
    }

    /// Overrides the worker thread count (defaults to the logical core
    /// count).
    pub fn workers(&mut self, count: usize) -> &mut Self {
        self.workers = Some(count.max(1));
        self
    }

    /// Sets the global inner-parallelism toggle.
    pub fn inner_parallelism(&mut self, mode: InnerParallelismMode) -> &mut Self {
        self.inner_mode = mode;
        self
    }

    /// Selects the outer scheduler.
    pub fn scheduler(&mut self, kind: SchedulerKind) -> &mut Self {
        self.scheduler = kind;
        self
    }
}

/// Dynamically sized bitset over system indices.
#[derive(Clone, Debug, Default)]
pub(crate) struct SysMask {
    words: Vec<u64>,
}

impl SysMask {
    pub(crate) fn new(systems: usize) -> Self {
        Self { words: vec![0; (systems + 63) / 64] }
    }

    #[inline]
    pub(crate) fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    #[inline]
    pub(crate) fn has(&self, index: usize) -> bool {
        (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    pub(crate) fn union_with(&mut self, other: &SysMask) {
        for (word, other_word) in self.words.iter_mut().zip(other.words.iter()) {
            *word |= *other_word;
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// One system after compilation: resolved signatures plus graph edges.
pub(crate) struct CompiledSystem {
    pub(crate) name: &'static str,
    pub(crate) reads: Signature,
    pub(crate) writes: Signature,
    pub(crate) required: Signature,
    pub(crate) dependencies: Vec<usize>,
    pub(crate) dependents: Vec<usize>,
    pub(crate) parallelism: InnerParallelism,
    pub(crate) output_factory: Option<OutputFactory>,
}

/// The compiled, immutable system DAG.
pub(crate) struct SystemGraph {
    pub(crate) systems: Vec<CompiledSystem>,
    /// Systems with no dependencies, in declaration order.
    pub(crate) roots: Vec<usize>,
    /// Per system: forward-reachable systems (through dependents),
    /// including itself.
    pub(crate) reachable: Vec<SysMask>,
    /// Per system: transitive dependencies, excluding itself.
    pub(crate) ancestors: Vec<SysMask>,
}

impl SystemGraph {
    /// Compiles and validates the declared systems. Consumes the
    /// declarations' graph-relevant fields; user states and output
    /// factories are moved out by the caller beforehand.
    pub(crate) fn compile(
        declarations: &mut Vec<SystemDeclaration>,
        component_count: usize,
    ) -> Result<Self, ConfigError> {
        let count = declarations.len();
        let mut systems = Vec::with_capacity(count);

        for declaration in declarations.iter_mut() {
            let in_range = |ids: &[ComponentId]| ids.iter().all(|&c| (c as usize) < component_count);
            if !in_range(&declaration.reads) || !in_range(&declaration.writes) {
                return Err(ConfigError::UnknownComponent { system: declaration.name });
            }
            if declaration.dependencies.iter().any(|&s| (s as usize) >= count) {
                return Err(ConfigError::UnknownSystem { context: declaration.name });
            }

            let reads = build_signature(&declaration.reads);
            let writes = build_signature(&declaration.writes);
            let mut required = reads;
            required.union_with(&writes);

            let mut dependencies: Vec<usize> =
                declaration.dependencies.iter().map(|&s| s as usize).collect();
            dependencies.sort_unstable();
            dependencies.dedup();

            systems.push(CompiledSystem {
                name: declaration.name,
                reads,
                writes,
                required,
                dependencies,
                dependents: Vec::new(),
                parallelism: declaration.parallelism.clone(),
                output_factory: declaration.output_factory.take(),
            });
        }

        for index in 0..count {
            for dep_index in 0..systems[index].dependencies.len() {
                let dependency = systems[index].dependencies[dep_index];
                systems[dependency].dependents.push(index);
            }
        }

        let order = topological_order(&systems)?;

        // Ancestors: transitive dependency closure, walked in topological
        // order so every dependency is finished before its dependents.
        let mut ancestors: Vec<SysMask> = (0..count).map(|_| SysMask::new(count)).collect();
        for &index in &order {
            let mut mask = SysMask::new(count);
            for &dependency in &systems[index].dependencies {
                mask.set(dependency);
                mask.union_with(&ancestors[dependency]);
            }
            ancestors[index] = mask;
        }

        // Non-conflict precondition: two systems with no path between them
        // must not have intersecting write vs. read-or-write sets.
        for first in 0..count {
            for second in (first + 1)..count {
                if ancestors[first].has(second) || ancestors[second].has(first) {
                    continue;
                }
                let a = &systems[first];
                let b = &systems[second];
                let mut b_touched = b.reads;
                b_touched.union_with(&b.writes);
                let mut a_touched = a.reads;
                a_touched.union_with(&a.writes);
                if a.writes.intersects(&b_touched) || b.writes.intersects(&a_touched) {
                    return Err(ConfigError::AccessConflict { first: a.name, second: b.name });
                }
            }
        }

        // Forward reachability through dependents, walked in reverse
        // topological order.
        let mut reachable: Vec<SysMask> = (0..count).map(|_| SysMask::new(count)).collect();
        for &index in order.iter().rev() {
            let mut mask = SysMask::new(count);
            mask.set(index);
            for dep_index in 0..systems[index].dependents.len() {
                let dependent = systems[index].dependents[dep_index];
                mask.union_with(&reachable[dependent]);
            }
            reachable[index] = mask;
        }

        let roots = (0..count).filter(|&i| systems[i].dependencies.is_empty()).collect();

        Ok(Self { systems, roots, reachable, ancestors })
    }

    /// Number of declared systems.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.systems.len()
    }
}

/// Kahn's algorithm; reports a member of the cycle on failure.
fn topological_order(systems: &[CompiledSystem]) -> Result<Vec<usize>, ConfigError> {
    let count = systems.len();
    let mut in_degree: Vec<usize> = systems.iter().map(|s| s.dependencies.len()).collect();
    let mut queue: Vec<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(index) = queue.pop() {
        order.push(index);
        for &dependent in &systems[index].dependents {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if order.len() != count {
        let stuck = (0..count)
            .find(|&i| in_degree[i] > 0)
            .expect("incomplete order implies a positive in-degree");
        return Err(ConfigError::CyclicDependency { system: systems[stuck].name });
    }
    Ok(order)
}
