//! Refresh pipeline.
//!
//! Runs synchronously after every step body and restores the engine's
//! invariants:
//!
//! * **R1 — deferred closures.** Every queue is drained in deterministic
//!   order (systems in declaration order, subtasks in index order,
//!   closures in push order) and executed single-threaded against a
//!   step-level proxy. A failing closure records the step's first error;
//!   the drain continues so the data structures stay consistent.
//! * **R2 — reclamation.** Subtask kill sets are unioned into the pending
//!   kill set, removed from every subscription set in parallel across
//!   systems, and the dead ids are reclaimed exactly once (generation
//!   bump, bitset and component cleanup).
//! * **R3 — rematch.** Every id whose bitset changed (or that was just
//!   created) is re-matched against every system's required signature, in
//!   parallel across systems; subscription hooks fire on actual
//!   transitions only.
//!
//! The parallel loops mutate disjoint per-system subscription sets, so
//! they are plain data-parallel sweeps.

use rayon::prelude::*;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::proxy::StepProxy;
use crate::engine::runtime::EngineCore;
use crate::engine::sparse::SparseSet;
use crate::engine::system::DeferredFn;
use crate::engine::types::{EntityId, SystemId};

/// Side effects accumulated during a step, consumed by the refresh.
#[derive(Default)]
pub(crate) struct RefreshState {
    /// Ids marked for reclamation.
    pub(crate) to_kill: SparseSet,
    /// Ids whose component bitset changed, or that were just created.
    pub(crate) to_rematch: SparseSet,
}

type SubscriptionHook<'a> = Box<dyn Fn(SystemId, EntityId) + Send + Sync + 'a>;
type ReclaimHook<'a> = Box<dyn Fn(EntityId) + Send + Sync + 'a>;

/// Optional event hooks invoked from within the refresh, on the thread
/// performing the mutation.
#[derive(Default)]
pub struct RefreshHandlers<'a> {
    on_subscribe: Option<SubscriptionHook<'a>>,
    on_unsubscribe: Option<SubscriptionHook<'a>>,
    on_reclaim: Option<ReclaimHook<'a>>,
}

impl<'a> RefreshHandlers<'a> {
    /// No hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked after an entity is inserted into a subscription set.
    pub fn on_subscribe<F: Fn(SystemId, EntityId) + Send + Sync + 'a>(mut self, f: F) -> Self {
        self.on_subscribe = Some(Box::new(f));
        self
    }

    /// Invoked after an entity is removed from a subscription set.
    pub fn on_unsubscribe<F: Fn(SystemId, EntityId) + Send + Sync + 'a>(mut self, f: F) -> Self {
        self.on_unsubscribe = Some(Box::new(f));
        self
    }

    /// Invoked after an entity id is reclaimed.
    pub fn on_reclaim<F: Fn(EntityId) + Send + Sync + 'a>(mut self, f: F) -> Self {
        self.on_reclaim = Some(Box::new(f));
        self
    }
}

/// Runs the full pipeline. Always drains every queue and restores the
/// subscription invariants; returns the first error a deferred closure
/// produced.
pub(crate) fn run(core: &mut EngineCore, handlers: &RefreshHandlers<'_>) -> EngineResult<()> {
    let mut first_error: Option<EngineError> = None;

    // R1: drain all deferred queues, then execute in order.
    let mut queue: Vec<DeferredFn> = Vec::new();
    for cell in &mut core.instances {
        let instance = cell.0.get_mut();
        for state in &mut instance.subtasks {
            queue.append(&mut state.deferred);
        }
    }
    if !queue.is_empty() {
        log::trace!("refresh: {} deferred closures", queue.len());
        let mut proxy = StepProxy::new(core, true);
        for deferred in queue {
            if let Err(error) = deferred(&mut proxy) {
                if first_error.is_none() {
                    log::warn!("deferred closure failed: {error}");
                    first_error = Some(error);
                }
            }
        }
    }

    // Take the accumulated step effects; union in the subtask kill sets
    // (read-then-cleared).
    let mut state = std::mem::take(core.pending.0.get_mut());
    for cell in &mut core.instances {
        let instance = cell.0.get_mut();
        for subtask in &mut instance.subtasks {
            for id in subtask.kill_set.iter() {
                state.to_kill.add(id);
            }
            subtask.kill_set.clear();
        }
    }

    // R2: drop dead ids from every subscription set, then reclaim them.
    if !state.to_kill.is_empty() {
        let to_kill = &state.to_kill;
        core.instances.par_iter_mut().enumerate().for_each(|(system, cell)| {
            let instance = cell.0.get_mut();
            for id in to_kill.iter() {
                if instance.subscribed.remove(id) {
                    if let Some(hook) = &handlers.on_unsubscribe {
                        hook(system as SystemId, id);
                    }
                }
            }
        });

        let entities = core.entities.0.get_mut();
        for id in state.to_kill.iter() {
            if entities.alive(id) {
                for kind in entities.bitset(id).iter_components() {
                    core.stores[kind as usize].0.get_mut().remove(id);
                }
                entities.reclaim(id);
                if let Some(hook) = &handlers.on_reclaim {
                    hook(id);
                }
            }
        }
    }

    // R3: re-match every changed id against every system.
    if !state.to_rematch.is_empty() {
        let entities: &crate::engine::entity::EntityTable = core.entities.0.get_mut();
        let graph = &core.graph;
        let to_rematch = &state.to_rematch;
        core.instances.par_iter_mut().enumerate().for_each(|(system, cell)| {
            let instance = cell.0.get_mut();
            let required = &graph.systems[system].required;
            for id in to_rematch.iter() {
                let matched = entities.alive(id) && entities.bitset(id).contains_all(required);
                if matched {
                    if instance.subscribed.add(id) {
                        if let Some(hook) = &handlers.on_subscribe {
                            hook(system as SystemId, id);
                        }
                    }
                } else if instance.subscribed.remove(id) {
                    if let Some(hook) = &handlers.on_unsubscribe {
                        hook(system as SystemId, id);
                    }
                }
            }
        });
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
