//! Outer DAG scheduler.
//!
//! This module drives a step's system DAG to completion:
//!
//! * reachability from the requested roots is looked up in masks
//!   precomputed at construction (the DAG is static),
//! * every reachable system gets a per-execution task record holding an
//!   atomic remaining-dependency counter,
//! * roots are submitted to the worker pool; each finished task decrements
//!   its dependents' counters and submits the ones that reach zero,
//! * the caller blocks on a counter latch armed with the reachable count.
//!
//! ## Correctness
//!
//! A task is submitted only when its last reachable dependency finished,
//! so dependency bodies happen-before dependents (the AcqRel counter
//! decrement plus the queue transfer establish the edge). The DAG is
//! acyclic and counters are monotone, so there is no deadlock; the latch
//! reaches zero exactly when every reachable system completed.
//!
//! ## Failure semantics
//!
//! The first error a subtask produces is recorded and flips an abort flag.
//! Tasks observing the flag are *scheduled as empty*: their body is
//! skipped and their stale subtask records are discarded, but their
//! counters still cascade so the latch terminates. The recorded error
//! surfaces from the runner; partial outputs, kill sets, and deferred
//! closures of failed or skipped systems are discarded with them.
//!
//! ## Safety note
//!
//! Task closures cross into the pool carrying a raw pointer to the
//! stack-held [`RunScope`]. The final latch decrement is the last action
//! of every task, and the caller cannot return from the latch wait before
//! the counter hits zero, so the scope strictly outlives every pointer
//! use. Violating that ordering (touching the scope after decrementing)
//! would be undefined behavior; `run_task` is written accordingly.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::engine::declare::SysMask;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::executor;
use crate::engine::runtime::EngineCore;
use crate::engine::sync::CounterLatch;
use crate::engine::system::{AdapterKind, Adapters};

/// Per-execution shared state for one `execute_systems_from` call.
pub(crate) struct RunScope<'a> {
    pub(crate) core: &'a EngineCore,
    bound: Vec<Option<&'a AdapterKind<'a>>>,
    reachable: SysMask,
    remaining: Vec<AtomicU32>,
    latch: CounterLatch,
    aborted: AtomicBool,
    first_error: Mutex<Option<EngineError>>,
}

impl<'a> RunScope<'a> {
    /// The adapter bound to a reachable system.
    pub(crate) fn bound(&self, system_index: usize) -> &AdapterKind<'a> {
        self.bound[system_index].expect("reachable system left unbound")
    }

    fn record(&self, error: EngineError) {
        self.aborted.store(true, Ordering::Release);
        let mut slot = self.first_error.lock().expect("first-error mutex poisoned");
        if slot.is_none() {
            log::warn!("aborting step execution: {error}");
            *slot = Some(error);
        }
    }
}

struct TaskCall {
    scope: *const (),
    system_index: usize,
}

// SAFETY: the scope outlives the call (latch-bounded) and is Sync.
unsafe impl Send for TaskCall {}

/// Drives the subgraph reachable from `roots` to completion and returns
/// the first error any system produced.
pub(crate) fn execute_from(
    core: &EngineCore,
    roots: &[usize],
    adapters: &Adapters<'_>,
) -> EngineResult<()> {
    if roots.is_empty() {
        return Ok(());
    }

    let system_count = core.graph.len();
    let mut reachable = SysMask::new(system_count);
    for &root in roots {
        reachable.union_with(&core.graph.reachable[root]);
    }
    let reachable_count = reachable.count();

    let names: Vec<&'static str> = core.graph.systems.iter().map(|s| s.name).collect();
    let bound = adapters.bind(&names, |index| reachable.has(index))?;

    // Task records: in-degree restricted to the reachable subgraph.
    let remaining: Vec<AtomicU32> = (0..system_count)
        .map(|index| {
            let count = if reachable.has(index) {
                core.graph.systems[index]
                    .dependencies
                    .iter()
                    .filter(|&&dependency| reachable.has(dependency))
                    .count()
            } else {
                0
            };
            AtomicU32::new(count as u32)
        })
        .collect();

    log::trace!("executing {reachable_count} systems from {} roots", roots.len());

    let scope = RunScope {
        core,
        bound,
        reachable,
        remaining,
        latch: CounterLatch::new(reachable_count as u32),
        aborted: AtomicBool::new(false),
        first_error: Mutex::new(None),
    };

    scope.latch.execute_and_wait_while(
        || {
            let mut seen = vec![false; system_count];
            for &root in roots {
                if std::mem::replace(&mut seen[root], true) {
                    continue;
                }
                // A root that is also reachable from another root keeps a
                // positive counter and is started by the cascade instead.
                if scope.remaining[root].load(Ordering::Acquire) == 0 {
                    submit_task(&scope, root);
                }
            }
        },
        || core.pool.try_run_one(),
    );

    // Every task has decremented the latch; the scope is quiescent.
    let result = match scope.first_error.lock().expect("first-error mutex poisoned").take() {
        Some(error) => Err(error),
        None => Ok(()),
    };
    result
}

fn submit_task(scope: &RunScope<'_>, system_index: usize) {
    let call = TaskCall { scope: scope as *const RunScope<'_> as *const (), system_index };
    scope.core.pool.submit(Box::new(move || {
        // Force capture of `call` as a whole so its `unsafe impl Send`
        // applies, instead of the 2021-edition disjoint-field capture
        // picking up the raw pointer field on its own.
        let call = call;
        // SAFETY: the outer latch keeps the scope alive until this task's
        // final decrement.
        let scope = unsafe { &*(call.scope as *const RunScope<'_>) };
        run_task(scope, call.system_index);
    }));
}

fn run_task(scope: &RunScope<'_>, system_index: usize) {
    if scope.aborted.load(Ordering::Acquire) {
        // Scheduled as empty: discard stale records, keep the cascade.
        // SAFETY: this task holds the system exclusively.
        unsafe { scope.core.instance_mut(system_index) }.prepare_subtasks(0, None);
    } else if let Err(error) = executor::execute_system(scope, system_index) {
        scope.record(error);
        // Partial results of a failed system are discarded.
        // SAFETY: the inner latch has joined every subtask already.
        unsafe { scope.core.instance_mut(system_index) }.prepare_subtasks(0, None);
    }

    for &dependent in &scope.core.graph.systems[system_index].dependents {
        if !scope.reachable.has(dependent) {
            continue;
        }
        if scope.remaining[dependent].fetch_sub(1, Ordering::AcqRel) == 1 {
            submit_task(scope, dependent);
        }
    }

    // Must stay the last touch of the scope; the waiter frees it on zero.
    scope.latch.decrement_and_notify_one();
}
