//! Inner-parallelism executor.
//!
//! Given one scheduled system, this module decides the subtask count from
//! the system's policy, slices the subscription range into contiguous
//! chunks, fans the chunks out across the worker pool, and waits for all
//! of them on a counter latch.
//!
//! ## Protocol
//!
//! 1. Fresh subtask records are installed on the instance.
//! 2. A latch is armed with the subtask count.
//! 3. One closure per slice builds a [`DataProxy`] over its range, invokes
//!    the bound processing function, and decrements the latch — panics
//!    included.
//! 4. `k - 1` closures go to the pool; the last runs on the calling
//!    thread, which then drains queued work while waiting so sibling
//!    systems cannot starve each other of workers.
//!
//! Subtasks of one system are unordered; no observable order is promised.
//!
//! ## Borrow carving
//!
//! Subtask closures cross into the pool as raw-pointer captures: the
//! subscription slice is shared and immutable for the whole execution,
//! each subtask record is touched by exactly one subtask, and the latch
//! wait at the bottom of [`fan_out`] outlives every capture. The pointers
//! are taken as *field projections* so no reference to the whole system
//! instance ever exists concurrently with them.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use crate::engine::error::{EngineError, EngineResult, ExecutionError};
use crate::engine::proxy::{DataProxy, InstanceExecutor};
use crate::engine::runtime::EngineCore;
use crate::engine::scheduler::RunScope;
use crate::engine::sync::CounterLatch;
use crate::engine::system::{AdapterKind, SubtaskState};
use crate::engine::types::{slice_ranges, EntityId, InnerParallelismMode};

/// Runs one system: computes the subtask count, prepares the instance, and
/// dispatches through the adapter the scheduler bound for it.
pub(crate) fn execute_system(scope: &RunScope<'_>, system_index: usize) -> EngineResult<()> {
    let core = scope.core;
    let declaration = &core.graph.systems[system_index];

    let subtask_count;
    {
        // SAFETY: this task is the only one scheduled for `system_index`.
        let instance = unsafe { core.instance_mut(system_index) };
        let subscribed = instance.subscribed.len();
        subtask_count = match core.inner_mode {
            InnerParallelismMode::Disallow => 1,
            InnerParallelismMode::Allow => {
                declaration.parallelism.subtask_count(subscribed, core.workers())
            }
        };
        instance.prepare_subtasks(subtask_count, declaration.output_factory.as_ref());
    }

    match scope.bound(system_index) {
        AdapterKind::Subtasks(run) => {
            // SAFETY: field projection of the user state; no exclusive
            // reference to it exists on this path.
            let user: *const (dyn Any + Send + Sync) =
                unsafe { (*core.instance_ptr(system_index)).state.as_ref() as *const _ };
            fan_out(core, system_index, subtask_count, user, &**run)
        }
        AdapterKind::Instance(run) => {
            // SAFETY: field projection of the user state; the executor only
            // touches the instance's other fields.
            let user: &mut dyn Any =
                unsafe { (*core.instance_ptr(system_index)).state.as_mut() };
            let mut executor = InstanceExecutor::new(core, system_index, subtask_count);
            // The adapter body runs outside any subtask wrapper, so it
            // needs its own panic guard; unwinding past `run_task` would
            // skip the outer latch decrement and hang the step.
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| run(user, &mut executor)));
            match outcome {
                Ok(result) => result,
                Err(payload) => Err(ExecutionError::Panicked {
                    system: declaration.name,
                    message: panic_message(payload.as_ref()),
                }
                .into()),
            }
        }
    }
}

/// Per-execution record shared by the subtasks of one system.
struct SubtaskShared<'a> {
    core: &'a EngineCore,
    system_index: usize,
    ids: *const EntityId,
    states: *mut SubtaskState,
    user: *const (dyn Any + Send + Sync),
    run: &'a (dyn Fn(&dyn Any, &mut DataProxy<'_>) -> EngineResult<()> + Sync),
    latch: &'a CounterLatch,
    first_error: &'a Mutex<Option<EngineError>>,
}

// SAFETY: the raw pointers target disjoint (per subtask index) or
// immutable (ids, user) data for the duration of the fan-out; the latch
// bounds that duration.
unsafe impl Sync for SubtaskShared<'_> {}

struct SubtaskCall {
    shared: *const (),
    index: usize,
    begin: usize,
    end: usize,
}

// SAFETY: the pointee outlives the call (latch-bounded) and is Sync.
unsafe impl Send for SubtaskCall {}

/// Slices `[0, n)` into `subtask_count` ranges and runs the processing
/// function over each, `k - 1` on the pool and one inline. Returns the
/// first error any subtask produced.
pub(crate) fn fan_out(
    core: &EngineCore,
    system_index: usize,
    subtask_count: usize,
    user: *const (dyn Any + Send + Sync),
    run: &(dyn Fn(&dyn Any, &mut DataProxy<'_>) -> EngineResult<()> + Sync),
) -> EngineResult<()> {
    let instance_ptr = core.instance_ptr(system_index);
    // SAFETY: field projections. The subscription set is not mutated during
    // execution; the subtask records were freshly installed by the caller
    // and are handed out one per slice below.
    let (ids, subscribed, states, states_len) = unsafe {
        let subscription = &(*instance_ptr).subscribed;
        let subtasks = &mut (*instance_ptr).subtasks;
        (
            subscription.as_slice().as_ptr(),
            subscription.len(),
            subtasks.as_mut_ptr(),
            subtasks.len(),
        )
    };
    debug_assert_eq!(states_len, subtask_count);

    let ranges = slice_ranges(subscribed, subtask_count);
    let latch = CounterLatch::new(subtask_count as u32);
    let first_error = Mutex::new(None::<EngineError>);
    let shared = SubtaskShared {
        core,
        system_index,
        ids,
        states,
        user,
        run,
        latch: &latch,
        first_error: &first_error,
    };

    latch.execute_and_wait_while(
        || {
            for (index, &(begin, end)) in ranges.iter().enumerate().skip(1) {
                let call = SubtaskCall {
                    shared: &shared as *const SubtaskShared<'_> as *const (),
                    index,
                    begin,
                    end,
                };
                core.pool.submit(Box::new(move || {
                    // Force capture of `call` as a whole so its `unsafe
                    // impl Send` applies, instead of the 2021-edition
                    // disjoint-field capture picking up the raw pointer
                    // field on its own.
                    let call = call;
                    // SAFETY: the latch at the bottom of `fan_out` keeps
                    // `shared` alive until this call has decremented it.
                    let shared = unsafe { &*(call.shared as *const SubtaskShared<'_>) };
                    run_subtask(shared, call.index, call.begin, call.end);
                }));
            }
            let (begin, end) = ranges[0];
            run_subtask(&shared, 0, begin, end);
        },
        || core.pool.try_run_one(),
    );

    match first_error.into_inner().expect("subtask error mutex poisoned") {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn run_subtask(shared: &SubtaskShared<'_>, index: usize, begin: usize, end: usize) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the slice is shared and immutable during execution; the
        // record at `index` belongs to this subtask alone; the user state
        // is shared read-only on this path.
        let slice =
            unsafe { std::slice::from_raw_parts(shared.ids.add(begin), end - begin) };
        let state = unsafe { &mut *shared.states.add(index) };
        let user = unsafe { &*shared.user };
        let mut proxy = DataProxy::new(shared.core, shared.system_index, slice, state);
        (shared.run)(user, &mut proxy)
    }));

    let result = match outcome {
        Ok(result) => result,
        Err(payload) => Err(ExecutionError::Panicked {
            system: shared.core.graph.systems[shared.system_index].name,
            message: panic_message(payload.as_ref()),
        }
        .into()),
    };
    if let Err(error) = result {
        let mut slot = shared.first_error.lock().expect("subtask error mutex poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    // Must stay the last touch of `shared`; the waiter frees it on zero.
    shared.latch.decrement_and_notify_one();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
