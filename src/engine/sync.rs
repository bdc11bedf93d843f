//! Worker pool and counter-latch synchronization primitives.
//!
//! This module provides the two building blocks every execution path of the
//! engine rests on:
//!
//! - [`WorkerPool`]: a fixed set of kernel threads draining a blocking
//!   multi-producer multi-consumer queue of boxed closures,
//! - [`CounterLatch`]: a reusable "run a body, then block until a counter
//!   reaches zero" primitive used by both the outer scheduler and the inner
//!   executor.
//!
//! ## Failure semantics
//!
//! Task-level panics are caught inside the worker loop and swallowed; tasks
//! are expected to signal completion explicitly through a latch, so a
//! panicking task must decrement before unwinding past the worker (the
//! engine's subtask wrappers guarantee this). The pool itself never
//! surfaces errors except on `submit` after `shutdown`, which is a
//! programmer error and panics.
//!
//! ## Latch lifetime discipline
//!
//! A decrementing thread touches the latch only while holding its lock and
//! touches nothing after releasing it. A waiter that observes zero may
//! therefore free the latch (and anything the decrementer borrowed)
//! immediately after waking; the scheduler leans on this to hand
//! stack-borrowed run state to pool tasks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Boxed unit of work executed by a pool worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(Task),
    Exit,
}

/// Fixed-size pool of worker threads over a blocking MPMC queue.
pub struct WorkerPool {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
    down: AtomicBool,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = unbounded();
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("lockstep-worker-{index}"))
                .spawn(move || worker_loop(receiver))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        Self { sender, receiver, workers, down: AtomicBool::new(false), size }
    }

    /// Number of worker threads.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueues a task and returns immediately.
    ///
    /// ## Panics
    /// Panics if called after [`WorkerPool::shutdown`].
    pub fn submit(&self, task: Task) {
        assert!(
            !self.down.load(Ordering::Acquire),
            "submit on a worker pool that was shut down"
        );
        self.sender
            .send(Job::Run(task))
            .expect("worker queue disconnected");
    }

    /// Steals and runs one queued task on the calling thread.
    ///
    /// Returns `false` if the queue was empty. Threads blocked on an inner
    /// latch drain the queue through this, so subtasks make progress even
    /// when every worker is parked on a latch of its own.
    pub fn try_run_one(&self) -> bool {
        match self.receiver.try_recv() {
            Ok(Job::Run(task)) => {
                let _ = panic::catch_unwind(AssertUnwindSafe(task));
                true
            }
            Ok(Job::Exit) => {
                // Stole a worker's shutdown sentinel; hand it back.
                let _ = self.sender.send(Job::Exit);
                false
            }
            Err(_) => false,
        }
    }

    /// Stops the workers. Idempotent; posts one sentinel per worker to
    /// unblock it, then joins.
    pub fn shutdown(&mut self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.workers.len() {
            let _ = self.sender.send(Job::Exit);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Run(task) => {
                // Completion signalling is the task's responsibility; a
                // stray panic must not take the worker down with it.
                let _ = panic::catch_unwind(AssertUnwindSafe(task));
            }
            Job::Exit => break,
        }
    }
}

/// Reusable counting latch.
///
/// Initialized with a count `n >= 0`; [`CounterLatch::execute_and_wait`]
/// runs a body expected to cause exactly `n` decrements (directly or
/// through tasks it spawns), then blocks until the counter reaches zero.
pub struct CounterLatch {
    count: Mutex<u32>,
    zero: Condvar,
}

impl CounterLatch {
    /// Creates a latch with the given initial count.
    pub fn new(count: u32) -> Self {
        Self { count: Mutex::new(count), zero: Condvar::new() }
    }

    /// Re-arms the latch. Only legal while no waiter is blocked.
    pub fn reset(&self, count: u32) {
        let mut guard = self.count.lock().expect("latch mutex poisoned");
        *guard = count;
    }

    /// Runs `body`, then blocks until the counter reaches zero.
    pub fn execute_and_wait<F: FnOnce()>(&self, body: F) {
        body();
        let mut guard = self.count.lock().expect("latch mutex poisoned");
        while *guard != 0 {
            guard = self.zero.wait(guard).expect("latch mutex poisoned");
        }
    }

    /// Runs `body`, then waits for zero while stealing work through `help`.
    ///
    /// `help` should run one pending task and return whether it did; when
    /// it reports an empty queue the wait falls back to a short timed
    /// block so a concurrent decrement is never missed for long.
    pub fn execute_and_wait_while<B, H>(&self, body: B, mut help: H)
    where
        B: FnOnce(),
        H: FnMut() -> bool,
    {
        body();
        loop {
            {
                let guard = self.count.lock().expect("latch mutex poisoned");
                if *guard == 0 {
                    return;
                }
            }
            if !help() {
                let guard = self.count.lock().expect("latch mutex poisoned");
                if *guard == 0 {
                    return;
                }
                let _ = self
                    .zero
                    .wait_timeout(guard, std::time::Duration::from_millis(1))
                    .expect("latch mutex poisoned");
            }
        }
    }

    /// Decrements the counter and wakes one waiter if it reached zero.
    pub fn decrement_and_notify_one(&self) {
        let mut guard = self.count.lock().expect("latch mutex poisoned");
        debug_assert!(*guard > 0, "latch counter underflow");
        *guard -= 1;
        if *guard == 0 {
            self.zero.notify_one();
        }
    }

    /// Decrements the counter and wakes every waiter if it reached zero.
    pub fn decrement_and_notify_all(&self) {
        let mut guard = self.count.lock().expect("latch mutex poisoned");
        debug_assert!(*guard > 0, "latch counter underflow");
        *guard -= 1;
        if *guard == 0 {
            self.zero.notify_all();
        }
    }
}
