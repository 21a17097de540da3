// Copyright 2025 The spindle developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A thread pool dispatching data-parallel tasks at a lightweight cost.

use super::options::{RunOptions, Schedule};
use super::stats::{PoolStats, WorkerStats};
use super::sync::{CompletionLatch, LatchRef, WaitOnDrop};
use super::task::RawTask;
use super::worker::{worker_main, WorkerSlot, WorkerTask};
use crate::macros::{log_debug, log_error, log_warn};
use crossbeam_utils::CachePadded;
use once_cell::sync::OnceCell;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

/// Maximum number of worker threads a pool supports.
pub const MAX_WORKERS: u32 = 127;

/// Errors returned by pool construction and dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// More worker threads were requested than a pool supports
    /// ([`MAX_WORKERS`]).
    #[error("thread pools support up to {MAX_WORKERS} worker threads")]
    PoolSizeExceeded,
    /// [`ThreadPool::init_global()`] was called after the global pool had
    /// already been initialized.
    #[error("the global thread pool is already initialized")]
    GlobalAlreadyInitialized,
    /// A [`Schedule::Static`] dispatch was attempted from a worker thread of
    /// the same pool. Static dispatches reserve specific workers, so nesting
    /// them can deadlock.
    #[error("unsupported nested static dispatch")]
    NestedStaticDispatch,
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Name of the pool. Worker thread `i` is named `"{name}-{i}"`.
    pub name: String,
    /// Number of worker threads to spawn, at most [`MAX_WORKERS`]. The
    /// calling thread participates in every dispatch on top of these; zero
    /// workers means everything runs on the calling thread.
    pub num_threads: u32,
    /// Whether to collect per-worker [`PoolStats`].
    pub collect_stats: bool,
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use spindle::{RunOptions, ThreadPoolBuilder};
    /// let pool = ThreadPoolBuilder {
    ///     name: "worker".to_owned(),
    ///     num_threads: 4,
    ///     collect_stats: false,
    /// }
    /// .build()
    /// .unwrap();
    ///
    /// let used = pool.dispatch(RunOptions::default(), |_instance| {}).unwrap();
    /// assert_eq!(used, 5);
    /// ```
    pub fn build(self) -> Result<ThreadPool, Error> {
        if self.num_threads > MAX_WORKERS {
            return Err(Error::PoolSizeExceeded);
        }

        let stats = self
            .collect_stats
            .then(|| Arc::new(PoolStats::new(self.name.clone(), self.num_threads)));
        let shared = Arc::new(Shared {
            name: self.name,
            workers: (0..self.num_threads)
                .map(|_| CachePadded::new(WorkerSlot::new()))
                .collect(),
            has_dynamic_tasks: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            stats,
        });

        let threads = (1..=self.num_threads)
            .map(|ordinal| {
                let shared = shared.clone();
                let thread_name = format!("{}-{ordinal}", shared.name);
                WorkerThreadHandle {
                    handle: std::thread::Builder::new()
                        .name(thread_name)
                        .spawn(move || worker_main(shared, ordinal))
                        .expect("Spawning a worker thread failed"),
                }
            })
            .collect();
        log_debug!("[{}] Spawned worker threads", shared.name);

        Ok(ThreadPool {
            shared,
            threads,
            created_at: Instant::now(),
        })
    }
}

/// A fixed pool of worker threads executing data-parallel dispatches.
///
/// A dispatch hands a body to the pool together with [`RunOptions`]; the pool
/// runs one *instance* of the body per participating thread and returns once
/// all instances have finished. The calling thread always participates,
/// executing instance `0`.
///
/// Dispatching is synchronous and allocation-free: the body is borrowed from
/// the caller's frame for the duration of the call.
///
/// # Shutdown
///
/// Dropping the pool notifies all workers to stop and joins them. The pool
/// must not be dropped while a dispatch is in flight on another thread.
pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Vec<WorkerThreadHandle>,
    created_at: Instant,
}

/// Handle to a worker thread in a thread pool.
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

/// State shared between the pool handle and its worker threads.
///
/// The `Arc` allocation pins this state: worker slots keep stable addresses
/// for the whole pool lifetime no matter how the [`ThreadPool`] handle moves.
pub(crate) struct Shared {
    /// Name of the pool.
    pub(crate) name: String,
    /// Mailbox state of every worker, padded to the cache line to prevent
    /// false sharing between adjacent workers.
    pub(crate) workers: Box<[CachePadded<WorkerSlot>]>,
    /// Whether `pending` may contain claimable records. Lock-free fast path
    /// for the worker drain loop.
    has_dynamic_tasks: AtomicBool,
    /// Records of dynamic dispatches whose instances are not all assigned to
    /// a worker yet.
    pending: Mutex<VecDeque<PendingTask>>,
    /// Statistics block, if enabled.
    pub(crate) stats: Option<Arc<PoolStats>>,
}

/// A dynamic dispatch with instances still available for claiming.
struct PendingTask {
    /// Index of the last handed-out instance; instance `next_index + 1` is
    /// the next one to claim.
    next_index: u32,
    /// Total number of remote instances of the dispatch.
    size: u32,
    /// The dispatch body.
    task: RawTask,
    /// Completion latch of the dispatch; also identifies the record.
    latch: LatchRef,
}

impl PendingTask {
    /// Whether every instance has been handed out.
    fn is_exhausted(&self) -> bool {
        self.next_index == self.size
    }

    /// Claims the next unassigned instance index.
    fn claim_next_index(&mut self) -> u32 {
        debug_assert!(!self.is_exhausted());
        self.next_index += 1;
        self.next_index
    }
}

impl Shared {
    /// Claims one instance from the pending queue, if any, garbage-collecting
    /// exhausted records on the way.
    pub(crate) fn claim_pending_task(&self) -> Option<WorkerTask> {
        if !self.has_dynamic_tasks.load(Ordering::Acquire) {
            return None;
        }

        let mut pending = self.pending.lock().unwrap();
        loop {
            let Some(front) = pending.front_mut() else {
                self.has_dynamic_tasks.store(false, Ordering::Release);
                return None;
            };
            if !front.is_exhausted() {
                let index = front.claim_next_index();
                return Some(WorkerTask::Run {
                    index,
                    task: front.task,
                    latch: front.latch,
                });
            }
            // Every instance of the front record has been handed out; drop it.
            pending.pop_front();
        }
    }
}

thread_local! {
    /// Pool and ordinal of the worker running on the current thread, if any.
    /// This is the sole signal used to detect nested dispatches.
    static CURRENT_WORKER: Cell<Option<(*const Shared, u32)>> = const { Cell::new(None) };
}

/// Tags the current thread as the given worker of the given pool. Called once
/// when a worker thread starts.
pub(crate) fn register_current_worker(shared: &Arc<Shared>, ordinal: u32) {
    CURRENT_WORKER.with(|cell| cell.set(Some((Arc::as_ptr(shared), ordinal))));
}

/// Returns the current thread's worker ordinal if it is a worker of the given
/// pool.
fn current_worker_ordinal(shared: &Shared) -> Option<u32> {
    CURRENT_WORKER.with(|cell| match cell.get() {
        Some((pool, ordinal)) if std::ptr::eq(pool, shared) => Some(ordinal),
        _ => None,
    })
}

impl ThreadPool {
    /// Spawns a pool with the given name and number of worker threads, without
    /// statistics collection.
    ///
    /// Fails with [`Error::PoolSizeExceeded`] if more than [`MAX_WORKERS`]
    /// threads are requested.
    pub fn new(name: &str, num_threads: u32) -> Result<Self, Error> {
        ThreadPoolBuilder {
            name: name.to_owned(),
            num_threads,
            collect_stats: false,
        }
        .build()
    }

    /// Returns the process-wide default pool, initializing it on first access.
    ///
    /// The default pool is sized to the available hardware parallelism minus
    /// two (leaving room for the dispatching thread and the rest of the
    /// process), and is torn down at process exit.
    pub fn global() -> &'static ThreadPool {
        GLOBAL_POOL.get_or_init(|| {
            const RESERVED_THREADS: u32 = 2;
            let hardware_threads = std::thread::available_parallelism()
                .expect("Getting the available parallelism failed")
                .get() as u32;
            let num_threads = hardware_threads
                .saturating_sub(RESERVED_THREADS)
                .min(MAX_WORKERS);
            if num_threads == 0 {
                log_warn!(
                    "Not enough hardware parallelism; the global pool runs everything on the \
                     calling thread"
                );
            }
            build_global_pool(num_threads)
        })
    }

    /// Initializes the process-wide default pool with the given number of
    /// worker threads.
    ///
    /// Fails with [`Error::GlobalAlreadyInitialized`] if the global pool
    /// already exists, whether from a previous call or from
    /// [`global()`](Self::global).
    pub fn init_global(num_threads: u32) -> Result<&'static ThreadPool, Error> {
        if num_threads > MAX_WORKERS {
            return Err(Error::PoolSizeExceeded);
        }
        let mut initialized = false;
        let pool = GLOBAL_POOL.get_or_init(|| {
            initialized = true;
            build_global_pool(num_threads)
        });
        if initialized {
            Ok(pool)
        } else {
            Err(Error::GlobalAlreadyInitialized)
        }
    }

    /// Name of the pool.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of worker threads in the pool. This does not include the
    /// calling thread.
    pub fn num_threads(&self) -> u32 {
        self.shared.workers.len() as u32
    }

    /// Maximum number of instances a dispatch can run in parallel: every
    /// worker plus the calling thread.
    pub fn max_parallel_jobs(&self) -> u32 {
        self.num_threads() + 1
    }

    /// The statistics block of the pool, if it was built with
    /// [`collect_stats`](ThreadPoolBuilder::collect_stats).
    ///
    /// The counters are only reliable after the pool has been dropped.
    pub fn stats(&self) -> Option<Arc<PoolStats>> {
        self.shared.stats.clone()
    }

    /// Whether the current thread is one of this pool's worker threads.
    pub fn current_thread_is_worker(&self) -> bool {
        current_worker_ordinal(&self.shared).is_some()
    }

    /// Number of instances a dispatch with the given options would run, from
    /// the point of view of the current thread.
    ///
    /// Returns `0` when the dispatch would be rejected (a nested
    /// [`Schedule::Static`] call).
    pub fn effective_par(&self, opts: RunOptions) -> u32 {
        let num_workers = self.num_threads();
        if num_workers == 0 {
            return 1; // no workers, only the calling thread
        }

        // `max_par == 0` means no cap.
        let remote_cap = match opts.max_par {
            0 => u32::MAX,
            n => n - 1,
        };

        if self.current_thread_is_worker() {
            match opts.schedule {
                // Allow nesting, but don't oversubscribe the pool.
                Schedule::Dynamic => 1 + remote_cap.min(num_workers - 1),
                // No extra workers on nested calls.
                Schedule::DynamicNoNesting => 1,
                // Nesting static dispatches can deadlock.
                Schedule::Static => 0,
            }
        } else {
            1 + remote_cap.min(num_workers)
        }
    }

    /// Like [`effective_par()`](Self::effective_par), additionally saturating
    /// at the given workload size: spawning more instances than there are
    /// work items is never useful.
    pub fn effective_par_for(&self, size: u64, opts: RunOptions) -> u32 {
        if size == 0 {
            return 0;
        }
        size.min(u64::from(self.effective_par(opts))) as u32
    }

    /// Computes the effective parallelism for the given workload size and
    /// clamps `opts.max_par` to it, so that a subsequent
    /// [`dispatch()`](Self::dispatch) with these options spawns exactly that
    /// many instances.
    pub(crate) fn adjust_par(&self, size: u64, opts: &mut RunOptions) -> u32 {
        let par = self.effective_par_for(size, *opts);
        if par != 0 {
            opts.max_par = par;
        }
        par
    }

    /// Runs one instance of `body` per participating thread and returns the
    /// number of instances used, which is at least 1 (the calling thread
    /// always executes instance `0` itself).
    ///
    /// The call returns once every instance has finished. Instances of the
    /// same dispatch run concurrently in an unspecified order; the body must
    /// tolerate arbitrary interleaving.
    ///
    /// # Panics
    ///
    /// If the body panics on the calling thread, the dispatch still waits for
    /// the remaining instances before unwinding. If the body panics on a
    /// worker thread, the worker survives and the panic is re-raised here
    /// after all instances have finished.
    pub fn dispatch<F: Fn(u32) + Sync>(&self, opts: RunOptions, body: F) -> Result<u32, Error> {
        match self.effective_par(opts) {
            0 => Err(Error::NestedStaticDispatch),
            1 => {
                // Only run on the calling thread; skip all the machinery.
                body(0);
                Ok(1)
            }
            par => {
                // SAFETY: `run_erased()` does not return before every instance
                // has finished, so no handle outlives `body`.
                let task = unsafe { RawTask::new(&body) };
                Ok(self.run_erased(opts, par, task))
            }
        }
    }

    /// Dispatch machinery behind the type-erasure boundary: everything from
    /// here on is shared across all body types.
    fn run_erased(&self, opts: RunOptions, par: u32, task: RawTask) -> u32 {
        let shared = &*self.shared;

        // The caller executes instance 0 itself, so only the others are
        // remote.
        let remote_instances = par - 1;
        let latch = CompletionLatch::new(remote_instances);
        let latch_ref = LatchRef::new(&latch);

        // Nested dispatches account to the dispatching worker's counters.
        let caller_stats: Option<&WorkerStats> = shared.stats.as_ref().map(|stats| {
            match current_worker_ordinal(shared) {
                Some(ordinal) => stats.worker(ordinal),
                None => stats.caller(),
            }
        });

        let mut pushed_pending = false;
        if opts.schedule == Schedule::Static {
            // Static scheduling: instance i + 1 goes to worker i + 1,
            // unconditionally.
            for i in 0..remote_instances {
                shared.workers[i as usize].enqueue(WorkerTask::Run {
                    index: i + 1,
                    task,
                    latch: latch_ref,
                });
            }
        } else {
            let mut index = 0;
            for slot in shared.workers.iter() {
                if slot.try_enqueue(WorkerTask::Run {
                    index: index + 1,
                    task,
                    latch: latch_ref,
                }) {
                    index += 1;
                    if index == remote_instances {
                        break;
                    }
                }
            }
            if index < remote_instances {
                // Not enough idle workers: publish the rest as a pending
                // record that workers and the caller can claim from.
                pushed_pending = true;
                shared.has_dynamic_tasks.store(true, Ordering::Release);
                {
                    let mut pending = shared.pending.lock().unwrap();
                    pending.push_back(PendingTask {
                        next_index: index,
                        size: remote_instances,
                        task,
                        latch: latch_ref,
                    });
                }
                // Wake up workers which went idle while the record was being
                // added.
                for slot in shared.workers.iter() {
                    if slot.try_wake_if_idle() {
                        index += 1;
                        if index == remote_instances {
                            break;
                        }
                    }
                }
            }
        }

        // From here on this frame must not be left before the latch has
        // drained: workers hold lifetime-erased handles to the latch and the
        // body. The guard enforces this even if instance 0 unwinds.
        let wait_guard = WaitOnDrop(&latch);

        // The caller always executes instance 0.
        // SAFETY: The body outlives this function call.
        unsafe { task.call(0) };
        if let Some(stats) = caller_stats {
            stats.add_executed(1);
        }

        if pushed_pending {
            // Steal work from our own pending record while there is any. Only
            // workers pop records; stealing just bumps the claim index.
            loop {
                let claimed = {
                    let mut pending = shared.pending.lock().unwrap();
                    match pending.iter_mut().find(|t| t.latch.refers_to(&latch)) {
                        Some(t) if !t.is_exhausted() => Some(t.claim_next_index()),
                        // The record is exhausted or already collected.
                        _ => None,
                    }
                };
                let Some(instance_index) = claimed else { break };

                let guard = latch.completion_guard();
                // SAFETY: The body outlives this function call.
                unsafe { task.call(instance_index) };
                drop(guard);
                if let Some(stats) = caller_stats {
                    stats.add_stolen(1);
                    stats.add_executed(1);
                }
            }
        }

        // Wait for all remote instances to finish.
        drop(wait_guard);
        let panicked = latch.wait();
        if panicked != 0 {
            log_error!(
                "[{}] {panicked} worker thread(s) panicked during a parallel task",
                shared.name
            );
            panic!("{panicked} worker thread(s) panicked during a parallel task");
        }
        par
    }
}

impl Drop for ThreadPool {
    /// Notifies all workers to stop and joins them.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        for slot in self.shared.workers.iter() {
            slot.enqueue(WorkerTask::Stop);
        }

        log_debug!("[{}] Joining worker threads...", self.shared.name);
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[{}] Worker thread {_i} joined", self.shared.name),
                Err(_) => log_error!(
                    "[{}] Worker thread {_i} joined with a panic: {result:?}",
                    self.shared.name
                ),
            }
        }

        if let Some(stats) = &self.shared.stats {
            stats.record_lifetime(self.created_at.elapsed());
        }
    }
}

static GLOBAL_POOL: OnceCell<ThreadPool> = OnceCell::new();

fn build_global_pool(num_threads: u32) -> ThreadPool {
    ThreadPoolBuilder {
        name: "global".to_owned(),
        num_threads,
        collect_stats: false,
    }
    .build()
    // The size was validated by the callers.
    .expect("Building the global thread pool failed")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64};
    use std::thread::ThreadId;

    const NUM_THREADS: u32 = 4;
    const NUM_JOBS: u32 = NUM_THREADS + 1;

    fn test_pool() -> ThreadPool {
        ThreadPool::new("test", NUM_THREADS).unwrap()
    }

    fn dynamic(max_par: u32) -> RunOptions {
        RunOptions::with_max_par(max_par)
    }

    fn static_opts(max_par: u32) -> RunOptions {
        RunOptions {
            schedule: Schedule::Static,
            max_par,
        }
    }

    #[test]
    fn test_pool_size_exceeded() {
        assert_eq!(
            ThreadPool::new("test", MAX_WORKERS + 1).err(),
            Some(Error::PoolSizeExceeded)
        );
    }

    #[test]
    fn test_pool_accessors() {
        let pool = test_pool();
        assert_eq!(pool.name(), "test");
        assert_eq!(pool.num_threads(), NUM_THREADS);
        assert_eq!(pool.max_parallel_jobs(), NUM_JOBS);
        assert!(!pool.current_thread_is_worker());
    }

    #[test]
    fn test_effective_par_external() {
        let pool = test_pool();

        assert_eq!(pool.effective_par(RunOptions::default()), NUM_JOBS);
        assert_eq!(pool.effective_par(dynamic(1)), 1);
        assert_eq!(pool.effective_par(dynamic(3)), 3);
        assert_eq!(pool.effective_par(dynamic(NUM_THREADS)), NUM_THREADS);
        assert_eq!(pool.effective_par(dynamic(NUM_JOBS)), NUM_JOBS);
        assert_eq!(pool.effective_par(dynamic(1000)), NUM_JOBS);
        assert_eq!(pool.effective_par(dynamic(0)), NUM_JOBS);

        assert_eq!(pool.effective_par_for(5, dynamic(3)), 3);
        assert_eq!(pool.effective_par_for(2, dynamic(3)), 2);
        assert_eq!(pool.effective_par_for(0, dynamic(3)), 0);
        assert_eq!(pool.effective_par_for(2, dynamic(1000)), 2);
        assert_eq!(pool.effective_par_for(1_000_000_000_000, dynamic(1000)), NUM_JOBS);
        assert_eq!(pool.effective_par_for(2, dynamic(0)), 2);
        assert_eq!(pool.effective_par_for(2000, dynamic(0)), NUM_JOBS);
    }

    #[test]
    fn test_adjust_par_clamps_options() {
        let pool = test_pool();

        let mut opts = dynamic(3);
        assert_eq!(pool.adjust_par(5, &mut opts), 3);
        assert_eq!(opts.max_par, 3);

        assert_eq!(pool.adjust_par(2, &mut opts), 2);
        assert_eq!(opts.max_par, 2);
    }

    #[test]
    fn test_effective_par_saturates_in_size() {
        let pool = test_pool();
        let mut last = 0;
        for size in 0..=10 {
            let par = pool.effective_par_for(size, RunOptions::default());
            assert!(par >= last);
            last = par;
        }
        assert_eq!(last, NUM_JOBS);
    }

    #[test]
    fn test_zero_worker_pool_runs_inline() {
        let pool = ThreadPool::new("test", 0).unwrap();
        assert_eq!(pool.effective_par(RunOptions::default()), 1);
        assert_eq!(pool.effective_par(static_opts(0)), 1);

        let caller = std::thread::current().id();
        let calls = AtomicU32::new(0);
        let ret = pool
            .dispatch(RunOptions::default(), |instance| {
                assert_eq!(instance, 0);
                assert_eq!(std::thread::current().id(), caller);
                calls.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(ret, 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    struct TestTaskResult {
        ret: u32,
        calls: u32,
        instances: u32,
    }

    fn run_test_task(pool: &ThreadPool, opts: RunOptions) -> TestTaskResult {
        let calls = AtomicU32::new(0);
        let instances = AtomicU32::new(0);
        let ret = pool
            .dispatch(opts, |instance| {
                calls.fetch_add(1, Ordering::Relaxed);
                instances.fetch_or(1 << instance, Ordering::Relaxed);
            })
            .unwrap();
        TestTaskResult {
            ret,
            calls: calls.load(Ordering::Relaxed),
            instances: instances.load(Ordering::Relaxed),
        }
    }

    #[test]
    fn test_dispatch_dynamic_single_thread() {
        let pool = test_pool();
        let res = run_test_task(&pool, dynamic(1));
        assert_eq!(res.ret, 1);
        assert_eq!(res.calls, 1);
        assert_eq!(res.instances, 1);
    }

    #[test]
    fn test_dispatch_dynamic_multiple_threads() {
        let pool = test_pool();

        let res = run_test_task(&pool, dynamic(3));
        assert_eq!(res.ret, 3);
        assert_eq!(res.calls, 3);
        assert_eq!(res.instances, 0b111);

        let res = run_test_task(&pool, dynamic(NUM_THREADS));
        assert_eq!(res.ret, NUM_THREADS);
        assert_eq!(res.calls, NUM_THREADS);
        assert_eq!(res.instances, (1 << NUM_THREADS) - 1);

        let res = run_test_task(&pool, dynamic(1000));
        assert_eq!(res.ret, NUM_JOBS);
        assert_eq!(res.calls, NUM_JOBS);
        assert_eq!(res.instances, (1 << NUM_JOBS) - 1);

        let res = run_test_task(&pool, dynamic(0));
        assert_eq!(res.ret, NUM_JOBS);
        assert_eq!(res.calls, NUM_JOBS);
        assert_eq!(res.instances, (1 << NUM_JOBS) - 1);
    }

    #[test]
    fn test_dispatch_static() {
        let pool = test_pool();

        // Collect the thread assigned to each instance.
        let thread_ids: Vec<Mutex<Option<ThreadId>>> =
            (0..NUM_JOBS).map(|_| Mutex::new(None)).collect();
        let ret = pool
            .dispatch(static_opts(0), |instance| {
                *thread_ids[instance as usize].lock().unwrap() =
                    Some(std::thread::current().id());
            })
            .unwrap();
        assert_eq!(ret, NUM_JOBS);

        let thread_ids: Vec<ThreadId> = thread_ids
            .into_iter()
            .map(|id| id.into_inner().unwrap().unwrap())
            .collect();

        // The caller executes instance 0, and every instance runs on a
        // distinct thread.
        assert_eq!(thread_ids[0], std::thread::current().id());
        for (i, a) in thread_ids.iter().enumerate() {
            for b in &thread_ids[i + 1..] {
                assert_ne!(a, b);
            }
        }

        // Static scheduling deterministically maps instance i to the same
        // thread on every dispatch.
        for max_par in [1, 3, NUM_THREADS, 1000, 0] {
            let instances = AtomicU32::new(0);
            let ret = pool
                .dispatch(static_opts(max_par), |instance| {
                    instances.fetch_or(1 << instance, Ordering::Relaxed);
                    assert_eq!(std::thread::current().id(), thread_ids[instance as usize]);
                })
                .unwrap();
            // All instance indices below the returned parallelism were used.
            assert_eq!(instances.load(Ordering::Relaxed), (1 << ret) - 1);
        }
    }

    #[test]
    fn test_nested_static_fails() {
        let pool = test_pool();

        let outer_calls = AtomicU32::new(0);
        let inner_calls = AtomicU32::new(0);
        let rejections = AtomicU32::new(0);
        pool.dispatch(RunOptions::default(), |_| {
            match pool.dispatch(static_opts(2), |_| {
                inner_calls.fetch_add(1, Ordering::Relaxed);
            }) {
                Ok(_) => {}
                Err(err) => {
                    assert_eq!(err, Error::NestedStaticDispatch);
                    rejections.fetch_add(1, Ordering::Relaxed);
                }
            }
            outer_calls.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        assert_eq!(outer_calls.load(Ordering::Relaxed), NUM_JOBS);
        // The dispatching thread is not a worker, so its nested static call
        // succeeds; all worker instances are rejected.
        assert_eq!(inner_calls.load(Ordering::Relaxed), 2);
        assert_eq!(rejections.load(Ordering::Relaxed), NUM_THREADS);
    }

    fn run_nested_task(
        pool: &ThreadPool,
        outer_opts: RunOptions,
        inner_opts: RunOptions,
    ) -> (u32, u32) {
        let outer_calls = AtomicU32::new(0);
        let inner_calls = AtomicU32::new(0);
        pool.dispatch(outer_opts, |_| {
            let ret = pool
                .dispatch(inner_opts, |_| {
                    inner_calls.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            // The nested parallelism depends on the thread we dispatch from.
            assert_eq!(ret, pool.effective_par(inner_opts));
            outer_calls.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        (
            outer_calls.load(Ordering::Relaxed),
            inner_calls.load(Ordering::Relaxed),
        )
    }

    #[test]
    fn test_dynamic_nesting_simple() {
        let pool = test_pool();
        let (outer, inner) = run_nested_task(&pool, RunOptions::default(), dynamic(2));
        assert_eq!(outer, NUM_JOBS);
        assert_eq!(inner, 2 * NUM_JOBS);
    }

    #[test]
    fn test_dynamic_nesting_in_static() {
        let pool = test_pool();
        let (outer, inner) = run_nested_task(&pool, static_opts(0), dynamic(2));
        assert_eq!(outer, NUM_JOBS);
        assert_eq!(inner, 2 * NUM_JOBS);
    }

    #[test]
    fn test_dynamic_nesting_oversubscribed() {
        let pool = test_pool();
        let (outer, inner) = run_nested_task(&pool, static_opts(3), dynamic(0));
        assert_eq!(outer, 3);
        // The external caller gets all 5 threads; the two worker instances
        // each get 1 + (NUM_THREADS - 1).
        assert_eq!(inner, NUM_JOBS + 2 * NUM_THREADS);
    }

    #[test]
    fn test_dynamic_no_nesting_collapses() {
        let pool = test_pool();
        let inner_opts = RunOptions {
            schedule: Schedule::DynamicNoNesting,
            max_par: 2,
        };
        let (outer, inner) = run_nested_task(&pool, static_opts(0), inner_opts);
        assert_eq!(outer, NUM_JOBS);
        // 2 instances from the external caller, 1 from each worker.
        assert_eq!(inner, 2 + NUM_THREADS);
    }

    #[test]
    fn test_worker_detection_in_static_dispatch() {
        let pool = test_pool();
        pool.dispatch(static_opts(0), |instance| {
            if instance == 0 {
                assert!(!pool.current_thread_is_worker());
            } else {
                assert!(pool.current_thread_is_worker());
            }
        })
        .unwrap();
    }

    #[test]
    fn test_dispatch_repeated_accumulation() {
        let pool = test_pool();
        let total = AtomicU64::new(0);
        for _ in 0..100 {
            pool.dispatch(RunOptions::default(), |instance| {
                total.fetch_add(u64::from(instance), Ordering::Relaxed);
            })
            .unwrap();
        }
        // Instances 0..=4 run exactly once per dispatch.
        assert_eq!(total.load(Ordering::Relaxed), 100 * 10);
    }

    #[test]
    fn test_stats_account_every_instance() {
        let stats = {
            let pool = ThreadPoolBuilder {
                name: "stats".to_owned(),
                num_threads: NUM_THREADS,
                collect_stats: true,
            }
            .build()
            .unwrap();
            let stats = pool.stats().unwrap();

            for _ in 0..10 {
                pool.dispatch(static_opts(0), |_| {}).unwrap();
            }
            for _ in 0..10 {
                pool.dispatch(dynamic(0), |_| {}).unwrap();
            }
            stats
        };

        // 20 dispatches of 5 instances each, counted exactly once whether
        // executed in a mailbox, stolen from the pending queue, or run by the
        // caller.
        let executed: u64 = stats.caller().tasks_executed()
            + stats.workers().map(WorkerStats::tasks_executed).sum::<u64>();
        assert_eq!(executed, 20 * u64::from(NUM_JOBS));
        assert_eq!(stats.pool_name(), "stats");
        assert!(stats.lifetime() > std::time::Duration::ZERO);
    }

    #[test]
    fn test_dispatch_worker_panic_reraised() {
        let pool = test_pool();

        // Instance 0 runs on the caller, so every remote instance panics on a
        // worker and the dispatch re-raises after completing.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.dispatch(static_opts(0), |instance| {
                if instance != 0 {
                    panic!("arithmetic panic");
                }
            })
            .unwrap();
        }));
        let message = *result.unwrap_err().downcast::<String>().unwrap();
        assert!(message.contains("worker thread(s) panicked"));

        // The pool is still functional afterwards.
        let res = run_test_task(&pool, dynamic(0));
        assert_eq!(res.ret, NUM_JOBS);
        assert_eq!(res.instances, (1 << NUM_JOBS) - 1);
    }

    #[test]
    fn test_global_pool() {
        let pool = ThreadPool::global();
        let calls = AtomicU32::new(0);
        let ret = pool
            .dispatch(RunOptions::default(), |_| {
                calls.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert!(ret >= 1);
        assert_eq!(calls.load(Ordering::Relaxed), ret);

        // The global pool exists now, so explicit initialization fails.
        assert_eq!(
            ThreadPool::init_global(2).err(),
            Some(Error::GlobalAlreadyInitialized)
        );
        assert_eq!(
            ThreadPool::init_global(MAX_WORKERS + 1).err(),
            Some(Error::PoolSizeExceeded)
        );
    }
}
