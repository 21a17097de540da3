// Copyright 2025 The spindle developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Optional per-pool debugging statistics.

use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one pool participant: either a worker thread, or the threads
/// that dispatch onto the pool (lumped together as "callers").
#[derive(Default)]
pub struct WorkerStats {
    tasks_executed: AtomicU64,
    tasks_stolen: AtomicU64,
    total_task_time_ns: AtomicU64,
}

impl WorkerStats {
    /// Number of task instances this participant executed.
    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }

    /// Number of task instances this participant claimed from the pool's
    /// pending queue rather than receiving in its own mailbox.
    pub fn tasks_stolen(&self) -> u64 {
        self.tasks_stolen.load(Ordering::Relaxed)
    }

    /// Total time this participant spent executing task bodies. Not tracked
    /// for callers.
    pub fn total_task_time(&self) -> Duration {
        Duration::from_nanos(self.total_task_time_ns.load(Ordering::Relaxed))
    }

    pub(crate) fn add_executed(&self, count: u64) {
        self.tasks_executed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_stolen(&self, count: u64) {
        self.tasks_stolen.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_task_time(&self, time: Duration) {
        self.total_task_time_ns
            .fetch_add(time.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Statistics collected by a [`ThreadPool`](crate::ThreadPool) built with
/// [`collect_stats`](crate::ThreadPoolBuilder::collect_stats).
///
/// All counters are updated with relaxed atomics: they can be read at any
/// time, but the values are only reliable once the pool has been dropped.
/// Each block is padded to the cache line so that counting doesn't introduce
/// false sharing between workers.
pub struct PoolStats {
    pool_name: String,
    lifetime_ns: AtomicU64,
    caller: CachePadded<WorkerStats>,
    per_worker: Box<[CachePadded<WorkerStats>]>,
}

impl PoolStats {
    pub(crate) fn new(pool_name: String, num_workers: u32) -> Self {
        Self {
            pool_name,
            lifetime_ns: AtomicU64::new(0),
            caller: CachePadded::new(WorkerStats::default()),
            per_worker: (0..num_workers)
                .map(|_| CachePadded::new(WorkerStats::default()))
                .collect(),
        }
    }

    /// Name of the pool these statistics belong to.
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Lifetime of the pool, from construction to drop. Zero while the pool
    /// is still alive.
    pub fn lifetime(&self) -> Duration {
        Duration::from_nanos(self.lifetime_ns.load(Ordering::Relaxed))
    }

    /// Counters for the dispatching threads.
    pub fn caller(&self) -> &WorkerStats {
        &self.caller
    }

    /// Counters per worker thread, in ordinal order.
    pub fn workers(&self) -> impl ExactSizeIterator<Item = &WorkerStats> {
        self.per_worker.iter().map(|stats| &**stats)
    }

    /// Counters for the worker with the given 1-based ordinal.
    pub(crate) fn worker(&self, ordinal: u32) -> &WorkerStats {
        &self.per_worker[ordinal as usize - 1]
    }

    pub(crate) fn record_lifetime(&self, lifetime: Duration) {
        self.lifetime_ns
            .store(lifetime.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Thread pool {:?} debug stats:", self.pool_name)?;
        writeln!(
            f,
            "  Total lifetime: {:.3} ms",
            self.lifetime().as_secs_f64() * 1_000.0
        )?;
        writeln!(f, "  Callers:")?;
        writeln!(f, "    Tasks executed: {}", self.caller.tasks_executed())?;
        writeln!(f, "    Tasks stolen:   {}", self.caller.tasks_stolen())?;
        for (i, stats) in self.workers().enumerate() {
            writeln!(f, "  Worker {:3}:", i + 1)?;
            writeln!(f, "    Tasks executed: {}", stats.tasks_executed())?;
            writeln!(f, "    Tasks stolen:   {}", stats.tasks_stolen())?;
            writeln!(
                f,
                "    Total task time: {:.3} ms",
                stats.total_task_time().as_secs_f64() * 1_000.0
            )?;
        }
        Ok(())
    }
}
