// Copyright 2025 The spindle developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker threads and their mailboxes.

use super::sync::LatchRef;
use super::task::RawTask;
use super::thread_pool::Shared;
use crate::macros::{log_debug, log_error};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// A unit of work delivered to a worker's mailbox or claimed from the pool's
/// pending queue.
pub(crate) enum WorkerTask {
    /// Run one instance of a dispatch body.
    Run {
        /// Instance index to invoke the body with.
        index: u32,
        /// The dispatch body.
        task: RawTask,
        /// Completion latch of the dispatch this instance belongs to.
        latch: LatchRef,
    },
    /// Tombstone: the worker thread must exit.
    Stop,
}

/// Mailbox state of one worker thread, shared between the worker and the
/// threads dispatching onto the pool.
///
/// A worker is either asleep on its condition variable, or executing a batch
/// of tasks previously swapped out of `mailbox`. The `busy` flag is set
/// whenever the worker has accepted new work since its last drain (or has
/// been asked to wake up), and cleared right before the worker goes to sleep.
pub(crate) struct WorkerSlot {
    mailbox: Mutex<Vec<WorkerTask>>,
    condvar: Condvar,
    busy: AtomicBool,
}

impl WorkerSlot {
    pub(crate) fn new() -> Self {
        Self {
            mailbox: Mutex::new(Vec::new()),
            condvar: Condvar::new(),
            busy: AtomicBool::new(false),
        }
    }

    /// Adds a task guaranteed to be executed by this worker. Always succeeds.
    pub(crate) fn enqueue(&self, task: WorkerTask) {
        {
            let mut mailbox = self.mailbox.lock().unwrap();
            self.busy.swap(true, Ordering::Acquire);
            mailbox.push(task);
        }
        self.condvar.notify_one();
    }

    /// Tries to add a task to this worker, failing if the worker is busy.
    pub(crate) fn try_enqueue(&self, task: WorkerTask) -> bool {
        if self.busy.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut mailbox = self.mailbox.lock().unwrap();
            if self.busy.swap(true, Ordering::Acquire) {
                return false;
            }
            mailbox.push(task);
        }
        self.condvar.notify_one();
        true
    }

    /// Marks an idle worker busy and wakes it up, without queueing anything:
    /// the worker is expected to pull from the pool's pending queue. Fails if
    /// the worker was already busy.
    pub(crate) fn try_wake_if_idle(&self) -> bool {
        if self.busy.swap(true, Ordering::Acquire) {
            return false;
        }
        self.condvar.notify_one();
        true
    }
}

/// Main function run by a worker thread.
pub(crate) fn worker_main(shared: Arc<Shared>, ordinal: u32) {
    super::thread_pool::register_current_worker(&shared, ordinal);
    log_debug!("[{}-{ordinal}] Worker thread started", shared.name);

    let worker_stats = shared.stats.as_ref().map(|stats| stats.worker(ordinal));
    let slot = &*shared.workers[ordinal as usize - 1];
    let mut executing: Vec<WorkerTask> = Vec::new();

    loop {
        let mut stole = false;
        {
            let mut mailbox = slot.mailbox.lock().unwrap();
            loop {
                if !mailbox.is_empty() {
                    std::mem::swap(&mut *mailbox, &mut executing);
                    break;
                }
                if let Some(task) = shared.claim_pending_task() {
                    slot.busy.swap(true, Ordering::Acquire);
                    executing.push(task);
                    stole = true;
                    break;
                }
                slot.busy.store(false, Ordering::Release);
                mailbox = slot.condvar.wait(mailbox).unwrap();
            }
        }
        if stole {
            if let Some(stats) = worker_stats {
                stats.add_stolen(1);
            }
        }

        let batch_start = worker_stats.map(|_| Instant::now());
        for task in executing.drain(..) {
            match task {
                WorkerTask::Stop => {
                    log_debug!("[{}-{ordinal}] Worker thread stopping", shared.name);
                    return;
                }
                WorkerTask::Run { index, task, latch } => {
                    // SAFETY: An instance that hasn't counted its latch down
                    // yet keeps the dispatching thread blocked, so the latch
                    // and the body are still alive.
                    let latch = unsafe { latch.get() };
                    // Count the latch down on every exit path, including an
                    // unwinding body.
                    let guard = latch.completion_guard();
                    // SAFETY: As above, the body is still alive.
                    let result = catch_unwind(AssertUnwindSafe(|| unsafe { task.call(index) }));
                    if result.is_err() {
                        log_error!(
                            "[{}-{ordinal}] A task body panicked (instance {index})",
                            shared.name
                        );
                        latch.note_panic();
                    }
                    drop(guard);
                    if let Some(stats) = worker_stats {
                        stats.add_executed(1);
                    }
                }
            }
        }
        if let (Some(stats), Some(start)) = (worker_stats, batch_start) {
            stats.add_task_time(start.elapsed());
        }
    }
}
