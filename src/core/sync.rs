// Copyright 2025 The spindle developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Completion synchronization between a dispatching thread and the workers.

use super::util::Status;
use crossbeam_utils::CachePadded;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// A single-use countdown latch tracking the remote instances of one dispatch.
///
/// The latch is initialized with the number of instances to be executed by
/// threads other than the dispatching one. Each such instance decrements it
/// exactly once via a [`CompletionGuard`], and the dispatching thread blocks
/// in [`wait()`](Self::wait) until the count reaches zero. The latch also
/// tallies instances whose body panicked, so that the dispatching thread can
/// re-raise once the dispatch is complete.
pub(crate) struct CompletionLatch {
    /// Number of remote instances that still have to finish.
    remaining: CachePadded<AtomicU32>,
    /// Number of remote instances whose body panicked.
    panicked: AtomicU32,
    /// Flipped to true by the last finishing instance.
    all_done: Status<bool>,
}

impl CompletionLatch {
    /// Creates a latch for the given (non-zero) number of remote instances.
    pub(crate) fn new(remote_instances: u32) -> Self {
        debug_assert!(remote_instances > 0);
        Self {
            remaining: CachePadded::new(AtomicU32::new(remote_instances)),
            panicked: AtomicU32::new(0),
            all_done: Status::new(false),
        }
    }

    /// Records that an instance's body panicked.
    ///
    /// Must be called before the instance's [`CompletionGuard`] is dropped, so
    /// that the tally is visible to the waiter once the latch reaches zero.
    pub(crate) fn note_panic(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    fn count_down(&self) {
        let remaining = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(remaining > 0);
        if remaining == 1 {
            // We're the last instance. Wake up the dispatching thread.
            self.all_done.notify_one(true);
        }
    }

    /// Blocks until every remote instance has finished, and returns the number
    /// of instances whose body panicked.
    pub(crate) fn wait(&self) -> u32 {
        if self.remaining.load(Ordering::Acquire) != 0 {
            drop(self.all_done.wait_while(|done| !*done));
        }
        self.panicked.load(Ordering::Relaxed)
    }

    /// Returns a guard that counts this latch down when dropped.
    pub(crate) fn completion_guard(&self) -> CompletionGuard<'_> {
        CompletionGuard { latch: self }
    }
}

/// Guard decrementing a [`CompletionLatch`] when dropped.
///
/// An instance obtains this guard before invoking the body, which guarantees
/// exactly one decrement per instance on every control-flow path, including
/// unwinding out of the body.
pub(crate) struct CompletionGuard<'a> {
    latch: &'a CompletionLatch,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}

/// Guard making the dispatching thread block on its latch when dropped.
///
/// The dispatch frame owns both the body and the latch that worker threads
/// reference through lifetime-erased handles. Waiting on drop keeps those
/// handles valid even if the caller's own instance unwinds.
pub(crate) struct WaitOnDrop<'a>(pub(crate) &'a CompletionLatch);

impl Drop for WaitOnDrop<'_> {
    fn drop(&mut self) {
        self.0.wait();
    }
}

/// A lifetime-erased reference to a [`CompletionLatch`] living on the
/// dispatching thread's frame.
///
/// Dereferencing is sound for the same reason as [`RawTask`]: an instance that
/// has not yet counted the latch down keeps the dispatching thread blocked, so
/// the latch is necessarily still alive whenever a handle is dereferenced. A
/// record in the pending queue may outlive its dispatch, but such a record is
/// exhausted by then and its handle is only ever used for identity comparison.
///
/// [`RawTask`]: super::task::RawTask
#[derive(Clone, Copy)]
pub(crate) struct LatchRef {
    ptr: NonNull<CompletionLatch>,
}

impl LatchRef {
    /// Erases the lifetime of the given latch.
    pub(crate) fn new(latch: &CompletionLatch) -> Self {
        Self {
            ptr: NonNull::from(latch),
        }
    }

    /// Returns whether this handle points to the given latch.
    pub(crate) fn refers_to(&self, latch: &CompletionLatch) -> bool {
        std::ptr::eq(self.ptr.as_ptr(), latch)
    }

    /// Returns the underlying latch.
    ///
    /// # Safety
    ///
    /// The latch must still be alive, i.e. the dispatch that created this
    /// handle must not have returned yet.
    pub(crate) unsafe fn get(&self) -> &CompletionLatch {
        // SAFETY: The pointer was derived from a valid reference in `new()`,
        // and the underlying latch is still alive as ensured by the caller.
        unsafe { self.ptr.as_ref() }
    }
}

/// SAFETY:
///
/// A [`LatchRef`] acts as a `&CompletionLatch`, and [`CompletionLatch`] only
/// contains [`Sync`] synchronization primitives. A shared reference to a
/// [`Sync`] type is [`Send`].
unsafe impl Send for LatchRef {}
/// SAFETY:
///
/// A [`LatchRef`] acts as a `&CompletionLatch`, which is [`Sync`].
unsafe impl Sync for LatchRef {}
