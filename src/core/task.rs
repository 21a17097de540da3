// Copyright 2025 The spindle developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Type-erased handle to a dispatch body.

use std::ptr::NonNull;

/// Shape of a dispatch body: a closure invoked once per instance with the
/// instance index. Instances run concurrently, hence the [`Sync`] bound.
pub type Body<'a> = dyn Fn(u32) + Sync + 'a;

/// A lifetime-erased, non-owning handle to a dispatch body that lives on the
/// dispatching thread's frame.
///
/// This acts as a `&'a Body<'a>` whose lifetime has been erased, so that
/// copies of the handle can be stored in worker mailboxes and in the pool's
/// pending queue without any allocation. The trait-object pointer already
/// carries the data pointer and the call trampoline, so nothing else is
/// needed.
///
/// Erasing the lifetime is sound because dispatches are synchronous: the
/// dispatching thread does not return before the completion counter of the
/// dispatch reaches zero, which in turn happens only after the last call
/// through this handle has finished.
#[derive(Clone, Copy)]
pub(crate) struct RawTask {
    ptr: NonNull<Body<'static>>,
}

impl RawTask {
    /// Erases the lifetime of the given body.
    ///
    /// # Safety
    ///
    /// The caller must ensure that every call made through any copy of the
    /// returned handle happens before the underlying closure is dropped.
    // The transmute is necessary because the lifetime is coerced to
    // 'static; a raw pointer cast can no longer do this for trait objects.
    pub(crate) unsafe fn new(body: &Body<'_>) -> Self {
        let ptr: NonNull<Body<'static>> =
            unsafe { std::mem::transmute(NonNull::from(body)) };
        Self { ptr }
    }

    /// Invokes the body with the given instance index.
    ///
    /// # Safety
    ///
    /// The underlying closure must still be alive, i.e. the dispatch that
    /// created this handle must not have returned yet.
    pub(crate) unsafe fn call(&self, instance_index: u32) {
        // SAFETY:
        // - This pointer points to a valid initialized closure, as set in
        //   `new()`.
        // - The closure is still alive, as ensured by the caller.
        // - The closure is never mutated through this handle: only shared
        //   references to it are ever manipulated.
        let body = unsafe { self.ptr.as_ref() };
        body(instance_index);
    }
}

/// SAFETY:
///
/// A [`RawTask`] acts as a `&Body`, and `Body` is [`Sync`] by definition.
/// A shared reference to a [`Sync`] type is [`Send`].
unsafe impl Send for RawTask {}
/// SAFETY:
///
/// A [`RawTask`] acts as a `&Body`, and `Body` is [`Sync`] by definition.
unsafe impl Sync for RawTask {}
