// Copyright 2025 The spindle developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Parallel-loop facades on top of [`ThreadPool::dispatch()`].

use crate::core::options::{RunOptions, Schedule};
use crate::core::thread_pool::{Error, ThreadPool};
use crate::core::util::divide_round_up;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// Position of one instance within a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobInfo {
    /// Index of this instance, in `0..total`.
    pub index: u32,
    /// Total number of instances of the dispatch.
    pub total: u32,
}

/// A strided index range for [`loop_range()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StridedRange {
    /// First index of the range.
    pub begin: i64,
    /// Bound of the range. The loop visits `begin, begin + step, ...` while
    /// the distance travelled from `begin` is less than `|end - begin|`.
    pub end: i64,
    /// Stride between consecutive indices. May be negative to iterate
    /// downward; a zero step makes the loop a no-op.
    pub step: i64,
    /// How many consecutive iterations each job executes before fetching more
    /// work. Zero makes the loop a no-op.
    pub iterations_per_job: u32,
}

impl Default for StridedRange {
    fn default() -> Self {
        Self {
            begin: 0,
            end: 0,
            step: 1,
            iterations_per_job: 1,
        }
    }
}

impl From<Range<i64>> for StridedRange {
    fn from(range: Range<i64>) -> Self {
        Self {
            begin: range.start,
            end: range.end,
            ..Self::default()
        }
    }
}

/// Invokes `body(i)` exactly once for every `i` in `begin..end`, distributing
/// the indices over the pool according to `opts`.
///
/// With [`Schedule::Static`], instance `i` handles the `i`-th contiguous
/// slice of the range. With the dynamic schedules, instances share a single
/// atomic cursor and claim one index at a time, so uneven bodies self-balance.
///
/// An empty range is a no-op. Fails with [`Error::NestedStaticDispatch`] on a
/// nested static dispatch.
///
/// ```
/// # use spindle::{loop_indices, RunOptions, ThreadPool};
/// # use std::sync::atomic::{AtomicU64, Ordering};
/// let pool = ThreadPool::new("worker", 4).unwrap();
/// let sum = AtomicU64::new(0);
/// loop_indices(&pool, RunOptions::default(), 0, 1000, |i| {
///     sum.fetch_add(i as u64, Ordering::Relaxed);
/// })
/// .unwrap();
/// assert_eq!(sum.into_inner(), 499_500);
/// ```
pub fn loop_indices<F: Fn(i64) + Sync>(
    pool: &ThreadPool,
    opts: RunOptions,
    begin: i64,
    end: i64,
    body: F,
) -> Result<(), Error> {
    if begin >= end {
        return Ok(()); // nothing to do
    }
    let size = end.wrapping_sub(begin) as u64;

    let mut opts = opts;
    match pool.adjust_par(size, &mut opts) {
        0 => Err(Error::NestedStaticDispatch),
        1 => {
            // Only one job, just call the body and skip the overhead below.
            for i in begin..end {
                body(i);
            }
            Ok(())
        }
        num_jobs if opts.schedule == Schedule::Static => {
            let worker_part = divide_round_up(size, u64::from(num_jobs));
            pool.dispatch(opts, |instance| {
                let slice_begin = u64::from(instance) * worker_part;
                let slice_end = (slice_begin + worker_part).min(size);
                for i in slice_begin..slice_end {
                    body(begin.wrapping_add(i as i64));
                }
            })?;
            Ok(())
        }
        _ => {
            let cursor = AtomicU64::new(0);
            pool.dispatch(opts, |_| loop {
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                if i >= size {
                    return; // all done
                }
                body(begin.wrapping_add(i as i64));
            })?;
            Ok(())
        }
    }
}

/// Like [`loop_indices()`], with a private state per instance.
///
/// Each instance builds its own `State` with `init` before touching any
/// index, passes it to every `body` invocation it executes, and hands it to
/// `finish` once it runs out of work. States are never shared between
/// instances, so they need neither locks nor atomics.
pub fn loop_indices_with<State, Init, F, Finish>(
    pool: &ThreadPool,
    opts: RunOptions,
    begin: i64,
    end: i64,
    init: Init,
    body: F,
    finish: Finish,
) -> Result<(), Error>
where
    Init: Fn(JobInfo) -> State + Sync,
    F: Fn(&mut State, i64) + Sync,
    Finish: Fn(State) + Sync,
{
    if begin >= end {
        return Ok(()); // nothing to do
    }
    let size = end.wrapping_sub(begin) as u64;

    let mut opts = opts;
    match pool.adjust_par(size, &mut opts) {
        0 => Err(Error::NestedStaticDispatch),
        1 => {
            let mut state = init(JobInfo { index: 0, total: 1 });
            for i in begin..end {
                body(&mut state, i);
            }
            finish(state);
            Ok(())
        }
        num_jobs if opts.schedule == Schedule::Static => {
            let worker_part = divide_round_up(size, u64::from(num_jobs));
            pool.dispatch(opts, |instance| {
                let mut state = init(JobInfo {
                    index: instance,
                    total: num_jobs,
                });
                let slice_begin = u64::from(instance) * worker_part;
                let slice_end = (slice_begin + worker_part).min(size);
                for i in slice_begin..slice_end {
                    body(&mut state, begin.wrapping_add(i as i64));
                }
                finish(state);
            })?;
            Ok(())
        }
        num_jobs => {
            let cursor = AtomicU64::new(0);
            pool.dispatch(opts, |instance| {
                let mut state = init(JobInfo {
                    index: instance,
                    total: num_jobs,
                });
                loop {
                    let i = cursor.fetch_add(1, Ordering::Relaxed);
                    if i >= size {
                        break; // all done
                    }
                    body(&mut state, begin.wrapping_add(i as i64));
                }
                finish(state);
            })?;
            Ok(())
        }
    }
}

/// Parallel loop over the arithmetic progression described by `range`.
///
/// The body is invoked on `begin, begin + step, begin + 2 * step, ...` for
/// `ceil(|end - begin| / |step|)` iterations; a negative step iterates
/// downward. Iterations are grouped into chunks of `iterations_per_job`
/// consecutive indices, so a cheap body can amortize the work-fetching
/// overhead; the grouping changes which thread visits which index, never the
/// visited index set.
///
/// A zero `step` or a zero `iterations_per_job` is a no-op.
pub fn loop_range<F: Fn(i64) + Sync>(
    pool: &ThreadPool,
    opts: RunOptions,
    range: StridedRange,
    body: F,
) -> Result<(), Error> {
    let StridedRange {
        begin,
        end,
        step,
        iterations_per_job,
    } = range;
    if step == 0 || iterations_per_job == 0 {
        return Ok(()); // nothing to do
    }
    if step == 1 && iterations_per_job == 1 {
        // Most straightforward case.
        return loop_indices(pool, opts, begin, end, body);
    }

    let range_size = if end >= begin {
        end.wrapping_sub(begin) as u64
    } else {
        begin.wrapping_sub(end) as u64
    };
    let total_iterations = divide_round_up(range_size, step.unsigned_abs());
    if total_iterations == 0 {
        return Ok(()); // nothing to do
    }
    let chunk_size = u64::from(iterations_per_job);
    let num_chunks = divide_round_up(total_iterations, chunk_size);

    let mut opts = opts;
    match pool.adjust_par(num_chunks, &mut opts) {
        0 => return Err(Error::NestedStaticDispatch),
        1 => {
            // Only one job, just call the body and skip the overhead below.
            let mut i = begin;
            for _ in 0..total_iterations {
                body(i);
                i = i.wrapping_add(step);
            }
            return Ok(());
        }
        _ => {}
    }

    if step == 1 {
        // Avoid the multiplication in the inner loop.
        loop_indices(pool, opts, 0, num_chunks as i64, |chunk_index| {
            let chunk_begin = chunk_index as u64 * chunk_size;
            let chunk_end = (chunk_begin + chunk_size).min(total_iterations);
            for u in chunk_begin..chunk_end {
                body(begin.wrapping_add(u as i64));
            }
        })
    } else {
        loop_indices(pool, opts, 0, num_chunks as i64, |chunk_index| {
            let chunk_begin = chunk_index as u64 * chunk_size;
            let chunk_end = (chunk_begin + chunk_size).min(total_iterations);
            let mut i = begin.wrapping_add((chunk_begin as i64).wrapping_mul(step));
            for _ in chunk_begin..chunk_end {
                body(i);
                i = i.wrapping_add(step);
            }
        })
    }
}

/// Splits `0..size` into one contiguous chunk per instance and invokes
/// `body(chunk)` on each, returning the number of chunks.
///
/// Chunks are ceiling-divide sized, so the last one may be shorter (or, when
/// the size doesn't divide evenly, empty). An empty input returns 0 without
/// invoking the body.
pub fn chunks<F: Fn(Range<u64>) + Sync>(
    pool: &ThreadPool,
    opts: RunOptions,
    size: u64,
    body: F,
) -> Result<u32, Error> {
    chunks_info(pool, opts, size, |chunk, _| body(chunk))
}

/// Like [`chunks()`], also passing each instance its [`JobInfo`].
pub fn chunks_info<F: Fn(Range<u64>, JobInfo) + Sync>(
    pool: &ThreadPool,
    opts: RunOptions,
    size: u64,
    body: F,
) -> Result<u32, Error> {
    if size == 0 {
        return Ok(0); // nothing to do
    }
    let mut opts = opts;
    match pool.adjust_par(size, &mut opts) {
        0 => Err(Error::NestedStaticDispatch),
        1 => {
            // Only one chunk, just call the body and skip the overhead below.
            body(0..size, JobInfo { index: 0, total: 1 });
            Ok(1)
        }
        num_chunks => {
            let chunk_size = divide_round_up(size, u64::from(num_chunks));
            pool.dispatch(opts, |instance| {
                let chunk_begin = (u64::from(instance) * chunk_size).min(size);
                let chunk_end = (chunk_begin + chunk_size).min(size);
                body(
                    chunk_begin..chunk_end,
                    JobInfo {
                        index: instance,
                        total: num_chunks,
                    },
                );
            })
        }
    }
}

/// Runs one instance of `body` per participating thread, returning the number
/// of instances used.
///
/// This is a thin veneer over [`ThreadPool::dispatch()`] that shortcuts
/// `max_par == 1` without touching the pool.
pub fn fan_out<F: Fn(u32) + Sync>(
    pool: &ThreadPool,
    opts: RunOptions,
    body: F,
) -> Result<u32, Error> {
    if opts.max_par == 1 {
        // Only use the calling thread; skip the overhead below.
        body(0);
        return Ok(1);
    }
    pool.dispatch(opts, body)
}

/// Like [`fan_out()`], passing each instance its [`JobInfo`] instead of a
/// bare index. The instance total is the parallelism computed before
/// dispatching.
pub fn fan_out_info<F: Fn(JobInfo) + Sync>(
    pool: &ThreadPool,
    opts: RunOptions,
    body: F,
) -> Result<u32, Error> {
    match pool.effective_par(opts) {
        0 => Err(Error::NestedStaticDispatch),
        1 => {
            body(JobInfo { index: 0, total: 1 });
            Ok(1)
        }
        total => pool.dispatch(opts, |index| body(JobInfo { index, total })),
    }
}

/// [`loop_indices()`] on the global pool.
pub fn loop_indices_global<F: Fn(i64) + Sync>(
    opts: RunOptions,
    begin: i64,
    end: i64,
    body: F,
) -> Result<(), Error> {
    loop_indices(ThreadPool::global(), opts, begin, end, body)
}

/// [`loop_range()`] on the global pool.
pub fn loop_range_global<F: Fn(i64) + Sync>(
    opts: RunOptions,
    range: StridedRange,
    body: F,
) -> Result<(), Error> {
    loop_range(ThreadPool::global(), opts, range, body)
}

/// [`chunks()`] on the global pool.
pub fn chunks_global<F: Fn(Range<u64>) + Sync>(
    opts: RunOptions,
    size: u64,
    body: F,
) -> Result<u32, Error> {
    chunks(ThreadPool::global(), opts, size, body)
}

/// [`fan_out()`] on the global pool.
pub fn fan_out_global<F: Fn(u32) + Sync>(opts: RunOptions, body: F) -> Result<u32, Error> {
    fan_out(ThreadPool::global(), opts, body)
}
