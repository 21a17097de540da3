// Copyright 2025 The spindle developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]

mod core;
mod loops;
mod macros;

pub use crate::core::options::{RunOptions, Schedule, DEFAULT_RUN_OPTIONS};
pub use crate::core::stats::{PoolStats, WorkerStats};
pub use crate::core::thread_pool::{Error, ThreadPool, ThreadPoolBuilder, MAX_WORKERS};
pub use loops::{
    chunks, chunks_global, chunks_info, fan_out, fan_out_global, fan_out_info, loop_indices,
    loop_indices_global, loop_indices_with, loop_range, loop_range_global, JobInfo, StridedRange,
};
