// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A user-space task runtime.
//!
//! `weft` runs lightweight tasks on a fixed pool of worker threads with
//! per-worker work-stealing deques. Three kinds of task share the
//! scheduler:
//!
//! - **fork/join tasks** ([`fork`]): continuation-passing bodies for
//!   recursive divide-and-conquer, with child ref-counting, recycling and
//!   bypass scheduling;
//! - **coroutines**: plain Rust futures spawned with
//!   [`Executor::spawn`], joined through [`JoinHandle`]s;
//! - **fibers** ([`fiber`]): synchronous code on private machine stacks
//!   that suspends inside blocking-style I/O calls and resumes on any
//!   worker.
//!
//! Suspended I/O goes through one process-wide readiness bridge
//! ([`io`]); worker 0 polls it whenever it runs out of tasks, so a pool
//! embeds in an application without a separate reactor thread:
//!
//! ```no_run
//! use weft::Executor;
//!
//! let exec = Executor::new(4).unwrap();
//! let exec2 = exec.clone();
//!
//! exec.spawn(async move {
//!     println!("hello from a worker");
//!     exec2.stop();
//! });
//!
//! // The calling thread participates as worker 0.
//! exec.join();
//! ```
//!
//! Scheduling is cooperative: a task runs until it returns from its
//! execute step, awaits something not ready, yields, or enters an I/O
//! call on a not-ready descriptor. There is no preemption and no
//! fairness guarantee beyond FIFO stealing against LIFO local queues.

mod error;
pub mod executor;
pub mod fiber;
pub mod fork;
pub mod io;
mod park;
mod queue;
mod reactor;
pub mod task;

pub use error::{JoinError, SpawnError};
pub use executor::{Executor, current_worker_id};
pub use task::{JoinHandle, TaskRef, yield_now};
