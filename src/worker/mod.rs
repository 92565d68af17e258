//! Worker subprocesses and their plumbing.
//!
//! Each collector thread owns at most one worker process at a time. A
//! worker runs its own copy of the evaluator, serves one path-addressed
//! job per request over a pipe pair, and retires itself when its resident
//! set grows past the configured threshold. The operating system reclaims
//! the memory by tearing down the process; the collector spawns a
//! replacement and the queue moves on.

pub mod ipc;
mod proc;
mod spawn;
pub mod worker_main;

pub use proc::Proc;
pub use spawn::{spawn_collector_thread, spawn_worker, WorkerConfig};
pub use worker_main::run_worker_main;
