//! Fan-out/fan-in orchestration of identical batch jobs.
//!
//! A [`TaskOrchestrator`](orchestrator::TaskOrchestrator) stages resources
//! from a content-addressable store into N sub-task directories, submits one
//! job per directory to a batch scheduler, waits for completions reported by
//! a shared [`QueueWatcher`](watcher::QueueWatcher), cuts stragglers off with
//! an adaptive deadline and merges the outputs. Completed runs are memoised
//! by the content hash of their inputs and command.

pub mod anomaly;
pub mod cas;
pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod task;
pub mod ui;
pub mod watcher;
