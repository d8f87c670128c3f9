//! hive-core
//!
//! A fault-tolerant task scheduler: a single scheduler (the queen) hands
//! dependency-ordered, prioritised tasks to a pool of workers, watches their
//! heartbeats and deadlines, and requeues work lost to failures.
//!
//! # Modules
//! - **domain**: ids, task records, the status state machine, outcomes, events, errors
//! - **ports**: TaskStore, EventBus, TaskExecutor, Clock, IdGenerator
//! - **graph**: dependency resolution (Kahn's algorithm)
//! - **resilience**: circuit breaker, retry policy, adaptive timeouts
//! - **app**: scheduler, workers, builder, status views
//! - **impls**: in-memory store and bus, JSONL event log, command executor
//! - **config**: TOML configuration with env overrides

pub mod app;
pub mod config;
pub mod domain;
pub mod graph;
pub mod impls;
pub mod ports;
pub mod resilience;

pub use app::{Hive, HiveBuilder, Queen, RunningHive, StatusSnapshot, WorkerExecutor};
pub use config::HiveConfig;
pub use domain::{HiveError, Result, TaskId, TaskSpec, TaskStatus};
