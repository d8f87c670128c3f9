//! Application layer: the ports wired into a running hive.
//!
//! - **HiveBuilder / Hive**: wiring and fail-fast startup checks
//! - **Queen**: the scheduler control loop
//! - **WorkerExecutor / worker_loop / worker_pool**: claim, execute, report;
//!   keep the pool at size
//! - **ExecutorRegistry**: task kind to executor lookup
//! - **EventRecorder**: ordered execution events
//! - **StatusSnapshot**: read-only views

pub mod builder;
pub mod context;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod worker;

pub use self::builder::{Hive, HiveBuilder, RunningHive};
pub use self::context::HiveContext;
pub use self::recorder::EventRecorder;
pub use self::registry::ExecutorRegistry;
pub use self::scheduler::{Assignment, Queen, TickReport, WorkerHandle, is_settled};
pub use self::status::{StatusSnapshot, TaskCounts};
pub use self::worker::{ExecutionReport, WorkerExecutor, worker_loop, worker_pool};
