//! Ports: the seams between the scheduling core and the outside world.
//!
//! The core only talks to storage, the event bus, executors, time and id
//! generation through these traits, so each can be swapped (in-memory for
//! tests, durable engines in production).

pub mod clock;
pub mod event_bus;
pub mod executor;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::event_bus::EventBus;
pub use self::executor::TaskExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{DispatchOrder, TaskStore};
