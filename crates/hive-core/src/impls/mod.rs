//! Port implementations shipped with the core.
//!
//! - **InMemoryTaskStore**: the default task store
//! - **InMemoryEventBus**: events kept in memory, for tests and status views
//! - **JsonlEventLog**: append-only JSON Lines event log
//! - **CommandExecutor**: runs `command` and `pipeline` tasks as processes
//!
//! Durable stores belong in their own crates behind the same ports.

pub mod command_executor;
pub mod inmem_events;
pub mod inmem_store;
pub mod jsonl_events;

pub use self::command_executor::{CommandExecutor, RESULT_MARKER, interpret_output};
pub use self::inmem_events::InMemoryEventBus;
pub use self::inmem_store::InMemoryTaskStore;
pub use self::jsonl_events::JsonlEventLog;
