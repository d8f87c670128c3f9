//! Domain model (ids, task records, state machine, outcomes, events, errors).

pub mod attempt;
pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod task;
pub mod worker;

pub use attempt::{AttemptRecord, RunStatus};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, HiveError};
pub use events::{EventKind, ExecutionEvent};
pub use ids::{RunId, TaskId, WorkerId};
pub use outcome::{Artifact, Outcome, OutcomeKind};
pub use state::{TaskStatus, WorkerStatus};
pub use task::{
    COMMAND_KIND, CommandSpec, Expected, NewTask, Ownership, TaskPatch, TaskPayload, TaskRecord,
    TaskResult, TaskSpec,
};
pub use worker::WorkerRecord;

pub type Result<T> = std::result::Result<T, HiveError>;
