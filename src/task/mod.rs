//! Tasks and the queue that holds them before dispatch.

pub mod model;
pub mod queue;

pub use model::{Task, TaskId, TaskKind, TaskStatus};
pub use queue::{QueueStatus, TaskQueue};
