//! Storage layer for the control-plane task queue: connection pooling,
//! migrations, and the query functions that implement the task state
//! machine on top of SQLite.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use models::{
    clamp_priority, ActiveAssignment, FileOwnership, Task, TaskEvent, TaskStatus,
    TaskStatusParseError, WorkerMirror,
};
