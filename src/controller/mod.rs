//! Recurring task management
//!
//! A small, injectable replacement for a process-wide controller registry:
//! tasks are keyed, deduplicated by key, and can be awaited until their first
//! success.

mod manager;

pub use manager::{TaskAction, TaskManager, TaskParams, TaskStatus};
