//! Minimal task model.
//!
//! The scheduler is future work; the core only needs enough of a task to
//! represent "the thing currently running on an executor" during
//! bring-up.

use crate::executor::{Executor, Stack};
use cascade_collections::Name;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Identifier of a task, unique for the lifetime of the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TaskId(u64);

impl TaskId {
    fn allocate() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Execution state of a task. Ready/blocked states arrive with the
/// scheduler.
pub enum TaskState {
    Running(*const Executor),
}

/// A schedulable unit.
pub struct Task {
    pub id: TaskId,
    pub name: Name,
    pub stack: Stack,
    /// Nesting count mirrored from the exclusion tokens when the task is
    /// switched out, so masking state survives a migration.
    pub interrupt_disable_count: u32,
    pub state: TaskState,
}

impl Task {
    /// Create a task representing code already running on `executor`.
    pub fn bootstrap(name: &str, stack: Stack, executor: &'static Executor) -> Self {
        Self {
            id: TaskId::allocate(),
            name: Name::new(name),
            stack,
            interrupt_disable_count: 0,
            state: TaskState::Running(executor),
        }
    }
}
