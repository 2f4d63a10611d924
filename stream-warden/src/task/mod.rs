//! Scheduling primitives shared by the polling and monitoring services.
//!
//! - [`RecurringTask`]: fixed-delay, non-overlapping periodic runner
//! - [`ExecutionFence`]: cooperative pause gate checked between units of work

mod fence;
mod recurring;

pub use fence::ExecutionFence;
pub use recurring::{RecurringTask, Task, TaskState};
