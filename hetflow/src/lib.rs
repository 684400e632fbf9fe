//! Heterogeneous task-graph runtime.
//!
//! Programs are expressed as graphs of [`Task`]s connected by dependency
//! edges and grouped for collective waiting and cancellation. Ready tasks run
//! on a pool of work-stealing CPU workers, or on a GPU / DSP through a
//! [`DeviceDriver`](device::DeviceDriver). [`Buffer`]s keep one arena per
//! memory kind coherent, and tasks that touch the same buffer in conflicting
//! ways are serialised automatically. The [`pattern`] module builds parallel
//! for / reduce / scan / transform / divide-and-conquer on top.

#[doc(inline)]
pub use hetflow_macros::main;

#[doc(inline)]
pub use hetflow_macros::test;

pub mod buffer;
pub use buffer::{Access, ArenaKind, ArenaSet, Buffer, MemoryRegion};

mod context;
pub use context::EnterGuard;

pub mod device;

mod error;
pub use error::{AggregateError, DeviceError, Error, Misuse, Result};

pub mod pattern;
pub use pattern::Tuner;

mod queue;

pub mod runtime;
pub use runtime::{Handle, Runtime};

pub mod task;
pub use task::{Group, Task, TaskBuilder, TaskContext, TaskStatus};

mod utils;

#[cfg(test)]
mod test_utils;

/// Creates and launches a CPU task on the current runtime.
///
/// # Panics
///
/// Panics when called outside of a runtime, see [`Handle::current`].
#[track_caller]
pub fn spawn<F, T>(f: F) -> Task<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Handle::current().spawn(f)
}

/// Creates an unlaunched CPU task on the current runtime.
#[track_caller]
pub fn create_task<F, T>(f: F) -> Task<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Handle::current().create_task(f)
}

pub fn launch<T>(task: &Task<T>) -> Result<()> {
    task.launch()
}

pub fn launch_in<T>(task: &Task<T>, group: &Group) -> Result<()> {
    task.launch_in(group)
}

/// Adds the edge `pred -> succ`.
pub fn then<T, U>(pred: &Task<T>, succ: &Task<U>) -> Result<()> {
    pred.then(succ)
}

/// Adds the edge `pred -> succ`, written from the successor's side.
pub fn after<T, U>(succ: &Task<T>, pred: &Task<U>) -> Result<()> {
    succ.after(pred)
}

pub fn wait_for<T>(task: &Task<T>) -> Result<()> {
    task.wait_for()
}

pub fn cancel<T>(task: &Task<T>) {
    task.cancel()
}

/// Returns `Err(Error::Canceled)` if the running task was canceled.
///
/// Outside of a task body this is a [`Misuse::NotInTask`].
pub fn abort_on_cancel() -> Result<()> {
    context::with_frame(|frame| match frame {
        Some(ctx) => ctx.abort_on_cancel(),
        None => Err(Misuse::NotInTask.into()),
    })
}

/// Defers completion of the running task until `group` drains, see
/// [`TaskContext::finish_after`].
pub fn finish_after(group: &Group) -> Result<()> {
    context::with_frame(|frame| match frame {
        Some(ctx) => ctx.finish_after(group),
        None => Err(Misuse::NotInTask.into()),
    })
}

/// Defers completion of the running task until `task` is terminal, see
/// [`TaskContext::finish_after_task`].
pub fn finish_after_task<T>(task: &Task<T>) -> Result<()> {
    context::with_frame(|frame| match frame {
        Some(ctx) => ctx.finish_after_task(task),
        None => Err(Misuse::NotInTask.into()),
    })
}

/// Id of the task whose body runs on this thread.
pub fn current_task_id() -> Option<task::Id> {
    context::current_task_id()
}
