// Public API
pub mod id;
pub use self::id::Id;

mod body;
pub use self::body::KernelArg;
pub(crate) use self::body::{Args, Body, CpuFn, Output};

mod context;
pub use self::context::TaskContext;

mod group;
pub use self::group::Group;

mod harness;

mod raw;
pub(crate) use self::raw::RawTask;

mod state;

#[allow(clippy::module_inception)]
mod task;
pub(crate) use self::task::cpu_body;
pub use self::task::{Task, TaskBuilder, TaskStatus};

pub(crate) mod wait;

#[cfg(test)]
mod tests;
