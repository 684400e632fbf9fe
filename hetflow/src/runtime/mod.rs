mod pool;

#[allow(clippy::module_inception)]
mod runtime;
pub(crate) use runtime::RuntimeConfig;
pub use runtime::{Builder, Runtime};

mod scheduler;
pub use scheduler::Handle;

mod shared;

mod spawn;

mod ticker;

mod worker;
pub(crate) use worker::Worker;

#[cfg(test)]
mod tests;
