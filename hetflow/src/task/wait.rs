use crate::context;
use crossbeam_utils::Backoff;
use std::thread;

/// Keeps the current worker busy with other ready tasks until `done`
/// holds, so that waiting inside a task body never idles a worker.
///
/// Returns `false` without waiting when the current thread is not a runtime
/// worker; the caller then blocks on its own condition variable.
pub(crate) fn help_until<F>(mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    let Some(worker) = context::current_worker() else {
        return false;
    };

    let backoff = Backoff::new();
    while !done() {
        if let Some(task) = worker.find_task() {
            task.run();
            backoff.reset();
        } else if backoff.is_completed() {
            thread::yield_now();
        } else {
            backoff.snooze();
        }
    }

    true
}
