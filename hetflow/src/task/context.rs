use crate::error::{Error, Result};
use crate::runtime::Handle;
use crate::task::group::Group;
use crate::task::raw::RawTask;
use crate::task::{Id, Task};
use std::cell::RefCell;
use std::fmt;

/// Completion of the running task was handed to something else.
pub(crate) enum Deferral {
    Group(Group),
    Task(RawTask),
}

/// Passed to a task body while it runs.
pub struct TaskContext {
    task: RawTask,
    deferral: RefCell<Option<Deferral>>,
}

impl TaskContext {
    pub(crate) fn new(task: RawTask) -> Self {
        Self {
            task,
            deferral: RefCell::new(None),
        }
    }

    pub fn id(&self) -> Id {
        self.task.id()
    }

    pub(crate) fn raw(&self) -> &RawTask {
        &self.task
    }

    /// Runtime the task belongs to.
    pub fn handle(&self) -> &Handle {
        self.task.handle()
    }

    /// Whether the task, or a group it belongs to, was canceled.
    pub fn is_canceled(&self) -> bool {
        self.task.is_cancel_requested() || self.task.in_canceled_group()
    }

    /// Returns `Err(Error::Canceled)` once cancellation was requested. A body
    /// that propagates it with `?` completes as canceled, not failed.
    pub fn abort_on_cancel(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Defers completion of the running task until `group` drains. The task
    /// then completes with the value its body returned, or fails with the
    /// group's aggregate error.
    pub fn finish_after(&self, group: &Group) -> Result<()> {
        self.defer(Deferral::Group(group.clone()))
    }

    /// Defers completion of the running task until `task` is terminal; the
    /// running task then takes over its outcome, output included.
    pub fn finish_after_task<T>(&self, task: &Task<T>) -> Result<()> {
        if task.raw() == &self.task {
            return Err(Error::InvalidState("a task cannot finish after itself"));
        }
        self.defer(Deferral::Task(task.raw().clone()))
    }

    fn defer(&self, deferral: Deferral) -> Result<()> {
        let mut slot = self.deferral.borrow_mut();
        if slot.is_some() {
            return Err(Error::InvalidState("task completion is already deferred"));
        }
        *slot = Some(deferral);
        Ok(())
    }

    pub(crate) fn take_deferral(&self) -> Option<Deferral> {
        self.deferral.borrow_mut().take()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext").field("task", &self.id()).finish()
    }
}
