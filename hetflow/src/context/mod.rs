//! Thread-local runtime context.
//!
//! Every thread can have a runtime [`Handle`] installed (worker threads and
//! threads inside [`Runtime::enter`]), worker threads additionally own their
//! [`Worker`], and a thread that is executing a task body has the body's
//! [`TaskContext`] frame installed.
//!
//! [`Runtime::enter`]: crate::runtime::Runtime::enter

use crate::runtime::{Handle, Worker};
use crate::task::{Id, TaskContext};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::ptr;
use std::rc::Rc;

pub(crate) mod slab;

struct Context {
    handle: RefCell<Option<Handle>>,
    worker: RefCell<Option<Rc<Worker>>>,
    frame: Cell<*const TaskContext>,
}

thread_local! {
    static CONTEXT: Context = const {
        Context {
            handle: RefCell::new(None),
            worker: RefCell::new(None),
            frame: Cell::new(ptr::null()),
        }
    };
}

/// Restores the previous handle on drop.
#[must_use]
#[derive(Debug)]
pub struct EnterGuard {
    prev: Option<Handle>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        // During thread teardown the TLS slot may already be gone.
        let _ = CONTEXT.try_with(|ctx| *ctx.handle.borrow_mut() = prev);
    }
}

pub(crate) fn enter_runtime(handle: Handle) -> EnterGuard {
    let prev = CONTEXT.with(|ctx| ctx.handle.borrow_mut().replace(handle));
    EnterGuard {
        prev,
        _not_send: PhantomData,
    }
}

pub(crate) fn try_current_handle() -> Option<Handle> {
    // A running body belongs to the runtime that owns its task.
    if let Some(handle) = with_frame(|frame| frame.map(|f| f.handle().clone())) {
        return Some(handle);
    }

    CONTEXT
        .try_with(|ctx| ctx.handle.borrow().clone())
        .ok()
        .flatten()
}

#[track_caller]
pub(crate) fn current_handle() -> Handle {
    try_current_handle().expect("must be called from the context of a hetflow runtime")
}

pub(crate) struct WorkerGuard {
    _runtime: EnterGuard,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let _ = CONTEXT.try_with(|ctx| ctx.worker.borrow_mut().take());
    }
}

/// Installs `worker` and its runtime handle for the lifetime of the
/// worker thread.
pub(crate) fn enter_worker(worker: Rc<Worker>) -> WorkerGuard {
    let runtime = enter_runtime(worker.handle().clone());
    CONTEXT.with(|ctx| {
        let prev = ctx.worker.borrow_mut().replace(worker);
        debug_assert!(prev.is_none(), "worker context entered twice");
    });

    WorkerGuard { _runtime: runtime }
}

pub(crate) fn current_worker() -> Option<Rc<Worker>> {
    CONTEXT
        .try_with(|ctx| ctx.worker.borrow().clone())
        .ok()
        .flatten()
}

pub(crate) struct FrameGuard<'a> {
    prev: *const TaskContext,
    _frame: PhantomData<&'a TaskContext>,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| ctx.frame.set(self.prev));
    }
}

/// Marks `frame` as the body running on this thread. Frames nest when a
/// worker runs other tasks while waiting.
pub(crate) fn enter_frame(frame: &TaskContext) -> FrameGuard<'_> {
    let prev = CONTEXT.with(|ctx| ctx.frame.replace(frame as *const _));
    FrameGuard {
        prev,
        _frame: PhantomData,
    }
}

pub(crate) fn with_frame<F, R>(f: F) -> R
where
    F: FnOnce(Option<&TaskContext>) -> R,
{
    let frame = CONTEXT
        .try_with(|ctx| ctx.frame.get())
        .unwrap_or(ptr::null());

    // Safety: the pointer is only installed by `enter_frame`, whose guard
    // borrows the frame and clears the slot before the frame goes away.
    f(unsafe { frame.as_ref() })
}

pub(crate) fn current_task_id() -> Option<Id> {
    with_frame(|frame| frame.map(|f| f.id()))
}
