use crate::buffer::Accesses;
use crate::context::slab;
use crate::error::Error;
use crate::runtime::Handle;
use crate::task::Id;
use crate::task::body::{Args, Body, Output};
use crate::task::group::Group;
use crate::task::state::{State, Status};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{self, AtomicUsize, Ordering};

/// What a finished task left behind.
pub(crate) enum Outcome {
    Pending,
    Value(Output),
    /// The value was moved out by `Task::get` or forwarded by `finish_after`.
    Taken,
    Failed(Error),
    Canceled,
}

/// How a task finishes.
pub(crate) enum Completion {
    Value(Output),
    Failed(Error),
    Canceled,
}

impl Completion {
    pub(crate) fn from_error(err: Error) -> Self {
        if err.is_canceled() {
            Completion::Canceled
        } else {
            Completion::Failed(err)
        }
    }

    pub(crate) fn status(&self) -> Status {
        match self {
            Completion::Value(_) => Status::COMPLETED,
            Completion::Failed(_) => Status::FAILED,
            Completion::Canceled => Status::CANCELED,
        }
    }

    fn into_outcome(self) -> Outcome {
        match self {
            Completion::Value(v) => Outcome::Value(v),
            Completion::Failed(e) => Outcome::Failed(e),
            Completion::Canceled => Outcome::Canceled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeKind {
    /// Declared dependency. Failure and cancellation propagate along it.
    Control,
    /// Completion of the successor was deferred until this task finishes;
    /// the output is forwarded.
    Finish,
    /// Ordering imposed by a buffer conflict.
    Order,
}

pub(crate) struct Edge {
    pub(crate) task: RawTask,
    pub(crate) kind: EdgeKind,
}

#[derive(Default)]
pub(crate) struct Links {
    pub(crate) successors: SmallVec<[Edge; 2]>,
    pub(crate) groups: SmallVec<[Group; 1]>,
}

pub(crate) struct Core {
    pub(crate) body: Body,
    pub(crate) args: Option<Args>,
}

pub(crate) struct Cell {
    state: State,
    refs: AtomicUsize,
    id: Id,

    /// Keeps the scheduler, and with it the slab pool this cell lives in,
    /// alive. Dropped after the cell memory is released.
    handle: ManuallyDrop<Handle>,

    /// Owned by whoever holds the `QUEUED` token, or by `bind_all` before
    /// launch.
    core: UnsafeCell<Option<Core>>,

    /// Guarded by the `LOCKED` state bit.
    links: UnsafeCell<Links>,

    accesses: Accesses,

    /// Task whose body launched this one. Its buffers may be borrowed.
    parent: OnceLock<RawTask>,

    outcome: Mutex<Outcome>,
    cond: Condvar,
}

/// Counted reference to a task cell.
pub(crate) struct RawTask {
    ptr: NonNull<Cell>,
}

// Safety: every field of the cell is either atomic, behind a lock, or owned
// by a single party at a time (see the field docs).
unsafe impl Send for RawTask {}
unsafe impl Sync for RawTask {}

impl RawTask {
    pub(crate) fn new(handle: &Handle, body: Body, needs_args: bool, accesses: Accesses) -> RawTask {
        Self::from_cell(
            handle,
            Cell {
                state: State::new(needs_args),
                refs: AtomicUsize::new(1),
                id: Id::next(),
                handle: ManuallyDrop::new(handle.clone()),
                core: UnsafeCell::new(Some(Core { body, args: None })),
                links: UnsafeCell::new(Links::default()),
                accesses,
                parent: OnceLock::new(),
                outcome: Mutex::new(Outcome::Pending),
                cond: Condvar::new(),
            },
        )
    }

    /// A task that is already completed with `value`.
    pub(crate) fn new_completed(handle: &Handle, value: Output) -> RawTask {
        Self::from_cell(
            handle,
            Cell {
                state: State::new_completed(),
                refs: AtomicUsize::new(1),
                id: Id::next(),
                handle: ManuallyDrop::new(handle.clone()),
                core: UnsafeCell::new(None),
                links: UnsafeCell::new(Links::default()),
                accesses: Accesses::new(),
                parent: OnceLock::new(),
                outcome: Mutex::new(Outcome::Value(value)),
                cond: Condvar::new(),
            },
        )
    }

    fn from_cell(handle: &Handle, cell: Cell) -> RawTask {
        RawTask {
            ptr: slab::alloc(handle.runtime_id(), cell),
        }
    }

    fn cell(&self) -> &Cell {
        // Safety: the cell lives while any `RawTask` points to it.
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn id(&self) -> Id {
        self.cell().id
    }

    pub(crate) fn state(&self) -> &State {
        &self.cell().state
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.cell().handle
    }

    pub(crate) fn accesses(&self) -> &Accesses {
        &self.cell().accesses
    }

    /// Records the task launching this one. Only the first launch counts.
    pub(crate) fn set_parent(&self, parent: &RawTask) {
        if parent != self && !parent.has_ancestor(self) {
            let _ = self.cell().parent.set(parent.clone());
        }
    }

    pub(crate) fn parent(&self) -> Option<&RawTask> {
        self.cell().parent.get()
    }

    /// Enclosing tasks, nearest first.
    pub(crate) fn ancestors(&self) -> impl Iterator<Item = &RawTask> {
        std::iter::successors(self.parent(), |&task| task.parent())
    }

    pub(crate) fn has_ancestor(&self, task: &RawTask) -> bool {
        self.ancestors().any(|a| a == task)
    }

    pub(crate) fn lock_links(&self) -> LinksGuard<'_> {
        self.state().lock();
        LinksGuard { cell: self.cell() }
    }

    /// # Safety
    ///
    /// The caller owns the `QUEUED` token of this task.
    pub(crate) unsafe fn take_core(&self) -> Option<Core> {
        // Safety: upheld by caller.
        unsafe { (*self.cell().core.get()).take() }
    }

    /// Stores bound arguments. The caller holds the links lock and the task
    /// is not launched.
    pub(crate) fn set_args(&self, _links: &LinksGuard<'_>, args: Args) {
        debug_assert!(self.state().load().is(Status::UNLAUNCHED));
        // Safety: an unlaunched task is never run, and the links lock excludes
        // concurrent binds.
        if let Some(core) = unsafe { &mut *self.cell().core.get() } {
            core.args = Some(args);
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state().load().is_terminal()
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.state().load().is(Status::CANCEL_REQUESTED)
    }

    pub(crate) fn in_canceled_group(&self) -> bool {
        self.lock_links().groups.iter().any(Group::is_canceled)
    }

    pub(crate) fn store_outcome(&self, completion: Completion) {
        *self.cell().outcome.lock() = completion.into_outcome();
    }

    /// Wakes threads blocked in `wait_blocking`. Called once the task is
    /// terminal.
    pub(crate) fn notify_waiters(&self) {
        let _outcome = self.cell().outcome.lock();
        self.cell().cond.notify_all();
    }

    pub(crate) fn wait_blocking(&self) {
        let mut outcome = self.cell().outcome.lock();
        while !self.is_terminal() {
            self.cell().cond.wait(&mut outcome);
        }
    }

    pub(crate) fn with_outcome<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Outcome) -> R,
    {
        f(&mut self.cell().outcome.lock())
    }

    fn drop_reference(&self) {
        if self.cell().refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }

        atomic::fence(Ordering::Acquire);

        // Safety: this was the last reference. The handle is moved out first
        // so that the slab pool outlives the block it frees.
        unsafe {
            let handle = ManuallyDrop::take(&mut (*self.ptr.as_ptr()).handle);
            slab::dealloc(self.ptr);
            drop(handle);
        }
    }
}

impl Clone for RawTask {
    fn clone(&self) -> Self {
        let prev = self.cell().refs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0 && prev < usize::MAX / 2, "task ref-count overflow");
        RawTask { ptr: self.ptr }
    }
}

impl Drop for RawTask {
    fn drop(&mut self) {
        self.drop_reference();
    }
}

impl PartialEq for RawTask {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for RawTask {}

impl fmt::Debug for RawTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTask")
            .field("id", &self.id())
            .field("state", self.state())
            .finish()
    }
}

/// Exclusive access to the successor and group lists. Unlocks on drop.
pub(crate) struct LinksGuard<'a> {
    cell: &'a Cell,
}

impl Deref for LinksGuard<'_> {
    type Target = Links;

    fn deref(&self) -> &Links {
        // Safety: the `LOCKED` bit is held.
        unsafe { &*self.cell.links.get() }
    }
}

impl DerefMut for LinksGuard<'_> {
    fn deref_mut(&mut self) -> &mut Links {
        // Safety: the `LOCKED` bit is held.
        unsafe { &mut *self.cell.links.get() }
    }
}

impl Drop for LinksGuard<'_> {
    fn drop(&mut self) {
        self.cell.state.unlock();
    }
}
