use crate::context;
use crate::error::{Error, Result};
use crate::pattern::tree::{self, Node, Tree};
use crate::pattern::tuner::{Mode, ProfileRecorder, TaskProfile, Tuner};
use crate::runtime::Handle;
use crate::task::{Group, RawTask, TaskContext};
use std::marker::PhantomData;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::slice;
use std::time::Instant;

/// Type-erased reference to a job living on the master's stack.
///
/// Tasks must be `'static` but pattern closures borrow from the caller. The
/// job is reached through a raw pointer and a monomorphized entry point, and
/// the master never returns before every task holding a `JobRef` is
/// terminal.
pub(crate) struct JobRef {
    job: *const (),
    arg: *const (),
    execute: unsafe fn(*const (), *const (), &TaskContext) -> anyhow::Result<()>,
}

// Safety: jobs are `Sync`, and outlive their tasks.
unsafe impl Send for JobRef {}

impl JobRef {
    /// # Safety
    ///
    /// `job` must stay alive until every task built from this reference is
    /// terminal, and `execute` must expect a `J` and the given `arg`.
    pub(crate) unsafe fn new<J: Sync>(
        job: &J,
        arg: *const (),
        execute: unsafe fn(*const (), *const (), &TaskContext) -> anyhow::Result<()>,
    ) -> Self {
        Self {
            job: (job as *const J).cast(),
            arg,
            execute,
        }
    }

    /// Creates an unlaunched task that runs the job.
    pub(crate) fn into_task(self, handle: &Handle) -> crate::task::Task<()> {
        handle.create_task_with_context(move |ctx| {
            // Moves the whole reference; its fields alone are not `Send`.
            let job_ref = self;
            // Safety: upheld by `JobRef::new`.
            unsafe { (job_ref.execute)(job_ref.job, job_ref.arg, ctx) }
        })
    }
}

/// Cancellation seen by every task of one pattern run.
pub(crate) struct Scope {
    /// Task whose body called the pattern, if any.
    caller: Option<RawTask>,
    pub(crate) group: Group,
}

impl Scope {
    pub(crate) fn new() -> Self {
        Self {
            caller: context::with_frame(|frame| frame.map(|ctx| ctx.raw().clone())),
            group: Group::new(),
        }
    }

    pub(crate) fn caller_canceled(&self) -> bool {
        self.caller
            .as_ref()
            .is_some_and(|task| task.is_cancel_requested() || task.in_canceled_group())
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.group.is_canceled() || self.caller_canceled()
    }
}

/// Unwraps a group failure made of a single error.
pub(crate) fn first_failure(err: Error) -> Error {
    match err {
        Error::Aggregate(agg) if agg.len() == 1 => {
            agg.into_inner().pop().unwrap_or(Error::Canceled)
        }
        other => other,
    }
}

/// Mutable slice written concurrently at disjoint indices.
pub(crate) struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// Safety: callers hand out disjoint ranges only, see `slice_mut`.
unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub(crate) fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// Ranges used at the same time must not overlap.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [T] {
        assert!(range.start <= range.end && range.end <= self.len);
        // Safety: in bounds, exclusive per the caller's contract.
        unsafe { slice::from_raw_parts_mut(self.ptr.add(range.start), range.len()) }
    }
}

struct TreeJob<'a, A, F> {
    tree: &'a Tree<A>,
    f: &'a F,
    scope: &'a Scope,
    recorder: Option<&'a ProfileRecorder>,
}

impl<A, F> TreeJob<'_, A, F>
where
    A: Send,
    F: Fn(&mut Option<A>, Range<usize>) + Sync,
{
    fn participate(&self, leaf: Option<NonNull<Node<A>>>, master: bool) {
        let start = Instant::now();

        // Helpers only poll the group flag, the master also polls its caller.
        let stats = if master {
            self.tree.participate(leaf, || self.scope.is_canceled(), self.f)
        } else {
            self.tree.participate(leaf, || self.scope.group.is_canceled(), self.f)
        };

        if let Some(recorder) = self.recorder {
            recorder.record(TaskProfile {
                task: context::current_task_id(),
                elements: stats.elements,
                chunks: stats.chunks,
                elapsed: start.elapsed(),
            });
        }
    }
}

unsafe fn tree_entry<A, F>(job: *const (), leaf: *const (), _: &TaskContext) -> anyhow::Result<()>
where
    A: Send,
    F: Fn(&mut Option<A>, Range<usize>) + Sync,
{
    // Safety: the master keeps the job alive until every helper is terminal.
    let job = unsafe { &*job.cast::<TreeJob<'_, A, F>>() };
    job.participate(NonNull::new(leaf.cast_mut().cast()), false);
    Ok(())
}

/// Runs `f` over `range` on the work-stealing tree and returns the tree so
/// that callers can read the per-node accumulators.
///
/// The calling thread is the master: it takes the first leaf and waits for
/// the helpers before returning, helping other tasks meanwhile when it is a
/// worker. `range` must not be empty.
pub(crate) fn run_tree<A, F>(
    handle: &Handle,
    tuner: &Tuner,
    pattern: &'static str,
    range: Range<usize>,
    chunk: Option<usize>,
    f: F,
) -> Result<Tree<A>>
where
    A: Send,
    F: Fn(&mut Option<A>, Range<usize>) + Sync,
{
    debug_assert!(!range.is_empty());

    let len = range.len();
    let degree = tuner.degree_for(handle);
    let chunk = chunk.unwrap_or_else(|| tuner.chunk_for(len, degree));

    let (parts, steal) = match tuner.mode() {
        Mode::Adaptive => (tree::adaptive_parts(degree), true),
        Mode::Static => (degree, false),
        Mode::Serial => (1, false),
    };
    let (tree, leaves) = Tree::new(handle.runtime_id(), range, chunk, parts, steal);

    let helpers = match tuner.mode() {
        Mode::Adaptive => (degree - 1).min(len.div_ceil(chunk) - 1),
        Mode::Static => leaves.len() - 1,
        Mode::Serial => 0,
    };

    let scope = Scope::new();
    let recorder = tuner.recorder();
    let job = TreeJob {
        tree: &tree,
        f: &f,
        scope: &scope,
        recorder: recorder.as_ref(),
    };

    for i in 1..=helpers {
        let leaf = leaves
            .get(i)
            .map_or(ptr::null(), |leaf| leaf.as_ptr().cast_const().cast::<()>());

        // Safety: `scope.group` is waited on below, on every path.
        let job_ref = unsafe { JobRef::new(&job, leaf, tree_entry::<A, F>) };
        if let Err(err) = job_ref.into_task(handle).launch_in(&scope.group) {
            tracing::debug!(pattern, ?err, "no more helpers");
            break;
        }
    }

    tracing::trace!(pattern, len, chunk, helpers, mode = ?tuner.mode(), "pattern started");

    let master = panic::catch_unwind(AssertUnwindSafe(|| {
        job.participate(leaves.first().copied(), true)
    }));
    if master.is_err() {
        tree.abort();
        scope.group.cancel();
    }

    let waited = scope.group.wait_for();
    if let Err(payload) = master {
        panic::resume_unwind(payload);
    }
    waited.map_err(first_failure)?;
    drop(job);

    if let Some(recorder) = recorder {
        tuner.store_profile(recorder.finish(pattern, chunk, tree.steals(), tree.nodes()));
    }

    if tree.is_aborted() {
        return Err(Error::Canceled);
    }
    Ok(tree)
}
