//! Divide and conquer on top of tasks.
//!
//! Every subproblem is a task. A task either solves its subproblem directly
//! or splits it, launches one task per part and a merge continuation that
//! depends on all of them, then defers its own completion to the merge.

use crate::context::slab;
use crate::error::{Error, Result};
use crate::pattern::driver::{self, JobRef, Scope};
use crate::pattern::tuner::{Mode, ProfileRecorder, TaskProfile, Tuner};
use crate::runtime::Handle;
use crate::task::{Task, TaskContext};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// A subproblem. Touched by its solving task, then by its merge task, then
/// by the master; task edges order these accesses.
struct DacNode<P, R> {
    problem: UnsafeCell<Option<P>>,
    result: UnsafeCell<Option<R>>,
    children: UnsafeCell<Vec<NonNull<DacNode<P, R>>>>,
}

struct DacJob<'a, P, R> {
    handle: &'a Handle,
    scope: &'a Scope,
    is_base: &'a (dyn Fn(&P) -> bool + Sync),
    base: &'a (dyn Fn(P) -> R + Sync),
    split: &'a (dyn Fn(P) -> Vec<P> + Sync),
    merge: &'a (dyn Fn(Vec<R>) -> R + Sync),
    nodes: AtomicUsize,
    recorder: Option<&'a ProfileRecorder>,
}

impl<P: Send, R: Send> DacJob<'_, P, R> {
    fn alloc(&self, problem: P) -> NonNull<DacNode<P, R>> {
        self.nodes.fetch_add(1, Ordering::Relaxed);
        slab::alloc(
            self.handle.runtime_id(),
            DacNode {
                problem: UnsafeCell::new(Some(problem)),
                result: UnsafeCell::new(None),
                children: UnsafeCell::new(Vec::new()),
            },
        )
    }

    fn task(
        &self,
        node: NonNull<DacNode<P, R>>,
        entry: unsafe fn(*const (), *const (), &TaskContext) -> anyhow::Result<()>,
    ) -> Task<()> {
        // Safety: the master waits for the scope's group before the job goes
        // away.
        let job_ref = unsafe { JobRef::new(self, node.as_ptr().cast_const().cast(), entry) };
        job_ref.into_task(self.handle)
    }

    fn solve(&self, node: &DacNode<P, R>, ctx: &TaskContext) -> Result<()> {
        let start = Instant::now();

        if self.scope.is_canceled() {
            self.scope.group.cancel();
            return Err(Error::Canceled);
        }

        // Safety: nothing else touches the node while it is being solved.
        let problem = unsafe { (*node.problem.get()).take() }
            .ok_or(Error::InvalidState("subproblem solved twice"))?;

        if (self.is_base)(&problem) {
            let result = (self.base)(problem);
            // Safety: as above.
            unsafe { *node.result.get() = Some(result) };
            self.record(ctx, start, 1);
            return Ok(());
        }

        let children: Vec<_> = (self.split)(problem)
            .into_iter()
            .map(|part| self.alloc(part))
            .collect();
        // Safety: as above, children are published before any task reads them.
        unsafe { *node.children.get() = children.clone() };

        let merge = self.task(NonNull::from(node), merge_entry::<P, R>);
        for child in children {
            let task = self.task(child, solve_entry::<P, R>);
            task.then(&merge)?;
            task.launch_in(&self.scope.group)?;
        }
        merge.launch_in(&self.scope.group)?;
        ctx.finish_after_task(&merge)?;

        self.record(ctx, start, 0);
        Ok(())
    }

    fn merge(&self, node: &DacNode<P, R>) -> Result<()> {
        // Safety: every child task completed before this continuation runs.
        let children = unsafe { &*node.children.get() };
        let results = children
            .iter()
            .map(|child| {
                // Safety: as above.
                unsafe { (*child.as_ref().result.get()).take() }
                    .ok_or(Error::InvalidState("subproblem has no result"))
            })
            .collect::<Result<Vec<_>>>()?;

        let merged = (self.merge)(results);
        // Safety: as above.
        unsafe { *node.result.get() = Some(merged) };
        Ok(())
    }

    fn record(&self, ctx: &TaskContext, start: Instant, chunks: usize) {
        if let Some(recorder) = self.recorder {
            recorder.record(TaskProfile {
                task: Some(ctx.id()),
                elements: 0,
                chunks,
                elapsed: start.elapsed(),
            });
        }
    }
}

unsafe fn solve_entry<P: Send, R: Send>(
    job: *const (),
    node: *const (),
    ctx: &TaskContext,
) -> anyhow::Result<()> {
    // Safety: the master keeps the job and the nodes alive until every task
    // of the scope is terminal.
    let (job, node) = unsafe {
        (
            &*job.cast::<DacJob<'_, P, R>>(),
            &*node.cast::<DacNode<P, R>>(),
        )
    };
    job.solve(node, ctx)?;
    Ok(())
}

unsafe fn merge_entry<P: Send, R: Send>(
    job: *const (),
    node: *const (),
    _: &TaskContext,
) -> anyhow::Result<()> {
    // Safety: see `solve_entry`.
    let (job, node) = unsafe {
        (
            &*job.cast::<DacJob<'_, P, R>>(),
            &*node.cast::<DacNode<P, R>>(),
        )
    };
    job.merge(node)?;
    Ok(())
}

/// Frees a subproblem tree, dropping whatever problems and results are left.
///
/// # Safety
///
/// No task may touch the nodes anymore.
unsafe fn free_nodes<P, R>(root: NonNull<DacNode<P, R>>) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        // Safety: upheld by caller.
        unsafe {
            stack.extend((*node.as_ref().children.get()).drain(..));
            slab::dealloc(node);
        }
    }
}

fn solve_serial<P, R>(
    problem: P,
    scope: &Scope,
    is_base: &dyn Fn(&P) -> bool,
    base: &dyn Fn(P) -> R,
    split: &dyn Fn(P) -> Vec<P>,
    merge: &dyn Fn(Vec<R>) -> R,
) -> Result<R> {
    if scope.caller_canceled() {
        return Err(Error::Canceled);
    }
    if is_base(&problem) {
        return Ok(base(problem));
    }

    let results = split(problem)
        .into_iter()
        .map(|part| solve_serial(part, scope, is_base, base, split, merge))
        .collect::<Result<Vec<_>>>()?;
    Ok(merge(results))
}

impl Handle {
    /// Solves `problem` by recursive decomposition.
    ///
    /// A subproblem for which `is_base` holds is solved with `base`;
    /// otherwise it is cut with `split` and the results of the parts are
    /// combined, in order, with `merge`. Only the serial mode of `tuner` and
    /// its profiling are used; chunking does not apply.
    ///
    /// ```
    /// # fn main() -> anyhow::Result<()> {
    /// let rt = hetflow::runtime::Builder::new().worker_threads(2).try_build()?;
    /// let fib = rt.handle().pdivide_and_conquer(
    ///     15u64,
    ///     &hetflow::Tuner::new(),
    ///     |n| *n < 2,
    ///     |n| n,
    ///     |n| vec![n - 1, n - 2],
    ///     |parts| parts.into_iter().sum(),
    /// )?;
    /// assert_eq!(fib, 610);
    /// # Ok(())
    /// # }
    /// ```
    pub fn pdivide_and_conquer<P, R, IB, B, S, M>(
        &self,
        problem: P,
        tuner: &Tuner,
        is_base: IB,
        base: B,
        split: S,
        merge: M,
    ) -> Result<R>
    where
        P: Send,
        R: Send,
        IB: Fn(&P) -> bool + Sync,
        B: Fn(P) -> R + Sync,
        S: Fn(P) -> Vec<P> + Sync,
        M: Fn(Vec<R>) -> R + Sync,
    {
        let scope = Scope::new();
        if tuner.mode() == Mode::Serial {
            return solve_serial(problem, &scope, &is_base, &base, &split, &merge);
        }

        let recorder = tuner.recorder();
        let job = DacJob {
            handle: self,
            scope: &scope,
            is_base: &is_base,
            base: &base,
            split: &split,
            merge: &merge,
            nodes: AtomicUsize::new(0),
            recorder: recorder.as_ref(),
        };

        let root = job.alloc(problem);
        let launched = job
            .task(root, solve_entry::<P, R>)
            .launch_in(&scope.group);
        let waited = scope.group.wait_for();

        // Safety: every task of the scope is terminal.
        let result = unsafe { (*root.as_ref().result.get()).take() };
        unsafe { free_nodes(root) };

        launched?;
        waited.map_err(driver::first_failure)?;

        let nodes = job.nodes.load(Ordering::Relaxed);
        drop(job);

        if let Some(recorder) = recorder {
            tuner.store_profile(recorder.finish("pdivide_and_conquer", 1, 0, nodes));
        }

        result.ok_or(Error::Canceled)
    }

    /// Launches [`Handle::pdivide_and_conquer`] as a task whose output is
    /// the solution.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_pdivide_and_conquer<P, R, IB, B, S, M>(
        &self,
        problem: P,
        tuner: Tuner,
        is_base: IB,
        base: B,
        split: S,
        merge: M,
    ) -> Result<Task<R>>
    where
        P: Send + 'static,
        R: Send + 'static,
        IB: Fn(&P) -> bool + Send + Sync + 'static,
        B: Fn(P) -> R + Send + Sync + 'static,
        S: Fn(P) -> Vec<P> + Send + Sync + 'static,
        M: Fn(Vec<R>) -> R + Send + Sync + 'static,
    {
        let handle = self.clone();
        let task = self.create_task(move || {
            Ok(handle.pdivide_and_conquer(problem, &tuner, is_base, base, split, merge)?)
        });
        task.launch()?;
        Ok(task)
    }
}
