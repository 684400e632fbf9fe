//! Task lifecycle: launch, dependency edges, dispatch and completion.

use crate::buffer::{AcquireSet, ArenaKind, conflict};
use crate::context;
use crate::error::{Error, Misuse, Result};
use crate::task::body::{Args, Body, CpuFn, KernelLaunch, Output};
use crate::task::context::{Deferral, TaskContext};
use crate::task::group::Group;
use crate::task::raw::{Completion, Edge, EdgeKind, Outcome, RawTask};
use crate::task::state::{CancelRequest, Status, TransitionToLaunched, TransitionToRunning};
use crate::task::wait;
use crate::utils::panic_message;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::mem;
use std::panic::{self, AssertUnwindSafe};

impl RawTask {
    /// Hands the task to the scheduler once its predecessors are done.
    /// Joins `group` unless already a member; re-launching only does that.
    pub(crate) fn launch(&self, group: Option<&Group>) -> Result<()> {
        if self.handle().is_shutdown() {
            return Err(Misuse::RuntimeShutdown.into());
        }

        context::with_frame(|frame| {
            if let Some(ctx) = frame {
                self.set_parent(ctx.raw());
            }
        });

        let transition = {
            let mut links = self.lock_links();
            if self.state().load().is_terminal() {
                return Ok(());
            }

            let transition = self.state().transition_to_launched()?;

            if let Some(group) = group
                && !links.groups.iter().any(|g| g.ptr_eq(group))
            {
                group.join();
                links.groups.push(group.clone());
            }
            transition
        };

        tracing::trace!(task = %self.id(), ?transition, "task launched");
        if transition == TransitionToLaunched::Ready {
            self.handle().schedule(self.clone());
        }
        Ok(())
    }

    pub(crate) fn bind_args(&self, args: Args) -> Result<()> {
        let links = self.lock_links();
        self.state().transition_to_bound()?;
        self.set_args(&links, args);
        Ok(())
    }

    /// Adds the edge `self -> succ`.
    pub(crate) fn add_successor(&self, succ: &RawTask) -> Result<()> {
        if self == succ {
            return Err(Error::InvalidState("a task cannot depend on itself"));
        }

        let _edges = self.handle().lock_edges();

        if succ.state().load().is_launched() {
            return Err(Error::InvalidState("successor task was already launched"));
        }

        if succ.reaches(self) {
            return Err(Error::InvalidState("dependency would form a cycle"));
        }

        let mut links = self.lock_links();
        let snapshot = self.state().load();

        if snapshot.is_terminal() {
            drop(links);
            // Nothing to wait for; a failed or canceled predecessor still
            // cancels its successor.
            if !snapshot.is(Status::COMPLETED) {
                succ.cancel();
            }
            return Ok(());
        }

        succ.state().add_predecessor()?;
        links.successors.push(Edge {
            task: succ.clone(),
            kind: EdgeKind::Control,
        });
        self.state().set_has_successors();
        Ok(())
    }

    /// Orders `succ`, which holds its `QUEUED` token, after this task.
    /// Returns `false` if this task is already terminal.
    pub(crate) fn add_order_successor(&self, succ: &RawTask) -> bool {
        let mut links = self.lock_links();
        if self.state().load().is_terminal() {
            return false;
        }

        succ.state().requeue_after_predecessor();
        links.successors.push(Edge {
            task: succ.clone(),
            kind: EdgeKind::Order,
        });
        self.state().set_has_successors();
        true
    }

    /// Whether `target` can be reached from this task through recorded
    /// successor edges.
    fn reaches(&self, target: &RawTask) -> bool {
        let mut stack = vec![self.clone()];
        let mut seen = HashSet::new();

        while let Some(task) = stack.pop() {
            if &task == target {
                return true;
            }

            if !seen.insert(task.id()) || !task.state().load().is(Status::HAS_SUCCESSORS) {
                continue;
            }

            stack.extend(task.lock_links().successors.iter().map(|e| e.task.clone()));
        }

        false
    }

    /// Requests cancellation. A task that never started running will not
    /// run: it completes as canceled once it has no predecessors left, and
    /// its successors are marked canceled right away.
    pub(crate) fn cancel(&self) {
        if self.state().request_cancel() != CancelRequest::Requested {
            return;
        }
        tracing::trace!(task = %self.id(), "cancel requested");

        if self.state().claim_canceled() {
            return self.clone().complete(Completion::Canceled);
        }

        if self.state().load().is(Status::RUNNING) {
            return;
        }

        let successors: SmallVec<[RawTask; 2]> = self
            .lock_links()
            .successors
            .iter()
            .filter(|e| e.kind == EdgeKind::Control)
            .map(|e| e.task.clone())
            .collect();

        for succ in successors {
            succ.cancel();
        }
    }

    /// Blocks (or helps, on a worker) until the task is terminal.
    pub(crate) fn wait(&self) {
        if self.is_terminal() {
            return;
        }

        if !wait::help_until(|| self.is_terminal()) {
            self.wait_blocking();
        }
    }

    /// The failure the task ended with, if any. The task must be terminal.
    pub(crate) fn result(&self) -> Result<()> {
        self.with_outcome(|outcome| match outcome {
            Outcome::Failed(err) => Err(err.clone()),
            Outcome::Canceled => Err(Error::Canceled),
            _ => Ok(()),
        })
    }

    fn predecessor_done(&self) {
        if self.state().predecessor_done() {
            self.handle().schedule(self.clone());
        } else if self.state().claim_canceled() {
            tracing::trace!(task = %self.id(), "unlaunched task canceled");
            self.clone().complete(Completion::Canceled);
        }
    }

    /// Runs the task. The caller hands over the `QUEUED` token.
    pub(crate) fn run(self) {
        if self.state().transition_to_running() == TransitionToRunning::Cancelled {
            return self.complete(Completion::Canceled);
        }

        if self.handle().is_shutdown() || self.in_canceled_group() {
            return self.complete(Completion::Canceled);
        }

        // Safety: the `QUEUED` token was consumed by this call.
        let Some(core) = (unsafe { self.take_core() }) else {
            debug_assert!(false, "task {} ran twice", self.id());
            return;
        };

        let body = match core.body {
            Body::Poly(alternatives) => self.select(alternatives),
            body => body,
        };

        tracing::trace!(task = %self.id(), ?body, "task running");
        match body {
            Body::Empty => self.complete(Completion::Value(Box::new(()))),
            Body::Cpu(f) => self.run_cpu(f, core.args),
            Body::Device(launch) => self.run_device(&launch),
            Body::Poly(_) => unreachable!("alternatives are resolved before dispatch"),
        }
    }

    /// Picks the alternative whose arenas already hold the task's data,
    /// preferring CPU, then GPU, then DSP. Without such an alternative the
    /// first one in that order runs.
    fn select(&self, mut alternatives: Vec<Body>) -> Body {
        let handle = self.handle();
        alternatives.retain(|b| b.device().is_some_and(|d| handle.devices().has(d)));
        alternatives.sort_by_key(Body::device);

        let pos = alternatives
            .iter()
            .position(|body| {
                body.device().is_some_and(|device| {
                    let kind = handle.arena_for(device);
                    self.accesses().iter().all(|a| a.buffer.is_current_in(kind))
                })
            })
            .unwrap_or(0);

        if alternatives.is_empty() {
            Body::Empty
        } else {
            alternatives.swap_remove(pos)
        }
    }

    fn run_cpu(self, f: CpuFn, args: Option<Args>) {
        let set = match AcquireSet::acquire(&self, ArenaKind::Host) {
            Ok(set) => set,
            Err(err) => return self.complete(Completion::from_error(err)),
        };

        let ctx = TaskContext::new(self.clone());
        let res = {
            let _frame = context::enter_frame(&ctx);
            panic::catch_unwind(AssertUnwindSafe(|| f(&ctx, args)))
        };
        drop(set);

        let deferral = ctx.take_deferral();
        drop(ctx);

        match res {
            Ok(Ok(value)) => match deferral {
                Some(deferral) => self.defer(deferral, value),
                None => self.complete(Completion::Value(value)),
            },
            Ok(Err(err)) => {
                let err = Error::from_body(self.id(), err);
                self.complete(Completion::from_error(err));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::debug!(task = %self.id(), %message, "task body panicked");
                let task = self.id();
                self.complete(Completion::Failed(Error::Panicked { task, message }));
            }
        }
    }

    fn run_device(self, launch: &KernelLaunch) {
        let device = launch.kernel.device();
        let Some(driver) = self.handle().devices().get(device).cloned() else {
            let err = Misuse::NoDevice(device).into();
            return self.complete(Completion::Failed(err));
        };

        let kind = self.handle().arena_for(device);
        let set = match AcquireSet::acquire(&self, kind) {
            Ok(set) => set,
            Err(err) => return self.complete(Completion::from_error(err)),
        };

        let res = panic::catch_unwind(AssertUnwindSafe(|| launch.launch(driver.as_ref(), kind)));
        drop(set);

        let completion = match res {
            Ok(Ok(())) => Completion::Value(Box::new(())),
            Ok(Err(err)) => Completion::from_error(err),
            Err(payload) => Completion::Failed(Error::Panicked {
                task: self.id(),
                message: panic_message(payload.as_ref()),
            }),
        };
        self.complete(completion);
    }

    fn defer(self, deferral: Deferral, value: Output) {
        self.state().set_deferred();
        tracing::trace!(task = %self.id(), "task completion deferred");

        match deferral {
            Deferral::Group(group) => group.push_continuation(self, value),
            Deferral::Task(awaited) => awaited.push_finish_edge(self),
        }
    }

    fn push_finish_edge(&self, deferred: RawTask) {
        {
            let mut links = self.lock_links();
            if !self.state().load().is_terminal() {
                links.successors.push(Edge {
                    task: deferred,
                    kind: EdgeKind::Finish,
                });
                self.state().set_has_successors();
                return;
            }
        }

        deferred.finish_from(self);
    }

    /// Completes a deferred task with the outcome of `awaited`, moving its
    /// output.
    fn finish_from(self, awaited: &RawTask) {
        let completion = awaited.with_outcome(|outcome| match mem::replace(outcome, Outcome::Taken) {
            Outcome::Value(value) => Completion::Value(value),
            Outcome::Failed(err) => {
                *outcome = Outcome::Failed(err.clone());
                Completion::Failed(err)
            }
            Outcome::Canceled => {
                *outcome = Outcome::Canceled;
                Completion::Canceled
            }
            Outcome::Taken | Outcome::Pending => {
                Completion::Failed(Misuse::OutputTaken.into())
            }
        });
        self.complete(completion);
    }

    /// Makes the task terminal and notifies successors, in insertion order,
    /// then groups.
    pub(crate) fn complete(self, completion: Completion) {
        let status = completion.status();
        let error = match &completion {
            Completion::Failed(err) => Some(err.clone()),
            _ => None,
        };

        self.store_outcome(completion);
        conflict::retire(&self);

        let (successors, groups) = {
            let mut links = self.lock_links();
            self.state().transition_to_terminal(status);
            (
                mem::take(&mut links.successors),
                mem::take(&mut links.groups),
            )
        };

        self.notify_waiters();
        tracing::trace!(task = %self.id(), ?status, "task complete");

        let propagate_cancel = status != Status::COMPLETED;
        for edge in successors {
            match edge.kind {
                EdgeKind::Control => {
                    if propagate_cancel {
                        edge.task.cancel();
                    }
                    edge.task.predecessor_done();
                }
                EdgeKind::Order => edge.task.predecessor_done(),
                EdgeKind::Finish => edge.task.finish_from(&self),
            }
        }

        for group in groups {
            group.member_done(error.as_ref());
        }
    }
}
