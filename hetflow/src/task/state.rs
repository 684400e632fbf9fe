//! Packed task state word.
//!
//! The low bits hold the status flags, the high bits the number of
//! predecessors that have not completed yet. Every transition is a CAS loop
//! over the whole word so flags and count always change together.

use crate::error::Error;
use bitflags::bitflags;
use crossbeam_utils::Backoff;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct Status: u64 {
        const UNLAUNCHED = 1;
        const LAUNCHED = 1 << 1;
        const RUNNING = 1 << 2;
        const COMPLETED = 1 << 3;
        const CANCELED = 1 << 4;
        const FAILED = 1 << 5;

        /// Guards the successor and group lists.
        const LOCKED = 1 << 6;

        const BOUND = 1 << 7;
        const HAS_SUCCESSORS = 1 << 8;
        const CANCEL_REQUESTED = 1 << 9;

        /// Handed to the scheduler. Exactly one party sets it, which makes
        /// enqueueing a task idempotent.
        const QUEUED = 1 << 10;

        /// The body takes bound arguments.
        const NEEDS_ARGS = 1 << 11;

        /// The body returned but completion waits on `finish_after`.
        const DEFERRED = 1 << 12;

        const TERMINAL = Self::COMPLETED.bits() | Self::CANCELED.bits() | Self::FAILED.bits();
    }
}

const PRED_SHIFT: u32 = 16;
const PRED_ONE: u64 = 1 << PRED_SHIFT;
const STATUS_MASK: u64 = PRED_ONE - 1;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot(u64);

impl Snapshot {
    pub(crate) fn status(self) -> Status {
        Status::from_bits_truncate(self.0 & STATUS_MASK)
    }

    pub(crate) fn predecessors(self) -> u64 {
        self.0 >> PRED_SHIFT
    }

    pub(crate) fn is(self, flags: Status) -> bool {
        self.status().contains(flags)
    }

    pub(crate) fn is_terminal(self) -> bool {
        self.status().intersects(Status::TERMINAL)
    }

    pub(crate) fn is_launched(self) -> bool {
        self.is(Status::LAUNCHED)
    }

    fn with(self, flags: Status) -> Self {
        Self(self.0 | flags.bits())
    }

    fn without(self, flags: Status) -> Self {
        Self(self.0 & !flags.bits())
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("status", &self.status())
            .field("predecessors", &self.predecessors())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionToLaunched {
    /// Predecessors are satisfied, the caller owns the `QUEUED` token and must
    /// schedule the task.
    Ready,
    /// Waiting on predecessors.
    Waiting,
    /// Launched before, or already terminal.
    AlreadyLaunched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionToRunning {
    Success,
    /// Cancellation was requested before the body started.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelRequest {
    Requested,
    AlreadyRequested,
    Terminal,
}

pub(crate) struct State {
    val: AtomicU64,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

impl State {
    pub(crate) fn new(needs_args: bool) -> Self {
        let mut status = Status::UNLAUNCHED;
        if needs_args {
            status |= Status::NEEDS_ARGS;
        }
        Self {
            val: AtomicU64::new(status.bits()),
        }
    }

    /// State of a task created with its value already available.
    pub(crate) fn new_completed() -> Self {
        Self {
            val: AtomicU64::new((Status::LAUNCHED | Status::COMPLETED).bits()),
        }
    }

    pub(crate) fn load(&self) -> Snapshot {
        Snapshot(self.val.load(Ordering::Acquire))
    }

    /// Runs `f` in a CAS loop. `f` returns the action result and, when the
    /// state must change, the next snapshot.
    fn fetch_update_action<F, T>(&self, mut f: F) -> T
    where
        F: FnMut(Snapshot) -> (T, Option<Snapshot>),
    {
        let mut curr = self.load();

        loop {
            let (output, next) = f(curr);

            let Some(next) = next else {
                return output;
            };

            match self
                .val
                .compare_exchange(curr.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return output,
                Err(actual) => curr = Snapshot(actual),
            }
        }
    }

    pub(crate) fn lock(&self) {
        let backoff = Backoff::new();
        loop {
            let curr = self.load();
            if !curr.is(Status::LOCKED)
                && self
                    .val
                    .compare_exchange_weak(
                        curr.0,
                        curr.with(Status::LOCKED).0,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    pub(crate) fn unlock(&self) {
        let prev = self.val.fetch_and(!Status::LOCKED.bits(), Ordering::Release);
        debug_assert!(Snapshot(prev).is(Status::LOCKED));
    }

    /// Adds one predecessor. Only allowed before launch.
    pub(crate) fn add_predecessor(&self) -> Result<(), Error> {
        self.fetch_update_action(|curr| {
            if curr.is_launched() || curr.is_terminal() {
                return (
                    Err(Error::InvalidState("successor task was already launched")),
                    None,
                );
            }

            if curr.is(Status::QUEUED) {
                return (
                    Err(Error::InvalidState("successor task is being canceled")),
                    None,
                );
            }

            (Ok(()), Some(Snapshot(curr.0 + PRED_ONE)))
        })
    }

    /// Gives the `QUEUED` token back and waits on one more predecessor. Used
    /// when buffer admission orders this task after an in-flight one.
    pub(crate) fn requeue_after_predecessor(&self) {
        self.fetch_update_action(|curr| {
            debug_assert!(curr.is(Status::QUEUED));
            ((), Some(Snapshot(curr.without(Status::QUEUED).0 + PRED_ONE)))
        })
    }

    /// Returns `true` when this was the last predecessor of a launched task,
    /// in which case the caller owns the `QUEUED` token.
    pub(crate) fn predecessor_done(&self) -> bool {
        self.fetch_update_action(|curr| {
            debug_assert!(curr.predecessors() > 0, "predecessor count underflow");

            let next = Snapshot(curr.0 - PRED_ONE);
            if next.predecessors() == 0 && next.is_launched() && !next.is_terminal() {
                (true, Some(next.with(Status::QUEUED)))
            } else {
                (false, Some(next))
            }
        })
    }

    pub(crate) fn transition_to_launched(&self) -> Result<TransitionToLaunched, Error> {
        self.fetch_update_action(|curr| {
            // A queued unlaunched task was claimed by `claim_canceled`.
            if curr.is_launched() || curr.is_terminal() || curr.is(Status::QUEUED) {
                return (Ok(TransitionToLaunched::AlreadyLaunched), None);
            }

            if curr.is(Status::NEEDS_ARGS) && !curr.is(Status::BOUND) {
                return (
                    Err(Error::InvalidState("task arguments were never bound")),
                    None,
                );
            }

            let next = curr
                .without(Status::UNLAUNCHED)
                .with(Status::LAUNCHED);

            if next.predecessors() == 0 {
                (Ok(TransitionToLaunched::Ready), Some(next.with(Status::QUEUED)))
            } else {
                (Ok(TransitionToLaunched::Waiting), Some(next))
            }
        })
    }

    pub(crate) fn transition_to_bound(&self) -> Result<(), Error> {
        self.fetch_update_action(|curr| {
            if !curr.is(Status::UNLAUNCHED) {
                (Err(Error::InvalidState("task was already launched")), None)
            } else if curr.is(Status::BOUND) {
                (Err(Error::InvalidState("task arguments are already bound")), None)
            } else if !curr.is(Status::NEEDS_ARGS) {
                (Err(Error::InvalidState("task body takes no arguments")), None)
            } else {
                (Ok(()), Some(curr.with(Status::BOUND)))
            }
        })
    }

    pub(crate) fn request_cancel(&self) -> CancelRequest {
        self.fetch_update_action(|curr| {
            if curr.is_terminal() {
                (CancelRequest::Terminal, None)
            } else if curr.is(Status::CANCEL_REQUESTED) {
                (CancelRequest::AlreadyRequested, None)
            } else {
                (
                    CancelRequest::Requested,
                    Some(curr.with(Status::CANCEL_REQUESTED)),
                )
            }
        })
    }

    /// Takes the `QUEUED` token of a canceled task that was never launched
    /// and has no predecessors left. Such a task never runs; the caller
    /// completes it as canceled.
    pub(crate) fn claim_canceled(&self) -> bool {
        self.fetch_update_action(|curr| {
            let claimable = curr.is(Status::UNLAUNCHED | Status::CANCEL_REQUESTED)
                && curr.predecessors() == 0
                && !curr.is(Status::QUEUED)
                && !curr.is_terminal();

            if claimable {
                (true, Some(curr.with(Status::QUEUED)))
            } else {
                (false, None)
            }
        })
    }

    /// Consumes the `QUEUED` token.
    pub(crate) fn transition_to_running(&self) -> TransitionToRunning {
        self.fetch_update_action(|curr| {
            debug_assert!(curr.is(Status::QUEUED), "running a task that was not queued");
            debug_assert_eq!(curr.predecessors(), 0);

            let next = curr.without(Status::QUEUED);
            if curr.is(Status::CANCEL_REQUESTED) {
                (TransitionToRunning::Cancelled, Some(next))
            } else {
                (TransitionToRunning::Success, Some(next.with(Status::RUNNING)))
            }
        })
    }

    pub(crate) fn set_deferred(&self) {
        self.val.fetch_or(Status::DEFERRED.bits(), Ordering::AcqRel);
    }

    pub(crate) fn set_has_successors(&self) {
        self.val
            .fetch_or(Status::HAS_SUCCESSORS.bits(), Ordering::AcqRel);
    }

    /// Marks the task terminal with `outcome`, which must be one of the
    /// terminal flags. The caller holds the lock.
    pub(crate) fn transition_to_terminal(&self, outcome: Status) -> Snapshot {
        debug_assert!(Status::TERMINAL.contains(outcome) && outcome.bits().count_ones() == 1);

        self.fetch_update_action(|curr| {
            debug_assert!(curr.is(Status::LOCKED));
            debug_assert!(!curr.is_terminal(), "task completed twice");
            debug_assert_eq!(curr.predecessors(), 0, "terminal task with predecessors");

            let next = curr
                .without(Status::RUNNING | Status::QUEUED | Status::DEFERRED)
                .with(outcome);
            (curr, Some(next))
        })
    }
}
