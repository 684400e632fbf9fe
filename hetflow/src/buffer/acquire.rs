use crate::buffer::{Accesses, ArenaKind};
use crate::error::Result;
use crate::task::{Id, RawTask};
use crate::utils::ScopeGuard;
use crossbeam_utils::Backoff;
use smallvec::SmallVec;
use std::cell::Cell;
use std::thread;

/// All the buffers of one task, held for the duration of its body.
///
/// Acquisition never blocks while holding part of the set: buffers are tried
/// in id order and, on the first refusal, everything taken so far is
/// released in reverse before backing off. Two tasks therefore cannot hold
/// each other's buffers while waiting.
///
/// A buffer already held by an enclosing task is borrowed from that task's
/// acquisition instead.
pub(crate) struct AcquireSet {
    accesses: Accesses,
    task: Id,
}

impl AcquireSet {
    pub(crate) fn acquire(task: &RawTask, kind: ArenaKind) -> Result<Self> {
        let accesses = task.accesses().clone();
        debug_assert!(accesses.windows(2).all(|w| w[0].id() < w[1].id()));

        let id = task.id();
        let ancestors: SmallVec<[Id; 4]> = task.ancestors().map(RawTask::id).collect();

        let backoff = Backoff::new();
        let mut attempts = 0usize;
        while !Self::try_acquire_all(&accesses, id, &ancestors)? {
            attempts += 1;
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }

        if attempts > 0 {
            tracing::trace!(task = %id, attempts, "acquire set contended");
        }

        let set = AcquireSet { accesses, task: id };
        for a in &set.accesses {
            a.buffer.prepare(kind, a.access)?;
        }
        Ok(set)
    }

    fn try_acquire_all(accesses: &Accesses, task: Id, ancestors: &[Id]) -> Result<bool> {
        let held = Cell::new(0);
        let mut rollback = ScopeGuard::new(|| {
            for a in accesses[..held.get()].iter().rev() {
                a.buffer.release(task, a.access);
            }
        });

        for a in accesses {
            if !a.buffer.try_acquire(task, ancestors, a.access)? {
                return Ok(false);
            }
            held.set(held.get() + 1);
        }

        rollback.disarm();
        Ok(true)
    }
}

impl Drop for AcquireSet {
    fn drop(&mut self) {
        for a in self.accesses.iter().rev() {
            a.buffer.release(self.task, a.access);
        }
    }
}
