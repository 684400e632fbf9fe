//! Buffer conflict tracking.
//!
//! Every buffer keeps the list of tasks that were admitted with it and have
//! not completed yet. A ready task whose accesses conflict with one of them
//! is ordered after it instead of being queued.

use crate::task::RawTask;
use crate::buffer::Access;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
struct Entry {
    task: RawTask,
    access: Access,
    seq: u64,
}

#[derive(Debug, Default)]
pub(crate) struct InFlight {
    entries: Mutex<SmallVec<[Entry; 4]>>,
}

impl InFlight {
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The task may be queued.
    Admitted,
    /// The task now waits on an in-flight task and will be scheduled again
    /// when that one completes.
    Deferred,
}

/// Admits `task` or orders it after the latest conflicting in-flight task.
/// Tasks enclosing `task` never block it: it borrows their buffers.
///
/// The caller holds the task's `QUEUED` token.
pub(crate) fn admit(task: &RawTask, dispatch_seq: &AtomicU64) -> Admission {
    let accesses = task.accesses();

    loop {
        // Buffers are sorted by id, so concurrent admissions lock in the same
        // order.
        let mut lists: SmallVec<[MutexGuard<'_, SmallVec<[Entry; 4]>>; 4]> = accesses
            .iter()
            .map(|a| a.buffer.inflight().entries.lock())
            .collect();

        let blocker = accesses
            .iter()
            .zip(lists.iter())
            .flat_map(|(a, list)| {
                list.iter().filter(move |e| {
                    e.task != *task && e.access.conflicts(a.access) && !task.has_ancestor(&e.task)
                })
            })
            .max_by_key(|e| e.seq)
            .map(|e| e.task.clone());

        let Some(blocker) = blocker else {
            let seq = dispatch_seq.fetch_add(1, Ordering::Relaxed);
            for (a, list) in accesses.iter().zip(lists.iter_mut()) {
                list.push(Entry {
                    task: task.clone(),
                    access: a.access,
                    seq,
                });
            }
            tracing::trace!(task = %task.id(), seq, "task admitted");
            return Admission::Admitted;
        };

        drop(lists);

        if blocker.add_order_successor(task) {
            tracing::trace!(task = %task.id(), blocker = %blocker.id(), "task ordered after conflicting task");
            return Admission::Deferred;
        }
        // The blocker completed in between; its entries are gone or about to be.
    }
}

/// Removes the in-flight entries of a completed task.
pub(crate) fn retire(task: &RawTask) {
    for a in task.accesses() {
        a.buffer.inflight().entries.lock().retain(|e| e.task != *task);
    }
}
