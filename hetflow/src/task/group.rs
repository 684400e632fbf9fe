use crate::error::{AggregateError, Error, Result};
use crate::task::body::Output;
use crate::task::raw::{Completion, RawTask};
use crate::task::wait;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A set of launched tasks that can be waited on and canceled together.
///
/// Membership starts when a task is launched into the group and ends when
/// the task is terminal. Failures of members are collected and reported by
/// [`Group::wait_for`].
#[derive(Clone)]
pub struct Group {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    members: AtomicUsize,
    canceled: AtomicBool,

    /// Set for the meet of two groups; joining the meet joins both.
    parents: Option<(Group, Group)>,

    /// Meets with higher-id groups, keyed by their id.
    meets: Mutex<HashMap<u64, Weak<Inner>>>,

    waiters: Mutex<Waiters>,
    cond: Condvar,
}

#[derive(Default)]
struct Waiters {
    errors: Vec<Error>,

    /// Tasks whose completion waits for this group to drain, with the value
    /// their body returned.
    continuations: Vec<(RawTask, Output)>,
}

impl Group {
    pub fn new() -> Self {
        Self::with_parents(None)
    }

    fn with_parents(parents: Option<(Group, Group)>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        Group {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                members: AtomicUsize::new(0),
                canceled: AtomicBool::new(false),
                parents,
                meets: Mutex::new(HashMap::new()),
                waiters: Mutex::new(Waiters::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Returns the group of tasks that belong to both `a` and `b`. The same
    /// object is returned for `(a, b)` and `(b, a)` while it is alive.
    pub fn intersect(a: &Group, b: &Group) -> Group {
        if a.ptr_eq(b) {
            return a.clone();
        }

        let (lo, hi) = if a.id() < b.id() { (a, b) } else { (b, a) };

        let mut meets = lo.inner.meets.lock();
        if let Some(inner) = meets.get(&hi.id()).and_then(Weak::upgrade) {
            return Group { inner };
        }

        let meet = Group::with_parents(Some((lo.clone(), hi.clone())));
        meets.retain(|_, m| m.strong_count() > 0);
        meets.insert(hi.id(), Arc::downgrade(&meet.inner));
        meet
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &Group) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of members that are not terminal yet.
    pub fn len(&self) -> usize {
        self.inner.members.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the group canceled. Members that have not started yet complete
    /// as canceled when they are picked up; running members observe it
    /// through `abort_on_cancel`. The flag is never cleared.
    pub fn cancel(&self) {
        if !self.inner.canceled.swap(true, Ordering::AcqRel) {
            tracing::trace!(group = self.id(), members = self.len(), "group canceled");
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
            || self
                .inner
                .parents
                .as_ref()
                .is_some_and(|(a, b)| a.is_canceled() || b.is_canceled())
    }

    /// Waits until every member is terminal. Returns `Error::Aggregate` with
    /// all member failures if any member failed, otherwise `Error::Canceled`
    /// if the group was canceled.
    ///
    /// On a worker thread the caller keeps running other tasks while it
    /// waits.
    pub fn wait_for(&self) -> Result<()> {
        if !wait::help_until(|| self.is_empty()) {
            let mut waiters = self.inner.waiters.lock();
            while !self.is_empty() {
                self.inner.cond.wait(&mut waiters);
            }
        }

        self.result()
    }

    fn result(&self) -> Result<()> {
        match self.failure() {
            Some(err) => Err(err),
            None if self.is_canceled() => Err(Error::Canceled),
            None => Ok(()),
        }
    }

    fn failure(&self) -> Option<Error> {
        let waiters = self.inner.waiters.lock();
        (!waiters.errors.is_empty())
            .then(|| Error::Aggregate(AggregateError::new(waiters.errors.clone())))
    }

    pub(crate) fn join(&self) {
        self.inner.members.fetch_add(1, Ordering::AcqRel);
        if let Some((a, b)) = &self.inner.parents {
            a.join();
            b.join();
        }
    }

    /// A member reached a terminal state; `error` is its failure.
    pub(crate) fn member_done(&self, error: Option<&Error>) {
        if let Some(err) = error {
            self.inner.waiters.lock().errors.push(err.clone());
        }

        if let Some((a, b)) = &self.inner.parents {
            a.member_done(error);
            b.member_done(error);
        }

        let prev = self.inner.members.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "group member count underflow");
        if prev == 1 {
            self.drained();
        }
    }

    fn drained(&self) {
        let continuations = {
            let mut waiters = self.inner.waiters.lock();
            self.inner.cond.notify_all();
            if self.is_empty() {
                mem::take(&mut waiters.continuations)
            } else {
                Vec::new()
            }
        };

        for (task, value) in continuations {
            self.finish(task, value);
        }
    }

    fn finish(&self, task: RawTask, value: Output) {
        let completion = match self.result() {
            Ok(()) => Completion::Value(value),
            Err(err) => Completion::from_error(err),
        };
        task.complete(completion);
    }

    /// Completes `task` with `value` once the group drains.
    pub(crate) fn push_continuation(&self, task: RawTask, value: Output) {
        let mut waiters = self.inner.waiters.lock();
        if self.is_empty() {
            drop(waiters);
            self.finish(task, value);
        } else {
            waiters.continuations.push((task, value));
        }
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id())
            .field("members", &self.len())
            .field("canceled", &self.is_canceled())
            .field("is_meet", &self.inner.parents.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Group: Send, Sync, Clone);

    #[test]
    fn test_intersect_is_commutative_and_cached() {
        let a = Group::new();
        let b = Group::new();

        let ab = Group::intersect(&a, &b);
        let ba = Group::intersect(&b, &a);
        assert!(ab.ptr_eq(&ba));
        assert!(Group::intersect(&a, &a).ptr_eq(&a));

        let c = Group::new();
        assert!(!Group::intersect(&a, &c).ptr_eq(&ab));
    }

    #[test]
    fn test_meet_membership_counts_toward_parents() {
        let a = Group::new();
        let b = Group::new();
        let meet = Group::intersect(&a, &b);

        meet.join();
        assert_eq!((a.len(), b.len(), meet.len()), (1, 1, 1));

        meet.member_done(Some(&Error::AllocFail { bytes: 1 }));
        assert!(a.is_empty() && b.is_empty() && meet.is_empty());

        let Err(Error::Aggregate(agg)) = a.wait_for() else {
            panic!("expected an aggregate error");
        };
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_cancel_is_monotonic_and_inherited_by_meets() {
        let a = Group::new();
        let b = Group::new();
        let meet = Group::intersect(&a, &b);

        assert!(!meet.is_canceled());
        a.cancel();
        a.cancel();
        assert!(a.is_canceled());
        assert!(meet.is_canceled());
        assert!(!b.is_canceled());
    }

    #[test]
    fn test_wait_on_empty_group() -> anyhow::Result<()> {
        Group::new().wait_for()?;
        Ok(())
    }

    #[test]
    fn test_wait_on_canceled_group() {
        let group = Group::new();
        group.join();
        group.cancel();
        group.member_done(None);
        assert!(group.wait_for().unwrap_err().is_canceled());

        // Failures are reported ahead of the cancellation.
        group.join();
        group.member_done(Some(&Error::AllocFail { bytes: 8 }));
        assert!(matches!(group.wait_for(), Err(Error::Aggregate(_))));
    }
}
