use crate::buffer::ArenaKind;
use crate::buffer::conflict::{self, Admission};
use crate::context::{self, slab::SlabPool};
use crate::device::{DeviceKind, Devices};
use crate::queue::SegQueue;
use crate::runtime::RuntimeConfig;
use crate::runtime::shared::Shared;
use crate::task::RawTask;
use crossbeam_deque::Worker as CbWorker;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64, Ordering};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Scheduler {
    id: u64,

    /// Runtime configuration, read by the workers.
    pub(crate) cfg: RuntimeConfig,

    /// The global injection queue, fed by threads that are not workers of
    /// this runtime.
    pub(crate) injector: SegQueue<RawTask>,

    /// Shared context between workers.
    pub(crate) shared: Shared,

    /// One slab pool per worker, indexed like the workers.
    pools: Box<[SlabPool]>,

    /// Stamps tasks admitted past buffer conflict detection.
    dispatch_seq: AtomicU64,

    /// Held while a dependency edge is checked for cycles and inserted.
    edges: Mutex<()>,
}

impl Scheduler {
    /// Creates the scheduler and the local deques of its future workers.
    pub(crate) fn new(cfg: RuntimeConfig) -> (Handle, Vec<CbWorker<RawTask>>) {
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        let num_workers = cfg.worker_threads;

        let pools = (0..num_workers)
            .map(|i| SlabPool::new(id, i, cfg.slab_chunk_blocks))
            .collect();

        let locals = (0..num_workers).map(|_| CbWorker::new_lifo()).collect();

        let scheduler = Scheduler {
            id,
            cfg,
            injector: SegQueue::new(),
            shared: Shared::new(num_workers),
            pools,
            dispatch_seq: AtomicU64::new(0),
            edges: Mutex::new(()),
        };

        (
            Handle {
                inner: Arc::new(scheduler),
            },
            locals,
        )
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("workers", &self.cfg.worker_threads)
            .field("injector", &self.injector)
            .field("shutdown", &self.shared.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Handle to a runtime.
///
/// Tasks, buffers and patterns are created through a handle. Handles are
/// cheap to clone and keep the runtime's scheduler alive, but do not keep
/// its worker threads running: those stop when the [`Runtime`] is shut down.
///
/// [`Runtime`]: crate::runtime::Runtime
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Scheduler>,
}

impl Handle {
    /// Returns the handle of the runtime the current thread runs in.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime worker, a task body or a
    /// [`Runtime::enter`](crate::runtime::Runtime::enter) scope.
    #[track_caller]
    pub fn current() -> Handle {
        context::current_handle()
    }

    pub fn try_current() -> Option<Handle> {
        context::try_current_handle()
    }

    pub fn runtime_id(&self) -> u64 {
        self.inner.id
    }

    pub fn worker_threads(&self) -> usize {
        self.inner.cfg.worker_threads
    }

    pub fn has_device(&self, kind: DeviceKind) -> bool {
        self.inner.cfg.devices.has(kind)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shared.is_shutdown()
    }

    pub(crate) fn cfg(&self) -> &RuntimeConfig {
        &self.inner.cfg
    }

    pub(crate) fn devices(&self) -> &Devices {
        &self.inner.cfg.devices
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    pub(crate) fn injector(&self) -> &SegQueue<RawTask> {
        &self.inner.injector
    }

    pub(crate) fn pool(&self, index: usize) -> &SlabPool {
        &self.inner.pools[index]
    }

    /// Serialises dependency edge insertion, so that two concurrent edges
    /// cannot close a cycle the other's check missed.
    pub(crate) fn lock_edges(&self) -> MutexGuard<'_, ()> {
        self.inner.edges.lock()
    }

    /// The arena a task running on `device` uses.
    pub(crate) fn arena_for(&self, device: DeviceKind) -> ArenaKind {
        let shares_host = self
            .devices()
            .get(device)
            .is_some_and(|d| d.shares_host_memory());
        ArenaKind::for_device(device, shares_host)
    }

    /// Queues a ready task. The caller hands over the task's `QUEUED` token.
    ///
    /// A task whose buffers conflict with an in-flight task is not queued:
    /// it is scheduled again when that task completes.
    pub(crate) fn schedule(&self, task: RawTask) {
        if !task.accesses().is_empty()
            && conflict::admit(&task, &self.inner.dispatch_seq) == Admission::Deferred
        {
            return;
        }

        match context::current_worker() {
            Some(worker) if worker.runtime_id() == self.runtime_id() => {
                worker.push_local(task);
            }
            _ => {
                self.inner.injector.push(task);
            }
        }

        // Pairs with the check a worker makes under the parked list before it
        // goes to sleep.
        atomic::fence(Ordering::SeqCst);
        if self.inner.shared.num_parked() > 0 {
            self.inner.shared.unpark_one_thread();
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Scheduler: Send, Sync);
    assert_impl_all!(Handle: Send, Sync, Clone);

    #[test]
    fn test_runtime_ids_are_unique() {
        let (a, _) = Scheduler::new(RuntimeConfig::default());
        let (b, _) = Scheduler::new(RuntimeConfig::default());

        assert_ne!(a.runtime_id(), b.runtime_id());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_cpu_arena_is_host() {
        let (handle, _) = Scheduler::new(RuntimeConfig::default());
        assert_eq!(handle.arena_for(DeviceKind::Cpu), ArenaKind::Host);
        assert!(!handle.has_device(DeviceKind::Gpu));
    }
}
