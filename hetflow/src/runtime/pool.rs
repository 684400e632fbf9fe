use crate::context;
use crate::runtime::{Handle, Worker};
use crate::task::RawTask;
use anyhow::{Result, anyhow};
use crossbeam_deque::Worker as CbWorker;
use parking_lot::Mutex;
use std::rc::Rc;
use std::sync::{Arc, Barrier};
use std::thread;

/// The worker threads of a runtime.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns one thread per local deque and returns once all of them are
    /// running.
    pub(super) fn new(handle: &Handle, locals: Vec<CbWorker<RawTask>>) -> Self {
        let num_workers = locals.len();
        let stealers = locals.iter().map(CbWorker::stealer).collect::<Vec<_>>();

        let barrier = Arc::new(Barrier::new(num_workers + 1));
        let handles = locals
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                // Exclude this worker's stealer. Stealers are cheap to clone,
                // the inner value is behind an Arc.
                let other_stealers = stealers
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != index)
                    .map(|(_, s)| s.clone())
                    .collect::<Vec<_>>();

                spawn_worker_thread(
                    handle.clone(),
                    index,
                    local,
                    other_stealers,
                    Arc::clone(&barrier),
                )
            })
            .collect();

        // Spawning threads is async, wait for all threads to be started...
        barrier.wait();

        Self {
            handles: Mutex::new(handles),
        }
    }

    pub(super) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let errors = handles
            .drain(..)
            .filter_map(|handle| {
                let name = handle.thread().name().map(str::to_owned);
                handle.join().err().map(|_| name)
            })
            .inspect(|name| tracing::warn!(thread = ?name, "worker thread panicked"))
            .count();

        if errors == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} thread(s) panicked", errors))
        }
    }
}

fn spawn_worker_thread(
    handle: Handle,
    index: usize,
    local: CbWorker<RawTask>,
    stealers: Vec<crossbeam_deque::Stealer<RawTask>>,
    barrier: Arc<Barrier>,
) -> thread::JoinHandle<()> {
    let mut builder = thread::Builder::new();

    if let Some(stack_size) = handle.cfg().thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .name(handle.cfg().thread_name.0())
        .spawn(move || {
            // Declared first so the pool outlives every guard below.
            let pools = handle.clone();
            let _pool = pools.pool(index).enter();

            let worker = Rc::new(Worker::new(index, handle, local, stealers));
            let _ctx = context::enter_worker(Rc::clone(&worker));
            barrier.wait();

            tracing::debug!(worker = index, runtime = worker.runtime_id(), "worker started");
            worker.event_loop();
            tracing::debug!(worker = index, runtime = worker.runtime_id(), "worker stopped");
        })
        .expect("failed to spawn worker thread")
}
