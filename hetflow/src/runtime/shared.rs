use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

/// State shared by all the workers of a runtime.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) shutdown: AtomicBool,

    /// LIFO collection of parked workers. We unpark in LIFO order as the
    /// latest parked thread is the one where the CPU cache is the hottest.
    parked_threads: RwLock<VecDeque<(usize, Thread)>>,

    /// One flag per worker, set by whoever unparks it. Guards against
    /// spurious wakeups.
    should_unpark: Box<[CachePadded<AtomicBool>]>,
}

impl Shared {
    pub(crate) fn new(num_workers: usize) -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            parked_threads: RwLock::new(VecDeque::with_capacity(num_workers)),
            should_unpark: (0..num_workers)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Parks worker `index` until another thread unparks it. `has_work` is
    /// checked while holding the parked list, so work published before an
    /// unpark attempt is never missed.
    pub(crate) fn park_current_thread<F>(&self, index: usize, has_work: F)
    where
        F: FnOnce() -> bool,
    {
        let should_unpark = &self.should_unpark[index];
        {
            let mut parked_threads = self.parked_threads.write();

            if has_work() || self.is_shutdown() {
                return;
            }

            should_unpark.store(false, Ordering::Release);
            parked_threads.push_back((index, thread::current()));
        }

        // Loop to account for spurious wakeups, as per docs.
        while !should_unpark.load(Ordering::Acquire) {
            thread::park();
        }
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.parked_threads.read().len()
    }

    pub(crate) fn unpark_one_thread(&self) -> bool {
        if let Some((index, thread)) = self.parked_threads.write().pop_back() {
            self.should_unpark[index].store(true, Ordering::Release);
            thread.unpark();
            true
        } else {
            false
        }
    }

    pub(crate) fn unpark_all_threads(&self) -> usize {
        let mut num_unparked = 0;
        let mut parked_threads = self.parked_threads.write();

        while let Some((index, thread)) = parked_threads.pop_back() {
            num_unparked += 1;
            self.should_unpark[index].store(true, Ordering::Release);
            thread.unpark();
        }

        num_unparked
    }
}
