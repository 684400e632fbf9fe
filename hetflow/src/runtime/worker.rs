use crate::runtime::shared::Shared;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::runtime::{Handle, RuntimeConfig};
use crate::task::RawTask;
use crossbeam_deque::{Steal, Stealer, Worker as CbWorker};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::iter;
use std::ops::ControlFlow;

/// A worker thread's view of the scheduler. Lives in the worker's
/// thread-local context, never leaves its thread.
pub(crate) struct Worker {
    index: usize,

    handle: Handle,

    /// Determines how we run the event loop.
    cfg: RefCell<EventLoopConfig>,

    /// Event loop ticker.
    ticker: RefCell<Ticker>,

    /// Whether we should try to find our next task in the global queue.
    pop_global_queue: Cell<bool>,

    /// Local deque. The owner pushes and pops at the front, thieves take
    /// from the back.
    local: CbWorker<RawTask>,

    /// Handles to all of the other workers' deques. If there are N workers we
    /// will have N-1 queues to steal from.
    stealers: Vec<Stealer<RawTask>>,
}

impl Worker {
    pub(super) fn new(
        index: usize,
        handle: Handle,
        local: CbWorker<RawTask>,
        mut stealers: Vec<Stealer<RawTask>>,
    ) -> Self {
        // Shuffle the stealers so that each worker's search order when trying to
        // steal work is different and hopefully unique to reduce contention.
        fastrand::shuffle(&mut stealers);

        Self {
            index,
            cfg: RefCell::new(handle.cfg().into()),
            handle,
            ticker: RefCell::new(Ticker::new()),
            pop_global_queue: Cell::new(false),
            local,
            stealers,
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn runtime_id(&self) -> u64 {
        self.handle.runtime_id()
    }

    pub(crate) fn push_local(&self, task: RawTask) {
        self.local.push(task);
    }

    fn tick(&self) -> TickerEvents {
        self.ticker
            .borrow_mut()
            .tick(self.handle.shared(), &mut *self.cfg.borrow_mut())
    }

    pub(crate) fn find_task(&self) -> Option<RawTask> {
        let injector = self.handle.injector();

        // Enforce scheduler fairness by force-checking the global queue with
        // frequency `global_queue_interval`.
        if self.pop_global_queue.replace(false)
            && let Some(task) = injector.pop()
        {
            return Some(task);
        }

        // 1. Our own deque, most recently pushed first while the cache is hot.
        self.local.pop().or_else(|| {
            // 2. No local work, repeatedly try the global queue and other
            //    workers' deques.
            iter::repeat_with(|| match injector.pop() {
                Some(task) => Steal::Success(task),
                None => self.steal_from_peers(),
            })
            .take(self.cfg.borrow().max_steal_retries)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    /// Tries every peer once, starting from a random one. `collect` stops at
    /// the first `Success`.
    fn steal_from_peers(&self) -> Steal<RawTask> {
        if self.stealers.is_empty() {
            return Steal::Empty;
        }

        let start = fastrand::usize(..self.stealers.len());
        let (head, tail) = self.stealers.split_at(start);
        tail.iter().chain(head).map(Stealer::steal).collect()
    }

    fn has_pending_work(&self) -> bool {
        !self.local.is_empty()
            || !self.handle.injector().is_empty()
            || self.stealers.iter().any(|s| !s.is_empty())
    }

    pub(crate) fn event_loop(&self) {
        'event_loop: loop {
            if let Some(task) = self.find_task() {
                task.run();
            } else {
                // Park the thread, and wait for new tasks to be scheduled and
                // an unpark signal from the scheduler.
                self.handle
                    .shared()
                    .park_current_thread(self.index, || self.has_pending_work());
            }

            let events = self.tick();
            if let ControlFlow::Break(()) = self.process_ticker_events(events) {
                break 'event_loop;
            }
        }

        self.shutdown();
    }

    #[inline(always)]
    fn process_ticker_events(&self, events: TickerEvents) -> ControlFlow<()> {
        if events.contains(TickerEvents::SHUTDOWN) {
            return ControlFlow::Break(());
        }

        // Enforce scheduler fairness for newly injected tasks.
        if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
            self.pop_global_queue.set(true);
        }

        ControlFlow::Continue(())
    }

    /// Runs down the local deque. The shutdown flag is set, so every task
    /// completes as canceled and its successors land back here.
    fn shutdown(&self) {
        let mut canceled = 0usize;
        while let Some(task) = self.local.pop() {
            task.run();
            canceled += 1;
        }

        if canceled > 0 {
            tracing::debug!(worker = self.index, tasks = canceled, "canceled queued tasks");
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("runtime", &self.runtime_id())
            .field("local", &self.local.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    global_queue_interval: u32,

    max_steal_retries: usize,
}

impl EventLoopConfig {
    #[inline(always)]
    fn should_pop_global_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.global_queue_interval)
    }
}

impl From<&RuntimeConfig> for EventLoopConfig {
    fn from(cfg: &RuntimeConfig) -> EventLoopConfig {
        EventLoopConfig {
            global_queue_interval: cfg.global_queue_interval,
            max_steal_retries: cfg.max_steal_retries,
        }
    }
}

impl TickerData for EventLoopConfig {
    type Context = Shared;

    #[inline(always)]
    fn update_and_check(&mut self, shared: &Self::Context, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown.
        if shared.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        let mut events = TickerEvents::empty();

        if self.should_pop_global_queue(tick) {
            events.insert(TickerEvents::POP_GLOBAL_QUEUE);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::Ordering;

    #[rstest]
    #[case::every_tick(1, &[1, 2, 3])]
    #[case::default(31, &[31, 62])]
    fn test_pop_global_queue_interval(#[case] interval: u32, #[case] ticks: &[u32]) {
        let shared = Shared::new(1);
        let mut cfg = EventLoopConfig {
            global_queue_interval: interval,
            max_steal_retries: 3,
        };
        let mut ticker = Ticker::new();

        let hits = (1..=ticks[ticks.len() - 1])
            .filter(|_| ticker.tick(&shared, &mut cfg).contains(TickerEvents::POP_GLOBAL_QUEUE))
            .count();
        assert_eq!(hits, ticks.len());
    }

    #[test]
    fn test_shutdown_event_wins() {
        let shared = Shared::new(1);
        shared.shutdown.store(true, Ordering::Release);

        let mut cfg = EventLoopConfig {
            global_queue_interval: 1,
            max_steal_retries: 3,
        };
        assert_eq!(
            Ticker::new().tick(&shared, &mut cfg),
            TickerEvents::SHUTDOWN
        );
    }
}
