use crate::context::{self, EnterGuard};
use crate::context::slab::DEFAULT_CHUNK_BLOCKS;
use crate::device::{DeviceDriver, DeviceKind, Devices};
use crate::runtime::Handle;
use crate::runtime::pool::ThreadPool;
use crate::runtime::scheduler::Scheduler;
use crate::task::Task;
use anyhow::{Result, anyhow, ensure};
use std::convert::TryFrom;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

///
/// Event Loop policies
//
/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("hetflow-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// The number of worker threads. Defaults to 1 per core.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,

    /// How many ticks before pulling a task from the global injection queue.
    global_queue_interval: u32,

    /// How many times a worker will loop over the global queue and the other
    /// workers' deques to try and find work, before parking.
    max_steal_retries: usize,

    /// Blocks carved out of each slab chunk.
    slab_chunk_blocks: usize,

    gpu: Option<Arc<dyn DeviceDriver>>,

    dsp: Option<Arc<dyn DeviceDriver>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Returns a new builder with the default configuration.
    ///
    /// Configuration methods can be chained on the return value.
    pub fn new() -> Builder {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            slab_chunk_blocks: DEFAULT_CHUNK_BLOCKS,
            gpu: None,
            dsp: None,
        }
    }

    /// The number of worker threads.
    ///
    /// Defaults to 1 worker per CPU core. The thread calling
    /// [`Runtime::block_on`] is not a worker.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets name of threads spawned by the `Runtime`'s thread pool.
    ///
    /// The default name is "hetflow-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// `Runtime`'s thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// Bodies that wait run other tasks on the same stack, so deep task
    /// graphs may need more than the platform default.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the number of scheduler ticks after which a worker looks at the
    /// global injection queue before its own deque.
    ///
    /// A tick corresponds to one task run or one wakeup. Smaller values get
    /// injected tasks started sooner at the cost of more contention on the
    /// global queue.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    /// Number of blocks each per-worker slab pool requests from the system
    /// at once.
    #[track_caller]
    pub fn slab_chunk_blocks(mut self, val: usize) -> Self {
        assert!(val > 0, "slab_chunk_blocks must be greater than 0");
        self.slab_chunk_blocks = val;
        self
    }

    /// Registers the GPU driver. GPU kernels and GPU arenas are only used
    /// when one is registered.
    pub fn gpu_device(mut self, driver: Arc<dyn DeviceDriver>) -> Self {
        self.gpu = Some(driver);
        self
    }

    pub fn dsp_device(mut self, driver: Arc<dyn DeviceDriver>) -> Self {
        self.dsp = Some(driver);
        self
    }

    /// Creates the configured `Runtime`.
    ///
    /// Worker threads are running when this returns.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg = RuntimeConfig::try_from(self)?;
        let (handle, locals) = Scheduler::new(cfg);
        let pool = ThreadPool::new(&handle, locals);

        tracing::debug!(
            runtime = handle.runtime_id(),
            workers = handle.worker_threads(),
            "runtime started"
        );

        Ok(Runtime { handle, pool })
    }
}

/// A task-graph runtime: a pool of worker threads, its queues and its
/// registered devices.
///
/// Dropping the runtime shuts it down.
#[derive(Debug)]
pub struct Runtime {
    handle: Handle,
    pool: ThreadPool,
}

impl Runtime {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Makes this runtime the current one on this thread until the guard is
    /// dropped, so that the free functions like [`crate::spawn`] can be used.
    pub fn enter(&self) -> EnterGuard {
        context::enter_runtime(self.handle.clone())
    }

    /// Runs `f` as the root task and blocks the calling thread until it
    /// returns. A panic inside `f` is resumed on the calling thread.
    #[track_caller]
    pub fn block_on<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.enter();

        let root: Task<thread::Result<R>> = self
            .handle
            .create_task(move || Ok(panic::catch_unwind(AssertUnwindSafe(f))));

        if let Err(e) = root.launch() {
            panic!("failed to launch the root task: {e}");
        }

        match root.get() {
            Ok(Ok(value)) => value,
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(e) => panic!("root task did not complete: {e}"),
        }
    }

    /// Creates and launches a task on this runtime.
    pub fn spawn<F, T>(&self, f: F) -> Task<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.handle.spawn(f)
    }

    /// Shuts the runtime down.
    ///
    /// Tasks that have not started yet are completed as canceled without
    /// running their body; running bodies finish. The calling thread blocks
    /// until every worker thread has exited. A panic on a worker thread is
    /// reported as an error.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&self) -> Result<()> {
        if context::current_worker().is_some_and(|w| w.runtime_id() == self.handle.runtime_id()) {
            return Err(anyhow!(
                "cannot shut down a runtime from one of its own worker threads"
            ));
        }

        let shared = self.handle.shared();
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        shared.unpark_all_threads();
        let res = self.pool.join_all();

        // Nothing runs anymore, cancel whatever was injected after the
        // workers left.
        let mut drained = 0;
        while let Some(task) = self.handle.injector().pop() {
            task.run();
            drained += 1;
        }

        if drained > 0 {
            tracing::warn!(
                runtime = self.handle.runtime_id(),
                tasks = drained,
                "runtime shut down with pending tasks"
            );
        }

        tracing::debug!(runtime = self.handle.runtime_id(), "runtime stopped");
        res
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            tracing::warn!(error = %e, "error during runtime shutdown");
        }
    }
}

// Export runtime builder as a RuntimeConfig object to be consumed by the
// scheduler and its workers.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) slab_chunk_blocks: usize,
    pub(crate) devices: Devices,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: 1,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            slab_chunk_blocks: DEFAULT_CHUNK_BLOCKS,
            devices: Devices::default(),
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        for kind in [DeviceKind::Gpu, DeviceKind::Dsp] {
            if let Some(driver) = self.devices.get(kind) {
                ensure!(
                    driver.kind() == kind,
                    "driver `{}` reports device kind {} but was registered as {}",
                    driver.name(),
                    driver.kind(),
                    kind
                );
            }
        }

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = RuntimeConfig {
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            global_queue_interval: builder.global_queue_interval,
            max_steal_retries: builder.max_steal_retries,
            slab_chunk_blocks: builder.slab_chunk_blocks,
            devices: Devices::new(builder.gpu, builder.dsp),
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
