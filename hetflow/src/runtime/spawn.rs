use crate::buffer::Accesses;
use crate::device::Kernel;
use crate::error::{Misuse, Result};
use crate::runtime::Handle;
use crate::task::{
    Args, Body, CpuFn, KernelArg, Output, RawTask, Task, TaskBuilder, TaskContext, cpu_body,
};

impl Handle {
    /// Creates an unlaunched CPU task running `f`.
    pub fn create_task<F, T>(&self, f: F) -> Task<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.create_task_with_context(move |_| f())
    }

    /// Like [`Handle::create_task`], with access to the running task's
    /// [`TaskContext`] (cancellation, deferred completion).
    pub fn create_task_with_context<F, T>(&self, f: F) -> Task<T>
    where
        F: FnOnce(&TaskContext) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let raw = RawTask::new(self, Body::Cpu(cpu_body(f)), false, Accesses::new());
        Task::from_raw(raw)
    }

    /// Creates a task whose arguments are bound later with
    /// [`Task::bind_all`]. Launching it before that fails.
    pub fn create_task_with_args<A, F, T>(&self, f: F) -> Task<T>
    where
        A: Send + 'static,
        F: FnOnce(&TaskContext, A) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let body: CpuFn = Box::new(move |ctx, args: Option<Args>| {
            let args = args
                .ok_or(Misuse::ArgsType)?
                .downcast::<A>()
                .map_err(|_| Misuse::ArgsType)?;
            f(ctx, *args).map(|v| Box::new(v) as Output)
        });

        let raw = RawTask::new(self, Body::Cpu(body), true, Accesses::new());
        Task::from_raw(raw)
    }

    /// Creates a task with no body. It completes as soon as all its
    /// predecessors are done, which makes it a join point.
    pub fn create_join_task(&self) -> Task<()> {
        Task::from_raw(RawTask::new(self, Body::Empty, false, Accesses::new()))
    }

    /// Creates a task that is already completed with `value`.
    pub fn create_value_task<T: Send + 'static>(&self, value: T) -> Task<T> {
        Task::from_raw(RawTask::new_completed(self, Box::new(value)))
    }

    /// Creates a task running a single device kernel. Its buffer arguments
    /// are its declared accesses.
    pub fn create_device_task(&self, kernel: &Kernel, args: Vec<KernelArg>) -> Result<Task<()>> {
        self.task_builder().kernel(kernel, args).build()
    }

    pub fn task_builder(&self) -> TaskBuilder {
        TaskBuilder::new(self.clone())
    }

    /// Creates and launches a CPU task.
    ///
    /// # Panics
    ///
    /// Panics if the runtime is shut down.
    #[track_caller]
    pub fn spawn<F, T>(&self, f: F) -> Task<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.create_task(f);
        if let Err(e) = task.launch() {
            panic!("failed to spawn task: {e}");
        }
        task
    }
}
