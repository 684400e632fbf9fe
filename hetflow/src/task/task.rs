use crate::buffer::{self, Access, Buffer, BufferAccess};
use crate::device::{DeviceKind, Kernel};
use crate::error::{Error, Misuse, Result};
use crate::runtime::Handle;
use crate::task::body::{Body, CpuFn, KernelArg, KernelLaunch, Output};
use crate::task::group::Group;
use crate::task::raw::{Outcome, RawTask};
use crate::task::state::Status;
use crate::task::{Id, TaskContext};
use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;
use std::mem;

/// Handle to a task whose body produces a `T`.
///
/// Handles are cheap to clone. The task stays alive while any handle, queue
/// or dependency edge refers to it.
pub struct Task<T = ()> {
    raw: RawTask,
    _p: PhantomData<fn() -> T>,
}

/// Observable lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Unlaunched,
    /// Launched, waiting for predecessors or for a worker.
    Launched,
    Running,
    Completed,
    Canceled,
    Failed,
}

impl<T> Task<T> {
    pub(crate) fn from_raw(raw: RawTask) -> Self {
        Self {
            raw,
            _p: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> &RawTask {
        &self.raw
    }

    pub fn id(&self) -> Id {
        self.raw.id()
    }

    pub fn status(&self) -> TaskStatus {
        let status = self.raw.state().load().status();

        if status.contains(Status::COMPLETED) {
            TaskStatus::Completed
        } else if status.contains(Status::CANCELED) {
            TaskStatus::Canceled
        } else if status.contains(Status::FAILED) {
            TaskStatus::Failed
        } else if status.intersects(Status::RUNNING | Status::DEFERRED) {
            TaskStatus::Running
        } else if status.contains(Status::LAUNCHED) {
            TaskStatus::Launched
        } else {
            TaskStatus::Unlaunched
        }
    }

    pub fn is_finished(&self) -> bool {
        self.raw.is_terminal()
    }

    /// Launches the task: it runs once all its predecessors are done.
    /// Launching again is a no-op.
    pub fn launch(&self) -> Result<()> {
        self.raw.launch(None)
    }

    /// Launches the task as a member of `group`. A launched task can join
    /// more groups by being launched into them.
    pub fn launch_in(&self, group: &Group) -> Result<()> {
        self.raw.launch(Some(group))
    }

    /// Makes `succ` wait for this task. `succ` must not be launched yet.
    pub fn then<U>(&self, succ: &Task<U>) -> Result<()> {
        self.raw.add_successor(&succ.raw)
    }

    /// Makes this task wait for `pred`. This task must not be launched yet.
    pub fn after<U>(&self, pred: &Task<U>) -> Result<()> {
        pred.raw.add_successor(&self.raw)
    }

    /// Requests cancellation. A task that has not started never runs its
    /// body; a running body observes it through `abort_on_cancel`.
    pub fn cancel(&self) {
        self.raw.cancel();
    }

    /// Waits until the task is terminal and returns its failure, if any.
    pub fn wait_for(&self) -> Result<()> {
        self.raw.wait();
        self.raw.result()
    }

    /// Stores the arguments of a task created with
    /// [`Handle::create_task_with_args`]. Allowed once, before launch.
    pub fn bind_all<A: Send + 'static>(&self, args: A) -> Result<()> {
        self.raw.bind_args(Box::new(args))
    }
}

impl<T: 'static> Task<T> {
    /// Waits for the task and moves its output out. Only the first call
    /// gets the value.
    pub fn get(&self) -> Result<T> {
        self.raw.wait();
        self.take_output()
    }

    /// Non-blocking [`Task::get`]: `None` while the task is not terminal.
    pub fn try_take(&self) -> Option<Result<T>> {
        self.raw.is_terminal().then(|| self.take_output())
    }

    fn take_output(&self) -> Result<T> {
        self.raw.with_outcome(|outcome| match mem::replace(outcome, Outcome::Taken) {
            Outcome::Value(value) => match value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(value) => {
                    *outcome = Outcome::Value(value);
                    Err(Misuse::OutputType.into())
                }
            },
            Outcome::Failed(err) => {
                *outcome = Outcome::Failed(err.clone());
                Err(err)
            }
            Outcome::Canceled => {
                *outcome = Outcome::Canceled;
                Err(Error::Canceled)
            }
            Outcome::Taken | Outcome::Pending => Err(Misuse::OutputTaken.into()),
        })
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self::from_raw(self.raw.clone())
    }
}

impl<T> PartialEq for Task<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Task<T> {}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

pub(crate) fn cpu_body<F, T>(f: F) -> CpuFn
where
    F: FnOnce(&TaskContext) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Box::new(move |ctx, _args| f(ctx).map(|v| Box::new(v) as Output))
}

/// Builds a task with declared buffer accesses and, optionally, one body per
/// device. When several bodies are given the task runs exactly one of them,
/// chosen at dispatch time.
pub struct TaskBuilder {
    handle: Handle,
    accesses: Vec<BufferAccess>,
    cpu: Option<CpuFn>,
    kernels: Vec<(Kernel, Vec<KernelArg>)>,
}

impl TaskBuilder {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle,
            accesses: Vec::new(),
            cpu: None,
            kernels: Vec::new(),
        }
    }

    pub fn access<T: Pod + Send + Sync>(mut self, buffer: &Buffer<T>, access: Access) -> Self {
        self.accesses.push(BufferAccess::new(buffer, access));
        self
    }

    pub fn reads<T: Pod + Send + Sync>(self, buffer: &Buffer<T>) -> Self {
        self.access(buffer, Access::Read)
    }

    pub fn writes<T: Pod + Send + Sync>(self, buffer: &Buffer<T>) -> Self {
        self.access(buffer, Access::WriteInvalidate)
    }

    pub fn read_writes<T: Pod + Send + Sync>(self, buffer: &Buffer<T>) -> Self {
        self.access(buffer, Access::ReadWrite)
    }

    /// CPU body. It runs with every declared buffer held; views acquired
    /// inside borrow those acquisitions.
    pub fn cpu<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&TaskContext) -> anyhow::Result<()> + Send + 'static,
    {
        self.cpu = Some(cpu_body(f));
        self
    }

    /// GPU alternative. Buffer arguments are added to the task's accesses.
    #[track_caller]
    pub fn gpu(self, kernel: &Kernel, args: Vec<KernelArg>) -> Self {
        assert_eq!(kernel.device(), DeviceKind::Gpu, "gpu() needs a GPU kernel");
        self.kernel(kernel, args)
    }

    #[track_caller]
    pub fn dsp(self, kernel: &Kernel, args: Vec<KernelArg>) -> Self {
        assert_eq!(kernel.device(), DeviceKind::Dsp, "dsp() needs a DSP kernel");
        self.kernel(kernel, args)
    }

    pub(crate) fn kernel(mut self, kernel: &Kernel, args: Vec<KernelArg>) -> Self {
        self.kernels.push((kernel.clone(), args));
        self
    }

    /// Creates the (unlaunched) task. Device alternatives for devices the
    /// runtime does not have are dropped; if nothing is left, fails with
    /// `Misuse::NoDevice`.
    pub fn build(self) -> Result<Task<()>> {
        let mut accesses = self.accesses;
        let mut alternatives = Vec::new();
        let mut missing = None;

        if let Some(cpu) = self.cpu {
            alternatives.push(Body::Cpu(cpu));
        }

        for (kernel, args) in self.kernels {
            let launch = KernelLaunch::new(kernel, args)?;
            accesses.extend(launch.accesses().cloned());

            let device = launch.kernel.device();
            if self.handle.devices().has(device) {
                alternatives.push(Body::Device(Box::new(launch)));
            } else {
                missing.get_or_insert(device);
            }
        }

        let body = match (alternatives.len(), missing) {
            (0, Some(device)) => return Err(Misuse::NoDevice(device).into()),
            (0, None) => Body::Empty,
            (1, _) => alternatives.remove(0),
            _ => {
                alternatives.sort_by_key(Body::device);
                Body::Poly(alternatives)
            }
        };

        let raw = RawTask::new(&self.handle, body, false, buffer::normalize(accesses));
        Ok(Task::from_raw(raw))
    }
}

impl fmt::Debug for TaskBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("accesses", &self.accesses.len())
            .field("cpu", &self.cpu.is_some())
            .field("kernels", &self.kernels.len())
            .finish()
    }
}
