use crate::buffer::{Access, ArenaKind, Buffer, BufferAccess};
use crate::device::{DeviceDriver, DeviceKind, Kernel, LaunchArg};
use crate::error::{Error, Result};
use crate::task::TaskContext;
use bytemuck::Pod;
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;

pub(crate) type Output = Box<dyn Any + Send>;
pub(crate) type Args = Box<dyn Any + Send>;

pub(crate) type CpuFn = Box<dyn FnOnce(&TaskContext, Option<Args>) -> anyhow::Result<Output> + Send>;

/// What a task runs.
pub(crate) enum Body {
    /// Join task: completes as soon as it is picked up.
    Empty,
    Cpu(CpuFn),
    Device(Box<KernelLaunch>),
    /// One alternative per device; dispatch runs exactly one of them.
    Poly(Vec<Body>),
}

impl Body {
    /// Device of a single-device body.
    pub(crate) fn device(&self) -> Option<DeviceKind> {
        match self {
            Body::Empty | Body::Cpu(_) => Some(DeviceKind::Cpu),
            Body::Device(launch) => Some(launch.kernel.device()),
            Body::Poly(_) => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Cpu(_) => f.write_str("Cpu"),
            Body::Device(launch) => f.debug_tuple("Device").field(&launch.kernel).finish(),
            Body::Poly(alts) => f.debug_tuple("Poly").field(alts).finish(),
        }
    }
}

/// Argument of a device kernel.
#[derive(Debug, Clone)]
pub struct KernelArg {
    repr: ArgRepr,
}

#[derive(Debug, Clone)]
enum ArgRepr {
    Buffer(BufferAccess),
    Scalar(Vec<u8>),
}

impl KernelArg {
    pub fn buffer<T: Pod + Send + Sync>(buffer: &Buffer<T>, access: Access) -> Self {
        Self {
            repr: ArgRepr::Buffer(BufferAccess::new(buffer, access)),
        }
    }

    pub fn scalar<T: Pod>(value: T) -> Self {
        Self {
            repr: ArgRepr::Scalar(bytemuck::bytes_of(&value).to_vec()),
        }
    }

    fn as_buffer(&self) -> Option<&BufferAccess> {
        match &self.repr {
            ArgRepr::Buffer(b) => Some(b),
            ArgRepr::Scalar(_) => None,
        }
    }
}

pub(crate) struct KernelLaunch {
    pub(crate) kernel: Kernel,
    args: Vec<KernelArg>,
}

impl KernelLaunch {
    pub(crate) fn new(kernel: Kernel, args: Vec<KernelArg>) -> Result<Self> {
        let mut buffers = args.iter().filter_map(KernelArg::as_buffer).collect::<Vec<_>>();
        buffers.sort_by_key(|b| b.id());

        // Launch arguments may share a buffer only if none of them writes it.
        if buffers
            .windows(2)
            .any(|w| w[0].id() == w[1].id() && (w[0].access.writes() || w[1].access.writes()))
        {
            return Err(Error::InvalidState(
                "a buffer written by a kernel must appear once in its arguments",
            ));
        }

        Ok(Self { kernel, args })
    }

    pub(crate) fn accesses(&self) -> impl Iterator<Item = &BufferAccess> {
        self.args.iter().filter_map(KernelArg::as_buffer)
    }

    /// Runs the kernel on `driver` with its buffers in the `kind` arena. The
    /// task's acquire set must be held and prepared for `kind`.
    pub(crate) fn launch(&self, driver: &dyn DeviceDriver, kind: ArenaKind) -> Result<()> {
        let mut args = self
            .args
            .iter()
            .map(|arg| match &arg.repr {
                // Safety: the acquire set covers every buffer argument with at
                // least this access, and a written buffer appears only once.
                ArgRepr::Buffer(b) => unsafe { b.buffer.launch_arg(kind, b.access) },
                ArgRepr::Scalar(bytes) => LaunchArg::Scalar(bytes),
            })
            .collect::<SmallVec<[LaunchArg<'_>; 8]>>();

        driver.launch(&self.kernel, &mut args)?;
        Ok(())
    }
}
