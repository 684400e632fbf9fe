//! Device collaborators.
//!
//! The runtime never talks to a GPU or DSP directly. It goes through a
//! [`DeviceDriver`], which knows how to allocate device memory, move bytes
//! between host and device, and run a kernel to completion.

use crate::error::DeviceError;
use std::fmt;
use std::sync::Arc;

mod emulated;
pub use emulated::{EmulatedDevice, EmulatedStats, KernelData, KernelFn};

/// Execution device of a task. The derived order is the dispatch tie-break
/// for poly-kernel tasks: CPU first, then GPU, then DSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Dsp,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Dsp => "dsp",
        })
    }
}

/// Opaque device allocation returned by [`DeviceDriver::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemory {
    pub handle: u64,
    pub bytes: usize,
}

/// Program text or binary a kernel is built from. The runtime only carries
/// it to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    Text(String),
    Binary(Vec<u8>),
    /// The driver resolves the entry point by name only.
    Builtin,
}

/// A kernel bound to a device kind and an entry point.
#[derive(Debug, Clone)]
pub struct Kernel {
    device: DeviceKind,
    entry: Arc<str>,
    source: Arc<KernelSource>,
}

impl Kernel {
    pub(crate) fn new(device: DeviceKind, source: KernelSource, entry: &str) -> Self {
        Self {
            device,
            entry: Arc::from(entry),
            source: Arc::new(source),
        }
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn source(&self) -> &KernelSource {
        &self.source
    }
}

/// Creates a GPU kernel handle. Building the program is left to the driver
/// at launch time.
pub fn create_gpu_kernel(source: KernelSource, entry: &str) -> Kernel {
    Kernel::new(DeviceKind::Gpu, source, entry)
}

pub fn create_dsp_kernel(source: KernelSource, entry: &str) -> Kernel {
    Kernel::new(DeviceKind::Dsp, source, entry)
}

/// One argument of a kernel launch, as seen by the driver.
#[derive(Debug)]
pub enum LaunchArg<'a> {
    /// A buffer whose arena lives in device memory.
    Memory(DeviceMemory),
    /// A buffer whose arena aliases host memory (SVM, ION).
    Host(&'a mut [u8]),
    /// Same as `Host`, for arguments the kernel only reads.
    HostRead(&'a [u8]),
    Scalar(&'a [u8]),
}

/// Contract between the runtime and a device.
///
/// All calls are synchronous. `alloc` must return zero-filled memory.
pub trait DeviceDriver: Send + Sync + fmt::Debug {
    fn kind(&self) -> DeviceKind;

    fn name(&self) -> &str;

    /// Whether the device addresses host memory directly, in which case its
    /// arenas alias the host arena and no copies are made.
    fn shares_host_memory(&self) -> bool;

    fn alloc(&self, bytes: usize) -> Result<DeviceMemory, DeviceError>;

    fn free(&self, mem: DeviceMemory);

    fn copy_to_device(&self, mem: &DeviceMemory, src: &[u8]) -> Result<(), DeviceError>;

    fn copy_to_host(&self, mem: &DeviceMemory, dst: &mut [u8]) -> Result<(), DeviceError>;

    /// Runs `kernel` with `args` and waits for it to finish.
    fn launch(&self, kernel: &Kernel, args: &mut [LaunchArg<'_>]) -> Result<(), DeviceError>;
}

/// Drivers registered on a runtime.
#[derive(Debug, Clone, Default)]
pub(crate) struct Devices {
    gpu: Option<Arc<dyn DeviceDriver>>,
    dsp: Option<Arc<dyn DeviceDriver>>,
}

impl Devices {
    pub(crate) fn new(
        gpu: Option<Arc<dyn DeviceDriver>>,
        dsp: Option<Arc<dyn DeviceDriver>>,
    ) -> Self {
        Self { gpu, dsp }
    }

    pub(crate) fn get(&self, kind: DeviceKind) -> Option<&Arc<dyn DeviceDriver>> {
        match kind {
            DeviceKind::Cpu => None,
            DeviceKind::Gpu => self.gpu.as_ref(),
            DeviceKind::Dsp => self.dsp.as_ref(),
        }
    }

    pub(crate) fn has(&self, kind: DeviceKind) -> bool {
        kind == DeviceKind::Cpu || self.get(kind).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Kernel: Send, Sync, Clone);
    assert_impl_all!(Devices: Send, Sync);

    #[test]
    fn test_device_order_is_dispatch_tie_break() {
        let mut kinds = vec![DeviceKind::Dsp, DeviceKind::Cpu, DeviceKind::Gpu];
        kinds.sort();
        assert_eq!(kinds, vec![DeviceKind::Cpu, DeviceKind::Gpu, DeviceKind::Dsp]);
    }

    #[test]
    fn test_devices_lookup() {
        let gpu: Arc<dyn DeviceDriver> = Arc::new(EmulatedDevice::new(DeviceKind::Gpu, "gpu0"));
        let devices = Devices::new(Some(gpu), None);

        assert!(devices.has(DeviceKind::Cpu));
        assert!(devices.has(DeviceKind::Gpu));
        assert!(!devices.has(DeviceKind::Dsp));
        assert_eq!(devices.get(DeviceKind::Gpu).map(|d| d.name()), Some("gpu0"));
    }
}
