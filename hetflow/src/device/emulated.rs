use crate::device::{DeviceDriver, DeviceKind, DeviceMemory, Kernel, LaunchArg};
use crate::error::DeviceError;
use bytemuck::Pod;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Kernel body run by an [`EmulatedDevice`]. Returning `Err` fails the
/// launching task with a device failure.
pub type KernelFn = Arc<dyn Fn(&mut [KernelData<'_>]) -> Result<(), String> + Send + Sync>;

/// A kernel argument as seen by an emulated kernel.
#[derive(Debug)]
pub enum KernelData<'a> {
    Buffer(&'a mut [u8]),
    ReadOnly(&'a [u8]),
    Scalar(&'a [u8]),
}

impl KernelData<'_> {
    pub fn slice<T: Pod>(&self) -> Result<&[T], String> {
        match self {
            KernelData::Buffer(bytes) => {
                bytemuck::try_cast_slice::<u8, T>(bytes).map_err(|e| e.to_string())
            }
            KernelData::ReadOnly(bytes) => {
                bytemuck::try_cast_slice::<u8, T>(bytes).map_err(|e| e.to_string())
            }
            KernelData::Scalar(_) => Err("expected a buffer argument, got a scalar".into()),
        }
    }

    pub fn slice_mut<T: Pod>(&mut self) -> Result<&mut [T], String> {
        match self {
            KernelData::Buffer(bytes) => {
                bytemuck::try_cast_slice_mut::<u8, T>(bytes).map_err(|e| e.to_string())
            }
            KernelData::ReadOnly(_) => Err("buffer argument is read-only".into()),
            KernelData::Scalar(_) => Err("expected a buffer argument, got a scalar".into()),
        }
    }

    pub fn scalar<T: Pod>(&self) -> Result<T, String> {
        match self {
            KernelData::Scalar(bytes) => {
                bytemuck::try_pod_read_unaligned::<T>(bytes).map_err(|e| e.to_string())
            }
            KernelData::Buffer(_) | KernelData::ReadOnly(_) => {
                Err("expected a scalar argument, got a buffer".into())
            }
        }
    }
}

/// Word-backed so that casts to any `Pod` with alignment up to 8 succeed.
#[derive(Debug)]
struct Block {
    words: Vec<u64>,
    bytes: usize,
}

impl Block {
    fn zeroed(bytes: usize) -> Self {
        Self {
            words: vec![0; bytes.div_ceil(8)],
            bytes,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.bytes]
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.bytes]
    }
}

/// Transfer and launch counters, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmulatedStats {
    pub allocs: usize,
    pub bytes_to_device: usize,
    pub bytes_to_host: usize,
    pub launches: usize,
}

/// An in-process device: "device memory" lives in this process and kernels
/// are Rust closures registered by entry point name.
pub struct EmulatedDevice {
    kind: DeviceKind,
    name: String,
    shares_host_memory: bool,
    memory_limit: Option<usize>,

    next_handle: AtomicU64,
    memory: DashMap<u64, Arc<Mutex<Block>>>,
    kernels: DashMap<String, KernelFn>,

    used: AtomicUsize,
    allocs: AtomicUsize,
    bytes_to_device: AtomicUsize,
    bytes_to_host: AtomicUsize,
    launches: AtomicUsize,
}

impl fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatedDevice")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("shares_host_memory", &self.shares_host_memory)
            .field("live_allocations", &self.memory.len())
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

impl EmulatedDevice {
    pub fn new(kind: DeviceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            shares_host_memory: false,
            memory_limit: None,
            next_handle: AtomicU64::new(1),
            memory: DashMap::new(),
            kernels: DashMap::new(),
            used: AtomicUsize::new(0),
            allocs: AtomicUsize::new(0),
            bytes_to_device: AtomicUsize::new(0),
            bytes_to_host: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
        }
    }

    /// Makes the device address host memory directly (SVM / ION style).
    pub fn with_shared_memory(mut self, shared: bool) -> Self {
        self.shares_host_memory = shared;
        self
    }

    /// Caps the total bytes of live allocations.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn register_kernel<F>(&self, entry: &str, f: F)
    where
        F: Fn(&mut [KernelData<'_>]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.kernels.insert(entry.to_string(), Arc::new(f));
    }

    pub fn stats(&self) -> EmulatedStats {
        EmulatedStats {
            allocs: self.allocs.load(Ordering::Relaxed),
            bytes_to_device: self.bytes_to_device.load(Ordering::Relaxed),
            bytes_to_host: self.bytes_to_host.load(Ordering::Relaxed),
            launches: self.launches.load(Ordering::Relaxed),
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.memory.len()
    }

    fn block(&self, mem: &DeviceMemory) -> Result<Arc<Mutex<Block>>, DeviceError> {
        self.memory
            .get(&mem.handle)
            .map(|b| Arc::clone(&b))
            .ok_or_else(|| DeviceError::InvalidMemory {
                device: self.name.clone(),
                handle: mem.handle,
            })
    }
}

impl DeviceDriver for EmulatedDevice {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn shares_host_memory(&self) -> bool {
        self.shares_host_memory
    }

    fn alloc(&self, bytes: usize) -> Result<DeviceMemory, DeviceError> {
        let used = self.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if self.memory_limit.is_some_and(|limit| used > limit) {
            self.used.fetch_sub(bytes, Ordering::AcqRel);
            return Err(DeviceError::OutOfMemory {
                device: self.name.clone(),
                bytes,
            });
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.memory
            .insert(handle, Arc::new(Mutex::new(Block::zeroed(bytes))));
        self.allocs.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(device = %self.name, handle, bytes, "device alloc");
        Ok(DeviceMemory { handle, bytes })
    }

    fn free(&self, mem: DeviceMemory) {
        if self.memory.remove(&mem.handle).is_some() {
            self.used.fetch_sub(mem.bytes, Ordering::AcqRel);
        }
    }

    fn copy_to_device(&self, mem: &DeviceMemory, src: &[u8]) -> Result<(), DeviceError> {
        let block = self.block(mem)?;
        let mut block = block.lock();
        if src.len() != block.bytes {
            return Err(DeviceError::Transfer {
                device: self.name.clone(),
                bytes: src.len(),
            });
        }

        block.as_bytes_mut().copy_from_slice(src);
        self.bytes_to_device.fetch_add(src.len(), Ordering::Relaxed);
        Ok(())
    }

    fn copy_to_host(&self, mem: &DeviceMemory, dst: &mut [u8]) -> Result<(), DeviceError> {
        let block = self.block(mem)?;
        let block = block.lock();
        if dst.len() != block.bytes {
            return Err(DeviceError::Transfer {
                device: self.name.clone(),
                bytes: dst.len(),
            });
        }

        dst.copy_from_slice(block.as_bytes());
        self.bytes_to_host.fetch_add(dst.len(), Ordering::Relaxed);
        Ok(())
    }

    fn launch(&self, kernel: &Kernel, args: &mut [LaunchArg<'_>]) -> Result<(), DeviceError> {
        let f = self
            .kernels
            .get(kernel.entry())
            .map(|f| Arc::clone(&f))
            .ok_or_else(|| DeviceError::UnknownKernel {
                device: self.name.clone(),
                entry: kernel.entry().to_string(),
            })?;

        // Each allocation is locked once, so the same handle twice would
        // deadlock.
        let mut seen = HashSet::new();
        let mut blocks = Vec::new();
        for arg in args.iter() {
            if let LaunchArg::Memory(mem) = arg {
                if !seen.insert(mem.handle) {
                    return Err(DeviceError::InvalidMemory {
                        device: self.name.clone(),
                        handle: mem.handle,
                    });
                }
                blocks.push(self.block(mem)?);
            }
        }

        let mut guards = blocks.iter().map(|b| b.lock()).collect::<Vec<_>>();
        let mut guards = guards.iter_mut();

        let mut data = Vec::with_capacity(args.len());
        for arg in args.iter_mut() {
            data.push(match arg {
                LaunchArg::Memory(_) => match guards.next() {
                    Some(guard) => KernelData::Buffer(guard.as_bytes_mut()),
                    None => unreachable!("one guard per memory argument"),
                },
                LaunchArg::Host(bytes) => KernelData::Buffer(&mut bytes[..]),
                LaunchArg::HostRead(bytes) => KernelData::ReadOnly(*bytes),
                LaunchArg::Scalar(bytes) => KernelData::Scalar(*bytes),
            });
        }

        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(device = %self.name, entry = kernel.entry(), args = data.len(), "kernel launch");

        f(&mut data).map_err(|reason| DeviceError::KernelFailed {
            device: self.name.clone(),
            entry: kernel.entry().to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{KernelSource, create_gpu_kernel};
    use anyhow::Result;
    use static_assertions::assert_impl_all;

    assert_impl_all!(EmulatedDevice: Send, Sync);

    fn device() -> EmulatedDevice {
        let dev = EmulatedDevice::new(DeviceKind::Gpu, "emu-gpu");
        dev.register_kernel("scale", |args| {
            let [buf, factor] = args else {
                return Err(format!("expected 2 arguments, got {}", args.len()));
            };
            let factor = factor.scalar::<f32>()?;
            for x in buf.slice_mut::<f32>()? {
                *x *= factor;
            }
            Ok(())
        });
        dev
    }

    #[test]
    fn test_round_trip_and_launch() -> Result<()> {
        let dev = device();
        let mem = dev.alloc(16)?;

        let input = [1.0f32, 2.0, 3.0, 4.0];
        dev.copy_to_device(&mem, bytemuck::cast_slice(&input))?;

        let factor = 2.0f32.to_ne_bytes();
        let kernel = create_gpu_kernel(KernelSource::Builtin, "scale");
        dev.launch(
            &kernel,
            &mut [LaunchArg::Memory(mem), LaunchArg::Scalar(&factor)],
        )?;

        let mut out = [0f32; 4];
        dev.copy_to_host(&mem, bytemuck::cast_slice_mut(&mut out))?;
        assert_eq!(out, [2.0, 4.0, 6.0, 8.0]);

        assert_eq!(
            dev.stats(),
            EmulatedStats {
                allocs: 1,
                bytes_to_device: 16,
                bytes_to_host: 16,
                launches: 1,
            }
        );

        dev.free(mem);
        assert_eq!(dev.live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn test_host_argument() -> Result<()> {
        let dev = device();
        let mut host = [3.0f32; 2];
        let factor = 3.0f32.to_ne_bytes();
        let kernel = create_gpu_kernel(KernelSource::Builtin, "scale");

        dev.launch(
            &kernel,
            &mut [
                LaunchArg::Host(bytemuck::cast_slice_mut(&mut host)),
                LaunchArg::Scalar(&factor),
            ],
        )?;

        assert_eq!(host, [9.0, 9.0]);
        Ok(())
    }

    #[test]
    fn test_errors() -> Result<()> {
        let dev = device().with_memory_limit(8);
        assert!(matches!(dev.alloc(16), Err(DeviceError::OutOfMemory { .. })));

        let mem = dev.alloc(8)?;
        let unknown = create_gpu_kernel(KernelSource::Builtin, "nope");
        assert!(matches!(
            dev.launch(&unknown, &mut []),
            Err(DeviceError::UnknownKernel { .. })
        ));

        let kernel = create_gpu_kernel(KernelSource::Builtin, "scale");
        assert!(matches!(
            dev.launch(&kernel, &mut [LaunchArg::Memory(mem), LaunchArg::Memory(mem)]),
            Err(DeviceError::InvalidMemory { .. })
        ));

        // Scalar missing: the kernel body itself reports the failure.
        assert!(matches!(
            dev.launch(&kernel, &mut [LaunchArg::Memory(mem)]),
            Err(DeviceError::KernelFailed { .. })
        ));
        Ok(())
    }
}
