//! Buffers shared between tasks and devices.
//!
//! A buffer is one logical array with up to one copy ("arena") per memory
//! kind. At most one arena is authoritative; the others are either stale or
//! coherent copies of it. Arenas are created lazily and brought up to date
//! when a task or a host view needs them.

use crate::device::{DeviceKind, LaunchArg};
use crate::error::Error;
use crate::runtime::Handle;
use crate::task::Id;
use bitflags::bitflags;
use bytemuck::Pod;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

mod acquire;
pub(crate) use acquire::AcquireSet;

#[allow(clippy::module_inception)]
mod buffer;
pub use buffer::{Buffer, HostRead, HostWrite};

pub(crate) mod conflict;
pub(crate) use conflict::InFlight;

#[cfg(test)]
mod tests;

/// How a task or a host view uses a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    /// Overwrites the whole buffer without reading it; the previous contents
    /// are not copied into the arena.
    WriteInvalidate,
    ReadWrite,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::WriteInvalidate | Access::ReadWrite)
    }

    pub(crate) fn conflicts(self, other: Access) -> bool {
        self.writes() || other.writes()
    }

    /// Access needed to cover both `self` and `other`.
    pub(crate) fn merge(self, other: Access) -> Access {
        match (self, other) {
            (a, b) if a == b => a,
            _ => Access::ReadWrite,
        }
    }
}

/// Memory kinds a buffer can have an arena in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaKind {
    Host,
    /// GPU memory reached through explicit copies.
    GpuCl,
    /// GPU shared virtual memory; aliases the host arena.
    GpuClSvm,
    /// DSP ION memory. Aliases the host arena when the DSP shares host
    /// memory or the buffer lives in a named region.
    DspIon,
}

impl ArenaKind {
    pub(crate) const ALL: [ArenaKind; 4] = [
        ArenaKind::Host,
        ArenaKind::GpuCl,
        ArenaKind::GpuClSvm,
        ArenaKind::DspIon,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn flag(self) -> ArenaSet {
        match self {
            ArenaKind::Host => ArenaSet::HOST,
            ArenaKind::GpuCl => ArenaSet::GPU_CL,
            ArenaKind::GpuClSvm => ArenaSet::GPU_CL_SVM,
            ArenaKind::DspIon => ArenaSet::DSP_ION,
        }
    }

    pub fn device(self) -> DeviceKind {
        match self {
            ArenaKind::Host => DeviceKind::Cpu,
            ArenaKind::GpuCl | ArenaKind::GpuClSvm => DeviceKind::Gpu,
            ArenaKind::DspIon => DeviceKind::Dsp,
        }
    }

    /// Arena a task on `device` works in.
    pub(crate) fn for_device(device: DeviceKind, shares_host_memory: bool) -> ArenaKind {
        match device {
            DeviceKind::Cpu => ArenaKind::Host,
            DeviceKind::Gpu if shares_host_memory => ArenaKind::GpuClSvm,
            DeviceKind::Gpu => ArenaKind::GpuCl,
            DeviceKind::Dsp => ArenaKind::DspIon,
        }
    }
}

bitflags! {
    /// A set of arenas, used to report which arenas hold valid data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArenaSet: u8 {
        const HOST = 1;
        const GPU_CL = 1 << 1;
        const GPU_CL_SVM = 1 << 2;
        const DSP_ION = 1 << 3;
    }
}

/// A named memory region shared by the host and the DSP. Buffers placed in
/// a region have their host and DSP arenas alias each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    name: Arc<str>,
}

impl MemoryRegion {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Process-unique buffer id. Multi-buffer acquisitions lock in id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

impl BufferId {
    pub(crate) fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Type-erased buffer operations used by tasks, acquire sets and kernel
/// launches.
pub(crate) trait RawBuffer: Send + Sync + fmt::Debug {
    fn id(&self) -> BufferId;

    /// Non-blocking acquisition on behalf of `task`. When one of
    /// `ancestors` (nearest first) holds the buffer, the acquisition borrows
    /// from it. Fails if that holder cannot grant `access`.
    fn try_acquire(&self, task: Id, ancestors: &[Id], access: Access) -> Result<bool, Error>;

    /// Ends an acquisition made by `try_acquire`. Blocks while views or
    /// nested tasks borrowing from it are still alive.
    fn release(&self, task: Id, access: Access);

    /// Makes the `kind` arena usable for `access`. The caller holds an
    /// acquisition.
    fn prepare(&self, kind: ArenaKind, access: Access) -> Result<(), Error>;

    /// Whether a task working in `kind` would not need any copy: `kind` holds
    /// the authoritative data, or the buffer has no data yet.
    fn is_current_in(&self, kind: ArenaKind) -> bool;

    /// # Safety
    ///
    /// The caller holds an acquisition for `access`, `prepare(kind, access)`
    /// succeeded, and no other launch argument aliases this buffer mutably.
    unsafe fn launch_arg(&self, kind: ArenaKind, access: Access) -> LaunchArg<'_>;

    fn inflight(&self) -> &InFlight;
}

pub(crate) type AnyBuffer = Arc<dyn RawBuffer>;

/// A buffer together with the access a task declared for it.
#[derive(Clone, Debug)]
pub(crate) struct BufferAccess {
    pub(crate) buffer: AnyBuffer,
    pub(crate) access: Access,
}

impl BufferAccess {
    pub(crate) fn new<T: Pod + Send + Sync>(buffer: &Buffer<T>, access: Access) -> Self {
        Self {
            buffer: buffer.erase(),
            access,
        }
    }

    pub(crate) fn id(&self) -> BufferId {
        self.buffer.id()
    }
}

pub(crate) type Accesses = SmallVec<[BufferAccess; 2]>;

/// Sorts by buffer id and merges repeated buffers into one access.
pub(crate) fn normalize(mut accesses: Vec<BufferAccess>) -> Accesses {
    accesses.sort_by_key(BufferAccess::id);

    let mut out = Accesses::with_capacity(accesses.len());
    for a in accesses {
        match out.last_mut() {
            Some(last) if last.id() == a.id() => last.access = last.access.merge(a.access),
            _ => out.push(a),
        }
    }
    out
}

impl Handle {
    /// Creates an unbound buffer of `len` elements. Its storage is allocated
    /// and zeroed the first time an arena is needed.
    pub fn create_buffer<T: Pod + Send + Sync>(&self, len: usize) -> Buffer<T> {
        Buffer::new(len, self.devices().clone())
    }

    /// Creates a buffer bound to `data`, whose host arena is authoritative.
    pub fn create_buffer_from<T: Pod + Send + Sync>(&self, data: Vec<T>) -> Buffer<T> {
        let buffer = Buffer::new(data.len(), self.devices().clone());
        buffer
            .bind_host(data)
            .expect("a new buffer is always unbound");
        buffer
    }

    /// Creates a buffer placed in `region`: its host and DSP arenas alias.
    pub fn create_buffer_in_region<T: Pod + Send + Sync>(
        &self,
        len: usize,
        region: &MemoryRegion,
    ) -> Buffer<T> {
        let buffer = Buffer::new(len, self.devices().clone());
        buffer
            .bind_region(region)
            .expect("a new buffer is always unbound");
        buffer
    }
}
