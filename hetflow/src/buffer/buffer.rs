use crate::buffer::{Access, AnyBuffer, ArenaKind, ArenaSet, BufferId, InFlight, MemoryRegion, RawBuffer};
use crate::context;
use crate::device::{DeviceDriver, DeviceKind, DeviceMemory, Devices, LaunchArg};
use crate::error::{DeviceError, Error, Misuse, Result};
use crate::task::{Id, wait};
use bytemuck::Pod;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Handle to a logical array of `T` shared by tasks and devices.
///
/// Cloning the handle is cheap; all clones refer to the same storage.
pub struct Buffer<T: Pod + Send + Sync> {
    inner: Arc<Inner<T>>,
}

impl<T: Pod + Send + Sync> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Pod + Send + Sync> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

struct Inner<T> {
    id: BufferId,
    len: usize,
    devices: Devices,

    state: Mutex<State>,
    cond: Condvar,

    /// Host arena. Allocated once, under the state lock, before any view or
    /// acquisition can point into it.
    host: UnsafeCell<Option<Box<[T]>>>,

    inflight: InFlight,
}

// Safety: the host arena is only reached through acquisitions, which the
// state lock serialises (many readers or one writer).
unsafe impl<T: Send + Sync> Send for Inner<T> {}
unsafe impl<T: Send + Sync> Sync for Inner<T> {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Unbound,
    Fresh,
    Host,
    Region(MemoryRegion),
}

/// Acquisition held by a task. Views created by the task body, and tasks it
/// launches, borrow from it instead of acquiring the buffer again.
#[derive(Debug)]
struct Lease {
    task: Id,
    access: Access,
    /// The enclosing task's lease this one borrows from.
    parent: Option<Id>,
    readers: usize,
    writer: bool,
}

impl Lease {
    fn is_borrowed(&self) -> bool {
        self.readers > 0 || self.writer
    }

    /// Fails if `access` exceeds what the lease was taken for. Returns
    /// `false` while an existing borrow excludes it.
    fn try_borrow(&mut self, access: Access) -> Result<bool> {
        if access.writes() && !self.access.writes() {
            return Err(Error::InvalidState("buffer is held read-only by the enclosing task"));
        }

        if self.writer || (access.writes() && self.readers > 0) {
            return Ok(false);
        }

        if access.writes() {
            self.writer = true;
        } else {
            self.readers += 1;
        }
        Ok(true)
    }

    fn unborrow(&mut self, access: Access) {
        if access.writes() {
            self.writer = false;
        } else {
            debug_assert!(self.readers > 0);
            self.readers -= 1;
        }
    }
}

#[derive(Debug)]
struct State {
    binding: Binding,
    device_memory: [Option<DeviceMemory>; 4],
    valid: ArenaSet,
    authoritative: Option<ArenaKind>,
    readers: usize,
    writer: bool,
    host_views: usize,
    leases: SmallVec<[Lease; 2]>,
}

impl State {
    fn is_compatible(&self, access: Access) -> bool {
        if access.writes() {
            !self.writer && self.readers == 0
        } else {
            !self.writer
        }
    }

    fn grab(&mut self, access: Access) {
        if access.writes() {
            self.writer = true;
        } else {
            self.readers += 1;
        }
    }

    fn ungrab(&mut self, access: Access) {
        if access.writes() {
            debug_assert!(self.writer);
            self.writer = false;
        } else {
            debug_assert!(self.readers > 0);
            self.readers -= 1;
        }
    }

    fn is_lease_borrowed(&self, task: Id) -> bool {
        self.leases.iter().any(|l| l.task == task && l.is_borrowed())
    }

    fn lease_mut(&mut self, task: Id) -> Option<&mut Lease> {
        self.leases.iter_mut().find(|l| l.task == task)
    }
}

fn alloc_error(err: DeviceError) -> Error {
    match err {
        DeviceError::OutOfMemory { bytes, .. } => Error::AllocFail { bytes },
        other => Error::DeviceFailure(other),
    }
}

impl<T: Pod + Send + Sync> Inner<T> {
    fn byte_len(&self) -> usize {
        self.len * mem::size_of::<T>()
    }

    fn driver(&self, kind: ArenaKind) -> Result<&Arc<dyn DeviceDriver>> {
        let device = kind.device();
        self.devices
            .get(device)
            .ok_or(Error::Misuse(Misuse::NoDevice(device)))
    }

    fn shares_host(&self, device: DeviceKind) -> bool {
        self.devices
            .get(device)
            .is_some_and(|d| d.shares_host_memory())
    }

    /// Whether `kind` can hold data on this runtime.
    fn in_use(&self, kind: ArenaKind) -> bool {
        match kind {
            ArenaKind::Host => true,
            ArenaKind::GpuCl => self.devices.has(DeviceKind::Gpu) && !self.shares_host(DeviceKind::Gpu),
            ArenaKind::GpuClSvm => self.shares_host(DeviceKind::Gpu),
            ArenaKind::DspIon => self.devices.has(DeviceKind::Dsp),
        }
    }

    fn aliases_host(&self, st: &State, kind: ArenaKind) -> bool {
        match kind {
            ArenaKind::Host | ArenaKind::GpuClSvm => true,
            ArenaKind::GpuCl => false,
            ArenaKind::DspIon => {
                matches!(st.binding, Binding::Region(_)) || self.shares_host(DeviceKind::Dsp)
            }
        }
    }

    /// Arenas that share storage with `kind`, and are therefore valid or
    /// stale together.
    fn alias_group(&self, st: &State, kind: ArenaKind) -> ArenaSet {
        if !self.aliases_host(st, kind) {
            return kind.flag();
        }

        ArenaKind::ALL
            .into_iter()
            .filter(|k| self.in_use(*k) && self.aliases_host(st, *k))
            .fold(kind.flag(), |set, k| set | k.flag())
    }

    /// The state lock must be held.
    fn ensure_host(&self) {
        // Safety: reading the slot; it is only written below, under the lock.
        if unsafe { (*self.host.get()).is_some() } {
            return;
        }

        let storage = vec![T::zeroed(); self.len].into_boxed_slice();
        // Safety: the host arena was never allocated, so nothing points into
        // it yet, and the state lock excludes other writers of the slot.
        unsafe { *self.host.get() = Some(storage) };
    }

    fn ensure_storage(&self, st: &mut State, kind: ArenaKind) -> Result<()> {
        if self.aliases_host(st, kind) {
            self.ensure_host();
            return Ok(());
        }

        if st.device_memory[kind.index()].is_none() {
            let mem = self.driver(kind)?.alloc(self.byte_len()).map_err(alloc_error)?;
            tracing::trace!(buffer = %self.id, arena = ?kind, bytes = mem.bytes, "arena allocated");
            st.device_memory[kind.index()] = Some(mem);
        }
        Ok(())
    }

    /// # Safety
    ///
    /// The host arena is allocated and the caller holds an acquisition or a
    /// view that allows reading it.
    unsafe fn host_slice(&self) -> &[T] {
        // Safety: upheld by caller.
        unsafe { (*self.host.get()).as_deref().unwrap_or(&[]) }
    }

    /// # Safety
    ///
    /// As `host_slice`, for exclusive access.
    #[allow(clippy::mut_from_ref)]
    unsafe fn host_slice_mut(&self) -> &mut [T] {
        // Safety: upheld by caller.
        unsafe { (*self.host.get()).as_deref_mut().unwrap_or(&mut []) }
    }

    /// Brings `dst` up to date from the authoritative arena. Device to
    /// device copies go through the host arena.
    fn copy_into(&self, st: &mut State, dst: ArenaKind) -> Result<()> {
        let Some(src) = st.authoritative else {
            return Ok(());
        };

        let src_host = self.aliases_host(st, src);
        let dst_host = self.aliases_host(st, dst);

        if !src_host && !st.valid.contains(ArenaSet::HOST) {
            self.ensure_host();
            let mem = st.device_memory[src.index()].expect("authoritative arena is allocated");
            // Safety: the host arena is stale, so no view or host task can be
            // reading it, and the state lock is held.
            let host = bytemuck::cast_slice_mut::<T, u8>(unsafe { self.host_slice_mut() });
            self.driver(src)?.copy_to_host(&mem, host)?;
            st.valid |= self.alias_group(st, ArenaKind::Host);
            tracing::debug!(buffer = %self.id, from = ?src, to = ?ArenaKind::Host, bytes = host.len(), "arena copy");
        }

        if !dst_host {
            let mem = st.device_memory[dst.index()].expect("destination arena is allocated");
            // Safety: the host arena is valid and only read here.
            let host = bytemuck::cast_slice::<T, u8>(unsafe { self.host_slice() });
            self.driver(dst)?.copy_to_device(&mem, host)?;
            tracing::debug!(buffer = %self.id, from = ?ArenaKind::Host, to = ?dst, bytes = host.len(), "arena copy");
        }

        Ok(())
    }

    /// Allocates the `kind` arena if needed, makes it valid when `want_valid`
    /// and, for writes, makes it the only valid arena.
    fn get_or_create_arena(
        &self,
        st: &mut State,
        kind: ArenaKind,
        want_valid: bool,
        write: bool,
    ) -> Result<()> {
        self.ensure_storage(st, kind)?;

        if st.binding == Binding::Unbound {
            st.binding = Binding::Fresh;
        }

        let group = self.alias_group(st, kind);
        match st.authoritative {
            // Fresh storage is zeroed, which is the initial content.
            None => {
                st.valid = group;
                st.authoritative = Some(kind);
            }
            Some(_) if want_valid && !st.valid.contains(kind.flag()) => {
                self.copy_into(st, kind)?;
                st.valid |= group;
            }
            Some(_) => {}
        }

        if write {
            st.valid = group;
            st.authoritative = Some(kind);
        }
        Ok(())
    }

    /// Borrows from the lease of the running task, if it holds one.
    fn borrow_lease(&self, access: Access) -> Result<Option<Id>> {
        let Some(task) = context::current_task_id() else {
            return Ok(None);
        };

        let mut st = self.state.lock();
        let Some(lease) = st.lease_mut(task) else {
            return Ok(None);
        };

        if access.writes() && !lease.access.writes() {
            return Err(Error::InvalidState("buffer is held read-only by the running task"));
        }

        if !lease.try_borrow(access)? {
            return Err(Error::InvalidState("buffer is already borrowed by the running task"));
        }

        // A nested task may have left the data in another arena.
        if let Err(e) = self.get_or_create_arena(&mut st, ArenaKind::Host, access.reads(), access.writes()) {
            if let Some(lease) = st.lease_mut(task) {
                lease.unborrow(access);
            }
            return Err(e);
        }
        Ok(Some(task))
    }

    /// Blocking host acquisition for a thread outside any task holding this
    /// buffer.
    fn acquire_host(&self, access: Access) -> Result<()> {
        let mut st = self.state.lock();
        while !st.is_compatible(access) {
            self.cond.wait(&mut st);
        }

        st.grab(access);
        if let Err(e) = self.get_or_create_arena(&mut st, ArenaKind::Host, access.reads(), access.writes()) {
            st.ungrab(access);
            self.cond.notify_all();
            return Err(e);
        }

        st.host_views += 1;
        Ok(())
    }

    fn release_view(&self, access: Access, lease: Option<Id>) {
        let mut st = self.state.lock();
        match lease {
            Some(task) => {
                if let Some(lease) = st.lease_mut(task) {
                    lease.unborrow(access);
                }
            }
            None => {
                st.ungrab(access);
                st.host_views -= 1;
            }
        }
        self.cond.notify_all();
    }

    fn bind(&self, binding: Binding, data: Option<Vec<T>>) -> Result<()> {
        let mut st = self.state.lock();
        if st.binding != Binding::Unbound {
            return Err(Error::InvalidState("buffer is already bound"));
        }

        if let Some(data) = data {
            if data.len() != self.len {
                return Err(Error::InvalidState("host allocation length differs from the buffer length"));
            }
            // Safety: an unbound buffer was never prepared, so the host arena
            // has no readers; the state lock is held.
            unsafe { *self.host.get() = Some(data.into_boxed_slice()) };
            st.binding = binding;
            st.valid = self.alias_group(&st, ArenaKind::Host);
            st.authoritative = Some(ArenaKind::Host);
        } else {
            st.binding = binding;
        }
        Ok(())
    }
}

impl<T: Pod + Send + Sync> RawBuffer for Inner<T> {
    fn id(&self) -> BufferId {
        self.id
    }

    fn try_acquire(&self, task: Id, ancestors: &[Id], access: Access) -> Result<bool> {
        let mut st = self.state.lock();

        let holder = ancestors
            .iter()
            .copied()
            .find(|a| st.leases.iter().any(|l| l.task == *a));

        if let Some(holder) = holder {
            let lease = st.lease_mut(holder).expect("holder lease was just found");
            if !lease.try_borrow(access)? {
                return Ok(false);
            }
            tracing::trace!(buffer = %self.id, %task, %holder, "buffer borrowed from enclosing task");
        } else {
            if !st.is_compatible(access) {
                return Ok(false);
            }
            st.grab(access);
        }

        st.leases.push(Lease {
            task,
            access,
            parent: holder,
            readers: 0,
            writer: false,
        });
        Ok(true)
    }

    fn release(&self, task: Id, access: Access) {
        if self.state.lock().is_lease_borrowed(task) {
            tracing::debug!(buffer = %self.id, %task, "task finished while its buffer is still borrowed");
            wait::help_until(|| !self.state.lock().is_lease_borrowed(task));
        }

        let mut st = self.state.lock();
        while st.is_lease_borrowed(task) {
            self.cond.wait(&mut st);
        }

        let parent = match st.leases.iter().position(|l| l.task == task) {
            Some(pos) => st.leases.swap_remove(pos).parent,
            None => None,
        };

        match parent {
            Some(parent) => {
                if let Some(lease) = st.lease_mut(parent) {
                    lease.unborrow(access);
                }
            }
            None => st.ungrab(access),
        }
        self.cond.notify_all();
    }

    fn prepare(&self, kind: ArenaKind, access: Access) -> Result<()> {
        let mut st = self.state.lock();
        self.get_or_create_arena(&mut st, kind, access.reads(), access.writes())
    }

    fn is_current_in(&self, kind: ArenaKind) -> bool {
        let st = self.state.lock();
        st.authoritative.is_none() || st.valid.contains(kind.flag())
    }

    unsafe fn launch_arg(&self, kind: ArenaKind, access: Access) -> LaunchArg<'_> {
        let (aliased, mem) = {
            let st = self.state.lock();
            (self.aliases_host(&st, kind), st.device_memory[kind.index()])
        };

        if !aliased {
            return LaunchArg::Memory(mem.expect("arena is prepared before launch"));
        }

        // Safety: upheld by caller.
        unsafe {
            if access.writes() {
                LaunchArg::Host(bytemuck::cast_slice_mut::<T, u8>(self.host_slice_mut()))
            } else {
                LaunchArg::HostRead(bytemuck::cast_slice::<T, u8>(self.host_slice()))
            }
        }
    }

    fn inflight(&self) -> &InFlight {
        &self.inflight
    }
}

impl<T> fmt::Debug for Inner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        for kind in ArenaKind::ALL {
            if let Some(mem) = st.device_memory[kind.index()].take()
                && let Some(driver) = self.devices.get(kind.device())
            {
                driver.free(mem);
            }
        }
    }
}

impl<T: Pod + Send + Sync> Buffer<T> {
    pub(crate) fn new(len: usize, devices: Devices) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: BufferId::next(),
                len,
                devices,
                state: Mutex::new(State {
                    binding: Binding::Unbound,
                    device_memory: [None; 4],
                    valid: ArenaSet::empty(),
                    authoritative: None,
                    readers: 0,
                    writer: false,
                    host_views: 0,
                    leases: SmallVec::new(),
                }),
                cond: Condvar::new(),
                host: UnsafeCell::new(None),
                inflight: InFlight::default(),
            }),
        }
    }

    pub(crate) fn erase(&self) -> AnyBuffer {
        self.inner.clone()
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.inner.byte_len()
    }

    /// Binds the buffer to a user allocation; the host arena becomes
    /// authoritative. Fails if the buffer is already bound or `data` has the
    /// wrong length.
    pub fn bind_host(&self, data: Vec<T>) -> Result<()> {
        self.inner.bind(Binding::Host, Some(data))
    }

    /// Places the buffer in `region`. Fails if the buffer is already bound.
    pub fn bind_region(&self, region: &MemoryRegion) -> Result<()> {
        self.inner.bind(Binding::Region(region.clone()), None)
    }

    pub fn region(&self) -> Option<MemoryRegion> {
        match &self.inner.state.lock().binding {
            Binding::Region(r) => Some(r.clone()),
            _ => None,
        }
    }

    /// Arenas currently holding valid data.
    pub fn valid_arenas(&self) -> ArenaSet {
        self.inner.state.lock().valid
    }

    pub fn authoritative_arena(&self) -> Option<ArenaKind> {
        self.inner.state.lock().authoritative
    }

    /// Number of live host views acquired from outside a task.
    pub fn host_multiplicity(&self) -> usize {
        self.inner.state.lock().host_views
    }

    fn acquire(&self, access: Access) -> Result<Option<Id>> {
        match self.inner.borrow_lease(access)? {
            Some(task) => Ok(Some(task)),
            None => self.inner.acquire_host(access).map(|_| None),
        }
    }

    /// Read-only host view. Blocks while a writer holds the buffer.
    pub fn acquire_ro(&self) -> Result<HostRead<T>> {
        let lease = self.acquire(Access::Read)?;
        Ok(HostRead {
            buffer: self.clone(),
            lease,
        })
    }

    /// Write view whose initial contents are unspecified; nothing is copied
    /// into the host arena.
    pub fn acquire_wi(&self) -> Result<HostWrite<T>> {
        self.acquire_write(Access::WriteInvalidate)
    }

    pub fn acquire_rw(&self) -> Result<HostWrite<T>> {
        self.acquire_write(Access::ReadWrite)
    }

    fn acquire_write(&self, access: Access) -> Result<HostWrite<T>> {
        let lease = self.acquire(access)?;
        Ok(HostWrite {
            buffer: self.clone(),
            access,
            lease,
        })
    }

    /// Copies the current contents out through a read view.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.acquire_ro()?.to_vec())
    }
}

/// Shared host view of a buffer. Released on drop.
pub struct HostRead<T: Pod + Send + Sync> {
    buffer: Buffer<T>,
    lease: Option<Id>,
}

impl<T: Pod + Send + Sync> HostRead<T> {
    pub fn release(self) {
        drop(self)
    }
}

impl<T: Pod + Send + Sync> Deref for HostRead<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // Safety: the view holds a read acquisition of a prepared host arena.
        unsafe { self.buffer.inner.host_slice() }
    }
}

impl<T: Pod + Send + Sync> Drop for HostRead<T> {
    fn drop(&mut self) {
        self.buffer.inner.release_view(Access::Read, self.lease);
    }
}

impl<T: Pod + Send + Sync + fmt::Debug> fmt::Debug for HostRead<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Exclusive host view of a buffer. Released on drop.
pub struct HostWrite<T: Pod + Send + Sync> {
    buffer: Buffer<T>,
    access: Access,
    lease: Option<Id>,
}

impl<T: Pod + Send + Sync> HostWrite<T> {
    pub fn release(self) {
        drop(self)
    }
}

impl<T: Pod + Send + Sync> Deref for HostWrite<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // Safety: the view holds the write acquisition.
        unsafe { self.buffer.inner.host_slice() }
    }
}

impl<T: Pod + Send + Sync> DerefMut for HostWrite<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // Safety: the view holds the write acquisition and `&mut self`
        // excludes other borrows through it.
        unsafe { self.buffer.inner.host_slice_mut() }
    }
}

impl<T: Pod + Send + Sync> Drop for HostWrite<T> {
    fn drop(&mut self) {
        self.buffer.inner.release_view(self.access, self.lease);
    }
}

impl<T: Pod + Send + Sync + fmt::Debug> fmt::Debug for HostWrite<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
