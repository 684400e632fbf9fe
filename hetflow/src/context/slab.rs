//! Per-worker slab pools for fixed-size runtime objects (task cells, tree
//! nodes).
//!
//! Every block is preceded by a small header that records the owning pool.
//! The owner allocates and frees on its local free list without atomics;
//! any other thread returns blocks through the pool's remote list, which the
//! owner swaps in when the local list runs dry. Objects that do not fit in a
//! block, or that are allocated outside of a worker thread, go to the system
//! allocator and carry a null pool in their header.

use crate::utils::SpinLock;
use std::alloc::{self, Layout};
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};

/// Payload bytes available in one slab block.
pub(crate) const BLOCK_SIZE: usize = 256;

/// Alignment guaranteed to every slab payload.
const BLOCK_ALIGN: usize = 16;

const HEADER_SIZE: usize = mem::size_of::<Header>();

const STRIDE: usize = HEADER_SIZE + BLOCK_SIZE;

/// Default number of blocks carved out of a single chunk.
pub(crate) const DEFAULT_CHUNK_BLOCKS: usize = 64;

#[repr(C, align(16))]
struct Header {
    pool: *const SlabPool,
}

/// Overlays the block while it sits on a free list.
struct FreeBlock {
    next: *mut FreeBlock,
}

#[derive(Debug)]
struct FreeList {
    head: *mut FreeBlock,
    len: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    ///
    /// `block` must point to the start of a block no one else references.
    unsafe fn push(&mut self, block: *mut u8) {
        let block = block.cast::<FreeBlock>();
        // Safety: upheld by caller.
        unsafe { block.write(FreeBlock { next: self.head }) };
        self.head = block;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<*mut u8> {
        if self.head.is_null() {
            return None;
        }

        let block = self.head;
        // Safety: every block on the list was written by `push`.
        self.head = unsafe { (*block).next };
        self.len -= 1;
        Some(block.cast())
    }
}

#[derive(Debug)]
struct Local {
    free: FreeList,
    chunks: Vec<NonNull<u8>>,
}

/// A pool owned by exactly one worker thread.
pub(crate) struct SlabPool {
    runtime_id: u64,
    index: usize,
    chunk_blocks: usize,

    /// Only ever touched by the owner thread, see `is_owner`.
    local: UnsafeCell<Local>,

    /// Blocks freed by other threads.
    remote: SpinLock<FreeList>,
}

// Safety: `local` is only accessed by the owning worker thread, which is
// checked through the thread-local `CURRENT_POOL`. `remote` is behind a lock.
unsafe impl Send for SlabPool {}
unsafe impl Sync for SlabPool {}

impl fmt::Debug for SlabPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabPool")
            .field("runtime_id", &self.runtime_id)
            .field("index", &self.index)
            .field("chunk_blocks", &self.chunk_blocks)
            .finish_non_exhaustive()
    }
}

thread_local! {
    static CURRENT_POOL: Cell<*const SlabPool> = const { Cell::new(ptr::null()) };
}

impl SlabPool {
    pub(crate) fn new(runtime_id: u64, index: usize, chunk_blocks: usize) -> Self {
        debug_assert!(chunk_blocks > 0);
        Self {
            runtime_id,
            index,
            chunk_blocks,
            local: UnsafeCell::new(Local {
                free: FreeList::new(),
                chunks: Vec::new(),
            }),
            remote: SpinLock::new(FreeList::new()),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Installs this pool as the current thread's pool until the guard drops.
    pub(crate) fn enter(&self) -> PoolGuard {
        let prev = CURRENT_POOL.with(|c| c.replace(self as *const _));
        PoolGuard { prev }
    }

    fn is_owner(&self) -> bool {
        CURRENT_POOL.with(|c| ptr::eq(c.get(), self))
    }

    /// Number of chunks requested from the system so far. Owner thread only.
    pub(crate) fn num_chunks(&self) -> usize {
        debug_assert!(self.is_owner());
        // Safety: owner thread only.
        unsafe { (*self.local.get()).chunks.len() }
    }

    /// Number of blocks waiting on the remote list.
    pub(crate) fn num_remote(&self) -> usize {
        self.remote.lock().len
    }

    fn alloc_block(&self) -> Option<*mut u8> {
        debug_assert!(self.is_owner());

        // Safety: owner thread only.
        let local = unsafe { &mut *self.local.get() };

        if let Some(block) = local.free.pop() {
            return Some(block);
        }

        // Swap the whole remote list in, one lock round-trip per batch.
        {
            let mut remote = self.remote.lock();
            mem::swap(&mut local.free, &mut *remote);
        }

        if let Some(block) = local.free.pop() {
            return Some(block);
        }

        self.grow(local)?;
        local.free.pop()
    }

    fn grow(&self, local: &mut Local) -> Option<()> {
        let layout = self.chunk_layout();

        // Safety: layout has a non-zero size.
        let chunk = NonNull::new(unsafe { alloc::alloc(layout) })?;

        // Thread blocks in reverse so the first allocation gets the lowest address.
        for i in (0..self.chunk_blocks).rev() {
            // Safety: `i * STRIDE` is within the chunk and blocks do not overlap.
            unsafe { local.free.push(chunk.as_ptr().add(i * STRIDE)) };
        }

        local.chunks.push(chunk);
        tracing::trace!(pool = self.index, chunks = local.chunks.len(), "slab grew");
        Some(())
    }

    fn chunk_layout(&self) -> Layout {
        Layout::from_size_align(STRIDE * self.chunk_blocks, BLOCK_ALIGN)
            .expect("slab chunk layout overflow")
    }

    /// # Safety
    ///
    /// `block` must have been handed out by this pool and be unused.
    unsafe fn free_block(&self, block: *mut u8) {
        if self.is_owner() {
            // Safety: owner thread only; block ownership upheld by caller.
            unsafe { (*self.local.get()).free.push(block) };
        } else {
            // Safety: block ownership upheld by caller.
            unsafe { self.remote.lock().push(block) };
        }
    }
}

impl Drop for SlabPool {
    fn drop(&mut self) {
        let layout = self.chunk_layout();
        for chunk in self.local.get_mut().chunks.drain(..) {
            // Safety: every chunk was allocated with `layout`, and all blocks
            // are dead because every slab object keeps its runtime alive.
            unsafe { alloc::dealloc(chunk.as_ptr(), layout) };
        }
    }
}

pub(crate) struct PoolGuard {
    prev: *const SlabPool,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        CURRENT_POOL.with(|c| c.set(self.prev));
    }
}

fn fits_block(layout: Layout) -> bool {
    layout.size() <= BLOCK_SIZE && layout.align() <= BLOCK_ALIGN
}

/// Layout and payload offset of a system-allocated object with a header.
fn system_layout<T>() -> (Layout, usize) {
    let align = mem::align_of::<T>().max(BLOCK_ALIGN);
    let offset = HEADER_SIZE.max(align);
    let layout = Layout::from_size_align(offset + mem::size_of::<T>(), align)
        .expect("object layout overflow");
    (layout, offset)
}

fn current_pool(runtime_id: u64) -> Option<&'static SlabPool> {
    let pool = CURRENT_POOL.with(|c| c.get());
    if pool.is_null() {
        return None;
    }

    // Safety: a pool stays installed only while its worker thread runs, and
    // the worker keeps the runtime (and therefore the pool) alive.
    let pool = unsafe { &*pool };
    (pool.runtime_id == runtime_id).then_some(pool)
}

/// Moves `value` into a block owned by the current worker's pool when the
/// current thread is a worker of runtime `runtime_id`, otherwise into a
/// system allocation.
///
/// The returned pointer must be released with [`dealloc`] or [`free`].
pub(crate) fn alloc<T>(runtime_id: u64, value: T) -> NonNull<T> {
    let layout = Layout::new::<T>();

    let pool_block = if fits_block(layout) {
        current_pool(runtime_id).and_then(|pool| pool.alloc_block().map(|b| (pool, b)))
    } else {
        None
    };

    let (header, payload) = match pool_block {
        Some((_, block)) => {
            // Safety: blocks are STRIDE bytes long and the header fits first.
            let payload = unsafe { block.add(HEADER_SIZE) };
            (block.cast::<Header>(), payload)
        }
        None => {
            let (layout, offset) = system_layout::<T>();
            // Safety: layout has non-zero size because of the header.
            let base = unsafe { alloc::alloc(layout) };
            if base.is_null() {
                alloc::handle_alloc_error(layout);
            }
            // Safety: offset < layout.size().
            let payload = unsafe { base.add(offset) };
            // Safety: offset >= HEADER_SIZE.
            let header = unsafe { payload.sub(HEADER_SIZE) }.cast::<Header>();
            // Safety: header is in bounds and aligned to 16.
            unsafe { header.write(Header { pool: ptr::null() }) };
            let payload = payload.cast::<T>();
            // Safety: payload is aligned for T and large enough.
            unsafe { payload.write(value) };
            // Safety: non-null by construction.
            return unsafe { NonNull::new_unchecked(payload) };
        }
    };

    let pool = pool_block.map(|(p, _)| p as *const SlabPool).unwrap_or(ptr::null());
    // Safety: header and payload are in bounds of the block.
    unsafe {
        header.write(Header { pool });
        payload.cast::<T>().write(value);
        NonNull::new_unchecked(payload.cast::<T>())
    }
}

/// Drops the value and releases its memory.
///
/// # Safety
///
/// `ptr` must come from [`alloc`] with the same `T` and must not be used
/// afterwards.
pub(crate) unsafe fn dealloc<T>(ptr: NonNull<T>) {
    // Safety: upheld by caller.
    unsafe {
        ptr::drop_in_place(ptr.as_ptr());
        free(ptr);
    }
}

/// Releases the memory without dropping the value, which the caller already
/// moved out or dropped in place.
///
/// # Safety
///
/// Same as [`dealloc`].
pub(crate) unsafe fn free<T>(ptr: NonNull<T>) {
    let payload = ptr.as_ptr().cast::<u8>();
    // Safety: every payload is preceded by its header.
    let header = unsafe { payload.sub(HEADER_SIZE) }.cast::<Header>();
    // Safety: written by `alloc`.
    let pool = unsafe { (*header).pool };

    if pool.is_null() {
        let (layout, offset) = system_layout::<T>();
        // Safety: base was allocated with `layout`.
        unsafe { alloc::dealloc(payload.sub(offset), layout) };
    } else {
        // Safety: pools outlive their blocks; the block starts at the header.
        unsafe { (*pool).free_block(header.cast()) };
    }
}
