use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

pub(super) const EMPTY: u8 = 0;
pub(super) const WRITTEN: u8 = 1;
pub(super) const TAKEN: u8 = 2;

pub(super) struct Slot<T> {
    pub(super) state: AtomicU8,
    pub(super) value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// # Safety
    ///
    /// The caller must own the slot through a successful tail reservation.
    pub(super) unsafe fn write(&self, value: T) {
        // Safety: the reservation is unique.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(WRITTEN, Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller must own the slot through a successful head claim, and the
    /// slot must be `WRITTEN`.
    pub(super) unsafe fn take(&self) -> T {
        // Safety: the claim is unique and the value was published.
        let value = unsafe { (*self.value.get()).assume_init_read() };
        self.state.store(TAKEN, Ordering::Release);
        value
    }
}

/// Bounded ring of `2^k` slots. Indices only grow; the segment is never
/// reused once drained.
pub(super) struct Segment<T> {
    pub(super) slots: Box<[Slot<T>]>,

    /// Next index to claim for a pop.
    pub(super) head: CachePadded<AtomicUsize>,

    /// Next index to reserve for a push. May overshoot the capacity by the
    /// number of concurrent pushers that raced past the end.
    pub(super) tail: CachePadded<AtomicUsize>,

    /// Set by the push that reserves the last slot.
    pub(super) closed: AtomicBool,

    pub(super) next: AtomicPtr<Segment<T>>,
}

impl<T> Segment<T> {
    pub(super) fn new(cap: usize) -> Self {
        debug_assert!(cap.is_power_of_two());
        Self {
            slots: (0..cap).map(|_| Slot::new()).collect(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(super) fn cap(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.state.get_mut() == WRITTEN {
                // Safety: written and never taken.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}
