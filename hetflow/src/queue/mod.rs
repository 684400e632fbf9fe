//! Unbounded lock-free MPMC FIFO built from a linked list of bounded ring
//! segments.
//!
//! Pushers reserve a slot with a single `fetch_add` on the tail segment. The
//! push that reserves the last slot closes the segment and links a fresh one;
//! pushers that overshoot help with the link and retry on the new tail.
//! Poppers claim slots with a CAS on the head index and advance to the next
//! segment once the current one is closed and drained. Segments are only
//! released when the queue is dropped, so no reclamation scheme is needed.

mod segment;
use segment::{Segment, WRITTEN};

use crossbeam_utils::{Backoff, CachePadded};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Default segment size is `2^DEFAULT_SEGMENT_SHIFT` slots.
pub(crate) const DEFAULT_SEGMENT_SHIFT: u32 = 6;

pub(crate) struct SegQueue<T> {
    head: CachePadded<AtomicPtr<Segment<T>>>,
    tail: CachePadded<AtomicPtr<Segment<T>>>,

    /// First segment ever allocated, the list is walked from here on drop.
    first: *mut Segment<T>,

    cap: usize,

    /// Size hint, exact when the queue is quiescent.
    len: AtomicUsize,

    /// Segments linked after construction.
    appended: AtomicUsize,
}

// Safety: values are moved across threads through slots whose ownership is
// handed over by the reservation/claim protocol.
unsafe impl<T: Send> Send for SegQueue<T> {}
unsafe impl<T: Send> Sync for SegQueue<T> {}

impl<T> Default for SegQueue<T> {
    fn default() -> Self {
        Self::with_segment_shift(DEFAULT_SEGMENT_SHIFT)
    }
}

impl<T> fmt::Debug for SegQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegQueue")
            .field("segment_cap", &self.cap)
            .field("len", &self.len())
            .field("appended", &self.num_segments_appended())
            .finish()
    }
}

impl<T> SegQueue<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a queue whose segments hold `2^shift` values.
    #[track_caller]
    pub(crate) fn with_segment_shift(shift: u32) -> Self {
        assert!(shift < usize::BITS, "segment shift too large");
        let cap = 1usize << shift;
        let first = Box::into_raw(Box::new(Segment::new(cap)));

        Self {
            head: CachePadded::new(AtomicPtr::new(first)),
            tail: CachePadded::new(AtomicPtr::new(first)),
            first,
            cap,
            len: AtomicUsize::new(0),
            appended: AtomicUsize::new(0),
        }
    }

    /// Appends `value` at the back and returns the queue size observed right
    /// after the push, which callers use to decide whether to wake a consumer.
    pub(crate) fn push(&self, value: T) -> usize {
        let backoff = Backoff::new();

        loop {
            let seg_ptr = self.tail.load(Ordering::Acquire);
            // Safety: segments are never freed while the queue is alive.
            let seg = unsafe { &*seg_ptr };

            let idx = seg.tail.fetch_add(1, Ordering::AcqRel);

            if idx < self.cap {
                if idx == self.cap - 1 {
                    seg.closed.store(true, Ordering::Release);
                    self.advance_tail(seg_ptr);
                }

                // Counted before publishing so a racing pop never drives
                // the hint below zero.
                let len = self.len.fetch_add(1, Ordering::AcqRel) + 1;

                // Safety: `idx` was reserved by this call only.
                unsafe { seg.slots[idx].write(value) };
                return len;
            }

            // Overshot a full segment, help link its successor and retry.
            self.advance_tail(seg_ptr);
            backoff.spin();
        }
    }

    fn advance_tail(&self, seg_ptr: *mut Segment<T>) {
        // Safety: segments are never freed while the queue is alive.
        let seg = unsafe { &*seg_ptr };
        let mut next = seg.next.load(Ordering::Acquire);

        if next.is_null() {
            let new = Box::into_raw(Box::new(Segment::new(self.cap)));
            match seg.next.compare_exchange(
                ptr::null_mut(),
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.appended.fetch_add(1, Ordering::Relaxed);
                    next = new;
                }
                Err(actual) => {
                    // Safety: `new` was never published.
                    drop(unsafe { Box::from_raw(new) });
                    next = actual;
                }
            }
        }

        let _ = self
            .tail
            .compare_exchange(seg_ptr, next, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Removes the value at the front, or returns `None` if the queue is
    /// empty.
    pub(crate) fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();

        loop {
            let seg_ptr = self.head.load(Ordering::Acquire);
            // Safety: segments are never freed while the queue is alive.
            let seg = unsafe { &*seg_ptr };

            let head = seg.head.load(Ordering::Acquire);
            let tail = seg.tail.load(Ordering::Acquire).min(seg.cap());

            if head < tail {
                if seg
                    .head
                    .compare_exchange_weak(head, head + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    backoff.spin();
                    continue;
                }

                // The slot is reserved but the pusher may still be writing.
                let slot = &seg.slots[head];
                let wait = Backoff::new();
                while slot.state.load(Ordering::Acquire) != WRITTEN {
                    wait.snooze();
                }

                // Safety: this call claimed `head` and the value is published.
                let value = unsafe { slot.take() };
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Some(value);
            }

            // Every slot reserved means the closing push is on its way even if
            // `closed` is not visible yet, and later values already go to the
            // next segment.
            if !seg.closed.load(Ordering::Acquire) && seg.tail.load(Ordering::Acquire) < seg.cap() {
                return None;
            }

            // A slow pusher may have reserved the last slot right before the
            // close; look once more before leaving the segment behind.
            if seg.head.load(Ordering::Acquire) < seg.tail.load(Ordering::Acquire).min(seg.cap())
            {
                continue;
            }

            let next = seg.next.load(Ordering::Acquire);
            if next.is_null() {
                // The closing pusher has not linked the successor yet.
                backoff.snooze();
                continue;
            }

            let _ = self
                .head
                .compare_exchange(seg_ptr, next, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn segment_capacity(&self) -> usize {
        self.cap
    }

    /// Number of segments linked after the initial one.
    pub(crate) fn num_segments_appended(&self) -> usize {
        self.appended.load(Ordering::Relaxed)
    }
}

impl<T> Drop for SegQueue<T> {
    fn drop(&mut self) {
        let mut seg = self.first;
        while !seg.is_null() {
            // Safety: we have exclusive access and every segment was leaked
            // from a Box exactly once.
            let boxed = unsafe { Box::from_raw(seg) };
            seg = boxed.next.load(Ordering::Relaxed);
        }
    }
}
