//! Adaptive work-stealing tree over an index range.
//!
//! Every node owns a contiguous range `[first, last)` and a cursor. The
//! owner of a node claims `chunk` iterations at a time by advancing the
//! cursor. A thief freezes the cursor of a running node by setting the
//! `STOLEN` bit: the owner keeps `[first, cursor)` and the remainder is
//! split at its midpoint into two children, the left one owned by the thief
//! and the right one left unclaimed for whoever finds it first.
//!
//! Reading the nodes in pre-order (own range, left child, right child)
//! visits the range in index order, which is what reduce and scan rely on.

use crate::context::slab;
use std::cell::UnsafeCell;
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering};

/// Set on the cursor once the node was split.
const STOLEN: usize = 1 << (usize::BITS - 1);

const UNCLAIMED: u8 = 0;
const CLAIMED: u8 = 1;

const LEFT: usize = 0;
const RIGHT: usize = 1;

pub(crate) struct Node<A> {
    first: usize,
    last: usize,
    cursor: AtomicUsize,
    claim: AtomicU8,
    children: [AtomicPtr<Node<A>>; 2],

    /// Descents into each child, steers searches toward the less explored
    /// side.
    visits: [AtomicU32; 2],

    /// Only touched by the owner while it runs the node, and by the master
    /// once every participant is done.
    acc: UnsafeCell<Option<A>>,
}

// Safety: `acc` is handed out to a single owner at a time, see `Tree::run_node`.
unsafe impl<A: Send> Send for Node<A> {}
unsafe impl<A: Send> Sync for Node<A> {}

impl<A> Node<A> {
    fn new(range: Range<usize>, claim: u8) -> Self {
        Self {
            first: range.start,
            last: range.end,
            cursor: AtomicUsize::new(range.start),
            claim: AtomicU8::new(claim),
            children: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
            visits: [AtomicU32::new(0), AtomicU32::new(0)],
            acc: UnsafeCell::new(None),
        }
    }

    /// Part of the range processed by this node's owner. Only meaningful
    /// once every participant is done.
    pub(crate) fn own_range(&self) -> Range<usize> {
        let cursor = self.cursor.load(Ordering::Acquire) & !STOLEN;
        self.first..cursor.min(self.last)
    }

    /// Takes the accumulator. Only valid once every participant is done.
    pub(crate) fn take_acc(&self) -> Option<A> {
        // Safety: no participant runs anymore.
        unsafe { (*self.acc.get()).take() }
    }

    fn child(&self, side: usize) -> Option<&Node<A>> {
        // Safety: children live as long as the tree.
        unsafe { self.children[side].load(Ordering::Acquire).as_ref() }
    }

    fn try_own(&self) -> bool {
        self.claim
            .compare_exchange(UNCLAIMED, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_claimed(&self) -> bool {
        self.claim.load(Ordering::Acquire) == CLAIMED
    }
}

/// Counters reported by a participant once it leaves the tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParticipantStats {
    pub(crate) elements: usize,
    pub(crate) chunks: usize,
}

pub(crate) struct Tree<A> {
    root: NonNull<Node<A>>,
    runtime_id: u64,
    chunk: usize,
    steal: bool,
    aborted: AtomicBool,
    steals: AtomicUsize,
    nodes: AtomicUsize,
}

// Safety: nodes are shared through atomics, see `Node`.
unsafe impl<A: Send> Send for Tree<A> {}
unsafe impl<A: Send> Sync for Tree<A> {}

impl<A> Tree<A> {
    /// Builds the tree with its top levels already split into at most
    /// `parts` leaves, never cutting a leaf below `chunk` iterations.
    /// Returns the tree and the unclaimed leaves in index order.
    pub(crate) fn new(
        runtime_id: u64,
        range: Range<usize>,
        chunk: usize,
        parts: usize,
        steal: bool,
    ) -> (Self, Vec<NonNull<Node<A>>>) {
        debug_assert!(chunk > 0);

        let mut leaves = Vec::with_capacity(parts);
        let tree_nodes = AtomicUsize::new(0);
        let root = presplit(runtime_id, range, chunk, parts.max(1), &mut leaves, &tree_nodes);

        let tree = Self {
            root,
            runtime_id,
            chunk,
            steal,
            aborted: AtomicBool::new(false),
            steals: AtomicUsize::new(0),
            nodes: tree_nodes,
        };
        (tree, leaves)
    }

    pub(crate) fn chunk(&self) -> usize {
        self.chunk
    }

    pub(crate) fn steals(&self) -> usize {
        self.steals.load(Ordering::Relaxed)
    }

    pub(crate) fn nodes(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Processes nodes until there is nothing left to own or steal.
    ///
    /// `leaf` is a leaf handed out by [`Tree::new`]; the participant takes
    /// it first when nobody found it before. `stop` is polled between chunks
    /// and aborts the whole tree once it returns true.
    pub(crate) fn participate<S, F>(
        &self,
        leaf: Option<NonNull<Node<A>>>,
        stop: S,
        mut f: F,
    ) -> ParticipantStats
    where
        S: Fn() -> bool,
        F: FnMut(&mut Option<A>, Range<usize>),
    {
        let mut stats = ParticipantStats::default();

        // Safety: leaves live as long as the tree.
        let mut next = leaf
            .map(|leaf| unsafe { leaf.as_ref() })
            .filter(|leaf| leaf.try_own());

        loop {
            let node = match next.take() {
                Some(node) => node,
                None if self.steal => match self.find_work() {
                    Some(node) => node,
                    None => break,
                },
                None => break,
            };

            self.run_node(node, &stop, &mut f, &mut stats);

            if self.is_aborted() {
                break;
            }
        }

        stats
    }

    fn run_node<S, F>(&self, node: &Node<A>, stop: &S, f: &mut F, stats: &mut ParticipantStats)
    where
        S: Fn() -> bool,
        F: FnMut(&mut Option<A>, Range<usize>),
    {
        // Safety: the caller owns `node`, nobody else touches its accumulator
        // until the tree is done.
        let acc = unsafe { &mut *node.acc.get() };

        loop {
            if self.is_aborted() {
                return;
            }
            if stop() {
                self.abort();
                return;
            }

            let cursor = node.cursor.load(Ordering::Acquire);
            if cursor & STOLEN != 0 || cursor >= node.last {
                return;
            }

            let next = (cursor + self.chunk).min(node.last);
            if node
                .cursor
                .compare_exchange_weak(cursor, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                f(acc, cursor..next);
                stats.elements += next - cursor;
                stats.chunks += 1;
            }
        }
    }

    /// Looks for an unclaimed leaf, or splits a running one.
    fn find_work(&self) -> Option<&Node<A>> {
        // Safety: the root lives as long as the tree.
        self.find_in(unsafe { self.root.as_ref() })
    }

    fn find_in<'a>(&'a self, node: &'a Node<A>) -> Option<&'a Node<A>> {
        let Some(left) = node.child(LEFT) else {
            if node.try_own() {
                return Some(node);
            }
            return self.try_steal(node);
        };
        // Right is published before left.
        let right = node.child(RIGHT)?;

        let first = if node.visits[LEFT].load(Ordering::Relaxed)
            <= node.visits[RIGHT].load(Ordering::Relaxed)
        {
            LEFT
        } else {
            RIGHT
        };
        let sides = [first, 1 - first];

        sides.into_iter().find_map(|side| {
            node.visits[side].fetch_add(1, Ordering::Relaxed);
            self.find_in(if side == LEFT { left } else { right })
        })
    }

    fn try_steal<'a>(&'a self, node: &'a Node<A>) -> Option<&'a Node<A>> {
        if !node.is_claimed() {
            return None;
        }

        let mut cursor = node.cursor.load(Ordering::Acquire);
        loop {
            if cursor & STOLEN != 0 || node.last.saturating_sub(cursor) < 2 * self.chunk {
                return None;
            }

            match node.cursor.compare_exchange_weak(
                cursor,
                cursor | STOLEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cursor = actual,
            }
        }

        let mid = cursor + (node.last - cursor) / 2;
        let left = self.alloc_node(cursor..mid, CLAIMED);
        let right = self.alloc_node(mid..node.last, UNCLAIMED);

        node.children[RIGHT].store(right.as_ptr(), Ordering::Release);
        node.children[LEFT].store(left.as_ptr(), Ordering::Release);
        self.steals.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(first = node.first, cursor, mid, last = node.last, "node stolen");

        // Safety: just allocated, freed with the tree.
        Some(unsafe { left.as_ref() })
    }

    fn alloc_node(&self, range: Range<usize>, claim: u8) -> NonNull<Node<A>> {
        self.nodes.fetch_add(1, Ordering::Relaxed);
        slab::alloc(self.runtime_id, Node::new(range, claim))
    }

    /// Every node, own range first, then the left and right subtrees. Only
    /// valid once every participant is done.
    pub(crate) fn pre_order(&self) -> Vec<&Node<A>> {
        let mut out = Vec::with_capacity(self.nodes());
        // Safety: nodes live as long as the tree.
        let mut stack = vec![unsafe { self.root.as_ref() }];

        while let Some(node) = stack.pop() {
            out.push(node);
            if let Some(left) = node.child(LEFT) {
                stack.extend(node.child(RIGHT));
                stack.push(left);
            }
        }

        out
    }
}

fn presplit<A>(
    runtime_id: u64,
    range: Range<usize>,
    chunk: usize,
    parts: usize,
    leaves: &mut Vec<NonNull<Node<A>>>,
    nodes: &AtomicUsize,
) -> NonNull<Node<A>> {
    nodes.fetch_add(1, Ordering::Relaxed);

    let len = range.end - range.start;
    if parts <= 1 || len < 2 * chunk {
        let leaf = slab::alloc(runtime_id, Node::new(range, UNCLAIMED));
        leaves.push(leaf);
        return leaf;
    }

    let left_parts = parts / 2;
    let mid = (range.start + len * left_parts / parts)
        .clamp(range.start + chunk, range.end - chunk);

    // Inner nodes keep an empty range of their own.
    let node = Node::new(range.clone(), CLAIMED);
    node.cursor.store(range.start | STOLEN, Ordering::Relaxed);

    let left = presplit(runtime_id, range.start..mid, chunk, left_parts, leaves, nodes);
    let right = presplit(runtime_id, mid..range.end, chunk, parts - left_parts, leaves, nodes);
    node.children[LEFT].store(left.as_ptr(), Ordering::Relaxed);
    node.children[RIGHT].store(right.as_ptr(), Ordering::Relaxed);

    slab::alloc(runtime_id, node)
}

impl<A> Drop for Tree<A> {
    fn drop(&mut self) {
        let mut stack = vec![self.root];

        while let Some(node) = stack.pop() {
            // Safety: each node is reachable from exactly one parent.
            let node_ref = unsafe { node.as_ref() };
            for side in [LEFT, RIGHT] {
                stack.extend(NonNull::new(node_ref.children[side].load(Ordering::Acquire)));
            }
            // Safety: allocated by `slab::alloc`, unreachable from now on.
            unsafe { slab::dealloc(node) };
        }
    }
}

/// Rounds the number of pre-split leaves up to a power of two.
pub(crate) fn adaptive_parts(degree: usize) -> usize {
    degree.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::AtomicU8 as Counter;
    use std::thread;

    // Not a runtime id, so nodes come from the system allocator.
    const NO_RUNTIME: u64 = u64::MAX;

    static_assertions::assert_impl_all!(Tree<u64>: Send, Sync);

    fn run_threads(tree: &Tree<Vec<Range<usize>>>, leaves: &[NonNull<Node<Vec<Range<usize>>>>], n: usize) {
        struct Leaf<A>(Option<NonNull<Node<A>>>);
        unsafe impl<A> Send for Leaf<A> {}

        thread::scope(|s| {
            for i in 0..n {
                let leaf = Leaf(leaves.get(i).copied());
                s.spawn(move || {
                    let leaf = leaf;
                    tree.participate(leaf.0, || false, |acc, range| {
                        acc.get_or_insert_with(Vec::new).push(range);
                    })
                });
            }
        });
    }

    #[rstest]
    #[case::even(0..10_000, 16, 4)]
    #[case::odd_workers(3..9_999, 7, 3)]
    #[case::tiny(0..5, 16, 4)]
    #[case::one_worker(0..1_000, 1, 1)]
    fn test_every_index_processed_once(
        #[case] range: Range<usize>,
        #[case] chunk: usize,
        #[case] workers: usize,
    ) {
        let (tree, leaves) =
            Tree::new(NO_RUNTIME, range.clone(), chunk, adaptive_parts(workers), true);
        run_threads(&tree, &leaves, workers);

        let seen: Vec<Counter> = (0..range.end).map(|_| Counter::new(0)).collect();
        let mut chunks = Vec::new();
        for node in tree.pre_order() {
            for r in node.take_acc().unwrap_or_default() {
                assert!(node.own_range().contains(&r.start));
                chunks.push((r.clone(), node.own_range().end));
                for i in r {
                    seen[i].fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for i in range.clone() {
            assert_eq!(seen[i].load(Ordering::Relaxed), 1, "index {i}");
        }

        // Short chunks only at the end of a node's range.
        for (r, end) in chunks {
            assert!(r.len() >= chunk.min(range.len()) || r.end == end);
        }
    }

    #[test]
    fn test_pre_order_is_index_order() {
        let (tree, leaves) = Tree::<Vec<Range<usize>>>::new(NO_RUNTIME, 0..50_000, 8, 4, true);
        run_threads(&tree, &leaves, 4);

        let mut next = 0;
        for node in tree.pre_order() {
            let own = node.own_range();
            if own.is_empty() {
                continue;
            }
            assert_eq!(own.start, next);
            next = own.end;
        }
        assert_eq!(next, 50_000);
    }

    #[test]
    fn test_presplit_leaves() {
        let (tree, leaves) = Tree::<()>::new(NO_RUNTIME, 0..1_000, 10, 4, true);
        assert_eq!(leaves.len(), 4);
        assert_eq!(tree.nodes(), 7);

        let ranges: Vec<_> = leaves.iter().map(|l| unsafe { l.as_ref() }.first).collect();
        assert_eq!(ranges, vec![0, 250, 500, 750]);

        // Not enough iterations for more than one leaf.
        let (_, leaves) = Tree::<()>::new(NO_RUNTIME, 0..15, 10, 4, true);
        assert_eq!(leaves.len(), 1);
    }

    #[test]
    fn test_steal_splits_remainder() {
        let (tree, leaves) = Tree::<()>::new(NO_RUNTIME, 0..100, 10, 1, true);
        let root = unsafe { leaves[0].as_ref() };
        assert!(root.try_own());
        root.cursor.store(20, Ordering::Release);

        let left = tree.find_work().unwrap();
        assert_eq!((left.first, left.last), (20, 60));
        assert!(left.is_claimed());

        let right = root.child(RIGHT).unwrap();
        assert_eq!((right.first, right.last), (60, 100));
        assert!(!right.is_claimed());
        assert_eq!(root.own_range(), 0..20);
        assert_eq!(tree.steals(), 1);

        // Once the thief is done, the next search owns the right child.
        left.cursor.store(60, Ordering::Release);
        let found = tree.find_work().unwrap();
        assert!(ptr::eq(found, right));
    }

    #[test]
    fn test_no_steal_below_two_chunks() {
        let (tree, leaves) = Tree::<()>::new(NO_RUNTIME, 0..100, 10, 1, true);
        let root = unsafe { leaves[0].as_ref() };
        assert!(root.try_own());
        root.cursor.store(81, Ordering::Release);

        assert!(tree.find_work().is_none());
        assert_eq!(tree.steals(), 0);
    }

    #[test]
    fn test_stop_aborts_tree() {
        let (tree, leaves) = Tree::<()>::new(NO_RUNTIME, 0..100, 10, 1, true);
        let stats = tree.participate(leaves.first().copied(), || true, |_, _| {});
        assert!(tree.is_aborted());
        assert_eq!(stats.elements, 0);
    }
}
