//! Pool storage: nodes, the thread-private free list, node groups,
//! and the chain of raw blocks everything is carved out of.
//!
//! A [Node] holds one caller value plus an intrusive link. Nodes move
//! between lists by relinking only; a node's address never changes for the
//! lifetime of the pool, and its memory is returned to the system allocator
//! only when the owning pool's [BlockChain] is dropped. That last property is
//! load-bearing for the lock-free queue: a concurrent pop may dereference a
//! group that has already been retired and recycled, and that is only
//! tolerable because the memory itself stays mapped and valid.
//!
//! A [NodeGroup] is the unit moved through the global queues. Its payload
//! (a batch of nodes plus an age ticket) is stored as relaxed atomics so that
//! the queue's pop can take a racy snapshot of a candidate's payload before
//! attempting to claim it. The snapshot is discarded if the claim fails;
//! ordering is provided entirely by the queue's acquire/release edges, never
//! by the payload fields themselves.

use std::{
    alloc::{self, handle_alloc_error, Layout},
    mem::MaybeUninit,
    ptr::{self, addr_of_mut},
    sync::atomic::Ordering,
};

use crate::loom_testing::*;

/// One pool slot: caller-visible storage plus an intrusive link.
///
/// `repr(C)` with `value` first, so a pointer to the value and a pointer to
/// the node are interconvertible by a plain cast. The link is only meaningful
/// while the node sits on a free or retired list, and is only ever written by
/// the single thread (or single queue-op winner) that privately owns the list.
#[repr(C)]
pub struct Node<T> {
    /// Never dropped by the pool; callers drop contents in place if needed.
    pub(crate) value: MaybeUninit<T>,
    pub(crate) next: *mut Node<T>,
}

impl<T> Node<T> {
    /// Recover the owning node from a caller-facing value pointer.
    ///
    /// safety: `value` must point at the `value` field of a live `Node<T>`
    /// handed out by this pool. Guaranteed by layout: `value` is the first
    /// field of a `repr(C)` struct.
    #[inline]
    pub(crate) unsafe fn from_value_ptr(value: *mut T) -> *mut Node<T> {
        value as *mut Node<T>
    }

    /// Caller-facing pointer for a node.
    #[inline]
    pub(crate) fn value_ptr(node: *mut Node<T>) -> *mut T {
        node as *mut T
    }
}

/// Thread-private singly-linked list of nodes. The allocation fast path.
///
/// No synchronization anywhere in here. Exactly one thread owns any given
/// list at any instant: either as part of its per-thread pool state, or
/// because it privately owns the [NodeGroup] the list was taken out of.
/// Keeping a tail pointer makes whole-list splicing O(1).
pub struct FreeList<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    len: usize,
}

impl<T> FreeList<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// safety: `node` must be live, exclusively owned by the caller,
    /// and not currently on any list.
    #[inline]
    pub(crate) unsafe fn push(&mut self, node: *mut Node<T>) {
        (*node).next = self.head;
        self.head = node;
        if self.tail.is_null() {
            self.tail = node;
        }
        self.len += 1;
    }

    /// Unlink and return the most recently pushed node.
    ///
    /// Precondition: the list is non-empty. Popping an empty list is a
    /// contract violation, not a runtime condition.
    #[inline]
    pub(crate) unsafe fn pop(&mut self) -> *mut Node<T> {
        debug_assert!(!self.is_empty(), "FreeList::pop on an empty list");
        let node = self.head;
        self.head = (*node).next;
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        (*node).next = ptr::null_mut();
        self.len -= 1;
        node
    }

    /// Splice this entire list onto `dst` in O(1), leaving `self` empty.
    ///
    /// safety: both lists must be privately owned by the caller.
    pub(crate) unsafe fn splice_into(&mut self, dst: &mut FreeList<T>) {
        if self.is_empty() {
            return;
        }
        if dst.is_empty() {
            dst.head = self.head;
            dst.tail = self.tail;
        } else {
            (*dst.tail).next = self.head;
            dst.tail = self.tail;
        }
        dst.len += self.len;
        self.head = ptr::null_mut();
        self.tail = ptr::null_mut();
        self.len = 0;
    }

    /// safety: list must be stable for the duration of the walk
    /// (privately owned, or all threads quiesced).
    pub(crate) unsafe fn for_each(&self, mut f: impl FnMut(*mut Node<T>)) {
        let mut cur = self.head;
        while !cur.is_null() {
            f(cur);
            cur = (*cur).next;
        }
    }
}

/// Racy image of a group's payload, taken before trying to claim the group.
pub(crate) struct PayloadSnapshot<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    len: usize,
    pub(crate) age: u64,
}

// not derived: a snapshot of pointers is Copy no matter what T is
impl<T> Clone for PayloadSnapshot<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for PayloadSnapshot<T> {}

/// A batch of nodes moved as a unit through the global queues.
///
/// Always in exactly one of the three global queues of its pool, or
/// privately owned by an allocation/flush/sweep operation in flight.
pub struct NodeGroup<T> {
    /// Queue linkage. Points at the owning queue's sentinel when this group
    /// is the last element of that queue.
    pub(crate) next: AtomicPtr<NodeGroup<T>>,
    /// Retirement ticket. Meaningful only while queued in a pool's
    /// to-be-reclaimed queue.
    age: AtomicU64,
    // payload: a FreeList flattened into relaxed atomics, see module docs
    nodes_head: AtomicPtr<Node<T>>,
    nodes_tail: AtomicPtr<Node<T>>,
    nodes_len: AtomicUsize,
}

impl<T> NodeGroup<T> {
    /// Initialize a group shell in place.
    ///
    /// safety: `this` must point at suitably sized and aligned memory.
    /// All fields are written, none are read.
    pub(crate) unsafe fn init(this: *mut Self) {
        ptr::write(addr_of_mut!((*this).next), AtomicPtr::new(ptr::null_mut()));
        ptr::write(addr_of_mut!((*this).age), AtomicU64::new(0));
        ptr::write(
            addr_of_mut!((*this).nodes_head),
            AtomicPtr::new(ptr::null_mut()),
        );
        ptr::write(
            addr_of_mut!((*this).nodes_tail),
            AtomicPtr::new(ptr::null_mut()),
        );
        ptr::write(addr_of_mut!((*this).nodes_len), AtomicUsize::new(0));
    }

    /// Move `list` into this group's payload, leaving `list` empty.
    ///
    /// safety: the group must be privately owned (not visible in any queue).
    // order: all relaxed. Publication happens-before is established by the
    // release CAS that later links the group into a queue.
    pub(crate) unsafe fn store_nodes(this: *mut Self, list: &mut FreeList<T>) {
        (*this).nodes_head.store(list.head, Ordering::Relaxed);
        (*this).nodes_tail.store(list.tail, Ordering::Relaxed);
        (*this).nodes_len.store(list.len, Ordering::Relaxed);
        list.head = ptr::null_mut();
        list.tail = ptr::null_mut();
        list.len = 0;
    }

    /// Take this group's payload as a private list, leaving the payload empty.
    ///
    /// safety: the group must be privately owned, i.e. it was just returned
    /// by a queue pop or has not been pushed yet.
    pub(crate) unsafe fn take_nodes(this: *mut Self) -> FreeList<T> {
        let list = FreeList {
            head: (*this).nodes_head.swap(ptr::null_mut(), Ordering::Relaxed),
            tail: (*this).nodes_tail.swap(ptr::null_mut(), Ordering::Relaxed),
            len: (*this).nodes_len.swap(0, Ordering::Relaxed),
        };
        list
    }

    /// safety: the group must be privately owned.
    pub(crate) unsafe fn set_age(this: *mut Self, age: u64) {
        (*this).age.store(age, Ordering::Relaxed);
    }

    /// Racy payload read. The caller must treat the result as garbage unless
    /// it subsequently wins the CAS that makes it the group's private owner.
    pub(crate) unsafe fn snapshot_payload(this: *mut Self) -> PayloadSnapshot<T> {
        PayloadSnapshot {
            head: (*this).nodes_head.load(Ordering::Relaxed),
            tail: (*this).nodes_tail.load(Ordering::Relaxed),
            len: (*this).nodes_len.load(Ordering::Relaxed),
            age: (*this).age.load(Ordering::Relaxed),
        }
    }

    /// safety: the group must be privately owned.
    pub(crate) unsafe fn write_payload(this: *mut Self, snap: PayloadSnapshot<T>) {
        (*this).nodes_head.store(snap.head, Ordering::Relaxed);
        (*this).nodes_tail.store(snap.tail, Ordering::Relaxed);
        (*this).nodes_len.store(snap.len, Ordering::Relaxed);
        (*this).age.store(snap.age, Ordering::Relaxed);
    }

    /// Walk the payload node list. Quiesced/private use only.
    ///
    /// safety: no thread may be mutating this group concurrently.
    pub(crate) unsafe fn debug_for_each_node(this: *mut Self, mut f: impl FnMut(*mut Node<T>)) {
        let mut count = 0usize;
        let mut cur = (*this).nodes_head.load(Ordering::Relaxed);
        while !cur.is_null() {
            f(cur);
            count += 1;
            cur = (*cur).next;
        }
        assert_eq!(
            count,
            (*this).nodes_len.load(Ordering::Relaxed),
            "group payload length does not match its node chain"
        );
    }
}

/// Header at the base of every raw allocation made by a pool.
#[repr(C)]
struct BlockHdr {
    next: *mut BlockHdr,
    layout: Layout,
    nodes: usize,
}

/// Chain of raw blocks obtained from the system allocator.
///
/// One block = header + one [NodeGroup] shell + `n` nodes (`n == 0` for the
/// bare shells used as sentinels, dummies, and empty-queue stock). Blocks are
/// pushed with a CAS and only ever freed all at once when the chain drops,
/// which is what gives nodes and groups their pool-long lifetime.
pub(crate) struct BlockChain {
    head: AtomicPtr<BlockHdr>,
}

impl BlockChain {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn layout_for<T>(nodes: usize) -> (Layout, usize, usize) {
        let hdr = Layout::new::<BlockHdr>();
        let (with_group, group_off) = hdr.extend(Layout::new::<NodeGroup<T>>()).unwrap();
        let (full, nodes_off) = with_group
            .extend(Layout::array::<Node<T>>(nodes).unwrap())
            .unwrap();
        (full.pad_to_align(), group_off, nodes_off)
    }

    /// Carve a fresh block: one group shell plus `nodes` linked nodes.
    ///
    /// The returned group's payload is empty; the nodes come back as a
    /// private list so the caller decides where they go. Aborts via
    /// [handle_alloc_error] if the system allocator fails; this is the only
    /// non-lock-free path in the crate.
    pub(crate) fn carve<T>(&self, nodes: usize) -> (*mut NodeGroup<T>, FreeList<T>) {
        let (layout, group_off, nodes_off) = Self::layout_for::<T>(nodes);
        unsafe {
            let base = alloc::alloc_zeroed(layout);
            if base.is_null() {
                handle_alloc_error(layout);
            }

            let hdr = base as *mut BlockHdr;
            (*hdr).layout = layout;
            (*hdr).nodes = nodes;

            let group = base.add(group_off) as *mut NodeGroup<T>;
            NodeGroup::init(group);

            let mut list = FreeList::new();
            let first = base.add(nodes_off) as *mut Node<T>;
            for i in 0..nodes {
                list.push(first.add(i));
            }

            // order: release so that a thread walking the chain after an
            // acquire load of `head` sees fully initialized blocks
            let mut old_head = self.head.load(Ordering::Relaxed);
            loop {
                (*hdr).next = old_head;
                match self.head.compare_exchange_weak(
                    old_head,
                    hdr,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(x) => old_head = x,
                }
            }

            (group, list)
        }
    }

    /// Visit every node ever carved from this chain.
    ///
    /// safety: all blocks in the chain must have been carved with the same
    /// `T`, and no thread may be carving concurrently.
    pub(crate) unsafe fn for_each_node<T>(&self, mut f: impl FnMut(*mut Node<T>)) {
        let mut hdr = self.head.load(Ordering::Acquire);
        while !hdr.is_null() {
            let nodes = (*hdr).nodes;
            let (_, _, nodes_off) = Self::layout_for::<T>(nodes);
            let first = (hdr as *mut u8).add(nodes_off) as *mut Node<T>;
            for i in 0..nodes {
                f(first.add(i));
            }
            hdr = (*hdr).next;
        }
    }
}

impl Drop for BlockChain {
    fn drop(&mut self) {
        // by the time the chain drops, the owning pool is going away and
        // every node is either idle or abandoned by its holder
        let mut hdr = self.head.load(Ordering::Acquire);
        while !hdr.is_null() {
            unsafe {
                let next = (*hdr).next;
                let layout = (*hdr).layout;
                alloc::dealloc(hdr as *mut u8, layout);
                hdr = next;
            }
        }
    }
}

#[cfg(test)]
mod tests;
