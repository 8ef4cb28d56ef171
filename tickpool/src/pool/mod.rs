//! The pool facade: per-thread fast paths bound to three global queues.
//!
//! ```text
//!             alloc fast path            alloc slow path
//!   thread ---> local free list <==splice== [ free ] <--- sweep moves
//!     |                                        ^           aged groups
//!     | dealloc                                |
//!     v                              [ to_be_reclaimed ]
//!   local retired list ==bundle at sleep==^
//!     (shells for bundles come from [ empty ]; emptied shells go back)
//! ```
//!
//! Allocation pops the thread's private free list with no atomics at all.
//! On exhaustion it pops a whole [NodeGroup] from the `free` queue, splices
//! the batch into the private list, and parks the emptied shell on the
//! `empty` queue. Only when the `free` queue is also dry does the pool touch
//! the system allocator, carving a brand-new block at group granularity.
//!
//! Deallocation is a push onto the thread's private retired list. Nothing
//! global happens until the thread's next sleep transition, when the
//! coordinator calls back into [Reclaim]: the retired list is bundled into a
//! shell tagged with the retirement ticket and pushed onto `to_be_reclaimed`,
//! then every group whose tag predates the minimum live ticket is moved to
//! `free`, closing the cycle.

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use rustc_hash::FxHashSet;
use tracing::Level;

use crate::gc::{AwakeGuard, GcGlobalGuard, GcRoot, Reclaim, MAX_THREADS};
use crate::loom_testing::*;
use crate::node::{BlockChain, FreeList, Node, NodeGroup};
use crate::queue::GroupQueue;
use crate::util::UsizePtr;

/// Pool sizing, applied at construction.
#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    nodes_per_group: usize,
    initial_groups: usize,
}

impl PoolOptions {
    pub fn new() -> Self {
        Self {
            nodes_per_group: 32,
            initial_groups: 4,
        }
    }

    /// Group granularity: how many nodes travel together through the global
    /// queues, and how many a slow-path carve produces. Larger groups
    /// amortize more atomic traffic per splice.
    pub fn nodes_per_group(mut self, n: usize) -> Self {
        assert!(n >= 1, "a group must carry at least one node");
        self.nodes_per_group = n;
        self
    }

    /// How many full groups (and matching empty shells) to pre-populate the
    /// queues with, before any thread has allocated.
    pub fn initial_groups(mut self, n: usize) -> Self {
        self.initial_groups = n;
        self
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread pool state. Reached through `UnsafeCell` because the thread id
/// in an [AwakeGuard] is exclusively owned, which makes the access unique
/// without any locking.
struct PoolLocal<T> {
    free: FreeList<T>,
    retired: FreeList<T>,
}

impl<T> PoolLocal<T> {
    const fn new() -> Self {
        Self {
            free: FreeList::new(),
            retired: FreeList::new(),
        }
    }
}

/// A concurrent pool of `T` slots with ticket-based deferred reclamation.
///
/// Created with [MemoryPool::new], shared as an `Arc`, torn down by dropping
/// the last `Arc` (valid only once no allocation is outstanding and every
/// attached thread is asleep with nothing retired; audited in debug via
/// [_debug_check_missing_nodes](Self::_debug_check_missing_nodes)).
///
/// The pool never drops `T` values. A slot's contents are whatever the
/// caller last wrote there; callers needing `Drop` run it in place before
/// deallocating.
pub struct MemoryPool<T: Send + 'static> {
    root: Arc<GcRoot>,
    nodes_per_group: usize,
    free: GroupQueue<T>,
    empty: GroupQueue<T>,
    to_be_reclaimed: GroupQueue<T>,
    locals: [CachePadded<UnsafeCell<PoolLocal<T>>>; MAX_THREADS],
    blocks: BlockChain,
    /// Slow-path trips to the system allocator since construction
    /// (pre-population is not counted).
    system_allocs: AtomicU64,
}

// safety: locals are only reached through an AwakeGuard's unique tid, queues
// and counters are atomic, and nodes only ever belong to one place at a time
unsafe impl<T: Send + 'static> Send for MemoryPool<T> {}
unsafe impl<T: Send + 'static> Sync for MemoryPool<T> {}

impl<T: Send + 'static> MemoryPool<T> {
    /// Build a pool, pre-populate its queues, and register it with the
    /// coordinator for sweeping at every sleep transition.
    pub fn new(root: &Arc<GcRoot>, opts: PoolOptions) -> Arc<Self> {
        let blocks = BlockChain::new();

        // each queue gets its own private sentinel and its own initial dummy;
        // sharing any of these shells between queues is what reopens the
        // cross-queue ABA hole
        let (free_sentinel, _) = blocks.carve::<T>(0);
        let (free_dummy, _) = blocks.carve::<T>(0);
        let (empty_sentinel, _) = blocks.carve::<T>(0);
        let (empty_dummy, _) = blocks.carve::<T>(0);
        let (reclaim_sentinel, _) = blocks.carve::<T>(0);
        let (reclaim_dummy, _) = blocks.carve::<T>(0);

        let pool = unsafe {
            Self {
                root: Arc::clone(root),
                nodes_per_group: opts.nodes_per_group,
                free: GroupQueue::new(free_sentinel, free_dummy),
                empty: GroupQueue::new(empty_sentinel, empty_dummy),
                to_be_reclaimed: GroupQueue::new(reclaim_sentinel, reclaim_dummy),
                locals: std::array::from_fn(|_| CachePadded::new(UnsafeCell::new(PoolLocal::new()))),
                blocks,
                system_allocs: AtomicU64::new(0),
            }
        };

        for _ in 0..opts.initial_groups {
            let (group, mut nodes) = pool.blocks.carve::<T>(opts.nodes_per_group);
            unsafe {
                NodeGroup::store_nodes(group, &mut nodes);
                pool.free.push(group);
            }
            let (shell, _) = pool.blocks.carve::<T>(0);
            unsafe { pool.empty.push(shell) };
        }

        let pool = Arc::new(pool);
        let weak: Weak<MemoryPool<T>> = Arc::downgrade(&pool);
        root.register_pool(weak);
        pool
    }

    #[inline]
    fn local(&self, tid: usize) -> *mut PoolLocal<T> {
        self.locals[tid].get()
    }

    /// Allocate one slot. The returned reference is exclusively owned by the
    /// caller until it is passed to [dealloc](Self::dealloc); its contents
    /// are whatever the slot held last (zeroed on first use).
    ///
    /// The guard must come from the same [GcRoot] this pool was built on.
    pub fn alloc(&self, guard: &AwakeGuard<'_>) -> &mut MaybeUninit<T> {
        debug_assert!(
            ptr::eq(guard.root(), &*self.root),
            "guard comes from a different GcRoot than this pool"
        );
        let tid = guard.tid();
        // safety: tid is exclusively owned by the guard holder
        let local = unsafe { &mut *self.local(tid) };

        let node = if !local.free.is_empty() {
            // fast path, no atomics
            unsafe { local.free.pop() }
        } else {
            unsafe { self.alloc_slow(tid, local) }
        };

        // safety: node is exclusively ours now; the value slot is valid
        // (possibly uninitialized) storage for a T
        unsafe { &mut *(Node::value_ptr(node) as *mut MaybeUninit<T>) }
    }

    /// Refill the thread's private list from the global queues, falling back
    /// to the system allocator when the whole pool is dry.
    ///
    /// safety: `local` must be tid's own state.
    unsafe fn alloc_slow(&self, tid: usize, local: &mut PoolLocal<T>) -> *mut Node<T> {
        let trace_span = tracing::span!(Level::TRACE, "pool::alloc_slow", tid = tid as u64);
        let _span_enter = trace_span.enter();

        loop {
            if let Some(group) = self.free.pop() {
                let mut nodes = NodeGroup::take_nodes(group);
                tracing::event!(
                    Level::TRACE,
                    group = ?UsizePtr::from(group),
                    nodes = nodes.len() as u64,
                    "refill from free queue"
                );
                nodes.splice_into(&mut local.free);
                self.empty.push(group);
                if !local.free.is_empty() {
                    return local.free.pop();
                }
                continue;
            }

            // global free queue dry: the one non-lock-free path
            self.system_allocs.fetch_add(1, Ordering::Relaxed);
            let (group, mut nodes) = self.blocks.carve::<T>(self.nodes_per_group);
            tracing::event!(
                Level::TRACE,
                group = ?UsizePtr::from(group),
                nodes = nodes.len() as u64,
                "carved fresh block"
            );
            nodes.splice_into(&mut local.free);
            self.empty.push(group);
            return local.free.pop();
        }
    }

    /// Return a slot to the pool. Goes on the thread's private retired list;
    /// no other thread can receive this slot until the grace period for this
    /// thread's next sleep transition has elapsed.
    ///
    /// safety: `obj` must have come out of [alloc](Self::alloc) on this pool,
    /// must not have been deallocated since, and no reference to it may be
    /// used after this call. The guard must come from this pool's [GcRoot].
    pub unsafe fn dealloc(&self, guard: &AwakeGuard<'_>, obj: &T) {
        debug_assert!(
            ptr::eq(guard.root(), &*self.root),
            "guard comes from a different GcRoot than this pool"
        );
        let tid = guard.tid();
        tracing::event!(
            Level::TRACE,
            tid = tid as u64,
            ptr = ?UsizePtr::from(obj),
            "pool::dealloc"
        );
        let node = Node::from_value_ptr(obj as *const T as *mut T);
        let local = &mut *self.local(tid);
        local.retired.push(node);
    }

    /// Slow-path trips to the system allocator since construction.
    pub fn system_allocs(&self) -> u64 {
        self.system_allocs.load(Ordering::Relaxed)
    }

    pub fn nodes_per_group(&self) -> usize {
        self.nodes_per_group
    }

    /// Audit the whole pool with every thread excluded, returning the set of
    /// node addresses currently checked out to callers.
    ///
    /// Every node ever carved must be findable in exactly one place; a node
    /// on two lists at once panics. An empty result means every allocation
    /// has been returned and it is safe to drop the pool.
    pub fn _debug_check_missing_nodes(&self, guard: &GcGlobalGuard<'_>) -> FxHashSet<usize> {
        debug_assert!(
            ptr::eq(guard.0, &*self.root),
            "global guard comes from a different GcRoot than this pool"
        );

        let mut all_nodes = FxHashSet::default();
        unsafe {
            self.blocks.for_each_node::<T>(|n| {
                all_nodes.insert(n as usize);
            });
        }

        let mut idle_nodes = FxHashSet::default();
        unsafe {
            for queue in [&self.free, &self.empty, &self.to_be_reclaimed] {
                let mut groups = Vec::new();
                queue.debug_for_each_group(|group, is_dummy| {
                    // the consumed dummy's payload is a stale copy
                    if !is_dummy {
                        groups.push(group);
                    }
                });
                for group in groups {
                    NodeGroup::debug_for_each_node(group, |n| {
                        if !idle_nodes.insert(n as usize) {
                            panic!("node found in multiple free lists!");
                        }
                    });
                }
            }
            for tid in 0..MAX_THREADS {
                let local = &*self.local(tid);
                local.free.for_each(|n| {
                    if !idle_nodes.insert(n as usize) {
                        panic!("node found in multiple free lists!");
                    }
                });
                local.retired.for_each(|n| {
                    if !idle_nodes.insert(n as usize) {
                        panic!("node found in multiple free lists!");
                    }
                });
            }
        }

        for idle in &idle_nodes {
            assert!(
                all_nodes.contains(idle),
                "list references a node no block contains"
            );
        }
        all_nodes.retain(|addr| !idle_nodes.contains(addr));
        all_nodes
    }
}

impl<T: Send + 'static> Reclaim for MemoryPool<T> {
    unsafe fn flush_retired(&self, tid: usize, ticket: u64) {
        let local = &mut *self.local(tid);
        if local.retired.is_empty() {
            return;
        }

        let shell = match self.empty.pop() {
            Some(shell) => shell,
            None => {
                self.system_allocs.fetch_add(1, Ordering::Relaxed);
                let (shell, _) = self.blocks.carve::<T>(0);
                shell
            }
        };

        tracing::event!(
            Level::TRACE,
            tid = tid as u64,
            ticket,
            nodes = local.retired.len() as u64,
            shell = ?UsizePtr::from(shell),
            "pool::flush_retired"
        );

        NodeGroup::store_nodes(shell, &mut local.retired);
        NodeGroup::set_age(shell, ticket);
        self.to_be_reclaimed.push(shell);
    }

    fn sweep(&self, min_ticket: u64) {
        let mut moved = 0u64;
        while let Some(group) = self.to_be_reclaimed.pop_if_older_than(min_ticket) {
            // safety: the pop made us the exclusive owner
            unsafe { self.free.push(group) };
            moved += 1;
        }
        if moved > 0 {
            tracing::event!(Level::TRACE, min_ticket, moved, "pool::sweep");
        }
    }
}

impl<T: Send + 'static> Debug for MemoryPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("@addr", &(self as *const _))
            .field("nodes_per_group", &self.nodes_per_group)
            .field("free", &self.free)
            .field("empty", &self.empty)
            .field("to_be_reclaimed", &self.to_be_reclaimed)
            .field("system_allocs", &self.system_allocs.load(Ordering::Relaxed))
            .finish()
    }
}
