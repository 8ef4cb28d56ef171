//! Ticket-based quiescent-state reclamation coordinator.
//!
//! Every participating thread cycles through
//! **detached -> attached(asleep) -> attached(awake) -> attached(asleep) -> detached**,
//! and the awake/sleep boundary is the only quiescence point. The rules:
//!
//! - a thread may touch pools only while it holds an [AwakeGuard]
//! - a pointer read out of a *shared* structure built on a pool must not be
//!   retained across the reader's own sleep transition. Nodes the thread has
//!   allocated and not yet freed are owned, not borrowed, and may be held
//!   across sleeps indefinitely.
//!
//! The global ticket counter increments at every transition. An awake
//! thread's slot holds the ticket from its awake (or, briefly, from the sleep
//! in progress); an asleep thread's slot holds [TICKET_ASLEEP]. The smallest
//! ticket among *other* awake threads lower-bounds the grace horizon: a
//! retired batch tagged with a ticket strictly below that minimum predates
//! every live thread's last quiescence point, so no live thread can still
//! hold a pointer into it, and the batch may be handed back out.
//!
//! A freshly awakened thread is deliberately not a hazard for batches retired
//! before its awake: retirement happens only after a node is unlinked from
//! whatever shared structure it lived in, so a new reader has no path to it.
//! Only threads that were already awake when the node was unlinked matter,
//! and their slots hold tickets older than the retirement ticket.
//!
//! The state machine is enforced by borrows instead of runtime checks
//! wherever possible: `awake` takes `&mut self` on the shard, so the shard
//! cannot detach or re-awake until the guard drops, and the guard's drop *is*
//! the sleep transition.

use std::cell::Cell;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use tracing::Level;

use crate::loom_testing::*;

/// Absolute maximum number of concurrently attached threads.
///
/// Not dynamic: the coordinator and every pool store per-thread data in
/// fixed arrays so that thread slots can be reached without indirection or
/// reallocation. Bounded by the `thread_inuse` bitfield width.
#[cfg(not(loom))]
pub const MAX_THREADS: usize = 64;
/// Shrunk under loom; scanning 64 tracked slots per sleep makes the model
/// checker's state space explode.
#[cfg(loom)]
pub const MAX_THREADS: usize = 4;
const _: () = assert!(MAX_THREADS <= 64);

/// Slot value for a thread that is attached but asleep. Asleep threads are
/// invisible to the minimum-ticket computation; they hold no pool references.
pub(crate) const TICKET_ASLEEP: u64 = u64::MAX;

/// Implemented by pools so the coordinator can drive reclamation at each
/// sleep transition without knowing element types.
pub(crate) trait Reclaim: Send + Sync {
    /// Bundle the thread's retired nodes (if any) into a group tagged with
    /// `ticket` and publish it for reclamation.
    ///
    /// safety: `tid` must be the calling thread's own id.
    unsafe fn flush_retired(&self, tid: usize, ticket: u64);

    /// Move every published batch tagged strictly below `min_ticket` back
    /// into allocation circulation.
    fn sweep(&self, min_ticket: u64);
}

/// Coordinator root: the ticket counter, the per-thread slots, the thread-id
/// bitfield, and the registry of pools to sweep.
pub struct GcRoot {
    /// Monotonic 64-bit transition counter. Wraparound is not handled; at any
    /// realistic transition rate it cannot occur within a process lifetime.
    pub(crate) ticket: AtomicU64,
    /// Bitfield, where a `1` in position `n` means thread id `n` is handed
    /// out (or, all-ones, that the global lock is held).
    pub(crate) thread_inuse: AtomicU64,
    /// One ticket slot per thread id, padded so sleeping neighbors do not
    /// false-share.
    pub(crate) slots: [CachePadded<AtomicU64>; MAX_THREADS],
    pools: Mutex<Vec<Weak<dyn Reclaim>>>,
}

impl GcRoot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ticket: AtomicU64::new(0),
            thread_inuse: AtomicU64::new(0),
            slots: std::array::from_fn(|_| CachePadded::new(AtomicU64::new(TICKET_ASLEEP))),
            pools: Mutex::new(Vec::new()),
        })
    }

    /// Attach the calling thread, allocating a thread id.
    ///
    /// Panics if all [MAX_THREADS] ids are taken or a global lock exists;
    /// use [try_attach](Self::try_attach) to surface that instead.
    pub fn attach(self: &Arc<Self>) -> GcThreadShard {
        self.try_attach()
            .expect("No more thread ids, or global lock acquired!")
    }

    /// Attach the calling thread, or `None` if the id space is exhausted
    /// (more concurrent threads than provisioned; a configuration error)
    /// or a global lock is held.
    pub fn try_attach(self: &Arc<Self>) -> Option<GcThreadShard> {
        let tid;
        // order: need to synchronize-with only the thread that cleared the
        // bit we are about to claim, so that its last plain writes to the
        // per-thread state (here and in every pool) are visible to us.
        // successful attaches by other threads in the meantime form part of
        // the release sequence
        let mut old_inuse = self.thread_inuse.load(Ordering::Relaxed);
        loop {
            let next_tid = old_inuse.trailing_ones();
            if next_tid as usize >= MAX_THREADS {
                return None;
            }
            let new_inuse = old_inuse | (1 << next_tid);
            match self.thread_inuse.compare_exchange_weak(
                old_inuse,
                new_inuse,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    tid = next_tid as usize;
                    break;
                }
                Err(x) => old_inuse = x,
            }
        }

        debug_assert_eq!(self.slots[tid].load(Ordering::Relaxed), TICKET_ASLEEP);
        tracing::event!(Level::TRACE, tid = tid as u64, "gc::attach");
        Some(GcThreadShard {
            root: Arc::clone(self),
            tid,
            _not_sync: PhantomData,
        })
    }

    /// Try to take exclusive ownership of everything: succeeds only when no
    /// thread is attached, and keeps attach failing until the guard drops.
    /// The precondition witness for whole-pool audits and teardown checks.
    pub fn try_lock_global(&self) -> Option<GcGlobalGuard<'_>> {
        // order: need to synchronize-with the last detaching thread, after
        // which all per-thread data is stable and readable
        match self
            .thread_inuse
            .compare_exchange(0, u64::MAX, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(GcGlobalGuard(self, PhantomData)),
            Err(_) => None,
        }
    }

    pub(crate) fn register_pool(&self, pool: Weak<dyn Reclaim>) {
        self.pools.lock().push(pool);
    }

    /// Smallest ticket among awake threads other than `tid`, or `u64::MAX`
    /// when no other thread is awake.
    fn min_awake_ticket_excluding(&self, tid: usize) -> u64 {
        let mut min = u64::MAX;
        for (i, slot) in self.slots.iter().enumerate() {
            if i == tid {
                continue;
            }
            // order: SeqCst pairs with the SeqCst slot stores in awake/sleep;
            // the min must not be computed from a slot value older than the
            // ticket increment it accompanied
            let v = slot.load(Ordering::SeqCst);
            if v != TICKET_ASLEEP && v < min {
                min = v;
            }
        }
        min
    }
}

impl Debug for GcRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcRoot")
            .field("@addr", &(self as *const _))
            .field("ticket", &self.ticket.load(Ordering::Relaxed))
            .field("thread_inuse", &self.thread_inuse.load(Ordering::Relaxed))
            .finish()
    }
}

/// One thread's handle on the coordinator: attached, currently asleep.
///
/// `Send` but not `Sync`; an asleep shard may migrate between OS threads,
/// but only one thread can use it at a time, which is what makes the
/// per-thread state in the pools safe to reach without atomics.
pub struct GcThreadShard {
    root: Arc<GcRoot>,
    tid: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl GcThreadShard {
    pub fn tid(&self) -> usize {
        self.tid
    }

    pub fn root(&self) -> &Arc<GcRoot> {
        &self.root
    }

    /// Transition to awake. The returned guard is the license to touch
    /// pools; dropping it is the sleep transition.
    ///
    /// Takes `&mut self` so the shard can neither re-awake nor detach while
    /// the guard lives.
    pub fn awake(&mut self) -> AwakeGuard<'_> {
        // order: the slot store must not become visible before the ticket
        // increment it records, and must be visible before any subsequent
        // pool access; SeqCst on both sides keeps the min-ticket scan and
        // the transitions in a single total order
        let t = self.root.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        self.root.slots[self.tid].store(t, Ordering::SeqCst);
        tracing::event!(Level::TRACE, tid = self.tid as u64, ticket = t, "gc::awake");
        AwakeGuard { shard: self }
    }
}

impl Drop for GcThreadShard {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.root.slots[self.tid].load(Ordering::Relaxed),
            TICKET_ASLEEP,
            "detaching a shard that is not asleep"
        );
        tracing::event!(Level::TRACE, tid = self.tid as u64, "gc::detach");
        let mask = !(1u64 << self.tid);
        // order: need all manipulation of thread-owned data to stick before
        // the id can be claimed again
        self.root.thread_inuse.fetch_and(mask, Ordering::Release);
    }
}

/// License to touch pools, held by an awake thread. Dropping it performs the
/// sleep transition: publish this thread's retired nodes, then sweep every
/// registered pool against the minimum live ticket.
///
/// Not `Send`: the guard must sleep on the thread that woke it.
#[must_use]
pub struct AwakeGuard<'shard> {
    shard: &'shard GcThreadShard,
}

impl<'shard> AwakeGuard<'shard> {
    pub fn tid(&self) -> usize {
        self.shard.tid
    }

    pub(crate) fn root(&self) -> &GcRoot {
        &self.shard.root
    }
}

impl<'shard> Drop for AwakeGuard<'shard> {
    fn drop(&mut self) {
        let root = &self.shard.root;
        let tid = self.shard.tid;

        let trace_span = tracing::span!(Level::TRACE, "gc::sleep", tid = tid as u64);
        let _span_enter = trace_span.enter();

        // retirement ticket: everything this thread frees from here on is
        // attributed to this transition
        let ticket = root.ticket.fetch_add(1, Ordering::SeqCst) + 1;
        root.slots[tid].store(ticket, Ordering::SeqCst);

        let min_ticket = root.min_awake_ticket_excluding(tid);

        // snapshot the registry outside of pool work; dead pools fall out here
        let pools: Vec<Arc<dyn Reclaim>> = {
            let mut reg = root.pools.lock();
            reg.retain(|w| w.strong_count() > 0);
            reg.iter().filter_map(|w| w.upgrade()).collect()
        };

        tracing::event!(
            Level::TRACE,
            ticket,
            min_ticket,
            pools = pools.len() as u64
        );

        for pool in pools {
            // safety: tid is our own id, and we still count as awake
            unsafe { pool.flush_retired(tid, ticket) };
            pool.sweep(min_ticket);
        }

        // only now does this thread stop holding the grace horizon down
        root.slots[tid].store(TICKET_ASLEEP, Ordering::SeqCst);
    }
}

/// Exclusive lock over the whole coordinator, excluding all threads.
///
/// The only way to get one is [GcRoot::try_lock_global]. Whole-pool
/// validation is only implemented against this object.
pub struct GcGlobalGuard<'root>(
    pub(crate) &'root GcRoot,
    /// prevent this type from being `Sync`
    PhantomData<Cell<()>>,
);

impl<'root> Drop for GcGlobalGuard<'root> {
    fn drop(&mut self) {
        // order: hand everything we looked at back before ids can be claimed
        self.0.thread_inuse.store(0, Ordering::Release);
    }
}

impl<'root> Debug for GcGlobalGuard<'root> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GcGlobalGuard").field(&self.0).finish()
    }
}

#[cfg(test)]
mod tests;
