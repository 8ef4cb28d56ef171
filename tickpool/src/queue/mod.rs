//! Lock-free MPMC queue of [NodeGroup]s, Michael & Scott style,
//! with an instance-private sentinel and a recyclable dummy.
//!
//! Differences from the textbook algorithm, both load-bearing:
//!
//! - **Sentinel instead of null.** The end-of-list marker is a group owned by
//!   this queue instance and never shared with any other queue. A group that
//!   gets popped here, recycled, and pushed onto a *different* queue has its
//!   `next` rewritten to that queue's sentinel; a thread still holding a stale
//!   pointer to the group will then fail its `next` CAS here, because the
//!   expected value is *our* sentinel. Sharing one sentinel between queues
//!   would make those stale CASes succeed and cross-link the queues.
//!
//! - **The retired dummy is recycled.** `head` always points at a consumed
//!   dummy; the first real element is `head.next`. A successful pop swings
//!   `head` forward, copies the new head's payload into the old head, and
//!   returns the old head. The new head stays in the queue as the active
//!   dummy; its payload is stale from that point on and is never read again
//!   until the group is retired in turn. Payload fields are relaxed atomics
//!   so the pre-CAS snapshot is a read of defined values, not a data race
//!   (see [crate::node]).
//!
//! Remaining ABA window: `compare_exchange(head, h, next)` could succeed
//! wrongly if `h` were popped, cycled through the pool's other two queues,
//! and pushed back *here* as head while we were stalled. That cycle is closed
//! only by sleep transitions sweeping groups from the to-be-reclaimed queue,
//! and a sweep cannot move a group tagged after our awake ticket while we are
//! still awake. Queue operations only happen while awake, so the cycle cannot
//! complete under us. The queue is correct only inside that discipline; it is
//! not a general-purpose MPMC queue.

use std::sync::atomic::Ordering;

use crate::loom_testing::*;
use crate::node::NodeGroup;

pub struct GroupQueue<T> {
    head: AtomicPtr<NodeGroup<T>>,
    tail: AtomicPtr<NodeGroup<T>>,
    /// This queue's end-of-list marker. Never enqueued, never returned,
    /// never shared with another queue.
    sentinel: *mut NodeGroup<T>,
}

// safety: the raw pointers are only dereferenced under the queue protocol,
// and the groups they point at live as long as the owning pool's block chain
unsafe impl<T: Send> Send for GroupQueue<T> {}
unsafe impl<T: Send> Sync for GroupQueue<T> {}

impl<T> GroupQueue<T> {
    /// Build a queue around a fresh sentinel and a fresh initial dummy.
    ///
    /// safety: both groups must be newly carved shells with empty payloads,
    /// exclusively owned by the caller, and must outlive the queue.
    pub(crate) unsafe fn new(
        sentinel: *mut NodeGroup<T>,
        dummy: *mut NodeGroup<T>,
    ) -> Self {
        // the sentinel's next points at itself; an empty queue is
        // head == tail, head.next == sentinel
        (*sentinel).next.store(sentinel, Ordering::Relaxed);
        (*dummy).next.store(sentinel, Ordering::Relaxed);
        Self {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            sentinel,
        }
    }

    /// Append a group at the tail.
    ///
    /// safety: `group` must be exclusively owned by the caller, with its
    /// payload already stored, and must not currently be in any queue.
    pub(crate) unsafe fn push(&self, group: *mut NodeGroup<T>) {
        // private store; published by the release CAS below
        (*group).next.store(self.sentinel, Ordering::Relaxed);

        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = (*tail).next.load(Ordering::Acquire);
            if tail != self.tail.load(Ordering::Relaxed) {
                // stale snapshot, tail moved under us
                backoff.spin();
                continue;
            }
            if next != self.sentinel {
                // another push is mid-flight; help swing tail toward it.
                // order: release so the helped linkage is visible to whoever
                // reads tail after us
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                backoff.spin();
                continue;
            }
            // order: release publishes the group's payload (relaxed stores)
            // to any popper that acquire-loads this next pointer.
            // a recycled `tail` that now belongs to another queue makes this
            // CAS fail, because its next holds that queue's sentinel, not ours
            if (*tail)
                .next
                .compare_exchange_weak(self.sentinel, group, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                // best effort; a stalled tail is repaired by the next
                // push or pop that notices the lag
                let _ = self
                    .tail
                    .compare_exchange(tail, group, Ordering::Release, Ordering::Relaxed);
                return;
            }
            backoff.spin();
        }
    }

    /// Detach and return a group, or `None` if the queue is empty.
    ///
    /// The group handed back is the retired dummy carrying the payload of
    /// the element that was logically dequeued. The caller becomes its
    /// exclusive owner.
    pub(crate) fn pop(&self) -> Option<*mut NodeGroup<T>> {
        self.pop_impl(None)
    }

    /// Like [pop](Self::pop), but only dequeues if the front element's age
    /// tag is strictly less than `age`. Returns `None` without retrying when
    /// the front is too young; ages do not change while a group is queued,
    /// so retrying could not help.
    pub(crate) fn pop_if_older_than(&self, age: u64) -> Option<*mut NodeGroup<T>> {
        self.pop_impl(Some(age))
    }

    fn pop_impl(&self, age_limit: Option<u64>) -> Option<*mut NodeGroup<T>> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            // safety: head is never freed while the pool lives, even if it
            // has been retired and recycled since we loaded it
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if head != self.head.load(Ordering::Relaxed) {
                // stale snapshot; next may belong to a recycled group
                backoff.spin();
                continue;
            }
            if head == tail {
                if next == self.sentinel {
                    return None;
                }
                // tail is lagging behind a mid-flight push; help it along
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                backoff.spin();
                continue;
            }
            if next == self.sentinel {
                // head advanced between our loads
                backoff.spin();
                continue;
            }

            // candidate payload, snapshotted *before* the claim. if we lose
            // the CAS the snapshot is garbage and gets dropped on the floor.
            // order (claim succeeded): the next popper's overwrite of this
            // payload is sequenced after its acquire of our release CAS on
            // head, so our relaxed reads here cannot observe it
            let snap = unsafe { NodeGroup::snapshot_payload(next) };
            if let Some(limit) = age_limit {
                if snap.age >= limit {
                    return None;
                }
            }

            // order: release so the payload transfer below, plus everything
            // we did to the nodes we previously owned, happens-before the
            // next winner's use of `next` as its payload carrier
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    // we own the retired dummy and the new head's payload;
                    // the new head keeps a stale copy that nobody reads
                    unsafe { NodeGroup::write_payload(head, snap) };
                    return Some(head);
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Walk every group currently in the queue, flagging the consumed dummy
    /// (whose payload is stale and must be ignored).
    ///
    /// safety: all threads must be quiesced, e.g. under the gc global lock.
    pub(crate) unsafe fn debug_for_each_group(
        &self,
        mut f: impl FnMut(*mut NodeGroup<T>, bool),
    ) {
        let head = self.head.load(Ordering::Acquire);
        let mut cur = head;
        while cur != self.sentinel {
            f(cur, cur == head);
            cur = (*cur).next.load(Ordering::Acquire);
        }
    }
}

impl<T> std::fmt::Debug for GroupQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupQueue")
            .field("@addr", &(self as *const _))
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("sentinel", &self.sentinel)
            .finish()
    }
}
