use std::sync::atomic::Ordering;

use super::*;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[test]
fn ensure_root_send_sync() {
    assert_send::<GcRoot>();
    assert_sync::<GcRoot>();
}

#[test]
fn ensure_shard_send() {
    assert_send::<GcThreadShard>();
}

#[cfg(not(loom))]
#[test]
fn attach_ids_allocate_lowest_and_reuse() {
    let root = GcRoot::new();

    let shard0 = root.attach();
    assert_eq!(shard0.tid(), 0);
    assert_eq!(root.thread_inuse.load(Ordering::SeqCst), 0b1);

    let shard1 = root.attach();
    assert_eq!(shard1.tid(), 1);
    assert_eq!(root.thread_inuse.load(Ordering::SeqCst), 0b11);

    // drop the lower one; its id comes back first
    drop(shard0);
    assert_eq!(root.thread_inuse.load(Ordering::SeqCst), 0b10);
    let shard0_again = root.attach();
    assert_eq!(shard0_again.tid(), 0);
    assert_eq!(root.thread_inuse.load(Ordering::SeqCst), 0b11);

    drop(shard0_again);
    drop(shard1);
    assert_eq!(root.thread_inuse.load(Ordering::SeqCst), 0);
}

#[cfg(not(loom))]
#[test]
fn try_attach_surfaces_id_exhaustion() {
    let root = GcRoot::new();
    let shards: Vec<_> = (0..MAX_THREADS).map(|_| root.attach()).collect();
    assert!(root.try_attach().is_none());
    drop(shards);
    assert!(root.try_attach().is_some());
}

#[cfg(not(loom))]
#[test]
fn global_lock_requires_quiescence() {
    let root = GcRoot::new();
    let shard0 = root.attach();
    let shard1 = root.attach();

    assert!(root.try_lock_global().is_none());
    drop(shard0);
    assert!(root.try_lock_global().is_none());
    drop(shard1);

    let global = root.try_lock_global().unwrap();
    assert_eq!(root.thread_inuse.load(Ordering::SeqCst), u64::MAX);
    drop(global);
    assert_eq!(root.thread_inuse.load(Ordering::SeqCst), 0);
    let _shard_again = root.attach();
}

#[cfg(not(loom))]
#[test]
#[should_panic]
fn attach_panics_under_global_lock() {
    let root = GcRoot::new();
    let _global = root.try_lock_global().unwrap();
    let _shard = root.attach();
}

#[cfg(not(loom))]
#[test]
fn tickets_and_slots_track_transitions() {
    let root = GcRoot::new();
    let mut shard = root.attach();
    let tid = shard.tid();

    assert_eq!(root.slots[tid].load(Ordering::SeqCst), TICKET_ASLEEP);
    let before = root.ticket.load(Ordering::SeqCst);

    let guard = shard.awake();
    let at_awake = root.ticket.load(Ordering::SeqCst);
    assert_eq!(at_awake, before + 1);
    assert_eq!(root.slots[tid].load(Ordering::SeqCst), at_awake);

    drop(guard);
    // sleep burns one more ticket for the retirement tag
    assert_eq!(root.ticket.load(Ordering::SeqCst), before + 2);
    assert_eq!(root.slots[tid].load(Ordering::SeqCst), TICKET_ASLEEP);
}

#[cfg(not(loom))]
#[test]
fn min_ticket_skips_self_and_sleepers() {
    let root = GcRoot::new();
    let shard_a = root.attach();
    let mut shard_b = root.attach();
    let mut shard_c = root.attach();

    // nobody awake: the horizon is unbounded
    assert_eq!(root.min_awake_ticket_excluding(shard_a.tid()), u64::MAX);

    let guard_b = shard_b.awake(); // ticket 1
    let guard_c = shard_c.awake(); // ticket 2

    assert_eq!(root.min_awake_ticket_excluding(shard_a.tid()), 1);
    // a thread does not hold its own horizon down
    assert_eq!(root.min_awake_ticket_excluding(guard_b.tid()), 2);

    drop(guard_b);
    assert_eq!(root.min_awake_ticket_excluding(shard_a.tid()), 2);
    drop(guard_c);
    assert_eq!(root.min_awake_ticket_excluding(shard_a.tid()), u64::MAX);
}

#[cfg(loom)]
#[test]
fn loom_attach_race_hands_out_distinct_ids() {
    loom::model(|| {
        let root = GcRoot::new();

        let root_a = std::sync::Arc::clone(&root);
        let t0 = loom::thread::spawn(move || {
            let shard = root_a.attach();
            assert!(shard.tid() < 2);
            shard.tid()
        });
        let root_b = std::sync::Arc::clone(&root);
        let t1 = loom::thread::spawn(move || {
            let shard = root_b.attach();
            assert!(shard.tid() < 2);
            shard.tid()
        });

        let tid0 = t0.join().unwrap();
        let tid1 = t1.join().unwrap();
        assert_ne!(tid0, tid1);
        assert_eq!(root.thread_inuse.load(Ordering::SeqCst), 0);
    })
}
