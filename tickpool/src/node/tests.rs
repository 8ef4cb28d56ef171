use std::collections::HashSet;
use std::mem::MaybeUninit;

use super::*;

#[cfg(not(loom))]
#[test]
fn freelist_is_lifo() {
    let chain = BlockChain::new();
    let (_, mut list) = chain.carve::<u32>(3);
    assert_eq!(list.len(), 3);
    unsafe {
        let a = list.pop();
        let b = list.pop();
        let c = list.pop();
        assert!(list.is_empty());
        // carve links nodes in address order, so they pop back descending
        assert!(a > b && b > c);

        let mut other = FreeList::new();
        other.push(a);
        other.push(b);
        assert_eq!(other.len(), 2);
        assert_eq!(other.pop(), b);
        assert_eq!(other.pop(), a);
        assert!(other.is_empty());
    }
}

#[cfg(not(loom))]
#[test]
fn freelist_splice_is_complete_and_ordered() {
    let chain = BlockChain::new();
    let (_, mut src) = chain.carve::<u32>(2);
    let (_, mut dst) = chain.carve::<u32>(2);
    unsafe {
        // splicing an empty list is a no-op
        let mut empty = FreeList::new();
        empty.splice_into(&mut dst);
        assert_eq!(dst.len(), 2);

        // splice into non-empty: everything lands exactly once
        src.splice_into(&mut dst);
        assert!(src.is_empty());
        assert_eq!(dst.len(), 4);
        let mut seen = HashSet::new();
        let mut popped = Vec::new();
        for _ in 0..4 {
            let n = dst.pop();
            assert!(seen.insert(n as usize));
            popped.push(n);
        }
        assert!(dst.is_empty());

        // splice into empty: the list moves wholesale
        let mut rebuilt = FreeList::new();
        for n in popped {
            rebuilt.push(n);
        }
        let mut target = FreeList::new();
        rebuilt.splice_into(&mut target);
        assert!(rebuilt.is_empty());
        assert_eq!(target.len(), 4);
        let mut walked = 0;
        target.for_each(|_| walked += 1);
        assert_eq!(walked, 4);
    }
}

#[cfg(not(loom))]
#[test]
fn node_value_ptr_roundtrip() {
    let chain = BlockChain::new();
    let (_, mut list) = chain.carve::<u64>(1);
    unsafe {
        let node = list.pop();
        let value = Node::value_ptr(node);
        // repr(C), value first: the two addresses coincide
        assert_eq!(value as usize, node as usize);
        assert_eq!(Node::from_value_ptr(value), node);

        (*(value as *mut MaybeUninit<u64>)).write(0xdead_beef);
        assert_eq!(*(*node).value.assume_init_ref(), 0xdead_beef);
    }
}

#[cfg(not(loom))]
#[test]
fn group_payload_store_take() {
    let chain = BlockChain::new();
    let (group, mut list) = chain.carve::<u32>(4);
    unsafe {
        NodeGroup::store_nodes(group, &mut list);
        assert!(list.is_empty());
        NodeGroup::set_age(group, 7);

        let snap = NodeGroup::snapshot_payload(group);
        assert_eq!(snap.age, 7);

        let mut count = 0;
        NodeGroup::debug_for_each_node(group, |_| count += 1);
        assert_eq!(count, 4);

        let taken = NodeGroup::take_nodes(group);
        assert_eq!(taken.len(), 4);
        // payload is empty once taken
        let mut after = 0;
        NodeGroup::debug_for_each_node(group, |_| after += 1);
        assert_eq!(after, 0);
    }
}

#[cfg(not(loom))]
#[test]
fn chain_enumerates_every_node_carved() {
    let chain = BlockChain::new();
    let (_, l1) = chain.carve::<u16>(3);
    let (_shell, shell_nodes) = chain.carve::<u16>(0);
    let (_, l2) = chain.carve::<u16>(5);
    assert!(shell_nodes.is_empty());

    let mut all = HashSet::new();
    unsafe {
        chain.for_each_node::<u16>(|n| {
            assert!(all.insert(n as usize));
        });
        l1.for_each(|n| assert!(all.contains(&(n as usize))));
        l2.for_each(|n| assert!(all.contains(&(n as usize))));
    }
    assert_eq!(all.len(), 8);
}
