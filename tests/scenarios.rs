mod common;

use common::Set;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use swiss_core::policy::{Flat, SlotStrategy};
use swiss_core::RawTable;

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[test]
fn scenario_a_integer_set() {
    let mut set: Set<u64> = Set::new(8);
    for v in [1, 2, 5, 10, 17, 26, 37, 50] {
        set.insert(v);
    }
    assert!(!set.contains(&4));
    assert!(set.contains(&5));

    set.rehash(16);
    assert!(set.contains(&5));

    assert!(set.erase(&5));
    assert!(!set.contains(&5));
    assert_eq!(set.len(), 7);

    let remaining: HashSet<u64> = set.iter_values().into_iter().collect();
    let expected: HashSet<u64> = [1, 2, 10, 17, 26, 37, 50].into_iter().collect();
    assert_eq!(remaining, expected);
}

#[test]
fn scenario_b_string_map() {
    let mut set: Set<String> = Set::new(8);
    for key in ["abcd", "efgh", "ijkh", "lmno", "pqrs", "tuvw", "xyza", "bcde"] {
        set.insert(key.to_string());
    }
    assert!(!set.contains(&"missing".to_string()));
    assert!(set.contains(&"lmno".to_string()));

    set.rehash(16);
    assert!(set.contains(&"lmno".to_string()));

    assert!(set.erase(&"lmno".to_string()));
    assert!(!set.contains(&"lmno".to_string()));

    let remaining: HashSet<String> = set.iter_values().into_iter().collect();
    assert_eq!(remaining.len(), 7);
    assert!(!remaining.contains("lmno"));
}

#[test]
fn scenario_c_steady_state_churn() {
    const N: usize = 1024;
    let mut set: Set<u64> = Set::new(N);
    let mut order = VecDeque::with_capacity(N);
    for v in 0..N as u64 {
        set.insert(v);
        order.push_back(v);
    }

    let mut next_fresh = N as u64;
    for _ in 0..(100 * N) {
        let oldest = order.pop_front().unwrap();
        assert!(set.erase(&oldest));
        let fresh = next_fresh;
        next_fresh += 1;
        assert!(set.insert(fresh));
        order.push_back(fresh);
    }

    assert_eq!(set.len(), N);
    for v in &order {
        assert!(set.contains(v));
    }
    // Churn that never holds more than N live elements at once must
    // never force growth past a small constant multiple of the capacity
    // the table was initialized with.
    assert!(set.capacity() <= 4 * N);
}

#[test]
fn scenario_d_tombstone_squash() {
    let mut set: Set<u64> = Set::new(0);
    for v in 0..256u64 {
        set.insert(v);
    }
    let capacity_after_fill = set.capacity();

    for v in (0..256u64).step_by(2) {
        assert!(set.erase(&v));
    }
    assert_eq!(set.len(), 128);

    for v in 256..384u64 {
        set.insert(v);
    }

    // All 256 originally-inserted odd keys plus the 128 fresh ones must
    // still be findable, and reclaiming tombstones in place must have
    // kept the capacity from needing to double to fit 256 live items.
    for v in (1..256u64).step_by(2) {
        assert!(set.contains(&v));
    }
    for v in 256..384u64 {
        assert!(set.contains(&v));
    }
    assert!(set.capacity() <= 2 * capacity_after_fill);
}

#[test]
fn scenario_e_duplicate_equivalence() {
    let mut t: Set<u64> = Set::new(500);
    for v in 0..500u64 {
        t.insert(v);
    }
    let mut u = t.duplicate();
    assert_eq!(u.len(), 500);
    for v in 0..500u64 {
        assert!(u.contains(&v));
    }

    // Mutating the duplicate must not affect the original.
    u.erase(&0);
    assert!(!u.contains(&0));
    assert!(t.contains(&0));
    assert_eq!(t.len(), 500);
}

#[test]
fn scenario_f_iteration_after_erase_sees_later_elements() {
    let mut table: RawTable<Flat<u64>> = RawTable::with_capacity(100);
    for v in 0..100u64 {
        table.insert(hash_of(&v), v, hash_of);
    }

    // `erase_at` is tombstone-only and never reallocates, so a single
    // live iterator survives an erase of the element it just yielded:
    // take the cursor mid-walk, erase through it, and keep advancing the
    // same iterator rather than starting a fresh one.
    let mut expected: HashSet<u64> = unsafe {
        table
            .iter()
            .map(|bucket| *Flat::<u64>::get(bucket.as_ptr()))
            .collect()
    };

    let mut it = unsafe { table.iter() };
    let first = it.next().expect("table is non-empty");
    let erased = unsafe { *Flat::<u64>::get(first.as_ptr()) };
    unsafe { table.erase(first) };
    expected.remove(&erased);

    let mut seen = HashSet::new();
    while let Some(bucket) = it.next() {
        seen.insert(unsafe { *Flat::<u64>::get(bucket.as_ptr()) });
    }

    assert_eq!(seen, expected);
}
