//! Lock-free set of fingerprints, for matching without state images.
//!
//! Open addressing with linear probing over `AtomicU64` slots, 8 bytes per
//! visited state. Inserts from several threads race through CAS; growing
//! needs `&mut self`, so the parallel search grows between batches.

use crate::state::Fingerprint;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Marks a free slot. A fingerprint equal to it is stored as `EMPTY - 1`.
const EMPTY: u64 = u64::MAX;

pub struct SeenSet {
    slots: Vec<AtomicU64>,
    mask: u64,
    count: AtomicUsize,
}

impl SeenSet {
    /// A set sized so that `expected` entries keep the load below 3/8.
    pub fn new(expected: usize) -> Self {
        let len = (expected * 3).max(1024).next_power_of_two();
        Self {
            slots: empty_slots(len),
            mask: (len - 1) as u64,
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn remap(fp: Fingerprint) -> u64 {
        match fp.as_u64() {
            EMPTY => EMPTY - 1,
            v => v,
        }
    }

    #[inline]
    fn next(&self, idx: usize) -> usize {
        ((idx as u64 + 1) & self.mask) as usize
    }

    /// Load factor above 3/8.
    #[inline]
    pub fn should_grow(&self) -> bool {
        self.count.load(Ordering::Relaxed) * 8 >= self.slots.len() * 3
    }

    /// Double the table and rehash. No insert may run concurrently.
    pub fn grow(&mut self) {
        let len = self.slots.len() * 2;
        let slots = empty_slots(len);
        let mask = (len - 1) as u64;
        for slot in &self.slots {
            let v = slot.load(Ordering::Relaxed);
            if v == EMPTY {
                continue;
            }
            let mut idx = (v & mask) as usize;
            while slots[idx].load(Ordering::Relaxed) != EMPTY {
                idx = ((idx as u64 + 1) & mask) as usize;
            }
            slots[idx].store(v, Ordering::Relaxed);
        }
        self.slots = slots;
        self.mask = mask;
    }

    /// Returns true if `fp` was not in the set.
    pub fn insert(&self, fp: Fingerprint) -> bool {
        let v = Self::remap(fp);
        let mut idx = (v & self.mask) as usize;
        loop {
            let slot = &self.slots[idx];
            let current = slot.load(Ordering::Relaxed);
            if current == v {
                return false;
            }
            if current == EMPTY {
                match slot.compare_exchange(EMPTY, v, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        self.count.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    Err(actual) if actual == v => return false,
                    // lost the slot to another fingerprint; keep probing
                    Err(_) => std::hint::spin_loop(),
                }
            }
            idx = self.next(idx);
        }
    }

    pub fn contains(&self, fp: Fingerprint) -> bool {
        let v = Self::remap(fp);
        let mut idx = (v & self.mask) as usize;
        loop {
            match self.slots[idx].load(Ordering::Relaxed) {
                current if current == v => return true,
                EMPTY => return false,
                _ => idx = self.next(idx),
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

fn empty_slots(len: usize) -> Vec<AtomicU64> {
    (0..len).map(|_| AtomicU64::new(EMPTY)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn fp(v: u64) -> Fingerprint {
        Fingerprint::from_u64(v)
    }

    #[test]
    fn test_insert_and_contains() {
        let set = SeenSet::new(16);
        assert!(set.insert(fp(42)));
        assert!(set.insert(fp(7)));
        assert!(!set.insert(fp(42)));
        assert!(set.contains(fp(7)));
        assert!(!set.contains(fp(8)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_sentinel_values() {
        let set = SeenSet::new(16);
        assert!(set.insert(fp(0)));
        assert!(set.insert(fp(u64::MAX)));
        assert!(set.contains(fp(u64::MAX)));
        // u64::MAX shares its slot value with u64::MAX - 1
        assert!(!set.insert(fp(u64::MAX - 1)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_collisions_on_the_same_bucket() {
        let set = SeenSet::new(16);
        let cap = set.capacity() as u64;
        for i in 0..10 {
            assert!(set.insert(fp(5 + i * cap)));
        }
        for i in 0..10 {
            assert!(set.contains(fp(5 + i * cap)));
        }
        assert!(!set.contains(fp(5 + 10 * cap)));
    }

    #[test]
    fn test_grow_keeps_entries() {
        let mut set = SeenSet::new(1);
        let n = 2000u64;
        for i in 0..n {
            set.insert(fp(i.wrapping_mul(0x9e37_79b9_7f4a_7c15)));
            if set.should_grow() {
                set.grow();
            }
        }
        assert_eq!(set.len(), n as usize);
        assert!(set.capacity() > 1024);
        for i in 0..n {
            assert!(set.contains(fp(i.wrapping_mul(0x9e37_79b9_7f4a_7c15))));
        }
    }

    #[test]
    fn test_concurrent_insert() {
        let set = Arc::new(SeenSet::new(10_000));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    let mut fresh = 0;
                    // every thread inserts the shared range and its own range
                    for i in 0..500 {
                        if set.insert(fp(i)) {
                            fresh += 1;
                        }
                        if set.insert(fp(1_000_000 * (t + 1) + i)) {
                            fresh += 1;
                        }
                    }
                    fresh
                })
            })
            .collect();
        let fresh: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(fresh, 500 + 4 * 500);
        assert_eq!(set.len(), 2500);
    }
}
