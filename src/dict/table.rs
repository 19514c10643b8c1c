// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::rc::Rc;

use rand::Rng;

use crate::{dict::fnv1a_64, object::Obj};

/// A single bucket-chain node. Chains are kept pointer-linked (`Box`), per
/// the design notes: hash chains are exactly the case where pointer form
/// beats a vector-backed free list.
pub struct Entry {
    pub key: Rc<Obj>,
    pub val: Rc<Obj>,
    pub(super) next: Option<Box<Entry>>,
}

/// An open-chained hash table. `size` is always a power of two so `mask`
/// can stand in for modulo.
pub struct HTable {
    buckets: Vec<Option<Box<Entry>>>,
    size: u64,
    mask: u64,
    used: u64,
}

impl HTable {
    /// Creates a table with `n` buckets. `n` must be a power of two.
    pub fn new(n: u64) -> Self {
        debug_assert!(n.is_power_of_two());
        let mut buckets = Vec::with_capacity(n as usize);
        buckets.resize_with(n as usize, || None);
        HTable {
            buckets,
            size: n,
            mask: n - 1,
            used: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn lookup_bucket_empty(&self, idx: usize) -> bool {
        self.buckets[idx].is_none()
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    fn index(&self, key: &Obj) -> usize {
        (fnv1a_64(key.as_bytes()) & self.mask) as usize
    }

    /// Prepends a new entry to its bucket chain. Does not deduplicate —
    /// that is the Dict's job.
    pub fn insert(&mut self, key: Rc<Obj>, val: Rc<Obj>) {
        let idx = self.index(&key);
        let next = self.buckets[idx].take();
        self.buckets[idx] = Some(Box::new(Entry { key, val, next }));
        self.used += 1;
    }

    pub fn lookup(&self, key: &Obj) -> Option<&Entry> {
        if self.used == 0 {
            return None;
        }
        let idx = self.index(key);
        let mut cur = self.buckets[idx].as_deref();
        while let Some(entry) = cur {
            if entry.key.as_str() == key.as_str() {
                return Some(entry);
            }
            cur = entry.next.as_deref();
        }
        None
    }

    pub fn lookup_mut(&mut self, key: &Obj) -> Option<&mut Entry> {
        if self.used == 0 {
            return None;
        }
        let idx = self.index(key);
        let mut cur = self.buckets[idx].as_deref_mut();
        while let Some(entry) = cur {
            if entry.key.as_str() == key.as_str() {
                return Some(entry);
            }
            cur = entry.next.as_deref_mut();
        }
        None
    }

    /// Unlinks and returns the first matching entry's key/value pair.
    pub fn pop(&mut self, key: &Obj) -> Option<(Rc<Obj>, Rc<Obj>)> {
        let idx = self.index(key);
        let mut slot = &mut self.buckets[idx];
        loop {
            match slot {
                None => return None,
                Some(entry) if entry.key.as_str() == key.as_str() => {
                    let entry = slot.take().expect("just matched Some");
                    *slot = entry.next;
                    self.used -= 1;
                    return Some((entry.key, entry.val));
                },
                Some(entry) => {
                    slot = &mut entry.next;
                },
            }
        }
    }

    /// Uniformly random over non-empty buckets, then uniformly random
    /// within the chosen chain. Precondition: `used > 0`.
    pub fn random_get(&self) -> Option<&Entry> {
        if self.used == 0 {
            return None;
        }
        let non_empty: Vec<usize> = (0..self.size as usize)
            .filter(|&i| self.buckets[i].is_some())
            .collect();
        let idx = non_empty[rand::rng().random_range(0..non_empty.len())];

        let mut len = 0usize;
        let mut cur = self.buckets[idx].as_deref();
        while let Some(entry) = cur {
            len += 1;
            cur = entry.next.as_deref();
        }

        let target = rand::rng().random_range(0..len);
        let mut cur = self.buckets[idx].as_deref();
        for _ in 0..target {
            cur = cur.and_then(|e| e.next.as_deref());
        }
        cur
    }

    /// Drains every entry out of the table, bucket by bucket, for use by
    /// the Dict's incremental rehash migration.
    pub fn take_bucket(&mut self, idx: usize) -> Option<Box<Entry>> {
        let chain = self.buckets[idx].take();
        if chain.is_some() {
            let mut n = 0u64;
            let mut cur = chain.as_deref();
            while let Some(e) = cur {
                n += 1;
                cur = e.next.as_deref();
            }
            self.used -= n;
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(s: &str) -> Rc<Obj> {
        Obj::new_string(s)
    }

    #[test]
    fn insert_and_lookup() {
        let mut t = HTable::new(8);
        t.insert(obj("a"), obj("1"));
        t.insert(obj("b"), obj("2"));
        assert_eq!(t.used(), 2);
        assert_eq!(t.lookup(&Obj::new_string("a")).expect("key a should be present").val.as_str(), "1");
        assert_eq!(t.lookup(&Obj::new_string("b")).expect("key b should be present").val.as_str(), "2");
        assert!(t.lookup(&Obj::new_string("c")).is_none());
    }

    #[test]
    fn duplicate_insert_finds_newest_lifo() {
        let mut t = HTable::new(8);
        t.insert(obj("a"), obj("1"));
        t.insert(obj("a"), obj("2"));
        assert_eq!(t.used(), 2);
        assert_eq!(t.lookup(&Obj::new_string("a")).expect("key a should be present").val.as_str(), "2");
    }

    #[test]
    fn pop_removes_and_returns() {
        let mut t = HTable::new(8);
        t.insert(obj("a"), obj("1"));
        t.insert(obj("b"), obj("2"));
        let (k, v) = t.pop(&Obj::new_string("a")).expect("key a should be present");
        assert_eq!(k.as_str(), "a");
        assert_eq!(v.as_str(), "1");
        assert_eq!(t.used(), 1);
        assert!(t.lookup(&Obj::new_string("a")).is_none());
        assert!(t.pop(&Obj::new_string("a")).is_none());
    }

    #[test]
    fn random_get_returns_existing_entry() {
        let mut t = HTable::new(8);
        for i in 0..20 {
            t.insert(obj(&format!("k{i}")), obj(&i.to_string()));
        }
        let e = t.random_get().expect("table is non-empty");
        assert!(e.key.as_str().starts_with('k'));
    }
}
