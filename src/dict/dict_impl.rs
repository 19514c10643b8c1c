// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::rc::Rc;

use rand::Rng;

use crate::{
    dict::table::{Entry, HTable},
    object::Obj,
};

const INIT_SIZE: u64 = 8;
const LOAD_FACTOR: u64 = 8;
const DEFAULT_STEP: usize = 1;

/// A two-table, incrementally-rehashing dictionary.
///
/// When not rehashing, `secondary` is `None` and `rehash_cursor` is `-1`.
/// When rehashing, `primary` is the new, larger table and `secondary` is
/// the old table being drained bucket by bucket. This is the design's
/// namesake idea and is kept as a genuine two-table structure rather than
/// simulated with a single growable map, so that any single operation only
/// ever touches a bounded number of buckets.
pub struct Dict {
    primary: Option<HTable>,
    secondary: Option<HTable>,
    rehash_cursor: i64,
}

impl Default for Dict {
    fn default() -> Self {
        Self::new()
    }
}

impl Dict {
    pub fn new() -> Self {
        Dict {
            primary: None,
            secondary: None,
            rehash_cursor: -1,
        }
    }

    pub fn is_rehashing(&self) -> bool {
        self.secondary.is_some()
    }

    /// Migrates up to `k` *buckets* (not entries) from `secondary` into
    /// `primary`.
    fn step(&mut self, k: usize) {
        for _ in 0..k {
            let Some(secondary) = self.secondary.as_mut() else {
                return;
            };

            while self.rehash_cursor < secondary.size() as i64
                && secondary.lookup_bucket_empty(self.rehash_cursor as usize)
            {
                self.rehash_cursor += 1;
            }

            if self.rehash_cursor == secondary.size() as i64 {
                self.secondary = None;
                self.rehash_cursor = -1;
                return;
            }

            let chain = secondary.take_bucket(self.rehash_cursor as usize);
            let primary = self
                .primary
                .as_mut()
                .expect("primary must exist while rehashing");
            let mut node = chain;
            while let Some(entry) = node {
                let Entry { key, val, next: tail } = *entry;
                primary.insert(key, val);
                node = tail;
            }
            self.rehash_cursor += 1;
        }
    }

    fn lookup_both(&self, key: &Obj) -> Option<&Entry> {
        if let Some(p) = &self.primary {
            if let Some(e) = p.lookup(key) {
                return Some(e);
            }
        }
        if let Some(s) = &self.secondary {
            if let Some(e) = s.lookup(key) {
                return Some(e);
            }
        }
        None
    }

    pub fn insert(&mut self, key: Rc<Obj>, val: Rc<Obj>) {
        if self.primary.is_none() {
            self.primary = Some(HTable::new(INIT_SIZE));
        }

        self.step(DEFAULT_STEP);

        if let Some(p) = self.primary.as_mut() {
            if let Some(existing) = p.lookup_mut(&key) {
                existing.val = val;
                return;
            }
        }
        if let Some(s) = self.secondary.as_mut() {
            if let Some(existing) = s.lookup_mut(&key) {
                existing.val = val;
                return;
            }
        }

        let primary = self.primary.as_mut().expect("just ensured primary exists");
        primary.insert(key, val);

        if self.secondary.is_none() {
            let factor = (primary.used() - 1) / primary.size();
            if factor >= LOAD_FACTOR {
                let old = self.primary.take().expect("primary present");
                let new_size = old.size() * 2;
                self.secondary = Some(old);
                self.primary = Some(HTable::new(new_size));
                self.rehash_cursor = 0;
            }
        }
    }

    pub fn lookup(&mut self, key: &Obj) -> Option<&Entry> {
        self.step(DEFAULT_STEP);
        self.lookup_both(key)
    }

    pub fn pop(&mut self, key: &Obj) -> Option<(Rc<Obj>, Rc<Obj>)> {
        self.step(DEFAULT_STEP);

        if let Some(p) = self.primary.as_mut() {
            if let Some(pair) = p.pop(key) {
                return Some(pair);
            }
        }
        if let Some(s) = self.secondary.as_mut() {
            if let Some(pair) = s.pop(key) {
                return Some(pair);
            }
        }
        None
    }

    pub fn random_get(&mut self) -> Option<&Entry> {
        self.step(DEFAULT_STEP);

        let primary = self.primary.as_ref()?;
        match self.secondary.as_ref() {
            None => primary.random_get(),
            Some(secondary) => {
                let total = primary.used() + secondary.used();
                if total == 0 {
                    return None;
                }
                if rand::rng().random_range(0..total) < primary.used() {
                    primary.random_get()
                } else {
                    secondary.random_get()
                }
            },
        }
    }

    pub fn key_count(&self) -> u64 {
        self.primary.as_ref().map_or(0, HTable::used)
            + self.secondary.as_ref().map_or(0, HTable::used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Rc<Obj> {
        Obj::new_string(v)
    }

    #[test]
    fn set_then_get() {
        let mut d = Dict::new();
        d.insert(s("key"), s("val"));
        assert_eq!(d.lookup(&Obj::new_string("key")).expect("key should be present").val.as_str(), "val");
    }

    #[test]
    fn insert_replaces_existing_value() {
        let mut d = Dict::new();
        d.insert(s("key"), s("v1"));
        d.insert(s("key"), s("v2"));
        assert_eq!(d.key_count(), 1);
        assert_eq!(d.lookup(&Obj::new_string("key")).expect("key should be present").val.as_str(), "v2");
    }

    #[test]
    fn pop_removes_key() {
        let mut d = Dict::new();
        d.insert(s("key"), s("val"));
        assert!(d.pop(&Obj::new_string("key")).is_some());
        assert!(d.lookup(&Obj::new_string("key")).is_none());
        assert_eq!(d.key_count(), 0);
    }

    #[test]
    fn rehash_triggers_past_load_factor_and_preserves_all_keys() {
        let mut d = Dict::new();
        // InitSize=8, LoadFactor=8: resizing begins once
        // (used - 1) / size >= 8, i.e. on the 65th distinct insert.
        for i in 0..65 {
            d.insert(s(&format!("k{i}")), s(&i.to_string()));
        }
        assert!(d.is_rehashing(), "expected secondary table to be non-empty");

        for i in 0..65 {
            let key = Obj::new_string(format!("k{i}"));
            assert_eq!(
                d.lookup(&key).expect("key should survive rehash").val.as_str(),
                i.to_string(),
                "key k{i} should survive across rehash steps"
            );
        }

        // Drive further operations until the rehash completes.
        let mut guard = 0;
        while d.is_rehashing() && guard < 1000 {
            d.insert(s(&format!("filler{guard}")), s("x"));
            guard += 1;
        }
        assert!(!d.is_rehashing());

        for i in 0..65 {
            let key = Obj::new_string(format!("k{i}"));
            assert!(d.lookup(&key).is_some());
        }
        assert_eq!(d.key_count(), 65 + guard);
    }

    #[test]
    fn key_count_tracks_inserts_and_pops() {
        let mut d = Dict::new();
        for i in 0..10 {
            d.insert(s(&format!("k{i}")), s("v"));
        }
        assert_eq!(d.key_count(), 10);
        d.pop(&Obj::new_string("k0"));
        assert_eq!(d.key_count(), 9);
    }
}
