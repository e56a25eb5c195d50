use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use swiss_core::policy::{Flat, SlotStrategy};
use swiss_core::RawTable;

/// A minimal key-equality set built on the raw engine, used only to keep
/// the scenario tests below readable; real callers would layer their own
/// typed map or set on top of `RawTable` the same way.
pub struct Set<T: Eq + Hash + Clone> {
    table: RawTable<Flat<T>>,
}

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl<T: Eq + Hash + Clone> Set<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: RawTable::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, value: T) -> bool {
        let hash = hash_of(&value);
        if self.table.find(hash, |probe| *probe == value).is_some() {
            return false;
        }
        self.table.insert(hash, value, hash_of);
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        let hash = hash_of(value);
        self.table.find(hash, |probe| probe == value).is_some()
    }

    pub fn erase(&mut self, value: &T) -> bool {
        let hash = hash_of(value);
        match self.table.find(hash, |probe| probe == value) {
            Some(bucket) => {
                unsafe { self.table.erase(bucket) };
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn rehash(&mut self, capacity: usize) {
        self.table.rehash(capacity, hash_of);
    }

    pub fn duplicate(&self) -> Self {
        let table = unsafe { self.table.duplicate(|v| v.clone()) };
        Self { table }
    }

    pub fn iter_values(&self) -> Vec<T> {
        unsafe {
            self.table
                .iter()
                .map(|bucket| (*Flat::<T>::get(bucket.as_ptr())).clone())
                .collect()
        }
    }
}
