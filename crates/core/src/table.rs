//! Open-addressed (linear probing) hash table keyed by interned strings
//! (spec §3/§4.5). Used for globals, class method tables, instance fields,
//! and (with `Value::Nil` payloads) the string intern set.

use crate::object::{ObjData, ObjRef};
use crate::value::Value;

const MIN_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    /// A deleted entry; kept so later probe chains aren't broken.
    Tombstone,
    Occupied(ObjRef, Value),
}

pub struct Table {
    entries: Vec<Slot>,
    count: usize, // occupied + tombstones, for load-factor accounting
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
            count: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn key_hash(key: ObjRef) -> u32 {
        match key.data() {
            ObjData::Str(s) => s.hash,
            _ => unreachable!("Table keys must be interned strings"),
        }
    }

    /// Finds the slot `key` belongs in, or the first tombstone/empty slot
    /// along its probe sequence if absent. Relies on key identity, which
    /// equals key value thanks to interning.
    fn find_slot(entries: &[Slot], key: ObjRef, hash: u32) -> usize {
        let cap = entries.len();
        let mut index = (hash as usize) & (cap - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Occupied(k, _) => {
                    if *k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Slot::Empty; new_capacity];
        let mut live = 0;
        for slot in &self.entries {
            if let Slot::Occupied(key, value) = slot {
                let hash = Self::key_hash(*key);
                let idx = Self::find_slot(&new_entries, *key, hash);
                new_entries[idx] = Slot::Occupied(*key, *value);
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    /// Inserts or overwrites `key`. Returns `true` if `key` was not already present.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if self.entries.is_empty() {
            self.grow(MIN_CAPACITY);
        } else if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow(self.capacity() * 2);
        }
        let hash = Self::key_hash(key);
        let idx = Self::find_slot(&self.entries, key, hash);
        let is_new = !matches!(self.entries[idx], Slot::Occupied(_, _));
        if is_new && !matches!(self.entries[idx], Slot::Tombstone) {
            self.count += 1;
        }
        self.entries[idx] = Slot::Occupied(key, value);
        is_new
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let hash = Self::key_hash(key);
        match self.entries[Self::find_slot(&self.entries, key, hash)] {
            Slot::Occupied(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn has(&self, key: ObjRef) -> bool {
        self.get(key).is_some()
    }

    /// Deletes `key`, leaving a tombstone so probe chains survive.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let hash = Self::key_hash(key);
        let idx = Self::find_slot(&self.entries, key, hash);
        if matches!(self.entries[idx], Slot::Occupied(_, _)) {
            self.entries[idx] = Slot::Tombstone;
            true
        } else {
            false
        }
    }

    /// Scans for an already-interned string with equal bytes. Used only by
    /// the interner, before a candidate string has an `ObjRef` of its own.
    pub fn find_string(&self, bytes: &str, hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let mut index = (hash as usize) & (cap - 1);
        loop {
            match &self.entries[index] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(key, _) => {
                    if let Some(s) = key.as_str() {
                        if s == bytes {
                            return Some(*key);
                        }
                    }
                }
            }
            index = (index + 1) & (cap - 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }

    /// Removes every entry whose key is unmarked (weak-set sweep for the
    /// string interner, spec §4.5: interned strings must not keep
    /// themselves alive).
    pub fn remove_unmarked_keys(&mut self) {
        for slot in &mut self.entries {
            if let Slot::Occupied(key, _) = slot {
                if !key.is_marked() {
                    *slot = Slot::Tombstone;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(_, _)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Table behavior is exercised end-to-end via the heap/interner tests,
    // since a Table entry needs a live interned ObjRef as its key.
    #[test]
    fn new_table_has_no_capacity_until_first_insert() {
        let t = Table::new();
        assert_eq!(t.capacity(), 0);
        assert!(t.is_empty());
    }
}
