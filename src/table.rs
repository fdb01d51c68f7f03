// The deterministic, insertion-ordered hash table backing `Map` values
// and the VM's globals table (component C).
//
// Hashing and type-aware equality for `Value` keys can require running
// user bytecode (a class's `hashCode`/`equals` override), so this type
// stays heap-agnostic: callers precompute the hash and supply an
// equality predicate. That keeps the table itself pure data, safe to
// `std::mem::take` out of a `Map` object for the duration of an
// operation that needs to call back into the VM (see `vm.rs`).

use crate::error::{RResult, RuntimeError};
use crate::value::Value;

#[derive(Clone, Debug)]
struct Entry {
    /// `None` once deleted -- a tombstone. Kept as a distinct Option
    /// rather than overloading `Value::Undefined` so table internals
    /// don't depend on a particular sentinel value.
    key: Option<Value>,
    value: Value,
    hash: u64,
    next_in_chain: i64,
}

#[derive(Clone, Debug, Default)]
pub struct ValueTable {
    table_size: usize,
    chain_heads: Vec<i64>,
    entries: Vec<Entry>,
    live_count: usize,
    mod_count: u64,
}

const INITIAL_SIZE: usize = 8;
const LOAD_FACTOR: f64 = 0.75;

impl ValueTable {
    pub fn new() -> Self {
        ValueTable {
            table_size: 0,
            chain_heads: Vec::new(),
            entries: Vec::new(),
            live_count: 0,
            mod_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    pub fn entries_count(&self) -> usize {
        self.entries.len()
    }

    pub fn mod_count(&self) -> u64 {
        self.mod_count
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.table_size - 1)
    }

    pub fn get(&self, hash: u64, mut eq: impl FnMut(&Value) -> RResult<bool>) -> RResult<Option<Value>> {
        if self.table_size == 0 {
            return Ok(None);
        }
        let mut idx = self.chain_heads[self.bucket_of(hash)];
        while idx >= 0 {
            let entry = &self.entries[idx as usize];
            if let Some(key) = &entry.key {
                if entry.hash == hash && eq(key)? {
                    return Ok(Some(entry.value.clone()));
                }
            }
            idx = entry.next_in_chain;
        }
        Ok(None)
    }

    pub fn contains(&self, hash: u64, eq: impl FnMut(&Value) -> RResult<bool>) -> RResult<bool> {
        Ok(self.get(hash, eq)?.is_some())
    }

    fn ensure_capacity(&mut self) {
        if self.table_size == 0 {
            self.grow(INITIAL_SIZE);
            return;
        }
        if self.entries.len() == self.table_size {
            if self.live_count as f64 >= LOAD_FACTOR * self.table_size as f64 {
                self.grow(self.table_size * 2);
            } else {
                self.rebuild_same_size();
            }
        }
    }

    fn grow(&mut self, new_size: usize) {
        let old_entries: Vec<Entry> = self.entries.drain(..).collect();
        self.table_size = new_size;
        self.chain_heads = vec![-1; new_size];
        self.entries = Vec::with_capacity(new_size);
        for entry in old_entries {
            if let Some(key) = entry.key {
                self.push_entry(key, entry.value, entry.hash);
            }
        }
    }

    /// Reclaims tombstones without changing `table_size` -- an in-place
    /// rehash, for when deletes have piled up tombstones but the live
    /// count doesn't warrant growing.
    fn rebuild_same_size(&mut self) {
        let old_entries: Vec<Entry> = self.entries.drain(..).collect();
        self.chain_heads = vec![-1; self.table_size];
        self.entries = Vec::with_capacity(self.table_size);
        for entry in old_entries {
            if let Some(key) = entry.key {
                self.push_entry(key, entry.value, entry.hash);
            }
        }
    }

    fn push_entry(&mut self, key: Value, value: Value, hash: u64) {
        let bucket = self.bucket_of(hash);
        let index = self.entries.len() as i64;
        let head = self.chain_heads[bucket];
        self.entries.push(Entry { key: Some(key), value, hash, next_in_chain: head });
        self.chain_heads[bucket] = index;
    }

    /// Inserts or overwrites `key => value`. Returns `true` if `key`
    /// was not previously present.
    pub fn insert(
        &mut self,
        key: Value,
        hash: u64,
        value: Value,
        mut eq: impl FnMut(&Value) -> RResult<bool>,
    ) -> RResult<bool> {
        if self.table_size > 0 {
            let mut idx = self.chain_heads[self.bucket_of(hash)];
            while idx >= 0 {
                let entry = &mut self.entries[idx as usize];
                let matches = match &entry.key {
                    Some(k) if entry.hash == hash => eq(k)?,
                    _ => false,
                };
                if matches {
                    entry.value = value;
                    self.mod_count += 1;
                    return Ok(false);
                }
                idx = self.entries[idx as usize].next_in_chain;
            }
        }
        self.ensure_capacity();
        self.push_entry(key, value, hash);
        self.live_count += 1;
        self.mod_count += 1;
        Ok(true)
    }

    /// Deletes the entry matching `hash`/`eq`, leaving a tombstone.
    /// Returns `true` if something was removed.
    pub fn remove(&mut self, hash: u64, mut eq: impl FnMut(&Value) -> RResult<bool>) -> RResult<bool> {
        if self.table_size == 0 {
            return Ok(false);
        }
        let mut idx = self.chain_heads[self.bucket_of(hash)];
        while idx >= 0 {
            let i = idx as usize;
            let matches = match &self.entries[i].key {
                Some(k) if self.entries[i].hash == hash => eq(k)?,
                _ => false,
            };
            if matches {
                self.entries[i].key = None;
                self.live_count -= 1;
                self.mod_count += 1;
                return Ok(true);
            }
            idx = self.entries[i].next_in_chain;
        }
        Ok(false)
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().filter_map(|e| e.key.as_ref().map(|k| (k, &e.value)))
    }

    pub fn make_iterator(&self) -> TableIter {
        TableIter { next_index: 0, mod_count_snapshot: self.mod_count }
    }

    /// Advances `iter` to the next live entry in insertion order.
    /// Raises `ConcurrentModification` if the table was structurally
    /// changed since the iterator was created.
    pub fn next_entry(&self, iter: &mut TableIter) -> RResult<Option<(Value, Value)>> {
        if iter.mod_count_snapshot != self.mod_count {
            return Err(RuntimeError::ConcurrentModification);
        }
        while iter.next_index < self.entries.len() {
            let entry = &self.entries[iter.next_index];
            iter.next_index += 1;
            if let Some(key) = &entry.key {
                return Ok(Some((key.clone(), entry.value.clone())));
            }
        }
        Ok(None)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TableIter {
    next_index: usize,
    mod_count_snapshot: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_eq(a: &Value) -> impl FnMut(&Value) -> RResult<bool> + '_ {
        move |b: &Value| Ok(a.raw_eq(b))
    }

    fn hash_number(n: f64) -> u64 {
        n.to_bits()
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut t = ValueTable::new();
        let k = Value::Number(1.0);
        t.insert(k, hash_number(1.0), Value::Number(42.0), id_eq(&k)).unwrap();
        let got = t.get(hash_number(1.0), id_eq(&k)).unwrap();
        assert!(matches!(got, Some(Value::Number(n)) if n == 42.0));
    }

    #[test]
    fn iteration_is_insertion_ordered_and_survives_deletes() {
        let mut t = ValueTable::new();
        for i in 0..5 {
            let k = Value::Number(i as f64);
            t.insert(k, hash_number(i as f64), Value::Number(i as f64 * 10.0), id_eq(&k)).unwrap();
        }
        let dk = Value::Number(2.0);
        t.remove(hash_number(2.0), id_eq(&dk)).unwrap();
        let order: Vec<f64> = t.iter_live().map(|(k, _)| k.as_number().unwrap()).collect();
        assert_eq!(order, vec![0.0, 1.0, 3.0, 4.0]);
    }

    #[test]
    fn iterator_detects_concurrent_modification() {
        let mut t = ValueTable::new();
        let k = Value::Number(1.0);
        t.insert(k, hash_number(1.0), Value::Nil, id_eq(&k)).unwrap();
        let mut iter = t.make_iterator();
        t.insert(Value::Number(2.0), hash_number(2.0), Value::Nil, id_eq(&Value::Number(2.0))).unwrap();
        let err = t.next_entry(&mut iter).unwrap_err();
        assert_eq!(err, RuntimeError::ConcurrentModification);
    }

    #[test]
    fn overwrite_does_not_grow_live_count() {
        let mut t = ValueTable::new();
        let k = Value::Number(1.0);
        t.insert(k, hash_number(1.0), Value::Number(1.0), id_eq(&k)).unwrap();
        t.insert(k, hash_number(1.0), Value::Number(2.0), id_eq(&k)).unwrap();
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn many_inserts_and_deletes_keep_entries_count_ge_live_count() {
        let mut t = ValueTable::new();
        for i in 0..100 {
            let k = Value::Number(i as f64);
            t.insert(k, hash_number(i as f64), Value::Nil, id_eq(&k)).unwrap();
            if i % 3 == 0 {
                t.remove(hash_number(i as f64), id_eq(&k)).unwrap();
            }
            assert!(t.entries_count() >= t.len());
        }
    }
}
