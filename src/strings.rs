// String interning table: a plain hash set of `ObjRef`s pointing at
// `LString` heap objects, keyed by byte content. Interning means two
// equal strings always share one arena slot, so string equality
// downstream is `ObjRef` equality.

use crate::heap::Heap;
use crate::object::{fnv1a, LString, Obj};
use crate::value::ObjRef;
use std::collections::HashMap;

#[derive(Default)]
pub struct StringInterner {
    by_hash: HashMap<u64, Vec<ObjRef>>,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner { by_hash: HashMap::new() }
    }

    pub fn intern(&mut self, heap: &mut Heap, bytes: &[u8]) -> ObjRef {
        let hash = fnv1a(bytes);
        if let Some(candidates) = self.by_hash.get(&hash) {
            for &r in candidates {
                if let Obj::Str(s) = heap.get(r) {
                    if &*s.bytes == bytes {
                        return r;
                    }
                }
            }
        }
        let r = heap.alloc(Obj::Str(LString::new(bytes)));
        self.by_hash.entry(hash).or_default().push(r);
        r
    }

    /// Drops bookkeeping for slots the last GC sweep reclaimed. The
    /// interner holds no strong reference, so this is just removing
    /// stale entries, not freeing anything itself.
    pub fn remove_freed(&mut self, freed: &[ObjRef]) {
        if freed.is_empty() {
            return;
        }
        for bucket in self.by_hash.values_mut() {
            bucket.retain(|r| !freed.contains(r));
        }
        self.by_hash.retain(|_, v| !v.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_intern_to_the_same_ref() {
        let mut heap = Heap::new();
        let mut interner = StringInterner::new();
        let a = interner.intern(&mut heap, b"hello");
        let b = interner.intern(&mut heap, b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn different_bytes_intern_to_different_refs() {
        let mut heap = Heap::new();
        let mut interner = StringInterner::new();
        let a = interner.intern(&mut heap, b"hello");
        let b = interner.intern(&mut heap, b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn remove_freed_forgets_reclaimed_slots() {
        let mut heap = Heap::new();
        let mut interner = StringInterner::new();
        let a = interner.intern(&mut heap, b"transient");
        interner.remove_freed(&[a]);
        let b = interner.intern(&mut heap, b"transient");
        // Not the same slot number necessarily, but a fresh allocation
        // happened rather than reusing stale bookkeeping silently.
        assert!(matches!(heap.get(b), Obj::Str(_)));
    }
}
