// Mark-and-sweep collector. Tracing walks a worklist of gray objects
// rather than recursing, so a long linked structure (a big array, a
// deep class hierarchy) can't blow the Rust call stack the way a
// straightforward recursive marker would.

use crate::heap::Heap;
use crate::value::{ObjRef, Value};

pub struct GcStats {
    pub freed: Vec<ObjRef>,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

/// Runs one full mark-sweep cycle. `roots` should include every
/// `ObjRef` directly reachable from outside the heap: the operand
/// stack, open upvalues, globals, the module table, and anything a
/// compiler-in-progress is holding onto.
pub fn collect_garbage(heap: &mut Heap, roots: impl IntoIterator<Item = ObjRef>) -> GcStats {
    let bytes_before = heap.bytes_allocated;
    heap.unmark_all();
    let mut worklist: Vec<ObjRef> = roots.into_iter().collect();
    for r in &worklist {
        heap.mark(*r);
    }
    while let Some(r) = worklist.pop() {
        let mut children = Vec::new();
        heap.get(r).trace(&mut children);
        for child in children {
            if heap.mark(child) {
                worklist.push(child);
            }
        }
    }
    let freed = heap.sweep();
    GcStats { freed, bytes_before, bytes_after: heap.bytes_allocated }
}

/// Collects every `ObjRef` transitively held by a slice of `Value`s,
/// used to build the root set out of the operand stack and similar
/// flat value collections.
pub fn refs_in(values: &[Value]) -> impl Iterator<Item = ObjRef> + '_ {
    values.iter().filter_map(|v| v.as_obj())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ArrayObj, LString, Obj};

    #[test]
    fn unreferenced_object_is_collected() {
        let mut heap = Heap::new();
        let _garbage = heap.alloc(Obj::Str(LString::new(b"garbage")));
        let stats = collect_garbage(&mut heap, std::iter::empty());
        assert_eq!(stats.freed.len(), 1);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn rooted_object_and_its_children_survive() {
        let mut heap = Heap::new();
        let s = heap.alloc(Obj::Str(LString::new(b"kept")));
        let arr = heap.alloc(Obj::Array(ArrayObj { items: vec![Value::Obj(s)] }));
        let stats = collect_garbage(&mut heap, vec![arr]);
        assert!(stats.freed.is_empty());
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn unrooted_chain_is_fully_reclaimed() {
        let mut heap = Heap::new();
        let s = heap.alloc(Obj::Str(LString::new(b"orphan")));
        let _arr = heap.alloc(Obj::Array(ArrayObj { items: vec![Value::Obj(s)] }));
        let stats = collect_garbage(&mut heap, std::iter::empty());
        assert_eq!(stats.freed.len(), 2);
    }
}
