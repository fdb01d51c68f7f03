// Tagged value representation (component A).
//
// Values are a small `Copy` sum type. Heap data never lives inside a
// `Value` directly -- it is addressed through an `ObjRef`, a plain index
// into the context's `Heap` arena (see `heap.rs`). This is the
// idiomatic-Rust stand-in for the raw object pointer a C-shaped VM would
// carry inline: it keeps `Value` `Copy`, sidesteps lifetime bookkeeping
// across GC moves (the arena never moves live slots, so the index is
// stable for the object's whole life), and makes "is this a GC object"
// a single match arm.

use enumflags2::{bitflags, BitFlags};
use std::fmt;

/// Index into `Heap::slots`. Never constructed by hand outside of
/// `heap.rs`; always the result of an allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjRef(pub u32);

impl ObjRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
    /// Marks empty slots in hash tables and unassigned globals. Never
    /// observable from user code.
    Undefined,
    /// Signals that a native function already pushed a raised exception
    /// object onto the operand stack and the VM should treat the call
    /// as having thrown rather than returned a value.
    Exception,
}

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TypeTag {
    Nil = 0b0000_0001,
    Bool = 0b0000_0010,
    Number = 0b0000_0100,
    String = 0b0000_1000,
    Function = 0b0001_0000,
    Class = 0b0010_0000,
    Instance = 0b0100_0000,
    Collection = 0b1000_0000,
}

pub type TypeSet = BitFlags<TypeTag>;

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TypeTag::Nil => "nil",
            TypeTag::Bool => "bool",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::Function => "function",
            TypeTag::Class => "class",
            TypeTag::Instance => "instance",
            TypeTag::Collection => "collection",
        };
        write!(f, "{}", name)
    }
}

impl Value {
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[inline]
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    #[inline]
    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Bit-pattern equality for the two primitive identity-comparable
    /// cases (`Number`, `Bool`, `Nil`). Object equality is handled one
    /// level up where the heap is reachable (see `value_eq` in `vm.rs`),
    /// since instances may dispatch to a user `equals` method.
    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}
