// Opt-in serialization of a compiled `Chunk`, for embedders that want
// to ship precompiled bytecode instead of recompiling from source on
// every run. Not load-bearing: the VM only ever executes `Chunk`s built
// directly by the compiler, and nothing else in this crate reads or
// writes this format.
//
// Only the constant kinds a function prototype's constant pool
// actually needs at the top level -- `nil`, booleans, numbers, and
// interned strings -- round-trip. A chunk holding any other constant
// kind (nested function prototypes, in particular) can't be serialized
// this way.

use crate::chunk::Chunk;
use crate::object::Obj;
use crate::value::Value;
use crate::vm::Vm;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize)]
enum SerializedValue {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
}

#[derive(Serialize, Deserialize)]
struct SerializedChunk {
    code: Vec<u8>,
    constants: Vec<SerializedValue>,
    line_runs: Vec<(u32, u32)>,
}

#[derive(Debug)]
pub enum SerializeError {
    UnsupportedConstant(&'static str),
    Json(serde_json::Error),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SerializeError::UnsupportedConstant(msg) => write!(f, "{}", msg),
            SerializeError::Json(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SerializeError {}

pub fn to_json(vm: &Vm, chunk: &Chunk) -> Result<String, SerializeError> {
    let mut constants = Vec::with_capacity(chunk.constants.len());
    for c in &chunk.constants {
        constants.push(match c {
            Value::Nil => SerializedValue::Nil,
            Value::Bool(b) => SerializedValue::Bool(*b),
            Value::Number(n) => SerializedValue::Number(*n),
            Value::Obj(r) => match vm.heap_get(*r) {
                Obj::Str(s) => SerializedValue::Str(s.as_str().into_owned()),
                _ => return Err(SerializeError::UnsupportedConstant(
                    "only nil, bool, number, and string constants can be serialized",
                )),
            },
            Value::Undefined | Value::Exception => {
                return Err(SerializeError::UnsupportedConstant("sentinel values cannot be serialized"))
            }
        });
    }
    let serialized = SerializedChunk { code: chunk.code.clone(), constants, line_runs: chunk.line_runs() };
    serde_json::to_string(&serialized).map_err(SerializeError::Json)
}

pub fn from_json(vm: &mut Vm, json: &str) -> Result<Chunk, SerializeError> {
    let parsed: SerializedChunk = serde_json::from_str(json).map_err(SerializeError::Json)?;
    let constants = parsed
        .constants
        .into_iter()
        .map(|c| match c {
            SerializedValue::Nil => Value::Nil,
            SerializedValue::Bool(b) => Value::Bool(b),
            SerializedValue::Number(n) => Value::Number(n),
            SerializedValue::Str(s) => vm.intern_string(s.as_bytes()),
        })
        .collect();
    Ok(Chunk::from_parts(parsed.code, constants, parsed.line_runs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmconfig::VmConfig;

    #[test]
    fn round_trips_code_and_primitive_constants() {
        let mut vm = Vm::new(VmConfig::default());
        let mut chunk = Chunk::new();
        let s = vm.intern_string(b"hello");
        let idx = chunk.add_constant(s);
        chunk.write_op(crate::chunk::OpCode::Const16, 1);
        chunk.write_u16(idx, 1);

        let json = to_json(&vm, &chunk).unwrap();
        let restored = from_json(&mut vm, &json).unwrap();

        assert_eq!(restored.code, chunk.code);
        assert_eq!(restored.line_runs(), chunk.line_runs());
        match restored.constants[idx as usize] {
            Value::Obj(r) => match vm.heap_get(r) {
                Obj::Str(s) => assert_eq!(&*s.bytes, b"hello"),
                _ => panic!("expected string constant"),
            },
            _ => panic!("expected object constant"),
        }
    }

    #[test]
    fn rejects_chunks_with_non_primitive_constants() {
        let mut vm = Vm::new(VmConfig::default());
        let mut chunk = Chunk::new();
        let f = vm.alloc_function(crate::object::LFunction::new());
        chunk.add_constant(Value::Obj(f));
        assert!(to_json(&vm, &chunk).is_err());
    }
}
