// Native function surface: builtins implemented in Rust rather than
// compiled bytecode, plus the registration API embedders use to add
// their own.

use crate::error::{RResult, RuntimeError};
use crate::value::{ObjRef, TypeSet, TypeTag, Value};
use crate::vm::Vm;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

pub type NativeFn = fn(&mut Vm, &[Value]) -> RResult<Value>;

/// A native function that closes over host state (as opposed to a
/// plain `fn` pointer). Embedders implement this to register callbacks
/// carrying their own captured data.
pub trait NativeClosureFn {
    fn call(&self, vm: &mut Vm, args: &[Value]) -> RResult<Value>;
}

impl<F> NativeClosureFn for F
where
    F: Fn(&mut Vm, &[Value]) -> RResult<Value>,
{
    fn call(&self, vm: &mut Vm, args: &[Value]) -> RResult<Value> {
        self(vm, args)
    }
}

pub fn register_native_function(vm: &mut Vm, name: &str, arity: u8, has_varargs: bool, func: NativeFn) {
    vm.define_native(name, arity, has_varargs, func);
}

pub fn register_native_closure(
    vm: &mut Vm,
    name: &str,
    arity: u8,
    has_varargs: bool,
    func: Rc<dyn NativeClosureFn>,
) {
    vm.define_native_closure(name, arity, has_varargs, func);
}

/// Installs the builtins every fresh `Context` gets for free: `clock`,
/// `type`, `len`, `print`, and the regex-backed string helpers.
pub fn install_builtins(vm: &mut Vm) {
    register_native_function(vm, "clock", 0, false, native_clock);
    register_native_function(vm, "type", 1, false, native_type);
    register_native_function(vm, "len", 1, false, native_len);
    register_native_function(vm, "print", 0, true, native_print);
    register_native_function(vm, "find", 2, false, native_find);
    register_native_function(vm, "matches", 2, false, native_matches);
    register_native_function(vm, "gsub", 3, false, native_gsub);
}

fn native_clock(_vm: &mut Vm, _args: &[Value]) -> RResult<Value> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| RuntimeError::Custom(e.to_string()))?;
    Ok(Value::Number(elapsed.as_secs_f64()))
}

fn native_type(vm: &mut Vm, args: &[Value]) -> RResult<Value> {
    let name = vm.type_name_of(&args[0]);
    Ok(vm.intern_string(name.as_bytes()))
}

fn native_len(vm: &mut Vm, args: &[Value]) -> RResult<Value> {
    vm.len_of(&args[0]).map(|n| Value::Number(n as f64))
}

fn native_print(vm: &mut Vm, args: &[Value]) -> RResult<Value> {
    let mut parts = Vec::with_capacity(args.len());
    for a in args {
        parts.push(vm.stringify(a)?);
    }
    println!("{}", parts.join("\t"));
    Ok(Value::Nil)
}

/// Joins the display names of every tag set in `allowed`, in
/// declaration order, for an "expected X or Y" error message.
fn describe_types(allowed: TypeSet) -> String {
    allowed.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" or ")
}

fn expect_type(vm: &Vm, v: &Value, allowed: TypeSet, which: &str) -> RResult<()> {
    let tag = vm.type_tag_of(v);
    if allowed.contains(tag) {
        Ok(())
    } else {
        Err(RuntimeError::TypeError(format!("{} must be a {}", which, describe_types(allowed))))
    }
}

fn expect_string<'a>(vm: &'a Vm, v: &Value, which: &str) -> RResult<std::borrow::Cow<'a, str>> {
    expect_type(vm, v, TypeTag::String.into(), which)?;
    match v.as_obj().map(|r| vm.heap_get(r)) {
        Some(crate::object::Obj::Str(s)) => Ok(s.as_str()),
        _ => unreachable!("expect_type already confirmed this is a string"),
    }
}

fn compile_regex(pattern: &str) -> RResult<regex::Regex> {
    regex::Regex::new(pattern).map_err(|e| RuntimeError::Custom(format!("bad pattern: {}", e)))
}

fn native_find(vm: &mut Vm, args: &[Value]) -> RResult<Value> {
    let haystack = expect_string(vm, &args[0], "haystack")?.into_owned();
    let pattern = expect_string(vm, &args[1], "pattern")?.into_owned();
    let re = compile_regex(&pattern)?;
    match re.find(&haystack) {
        Some(m) => Ok(Value::Number(m.start() as f64)),
        None => Ok(Value::Nil),
    }
}

fn native_matches(vm: &mut Vm, args: &[Value]) -> RResult<Value> {
    let haystack = expect_string(vm, &args[0], "haystack")?.into_owned();
    let pattern = expect_string(vm, &args[1], "pattern")?.into_owned();
    let re = compile_regex(&pattern)?;
    Ok(Value::Bool(re.is_match(&haystack)))
}

fn native_gsub(vm: &mut Vm, args: &[Value]) -> RResult<Value> {
    let haystack = expect_string(vm, &args[0], "haystack")?.into_owned();
    let pattern = expect_string(vm, &args[1], "pattern")?.into_owned();
    let replacement = expect_string(vm, &args[2], "replacement")?.into_owned();
    let re = compile_regex(&pattern)?;
    let replaced = re.replace_all(&haystack, replacement.as_str());
    Ok(vm.intern_string(replaced.as_bytes()))
}

pub fn native_name_obj(vm: &mut Vm, name: &str) -> ObjRef {
    match vm.intern_string(name.as_bytes()) {
        Value::Obj(r) => r,
        _ => unreachable!("intern_string always returns Value::Obj"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_fn_is_a_plain_function_pointer() {
        let f: NativeFn = native_clock;
        assert!(std::mem::size_of_val(&f) <= std::mem::size_of::<usize>() * 2);
    }
}
