// Builtin exception classes every fresh `Vm` carries: `Exception`,
// `RuntimeException` (what a raised `RuntimeError` gets wrapped in),
// and the marker class `Iterator` that `FOREACH_INIT` falls back to
// when a value isn't backed by an explicit `iterator()` method.
//
// These are ordinary classes built the same way user `class` bodies
// are -- `new_class`/`inherit`/`add_field`/`add_method` -- just invoked
// from Rust instead of emitted bytecode.

use crate::error::RResult;
use crate::object::Obj;
use crate::value::Value;
use crate::vm::{BuiltinClasses, Vm};

pub fn install_builtin_classes(vm: &mut Vm) -> BuiltinClasses {
    let exception_name = vm.intern_string(b"Exception");
    let exception = vm.new_class(exception_name, None);
    let message_name = vm.intern_string(b"message");
    vm.add_field(exception, message_name).ok();
    let init = native_method(vm, "Exception", init_message_field);
    vm.add_method(exception, exception_name, init).ok();

    let runtime_name = vm.intern_string(b"RuntimeException");
    let runtime_exception = vm.new_class(runtime_name, None);
    vm.inherit(runtime_exception, exception).ok();
    let runtime_init = native_method(vm, "RuntimeException", init_message_field);
    vm.add_method(runtime_exception, runtime_name, runtime_init).ok();

    let iterator_name = vm.intern_string(b"Iterator");
    let iterator = vm.new_class(iterator_name, None);

    BuiltinClasses {
        exception: exception.as_obj().unwrap(),
        runtime_exception: runtime_exception.as_obj().unwrap(),
        iterator: iterator.as_obj().unwrap(),
    }
}

fn native_method(vm: &mut Vm, name: &str, func: crate::native::NativeFn) -> Value {
    let r = vm.heap.alloc(Obj::Native(crate::object::NativeObj::Fn {
        name: std::rc::Rc::from(name),
        arity: 1,
        has_varargs: false,
        func,
    }));
    Value::Obj(r)
}

/// Shared `Exception`/`RuntimeException` constructor body: stores the
/// single constructor argument in the `message` field inherited from
/// `Exception`.
fn init_message_field(vm: &mut Vm, args: &[Value]) -> RResult<Value> {
    let this = args[0];
    let message = args.get(1).copied().unwrap_or(Value::Nil);
    if let Value::Obj(r) = this {
        let class = match vm.heap_get(r) {
            Obj::Instance(i) => i.class,
            _ => return Ok(Value::Nil),
        };
        if let Some(&idx) = vm.field_index(class, "message") {
            if let Obj::Instance(i) = vm.heap.get_mut(r) {
                if idx as usize >= i.fields.len() {
                    i.fields.resize(idx as usize + 1, Value::Nil);
                }
                i.fields[idx as usize] = message;
            }
        }
    }
    Ok(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmconfig::VmConfig;

    #[test]
    fn runtime_exception_is_an_exception() {
        let mut vm = Vm::new(VmConfig::default());
        let builtins = vm.builtins.as_ref().unwrap();
        let subject = Value::Obj(builtins.runtime_exception);
        let ancestor = Value::Obj(builtins.exception);
        let inst = vm.heap.alloc(Obj::Instance(crate::object::InstanceObj {
            class: builtins.runtime_exception,
            fields: vec![Value::Nil],
            identity_hash: 0,
        }));
        let _ = subject;
        assert!(vm.instance_of(Value::Obj(inst), ancestor).unwrap());
    }

    #[test]
    fn constructing_a_runtime_exception_sets_message() {
        let mut vm = Vm::new(VmConfig::default());
        let builtins = vm.builtins.as_ref().unwrap();
        let class = builtins.runtime_exception;
        let msg = vm.intern_string(b"oops");
        let result = vm.invoke_value(Value::Obj(class), vec![msg]).unwrap();
        let r = result.as_obj().unwrap();
        match vm.heap_get(r) {
            Obj::Instance(i) => assert!(i.fields[0].raw_eq(&msg)),
            _ => panic!("expected instance"),
        }
    }
}
