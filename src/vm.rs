// The dispatch loop: a `match` over `OpCode` indexed by a per-frame
// instruction pointer, plus everything the loop needs reachable from
// one place -- operand stack, frames, globals, heap, open upvalues.
//
// Calls into user bytecode (running a method to compute a hash, or to
// dispatch `equals`) go back through `run`, so the interpreter is
// re-entrant: `run` stops once the frame stack unwinds to the depth it
// started at, and returns the value left on the stack.

use crate::chunk::OpCode;
use crate::error::{InterpretError, RResult, RuntimeError};
use crate::frame::{adjust_args, CallFrame, HandlerEntry};
use crate::gc::collect_garbage;
use crate::heap::Heap;
use crate::native::NativeClosureFn;
use crate::object::{
    ArrayObj, BoundMethodObj, ClassObj, InstanceObj, LClosure, LFunction, MapObj, MemberRef,
    NativeObj, Obj, TupleObj, UpvalueObj,
};
use crate::strings::StringInterner;
use crate::table::{TableIter, ValueTable};
use crate::value::{ObjRef, TypeTag, Value};
use crate::vmconfig::VmConfig;
use std::cell::RefCell;
use std::convert::TryFrom;
use std::rc::Rc;

pub struct BuiltinClasses {
    pub exception: ObjRef,
    pub runtime_exception: ObjRef,
    pub iterator: ObjRef,
}

pub struct Vm {
    pub heap: Heap,
    pub strings: StringInterner,
    pub globals: ValueTable,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Open upvalues, kept sorted by descending stack slot so closing
    /// everything at or above a watermark is a simple prefix scan.
    pub open_upvalues: Vec<ObjRef>,
    pub modules: std::collections::HashMap<String, bool>,
    pub builtins: Option<BuiltinClasses>,
    pub config: VmConfig,
    pub module_loader: Option<Rc<dyn crate::modules::ModuleLoader>>,
    next_gc: usize,
    handling_exception: u32,
    /// Set by `unwind_to_handler` when a second error arrives while an
    /// outer call to it is still on the Rust call stack -- i.e. raising
    /// while already unwinding a previous raise. Consumed by `run` to
    /// report a `DoubleFault` instead of silently discarding whichever
    /// of the two errors loses the race.
    double_fault: Option<String>,
    /// Largest prime ever handed out as a class's `classId` base. Grows
    /// by on-demand trial division, one `Vm` at a time -- no shared
    /// table, no wraparound.
    last_class_prime: u128,
    /// Extra GC roots held outside the heap: objects allocated by native
    /// code or the compiler before they're reachable from any traced
    /// root. `protect`/`unprotect` bracket the window where an object
    /// would otherwise be invisible to `collect`.
    protected: Vec<ObjRef>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            strings: StringInterner::new(),
            globals: ValueTable::new(),
            stack: Vec::with_capacity(config.initial_stack_capacity),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            modules: std::collections::HashMap::new(),
            builtins: None,
            module_loader: None,
            next_gc: config.initial_gc_threshold,
            config,
            handling_exception: 0,
            double_fault: None,
            last_class_prime: 1,
            protected: Vec::new(),
        };
        let builtins = crate::exceptions::install_builtin_classes(&mut vm);
        vm.builtins = Some(builtins);
        crate::native::install_builtins(&mut vm);
        vm
    }

    // -- heap/native plumbing used by native.rs -----------------------

    pub fn heap_get(&self, r: ObjRef) -> &Obj {
        self.heap.get(r)
    }

    pub fn intern_string(&mut self, bytes: &[u8]) -> Value {
        Value::Obj(self.strings.intern(&mut self.heap, bytes))
    }

    pub fn type_name_of(&self, v: &Value) -> &'static str {
        match v {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Undefined | Value::Exception => "nil",
            Value::Obj(r) => self.heap.get(*r).type_name(),
        }
    }

    /// Coarse type classification used for native argument validation
    /// (see `native::expect_type`). Distinct from `type_name_of`, which
    /// reports the exact heap kind for error messages and `type()`.
    pub fn type_tag_of(&self, v: &Value) -> TypeTag {
        match v {
            Value::Nil | Value::Undefined | Value::Exception => TypeTag::Nil,
            Value::Bool(_) => TypeTag::Bool,
            Value::Number(_) => TypeTag::Number,
            Value::Obj(r) => match self.heap.get(*r) {
                Obj::Str(_) => TypeTag::String,
                Obj::Function(_) | Obj::Closure(_) | Obj::Native(_) | Obj::BoundMethod(_) => {
                    TypeTag::Function
                }
                Obj::Class(_) => TypeTag::Class,
                Obj::Instance(_) => TypeTag::Instance,
                Obj::Array(_) | Obj::Tuple(_) | Obj::Map(_) => TypeTag::Collection,
                Obj::Upvalue(_) => TypeTag::Instance,
            },
        }
    }

    /// Roots `r` outside the heap until a matching `unprotect`. Used by
    /// native code (and the compiler) to protect an object it just
    /// allocated across further allocations that might trigger a GC
    /// cycle before the object is reachable from any other root.
    pub fn protect(&mut self, r: ObjRef) {
        self.protected.push(r);
    }

    /// Removes one matching protection added by `protect`. If `r` was
    /// protected more than once, only one instance is released.
    pub fn unprotect(&mut self, r: ObjRef) {
        if let Some(pos) = self.protected.iter().rposition(|p| *p == r) {
            self.protected.remove(pos);
        }
    }

    pub fn len_of(&self, v: &Value) -> RResult<usize> {
        match v {
            Value::Obj(r) => match self.heap.get(*r) {
                Obj::Str(s) => Ok(s.len()),
                Obj::Array(a) => Ok(a.items.len()),
                Obj::Tuple(t) => Ok(t.items.len()),
                Obj::Map(m) => Ok(m.table.len()),
                _ => Err(RuntimeError::TypeError(format!("{} has no length", self.type_name_of(v)))),
            },
            _ => Err(RuntimeError::TypeError(format!("{} has no length", self.type_name_of(v)))),
        }
    }

    pub fn stringify(&mut self, v: &Value) -> RResult<String> {
        Ok(match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Undefined | Value::Exception => "nil".to_string(),
            Value::Obj(r) => match self.heap.get(*r) {
                Obj::Str(s) => s.as_str().into_owned(),
                Obj::Function(f) => format!("<fn {}>", self.func_display_name(f)),
                Obj::Closure(c) => {
                    let f = self.heap.get(c.function);
                    if let Obj::Function(f) = f {
                        format!("<fn {}>", self.func_display_name(f))
                    } else {
                        "<fn>".to_string()
                    }
                }
                Obj::Native(n) => format!("<native fn {}>", n.name()),
                Obj::Class(c) => {
                    let name = c.name;
                    format!("<class {}>", self.stringify(&Value::Obj(name))?)
                }
                Obj::Instance(i) => {
                    let class_name = if let Obj::Class(c) = self.heap.get(i.class) {
                        Some(c.name)
                    } else {
                        None
                    };
                    match class_name {
                        Some(n) => format!("<{} instance>", self.stringify(&Value::Obj(n))?),
                        None => "<instance>".to_string(),
                    }
                }
                Obj::BoundMethod(_) => "<bound method>".to_string(),
                Obj::Array(a) => {
                    let items = a.items.clone();
                    let parts: RResult<Vec<String>> = items.iter().map(|v| self.stringify(v)).collect();
                    format!("[{}]", parts?.join(", "))
                }
                Obj::Tuple(t) => {
                    let items: Vec<Value> = t.items.to_vec();
                    let parts: RResult<Vec<String>> = items.iter().map(|v| self.stringify(v)).collect();
                    format!("({})", parts?.join(", "))
                }
                Obj::Map(_) => "<map>".to_string(),
                Obj::Upvalue(_) => "<upvalue>".to_string(),
            },
        })
    }

    fn func_display_name(&self, f: &LFunction) -> String {
        match f.name {
            Some(r) => match self.heap.get(r) {
                Obj::Str(s) => s.as_str().into_owned(),
                _ => "?".to_string(),
            },
            None => "script".to_string(),
        }
    }

    pub fn define_native(&mut self, name: &str, arity: u8, has_varargs: bool, func: crate::native::NativeFn) {
        let r = self.heap.alloc(Obj::Native(NativeObj::Fn { name: Rc::from(name), arity, has_varargs, func }));
        let key = self.intern_string(name.as_bytes());
        self.define_global(key, Value::Obj(r));
    }

    pub fn define_native_closure(
        &mut self,
        name: &str,
        arity: u8,
        has_varargs: bool,
        func: Rc<dyn NativeClosureFn>,
    ) {
        let r = self.heap.alloc(Obj::Native(NativeObj::Closure { name: Rc::from(name), arity, has_varargs, func }));
        let key = self.intern_string(name.as_bytes());
        self.define_global(key, Value::Obj(r));
    }

    pub fn define_global(&mut self, key: Value, value: Value) {
        let key_ref = key.as_obj().expect("global key must be an interned string");
        let hash = self.string_hash(key_ref);
        self.globals.insert(key, hash, value, |k| Ok(k.as_obj() == Some(key_ref))).ok();
    }

    fn string_hash(&self, r: ObjRef) -> u64 {
        match self.heap.get(r) {
            Obj::Str(s) => s.hash,
            _ => r.0 as u64,
        }
    }

    // -- value semantics shared by equality/hash/map ops ---------------

    pub fn hash_value(&mut self, v: &Value) -> RResult<u64> {
        Ok(match v {
            Value::Nil => 0,
            Value::Bool(b) => *b as u64,
            Value::Number(n) => n.to_bits(),
            Value::Undefined | Value::Exception => 0,
            Value::Obj(r) => match self.heap.get(*r) {
                Obj::Str(s) => s.hash,
                Obj::Instance(_) => {
                    let class = self.instance_class(*r)?;
                    let method = if let Obj::Class(c) = self.heap.get(class) { c.hash_code_method.clone() } else { None };
                    match method {
                        Some(m) => {
                            let result = self.call_bound(m, Value::Obj(*r), vec![])?;
                            result.as_number().map(|n| n.to_bits()).unwrap_or(r.0 as u64)
                        }
                        None => r.0 as u64,
                    }
                }
                _ => r.0 as u64,
            },
        })
    }

    pub fn values_equal(&mut self, a: &Value, b: &Value) -> RResult<bool> {
        if a.raw_eq(b) {
            return Ok(true);
        }
        if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
            let both_instances = matches!(self.heap.get(*ra), Obj::Instance(_)) && matches!(self.heap.get(*rb), Obj::Instance(_));
            if both_instances {
                let class = self.instance_class(*ra)?;
                let method = if let Obj::Class(c) = self.heap.get(class) { c.equals_method.clone() } else { None };
                if let Some(m) = method {
                    let result = self.call_bound(m, *a, vec![*b])?;
                    return Ok(!result.is_falsey());
                }
            }
        }
        Ok(false)
    }

    fn instance_class(&self, r: ObjRef) -> RResult<ObjRef> {
        match self.heap.get(r) {
            Obj::Instance(i) => Ok(i.class),
            _ => Err(RuntimeError::TypeError("not an instance".to_string())),
        }
    }

    /// Invokes a callable value with an explicit receiver already bound
    /// (used by `hashCode`/`equals` dispatch and by bound-method calls).
    pub(crate) fn call_bound(&mut self, callee: Value, receiver: Value, mut args: Vec<Value>) -> RResult<Value> {
        args.insert(0, receiver);
        self.invoke_value(callee, args)
    }

    /// Calls any callable `Value` and runs until it returns, regardless
    /// of the VM's current call depth.
    pub fn invoke_value(&mut self, callee: Value, args: Vec<Value>) -> RResult<Value> {
        let stop_depth = self.frames.len();
        self.stack.push(callee);
        let argc = args.len() as u8;
        for a in &args {
            self.stack.push(*a);
        }
        self.call_value(argc)?;
        match self.run(stop_depth) {
            Ok(v) => Ok(v),
            Err(e) => Err(RuntimeError::Custom(e.to_string())),
        }
    }

    /// Allocates a freshly compiled function prototype into the heap so
    /// it can live in an enclosing chunk's constant pool. The compiler
    /// is the only caller outside this module.
    pub(crate) fn alloc_function(&mut self, f: LFunction) -> ObjRef {
        self.alloc(Obj::Function(f))
    }

    // -- allocation helper with GC hook --------------------------------

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        // Collect *before* inserting: the object isn't reachable from
        // any root yet, so collecting after would risk sweeping the
        // one we're about to return.
        if self.heap.bytes_allocated > self.next_gc {
            self.collect();
        }
        self.heap.alloc(obj)
    }

    fn collect(&mut self) {
        let mut roots: Vec<ObjRef> = crate::gc::refs_in(&self.stack).collect();
        roots.extend(self.open_upvalues.iter().copied());
        for (k, v) in self.globals.iter_live() {
            if let Some(r) = k.as_obj() {
                roots.push(r);
            }
            if let Some(r) = v.as_obj() {
                roots.push(r);
            }
        }
        for frame in &self.frames {
            roots.push(frame.closure);
            roots.extend(crate::gc::refs_in(&frame.varargs));
        }
        if let Some(b) = &self.builtins {
            roots.push(b.exception);
            roots.push(b.runtime_exception);
            roots.push(b.iterator);
        }
        roots.extend(self.protected.iter().copied());
        let stats = collect_garbage(&mut self.heap, roots);
        self.strings.remove_freed(&stats.freed);
        self.next_gc = ((self.heap.bytes_allocated as f64) * self.config.gc_growth_factor) as usize;
        self.next_gc = self.next_gc.max(self.config.min_gc_threshold);
        trace!("gc: freed {} objects, {} -> {} bytes, next at {}", stats.freed.len(), stats.bytes_before, stats.bytes_after, self.next_gc);
    }

    // -- top-level entry ------------------------------------------------

    pub fn interpret(&mut self, function: ObjRef) -> Result<(), InterpretError> {
        self.protect(function);
        let closure = self.alloc(Obj::Closure(LClosure { function, upvalues: Vec::new() }));
        self.frames.push(CallFrame::new(closure, 0, 0));
        self.unprotect(function);
        self.run(0).map(|_| ())
    }

    /// Runs opcodes until `self.frames.len() == stop_depth`, i.e. until
    /// the frame that was on top when this was called has returned.
    /// Returns the value that frame left behind.
    fn run(&mut self, stop_depth: usize) -> Result<Value, InterpretError> {
        loop {
            if self.frames.len() <= stop_depth {
                return Ok(self.stack.pop().unwrap_or(Value::Nil));
            }
            match self.step() {
                Ok(Some(())) => continue,
                Ok(None) => return Ok(self.stack.pop().unwrap_or(Value::Nil)),
                Err(e) => {
                    if let Some(exc) = self.unwind_to_handler(e.clone()) {
                        self.stack.push(exc);
                        continue;
                    }
                    if let Some(first) = self.double_fault.take() {
                        self.frames.clear();
                        self.stack.clear();
                        let second = self.error_summary(&e);
                        error!("double fault: {} while still handling {}", second, first);
                        return Err(InterpretError::DoubleFault { first, second });
                    }
                    return Err(self.fatal(e));
                }
            }
        }
    }

    fn fatal(&mut self, e: RuntimeError) -> InterpretError {
        let trace = self.stack_trace();
        debug!("unhandled runtime error, unwinding {} frames: {}", self.frames.len(), e);
        self.frames.clear();
        self.stack.clear();
        let (class_name, message) = match e {
            RuntimeError::Raised(v) => self.describe_exception(v),
            other => ("RuntimeException".to_string(), other.to_string()),
        };
        InterpretError::Runtime { class_name, message, stack_trace: trace }
    }

    /// Reports the class name and message text of an uncaught thrown
    /// value for `InterpretError::Runtime`. Reads the `message` field
    /// when the value is an `Exception`-shaped instance; anything else
    /// (a thrown string, number, etc.) just gets stringified.
    fn describe_exception(&mut self, exc: Value) -> (String, String) {
        if let Value::Obj(r) = exc {
            if let Obj::Instance(inst) = self.heap.get(r) {
                let class = inst.class;
                let message_val = match self.field_index(class, "message").copied() {
                    Some(idx) => match self.heap.get(r) {
                        Obj::Instance(i) => i.fields.get(idx as usize).copied().unwrap_or(Value::Nil),
                        _ => Value::Nil,
                    },
                    None => exc,
                };
                let class_name = match self.heap.get(class) {
                    Obj::Class(c) => self.string_value(c.name),
                    _ => "Exception".to_string(),
                };
                let message = self.stringify(&message_val).unwrap_or_else(|_| "?".to_string());
                return (class_name, message);
            }
        }
        ("RuntimeException".to_string(), self.stringify(&exc).unwrap_or_else(|_| "?".to_string()))
    }

    fn stack_trace(&self) -> String {
        let mut out = String::new();
        for (i, frame) in self.frames.iter().enumerate().rev() {
            let (line, name) = if let Obj::Closure(c) = self.heap.get(frame.closure) {
                if let Obj::Function(f) = self.heap.get(c.function) {
                    (f.chunk.get_line(frame.ip.saturating_sub(1)), self.frame_label(f))
                } else {
                    (0, "?".to_string())
                }
            } else {
                (0, "?".to_string())
            };
            out.push_str(&format!("#{} [line {}] in {}()\n", i, line, name));
        }
        out
    }

    /// `ClassName.method` for a method, bare `name` otherwise, `script`
    /// for the top-level frame with no name at all.
    fn frame_label(&self, f: &LFunction) -> String {
        let name = f.name.map(|r| self.string_value(r)).unwrap_or_else(|| "script".to_string());
        match f.owning_class {
            Some(class_ref) => {
                let class_name = match self.heap.get(class_ref) {
                    Obj::Class(c) => self.string_value(c.name),
                    _ => return name,
                };
                format!("{}.{}", class_name, name)
            }
            None => name,
        }
    }

    fn string_value(&self, r: ObjRef) -> String {
        match self.heap.get(r) {
            Obj::Str(s) => s.as_str().to_string(),
            _ => String::new(),
        }
    }

    /// On a thrown error, searches frames from innermost outward for a
    /// handler table entry that accepts it. Returns the exception value
    /// to push if caught, after resetting stack/ip to the handler site.
    fn unwind_to_handler(&mut self, err: RuntimeError) -> Option<Value> {
        if self.handling_exception > 0 {
            self.double_fault = Some(self.error_summary(&err));
            return None;
        }
        self.handling_exception += 1;
        let exc = match err {
            RuntimeError::Raised(v) => v,
            other => self.synthesize_exception(&other),
        };
        let result = self.find_and_jump(exc);
        self.handling_exception -= 1;
        result
    }

    /// A human-readable summary of an error for logging/double-fault
    /// reporting, where `RuntimeError`'s own `Display` can't reach the
    /// heap to name a raised object's real class.
    fn error_summary(&mut self, err: &RuntimeError) -> String {
        match err {
            RuntimeError::Raised(v) => {
                let (class_name, message) = self.describe_exception(*v);
                format!("{}: {}", class_name, message)
            }
            other => other.to_string(),
        }
    }

    fn synthesize_exception(&mut self, err: &RuntimeError) -> Value {
        let class = self.builtins.as_ref().map(|b| b.runtime_exception);
        let message = self.intern_string(err.to_string().as_bytes());
        match class {
            Some(c) => {
                let r = self.heap.alloc(Obj::Instance(InstanceObj { class: c, fields: vec![message], identity_hash: 0 }));
                Value::Obj(r)
            }
            None => message,
        }
    }

    /// Walks frames innermost-first, and within each frame walks its
    /// handler stack innermost-first, looking for a catch clause whose
    /// declared class accepts `exc` (or a catch-all). Frames and
    /// handlers checked and rejected along the way are discarded, since
    /// a throw that isn't caught there can't be re-entered.
    fn find_and_jump(&mut self, exc: Value) -> Option<Value> {
        let mut frame_idx = self.frames.len();
        while frame_idx > 0 {
            frame_idx -= 1;
            let ip = self.frames[frame_idx].ip;
            let handler_count = self.frames[frame_idx].handler_count;
            let mut found = None;
            for i in (0..handler_count).rev() {
                let entry = self.frames[frame_idx].handlers[i];
                if ip < entry.try_start || ip >= entry.try_end {
                    continue;
                }
                let accepts = matches!(entry.catch_class, Value::Nil)
                    || self.instance_of(exc, entry.catch_class).unwrap_or(false);
                if accepts {
                    found = Some((i, entry));
                    break;
                }
            }
            if let Some((i, entry)) = found {
                self.frames.truncate(frame_idx + 1);
                self.frames[frame_idx].handler_count = i;
                self.stack.truncate(self.frames[frame_idx].base + entry.stack_depth);
                self.frames[frame_idx].ip = entry.handler_ip;
                return Some(exc);
            }
        }
        None
    }

    // -- one opcode; Ok(Some(())) to continue, Ok(None) when the whole
    // run() call should stop (outermost frame popped through here).
    fn step(&mut self) -> RResult<Option<()>> {
        let byte = {
            let frame = self.frames.last().unwrap();
            let function = self.function_of(frame.closure);
            if frame.ip >= function.chunk.code.len() {
                return Ok(None);
            }
            function.chunk.code[frame.ip]
        };
        let op = OpCode::try_from(byte).map_err(|_| RuntimeError::Custom("bad opcode".to_string()))?;
        self.frames.last_mut().unwrap().ip += 1;

        match op {
            OpCode::Const8 => {
                let idx = self.fetch_u8();
                let v = self.constant_at(idx as u16);
                self.stack.push(v);
            }
            OpCode::Const16 => {
                let idx = self.fetch_u16();
                let v = self.constant_at(idx);
                self.stack.push(v);
            }
            OpCode::Imm8 => {
                let v = self.fetch_u8();
                self.stack.push(Value::Number(v as f64));
            }
            OpCode::Imm16 => {
                let v = self.fetch_u16();
                self.stack.push(Value::Number(v as f64));
            }
            OpCode::Nil => self.stack.push(Value::Nil),
            OpCode::True => self.stack.push(Value::Bool(true)),
            OpCode::False => self.stack.push(Value::Bool(false)),
            OpCode::Pop => {
                self.stack.pop();
            }
            OpCode::PopN => {
                let n = self.fetch_u8() as usize;
                let new_len = self.stack.len().saturating_sub(n);
                self.stack.truncate(new_len);
            }
            OpCode::GetLocal => {
                let slot = self.fetch_u8();
                let post_args = self.fetch_u8() != 0;
                let base = self.resolve_local_base(post_args);
                self.stack.push(self.stack[base + slot as usize]);
            }
            OpCode::SetLocal => {
                let slot = self.fetch_u8();
                let post_args = self.fetch_u8() != 0;
                let base = self.resolve_local_base(post_args);
                let v = *self.stack.last().unwrap();
                self.stack[base + slot as usize] = v;
            }
            OpCode::GetVararg => {
                let i = self.fetch_u8() as usize;
                let frame = self.frames.last().unwrap();
                self.stack.push(frame.varargs.get(i).copied().unwrap_or(Value::Nil));
            }
            OpCode::SetVararg => {
                let i = self.fetch_u8() as usize;
                let v = *self.stack.last().unwrap();
                let frame = self.frames.last_mut().unwrap();
                if i < frame.varargs.len() {
                    frame.varargs[i] = v;
                }
            }
            OpCode::NumVarargs => {
                let n = self.frames.last().unwrap().varargs.len();
                self.stack.push(Value::Number(n as f64));
            }
            OpCode::GetGlobal => {
                let idx = self.fetch_u16();
                let key = self.constant_at(idx);
                let key_ref = key.as_obj().unwrap();
                let hash = self.string_hash(key_ref);
                match self.globals.get(hash, |k| Ok(k.as_obj() == Some(key_ref)))? {
                    Some(v) if !matches!(v, Value::Undefined) => self.stack.push(v),
                    _ => return Err(RuntimeError::UndefinedVariable(self.key_name(key_ref))),
                }
            }
            OpCode::SetGlobal => {
                let idx = self.fetch_u16();
                let key = self.constant_at(idx);
                let key_ref = key.as_obj().unwrap();
                let hash = self.string_hash(key_ref);
                let v = *self.stack.last().unwrap();
                let existed = self.globals.contains(hash, |k| Ok(k.as_obj() == Some(key_ref)))?;
                if !existed {
                    return Err(RuntimeError::UndefinedVariable(self.key_name(key_ref)));
                }
                self.globals.insert(key, hash, v, |k| Ok(k.as_obj() == Some(key_ref)))?;
            }
            OpCode::DefineGlobal => {
                let idx = self.fetch_u16();
                let key = self.constant_at(idx);
                let v = self.stack.pop().unwrap();
                self.define_global(key, v);
            }
            OpCode::GetUpvalue => {
                let idx = self.fetch_u8() as usize;
                let frame = self.frames.last().unwrap();
                let closure_ref = match self.heap.get(frame.closure) {
                    Obj::Closure(c) => c.upvalues[idx],
                    _ => unreachable!(),
                };
                let v = self.read_upvalue(closure_ref);
                self.stack.push(v);
            }
            OpCode::SetUpvalue => {
                let idx = self.fetch_u8() as usize;
                let v = *self.stack.last().unwrap();
                let frame = self.frames.last().unwrap();
                let closure_ref = match self.heap.get(frame.closure) {
                    Obj::Closure(c) => c.upvalues[idx],
                    _ => unreachable!(),
                };
                self.write_upvalue(closure_ref, v);
            }
            OpCode::GetProperty => {
                let idx = self.fetch_u16();
                let name = self.constant_at(idx);
                let receiver = self.stack.pop().unwrap();
                let v = self.get_property(receiver, name)?;
                self.stack.push(v);
            }
            OpCode::SetProperty => {
                let idx = self.fetch_u16();
                let name = self.constant_at(idx);
                let value = self.stack.pop().unwrap();
                let receiver = self.stack.pop().unwrap();
                self.set_property(receiver, name, value)?;
                self.stack.push(value);
            }
            OpCode::GetMemberProperty | OpCode::GetSuper => {
                let ref_idx = self.fetch_u16() as usize;
                let this = self.stack[self.frames.last().unwrap().base];
                let v = self.get_member(this, ref_idx)?;
                self.stack.push(v);
            }
            OpCode::SetMemberProperty => {
                let ref_idx = self.fetch_u16() as usize;
                let value = self.stack.pop().unwrap();
                let this = self.stack[self.frames.last().unwrap().base];
                self.set_member(this, ref_idx, value)?;
                self.stack.push(value);
            }
            OpCode::MapGet => {
                let key = self.stack.pop().unwrap();
                let map_val = self.stack.pop().unwrap();
                let v = self.map_get(map_val, key)?;
                self.stack.push(v);
            }
            OpCode::MapSet => {
                let value = self.stack.pop().unwrap();
                let key = self.stack.pop().unwrap();
                let map_val = self.stack.pop().unwrap();
                self.map_set(map_val, key, value)?;
                self.stack.push(value);
            }
            OpCode::Equal => {
                let b = self.stack.pop().unwrap();
                let a = self.stack.pop().unwrap();
                let eq = self.values_equal(&a, &b)?;
                self.stack.push(Value::Bool(eq));
            }
            OpCode::Greater => self.binary_cmp(|a, b| a > b)?,
            OpCode::Less => self.binary_cmp(|a, b| a < b)?,
            OpCode::Add => self.add()?,
            OpCode::Subtract => self.binary_num(|a, b| Ok(a - b))?,
            OpCode::Multiply => self.binary_num(|a, b| Ok(a * b))?,
            OpCode::Divide => self.binary_num(|a, b| {
                if b == 0.0 {
                    Err(RuntimeError::DivideByZero)
                } else {
                    Ok(a / b)
                }
            })?,
            OpCode::Modulo => self.binary_num(|a, b| Ok(a % b))?,
            OpCode::Not => {
                let v = self.stack.pop().unwrap();
                self.stack.push(Value::Bool(v.is_falsey()));
            }
            OpCode::Negate => {
                let v = self.stack.pop().unwrap();
                match v {
                    Value::Number(n) => self.stack.push(Value::Number(-n)),
                    _ => return Err(RuntimeError::TypeError("Operand must be a number.".to_string())),
                }
            }
            OpCode::InstanceOf => {
                let class_val = self.stack.pop().unwrap();
                let subject = self.stack.pop().unwrap();
                self.stack.push(Value::Bool(self.instance_of(subject, class_val)?));
            }
            OpCode::Jump => {
                let offset = self.fetch_u16();
                self.frames.last_mut().unwrap().ip += offset as usize;
            }
            OpCode::JumpIfFalse => {
                let offset = self.fetch_u16();
                if self.stack.last().unwrap().is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            OpCode::Loop => {
                let offset = self.fetch_u16();
                self.frames.last_mut().unwrap().ip -= offset as usize;
            }
            OpCode::Call => {
                let argc = self.fetch_u8();
                self.call_value(argc)?;
            }
            OpCode::Invoke => {
                let idx = self.fetch_u16();
                let argc = self.fetch_u8();
                let name = self.constant_at(idx);
                self.invoke(name, argc)?;
            }
            OpCode::MemberInvoke | OpCode::SuperInvoke => {
                let ref_idx = self.fetch_u16() as usize;
                let argc = self.fetch_u8();
                let this = self.stack[self.frames.last().unwrap().base];
                let method = self.get_member(this, ref_idx)?;
                let args = self.pop_args(argc);
                let result = self.call_bound(method, this, args)?;
                self.stack.push(result);
            }
            OpCode::SuperInit => {
                let argc = self.fetch_u8();
                let args = self.pop_args(argc);
                let this = self.stack[self.frames.last().unwrap().base];
                let class = match this {
                    Value::Obj(r) => match self.heap.get(r) {
                        Obj::Instance(i) => i.class,
                        _ => return Err(RuntimeError::NonClassSuperclass),
                    },
                    _ => return Err(RuntimeError::NonClassSuperclass),
                };
                let superclass = match self.heap.get(class) {
                    Obj::Class(c) => c.superclass,
                    _ => None,
                };
                if let Some(sc) = superclass {
                    let init = match self.heap.get(sc) {
                        Obj::Class(c) => c.initializer.clone(),
                        _ => None,
                    };
                    if let Some(init) = init {
                        self.call_bound(init, this, args)?;
                    }
                }
                self.stack.push(Value::Nil);
            }
            OpCode::Return => {
                let result = self.stack.pop().unwrap();
                let frame = self.frames.pop().unwrap();
                self.close_upvalues_from(frame.base);
                self.stack.truncate(frame.base);
                self.stack.push(result);
            }
            OpCode::Closure => {
                let idx = self.fetch_u16();
                let func_val = self.constant_at(idx);
                let function_ref = func_val.as_obj().unwrap();
                let upvalue_count = match self.heap.get(function_ref) {
                    Obj::Function(f) => f.upvalue_count,
                    _ => 0,
                };
                let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                for _ in 0..upvalue_count {
                    let is_local = self.fetch_u8() != 0;
                    let index = self.fetch_u8() as usize;
                    if is_local {
                        let base = self.frames.last().unwrap().base;
                        upvalues.push(self.capture_upvalue(base + index));
                    } else {
                        let frame = self.frames.last().unwrap();
                        let outer = match self.heap.get(frame.closure) {
                            Obj::Closure(c) => c.upvalues[index],
                            _ => unreachable!(),
                        };
                        upvalues.push(outer);
                    }
                }
                let closure = self.alloc(Obj::Closure(LClosure { function: function_ref, upvalues }));
                self.stack.push(Value::Obj(closure));
            }
            OpCode::CloseUpvalue => {
                let watermark = self.stack.len() - 1;
                self.close_upvalues_from(watermark);
                self.stack.pop();
            }
            OpCode::Class => {
                let idx = self.fetch_u16();
                let name = self.constant_at(idx);
                let v = self.new_class(name, None);
                self.stack.push(v);
            }
            OpCode::AnonClass => {
                let name = self.intern_string(b"<anonymous>");
                let v = self.new_class(name, None);
                self.stack.push(v);
            }
            OpCode::Inherit => {
                let super_val = self.stack.pop().unwrap();
                let class_val = *self.stack.last().unwrap();
                self.inherit(class_val, super_val)?;
            }
            OpCode::Method => {
                let idx = self.fetch_u16();
                let name = self.constant_at(idx);
                let method = self.stack.pop().unwrap();
                let class_val = *self.stack.last().unwrap();
                self.add_method(class_val, name, method)?;
            }
            OpCode::Field => {
                let idx = self.fetch_u16();
                let name = self.constant_at(idx);
                let class_val = *self.stack.last().unwrap();
                self.add_field(class_val, name)?;
            }
            OpCode::Static => {
                let idx = self.fetch_u16();
                let name = self.constant_at(idx);
                let value = self.stack.pop().unwrap();
                let class_val = *self.stack.last().unwrap();
                self.add_static(class_val, name, value)?;
            }
            OpCode::ResolveMembers => {
                let count = self.fetch_u16();
                let mut refs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let kind = self.fetch_u8();
                    let name_idx = self.fetch_u16();
                    let name = self.constant_at(name_idx);
                    let class_val = *self.stack.last().unwrap();
                    refs.push(self.resolve_one_member(class_val, kind, name)?);
                }
                if let Value::Obj(r) = *self.stack.last().unwrap() {
                    if let Obj::Class(c) = self.heap.get_mut(r) {
                        c.member_refs = refs;
                    }
                }
            }
            OpCode::ArrayBuild => {
                let n = self.fetch_u16() as usize;
                let len = self.stack.len();
                let items = self.stack.split_off(len - n);
                let r = self.alloc(Obj::Array(ArrayObj { items }));
                self.stack.push(Value::Obj(r));
            }
            OpCode::TupleBuild => {
                let n = self.fetch_u16() as usize;
                let len = self.stack.len();
                let items: Rc<[Value]> = self.stack.split_off(len - n).into();
                let r = self.alloc(Obj::Tuple(TupleObj { items }));
                self.stack.push(Value::Obj(r));
            }
            OpCode::MapBuild => {
                let n = self.fetch_u16() as usize;
                let len = self.stack.len();
                let pairs = self.stack.split_off(len - n * 2);
                let mut table = ValueTable::new();
                let mut it = pairs.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    let hash = self.hash_value(&k)?;
                    table.insert(k, hash, v, |existing| Ok(existing.raw_eq(&k)))?;
                }
                let r = self.alloc(Obj::Map(MapObj { table }));
                self.stack.push(Value::Obj(r));
            }
            OpCode::Index => {
                let index = self.stack.pop().unwrap();
                let target = self.stack.pop().unwrap();
                let v = self.index_get(target, index)?;
                self.stack.push(v);
            }
            OpCode::IndexStore => {
                let value = self.stack.pop().unwrap();
                let index = self.stack.pop().unwrap();
                let target = self.stack.pop().unwrap();
                self.index_set(target, index, value)?;
                self.stack.push(value);
            }
            OpCode::Throw => {
                let exc = self.stack.pop().unwrap();
                return Err(self.throw_value(exc));
            }
            OpCode::PushExceptionHandler => {
                let stack_depth = self.fetch_u16() as usize;
                let handler_offset = self.fetch_u16() as usize;
                let catch_class = self.stack.pop().unwrap();
                let frame = self.frames.last().unwrap();
                let try_start = frame.ip;
                let handler_ip = frame.ip + handler_offset;
                self.frames.last_mut().unwrap().push_handler(HandlerEntry {
                    try_start,
                    try_end: usize::MAX,
                    handler_ip,
                    stack_depth,
                    catch_class,
                }).map_err(|_| RuntimeError::Custom("too many nested try blocks".to_string()))?;
            }
            OpCode::PopExceptionHandler => {
                self.frames.last_mut().unwrap().pop_handler();
            }
            OpCode::ForeachInit => {
                let iterable = self.stack.pop().unwrap();
                let (has_next, next) = self.make_iterator(iterable)?;
                self.stack.push(has_next);
                self.stack.push(next);
            }
            OpCode::Unpack => {
                let n = self.fetch_u8() as usize;
                let value = self.stack.pop().unwrap();
                let items: Vec<Value> = match value {
                    Value::Obj(r) => match self.heap.get(r) {
                        Obj::Tuple(t) => t.items.to_vec(),
                        _ => vec![value],
                    },
                    _ => vec![value],
                };
                for i in 0..n {
                    self.stack.push(items.get(i).copied().unwrap_or(Value::Nil));
                }
            }
            OpCode::Import => {
                let idx = self.fetch_u16();
                let name = self.constant_at(idx);
                self.do_import(name)?;
            }
            OpCode::Data => return Err(RuntimeError::BytecodeDataExecuted),
        }
        Ok(Some(()))
    }

    fn function_of(&self, closure: ObjRef) -> &LFunction {
        match self.heap.get(closure) {
            Obj::Closure(c) => match self.heap.get(c.function) {
                Obj::Function(f) => f,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    fn fetch_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let closure = match self.heap.get(frame.closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let b = match self.heap.get(closure) {
            Obj::Function(f) => f.chunk.code[frame.ip],
            _ => unreachable!(),
        };
        frame.ip += 1;
        b
    }

    fn fetch_u16(&mut self) -> u16 {
        let lo = self.fetch_u8() as u16;
        let hi = self.fetch_u8() as u16;
        lo | (hi << 8)
    }

    fn constant_at(&self, idx: u16) -> Value {
        let frame = self.frames.last().unwrap();
        self.function_of(frame.closure).chunk.constants[idx as usize]
    }

    fn resolve_local_base(&self, post_args: bool) -> usize {
        let frame = self.frames.last().unwrap();
        if post_args {
            frame.base + frame.varargs.len()
        } else {
            frame.base
        }
    }

    fn key_name(&self, r: ObjRef) -> String {
        match self.heap.get(r) {
            Obj::Str(s) => s.as_str().into_owned(),
            _ => "?".to_string(),
        }
    }

    fn pop_args(&mut self, argc: u8) -> Vec<Value> {
        let n = argc as usize;
        let len = self.stack.len();
        self.stack.split_off(len - n)
    }

    fn binary_num(&mut self, f: impl Fn(f64, f64) -> RResult<f64>) -> RResult<()> {
        let b = self.stack.pop().unwrap();
        let a = self.stack.pop().unwrap();
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.stack.push(Value::Number(f(a, b)?));
                Ok(())
            }
            _ => Err(RuntimeError::TypeError("Operands must be numbers.".to_string())),
        }
    }

    fn binary_cmp(&mut self, f: impl Fn(f64, f64) -> bool) -> RResult<()> {
        let b = self.stack.pop().unwrap();
        let a = self.stack.pop().unwrap();
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.stack.push(Value::Bool(f(a, b)));
                Ok(())
            }
            _ => Err(RuntimeError::TypeError("Operands must be numbers.".to_string())),
        }
    }

    fn add(&mut self) -> RResult<()> {
        let b = self.stack.pop().unwrap();
        let a = self.stack.pop().unwrap();
        if let (Some(a), Some(b)) = (a.as_number(), b.as_number()) {
            self.stack.push(Value::Number(a + b));
            return Ok(());
        }
        let a_str = self.as_str_bytes(a);
        let b_str = self.as_str_bytes(b);
        if let (Some(a), Some(b)) = (a_str, b_str) {
            let mut combined = a;
            combined.extend_from_slice(&b);
            let v = self.intern_string(&combined);
            self.stack.push(v);
            return Ok(());
        }
        Err(RuntimeError::TypeError("Operands must be two numbers or two strings.".to_string()))
    }

    fn as_str_bytes(&self, v: Value) -> Option<Vec<u8>> {
        match v {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Str(s) => Some(s.bytes.to_vec()),
                _ => None,
            },
            _ => None,
        }
    }

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        for &r in &self.open_upvalues {
            if let Obj::Upvalue(UpvalueObj::Open(s)) = self.heap.get(r) {
                if *s == slot {
                    return r;
                }
            }
        }
        let r = self.alloc(Obj::Upvalue(UpvalueObj::Open(slot)));
        self.open_upvalues.push(r);
        let slots: Vec<(ObjRef, usize)> = self.open_upvalues.iter().map(|&r| (r, self.upvalue_slot(r))).collect();
        let mut sorted = slots;
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        self.open_upvalues = sorted.into_iter().map(|(r, _)| r).collect();
        r
    }

    fn upvalue_slot(&self, r: ObjRef) -> usize {
        match self.heap.get(r) {
            Obj::Upvalue(UpvalueObj::Open(s)) => *s,
            _ => usize::MAX,
        }
    }

    fn read_upvalue(&self, r: ObjRef) -> Value {
        match self.heap.get(r) {
            Obj::Upvalue(UpvalueObj::Open(slot)) => self.stack[*slot],
            Obj::Upvalue(UpvalueObj::Closed(v)) => *v,
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, r: ObjRef, value: Value) {
        let slot = match self.heap.get(r) {
            Obj::Upvalue(UpvalueObj::Open(s)) => Some(*s),
            _ => None,
        };
        if let Some(slot) = slot {
            self.stack[slot] = value;
        } else if let Obj::Upvalue(u) = self.heap.get_mut(r) {
            *u = UpvalueObj::Closed(value);
        }
    }

    fn close_upvalues_from(&mut self, watermark: usize) {
        let mut still_open = Vec::new();
        let open_upvalues = std::mem::take(&mut self.open_upvalues);
        for r in open_upvalues {
            let slot = self.upvalue_slot(r);
            if slot >= watermark {
                let value = self.stack.get(slot).copied().unwrap_or(Value::Nil);
                if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                    *u = UpvalueObj::Closed(value);
                }
            } else {
                still_open.push(r);
            }
        }
        self.open_upvalues = still_open;
    }

    fn call_value(&mut self, argc: u8) -> RResult<()> {
        let callee_index = self.stack.len() - 1 - argc as usize;
        let callee = self.stack[callee_index];
        match callee {
            Value::Obj(r) => {
                let shape = obj_shape(self.heap.get(r));
                match shape {
                    ObjShape::Closure => self.call_closure(r, argc),
                    ObjShape::Native => self.call_native(r, argc),
                    ObjShape::Class => self.instantiate(r, argc),
                    ObjShape::BoundMethod => self.call_bound_method(r, argc),
                    ObjShape::Other => Err(RuntimeError::NotCallable),
                }
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: u8) -> RResult<()> {
        if self.frames.len() >= self.config.max_frame_depth {
            return Err(RuntimeError::StackOverflow);
        }
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let (arity, is_varargs, defaults) = match self.heap.get(function) {
            Obj::Function(f) => (f.arity, f.is_varargs(), f.default_args.clone()),
            _ => unreachable!(),
        };
        let args = self.pop_args(argc);
        self.stack.pop(); // callee slot
        let base = self.stack.len();
        let (fixed, varargs) = adjust_args(args, arity, is_varargs, &defaults);
        self.stack.extend(fixed);
        let mut frame = CallFrame::new(closure, base, arity);
        frame.varargs = varargs;
        self.frames.push(frame);
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, argc: u8) -> RResult<()> {
        let args = self.pop_args(argc);
        self.stack.pop(); // callee
        let result = match self.heap.get(native) {
            Obj::Native(NativeObj::Fn { func, .. }) => {
                let f = *func;
                f(self, &args)?
            }
            Obj::Native(NativeObj::Closure { func, .. }) => {
                let f = func.clone();
                f.call(self, &args)?
            }
            _ => unreachable!(),
        };
        self.stack.push(result);
        Ok(())
    }

    fn call_bound_method(&mut self, bound: ObjRef, argc: u8) -> RResult<()> {
        let (receiver, method) = match self.heap.get(bound) {
            Obj::BoundMethod(b) => (b.receiver, b.method),
            _ => unreachable!(),
        };
        let mut args = self.pop_args(argc);
        self.stack.pop(); // callee
        args.insert(0, receiver);
        self.stack.push(method);
        let n = args.len() as u8;
        for a in &args {
            self.stack.push(*a);
        }
        self.call_value(n)
    }

    fn instantiate(&mut self, class: ObjRef, argc: u8) -> RResult<()> {
        let args = self.pop_args(argc);
        self.stack.pop(); // callee (class value)
        let instance_ref = self.alloc(Obj::Instance(InstanceObj { class, fields: Vec::new(), identity_hash: class.0 as u64 }));
        let field_count = match self.heap.get(class) {
            Obj::Class(c) => c.field_index.len(),
            _ => 0,
        };
        if let Obj::Instance(i) = self.heap.get_mut(instance_ref) {
            i.fields = vec![Value::Nil; field_count];
        }
        let init = match self.heap.get(class) {
            Obj::Class(c) => c.initializer.clone(),
            _ => None,
        };
        if let Some(init) = init {
            self.call_bound(init, Value::Obj(instance_ref), args)?;
        }
        self.stack.push(Value::Obj(instance_ref));
        Ok(())
    }

    fn invoke(&mut self, name: Value, argc: u8) -> RResult<()> {
        let receiver_index = self.stack.len() - 1 - argc as usize;
        let receiver = self.stack[receiver_index];
        let method = self.get_property(receiver, name)?;
        self.stack[receiver_index] = method;
        self.call_value(argc)
    }

    pub(crate) fn get_property(&mut self, receiver: Value, name: Value) -> RResult<Value> {
        let name_str = self.key_name_of_value(name);
        match receiver {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(i) => {
                    let class = i.class;
                    if let Some(&idx) = self.field_index(class, &name_str) {
                        let fields = match self.heap.get(r) {
                            Obj::Instance(inst) => inst.fields.clone(),
                            _ => unreachable!(),
                        };
                        return Ok(fields[idx as usize]);
                    }
                    if let Some(method) = self.find_method(class, &name_str) {
                        let bm = self.alloc(Obj::BoundMethod(BoundMethodObj { receiver, method }));
                        return Ok(Value::Obj(bm));
                    }
                    Err(RuntimeError::UndefinedProperty(name_str))
                }
                Obj::Class(c) => {
                    if let Some(&idx) = c.static_index.get(name_str.as_str()) {
                        return Ok(c.statics[idx as usize]);
                    }
                    Err(RuntimeError::UndefinedProperty(name_str))
                }
                Obj::Str(s) => {
                    if name_str == "length" {
                        return Ok(Value::Number(s.len() as f64));
                    }
                    Err(RuntimeError::UndefinedProperty(name_str))
                }
                Obj::Array(a) => {
                    if name_str == "length" {
                        return Ok(Value::Number(a.items.len() as f64));
                    }
                    Err(RuntimeError::UndefinedProperty(name_str))
                }
                _ => Err(RuntimeError::UndefinedProperty(name_str)),
            },
            _ => Err(RuntimeError::TypeError(format!("{} has no properties", self.type_name_of(&receiver)))),
        }
    }

    pub(crate) fn set_property(&mut self, receiver: Value, name: Value, value: Value) -> RResult<()> {
        let name_str = self.key_name_of_value(name);
        match receiver {
            Value::Obj(r) => {
                let class = match self.heap.get(r) {
                    Obj::Instance(i) => i.class,
                    _ => return Err(RuntimeError::TypeError("can only set properties on instances".to_string())),
                };
                let idx = self.field_index(class, &name_str).copied();
                match idx {
                    Some(idx) => {
                        if let Obj::Instance(i) = self.heap.get_mut(r) {
                            i.fields[idx as usize] = value;
                        }
                        Ok(())
                    }
                    None => Err(RuntimeError::UndefinedProperty(name_str)),
                }
            }
            _ => Err(RuntimeError::TypeError("can only set properties on instances".to_string())),
        }
    }

    pub(crate) fn field_index(&self, class: ObjRef, name: &str) -> Option<&u16> {
        match self.heap.get(class) {
            Obj::Class(c) => c.field_index.get(name),
            _ => None,
        }
    }

    pub(crate) fn find_method(&self, class: ObjRef, name: &str) -> Option<Value> {
        let mut current = Some(class);
        while let Some(c) = current {
            match self.heap.get(c) {
                Obj::Class(cls) => {
                    if let Some(m) = cls.methods.get(name) {
                        return Some(*m);
                    }
                    current = cls.superclass;
                }
                _ => return None,
            }
        }
        None
    }

    fn key_name_of_value(&self, v: Value) -> String {
        match v {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Str(s) => s.as_str().into_owned(),
                _ => "?".to_string(),
            },
            _ => "?".to_string(),
        }
    }

    fn get_member(&mut self, this: Value, ref_idx: usize) -> RResult<Value> {
        let class = match this {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(i) => i.class,
                _ => return Err(RuntimeError::UndefinedProperty("?".to_string())),
            },
            _ => return Err(RuntimeError::UndefinedProperty("?".to_string())),
        };
        let member = match self.heap.get(class) {
            Obj::Class(c) => c.member_refs.get(ref_idx).cloned(),
            _ => None,
        };
        match member {
            Some(MemberRef::Field(idx)) => {
                let fields = match this {
                    Value::Obj(r) => match self.heap.get(r) {
                        Obj::Instance(i) => i.fields.clone(),
                        _ => unreachable!(),
                    },
                    _ => unreachable!(),
                };
                Ok(fields[idx as usize])
            }
            Some(MemberRef::Method(v)) => Ok(v),
            Some(MemberRef::StaticSlot(idx)) => match self.heap.get(class) {
                Obj::Class(c) => Ok(c.statics[idx as usize]),
                _ => unreachable!(),
            },
            None => Err(RuntimeError::UndefinedProperty("?".to_string())),
        }
    }

    fn set_member(&mut self, this: Value, ref_idx: usize, value: Value) -> RResult<()> {
        let (class, instance_ref) = match this {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(i) => (i.class, r),
                _ => return Err(RuntimeError::UndefinedProperty("?".to_string())),
            },
            _ => return Err(RuntimeError::UndefinedProperty("?".to_string())),
        };
        let member = match self.heap.get(class) {
            Obj::Class(c) => c.member_refs.get(ref_idx).cloned(),
            _ => None,
        };
        match member {
            Some(MemberRef::Field(idx)) => {
                if let Obj::Instance(i) = self.heap.get_mut(instance_ref) {
                    i.fields[idx as usize] = value;
                }
                Ok(())
            }
            Some(MemberRef::StaticSlot(idx)) => {
                if let Obj::Class(c) = self.heap.get_mut(class) {
                    c.statics[idx as usize] = value;
                }
                Ok(())
            }
            _ => Err(RuntimeError::UndefinedProperty("?".to_string())),
        }
    }

    fn map_get(&mut self, map_val: Value, key: Value) -> RResult<Value> {
        let r = map_val.as_obj().ok_or_else(|| RuntimeError::TypeError("not a map".to_string()))?;
        let mut table = match self.heap.get_mut(r) {
            Obj::Map(m) => std::mem::take(&mut m.table),
            _ => return Err(RuntimeError::TypeError("not a map".to_string())),
        };
        let hash = self.hash_value(&key)?;
        let result = table.get(hash, |k| self.values_equal(k, &key));
        if let Obj::Map(m) = self.heap.get_mut(r) {
            m.table = table;
        }
        Ok(result?.unwrap_or(Value::Nil))
    }

    fn map_set(&mut self, map_val: Value, key: Value, value: Value) -> RResult<()> {
        let r = map_val.as_obj().ok_or_else(|| RuntimeError::TypeError("not a map".to_string()))?;
        let mut table = match self.heap.get_mut(r) {
            Obj::Map(m) => std::mem::take(&mut m.table),
            _ => return Err(RuntimeError::TypeError("not a map".to_string())),
        };
        let hash = self.hash_value(&key)?;
        let result = table.insert(key, hash, value, |k| self.values_equal(k, &key));
        if let Obj::Map(m) = self.heap.get_mut(r) {
            m.table = table;
        }
        result.map(|_| ())
    }

    fn index_get(&mut self, target: Value, index: Value) -> RResult<Value> {
        match target {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Array(a) => {
                    let i = index.as_number().ok_or_else(|| RuntimeError::TypeError("index must be a number".to_string()))? as i64;
                    a.items.get(Self::normalize_index(i, a.items.len())).copied().ok_or(RuntimeError::IndexOutOfRange(i))
                }
                Obj::Tuple(t) => {
                    let i = index.as_number().ok_or_else(|| RuntimeError::TypeError("index must be a number".to_string()))? as i64;
                    t.items.get(Self::normalize_index(i, t.items.len())).copied().ok_or(RuntimeError::IndexOutOfRange(i))
                }
                Obj::Map(_) => self.map_get(target, index),
                _ => Err(RuntimeError::TypeError("value is not indexable".to_string())),
            },
            _ => Err(RuntimeError::TypeError("value is not indexable".to_string())),
        }
    }

    fn index_set(&mut self, target: Value, index: Value, value: Value) -> RResult<()> {
        match target {
            Value::Obj(r) => {
                let is_map = matches!(self.heap.get(r), Obj::Map(_));
                if is_map {
                    return self.map_set(target, index, value);
                }
                let i = index.as_number().ok_or_else(|| RuntimeError::TypeError("index must be a number".to_string()))? as i64;
                match self.heap.get_mut(r) {
                    Obj::Array(a) => {
                        let len = a.items.len();
                        let idx = Self::normalize_index(i, len);
                        if idx >= len {
                            return Err(RuntimeError::IndexOutOfRange(i));
                        }
                        a.items[idx] = value;
                        Ok(())
                    }
                    _ => Err(RuntimeError::TypeError("value is not index-assignable".to_string())),
                }
            }
            _ => Err(RuntimeError::TypeError("value is not index-assignable".to_string())),
        }
    }

    fn normalize_index(i: i64, len: usize) -> usize {
        if i < 0 {
            (len as i64 + i).max(0) as usize
        } else {
            i as usize
        }
    }

    pub(crate) fn instance_of(&self, subject: Value, class_val: Value) -> RResult<bool> {
        let subject_class = match subject {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(i) => i.class,
                _ => return Ok(false),
            },
            _ => return Ok(false),
        };
        let ancestor = class_val.as_obj().ok_or(RuntimeError::NonClassSuperclass)?;
        let subject_id = match self.heap.get(subject_class) {
            Obj::Class(c) => c.class_id,
            _ => return Ok(false),
        };
        let ancestor_id = match self.heap.get(ancestor) {
            Obj::Class(c) => c.class_id,
            _ => return Err(RuntimeError::NonClassSuperclass),
        };
        Ok(ClassObj::instance_of(subject_id, ancestor_id))
    }

    /// Hands out the next prime after the last one given to a class on
    /// this `Vm`, by trial division. Per-`Vm`, not thread-global, so two
    /// unrelated `Vm`s (or `Context`s) never collide and there's no
    /// fixed table to run out of.
    fn next_prime(&mut self) -> u128 {
        let mut candidate = self.last_class_prime + 1;
        while !is_prime(candidate) {
            candidate += 1;
        }
        self.last_class_prime = candidate;
        candidate
    }

    pub fn new_class(&mut self, name: Value, superclass: Option<ObjRef>) -> Value {
        let name_ref = name.as_obj().unwrap();
        let class_id = self.next_prime();
        let r = self.alloc(Obj::Class(ClassObj {
            name: name_ref,
            superclass,
            field_index: std::collections::HashMap::new(),
            methods: std::collections::HashMap::new(),
            static_index: std::collections::HashMap::new(),
            statics: Vec::new(),
            initializer: None,
            hash_code_method: None,
            equals_method: None,
            member_refs: Vec::new(),
            class_id,
        }));
        Value::Obj(r)
    }

    pub fn inherit(&mut self, class_val: Value, super_val: Value) -> RResult<()> {
        let class_ref = class_val.as_obj().unwrap();
        let super_ref = super_val.as_obj().ok_or(RuntimeError::NonClassSuperclass)?;
        if !matches!(self.heap.get(super_ref), Obj::Class(_)) {
            return Err(RuntimeError::NonClassSuperclass);
        }
        let (super_fields, super_id) = match self.heap.get(super_ref) {
            Obj::Class(c) => (c.field_index.clone(), c.class_id),
            _ => unreachable!(),
        };
        let base_id = match self.heap.get(class_ref) {
            Obj::Class(c) => c.class_id,
            _ => unreachable!(),
        };
        let class_id = base_id.checked_mul(super_id).ok_or(RuntimeError::ClassHierarchyOverflow)?;
        if let Obj::Class(c) = self.heap.get_mut(class_ref) {
            c.superclass = Some(super_ref);
            c.field_index = super_fields;
            c.class_id = class_id;
        }
        Ok(())
    }

    pub(crate) fn add_method(&mut self, class_val: Value, name: Value, method: Value) -> RResult<()> {
        let class_ref = class_val.as_obj().unwrap();
        let name_str = self.key_name_of_value(name);
        let class_name_ref = match self.heap.get(class_ref) {
            Obj::Class(c) => c.name,
            _ => unreachable!(),
        };
        let class_name = self.key_name_of_value(Value::Obj(class_name_ref));
        if let Value::Obj(closure_ref) = method {
            if let Obj::Closure(c) = self.heap.get(closure_ref) {
                let fn_ref = c.function;
                if let Obj::Function(f) = self.heap.get_mut(fn_ref) {
                    f.owning_class = Some(class_ref);
                }
            }
        }
        if let Obj::Class(c) = self.heap.get_mut(class_ref) {
            if name_str == class_name {
                c.initializer = Some(method);
            }
            if name_str == "hashCode" {
                c.hash_code_method = Some(method);
            }
            if name_str == "equals" {
                c.equals_method = Some(method);
            }
            c.methods.insert(name_str.into_boxed_str(), method);
        }
        Ok(())
    }

    pub(crate) fn add_field(&mut self, class_val: Value, name: Value) -> RResult<()> {
        let class_ref = class_val.as_obj().unwrap();
        let name_str = self.key_name_of_value(name);
        if let Obj::Class(c) = self.heap.get_mut(class_ref) {
            if c.field_index.contains_key(name_str.as_str()) {
                return Err(RuntimeError::FieldShadowsSuper(name_str));
            }
            let idx = c.field_index.len() as u16;
            c.field_index.insert(name_str.into_boxed_str(), idx);
        }
        Ok(())
    }

    pub(crate) fn add_static(&mut self, class_val: Value, name: Value, value: Value) -> RResult<()> {
        let class_ref = class_val.as_obj().unwrap();
        let name_str = self.key_name_of_value(name);
        if let Obj::Class(c) = self.heap.get_mut(class_ref) {
            let idx = c.statics.len() as u16;
            c.static_index.insert(name_str.into_boxed_str(), idx);
            c.statics.push(value);
        }
        Ok(())
    }

    fn resolve_one_member(&mut self, class_val: Value, kind: u8, name: Value) -> RResult<MemberRef> {
        let class_ref = class_val.as_obj().unwrap();
        let name_str = self.key_name_of_value(name);
        match kind {
            0 => self.field_index(class_ref, &name_str).copied().map(MemberRef::Field).ok_or_else(|| RuntimeError::UndefinedProperty(name_str)),
            1 => self.find_method(class_ref, &name_str).map(MemberRef::Method).ok_or_else(|| RuntimeError::UndefinedProperty(name_str)),
            2 => {
                let superclass = match self.heap.get(class_ref) {
                    Obj::Class(c) => c.superclass,
                    _ => None,
                };
                let sc = superclass.ok_or_else(|| RuntimeError::UndefinedProperty(name_str.clone()))?;
                self.find_method(sc, &name_str).map(MemberRef::Method).ok_or_else(|| RuntimeError::UndefinedProperty(name_str))
            }
            3 => match self.heap.get(class_ref) {
                Obj::Class(c) => c.static_index.get(name_str.as_str()).copied().map(MemberRef::StaticSlot).ok_or_else(|| RuntimeError::UndefinedProperty(name_str)),
                _ => Err(RuntimeError::UndefinedProperty(name_str)),
            },
            _ => Err(RuntimeError::Custom("bad member-ref kind".to_string())),
        }
    }

    fn make_iterator(&mut self, iterable: Value) -> RResult<(Value, Value)> {
        match iterable {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(i) => {
                    let class = i.class;
                    if let Some(m) = self.find_method(class, "iterator") {
                        let iter_val = self.call_bound(m, iterable, vec![])?;
                        self.bind_iterator_methods(iter_val)
                    } else {
                        self.bind_iterator_methods(iterable)
                    }
                }
                Obj::Array(_) | Obj::Tuple(_) => Ok(self.make_sequence_iterator(r)),
                Obj::Map(m) => Ok(self.make_map_iterator(r, m.table.make_iterator())),
                _ => Err(RuntimeError::NotIterable),
            },
            _ => Err(RuntimeError::NotIterable),
        }
    }

    /// Builds a `(hasNext, next)` pair of zero-arg native closures over
    /// an `Array`/`Tuple`'s items by index, without requiring either
    /// built-in to carry a user-visible iterator class.
    fn make_sequence_iterator(&mut self, r: ObjRef) -> (Value, Value) {
        let index = Rc::new(RefCell::new(0usize));
        let idx = index.clone();
        let has_next = move |vm: &mut Vm, _args: &[Value]| -> RResult<Value> {
            let len = match vm.heap.get(r) {
                Obj::Array(a) => a.items.len(),
                Obj::Tuple(t) => t.items.len(),
                _ => 0,
            };
            Ok(Value::Bool(*idx.borrow() < len))
        };
        let next = move |vm: &mut Vm, _args: &[Value]| -> RResult<Value> {
            let mut i = index.borrow_mut();
            let item = match vm.heap.get(r) {
                Obj::Array(a) => a.items.get(*i).copied(),
                Obj::Tuple(t) => t.items.get(*i).copied(),
                _ => None,
            };
            let item = item.ok_or(RuntimeError::IndexOutOfRange(*i as i64))?;
            *i += 1;
            Ok(item)
        };
        self.make_closure_pair("hasNext", has_next, "next", next)
    }

    /// Builds a `(hasNext, next)` pair over a `Map`'s entries in
    /// insertion order, `next` returning a `(key, value)` tuple. Raises
    /// `ConcurrentModification` (via `ValueTable::next_entry`) if the map
    /// is structurally changed while iteration is in progress.
    ///
    /// `hasNext` has to pull the next live entry eagerly to know whether
    /// one exists, since `next_entry` has no separate peek -- the pulled
    /// entry is stashed until the following `next()` call claims it.
    fn make_map_iterator(&mut self, r: ObjRef, table_iter: TableIter) -> (Value, Value) {
        let iter = Rc::new(RefCell::new(table_iter));
        let peeked: Rc<RefCell<Option<(Value, Value)>>> = Rc::new(RefCell::new(None));
        let iter_has = iter.clone();
        let peeked_has = peeked.clone();
        let has_next = move |vm: &mut Vm, _args: &[Value]| -> RResult<Value> {
            if peeked_has.borrow().is_some() {
                return Ok(Value::Bool(true));
            }
            let mut it = iter_has.borrow_mut();
            let entry = match vm.heap.get(r) {
                Obj::Map(m) => m.table.next_entry(&mut it)?,
                _ => None,
            };
            let found = entry.is_some();
            *peeked_has.borrow_mut() = entry;
            Ok(Value::Bool(found))
        };
        let next = move |vm: &mut Vm, _args: &[Value]| -> RResult<Value> {
            let (k, v) = peeked.borrow_mut().take().ok_or(RuntimeError::NotIterable)?;
            let r = vm.alloc(Obj::Tuple(TupleObj { items: Rc::from(vec![k, v]) }));
            Ok(Value::Obj(r))
        };
        self.make_closure_pair("hasNext", has_next, "next", next)
    }

    fn make_closure_pair(
        &mut self,
        has_next_name: &str,
        has_next: impl Fn(&mut Vm, &[Value]) -> RResult<Value> + 'static,
        next_name: &str,
        next: impl Fn(&mut Vm, &[Value]) -> RResult<Value> + 'static,
    ) -> (Value, Value) {
        let has_next_ref = self.alloc(Obj::Native(NativeObj::Closure {
            name: Rc::from(has_next_name),
            arity: 0,
            has_varargs: false,
            func: Rc::new(has_next),
        }));
        let next_ref = self.alloc(Obj::Native(NativeObj::Closure {
            name: Rc::from(next_name),
            arity: 0,
            has_varargs: false,
            func: Rc::new(next),
        }));
        (Value::Obj(has_next_ref), Value::Obj(next_ref))
    }

    fn bind_iterator_methods(&mut self, iter_val: Value) -> RResult<(Value, Value)> {
        let class = match iter_val {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Instance(i) => i.class,
                _ => return Err(RuntimeError::NotIterable),
            },
            _ => return Err(RuntimeError::NotIterable),
        };
        let has_next = self.find_method(class, "hasNext").ok_or(RuntimeError::NotIterable)?;
        let next = self.find_method(class, "next").ok_or(RuntimeError::NotIterable)?;
        let bound_has_next = self.alloc(Obj::BoundMethod(BoundMethodObj { receiver: iter_val, method: has_next }));
        let bound_next = self.alloc(Obj::BoundMethod(BoundMethodObj { receiver: iter_val, method: next }));
        Ok((Value::Obj(bound_has_next), Value::Obj(bound_next)))
    }

    fn throw_value(&mut self, exc: Value) -> RuntimeError {
        RuntimeError::Raised(exc)
    }

    fn do_import(&mut self, name: Value) -> RResult<()> {
        let name_str = self.key_name_of_value(name);
        crate::modules::do_import(self, name_str)
    }

    /// Runs a freshly compiled module's top-level function to completion,
    /// the same calling convention `interpret` uses for the main script.
    pub(crate) fn run_module_body(&mut self, function: ObjRef) -> RResult<()> {
        let closure = self.alloc(Obj::Closure(LClosure { function, upvalues: Vec::new() }));
        self.stack.push(closure_value(closure));
        let stop_depth = self.frames.len();
        self.call_closure(closure, 0)?;
        self.run(stop_depth).map(|_| ()).map_err(|e| RuntimeError::Custom(e.to_string()))
    }
}

fn closure_value(r: ObjRef) -> Value {
    Value::Obj(r)
}

/// Cheap tag used to pick a `call_value` path without holding a live
/// borrow of `Obj` across a branch that may need `&mut self.heap`.
enum ObjShape {
    Closure,
    Native,
    Class,
    BoundMethod,
    Other,
}

fn obj_shape(o: &Obj) -> ObjShape {
    match o {
        Obj::Closure(_) => ObjShape::Closure,
        Obj::Native(_) => ObjShape::Native,
        Obj::Class(_) => ObjShape::Class,
        Obj::BoundMethod(_) => ObjShape::BoundMethod,
        _ => ObjShape::Other,
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn is_prime(n: u128) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d: u128 = 3;
    while d.saturating_mul(d) <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmconfig::VmConfig;

    #[test]
    fn fresh_vm_has_builtin_classes_registered() {
        let vm = Vm::new(VmConfig::default());
        assert!(vm.builtins.is_some());
    }

    #[test]
    fn globals_round_trip_through_define_and_get() {
        let mut vm = Vm::new(VmConfig::default());
        let key = vm.intern_string(b"answer");
        vm.define_global(key, Value::Number(42.0));
        let key_ref = key.as_obj().unwrap();
        let hash = vm.string_hash(key_ref);
        let got = vm.globals.get(hash, |k| Ok(k.as_obj() == Some(key_ref))).unwrap();
        assert!(matches!(got, Some(Value::Number(n)) if n == 42.0));
    }

    #[test]
    fn instance_of_follows_super_chain() {
        let mut vm = Vm::new(VmConfig::default());
        let a_name = vm.intern_string(b"A");
        let a = vm.new_class(a_name, None);
        let b_name = vm.intern_string(b"B");
        let b = vm.new_class(b_name, None);
        vm.inherit(b, a).unwrap();
        let a_ref = a.as_obj().unwrap();
        let b_ref = b.as_obj().unwrap();
        let inst = vm.alloc(Obj::Instance(InstanceObj { class: b_ref, fields: vec![], identity_hash: 0 }));
        assert!(vm.instance_of(Value::Obj(inst), Value::Obj(a_ref)).unwrap());
        assert!(vm.instance_of(Value::Obj(inst), Value::Obj(b_ref)).unwrap());
    }
}
