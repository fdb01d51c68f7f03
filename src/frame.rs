// Call frame bookkeeping: one per active function invocation, tracking
// the operand-stack base slot, the variadic tail, and the exception
// handlers currently in scope for this frame.

use crate::value::{ObjRef, Value};

pub const MAX_FRAMES: usize = 256;
pub const MAX_HANDLERS_PER_FRAME: usize = 16;

/// A `PUSH_EXCEPTION_HANDLER` record: the byte offset to jump to if a
/// throw unwinds into this frame while the instruction pointer is
/// covered by `[try_start, try_end)`, and the operand-stack depth to
/// restore to before jumping there. `catch_class` is the class value
/// the catch clause declared (`Value::Nil` for a catch-all); matching
/// it against the thrown object is the VM's job, not the frame's, since
/// it needs `instanceOf` over the heap.
#[derive(Clone, Copy, Debug)]
pub struct HandlerEntry {
    pub try_start: usize,
    pub try_end: usize,
    pub handler_ip: usize,
    pub stack_depth: usize,
    pub catch_class: Value,
}

pub struct CallFrame {
    pub closure: ObjRef,
    pub ip: usize,
    pub base: usize,
    pub fixed_args: u8,
    pub varargs: Vec<Value>,
    pub handlers: [HandlerEntry; MAX_HANDLERS_PER_FRAME],
    pub handler_count: usize,
}

impl CallFrame {
    pub fn new(closure: ObjRef, base: usize, fixed_args: u8) -> Self {
        CallFrame {
            closure,
            ip: 0,
            base,
            fixed_args,
            varargs: Vec::new(),
            handlers: [HandlerEntry {
                try_start: 0,
                try_end: 0,
                handler_ip: 0,
                stack_depth: 0,
                catch_class: Value::Nil,
            }; MAX_HANDLERS_PER_FRAME],
            handler_count: 0,
        }
    }

    pub fn push_handler(&mut self, entry: HandlerEntry) -> Result<(), ()> {
        if self.handler_count == MAX_HANDLERS_PER_FRAME {
            return Err(());
        }
        self.handlers[self.handler_count] = entry;
        self.handler_count += 1;
        Ok(())
    }

    pub fn pop_handler(&mut self) {
        if self.handler_count > 0 {
            self.handler_count -= 1;
        }
    }
}

/// Splits `args` into the fixed parameter slots and, when the callee
/// is variadic, a trailing `Vec` of the rest. Pads missing arguments up
/// to `arity`: a padded slot takes its declared default from `defaults`
/// (aligned to the trailing parameters) if one exists there, else `nil`.
pub fn adjust_args(
    mut args: Vec<Value>,
    arity: u8,
    is_varargs: bool,
    defaults: &[Value],
) -> (Vec<Value>, Vec<Value>) {
    let arity = arity as usize;
    let default_start = arity.saturating_sub(defaults.len());
    let pad = |args: &mut Vec<Value>| {
        while args.len() < arity {
            let slot = args.len();
            let v = if slot >= default_start { defaults[slot - default_start] } else { Value::Nil };
            args.push(v);
        }
    };
    if is_varargs {
        if args.len() < arity {
            pad(&mut args);
            (args, Vec::new())
        } else {
            let varargs = args.split_off(arity);
            (args, varargs)
        }
    } else {
        if args.len() < arity {
            pad(&mut args);
        } else {
            args.truncate(arity);
        }
        (args, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_args_pads_missing_fixed_params() {
        let (fixed, var) = adjust_args(vec![Value::Number(1.0)], 3, false, &[]);
        assert_eq!(fixed.len(), 3);
        assert!(fixed[1].is_nil());
        assert!(var.is_empty());
    }

    #[test]
    fn adjust_args_splits_tail_for_varargs() {
        let args = vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)];
        let (fixed, var) = adjust_args(args, 1, true, &[]);
        assert_eq!(fixed.len(), 1);
        assert_eq!(var.len(), 2);
    }

    #[test]
    fn adjust_args_fills_missing_trailing_params_from_defaults() {
        let defaults = [Value::Number(9.0), Value::Number(8.0)];
        let (fixed, _) = adjust_args(vec![Value::Number(1.0)], 3, false, &defaults);
        assert_eq!(fixed[0].as_number(), Some(1.0));
        assert_eq!(fixed[1].as_number(), Some(9.0));
        assert_eq!(fixed[2].as_number(), Some(8.0));
    }

    #[test]
    fn adjust_args_defaults_dont_override_explicit_trailing_args() {
        let defaults = [Value::Number(9.0)];
        let (fixed, _) =
            adjust_args(vec![Value::Number(1.0), Value::Number(2.0)], 2, false, &defaults);
        assert_eq!(fixed[0].as_number(), Some(1.0));
        assert_eq!(fixed[1].as_number(), Some(2.0));
    }

    #[test]
    fn push_handler_rejects_once_the_frame_is_full() {
        let mut frame = CallFrame::new(crate::value::ObjRef(0), 0, 0);
        for _ in 0..MAX_HANDLERS_PER_FRAME {
            frame
                .push_handler(HandlerEntry {
                    try_start: 0,
                    try_end: 10,
                    handler_ip: 5,
                    stack_depth: 0,
                    catch_class: Value::Nil,
                })
                .unwrap();
        }
        let overflow = frame.push_handler(HandlerEntry {
            try_start: 0,
            try_end: 10,
            handler_ip: 5,
            stack_depth: 0,
            catch_class: Value::Nil,
        });
        assert!(overflow.is_err());
    }
}
