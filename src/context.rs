// Top-level embedding surface: owns one `Vm` and gives a host a single
// `interpret` call instead of making it wire together the compiler,
// globals, and module loader itself.

use crate::compiler;
use crate::error::InterpretError;
use crate::modules::ModuleLoader;
use crate::vmconfig::VmConfig;
use crate::vm::Vm;
use std::rc::Rc;

pub struct Context {
    pub vm: Vm,
}

impl Context {
    pub fn new(config: VmConfig) -> Self {
        Context { vm: Vm::new(config) }
    }

    pub fn set_module_loader(&mut self, loader: Rc<dyn ModuleLoader>) {
        self.vm.module_loader = Some(loader);
    }

    /// Compiles and runs `source` as a module named `module_name`.
    /// `module_name` only matters for stack traces and `import` cycle
    /// detection -- there is no filesystem behind it here.
    pub fn interpret(&mut self, source: &str, module_name: &str) -> Result<(), InterpretError> {
        let function = compiler::compile(&mut self.vm, source, module_name)
            .map_err(InterpretError::Compile)?;
        self.vm.interpret(function)
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new(VmConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_trivial_script() {
        let mut ctx = Context::default();
        assert!(ctx.interpret("var x = 1 + 2;", "test").is_ok());
    }

    #[test]
    fn syntax_errors_surface_as_compile_errors() {
        let mut ctx = Context::default();
        let err = ctx.interpret("var x = ;", "test").unwrap_err();
        assert!(matches!(err, InterpretError::Compile(_)));
    }

    #[test]
    fn uncaught_throw_surfaces_as_a_runtime_error_with_a_trace() {
        let mut ctx = Context::default();
        let err = ctx.interpret("throw \"boom\";", "test").unwrap_err();
        match err {
            InterpretError::Runtime { stack_trace, .. } => assert!(stack_trace.contains("test")),
            other => panic!("expected a runtime error, got {:?}", other),
        }
    }

    #[test]
    fn importing_without_a_loader_configured_fails_cleanly() {
        let mut ctx = Context::default();
        let err = ctx.interpret("import \"nope\";", "test").unwrap_err();
        match err {
            InterpretError::Runtime { message, .. } => assert!(message.contains("no module loader")),
            other => panic!("expected a runtime error, got {:?}", other),
        }
    }
}
