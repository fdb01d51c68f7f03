// Module registry: a load-once name table plus the host hook that
// resolves a module name to source text. Path resolution is explicitly
// out of scope -- callers plug in whatever `ModuleLoader` fits their
// embedding (filesystem, bundled assets, network fetch).

use crate::error::RResult;
use crate::vm::Vm;

pub trait ModuleLoader {
    fn load(&self, name: &str) -> Result<String, String>;
}

/// The default loader installed on a `Vm` that hasn't been given one;
/// any `import` simply fails, since there is nowhere to resolve a name
/// to source text.
pub struct NullLoader;

impl ModuleLoader for NullLoader {
    fn load(&self, name: &str) -> Result<String, String> {
        Err(format!("no module loader configured, cannot import '{}'", name))
    }
}

/// Inserts `name` into the registry *before* compiling and running its
/// body, so a cyclic `import` sees the name already present and treats
/// it as a no-op rather than recursing forever.
pub fn do_import(vm: &mut Vm, name: String) -> RResult<()> {
    if vm.modules.contains_key(&name) {
        return Ok(());
    }
    vm.modules.insert(name.clone(), true);
    debug!("importing module '{}'", name);

    let loader = vm.module_loader.clone();
    let source = match loader {
        Some(loader) => loader.load(&name).map_err(crate::error::RuntimeError::Custom)?,
        None => return Err(crate::error::RuntimeError::Custom(
            format!("no module loader configured, cannot import '{}'", name),
        )),
    };

    let function = crate::compiler::compile(vm, &source, &name)
        .map_err(|errs| crate::error::RuntimeError::Custom(
            errs.into_iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"),
        ))?;
    vm.run_module_body(function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmconfig::VmConfig;

    #[test]
    fn importing_without_a_loader_raises() {
        let mut vm = Vm::new(VmConfig::default());
        let err = do_import(&mut vm, "missing".to_string()).unwrap_err();
        assert!(err.to_string().contains("no module loader"));
    }

    #[test]
    fn importing_the_same_name_twice_is_a_noop_second_time() {
        let mut vm = Vm::new(VmConfig::default());
        vm.modules.insert("seen".to_string(), true);
        assert!(do_import(&mut vm, "seen".to_string()).is_ok());
    }
}
