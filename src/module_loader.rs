/// Import resolution.
///
/// The VM keeps two registries: `core_libs` (name → module) for
/// host-registered libraries and `scripts` (canonical path → module) for
/// compiled source files. `import_module` runs at compile time of the
/// importing module: the imported source is resolved through the host
/// callbacks, compiled, and its body executed before compilation of the
/// importer continues. A module that is found registered but not yet
/// initialized is mid-import, which makes a cycle.
///
/// The IMPORT opcode repeats only the registry lookup at run time; by then
/// the module is guaranteed cached.

use crate::core::object::{Module, ObjKind};
use crate::core::value::Ref;
use crate::errors::{ErrorKind, PkResult};
use crate::vm::PKVM;

pub fn import_module(vm: &mut PKVM, from_path: &str, name: &str) -> Result<Ref, String> {
    if let Some(&module) = vm.core_libs.get(name) {
        return Ok(module);
    }
    let path = (vm.config.resolve_path_fn)(from_path, name)
        .ok_or_else(|| format!("cannot import module '{}'", name))?;
    if let Some(&module) = vm.scripts.get(&path) {
        if !vm.heap.module(module).initialized {
            return Err(format!("module '{}' already importing", name));
        }
        return Ok(module);
    }
    let source = (vm.config.load_script_fn)(&path)
        .ok_or_else(|| format!("cannot load module '{}' from '{}'", name, path))?;

    let module = vm.allocate(ObjKind::Module(Module::new(path.clone())));
    vm.scripts.insert(path.clone(), module);
    vm.heap.temp_roots.push(module);
    let compiled = crate::compiler::compile(vm, module, &source);
    vm.heap.temp_roots.pop();
    if let Err(e) = compiled {
        vm.scripts.remove(&path);
        // Surface the imported module's own diagnostics, then fail the
        // importing compile with a single summary line.
        match e {
            crate::errors::CompileError::Syntax { path, line, message } => {
                (vm.config.error_fn)(ErrorKind::Compile, &path, line, &message);
            }
            crate::errors::CompileError::UnexpectedEof { path, line } => {
                (vm.config.error_fn)(ErrorKind::Compile, &path, line, "unexpected end of input");
            }
        }
        return Err(format!("failed to compile module '{}'", name));
    }
    match vm.run_module_body(module) {
        PkResult::Success => Ok(module),
        _ => Err(format!("failed to import module '{}'", name)),
    }
}

/// Registry-only lookup for the IMPORT opcode.
pub fn runtime_lookup(vm: &mut PKVM, from_path: &str, name: &str) -> Result<Ref, String> {
    if let Some(&module) = vm.core_libs.get(name) {
        return Ok(module);
    }
    if let Some(path) = (vm.config.resolve_path_fn)(from_path, name) {
        if let Some(&module) = vm.scripts.get(&path) {
            return Ok(module);
        }
    }
    Err(format!("module '{}' is not loaded", name))
}

/// Names `from m import *` splices: everything not `$`-private (and not an
/// internal `@` name).
pub fn public_names(vm: &PKVM, module: Ref) -> Vec<String> {
    let m = vm.heap.module(module);
    let mut names: Vec<String> = Vec::new();
    let mut add = |name: &str| {
        if !name.starts_with('$') && !name.starts_with('@') && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };
    for name in &m.global_names {
        add(name);
    }
    for &f in &m.functions {
        add(&vm.heap.func(f).name);
    }
    for &c in &m.classes {
        add(&vm.heap.class(c).name);
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::PkConfiguration;

    #[test]
    fn unresolvable_imports_error() {
        let mut vm = PKVM::new(PkConfiguration::default());
        let err = import_module(&mut vm, "main.pk", "missing_module").unwrap_err();
        assert!(err.contains("missing_module"));
    }

    #[test]
    fn core_libs_win_over_paths() {
        let mut vm = PKVM::new(PkConfiguration::default());
        let module = vm.new_core_module("mylib");
        let found = import_module(&mut vm, "main.pk", "mylib").unwrap();
        assert_eq!(found, module);
    }
}
