/// The VM context.
///
/// One `PKVM` owns the heap, the module registries, the builtin table, the
/// current fiber pointer and the embedding handle list. Everything the
/// executor and the compiler do is threaded through it; there are no process
/// globals. Collection runs only from `allocate`, so the mutator never holds
/// an unrooted value across a collection point (composites pin operands on
/// the heap's temp-root stack).

use std::collections::HashMap;

use crate::compiler;
use crate::conf::PkConfiguration;
use crate::core::object::{Func, FuncKind, Module, NativeFn, ObjKind, PkStr};
use crate::core::value::{Ref, Value};
use crate::errors::{CompileError, ErrorKind, PkResult};
use crate::fiber::{Fiber, FiberState};
use crate::gc::Heap;
use crate::intrinsics;

/// A pending fiber transfer requested by a builtin; the executor performs
/// the switch once the native call unwinds.
pub enum FiberAction {
    Run { fiber: Ref, args: Vec<Value> },
    Resume { fiber: Ref, value: Value },
    Yield { value: Value },
}

pub struct PKVM {
    pub(crate) heap: Heap,
    pub config: PkConfiguration,
    /// path → module, the import cache.
    pub(crate) scripts: HashMap<String, Ref>,
    /// name → module, host-registered core libraries.
    pub(crate) core_libs: HashMap<String, Ref>,
    /// Builtin functions addressed by PUSH_BUILTIN_FN operands.
    pub(crate) builtins: Vec<Ref>,
    /// The running fiber; the caller links hanging off it form the chain.
    pub(crate) fiber: Option<Ref>,
    pub(crate) fiber_action: Option<FiberAction>,
    /// Slot window of the native call in flight.
    pub(crate) native_bp: usize,
    pub(crate) native_argc: usize,
    /// Return value the in-flight native reported via `native_return`.
    pub(crate) native_ret: Value,
    /// Host-pinned values, scanned as GC roots.
    pub(crate) handles: Vec<Option<Value>>,
    pub(crate) next_type_id: u32,
    /// Depth of synchronous nested dispatch (operator methods); fiber
    /// switching is rejected while non-zero.
    pub(crate) nest_depth: usize,
}

impl PKVM {
    pub fn new(config: PkConfiguration) -> Self {
        let mut heap = Heap::new(config.debug);
        heap.set_tuning(config.heap_grow_percent, config.min_heap_size);
        let mut vm = PKVM {
            heap,
            config,
            scripts: HashMap::new(),
            core_libs: HashMap::new(),
            builtins: Vec::new(),
            fiber: None,
            fiber_action: None,
            native_bp: 0,
            native_argc: 0,
            native_ret: Value::NULL,
            handles: Vec::new(),
            next_type_id: 1,
            nest_depth: 0,
        };
        intrinsics::register_builtins(&mut vm);
        vm
    }

    // -----------------------------------------------------------------------
    // Allocation — the only collection point.
    // -----------------------------------------------------------------------

    pub fn allocate(&mut self, kind: ObjKind) -> Ref {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(kind)
    }

    pub fn new_string(&mut self, s: &str) -> Ref {
        self.allocate(ObjKind::Str(PkStr::new(s.to_string())))
    }

    pub fn new_string_value(&mut self, s: &str) -> Value {
        Value::object(self.new_string(s))
    }

    /// Full mark-and-sweep cycle over every root the VM knows.
    pub fn collect_garbage(&mut self) {
        self.heap.begin_mark();

        let script_refs: Vec<Ref> = self.scripts.values().copied().collect();
        for r in script_refs {
            self.heap.mark_object(r);
        }
        let lib_refs: Vec<Ref> = self.core_libs.values().copied().collect();
        for r in lib_refs {
            self.heap.mark_object(r);
        }
        let builtin_refs: Vec<Ref> = self.builtins.clone();
        for r in builtin_refs {
            self.heap.mark_object(r);
        }
        // The fiber chain is reachable through `caller` links.
        if let Some(f) = self.fiber {
            self.heap.mark_object(f);
        }
        let handle_values: Vec<Value> = self.handles.iter().flatten().copied().collect();
        for v in handle_values {
            self.heap.mark_value(v);
        }
        let pending_ret = self.native_ret;
        self.heap.mark_value(pending_ret);
        if let Some(action) = &self.fiber_action {
            let mut pending: Vec<Value> = Vec::new();
            let mut pending_refs: Vec<Ref> = Vec::new();
            match action {
                FiberAction::Run { fiber, args } => {
                    pending_refs.push(*fiber);
                    pending.extend(args.iter().copied());
                }
                FiberAction::Resume { fiber, value } => {
                    pending_refs.push(*fiber);
                    pending.push(*value);
                }
                FiberAction::Yield { value } => pending.push(*value),
            }
            for r in pending_refs {
                self.heap.mark_object(r);
            }
            for v in pending {
                self.heap.mark_value(v);
            }
        }
        self.heap.mark_temp_roots();

        self.heap.process_grey();
        self.heap.sweep();
    }

    // -----------------------------------------------------------------------
    // Builtins
    // -----------------------------------------------------------------------

    pub(crate) fn add_builtin(&mut self, name: &str, arity: i32, func: NativeFn) {
        let f = self.allocate(ObjKind::Func(Func {
            name: name.to_string(),
            owner: None,
            arity,
            docstring: None,
            kind: FuncKind::Native { func },
        }));
        self.builtins.push(f);
    }

    pub fn find_builtin(&self, name: &str) -> Option<usize> {
        self.builtins
            .iter()
            .position(|&f| self.heap.func(f).name == name)
    }

    // -----------------------------------------------------------------------
    // Native-call argument window
    // -----------------------------------------------------------------------

    /// Number of arguments passed to the native call in flight.
    pub fn native_argc(&self) -> usize {
        self.native_argc
    }

    /// Argument `i` (1-based; slot 0 is the callee/self slot).
    pub fn native_arg(&self, i: usize) -> Value {
        let fiber = self.fiber.expect("native call outside fiber");
        self.heap.fiber(fiber).stack[self.native_bp + i]
    }

    pub fn native_self(&self) -> Value {
        let fiber = self.fiber.expect("native call outside fiber");
        self.heap.fiber(fiber).stack[self.native_bp]
    }

    /// Report the native call's return value (delivered to slot 0 by the
    /// executor once the call unwinds).
    pub fn native_return(&mut self, v: Value) {
        self.native_ret = v;
    }

    // -----------------------------------------------------------------------
    // Interpret entry points
    // -----------------------------------------------------------------------

    /// Compile and run a source string as the module registered under
    /// `path`. Reports errors through the configured callbacks.
    pub fn interpret(&mut self, path: &str, source: &str) -> PkResult {
        let module = match self.compile_source(path, source) {
            Ok(m) => m,
            Err(result) => return result,
        };
        self.run_module_body(module)
    }

    /// Compile `source` into a registered module without running it.
    /// Reports compile errors through the callbacks; `Err` carries the
    /// result code.
    pub fn compile_source(&mut self, path: &str, source: &str) -> Result<Ref, PkResult> {
        let module = self.allocate(ObjKind::Module(Module::new(path.to_string())));
        self.scripts.insert(path.to_string(), module);
        self.heap.temp_roots.push(module);
        let compiled = compiler::compile(self, module, source);
        self.heap.temp_roots.pop();
        match compiled {
            Ok(()) => Ok(module),
            Err(e) => {
                self.scripts.remove(path);
                Err(self.report_compile_error(e))
            }
        }
    }

    /// REPL: compile another chunk of input into an existing module
    /// (preserving its globals) and run the fresh body.
    pub fn interpret_repl(&mut self, module: Ref, source: &str) -> PkResult {
        self.heap.temp_roots.push(module);
        let compiled = compiler::compile(self, module, source);
        self.heap.temp_roots.pop();
        if let Err(e) = compiled {
            return self.report_compile_error(e);
        }
        self.run_module_body(module)
    }

    /// Create the module a REPL session accumulates into.
    pub fn create_repl_module(&mut self) -> Ref {
        let module = self.allocate(ObjKind::Module(Module::new("@(repl)".to_string())));
        self.scripts.insert("@(repl)".to_string(), module);
        module
    }

    pub(crate) fn report_compile_error(&mut self, e: CompileError) -> PkResult {
        match e {
            CompileError::UnexpectedEof { .. } if self.config.repl_mode => {
                PkResult::UnexpectedEof
            }
            CompileError::Syntax { path, line, message } => {
                (self.config.error_fn)(ErrorKind::Compile, &path, line, &message);
                PkResult::CompileError
            }
            CompileError::UnexpectedEof { path, line } => {
                (self.config.error_fn)(ErrorKind::Compile, &path, line, "unexpected end of input");
                PkResult::CompileError
            }
        }
    }

    /// Run a compiled module's body on a fresh fiber.
    pub fn run_module_body(&mut self, module: Ref) -> PkResult {
        let body = match self.heap.module(module).body {
            Some(b) => b,
            None => return PkResult::Success,
        };
        let fiber = self.allocate(ObjKind::Fiber(Fiber::new(body)));
        let result = self.run_fiber(fiber, Vec::new());
        self.heap.module_mut(module).initialized = true;
        match result {
            Ok(_) => PkResult::Success,
            Err(err) => {
                let path = self.heap.module(module).path.clone();
                (self.config.error_fn)(ErrorKind::Runtime, &path, 0, &err.message);
                for frame in &err.stacktrace {
                    (self.config.error_fn)(
                        ErrorKind::Stacktrace,
                        &frame.path,
                        frame.line,
                        &frame.func_name,
                    );
                }
                PkResult::RuntimeError
            }
        }
    }

    // -----------------------------------------------------------------------
    // Misc accessors used across modules
    // -----------------------------------------------------------------------

    pub(crate) fn current_fiber(&self) -> Ref {
        self.fiber.expect("no running fiber")
    }

    pub fn heap_stats(&self) -> crate::gc::GcStats {
        self.heap.stats.clone()
    }

    /// Disassembly of a module's body and every function it defines.
    pub fn dump_module(&self, module: Ref) -> String {
        let mut out = String::new();
        let m = self.heap.module(module);
        let mut dump_one = |func: Ref, out: &mut String| {
            let f = self.heap.func(func);
            if let FuncKind::Bytecode { chunk, .. } = &f.kind {
                crate::bytecode::disassemble(chunk, &f.name, out);
            }
        };
        if let Some(body) = m.body {
            dump_one(body, &mut out);
        }
        for &f in &m.functions {
            dump_one(f, &mut out);
        }
        out
    }

    /// Validate that a value is a fiber object; used by the fiber builtins.
    pub(crate) fn as_fiber(&self, v: Value) -> Result<Ref, String> {
        if v.is_object() && self.heap.is_kind_fiber(v.as_object()) {
            Ok(v.as_object())
        } else {
            Err(format!(
                "expected a Fiber, got {}",
                crate::core::object::type_name(&self.heap, v)
            ))
        }
    }

    pub(crate) fn fiber_state(&self, fiber: Ref) -> FiberState {
        self.heap.fiber(fiber).state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::PkList;

    fn vm() -> PKVM {
        PKVM::new(PkConfiguration::default())
    }

    #[test]
    fn builtins_are_registered() {
        let vm = vm();
        assert!(vm.find_builtin("print").is_some());
        assert!(vm.find_builtin("str").is_some());
        assert!(vm.find_builtin("yield").is_some());
        assert!(vm.find_builtin("no_such_builtin").is_none());
    }

    #[test]
    fn collect_preserves_registered_modules() {
        let mut vm = vm();
        let module = vm.allocate(ObjKind::Module(Module::new("m.pk".into())));
        vm.scripts.insert("m.pk".into(), module);
        let s = vm.new_string("global value");
        vm.heap.module_mut(module).global_names.push("g".into());
        vm.heap.module_mut(module).globals.push(Value::object(s));
        vm.collect_garbage();
        assert_eq!(vm.heap.str_(s).data, "global value");
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut vm = vm();
        let live = vm.heap.live_objects();
        let _garbage = vm.allocate(ObjKind::List(PkList::new()));
        vm.collect_garbage();
        assert_eq!(vm.heap.live_objects(), live);
    }

    #[test]
    fn handles_pin_values() {
        let mut vm = vm();
        let s = vm.new_string("pinned");
        let handle = vm.make_handle(Value::object(s));
        vm.collect_garbage();
        assert_eq!(vm.heap.str_(s).data, "pinned");
        vm.release_handle(handle);
        vm.collect_garbage();
    }
}
