/// Builtin functions — the names the compiler resolves after locals,
/// globals, classes and module functions.
///
/// Builtins read their arguments through the VM's native slot window
/// (slot 0 is the return slot, slots 1..=argc the arguments) and report
/// results with `native_return`. The fiber builtins never switch directly;
/// they record a `FiberAction` the executor applies once the call unwinds.

use crate::core::object::{to_display_string, type_name, FuncKind, ObjKind, PkRange};
use crate::core::value::Value;
use crate::fiber::Fiber;
use crate::vm::{FiberAction, PKVM};

pub fn register_builtins(vm: &mut PKVM) {
    vm.add_builtin("print", -1, builtin_print);
    vm.add_builtin("input", -1, builtin_input);
    vm.add_builtin("str", 1, builtin_str);
    vm.add_builtin("repr", 1, builtin_repr);
    vm.add_builtin("type", 1, builtin_type);
    vm.add_builtin("assert", -1, builtin_assert);
    vm.add_builtin("len", 1, builtin_len);
    vm.add_builtin("Fiber", 1, builtin_fiber_new);
    vm.add_builtin("run", -1, builtin_fiber_run);
    vm.add_builtin("resume", -1, builtin_fiber_resume);
    vm.add_builtin("yield", -1, builtin_yield);
}

/// print(...) — arguments joined with a single space, newline-terminated.
fn builtin_print(vm: &mut PKVM) -> Result<(), String> {
    let mut out = String::new();
    for i in 1..=vm.native_argc() {
        if i > 1 {
            out.push(' ');
        }
        let v = vm.native_arg(i);
        out.push_str(&to_display_string(&vm.heap, v, false));
    }
    out.push('\n');
    (vm.config.write_fn)(&out);
    Ok(())
}

/// input([prompt]) — read one line from the host.
fn builtin_input(vm: &mut PKVM) -> Result<(), String> {
    match vm.native_argc() {
        0 => {}
        1 => {
            let prompt = vm.native_arg(1);
            let text = to_display_string(&vm.heap, prompt, false);
            (vm.config.write_fn)(&text);
        }
        n => return Err(format!("input() expected 0 or 1 arguments, got {}", n)),
    }
    let line = (vm.config.read_fn)();
    let v = vm.new_string_value(&line);
    vm.native_return(v);
    Ok(())
}

fn builtin_str(vm: &mut PKVM) -> Result<(), String> {
    let v = vm.native_arg(1);
    let text = to_display_string(&vm.heap, v, false);
    let out = vm.new_string_value(&text);
    vm.native_return(out);
    Ok(())
}

fn builtin_repr(vm: &mut PKVM) -> Result<(), String> {
    let v = vm.native_arg(1);
    let text = to_display_string(&vm.heap, v, true);
    let out = vm.new_string_value(&text);
    vm.native_return(out);
    Ok(())
}

fn builtin_type(vm: &mut PKVM) -> Result<(), String> {
    let v = vm.native_arg(1);
    let name = type_name(&vm.heap, v).to_string();
    let out = vm.new_string_value(&name);
    vm.native_return(out);
    Ok(())
}

/// assert(condition [, message]) — raises when the condition is falsy.
fn builtin_assert(vm: &mut PKVM) -> Result<(), String> {
    let argc = vm.native_argc();
    if argc == 0 || argc > 2 {
        return Err(format!("assert() expected 1 or 2 arguments, got {}", argc));
    }
    let condition = vm.native_arg(1);
    if condition.is_truthy() {
        return Ok(());
    }
    if argc == 2 {
        let msg = vm.native_arg(2);
        Err(format!(
            "assertion failed: {}",
            to_display_string(&vm.heap, msg, false)
        ))
    } else {
        Err("assertion failed".to_string())
    }
}

fn builtin_len(vm: &mut PKVM) -> Result<(), String> {
    let v = vm.native_arg(1);
    let len = if v.is_object() {
        match &vm.heap.get(v.as_object()).kind {
            ObjKind::Str(s) => s.data.len() as f64,
            ObjKind::List(l) => l.elems.len() as f64,
            ObjKind::Map(m) => m.count as f64,
            ObjKind::Range(PkRange { from, to }) => (to - from).max(0.0),
            _ => return Err(format!("{} has no length", type_name(&vm.heap, v))),
        }
    } else {
        return Err(format!("{} has no length", type_name(&vm.heap, v)));
    };
    vm.native_return(Value::num(len));
    Ok(())
}

/// Fiber(fn) — wrap a bytecode function in a NEW fiber.
fn builtin_fiber_new(vm: &mut PKVM) -> Result<(), String> {
    let v = vm.native_arg(1);
    if !v.is_object() {
        return Err(format!(
            "Fiber() expected a function, got {}",
            type_name(&vm.heap, v)
        ));
    }
    let func = v.as_object();
    match &vm.heap.get(func).kind {
        ObjKind::Func(f) if matches!(f.kind, FuncKind::Bytecode { .. }) => {}
        _ => {
            return Err(format!(
                "Fiber() expected a function, got {}",
                type_name(&vm.heap, v)
            ))
        }
    }
    let fiber = vm.allocate(ObjKind::Fiber(Fiber::new(func)));
    vm.native_return(Value::object(fiber));
    Ok(())
}

/// run(fiber, ...) — start a NEW fiber; returns the first yielded value or
/// the fiber's return value.
fn builtin_fiber_run(vm: &mut PKVM) -> Result<(), String> {
    if vm.native_argc() < 1 {
        return Err("run() expected a fiber".to_string());
    }
    let fiber = vm.as_fiber(vm.native_arg(1))?;
    let args: Vec<Value> = (2..=vm.native_argc()).map(|i| vm.native_arg(i)).collect();
    vm.fiber_action = Some(FiberAction::Run { fiber, args });
    Ok(())
}

/// resume(fiber [, value]) — continue a YIELDED fiber; `value` becomes the
/// result of its suspended yield.
fn builtin_fiber_resume(vm: &mut PKVM) -> Result<(), String> {
    let argc = vm.native_argc();
    if argc == 0 || argc > 2 {
        return Err(format!("resume() expected 1 or 2 arguments, got {}", argc));
    }
    let fiber = vm.as_fiber(vm.native_arg(1))?;
    let value = if argc == 2 { vm.native_arg(2) } else { Value::NULL };
    vm.fiber_action = Some(FiberAction::Resume { fiber, value });
    Ok(())
}

/// yield([value]) — suspend the current fiber, handing `value` to whoever
/// ran or resumed it.
fn builtin_yield(vm: &mut PKVM) -> Result<(), String> {
    let argc = vm.native_argc();
    if argc > 1 {
        return Err(format!("yield() expected 0 or 1 arguments, got {}", argc));
    }
    let value = if argc == 1 { vm.native_arg(1) } else { Value::NULL };
    vm.fiber_action = Some(FiberAction::Yield { value });
    Ok(())
}
