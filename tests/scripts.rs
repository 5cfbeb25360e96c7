/// End-to-end script tests through the public API: compile + run a source
/// string against a VM whose output and error callbacks are captured.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use pocketlang::{PkConfiguration, PkResult, PKVM};

struct Captured {
    out: Rc<RefCell<String>>,
    errors: Rc<RefCell<Vec<String>>>,
}

fn capturing_config() -> (PkConfiguration, Captured) {
    let out = Rc::new(RefCell::new(String::new()));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let out_sink = Rc::clone(&out);
    let err_sink = Rc::clone(&errors);
    let mut conf = PkConfiguration::default();
    conf.write_fn = Box::new(move |text| out_sink.borrow_mut().push_str(text));
    conf.error_fn = Box::new(move |_kind, file, line, msg| {
        err_sink.borrow_mut().push(format!("{}:{}: {}", file, line, msg));
    });
    (conf, Captured { out, errors })
}

fn run(source: &str) -> (PkResult, String) {
    let (conf, captured) = capturing_config();
    let mut vm = PKVM::new(conf);
    let result = vm.interpret("test.pk", source);
    let out = captured.out.borrow().clone();
    (result, out)
}

fn run_ok(source: &str) -> String {
    let (result, out) = run(source);
    assert_eq!(result, PkResult::Success, "script failed; output so far: {out:?}");
    out
}

// ---------------------------------------------------------------------------
// Literals and printing
// ---------------------------------------------------------------------------

#[test]
fn literal_rendering_is_canonical() {
    let out = run_ok(
        "print(55)\n\
         print(0.5)\n\
         print(-0.0)\n\
         print(true)\n\
         print(null)\n\
         print('plain')\n",
    );
    assert_eq!(out, "55\n0.5\n-0\ntrue\nnull\nplain\n");
}

#[test]
fn infinities_and_nan_render_canonically() {
    let out = run_ok(
        "big = 1e308 * 10\n\
         print(big)\n\
         print(-big)\n\
         print(big - big)\n",
    );
    assert_eq!(out, "+inf\n-inf\nnan\n");
}

#[test]
fn numeric_literal_forms() {
    let out = run_ok("print(0xff)\nprint(0b101)\nprint(1e3)\nprint(2.5e-1)\n");
    assert_eq!(out, "255\n5\n1000\n0.25\n");
}

#[test]
fn string_interpolation_evaluates_expressions() {
    let out = run_ok("print('hello $(2+3)')\n");
    assert_eq!(out, "hello 5\n");
    let out = run_ok("name = 'world'\nprint('hello ${name}!')\nprint('sum: $name$name')\n");
    assert_eq!(out, "hello world!\nsum: worldworld\n");
}

// ---------------------------------------------------------------------------
// Functions, recursion, forward references
// ---------------------------------------------------------------------------

#[test]
fn fibonacci_recursion() {
    let out = run_ok(
        "def fib(n) if n < 2 then return n end return fib(n-1) + fib(n-2) end\n\
         print(fib(10))\n",
    );
    assert_eq!(out, "55\n");
}

#[test]
fn forward_references_resolve_after_the_module_compiles() {
    let out = run_ok(
        "def main() return helper() end\n\
         def helper() return 42 end\n\
         print(main())\n",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn unresolved_forward_reference_is_a_compile_error() {
    let (result, _) = run("def main() return nowhere() end\nprint(main())\n");
    assert_eq!(result, PkResult::CompileError);
}

#[test]
fn tail_recursion_runs_in_bounded_frames() {
    // Frame depth is capped; a non-tail recursion of this depth would
    // exceed it, so completing proves the TAIL_CALL rewrite.
    let out = run_ok(
        "def count(i, n)\n\
         if i == n then return i end\n\
         return count(i + 1, n)\n\
         end\n\
         print(count(0, 100000))\n",
    );
    assert_eq!(out, "100000\n");
}

#[test]
fn function_literals_are_first_class() {
    let out = run_ok(
        "twice = func(x) return x * 2 end\n\
         print(twice(21))\n\
         print(twice.arity)\n",
    );
    assert_eq!(out, "42\n1\n");
}

#[test]
fn chain_call_pipes_the_value_as_first_argument() {
    let out = run_ok(
        "def add(a, b) return a + b end\n\
         print(5 -> str)\n\
         print(1 -> add {2})\n",
    );
    assert_eq!(out, "5\n3\n");
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

#[test]
fn if_elsif_else_chains() {
    let out = run_ok(
        "def judge(n)\n\
         if n < 0 then return 'neg'\n\
         elsif n == 0 then return 'zero'\n\
         else return 'pos'\n\
         end\n\
         end\n\
         print(judge(-1), judge(0), judge(9))\n",
    );
    assert_eq!(out, "neg zero pos\n");
}

#[test]
fn while_with_break_and_continue() {
    let out = run_ok(
        "i = 0\n\
         total = 0\n\
         while true do\n\
         i += 1\n\
         if i > 10 then break end\n\
         if i % 2 == 0 then continue end\n\
         total += i\n\
         end\n\
         print(total)\n",
    );
    assert_eq!(out, "25\n");
}

#[test]
fn range_iteration_is_exclusive() {
    let out = run_ok("for i in 0..5 do print(i) end\n");
    assert_eq!(out, "0\n1\n2\n3\n4\n");
    // Empty when from >= to.
    let out = run_ok("for i in 3..3 do print(i) end\nprint('done')\n");
    assert_eq!(out, "done\n");
}

#[test]
fn string_iteration_yields_characters() {
    let out = run_ok("for c in 'abc' do print(c) end\n");
    assert_eq!(out, "a\nb\nc\n");
}

#[test]
fn compound_assignment_operators() {
    let out = run_ok(
        "x = 10\n\
         x += 5\n\
         x *= 2\n\
         x -= 6\n\
         x /= 4\n\
         print(x)\n\
         bits = 0b1100\n\
         bits &= 0b1010\n\
         bits |= 0b0001\n\
         bits <<= 2\n\
         print(bits)\n",
    );
    assert_eq!(out, "6\n36\n");
}

#[test]
fn short_circuit_booleans_produce_bare_bools() {
    let out = run_ok(
        "print(true and false)\n\
         print(1 == 1 or 1 == 2)\n\
         print(null and true)\n\
         print(3 > 2 and 2 > 1)\n",
    );
    assert_eq!(out, "false\ntrue\nfalse\ntrue\n");
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

#[test]
fn list_insert_remove_round_trip() {
    let out = run_ok(
        "xs = [1, 2, 3, 4]\n\
         xs.insert(2, 99)\n\
         print(xs.remove_at(2))\n\
         print(xs)\n\
         xs.append(5)\n\
         print(xs.length, xs.find(5))\n",
    );
    assert_eq!(out, "99\n[1, 2, 3, 4]\n5 4\n");
}

#[test]
fn map_inserts_removes_and_iterates() {
    let out = run_ok(
        "m = {'a': 1, 'b': 2}\n\
         m['c'] = 3\n\
         total = 0\n\
         seen = 0\n\
         for k in m do\n\
         total += m[k]\n\
         seen += 1\n\
         end\n\
         print(total, seen, m.length)\n\
         m.remove('a')\n\
         print(m.length, m.has('a'), m.has('b'))\n",
    );
    assert_eq!(out, "6 3 3\n2 false true\n");
}

#[test]
fn map_iteration_shows_each_pair() {
    let out = run_ok(
        "m = {'a': 1, 'b': 2}\n\
         m['c'] = 3\n\
         for k in m do print(k, m[k]) end\n",
    );
    let mut lines: Vec<&str> = out.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["a 1", "b 2", "c 3"]);
}

#[test]
fn membership_tests() {
    let out = run_ok(
        "print(2 in [1, 2, 3])\n\
         print('x' in {'x': 1})\n\
         print('ell' in 'hello')\n\
         print(3 in 0..3)\n\
         print(2 in 0..3)\n",
    );
    assert_eq!(out, "true\ntrue\ntrue\nfalse\ntrue\n");
}

#[test]
fn cyclic_list_prints_without_recursion() {
    let out = run_ok("a = []\na.append(a)\nprint(a)\n");
    assert_eq!(out, "[[...]]\n");
}

#[test]
fn string_methods_and_attributes() {
    let out = run_ok(
        "s = '  Hello World  '\n\
         print(s.strip)\n\
         print(s.strip.lower)\n\
         print('hello'.length)\n\
         print('one,two,three'.split(','))\n\
         print('hello'.replace('l', 'L'))\n\
         print('hello'.find('llo'))\n",
    );
    assert_eq!(
        out,
        "Hello World\nhello world\n5\n['one', 'two', 'three']\nheLLo\n2\n"
    );
}

#[test]
fn subscript_reads_and_writes() {
    let out = run_ok(
        "xs = [10, 20, 30]\n\
         xs[1] = 21\n\
         xs[1] += 1\n\
         print(xs[1])\n\
         print('abc'[1])\n",
    );
    assert_eq!(out, "22\nb\n");
}

#[test]
fn string_subscript_is_byte_addressed() {
    // 'é' is two bytes, so the string is six bytes long and indexing
    // lands on byte offsets, not character counts.
    let out = run_ok(
        "s = 'héllo'\n\
         print(s.length)\n\
         print(s[0])\n\
         print(s[1])\n\
         print(s[3])\n",
    );
    assert_eq!(out, "6\nh\né\nl\n");

    // Offset 2 is the middle of the two-byte 'é': a runtime error, not
    // a crash.
    let (result, out) = run("print('héllo'[2])\n");
    assert_eq!(result, PkResult::RuntimeError);
    assert_eq!(out, "");
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

#[test]
fn class_fields_and_instances() {
    let out = run_ok(
        "class V\n\
         x = 0\n\
         y = 0\n\
         end\n\
         v = V()\n\
         v.x = 3\n\
         v.y = 4\n\
         print(v.x * v.x + v.y * v.y)\n",
    );
    assert_eq!(out, "25\n");
}

#[test]
fn instances_are_independent() {
    let out = run_ok(
        "class P\n\
         n = 1\n\
         end\n\
         a = P()\n\
         b = P()\n\
         a.n = 7\n\
         print(a.n, b.n)\n\
         print(a is P, 5 is P)\n",
    );
    assert_eq!(out, "7 1\ntrue false\n");
}

#[test]
fn unknown_fields_raise() {
    let (result, _) = run("class C\nx = 0\nend\nc = C()\nprint(c.missing)\n");
    assert_eq!(result, PkResult::RuntimeError);
    let (result, _) = run("class C\nx = 0\nend\nc = C()\nc.missing = 1\n");
    assert_eq!(result, PkResult::RuntimeError);
}

// ---------------------------------------------------------------------------
// Fibers
// ---------------------------------------------------------------------------

#[test]
fn fiber_yield_resume_sequence() {
    let out = run_ok(
        "def f()\n\
         yield(1)\n\
         yield(2)\n\
         return 3\n\
         end\n\
         fb = Fiber(f)\n\
         print(run(fb))\n\
         print(resume(fb))\n\
         print(resume(fb))\n\
         print(fb.is_done)\n",
    );
    assert_eq!(out, "1\n2\n3\ntrue\n");
}

#[test]
fn resuming_a_finished_fiber_raises() {
    let (result, out) = run(
        "def f() return 1 end\n\
         fb = Fiber(f)\n\
         print(run(fb))\n\
         resume(fb)\n",
    );
    assert_eq!(out, "1\n");
    assert_eq!(result, PkResult::RuntimeError);
}

#[test]
fn generator_loop_drives_a_fiber() {
    let out = run_ok(
        "def gen() for i in 0..3 do yield(i) end end\n\
         fb = Fiber(gen)\n\
         v = run(fb)\n\
         while not fb.is_done do\n\
         print(v)\n\
         v = resume(fb)\n\
         end\n",
    );
    assert_eq!(out, "0\n1\n2\n");
}

#[test]
fn resume_value_becomes_the_yield_result() {
    let out = run_ok(
        "def echo()\n\
         got = yield('ready')\n\
         return got + 1\n\
         end\n\
         fb = Fiber(echo)\n\
         print(run(fb))\n\
         print(resume(fb, 41))\n",
    );
    assert_eq!(out, "ready\n42\n");
}

#[test]
fn fiber_arguments_and_function_attribute() {
    let out = run_ok(
        "def add(a, b) return a + b end\n\
         fb = Fiber(add)\n\
         print(run(fb, 20, 22))\n\
         print(fb.function.name)\n",
    );
    assert_eq!(out, "42\nadd\n");
}

// ---------------------------------------------------------------------------
// Modules & imports
// ---------------------------------------------------------------------------

fn vm_with_sources(files: &[(&str, &str)]) -> (PKVM, Captured) {
    let (mut conf, captured) = capturing_config();
    let map: HashMap<String, String> = files
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    conf.resolve_path_fn = Box::new(|_from, name| Some(format!("{}.pk", name)));
    conf.load_script_fn = Box::new(move |path| map.get(path).cloned());
    (PKVM::new(conf), captured)
}

const UTIL_PK: &str = "module util\n\
                       value = 42\n\
                       $secret = 7\n\
                       def twice(x) return x * 2 end\n";

#[test]
fn import_binds_the_module_object() {
    let (mut vm, captured) = vm_with_sources(&[("util.pk", UTIL_PK)]);
    let result = vm.interpret(
        "main.pk",
        "import util\nprint(util.value)\nprint(util.twice(21))\n",
    );
    assert_eq!(result, PkResult::Success);
    assert_eq!(captured.out.borrow().as_str(), "42\n42\n");
}

#[test]
fn from_import_selects_names() {
    let (mut vm, captured) = vm_with_sources(&[("util.pk", UTIL_PK)]);
    let result = vm.interpret(
        "main.pk",
        "from util import twice, value as v\nprint(twice(v))\n",
    );
    assert_eq!(result, PkResult::Success);
    assert_eq!(captured.out.borrow().as_str(), "84\n");
}

#[test]
fn from_import_star_skips_private_names() {
    let (mut vm, captured) = vm_with_sources(&[("util.pk", UTIL_PK)]);
    let result = vm.interpret(
        "main.pk",
        "from util import *\nprint(twice(value))\nprint($secret)\n",
    );
    // `$secret` never got spliced, so the reference is a compile error.
    assert_eq!(result, PkResult::CompileError);
    assert_eq!(captured.out.borrow().as_str(), "");

    let (mut vm, captured) = vm_with_sources(&[("util.pk", UTIL_PK)]);
    let result = vm.interpret("main.pk", "from util import *\nprint(twice(value))\n");
    assert_eq!(result, PkResult::Success);
    assert_eq!(captured.out.borrow().as_str(), "84\n");
}

#[test]
fn modules_are_cached_across_imports() {
    let (mut vm, captured) = vm_with_sources(&[
        ("counter.pk", "module counter\nprint('loaded')\nn = 0\n"),
        ("a.pk", "import counter\n"),
    ]);
    let result = vm.interpret("main.pk", "import a\nimport counter\nprint('done')\n");
    assert_eq!(result, PkResult::Success);
    // The counter body ran exactly once.
    assert_eq!(captured.out.borrow().as_str(), "loaded\ndone\n");
}

#[test]
fn cyclic_imports_are_a_compile_error() {
    let (mut vm, captured) = vm_with_sources(&[
        ("a.pk", "import b\n"),
        ("b.pk", "import a\n"),
    ]);
    let result = vm.interpret("main.pk", "import a\n");
    assert_eq!(result, PkResult::CompileError);
    let errors = captured.errors.borrow();
    assert!(
        errors.iter().any(|e| e.contains("already importing")),
        "expected a cycle diagnostic, got: {:?}",
        *errors
    );
}

#[test]
fn missing_imports_are_a_compile_error() {
    let (result, _) = run("import no_such_module\n");
    assert_eq!(result, PkResult::CompileError);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[test]
fn division_by_zero_raises() {
    let (result, _) = run("print(1 / 0)\n");
    assert_eq!(result, PkResult::RuntimeError);
}

#[test]
fn runtime_errors_carry_a_stacktrace() {
    let (conf, captured) = capturing_config();
    let mut vm = PKVM::new(conf);
    let result = vm.interpret(
        "trace.pk",
        "def inner() return 1 / 0 end\n\
         def outer() return inner() + 1 end\n\
         print(outer())\n",
    );
    assert_eq!(result, PkResult::RuntimeError);
    let errors = captured.errors.borrow();
    assert!(errors.iter().any(|e| e.contains("division by zero")));
    assert!(errors.iter().any(|e| e.contains("inner")));
}

#[test]
fn compile_errors_are_stable() {
    let bad = "def broken(\nprint(1)\n";
    let (conf1, cap1) = capturing_config();
    let mut vm1 = PKVM::new(conf1);
    assert_eq!(vm1.interpret("x.pk", bad), PkResult::CompileError);
    let (conf2, cap2) = capturing_config();
    let mut vm2 = PKVM::new(conf2);
    assert_eq!(vm2.interpret("x.pk", bad), PkResult::CompileError);
    assert_eq!(*cap1.errors.borrow(), *cap2.errors.borrow());
    assert!(!cap1.errors.borrow().is_empty());
}

#[test]
fn assertion_builtin() {
    let out = run_ok("assert(1 == 1)\nprint('ok')\n");
    assert_eq!(out, "ok\n");
    let (result, _) = run("assert(1 == 2, 'math broke')\n");
    assert_eq!(result, PkResult::RuntimeError);
}

#[test]
fn deep_interpolation_nesting_is_limited() {
    // Eight levels are allowed; nine are not.
    let mut literal = String::from("1");
    for _ in 0..9 {
        literal = format!("'${{{}}}'", literal);
    }
    let (result, _) = run(&format!("print({})\n", literal));
    assert_eq!(result, PkResult::CompileError);
}

// ---------------------------------------------------------------------------
// GC pressure
// ---------------------------------------------------------------------------

#[test]
fn collection_cycles_preserve_live_values() {
    let (mut conf, captured) = capturing_config();
    // A tiny heap floor forces many collection cycles mid-script.
    conf.min_heap_size = 1024;
    let mut vm = PKVM::new(conf);
    let result = vm.interpret(
        "gc.pk",
        "s = ''\n\
         for i in 0..200 do\n\
         s = s + 'x'\n\
         end\n\
         keep = []\n\
         for i in 0..50 do\n\
         keep.append('item ' + str(i))\n\
         end\n\
         print(s.length)\n\
         print(keep.length, keep[0], keep[49])\n",
    );
    assert_eq!(result, PkResult::Success);
    assert_eq!(captured.out.borrow().as_str(), "200\n50 item 0 item 49\n");
    assert!(vm.heap_stats().cycles > 0, "expected at least one GC cycle");
}

// ---------------------------------------------------------------------------
// REPL mode
// ---------------------------------------------------------------------------

#[test]
fn repl_keeps_globals_and_echoes_expressions() {
    let (mut conf, captured) = capturing_config();
    conf.repl_mode = true;
    let mut vm = PKVM::new(conf);
    let module = vm.create_repl_module();

    assert_eq!(vm.interpret_repl(module, "x = 40\n"), PkResult::Success);
    assert_eq!(vm.interpret_repl(module, "x + 2\n"), PkResult::Success);
    assert_eq!(captured.out.borrow().as_str(), "42\n");
}

#[test]
fn repl_asks_for_more_lines_on_open_constructs() {
    let (mut conf, captured) = capturing_config();
    conf.repl_mode = true;
    let mut vm = PKVM::new(conf);
    let module = vm.create_repl_module();

    assert_eq!(
        vm.interpret_repl(module, "def double(x)\n"),
        PkResult::UnexpectedEof
    );
    assert_eq!(
        vm.interpret_repl(module, "def double(x)\nreturn x * 2\nend\n"),
        PkResult::Success
    );
    assert_eq!(
        vm.interpret_repl(module, "print(double(21))\n"),
        PkResult::Success
    );
    assert_eq!(captured.out.borrow().as_str(), "42\n");
}

#[test]
fn repl_reports_real_syntax_errors() {
    let (mut conf, captured) = capturing_config();
    conf.repl_mode = true;
    let mut vm = PKVM::new(conf);
    let module = vm.create_repl_module();
    assert_eq!(vm.interpret_repl(module, "1 +* 2\n"), PkResult::CompileError);
    assert!(!captured.errors.borrow().is_empty());
}
