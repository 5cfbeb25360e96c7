/// The executor: fetch one opcode, dispatch, repeat.
///
/// Frames live on the current fiber; the loop reads code through the
/// frame's shared chunk, so instruction fetch never touches a heap slot
/// twice. Fiber transfers requested by builtins (`run`/`resume`/`yield`)
/// are deferred into `fiber_action` and performed between instructions,
/// which keeps every suspension point at a call boundary — operator
/// dispatch and synchronous method calls can never suspend.
///
/// Runtime errors mark the whole caller chain ERROR, capture a stacktrace
/// from the live frames and unwind straight to the host.

use std::rc::Rc;

use crate::bytecode::{read_u16, Op};
use crate::core::object::{
    self, map_get, map_remove, map_set, to_display_string, type_name, value_equals, FuncKind,
    ObjKind, PkList, PkMap, PkRange,
};
use crate::core::oop::{is_instance_of, resolve_method, PkInstance};
use crate::core::value::{Ref, Value};
use crate::errors::{RuntimeError, TraceFrame};
use crate::fiber::{CallFrame, FiberState};
use crate::module_loader;
use crate::vm::{FiberAction, PKVM};

const MAX_CALL_DEPTH: usize = 65536;

enum StepOut {
    Continue,
    /// The outermost fiber finished or yielded with no caller.
    HostReturn(Value),
    /// A synchronous nested call returned to its base frame.
    NestedReturn(Value),
}

/// Per-instruction context snapshot, copied out of the heap so handlers can
/// borrow freely.
struct Ctx {
    module: Option<Ref>,
    bp: usize,
    /// ip just past this instruction and its operands.
    ip: usize,
}

impl PKVM {
    // -----------------------------------------------------------------------
    // Host entry
    // -----------------------------------------------------------------------

    /// Start a NEW fiber with `args` and run the VM until the outermost
    /// fiber completes, errors, or yields to the host.
    pub fn run_fiber(&mut self, fiber: Ref, args: Vec<Value>) -> Result<Value, RuntimeError> {
        if let Err(msg) = self.start_fiber(fiber, None, args) {
            return Err(self.make_runtime_error(msg));
        }
        let saved = self.fiber.replace(fiber);
        let result = match self.interpret_loop(None) {
            Ok(v) => Ok(v),
            Err(msg) => Err(self.make_runtime_error(msg)),
        };
        self.fiber = saved;
        result
    }

    fn interpret_loop(&mut self, stop: Option<(Ref, usize)>) -> Result<Value, String> {
        loop {
            match self.step(stop)? {
                StepOut::Continue => {}
                StepOut::HostReturn(v) | StepOut::NestedReturn(v) => return Ok(v),
            }
        }
    }

    /// Move a NEW fiber into RUNNING with a frame for its function.
    fn start_fiber(
        &mut self,
        fiber: Ref,
        caller: Option<Ref>,
        args: Vec<Value>,
    ) -> Result<(), String> {
        match self.heap.fiber(fiber).state {
            FiberState::New => {}
            FiberState::Done | FiberState::Error => return Err("fiber finished".to_string()),
            _ => return Err("fiber has already been started".to_string()),
        }
        let func = self.heap.fiber(fiber).func;
        let (arity, chunk) = match &self.heap.func(func).kind {
            FuncKind::Bytecode { chunk, .. } => (self.heap.func(func).arity, Rc::clone(chunk)),
            FuncKind::Native { .. } => return Err("a fiber requires a bytecode function".into()),
        };
        if arity >= 0 && args.len() != arity as usize {
            return Err(format!("expected {} arguments, got {}", arity, args.len()));
        }
        let f = self.heap.fiber_mut(fiber);
        f.stack.clear();
        f.stack.push(Value::object(func));
        f.stack.extend(args);
        f.frames.push(CallFrame { func, chunk, ip: 0, bp: 0 });
        f.state = FiberState::Running;
        f.caller = caller;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Error plumbing
    // -----------------------------------------------------------------------

    /// Build the host-visible error: stacktrace over every frame of the
    /// fiber chain, every fiber in the chain marked ERROR.
    pub(crate) fn make_runtime_error(&mut self, message: String) -> RuntimeError {
        let mut stacktrace = Vec::new();
        let mut current = self.fiber;
        while let Some(fr) = current {
            {
                let fiber = self.heap.fiber(fr);
                for frame in fiber.frames.iter().rev() {
                    let line = if frame.chunk.lines.is_empty() {
                        0
                    } else {
                        let idx = frame.ip.min(frame.chunk.lines.len() - 1);
                        frame.chunk.lines[idx]
                    };
                    let func = self.heap.func(frame.func);
                    let path = func
                        .owner
                        .map(|m| self.heap.module(m).path.clone())
                        .unwrap_or_else(|| "<builtin>".to_string());
                    stacktrace.push(TraceFrame {
                        func_name: func.name.clone(),
                        path,
                        line,
                    });
                }
            }
            let fiber = self.heap.fiber_mut(fr);
            fiber.state = FiberState::Error;
            fiber.error = Some(message.clone());
            current = fiber.caller.take();
        }
        RuntimeError { message, stacktrace }
    }

    // -----------------------------------------------------------------------
    // Stack helpers (short heap borrows)
    // -----------------------------------------------------------------------

    fn push(&mut self, v: Value) {
        let f = self.current_fiber();
        self.heap.fiber_mut(f).stack.push(v);
    }

    fn pop(&mut self) -> Value {
        let f = self.current_fiber();
        self.heap.fiber_mut(f).stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, depth: usize) -> Value {
        let f = self.current_fiber();
        let stack = &self.heap.fiber(f).stack;
        stack[stack.len() - 1 - depth]
    }

    fn stack_len(&self) -> usize {
        let f = self.current_fiber();
        self.heap.fiber(f).stack.len()
    }

    fn stack_at(&self, index: usize) -> Value {
        let f = self.current_fiber();
        self.heap.fiber(f).stack[index]
    }

    fn stack_set(&mut self, index: usize, v: Value) {
        let f = self.current_fiber();
        self.heap.fiber_mut(f).stack[index] = v;
    }

    fn truncate_stack(&mut self, len: usize) {
        let f = self.current_fiber();
        self.heap.fiber_mut(f).stack.truncate(len);
    }

    fn set_ip(&mut self, ip: usize) {
        let f = self.current_fiber();
        self.heap.fiber_mut(f).frames.last_mut().expect("no frame").ip = ip;
    }

    // -----------------------------------------------------------------------
    // Fetch / dispatch
    // -----------------------------------------------------------------------

    fn step(&mut self, stop: Option<(Ref, usize)>) -> Result<StepOut, String> {
        let (ctx, op, operand) = {
            let fiber_ref = self.current_fiber();
            let fiber = self.heap.fiber(fiber_ref);
            let frame = fiber.frames.last().expect("fiber with no frames");
            let code = &frame.chunk.code;
            let ip = frame.ip;
            let op = Op::from_byte(code[ip]);
            let operand = match op.operand_width() {
                0 => (0u16, 0u16),
                1 => (code[ip + 1] as u16, 0),
                2 => (read_u16(code, ip + 1), 0),
                4 => (read_u16(code, ip + 1), read_u16(code, ip + 3)),
                _ => unreachable!(),
            };
            let ctx = Ctx {
                module: self.heap.func(frame.func).owner,
                bp: frame.bp,
                ip: ip + 1 + op.operand_width(),
            };
            (ctx, op, operand)
        };
        self.set_ip(ctx.ip);

        let (a, b) = operand;
        match op {
            Op::Constant => {
                let v = self.module_literal(&ctx, a as usize)?;
                self.push(v);
            }
            Op::PushNull => self.push(Value::NULL),
            Op::PushTrue => self.push(Value::TRUE),
            Op::PushFalse => self.push(Value::FALSE),
            Op::PushZero => self.push(Value::num(0.0)),
            Op::PushOne => self.push(Value::num(1.0)),

            Op::PushLocal0 | Op::PushLocal1 | Op::PushLocal2 | Op::PushLocal3
            | Op::PushLocal4 | Op::PushLocal5 | Op::PushLocal6 | Op::PushLocal7
            | Op::PushLocal8 => {
                let index = op as u8 - Op::PushLocal0 as u8;
                let v = self.stack_at(ctx.bp + 1 + index as usize);
                self.push(v);
            }
            Op::PushLocalN => {
                let v = self.stack_at(ctx.bp + 1 + a as usize);
                self.push(v);
            }
            Op::StoreLocal0 | Op::StoreLocal1 | Op::StoreLocal2 | Op::StoreLocal3
            | Op::StoreLocal4 | Op::StoreLocal5 | Op::StoreLocal6 | Op::StoreLocal7
            | Op::StoreLocal8 => {
                let index = op as u8 - Op::StoreLocal0 as u8;
                let v = self.peek(0);
                self.stack_set(ctx.bp + 1 + index as usize, v);
            }
            Op::StoreLocalN => {
                let v = self.peek(0);
                self.stack_set(ctx.bp + 1 + a as usize, v);
            }

            Op::PushGlobal => {
                let module = self.ctx_module(&ctx)?;
                let v = self.heap.module(module).globals[a as usize];
                self.push(v);
            }
            Op::StoreGlobal => {
                let module = self.ctx_module(&ctx)?;
                let v = self.peek(0);
                self.heap.module_mut(module).globals[a as usize] = v;
            }

            Op::PushFn => {
                let module = self.ctx_module(&ctx)?;
                let f = self.heap.module(module).functions[a as usize];
                self.push(Value::object(f));
            }
            Op::PushClass => {
                let module = self.ctx_module(&ctx)?;
                let c = self.heap.module(module).classes[a as usize];
                self.push(Value::object(c));
            }
            Op::PushBuiltinFn => {
                let f = self.builtins[a as usize];
                self.push(Value::object(f));
            }

            Op::PushList => {
                let list = self.allocate(ObjKind::List(PkList {
                    elems: Vec::with_capacity((a as usize).max(object::MIN_CAPACITY)),
                }));
                self.push(Value::object(list));
            }
            Op::ListAppend => {
                let v = self.pop();
                let list = self.peek(0);
                self.heap.list_mut(list.as_object()).append(v);
            }
            Op::PushMap => {
                let map = self.allocate(ObjKind::Map(PkMap::new()));
                self.push(Value::object(map));
            }
            Op::MapInsert => {
                let value = self.pop();
                let key = self.pop();
                let map = self.peek(0);
                map_set(&mut self.heap, map.as_object(), key, value)?;
            }

            Op::PushInstance => {
                let module = self.ctx_module(&ctx)?;
                let class = self.heap.module(module).classes[a as usize];
                let inst = self.allocate(ObjKind::Instance(PkInstance::Script {
                    class,
                    fields: Vec::new(),
                }));
                self.push(Value::object(inst));
            }
            Op::InstAppend => {
                let v = self.pop();
                let inst = self.peek(0);
                match self.heap.instance_mut(inst.as_object()) {
                    PkInstance::Script { fields, .. } => fields.push(v),
                    PkInstance::Native { .. } => {
                        return Err("cannot append fields to a native instance".into())
                    }
                }
            }

            Op::Call => return self.op_call(a as usize, false),
            Op::TailCall => return self.op_call(a as usize, true),
            Op::MethodCall => return self.op_method_call(&ctx, a as usize, b as usize),
            Op::Swap => {
                let x = self.pop();
                let y = self.pop();
                self.push(x);
                self.push(y);
            }

            Op::Jump => self.set_ip(ctx.ip + a as usize),
            Op::JumpIf => {
                let c = self.pop();
                if c.is_truthy() {
                    self.set_ip(ctx.ip + a as usize);
                }
            }
            Op::JumpIfNot => {
                let c = self.pop();
                if c.is_falsy() {
                    self.set_ip(ctx.ip + a as usize);
                }
            }
            Op::Loop => self.set_ip(ctx.ip - a as usize),

            Op::Return => return self.do_return(stop),
            Op::End => return Err("corrupt bytecode: executed END".into()),

            Op::GetAttrib => {
                let name = self.module_name(&ctx, a as usize)?;
                let obj = self.pop();
                let v = self.attrib_get(obj, &name)?;
                self.push(v);
            }
            Op::GetAttribKeep => {
                let name = self.module_name(&ctx, a as usize)?;
                let obj = self.peek(0);
                let v = self.attrib_get(obj, &name)?;
                self.push(v);
            }
            Op::SetAttrib => {
                let name = self.module_name(&ctx, a as usize)?;
                let value = self.pop();
                let obj = self.pop();
                self.attrib_set(obj, &name, value)?;
                self.push(value);
            }
            Op::GetSubscript => {
                let key = self.pop();
                let obj = self.pop();
                let v = self.subscript_get(obj, key)?;
                self.push(v);
            }
            Op::GetSubscriptKeep => {
                let key = self.peek(0);
                let obj = self.peek(1);
                let v = self.subscript_get(obj, key)?;
                self.push(v);
            }
            Op::SetSubscript => {
                let value = self.pop();
                let key = self.pop();
                let obj = self.pop();
                self.subscript_set(obj, key, value)?;
                self.push(value);
            }

            Op::IterTest => {
                let seq = self.stack_at(ctx.bp + 1 + a as usize);
                self.check_iterable(seq)?;
            }
            Op::Iter => self.op_iter(&ctx, a as usize, b as usize)?,

            Op::Import => {
                let name = self.module_name(&ctx, a as usize)?;
                let module = self.ctx_module(&ctx)?;
                let from = self.heap.module(module).path.clone();
                let imported = module_loader::runtime_lookup(self, &from, &name)?;
                self.push(Value::object(imported));
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::BitAnd | Op::BitOr
            | Op::BitXor | Op::BitLshift | Op::BitRshift | Op::Eq | Op::NotEq | Op::Lt
            | Op::LtEq | Op::Gt | Op::GtEq | Op::MakeRange | Op::In | Op::Is => {
                let rhs = self.pop();
                let lhs = self.pop();
                let v = self.binary_op(op, lhs, rhs)?;
                self.push(v);
            }
            Op::Negative => {
                let v = self.pop();
                let out = if v.is_num() {
                    Value::num(-v.as_num())
                } else {
                    self.unary_method(v, "-self")?
                };
                self.push(out);
            }
            Op::Not => {
                let v = self.pop();
                self.push(Value::bool_val(v.is_falsy()));
            }
            Op::BitNot => {
                let v = self.pop();
                let out = if v.is_num() {
                    Value::num(!(v.as_num() as i64) as f64)
                } else {
                    self.unary_method(v, "~self")?
                };
                self.push(out);
            }

            Op::Pop => {
                self.pop();
            }
            Op::ReplPrint => {
                let v = self.pop();
                if !v.is_null() {
                    let text = to_display_string(&self.heap, v, true);
                    (self.config.write_fn)(&text);
                    (self.config.write_fn)("\n");
                }
            }
        }
        Ok(StepOut::Continue)
    }

    fn ctx_module(&self, ctx: &Ctx) -> Result<Ref, String> {
        ctx.module.ok_or_else(|| "builtin functions have no module scope".to_string())
    }

    fn module_literal(&self, ctx: &Ctx, index: usize) -> Result<Value, String> {
        let module = self.ctx_module(ctx)?;
        Ok(self.heap.module(module).literals[index])
    }

    fn module_name(&self, ctx: &Ctx, index: usize) -> Result<String, String> {
        let module = self.ctx_module(ctx)?;
        Ok(self.heap.module(module).names[index].clone())
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn op_call(&mut self, argc: usize, tail: bool) -> Result<StepOut, String> {
        let sp = self.stack_len();
        let callee_idx = sp - argc - 1;
        let callee = self.stack_at(callee_idx);
        if !callee.is_object() {
            return Err(format!("{} is not callable", type_name(&self.heap, callee)));
        }
        let r = callee.as_object();
        let func = match &self.heap.get(r).kind {
            ObjKind::Func(_) => r,
            ObjKind::Class(c) => c
                .ctor
                .ok_or_else(|| format!("class '{}' has no constructor", c.name))?,
            _ => {
                return Err(format!("{} is not callable", type_name(&self.heap, callee)));
            }
        };
        self.invoke(func, callee_idx, argc, tail)
    }

    /// Shared call path: `bp` indexes the callee/self slot; args sit above
    /// it. Bytecode pushes (or replaces, for tail calls) a frame; natives
    /// run to completion here.
    fn invoke(&mut self, func: Ref, bp: usize, argc: usize, tail: bool) -> Result<StepOut, String> {
        let arity = self.heap.func(func).arity;
        if arity >= 0 && argc != arity as usize {
            let name = self.heap.func(func).name.clone();
            return Err(format!(
                "function '{}' expected {} arguments, got {}",
                name, arity, argc
            ));
        }
        let is_native = matches!(self.heap.func(func).kind, FuncKind::Native { .. });
        if is_native {
            // A tail call to a native needs no frame surgery: the RETURN
            // following the rewritten CALL completes the frame, and a
            // suspended `yield` resumes right before that RETURN.
            let result = self.invoke_native(func, bp, argc)?;
            self.truncate_stack(bp + 1);
            self.stack_set(bp, result);
            if let Some(out) = self.process_fiber_action()? {
                return Ok(out);
            }
            return Ok(StepOut::Continue);
        }

        let chunk = match &self.heap.func(func).kind {
            FuncKind::Bytecode { chunk, .. } => Rc::clone(chunk),
            FuncKind::Native { .. } => unreachable!(),
        };
        let fiber = self.current_fiber();
        if tail {
            // Reuse the current frame: slide callee + args down to its base.
            let dst = self.heap.fiber(fiber).frames.last().expect("no frame for tail call").bp;
            let f = self.heap.fiber_mut(fiber);
            for i in 0..=argc {
                let v = f.stack[bp + i];
                f.stack[dst + i] = v;
            }
            f.stack.truncate(dst + argc + 1);
            let frame = f.frames.last_mut().unwrap();
            frame.func = func;
            frame.chunk = chunk;
            frame.ip = 0;
        } else {
            let f = self.heap.fiber_mut(fiber);
            if f.frames.len() >= MAX_CALL_DEPTH {
                return Err("maximum call depth exceeded".to_string());
            }
            f.frames.push(CallFrame { func, chunk, ip: 0, bp });
        }
        Ok(StepOut::Continue)
    }

    /// Run a native function over its slot window; returns the value it
    /// reported through `native_return` (null when it reported none).
    fn invoke_native(&mut self, func: Ref, bp: usize, argc: usize) -> Result<Value, String> {
        let native = match &self.heap.func(func).kind {
            FuncKind::Native { func } => *func,
            FuncKind::Bytecode { .. } => unreachable!(),
        };
        let saved_bp = self.native_bp;
        let saved_argc = self.native_argc;
        let saved_ret = self.native_ret;
        self.native_bp = bp;
        self.native_argc = argc;
        self.native_ret = Value::NULL;
        let result = native(self);
        let ret = self.native_ret;
        self.native_bp = saved_bp;
        self.native_argc = saved_argc;
        self.native_ret = saved_ret;
        result?;
        Ok(ret)
    }

    // -----------------------------------------------------------------------
    // Method calls — the receiver stays in the callee slot as `self`.
    // -----------------------------------------------------------------------

    fn op_method_call(&mut self, ctx: &Ctx, name_idx: usize, argc: usize) -> Result<StepOut, String> {
        let name = self.module_name(ctx, name_idx)?;
        let sp = self.stack_len();
        let obj_idx = sp - argc - 1;
        let obj = self.stack_at(obj_idx);

        if obj.is_object() {
            match &self.heap.get(obj.as_object()).kind {
                ObjKind::Instance(inst) => {
                    // Script fields holding functions win over class methods.
                    if let PkInstance::Script { class, fields } = inst {
                        let class = *class;
                        if let Some(i) = self.heap.class(class).field_index(&name) {
                            let field = fields[i];
                            if field.is_object()
                                && matches!(self.heap.get(field.as_object()).kind, ObjKind::Func(_))
                            {
                                return self.invoke(field.as_object(), obj_idx, argc, false);
                            }
                        }
                        if let Some(m) = resolve_method(&self.heap, class, &name) {
                            return self.invoke(m, obj_idx, argc, false);
                        }
                    } else if let PkInstance::Native { class, .. } = inst {
                        if let Some(m) = resolve_method(&self.heap, *class, &name) {
                            return self.invoke(m, obj_idx, argc, false);
                        }
                    }
                    return Err(format!(
                        "'{}' instance has no method '{}'",
                        self.heap.instance(obj.as_object()).type_name(&self.heap),
                        name
                    ));
                }
                ObjKind::Module(_) => {
                    let callee = self.attrib_get(obj, &name)?;
                    if callee.is_object() {
                        let r = callee.as_object();
                        match &self.heap.get(r).kind {
                            ObjKind::Func(_) => return self.invoke(r, obj_idx, argc, false),
                            ObjKind::Class(c) => {
                                let ctor = c.ctor.ok_or_else(|| {
                                    format!("class '{}' has no constructor", c.name)
                                })?;
                                // The class takes the callee slot, exactly
                                // as a direct constructor call would leave
                                // it.
                                self.stack_set(obj_idx, callee);
                                return self.invoke(ctor, obj_idx, argc, false);
                            }
                            _ => {}
                        }
                    }
                    return Err(format!("'{}' is not callable", name));
                }
                _ => {}
            }
        }

        // Built-in container methods run inline.
        if let Some(result) = self.builtin_method(obj, &name, obj_idx + 1, argc)? {
            self.truncate_stack(obj_idx);
            self.push(result);
            return Ok(StepOut::Continue);
        }
        Err(format!(
            "{} has no method '{}'",
            type_name(&self.heap, obj),
            name
        ))
    }

    /// Methods on the built-in container types. Returns Ok(None) when the
    /// name is unknown for the receiver.
    fn builtin_method(
        &mut self,
        obj: Value,
        name: &str,
        arg_base: usize,
        argc: usize,
    ) -> Result<Option<Value>, String> {
        if !obj.is_object() {
            return Ok(None);
        }
        let r = obj.as_object();
        let args: Vec<Value> = (0..argc).map(|i| self.stack_at(arg_base + i)).collect();
        macro_rules! check_argc {
            ($n:expr) => {
                if argc != $n {
                    return Err(format!(
                        "method '{}' expected {} arguments, got {}",
                        name, $n, argc
                    ));
                }
            };
        }

        match &self.heap.get(r).kind {
            ObjKind::List(_) => match name {
                "append" => {
                    check_argc!(1);
                    let v = args[0];
                    self.heap.list_mut(r).append(v);
                    Ok(Some(obj))
                }
                "insert" => {
                    check_argc!(2);
                    let index = self.index_arg(args[0], self.heap.list(r).len() + 1)?;
                    let v = args[1];
                    self.heap.list_mut(r).insert(index, v);
                    Ok(Some(Value::NULL))
                }
                "remove_at" => {
                    check_argc!(1);
                    let index = self.index_arg(args[0], self.heap.list(r).len())?;
                    Ok(Some(self.heap.list_mut(r).remove_at(index)))
                }
                "pop" => {
                    check_argc!(0);
                    let len = self.heap.list(r).len();
                    if len == 0 {
                        return Err("cannot pop from an empty list".into());
                    }
                    Ok(Some(self.heap.list_mut(r).remove_at(len - 1)))
                }
                "clear" => {
                    check_argc!(0);
                    self.heap.list_mut(r).elems.clear();
                    Ok(Some(Value::NULL))
                }
                "find" => {
                    check_argc!(1);
                    let needle = args[0];
                    let found = self
                        .heap
                        .list(r)
                        .elems
                        .iter()
                        .position(|&e| value_equals(&self.heap, e, needle));
                    Ok(Some(Value::num(found.map_or(-1.0, |i| i as f64))))
                }
                _ => Ok(None),
            },
            ObjKind::Map(_) => match name {
                "remove" => {
                    check_argc!(1);
                    let key = args[0];
                    Ok(Some(map_remove(&mut self.heap, r, key).unwrap_or(Value::NULL)))
                }
                "has" => {
                    check_argc!(1);
                    let key = args[0];
                    Ok(Some(Value::bool_val(map_get(&self.heap, r, key).is_some())))
                }
                "clear" => {
                    check_argc!(0);
                    let m = self.heap.map_mut(r);
                    m.entries.clear();
                    m.count = 0;
                    m.used = 0;
                    Ok(Some(Value::NULL))
                }
                _ => Ok(None),
            },
            ObjKind::Str(_) => match name {
                "find" => {
                    check_argc!(1);
                    let needle = self.string_arg(args[0], "find")?;
                    let found = self.heap.str_(r).data.find(&needle);
                    Ok(Some(Value::num(found.map_or(-1.0, |i| i as f64))))
                }
                "replace" => {
                    check_argc!(2);
                    let from = self.string_arg(args[0], "replace")?;
                    let to = self.string_arg(args[1], "replace")?;
                    let replaced = self.heap.str_(r).data.replace(&from, &to);
                    Ok(Some(self.new_string_value(&replaced)))
                }
                "split" => {
                    check_argc!(1);
                    let sep = self.string_arg(args[0], "split")?;
                    if sep.is_empty() {
                        return Err("cannot split on an empty separator".into());
                    }
                    let pieces: Vec<String> = self
                        .heap
                        .str_(r)
                        .data
                        .split(&sep)
                        .map(|s| s.to_string())
                        .collect();
                    // Pin each piece until the list owns them all.
                    let base = self.heap.temp_roots.len();
                    for piece in &pieces {
                        let pr = self.new_string(piece);
                        self.heap.temp_roots.push(pr);
                    }
                    let refs: Vec<Value> = self.heap.temp_roots[base..]
                        .iter()
                        .map(|&pr| Value::object(pr))
                        .collect();
                    let list = self.allocate(ObjKind::List(PkList::from_vec(refs)));
                    self.heap.temp_roots.truncate(base);
                    Ok(Some(Value::object(list)))
                }
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn index_arg(&self, v: Value, len: usize) -> Result<usize, String> {
        if !v.is_num() || v.as_num().fract() != 0.0 {
            return Err("index must be an integer".to_string());
        }
        let i = v.as_num();
        if i < 0.0 || i as usize >= len {
            return Err(format!("index {} out of range", object::to_display_string(&self.heap, v, false)));
        }
        Ok(i as usize)
    }

    fn string_arg(&self, v: Value, method: &str) -> Result<String, String> {
        if v.is_object() {
            if let ObjKind::Str(s) = &self.heap.get(v.as_object()).kind {
                return Ok(s.data.clone());
            }
        }
        Err(format!(
            "method '{}' expected a String, got {}",
            method,
            type_name(&self.heap, v)
        ))
    }

    // -----------------------------------------------------------------------
    // Returns & fiber transfer
    // -----------------------------------------------------------------------

    fn do_return(&mut self, stop: Option<(Ref, usize)>) -> Result<StepOut, String> {
        let ret = self.pop();
        let fiber = self.current_fiber();
        let frame = self.heap.fiber_mut(fiber).frames.pop().expect("return without frame");
        if self.heap.fiber(fiber).frames.is_empty() {
            // The fiber ran to completion.
            let caller = {
                let f = self.heap.fiber_mut(fiber);
                f.state = FiberState::Done;
                f.stack.clear();
                f.caller.take()
            };
            return Ok(self.transfer_to(caller, ret));
        }
        let f = self.heap.fiber_mut(fiber);
        f.stack[frame.bp] = ret;
        f.stack.truncate(frame.bp + 1);
        if let Some((stop_fiber, base)) = stop {
            if stop_fiber == fiber && self.heap.fiber(fiber).frames.len() == base {
                return Ok(StepOut::NestedReturn(ret));
            }
        }
        Ok(StepOut::Continue)
    }

    /// Hand control (and a value) to a caller fiber, or to the host when
    /// the chain is exhausted.
    fn transfer_to(&mut self, caller: Option<Ref>, value: Value) -> StepOut {
        match caller {
            Some(c) => {
                self.fiber = Some(c);
                let f = self.heap.fiber_mut(c);
                // The run/resume call slot receives the value.
                *f.stack.last_mut().expect("caller with empty stack") = value;
                StepOut::Continue
            }
            None => StepOut::HostReturn(value),
        }
    }

    /// Apply a fiber transfer a builtin requested. Every transition of the
    /// fiber state machine is enforced here.
    fn process_fiber_action(&mut self) -> Result<Option<StepOut>, String> {
        let action = match self.fiber_action.take() {
            Some(a) => a,
            None => return Ok(None),
        };
        if self.nest_depth > 0 {
            return Err("cannot switch fibers inside operator dispatch".to_string());
        }
        let current = self.current_fiber();
        match action {
            FiberAction::Run { fiber, args } => {
                self.start_fiber(fiber, Some(current), args)?;
                self.fiber = Some(fiber);
                Ok(Some(StepOut::Continue))
            }
            FiberAction::Resume { fiber, value } => {
                match self.heap.fiber(fiber).state {
                    FiberState::Yielded => {}
                    FiberState::Done | FiberState::Error => {
                        return Err("fiber finished".to_string())
                    }
                    FiberState::New => {
                        return Err("cannot resume a fiber that has not started".to_string())
                    }
                    FiberState::Running => {
                        return Err("fiber is already running".to_string())
                    }
                }
                let f = self.heap.fiber_mut(fiber);
                f.state = FiberState::Running;
                f.caller = Some(current);
                // The suspended yield-call slot receives the resume value.
                *f.stack.last_mut().expect("yielded fiber with empty stack") = value;
                self.fiber = Some(fiber);
                Ok(Some(StepOut::Continue))
            }
            FiberAction::Yield { value } => {
                let caller = {
                    let f = self.heap.fiber_mut(current);
                    f.state = FiberState::Yielded;
                    f.caller.take()
                };
                Ok(Some(self.transfer_to(caller, value)))
            }
        }
    }

    /// Synchronous nested call used by operator dispatch, attribute hooks
    /// and the embedding API. The receiver occupies the callee slot.
    pub(crate) fn call_sync(
        &mut self,
        func: Ref,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, String> {
        let fiber = self.current_fiber();
        let arity = self.heap.func(func).arity;
        if arity >= 0 && args.len() != arity as usize {
            let name = self.heap.func(func).name.clone();
            return Err(format!(
                "function '{}' expected {} arguments, got {}",
                name,
                arity,
                args.len()
            ));
        }
        let bp = self.stack_len();
        self.push(receiver);
        for &a in args {
            self.push(a);
        }
        match &self.heap.func(func).kind {
            FuncKind::Native { .. } => {
                let result = self.invoke_native(func, bp, args.len());
                if self.fiber_action.is_some() {
                    self.fiber_action = None;
                    return Err("cannot switch fibers inside operator dispatch".to_string());
                }
                self.truncate_stack(bp);
                result
            }
            FuncKind::Bytecode { chunk, .. } => {
                let chunk = Rc::clone(chunk);
                let base = self.heap.fiber(fiber).frames.len();
                self.heap
                    .fiber_mut(fiber)
                    .frames
                    .push(CallFrame { func, chunk, ip: 0, bp });
                self.nest_depth += 1;
                let result = self.interpret_loop(Some((fiber, base)));
                self.nest_depth -= 1;
                let value = result?;
                // do_return left the value at the receiver slot.
                self.truncate_stack(bp);
                Ok(value)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Iteration
    // -----------------------------------------------------------------------

    fn check_iterable(&self, seq: Value) -> Result<(), String> {
        if seq.is_object() {
            match self.heap.get(seq.as_object()).kind {
                ObjKind::List(_) | ObjKind::Map(_) | ObjKind::Range(_) | ObjKind::Str(_) => {
                    return Ok(())
                }
                _ => {}
            }
        }
        Err(format!("{} is not iterable", type_name(&self.heap, seq)))
    }

    fn op_iter(&mut self, ctx: &Ctx, base: usize, exit: usize) -> Result<(), String> {
        let seq_idx = ctx.bp + 1 + base;
        let iter_idx = seq_idx + 1;
        let var_idx = seq_idx + 2;
        let seq = self.stack_at(seq_idx);
        let iter = self.stack_at(iter_idx);
        if !seq.is_object() {
            return Err(format!("{} is not iterable", type_name(&self.heap, seq)));
        }
        let r = seq.as_object();

        enum Next {
            Done,
            Value { value: Value, next_iter: f64 },
            Char { text: String, next_iter: f64 },
        }

        let next = match &self.heap.get(r).kind {
            ObjKind::Range(range) => {
                let cur = if iter.is_null() { range.from } else { iter.as_num() };
                if cur < range.to {
                    Next::Value { value: Value::num(cur), next_iter: cur + 1.0 }
                } else {
                    Next::Done
                }
            }
            ObjKind::List(list) => {
                let idx = if iter.is_null() { 0 } else { iter.as_num() as usize };
                if idx < list.elems.len() {
                    Next::Value {
                        value: list.elems[idx],
                        next_iter: (idx + 1) as f64,
                    }
                } else {
                    Next::Done
                }
            }
            ObjKind::Map(map) => {
                let mut idx = if iter.is_null() { 0 } else { iter.as_num() as usize };
                let mut found = Next::Done;
                while idx < map.entries.len() {
                    let entry = map.entries[idx];
                    if !entry.is_empty() {
                        found = Next::Value { value: entry.key, next_iter: (idx + 1) as f64 };
                        break;
                    }
                    idx += 1;
                }
                found
            }
            ObjKind::Str(s) => {
                let idx = if iter.is_null() { 0 } else { iter.as_num() as usize };
                match s.data[idx.min(s.data.len())..].chars().next() {
                    Some(ch) => Next::Char {
                        text: ch.to_string(),
                        next_iter: (idx + ch.len_utf8()) as f64,
                    },
                    None => Next::Done,
                }
            }
            _ => return Err(format!("{} is not iterable", type_name(&self.heap, seq))),
        };

        match next {
            Next::Done => self.set_ip(ctx.ip + exit),
            Next::Value { value, next_iter } => {
                self.stack_set(iter_idx, Value::num(next_iter));
                self.stack_set(var_idx, value);
            }
            Next::Char { text, next_iter } => {
                let v = self.new_string_value(&text);
                self.stack_set(iter_idx, Value::num(next_iter));
                self.stack_set(var_idx, v);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------------

    fn binary_op(&mut self, op: Op, lhs: Value, rhs: Value) -> Result<Value, String> {
        match op {
            Op::Add => {
                if lhs.is_num() && rhs.is_num() {
                    return Ok(Value::num(lhs.as_num() + rhs.as_num()));
                }
                if let (Some(a), Some(b)) = (self.as_str_ref(lhs), self.as_str_ref(rhs)) {
                    let joined =
                        format!("{}{}", self.heap.str_(a).data, self.heap.str_(b).data);
                    return Ok(self.new_string_value(&joined));
                }
                if let (Some(a), Some(b)) = (self.as_list_ref(lhs), self.as_list_ref(rhs)) {
                    let mut elems = self.heap.list(a).elems.clone();
                    elems.extend(self.heap.list(b).elems.iter().copied());
                    let list = self.allocate(ObjKind::List(PkList::from_vec(elems)));
                    return Ok(Value::object(list));
                }
                self.binary_fallback(op, "+", lhs, rhs)
            }
            Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                if lhs.is_num() && rhs.is_num() {
                    let (a, b) = (lhs.as_num(), rhs.as_num());
                    let out = match op {
                        Op::Sub => a - b,
                        Op::Mul => a * b,
                        Op::Div => {
                            if b == 0.0 {
                                return Err("division by zero".to_string());
                            }
                            a / b
                        }
                        Op::Mod => {
                            if b == 0.0 {
                                return Err("modulo by zero".to_string());
                            }
                            a % b
                        }
                        _ => unreachable!(),
                    };
                    return Ok(Value::num(out));
                }
                let symbol = match op {
                    Op::Sub => "-",
                    Op::Mul => "*",
                    Op::Div => "/",
                    _ => "%",
                };
                self.binary_fallback(op, symbol, lhs, rhs)
            }
            Op::BitAnd | Op::BitOr | Op::BitXor | Op::BitLshift | Op::BitRshift => {
                let a = self.to_int(lhs, "bitwise operand")?;
                let b = self.to_int(rhs, "bitwise operand")?;
                let out = match op {
                    Op::BitAnd => a & b,
                    Op::BitOr => a | b,
                    Op::BitXor => a ^ b,
                    Op::BitLshift => a.wrapping_shl(b as u32 & 63),
                    Op::BitRshift => a.wrapping_shr(b as u32 & 63),
                    _ => unreachable!(),
                };
                Ok(Value::num(out as f64))
            }
            Op::Eq | Op::NotEq => {
                let eq = self.dispatch_equality(lhs, rhs)?;
                Ok(Value::bool_val(if op == Op::Eq { eq } else { !eq }))
            }
            Op::Lt | Op::LtEq | Op::Gt | Op::GtEq => {
                if lhs.is_num() && rhs.is_num() {
                    let (a, b) = (lhs.as_num(), rhs.as_num());
                    let out = match op {
                        Op::Lt => a < b,
                        Op::LtEq => a <= b,
                        Op::Gt => a > b,
                        _ => a >= b,
                    };
                    return Ok(Value::bool_val(out));
                }
                if let (Some(a), Some(b)) = (self.as_str_ref(lhs), self.as_str_ref(rhs)) {
                    let (x, y) = (&self.heap.str_(a).data, &self.heap.str_(b).data);
                    let out = match op {
                        Op::Lt => x < y,
                        Op::LtEq => x <= y,
                        Op::Gt => x > y,
                        _ => x >= y,
                    };
                    return Ok(Value::bool_val(out));
                }
                let symbol = match op {
                    Op::Lt => "<",
                    Op::LtEq => "<=",
                    Op::Gt => ">",
                    _ => ">=",
                };
                self.binary_fallback(op, symbol, lhs, rhs)
            }
            Op::MakeRange => {
                if !lhs.is_num() || !rhs.is_num() {
                    return Err(format!(
                        "range bounds must be numbers, got {} and {}",
                        type_name(&self.heap, lhs),
                        type_name(&self.heap, rhs)
                    ));
                }
                let range = self.allocate(ObjKind::Range(PkRange {
                    from: lhs.as_num(),
                    to: rhs.as_num(),
                }));
                Ok(Value::object(range))
            }
            Op::In => self.op_in(lhs, rhs),
            Op::Is => {
                if !rhs.is_object() {
                    return Err("right operand of 'is' must be a class".to_string());
                }
                let class = rhs.as_object();
                if !matches!(self.heap.get(class).kind, ObjKind::Class(_)) {
                    return Err("right operand of 'is' must be a class".to_string());
                }
                if lhs.is_object() {
                    if let ObjKind::Instance(inst) = &self.heap.get(lhs.as_object()).kind {
                        return Ok(Value::bool_val(is_instance_of(
                            &self.heap,
                            inst.class(),
                            class,
                        )));
                    }
                }
                Ok(Value::FALSE)
            }
            _ => unreachable!("not a binary opcode: {:?}", op),
        }
    }

    /// Equality with instance `==` dispatch; everything else is the deep
    /// value comparison.
    fn dispatch_equality(&mut self, lhs: Value, rhs: Value) -> Result<bool, String> {
        if let Some(method) = self.instance_operator(lhs, "==") {
            let out = self.call_sync(method, lhs, &[rhs])?;
            return Ok(out.is_truthy());
        }
        Ok(value_equals(&self.heap, lhs, rhs))
    }

    fn op_in(&mut self, lhs: Value, rhs: Value) -> Result<Value, String> {
        if rhs.is_object() {
            match &self.heap.get(rhs.as_object()).kind {
                ObjKind::List(list) => {
                    let found = list
                        .elems
                        .iter()
                        .any(|&e| value_equals(&self.heap, e, lhs));
                    return Ok(Value::bool_val(found));
                }
                ObjKind::Map(_) => {
                    return Ok(Value::bool_val(
                        map_get(&self.heap, rhs.as_object(), lhs).is_some(),
                    ))
                }
                ObjKind::Str(s) => {
                    if let Some(n) = self.as_str_ref(lhs) {
                        return Ok(Value::bool_val(s.data.contains(&self.heap.str_(n).data)));
                    }
                    return Err("left operand of 'in' must be a String".to_string());
                }
                ObjKind::Range(range) => {
                    if lhs.is_num() {
                        let v = lhs.as_num();
                        return Ok(Value::bool_val(v >= range.from && v < range.to));
                    }
                    return Ok(Value::FALSE);
                }
                _ => {}
            }
        }
        Err(format!(
            "{} does not support 'in'",
            type_name(&self.heap, rhs)
        ))
    }

    /// Instance operand: look the operator up as a class method, pass the
    /// other operand, use the return value.
    fn binary_fallback(
        &mut self,
        _op: Op,
        symbol: &str,
        lhs: Value,
        rhs: Value,
    ) -> Result<Value, String> {
        if let Some(method) = self.instance_operator(lhs, symbol) {
            return self.call_sync(method, lhs, &[rhs]);
        }
        Err(format!(
            "unsupported operand types for '{}': {} and {}",
            symbol,
            type_name(&self.heap, lhs),
            type_name(&self.heap, rhs)
        ))
    }

    fn unary_method(&mut self, v: Value, name: &str) -> Result<Value, String> {
        if let Some(method) = self.instance_operator(v, name) {
            return self.call_sync(method, v, &[]);
        }
        Err(format!(
            "unsupported operand type for '{}': {}",
            name.trim_end_matches("self"),
            type_name(&self.heap, v)
        ))
    }

    fn instance_operator(&self, v: Value, name: &str) -> Option<Ref> {
        if !v.is_object() {
            return None;
        }
        if let ObjKind::Instance(inst) = &self.heap.get(v.as_object()).kind {
            return resolve_method(&self.heap, inst.class(), name);
        }
        None
    }

    fn as_str_ref(&self, v: Value) -> Option<Ref> {
        if v.is_object() && matches!(self.heap.get(v.as_object()).kind, ObjKind::Str(_)) {
            Some(v.as_object())
        } else {
            None
        }
    }

    fn as_list_ref(&self, v: Value) -> Option<Ref> {
        if v.is_object() && matches!(self.heap.get(v.as_object()).kind, ObjKind::List(_)) {
            Some(v.as_object())
        } else {
            None
        }
    }

    fn to_int(&self, v: Value, what: &str) -> Result<i64, String> {
        if v.is_num() {
            Ok(v.as_num() as i64)
        } else {
            Err(format!(
                "{} must be a number, got {}",
                what,
                type_name(&self.heap, v)
            ))
        }
    }

    // -----------------------------------------------------------------------
    // Attributes & subscripts
    // -----------------------------------------------------------------------

    pub(crate) fn attrib_get(&mut self, obj: Value, name: &str) -> Result<Value, String> {
        if !obj.is_object() {
            return Err(format!(
                "{} has no attribute '{}'",
                type_name(&self.heap, obj),
                name
            ));
        }
        let r = obj.as_object();
        match &self.heap.get(r).kind {
            ObjKind::Str(s) => match name {
                "length" => Ok(Value::num(s.data.len() as f64)),
                "lower" => {
                    let lowered = s.data.to_lowercase();
                    Ok(self.new_string_value(&lowered))
                }
                "upper" => {
                    let raised = s.data.to_uppercase();
                    Ok(self.new_string_value(&raised))
                }
                "strip" => {
                    let stripped = s.data.trim().to_string();
                    Ok(self.new_string_value(&stripped))
                }
                _ => Err(format!("String has no attribute '{}'", name)),
            },
            ObjKind::List(l) => match name {
                "length" => Ok(Value::num(l.elems.len() as f64)),
                _ => Err(format!("List has no attribute '{}'", name)),
            },
            ObjKind::Map(m) => match name {
                "length" => Ok(Value::num(m.count as f64)),
                _ => Err(format!("Map has no attribute '{}'", name)),
            },
            ObjKind::Range(range) => match name {
                "first" => Ok(Value::num(range.from)),
                "last" => Ok(Value::num(range.to)),
                _ => Err(format!("Range has no attribute '{}'", name)),
            },
            ObjKind::Func(f) => match name {
                "arity" => Ok(Value::num(f.arity as f64)),
                "name" => {
                    let n = f.name.clone();
                    Ok(self.new_string_value(&n))
                }
                _ => Err(format!("Function has no attribute '{}'", name)),
            },
            ObjKind::Fiber(f) => match name {
                "is_done" => Ok(Value::bool_val(f.is_done())),
                "function" => Ok(Value::object(f.func)),
                _ => Err(format!("Fiber has no attribute '{}'", name)),
            },
            ObjKind::Module(m) => {
                if let Some(i) = m.global_index(name) {
                    return Ok(m.globals[i]);
                }
                for &f in m.functions.iter().rev() {
                    if self.heap.func(f).name == name {
                        return Ok(Value::object(f));
                    }
                }
                for &c in m.classes.iter().rev() {
                    if self.heap.class(c).name == name {
                        return Ok(Value::object(c));
                    }
                }
                Err(format!(
                    "module '{}' has no member '{}'",
                    m.import_name(),
                    name
                ))
            }
            ObjKind::Class(c) => match name {
                "name" => {
                    let n = c.name.clone();
                    Ok(self.new_string_value(&n))
                }
                _ => Err(format!("Class has no attribute '{}'", name)),
            },
            ObjKind::Instance(inst) => match inst {
                PkInstance::Script { class, fields } => {
                    let class = *class;
                    if let Some(i) = self.heap.class(class).field_index(name) {
                        return Ok(fields[i]);
                    }
                    Err(format!(
                        "'{}' instance has no attribute '{}'",
                        self.heap.class(class).name,
                        name
                    ))
                }
                PkInstance::Native { class, .. } => {
                    let class = *class;
                    if let Some(getter) = resolve_method(&self.heap, class, "@getter") {
                        // The receiver may already be off the stack; pin it
                        // across the key allocation.
                        self.heap.temp_roots.push(r);
                        let key = self.new_string_value(name);
                        let out = self.call_sync(getter, obj, &[key]);
                        self.heap.temp_roots.pop();
                        return out;
                    }
                    Err(format!(
                        "'{}' instance has no attribute '{}'",
                        self.heap.instance(r).type_name(&self.heap),
                        name
                    ))
                }
            },
        }
    }

    pub(crate) fn attrib_set(
        &mut self,
        obj: Value,
        name: &str,
        value: Value,
    ) -> Result<(), String> {
        if !obj.is_object() {
            return Err(format!(
                "cannot set attribute on {}",
                type_name(&self.heap, obj)
            ));
        }
        let r = obj.as_object();
        match &self.heap.get(r).kind {
            ObjKind::Instance(PkInstance::Script { class, .. }) => {
                let class = *class;
                // Fields are declared in the class body; writes to unknown
                // names are errors.
                match self.heap.class(class).field_index(name) {
                    Some(i) => {
                        if let PkInstance::Script { fields, .. } = self.heap.instance_mut(r) {
                            fields[i] = value;
                        }
                        Ok(())
                    }
                    None => Err(format!(
                        "'{}' instance has no attribute '{}'",
                        self.heap.class(class).name,
                        name
                    )),
                }
            }
            ObjKind::Instance(PkInstance::Native { class, .. }) => {
                let class = *class;
                match resolve_method(&self.heap, class, "@setter") {
                    Some(setter) => {
                        // Receiver and value may already be off the stack;
                        // pin both across the key allocation.
                        let roots_base = self.heap.temp_roots.len();
                        self.heap.temp_roots.push(r);
                        if value.is_object() {
                            self.heap.temp_roots.push(value.as_object());
                        }
                        let key = self.new_string_value(name);
                        let result = self.call_sync(setter, obj, &[key, value]);
                        self.heap.temp_roots.truncate(roots_base);
                        result?;
                        Ok(())
                    }
                    None => Err(format!(
                        "'{}' instance does not support attribute writes",
                        self.heap.instance(r).type_name(&self.heap)
                    )),
                }
            }
            ObjKind::Module(m) => match m.global_index(name) {
                Some(i) => {
                    self.heap.module_mut(r).globals[i] = value;
                    Ok(())
                }
                None => Err(format!(
                    "module '{}' has no member '{}'",
                    m.import_name(),
                    name
                )),
            },
            _ => Err(format!(
                "cannot set attribute on {}",
                self.heap.get(r).type_name()
            )),
        }
    }

    fn subscript_get(&mut self, obj: Value, key: Value) -> Result<Value, String> {
        if obj.is_object() {
            match &self.heap.get(obj.as_object()).kind {
                ObjKind::List(list) => {
                    let index = self.index_arg(key, list.elems.len())?;
                    return Ok(list.elems[index]);
                }
                ObjKind::Map(_) => {
                    return map_get(&self.heap, obj.as_object(), key).ok_or_else(|| {
                        format!(
                            "key not found: {}",
                            to_display_string(&self.heap, key, true)
                        )
                    })
                }
                ObjKind::Str(s) => {
                    if !key.is_num() || key.as_num().fract() != 0.0 {
                        return Err("string index must be an integer".to_string());
                    }
                    let idx = key.as_num();
                    if idx < 0.0 || idx as usize >= s.data.len() {
                        return Err(format!("index {} out of range", idx));
                    }
                    // Strings index by byte; an offset inside a multi-byte
                    // character is an error, never a panic.
                    let idx = idx as usize;
                    if !s.data.is_char_boundary(idx) {
                        return Err(format!(
                            "byte index {} is not a character boundary",
                            idx
                        ));
                    }
                    let ch = s.data[idx..].chars().next().expect("boundary checked");
                    let text = ch.to_string();
                    return Ok(self.new_string_value(&text));
                }
                _ => {}
            }
        }
        Err(format!(
            "{} is not subscriptable",
            type_name(&self.heap, obj)
        ))
    }

    fn subscript_set(&mut self, obj: Value, key: Value, value: Value) -> Result<(), String> {
        if obj.is_object() {
            match &self.heap.get(obj.as_object()).kind {
                ObjKind::List(list) => {
                    let index = self.index_arg(key, list.elems.len())?;
                    self.heap.list_mut(obj.as_object()).elems[index] = value;
                    return Ok(());
                }
                ObjKind::Map(_) => {
                    return map_set(&mut self.heap, obj.as_object(), key, value);
                }
                _ => {}
            }
        }
        Err(format!(
            "{} does not support subscript assignment",
            type_name(&self.heap, obj)
        ))
    }
}
