/// Embedding API: slots, handles, native modules and native classes.
///
/// During a native call the host sees a window of the fiber stack: slot 0
/// is the callee/`self` slot (and the return slot), slots 1..=argc hold the
/// arguments. Handles pin values against collection until released — they
/// are scanned as GC roots. Native classes register a constructor and named
/// methods (`@getter`/`@setter`, operator names, ordinary names); their
/// instances wrap a host payload dropped at sweep time.

use std::any::Any;

use crate::core::object::{Func, FuncKind, Module, NativeFn, ObjKind};
use crate::core::oop::{resolve_method, PkClass, PkInstance};
use crate::core::value::{Ref, Value};
use crate::vm::PKVM;

/// A host-owned pin keeping a value alive across calls. Release it
/// explicitly; the VM scans live handles as roots.
#[derive(Debug)]
pub struct Handle {
    index: usize,
}

impl PKVM {
    // -----------------------------------------------------------------------
    // Handles
    // -----------------------------------------------------------------------

    pub fn make_handle(&mut self, v: Value) -> Handle {
        if let Some(index) = self.handles.iter().position(|h| h.is_none()) {
            self.handles[index] = Some(v);
            return Handle { index };
        }
        self.handles.push(Some(v));
        Handle { index: self.handles.len() - 1 }
    }

    pub fn release_handle(&mut self, handle: Handle) {
        self.handles[handle.index] = None;
    }

    pub fn handle_value(&self, handle: &Handle) -> Value {
        self.handles[handle.index].expect("released handle")
    }

    // -----------------------------------------------------------------------
    // Slots
    // -----------------------------------------------------------------------

    /// Slots visible to the native call in flight (arguments plus the
    /// return slot).
    pub fn slot_count(&self) -> usize {
        self.native_argc + 1
    }

    /// Grow the slot window to at least `n` slots.
    pub fn reserve_slots(&mut self, n: usize) {
        let fiber = self.current_fiber();
        let needed = self.native_bp + n;
        let stack = &mut self.heap.fiber_mut(fiber).stack;
        while stack.len() < needed {
            stack.push(Value::NULL);
        }
    }

    pub fn get_slot(&self, slot: usize) -> Value {
        let fiber = self.current_fiber();
        self.heap.fiber(fiber).stack[self.native_bp + slot]
    }

    pub fn set_slot(&mut self, slot: usize, v: Value) {
        let fiber = self.current_fiber();
        let index = self.native_bp + slot;
        self.heap.fiber_mut(fiber).stack[index] = v;
        if slot == 0 {
            self.native_return(v);
        }
    }

    pub fn set_slot_null(&mut self, slot: usize) {
        self.set_slot(slot, Value::NULL);
    }

    pub fn set_slot_bool(&mut self, slot: usize, b: bool) {
        self.set_slot(slot, Value::bool_val(b));
    }

    pub fn set_slot_number(&mut self, slot: usize, n: f64) {
        self.set_slot(slot, Value::num(n));
    }

    pub fn set_slot_string(&mut self, slot: usize, s: &str) {
        let v = self.new_string_value(s);
        self.set_slot(slot, v);
    }

    pub fn set_slot_handle(&mut self, slot: usize, handle: &Handle) {
        let v = self.handle_value(handle);
        self.set_slot(slot, v);
    }

    /// Type-checked getters; a failed validation is the error the executor
    /// raises on return.
    pub fn get_slot_number(&self, slot: usize) -> Result<f64, String> {
        let v = self.get_slot(slot);
        if v.is_num() {
            Ok(v.as_num())
        } else {
            Err(format!(
                "slot {} expected a Number, got {}",
                slot,
                crate::core::object::type_name(&self.heap, v)
            ))
        }
    }

    pub fn get_slot_bool(&self, slot: usize) -> Result<bool, String> {
        let v = self.get_slot(slot);
        if v.is_bool() {
            Ok(v.as_bool())
        } else {
            Err(format!(
                "slot {} expected a Bool, got {}",
                slot,
                crate::core::object::type_name(&self.heap, v)
            ))
        }
    }

    pub fn get_slot_string(&self, slot: usize) -> Result<String, String> {
        let v = self.get_slot(slot);
        if v.is_object() {
            if let ObjKind::Str(s) = &self.heap.get(v.as_object()).kind {
                return Ok(s.data.clone());
            }
        }
        Err(format!(
            "slot {} expected a String, got {}",
            slot,
            crate::core::object::type_name(&self.heap, v)
        ))
    }

    /// Borrow the payload of a native instance in a slot.
    pub fn get_slot_native_instance<T: 'static>(&self, slot: usize) -> Result<&T, String> {
        let v = self.get_slot(slot);
        if v.is_object() {
            if let ObjKind::Instance(PkInstance::Native { user_data, .. }) =
                &self.heap.get(v.as_object()).kind
            {
                return user_data
                    .downcast_ref::<T>()
                    .ok_or_else(|| format!("slot {} holds a different native type", slot));
            }
        }
        Err(format!("slot {} is not a native instance", slot))
    }

    pub fn get_slot_native_instance_mut<T: 'static>(
        &mut self,
        slot: usize,
    ) -> Result<&mut T, String> {
        let v = self.get_slot(slot);
        if v.is_object() {
            if let ObjKind::Instance(PkInstance::Native { user_data, .. }) =
                &mut self.heap.get_mut(v.as_object()).kind
            {
                return user_data
                    .downcast_mut::<T>()
                    .ok_or_else(|| format!("slot {} holds a different native type", slot));
            }
        }
        Err(format!("slot {} is not a native instance", slot))
    }

    // -----------------------------------------------------------------------
    // Slot-level operations
    // -----------------------------------------------------------------------

    pub fn get_attrib_slot(
        &mut self,
        obj_slot: usize,
        name: &str,
        dst_slot: usize,
    ) -> Result<(), String> {
        let obj = self.get_slot(obj_slot);
        let v = self.attrib_get(obj, name)?;
        self.set_slot(dst_slot, v);
        Ok(())
    }

    pub fn set_attrib_slot(
        &mut self,
        obj_slot: usize,
        name: &str,
        value_slot: usize,
    ) -> Result<(), String> {
        let obj = self.get_slot(obj_slot);
        let value = self.get_slot(value_slot);
        self.attrib_set(obj, name, value)
    }

    /// Call the function in `fn_slot` with `argc` arguments starting at
    /// `argv_slot`; the result lands in `dst_slot`.
    pub fn call_function(
        &mut self,
        fn_slot: usize,
        argv_slot: usize,
        argc: usize,
        dst_slot: usize,
    ) -> Result<(), String> {
        let callee = self.get_slot(fn_slot);
        let args: Vec<Value> = (0..argc).map(|i| self.get_slot(argv_slot + i)).collect();
        let result = self.call_value(callee, &args)?;
        self.set_slot(dst_slot, result);
        Ok(())
    }

    /// Call a named method on the object in `obj_slot`.
    pub fn call_method(
        &mut self,
        obj_slot: usize,
        name: &str,
        argv_slot: usize,
        argc: usize,
        dst_slot: usize,
    ) -> Result<(), String> {
        let obj = self.get_slot(obj_slot);
        let args: Vec<Value> = (0..argc).map(|i| self.get_slot(argv_slot + i)).collect();
        if obj.is_object() {
            if let ObjKind::Instance(inst) = &self.heap.get(obj.as_object()).kind {
                let class = inst.class();
                if let Some(method) = resolve_method(&self.heap, class, name) {
                    let result = self.call_sync(method, obj, &args)?;
                    self.set_slot(dst_slot, result);
                    return Ok(());
                }
            }
        }
        Err(format!(
            "{} has no method '{}'",
            crate::core::object::type_name(&self.heap, obj),
            name
        ))
    }

    /// Construct an instance of the class in `class_slot`.
    pub fn new_instance(
        &mut self,
        class_slot: usize,
        argv_slot: usize,
        argc: usize,
        dst_slot: usize,
    ) -> Result<(), String> {
        let class = self.get_slot(class_slot);
        let args: Vec<Value> = (0..argc).map(|i| self.get_slot(argv_slot + i)).collect();
        let result = self.call_value(class, &args)?;
        self.set_slot(dst_slot, result);
        Ok(())
    }

    pub fn import_module_slot(&mut self, name: &str, dst_slot: usize) -> Result<(), String> {
        let module = crate::module_loader::import_module(self, "", name)?;
        self.set_slot(dst_slot, Value::object(module));
        Ok(())
    }

    /// Synchronous call of any callable value (function or class).
    pub(crate) fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, String> {
        if !callee.is_object() {
            return Err(format!(
                "{} is not callable",
                crate::core::object::type_name(&self.heap, callee)
            ));
        }
        let r = callee.as_object();
        let func = match &self.heap.get(r).kind {
            ObjKind::Func(_) => r,
            ObjKind::Class(c) => c
                .ctor
                .ok_or_else(|| format!("class '{}' has no constructor", c.name))?,
            _ => {
                return Err(format!(
                    "{} is not callable",
                    crate::core::object::type_name(&self.heap, callee)
                ))
            }
        };
        // The callee value itself occupies the self/return slot.
        self.call_sync(func, callee, args)
    }

    // -----------------------------------------------------------------------
    // Native modules & classes
    // -----------------------------------------------------------------------

    /// Create a module registered as a core library (importable by name).
    pub fn new_core_module(&mut self, name: &str) -> Ref {
        let mut module = Module::new(format!("@core/{}", name));
        module.name = Some(name.to_string());
        module.initialized = true;
        let r = self.allocate(ObjKind::Module(module));
        self.core_libs.insert(name.to_string(), r);
        r
    }

    pub fn module_add_global(&mut self, module: Ref, name: &str, v: Value) {
        let m = self.heap.module_mut(module);
        let index = m.add_global(name);
        m.globals[index] = v;
    }

    pub fn module_add_fn(&mut self, module: Ref, name: &str, arity: i32, func: NativeFn) -> Ref {
        let f = self.allocate(ObjKind::Func(Func {
            name: name.to_string(),
            owner: Some(module),
            arity,
            docstring: None,
            kind: FuncKind::Native { func },
        }));
        self.heap.module_mut(module).functions.push(f);
        f
    }

    /// Register a native class. Bind a constructor with `class_bind_ctor`
    /// and methods with `class_add_method`.
    pub fn register_class(&mut self, module: Ref, name: &str, base: Option<Ref>) -> Ref {
        let mut class = PkClass::new(name.to_string(), Some(module));
        class.base = base;
        class.type_id = self.next_type_id;
        self.next_type_id += 1;
        let r = self.allocate(ObjKind::Class(class));
        self.heap.module_mut(module).classes.push(r);
        r
    }

    /// The constructor native typically builds its payload and finishes
    /// with `new_native_instance` + `native_return`.
    pub fn class_bind_ctor(&mut self, class: Ref, arity: i32, func: NativeFn) {
        let name = self.heap.class(class).name.clone();
        let owner = self.heap.class(class).owner;
        let f = self.allocate(ObjKind::Func(Func {
            name,
            owner,
            arity,
            docstring: None,
            kind: FuncKind::Native { func },
        }));
        self.heap.class_mut(class).ctor = Some(f);
    }

    /// Methods receive the instance in slot 0 and arguments from slot 1.
    /// Fixed names `@getter` (self, name) and `@setter` (self, name, value)
    /// hook attribute access; operator names (`+`, `==`, `-self`, …) hook
    /// operator dispatch.
    pub fn class_add_method(&mut self, class: Ref, name: &str, arity: i32, func: NativeFn) {
        let owner = self.heap.class(class).owner;
        let f = self.allocate(ObjKind::Func(Func {
            name: name.to_string(),
            owner,
            arity,
            docstring: None,
            kind: FuncKind::Native { func },
        }));
        self.heap.class_mut(class).methods.insert(name.to_string(), f);
    }

    /// Wrap a host payload in an instance of a registered native class.
    pub fn new_native_instance(&mut self, class: Ref, user_data: Box<dyn Any>) -> Value {
        let (type_id, name) = {
            let c = self.heap.class(class);
            (c.type_id, c.name.clone())
        };
        let inst = self.allocate(ObjKind::Instance(PkInstance::Native {
            class,
            type_id,
            name,
            user_data,
        }));
        Value::object(inst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::PkConfiguration;
    use crate::errors::PkResult;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Vec2 {
        x: f64,
        y: f64,
    }

    fn vec2_ctor(vm: &mut PKVM) -> Result<(), String> {
        let x = vm.get_slot_number(1)?;
        let y = vm.get_slot_number(2)?;
        let class = vm.get_slot(0);
        let class = class.as_object();
        let inst = vm.new_native_instance(class, Box::new(Vec2 { x, y }));
        vm.native_return(inst);
        Ok(())
    }

    fn vec2_getter(vm: &mut PKVM) -> Result<(), String> {
        let name = vm.get_slot_string(1)?;
        let v: &Vec2 = vm.get_slot_native_instance(0)?;
        match name.as_str() {
            "x" => {
                let x = v.x;
                vm.native_return(Value::num(x));
                Ok(())
            }
            "y" => {
                let y = v.y;
                vm.native_return(Value::num(y));
                Ok(())
            }
            _ => Err(format!("Vec2 has no attribute '{}'", name)),
        }
    }

    fn vec2_setter(vm: &mut PKVM) -> Result<(), String> {
        let name = vm.get_slot_string(1)?;
        let value = vm.get_slot_number(2)?;
        let v: &mut Vec2 = vm.get_slot_native_instance_mut(0)?;
        match name.as_str() {
            "x" => v.x = value,
            "y" => v.y = value,
            _ => return Err(format!("Vec2 has no attribute '{}'", name)),
        }
        Ok(())
    }

    fn capture() -> (PkConfiguration, Rc<RefCell<String>>) {
        let buffer = Rc::new(RefCell::new(String::new()));
        let sink = Rc::clone(&buffer);
        let mut conf = PkConfiguration::default();
        conf.write_fn = Box::new(move |text| sink.borrow_mut().push_str(text));
        (conf, buffer)
    }

    fn vm_with_vec2() -> (PKVM, Rc<RefCell<String>>) {
        let (conf, buffer) = capture();
        let mut vm = PKVM::new(conf);
        let module = vm.new_core_module("geometry");
        let class = vm.register_class(module, "Vec2", None);
        vm.class_bind_ctor(class, 2, vec2_ctor);
        vm.class_add_method(class, "@getter", 1, vec2_getter);
        vm.class_add_method(class, "@setter", 2, vec2_setter);
        (vm, buffer)
    }

    #[test]
    fn native_class_round_trip() {
        let (mut vm, buffer) = vm_with_vec2();
        let result = vm.interpret(
            "test.pk",
            "import geometry\n\
             v = geometry.Vec2(3, 4)\n\
             print(v.x * v.x + v.y * v.y)\n\
             v.x = 6\n\
             print(v.x)\n",
        );
        assert_eq!(result, PkResult::Success);
        assert_eq!(buffer.borrow().as_str(), "25\n6\n");
    }

    #[test]
    fn handles_survive_release_cycles() {
        let (mut vm, _buffer) = vm_with_vec2();
        let s = vm.new_string_value("keep me");
        let h1 = vm.make_handle(s);
        let h2 = vm.make_handle(Value::num(1.0));
        vm.release_handle(h1);
        // Freed slot is reused.
        let h3 = vm.make_handle(Value::TRUE);
        assert_eq!(vm.handle_value(&h3), Value::TRUE);
        vm.release_handle(h2);
        vm.release_handle(h3);
    }
}
