/// Precise, non-moving mark-and-sweep heap.
///
/// Objects live in a slot arena indexed by `Ref`; sweeping walks every slot,
/// which is the arena rendition of an intrusive all-objects list. Marking is
/// two-color with an explicit grey worklist — `mark_object` pushes, never
/// recurses, so arbitrarily deep object graphs cannot overflow the Rust
/// stack. The allocation counter is rebuilt from scratch while marking.
///
/// The heap itself never starts a collection: the VM owns the roots and
/// calls `collect_garbage` at allocation sites only, so the mutator never
/// observes a collection mid-operation.

use crate::core::object::{Func, Module, Obj, ObjKind, PkClass, PkList, PkMap, PkRange, PkStr};
use crate::core::oop::PkInstance;
use crate::core::value::{Ref, Value};
use crate::fiber::Fiber;

/// Collection floor: never schedule the next cycle below this many bytes.
const MIN_HEAP_SIZE: usize = 1024 * 1024;
/// Next-cycle threshold as a percentage of the live size after a sweep.
const HEAP_GROW_PERCENT: usize = 150;

#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub cycles: u64,
    pub last_freed_objects: usize,
    pub last_freed_bytes: usize,
    pub total_freed_objects: u64,
}

pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<Ref>,
    bytes_allocated: usize,
    next_gc: usize,
    grey: Vec<Ref>,
    /// Pins for composite constructions: anything here survives collection
    /// even before it becomes reachable from the real roots.
    pub temp_roots: Vec<Ref>,
    pub stats: GcStats,
    grow_percent: usize,
    min_heap_size: usize,
    debug: bool,
}

impl Heap {
    pub fn new(debug: bool) -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: MIN_HEAP_SIZE,
            grey: Vec::new(),
            temp_roots: Vec::new(),
            stats: GcStats::default(),
            grow_percent: HEAP_GROW_PERCENT,
            min_heap_size: MIN_HEAP_SIZE,
            debug,
        }
    }

    pub fn set_tuning(&mut self, grow_percent: usize, min_heap_size: usize) {
        self.grow_percent = grow_percent.max(100);
        self.min_heap_size = min_heap_size.max(1024);
        self.next_gc = self.next_gc.max(self.min_heap_size);
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    pub fn alloc(&mut self, kind: ObjKind) -> Ref {
        let obj = Obj::new(kind);
        self.bytes_allocated += obj.size_estimate();
        if let Some(r) = self.free.pop() {
            self.slots[r as usize] = Some(obj);
            r
        } else {
            self.slots.push(Some(obj));
            (self.slots.len() - 1) as Ref
        }
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    // -----------------------------------------------------------------------
    // Typed accessors — kind mismatch is an internal contract violation.
    // -----------------------------------------------------------------------

    pub fn get(&self, r: Ref) -> &Obj {
        self.slots[r as usize].as_ref().expect("dangling heap reference")
    }

    pub fn get_mut(&mut self, r: Ref) -> &mut Obj {
        self.slots[r as usize].as_mut().expect("dangling heap reference")
    }

    pub fn str_(&self, r: Ref) -> &PkStr {
        match &self.get(r).kind {
            ObjKind::Str(s) => s,
            other => panic!("expected String, found {:?}", other),
        }
    }

    pub fn list(&self, r: Ref) -> &PkList {
        match &self.get(r).kind {
            ObjKind::List(l) => l,
            other => panic!("expected List, found {:?}", other),
        }
    }

    pub fn list_mut(&mut self, r: Ref) -> &mut PkList {
        match &mut self.get_mut(r).kind {
            ObjKind::List(l) => l,
            other => panic!("expected List, found {:?}", other),
        }
    }

    pub fn map(&self, r: Ref) -> &PkMap {
        match &self.get(r).kind {
            ObjKind::Map(m) => m,
            other => panic!("expected Map, found {:?}", other),
        }
    }

    pub fn map_mut(&mut self, r: Ref) -> &mut PkMap {
        match &mut self.get_mut(r).kind {
            ObjKind::Map(m) => m,
            other => panic!("expected Map, found {:?}", other),
        }
    }

    pub fn range(&self, r: Ref) -> &PkRange {
        match &self.get(r).kind {
            ObjKind::Range(rg) => rg,
            other => panic!("expected Range, found {:?}", other),
        }
    }

    pub fn module(&self, r: Ref) -> &Module {
        match &self.get(r).kind {
            ObjKind::Module(m) => m,
            other => panic!("expected Module, found {:?}", other),
        }
    }

    pub fn module_mut(&mut self, r: Ref) -> &mut Module {
        match &mut self.get_mut(r).kind {
            ObjKind::Module(m) => m,
            other => panic!("expected Module, found {:?}", other),
        }
    }

    pub fn func(&self, r: Ref) -> &Func {
        match &self.get(r).kind {
            ObjKind::Func(f) => f,
            other => panic!("expected Function, found {:?}", other),
        }
    }

    pub fn class(&self, r: Ref) -> &PkClass {
        match &self.get(r).kind {
            ObjKind::Class(c) => c,
            other => panic!("expected Class, found {:?}", other),
        }
    }

    pub fn class_mut(&mut self, r: Ref) -> &mut PkClass {
        match &mut self.get_mut(r).kind {
            ObjKind::Class(c) => c,
            other => panic!("expected Class, found {:?}", other),
        }
    }

    pub fn instance(&self, r: Ref) -> &PkInstance {
        match &self.get(r).kind {
            ObjKind::Instance(i) => i,
            other => panic!("expected Instance, found {:?}", other),
        }
    }

    pub fn instance_mut(&mut self, r: Ref) -> &mut PkInstance {
        match &mut self.get_mut(r).kind {
            ObjKind::Instance(i) => i,
            other => panic!("expected Instance, found {:?}", other),
        }
    }

    pub fn fiber(&self, r: Ref) -> &Fiber {
        match &self.get(r).kind {
            ObjKind::Fiber(f) => f,
            other => panic!("expected Fiber, found {:?}", other),
        }
    }

    pub fn fiber_mut(&mut self, r: Ref) -> &mut Fiber {
        match &mut self.get_mut(r).kind {
            ObjKind::Fiber(f) => f,
            other => panic!("expected Fiber, found {:?}", other),
        }
    }

    pub fn is_kind_fiber(&self, r: Ref) -> bool {
        matches!(self.get(r).kind, ObjKind::Fiber(_))
    }

    // -----------------------------------------------------------------------
    // Mark phase
    // -----------------------------------------------------------------------

    /// Reset mark state; the caller marks roots next.
    pub fn begin_mark(&mut self) {
        self.grey.clear();
        self.bytes_allocated = 0;
    }

    pub fn mark_value(&mut self, v: Value) {
        if v.is_object() {
            self.mark_object(v.as_object());
        }
    }

    /// Push onto the grey worklist; never recurses.
    pub fn mark_object(&mut self, r: Ref) {
        let obj = match self.slots[r as usize].as_mut() {
            Some(o) => o,
            None => return,
        };
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.bytes_allocated += obj.size_estimate();
        self.grey.push(r);
    }

    /// Drain the worklist, marking every referent of every grey object.
    pub fn process_grey(&mut self) {
        // Temp roots may gain entries between begin_mark and here; they are
        // marked by the caller. This only drains.
        while let Some(r) = self.grey.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: Ref) {
        // Collect children first so the slot borrow ends before marking.
        let mut children: Vec<Value> = Vec::new();
        let mut child_refs: Vec<Ref> = Vec::new();
        match &self.get(r).kind {
            ObjKind::Str(_) | ObjKind::Range(_) => {}
            ObjKind::List(l) => children.extend(l.elems.iter().copied()),
            ObjKind::Map(m) => {
                for e in &m.entries {
                    if !e.is_empty() {
                        children.push(e.key);
                        children.push(e.value);
                    }
                }
            }
            ObjKind::Module(m) => {
                children.extend(m.globals.iter().copied());
                children.extend(m.literals.iter().copied());
                child_refs.extend(m.functions.iter().copied());
                child_refs.extend(m.classes.iter().copied());
                child_refs.extend(m.body.iter().copied());
            }
            ObjKind::Func(f) => {
                child_refs.extend(f.owner.iter().copied());
            }
            ObjKind::Class(c) => {
                child_refs.extend(c.owner.iter().copied());
                child_refs.extend(c.base.iter().copied());
                child_refs.extend(c.ctor.iter().copied());
                child_refs.extend(c.methods.values().copied());
            }
            ObjKind::Instance(inst) => {
                child_refs.push(inst.class());
                if let PkInstance::Script { fields, .. } = inst {
                    children.extend(fields.iter().copied());
                }
            }
            ObjKind::Fiber(f) => {
                child_refs.push(f.func);
                children.extend(f.stack.iter().copied());
                child_refs.extend(f.frames.iter().map(|fr| fr.func));
                child_refs.extend(f.caller.iter().copied());
            }
        }
        for v in children {
            self.mark_value(v);
        }
        for c in child_refs {
            self.mark_object(c);
        }
    }

    pub fn mark_temp_roots(&mut self) {
        let roots = self.temp_roots.clone();
        for r in roots {
            self.mark_object(r);
        }
    }

    // -----------------------------------------------------------------------
    // Sweep phase
    // -----------------------------------------------------------------------

    /// Free every unmarked object (running native-instance drops), clear the
    /// marks of the survivors and schedule the next cycle.
    pub fn sweep(&mut self) {
        let mut freed = 0usize;
        let mut freed_bytes = 0usize;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(obj) if obj.marked => obj.marked = false,
                Some(obj) => {
                    freed += 1;
                    freed_bytes += obj.size_estimate();
                    *slot = None;
                    self.free.push(i as Ref);
                }
                None => {}
            }
        }
        self.stats.cycles += 1;
        self.stats.last_freed_objects = freed;
        self.stats.last_freed_bytes = freed_bytes;
        self.stats.total_freed_objects += freed as u64;
        self.next_gc =
            (self.bytes_allocated * self.grow_percent / 100).max(self.min_heap_size);
        if self.debug {
            eprintln!(
                "[gc] cycle {}: freed {} objects ({} bytes), {} bytes live, next at {}",
                self.stats.cycles, freed, freed_bytes, self.bytes_allocated, self.next_gc
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::{PkList, PkStr};

    #[test]
    fn alloc_reuses_freed_slots() {
        let mut heap = Heap::new(false);
        let a = heap.alloc(ObjKind::Str(PkStr::new("a".into())));
        let _b = heap.alloc(ObjKind::Str(PkStr::new("b".into())));
        // Nothing marked: everything is garbage.
        heap.begin_mark();
        heap.process_grey();
        heap.sweep();
        assert_eq!(heap.live_objects(), 0);
        let c = heap.alloc(ObjKind::Str(PkStr::new("c".into())));
        // Slot recycled from the free list.
        assert!(c == a || c == 1);
    }

    #[test]
    fn reachable_objects_survive() {
        let mut heap = Heap::new(false);
        let s = heap.alloc(ObjKind::Str(PkStr::new("kept".into())));
        let list = heap.alloc(ObjKind::List(PkList::new()));
        heap.list_mut(list).append(Value::object(s));
        let _garbage = heap.alloc(ObjKind::Str(PkStr::new("dropped".into())));

        heap.begin_mark();
        heap.mark_object(list);
        heap.process_grey();
        heap.sweep();

        assert_eq!(heap.live_objects(), 2);
        assert_eq!(heap.str_(s).data, "kept");
    }

    #[test]
    fn temp_roots_pin_unreachable_objects() {
        let mut heap = Heap::new(false);
        let s = heap.alloc(ObjKind::Str(PkStr::new("pinned".into())));
        heap.temp_roots.push(s);
        heap.begin_mark();
        heap.mark_temp_roots();
        heap.process_grey();
        heap.sweep();
        assert_eq!(heap.str_(s).data, "pinned");
        heap.temp_roots.pop();
    }

    #[test]
    fn cyclic_graphs_collect_without_recursion() {
        let mut heap = Heap::new(false);
        let a = heap.alloc(ObjKind::List(PkList::new()));
        let b = heap.alloc(ObjKind::List(PkList::new()));
        heap.list_mut(a).append(Value::object(b));
        heap.list_mut(b).append(Value::object(a));
        heap.begin_mark();
        heap.process_grey();
        heap.sweep();
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn allocation_counter_rebuilds_each_cycle() {
        let mut heap = Heap::new(false);
        let kept = heap.alloc(ObjKind::Str(PkStr::new("x".repeat(100))));
        for _ in 0..10 {
            heap.alloc(ObjKind::Str(PkStr::new("y".repeat(100))));
        }
        let before = heap.bytes_allocated();
        heap.begin_mark();
        heap.mark_object(kept);
        heap.process_grey();
        heap.sweep();
        assert!(heap.bytes_allocated() < before);
        assert!(heap.bytes_allocated() > 0);
    }
}
