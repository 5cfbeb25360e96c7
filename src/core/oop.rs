/// Classes and instances.
///
/// Script classes carry a declared field list and a compiler-synthesised
/// constructor; their instances store fields positionally
/// (`fields.len == field_names.len`, always). Native classes are registered
/// by the host with a factory and named methods; their instances wrap an
/// opaque payload whose `Drop` runs when the collector sweeps them.

use std::any::Any;
use std::collections::HashMap;

use crate::core::value::{Ref, Value};
use crate::gc::Heap;

#[derive(Debug)]
pub struct PkClass {
    pub name: String,
    /// Owning module.
    pub owner: Option<Ref>,
    /// Base class for method resolution.
    pub base: Option<Ref>,
    pub field_names: Vec<String>,
    /// Synthesised constructor (script classes) or host factory wrapper.
    pub ctor: Option<Ref>,
    /// Named methods: operators (`+`, `==`, …), `@getter`/`@setter` and
    /// ordinary names. Script classes leave this empty; the embedding API
    /// fills it for native classes.
    pub methods: HashMap<String, Ref>,
    /// Distinguishes native-instance payloads at the host boundary.
    pub type_id: u32,
}

impl PkClass {
    pub fn new(name: String, owner: Option<Ref>) -> Self {
        PkClass {
            name,
            owner,
            base: None,
            field_names: Vec::new(),
            ctor: None,
            methods: HashMap::new(),
            type_id: 0,
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|f| f == name)
    }
}

/// Walk the base-class chain for a method. Subclass definitions shadow the
/// base; the walk is performed fresh on every lookup.
pub fn resolve_method(heap: &Heap, class: Ref, name: &str) -> Option<Ref> {
    let mut current = Some(class);
    while let Some(c) = current {
        let cls = heap.class(c);
        if let Some(&m) = cls.methods.get(name) {
            return Some(m);
        }
        current = cls.base;
    }
    None
}

/// `value is Class` — instance-of test walking the base chain.
pub fn is_instance_of(heap: &Heap, instance_class: Ref, class: Ref) -> bool {
    let mut current = Some(instance_class);
    while let Some(c) = current {
        if c == class {
            return true;
        }
        current = heap.class(c).base;
    }
    false
}

pub enum PkInstance {
    Script {
        class: Ref,
        fields: Vec<Value>,
    },
    Native {
        class: Ref,
        type_id: u32,
        name: String,
        /// Host payload; dropped by the GC sweep.
        user_data: Box<dyn Any>,
    },
}

impl PkInstance {
    pub fn class(&self) -> Ref {
        match self {
            PkInstance::Script { class, .. } => *class,
            PkInstance::Native { class, .. } => *class,
        }
    }

    pub fn type_name(&self, heap: &Heap) -> String {
        match self {
            PkInstance::Script { class, .. } => heap.class(*class).name.clone(),
            PkInstance::Native { name, .. } => name.clone(),
        }
    }

    pub fn size_estimate(&self) -> usize {
        match self {
            PkInstance::Script { fields, .. } => {
                fields.capacity() * std::mem::size_of::<Value>()
            }
            PkInstance::Native { name, .. } => name.len() + 16,
        }
    }
}

impl std::fmt::Debug for PkInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PkInstance::Script { class, fields } => f
                .debug_struct("Script")
                .field("class", class)
                .field("fields", &fields.len())
                .finish(),
            PkInstance::Native { name, type_id, .. } => f
                .debug_struct("Native")
                .field("name", name)
                .field("type_id", type_id)
                .finish(),
        }
    }
}
