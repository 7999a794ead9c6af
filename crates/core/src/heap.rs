//! The object heap: allocation, string interning, and the tri-color
//! mark-sweep collector (spec §4.5).
//!
//! `Heap` owns the intrusive singly-linked list of every live heap object.
//! Objects are allocated with `Box::into_raw` and only ever freed by the
//! sweep phase, matching the source's single `reallocate` choke point.

use std::mem::size_of;
use std::ptr::NonNull;

use crate::object::{GcBox, ObjData, ObjRef};
use crate::table::Table;
use crate::value::Value;

/// `next_gc` grows by this factor after each collection (spec §4.5).
pub const DEFAULT_GROW_FACTOR: f64 = 2.0;
pub const DEFAULT_INITIAL_THRESHOLD: usize = 1024 * 1024;

pub struct Heap {
    head: Option<NonNull<GcBox>>,
    bytes_allocated: usize,
    next_gc: usize,
    grow_factor: f64,
    /// The string intern table. Weakly holds its keys: a key survives a
    /// sweep only if something *else* still marks it (spec §4.5).
    pub strings: Table,
    gray: Vec<ObjRef>,
    /// Values kept alive across an allocation that might itself trigger a
    /// collection (e.g. a string constant being added to a still-building
    /// chunk) — the generalized form of "push on the stack before further
    /// allocation" (spec §4.5 safety contract) for call sites that don't
    /// have a VM stack to push onto, such as the compiler.
    protected: Vec<Value>,
    pub trace: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap::with_config(DEFAULT_INITIAL_THRESHOLD, DEFAULT_GROW_FACTOR)
    }

    pub fn with_config(initial_threshold: usize, grow_factor: f64) -> Self {
        Heap {
            head: None,
            bytes_allocated: 0,
            next_gc: initial_threshold,
            grow_factor,
            strings: Table::new(),
            gray: Vec::new(),
            protected: Vec::new(),
            trace: false,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Allocates `data`, prepending it to the heap's object list.
    /// `size_hint` is the approximate payload size, used for GC pacing.
    pub fn alloc(&mut self, data: ObjData, size_hint: usize) -> ObjRef {
        let size = size_of::<GcBox>() + size_hint;
        let boxed = Box::new(GcBox {
            marked: std::cell::Cell::new(false),
            next: std::cell::Cell::new(self.head),
            size,
            data,
        });
        let ptr = NonNull::from(Box::leak(boxed));
        self.head = Some(ptr);
        self.bytes_allocated += size;
        unsafe { ObjRef::from_raw(ptr) }
    }

    /// Interns `s`, returning the canonical `ObjRef` for its byte sequence.
    /// Collapses the source's `copy_string`/`take_string` split: Rust
    /// ownership makes the borrowed-vs-owned-buffer distinction moot.
    pub fn intern_string(&mut self, s: &str) -> ObjRef {
        let hash = crate::object::fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s, hash) {
            return existing;
        }
        let obj = self.alloc(ObjData::Str(crate::object::LoxStr::new(s)), s.len());
        self.strings.set(obj, Value::Nil);
        obj
    }

    /// Keeps `value` alive across allocations until `unprotect` pops it.
    pub fn protect(&mut self, value: Value) {
        self.protected.push(value);
    }

    pub fn unprotect(&mut self) {
        self.protected.pop();
    }

    /// Runs a full mark-sweep cycle. `mark_extra_roots` is given the gray
    /// worklist and is responsible for marking every root the heap itself
    /// doesn't know about (VM value stack, call frames, globals, open
    /// upvalues, or — while compiling — the in-progress function objects).
    pub fn collect_garbage(&mut self, mark_extra_roots: impl FnOnce(&mut Vec<ObjRef>)) {
        if self.trace {
            eprintln!("-- gc begin");
        }
        let before = self.bytes_allocated;

        self.gray.clear();
        for value in &self.protected {
            mark_value(*value, &mut self.gray);
        }
        mark_extra_roots(&mut self.gray);

        while let Some(obj) = self.gray.pop() {
            blacken_object(obj, &mut self.gray);
        }

        // Weak-set sweep: a string only survives if something other than
        // the intern table itself still marks it.
        self.strings.remove_unmarked_keys();

        self.sweep_heap();

        self.next_gc = ((self.bytes_allocated as f64) * self.grow_factor) as usize;

        if self.trace {
            eprintln!(
                "-- gc end (collected {} bytes, {} -> {}, next at {})",
                before.saturating_sub(self.bytes_allocated),
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    fn sweep_heap(&mut self) {
        let mut prev: Option<NonNull<GcBox>> = None;
        let mut current = self.head;
        while let Some(node) = current {
            let node_ref = unsafe { node.as_ref() };
            let next = node_ref.next.get();
            if node_ref.marked.get() {
                node_ref.marked.set(false);
                prev = Some(node);
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref().next.set(next) },
                    None => self.head = next,
                }
                let freed = unsafe { Box::from_raw(node.as_ptr()) };
                self.bytes_allocated = self.bytes_allocated.saturating_sub(freed.size);
                drop(freed);
            }
            current = next;
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.head;
        while let Some(node) = current {
            let next = unsafe { node.as_ref().next.get() };
            unsafe { drop(Box::from_raw(node.as_ptr())) };
            current = next;
        }
    }
}

pub fn mark_value(value: Value, gray: &mut Vec<ObjRef>) {
    if let Value::Obj(obj) = value {
        mark_object(obj, gray);
    }
}

pub fn mark_object(obj: ObjRef, gray: &mut Vec<ObjRef>) {
    if !obj.is_marked() {
        obj.set_marked(true);
        gray.push(obj);
    }
}

/// Walks one object's out-edges, marking everything it references.
fn blacken_object(obj: ObjRef, gray: &mut Vec<ObjRef>) {
    match obj.data() {
        ObjData::Str(_) | ObjData::Native(_) => {}
        ObjData::Function(f) => {
            if let Some(name) = f.name {
                mark_object(name, gray);
            }
            for constant in &f.chunk.constants {
                mark_value(*constant, gray);
            }
        }
        ObjData::Closure(c) => {
            mark_object(c.function, gray);
            for upvalue in &c.upvalues {
                mark_object(*upvalue, gray);
            }
        }
        ObjData::Upvalue(state) => {
            if let crate::object::UpvalueState::Closed(v) = *state.borrow() {
                mark_value(v, gray);
            }
        }
        ObjData::Class(c) => {
            mark_object(c.name, gray);
            for (key, value) in c.methods.borrow().iter() {
                mark_object(key, gray);
                mark_value(value, gray);
            }
        }
        ObjData::Instance(i) => {
            mark_object(i.class, gray);
            for (key, value) in i.fields.borrow().iter() {
                mark_object(key, gray);
                mark_value(value, gray);
            }
        }
        ObjData::BoundMethod(b) => {
            mark_value(b.receiver, gray);
            mark_object(b.method, gray);
        }
        ObjData::NativeInstance(n) => match &*n.borrow() {
            crate::object::NativeInstanceObj::List(items) => {
                for v in items {
                    mark_value(*v, gray);
                }
            }
            crate::object::NativeInstanceObj::Map(entries) => {
                for (k, v) in entries {
                    mark_value(*k, gray);
                    mark_value(*v, gray);
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_same_object_for_equal_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        assert_eq!(a, b);
        let c = heap.intern_string("world");
        assert_ne!(a, c);
    }

    #[test]
    fn unreferenced_object_is_collected() {
        let mut heap = Heap::new();
        let before = heap.bytes_allocated();
        let _doomed = heap.intern_string("transient-but-still-in-string-table");
        // Strings are only weakly held by the intern table, so with no
        // other root marking it, a GC cycle reclaims it.
        heap.collect_garbage(|_roots| {});
        assert_eq!(heap.bytes_allocated(), before);
    }

    #[test]
    fn rooted_object_survives_collection() {
        let mut heap = Heap::new();
        let kept = heap.intern_string("kept");
        heap.collect_garbage(|roots| mark_object(kept, roots));
        assert_eq!(kept.as_str(), Some("kept"));
    }
}
