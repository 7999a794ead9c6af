//! The object heap (spec §3/§4.5): a closed set of heap object kinds sharing
//! one intrusive header (GC mark bit + forward link), matched exhaustively
//! rather than dispatched through a vtable, per SPEC_FULL §9.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::error::RuntimeError;
use crate::table::Table;
use crate::value::Value;

/// FNV-1a, 32-bit, matching the source's string hash (spec §4.5).
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub struct LoxStr {
    pub hash: u32,
    chars: Box<str>,
}

impl LoxStr {
    pub fn new(s: impl Into<Box<str>>) -> Self {
        let chars = s.into();
        let hash = fnv1a_hash(chars.as_bytes());
        LoxStr { hash, chars }
    }

    pub fn as_str(&self) -> &str {
        &self.chars
    }
}

pub struct FunctionObj {
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Clone, Copy)]
pub enum UpvalueState {
    /// Points at a live stack slot while the enclosing frame is on the stack.
    Open(usize),
    /// Owns the value once the enclosing frame has returned.
    Closed(Value),
}

/// Natives take the heap directly rather than reaching through a global VM
/// pointer (as the source's native functions do via the global `vm`), since
/// several of them (`string`, `input`, `type`, the `_List`/`_Map`
/// constructors) need to intern a string or allocate a container.
pub type NativeFn = fn(&mut crate::heap::Heap, &[Value]) -> Result<Value, RuntimeError>;

pub struct NativeObj {
    pub name: &'static str,
    pub function: NativeFn,
}

pub struct ClassObj {
    pub name: ObjRef,
    pub methods: RefCell<Table>,
}

pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: RefCell<Table>,
}

pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

/// Backing storage for the two native container kinds (spec §6).
pub enum NativeInstanceObj {
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl NativeInstanceObj {
    pub fn type_tag(&self) -> &'static str {
        match self {
            NativeInstanceObj::List(_) => "List",
            NativeInstanceObj::Map(_) => "Map",
        }
    }
}

pub enum ObjData {
    Str(LoxStr),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(RefCell<UpvalueState>),
    Native(NativeObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    NativeInstance(RefCell<NativeInstanceObj>),
}

/// The common object header plus payload; objects are allocated with
/// `Box::into_raw` and linked into the heap's intrusive singly-linked list
/// via `next`. Reclaimed only by the collector's sweep phase.
pub struct GcBox {
    pub marked: Cell<bool>,
    pub next: Cell<Option<NonNull<GcBox>>>,
    /// Approximate bytes charged against the heap's allocation counter for
    /// this object, so the sweep phase can credit them back precisely.
    pub size: usize,
    pub data: ObjData,
}

/// A non-owning handle to a heap object. `Copy`, compares by identity.
#[derive(Clone, Copy)]
pub struct ObjRef(pub(crate) NonNull<GcBox>);

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for ObjRef {}

impl ObjRef {
    /// # Safety
    /// `ptr` must point at a live `GcBox` owned by some `Heap`.
    pub unsafe fn from_raw(ptr: NonNull<GcBox>) -> Self {
        ObjRef(ptr)
    }

    pub fn as_raw(&self) -> NonNull<GcBox> {
        self.0
    }

    pub fn data(&self) -> &ObjData {
        // Safety: the heap outlives every ObjRef derived from it; the VM
        // never hands out an ObjRef to a swept object (spec invariant:
        // every live object is reachable from some root).
        unsafe { &self.0.as_ref().data }
    }

    pub fn is_marked(&self) -> bool {
        unsafe { self.0.as_ref().marked.get() }
    }

    pub fn set_marked(&self, marked: bool) {
        unsafe { self.0.as_ref().marked.set(marked) }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.data() {
            ObjData::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn type_tag(&self) -> &str {
        match self.data() {
            ObjData::Str(_) => "string",
            ObjData::Function(_) | ObjData::Closure(_) | ObjData::Native(_) => "fn",
            ObjData::Upvalue(_) => "upvalue",
            // A bare class value types as "fn" (only instances type as their
            // class name) — matches the original's `type_native` switch.
            ObjData::Class(_) => "fn",
            ObjData::Instance(i) => match i.class.data() {
                ObjData::Class(c) => c.name.as_str().unwrap_or("?"),
                _ => "?",
            },
            ObjData::BoundMethod(_) => "fn",
            ObjData::NativeInstance(n) => n.borrow().type_tag(),
        }
    }
}
