//! Core data model for the loxi bytecode interpreter: the `Value` tagged
//! union, the heap object kinds, bytecode `Chunk`s, the generic `Table`, and
//! the mark-sweep collector tying them together. Shared by `loxi-compiler`
//! (which emits `Chunk`s and interns identifiers) and `loxi-runtime` (which
//! walks them).

pub mod chunk;
pub mod error;
pub mod heap;
pub mod object;
pub mod opcode;
pub mod table;
pub mod value;

pub use chunk::Chunk;
pub use error::{CompileError, InterpretError, RuntimeError, TraceFrame};
pub use heap::{mark_object, mark_value, Heap};
pub use object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, GcBox, InstanceObj, LoxStr, NativeFn,
    NativeInstanceObj, NativeObj, ObjData, ObjRef, UpvalueState,
};
pub use opcode::{OpCode, SelfOp};
pub use table::Table;
pub use value::{format_number, format_value, Value};
