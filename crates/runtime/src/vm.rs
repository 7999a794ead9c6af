//! The bytecode interpreter: call frames, the fetch-decode-execute loop, and
//! the dispatch table for every opcode in `loxi_core::OpCode` (spec §4.4).

use std::cell::RefCell;

use loxi_core::{
    format_value, mark_object, mark_value, BoundMethodObj, ClassObj, ClosureObj, Heap,
    InstanceObj, ObjData, ObjRef, OpCode, RuntimeError, Table, TraceFrame, Value,
};

use crate::config::Config;
use crate::natives::{define_natives, native_instance_call};

/// One activation record. `slots` is the index into the value stack where
/// this call's window begins: slot 0 is the callee (swapped for the
/// receiver on a method call), slots `1..=arity` are the arguments.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Open upvalues, sorted by stack slot descending (spec §3 invariant).
    open_upvalues: Vec<ObjRef>,
    heap: Heap,
    config: Config,
}

impl Vm {
    pub fn new(config: Config) -> Self {
        let mut heap = Heap::with_config(config.gc_initial_threshold_bytes, config.gc_grow_factor);
        heap.trace = config.trace_gc;
        let mut vm = Vm {
            stack: Vec::with_capacity(config.stack_capacity),
            frames: Vec::with_capacity(config.frame_capacity),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            heap,
            config,
        };
        define_natives(&mut vm);
        vm
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn globals_mut(&mut self) -> &mut Table {
        &mut self.globals
    }

    /// Compiles and runs `source` against this VM's heap and globals, so
    /// that a REPL can keep state across calls (spec §7's recovery policy).
    pub fn interpret(&mut self, source: &str) -> Result<(), loxi_core::InterpretError> {
        let function = loxi_compiler::compile(source, &mut self.heap)?;
        self.heap.protect(Value::Obj(function));
        let closure = self.heap.alloc(
            ObjData::Closure(ClosureObj {
                function,
                upvalues: Vec::new(),
            }),
            std::mem::size_of::<ClosureObj>(),
        );
        self.heap.unprotect();
        self.stack.push(Value::Obj(closure));
        if let Err(e) = self.call_closure(closure, 0) {
            self.reset();
            return Err(e.into());
        }
        match self.run() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset();
                Err(e.into())
            }
        }
    }

    /// Resets the stacks to empty after an unrecovered runtime error (spec
    /// §5 "Cancellation/timeout"). Globals and the heap survive, so a REPL
    /// can keep going.
    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // --------------------------------------------------------- the loop

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.config.trace_execution {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = OpCode::from_u8(byte)
                .unwrap_or_else(|| panic!("invalid opcode byte {byte} in compiled chunk"));
            match op {
                OpCode::Constant => {
                    let idx = self.read_byte();
                    let value = self.read_constant(idx);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte();
                    let base = self.frame().slots;
                    self.push(self.stack[base + slot as usize]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte();
                    let base = self.frame().slots;
                    self.stack[base + slot as usize] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                OpCode::SetGlobal => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        return Err(self.undefined_variable(name));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte();
                    let upvalue = self.current_upvalue(slot);
                    self.push(self.read_upvalue(upvalue));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte();
                    let upvalue = self.current_upvalue(slot);
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }

                OpCode::AddSelfLocal
                | OpCode::SubSelfLocal
                | OpCode::MulSelfLocal
                | OpCode::DivSelfLocal
                | OpCode::PowSelfLocal
                | OpCode::IntDivSelfLocal => {
                    let slot = self.read_byte();
                    let base = self.frame().slots;
                    let lhs = self.stack[base + slot as usize];
                    let rhs = self.pop();
                    let result = self.apply_self_op(op, lhs, rhs)?;
                    self.stack[base + slot as usize] = result;
                    self.push(result);
                    self.collect_if_needed();
                }
                OpCode::AddSelfGlobal
                | OpCode::SubSelfGlobal
                | OpCode::MulSelfGlobal
                | OpCode::DivSelfGlobal
                | OpCode::PowSelfGlobal
                | OpCode::IntDivSelfGlobal => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    let lhs = self
                        .globals
                        .get(name)
                        .ok_or_else(|| self.undefined_variable(name))?;
                    let rhs = self.pop();
                    let result = self.apply_self_op(op, lhs, rhs)?;
                    self.globals.set(name, result);
                    self.push(result);
                    self.collect_if_needed();
                }
                OpCode::AddSelfUpvalue
                | OpCode::SubSelfUpvalue
                | OpCode::MulSelfUpvalue
                | OpCode::DivSelfUpvalue
                | OpCode::PowSelfUpvalue
                | OpCode::IntDivSelfUpvalue => {
                    let slot = self.read_byte();
                    let upvalue = self.current_upvalue(slot);
                    let lhs = self.read_upvalue(upvalue);
                    let rhs = self.pop();
                    let result = self.apply_self_op(op, lhs, rhs)?;
                    self.write_upvalue(upvalue, result);
                    self.push(result);
                    self.collect_if_needed();
                }

                OpCode::GetProperty => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    self.get_property(name)?;
                }
                OpCode::SetProperty => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    self.set_property(name)?;
                }
                OpCode::GetSuper => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    let superclass = self.pop().as_obj().unwrap();
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.comparison(|a, b| a > b)?,
                OpCode::Less => self.comparison(|a, b| a < b)?,
                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    let result = self.add_values(a, b)?;
                    self.push(result);
                    self.collect_if_needed();
                }
                OpCode::Subtract | OpCode::Multiply | OpCode::Divide | OpCode::IntDivide
                | OpCode::Pow => {
                    let b = self.pop();
                    let a = self.pop();
                    let result = self.apply_self_op(op, a, b)?;
                    self.push(result);
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.pop();
                    match v.as_number() {
                        Some(n) => self.push(Value::Number(-n)),
                        None => return Err(self.runtime_error("Operand(s) must be number(s).")),
                    }
                }

                OpCode::Print => {
                    let v = self.pop();
                    println!("{}", format_value(&v));
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frame_mut().ip -= offset as usize;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte();
                    self.call_value(arg_count)?;
                }
                OpCode::Invoke => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    let arg_count = self.read_byte();
                    let superclass = self.pop().as_obj().unwrap();
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    self.closure_op()?;
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame stack non-empty");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                }

                OpCode::Class => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    let class = self.heap.alloc(
                        ObjData::Class(ClassObj {
                            name,
                            methods: RefCell::new(Table::new()),
                        }),
                        std::mem::size_of::<ClassObj>(),
                    );
                    self.push(Value::Obj(class));
                    self.collect_if_needed();
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let superclass = match superclass.as_obj() {
                        Some(o) if matches!(o.data(), ObjData::Class(_)) => o,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass = self.peek(0).as_obj().unwrap();
                    let methods: Vec<(ObjRef, Value)> = match superclass.data() {
                        ObjData::Class(c) => c.methods.borrow().iter().collect(),
                        _ => unreachable!(),
                    };
                    match subclass.data() {
                        ObjData::Class(c) => {
                            let mut table = c.methods.borrow_mut();
                            for (key, value) in methods {
                                table.set(key, value);
                            }
                        }
                        _ => unreachable!(),
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let idx = self.read_byte();
                    let name = self.read_constant(idx).as_obj().unwrap();
                    let method = self.pop();
                    let class = self.peek(0).as_obj().unwrap();
                    match class.data() {
                        ObjData::Class(c) => {
                            c.methods.borrow_mut().set(name, method);
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------- stack helpers

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow in compiled code")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("frame stack non-empty while running")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("frame stack non-empty while running")
    }

    fn read_byte(&mut self) -> u8 {
        let function = closure_function(self.frame().closure);
        let frame = self.frame_mut();
        let byte = function_byte(function, frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&self, idx: u8) -> Value {
        let function = closure_function(self.frame().closure);
        function_constant(function, idx)
    }

    // ----------------------------------------------------------- upvalues

    fn current_upvalue(&self, slot: u8) -> ObjRef {
        match self.frame().closure.data() {
            ObjData::Closure(c) => c.upvalues[slot as usize],
            _ => unreachable!(),
        }
    }

    fn read_upvalue(&self, upvalue: ObjRef) -> Value {
        match upvalue.data() {
            ObjData::Upvalue(cell) => match *cell.borrow() {
                loxi_core::UpvalueState::Open(slot) => self.stack[slot],
                loxi_core::UpvalueState::Closed(value) => value,
            },
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, upvalue: ObjRef, value: Value) {
        match upvalue.data() {
            ObjData::Upvalue(cell) => {
                let slot = match *cell.borrow() {
                    loxi_core::UpvalueState::Open(slot) => Some(slot),
                    loxi_core::UpvalueState::Closed(_) => None,
                };
                match slot {
                    Some(slot) => self.stack[slot] = value,
                    None => *cell.borrow_mut() = loxi_core::UpvalueState::Closed(value),
                }
            }
            _ => unreachable!(),
        }
    }

    fn capture_upvalue(&mut self, stack_slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &up) in self.open_upvalues.iter().enumerate() {
            let loc = open_upvalue_slot(up);
            if loc == stack_slot {
                return up;
            }
            if loc < stack_slot {
                insert_at = i;
                break;
            }
        }
        let upvalue = self.heap.alloc(
            ObjData::Upvalue(RefCell::new(loxi_core::UpvalueState::Open(stack_slot))),
            std::mem::size_of::<loxi_core::UpvalueState>(),
        );
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `from_slot`, folding the stack
    /// value into the upvalue itself so it survives the frame popping.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&top) = self.open_upvalues.first() {
            let loc = open_upvalue_slot(top);
            if loc < from_slot {
                break;
            }
            self.open_upvalues.remove(0);
            let value = self.stack[loc];
            if let ObjData::Upvalue(cell) = top.data() {
                *cell.borrow_mut() = loxi_core::UpvalueState::Closed(value);
            }
        }
    }

    fn closure_op(&mut self) -> Result<(), RuntimeError> {
        let idx = self.read_byte();
        let function = self.read_constant(idx).as_obj().unwrap();
        let upvalue_count = match function.data() {
            ObjData::Function(f) => f.upvalue_count,
            _ => unreachable!(),
        };
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte();
            if is_local {
                let slot = self.frame().slots + index as usize;
                upvalues.push(self.capture_upvalue(slot));
            } else {
                upvalues.push(self.current_upvalue(index));
            }
        }
        let closure = self.heap.alloc(
            ObjData::Closure(ClosureObj { function, upvalues }),
            std::mem::size_of::<ClosureObj>(),
        );
        self.push(Value::Obj(closure));
        self.collect_if_needed();
        Ok(())
    }

    // -------------------------------------------------------------- calls

    fn call_value(&mut self, arg_count: u8) -> Result<(), RuntimeError> {
        let callee_slot = self.stack.len() - 1 - arg_count as usize;
        let callee = self.stack[callee_slot];
        let obj = match callee.as_obj() {
            Some(o) => o,
            None => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        match obj.data() {
            ObjData::Closure(_) => self.call_closure(obj, arg_count),
            ObjData::Native(n) => {
                let function = n.function;
                let args: Vec<Value> = self.stack[callee_slot + 1..].to_vec();
                let result = function(&mut self.heap, &args).map_err(|e| self.attach_backtrace(e))?;
                self.stack.truncate(callee_slot);
                self.push(result);
                self.collect_if_needed();
                Ok(())
            }
            ObjData::Class(c) => {
                let class_name = c.name;
                let initializer = c.methods.borrow().get(class_name);
                let instance = self.heap.alloc(
                    ObjData::Instance(InstanceObj {
                        class: obj,
                        fields: RefCell::new(Table::new()),
                    }),
                    std::mem::size_of::<InstanceObj>(),
                );
                self.stack[callee_slot] = Value::Obj(instance);
                self.collect_if_needed();
                match initializer {
                    Some(init) => self.call_closure(init.as_obj().unwrap(), arg_count),
                    None if arg_count != 0 => Err(self
                        .runtime_error(&format!("Expected 0 arguments but got {arg_count}."))),
                    None => Ok(()),
                }
            }
            ObjData::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                self.stack[callee_slot] = receiver;
                self.call_closure(method, arg_count)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let function = closure_function(closure);
        let arity = match function.data() {
            ObjData::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if arg_count != arity {
            return Err(
                self.runtime_error(&format!("Expected {arity} arguments but got {arg_count}."))
            );
        }
        if self.frames.len() >= self.config.frame_capacity {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots = self.stack.len() - 1 - arg_count as usize;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots,
        });
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, arg_count: u8) -> Result<(), RuntimeError> {
        let receiver_slot = self.stack.len() - 1 - arg_count as usize;
        let receiver = self.stack[receiver_slot];
        let obj = match receiver.as_obj() {
            Some(o) => o,
            None => return Err(self.runtime_error("Only instances have methods.")),
        };
        match obj.data() {
            ObjData::Instance(inst) => {
                if let Some(value) = inst.fields.borrow().get(name) {
                    self.stack[receiver_slot] = value;
                    return self.call_value(arg_count);
                }
                let class = inst.class;
                self.invoke_from_class(class, name, arg_count)
            }
            ObjData::NativeInstance(_) => {
                let method_name = name.as_str().unwrap_or("").to_string();
                let args: Vec<Value> = self.stack[receiver_slot + 1..].to_vec();
                let result = native_instance_call(&mut self.heap, obj, &method_name, &args)
                    .map_err(|e| self.attach_backtrace(e))?;
                self.stack.truncate(receiver_slot);
                self.push(result);
                self.collect_if_needed();
                Ok(())
            }
            _ => Err(self.runtime_error("Only instances have methods.")),
        }
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let method = match class.data() {
            ObjData::Class(c) => c.methods.borrow().get(name),
            _ => unreachable!(),
        };
        match method {
            Some(m) => self.call_closure(m.as_obj().unwrap(), arg_count),
            None => Err(self.undefined_property(name)),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let method = match class.data() {
            ObjData::Class(c) => c.methods.borrow().get(name),
            _ => unreachable!(),
        };
        let method = method.ok_or_else(|| self.undefined_property(name))?;
        let receiver = self.peek(0);
        let bound = self.heap.alloc(
            ObjData::BoundMethod(BoundMethodObj {
                receiver,
                method: method.as_obj().unwrap(),
            }),
            std::mem::size_of::<BoundMethodObj>(),
        );
        self.pop();
        self.push(Value::Obj(bound));
        self.collect_if_needed();
        Ok(())
    }

    fn get_property(&mut self, name: ObjRef) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        let obj = match receiver.as_obj() {
            Some(o) if matches!(o.data(), ObjData::Instance(_)) => o,
            _ => return Err(self.runtime_error("Only instances have properties.")),
        };
        let field = match obj.data() {
            ObjData::Instance(i) => i.fields.borrow().get(name),
            _ => unreachable!(),
        };
        match field {
            Some(value) => {
                self.pop();
                self.push(value);
                Ok(())
            }
            None => {
                let class = match obj.data() {
                    ObjData::Instance(i) => i.class,
                    _ => unreachable!(),
                };
                self.bind_method(class, name)
            }
        }
    }

    fn set_property(&mut self, name: ObjRef) -> Result<(), RuntimeError> {
        let receiver = self.peek(1);
        let obj = match receiver.as_obj() {
            Some(o) if matches!(o.data(), ObjData::Instance(_)) => o,
            _ => return Err(self.runtime_error("Only instances have fields.")),
        };
        let value = self.peek(0);
        match obj.data() {
            ObjData::Instance(i) => {
                i.fields.borrow_mut().set(name, value);
            }
            _ => unreachable!(),
        }
        let value = self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    // ------------------------------------------------------- arithmetic

    fn comparison(&mut self, cmp: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Bool(cmp(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operand(s) must be number(s).")),
        }
    }

    fn add_values(&mut self, a: Value, b: Value) -> Result<Value, RuntimeError> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(Value::Number(x + y));
        }
        if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
            // Not yet rooted: the caller must push the result (or otherwise
            // root it) before triggering a collection.
            let concatenated = format!("{x}{y}");
            let obj = self.heap.intern_string(&concatenated);
            return Ok(Value::Obj(obj));
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    /// Shared by the plain binary opcodes and the fused `*_SELF_*` compound
    /// assignment opcodes: both perform the same arithmetic, just sourced
    /// and stored differently.
    fn apply_self_op(&mut self, op: OpCode, a: Value, b: Value) -> Result<Value, RuntimeError> {
        use OpCode::*;
        if matches!(op, Add | AddSelfLocal | AddSelfGlobal | AddSelfUpvalue) {
            return self.add_values(a, b);
        }
        let (x, y) = match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(self.runtime_error("Operand(s) must be number(s).")),
        };
        let result = match op {
            Subtract | SubSelfLocal | SubSelfGlobal | SubSelfUpvalue => x - y,
            Multiply | MulSelfLocal | MulSelfGlobal | MulSelfUpvalue => x * y,
            Divide | DivSelfLocal | DivSelfGlobal | DivSelfUpvalue => x / y,
            Pow | PowSelfLocal | PowSelfGlobal | PowSelfUpvalue => x.powf(y),
            IntDivide | IntDivSelfLocal | IntDivSelfGlobal | IntDivSelfUpvalue => {
                let divisor = y.trunc() as i64;
                if divisor == 0 {
                    return Err(self.runtime_error("Division by zero."));
                }
                ((x.trunc() as i64) / divisor) as f64
            }
            _ => unreachable!("apply_self_op called with a non-arithmetic opcode"),
        };
        Ok(Value::Number(result))
    }

    // -------------------------------------------------------------- GC

    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let stack = &self.stack;
        let frames = &self.frames;
        let globals = &self.globals;
        let open_upvalues = &self.open_upvalues;
        self.heap.collect_garbage(|gray| {
            for value in stack {
                mark_value(*value, gray);
            }
            for frame in frames {
                mark_object(frame.closure, gray);
            }
            for (key, value) in globals.iter() {
                mark_object(key, gray);
                mark_value(value, gray);
            }
            for &upvalue in open_upvalues {
                mark_object(upvalue, gray);
            }
        });
    }

    // ------------------------------------------------------------ errors

    fn undefined_variable(&self, name: ObjRef) -> RuntimeError {
        self.runtime_error(&format!(
            "Undefined variable '{}'.",
            name.as_str().unwrap_or("?")
        ))
    }

    fn undefined_property(&self, name: ObjRef) -> RuntimeError {
        self.runtime_error(&format!(
            "Undefined property '{}'.",
            name.as_str().unwrap_or("?")
        ))
    }

    fn runtime_error(&self, message: &str) -> RuntimeError {
        RuntimeError {
            message: message.to_string(),
            backtrace: self.backtrace(),
        }
    }

    fn attach_backtrace(&self, mut err: RuntimeError) -> RuntimeError {
        if err.backtrace.is_empty() {
            err.backtrace = self.backtrace();
        }
        err
    }

    fn backtrace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let function = closure_function(frame.closure);
                let line = function_line(function, frame.ip.saturating_sub(1));
                let name = match function.data() {
                    ObjData::Function(f) => f
                        .name
                        .and_then(|n| n.as_str().map(|s| s.to_string()))
                        .unwrap_or_else(|| "script".to_string()),
                    _ => unreachable!(),
                };
                TraceFrame { line, name }
            })
            .collect()
    }

    fn trace_instruction(&self) {
        let function = closure_function(self.frame().closure);
        let ip = self.frame().ip;
        let byte = function_byte(function, ip);
        let op_name = OpCode::from_u8(byte).map(|o| format!("{o:?}"));
        eprint!("          ");
        for value in &self.stack {
            eprint!("[ {} ]", format_value(value));
        }
        eprintln!();
        eprintln!("{ip:04} {}", op_name.unwrap_or_else(|| format!("0x{byte:02x}")));
    }
}

fn closure_function(closure: ObjRef) -> ObjRef {
    match closure.data() {
        ObjData::Closure(c) => c.function,
        _ => unreachable!("CallFrame::closure always points at a ClosureObj"),
    }
}

fn function_byte(function: ObjRef, ip: usize) -> u8 {
    match function.data() {
        ObjData::Function(f) => f.chunk.code[ip],
        _ => unreachable!(),
    }
}

fn function_constant(function: ObjRef, idx: u8) -> Value {
    match function.data() {
        ObjData::Function(f) => f.chunk.constants[idx as usize],
        _ => unreachable!(),
    }
}

fn function_line(function: ObjRef, ip: usize) -> u32 {
    match function.data() {
        ObjData::Function(f) => f.chunk.lines[ip],
        _ => unreachable!(),
    }
}

fn open_upvalue_slot(upvalue: ObjRef) -> usize {
    match upvalue.data() {
        ObjData::Upvalue(cell) => match *cell.borrow() {
            loxi_core::UpvalueState::Open(slot) => slot,
            loxi_core::UpvalueState::Closed(_) => {
                unreachable!("closed upvalues are removed from open_upvalues")
            }
        },
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<(), loxi_core::InterpretError> {
        let mut vm = Vm::new(Config::default());
        vm.interpret(source)
    }

    #[test]
    fn arithmetic_respects_precedence() {
        assert!(run("print 1 + 2 * 3;").is_ok());
    }

    #[test]
    fn string_concatenation_via_add() {
        assert!(run(r#"print "foo" + "bar";"#).is_ok());
    }

    #[test]
    fn recursive_fibonacci_runs_to_completion() {
        let source = r#"
            fn fib(n) {
                if (n < 2) { return n; }
                return fib(n - 1) + fib(n - 2);
            }
            print fib(10);
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn closures_capture_and_mutate_shared_state() {
        let source = r#"
            fn make_counter() {
                let count = 0;
                fn increment() {
                    count += 1;
                    return count;
                }
                return increment;
            }
            let counter = make_counter();
            print counter();
            print counter();
            print counter();
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn inheritance_dispatches_to_overriding_method_and_super() {
        let source = r#"
            class Greeter {
                greet() { print "A"; }
            }
            class LoudGreeter : Greeter {
                greet() {
                    super.greet();
                    print "B";
                }
            }
            LoudGreeter().greet();
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn undefined_global_read_is_a_runtime_error() {
        let result = run("print nope;");
        assert!(matches!(result, Err(loxi_core::InterpretError::Runtime(_))));
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let result = run("let x = 1; x();");
        assert!(matches!(result, Err(loxi_core::InterpretError::Runtime(_))));
    }

    #[test]
    fn deeply_recursive_calls_overflow_the_frame_stack() {
        let source = r#"
            fn recurse(n) { return recurse(n + 1); }
            recurse(0);
        "#;
        let result = run(source);
        match result {
            Err(loxi_core::InterpretError::Runtime(e)) => {
                assert_eq!(e.message, "Stack overflow.");
            }
            other => panic!("expected a stack overflow runtime error, got {other:?}"),
        }
    }

    #[test]
    fn globals_persist_across_separate_interpret_calls() {
        let mut vm = Vm::new(Config::default());
        vm.interpret("let x = 1;").unwrap();
        vm.interpret("x += 1; print x;").unwrap();
    }
}
