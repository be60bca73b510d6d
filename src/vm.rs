// (C) 2020 Brandon Lewis
//
// The bytecode interpreter engine.
//
// *Execution Model*
//
// A loaded image supplies a constant pool, structure layouts, a
// function table, and a top-level instruction stream. The engine owns
// a byte-addressed stack and a heap, and runs a flat dispatch loop
// over the current stream. Every value on the stack or in a heap cell
// leads with its `Type` tag, so the machine can always inspect what
// it is about to touch before touching it.
//
// *Frames*
//
// Call establishes a frame: the callee's arguments become its first
// local variables, the frame remembers where its value area begins,
// where its variables begin, and which caller instruction to resume.
// Ret tears all of that down, re-pushing the result (if the function
// declares one) at the truncated top. The top-level stream is the
// root frame; Ret there is the normal halt signal.
//
// *Validity*
//
// Runtime faults are a flat set of stable codes. An instruction
// validates its preconditions before mutating anything; on a fault
// the engine records a snapshot (code, instruction index, depth, call
// stack) and the loop freezes at the faulting instruction. There is
// no in-bytecode recovery. Re-running after a fault requires clear().
//
// *Safety*
//
// Bytecode is trusted. Pointer instructions dereference raw
// addresses the program put on the stack; the instruction set checks
// tags, null, and ranges, but a program that manufactures a bogus
// address with ToP gets what it asked for, exactly as on a real
// machine. All raw access goes through unaligned reads and writes.

use std::fmt;
use std::mem;

use crate::heap::{Heap, Roots};
use crate::image::{Constant, Image, Instructions, Opcode};
use crate::object::{
    self,
    DoubleObject,
    GCPointerObject,
    IntObject,
    LongObject,
    PointerObject,
    StructureObject,
};
use crate::stack::Stack;
use crate::types::{self, StructureInfo, Type, TypeCode, NONE_TYPE};


pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;


// Every fault the engine can report. The numeric values are stable
// and visible on the wire.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExceptionCode {
    StackOverflow = 0,
    StackEmpty = 1,
    StackDifferentType = 2,
    ConstantPoolOutOfRange = 3,
    DivideByZero = 4,
    LocalVariableOutOfRange = 5,
    LocalVariableInvalidIndex = 6,
    LabelOutOfRange = 7,
    FunctionOutOfRange = 8,
    TopOfCallStack = 9,
    NoRetInstruction = 10,
    NullPointer = 11,
    NotPointer = 12,
    InvalidForPointer = 13,
    InvalidForStructure = 14,
    TypeOutOfRange = 15,
    UnknownAddress = 16,
}

impl ExceptionCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ExceptionCode::StackOverflow => "stack overflow",
            ExceptionCode::StackEmpty => "stack empty",
            ExceptionCode::StackDifferentType => "stack type mismatch",
            ExceptionCode::ConstantPoolOutOfRange => "constant pool index out of range",
            ExceptionCode::DivideByZero => "divide by zero",
            ExceptionCode::LocalVariableOutOfRange => "local variable out of range",
            ExceptionCode::LocalVariableInvalidIndex => "invalid local variable index",
            ExceptionCode::LabelOutOfRange => "label out of range",
            ExceptionCode::FunctionOutOfRange => "function out of range",
            ExceptionCode::TopOfCallStack => "top of call stack",
            ExceptionCode::NoRetInstruction => "missing ret instruction",
            ExceptionCode::NullPointer => "null pointer",
            ExceptionCode::NotPointer => "not a pointer",
            ExceptionCode::InvalidForPointer => "invalid for pointer",
            ExceptionCode::InvalidForStructure => "invalid for structure",
            ExceptionCode::TypeOutOfRange => "type code out of range",
            ExceptionCode::UnknownAddress => "unknown address",
        };
        write!(f, "{}", name)
    }
}


// Bookkeeping for one active invocation. `ty` is the type the most
// recent call made from this frame produced, none before any call
// returns. Frames reference the image by function index, never by
// owning pointer; the root frame has no function and no caller.
#[derive(Copy, Clone, Debug)]
pub struct StackFrame {
    pub ty: Type,
    pub stack_begin: usize,
    pub variable_begin: usize,
    pub caller: Option<usize>,
    pub function: Option<usize>,
}

impl StackFrame {
    fn root() -> StackFrame {
        StackFrame {
            ty: NONE_TYPE,
            stack_begin: 0,
            variable_begin: 0,
            caller: None,
            function: None,
        }
    }
}


// The snapshot recorded when the dispatch loop stops on a fault.
#[derive(Clone, Debug)]
pub struct InterpreterException {
    pub code: ExceptionCode,
    pub instruction_index: usize,
    pub depth: usize,
    pub call_stack: Vec<StackFrame>,
}


// What the root frame left on top of the stack, coerced by its tag.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ExecResult {
    None,
    Int(u32),
    Long(u64),
    Double(f64),
    Pointer(usize),
    Structure(usize),
}


// What an instruction tells the loop to do next.
enum ControlFlow {
    Advance,
    Branch(usize),
    Stop,
}

type OpResult<T> = std::result::Result<T, ExceptionCode>;


// Three-way comparison yielding the -1/0/1 convention Cmp pushes.
fn rank<T: PartialOrd>(lhs: T, rhs: T) -> i32 {
    if lhs > rhs {
        1
    } else if lhs == rhs {
        0
    } else {
        -1
    }
}


// Reads a typed object at a stack offset, faulting with StackEmpty
// when the read fails.
macro_rules! take {
    ($self:ident, $t:ty, $offset:expr) => {
        match $self.stack.get::<$t>($offset) {
            Some(object) => object,
            None => return $self.fault(ExceptionCode::StackEmpty),
        }
    };
}


pub struct Interpreter {
    image: Image,
    stack: Stack,
    heap: Heap,
    frame: StackFrame,
    call_stack: Vec<StackFrame>,
    depth: usize,
    instruction_index: usize,
    local_variables: Vec<usize>,
    exception: Option<InterpreterException>,
}

impl Interpreter {
    pub fn new(image: Image) -> Interpreter {
        Interpreter {
            image,
            stack: Stack::new(),
            heap: Heap::new(),
            frame: StackFrame::root(),
            call_stack: Vec::new(),
            depth: 0,
            instruction_index: 0,
            local_variables: Vec::new(),
            exception: None,
        }
    }

    // Replaces the program image and resets all execution state.
    pub fn load(&mut self, image: Image) {
        self.image = image;
        self.clear();
    }

    // Resets execution state. Required between interpret() calls once
    // an exception has been recorded.
    pub fn clear(&mut self) {
        self.stack.remove_to(0);
        self.heap = Heap::new();
        self.frame = StackFrame::root();
        self.call_stack.clear();
        self.depth = 0;
        self.instruction_index = 0;
        self.local_variables.clear();
        self.exception = None;
    }

    pub fn allocate_stack(&mut self, size: usize) {
        self.stack.allocate(size);
    }

    pub fn reallocate_stack(&mut self, size: usize) -> bool {
        self.stack.reallocate(size)
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn instruction_index(&self) -> usize {
        self.instruction_index
    }

    pub fn get_exception(&self) -> Option<&InterpreterException> {
        self.exception.as_ref()
    }

    // The active frame chain, root first.
    pub fn get_call_stacks(&self) -> Vec<StackFrame> {
        let mut frames = self.call_stack.clone();
        frames.push(self.frame);
        frames
    }

    // Runs until Ret at the root, a fault, or exhaustion of the root
    // stream. Returns true when execution terminated without a
    // user-visible fault; Ret at the root records TopOfCallStack but
    // is the normal way to halt.
    pub fn interpret(&mut self) -> bool {
        while self.exception.is_none() {
            let op = match self.current_instructions().get(self.instruction_index) {
                Some(op) => op,
                None => {
                    if self.frame.function.is_some() {
                        self.occur_exception(ExceptionCode::NoRetInstruction);
                    }
                    break;
                }
            };

            trace!("{:3} {:?} used={}", self.instruction_index, op, self.stack.used());

            match self.dispatch(op) {
                ControlFlow::Advance => self.instruction_index += 1,
                ControlFlow::Branch(target) => self.instruction_index = target,
                ControlFlow::Stop => break,
            }
        }

        match &self.exception {
            None => true,
            Some(exception) => exception.code == ExceptionCode::TopOfCallStack,
        }
    }

    // The top of stack coerced by its tag; None when the root left no
    // value behind.
    pub fn get_result(&self) -> ExecResult {
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return ExecResult::None,
        };
        match ty.code {
            TypeCode::INT => match self.stack.top::<IntObject>() {
                Some(object) => ExecResult::Int(object.value),
                None => ExecResult::None,
            },
            TypeCode::LONG => match self.stack.top::<LongObject>() {
                Some(object) => ExecResult::Long(object.value),
                None => ExecResult::None,
            },
            TypeCode::DOUBLE => match self.stack.top::<DoubleObject>() {
                Some(object) => ExecResult::Double(object.value),
                None => ExecResult::None,
            },
            TypeCode::POINTER => match self.stack.top::<PointerObject>() {
                Some(object) => ExecResult::Pointer(object.value),
                None => ExecResult::None,
            },
            TypeCode::GC_POINTER => match self.stack.top::<GCPointerObject>() {
                Some(object) => ExecResult::Pointer(object.value),
                None => ExecResult::None,
            },
            _ if ty.code.is_structure() => match self.stack.top::<StructureObject>() {
                Some(_) => ExecResult::Structure(self.stack.address_of(self.stack.used())),
                None => ExecResult::None,
            },
            _ => ExecResult::None,
        }
    }

    fn occur_exception(&mut self, code: ExceptionCode) {
        self.exception = Some(InterpreterException {
            code,
            instruction_index: self.instruction_index,
            depth: self.depth,
            call_stack: self.get_call_stacks(),
        });
    }

    fn fault(&mut self, code: ExceptionCode) -> ControlFlow {
        self.occur_exception(code);
        ControlFlow::Stop
    }

    fn current_instructions(&self) -> &Instructions {
        match self.frame.function.and_then(|index| self.image.function(index)) {
            Some(function) => function.instructions(),
            None => self.image.instructions(),
        }
    }

    // Whether the top of stack is the slot of the most recently bound
    // local variable. Instructions that would consume such a slot
    // treat it as absent.
    fn is_local_variable(&self) -> bool {
        self.local_variables.last() == Some(&self.stack.used())
    }

    fn local_count(&self) -> usize {
        self.local_variables.len() - self.frame.variable_begin
    }

    fn local_offset(&self, index: usize) -> usize {
        self.local_variables[self.frame.variable_begin + index]
    }

    fn structure_info(&self, code: TypeCode) -> Option<&StructureInfo> {
        code.structure_index()
            .and_then(|index| self.image.structures().get(index))
    }

    // Writes the type tag of a fresh object, recursing through
    // structure fields. Payload bytes are expected to be zero
    // already.
    fn initialize_object(&self, ty: Type, address: usize) {
        unsafe {
            object::write_type_at(address, ty);
        }
        if let Some(index) = ty.code.structure_index() {
            if let Some(info) = self.image.structures().get(index) {
                for field in &info.fields {
                    self.initialize_object(field.ty, address + field.offset as usize);
                }
            }
        }
    }

    // Maps an invalid operand type to the fault its class deserves.
    fn domain_fault(&mut self, ty: Type) -> ControlFlow {
        let code = match ty.code.class() {
            Some(class) if types::pointers().contains(class) => {
                ExceptionCode::InvalidForPointer
            }
            Some(_) => ExceptionCode::StackDifferentType,
            None if ty.code.is_structure() => ExceptionCode::InvalidForStructure,
            None => ExceptionCode::StackDifferentType,
        };
        self.fault(code)
    }

    // Validates that the top two objects share a type and returns
    // (type, lhs offset, rhs offset); rhs is the top.
    fn two_same_type(&self) -> OpResult<(Type, usize, usize)> {
        if self.is_local_variable() {
            return Err(ExceptionCode::StackEmpty);
        }
        let rhs_ty = self.stack.top_type().ok_or(ExceptionCode::StackEmpty)?;
        let rhs_offset = self.stack.used();
        let lhs_offset = rhs_offset
            .checked_sub(rhs_ty.size as usize)
            .ok_or(ExceptionCode::StackEmpty)?;
        let lhs_ty = self
            .stack
            .type_at(lhs_offset)
            .ok_or(ExceptionCode::StackEmpty)?;
        if lhs_ty.code != rhs_ty.code {
            return Err(ExceptionCode::StackDifferentType);
        }
        Ok((rhs_ty, lhs_offset, rhs_offset))
    }

    // Value operations.

    fn push_constant(&mut self, operand: u32) -> ControlFlow {
        let constant = match self.image.constant_pool().get(operand) {
            Some(constant) => constant,
            None => return self.fault(ExceptionCode::ConstantPoolOutOfRange),
        };
        let pushed = match constant {
            Constant::Int(value) => self.stack.push(IntObject::new(value)),
            Constant::Long(value) => self.stack.push(LongObject::new(value)),
            Constant::Double(value) => self.stack.push(DoubleObject::new(value)),
        };
        if pushed {
            ControlFlow::Advance
        } else {
            self.fault(ExceptionCode::StackOverflow)
        }
    }

    // Reserves a structure value on the stack and stamps its field
    // tags; payloads start out zero.
    fn push_structure(&mut self, operand: u32) -> ControlFlow {
        let ty = match self
            .structure_info(TypeCode(operand))
            .map(|info| info.ty)
        {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::TypeOutOfRange),
        };
        let size = ty.size as usize;
        if !self.stack.expand(size) {
            return self.fault(ExceptionCode::StackOverflow);
        }
        self.stack.zero(self.stack.used(), size);
        let address = self.stack.address_of(self.stack.used());
        self.initialize_object(ty, address);
        ControlFlow::Advance
    }

    fn pop(&mut self) -> ControlFlow {
        if self.is_local_variable() {
            self.local_variables.pop();
            return ControlFlow::Advance;
        }
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        self.stack.reduce(ty.size as usize);
        ControlFlow::Advance
    }

    fn load_local(&mut self, operand: u32) -> ControlFlow {
        let index = operand as usize;
        if index >= self.local_count() {
            return self.fault(ExceptionCode::LocalVariableOutOfRange);
        }
        let offset = self.local_offset(index);
        let ty = match self.stack.type_at(offset) {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::LocalVariableOutOfRange),
        };
        if self.stack.copy_object(offset, ty.size as usize) {
            ControlFlow::Advance
        } else {
            self.fault(ExceptionCode::StackOverflow)
        }
    }

    fn store(&mut self, operand: u32) -> ControlFlow {
        let index = operand as usize;
        let count = self.local_count();
        if index > count {
            return self.fault(ExceptionCode::LocalVariableInvalidIndex);
        }
        let top_ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };

        if index == count {
            // First store to a fresh index binds the top as a new
            // variable; the object stays where it is.
            self.local_variables.push(self.stack.used());
            return ControlFlow::Advance;
        }

        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let offset = self.local_offset(index);
        let local_ty = match self.stack.type_at(offset) {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::LocalVariableOutOfRange),
        };
        if local_ty != top_ty {
            return self.fault(ExceptionCode::StackDifferentType);
        }
        self.stack
            .write_object(offset, self.stack.used(), top_ty.size as usize);
        self.stack.reduce(top_ty.size as usize);
        ControlFlow::Advance
    }

    fn lea(&mut self, operand: u32) -> ControlFlow {
        let index = operand as usize;
        if index >= self.local_count() {
            return self.fault(ExceptionCode::LocalVariableOutOfRange);
        }
        let address = self.stack.address_of(self.local_offset(index));
        if self.stack.push(PointerObject::new(address)) {
            ControlFlow::Advance
        } else {
            self.fault(ExceptionCode::StackOverflow)
        }
    }

    // Replaces a pointer to a structure with a pointer to one of its
    // fields, by the layout's declared offsets.
    fn flea(&mut self, operand: u32) -> ControlFlow {
        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        if ty.code != TypeCode::POINTER && ty.code != TypeCode::GC_POINTER {
            return self.fault(ExceptionCode::NotPointer);
        }
        let address = take!(self, PointerObject, self.stack.used()).value;
        if address == 0 {
            return self.fault(ExceptionCode::NullPointer);
        }

        let pointee = unsafe { object::type_at(address) };
        let field_offset = match self.structure_info(pointee.code) {
            Some(info) => match info.fields.get(operand as usize) {
                Some(field) => field.offset as usize,
                None => return self.fault(ExceptionCode::InvalidForStructure),
            },
            None => return self.fault(ExceptionCode::InvalidForPointer),
        };

        self.stack.reduce(mem::size_of::<PointerObject>());
        if self.stack.push(PointerObject::new(address + field_offset)) {
            ControlFlow::Advance
        } else {
            self.fault(ExceptionCode::StackOverflow)
        }
    }

    fn tload(&mut self) -> ControlFlow {
        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        if ty.code != TypeCode::POINTER && ty.code != TypeCode::GC_POINTER {
            return self.fault(ExceptionCode::NotPointer);
        }
        let address = take!(self, PointerObject, self.stack.used()).value;
        if address == 0 {
            return self.fault(ExceptionCode::NullPointer);
        }

        let pointee = unsafe { object::type_at(address) };
        if pointee.is_none() {
            return self.fault(ExceptionCode::InvalidForPointer);
        }
        let size = pointee.size as usize;
        let pointer_size = mem::size_of::<PointerObject>();
        if self.stack.free() + pointer_size < size {
            return self.fault(ExceptionCode::StackOverflow);
        }

        let bytes =
            unsafe { std::slice::from_raw_parts(address as *const u8, size).to_vec() };
        self.stack.reduce(pointer_size);
        if self.stack.push_slice(&bytes) {
            ControlFlow::Advance
        } else {
            self.fault(ExceptionCode::StackOverflow)
        }
    }

    fn tstore(&mut self) -> ControlFlow {
        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let value_ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let value_size = value_ty.size as usize;
        let value_offset = self.stack.used();
        let pointer_offset = match value_offset.checked_sub(value_size) {
            Some(offset) => offset,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let pointer_ty = match self.stack.type_at(pointer_offset) {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        if pointer_ty.code != TypeCode::POINTER && pointer_ty.code != TypeCode::GC_POINTER
        {
            return self.fault(ExceptionCode::NotPointer);
        }
        let address = take!(self, PointerObject, pointer_offset).value;
        if address == 0 {
            return self.fault(ExceptionCode::NullPointer);
        }

        let pointee = unsafe { object::type_at(address) };
        if pointee != value_ty {
            return self.fault(ExceptionCode::StackDifferentType);
        }

        unsafe {
            object::copy(
                self.stack.ptr_at(value_offset),
                address as *mut u8,
                value_size,
            );
        }
        self.stack
            .reduce(value_size + mem::size_of::<PointerObject>());
        ControlFlow::Advance
    }

    fn copy(&mut self) -> ControlFlow {
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        if self.stack.copy_object(self.stack.used(), ty.size as usize) {
            ControlFlow::Advance
        } else {
            self.fault(ExceptionCode::StackOverflow)
        }
    }

    fn swap(&mut self) -> ControlFlow {
        let rhs_ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let rhs_offset = self.stack.used();
        let lhs_offset = match rhs_offset.checked_sub(rhs_ty.size as usize) {
            Some(offset) => offset,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let lhs_ty = match self.stack.type_at(lhs_offset) {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        if self.local_variables.contains(&rhs_offset)
            || self.local_variables.contains(&lhs_offset)
        {
            return self.fault(ExceptionCode::StackEmpty);
        }

        let rhs = match self.stack.read_bytes(rhs_offset, rhs_ty.size as usize) {
            Some(bytes) => bytes,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let lhs = match self.stack.read_bytes(lhs_offset, lhs_ty.size as usize) {
            Some(bytes) => bytes,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        self.stack.reduce(rhs.len() + lhs.len());
        self.stack.push_slice(&rhs);
        self.stack.push_slice(&lhs);
        ControlFlow::Advance
    }

    // Arithmetic and bitwise operations, parameterized by the
    // per-type payload functions. Division-style faults come back
    // through the OpResult.

    fn binary_op(
        &mut self,
        int_op: fn(u32, u32) -> OpResult<u32>,
        long_op: fn(u64, u64) -> OpResult<u64>,
        double_op: fn(f64, f64) -> OpResult<f64>,
    ) -> ControlFlow {
        let (ty, lhs_offset, rhs_offset) = match self.two_same_type() {
            Ok(operands) => operands,
            Err(code) => return self.fault(code),
        };
        let in_domain = ty
            .code
            .class()
            .map_or(false, |class| types::arithmetic().contains(class));
        if !in_domain {
            return self.domain_fault(ty);
        }

        let size = ty.size as usize;
        match ty.code {
            TypeCode::INT => {
                let lhs = take!(self, IntObject, lhs_offset).value;
                let rhs = take!(self, IntObject, rhs_offset).value;
                match int_op(lhs, rhs) {
                    Ok(value) => {
                        self.stack.reduce(2 * size);
                        self.stack.push(IntObject::new(value));
                        ControlFlow::Advance
                    }
                    Err(code) => self.fault(code),
                }
            }
            TypeCode::LONG => {
                let lhs = take!(self, LongObject, lhs_offset).value;
                let rhs = take!(self, LongObject, rhs_offset).value;
                match long_op(lhs, rhs) {
                    Ok(value) => {
                        self.stack.reduce(2 * size);
                        self.stack.push(LongObject::new(value));
                        ControlFlow::Advance
                    }
                    Err(code) => self.fault(code),
                }
            }
            TypeCode::DOUBLE => {
                let lhs = take!(self, DoubleObject, lhs_offset).value;
                let rhs = take!(self, DoubleObject, rhs_offset).value;
                match double_op(lhs, rhs) {
                    Ok(value) => {
                        self.stack.reduce(2 * size);
                        self.stack.push(DoubleObject::new(value));
                        ControlFlow::Advance
                    }
                    Err(code) => self.fault(code),
                }
            }
            _ => self.fault(ExceptionCode::StackDifferentType),
        }
    }

    fn unary_op(
        &mut self,
        int_op: fn(u32) -> OpResult<u32>,
        long_op: fn(u64) -> OpResult<u64>,
        double_op: fn(f64) -> OpResult<f64>,
    ) -> ControlFlow {
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let in_domain = ty
            .code
            .class()
            .map_or(false, |class| types::arithmetic().contains(class));
        if !in_domain {
            return self.domain_fault(ty);
        }

        let offset = self.stack.used();
        match ty.code {
            TypeCode::INT => {
                let object = take!(self, IntObject, offset);
                match int_op(object.value) {
                    Ok(value) => {
                        self.stack.set(offset, IntObject::new(value));
                        ControlFlow::Advance
                    }
                    Err(code) => self.fault(code),
                }
            }
            TypeCode::LONG => {
                let object = take!(self, LongObject, offset);
                match long_op(object.value) {
                    Ok(value) => {
                        self.stack.set(offset, LongObject::new(value));
                        ControlFlow::Advance
                    }
                    Err(code) => self.fault(code),
                }
            }
            TypeCode::DOUBLE => {
                let object = take!(self, DoubleObject, offset);
                match double_op(object.value) {
                    Ok(value) => {
                        self.stack.set(offset, DoubleObject::new(value));
                        ControlFlow::Advance
                    }
                    Err(code) => self.fault(code),
                }
            }
            _ => self.fault(ExceptionCode::StackDifferentType),
        }
    }

    // Pops two same-type values and pushes the -1/0/1 comparison
    // outcome as an int. Unsigned comparison additionally accepts
    // pointers, so bytecode can test the nulls allocation failure
    // leaves behind.
    fn compare(&mut self, signed: bool) -> ControlFlow {
        let (ty, lhs_offset, rhs_offset) = match self.two_same_type() {
            Ok(operands) => operands,
            Err(code) => return self.fault(code),
        };
        let allowed = if signed {
            types::arithmetic()
        } else {
            types::arithmetic() | types::pointers()
        };
        let in_domain = ty
            .code
            .class()
            .map_or(false, |class| allowed.contains(class));
        if !in_domain {
            return self.domain_fault(ty);
        }

        let outcome = match ty.code {
            TypeCode::INT => {
                let lhs = take!(self, IntObject, lhs_offset).value;
                let rhs = take!(self, IntObject, rhs_offset).value;
                if signed {
                    rank(lhs as i32, rhs as i32)
                } else {
                    rank(lhs, rhs)
                }
            }
            TypeCode::LONG => {
                let lhs = take!(self, LongObject, lhs_offset).value;
                let rhs = take!(self, LongObject, rhs_offset).value;
                if signed {
                    rank(lhs as i64, rhs as i64)
                } else {
                    rank(lhs, rhs)
                }
            }
            TypeCode::DOUBLE => {
                let lhs = take!(self, DoubleObject, lhs_offset).value;
                let rhs = take!(self, DoubleObject, rhs_offset).value;
                rank(lhs, rhs)
            }
            TypeCode::POINTER | TypeCode::GC_POINTER => {
                let lhs = take!(self, PointerObject, lhs_offset).value;
                let rhs = take!(self, PointerObject, rhs_offset).value;
                rank(lhs, rhs)
            }
            _ => return self.fault(ExceptionCode::StackDifferentType),
        };

        self.stack.reduce(2 * ty.size as usize);
        self.stack.push(IntObject::new(outcome as u32));
        ControlFlow::Advance
    }

    // Control flow.

    fn jump(&mut self, operand: u32) -> ControlFlow {
        match self.current_instructions().label(operand) {
            Some(target) => ControlFlow::Branch(target),
            None => self.fault(ExceptionCode::LabelOutOfRange),
        }
    }

    // Pops the int a prior Cmp/ICmp produced and branches when its
    // sign satisfies the condition.
    fn jump_condition(&mut self, operand: u32, condition: fn(i32) -> bool) -> ControlFlow {
        let target = match self.current_instructions().label(operand) {
            Some(target) => target,
            None => return self.fault(ExceptionCode::LabelOutOfRange),
        };
        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        if ty.code != TypeCode::INT {
            return self.fault(ExceptionCode::StackDifferentType);
        }
        let value = take!(self, IntObject, self.stack.used()).value as i32;
        self.stack.reduce(mem::size_of::<IntObject>());
        if condition(value) {
            ControlFlow::Branch(target)
        } else {
            ControlFlow::Advance
        }
    }

    // Establishes a frame for function `operand`: the top `arity`
    // values become its first locals, deepest first.
    fn call(&mut self, operand: u32) -> ControlFlow {
        let index = operand as usize;
        let arity = match self.image.function(index) {
            Some(function) => function.arity(),
            None => return self.fault(ExceptionCode::FunctionOutOfRange),
        };

        let mut argument_offsets = Vec::with_capacity(arity);
        let mut offset = self.stack.used();
        for _ in 0..arity {
            let ty = match self.stack.type_at(offset) {
                Some(ty) => ty,
                None => return self.fault(ExceptionCode::StackEmpty),
            };
            argument_offsets.push(offset);
            offset -= ty.size as usize;
        }
        argument_offsets.reverse();

        let frame = StackFrame {
            ty: NONE_TYPE,
            stack_begin: offset,
            variable_begin: self.local_variables.len(),
            caller: Some(self.instruction_index),
            function: Some(index),
        };
        self.local_variables.extend(argument_offsets);
        self.call_stack.push(mem::replace(&mut self.frame, frame));
        self.depth += 1;
        ControlFlow::Branch(0)
    }

    // Tears the current frame down: pops the result if the function
    // declares one, truncates the value area and the variable table,
    // re-pushes the result, and resumes after the call site. The
    // resumed frame records the type the call produced. At the root
    // this records TopOfCallStack, the normal halt.
    fn ret(&mut self) -> ControlFlow {
        let function_index = match self.frame.function {
            Some(index) => index,
            None => return self.fault(ExceptionCode::TopOfCallStack),
        };
        let caller = match self.frame.caller {
            Some(index) => index,
            None => return self.fault(ExceptionCode::TopOfCallStack),
        };
        let has_result = match self.image.function(function_index) {
            Some(function) => function.has_result(),
            None => return self.fault(ExceptionCode::FunctionOutOfRange),
        };

        let mut result: Option<(Type, Vec<u8>)> = None;
        if has_result {
            let ty = match self.stack.top_type() {
                Some(ty) => ty,
                None => return self.fault(ExceptionCode::StackEmpty),
            };
            let bytes = match self.stack.read_bytes(self.stack.used(), ty.size as usize) {
                Some(bytes) => bytes,
                None => return self.fault(ExceptionCode::StackEmpty),
            };
            result = Some((ty, bytes));
        }

        self.stack.remove_to(self.frame.stack_begin);
        self.local_variables.truncate(self.frame.variable_begin);

        let mut result_ty = NONE_TYPE;
        if let Some((ty, bytes)) = result {
            result_ty = ty;
            if !self.stack.push_slice(&bytes) {
                return self.fault(ExceptionCode::StackOverflow);
            }
        }

        self.frame = match self.call_stack.pop() {
            Some(frame) => frame,
            None => return self.fault(ExceptionCode::TopOfCallStack),
        };
        self.frame.ty = result_ty;
        self.depth -= 1;
        ControlFlow::Branch(caller + 1)
    }

    // Conversions rewrite the top value in place; the numeric ones
    // truncate or extend, the pointer ones reinterpret an address.

    fn to_int(&mut self) -> ControlFlow {
        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let used = self.stack.used();
        let value = match ty.code {
            TypeCode::INT => return ControlFlow::Advance,
            TypeCode::LONG => take!(self, LongObject, used).value as u32,
            TypeCode::DOUBLE => take!(self, DoubleObject, used).value as i64 as u32,
            TypeCode::POINTER | TypeCode::GC_POINTER => {
                take!(self, PointerObject, used).value as u32
            }
            _ => return self.fault(ExceptionCode::StackDifferentType),
        };
        self.stack.reduce(ty.size as usize);
        self.stack.push(IntObject::new(value));
        ControlFlow::Advance
    }

    fn to_long(&mut self) -> ControlFlow {
        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let used = self.stack.used();
        let value = match ty.code {
            TypeCode::LONG => return ControlFlow::Advance,
            TypeCode::INT => u64::from(take!(self, IntObject, used).value),
            TypeCode::DOUBLE => take!(self, DoubleObject, used).value as i64 as u64,
            TypeCode::POINTER | TypeCode::GC_POINTER => {
                take!(self, PointerObject, used).value as u64
            }
            _ => return self.fault(ExceptionCode::StackDifferentType),
        };
        let target = mem::size_of::<LongObject>();
        if self.stack.free() + (ty.size as usize) < target {
            return self.fault(ExceptionCode::StackOverflow);
        }
        self.stack.reduce(ty.size as usize);
        self.stack.push(LongObject::new(value));
        ControlFlow::Advance
    }

    fn to_double(&mut self) -> ControlFlow {
        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let used = self.stack.used();
        let value = match ty.code {
            TypeCode::DOUBLE => return ControlFlow::Advance,
            TypeCode::INT => f64::from(take!(self, IntObject, used).value),
            TypeCode::LONG => take!(self, LongObject, used).value as f64,
            _ => return self.fault(ExceptionCode::StackDifferentType),
        };
        let target = mem::size_of::<DoubleObject>();
        if self.stack.free() + (ty.size as usize) < target {
            return self.fault(ExceptionCode::StackOverflow);
        }
        self.stack.reduce(ty.size as usize);
        self.stack.push(DoubleObject::new(value));
        ControlFlow::Advance
    }

    fn to_pointer(&mut self) -> ControlFlow {
        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        let used = self.stack.used();
        let value = match ty.code {
            TypeCode::POINTER => return ControlFlow::Advance,
            TypeCode::INT => take!(self, IntObject, used).value as usize,
            TypeCode::LONG => take!(self, LongObject, used).value as usize,
            TypeCode::GC_POINTER => take!(self, GCPointerObject, used).value,
            _ => return self.fault(ExceptionCode::StackDifferentType),
        };
        let target = mem::size_of::<PointerObject>();
        if self.stack.free() + (ty.size as usize) < target {
            return self.fault(ExceptionCode::StackOverflow);
        }
        self.stack.reduce(ty.size as usize);
        self.stack.push(PointerObject::new(value));
        ControlFlow::Advance
    }

    // Heap operations. Allocation failure is not a fault: the
    // instruction pushes a null pointer and bytecode tests for it.

    fn null(&mut self) -> ControlFlow {
        if self.stack.push(PointerObject::null()) {
            ControlFlow::Advance
        } else {
            self.fault(ExceptionCode::StackOverflow)
        }
    }

    fn gc_null(&mut self) -> ControlFlow {
        if self.stack.push(GCPointerObject::null()) {
            ControlFlow::Advance
        } else {
            self.fault(ExceptionCode::StackOverflow)
        }
    }

    fn new_object(&mut self, operand: u32) -> ControlFlow {
        let ty = match self.image.structures().type_from_code(TypeCode(operand)) {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::TypeOutOfRange),
        };
        if self.stack.free() < mem::size_of::<PointerObject>() {
            return self.fault(ExceptionCode::StackOverflow);
        }

        match self.heap.allocate(ty.size as usize) {
            Some(address) => {
                self.initialize_object(ty, address);
                self.stack.push(PointerObject::new(address));
            }
            None => {
                self.stack.push(PointerObject::null());
            }
        }
        ControlFlow::Advance
    }

    fn gc_new(&mut self, operand: u32) -> ControlFlow {
        let ty = match self.image.structures().type_from_code(TypeCode(operand)) {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::TypeOutOfRange),
        };
        if self.stack.free() < mem::size_of::<GCPointerObject>() {
            return self.fault(ExceptionCode::StackOverflow);
        }

        let roots = Roots {
            stack: &self.stack,
            local_variables: &self.local_variables,
        };
        match self.heap.allocate_managed(roots, ty.size as usize) {
            Some(address) => {
                self.initialize_object(ty, address);
                self.stack.push(GCPointerObject::new(address));
            }
            None => {
                self.stack.push(GCPointerObject::null());
            }
        }
        ControlFlow::Advance
    }

    fn delete(&mut self) -> ControlFlow {
        if self.is_local_variable() {
            return self.fault(ExceptionCode::StackEmpty);
        }
        let ty = match self.stack.top_type() {
            Some(ty) => ty,
            None => return self.fault(ExceptionCode::StackEmpty),
        };
        if ty.code != TypeCode::POINTER {
            return self.fault(ExceptionCode::NotPointer);
        }
        let address = take!(self, PointerObject, self.stack.used()).value;
        if address != 0 && !self.heap.deallocate(address) {
            return self.fault(ExceptionCode::UnknownAddress);
        }
        self.stack.reduce(mem::size_of::<PointerObject>());
        ControlFlow::Advance
    }

    // The dispatch table.

    fn dispatch(&mut self, op: Opcode) -> ControlFlow {
        match op {
            Opcode::Push(operand) => self.push_constant(operand),
            Opcode::PushStructure(operand) => self.push_structure(operand),
            Opcode::Pop => self.pop(),
            Opcode::Load(operand) => self.load_local(operand),
            Opcode::Store(operand) => self.store(operand),
            Opcode::Lea(operand) => self.lea(operand),
            Opcode::FLea(operand) => self.flea(operand),
            Opcode::TLoad => self.tload(),
            Opcode::TStore => self.tstore(),
            Opcode::Copy => self.copy(),
            Opcode::Swap => self.swap(),

            Opcode::Add => self.binary_op(
                |a, b| Ok(a.wrapping_add(b)),
                |a, b| Ok(a.wrapping_add(b)),
                |a, b| Ok(a + b),
            ),
            Opcode::Sub => self.binary_op(
                |a, b| Ok(a.wrapping_sub(b)),
                |a, b| Ok(a.wrapping_sub(b)),
                |a, b| Ok(a - b),
            ),
            Opcode::Mul => self.binary_op(
                |a, b| Ok(a.wrapping_mul(b)),
                |a, b| Ok(a.wrapping_mul(b)),
                |a, b| Ok(a * b),
            ),
            Opcode::IMul => self.binary_op(
                |a, b| Ok((a as i32).wrapping_mul(b as i32) as u32),
                |a, b| Ok((a as i64).wrapping_mul(b as i64) as u64),
                |a, b| Ok(a * b),
            ),
            Opcode::Div => self.binary_op(
                |a, b| {
                    if b == 0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok(a / b)
                    }
                },
                |a, b| {
                    if b == 0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok(a / b)
                    }
                },
                |a, b| {
                    if b == 0.0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok(a / b)
                    }
                },
            ),
            Opcode::IDiv => self.binary_op(
                |a, b| {
                    if b == 0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok((a as i32).wrapping_div(b as i32) as u32)
                    }
                },
                |a, b| {
                    if b == 0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok((a as i64).wrapping_div(b as i64) as u64)
                    }
                },
                |a, b| {
                    if b == 0.0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok(a / b)
                    }
                },
            ),
            Opcode::Mod => self.binary_op(
                |a, b| {
                    if b == 0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok(a % b)
                    }
                },
                |a, b| {
                    if b == 0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok(a % b)
                    }
                },
                |_, _| Err(ExceptionCode::StackDifferentType),
            ),
            Opcode::IMod => self.binary_op(
                |a, b| {
                    if b == 0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok((a as i32).wrapping_rem(b as i32) as u32)
                    }
                },
                |a, b| {
                    if b == 0 {
                        Err(ExceptionCode::DivideByZero)
                    } else {
                        Ok((a as i64).wrapping_rem(b as i64) as u64)
                    }
                },
                |_, _| Err(ExceptionCode::StackDifferentType),
            ),
            Opcode::Neg => self.unary_op(
                |v| Ok((v as i32).wrapping_neg() as u32),
                |v| Ok((v as i64).wrapping_neg() as u64),
                |v| Ok(-v),
            ),
            Opcode::Inc => self.unary_op(
                |v| Ok(v.wrapping_add(1)),
                |v| Ok(v.wrapping_add(1)),
                |v| Ok(v + 1.0),
            ),
            Opcode::Dec => self.unary_op(
                |v| Ok(v.wrapping_sub(1)),
                |v| Ok(v.wrapping_sub(1)),
                |v| Ok(v - 1.0),
            ),

            Opcode::And => self.binary_op(
                |a, b| Ok(a & b),
                |a, b| Ok(a & b),
                |_, _| Err(ExceptionCode::StackDifferentType),
            ),
            Opcode::Or => self.binary_op(
                |a, b| Ok(a | b),
                |a, b| Ok(a | b),
                |_, _| Err(ExceptionCode::StackDifferentType),
            ),
            Opcode::Xor => self.binary_op(
                |a, b| Ok(a ^ b),
                |a, b| Ok(a ^ b),
                |_, _| Err(ExceptionCode::StackDifferentType),
            ),
            Opcode::Not => self.unary_op(
                |v| Ok(!v),
                |v| Ok(!v),
                |_| Err(ExceptionCode::StackDifferentType),
            ),
            Opcode::Shl | Opcode::Sal => self.binary_op(
                |a, b| Ok(a.wrapping_shl(b)),
                |a, b| Ok(a.wrapping_shl(b as u32)),
                |_, _| Err(ExceptionCode::StackDifferentType),
            ),
            Opcode::Shr => self.binary_op(
                |a, b| Ok(a.wrapping_shr(b)),
                |a, b| Ok(a.wrapping_shr(b as u32)),
                |_, _| Err(ExceptionCode::StackDifferentType),
            ),
            Opcode::Sar => self.binary_op(
                |a, b| Ok((a as i32).wrapping_shr(b) as u32),
                |a, b| Ok((a as i64).wrapping_shr(b as u32) as u64),
                |_, _| Err(ExceptionCode::StackDifferentType),
            ),

            Opcode::Cmp => self.compare(false),
            Opcode::ICmp => self.compare(true),
            Opcode::Jmp(operand) => self.jump(operand),
            Opcode::Je(operand) => self.jump_condition(operand, |v| v == 0),
            Opcode::Jne(operand) => self.jump_condition(operand, |v| v != 0),
            Opcode::Ja(operand) => self.jump_condition(operand, |v| v > 0),
            Opcode::Jae(operand) => self.jump_condition(operand, |v| v >= 0),
            Opcode::Jb(operand) => self.jump_condition(operand, |v| v < 0),
            Opcode::Jbe(operand) => self.jump_condition(operand, |v| v <= 0),
            Opcode::Call(operand) => self.call(operand),
            Opcode::Ret => self.ret(),

            Opcode::ToI => self.to_int(),
            Opcode::ToL => self.to_long(),
            Opcode::ToD => self.to_double(),
            Opcode::ToP => self.to_pointer(),

            Opcode::Null => self.null(),
            Opcode::New(operand) => self.new_object(operand),
            Opcode::Delete => self.delete(),
            Opcode::GCNull => self.gc_null(),
            Opcode::GCNew(operand) => self.gc_new(operand),
        }
    }
}
