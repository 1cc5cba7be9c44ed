// File: src/object.rs
//
// Heap object variants. Every object lives in the `Heap` arena (see
// gc.rs) and is referred to elsewhere only by `ObjRef` handle — never by
// a raw Rust reference — so the GC remains the single owning authority
// the spec requires.

use std::collections::HashMap;

use crate::bytecode::Chunk;
use crate::gc::ObjRef;
use crate::table::Table;
use crate::value::Value;

/// A parameter's recorded name, for `help()` signature introspection.
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub name: String,
}

/// Structured metadata for a callable, used only by the `help` native —
/// it never influences dispatch.
#[derive(Debug, Clone)]
pub struct CallableSignature {
    pub name: String,
    pub parameters: Vec<ParamInfo>,
}

/// A compiled function: its own bytecode chunk, arity, and the number of
/// upvalues its closures must allocate. `name == None` marks the
/// synthetic top-level wrapper produced for a whole script.
#[derive(Debug, Clone)]
pub struct FunctionObj {
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub docstring: Option<ObjRef>,
}

impl FunctionObj {
    pub fn new() -> Self {
        FunctionObj { name: None, arity: 0, upvalue_count: 0, chunk: Chunk::new(), docstring: None }
    }
}

impl Default for FunctionObj {
    fn default() -> Self {
        Self::new()
    }
}

pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> Value;

/// A host-provided callable, registered into the VM's global namespace.
pub struct NativeFunctionObj {
    pub signature: CallableSignature,
    pub arity: u8,
    pub invoker: NativeFn,
}

impl std::fmt::Debug for NativeFunctionObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunctionObj").field("signature", &self.signature).finish()
    }
}

/// One originating slot of a closure's upvalue array: either a local of
/// the immediately enclosing function, or an upvalue already captured by
/// that enclosing function.
#[derive(Debug, Clone, Copy)]
pub struct UpvalueSource {
    pub is_local: bool,
    pub index: u8,
}

#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Either an open reference into a still-live stack slot, or a closed,
/// independently owned value.
#[derive(Debug, Clone)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

#[derive(Debug, Clone)]
pub struct ClassObj {
    pub name: ObjRef,
    pub methods: Table,
    pub superclass: Option<ObjRef>,
}

impl ClassObj {
    pub fn new(name: ObjRef) -> Self {
        ClassObj { name, methods: Table::new(), superclass: None }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table,
}

impl InstanceObj {
    pub fn new(class: ObjRef) -> Self {
        InstanceObj { class, fields: Table::new() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundMethodObj {
    pub receiver: ObjRef,
    pub method: ObjRef,
}

/// The native `list` class's backing storage: a dynamic array of Values.
#[derive(Debug, Clone, Default)]
pub struct ListObj {
    pub items: Vec<Value>,
}

/// The native `string` class's backing storage: an owned UTF-8 buffer,
/// distinct from the interned `Str` object used for literals/identifiers.
#[derive(Debug, Clone, Default)]
pub struct StringBufObj {
    pub contents: String,
}

/// The immutable, interned, UTF-8 string object. Two `Str` objects with
/// identical contents are never both alive — `Heap::intern` guarantees
/// pointer-equality doubles as content-equality.
#[derive(Debug, Clone)]
pub struct StrObj {
    pub value: Box<str>,
    pub hash: u64,
}

/// The tagged union of everything that can live on the heap.
#[derive(Debug)]
pub enum Object {
    Str(StrObj),
    Function(FunctionObj),
    NativeFunction(NativeFunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    List(ListObj),
    StringBuf(StringBufObj),
}

impl Object {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::Str(_) => "string",
            Object::Function(_) => "function",
            Object::NativeFunction(_) => "native function",
            Object::Closure(_) => "function",
            Object::Upvalue(_) => "upvalue",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "bound method",
            Object::List(_) => "list",
            Object::StringBuf(_) => "string",
        }
    }
}

/// FNV-1a over raw bytes, as specified for both the intern pool and the
/// open-addressed table's probe sequence.
pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Reverse index from native function name to its id, used to populate
/// globals at startup. Not part of the GC-managed heap.
pub type NativeRegistry = HashMap<&'static str, NativeFn>;
