/// Callable and coroutine-ish object kinds (§3.6).
use std::rc::Rc;

use crate::bytecode::{ExceptionTableEntry, LiteralConst, Op};
use crate::value::Value;

/// Per-closure-variable metadata: which enclosing function slot a nested
/// function captures, and whether it captures by the enclosing function's
/// own closure chain (an indirect capture) or one of its locals (direct).
#[derive(Debug, Clone)]
pub struct ClosureVarEntry {
    pub name: Rc<str>,
    pub from_parent_closure: bool,
    pub parent_index: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ClosureVarTable(pub Vec<ClosureVarEntry>);

#[derive(Debug, Clone, Default)]
pub struct DebugTable {
    pub name: Option<Rc<str>>,
    pub source_id: u32,
    /// Maps a bytecode offset to the source line that produced it.
    pub line_for_pc: Vec<(u32, u32)>,
}

impl DebugTable {
    pub fn line_for(&self, pc: u32) -> Option<u32> {
        self.line_for_pc.iter().rev().find(|(p, _)| *p <= pc).map(|(_, l)| *l)
    }
}

/// Compiled function body shared by every closure instantiated from the
/// same source declaration (§4.3).
pub struct FunctionDef {
    pub code: Vec<Op>,
    pub consts: Vec<LiteralConst>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub param_count: u32,
    /// When set, the last parameter collects every argument at or past
    /// `param_count - 1` into a fresh array rather than binding just one.
    pub has_rest_param: bool,
    pub local_count: u32,
    pub closure_vars: ClosureVarTable,
    pub debug: DebugTable,
    pub is_generator: bool,
    pub is_async: bool,
    pub is_arrow: bool,
    pub is_strict: bool,
    /// Function literals declared lexically inside this one. `Op::Closure`
    /// indexes here; the def tree itself is never mutated after compilation,
    /// so it's plain `Rc` rather than a GC-traced field.
    pub nested: Vec<Rc<FunctionDef>>,
    /// Number of distinct `ic_slot`s the compiler handed out for property
    /// access sites in this function; the VM sizes its cache table from it.
    pub ic_count: u32,
    /// `import` bindings this body declares (§4.9); resolved by the
    /// embedder against the `ModuleRegistry` before the body runs, not by
    /// any bytecode op.
    pub imports: ImportTable,
}

pub struct FunctionObject {
    /// A `Value::FunctionDef` referencing the shared `FunctionDef`.
    pub def: Value,
    /// One slot per entry in `def`'s `ClosureVarTable`, holding a
    /// `Value::ClosureVar` cell.
    pub closure_env: Vec<Value>,
    /// Set by `Function.prototype.bind`; `Value::undefined()` otherwise.
    pub bound_this: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    SuspendedStart,
    SuspendedYield,
    Executing,
    Completed,
}

pub struct GeneratorObject {
    /// A `Value::Function` referencing the generator's `FunctionObject`.
    pub function: Value,
    pub saved_stack: Vec<Value>,
    pub pc: u32,
    pub state: GeneratorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

pub struct PromiseObject {
    pub state: PromiseState,
    pub value: Option<Value>,
    /// Reaction jobs queued while still pending; drained by the microtask
    /// queue once the promise settles (§4.4/§5).
    pub on_fulfill: Vec<Value>,
    pub on_reject: Vec<Value>,
}

pub struct AsyncObject {
    /// A `Value::Function` referencing the async function's `FunctionObject`.
    pub function: Value,
    pub saved_stack: Vec<Value>,
    pub pc: u32,
    pub state: GeneratorState,
    /// The promise returned to the caller on first invocation.
    pub result_promise: Value,
}

/// Exported name paired with its index into the array the module body's
/// synthetic `Return` produces (§3.6, §4.9) — `compile_module` emits a tail
/// sequence that loads every exported local and packs them into one array in
/// declaration order, so evaluating a module needs no frame-peeking beyond
/// the ordinary completion value `run_program` already returns. `import`
/// resolves to a `Value::ExportVar` cell wrapping the array element at this
/// index, via `ModuleObject.export_slots`.
#[derive(Debug, Clone, Default)]
pub struct ExportVarTable(pub Vec<(Rc<str>, u32)>);

/// What an `import` specifier binds to in the importing scope (§4.9).
#[derive(Debug, Clone)]
pub enum ImportBindingKind {
    /// `import { name as local } from "spec"`.
    Named(Rc<str>),
    /// `import local from "spec"`.
    Default,
    /// `import * as local from "spec"`.
    Namespace,
}

/// One `import` binding: which module it comes from, which of its exports
/// it names, and which local slot in this body receives the value.
#[derive(Debug, Clone)]
pub struct ImportEntry {
    pub specifier: Rc<str>,
    pub binding: ImportBindingKind,
    pub local_slot: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ImportTable(pub Vec<ImportEntry>);

pub struct ModuleDef {
    pub code: Vec<Op>,
    pub consts: Vec<LiteralConst>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub local_count: u32,
    pub exports: ExportVarTable,
    pub imports: ImportTable,
    pub debug: DebugTable,
    /// Function literals declared lexically inside the module body, mirroring
    /// `FunctionDef::nested` — `Op::Closure` indexes here.
    pub nested: Vec<Rc<FunctionDef>>,
    pub ic_count: u32,
}

pub struct ModuleObject {
    /// A `Value::ModuleDef` referencing the shared `ModuleDef`.
    pub def: Value,
    /// One slot per entry in `def.exports`, holding a `Value::ExportVar` cell.
    pub export_slots: Vec<Value>,
    pub evaluated: bool,
}

pub struct ConstructorObject {
    /// A `Value::Function` or `Value::CppFunction` invoked by `new`.
    pub function: Value,
    pub prototype: Value,
    pub name: Rc<str>,
    /// The superclass constructor for `extends`, or `Value::undefined()`.
    /// `super(...)`/`super.x` inside the constructor body resolve against
    /// this rather than a lexical lookup.
    pub superclass: Value,
}

pub struct CppModuleObject {
    pub exports: Vec<(Rc<str>, Value)>,
}

/// A native function: `fn(vm, this, args) -> Value`, matching the embedder
/// ABI (§6.1). `this` and the arguments are already resolved off the VM
/// stack by the caller; intrinsics reach the heap/shapes/globals they need
/// directly off `Vm` rather than through a separate embedder-facing type.
pub type NativeFn = Rc<dyn Fn(&mut crate::vm::Vm, &Value, &[Value]) -> Value>;
