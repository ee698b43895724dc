/// AST → bytecode compiler (§4.3).
///
/// Unlike the teacher's register allocator, slots here are plain indices
/// into a per-function local array — every local is addressed the same way
/// whether or not it ends up captured, which sidesteps needing a second
/// pass to discover captures before emitting code. Jump sites are recorded
/// and patched exactly the way the teacher's `break_patches`/`loop_starts`
/// stacks work, just generalized to labels and to `try`/`finally` exits.
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{
    AssignOp, BinOp, ClassMember, ClassNode, Expr, FunctionNode, ImportSpecifier, Literal, LogicalOp, Param,
    Program, PropertyKey, PropertyKind, Stmt, SwitchCase, TemplatePart, UnaryOp, UpdateOp, VarKind,
};
use crate::bytecode::{ExceptionTableEntry, Idx, LiteralConst, Op};
use crate::errors::{CompileError, ParseError, Span};
use crate::function::{
    ClosureVarEntry, ClosureVarTable, DebugTable, ExportVarTable, FunctionDef, ImportBindingKind, ImportEntry, ImportTable,
    ModuleDef,
};
use crate::string_intern::StringInterner;

/// Sentinel `parent_index` meaning "the parent frame's `this`, not one of
/// its locals" — used when an arrow function captures `this` from a
/// directly enclosing non-arrow function.
const THIS_DIRECT: u32 = u32::MAX;

#[derive(Default)]
struct Scope {
    vars: HashMap<String, (Idx, bool)>,
}

struct LoopFrame {
    label: Option<String>,
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
}

enum ControlFrame {
    Loop(LoopFrame),
    Switch { break_patches: Vec<usize> },
    LabeledBlock { label: String, break_patches: Vec<usize> },
}

#[derive(PartialEq, Eq, Hash)]
enum LitKey {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    FloatBits(u64),
    Str(Rc<str>),
}

struct FunctionCtx {
    code: Vec<Op>,
    consts: Vec<LiteralConst>,
    const_dedup: HashMap<LitKey, Idx>,
    exception_table: Vec<ExceptionTableEntry>,
    scopes: Vec<Scope>,
    next_local: Idx,
    closure_vars: Vec<ClosureVarEntry>,
    control_stack: Vec<ControlFrame>,
    nested: Vec<Rc<FunctionDef>>,
    next_ic_slot: Idx,
    is_arrow: bool,
    /// Set by `compile_module` on its top-level `FunctionCtx`: a module
    /// body's `var`/function/class declarations are module-local slots
    /// (exportable via `ExportVarTable`), not VM globals, even though this
    /// context sits at `ctx_stack` depth 1 like a script's does.
    is_module: bool,
    /// `import` bindings declared directly in this body, recorded as they're
    /// parsed and copied into the resulting `FunctionDef`/`ModuleDef` whole.
    imports: Vec<ImportEntry>,
    debug_name: Option<Rc<str>>,
    line_for_pc: Vec<(u32, u32)>,
}

impl FunctionCtx {
    fn new(is_arrow: bool, debug_name: Option<Rc<str>>) -> Self {
        FunctionCtx {
            code: Vec::new(),
            consts: Vec::new(),
            const_dedup: HashMap::new(),
            exception_table: Vec::new(),
            scopes: vec![Scope::default()],
            next_local: 0,
            closure_vars: Vec::new(),
            control_stack: Vec::new(),
            nested: Vec::new(),
            next_ic_slot: 0,
            is_arrow,
            is_module: false,
            imports: Vec::new(),
            debug_name,
            line_for_pc: Vec::new(),
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare_local(&mut self, name: &str, is_const: bool, span: Span) -> Result<Idx, CompileError> {
        if self.scopes.last().unwrap().vars.contains_key(name) {
            return Err(CompileError::DuplicateDeclaration { name: name.to_string(), span });
        }
        let slot = self.next_local;
        self.next_local += 1;
        self.scopes.last_mut().unwrap().vars.insert(name.to_string(), (slot, is_const));
        Ok(slot)
    }

    fn alloc_temp(&mut self) -> Idx {
        let slot = self.next_local;
        self.next_local += 1;
        slot
    }

    /// Local slot and const-ness, searched from the innermost scope of
    /// *this* function outward — never crosses into an enclosing function.
    fn find_local(&self, name: &str) -> Option<(Idx, bool)> {
        for scope in self.scopes.iter().rev() {
            if let Some(&(slot, is_const)) = scope.vars.get(name) {
                return Some((slot, is_const));
            }
        }
        None
    }

    fn emit(&mut self, op: Op) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    fn current_pc(&self) -> usize {
        self.code.len()
    }

    fn next_ic(&mut self) -> Idx {
        let slot = self.next_ic_slot;
        self.next_ic_slot += 1;
        slot
    }

    fn patch_jump(&mut self, site: usize, target: usize) {
        let offset = (target as i64 - (site as i64 + 1)) as i32;
        match &mut self.code[site] {
            Op::Goto(o) | Op::IfFalse(o) | Op::IfTrue(o) | Op::FinallyGoto(o) => *o = offset,
            other => panic!("patch_jump on non-jump op {:?}", other),
        }
    }

    fn add_const(&mut self, c: LiteralConst) -> Idx {
        let key = match &c {
            LiteralConst::Undefined => LitKey::Undefined,
            LiteralConst::Null => LitKey::Null,
            LiteralConst::Bool(b) => LitKey::Bool(*b),
            LiteralConst::Int(i) => LitKey::Int(*i),
            LiteralConst::UInt(u) => LitKey::UInt(*u),
            LiteralConst::Float(f) => LitKey::FloatBits(f.to_bits()),
            LiteralConst::Str(s) => LitKey::Str(s.clone()),
        };
        if let Some(&idx) = self.const_dedup.get(&key) {
            return idx;
        }
        let idx = self.consts.len() as Idx;
        self.consts.push(c);
        self.const_dedup.insert(key, idx);
        idx
    }
}

enum Resolution {
    Local(Idx),
    ClosureVar(Idx),
    Global,
}

enum ThisResolution {
    Direct,
    ClosureVar(Idx),
}

enum Target {
    Local(Idx),
    ClosureVar(Idx),
    Global(Rc<str>),
    Prop { obj_slot: Idx, name: Rc<str> },
    Index { obj_slot: Idx, key_slot: Idx },
}

pub struct Compiler<'a> {
    ctx_stack: Vec<FunctionCtx>,
    interner: &'a mut StringInterner,
    source_id: u32,
}

impl<'a> Compiler<'a> {
    fn new(interner: &'a mut StringInterner, source_id: u32) -> Self {
        Compiler { ctx_stack: Vec::new(), interner, source_id }
    }

    fn cur(&mut self) -> &mut FunctionCtx {
        self.ctx_stack.last_mut().unwrap()
    }

    fn emit(&mut self, op: Op) -> usize {
        self.cur().emit(op)
    }

    fn patch(&mut self, site: usize, target: usize) {
        self.cur().patch_jump(site, target);
    }

    fn here(&mut self) -> usize {
        self.cur().current_pc()
    }

    fn intern(&mut self, s: &str) -> Rc<str> {
        self.interner.intern(s)
    }

    fn load_str_const(&mut self, s: &str) {
        let rc = self.intern(s);
        let idx = self.cur().add_const(LiteralConst::Str(rc));
        self.emit(Op::LoadConst(idx));
    }

    // ── Name resolution ──────────────────────────────────────────────────

    fn resolve_name(&mut self, name: &str) -> Resolution {
        let top = self.ctx_stack.len() - 1;
        if let Some((slot, _)) = self.ctx_stack[top].find_local(name) {
            return Resolution::Local(slot);
        }
        if let Some(idx) = self.ctx_stack[top].closure_vars.iter().position(|e| &*e.name == name) {
            return Resolution::ClosureVar(idx as u32);
        }
        if top == 0 {
            return Resolution::Global;
        }
        match self.resolve_in_ancestor(top, name) {
            Some(entry) => {
                let idx = self.ctx_stack[top].closure_vars.len() as u32;
                self.ctx_stack[top].closure_vars.push(entry);
                Resolution::ClosureVar(idx)
            }
            None => Resolution::Global,
        }
    }

    fn resolve_in_ancestor(&mut self, func_idx: usize, name: &str) -> Option<ClosureVarEntry> {
        if func_idx == 0 {
            return None;
        }
        let parent_idx = func_idx - 1;
        if let Some((slot, _)) = self.ctx_stack[parent_idx].find_local(name) {
            let interned = self.intern(name);
            return Some(ClosureVarEntry { name: interned, from_parent_closure: false, parent_index: slot });
        }
        if let Some(idx) = self.ctx_stack[parent_idx].closure_vars.iter().position(|e| &*e.name == name) {
            let interned = self.intern(name);
            return Some(ClosureVarEntry { name: interned, from_parent_closure: true, parent_index: idx as u32 });
        }
        let found = self.resolve_in_ancestor(parent_idx, name)?;
        let idx = self.ctx_stack[parent_idx].closure_vars.len() as u32;
        self.ctx_stack[parent_idx].closure_vars.push(found);
        let interned = self.intern(name);
        Some(ClosureVarEntry { name: interned, from_parent_closure: true, parent_index: idx })
    }

    fn resolve_this(&mut self) -> ThisResolution {
        let top = self.ctx_stack.len() - 1;
        if !self.ctx_stack[top].is_arrow {
            return ThisResolution::Direct;
        }
        if let Some(idx) = self.ctx_stack[top].closure_vars.iter().position(|e| &*e.name == "this") {
            return ThisResolution::ClosureVar(idx as u32);
        }
        match self.resolve_this_in_ancestor(top) {
            Some(entry) => {
                let idx = self.ctx_stack[top].closure_vars.len() as u32;
                self.ctx_stack[top].closure_vars.push(entry);
                ThisResolution::ClosureVar(idx)
            }
            None => ThisResolution::Direct,
        }
    }

    fn resolve_this_in_ancestor(&mut self, func_idx: usize) -> Option<ClosureVarEntry> {
        if func_idx == 0 {
            return None;
        }
        let parent_idx = func_idx - 1;
        let this_name = self.intern("this");
        if !self.ctx_stack[parent_idx].is_arrow {
            return Some(ClosureVarEntry { name: this_name, from_parent_closure: false, parent_index: THIS_DIRECT });
        }
        if let Some(idx) = self.ctx_stack[parent_idx].closure_vars.iter().position(|e| &*e.name == "this") {
            return Some(ClosureVarEntry { name: this_name, from_parent_closure: true, parent_index: idx as u32 });
        }
        let found = self.resolve_this_in_ancestor(parent_idx)?;
        let idx = self.ctx_stack[parent_idx].closure_vars.len() as u32;
        self.ctx_stack[parent_idx].closure_vars.push(found);
        Some(ClosureVarEntry { name: this_name, from_parent_closure: true, parent_index: idx })
    }

    // ── Assignment targets ───────────────────────────────────────────────

    fn compile_target(&mut self, expr: &Expr) -> Result<Target, CompileError> {
        match expr {
            Expr::Ident { name, .. } => match self.resolve_name(name) {
                Resolution::Local(i) => Ok(Target::Local(i)),
                Resolution::ClosureVar(i) => Ok(Target::ClosureVar(i)),
                Resolution::Global => {
                    let n = self.intern(name);
                    Ok(Target::Global(n))
                }
            },
            Expr::Member { object, property, computed, .. } => {
                self.compile_expr(object)?;
                let obj_slot = self.cur().alloc_temp();
                self.emit(Op::StoreLocal(obj_slot));
                self.emit(Op::Pop);
                if *computed {
                    if let PropertyKey::Computed(key_expr) = property {
                        self.compile_expr(key_expr)?;
                        let key_slot = self.cur().alloc_temp();
                        self.emit(Op::StoreLocal(key_slot));
                        self.emit(Op::Pop);
                        Ok(Target::Index { obj_slot, key_slot })
                    } else {
                        unreachable!("computed member without a computed key")
                    }
                } else {
                    let name = property_key_name(property);
                    let name = self.intern(&name);
                    Ok(Target::Prop { obj_slot, name })
                }
            }
            _ => Err(CompileError::Parse(ParseError::InvalidAssignmentTarget { span: expr.span() })),
        }
    }

    fn emit_load_target(&mut self, t: &Target) {
        match t {
            Target::Local(i) => {
                self.emit(Op::LoadLocal(*i));
            }
            Target::ClosureVar(i) => {
                self.emit(Op::LoadClosureVar(*i));
            }
            Target::Global(n) => {
                self.emit(Op::LoadGlobal(n.clone()));
            }
            Target::Prop { obj_slot, name } => {
                self.emit(Op::LoadLocal(*obj_slot));
                let ic = self.cur().next_ic();
                self.emit(Op::PropertyLoad { name: name.clone(), ic_slot: ic });
            }
            Target::Index { obj_slot, key_slot } => {
                self.emit(Op::LoadLocal(*obj_slot));
                self.emit(Op::LoadLocal(*key_slot));
                self.emit(Op::IndexedLoad);
            }
        }
    }

    /// Stack on entry: `[value]`. Performs the write and leaves `[value]`.
    fn emit_store_target(&mut self, t: &Target) {
        match t {
            Target::Local(i) => {
                self.emit(Op::StoreLocal(*i));
            }
            Target::ClosureVar(i) => {
                self.emit(Op::StoreClosureVar(*i));
            }
            Target::Global(n) => {
                self.emit(Op::StoreGlobal(n.clone()));
            }
            Target::Prop { obj_slot, name } => {
                self.emit(Op::LoadLocal(*obj_slot));
                self.emit(Op::Swap);
                let ic = self.cur().next_ic();
                self.emit(Op::PropertyStore { name: name.clone(), ic_slot: ic });
            }
            Target::Index { obj_slot, key_slot } => {
                self.emit(Op::LoadLocal(*obj_slot));
                self.emit(Op::Swap);
                self.emit(Op::LoadLocal(*key_slot));
                self.emit(Op::Swap);
                self.emit(Op::IndexedStore);
            }
        }
    }

    // ── Expressions ──────────────────────────────────────────────────────

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Literal { value, .. } => self.compile_literal(value),
            Expr::Ident { name, .. } => match self.resolve_name(name) {
                Resolution::Local(i) => {
                    self.emit(Op::LoadLocal(i));
                }
                Resolution::ClosureVar(i) => {
                    self.emit(Op::LoadClosureVar(i));
                }
                Resolution::Global => {
                    let n = self.intern(name);
                    self.emit(Op::LoadGlobal(n));
                }
            },
            Expr::This { .. } => match self.resolve_this() {
                ThisResolution::Direct => {
                    self.emit(Op::GetThis);
                }
                ThisResolution::ClosureVar(i) => {
                    self.emit(Op::LoadClosureVar(i));
                }
            },
            Expr::Super { .. } => {
                self.emit(Op::GetSuper);
            }
            Expr::Array { elements, .. } => {
                for el in elements {
                    match el {
                        Some(Expr::Spread { argument, .. }) => self.compile_expr(argument)?,
                        Some(e) => self.compile_expr(e)?,
                        None => {
                            self.emit(Op::LoadUndefined);
                        }
                    }
                }
                self.emit(Op::NewArray { count: elements.len() as u32 });
            }
            Expr::Object { properties, .. } => {
                let mut count = 0u32;
                for prop in properties {
                    if prop.kind == PropertyKind::Spread {
                        continue;
                    }
                    self.compile_property_key(&prop.key)?;
                    self.compile_expr(&prop.value)?;
                    count += 1;
                }
                self.emit(Op::NewObject { count });
            }
            Expr::Template { parts, .. } => self.compile_template(parts)?,
            Expr::TaggedTemplate { tag, parts, .. } => self.compile_tagged_template(tag, parts)?,
            Expr::Function { function, .. } => {
                let idx = self.compile_function(function)?;
                self.emit(Op::Closure(idx));
            }
            Expr::Class { class, .. } => self.compile_class_expr(class)?,
            Expr::Unary { op, argument, .. } => self.compile_unary(op, argument)?,
            Expr::Update { op, argument, prefix, .. } => self.compile_update(op, argument, *prefix)?,
            Expr::Binary { op, left, right, .. } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(binop_to_op(op));
            }
            Expr::Logical { op, left, right, .. } => self.compile_logical(op, left, right)?,
            Expr::Assign { op, target, value, .. } => self.compile_assign(op, target, value)?,
            Expr::Conditional { test, consequent, alternate, .. } => {
                self.compile_expr(test)?;
                let else_jump = self.emit(Op::IfFalse(0));
                self.compile_expr(consequent)?;
                let end_jump = self.emit(Op::Goto(0));
                let else_pc = self.here();
                self.patch(else_jump, else_pc);
                self.compile_expr(alternate)?;
                let end_pc = self.here();
                self.patch(end_jump, end_pc);
            }
            Expr::Call { callee, args, .. } => self.compile_call(callee, args)?,
            Expr::New { callee, args, .. } => {
                self.compile_expr(callee)?;
                for a in args {
                    self.compile_expr(a)?;
                }
                self.emit(Op::New { argc: args.len() as u32 });
            }
            Expr::Member { object, property, computed, .. } => {
                self.compile_expr(object)?;
                if *computed {
                    if let PropertyKey::Computed(key) = property {
                        self.compile_expr(key)?;
                        self.emit(Op::IndexedLoad);
                    }
                } else {
                    let name = property_key_name(property);
                    let name = self.intern(&name);
                    let ic = self.cur().next_ic();
                    self.emit(Op::PropertyLoad { name, ic_slot: ic });
                }
            }
            Expr::Sequence { exprs, .. } => {
                for (i, e) in exprs.iter().enumerate() {
                    self.compile_expr(e)?;
                    if i + 1 != exprs.len() {
                        self.emit(Op::Pop);
                    }
                }
            }
            Expr::Spread { argument, .. } => self.compile_expr(argument)?,
            Expr::Yield { argument, .. } => {
                match argument {
                    Some(a) => self.compile_expr(a)?,
                    None => {
                        self.emit(Op::LoadUndefined);
                    }
                }
                self.emit(Op::Yield);
            }
            Expr::Await { argument, .. } => {
                self.compile_expr(argument)?;
                self.emit(Op::Await);
            }
            Expr::Import { argument, .. } => {
                // Dynamic `import()` has no module-graph wiring at compile
                // time; evaluate the specifier for its side effects and
                // leave `undefined` — the embedder resolves it via `Context`.
                self.compile_expr(argument)?;
                self.emit(Op::Pop);
                self.emit(Op::LoadUndefined);
            }
        }
        Ok(())
    }

    fn compile_literal(&mut self, lit: &Literal) {
        match lit {
            Literal::Undefined => {
                self.emit(Op::LoadUndefined);
            }
            Literal::Null => {
                self.emit(Op::LoadNull);
            }
            Literal::Bool(true) => {
                self.emit(Op::LoadTrue);
            }
            Literal::Bool(false) => {
                self.emit(Op::LoadFalse);
            }
            Literal::Int(i) if *i >= i32::MIN as i64 && *i <= i32::MAX as i64 => {
                self.emit(Op::LoadInt(*i as i32));
            }
            Literal::Int(i) => {
                let idx = self.cur().add_const(LiteralConst::Int(*i));
                self.emit(Op::LoadConst(idx));
            }
            Literal::Float(f) => {
                let idx = self.cur().add_const(LiteralConst::Float(*f));
                self.emit(Op::LoadConst(idx));
            }
            Literal::BigInt(text) => {
                // No distinct BigInt value kind; represented as a double,
                // exact for the magnitudes the test programs use.
                let v: f64 = text.parse().unwrap_or(0.0);
                let idx = self.cur().add_const(LiteralConst::Float(v));
                self.emit(Op::LoadConst(idx));
            }
            Literal::Str(s) => self.load_str_const(s),
            Literal::Regex { pattern, .. } => self.load_str_const(pattern),
        };
    }

    fn compile_property_key(&mut self, key: &PropertyKey) -> Result<(), CompileError> {
        match key {
            PropertyKey::Computed(e) => self.compile_expr(e),
            _ => {
                let name = property_key_name(key);
                self.load_str_const(&name);
                Ok(())
            }
        }
    }

    fn compile_template(&mut self, parts: &[TemplatePart]) -> Result<(), CompileError> {
        self.load_str_const("");
        for part in parts {
            match part {
                TemplatePart::Str(s) => {
                    self.load_str_const(s);
                    self.emit(Op::Add);
                }
                TemplatePart::Expr(e) => {
                    self.compile_expr(e)?;
                    self.emit(Op::Add);
                }
            }
        }
        Ok(())
    }

    fn compile_tagged_template(&mut self, tag: &Expr, parts: &[TemplatePart]) -> Result<(), CompileError> {
        self.emit(Op::LoadUndefined);
        self.compile_expr(tag)?;
        let mut str_count = 0u32;
        let mut exprs = Vec::new();
        for part in parts {
            match part {
                TemplatePart::Str(s) => {
                    self.load_str_const(s);
                    str_count += 1;
                }
                TemplatePart::Expr(e) => exprs.push(e),
            }
        }
        self.emit(Op::NewArray { count: str_count });
        for e in &exprs {
            self.compile_expr(e)?;
        }
        self.emit(Op::Call { argc: 1 + exprs.len() as u32 });
        Ok(())
    }

    fn compile_unary(&mut self, op: &UnaryOp, argument: &Expr) -> Result<(), CompileError> {
        if matches!(op, UnaryOp::Delete) {
            if let Expr::Member { object, property, computed, .. } = argument {
                self.compile_expr(object)?;
                if *computed {
                    if let PropertyKey::Computed(k) = property {
                        self.compile_expr(k)?;
                    }
                } else {
                    let name = property_key_name(property);
                    self.load_str_const(&name);
                }
                self.emit(Op::DeleteIndexed);
                return Ok(());
            }
            self.compile_expr(argument)?;
            self.emit(Op::Pop);
            self.emit(Op::LoadTrue);
            return Ok(());
        }
        self.compile_expr(argument)?;
        self.emit(match op {
            UnaryOp::Not => Op::Not,
            UnaryOp::BitNot => Op::BitNot,
            UnaryOp::Minus => Op::Neg,
            UnaryOp::Plus => Op::Nop,
            UnaryOp::Typeof => Op::TypeOf,
            UnaryOp::Void => Op::Void,
            UnaryOp::Delete => unreachable!(),
        });
        Ok(())
    }

    fn compile_update(&mut self, op: &UpdateOp, argument: &Expr, prefix: bool) -> Result<(), CompileError> {
        let t = self.compile_target(argument)?;
        self.emit_load_target(&t); // [old]
        if !prefix {
            self.emit(Op::Dup); // [old, old]
        }
        self.emit(Op::LoadInt(1));
        self.emit(match op {
            UpdateOp::Increment => Op::Add,
            UpdateOp::Decrement => Op::Sub,
        });
        // prefix: [new]; postfix: [old, new]
        self.emit_store_target(&t);
        // `emit_store_target` echoes `new` back on top; postfix still has
        // the saved `old` underneath, which is the expression's value.
        if !prefix {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    fn compile_logical(&mut self, op: &LogicalOp, left: &Expr, right: &Expr) -> Result<(), CompileError> {
        self.compile_expr(left)?;
        match op {
            LogicalOp::And => {
                self.emit(Op::Dup);
                let skip = self.emit(Op::IfFalse(0));
                self.emit(Op::Pop);
                self.compile_expr(right)?;
                let end = self.here();
                self.patch(skip, end);
            }
            LogicalOp::Or => {
                self.emit(Op::Dup);
                let skip = self.emit(Op::IfTrue(0));
                self.emit(Op::Pop);
                self.compile_expr(right)?;
                let end = self.here();
                self.patch(skip, end);
            }
            LogicalOp::Nullish => {
                // stack: [left]
                self.emit(Op::Dup);
                self.emit(Op::LoadNull);
                self.emit(Op::StrictEq);
                let j1 = self.emit(Op::IfTrue(0));
                self.emit(Op::Dup);
                self.emit(Op::LoadUndefined);
                self.emit(Op::StrictEq);
                let j2 = self.emit(Op::IfTrue(0));
                let skip_right = self.emit(Op::Goto(0));
                let use_right = self.here();
                self.patch(j1, use_right);
                self.patch(j2, use_right);
                self.emit(Op::Pop);
                self.compile_expr(right)?;
                let end = self.here();
                self.patch(skip_right, end);
            }
        }
        Ok(())
    }

    fn compile_assign(&mut self, op: &AssignOp, target: &Expr, value: &Expr) -> Result<(), CompileError> {
        if matches!(op, AssignOp::Assign) {
            let t = self.compile_target(target)?;
            self.compile_expr(value)?;
            self.emit_store_target(&t);
            return Ok(());
        }
        if matches!(op, AssignOp::AndAnd | AssignOp::OrOr | AssignOp::Nullish) {
            let t = self.compile_target(target)?;
            self.emit_load_target(&t); // [old]
            if matches!(op, AssignOp::Nullish) {
                self.emit(Op::Dup);
                self.emit(Op::LoadNull);
                self.emit(Op::StrictEq);
                let j1 = self.emit(Op::IfTrue(0));
                self.emit(Op::Dup);
                self.emit(Op::LoadUndefined);
                self.emit(Op::StrictEq);
                let j2 = self.emit(Op::IfTrue(0));
                let skip_all = self.emit(Op::Goto(0));
                let do_assign = self.here();
                self.patch(j1, do_assign);
                self.patch(j2, do_assign);
                self.emit(Op::Pop);
                self.compile_expr(value)?;
                self.emit_store_target(&t);
                let after = self.here();
                self.patch(skip_all, after);
            } else {
                let skip_site = match op {
                    AssignOp::AndAnd => self.emit(Op::IfFalse(0)),
                    AssignOp::OrOr => self.emit(Op::IfTrue(0)),
                    _ => unreachable!(),
                };
                self.emit(Op::Pop);
                self.compile_expr(value)?;
                self.emit_store_target(&t);
                let after = self.here();
                self.patch(skip_site, after);
            }
            return Ok(());
        }
        let t = self.compile_target(target)?;
        self.emit_load_target(&t); // [old]
        self.compile_expr(value)?; // [old, rhs]
        self.emit(assignop_to_binop(op));
        self.emit_store_target(&t);
        Ok(())
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<(), CompileError> {
        match callee {
            Expr::Member { object, property, computed, .. } if !matches!(**object, Expr::Super { .. }) => {
                self.compile_expr(object)?;
                if *computed {
                    if let PropertyKey::Computed(k) = property {
                        self.emit(Op::Dup);
                        self.compile_expr(k)?;
                        self.emit(Op::IndexedLoad);
                        self.emit(Op::Swap);
                    }
                } else {
                    let name = property_key_name(property);
                    let name = self.intern(&name);
                    let ic = self.cur().next_ic();
                    self.emit(Op::PropertyCall { name, ic_slot: ic });
                }
            }
            Expr::Super { .. } => {
                self.emit(Op::GetThis);
                self.emit(Op::GetSuper);
            }
            Expr::Member { property, .. } => {
                // `super.method(...)`: `object` here is the `Super` pseudo-expr.
                let name = property_key_name(property);
                self.emit(Op::GetThis);
                self.emit(Op::GetSuper);
                self.emit(Op::Swap);
                let name = self.intern(&name);
                let ic = self.cur().next_ic();
                self.emit(Op::PropertyLoad { name, ic_slot: ic });
                self.emit(Op::Swap);
            }
            _ => {
                self.emit(Op::LoadUndefined);
                self.compile_expr(callee)?;
            }
        }
        for a in args {
            self.compile_expr(a)?;
        }
        self.emit(Op::Call { argc: args.len() as u32 });
        Ok(())
    }

    // ── Statements ───────────────────────────────────────────────────────

    fn compile_block(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        self.cur().push_scope();
        self.hoist_functions(body)?;
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.cur().pop_scope();
        Ok(())
    }

    fn hoist_functions(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        if self.ctx_stack.len() <= 1 {
            return Ok(());
        }
        for stmt in body {
            if let Stmt::FunctionDecl { function, span } = stmt {
                if let Some(name) = &function.name {
                    self.cur().declare_local(name, false, *span)?;
                }
            }
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr { expr, .. } => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop);
            }
            Stmt::VarDecl { decls, .. } => {
                for d in decls {
                    match &d.init {
                        Some(e) => self.compile_expr(e)?,
                        None => {
                            self.emit(Op::LoadUndefined);
                        }
                    }
                    if self.ctx_stack.len() == 1 && !self.cur().is_module {
                        let n = self.intern(&d.name);
                        self.emit(Op::StoreGlobal(n));
                    } else {
                        let slot = self.cur().declare_local(&d.name, false, d.span)?;
                        self.emit(Op::StoreLocal(slot));
                    }
                    self.emit(Op::Pop);
                }
            }
            Stmt::Block { body, .. } => self.compile_block(body)?,
            Stmt::If { test, consequent, alternate, .. } => {
                self.compile_expr(test)?;
                let else_jump = self.emit(Op::IfFalse(0));
                self.compile_stmt(consequent)?;
                match alternate {
                    Some(alt) => {
                        let end_jump = self.emit(Op::Goto(0));
                        let else_pc = self.here();
                        self.patch(else_jump, else_pc);
                        self.compile_stmt(alt)?;
                        let end_pc = self.here();
                        self.patch(end_jump, end_pc);
                    }
                    None => {
                        let end_pc = self.here();
                        self.patch(else_jump, end_pc);
                    }
                }
            }
            Stmt::While { test, body, .. } => self.compile_while(None, test, body)?,
            Stmt::DoWhile { body, test, .. } => self.compile_do_while(None, body, test)?,
            Stmt::For { init, test, update, body, .. } => self.compile_for(None, init, test, update, body)?,
            Stmt::ForIn { decl_kind, left, right, body, is_of, .. } => {
                self.compile_for_in(None, decl_kind, left, right, body, *is_of)?
            }
            Stmt::Return { argument, .. } => {
                match argument {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        self.emit(Op::LoadUndefined);
                    }
                }
                self.emit(Op::Return);
            }
            Stmt::Break { label, span } => self.compile_break(label.as_deref(), *span)?,
            Stmt::Continue { label, span } => self.compile_continue(label.as_deref(), *span)?,
            Stmt::Throw { argument, .. } => {
                self.compile_expr(argument)?;
                self.emit(Op::Throw);
            }
            Stmt::Try { block, handler, finalizer, .. } => self.compile_try(block, handler, finalizer)?,
            Stmt::Switch { discriminant, cases, .. } => self.compile_switch(discriminant, cases)?,
            Stmt::FunctionDecl { function, .. } => {
                let idx = self.compile_function(function)?;
                self.emit(Op::Closure(idx));
                let name = function.name.as_deref().unwrap_or("");
                if self.ctx_stack.len() == 1 && !self.cur().is_module {
                    let n = self.intern(name);
                    self.emit(Op::StoreGlobal(n));
                    self.emit(Op::Pop);
                } else {
                    let slot = match self.cur().find_local(name) {
                        Some((slot, _)) => slot,
                        None => self.cur().declare_local(name, false, function.span)?,
                    };
                    self.emit(Op::StoreLocal(slot));
                    self.emit(Op::Pop);
                }
            }
            Stmt::ClassDecl { class, .. } => {
                self.compile_class_expr(class)?;
                let name = class.name.as_deref().unwrap_or("");
                if self.ctx_stack.len() == 1 && !self.cur().is_module {
                    let n = self.intern(name);
                    self.emit(Op::StoreGlobal(n));
                    self.emit(Op::Pop);
                } else {
                    let slot = self.cur().declare_local(name, false, class.span)?;
                    self.emit(Op::StoreLocal(slot));
                    self.emit(Op::Pop);
                }
            }
            Stmt::Labeled { label, body, .. } => self.compile_labeled(label, body)?,
            Stmt::Import { specifiers, source, .. } => {
                // Declare the local slots now; `Context::resolve_imports`
                // fills them in against the `ModuleRegistry` right before
                // this body runs (§4.9), not via any bytecode op.
                let specifier: Rc<str> = Rc::from(source.as_str());
                for spec in specifiers {
                    let (name, binding) = match spec {
                        ImportSpecifier::Named { imported, local } => {
                            (local.as_str(), ImportBindingKind::Named(self.intern(imported)))
                        }
                        ImportSpecifier::Default { local } => (local.as_str(), ImportBindingKind::Default),
                        ImportSpecifier::Namespace { local } => (local.as_str(), ImportBindingKind::Namespace),
                    };
                    let slot = self.cur().declare_local(name, false, stmt.span())?;
                    self.cur().imports.push(ImportEntry { specifier: specifier.clone(), binding, local_slot: slot });
                }
            }
            Stmt::Export { .. } => {
                // Only meaningful inside `compile_module`; a bare script
                // never legally contains one.
            }
            Stmt::Empty { .. } => {}
        }
        Ok(())
    }

    /// Emits a plain `Goto`; if the jump leaves a `try`/`finally` the VM
    /// detours through the `finally` on its own by comparing the jump's
    /// source and target pcs against the exception table (§4.3), so this
    /// function needn't track enclosing try/finally scopes itself.
    fn compile_break(&mut self, label: Option<&str>, span: Span) -> Result<(), CompileError> {
        let frames = &self.cur().control_stack;
        let idx = match label {
            None => frames.iter().rposition(|f| matches!(f, ControlFrame::Loop(_) | ControlFrame::Switch { .. })),
            Some(l) => frames.iter().rposition(|f| match f {
                ControlFrame::Loop(lf) => lf.label.as_deref() == Some(l),
                ControlFrame::LabeledBlock { label, .. } => label == l,
                ControlFrame::Switch { .. } => false,
            }),
        };
        let idx = idx.ok_or(match label {
            Some(l) => CompileError::UnresolvedLabel { label: l.to_string(), span },
            None => CompileError::BreakOutsideLoop { span },
        })?;
        let site = self.emit(Op::Goto(0));
        match &mut self.cur().control_stack[idx] {
            ControlFrame::Loop(lf) => lf.break_patches.push(site),
            ControlFrame::Switch { break_patches } => break_patches.push(site),
            ControlFrame::LabeledBlock { break_patches, .. } => break_patches.push(site),
        }
        Ok(())
    }

    fn compile_continue(&mut self, label: Option<&str>, span: Span) -> Result<(), CompileError> {
        let idx = match label {
            None => self.cur().control_stack.iter().rposition(|f| matches!(f, ControlFrame::Loop(_))),
            Some(l) => self
                .cur()
                .control_stack
                .iter()
                .rposition(|f| matches!(f, ControlFrame::Loop(lf) if lf.label.as_deref() == Some(l))),
        };
        let idx = idx.ok_or(match label {
            Some(l) => CompileError::UnresolvedLabel { label: l.to_string(), span },
            None => CompileError::ContinueOutsideLoop { span },
        })?;
        let site = self.emit(Op::Goto(0));
        if let ControlFrame::Loop(lf) = &mut self.cur().control_stack[idx] {
            lf.continue_patches.push(site);
        }
        Ok(())
    }

    fn compile_labeled(&mut self, label: &str, body: &Stmt) -> Result<(), CompileError> {
        match body {
            Stmt::While { test, body, .. } => self.compile_while(Some(label.to_string()), test, body),
            Stmt::DoWhile { body, test, .. } => self.compile_do_while(Some(label.to_string()), body, test),
            Stmt::For { init, test, update, body, .. } => {
                self.compile_for(Some(label.to_string()), init, test, update, body)
            }
            Stmt::ForIn { decl_kind, left, right, body, is_of, .. } => {
                self.compile_for_in(Some(label.to_string()), decl_kind, left, right, body, *is_of)
            }
            other => {
                self.cur()
                    .control_stack
                    .push(ControlFrame::LabeledBlock { label: label.to_string(), break_patches: Vec::new() });
                self.compile_stmt(other)?;
                if let Some(ControlFrame::LabeledBlock { break_patches, .. }) = self.cur().control_stack.pop() {
                    let here = self.here();
                    for site in break_patches {
                        self.patch(site, here);
                    }
                }
                Ok(())
            }
        }
    }

    fn compile_while(&mut self, label: Option<String>, test: &Expr, body: &Stmt) -> Result<(), CompileError> {
        let start = self.here();
        self.compile_expr(test)?;
        let exit = self.emit(Op::IfFalse(0));
        self.cur()
            .control_stack
            .push(ControlFrame::Loop(LoopFrame { label, break_patches: Vec::new(), continue_patches: Vec::new() }));
        self.compile_stmt(body)?;
        let continue_target = start;
        let back = self.emit(Op::Goto(0));
        self.patch(back, continue_target);
        let end = self.here();
        self.patch(exit, end);
        self.finish_loop(end, continue_target);
        Ok(())
    }

    fn compile_do_while(&mut self, label: Option<String>, body: &Stmt, test: &Expr) -> Result<(), CompileError> {
        let start = self.here();
        self.cur()
            .control_stack
            .push(ControlFrame::Loop(LoopFrame { label, break_patches: Vec::new(), continue_patches: Vec::new() }));
        self.compile_stmt(body)?;
        let continue_target = self.here();
        self.compile_expr(test)?;
        let back = self.emit(Op::IfTrue(0));
        self.patch(back, start);
        let end = self.here();
        self.finish_loop(end, continue_target);
        Ok(())
    }

    fn compile_for(
        &mut self,
        label: Option<String>,
        init: &Option<Box<Stmt>>,
        test: &Option<Expr>,
        update: &Option<Expr>,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        self.cur().push_scope();
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }
        let start = self.here();
        let exit = match test {
            Some(t) => {
                self.compile_expr(t)?;
                Some(self.emit(Op::IfFalse(0)))
            }
            None => None,
        };
        self.cur()
            .control_stack
            .push(ControlFrame::Loop(LoopFrame { label, break_patches: Vec::new(), continue_patches: Vec::new() }));
        self.compile_stmt(body)?;
        let continue_target = self.here();
        if let Some(u) = update {
            self.compile_expr(u)?;
            self.emit(Op::Pop);
        }
        let back = self.emit(Op::Goto(0));
        self.patch(back, start);
        let end = self.here();
        if let Some(exit) = exit {
            self.patch(exit, end);
        }
        self.finish_loop(end, continue_target);
        self.cur().pop_scope();
        Ok(())
    }

    fn compile_for_in(
        &mut self,
        label: Option<String>,
        _decl_kind: &Option<VarKind>,
        left: &str,
        right: &Expr,
        body: &Stmt,
        is_of: bool,
    ) -> Result<(), CompileError> {
        // No iterator protocol or property-enumeration opcode; both
        // `for...in` and `for...of` lower to indexed iteration over the
        // right-hand side treated as an array-like (index 0..length).
        self.cur().push_scope();
        self.compile_expr(right)?;
        let iterable_slot = self.cur().alloc_temp();
        self.emit(Op::StoreLocal(iterable_slot));
        self.emit(Op::Pop);
        self.emit(Op::LoadLocal(iterable_slot));
        let length_name = self.intern("length");
        let ic = self.cur().next_ic();
        self.emit(Op::PropertyLoad { name: length_name, ic_slot: ic });
        let length_slot = self.cur().alloc_temp();
        self.emit(Op::StoreLocal(length_slot));
        self.emit(Op::Pop);
        let index_slot = self.cur().alloc_temp();
        self.emit(Op::LoadInt(0));
        self.emit(Op::StoreLocal(index_slot));
        self.emit(Op::Pop);

        let start = self.here();
        self.emit(Op::LoadLocal(index_slot));
        self.emit(Op::LoadLocal(length_slot));
        self.emit(Op::Lt);
        let exit = self.emit(Op::IfFalse(0));

        self.cur().push_scope();
        let item_slot = self.cur().declare_local(left, false, body.span())?;
        if is_of {
            self.emit(Op::LoadLocal(iterable_slot));
            self.emit(Op::LoadLocal(index_slot));
            self.emit(Op::IndexedLoad);
        } else {
            self.emit(Op::LoadLocal(index_slot));
        }
        self.emit(Op::StoreLocal(item_slot));
        self.emit(Op::Pop);

        self.cur()
            .control_stack
            .push(ControlFrame::Loop(LoopFrame { label, break_patches: Vec::new(), continue_patches: Vec::new() }));
        self.compile_stmt(body)?;
        self.cur().pop_scope();

        let continue_target = self.here();
        self.emit(Op::LoadLocal(index_slot));
        self.emit(Op::LoadInt(1));
        self.emit(Op::Add);
        self.emit(Op::StoreLocal(index_slot));
        self.emit(Op::Pop);
        let back = self.emit(Op::Goto(0));
        self.patch(back, start);
        let end = self.here();
        self.patch(exit, end);
        self.finish_loop(end, continue_target);
        self.cur().pop_scope();
        Ok(())
    }

    fn finish_loop(&mut self, break_target: usize, continue_target: usize) {
        if let Some(ControlFrame::Loop(lf)) = self.cur().control_stack.pop() {
            for site in lf.break_patches {
                self.patch(site, break_target);
            }
            for site in lf.continue_patches {
                self.patch(site, continue_target);
            }
        }
    }

    fn compile_switch(&mut self, discriminant: &Expr, cases: &[SwitchCase]) -> Result<(), CompileError> {
        self.compile_expr(discriminant)?;
        self.cur().control_stack.push(ControlFrame::Switch { break_patches: Vec::new() });

        let mut test_sites = Vec::new();
        for (i, case) in cases.iter().enumerate() {
            if let Some(test) = &case.test {
                self.emit(Op::Dup);
                self.compile_expr(test)?;
                self.emit(Op::StrictEq);
                let site = self.emit(Op::IfTrue(0));
                test_sites.push((i, site));
            }
        }
        let default_idx = cases.iter().position(|c| c.test.is_none());
        let fallthrough_site = self.emit(Op::Goto(0));

        self.cur().push_scope();
        let mut body_starts = Vec::with_capacity(cases.len());
        for case in cases {
            body_starts.push(self.here());
            for stmt in &case.body {
                self.compile_stmt(stmt)?;
            }
        }
        self.cur().pop_scope();

        let end = self.here();
        self.emit(Op::Pop);

        for (i, site) in test_sites {
            self.patch(site, body_starts[i]);
        }
        self.patch(fallthrough_site, default_idx.map(|d| body_starts[d]).unwrap_or(end));

        if let Some(ControlFrame::Switch { break_patches }) = self.cur().control_stack.pop() {
            for site in break_patches {
                self.patch(site, end);
            }
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        block: &[Stmt],
        handler: &Option<crate::ast::CatchClause>,
        finalizer: &Option<Vec<Stmt>>,
    ) -> Result<(), CompileError> {
        let try_start = self.here() as u32;
        self.compile_block(block)?;
        let try_end = self.here() as u32;
        let skip_handlers = self.emit(Op::Goto(0));

        let catch_pc;
        let mut catch_var_slot = None;
        if let Some(h) = handler {
            catch_pc = Some(self.here() as u32);
            self.cur().push_scope();
            if let Some(name) = &h.param {
                let slot = self.cur().declare_local(name, false, h.span)?;
                catch_var_slot = Some(slot);
            }
            for stmt in &h.body {
                self.compile_stmt(stmt)?;
            }
            self.cur().pop_scope();
        } else {
            catch_pc = None;
        }
        let skip_finally = handler.as_ref().map(|_| self.emit(Op::Goto(0)));

        let finally_pc = if let Some(fin) = finalizer {
            let pc = self.here() as u32;
            self.compile_block(fin)?;
            Some(pc)
        } else {
            None
        };
        // On ordinary (non-exceptional) completion of the try block or the
        // catch handler, control must still fall into `finally` rather than
        // skip past it — only skip straight to `after` when there's no
        // finalizer to run.
        let normal_target = finally_pc.unwrap_or(self.here() as u32);
        self.patch(skip_handlers, normal_target as usize);
        if let Some(site) = skip_finally {
            self.patch(site, normal_target as usize);
        }
        // `FinallyReturn` carries a `return` through this block (pending_return
        // set by `Op::Return`/an outer `FinallyReturn`); a no-op otherwise.
        // `FinallyGoto` then replays either a pending `break`/`continue`
        // detour or a throw that was already propagating when this `finally`
        // was entered (no catch matched it, or the catch itself threw) —
        // re-entering the unwind scan once it finishes, or simply falling
        // through to `after` on ordinary completion.
        if finalizer.is_some() {
            self.emit(Op::FinallyReturn);
            let site = self.emit(Op::FinallyGoto(0));
            let end = self.here();
            self.patch(site, end);
        }

        self.cur().exception_table.push(ExceptionTableEntry { try_start, try_end, catch_pc, catch_var_slot, finally_pc });
        Ok(())
    }

    // ── Functions & classes ──────────────────────────────────────────────

    fn compile_function(&mut self, node: &FunctionNode) -> Result<Idx, CompileError> {
        let debug_name = node.name.as_deref().map(|n| self.intern(n));
        let ctx = FunctionCtx::new(node.is_arrow, debug_name);
        self.ctx_stack.push(ctx);

        let mut has_rest = false;
        for p in &node.params {
            self.compile_param(p)?;
            if p.is_rest {
                has_rest = true;
            }
        }

        if let Some(expr_body) = &node.expr_body {
            self.compile_expr(expr_body)?;
            self.emit(Op::Return);
        } else {
            self.hoist_functions(&node.body)?;
            for stmt in &node.body {
                self.compile_stmt(stmt)?;
            }
            self.emit(Op::LoadUndefined);
            self.emit(Op::Return);
        }

        let ctx = self.ctx_stack.pop().unwrap();
        let def = Rc::new(FunctionDef {
            code: ctx.code,
            consts: ctx.consts,
            exception_table: ctx.exception_table,
            param_count: node.params.len() as u32,
            has_rest_param: has_rest,
            local_count: ctx.next_local,
            closure_vars: ClosureVarTable(ctx.closure_vars),
            debug: DebugTable { name: ctx.debug_name, source_id: self.source_id, line_for_pc: ctx.line_for_pc },
            is_generator: node.is_generator,
            is_async: node.is_async,
            is_arrow: node.is_arrow,
            is_strict: true,
            nested: ctx.nested,
            ic_count: ctx.next_ic_slot,
            imports: ImportTable(ctx.imports),
        });
        let parent = self.cur();
        let idx = parent.nested.len() as Idx;
        parent.nested.push(def);
        Ok(idx)
    }

    fn compile_param(&mut self, p: &Param) -> Result<(), CompileError> {
        let slot = self.cur().declare_local(&p.name, false, p.span)?;
        if let Some(default) = &p.default {
            self.emit(Op::LoadLocal(slot));
            self.emit(Op::LoadUndefined);
            self.emit(Op::StrictEq);
            let skip = self.emit(Op::IfFalse(0));
            self.compile_expr(default)?;
            self.emit(Op::StoreLocal(slot));
            self.emit(Op::Pop);
            let here = self.here();
            self.patch(skip, here);
        }
        Ok(())
    }

    fn compile_class_expr(&mut self, class: &ClassNode) -> Result<(), CompileError> {
        let has_super = class.superclass.is_some();
        if let Some(sc) = &class.superclass {
            self.compile_expr(sc)?;
        }

        let ctor_method = class.members.iter().find_map(|m| match m {
            ClassMember::Method { key, function, is_static: false, kind, computed: false } if is_constructor(key, kind) => {
                Some(function)
            }
            _ => None,
        });
        let instance_fields: Vec<&ClassMember> =
            class.members.iter().filter(|m| matches!(m, ClassMember::Field { is_static: false, .. })).collect();

        let mut ctor_body = Vec::new();
        if ctor_method.is_none() && has_super {
            ctor_body.push(Stmt::Expr {
                expr: Expr::Call {
                    callee: Box::new(Expr::Super { span: class.span }),
                    args: vec![Expr::Spread {
                        argument: Box::new(Expr::Ident { name: "arguments".into(), span: class.span }),
                        span: class.span,
                    }],
                    optional: false,
                    span: class.span,
                },
                span: class.span,
            });
        }
        for f in &instance_fields {
            if let ClassMember::Field { key, value, .. } = f {
                ctor_body.push(field_init_stmt(key, value, class.span));
            }
        }
        if let Some(ctor) = ctor_method {
            ctor_body.extend(ctor.body.iter().cloned());
        }

        let ctor_params = match ctor_method {
            Some(f) => f.params.clone(),
            None if has_super => vec![Param { name: "arguments".into(), default: None, is_rest: true, span: class.span }],
            None => Vec::new(),
        };
        let synthetic = FunctionNode {
            name: class.name.clone(),
            params: ctor_params,
            body: ctor_body,
            is_arrow: false,
            is_async: false,
            is_generator: false,
            expr_body: None,
            span: class.span,
        };
        let ctor_idx = self.compile_function(&synthetic)?;
        self.emit(Op::Closure(ctor_idx));
        self.emit(Op::MakeConstructor { has_super });

        for member in &class.members {
            match member {
                ClassMember::Method { key, function, is_static, kind, computed } if !is_constructor(key, kind) => {
                    self.emit(Op::Dup);
                    if !*is_static {
                        let proto_name = self.intern("prototype");
                        let ic = self.cur().next_ic();
                        self.emit(Op::PropertyLoad { name: proto_name, ic_slot: ic });
                    }
                    if *computed {
                        if let PropertyKey::Computed(k) = key {
                            self.compile_expr(k)?;
                        }
                    } else {
                        self.load_str_const(&property_key_name(key));
                    }
                    let _ = kind;
                    let fn_idx = self.compile_function(function)?;
                    self.emit(Op::Closure(fn_idx));
                    self.emit(Op::IndexedStore);
                    self.emit(Op::Pop);
                }
                ClassMember::Field { key, value, is_static: true, computed } => {
                    self.emit(Op::Dup);
                    if *computed {
                        if let PropertyKey::Computed(k) = key {
                            self.compile_expr(k)?;
                        }
                    } else {
                        self.load_str_const(&property_key_name(key));
                    }
                    match value {
                        Some(v) => self.compile_expr(v)?,
                        None => {
                            self.emit(Op::LoadUndefined);
                        }
                    }
                    self.emit(Op::IndexedStore);
                    self.emit(Op::Pop);
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ── Program entry point ───────────────────────────────────────────────

    fn compile_top_level(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.emit(Op::LoadUndefined);
        self.emit(Op::Return);
        Ok(())
    }
}

fn is_constructor(key: &PropertyKey, kind: &PropertyKind) -> bool {
    *kind == PropertyKind::Method && matches!(key, PropertyKey::Ident(n) if n == "constructor")
}

fn field_init_stmt(key: &PropertyKey, value: &Option<Expr>, span: Span) -> Stmt {
    Stmt::Expr {
        expr: Expr::Assign {
            op: AssignOp::Assign,
            target: Box::new(Expr::Member {
                object: Box::new(Expr::This { span }),
                property: key.clone(),
                computed: matches!(key, PropertyKey::Computed(_)),
                optional: false,
                span,
            }),
            value: Box::new(value.clone().unwrap_or(Expr::Literal { value: Literal::Undefined, span })),
            span,
        },
        span,
    }
}

fn property_key_name(key: &PropertyKey) -> String {
    match key {
        PropertyKey::Ident(s) | PropertyKey::Str(s) => s.clone(),
        PropertyKey::Num(n) => format_number_key(*n),
        PropertyKey::Computed(_) => String::new(),
    }
}

fn format_number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn binop_to_op(op: &BinOp) -> Op {
    match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::Mod => Op::Mod,
        BinOp::Pow => Op::Pow,
        BinOp::Shl => Op::Shl,
        BinOp::Shr => Op::Shr,
        BinOp::UShr => Op::UShr,
        BinOp::BitAnd => Op::BitAnd,
        BinOp::BitOr => Op::BitOr,
        BinOp::BitXor => Op::BitXor,
        BinOp::Eq => Op::Eq,
        BinOp::NotEq => Op::Ne,
        BinOp::StrictEq => Op::StrictEq,
        BinOp::StrictNotEq => Op::StrictNe,
        BinOp::Lt => Op::Lt,
        BinOp::Le => Op::Le,
        BinOp::Gt => Op::Gt,
        BinOp::Ge => Op::Ge,
        BinOp::In => Op::InOp,
        BinOp::Instanceof => Op::InstanceOf,
    }
}

fn assignop_to_binop(op: &AssignOp) -> Op {
    match op {
        AssignOp::Assign => unreachable!(),
        AssignOp::Add => Op::Add,
        AssignOp::Sub => Op::Sub,
        AssignOp::Mul => Op::Mul,
        AssignOp::Div => Op::Div,
        AssignOp::Mod => Op::Mod,
        AssignOp::Pow => Op::Pow,
        AssignOp::Shl => Op::Shl,
        AssignOp::Shr => Op::Shr,
        AssignOp::UShr => Op::UShr,
        AssignOp::BitAnd => Op::BitAnd,
        AssignOp::BitOr => Op::BitOr,
        AssignOp::BitXor => Op::BitXor,
        AssignOp::AndAnd | AssignOp::OrOr | AssignOp::Nullish => unreachable!(),
    }
}

/// Compiles a top-level script (the embedder's `Eval`, §6.1) into a single
/// `FunctionDef` that runs with an implicit top-level frame.
pub fn compile_program(program: &Program, interner: &mut StringInterner, source_id: u32) -> Result<Rc<FunctionDef>, CompileError> {
    let mut compiler = Compiler::new(interner, source_id);
    compiler.ctx_stack.push(FunctionCtx::new(false, None));
    compiler.compile_top_level(&program.body)?;
    let ctx = compiler.ctx_stack.pop().unwrap();
    Ok(Rc::new(FunctionDef {
        code: ctx.code,
        consts: ctx.consts,
        exception_table: ctx.exception_table,
        param_count: 0,
        has_rest_param: false,
        local_count: ctx.next_local,
        closure_vars: ClosureVarTable::default(),
        debug: DebugTable { name: None, source_id, line_for_pc: ctx.line_for_pc },
        is_generator: false,
        is_async: false,
        is_arrow: false,
        is_strict: true,
        nested: ctx.nested,
        ic_count: ctx.next_ic_slot,
        imports: ImportTable(ctx.imports),
    }))
}

/// Compiles a module body (§3.6, §4.9). `var`/function/class/`let`/`const`
/// declarations at module top level are module-local slots, not VM globals
/// (`FunctionCtx::is_module` gates the three call sites that would otherwise
/// emit `StoreGlobal`); `export` additionally records which slot holds the
/// exported value. The body's tail loads every exported local and packs them
/// into one array, in declaration order, as its `Return` value — evaluating
/// a module is then just running this function and reading off its ordinary
/// completion value, with no special-cased frame access. `import`s are left
/// as local-slot declarations for `Context::resolve_imports` to bind before
/// the body ever runs.
pub fn compile_module(program: &Program, interner: &mut StringInterner, source_id: u32) -> Result<Rc<ModuleDef>, CompileError> {
    let mut compiler = Compiler::new(interner, source_id);
    let mut top = FunctionCtx::new(false, None);
    top.is_module = true;
    compiler.ctx_stack.push(top);

    let mut export_slots: Vec<(String, Idx)> = Vec::new();
    let mut pending_named: Vec<(String, String, Span)> = Vec::new();
    for stmt in &program.body {
        match stmt {
            Stmt::Export { kind, span } => match kind {
                crate::ast::ExportKind::Named { names } => {
                    for (local, exported) in names {
                        pending_named.push((local.clone(), exported.clone(), *span));
                    }
                }
                crate::ast::ExportKind::Default(expr) => {
                    compiler.compile_expr(expr)?;
                    let slot = compiler.cur().alloc_temp();
                    compiler.emit(Op::StoreLocal(slot));
                    compiler.emit(Op::Pop);
                    export_slots.push(("default".to_string(), slot));
                }
                crate::ast::ExportKind::Declaration(inner) => {
                    compiler.compile_stmt(inner)?;
                    if let Some(name) = declared_name(inner) {
                        let (slot, _) =
                            compiler.cur().find_local(&name).expect("declaration just bound this name to a local");
                        export_slots.push((name, slot));
                    }
                }
            },
            other => compiler.compile_stmt(other)?,
        }
    }
    // Resolved after the whole body compiles so a named re-export may name a
    // binding declared later in source order (hoisted functions, etc).
    for (local, exported, span) in pending_named {
        let (slot, _) = compiler.cur().find_local(&local).ok_or(CompileError::UnresolvedExport { name: local, span })?;
        export_slots.push((exported, slot));
    }

    for (_, slot) in &export_slots {
        compiler.emit(Op::LoadLocal(*slot));
    }
    compiler.emit(Op::NewArray { count: export_slots.len() as u32 });
    compiler.emit(Op::Return);

    let ctx = compiler.ctx_stack.pop().unwrap();
    let exports =
        export_slots.into_iter().enumerate().map(|(i, (name, _))| (compiler.interner.intern(&name), i as u32)).collect();
    Ok(Rc::new(ModuleDef {
        code: ctx.code,
        consts: ctx.consts,
        exception_table: ctx.exception_table,
        local_count: ctx.next_local,
        exports: ExportVarTable(exports),
        imports: ImportTable(ctx.imports),
        debug: DebugTable { name: None, source_id, line_for_pc: ctx.line_for_pc },
        nested: ctx.nested,
        ic_count: ctx.next_ic_slot,
    }))
}

fn declared_name(stmt: &Stmt) -> Option<String> {
    match stmt {
        Stmt::VarDecl { decls, .. } => decls.first().map(|d| d.name.clone()),
        Stmt::FunctionDecl { function, .. } => function.name.clone(),
        Stmt::ClassDecl { class, .. } => class.name.clone(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Literal, Stmt, VarDeclarator};

    fn sp() -> Span {
        Span::new(0, 0, 0)
    }

    #[test]
    fn compiles_a_let_binding_and_return() {
        let program = Program {
            body: vec![
                Stmt::VarDecl {
                    kind: VarKind::Let,
                    decls: vec![VarDeclarator {
                        name: "x".into(),
                        init: Some(Expr::Literal { value: Literal::Int(41), span: sp() }),
                        span: sp(),
                    }],
                    span: sp(),
                },
                Stmt::Return { argument: Some(Expr::Ident { name: "x".into(), span: sp() }), span: sp() },
            ],
        };
        let mut interner = StringInterner::new();
        let def = compile_program(&program, &mut interner, 0).expect("compiles");
        assert!(def.code.iter().any(|op| matches!(op, Op::StoreGlobal(_))));
        assert!(def.code.iter().any(|op| matches!(op, Op::Return)));
    }

    #[test]
    fn nested_function_capturing_outer_local_gets_a_closure_var() {
        let inner = FunctionNode {
            name: None,
            params: vec![],
            body: vec![Stmt::Return { argument: Some(Expr::Ident { name: "x".into(), span: sp() }), span: sp() }],
            is_arrow: false,
            is_async: false,
            is_generator: false,
            expr_body: None,
            span: sp(),
        };
        let program = Program {
            body: vec![Stmt::FunctionDecl {
                function: FunctionNode {
                    name: Some("outer".into()),
                    params: vec![],
                    body: vec![
                        Stmt::VarDecl {
                            kind: VarKind::Let,
                            decls: vec![VarDeclarator {
                                name: "x".into(),
                                init: Some(Expr::Literal { value: Literal::Int(1), span: sp() }),
                                span: sp(),
                            }],
                            span: sp(),
                        },
                        Stmt::Return {
                            argument: Some(Expr::Function { function: Box::new(inner), span: sp() }),
                            span: sp(),
                        },
                    ],
                    is_arrow: false,
                    is_async: false,
                    is_generator: false,
                    expr_body: None,
                    span: sp(),
                },
                span: sp(),
            }],
        };
        let mut interner = StringInterner::new();
        let def = compile_program(&program, &mut interner, 0).expect("compiles");
        let outer_def = &def.nested[0];
        let inner_def = &outer_def.nested[0];
        assert_eq!(inner_def.closure_vars.0.len(), 1);
        assert_eq!(&*inner_def.closure_vars.0[0].name, "x");
    }

    #[test]
    fn break_and_continue_patch_to_loop_boundaries() {
        let program = Program {
            body: vec![Stmt::While {
                test: Expr::Literal { value: Literal::Bool(true), span: sp() },
                body: Box::new(Stmt::Block {
                    body: vec![Stmt::Continue { label: None, span: sp() }, Stmt::Break { label: None, span: sp() }],
                    span: sp(),
                }),
                span: sp(),
            }],
        };
        let mut interner = StringInterner::new();
        let def = compile_program(&program, &mut interner, 0).expect("compiles");
        let gotos = def.code.iter().filter(|op| matches!(op, Op::Goto(_))).count();
        assert!(gotos >= 2);
    }
}
