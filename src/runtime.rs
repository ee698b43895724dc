/// Embedder-facing entry point (§7). `Context` owns one `Vm` and the
/// front-end pieces (`StringInterner`, the next source id) needed to turn
/// source text into a running program, mirroring the teacher's
/// `Runtime::new`-then-`eval` shape but wired to this engine's pipeline:
/// lex → parse → compile → run.
use std::collections::HashMap;

use crate::compiler::{compile_module, compile_program};
use crate::conf::EngineConfig;
use crate::diagnostics::EngineDiagnostic;
use crate::errors::{CompileError, ParseError, RuntimeError};
use crate::function::{ImportBindingKind, ImportTable};
use crate::intrinsics;
use crate::parser::Parser;
use crate::string_intern::StringInterner;
use crate::value::Value;
use crate::vm::Vm;

/// Everything that can go wrong turning source text into a result: a
/// typed front-end error (renderable via `to_diagnostic`) or an
/// unwound JS exception (already a live `Value` on this context's heap).
pub enum EvalError {
    Compile(CompileError),
    Thrown(Value),
    Runtime(RuntimeError),
}

impl From<CompileError> for EvalError {
    fn from(e: CompileError) -> Self {
        EvalError::Compile(e)
    }
}

impl From<ParseError> for EvalError {
    fn from(e: ParseError) -> Self {
        EvalError::Compile(CompileError::Parse(e))
    }
}

impl From<RuntimeError> for EvalError {
    fn from(e: RuntimeError) -> Self {
        EvalError::Runtime(e)
    }
}

impl EvalError {
    /// Renders a compile-time error with full source context; returns
    /// `None` for a thrown `Value` or a `RuntimeError`, which the caller
    /// formats itself (it may need the `Vm` to stringify a thrown value, and
    /// a `RuntimeError` carries no source span to render against).
    pub fn to_diagnostic(&self, source_name: &str, source: &str) -> Option<EngineDiagnostic> {
        match self {
            EvalError::Compile(e) => Some(EngineDiagnostic::from_compile_error(source_name, source, e)),
            EvalError::Thrown(_) | EvalError::Runtime(_) => None,
        }
    }
}

/// Maps a module specifier to its compiled handle (§3.6). A module is
/// registered by `compile_module` and evaluated at most once by
/// `call_module`; re-entrant `call_module`s on an already-evaluated
/// specifier just return the cached handle.
#[derive(Default)]
struct ModuleRegistry {
    modules: HashMap<String, Value>,
}

pub struct Context {
    pub vm: Vm,
    interner: StringInterner,
    next_source_id: u32,
    modules: ModuleRegistry,
}

impl Context {
    pub fn new(config: EngineConfig) -> Self {
        let mut vm = Vm::new(config);
        intrinsics::install(&mut vm);
        Context { vm, interner: StringInterner::new(), next_source_id: 1, modules: ModuleRegistry::default() }
    }

    /// Compiles and immediately runs `source` as a top-level program,
    /// draining the microtask queue afterward so a script whose only
    /// remaining work is settled promises observes it before returning
    /// (matching a CLI's run-to-completion semantics, not a long-lived
    /// event loop).
    pub fn eval(&mut self, source: &str) -> Result<Value, EvalError> {
        let source_id = self.next_source_id;
        self.next_source_id += 1;

        let mut parser = Parser::new(source, source_id)?;
        let program = parser.parse_program()?;
        let def = compile_program(&program, &mut self.interner, source_id)?;

        let bindings = self.resolve_imports(&def.imports)?;
        let result = self.vm.run_program_with_bindings(def, &bindings);
        self.vm.run_microtasks();
        if result.is_exception() {
            return Err(EvalError::Thrown(result));
        }
        Ok(result)
    }

    /// Parses and compiles `source` as a module (§6.1), registering it under
    /// `specifier` without running its body. Re-compiling an already
    /// registered specifier replaces the old entry — re-evaluating it is the
    /// caller's concern, not this method's.
    pub fn compile_module(&mut self, specifier: &str, source: &str) -> Result<Value, EvalError> {
        let source_id = self.next_source_id;
        self.next_source_id += 1;

        let mut parser = Parser::new(source, source_id)?;
        let program = parser.parse_program()?;
        let def = compile_module(&program, &mut self.interner, source_id)?;

        let def_value = self.vm.alloc_module_def(def);
        let module_value = self.vm.alloc_module(def_value);
        self.modules.modules.insert(specifier.to_string(), module_value.clone());
        Ok(module_value)
    }

    /// Runs a registered module's top-level body once (§6.1); subsequent
    /// calls return the cached `ModuleObject` handle without re-running it.
    pub fn call_module(&mut self, specifier: &str) -> Result<Value, EvalError> {
        let module_value = self
            .modules
            .modules
            .get(specifier)
            .cloned()
            .ok_or_else(|| RuntimeError::NoActiveModule { specifier: specifier.to_string() })?;
        if self.vm.module_is_evaluated(&module_value) {
            return Ok(module_value);
        }

        let def_value = self.vm.module_def_value(&module_value);
        let imports = self.vm.module_imports(&def_value);
        let bindings = self.resolve_imports(&imports)?;

        let export_values = self.vm.run_module_body(&def_value, &bindings);
        self.vm.run_microtasks();
        self.vm.finish_module(&module_value, export_values);
        Ok(module_value)
    }

    /// Turns one `ImportTable` into `(local slot, value)` bindings by
    /// recursively evaluating each imported specifier, matching the
    /// binding's kind against the exporter's `ExportVarTable`. Imports are
    /// resolved as a snapshot of the export's value at this point, not a
    /// live cell — `ValueKind::ExportVar` exists for the export side's own
    /// bookkeeping, but nothing re-reads it after binding (see DESIGN.md).
    fn resolve_imports(&mut self, imports: &ImportTable) -> Result<Vec<(u32, Value)>, EvalError> {
        let mut bindings = Vec::with_capacity(imports.0.len());
        for entry in &imports.0 {
            let module_value = self.call_module(&entry.specifier)?;
            let def_value = self.vm.module_def_value(&module_value);
            let value = match &entry.binding {
                ImportBindingKind::Default => self.named_export(&module_value, &def_value, &entry.specifier, "default")?,
                ImportBindingKind::Named(name) => self.named_export(&module_value, &def_value, &entry.specifier, name)?,
                ImportBindingKind::Namespace => self.namespace_object(&module_value, &def_value),
            };
            bindings.push((entry.local_slot, value));
        }
        Ok(bindings)
    }

    fn named_export(&mut self, module_value: &Value, def_value: &Value, specifier: &str, name: &str) -> Result<Value, EvalError> {
        let names = self.vm.module_export_names(def_value);
        let index = names.iter().position(|(n, _)| n.as_ref() == name).ok_or_else(|| RuntimeError::UnknownExport {
            specifier: specifier.to_string(),
            name: name.to_string(),
        })?;
        Ok(self.vm.module_export_slot(module_value, names[index].1))
    }

    fn namespace_object(&mut self, module_value: &Value, def_value: &Value) -> Value {
        let names = self.vm.module_export_names(def_value);
        let ns = self.vm.alloc_plain_object(self.vm.object_prototype.clone());
        for (name, slot) in names {
            let value = self.vm.module_export_slot(module_value, slot);
            self.vm.set_named_property_pub(&ns, &name, value);
        }
        ns
    }

    pub fn stringify(&mut self, v: &Value) -> String {
        self.vm.stringify(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_runs_a_program_and_returns_its_completion_value() {
        let mut ctx = Context::new(EngineConfig::default());
        let result = ctx.eval("1 + 2;").unwrap();
        assert_eq!(result.as_number(), Some(3.0));
    }

    #[test]
    fn eval_surfaces_a_thrown_value() {
        let mut ctx = Context::new(EngineConfig::default());
        let err = ctx.eval("throw 'boom';").unwrap_err();
        match err {
            EvalError::Thrown(v) => assert_eq!(v.as_str(), Some("boom")),
            EvalError::Compile(_) | EvalError::Runtime(_) => panic!("expected a thrown value"),
        }
    }

    #[test]
    fn eval_surfaces_a_parse_error_as_a_diagnostic() {
        let mut ctx = Context::new(EngineConfig::default());
        let err = ctx.eval("let x = ;").unwrap_err();
        let diag = err.to_diagnostic("test.js", "let x = ;");
        assert!(diag.is_some());
    }

    #[test]
    fn module_default_and_named_exports_are_importable() {
        let mut ctx = Context::new(EngineConfig::default());
        ctx.compile_module("math", "export const pi = 3; export default 42;").unwrap();
        let result = ctx.eval("import answer, { pi } from 'math'; answer + pi;").unwrap();
        assert_eq!(result.as_number(), Some(45.0));
    }

    #[test]
    fn module_body_runs_exactly_once() {
        // Each run of `export const obj = {}` would allocate a fresh object;
        // re-importing it must yield the one from the first (and only) run.
        let mut ctx = Context::new(EngineConfig::default());
        ctx.compile_module("shared", "export const obj = {};").unwrap();
        ctx.eval("import { obj } from 'shared'; var first = obj;").unwrap();
        let result = ctx.eval("import { obj } from 'shared'; first === obj;").unwrap();
        assert!(matches!(result.kind, crate::value::ValueKind::Boolean(true)));
    }

    #[test]
    fn importing_an_uncompiled_module_is_a_runtime_error() {
        let mut ctx = Context::new(EngineConfig::default());
        let err = ctx.eval("import { x } from 'nope';").unwrap_err();
        match err {
            EvalError::Runtime(_) => {}
            _ => panic!("expected a RuntimeError::NoActiveModule"),
        }
    }
}
