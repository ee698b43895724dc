/// Generational garbage collector (§4.5).
///
/// Every heap object is an individually `Box`-allocated `GcBox`, addressed
/// through a `GcRef` raw pointer rather than an offset into a contiguous
/// arena. This trades the teacher's bump-pointer nursery (`gc.rs`'s
/// `BumpArena`) for pointer stability during allocation, at the cost of
/// doing real forwarding-pointer bookkeeping during a young GC instead of a
/// single `memcpy` of a semi-space — see DESIGN.md for why: a bump arena
/// whose copy step was never implemented (the teacher's `minor_gc` resets
/// the nursery and calls it done) isn't a base worth inheriting literally,
/// and hand-verified raw-pointer arena arithmetic can't be checked by a
/// compiler we're not allowed to run. The external contract — live objects
/// survive, handles observe updated addresses, dead objects are freed — is
/// unchanged.
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::function::{
    AsyncObject, ConstructorObject, CppModuleObject, FunctionDef, FunctionObject, GeneratorObject,
    ModuleDef, ModuleObject, PromiseObject,
};
use crate::object::{ArrayData, ObjectData};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassId {
    String,
    Symbol,
    Generic,
    Array,
    Function,
    Generator,
    Promise,
    Async,
    Module,
    Constructor,
    CppModule,
    FunctionDef,
    ModuleDef,
    ClosureVar,
    ExportVar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Young,
    Old,
}

pub enum HeapData {
    Str(String),
    Symbol(Option<String>),
    Object(ObjectData),
    Array(ArrayData),
    Function(FunctionObject),
    Generator(GeneratorObject),
    Promise(PromiseObject),
    Async(AsyncObject),
    Module(ModuleObject),
    Constructor(ConstructorObject),
    CppModule(CppModuleObject),
    FunctionDef(Rc<FunctionDef>),
    ModuleDef(Rc<ModuleDef>),
    ClosureVar(Value),
    ExportVar(Value),
}

impl HeapData {
    fn class_id(&self) -> ClassId {
        match self {
            HeapData::Str(_) => ClassId::String,
            HeapData::Symbol(_) => ClassId::Symbol,
            HeapData::Object(_) => ClassId::Generic,
            HeapData::Array(_) => ClassId::Array,
            HeapData::Function(_) => ClassId::Function,
            HeapData::Generator(_) => ClassId::Generator,
            HeapData::Promise(_) => ClassId::Promise,
            HeapData::Async(_) => ClassId::Async,
            HeapData::Module(_) => ClassId::Module,
            HeapData::Constructor(_) => ClassId::Constructor,
            HeapData::CppModule(_) => ClassId::CppModule,
            HeapData::FunctionDef(_) => ClassId::FunctionDef,
            HeapData::ModuleDef(_) => ClassId::ModuleDef,
            HeapData::ClosureVar(_) => ClassId::ClosureVar,
            HeapData::ExportVar(_) => ClassId::ExportVar,
        }
    }

    /// Visits every `Value` this object directly owns, for GC tracing.
    fn for_each_child_mut(&mut self, mut visit: impl FnMut(&mut Value)) {
        match self {
            HeapData::Str(_) | HeapData::Symbol(_) | HeapData::FunctionDef(_) | HeapData::ModuleDef(_) => {}
            HeapData::Object(o) => {
                for v in o.slots.iter_mut() {
                    visit(v);
                }
                visit(&mut o.prototype);
            }
            HeapData::Array(a) => {
                for v in a.base.slots.iter_mut() {
                    visit(v);
                }
                visit(&mut a.base.prototype);
            }
            HeapData::Function(f) => {
                visit(&mut f.def);
                for v in f.closure_env.iter_mut() {
                    visit(v);
                }
                visit(&mut f.bound_this);
            }
            HeapData::Generator(g) => {
                visit(&mut g.function);
                for v in g.saved_stack.iter_mut() {
                    visit(v);
                }
            }
            HeapData::Promise(p) => {
                if let Some(v) = p.value.as_mut() {
                    visit(v);
                }
                for v in p.on_fulfill.iter_mut() {
                    visit(v);
                }
                for v in p.on_reject.iter_mut() {
                    visit(v);
                }
            }
            HeapData::Async(a) => {
                visit(&mut a.function);
                for v in a.saved_stack.iter_mut() {
                    visit(v);
                }
                visit(&mut a.result_promise);
            }
            HeapData::Module(m) => {
                visit(&mut m.def);
                for v in m.export_slots.iter_mut() {
                    visit(v);
                }
            }
            HeapData::Constructor(c) => {
                visit(&mut c.function);
                visit(&mut c.prototype);
                visit(&mut c.superclass);
            }
            HeapData::CppModule(c) => {
                for v in c.exports.iter_mut() {
                    visit(&mut v.1);
                }
            }
            HeapData::ClosureVar(v) | HeapData::ExportVar(v) => visit(v),
        }
    }
}

pub struct ObjHeader {
    pub class_id: ClassId,
    pub generation: Generation,
    pub marked: bool,
    pub forwarded: Option<GcRef>,
    pub age: u8,
}

pub struct GcBox {
    pub header: ObjHeader,
    pub data: HeapData,
}

/// A GC-managed pointer. Two `GcRef`s are equal iff they address the same
/// box, matching the spec's reference-equality semantics for objects.
pub struct GcRef(NonNull<GcBox>);

impl GcRef {
    fn alloc(data: HeapData, generation: Generation) -> GcRef {
        let class_id = data.class_id();
        let boxed = Box::new(GcBox {
            header: ObjHeader { class_id, generation, marked: false, forwarded: None, age: 0 },
            data,
        });
        GcRef(NonNull::from(Box::leak(boxed)))
    }

    pub fn class_id(&self) -> ClassId {
        self.header().class_id
    }

    pub fn header(&self) -> &ObjHeader {
        unsafe { &self.0.as_ref().header }
    }

    fn header_mut(&mut self) -> &mut ObjHeader {
        unsafe { &mut self.0.as_mut().header }
    }

    pub fn data(&self) -> &HeapData {
        unsafe { &self.0.as_ref().data }
    }

    pub fn data_mut(&mut self) -> &mut HeapData {
        unsafe { &mut self.0.as_mut().data }
    }

    fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    unsafe fn free(self) {
        drop(Box::from_raw(self.0.as_ptr()));
    }
}

impl Clone for GcRef {
    fn clone(&self) -> Self {
        GcRef(self.0)
    }
}
impl Copy for GcRef {}

impl PartialEq for GcRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for GcRef {}

impl std::hash::Hash for GcRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:?}@{:#x})", self.class_id(), self.addr())
    }
}

#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub minor_collections: u64,
    pub major_collections: u64,
    pub objects_freed_young: u64,
    pub objects_freed_old: u64,
    pub objects_promoted: u64,
    pub last_minor_pause_us: u64,
    pub last_major_pause_us: u64,
}

pub struct GcConfig {
    pub semi_size_bytes: usize,
    pub old_initial_size_bytes: usize,
    pub large_object_threshold_bytes: usize,
    pub young_gc_threshold_pct: u8,
    pub old_gc_threshold_pct: u8,
    pub promotion_age: u8,
    pub debug: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            semi_size_bytes: 256 * 1024,
            old_initial_size_bytes: 4 * 1024 * 1024,
            large_object_threshold_bytes: 16 * 1024,
            young_gc_threshold_pct: 80,
            old_gc_threshold_pct: 80,
            promotion_age: 1,
            debug: false,
        }
    }
}

/// Every mutable location the collector must treat as a root. Callers
/// (the VM, `Runtime`) assemble this fresh before each collection; nothing
/// is retained between calls.
pub struct RootSet<'a> {
    pub value_slices: Vec<&'a mut [Value]>,
    pub handle_scopes: &'a mut [Vec<Rc<RefCell<Value>>>],
}

impl<'a> RootSet<'a> {
    pub fn new() -> Self {
        RootSet { value_slices: Vec::new(), handle_scopes: &mut [] }
    }

    fn for_each_root_mut(&mut self, mut visit: impl FnMut(&mut Value)) {
        for slice in self.value_slices.iter_mut() {
            for v in slice.iter_mut() {
                visit(v);
            }
        }
        for scope in self.handle_scopes.iter_mut() {
            for handle in scope.iter_mut() {
                let mut v = handle.borrow_mut();
                visit(&mut v);
            }
        }
    }
}

pub struct Heap {
    young: Vec<GcRef>,
    old: Vec<GcRef>,
    /// Old-gen objects known to hold a pointer into young space (write
    /// barrier targets); treated as extra roots during a minor GC.
    remembered_set: HashSet<usize>,
    young_bytes: usize,
    old_bytes: usize,
    pub config: GcConfig,
    pub stats: GcStats,
    collecting: bool,
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        Heap {
            young: Vec::new(),
            old: Vec::new(),
            remembered_set: HashSet::new(),
            young_bytes: 0,
            old_bytes: 0,
            config,
            stats: GcStats::default(),
            collecting: false,
        }
    }

    fn approx_size(data: &HeapData) -> usize {
        std::mem::size_of::<GcBox>()
            + match data {
                HeapData::Str(s) => s.len(),
                HeapData::Object(o) => o.slots.len() * std::mem::size_of::<Value>(),
                HeapData::Array(a) => a.base.slots.len() * std::mem::size_of::<Value>(),
                _ => 0,
            }
    }

    pub fn alloc(&mut self, data: HeapData) -> GcRef {
        let size = Self::approx_size(&data);
        if size >= self.config.large_object_threshold_bytes {
            let r = GcRef::alloc(data, Generation::Old);
            self.old.push(r);
            self.old_bytes += size;
            return r;
        }
        let r = GcRef::alloc(data, Generation::Young);
        self.young.push(r);
        self.young_bytes += size;
        r
    }

    /// Called after any field write on an object; records old→young edges
    /// in the remembered set so a minor GC doesn't miss them.
    pub fn write_barrier(&mut self, owner: GcRef, written: &Value) {
        if owner.header().generation != Generation::Old {
            return;
        }
        if let Some(target) = written.as_gc_ref() {
            if target.header().generation == Generation::Young {
                self.remembered_set.insert(owner.addr());
            }
        }
    }

    pub fn maybe_collect(&mut self, roots: &mut RootSet) {
        if self.collecting {
            return;
        }
        let young_full = self.young_bytes >= self.config.semi_size_bytes * self.config.young_gc_threshold_pct as usize / 100;
        if young_full {
            self.collect_young(roots);
        }
        let old_full = self.old_bytes >= self.config.old_initial_size_bytes * self.config.old_gc_threshold_pct as usize / 100;
        if old_full {
            self.collect_old(roots);
        }
    }

    /// Cheney-style semi-space copy: every reachable young object is
    /// reallocated into a fresh box, the old box's header records a
    /// forwarding `GcRef`, and every pointer discovered during the BFS scan
    /// (including roots) is rewritten to the new address. Objects that have
    /// already survived `promotion_age` collections move to old space
    /// instead of getting a fresh young box.
    pub fn collect_young(&mut self, roots: &mut RootSet) {
        self.collecting = true;
        let start = std::time::Instant::now();
        self.stats.minor_collections += 1;
        if self.config.debug {
            eprintln!("[gc] minor collection #{} (young_bytes={})", self.stats.minor_collections, self.young_bytes);
        }

        let remembered: Vec<GcRef> = self
            .young
            .iter()
            .chain(self.old.iter())
            .filter(|r| self.remembered_set.contains(&r.addr()))
            .copied()
            .collect();

        let mut worklist: Vec<GcRef> = Vec::new();
        let mut new_young: Vec<GcRef> = Vec::new();
        let mut promoted: Vec<GcRef> = Vec::new();

        let forward = |v: &mut Value, worklist: &mut Vec<GcRef>, new_young: &mut Vec<GcRef>, promoted: &mut Vec<GcRef>, promotion_age: u8| {
            let Some(mut target) = v.as_gc_ref() else { return };
            if target.header().generation != Generation::Young {
                return;
            }
            if let Some(fwd) = target.header().forwarded {
                v.rewrite_gc_ref(fwd);
                return;
            }
            let age = target.header().age;
            let data = std::mem::replace(target.data_mut(), HeapData::Symbol(None));
            if age + 1 >= promotion_age {
                let new_ref = GcRef::alloc(data, Generation::Old);
                target.header_mut().forwarded = Some(new_ref);
                promoted.push(new_ref);
                worklist.push(new_ref);
                v.rewrite_gc_ref(new_ref);
            } else {
                let new_ref = GcRef::alloc(data, Generation::Young);
                {
                    let mut nr = new_ref;
                    nr.header_mut().age = age + 1;
                }
                target.header_mut().forwarded = Some(new_ref);
                new_young.push(new_ref);
                worklist.push(new_ref);
                v.rewrite_gc_ref(new_ref);
            }
        };

        roots.for_each_root_mut(|v| forward(v, &mut worklist, &mut new_young, &mut promoted, self.config.promotion_age));
        for mut r in remembered {
            r.data_mut().for_each_child_mut(|v| forward(v, &mut worklist, &mut new_young, &mut promoted, self.config.promotion_age));
        }

        while let Some(mut r) = worklist.pop() {
            r.data_mut().for_each_child_mut(|v| forward(v, &mut worklist, &mut new_young, &mut promoted, self.config.promotion_age));
        }

        let freed = self.young.len();
        for old_ref in self.young.drain(..) {
            if old_ref.header().forwarded.is_none() {
                unsafe { old_ref.free() };
            }
        }
        self.stats.objects_freed_young += freed.saturating_sub(new_young.len() + promoted.len()) as u64;
        self.stats.objects_promoted += promoted.len() as u64;

        self.young_bytes = new_young.iter().map(|r| Self::approx_size(r.data())).sum();
        self.old_bytes += promoted.iter().map(|r| Self::approx_size(r.data())).sum::<usize>();
        self.young = new_young;
        self.old.extend(promoted);
        self.remembered_set.retain(|addr| self.old.iter().any(|r| r.addr() == *addr));

        let elapsed = start.elapsed().as_micros() as u64;
        self.stats.last_minor_pause_us = elapsed;
        if self.config.debug {
            eprintln!("[gc] minor collection done in {}us, young_bytes={}", elapsed, self.young_bytes);
        }
        self.collecting = false;
    }

    /// Mark-and-sweep over old space. The spec's compact phase is elided:
    /// every old object already lives at a stable `Box` address, so there
    /// is no fragmentation for a memmove-style compact to reclaim. See
    /// DESIGN.md.
    pub fn collect_old(&mut self, roots: &mut RootSet) {
        self.collecting = true;
        let start = std::time::Instant::now();
        self.stats.major_collections += 1;
        if self.config.debug {
            eprintln!("[gc] major collection #{} (old_bytes={})", self.stats.major_collections, self.old_bytes);
        }

        for r in self.old.iter_mut() {
            r.header_mut().marked = false;
        }
        for r in self.young.iter_mut() {
            r.header_mut().marked = true;
        }

        let mut stack: Vec<GcRef> = Vec::new();
        roots.for_each_root_mut(|v| {
            if let Some(r) = v.as_gc_ref() {
                stack.push(r);
            }
        });

        while let Some(mut r) = stack.pop() {
            if r.header().marked {
                continue;
            }
            r.header_mut().marked = true;
            r.data_mut().for_each_child_mut(|v| {
                if let Some(child) = v.as_gc_ref() {
                    if !child.header().marked {
                        stack.push(child);
                    }
                }
            });
        }

        let before = self.old.len();
        let mut survivors = Vec::with_capacity(before);
        for r in self.old.drain(..) {
            if r.header().marked {
                survivors.push(r);
            } else {
                unsafe { r.free() };
            }
        }
        self.stats.objects_freed_old += (before - survivors.len()) as u64;
        self.old_bytes = survivors.iter().map(|r| Self::approx_size(r.data())).sum();
        self.old = survivors;
        self.remembered_set.retain(|addr| self.old.iter().any(|r| r.addr() == *addr));

        let elapsed = start.elapsed().as_micros() as u64;
        self.stats.last_major_pause_us = elapsed;
        if self.config.debug {
            eprintln!("[gc] major collection done in {}us, old_bytes={}", elapsed, self.old_bytes);
        }
        self.collecting = false;
    }

    pub fn young_count(&self) -> usize {
        self.young.len()
    }

    pub fn old_count(&self) -> usize {
        self.old.len()
    }
}

/// A RAII handle region. Handles created while a scope is active keep their
/// target alive and get rewritten in place by `Heap::collect_young`/
/// `collect_old`; popping the scope releases all handles created in it.
pub struct HandleScope {
    handles: Vec<Rc<RefCell<Value>>>,
}

impl HandleScope {
    pub fn new() -> Self {
        HandleScope { handles: Vec::new() }
    }

    pub fn create(&mut self, value: Value) -> Handle {
        let cell = Rc::new(RefCell::new(value));
        self.handles.push(cell.clone());
        Handle(cell)
    }

    pub fn as_roots(&mut self) -> &mut Vec<Rc<RefCell<Value>>> {
        &mut self.handles
    }
}

#[derive(Clone)]
pub struct Handle(Rc<RefCell<Value>>);

impl Handle {
    pub fn get(&self) -> Value {
        self.0.borrow().clone()
    }

    pub fn set(&self, v: Value) {
        *self.0.borrow_mut() = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> GcConfig {
        GcConfig {
            semi_size_bytes: 256,
            old_initial_size_bytes: 256,
            large_object_threshold_bytes: 1 << 20,
            young_gc_threshold_pct: 50,
            old_gc_threshold_pct: 50,
            promotion_age: 2,
            debug: false,
        }
    }

    #[test]
    fn alloc_never_collects_on_its_own() {
        // `Heap::alloc` only places the object; triggering is `maybe_collect`'s
        // job, called from the embedder's allocation chokepoint, not from
        // `alloc` itself — so a bare `alloc` loop never shrinks `young_count`.
        let mut heap = Heap::new(tiny_config());
        for i in 0..50 {
            heap.alloc(HeapData::Str(format!("padding-{i}")));
        }
        assert_eq!(heap.old_count(), 0);
        assert!(heap.young_count() > 0);
        assert_eq!(heap.stats.minor_collections, 0);
    }

    #[test]
    fn maybe_collect_reclaims_unreachable_young_objects_once_past_threshold() {
        let mut heap = Heap::new(tiny_config());
        for i in 0..50 {
            heap.alloc(HeapData::Str(format!("padding-{i}")));
        }
        assert!(heap.young_bytes >= tiny_config().semi_size_bytes / 2, "test setup should have crossed the young threshold");

        let mut roots = RootSet::new();
        heap.maybe_collect(&mut roots);

        assert_eq!(heap.stats.minor_collections, 1);
        assert_eq!(heap.young_count(), 0, "nothing was rooted, every young object should be freed");
        assert!(heap.stats.objects_freed_young > 0);
    }

    #[test]
    fn maybe_collect_keeps_rooted_values_reachable_through_a_collection() {
        let mut heap = Heap::new(tiny_config());
        let kept_ref = heap.alloc(HeapData::Str("kept".to_string()));
        let mut kept = Value::from_gc(ValueKind::Str, kept_ref);
        for i in 0..50 {
            heap.alloc(HeapData::Str(format!("padding-{i}")));
        }

        {
            let mut roots = RootSet { value_slices: vec![std::slice::from_mut(&mut kept)], handle_scopes: &mut [] };
            heap.maybe_collect(&mut roots);
        }

        assert_eq!(heap.young_count(), 1, "only the rooted value should survive");
        assert_eq!(kept.as_str(), Some("kept"));
    }

    #[test]
    fn collecting_flag_prevents_reentrant_collection() {
        // A collection in progress must not recursively trigger another one
        // (`collect_young`/`collect_old` themselves allocate forwarding boxes).
        let mut heap = Heap::new(tiny_config());
        heap.collecting = true;
        let mut roots = RootSet::new();
        heap.maybe_collect(&mut roots);
        assert_eq!(heap.stats.minor_collections, 0);
    }

    #[test]
    fn old_generation_collection_sweeps_unmarked_survivors() {
        let mut config = tiny_config();
        config.promotion_age = 0;
        let mut heap = Heap::new(config);

        let kept_ref = heap.alloc(HeapData::Str("kept".to_string()));
        let mut kept = Value::from_gc(ValueKind::Str, kept_ref);
        for i in 0..50 {
            heap.alloc(HeapData::Str(format!("padding-{i}")));
        }

        // A promotion_age of 0 promotes every survivor straight to old space
        // on its first minor collection.
        {
            let mut roots = RootSet { value_slices: vec![std::slice::from_mut(&mut kept)], handle_scopes: &mut [] };
            heap.maybe_collect(&mut roots);
        }
        assert!(heap.old_count() >= 1);

        for i in 0..50 {
            heap.alloc(HeapData::Str(format!("more-padding-{i}")));
        }
        {
            let mut roots = RootSet { value_slices: vec![std::slice::from_mut(&mut kept)], handle_scopes: &mut [] };
            heap.maybe_collect(&mut roots);
        }

        assert_eq!(heap.old_count(), 1, "only the rooted string should survive the major collection");
        assert_eq!(kept.as_str(), Some("kept"));
    }
}
