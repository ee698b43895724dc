/// Engine-wide tunables (§2.3). The values the spec bakes in as named
/// constants (`kSemiSize`, `kOldInitialSize`, `kLargeObjectThreshold`,
/// `gc_threshold%`, `kDictionaryThreshold`) are exposed here as an
/// overridable `EngineConfig` the embedder can construct before opening a
/// context, following the teacher's documented-property-table convention
/// but scoped to what this crate actually needs.
use crate::gc::GcConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Category {
    GC,
    Shape,
    Debug,
}

/// A single documented property, in the teacher's `PropDef` style.
#[derive(Debug, Clone)]
pub struct PropDef {
    pub name: &'static str,
    pub default: &'static str,
    pub description: &'static str,
    pub category: Category,
}

pub static ALL_PROPS: &[PropDef] = &[
    PropDef {
        name: "semi_size_bytes",
        default: "262144",
        description: "Size of each young-generation semi-space (kSemiSize).",
        category: Category::GC,
    },
    PropDef {
        name: "old_initial_size_bytes",
        default: "4194304",
        description: "Initial size of the old-generation region (kOldInitialSize).",
        category: Category::GC,
    },
    PropDef {
        name: "large_object_threshold_bytes",
        default: "16384",
        description: "Allocations at or above this size go directly to old space.",
        category: Category::GC,
    },
    PropDef {
        name: "young_gc_threshold_pct",
        default: "80",
        description: "Percentage of Eden fill that triggers a young collection.",
        category: Category::GC,
    },
    PropDef {
        name: "old_gc_threshold_pct",
        default: "80",
        description: "Percentage of old-space fill that triggers a full collection.",
        category: Category::GC,
    },
    PropDef {
        name: "dictionary_threshold",
        default: "64",
        description: "Property count past which a shape converts to dictionary mode (kDictionaryThreshold).",
        category: Category::Shape,
    },
    PropDef {
        name: "debug",
        default: "off",
        description: "Emit GC pause/module-resolution tracing to stderr.",
        category: Category::Debug,
    },
];

/// Embedder-facing configuration; `Context::new` consumes one of these to
/// build its `Heap` and `ShapeManager`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub gc: GcConfig,
    pub dictionary_threshold: u32,
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { gc: GcConfig::default(), dictionary_threshold: 64, debug: false }
    }
}

impl EngineConfig {
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self.gc.debug = debug;
        self
    }
}
