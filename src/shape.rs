/// Hidden-class shape trie and property inline caches (§3.3, §4.6).
///
/// Grounded on the teacher's `inline_cache.rs` `Shape`/`PropIC`, generalized
/// from a flat `Vec<(String, u16)>` scan into the trie-with-transitions the
/// spec requires: shapes are immutable, shared, and reached by walking
/// `parent_shape` plus a per-shape transition cache keyed by property name.
use std::collections::HashMap;
use std::rc::Rc;

/// `kExists` is implicit: a slot only has a `PropertyEntry` once it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropFlags(u8);

impl PropFlags {
    pub const WRITABLE: PropFlags = PropFlags(0b001);
    pub const ENUMERABLE: PropFlags = PropFlags(0b010);
    pub const ACCESSOR: PropFlags = PropFlags(0b100);

    pub fn contains(self, other: PropFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PropFlags {
    type Output = PropFlags;
    fn bitor(self, rhs: PropFlags) -> PropFlags {
        PropFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct PropertyEntry {
    pub name: Rc<str>,
    pub slot: u32,
    pub flags: PropFlags,
}

pub struct ShapeNode {
    pub id: u32,
    pub parent: Option<Rc<ShapeNode>>,
    pub property: Option<PropertyEntry>,
    pub property_count: u32,
    /// Above a depth threshold, `by_name` is populated so lookup is O(1)
    /// instead of O(depth) — the spec's "fast path through a hash
    /// side-table built when depth exceeds a threshold".
    pub by_name: Option<HashMap<Rc<str>, PropertyEntry>>,
    transitions: std::cell::RefCell<HashMap<Rc<str>, Rc<ShapeNode>>>,
    pub is_dictionary: bool,
}

const HASH_SIDE_TABLE_DEPTH: u32 = 8;

impl ShapeNode {
    pub fn lookup(&self, name: &str) -> Option<PropertyEntry> {
        if let Some(table) = &self.by_name {
            return table.get(name).cloned();
        }
        let mut node = self;
        loop {
            if let Some(p) = &node.property {
                if &*p.name == name {
                    return Some(p.clone());
                }
            }
            match &node.parent {
                Some(parent) => node = parent,
                None => return None,
            }
        }
    }

    fn build_name_table(&self) -> HashMap<Rc<str>, PropertyEntry> {
        let mut table = self.parent.as_ref().map(|p| p.build_name_table()).unwrap_or_default();
        if let Some(p) = &self.property {
            table.insert(p.name.clone(), p.clone());
        }
        table
    }
}

pub struct ShapeManager {
    next_id: u32,
    empty_shape: Rc<ShapeNode>,
    pub dictionary_threshold: u32,
}

impl ShapeManager {
    pub fn new(dictionary_threshold: u32) -> Self {
        let empty_shape = Rc::new(ShapeNode {
            id: 0,
            parent: None,
            property: None,
            property_count: 0,
            by_name: None,
            transitions: std::cell::RefCell::new(HashMap::new()),
            is_dictionary: false,
        });
        ShapeManager { next_id: 1, empty_shape, dictionary_threshold }
    }

    pub fn empty_shape(&self) -> Rc<ShapeNode> {
        self.empty_shape.clone()
    }

    /// `AddProperty`: follow a cached transition on `parent` for `name`, or
    /// allocate and cache a new child shape. Two objects that apply the
    /// same key sequence converge on the same node (Testable Property 3).
    pub fn add_property(&mut self, parent: &Rc<ShapeNode>, name: &str, flags: PropFlags) -> (Rc<ShapeNode>, u32) {
        if let Some(existing) = parent.transitions.borrow().get(name) {
            let slot = existing.property.as_ref().unwrap().slot;
            return (existing.clone(), slot);
        }

        let slot = parent.property_count;
        let id = self.next_id;
        self.next_id += 1;
        let name_rc: Rc<str> = Rc::from(name);
        let property = PropertyEntry { name: name_rc.clone(), slot, flags };
        let property_count = parent.property_count + 1;

        let by_name = if property_count > HASH_SIDE_TABLE_DEPTH {
            let mut table = parent.by_name.clone().unwrap_or_else(|| parent.build_name_table());
            table.insert(name_rc, property.clone());
            Some(table)
        } else {
            None
        };

        let child = Rc::new(ShapeNode {
            id,
            parent: Some(parent.clone()),
            property: Some(property),
            property_count,
            by_name,
            transitions: std::cell::RefCell::new(HashMap::new()),
            is_dictionary: property_count > self.dictionary_threshold,
        });

        parent.transitions.borrow_mut().insert(Rc::from(name), child.clone());
        (child.clone(), slot)
    }
}

/// Inline-cache state machine for a single bytecode property-access site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcState {
    Uninitialized,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

const IC_MAX_POLY: usize = 4;

#[derive(Clone)]
pub struct PropIc {
    pub state: IcState,
    entries: Vec<(u32, u32)>, // (shape_id, slot)
}

impl PropIc {
    pub fn new() -> Self {
        PropIc { state: IcState::Uninitialized, entries: Vec::new() }
    }

    pub fn lookup(&self, shape_id: u32) -> Option<u32> {
        self.entries.iter().find(|(id, _)| *id == shape_id).map(|(_, slot)| *slot)
    }

    pub fn update(&mut self, shape_id: u32, slot: u32) {
        if self.entries.iter().any(|(id, _)| *id == shape_id) {
            return;
        }
        match self.state {
            IcState::Uninitialized => {
                self.state = IcState::Monomorphic;
                self.entries.push((shape_id, slot));
            }
            IcState::Monomorphic | IcState::Polymorphic if self.entries.len() < IC_MAX_POLY => {
                self.state = IcState::Polymorphic;
                self.entries.push((shape_id, slot));
            }
            _ => {
                self.state = IcState::Megamorphic;
                self.entries.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_insertion_sequences_share_a_shape() {
        let mut mgr = ShapeManager::new(64);
        let root = mgr.empty_shape();
        let (s1, _) = mgr.add_property(&root, "x", PropFlags::WRITABLE | PropFlags::ENUMERABLE);
        let (s2, _) = mgr.add_property(&s1, "y", PropFlags::WRITABLE | PropFlags::ENUMERABLE);

        let (t1, _) = mgr.add_property(&root, "x", PropFlags::WRITABLE | PropFlags::ENUMERABLE);
        let (t2, _) = mgr.add_property(&t1, "y", PropFlags::WRITABLE | PropFlags::ENUMERABLE);

        assert_eq!(s2.id, t2.id);
    }

    #[test]
    fn ic_escalates_monomorphic_to_polymorphic_to_megamorphic() {
        let mut ic = PropIc::new();
        ic.update(1, 0);
        assert_eq!(ic.state, IcState::Monomorphic);
        ic.update(2, 0);
        assert_eq!(ic.state, IcState::Polymorphic);
        for shape_id in 3..10 {
            ic.update(shape_id, 0);
        }
        assert_eq!(ic.state, IcState::Megamorphic);
    }
}
