/// Runtime string table (§3.2). Strings are immutable and interned so
/// identical literals across a program share one heap allocation and
/// compare in O(1) when both operands are already interned.
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Default)]
pub struct StringInterner {
    table: HashMap<Rc<str>, u32>,
    strings: Vec<Rc<str>>,
}

impl StringInterner {
    pub fn new() -> Self {
        StringInterner { table: HashMap::new(), strings: Vec::new() }
    }

    pub fn intern(&mut self, s: &str) -> Rc<str> {
        if let Some(existing) = self.table.get(s) {
            return self.strings[*existing as usize].clone();
        }
        let rc: Rc<str> = Rc::from(s);
        let id = self.strings.len() as u32;
        self.strings.push(rc.clone());
        self.table.insert(rc.clone(), id);
        rc
    }

    pub fn get(&self, id: u32) -> Option<Rc<str>> {
        self.strings.get(id as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_the_same_text_twice_returns_the_same_allocation() {
        let mut interner = StringInterner::new();
        let a = interner.intern("hello");
        let b = interner.intern("hello");
        assert!(Rc::ptr_eq(&a, &b));
    }
}
