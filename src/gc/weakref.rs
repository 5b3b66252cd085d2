//! Weak references (§3 "Weak references", §4.8 step 1): a per-mutator
//! list of weak-ref cells, each holding one field that points at its
//! referent. After marking, any weak reference whose referent did not get
//! marked has that field cleared to a canonical sentinel so the mutator
//! never observes a dangling pointer.

use crate::address::Address;
use crate::object::Value;

/// A weak reference cell. `referent_field` is the address of the word
/// inside the cell that holds the (possibly already-cleared) pointer,
/// matching how field scanners elsewhere in the mark engine address
/// fields by offset rather than by Rust reference.
#[derive(Clone, Copy)]
pub struct WeakRef {
    referent_field: Address,
}

/// The sentinel a cleared weak reference's field is set to. Matches
/// `Value`'s "never zero" invariant being irrelevant here — this is a
/// plain address write, not a `Value`, so `ZERO` is a safe canonical
/// "nothing" the mutator can test for.
pub const CLEARED_SENTINEL: Address = Address::ZERO;

impl WeakRef {
    pub fn new(referent_field: Address) -> Self {
        WeakRef { referent_field }
    }

    fn referent(&self) -> Option<Value> {
        let raw = unsafe { self.referent_field.load::<usize>() };
        if raw == 0 {
            None
        } else {
            Some(unsafe { Value::from_address(Address::from_usize(raw)) })
        }
    }

    fn clear(&self) {
        unsafe { self.referent_field.store::<usize>(0) };
    }
}

#[derive(Default)]
pub struct WeakRefList {
    entries: Vec<WeakRef>,
}

impl WeakRefList {
    pub fn new() -> Self {
        WeakRefList::default()
    }

    pub fn register(&mut self, w: WeakRef) {
        self.entries.push(w);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `gc_sweep_weak_refs` (§4.8 step 1): null out the referent of every
    /// weak reference whose target did not survive marking.
    pub fn sweep(&mut self) {
        self.entries.retain(|w| match w.referent() {
            Some(v) if v.gc_bits().is_marked() => true,
            Some(_) => {
                w.clear();
                true
            }
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MarkMode;
    use std::alloc::{alloc, Layout};

    fn alloc_object() -> Value {
        let layout = Layout::from_size_align(16, 16).unwrap();
        let base = unsafe { alloc(layout) };
        let addr = Address::from_usize(base as usize);
        unsafe { Value::init_header(addr, Address::from_usize(0x1000)) };
        unsafe { Value::from_address(addr + crate::constants::BYTES_IN_WORD) }
    }

    #[test]
    fn marked_referent_survives_sweep() {
        let target = alloc_object();
        target.try_setmark_tag(MarkMode::Normal);
        let field = Address::from_usize(Box::into_raw(Box::new(target.addr().as_usize())) as usize);
        let mut list = WeakRefList::new();
        list.register(WeakRef::new(field));
        list.sweep();
        assert_eq!(unsafe { field.load::<usize>() }, target.addr().as_usize());
    }

    #[test]
    fn unmarked_referent_is_cleared() {
        let target = alloc_object();
        let field = Address::from_usize(Box::into_raw(Box::new(target.addr().as_usize())) as usize);
        let mut list = WeakRefList::new();
        list.register(WeakRef::new(field));
        list.sweep();
        assert_eq!(unsafe { field.load::<usize>() }, 0);
    }
}
