//! The remembered set (§3 "Data model", §4.7's "generation contract"): a
//! per-mutator list of old objects that reference young ones, populated by
//! the write barrier and drained at the start of the next mark phase.
//!
//! A mutator keeps two lists, `remset` and `last_remset`: the write
//! barrier always appends to `remset`, while the premark phase (§4.10
//! step 3) rotates them so new inserts made *during* a collection don't
//! collide with the list the collector is currently walking.

use crate::object::Value;

#[derive(Default)]
pub struct RemSet {
    remset: Vec<Value>,
    last_remset: Vec<Value>,
}

impl RemSet {
    pub fn new() -> Self {
        RemSet::default()
    }

    /// Invoked by the write barrier (§5 "Remset publication"): the GC-bit
    /// re-tag to `MARKED`/`OLD_MARKED` happens in [`crate::object::Value`]
    /// methods; this only records the pointer so the next mark phase
    /// re-scans it as a generational root.
    pub fn push(&mut self, v: Value) {
        self.remset.push(v);
    }

    pub fn len(&self) -> usize {
        self.remset.len()
    }

    /// §4.10 phase 3: swap `remset` and `last_remset`, leaving `remset`
    /// empty for new barrier inserts and handing the previous cycle's
    /// entries to the caller to re-tag and requeue as roots.
    pub fn rotate(&mut self) -> Vec<Value> {
        std::mem::swap(&mut self.remset, &mut self.last_remset);
        std::mem::take(&mut self.last_remset)
    }

    /// Quick sweep (§4.8 step 8): entries are re-tagged back to
    /// `OLD_MARKED` (not cleared) so they remain generational roots next
    /// cycle too.
    pub fn retag_for_quick_sweep(&self) {
        for v in &self.remset {
            v.retag_remembered();
        }
    }

    /// Full sweep (§4.8 step 8): the intergenerational frontier is
    /// rebuilt from scratch by the next mark phase, so the set is simply
    /// cleared.
    pub fn clear_for_full_sweep(&mut self) {
        self.remset.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(n: usize) -> Value {
        unsafe { Value::from_address(crate::address::Address::from_usize(n)) }
    }

    #[test]
    fn rotate_empties_remset_and_returns_prior_entries() {
        let mut rs = RemSet::new();
        rs.push(fake(0x10));
        rs.push(fake(0x20));
        let rotated = rs.rotate();
        assert_eq!(rotated.len(), 2);
        assert_eq!(rs.len(), 0);
    }

    #[test]
    fn second_rotate_returns_entries_pushed_after_first() {
        let mut rs = RemSet::new();
        rs.push(fake(0x10));
        let _ = rs.rotate();
        rs.push(fake(0x30));
        let second = rs.rotate();
        assert_eq!(second.iter().map(|v| v.addr().as_usize()).collect::<Vec<_>>(), vec![0x30]);
    }
}
