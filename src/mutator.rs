//! Per-mutator (per-thread) heap state (§4.2's "single-writer" heaps, §5):
//! the pools for every size class, the big-object live list, remembered
//! set, finalizer list, weak-reference list, and the allocation counters
//! that decide when to trigger a collection.

use crate::address::Address;
use crate::gc::finalizer::FinalizerList;
use crate::gc::remset::RemSet;
use crate::gc::weakref::WeakRefList;
use crate::heap::big_object::{BigHandle, BigObjectList};
use crate::heap::pool::Pool;
use crate::heap::size_class;
use crate::object::{GcBits, Value};

/// One externally-backed buffer handed out by `managed_malloc` (§4.8 step
/// 4, `sweep_malloced_arrays`): freed when its owning GC object is no
/// longer marked.
pub struct ManagedArray {
    pub owner: Value,
    pub ptr: Address,
    pub size: usize,
}

/// A per-mutator allocation-budget countdown. `allocd` starts at
/// `-(interval)` and counts up toward zero as bytes are allocated;
/// crossing zero is the allocation-path trigger for `maybe_collect`
/// (§4.2 "Per allocation").
pub struct Mutator {
    pub id: usize,
    pools: Vec<Pool>,
    pub big_objects: BigObjectList,
    /// Big headers marked this cycle, not yet flushed to `big_objects` or
    /// the collector's global `big_objects_marked` list (§4.7
    /// `setmark_big`, §5 "big-object cache flush must happen before sweep
    /// reads the lists").
    big_object_sync_cache: Vec<BigHandle>,
    pub remset: RemSet,
    pub finalizers: FinalizerList,
    pub weakrefs: WeakRefList,
    pub managed_arrays: Vec<ManagedArray>,

    allocd: isize,
    poolalloc: usize,
    /// Nonzero while `disable_gc` has been requested more times than
    /// re-enabled; `collect()` on this mutator defers into
    /// `deferred_alloc` while this is set (§4.10 "Entry").
    disable_gc: usize,
    deferred_alloc: usize,
}

impl Mutator {
    pub fn new(id: usize, default_interval: usize) -> Self {
        Mutator {
            id,
            pools: (0..size_class::num_classes())
                .map(|idx| Pool::new(idx, size_class::cell_size(idx)))
                .collect(),
            big_objects: BigObjectList::new(),
            big_object_sync_cache: Vec::new(),
            remset: RemSet::new(),
            finalizers: FinalizerList::new(),
            weakrefs: WeakRefList::new(),
            managed_arrays: Vec::new(),
            allocd: -(default_interval as isize),
            poolalloc: 0,
            disable_gc: 0,
            deferred_alloc: 0,
        }
    }

    pub fn pool_mut(&mut self, class_index: usize) -> &mut Pool {
        &mut self.pools[class_index]
    }

    pub fn pools_mut(&mut self) -> impl Iterator<Item = &mut Pool> {
        self.pools.iter_mut()
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.iter()
    }

    pub fn is_gc_disabled(&self) -> bool {
        self.disable_gc != 0
    }

    pub fn enable(&mut self, enabled: bool) {
        if enabled {
            self.disable_gc = self.disable_gc.saturating_sub(1);
        } else {
            self.disable_gc += 1;
        }
    }

    /// §4.2 "Per allocation": increment the per-thread counters; returns
    /// `true` once `allocd` has crossed zero, meaning the caller should
    /// run `maybe_collect`. If the collector is disabled the byte count
    /// is stashed in `deferred_alloc` instead (§4.10 "Entry") and no
    /// trigger fires.
    pub fn record_alloc(&mut self, size: usize) -> bool {
        self.poolalloc += size;
        if self.is_gc_disabled() {
            self.deferred_alloc += size;
            return false;
        }
        self.allocd += size as isize;
        self.allocd >= 0
    }

    pub fn take_deferred_alloc(&mut self) -> usize {
        std::mem::take(&mut self.deferred_alloc)
    }

    /// Called by the controller once a cycle completes, to reset this
    /// mutator's countdown to the newly computed interval (§4.10 step
    /// 10).
    pub fn reset_interval(&mut self, interval: usize) {
        self.allocd = -(interval as isize);
        self.poolalloc = 0;
    }

    pub fn queue_big_mark(&mut self, handle: BigHandle) {
        self.big_object_sync_cache.push(handle);
    }

    /// Flush the big-object sync cache (§5 ordering rule (ii)): every
    /// handle marked this cycle either stays on `big_objects` (it already
    /// was there) or is the caller's job to merge in from the global
    /// marked list — the cache itself carries no new list membership,
    /// only the fact that these handles were touched this cycle.
    pub fn drain_big_mark_cache(&mut self) -> Vec<BigHandle> {
        std::mem::take(&mut self.big_object_sync_cache)
    }

    /// The write barrier (§4.7 "Generation contract", §5 ordering rule
    /// (iii)): invoked by mutator stores, never by the collector. If
    /// `parent` is `OLD` (not yet remembered this cycle), re-tag it to
    /// `OLD_MARKED` and push it onto the remembered set so the next mark
    /// phase treats it as a generational root.
    pub fn write_barrier(&mut self, parent: Value) {
        if parent.gc_bits() == GcBits::Old {
            parent.retag_remembered();
            self.remset.push(parent);
        }
    }

    /// Bulk variant for a store that may touch many parents at once (e.g.
    /// an array fill), matching the original collector's distinct
    /// `jl_gc_multi_wb` entry point.
    pub fn write_barrier_multi(&mut self, parents: impl IntoIterator<Item = Value>) {
        for p in parents {
            self.write_barrier(p);
        }
    }

    /// Module/global-binding variant (`jl_gc_wb_binding`'s analogue):
    /// same barrier, distinguished at the call site so a binding can be
    /// told apart from an ordinary field store for the purposes of
    /// `rem_bindings` bookkeeping (§4.8 step 8).
    pub fn write_barrier_binding(&mut self, parent: Value) {
        self.write_barrier(parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_alloc_triggers_once_budget_crossed() {
        let mut m = Mutator::new(0, 100);
        assert!(!m.record_alloc(50));
        assert!(m.record_alloc(60));
    }

    #[test]
    fn disabled_gc_defers_instead_of_triggering() {
        let mut m = Mutator::new(0, 10);
        m.enable(false);
        assert!(!m.record_alloc(1000));
        assert_eq!(m.take_deferred_alloc(), 1000);
    }

    #[test]
    fn write_barrier_only_fires_once_per_old_object() {
        let layout = crate::test_util::MockLayout::new();
        let obj = layout.alloc_object(0);
        unsafe {
            obj.header_addr()
                .store_atomic_usize(obj.type_ptr().as_usize() | GcBits::Old as usize, std::sync::atomic::Ordering::Relaxed)
        };
        let mut m = Mutator::new(0, 100);
        m.write_barrier(obj);
        assert_eq!(m.remset.len(), 1);
        m.write_barrier(obj); // now OLD_MARKED; no duplicate insert
        assert_eq!(m.remset.len(), 1);
    }
}
