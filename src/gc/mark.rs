//! The mark engine (C7, §4.7): tri-color coloring primitives, field
//! scanners dispatched on the external type oracle's field descriptor,
//! and the drain loop that ties a [`MarkQueue`](super::mark_queue::MarkQueue)
//! together with a [`Deque`](super::deque::Deque) for work-stealing.

use crate::address::Address;
use crate::constants::BYTES_IN_WORD;
use crate::heap::big_object::BigHandle;
use crate::heap::page_table::PageMeta;
use crate::object::{GcBits, MarkMode, Value};
use crate::vm::{Binding, FieldDesc, TypeLayout};

use super::deque::{Deque, Steal};
use super::mark_queue::MarkQueue;

/// Running byte/pointer counters the controller folds into [`crate::stats::Stats`]
/// at the end of a cycle.
#[derive(Default, Clone, Copy)]
pub struct MarkStats {
    pub scanned: u64,
    pub perm_scanned: u64,
    pub remset_nptr: u64,
}

/// `setmark_pool_` (§4.7): counters for a pool-allocated object. Bumps
/// `page.nold` when promoting, marks the page as having live (marked)
/// content, and — under "reset age" mode — marks the page as having young
/// content again and clears the cell's survived-last-sweep bit.
pub fn setmark_pool_(
    page: &PageMeta,
    cell_index: usize,
    mode: MarkMode,
    was_old: bool,
    stats: &mut MarkStats,
    size: usize,
) {
    use std::sync::atomic::Ordering;
    if was_old {
        stats.perm_scanned += size as u64;
    } else {
        stats.scanned += size as u64;
        page.nold.fetch_add(1, Ordering::Relaxed);
    }
    page.has_marked.store(true, Ordering::Relaxed);
    if mode == MarkMode::ResetAge {
        page.has_young.store(true, Ordering::Relaxed);
        page.set_age_bit(cell_index, false);
    }
}

/// The cell index of `addr` within a page of the given cell size, used by
/// [`setmark_pool_`] to address the page's age bitmap.
pub fn cell_index_in_page(page_start: Address, addr: Address, cell_size: usize) -> usize {
    (addr.as_usize() - page_start.as_usize()) / cell_size
}

/// A per-big-object byte-counter update queued for the mutator's
/// big-object sync cache (§4.7 `setmark_big`, §5 "big-object cache flush
/// must happen before sweep reads the lists"). The actual cache and its
/// flush-to-list logic live with mutator state; this just records the
/// decision the mark engine made.
pub fn setmark_big(handle: BigHandle, was_old: bool, stats: &mut MarkStats) {
    let size = handle.size() as u64;
    if was_old {
        stats.perm_scanned += size;
    } else {
        stats.scanned += size;
    }
}

/// Outcome of scanning one object's fields: whether it points at anything
/// young, used to decide remset insertion (§4.7's `nptr` counter).
#[derive(Default)]
pub struct ScanOutcome {
    pub refers_young: bool,
}

fn read_slot(base: Address, byte_offset: usize) -> Option<Value> {
    let raw = unsafe { (base + byte_offset).load::<usize>() };
    if raw == 0 {
        None
    } else {
        Some(unsafe { Value::from_address(Address::from_usize(raw)) })
    }
}

/// Scan one object's outgoing pointers, dispatching on its
/// [`FieldDesc`], pushing every unmarked child it finds through `push`.
///
/// `push` is expected to itself call [`Value::try_setmark_tag`] (or rely
/// on the caller having already filtered to unmarked children) — this
/// function only discovers candidate children, it does not claim them.
pub fn scan_object<T: TypeLayout + ?Sized>(
    layout: &T,
    v: Value,
    mut push: impl FnMut(Value),
) -> ScanOutcome {
    let type_ptr = v.type_ptr();
    let mut outcome = ScanOutcome::default();
    let mut note = |child: Value| {
        if !child.gc_bits().is_old() {
            outcome.refers_young = true;
        }
        push(child);
    };

    match layout.field_desc(type_ptr) {
        FieldDesc::Obj8(offsets) => {
            for &off in offsets {
                if let Some(c) = read_slot(v.addr(), off as usize) {
                    note(c);
                }
            }
        }
        FieldDesc::Obj16(offsets) => {
            for &off in offsets {
                if let Some(c) = read_slot(v.addr(), off as usize * 2) {
                    note(c);
                }
            }
        }
        FieldDesc::Obj32(offsets) => {
            for &off in offsets {
                if let Some(c) = read_slot(v.addr(), off as usize * 4) {
                    note(c);
                }
            }
        }
        FieldDesc::ObjArray => {
            let size = layout.size_of(type_ptr, v);
            let n = size / BYTES_IN_WORD;
            for i in 0..n {
                if let Some(c) = read_slot(v.addr(), i * BYTES_IN_WORD) {
                    note(c);
                }
            }
        }
        FieldDesc::Stack => {
            // Singly linked chain of frames: [next: usize][nroots: usize][roots...].
            // A root whose low bit is tagged marks an unboxed callback slot
            // that follows it and must be skipped rather than dereferenced
            // (§4.7 "tagged finalizer entries").
            let mut frame = Some(v.addr());
            while let Some(base) = frame {
                let next_raw = unsafe { base.load::<usize>() };
                let nroots = unsafe { (base + BYTES_IN_WORD).load::<usize>() };
                let mut i = 0;
                while i < nroots {
                    let slot = base + (2 + i) * BYTES_IN_WORD;
                    let raw = unsafe { slot.load::<usize>() };
                    if raw & 1 != 0 {
                        // Tagged: next slot is a raw callback, not a value.
                        i += 2;
                        continue;
                    }
                    if raw != 0 {
                        note(unsafe { Value::from_address(Address::from_usize(raw)) });
                    }
                    i += 1;
                }
                frame = (next_raw != 0).then(|| Address::from_usize(next_raw));
            }
        }
        FieldDesc::ExcStack => {
            // [next: usize][is_native: usize][value: usize] per frame;
            // native frames carry no managed value to mark.
            let mut frame = Some(v.addr());
            while let Some(base) = frame {
                let next_raw = unsafe { base.load::<usize>() };
                let is_native = unsafe { (base + BYTES_IN_WORD).load::<usize>() } != 0;
                if !is_native {
                    if let Some(c) = read_slot(base, 2 * BYTES_IN_WORD) {
                        note(c);
                    }
                }
                frame = (next_raw != 0).then(|| Address::from_usize(next_raw));
            }
        }
        FieldDesc::ModuleBinding => {
            // [capacity: usize] then `capacity` rows of (value, globalref);
            // `0` in either slot is the HT_NOTFOUND sentinel.
            let cap = unsafe { v.addr().load::<usize>() };
            for i in 0..cap {
                let row = v.addr() + BYTES_IN_WORD + i * 2 * BYTES_IN_WORD;
                if let Some(c) = read_slot(row, 0) {
                    note(c);
                }
                if let Some(c) = read_slot(row, BYTES_IN_WORD) {
                    note(c);
                }
            }
        }
        FieldDesc::Dynamic => {
            let bitmask = layout.dyn_mark(type_ptr, v, &mut |child| note(child));
            if bitmask & 1 != 0 {
                outcome.refers_young = true;
            }
        }
    }
    outcome
}

/// One marker thread's local state: its own LIFO [`MarkQueue`], its own
/// [`Deque`] for peers to steal from, and the set of peer deques it may
/// steal from once its own queue and deque run dry.
pub struct Marker<'a> {
    pub queue: MarkQueue,
    pub deque: &'a Deque,
    pub peers: &'a [&'a Deque],
    pub stats: MarkStats,
}

impl<'a> Marker<'a> {
    pub fn new(deque: &'a Deque, peers: &'a [&'a Deque]) -> Self {
        Marker {
            queue: MarkQueue::new(),
            deque,
            peers,
            stats: MarkStats::default(),
        }
    }

    fn next_candidate(&self) -> Option<Value> {
        loop {
            if let Some(v) = self.deque.pop() {
                return Some(v);
            }
            let mut any_retry = false;
            for peer in self.peers {
                match peer.steal() {
                    Steal::Success(v) => return Some(v),
                    Steal::Retry => any_retry = true,
                    Steal::Empty => {}
                }
            }
            if !any_retry {
                return None;
            }
        }
    }

    /// `mark_loop` (§4.7): pop from the local LIFO, falling back to this
    /// marker's own deque then to stealing from peers; scan and push
    /// every unmarked child; terminate when every source is exhausted.
    ///
    /// A scan's first newly-discovered child stays on the local queue (so
    /// one marker can still run a tight depth-first descent on its own
    /// subgraph), but every child after that goes straight to `self.deque`
    /// instead: almost all mark work is discovered during scanning rather
    /// than present in the initial root set, so the deque has to keep
    /// receiving fresh work for `steal()` to actually balance anything.
    pub fn run<B: Binding>(
        &mut self,
        binding: &B,
        mode: MarkMode,
        mut on_remset_candidate: impl FnMut(Value),
    ) {
        loop {
            let v = match self.queue.pop() {
                Some(v) => v,
                None => match self.next_candidate() {
                    Some(v) => v,
                    None => break,
                },
            };
            let was_old = v.gc_bits().is_old();
            let outcome = scan_object(binding.type_layout(), v, |child| {
                if child.try_setmark_tag(mode).is_some() {
                    if self.queue.is_empty() {
                        self.queue.push(child);
                    } else {
                        self.deque.push(child);
                    }
                }
            });
            if was_old && outcome.refers_young {
                self.stats.remset_nptr += 1;
                on_remset_candidate(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockBinding;

    #[test]
    fn scanning_obj8_visits_every_field() {
        let binding = MockBinding::new();
        let layout = binding.type_layout();
        let a = layout.alloc_object(2);
        let child1 = layout.alloc_object(0);
        let child2 = layout.alloc_object(0);
        layout.set_field(a, 0, child1);
        layout.set_field(a, 1, child2);

        let mut found = Vec::new();
        scan_object(layout, a, |c| found.push(c));
        assert_eq!(found.len(), 2);
        assert!(found.contains(&child1));
        assert!(found.contains(&child2));
    }

    #[test]
    fn mark_loop_drains_deque_and_marks_children() {
        let binding = MockBinding::new();
        let layout = binding.type_layout();
        let a = layout.alloc_object(1);
        let b = layout.alloc_object(0);
        layout.set_field(a, 0, b);

        a.try_setmark_tag(MarkMode::Normal);
        let deque = Deque::new();
        deque.push(a);
        let mut marker = Marker::new(&deque, &[]);
        marker.run(&binding, MarkMode::Normal, |_| {});
        assert!(b.gc_bits().is_marked());
    }
}
