//! The sweep engine (C8, §4.8): the ordered stop-the-world pass that runs
//! once marking has drained. Each step here corresponds 1:1 to a numbered
//! step in §4.8; the controller (`collector.rs`) calls them in that order.

use crate::address::Address;
use crate::constants::{DEFAULT_LAZY_FREELIST_CAP, PAGE_OFFSET};
use crate::heap::big_object::{big_free, BigObjectList};
use crate::heap::page_alloc::PageAllocator;
use crate::heap::page_table::{Page, PageMeta};
use crate::heap::pool::Pool;
use crate::mutator::ManagedArray;
use crate::object::Value;
use crate::stats::Stats;

/// Step 4 (§4.8): free the backing buffer of every externally-tracked
/// array whose owning object did not survive marking.
pub fn sweep_malloced_arrays(
    arrays: &mut Vec<ManagedArray>,
    mut notify_free: impl FnMut(usize),
) {
    arrays.retain(|a| {
        if a.owner.gc_bits().is_marked() {
            true
        } else {
            unsafe { libc::free(a.ptr.as_mut_ptr()) };
            notify_free(a.size);
            false
        }
    });
}

/// Step 3 (§4.8): give every type that opted into a foreign sweep
/// callback a chance to run it before the object's storage is freed.
fn maybe_run_sweep_func<T: crate::vm::TypeLayout + ?Sized>(layout: &T, v: Value) {
    if let Some(f) = layout.sweep_func(v.type_ptr()) {
        f(v);
    }
}

/// Step 5 (§4.8): promote/demote big-object mark bits and free dead
/// backing storage. `full` additionally clears `OLD_MARKED` back to
/// `OLD` and merges `marked` into `live`. `notify_free` is called once per
/// reclaimed object with its original header size, mirroring the
/// `notify_external_alloc` call `alloc_big` makes on the way in.
pub fn sweep_big<T: crate::vm::TypeLayout + ?Sized>(
    layout: &T,
    live: &mut BigObjectList,
    marked: &mut BigObjectList,
    full: bool,
    stats: &Stats,
    mut notify_free: impl FnMut(usize),
) {
    let mut dead = Vec::new();
    for h in live.iter() {
        let v = h.value();
        if v.gc_bits().is_marked() {
            v.post_sweep_retag(true, full);
        } else {
            dead.push(h);
        }
    }
    for h in dead {
        maybe_run_sweep_func(layout, h.value());
        live.unlink(h);
        stats.record_free(h.size());
        notify_free(h.size());
        unsafe { big_free(h) };
    }
    if full {
        for h in marked.iter() {
            h.value().post_sweep_retag(true, true);
        }
        live.append(marked);
    }
}

/// Result of sweeping one page: either it was fully reclaimed (returned to
/// the page allocator) or it has a (possibly empty) rebuilt freelist.
pub enum PageSweepOutcome {
    Reclaimed,
    Kept { free_head: Address },
}

/// Step 6 (§4.8), one page. Walks every cell, rebuilds the freelist from
/// unmarked cells, sets age bits for marked cells, promotes old-enough
/// survivors, demotes `MARKED` back to `CLEAN`. Quick-sweep skip
/// heuristics (the `!has_marked`/`prev_nold == nold` fast paths) are the
/// caller's responsibility since they need page-table-wide counting this
/// function doesn't have visibility into.
pub fn sweep_page<T: crate::vm::TypeLayout + ?Sized>(
    layout: &T,
    page: Page,
    meta: &PageMeta,
    cell_size: usize,
    promote_if_survived: impl Fn(bool) -> bool,
    full: bool,
    stats: &Stats,
) -> PageSweepOutcome {
    use crate::address::Region;
    let start = page.start() + PAGE_OFFSET;
    let end = page.start() + crate::constants::PAGE_SZ;
    let mut cursor = start;
    let mut free_head = Address::ZERO;
    let mut free_tail = Address::ZERO;
    let mut any_live = false;
    let mut cell_index = 0usize;

    while cursor + cell_size <= end {
        let header_addr = cursor;
        let data_addr = cursor + crate::constants::BYTES_IN_WORD;
        let v = unsafe { Value::from_address(data_addr) };
        if v.gc_bits().is_marked() {
            any_live = true;
            // Read the bit the *previous* sweep left (whether this cell
            // already survived one sweep) before overwriting it for this
            // cycle.
            let survived_last_sweep = meta.get_age_bit(cell_index);
            meta.set_age_bit(cell_index, true);
            v.post_sweep_retag(promote_if_survived(survived_last_sweep), full);
        } else {
            // Dead: link into the freelist being rebuilt.
            maybe_run_sweep_func(layout, v);
            meta.set_age_bit(cell_index, false);
            stats.record_free(cell_size);
            unsafe { header_addr.store::<Address>(Address::ZERO) };
            if free_head.is_zero() {
                free_head = header_addr;
            } else {
                unsafe { free_tail.store::<Address>(header_addr) };
            }
            free_tail = header_addr;
        }
        cursor = cursor + cell_size;
        cell_index += 1;
    }

    if !any_live {
        PageSweepOutcome::Reclaimed
    } else {
        PageSweepOutcome::Kept { free_head }
    }
}

/// Step 6 orchestration across every page a pool owns, adopting survivors
/// back into the pool and returning fully-dead pages to the page
/// allocator (subject to the lazy-retention cap, §4.8 step 6).
pub fn sweep_pool<T: crate::vm::TypeLayout + ?Sized>(
    layout: &T,
    pool: &mut Pool,
    page_alloc: &PageAllocator,
    quick: bool,
    promote_if_survived: impl Fn(bool) -> bool,
    stats: &Stats,
) {
    let pages: Vec<Page> = pool.owned_pages().to_vec();
    let mut reclaimed_kept = 0usize;
    for page in pages {
        let Some(meta) = page_alloc.page_table().get(page) else { continue };
        if !meta.is_reclaimable() {
            // Has marked content: either skip via the quick-sweep fast
            // path or walk cells below.
            use std::sync::atomic::Ordering;
            let fast_path_eligible = quick
                && !meta.has_young.load(Ordering::Relaxed)
                && meta.prev_nold.load(Ordering::Relaxed) == meta.nold.load(Ordering::Relaxed);
            if fast_path_eligible {
                continue;
            }
            meta.prev_nold.store(meta.nold.load(Ordering::Relaxed), Ordering::Relaxed);
            meta.has_marked.store(false, Ordering::Relaxed);
            meta.has_young.store(false, Ordering::Relaxed);
            match sweep_page(layout, page, meta, pool.cell_size(), &promote_if_survived, !quick, stats) {
                PageSweepOutcome::Reclaimed => {
                    pool.remove_owned_page(page);
                    page_alloc.free_page(page);
                }
                PageSweepOutcome::Kept { free_head } => {
                    pool.adopt_swept_page(page, free_head);
                }
            }
            continue;
        }

        // Nothing was marked on this page this cycle: safe to fully
        // reclaim, or keep it empty up to the lazy-retention cap so the
        // next allocation burst doesn't immediately re-request a page.
        if quick && reclaimed_kept < DEFAULT_LAZY_FREELIST_CAP {
            reclaimed_kept += 1;
            pool.adopt_swept_page(page, Address::ZERO);
        } else {
            pool.remove_owned_page(page);
            page_alloc.free_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::size_class;
    use crate::object::MarkMode;
    use crate::test_util::MockLayout;

    #[test]
    fn sweep_reclaims_a_page_with_no_survivors() {
        let page_alloc = PageAllocator::new();
        let idx = size_class::classify(8).unwrap();
        let cell_size = size_class::cell_size(idx);
        let mut pool = Pool::new(idx, cell_size);
        pool.alloc(0, &page_alloc).unwrap();
        let stats = Stats::default();
        let layout = MockLayout::new();
        sweep_pool(&layout, &mut pool, &page_alloc, false, |_| false, &stats);
        assert!(pool.owned_pages().is_empty());
    }

    #[test]
    fn sweep_keeps_marked_survivors_allocatable() {
        let page_alloc = PageAllocator::new();
        let idx = size_class::classify(8).unwrap();
        let cell_size = size_class::cell_size(idx);
        let mut pool = Pool::new(idx, cell_size);
        let v = pool.alloc(0, &page_alloc).unwrap();
        unsafe { crate::object::Value::init_header(v.header_addr(), Address::from_usize(0x1000)) };
        v.try_setmark_tag(MarkMode::Normal);
        let page = pool.owned_pages()[0];
        page_alloc
            .page_table()
            .get(page)
            .unwrap()
            .has_marked
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let stats = Stats::default();
        let layout = MockLayout::new();
        sweep_pool(&layout, &mut pool, &page_alloc, false, |_| false, &stats);
        assert_eq!(pool.owned_pages().len(), 1);
        assert_eq!(v.gc_bits(), crate::object::GcBits::Clean);
    }
}
