//! Conservative interior-pointer resolution, gated behind the
//! `conservative_gc` feature (§9 Open Question: "reset-age disabled under
//! conservative GC support", resolved in DESIGN.md).
//!
//! A runtime with no explicit stack maps has to treat every machine word on
//! a conservatively-scanned stack as a possible pointer. [`internal_obj_base_ptr`]
//! decides whether such a word points inside a live GC allocation and, if so,
//! returns the object's base [`Value`] so the mark phase can root it the same
//! way it roots an explicit reference.
//!
//! Conservative scanners are inherently over-approximate: the failure mode
//! on an ambiguous word must be "treat it as a root" (spurious retention for
//! one extra cycle), never "ignore it" (which could free a live object).
//! This module follows that rule — it rejects a candidate only when it can
//! prove the candidate cannot be a live object's header (out of bounds, or a
//! header word that is still all zero, meaning the cell was never
//! initialized or was just zeroed by sweep). A freed cell that has already
//! been relinked onto a pool's freelist stores its `next` pointer in that
//! same header word and so is not reliably distinguishable from a live
//! object by this check alone; accepting it is the safe direction to err in.

use crate::address::{Address, Region};
use crate::heap::big_object::BigObjectList;
use crate::heap::page_table::{Page, PageTable};
use crate::object::Value;

/// Resolve `ptr` to the GC object that contains it, if any. Checks the
/// page table first (the common case for conservatively-scanned stack
/// slots), then falls back to a linear scan of `big_objects`.
pub fn internal_obj_base_ptr(ptr: Address, page_table: &PageTable, big_objects: &BigObjectList) -> Option<Value> {
    pool_base_ptr(ptr, page_table).or_else(|| big_object_base_ptr(ptr, big_objects))
}

pub(crate) fn pool_base_ptr(ptr: Address, page_table: &PageTable) -> Option<Value> {
    let page = Page::containing(ptr);
    let meta = page_table.get(page)?;

    let osize = meta.osize.load(std::sync::atomic::Ordering::Relaxed) as usize;
    if osize == 0 {
        return None; // Page not (yet) claimed by a pool.
    }

    let region_start = page.start() + crate::constants::PAGE_OFFSET;
    if ptr < region_start {
        return None; // Falls in the page header, not a cell.
    }
    let offset = ptr - region_start;
    let cell_index = offset / osize;
    let cell_start = region_start + cell_index * osize;
    let data_addr = cell_start + crate::constants::BYTES_IN_WORD;
    if data_addr.as_usize() - page.start().as_usize() >= crate::constants::PAGE_SZ {
        return None; // Interior pointer past the last whole cell.
    }

    // `nfree == 0` means every cell on this page is live: no freelist
    // exists to confuse a freed-and-relinked cell with a live one, so
    // every in-bounds cell is accepted outright.
    let nfree = meta.nfree.load(std::sync::atomic::Ordering::Relaxed);
    if nfree > 0 {
        // A cell is rejected only when its header word is still the
        // all-zero state sweep leaves a just-freed cell in, or that a
        // freshly mapped (never-bumped-into) page starts in. Anything
        // else — including a relinked freelist cell whose header now
        // holds a `next` pointer — is accepted; see module docs.
        let raw = cell_start.load_atomic_usize(std::sync::atomic::Ordering::Relaxed);
        if raw == 0 {
            return None;
        }
    }

    Some(unsafe { Value::from_address(data_addr) })
}

pub(crate) fn big_object_base_ptr(ptr: Address, big_objects: &BigObjectList) -> Option<Value> {
    for h in big_objects.iter() {
        let v = h.value();
        let start = v.addr();
        let end = start + h.size();
        if ptr >= start && ptr < end {
            return Some(v);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::big_object;
    use crate::heap::page_alloc::PageAllocator;
    use crate::heap::pool::Pool;
    use crate::heap::size_class;

    #[test]
    fn resolves_an_interior_pointer_into_a_live_cell() {
        let page_alloc = PageAllocator::new();
        let idx = size_class::classify(64).unwrap();
        let cell_size = size_class::cell_size(idx);
        let mut pool = Pool::new(idx, cell_size);
        let v = pool.alloc(0, &page_alloc).unwrap();
        unsafe { Value::init_header(v.header_addr(), Address::from_usize(0x1000)) };

        let interior = v.addr() + 4;
        let found = internal_obj_base_ptr(interior, page_alloc.page_table(), &BigObjectList::new());
        assert_eq!(found, Some(v));
    }

    #[test]
    fn rejects_a_pointer_into_a_never_bumped_cell() {
        let page_alloc = PageAllocator::new();
        let idx = size_class::classify(64).unwrap();
        let cell_size = size_class::cell_size(idx);
        let mut pool = Pool::new(idx, cell_size);
        let v = pool.alloc(0, &page_alloc).unwrap();
        unsafe { Value::init_header(v.header_addr(), Address::from_usize(0x1000)) };
        let next_cell = v.header_addr() + cell_size;

        let found = internal_obj_base_ptr(next_cell + 4, page_alloc.page_table(), &BigObjectList::new());
        assert_eq!(found, None);
    }

    #[test]
    fn resolves_a_big_object_interior_pointer() {
        let h = big_object::big_alloc(256, Address::from_usize(0x1000), 1).unwrap();
        let v = h.value();
        let list = {
            let mut l = BigObjectList::new();
            l.push_front(h);
            l
        };
        let found = internal_obj_base_ptr(v.addr() + 16, &PageTable::new(), &list);
        assert_eq!(found, Some(v));
        unsafe { big_object::big_free(h) };
    }
}
