//! The per-`(mutator, size-class)` pool allocator (C2, §4.2): a
//! freelist-then-bump allocator over 16 KiB pages, matching the teacher's
//! native mark-sweep `BlockList`/`Block` allocation order (freelist first,
//! then bump the active block, then pop the next block, then ask the page
//! resource for a fresh one) but over fixed-size-class pages instead of
//! MiMalloc-style variable-cell blocks.

use crate::address::{Address, Region};
use crate::constants::PAGE_OFFSET;
use crate::error::GcResult;
use crate::heap::page_alloc::PageAllocator;
use crate::heap::page_table::{Page, PageMeta};
use crate::object::Value;

/// One pool: the allocator state for a single size class on a single
/// mutator. Pools are not `Sync` — each mutator owns its own pools and
/// only the owning thread ever allocates from them (§5 "Per-mutator heaps
/// are single-writer").
pub struct Pool {
    class_index: usize,
    cell_size: usize,
    /// Head of the intra-page freelist: a cell address, or `Address::ZERO`
    /// when empty. Free cells store the next link in their own first
    /// word (the header slot), the same repurposing the teacher's sweep
    /// does when it writes `last` into a dead cell.
    freelist: Address,
    /// The single page currently being bumped into (§4.2's "reset_page
    /// inserts as the first of an existing new-pages chain so only one
    /// page is bumped into at a time" — relied on by the conservative
    /// base-pointer lookup, §9).
    current: Option<Page>,
    cursor: Address,
    limit: Address,
    /// Pages allocated but not yet bumped into.
    new_pages: Vec<Page>,
    /// Every page this pool currently owns (including `current` and
    /// `new_pages`), for the sweep engine's per-mutator traversal.
    owned_pages: Vec<Page>,
}

impl Pool {
    pub fn new(class_index: usize, cell_size: usize) -> Self {
        Pool {
            class_index,
            cell_size,
            freelist: Address::ZERO,
            current: None,
            cursor: Address::ZERO,
            limit: Address::ZERO,
            new_pages: Vec::new(),
            owned_pages: Vec::new(),
        }
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn owned_pages(&self) -> &[Page] {
        &self.owned_pages
    }

    /// `pool_alloc` (§4.2) fast/slow path. Returns the object's data
    /// address (header uninitialized — callers must call
    /// [`Value::init_header`]).
    pub fn alloc(
        &mut self,
        thread_n: u32,
        page_alloc: &PageAllocator,
    ) -> GcResult<Value> {
        if !self.freelist.is_zero() {
            let cell = self.freelist;
            let next = unsafe { cell.load::<Address>() };
            self.freelist = next;
            return Ok(unsafe { Value::from_address(cell + crate::constants::BYTES_IN_WORD) });
        }

        if self.cursor != self.limit {
            let cell = self.cursor;
            self.cursor = self.cursor + self.cell_size;
            return Ok(unsafe { Value::from_address(cell + crate::constants::BYTES_IN_WORD) });
        }

        if let Some(page) = self.new_pages.pop() {
            self.bump_into(page, page_alloc);
            return self.alloc(thread_n, page_alloc);
        }

        let (page, meta) = page_alloc.alloc_page()?;
        self.reset_page(page, meta, thread_n);
        self.owned_pages.push(page);
        self.bump_into(page, page_alloc);
        self.alloc(thread_n, page_alloc)
    }

    /// `reset_page` (§4.2): compute `nfree`, zero age bits, and install
    /// page ownership metadata. Does not itself start bumping — that is
    /// `bump_into`'s job, keeping "only one page is the current bump
    /// target" an invariant this module enforces structurally rather than
    /// by convention.
    fn reset_page(&self, page: Page, meta: &PageMeta, thread_n: u32) {
        use std::sync::atomic::Ordering;
        let usable = crate::constants::PAGE_SZ - PAGE_OFFSET;
        meta.osize.store(self.cell_size as u32, Ordering::Relaxed);
        meta.nfree
            .store((usable / self.cell_size) as u32, Ordering::Relaxed);
        meta.nold.store(0, Ordering::Relaxed);
        meta.prev_nold.store(0, Ordering::Relaxed);
        meta.has_young.store(false, Ordering::Relaxed);
        meta.has_marked.store(false, Ordering::Relaxed);
        meta.fl_begin_offset
            .store(crate::constants::NO_OFFSET as i32, Ordering::Relaxed);
        meta.fl_end_offset
            .store(crate::constants::NO_OFFSET as i32, Ordering::Relaxed);
        meta.clear_age_bits();
        meta.pool_n.store(self.class_index as u32, Ordering::Relaxed);
        meta.thread_n.store(thread_n, Ordering::Relaxed);
        let _ = page;
    }

    fn bump_into(&mut self, page: Page, _page_alloc: &PageAllocator) {
        self.current = Some(page);
        self.cursor = page.start() + PAGE_OFFSET;
        self.limit = page.start() + crate::constants::PAGE_SZ;
    }

    /// Called by the sweep engine (§4.8 step 6) after a page's freelist
    /// has been rebuilt, to hand an emptied/lazily-retained page back
    /// into this pool's rotation instead of returning it to the page
    /// allocator.
    pub fn adopt_swept_page(&mut self, page: Page, free_head: Address) {
        if free_head.is_zero() {
            // Nothing usable; treat it as a fresh bump target next time.
            self.new_pages.push(page);
        } else if self.freelist.is_zero() {
            self.freelist = free_head;
        } else {
            // Splice the page's freelist onto the end of ours by walking
            // to the tail. Pages are at most a few hundred cells, so this
            // is cheap relative to the sweep that produced the list.
            let mut tail = self.freelist;
            loop {
                let next = unsafe { tail.load::<Address>() };
                if next.is_zero() {
                    break;
                }
                tail = next;
            }
            unsafe { tail.store::<Address>(free_head) };
        }
    }

    pub fn remove_owned_page(&mut self, page: Page) {
        self.owned_pages.retain(|p| *p != page);
        self.new_pages.retain(|p| *p != page);
        if self.current == Some(page) {
            self.current = None;
            self.cursor = Address::ZERO;
            self.limit = Address::ZERO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::size_class;

    #[test]
    fn bump_allocates_distinct_cells() {
        let page_alloc = PageAllocator::new();
        let idx = size_class::classify(8).unwrap();
        let mut pool = Pool::new(idx, size_class::cell_size(idx));
        let a = pool.alloc(0, &page_alloc).unwrap();
        let b = pool.alloc(0, &page_alloc).unwrap();
        assert_ne!(a.addr(), b.addr());
    }

    #[test]
    fn freelist_is_reused_before_bumping() {
        let page_alloc = PageAllocator::new();
        let idx = size_class::classify(8).unwrap();
        let mut pool = Pool::new(idx, size_class::cell_size(idx));
        let a = pool.alloc(0, &page_alloc).unwrap();
        // Simulate the sweeper freeing `a`'s cell back to this pool.
        pool.adopt_swept_page(pool.current.unwrap(), a.header_addr());
        unsafe { a.header_addr().store::<Address>(Address::ZERO) };
        let b = pool.alloc(0, &page_alloc).unwrap();
        assert_eq!(a.addr(), b.addr());
    }

    #[test]
    fn exhausting_a_page_allocates_a_new_one() {
        let page_alloc = PageAllocator::new();
        let idx = size_class::classify(8).unwrap();
        let cell_size = size_class::cell_size(idx);
        let mut pool = Pool::new(idx, cell_size);
        let per_page = (crate::constants::PAGE_SZ - PAGE_OFFSET) / cell_size;
        for _ in 0..per_page + 1 {
            pool.alloc(0, &page_alloc).unwrap();
        }
        assert_eq!(pool.owned_pages().len(), 2);
    }
}
