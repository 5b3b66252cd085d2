//! A 3-level sparse page table mapping a page-aligned [`Address`] to its
//! out-of-band [`PageMeta`] (§3 "Page", §4.1). Modeled on the teacher's
//! `ChunkMap`/side-metadata pattern of keeping per-region bookkeeping out
//! of the region itself, but addressed through an explicit radix tree the
//! way the original collector's `pagetable{0,1,2}_t` levels are, rather
//! than a side-metadata byte map, since §4.8 relies on being able to
//! "clear the allocmap bit of a subtree" to skip whole empty regions
//! during sweep.

use crate::address::{Address, Region};
use crate::constants::{LOG_PAGE_SZ, NUM_SZCLASSES, PAGE_SZ};
use spin::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A single 16 KiB pool page (§3).
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd)]
pub struct Page(Address);

impl Region for Page {
    const LOG_BYTES: usize = LOG_PAGE_SZ;

    fn from_aligned_address(address: Address) -> Self {
        debug_assert!(address.is_aligned_to(Self::BYTES));
        Page(address)
    }

    fn start(&self) -> Address {
        self.0
    }
}

/// Max cells addressable per page is bounded by the smallest cell size
/// (`HEAP_ALIGN` bytes), so the age bitmap has a fixed worst-case width.
const MAX_CELLS_PER_PAGE: usize = PAGE_SZ / crate::constants::HEAP_ALIGN;
const AGE_BITMAP_WORDS: usize = MAX_CELLS_PER_PAGE / 64;

/// Out-of-band metadata for one page (§3 "Page").
pub struct PageMeta {
    /// Owning pool index within its thread.
    pub pool_n: AtomicU32,
    /// Owning mutator id.
    pub thread_n: AtomicU32,
    /// Cell size for this page's size class.
    pub osize: AtomicU32,
    /// Number of free cells.
    pub nfree: AtomicU32,
    /// Number of old (promoted) cells.
    pub nold: AtomicU32,
    /// `nold` as of the last full sweep, used by the quick-sweep fast
    /// path (§4.8 step 6) to skip pages with no promotion activity.
    pub prev_nold: AtomicU32,
    pub has_young: std::sync::atomic::AtomicBool,
    pub has_marked: std::sync::atomic::AtomicBool,
    /// Freelist range within the page, or [`crate::constants::NO_OFFSET`].
    pub fl_begin_offset: std::sync::atomic::AtomicI32,
    pub fl_end_offset: std::sync::atomic::AtomicI32,
    /// 1 bit per cell; set = survived last sweep.
    age_bitmap: [AtomicU64; AGE_BITMAP_WORDS],
}

impl PageMeta {
    fn new() -> Self {
        PageMeta {
            pool_n: AtomicU32::new(0),
            thread_n: AtomicU32::new(0),
            osize: AtomicU32::new(0),
            nfree: AtomicU32::new(0),
            nold: AtomicU32::new(0),
            prev_nold: AtomicU32::new(0),
            has_young: std::sync::atomic::AtomicBool::new(false),
            has_marked: std::sync::atomic::AtomicBool::new(false),
            fl_begin_offset: std::sync::atomic::AtomicI32::new(crate::constants::NO_OFFSET as i32),
            fl_end_offset: std::sync::atomic::AtomicI32::new(crate::constants::NO_OFFSET as i32),
            age_bitmap: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn get_age_bit(&self, cell_index: usize) -> bool {
        let word = self.age_bitmap[cell_index / 64].load(Ordering::Relaxed);
        (word >> (cell_index % 64)) & 1 != 0
    }

    pub fn set_age_bit(&self, cell_index: usize, value: bool) {
        let mask = 1u64 << (cell_index % 64);
        if value {
            self.age_bitmap[cell_index / 64].fetch_or(mask, Ordering::Relaxed);
        } else {
            self.age_bitmap[cell_index / 64].fetch_and(!mask, Ordering::Relaxed);
        }
    }

    pub fn clear_age_bits(&self) {
        for w in self.age_bitmap.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// A page is safe to fully reclaim exactly when nothing on it was
    /// marked this cycle (invariant 5 in §8).
    pub fn is_reclaimable(&self) -> bool {
        !self.has_marked.load(Ordering::Relaxed)
    }
}

#[cfg(target_pointer_width = "64")]
mod widths {
    pub const L1_BITS: usize = 10;
    pub const L2_BITS: usize = 12;
    pub const L3_BITS: usize = 12;
}
#[cfg(target_pointer_width = "32")]
mod widths {
    pub const L1_BITS: usize = 0;
    pub const L2_BITS: usize = 0;
    pub const L3_BITS: usize = 32 - super::LOG_PAGE_SZ;
}

use widths::{L1_BITS, L2_BITS, L3_BITS};

type Level3 = Vec<Option<Box<PageMeta>>>;
type Level2 = Vec<Option<Box<Vec<Option<Level3>>>>>;

/// The 3-level sparse page table. Level 1 and 2 entries are allocated
/// lazily; only address ranges the allocator has actually touched cost
/// memory.
pub struct PageTable {
    root: RwLock<Vec<Option<Box<Level2>>>>,
}

fn split(page_index: usize) -> (usize, usize, usize) {
    let l3 = page_index & ((1 << L3_BITS) - 1);
    let l2 = (page_index >> L3_BITS) & ((1 << L2_BITS) - 1);
    let l1 = (page_index >> (L3_BITS + L2_BITS)) & ((1 << L1_BITS) - 1);
    (l1, l2, l3)
}

impl PageTable {
    pub fn new() -> Self {
        let root_len = 1usize << L1_BITS;
        PageTable {
            root: RwLock::new((0..root_len).map(|_| None).collect()),
        }
    }

    fn page_index(page: Page) -> usize {
        page.start().as_usize() >> LOG_PAGE_SZ
    }

    /// Insert metadata for a freshly mapped page, allocating intermediate
    /// levels as needed.
    pub fn insert(&self, page: Page) -> &'static PageMeta {
        let (l1, l2, l3) = split(Self::page_index(page));
        let mut root = self.root.write();
        let lvl2 = root[l1].get_or_insert_with(|| {
            Box::new((0..(1usize << L2_BITS)).map(|_| None).collect())
        });
        let lvl3 = lvl2[l2].get_or_insert_with(|| {
            Box::new((0..(1usize << L3_BITS)).map(|_| None).collect())
        });
        let slot = &mut lvl3[l3];
        if slot.is_none() {
            *slot = Some(Box::new(PageMeta::new()));
        }
        // SAFETY: metadata for a live page is never removed from the
        // table (only reset in place), so this reference is valid for
        // the lifetime of the process, matching how the teacher's
        // side-metadata spaces hand out stable references.
        unsafe { &*(slot.as_deref().unwrap() as *const PageMeta) }
    }

    /// Look up metadata for a page, if the table has ever seen it.
    pub fn get(&self, page: Page) -> Option<&'static PageMeta> {
        let (l1, l2, l3) = split(Self::page_index(page));
        let root = self.root.read();
        let lvl2 = root[l1].as_ref()?;
        let lvl3 = lvl2[l2].as_ref()?;
        let meta = lvl3[l3].as_deref()?;
        Some(unsafe { &*(meta as *const PageMeta) })
    }

    /// Clear the table's record of a page that has been returned to the
    /// OS, so future allocations don't see stale metadata.
    pub fn remove(&self, page: Page) {
        let (l1, l2, l3) = split(Self::page_index(page));
        let mut root = self.root.write();
        if let Some(lvl2) = root[l1].as_mut() {
            if let Some(lvl3) = lvl2[l2].as_mut() {
                lvl3[l3] = None;
            }
        }
    }

    /// Visit every currently-registered page's metadata. Used by the
    /// sweep engine's page-table iteration (§4.8).
    pub fn for_each(&self, mut visit: impl FnMut(Page, &PageMeta)) {
        let root = self.root.read();
        for (l1, lvl2) in root.iter().enumerate() {
            let Some(lvl2) = lvl2 else { continue };
            for (l2, lvl3) in lvl2.iter().enumerate() {
                let Some(lvl3) = lvl3 else { continue };
                for (l3, meta) in lvl3.iter().enumerate() {
                    let Some(meta) = meta else { continue };
                    let page_index = (((l1 << L2_BITS) | l2) << L3_BITS) | l3;
                    let page = Page::from_aligned_address(Address::from_usize(
                        page_index << LOG_PAGE_SZ,
                    ));
                    visit(page, meta);
                }
            }
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::const_assert!(NUM_SZCLASSES > 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_roundtrips() {
        let table = PageTable::new();
        let addr = Address::from_usize(0x1000_0000 & !(PAGE_SZ - 1));
        let page = Page::from_aligned_address(addr);
        let meta = table.insert(page);
        meta.osize.store(32, Ordering::Relaxed);
        let found = table.get(page).expect("page should be present");
        assert_eq!(found.osize.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn missing_page_is_none() {
        let table = PageTable::new();
        let addr = Address::from_usize(0x2000_0000 & !(PAGE_SZ - 1));
        let page = Page::from_aligned_address(addr);
        assert!(table.get(page).is_none());
    }

    #[test]
    fn remove_clears_slot() {
        let table = PageTable::new();
        let addr = Address::from_usize(0x3000_0000 & !(PAGE_SZ - 1));
        let page = Page::from_aligned_address(addr);
        table.insert(page);
        table.remove(page);
        assert!(table.get(page).is_none());
    }
}
