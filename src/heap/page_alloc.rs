//! The OS-backed page allocator (C1, §4.1): supplies 16 KiB aligned pages
//! to the pool allocator, recycling freed pages through three staged
//! pools (`clean → to_madvise → madvised`) before falling back to a fresh
//! OS mapping, the way the teacher's heap layer keeps a `clean`/decommitted
//! split to amortize `mmap`/`madvise` syscalls across many small requests.

use crate::address::{Address, Region};
use crate::constants::{DEFAULT_BLOCK_PG_ALLOC, PAGE_SZ};
use crate::error::{GcError, GcResult};
use crate::heap::page_table::{Page, PageMeta, PageTable};
use spin::Mutex;

/// Global pools of idle page addresses, and the sparse page table that
/// maps any page back to its metadata.
pub struct PageAllocator {
    clean: Mutex<Vec<Address>>,
    to_madvise: Mutex<Vec<Address>>,
    madvised: Mutex<Vec<Address>>,
    page_table: PageTable,
    /// Tracks OS mappings so they can be released (and so tests can
    /// assert on how many blocks were ever requested).
    mapped_blocks: Mutex<Vec<(Address, usize)>>,
}

impl PageAllocator {
    pub fn new() -> Self {
        PageAllocator {
            clean: Mutex::new(Vec::new()),
            to_madvise: Mutex::new(Vec::new()),
            madvised: Mutex::new(Vec::new()),
            page_table: PageTable::new(),
            mapped_blocks: Mutex::new(Vec::new()),
        }
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// `alloc_page` (§4.1): prefers `clean → to_madvise → madvised →
    /// fresh OS map`, in that order, because a `clean` page needs no
    /// syscall at all, a `to_madvise` page has never actually been
    /// decommitted, and a `madvised` page at worst needs the kernel to
    /// fault pages back in lazily.
    pub fn alloc_page(&self) -> GcResult<(Page, &'static PageMeta)> {
        let addr = self
            .pop(&self.clean)
            .or_else(|| self.pop(&self.to_madvise))
            .or_else(|| self.pop(&self.madvised))
            .map(Ok)
            .unwrap_or_else(|| self.map_fresh_block_and_take_one())?;
        let page = Page::from_aligned_address(addr);
        let meta = self.page_table.insert(page);
        Ok((page, meta))
    }

    fn pop(&self, pool: &Mutex<Vec<Address>>) -> Option<Address> {
        pool.lock().pop()
    }

    /// `free_page` (§4.1): the page is no longer in use; queue it for
    /// `madvise` recycling rather than immediately unmapping it, since
    /// future allocations are likely and re-`mmap`ing is far more
    /// expensive than faulting a madvised page back in.
    pub fn free_page(&self, page: Page) {
        self.queue_for_madvise(page.start());
    }

    fn queue_for_madvise(&self, addr: Address) {
        self.to_madvise.lock().push(addr);
    }

    /// Drain the `to_madvise` pool, issuing the actual OS hint for each
    /// page and moving it into `madvised`. The controller calls this
    /// after a sweep so the syscalls happen off the allocation fast path.
    pub fn drain_madvise_queue(&self) {
        let mut staged = self.to_madvise.lock();
        if staged.is_empty() {
            return;
        }
        let mut madvised = self.madvised.lock();
        for addr in staged.drain(..) {
            Self::os_hint_decommit(addr, PAGE_SZ);
            madvised.push(addr);
        }
    }

    #[cfg(all(unix, not(target_os = "windows")))]
    fn os_hint_decommit(addr: Address, len: usize) {
        unsafe {
            #[cfg(target_os = "linux")]
            {
                let rc = libc::madvise(addr.as_mut_ptr(), len, libc::MADV_FREE);
                if rc != 0 {
                    libc::madvise(addr.as_mut_ptr(), len, libc::MADV_DONTNEED);
                }
            }
            #[cfg(not(target_os = "linux"))]
            {
                libc::madvise(addr.as_mut_ptr(), len, libc::MADV_DONTNEED);
            }
        }
    }

    #[cfg(target_os = "windows")]
    fn os_hint_decommit(addr: Address, len: usize) {
        unsafe {
            winapi::um::memoryapi::VirtualFree(
                addr.as_mut_ptr(),
                len,
                winapi::um::winnt::MEM_DECOMMIT,
            );
        }
    }

    fn map_fresh_block_and_take_one(&self) -> GcResult<Address> {
        let block = Self::os_map_block(DEFAULT_BLOCK_PG_ALLOC)?;
        self.mapped_blocks.lock().push((block, DEFAULT_BLOCK_PG_ALLOC));
        let aligned = block.align_up(PAGE_SZ);
        let usable_start = aligned;
        let usable_end = block + DEFAULT_BLOCK_PG_ALLOC;
        let mut clean = self.clean.lock();
        let mut cursor = usable_start + PAGE_SZ; // first page is handed out directly
        while cursor + PAGE_SZ <= usable_end {
            clean.push(cursor);
            cursor = cursor + PAGE_SZ;
        }
        Ok(usable_start)
    }

    #[cfg(unix)]
    fn os_map_block(len: usize) -> GcResult<Address> {
        // Over-allocate by one page so we can hand back a PAGE_SZ-aligned
        // start even though `mmap` only guarantees OS-page alignment.
        let request = len + PAGE_SZ;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                request,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(GcError::OutOfMemory);
        }
        Ok(Address::from_usize(ptr as usize))
    }

    #[cfg(windows)]
    fn os_map_block(len: usize) -> GcResult<Address> {
        let request = len + PAGE_SZ;
        let ptr = unsafe {
            winapi::um::memoryapi::VirtualAlloc(
                std::ptr::null_mut(),
                request,
                winapi::um::winnt::MEM_RESERVE | winapi::um::winnt::MEM_COMMIT,
                winapi::um::winnt::PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(GcError::OutOfMemory);
        }
        Ok(Address::from_usize(ptr as usize))
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_recycles_without_new_block() {
        let alloc = PageAllocator::new();
        let (page, _meta) = alloc.alloc_page().unwrap();
        alloc.free_page(page);
        assert_eq!(alloc.to_madvise.lock().len(), 1);
        let blocks_before = alloc.mapped_blocks.lock().len();
        alloc.drain_madvise_queue();
        assert_eq!(alloc.madvised.lock().len(), 1);
        let (page2, _meta2) = alloc.alloc_page().unwrap();
        assert_eq!(page2.start(), page.start());
        assert_eq!(alloc.mapped_blocks.lock().len(), blocks_before);
    }

    #[test]
    fn pages_are_page_sz_aligned() {
        let alloc = PageAllocator::new();
        for _ in 0..8 {
            let (page, _) = alloc.alloc_page().unwrap();
            assert!(page.start().is_aligned_to(PAGE_SZ));
        }
    }
}
