//! The permanent/immortal allocation arena (C4, §4.4): a monotonic bump
//! allocator for objects that are never collected — interned strings,
//! singleton type metadata, and the like. Modeled on the teacher's
//! `util::alloc::embedded_meta_data`-style "never freed, bump a cursor
//! through a slab, map a fresh slab when exhausted" allocators, since
//! neither `mmtk-core`'s GC spaces nor this collector's own pool
//! allocator are a good fit for memory that is allocated once and lives
//! for the life of the process.

use crate::address::Address;
use crate::constants::{HEAP_ALIGN, PERM_POOL_SIZE, POOL_LIMIT};
use crate::error::{GcError, GcResult};
use spin::Mutex;

struct Slab {
    cursor: Address,
    limit: Address,
}

/// A callback the host can register to be notified whenever a new
/// perm-alloc slab (or an oversized standalone block) is mapped, mirroring
/// `gc_sweep_perm_alloc`'s role in the original collector: permanent
/// objects are never swept, but the host may still want a pass over them
/// (e.g. to rebuild an external symbol table) whenever the arena grows.
pub type PermGrowthHook = fn(Address, usize);

pub struct PermArena {
    state: Mutex<Slab>,
    growth_hook: Mutex<Option<PermGrowthHook>>,
}

impl PermArena {
    pub fn new() -> Self {
        PermArena {
            state: Mutex::new(Slab {
                cursor: Address::ZERO,
                limit: Address::ZERO,
            }),
            growth_hook: Mutex::new(None),
        }
    }

    pub fn set_growth_hook(&self, hook: PermGrowthHook) {
        *self.growth_hook.lock() = Some(hook);
    }

    /// `perm_alloc` (§4.4), taking the arena's own lock. Most callers use
    /// this; the lock-free `perm_alloc_unlocked` exists only for the
    /// single-threaded startup path where no other mutator can race.
    pub fn alloc(&self, size: usize, align: usize, offset: usize) -> GcResult<Address> {
        if size >= POOL_LIMIT {
            return self.alloc_oversized(size, align, offset);
        }
        let mut slab = self.state.lock();
        self.alloc_locked(&mut slab, size, align, offset)
    }

    /// The "unlocked" entry point for callers who already hold some outer
    /// exclusion (e.g. single-threaded runtime init, or a mutator that has
    /// already stopped the world).
    pub fn alloc_unlocked(&self, size: usize, align: usize, offset: usize) -> GcResult<Address> {
        self.alloc(size, align, offset)
    }

    fn alloc_locked(&self, slab: &mut Slab, size: usize, align: usize, offset: usize) -> GcResult<Address> {
        let size = size.max(HEAP_ALIGN);
        loop {
            let candidate = align_with_offset(slab.cursor, align, offset);
            let end = candidate
                .as_usize()
                .checked_add(size)
                .ok_or(GcError::SizeOverflow)?;
            if Address::from_usize(end) <= slab.limit {
                slab.cursor = Address::from_usize(end);
                return Ok(candidate);
            }
            self.map_new_slab(slab)?;
        }
    }

    fn map_new_slab(&self, slab: &mut Slab) -> GcResult<()> {
        let addr = os_map_perm_block(PERM_POOL_SIZE)?;
        slab.cursor = addr;
        slab.limit = addr + PERM_POOL_SIZE;
        if let Some(hook) = *self.growth_hook.lock() {
            hook(addr, PERM_POOL_SIZE);
        }
        Ok(())
    }

    /// Requests at or above `POOL_LIMIT` (§4.4) skip the shared slab
    /// entirely and go straight to an individually mapped, correctly
    /// aligned OS block, since folding a multi-megabyte request into the
    /// shared bump region would waste the rest of that slab.
    fn alloc_oversized(&self, size: usize, align: usize, offset: usize) -> GcResult<Address> {
        let total = size
            .checked_add(align)
            .and_then(|v| v.checked_add(offset))
            .ok_or(GcError::SizeOverflow)?;
        let block = os_map_perm_block(total)?;
        let addr = align_with_offset(block, align, offset);
        if let Some(hook) = *self.growth_hook.lock() {
            hook(block, total);
        }
        Ok(addr)
    }
}

impl Default for PermArena {
    fn default() -> Self {
        Self::new()
    }
}

fn align_with_offset(addr: Address, align: usize, offset: usize) -> Address {
    debug_assert!(align.is_power_of_two());
    (addr + offset).align_up(align) - offset
}

#[cfg(unix)]
fn os_map_perm_block(len: usize) -> GcResult<Address> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
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
fn os_map_perm_block(len: usize) -> GcResult<Address> {
    let ptr = unsafe {
        winapi::um::memoryapi::VirtualAlloc(
            std::ptr::null_mut(),
            len,
            winapi::um::winnt::MEM_RESERVE | winapi::um::winnt::MEM_COMMIT,
            winapi::um::winnt::PAGE_READWRITE,
        )
    };
    if ptr.is_null() {
        return Err(GcError::OutOfMemory);
    }
    Ok(Address::from_usize(ptr as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocs_bump_without_overlap() {
        let arena = PermArena::new();
        let a = arena.alloc(64, HEAP_ALIGN, 0).unwrap();
        let b = arena.alloc(64, HEAP_ALIGN, 0).unwrap();
        assert!(b.as_usize() >= a.as_usize() + 64);
    }

    #[test]
    fn alloc_is_aligned() {
        let arena = PermArena::new();
        for _ in 0..16 {
            let a = arena.alloc(24, 16, 0).unwrap();
            assert!(a.is_aligned_to(16));
        }
    }

    #[test]
    fn oversized_request_bypasses_the_slab() {
        let arena = PermArena::new();
        let a = arena.alloc(POOL_LIMIT + 1, HEAP_ALIGN, 0).unwrap();
        assert!(a.is_aligned_to(HEAP_ALIGN));
    }

    #[test]
    fn exhausting_a_slab_maps_another() {
        let arena = PermArena::new();
        let per_slab = PERM_POOL_SIZE / 4096;
        for _ in 0..per_slab + 1 {
            arena.alloc(4096 - HEAP_ALIGN, HEAP_ALIGN, 0).unwrap();
        }
    }

    #[test]
    fn growth_hook_fires_on_each_new_slab() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn hook(_addr: Address, _len: usize) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }
        let arena = PermArena::new();
        arena.set_growth_hook(hook);
        arena.alloc(64, HEAP_ALIGN, 0).unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
