//! Layout and tuning constants (§6). Mirrors the teacher's practice of
//! collecting magic numbers in one `util::constants`-style module instead of
//! scattering them through the policy code that uses them.

pub const LOG_BYTES_IN_WORD: usize = if cfg!(target_pointer_width = "64") { 3 } else { 2 };
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// `GC_PAGE_SZ`: every pool page is 16 KiB and self-aligned.
pub const LOG_PAGE_SZ: usize = 14;
pub const PAGE_SZ: usize = 1 << LOG_PAGE_SZ;

/// Cells are 16-byte aligned; the header occupies the word immediately
/// before the object, so the first cell in a page starts one
/// heap-alignment unit in from the page base.
pub const HEAP_ALIGN: usize = 16;
pub const PAGE_OFFSET: usize = HEAP_ALIGN - (BYTES_IN_WORD % HEAP_ALIGN);

/// Objects at or below this size live in a size-class pool; above it they
/// are big objects, allocated individually with aligned `malloc`.
pub const MAX_SZCLASS: usize = 2032;

/// Permanent-arena requests above this size bypass the pool and go
/// straight to the OS with the requested alignment/offset.
pub const POOL_LIMIT: usize = 1 << 20;

/// `GC_PERM_POOL_SIZE`: permanent-arena slab size.
pub const PERM_POOL_SIZE: usize = 2 * (1 << 20);

/// Number of sweeps a young object must survive before it is promoted to
/// `OLD`.
pub const PROMOTE_AGE: u8 = 1;

/// OS pages are requested from the kernel in blocks this large.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_BLOCK_PG_ALLOC: usize = 64 * (1 << 20);
#[cfg(target_pointer_width = "32")]
pub const DEFAULT_BLOCK_PG_ALLOC: usize = 4 * (1 << 20);

/// `default_collect_interval`: initial allocation budget between automatic
/// cycles, `5600 * 1024` words on 64-bit.
pub const DEFAULT_COLLECT_INTERVAL: usize = 5600 * 1024 * BYTES_IN_WORD;

/// Minimum object size the brute-force sweep scanner steps by when it does
/// not know cell boundaries line up with object references.
pub const MIN_OBJECT_SIZE: usize = HEAP_ALIGN;

/// Number of size classes in the compile-time size-class table.
pub const NUM_SZCLASSES: usize = 50;

/// Cap on how many fully-empty pages a quick sweep keeps resident per pool
/// before returning the rest to the page allocator (§4.8 "lazy page
/// retention").
pub const DEFAULT_LAZY_FREELIST_CAP: usize = 32;

/// A sentinel "no value" for `Address`-typed freelist offsets, matching the
/// teacher's use of out-of-band sentinels (e.g. `HT_NOTFOUND`) rather than
/// `Option` in hot metadata words.
pub const NO_OFFSET: isize = -1;
