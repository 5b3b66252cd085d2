//! The tagged value and its header (§3 "Data model").
//!
//! Every managed object is prefixed by a word-sized header whose low 2
//! bits are the GC mark/age state and whose remaining bits are a type
//! pointer. [`Value`] is the address *callers* use (pointing at the
//! object's first data byte); the header word lives one word below it.

use crate::address::Address;
use crate::constants::BYTES_IN_WORD;
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;

const TAG_MASK: usize = 0b11;

/// The four-state age/mark lattice (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcBits {
    /// Live young, unmarked.
    Clean = 0b00,
    /// Live young, reachable this cycle.
    Marked = 0b01,
    /// Live old, unmarked; survives quick sweeps unscanned.
    Old = 0b10,
    /// Live old, reached this cycle; may be on a remembered set.
    OldMarked = 0b11,
}

impl GcBits {
    #[inline]
    pub fn is_old(self) -> bool {
        matches!(self, GcBits::Old | GcBits::OldMarked)
    }

    #[inline]
    pub fn is_marked(self) -> bool {
        matches!(self, GcBits::Marked | GcBits::OldMarked)
    }
}

impl From<u8> for GcBits {
    fn from(v: u8) -> Self {
        match v & TAG_MASK as u8 {
            0b00 => GcBits::Clean,
            0b01 => GcBits::Marked,
            0b10 => GcBits::Old,
            0b11 => GcBits::OldMarked,
            _ => unreachable!(),
        }
    }
}

/// A "reset age" mark mode forces the new state to `MARKED` even if the
/// object was `OLD`, and clears its age bit — used by the finalizer
/// subsystem (§4.9) to treat `to_finalize` entries as fresh allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkMode {
    Normal,
    ResetAge,
}

/// A managed object reference: the address of the object's first data
/// word. The header word (GC bits + type pointer) lives at `addr - WORD`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(NonZeroUsize);

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value(0x{:x})", self.0)
    }
}

impl Value {
    /// # Safety
    /// `addr` must point at the first data word of a live, header-prefixed
    /// object.
    #[inline]
    pub unsafe fn from_address(addr: Address) -> Self {
        debug_assert!(!addr.is_zero());
        Value(NonZeroUsize::new_unchecked(addr.as_usize()))
    }

    #[inline]
    pub fn addr(self) -> Address {
        Address::from_usize(self.0.get())
    }

    #[inline]
    pub fn header_addr(self) -> Address {
        self.addr() - BYTES_IN_WORD
    }

    #[inline]
    fn header_word(self) -> usize {
        self.header_addr().load_atomic_usize(Ordering::Relaxed)
    }

    /// Initialize a freshly allocated header with the given type pointer
    /// and `CLEAN` bits. Allocation does not clear old tag bits from a
    /// reused cell on its own; callers (the pool/big-object allocators)
    /// call this explicitly once they know the type.
    ///
    /// # Safety
    /// `header_addr` must be exclusively owned by the caller (no concurrent
    /// reader can observe a half-written header).
    pub unsafe fn init_header(header_addr: Address, type_ptr: Address) {
        debug_assert_eq!(type_ptr.as_usize() & TAG_MASK, 0, "type pointers must be word-aligned");
        header_addr.store_atomic_usize(type_ptr.as_usize() | GcBits::Clean as usize, Ordering::Relaxed);
    }

    #[inline]
    pub fn gc_bits(self) -> GcBits {
        GcBits::from((self.header_word() & TAG_MASK) as u8)
    }

    #[inline]
    pub fn type_ptr(self) -> Address {
        Address::from_usize(self.header_word() & !TAG_MASK)
    }

    /// `try_setmark_tag` (§4.7): attempt to claim this object for the
    /// current mark phase. Returns `None` if it was already marked by
    /// someone else this cycle (or, in single-threaded marking, simply if
    /// it was already marked). On success, returns the *previous* bits,
    /// which callers use to decide whether this is a promotion.
    pub fn try_setmark_tag(self, mode: MarkMode) -> Option<GcBits> {
        let header_addr = self.header_addr();
        loop {
            let old_word = header_addr.load_atomic_usize(Ordering::Relaxed);
            let old_bits = GcBits::from((old_word & TAG_MASK) as u8);
            if old_bits.is_marked() && mode == MarkMode::Normal {
                return None;
            }
            let new_bits = match mode {
                MarkMode::ResetAge => GcBits::Marked,
                MarkMode::Normal => {
                    if old_bits.is_old() {
                        GcBits::OldMarked
                    } else {
                        GcBits::Marked
                    }
                }
            };
            let new_word = (old_word & !TAG_MASK) | new_bits as usize;
            match header_addr.compare_exchange_usize(
                old_word,
                new_word,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(old_bits),
                Err(_) => continue,
            }
        }
    }

    /// Demote/promote this object's bits at the end of a sweep (§4.8 step
    /// 6/8). `promote` is true if the object survived enough sweeps to be
    /// promoted to `OLD`. `full` indicates a full sweep (which also clears
    /// `OLD_MARKED` back to `OLD`).
    pub fn post_sweep_retag(self, promote: bool, full: bool) {
        let header_addr = self.header_addr();
        let old_word = header_addr.load_atomic_usize(Ordering::Relaxed);
        let bits = GcBits::from((old_word & TAG_MASK) as u8);
        let new_bits = match bits {
            GcBits::Marked => {
                if promote {
                    GcBits::Old
                } else {
                    GcBits::Clean
                }
            }
            GcBits::OldMarked => {
                if full {
                    GcBits::Old
                } else {
                    GcBits::OldMarked
                }
            }
            other => other,
        };
        let new_word = (old_word & !TAG_MASK) | new_bits as usize;
        header_addr.store_atomic_usize(new_word, Ordering::Relaxed);
    }

    /// Re-tag back to `MARKED`/`OLD_MARKED` at the start of the next cycle
    /// premark step — used when rotating remset entries back onto the
    /// frontier (§4.10 phase 3) so the write barrier doesn't re-fire for
    /// them.
    pub fn retag_remembered(self) {
        let header_addr = self.header_addr();
        let old_word = header_addr.load_atomic_usize(Ordering::Relaxed);
        let new_word = (old_word & !TAG_MASK) | GcBits::OldMarked as usize;
        header_addr.store_atomic_usize(new_word, Ordering::Relaxed);
    }
}
