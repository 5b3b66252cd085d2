//! Typed error surface for the collector (§7 of the design).
//!
//! The teacher framework has no single error enum of its own — allocation
//! paths return raw addresses and rely on `debug_assert!`/`panic!` for
//! corruption — so this is consolidated the way a contributor adding
//! checked OOM handling to that codebase would: one `std::error::Error`
//! impl, no `thiserror` (the teacher doesn't depend on it either).

use std::fmt;

#[derive(Debug)]
pub enum GcError {
    /// The OS page allocator, big-object `malloc`, or permanent arena
    /// ran out of memory.
    OutOfMemory,
    /// `size + header` overflowed `usize` before an allocation request
    /// reached the OS.
    SizeOverflow,
    /// A user finalizer callback panicked or otherwise failed.
    FinalizerException { backtrace: String },
    /// `enable_finalizers(true)` was called without a matching prior
    /// `enable_finalizers(false)`.
    DoubleEnableFinalizers,
    /// A datatype layout the mark engine could not interpret. Recorded
    /// here to document the shape of the failure, but never constructed
    /// as an `Err` — see [`fatal_corrupt_type`].
    CorruptType { detail: String },
    /// `collect()` invoked while the collector is disabled on this
    /// mutator. Recorded here to document the condition's shape, but
    /// never constructed as an `Err` — per §7 it is a no-op, handled by
    /// [`crate::Collector::collect`] returning `Ok(())` directly.
    DisabledDuringCollect,
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::OutOfMemory => write!(f, "out of memory"),
            GcError::SizeOverflow => write!(f, "allocation size overflowed"),
            GcError::FinalizerException { backtrace } => {
                write!(f, "finalizer callback raised an exception:\n{backtrace}")
            }
            GcError::DoubleEnableFinalizers => {
                write!(f, "enable_finalizers(true) called without a matching disable")
            }
            GcError::CorruptType { detail } => {
                write!(f, "corrupt type encountered during mark: {detail}")
            }
            GcError::DisabledDuringCollect => {
                write!(f, "collect() called while the collector is disabled")
            }
        }
    }
}

impl std::error::Error for GcError {}

pub type GcResult<T> = Result<T, GcError>;

/// A datatype layout the mark engine cannot interpret, or a header whose
/// GC bits are out of range. Per §7 this is fatal: we log full context and
/// abort rather than return an `Err`, because continuing to mark with a
/// corrupt frontier would silently produce an unsound heap.
pub fn fatal_corrupt_type(detail: &str) -> ! {
    log::error!("corrupt type encountered during mark: {detail}");
    panic!("corrupt type encountered during mark: {detail}");
}
