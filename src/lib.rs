//! `gnarl-gc`: a non-moving, precise, generational, stop-the-world
//! mark-and-sweep garbage collector core for embedding in a managed
//! language runtime.
//!
//! The crate is organized the way the collector itself is: [`address`] and
//! [`object`] give the bit-level vocabulary (tagged words, GC bits), [`heap`]
//! holds the allocators (size-classed pools, the big-object list, the
//! permanent arena), [`gc`] holds the mark/sweep/finalizer machinery, and
//! [`collector`] is the controller that drives a cycle end to end. A host
//! runtime embeds the collector by implementing [`vm::Binding`] and driving
//! [`Collector`] from its own thread/safepoint plumbing.

pub mod address;
pub mod callbacks;
pub mod constants;
#[cfg(feature = "conservative_gc")]
pub mod conservative;
pub mod error;
pub mod gc;
pub mod heap;
pub mod logging;
pub mod mutator;
pub mod object;
pub mod options;
pub mod stats;
#[cfg(any(test, feature = "test_private"))]
pub mod test_util;

mod collector;

pub use address::Address;
pub use collector::{CollectKind, Collector};
pub use error::{GcError, GcResult};
pub use object::{GcBits, MarkMode, Value};
pub use options::Options;
pub use stats::GcStats;
pub use vm::Binding;

pub mod vm;
