//! The generational mark phase and stop-the-world sweep/finalizer
//! machinery (§4.5-§4.10).

pub mod deque;
pub mod finalizer;
pub mod mark;
pub mod mark_queue;
pub mod remset;
pub mod sweep;
pub mod weakref;
