//! The finalizer subsystem (C9, §4.9).
//!
//! Registration uses a low tag bit on the callback pointer to distinguish
//! a raw foreign-function callback from a managed one (dispatched through
//! [`crate::vm::ForeignFinalizerDispatch`] and the mark engine's ordinary
//! scanning, respectively). Discovery runs during marking and moves dead
//! entries out to a local list that the triggering mutator executes once
//! the stop-the-world phase has ended.

use crate::address::Address;
use crate::object::{MarkMode, Value};
use crate::vm::ForeignFinalizerDispatch;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const CALLBACK_TAG_RAW: usize = 1;

/// One `(object, callback)` registration. `callback`'s low bit records
/// whether it is a raw foreign-function pointer (tag set) or a managed
/// callback object (tag clear).
#[derive(Clone, Copy)]
pub struct Entry {
    object: Value,
    callback_tagged: usize,
}

impl Entry {
    fn is_raw(&self) -> bool {
        self.callback_tagged & CALLBACK_TAG_RAW != 0
    }

    fn callback_addr(&self) -> Address {
        Address::from_usize(self.callback_tagged & !CALLBACK_TAG_RAW)
    }

    fn callback_value(&self) -> Option<Value> {
        (!self.is_raw()).then(|| unsafe { Value::from_address(self.callback_addr()) })
    }
}

/// A per-mutator finalizer list. `len` is published separately from the
/// backing storage (§4.9's acquire/release length protocol) so a reader
/// on another mutator during the finalizers-lock window can acquire-load
/// `len` and only look at that many entries, even if a writer is mid
/// append past that point.
pub struct FinalizerList {
    entries: Mutex<Vec<Entry>>,
    published_len: AtomicUsize,
}

impl FinalizerList {
    pub fn new() -> Self {
        FinalizerList {
            entries: Mutex::new(Vec::new()),
            published_len: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.published_len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `add_finalizer` (§4.9): reserve two slots (object + callback),
    /// write the content, then publish the new length with a release
    /// store so concurrent acquire-load readers never see a torn list.
    pub fn add(&self, object: Value, callback: Address, raw: bool) {
        let mut guard = self.entries.lock().unwrap();
        let tagged = callback.as_usize() | if raw { CALLBACK_TAG_RAW } else { 0 };
        guard.push(Entry {
            object,
            callback_tagged: tagged,
        });
        self.published_len.store(guard.len(), Ordering::Release);
    }

    /// `finalize(value)` (§6): pull the first registered entry for
    /// `object` out of the list immediately, for execution outside the
    /// normal discovery cycle.
    pub fn take_matching(&self, object: Value) -> Option<Entry> {
        let mut guard = self.entries.lock().unwrap();
        let idx = guard.iter().position(|e| e.object == object)?;
        let entry = guard.remove(idx);
        self.published_len.store(guard.len(), Ordering::Release);
        Some(entry)
    }

    /// Drain `other` into `self`, for re-sweeping `finalizer_list_marked`
    /// through a scratch list each cycle (§4.9) without aliasing the same
    /// list as both `sweep_finalizer_list` arguments.
    pub fn merge_from(&self, other: &FinalizerList) {
        let mut other_guard = other.entries.lock().unwrap();
        if other_guard.is_empty() {
            return;
        }
        let mut guard = self.entries.lock().unwrap();
        guard.append(&mut other_guard);
        self.published_len.store(guard.len(), Ordering::Release);
        other.published_len.store(other_guard.len(), Ordering::Release);
    }
}

impl Default for FinalizerList {
    fn default() -> Self {
        Self::new()
    }
}

/// `sweep_finalizer_list` (§4.9): run over one mutator's list (plus the
/// global marked list, via repeated calls), moving dead entries into
/// `to_finalize` and promoting survivors that are themselves fully old
/// into `marked_global` so they keep propagating across cycles.
pub fn sweep_finalizer_list(
    list: &FinalizerList,
    to_finalize: &mut Vec<(Value, Entry)>,
    marked_global: &FinalizerList,
) {
    let mut guard = list.entries.lock().unwrap();
    let mut kept = Vec::with_capacity(guard.len());
    for entry in guard.drain(..) {
        if !entry.object.gc_bits().is_marked() {
            to_finalize.push((entry.object, entry));
            continue;
        }
        let callback_is_old_marked = entry
            .callback_value()
            .map(|c| c.gc_bits() == crate::object::GcBits::OldMarked)
            .unwrap_or(true);
        if entry.object.gc_bits() == crate::object::GcBits::OldMarked && callback_is_old_marked {
            marked_global.add(entry.object, entry.callback_addr(), entry.is_raw());
        } else {
            kept.push(entry);
        }
    }
    *guard = kept;
    list.published_len.store(guard.len(), Ordering::Release);
}

/// `mark_finlist` (§4.9): ensure every surviving entry (and its managed
/// callback, if any) is itself marked, pushing any newly-discovered
/// children through `push` so the mark loop drains them too.
pub fn mark_finlist(list: &FinalizerList, mode: MarkMode, mut push: impl FnMut(Value)) {
    let guard = list.entries.lock().unwrap();
    for entry in guard.iter() {
        if entry.object.try_setmark_tag(mode).is_some() {
            push(entry.object);
        }
        if let Some(cb) = entry.callback_value() {
            if cb.try_setmark_tag(mode).is_some() {
                push(cb);
            }
        }
    }
}

/// After discovery, entries in `to_finalize` are marked with the "reset
/// age" option (§4.9) so they count as fresh allocations and stay alive
/// exactly until their callback runs.
pub fn reset_age_for_pending(to_finalize: &[(Value, Entry)]) {
    for (object, entry) in to_finalize {
        object.try_setmark_tag(MarkMode::ResetAge);
        if let Some(cb) = entry.callback_value() {
            cb.try_setmark_tag(MarkMode::ResetAge);
        }
    }
}

/// Execute pending finalizers (§4.9 "Execution"): reverse insertion
/// order, under a dedicated in-finalizer flag the caller is responsible
/// for holding. Failures are caught and logged rather than propagated.
pub fn run_pending<F: ForeignFinalizerDispatch>(
    pending: Vec<(Value, Entry)>,
    dispatch: &F,
    mut invoke_managed: impl FnMut(Value, Value),
) {
    for (object, entry) in pending.into_iter().rev() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if entry.is_raw() {
                dispatch.invoke_raw(entry.callback_addr(), object);
            } else if let Some(cb) = entry.callback_value() {
                invoke_managed(cb, object);
            }
        }));
        if let Err(payload) = result {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("finalizer callback panicked: {msg}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockLayout;

    #[test]
    fn add_publishes_length_after_content() {
        let layout = MockLayout::new();
        let obj = layout.alloc_object(0);
        let list = FinalizerList::new();
        list.add(obj, Address::from_usize(0x2000), true);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn sweep_moves_unmarked_entries_to_finalize() {
        let layout = MockLayout::new();
        let obj = layout.alloc_object(0);
        let list = FinalizerList::new();
        list.add(obj, Address::from_usize(0x2000), true);
        let marked_global = FinalizerList::new();
        let mut to_finalize = Vec::new();
        sweep_finalizer_list(&list, &mut to_finalize, &marked_global);
        assert_eq!(to_finalize.len(), 1);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn sweep_keeps_marked_entries_in_the_list() {
        let layout = MockLayout::new();
        let obj = layout.alloc_object(0);
        obj.try_setmark_tag(MarkMode::Normal);
        let list = FinalizerList::new();
        list.add(obj, Address::from_usize(0x2000), true);
        let marked_global = FinalizerList::new();
        let mut to_finalize = Vec::new();
        sweep_finalizer_list(&list, &mut to_finalize, &marked_global);
        assert!(to_finalize.is_empty());
        assert_eq!(list.len(), 1);
    }
}
