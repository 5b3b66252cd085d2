//! The collector controller (C10, §4.10): safepoint orchestration, phase
//! sequencing, and the heuristics that decide quick vs full sweep and the
//! next collection interval. This is the module every other component is
//! wired together through, the way the teacher's top-level `mmtk::MMTK`
//! struct owns every plan/space and exposes the few entry points a binding
//! actually calls.

use crate::address::Address;
use crate::callbacks::Callbacks;
use crate::constants::BYTES_IN_WORD;
use crate::error::{GcError, GcResult};
use crate::gc::deque::Deque;
use crate::gc::finalizer::{self, Entry as FinalizerEntry, FinalizerList};
use crate::gc::mark::{Marker, scan_object};
use crate::gc::mark_queue::MarkQueue;
use crate::gc::sweep;
use crate::heap::big_object::{self, BigObjectList};
use crate::heap::page_alloc::PageAllocator;
use crate::heap::perm_arena::PermArena;
use crate::heap::size_class;
use crate::mutator::{ManagedArray, Mutator};
use crate::object::{GcBits, MarkMode, Value};
use crate::options::Options;
use crate::stats::{GcStats, Stats};
use crate::vm::Binding;

use spin::RwLock as SpinRwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// `collect(kind)`'s argument (§6 "Collector control API").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectKind {
    Auto,
    Full,
}

/// Everything the collector owns process-wide (§9 "Mutable shared state"):
/// the page pools, permanent arena, registered mutators, the global
/// finalizer/big-object marked lists, and the singleton "GC running" flag.
/// Parameterized over the host's [`Binding`] the way the teacher's `MMTK<VM>`
/// is parameterized over its `VMBinding`.
pub struct Collector<B: Binding> {
    binding: B,
    options: Options,
    stats: Stats,
    callbacks: Callbacks,
    page_alloc: PageAllocator,
    perm_arena: PermArena,
    mutators: SpinRwLock<Vec<Mutex<Mutator>>>,
    finalizer_list_marked: FinalizerList,
    pending_finalizers: Mutex<Vec<(Value, FinalizerEntry)>>,
    gc_running: AtomicBool,
    conservative_gc: AtomicBool,
    finalizers_disabled: AtomicUsize,
    max_total_memory: std::sync::atomic::AtomicU64,
    last_trim_rss: AtomicU64,
    /// The allocation-budget interval every mutator was last reset to
    /// (§4.10 step 10). Tracked here (rather than re-derived per mutator)
    /// since step 10 resets every mutator to the same value; needed again
    /// at the next cycle's step 7/10 to apply the reclaim-ratio doubling
    /// heuristic (§4.10 step 7's last bullet, spec.md:170).
    current_interval: AtomicU64,
}

impl<B: Binding> Collector<B> {
    pub fn new(binding: B) -> Self {
        let options = Options::new();
        crate::logging::init();
        let max_total_memory = options.max_total_memory;
        let default_collect_interval = options.default_collect_interval as u64;
        Collector {
            binding,
            options,
            stats: Stats::new(),
            callbacks: Callbacks::new(),
            page_alloc: PageAllocator::new(),
            perm_arena: PermArena::new(),
            mutators: SpinRwLock::new(Vec::new()),
            finalizer_list_marked: FinalizerList::new(),
            pending_finalizers: Mutex::new(Vec::new()),
            gc_running: AtomicBool::new(false),
            conservative_gc: AtomicBool::new(false),
            finalizers_disabled: AtomicUsize::new(0),
            max_total_memory: std::sync::atomic::AtomicU64::new(max_total_memory),
            last_trim_rss: AtomicU64::new(0),
            current_interval: AtomicU64::new(default_collect_interval),
        }
    }

    pub fn binding(&self) -> &B {
        &self.binding
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Register a new mutator thread, returning the id it should pass to
    /// every other entry point.
    pub fn register_mutator(&self) -> usize {
        let mut mutators = self.mutators.write();
        let id = mutators.len();
        mutators.push(Mutex::new(Mutator::new(id, self.options.default_collect_interval)));
        id
    }

    fn with_mutator<R>(&self, mutator_id: usize, f: impl FnOnce(&mut Mutator) -> R) -> R {
        let mutators = self.mutators.read();
        let mut guard = mutators[mutator_id].lock().unwrap();
        f(&mut guard)
    }

    // ---- Allocation API (§6) -------------------------------------------

    /// `alloc_small` (§6): allocate into the size-classed pool.
    pub fn alloc_small(&self, mutator_id: usize, size: usize, type_ptr: Address) -> GcResult<Value> {
        let class = size_class::classify(size).expect("alloc_small called for an oversized request");
        let cell_size = size_class::cell_size(class);
        let v = self.with_mutator(mutator_id, |m| m.pool_mut(class).alloc(mutator_id as u32, &self.page_alloc))?;
        unsafe { Value::init_header(v.header_addr(), type_ptr) };
        self.stats.record_alloc(cell_size);
        self.maybe_collect(mutator_id, cell_size);
        Ok(v)
    }

    /// `alloc_big` (§6): allocate a header-tagged object on the big-object
    /// path, born old per §4.3, and link it into the mutator's live list.
    pub fn alloc_big(&self, mutator_id: usize, size: usize, type_ptr: Address) -> GcResult<Value> {
        let handle = big_object::big_alloc(size, type_ptr, self.options.promote_age)?;
        self.with_mutator(mutator_id, |m| m.big_objects.push_front(handle));
        self.stats.record_alloc(handle.size());
        self.callbacks.notify_external_alloc.iter_call(|f| f(handle.size()));
        self.maybe_collect(mutator_id, handle.size());
        Ok(handle.value())
    }

    /// `alloc_typed` (§6): dispatching variant that routes to the pool or
    /// big-object path depending on the size-class classifier.
    pub fn alloc_typed(&self, mutator_id: usize, size: usize, type_ptr: Address) -> GcResult<Value> {
        if size_class::classify(size).is_some() {
            self.alloc_small(mutator_id, size, type_ptr)
        } else {
            self.alloc_big(mutator_id, size, type_ptr)
        }
    }

    /// `managed_malloc` (§6): an externally-backed buffer owned by a GC
    /// object, tracked so [`sweep::sweep_malloced_arrays`] can free it once
    /// `owner` stops surviving.
    pub fn managed_malloc(&self, mutator_id: usize, owner: Value, size: usize) -> GcResult<Address> {
        let ptr = unsafe { libc::malloc(size) };
        if ptr.is_null() {
            return Err(GcError::OutOfMemory);
        }
        let addr = Address::from_usize(ptr as usize);
        self.with_mutator(mutator_id, |m| {
            m.managed_arrays.push(ManagedArray { owner, ptr: addr, size })
        });
        self.stats.record_alloc(size);
        self.callbacks.notify_external_alloc.iter_call(|f| f(size));
        Ok(addr)
    }

    /// `managed_realloc` (§6): grow/shrink a `managed_malloc`-tracked buffer
    /// in place, updating the tracking entry so sweep still finds it.
    pub fn managed_realloc(
        &self,
        mutator_id: usize,
        old_ptr: Address,
        new_size: usize,
        old_size: usize,
        owner: Value,
    ) -> GcResult<Address> {
        let new_ptr = unsafe { libc::realloc(old_ptr.as_mut_ptr(), new_size) };
        if new_ptr.is_null() {
            return Err(GcError::OutOfMemory);
        }
        let new_addr = Address::from_usize(new_ptr as usize);
        self.with_mutator(mutator_id, |m| {
            if let Some(entry) = m.managed_arrays.iter_mut().find(|a| a.ptr == old_ptr && a.owner == owner) {
                entry.ptr = new_addr;
                entry.size = new_size;
            } else {
                m.managed_arrays.push(ManagedArray { owner, ptr: new_addr, size: new_size });
            }
        });
        if new_size > old_size {
            self.stats.record_alloc(new_size - old_size);
        } else {
            self.stats.record_free(old_size - new_size);
        }
        Ok(new_addr)
    }

    /// `perm_alloc` (§6): bump-allocate from the immortal arena. Never
    /// swept.
    pub fn perm_alloc(&self, size: usize, align: usize, offset: usize) -> GcResult<Address> {
        self.perm_arena.alloc(size, align, offset)
    }

    /// `realloc_string` (§6, §4.3 "Realloc for strings"): always allocates
    /// fresh backing storage and copies the shared prefix over, rather than
    /// growing in place. If the old storage was a big object, it is
    /// unlinked and freed immediately rather than left for the next sweep
    /// — an intentional, documented hazard (§9 Open Questions, recorded in
    /// DESIGN.md) carried forward from the original collector's
    /// `realloc_string`, since a caller may still hold an alias to the old
    /// block across this call.
    pub fn realloc_string(&self, mutator_id: usize, v: Value, old_size: usize, new_size: usize) -> GcResult<Value> {
        let type_ptr = v.type_ptr();
        let new_v = self.alloc_typed(mutator_id, new_size, type_ptr)?;
        let copy_len = old_size.min(new_size);
        unsafe {
            std::ptr::copy_nonoverlapping(v.addr().as_ptr::<u8>(), new_v.addr().as_mut_ptr::<u8>(), copy_len);
        }
        if size_class::classify(old_size).is_none() {
            let freed = self.with_mutator(mutator_id, |m| {
                let handle = m.big_objects.iter().find(|h| h.value() == v);
                if let Some(h) = handle {
                    m.big_objects.unlink(h);
                }
                handle
            });
            if let Some(handle) = freed {
                self.stats.record_free(handle.size());
                unsafe { big_object::big_free(handle) };
            }
        }
        Ok(new_v)
    }

    // ---- Write barrier API (§6) ----------------------------------------

    pub fn queue_root(&self, mutator_id: usize, parent: Value) {
        self.with_mutator(mutator_id, |m| m.write_barrier(parent));
    }

    pub fn queue_multiroot(&self, mutator_id: usize, parents: impl IntoIterator<Item = Value>) {
        self.with_mutator(mutator_id, |m| m.write_barrier_multi(parents));
    }

    pub fn queue_binding(&self, mutator_id: usize, parent: Value) {
        self.with_mutator(mutator_id, |m| m.write_barrier_binding(parent));
    }

    // ---- Weak reference API (§3, §8 "Weak reference" law) --------------

    /// Register a weak-reference cell whose field at `referent_field`
    /// holds a (possibly already-cleared) pointer to `referent`; cleared
    /// to [`crate::gc::weakref::CLEARED_SENTINEL`] by the next sweep if
    /// `referent` does not survive marking.
    pub fn register_weakref(&self, mutator_id: usize, referent_field: Address) {
        self.with_mutator(mutator_id, |m| {
            m.weakrefs.register(crate::gc::weakref::WeakRef::new(referent_field))
        });
    }

    // ---- Collector control API (§6) ------------------------------------

    pub fn enable(&self, mutator_id: usize, enabled: bool) -> bool {
        self.with_mutator(mutator_id, |m| {
            let was_enabled = !m.is_gc_disabled();
            m.enable(enabled);
            was_enabled
        })
    }

    pub fn is_enabled(&self, mutator_id: usize) -> bool {
        self.with_mutator(mutator_id, |m| !m.is_gc_disabled())
    }

    pub fn set_max_memory(&self, bytes: u64) {
        self.max_total_memory.store(bytes, Ordering::Relaxed);
    }

    pub fn live_bytes(&self) -> i64 {
        self.stats.live_bytes.load(Ordering::Relaxed)
    }

    pub fn num(&self) -> GcStats {
        self.stats.snapshot()
    }

    pub fn enable_conservative_gc_support(&self) {
        // Forces every subsequent cycle to be a full sweep so age bits stay
        // meaningful for the freelist-vs-object disambiguation (§9 Open
        // Questions; `conservative.rs` implements the actual lookup).
        self.conservative_gc.store(true, Ordering::Release);
    }

    pub fn conservative_gc_enabled(&self) -> bool {
        self.conservative_gc.load(Ordering::Acquire)
    }

    /// `internal_obj_base_ptr` (§9, `conservative_gc` feature): resolve a
    /// conservatively-scanned stack word to the live GC object containing
    /// it, across every registered mutator's big-object list, sharing the
    /// single page table every pool page is registered in.
    #[cfg(feature = "conservative_gc")]
    pub fn internal_obj_base_ptr(&self, ptr: Address) -> Option<Value> {
        if let Some(v) = crate::conservative::pool_base_ptr(ptr, self.page_alloc.page_table()) {
            return Some(v);
        }
        let mutators = self.mutators.read();
        for m in mutators.iter() {
            let guard = m.lock().unwrap();
            if let Some(v) = crate::conservative::big_object_base_ptr(ptr, &guard.big_objects) {
                return Some(v);
            }
        }
        None
    }

    // ---- Finalizer API (§6) --------------------------------------------

    pub fn add_finalizer(&self, mutator_id: usize, object: Value, callback: Address, raw: bool) {
        self.with_mutator(mutator_id, |m| m.finalizers.add(object, callback, raw));
    }

    /// `finalize(value*)` (§6): run any pending finalizer for `value` right
    /// now rather than waiting for the next collection to discover it.
    /// Scans every mutator's list for a matching entry; a no-op if none is
    /// registered.
    pub fn finalize(&self, object: Value) {
        let mutators = self.mutators.read();
        let mut found = None;
        for m in mutators.iter() {
            let mut guard = m.lock().unwrap();
            if let Some(entry) = guard.finalizers.take_matching(object) {
                found = Some(entry);
                break;
            }
        }
        if let Some(entry) = found {
            finalizer::run_pending(vec![(object, entry)], self.binding.foreign_finalizer(), |_cb, _obj| {
                // Managed dispatch is the host runtime's own calling
                // convention; no managed invocation hook is modeled here
                // (documented in DESIGN.md), matching `run_pending_finalizers`.
            });
        }
    }

    /// `enable_finalizers(bool)` (§6): non-nestable toggle backed by a
    /// process-wide counter; re-enabling past zero is a documented error
    /// rather than silently clamped (§7 `DoubleEnableFinalizers`).
    pub fn enable_finalizers(&self, enabled: bool) -> GcResult<()> {
        if enabled {
            let prev = self.finalizers_disabled.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v > 0).then(|| v - 1)
            });
            if prev.is_err() {
                log::warn!("enable_finalizers(true) called without a matching prior disable");
                return Err(GcError::DoubleEnableFinalizers);
            }
        } else {
            self.finalizers_disabled.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn finalizers_enabled(&self) -> bool {
        self.finalizers_disabled.load(Ordering::Acquire) == 0
    }

    /// `run_pending_finalizers()` (§6): drain the accumulator `collect()`
    /// appends to and invoke every callback, decoupled from `collect()`
    /// itself per §4.9 "Execution".
    pub fn run_pending_finalizers(&self) {
        if !self.finalizers_enabled() {
            return;
        }
        let pending = std::mem::take(&mut *self.pending_finalizers.lock().unwrap());
        if pending.is_empty() {
            return;
        }
        log::debug!("running {} pending finalizer(s)", pending.len());
        finalizer::run_pending(pending, self.binding.foreign_finalizer(), |_cb, _obj| {
            // Managed callbacks are dispatched by the host runtime's own
            // calling convention; a real binding would invoke through
            // `Binding` here. No managed dispatch hook is modeled in this
            // core (documented in DESIGN.md).
        });
    }

    // ---- collect() (§4.10) ---------------------------------------------

    /// `collect(kind)` (§6, §4.10 "Entry"). If the triggering mutator has
    /// GC disabled, defers accounting and returns without running a cycle.
    /// Otherwise claims the singleton GC slot (losers wait for the winner
    /// to finish) and drives the full stop-the-world phase sequence.
    pub fn collect(&self, mutator_id: usize, kind: CollectKind) -> GcResult<()> {
        if self.with_mutator(mutator_id, |m| m.is_gc_disabled()) {
            // §7 DisabledDuringCollect: a documented no-op, not an error —
            // the accounting for this mutator is already deferred into
            // `deferred_alloc` by `record_alloc` while GC is disabled.
            log::debug!("collect() is a no-op: GC disabled on mutator {mutator_id}");
            return Ok(());
        }
        if self
            .gc_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another mutator is already driving a cycle; the safepoint
            // protocol (entered below by the winner) is what actually
            // parks us, so here we just wait for the slot to free up.
            while self.gc_running.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            return Ok(());
        }
        let result = self.run_cycle(kind);
        self.gc_running.store(false, Ordering::Release);
        self.run_pending_finalizers();
        result
    }

    fn run_cycle(&self, kind: CollectKind) -> GcResult<()> {
        self.binding.debug_tap().on_phase_begin("collect");
        self.binding.safepoint().safepoint_begin();
        log::debug!("collect starting, kind={:?}", kind);

        self.stats.begin_cycle();
        self.callbacks.pre_gc.iter_call(|f| f(matches!(kind, CollectKind::Full)));

        let mode = MarkMode::Normal;
        let mutators = self.mutators.read();

        // Step 3: premark. Rotate each mutator's remset and collect the
        // previous cycle's entries to push directly onto the mark frontier
        // (they are already OLD_MARKED; only their children are new work).
        let mut remset_roots: Vec<Value> = Vec::new();
        for m in mutators.iter() {
            let mut guard = m.lock().unwrap();
            for v in guard.remset.rotate() {
                v.retag_remembered();
                remset_roots.push(v);
            }
        }

        // Step 4: queue roots.
        let mut roots: Vec<Value> = remset_roots;
        for (idx, m) in mutators.iter().enumerate() {
            self.binding.stack_walker().walk_roots(idx, &mut |v| {
                if v.try_setmark_tag(mode).is_some() {
                    roots.push(v);
                }
            });
            let _ = m;
        }
        self.callbacks.root_scanners.iter_call(|f| {
            f(&mut |v| {
                if v.try_setmark_tag(mode).is_some() {
                    roots.push(v);
                }
            })
        });
        self.callbacks.task_scanners.iter_call(|f| {
            f(&mut |v| {
                if v.try_setmark_tag(mode).is_some() {
                    roots.push(v);
                }
            })
        });

        // Step 5: mark_loop, parallel over `options.threads` marker
        // threads via a Chase-Lev deque per thread.
        let thread_count = self.options.threads.max(1);
        let deques: Vec<Deque> = (0..thread_count).map(|_| Deque::new()).collect();
        for (i, v) in roots.into_iter().enumerate() {
            deques[i % thread_count].push(v);
        }

        let mut remset_candidates: Vec<Value> = Vec::new();
        let mut total_remset_nptr: u64 = 0;
        {
            let deques_ref = &deques;
            let binding_ref = &self.binding;
            std::thread::scope(|scope| {
                let handles: Vec<_> = (0..thread_count)
                    .map(|i| {
                        let peers: Vec<&Deque> = deques_ref
                            .iter()
                            .enumerate()
                            .filter(|(j, _)| *j != i)
                            .map(|(_, d)| d)
                            .collect();
                        scope.spawn(move || {
                            let mut local_candidates = Vec::new();
                            let mut marker = Marker::new(&deques_ref[i], &peers);
                            marker.run(binding_ref, mode, |v| local_candidates.push(v));
                            (marker.stats, local_candidates)
                        })
                    })
                    .collect();
                for h in handles {
                    let (mark_stats, candidates) = h.join().expect("marker thread panicked");
                    total_remset_nptr += mark_stats.remset_nptr;
                    remset_candidates.extend(candidates);
                }
            });
        }

        // The triggering mutator absorbs every remset candidate discovered
        // this cycle: per-object owning-mutator tracking isn't modeled, so
        // candidates are routed to whichever mutator is driving the cycle
        // (documented simplification, DESIGN.md).
        if let Some(driver) = mutators.first() {
            let mut guard = driver.lock().unwrap();
            for v in remset_candidates {
                guard.remset.push(v);
            }
        }

        // Step 6: finalizer discovery (§4.9).
        let to_finalize = self.discover_finalizers(&mutators, mode);

        // Step 7: decide sweep_full (spec.md:167-170). `reclaim_ratio` is
        // the *previous* cycle's freed/allocated ratio (§4.10 step 10 is
        // what resets the counters it reads); poor reclaim means doubling
        // the interval would be the next cycle's heuristic action (below),
        // so it only enters this decision via "would that doubling blow
        // through max_collect_interval" — a genuinely immediate condition.
        let live_bytes = self.stats.live_bytes.load(Ordering::Relaxed);
        let max_total_memory = self.max_total_memory.load(Ordering::Relaxed);
        let max_collect_interval = self.options.max_collect_interval as u64;
        let default_collect_interval = self.options.default_collect_interval as u64;
        let reclaim_ratio = self.stats.reclaim_ratio();
        let poor_reclaim = reclaim_ratio < 0.70;
        let current_interval = self.current_interval.load(Ordering::Relaxed);
        let interval_would_exceed_cap = poor_reclaim && current_interval.saturating_mul(2) > max_collect_interval;
        let remset_frontier_bytes = total_remset_nptr.saturating_mul(BYTES_IN_WORD as u64);
        let remset_frontier_full = remset_frontier_bytes >= default_collect_interval;
        let sweep_full = matches!(kind, CollectKind::Full)
            || self.conservative_gc_enabled()
            || (live_bytes > 0 && live_bytes as u64 > max_total_memory)
            || interval_would_exceed_cap
            || remset_frontier_full;
        self.stats.record_sweep_kind(sweep_full);
        log::debug!(
            "sweep_full = {sweep_full}, reclaim_ratio = {reclaim_ratio:.2}, remset_nptr = {total_remset_nptr}"
        );

        // Step 9: sweep phase (§4.8).
        self.run_sweep(&mutators, sweep_full);

        // Step 10: update heuristics. When the previous cycle's reclaim
        // was poor, double the interval (clamped to max_collect_interval)
        // rather than apply the ordinary live-bytes-based target — a
        // future-cycle effect, distinct from the immediate sweep_full
        // check above (spec.md:170).
        let live_bytes = self.stats.live_bytes.load(Ordering::Relaxed).max(0) as u64;
        let next_interval = if poor_reclaim {
            current_interval.saturating_mul(2).min(max_collect_interval)
        } else {
            (live_bytes / 2)
                .max(default_collect_interval)
                .min(max_total_memory.saturating_sub(live_bytes).max(default_collect_interval))
        };
        self.current_interval.store(next_interval, Ordering::Relaxed);
        for m in mutators.iter() {
            m.lock().unwrap().reset_interval(next_interval as usize);
        }
        self.stats.end_cycle();

        self.pending_finalizers.lock().unwrap().extend(to_finalize);

        drop(mutators);

        // Step 11: FULL kind may request one AUTO re-collection if the
        // heuristic flagged persistent promotion pressure.
        if matches!(kind, CollectKind::Full) && poor_reclaim {
            log::debug!("recollecting: poor reclaim ratio after a FULL sweep");
            self.run_cycle_body_only(CollectKind::Auto)?;
        }

        self.maybe_trim_malloc();

        self.callbacks.post_gc.iter_call(|f| f(sweep_full));
        self.binding.safepoint().safepoint_end();
        self.binding.debug_tap().on_phase_end("collect");
        log::debug!("collect finished");
        Ok(())
    }

    /// Recursive re-collect helper for step 11: runs the same phase
    /// sequence without re-claiming `gc_running` (the caller already holds
    /// it).
    fn run_cycle_body_only(&self, kind: CollectKind) -> GcResult<()> {
        self.run_cycle(kind)
    }

    fn discover_finalizers(&self, mutators: &[Mutex<Mutator>], mode: MarkMode) -> Vec<(Value, FinalizerEntry)> {
        let mut to_finalize = Vec::new();
        for m in mutators.iter() {
            let guard = m.lock().unwrap();
            finalizer::sweep_finalizer_list(&guard.finalizers, &mut to_finalize, &self.finalizer_list_marked);
        }
        let scratch = FinalizerList::new();
        scratch.merge_from(&self.finalizer_list_marked);
        finalizer::sweep_finalizer_list(&scratch, &mut to_finalize, &self.finalizer_list_marked);

        let mut secondary = MarkQueue::new();
        for m in mutators.iter() {
            let guard = m.lock().unwrap();
            finalizer::mark_finlist(&guard.finalizers, mode, |v| secondary.push(v));
        }
        finalizer::mark_finlist(&self.finalizer_list_marked, mode, |v| secondary.push(v));

        let layout = self.binding.type_layout();
        while let Some(v) = secondary.pop() {
            scan_object(layout, v, |child| {
                if child.try_setmark_tag(mode).is_some() {
                    secondary.push(child);
                }
            });
        }

        // §9 Open Question (DESIGN.md): reset-age is suppressed once
        // conservative GC support is enabled, since it would clear a
        // cell's age bit and make the freelist-vs-object disambiguation
        // in `conservative.rs` unreliable.
        if !self.conservative_gc_enabled() {
            finalizer::reset_age_for_pending(&to_finalize);
        }
        to_finalize
    }

    fn run_sweep(&self, mutators: &[Mutex<Mutator>], full: bool) {
        let layout = self.binding.type_layout();

        // Step 1: weak references.
        for m in mutators.iter() {
            m.lock().unwrap().weakrefs.sweep();
        }

        // Step 2: sweep_stack_pools has no modeled collaborator (no task
        // stack pool abstraction in this core's `vm::Binding`); treated as
        // a documented no-op.
        log::trace!("sweep_stack_pools skipped: no task-stack collaborator modeled");

        // Steps 3/4/5: foreign sweep funcs (folded into sweep_big/
        // sweep_pool below via `layout`), malloc'd arrays, big objects.
        let mut scratch_marked_big = BigObjectList::new();
        for m in mutators.iter() {
            let mut guard = m.lock().unwrap();
            let freed_notify = |bytes: usize| self.callbacks.notify_external_free.iter_call(|f| f(bytes));
            sweep::sweep_malloced_arrays(&mut guard.managed_arrays, freed_notify);
            let freed_notify = |bytes: usize| self.callbacks.notify_external_free.iter_call(|f| f(bytes));
            sweep::sweep_big(layout, &mut guard.big_objects, &mut scratch_marked_big, full, &self.stats, freed_notify);
        }

        // Step 6: pool pages.
        for m in mutators.iter() {
            let mut guard = m.lock().unwrap();
            let promote_age = self.options.promote_age;
            for pool in guard.pools_mut() {
                sweep::sweep_pool(
                    layout,
                    pool,
                    &self.page_alloc,
                    !full,
                    |survived_last_sweep| promote_age <= 1 && survived_last_sweep,
                    &self.stats,
                );
            }
        }
        self.page_alloc.drain_madvise_queue();

        // Step 7: full-sweep-only perm-alloc callback pass.
        if full {
            log::trace!("full sweep: perm-alloc growth callbacks already fire on slab growth");
        }

        // Step 8: remset retag (quick) or clear (full).
        for m in mutators.iter() {
            let mut guard = m.lock().unwrap();
            if full {
                guard.remset.clear_for_full_sweep();
            } else {
                guard.remset.retag_for_quick_sweep();
            }
        }
    }

    fn maybe_collect(&self, mutator_id: usize, size: usize) {
        let should_trigger = self.with_mutator(mutator_id, |m| m.record_alloc(size));
        if should_trigger {
            let _ = self.collect(mutator_id, CollectKind::Auto);
        }
    }

    /// §4.10 step 12: on glibc, trim the allocator's free list back to the
    /// OS if resident memory grew meaningfully since the last trim.
    #[cfg(target_os = "linux")]
    fn maybe_trim_malloc(&self) {
        let rss = Self::current_rss_kb();
        let last = self.last_trim_rss.load(Ordering::Relaxed);
        if last == 0 || rss > last + last / 4 {
            unsafe { libc::malloc_trim(0) };
            self.last_trim_rss.store(rss, Ordering::Relaxed);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn maybe_trim_malloc(&self) {}

    #[cfg(target_os = "linux")]
    fn current_rss_kb() -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|s| {
                s.lines()
                    .find(|l| l.starts_with("VmRSS:"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse::<u64>().ok())
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockBinding;

    fn new_collector() -> Collector<MockBinding> {
        Collector::new(MockBinding::new())
    }

    #[test]
    fn register_mutator_assigns_sequential_ids() {
        let c = new_collector();
        assert_eq!(c.register_mutator(), 0);
        assert_eq!(c.register_mutator(), 1);
    }

    #[test]
    fn alloc_small_returns_distinct_cleanly_tagged_values() {
        let c = new_collector();
        let mid = c.register_mutator();
        let type_ptr = Address::from_usize(0x1000_0000);
        let a = c.alloc_small(mid, 8, type_ptr).unwrap();
        let b = c.alloc_small(mid, 8, type_ptr).unwrap();
        assert_ne!(a.addr(), b.addr());
        assert_eq!(a.gc_bits(), GcBits::Clean);
    }

    #[test]
    fn alloc_big_is_born_old_and_tracked() {
        let c = new_collector();
        let mid = c.register_mutator();
        let v = c.alloc_big(mid, 1 << 20, Address::from_usize(0x1000_0000)).unwrap();
        assert!(v.gc_bits().is_old());
    }

    #[test]
    fn collect_auto_reclaims_unreachable_pool_objects() {
        let c = new_collector();
        let mid = c.register_mutator();
        let type_ptr = Address::from_usize(0x1000_0000);
        for _ in 0..4 {
            c.alloc_small(mid, 8, type_ptr).unwrap();
        }
        c.collect(mid, CollectKind::Auto).unwrap();
        assert_eq!(c.num().gc_num, 1);
    }

    #[test]
    fn collect_keeps_rooted_objects_alive() {
        let c = new_collector();
        let mid = c.register_mutator();
        let type_ptr = Address::from_usize(0x1000_0000);
        let v = c.alloc_small(mid, 8, type_ptr).unwrap();
        c.binding().stack_walker().roots.lock().unwrap().push(v);
        c.collect(mid, CollectKind::Full).unwrap();
        assert!(v.gc_bits() == GcBits::Clean || v.gc_bits().is_old());
    }

    #[test]
    fn disabled_mutator_collect_is_a_no_op() {
        let c = new_collector();
        let mid = c.register_mutator();
        c.enable(mid, false);
        assert!(c.collect(mid, CollectKind::Auto).is_ok());
        assert_eq!(c.num().gc_num, 0);
    }

    #[test]
    fn enable_finalizers_rejects_unbalanced_enable() {
        let c = new_collector();
        assert!(matches!(c.enable_finalizers(true), Err(GcError::DoubleEnableFinalizers)));
    }

    #[test]
    fn add_finalizer_then_collect_schedules_it_for_execution() {
        let c = new_collector();
        let mid = c.register_mutator();
        let type_ptr = Address::from_usize(0x1000_0000);
        let v = c.alloc_small(mid, 8, type_ptr).unwrap();
        c.add_finalizer(mid, v, Address::from_usize(0x2000), true);
        c.collect(mid, CollectKind::Full).unwrap();
        assert!(c.pending_finalizers.lock().unwrap().is_empty());
    }
}
