//! A minimal fake host runtime (A5, §4.15), modeled on the teacher's
//! `util::test_util::mock_vm`: just enough of a type-layout oracle,
//! safepoint provider, and stack walker to drive the collector in tests
//! without a real language runtime attached.

use crate::address::Address;
use crate::constants::{BYTES_IN_WORD, HEAP_ALIGN};
use crate::object::Value;
use crate::vm::{Binding, FieldDesc, ForeignFinalizerDispatch, NullDebugTap, SafepointProvider, StackWalker, TypeLayout};
use std::collections::HashMap;
use std::sync::Mutex;

/// Synthetic "type pointer" base for mock objects: the field count is
/// encoded directly into the pointer's value so `field_desc` (which only
/// receives the type pointer, not the instance) can recover it without
/// any other state. Real bindings would instead look a real type up in
/// their own metadata table; this is a test-only shortcut.
const TYPE_BASE: usize = 0x1000_0000;

fn type_ptr_for(nfields: usize) -> Address {
    Address::from_usize(TYPE_BASE + nfields * HEAP_ALIGN)
}

fn nfields_of(type_ptr: Address) -> usize {
    (type_ptr.as_usize() - TYPE_BASE) / HEAP_ALIGN
}

/// A trivial type-layout oracle: every allocated object is described as a
/// flat `Obj8` layout over `nfields` consecutive pointer-sized slots,
/// exercising the mark engine's field scanners without a real host type
/// system attached.
pub struct MockLayout {
    offsets_by_nfields: Mutex<HashMap<usize, &'static [u8]>>,
}

impl MockLayout {
    pub fn new() -> Self {
        MockLayout {
            offsets_by_nfields: Mutex::new(HashMap::new()),
        }
    }

    /// The `type_ptr` this oracle expects for an `nfields`-field object —
    /// for driving [`crate::Collector::alloc_small`]/`alloc_big` directly
    /// rather than through [`MockLayout::alloc_object`], when the test
    /// needs the allocation to live in a real GC pool/big-object list.
    pub fn type_ptr_for(nfields: usize) -> Address {
        type_ptr_for(nfields)
    }

    /// Allocate an object with `nfields` zeroed pointer-sized slots,
    /// scanned as `FieldDesc::Obj8` at byte offsets `0, WORD, 2*WORD, ...`.
    pub fn alloc_object(&self, nfields: usize) -> Value {
        let data_size = (nfields * BYTES_IN_WORD).max(HEAP_ALIGN);
        let total = BYTES_IN_WORD + data_size;
        let layout = std::alloc::Layout::from_size_align(total, HEAP_ALIGN).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        let header_addr = Address::from_usize(base as usize);
        unsafe { Value::init_header(header_addr, type_ptr_for(nfields)) };
        unsafe { Value::from_address(header_addr + BYTES_IN_WORD) }
    }

    /// Write `child`'s address into field `idx` of `obj`.
    pub fn set_field(&self, obj: Value, idx: usize, child: Value) {
        let slot = obj.addr() + idx * BYTES_IN_WORD;
        unsafe { slot.store::<usize>(child.addr().as_usize()) };
    }

    fn offsets_for(&self, nfields: usize) -> &'static [u8] {
        let mut map = self.offsets_by_nfields.lock().unwrap();
        *map.entry(nfields).or_insert_with(|| {
            let v: Vec<u8> = (0..nfields).map(|i| (i * BYTES_IN_WORD) as u8).collect();
            Box::leak(v.into_boxed_slice())
        })
    }
}

impl Default for MockLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeLayout for MockLayout {
    fn size_of(&self, type_ptr: Address, _instance: Value) -> usize {
        nfields_of(type_ptr) * BYTES_IN_WORD
    }

    fn field_desc(&self, type_ptr: Address) -> FieldDesc {
        FieldDesc::Obj8(self.offsets_for(nfields_of(type_ptr)))
    }

    fn dyn_mark(&self, _type_ptr: Address, _instance: Value, _mark: &mut dyn FnMut(Value)) -> u8 {
        0
    }
}

pub struct MockSafepoint;
impl SafepointProvider for MockSafepoint {
    fn safepoint_begin(&self) {}
    fn safepoint_end(&self) {}
    fn safepoint_poll(&self) {}
}

#[derive(Default)]
pub struct MockStackWalker {
    pub roots: Mutex<Vec<Value>>,
}
impl StackWalker for MockStackWalker {
    fn walk_roots(&self, _mutator_id: usize, visit: &mut dyn FnMut(Value)) {
        for v in self.roots.lock().unwrap().iter() {
            visit(*v);
        }
    }
}

pub struct MockForeignFinalizer;
impl ForeignFinalizerDispatch for MockForeignFinalizer {
    fn invoke_raw(&self, _callback: Address, _object: Value) {}
}

pub struct MockBinding {
    layout: MockLayout,
    safepoint: MockSafepoint,
    stack_walker: MockStackWalker,
    debug_tap: NullDebugTap,
    foreign_finalizer: MockForeignFinalizer,
}

impl MockBinding {
    pub fn new() -> Self {
        MockBinding {
            layout: MockLayout::new(),
            safepoint: MockSafepoint,
            stack_walker: MockStackWalker::default(),
            debug_tap: NullDebugTap,
            foreign_finalizer: MockForeignFinalizer,
        }
    }
}

impl Default for MockBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl Binding for MockBinding {
    type TypeLayout = MockLayout;
    type Safepoint = MockSafepoint;
    type StackWalker = MockStackWalker;
    type DebugTap = NullDebugTap;
    type ForeignFinalizer = MockForeignFinalizer;

    fn type_layout(&self) -> &MockLayout {
        &self.layout
    }
    fn safepoint(&self) -> &MockSafepoint {
        &self.safepoint
    }
    fn stack_walker(&self) -> &MockStackWalker {
        &self.stack_walker
    }
    fn debug_tap(&self) -> &NullDebugTap {
        &self.debug_tap
    }
    fn foreign_finalizer(&self) -> &MockForeignFinalizer {
        &self.foreign_finalizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_object_fields_start_zeroed() {
        let layout = MockLayout::new();
        let a = layout.alloc_object(3);
        assert_eq!(a.gc_bits(), crate::object::GcBits::Clean);
    }

    #[test]
    fn set_field_then_scan_round_trips() {
        let layout = MockLayout::new();
        let a = layout.alloc_object(1);
        let b = layout.alloc_object(0);
        layout.set_field(a, 0, b);
        let desc = layout.field_desc(a.type_ptr());
        let mut found = None;
        if let FieldDesc::Obj8(offsets) = desc {
            for &off in offsets {
                let slot = a.addr() + off as usize;
                let raw = unsafe { slot.load::<usize>() };
                if raw != 0 {
                    found = Some(raw);
                }
            }
        }
        assert_eq!(found, Some(b.addr().as_usize()));
    }
}
