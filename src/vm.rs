//! External collaborators (§1): everything the core explicitly treats as
//! out of scope and consumes only through a contract. Mirrors the
//! teacher's `vm::VMBinding` trait family — a handful of small traits
//! composed into one bound that a language runtime implements once to
//! plug itself into the collector.

use crate::object::Value;
use crate::address::Address;

/// `fielddesc_type` (§4.7): how the mark engine should interpret a type's
/// pointer layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDesc {
    /// Fixed slots inside a single object, offsets in 1-byte units.
    Obj8(&'static [u8]),
    /// Fixed slots, offsets in 2-byte units.
    Obj16(&'static [u16]),
    /// Fixed slots, offsets in 4-byte units.
    Obj32(&'static [u32]),
    /// A contiguous array of `Value` pointers.
    ObjArray,
    /// A tagged managed stack frame chain.
    Stack,
    /// A native exception/backtrace stack.
    ExcStack,
    /// A module binding hash table.
    ModuleBinding,
    /// Dynamic dispatch to a type-supplied mark function (`fielddesc_type
    /// == 3`).
    Dynamic,
}

/// The type layout oracle: given a type pointer (the masked header word,
/// see [`crate::object::Value::type_ptr`]), answers how big an instance is
/// and how its pointer fields are laid out.
pub trait TypeLayout: Send + Sync {
    /// Size in bytes of an instance of this type (excluding header).
    fn size_of(&self, type_ptr: Address, instance: Value) -> usize;

    /// The field descriptor used to scan instances of this type.
    fn field_desc(&self, type_ptr: Address) -> FieldDesc;

    /// For `FieldDesc::Dynamic`: type-supplied mark function. Returns a
    /// bitmask whose bit 0 is "this object now refers to a young object"
    /// (used to decide remset insertion), matching §4.7's `markfunc`
    /// contract.
    fn dyn_mark(&self, type_ptr: Address, instance: Value, mark: &mut dyn FnMut(Value)) -> u8;

    /// Whether this type opted into a foreign sweep callback (§4.8 step
    /// 3, `sweep_foreign_objs`).
    fn sweep_func(&self, _type_ptr: Address) -> Option<fn(Value)> {
        None
    }
}

/// The safepoint primitive: `safepoint_begin/wait/end` (§1, §4.10, §5).
/// A real binding implements this with whatever rendezvous mechanism the
/// host runtime already uses (signal-based, polling, or a dedicated
/// park/unpark protocol); the collector only needs the three operations
/// below and the per-mutator state word described in §4.10's safepoint
/// contract.
pub trait SafepointProvider: Send + Sync {
    /// Called by the mutator that wins the race to start a collection.
    /// Must not return until every other registered mutator has observed
    /// the request and parked (`wait_for_the_world`, §4.10).
    fn safepoint_begin(&self);
    /// Called by the collector thread once the stop-the-world phases are
    /// complete, releasing every parked mutator.
    fn safepoint_end(&self);
    /// Called by a mutator to poll whether it should park right now
    /// (inserted at the allocation slow path and at user-defined polls,
    /// per §5).
    fn safepoint_poll(&self);
}

/// The per-thread exception stack and GC shadow-stack walker (§1). Used by
/// the mark engine's `stack`/`excstack` field descriptors (§4.7) to find
/// on-stack roots for a given mutator.
pub trait StackWalker: Send + Sync {
    /// Invoke `visit` once per live root on this mutator's shadow stack
    /// and exception stack.
    fn walk_roots(&self, mutator_id: usize, visit: &mut dyn FnMut(Value));
}

/// Debugging/profiling taps (§1): best-effort notifications, never
/// load-bearing for correctness.
pub trait DebugTap: Send + Sync {
    fn on_phase_begin(&self, _phase: &str) {}
    fn on_phase_end(&self, _phase: &str) {}
}

/// Foreign finalizer dispatch (§1): how a raw (non-managed) finalizer
/// callback is actually invoked. `add_finalizer`'s low-bit tag
/// distinguishes managed callbacks (invoked by the language runtime's own
/// calling convention) from raw ones dispatched through this trait.
pub trait ForeignFinalizerDispatch: Send + Sync {
    fn invoke_raw(&self, callback: Address, object: Value);
}

/// A no-op debug tap, for bindings that don't care.
pub struct NullDebugTap;
impl DebugTap for NullDebugTap {}

/// Everything a host runtime implements once to embed the collector,
/// composed the way `VMBinding` composes `ObjectModel + Scanning +
/// Collection + ActivePlan + ReferenceGlue` in the teacher framework.
pub trait Binding: Send + Sync + 'static {
    type TypeLayout: TypeLayout;
    type Safepoint: SafepointProvider;
    type StackWalker: StackWalker;
    type DebugTap: DebugTap;
    type ForeignFinalizer: ForeignFinalizerDispatch;

    fn type_layout(&self) -> &Self::TypeLayout;
    fn safepoint(&self) -> &Self::Safepoint;
    fn stack_walker(&self) -> &Self::StackWalker;
    fn debug_tap(&self) -> &Self::DebugTap;
    fn foreign_finalizer(&self) -> &Self::ForeignFinalizer;
}
