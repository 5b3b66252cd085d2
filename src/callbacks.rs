//! Extension callback lists (§6 "External interfaces"): the host runtime
//! may register a handful of hooks the controller invokes at fixed points
//! in a collection cycle. Registration is idempotent (registering the
//! same function pointer twice is a no-op); deregistration is O(n).

use crate::object::Value;
use std::sync::RwLock;

pub type RootScannerFn = fn(&mut dyn FnMut(Value));
pub type TaskScannerFn = fn(&mut dyn FnMut(Value));
pub type PreGcFn = fn(full: bool);
pub type PostGcFn = fn(full: bool);
pub type NotifyExternalAllocFn = fn(bytes: usize);
pub type NotifyExternalFreeFn = fn(bytes: usize);

macro_rules! callback_list {
    ($name:ident, $fn_ty:ty) => {
        #[derive(Default)]
        pub struct $name {
            callbacks: RwLock<Vec<$fn_ty>>,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            /// Registering the same function pointer twice is a no-op,
            /// so a binding that re-registers defensively on every
            /// (re)init doesn't accumulate duplicate calls.
            pub fn register(&self, f: $fn_ty) {
                let mut list = self.callbacks.write().unwrap();
                if !list.iter().any(|existing| std::ptr::fn_addr_eq(*existing, f)) {
                    list.push(f);
                }
            }

            pub fn deregister(&self, f: $fn_ty) {
                let mut list = self.callbacks.write().unwrap();
                list.retain(|existing| !std::ptr::fn_addr_eq(*existing, f));
            }

            pub fn iter_call(&self, mut call: impl FnMut($fn_ty)) {
                let list = self.callbacks.read().unwrap();
                for f in list.iter() {
                    call(*f);
                }
            }

            pub fn len(&self) -> usize {
                self.callbacks.read().unwrap().len()
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }
        }
    };
}

callback_list!(RootScannerList, RootScannerFn);
callback_list!(TaskScannerList, TaskScannerFn);
callback_list!(PreGcList, PreGcFn);
callback_list!(PostGcList, PostGcFn);
callback_list!(NotifyExternalAllocList, NotifyExternalAllocFn);
callback_list!(NotifyExternalFreeList, NotifyExternalFreeFn);

/// The six callback lists the controller consults over a cycle (§4.10
/// steps 2, 4, 13; §4.3 "external-alloc callback list"; §4.4
/// `gc_sweep_perm_alloc`).
#[derive(Default)]
pub struct Callbacks {
    pub root_scanners: RootScannerList,
    pub task_scanners: TaskScannerList,
    pub pre_gc: PreGcList,
    pub post_gc: PostGcList,
    pub notify_external_alloc: NotifyExternalAllocList,
    pub notify_external_free: NotifyExternalFreeList,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);
    fn pre(_full: bool) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn register_is_idempotent() {
        let list = PreGcList::new();
        list.register(pre);
        list.register(pre);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn deregister_removes_the_callback() {
        let list = PreGcList::new();
        list.register(pre);
        list.deregister(pre);
        assert!(list.is_empty());
    }

    #[test]
    fn iter_call_invokes_every_registered_callback() {
        CALLS.store(0, Ordering::SeqCst);
        let list = PreGcList::new();
        list.register(pre);
        list.iter_call(|f| f(true));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
