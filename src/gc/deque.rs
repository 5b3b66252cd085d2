//! The Chase–Lev work-stealing deque (C6, §4.6), used to balance mark
//! work across a pool of marker threads. Hand-rolled rather than reused
//! from `crossbeam::deque` because the fence/ordering protocol itself is
//! the specified contract here, not an implementation detail; the shape
//! (owner-only `push`/`pop`, `steal` from any thread, atomic swap of the
//! backing array on resize) follows Chase & Lev (2005) with the
//! Lê-et-al. weak-memory fences, the same algorithm `crossbeam::deque`
//! implements internally.

use crate::object::Value;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

struct Buffer {
    mask: isize,
    slots: Box<[AtomicUsize]>,
}

impl Buffer {
    fn new(cap: usize) -> Self {
        debug_assert!(cap.is_power_of_two());
        Buffer {
            mask: cap as isize - 1,
            slots: (0..cap).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    fn cap(&self) -> isize {
        self.mask + 1
    }

    fn put(&self, i: isize, v: usize) {
        self.slots[(i & self.mask) as usize].store(v, Ordering::Relaxed);
    }

    fn get(&self, i: isize) -> usize {
        self.slots[(i & self.mask) as usize].load(Ordering::Relaxed)
    }
}

/// Outcome of a [`Deque::steal`] attempt. `Retry` means a concurrent
/// `pop`/`steal` raced for the same element; the caller should try again
/// rather than treat the deque as empty.
pub enum Steal {
    Empty,
    Success(Value),
    Retry,
}

/// One marker thread's deque. `push`/`pop` must only be called by the
/// owning thread; `steal` may be called by any thread, including the
/// owner's own peers.
pub struct Deque {
    top: AtomicIsize,
    bottom: AtomicIsize,
    buffer: AtomicPtr<Buffer>,
    /// Buffers replaced by a resize are kept alive indefinitely rather
    /// than reclaimed, since a concurrent stealer may still hold a
    /// pointer to one. Growth is rare and off the hot path (§4.6), so
    /// this is simpler than introducing epoch-based reclamation for a
    /// handful of doublings over a collector's lifetime.
    retired: Mutex<Vec<Box<Buffer>>>,
}

const MIN_CAP: usize = 64;

impl Deque {
    pub fn new() -> Self {
        let buf = Box::new(Buffer::new(MIN_CAP));
        Deque {
            top: AtomicIsize::new(0),
            bottom: AtomicIsize::new(0),
            buffer: AtomicPtr::new(Box::into_raw(buf)),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn buf(&self) -> &Buffer {
        unsafe { &*self.buffer.load(Ordering::Acquire) }
    }

    fn grow(&self, b: isize, t: isize) {
        let old = self.buf();
        let new_cap = (old.cap() as usize) * 2;
        let new_buf = Box::new(Buffer::new(new_cap));
        let mut i = t;
        while i != b {
            new_buf.put(i, old.get(i));
            i += 1;
        }
        let new_ptr = Box::into_raw(new_buf);
        let old_ptr = self.buffer.swap(new_ptr, Ordering::Release);
        self.retired.lock().unwrap().push(unsafe { Box::from_raw(old_ptr) });
    }

    /// Owner-only. §4.6: relaxed-load `bottom`, acquire-load `top`,
    /// relaxed capacity check, relaxed store into the buffer, a release
    /// fence, then a relaxed store of `bottom + 1`.
    pub fn push(&self, v: Value) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b - t >= self.buf().cap() {
            self.grow(b, t);
        }
        self.buf().put(b, v.addr().as_usize());
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Owner-only. §4.6's double-check-on-collision dance: decrement
    /// `bottom` first so a racing stealer sees a shrunk queue, then a
    /// full fence, then read `top` to see whether a steal is in flight
    /// for the last element.
    pub fn pop(&self) -> Option<Value> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        let buf_ptr = self.buffer.load(Ordering::Relaxed);
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);
        if t > b {
            // Queue was already empty; restore bottom.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }
        let buf = unsafe { &*buf_ptr };
        let raw = buf.get(b);
        if t == b {
            // Last element: race against any concurrent steal.
            let won = self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }
        Some(value_from_raw(raw))
    }

    /// May be called by any thread, including other stealers. §4.6:
    /// acquire-load `top`, full fence, acquire-load `bottom`; if
    /// non-empty, read the slot then CAS `top` to claim it.
    pub fn steal(&self) -> Steal {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return Steal::Empty;
        }
        let buf = self.buf();
        let raw = buf.get(t);
        match self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => Steal::Success(value_from_raw(raw)),
            Err(_) => Steal::Retry,
        }
    }

    pub fn is_empty(&self) -> bool {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        t >= b
    }

    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        (b - t).max(0) as usize
    }
}

impl Default for Deque {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Deque {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(self.buffer.load(Ordering::Relaxed)));
        }
    }
}

fn value_from_raw(raw: usize) -> Value {
    unsafe { Value::from_address(crate::address::Address::from_usize(raw)) }
}

// SAFETY: `push`/`pop` require external synchronization to a single owner
// thread (documented on the methods); `steal` is safe from any thread.
unsafe impl Send for Deque {}
unsafe impl Sync for Deque {}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(n: usize) -> Value {
        unsafe { Value::from_address(crate::address::Address::from_usize(n)) }
    }

    #[test]
    fn owner_push_pop_is_lifo() {
        let d = Deque::new();
        d.push(fake(0x10));
        d.push(fake(0x20));
        assert_eq!(d.pop().map(|v| v.addr().as_usize()), Some(0x20));
        assert_eq!(d.pop().map(|v| v.addr().as_usize()), Some(0x10));
        assert!(d.pop().is_none());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let d = Deque::new();
        let n = MIN_CAP * 4 + 3;
        for i in 1..=n {
            d.push(fake(i * 16));
        }
        let mut popped = 0;
        while d.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, n);
    }

    #[test]
    fn steal_from_empty_reports_empty() {
        let d = Deque::new();
        assert!(matches!(d.steal(), Steal::Empty));
    }

    #[test]
    fn concurrent_push_and_steal_partition_every_element_exactly_once() {
        use std::sync::Arc;
        use std::thread;

        let d = Arc::new(Deque::new());
        const N: usize = 200_000;
        for i in 1..=N {
            d.push(fake(i * 16));
        }

        let stolen = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let d = Arc::clone(&d);
            let stolen = Arc::clone(&stolen);
            handles.push(thread::spawn(move || loop {
                match d.steal() {
                    Steal::Success(v) => stolen.lock().unwrap().push(v.addr().as_usize()),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }));
        }

        let mut popped = Vec::new();
        while let Some(v) = d.pop() {
            popped.push(v.addr().as_usize());
        }

        for h in handles {
            h.join().unwrap();
        }

        let mut all: Vec<usize> = popped;
        all.extend(stolen.lock().unwrap().iter().copied());
        all.sort_unstable();
        let expected: Vec<usize> = (1..=N).map(|i| i * 16).collect();
        assert_eq!(all, expected);
    }
}
