//! The compile-time size-class table (§3 "Pool", §4.2). ~50 classes up to
//! `MAX_SZCLASS`, with finer granularity for small sizes (where rounding
//! waste matters most) and coarser steps as sizes grow, the same shape
//! jemalloc/mimalloc-style allocators use and that the teacher's own
//! native mark-sweep space picks its block cell sizes from.

use crate::constants::{HEAP_ALIGN, MAX_SZCLASS, NUM_SZCLASSES};

/// Build the size-class table once at first use: 8-byte steps up to 128
/// bytes, 16-byte steps up to 256, doubling-ish growth after that, capped
/// at `MAX_SZCLASS` and `NUM_SZCLASSES` entries.
fn build_table() -> Vec<usize> {
    let mut classes = Vec::with_capacity(NUM_SZCLASSES);
    let mut size = HEAP_ALIGN;
    while size <= 128 && classes.len() < NUM_SZCLASSES {
        classes.push(size);
        size += 8;
    }
    while size <= 256 && classes.len() < NUM_SZCLASSES {
        classes.push(size);
        size += 16;
    }
    while size <= MAX_SZCLASS && classes.len() < NUM_SZCLASSES - 1 {
        classes.push(size);
        size += (size / 4).max(32);
    }
    if *classes.last().unwrap_or(&0) < MAX_SZCLASS {
        classes.push(MAX_SZCLASS);
    }
    classes.dedup();
    classes
}

lazy_static::lazy_static! {
    static ref SIZE_CLASSES: Vec<usize> = build_table();
}

/// `pool_alloc`'s compile-time size-class classifier on `(sz + header)`:
/// map a requested allocation size (object data only, header excluded) to
/// the smallest size class whose cell fits `size + header`, or `None` if
/// it belongs on the big-object path.
pub fn classify(size: usize) -> Option<usize> {
    let needed = size + crate::constants::BYTES_IN_WORD;
    if needed > MAX_SZCLASS {
        return None;
    }
    SIZE_CLASSES
        .iter()
        .position(|&class_size| class_size >= needed)
}

pub fn cell_size(class_index: usize) -> usize {
    SIZE_CLASSES[class_index]
}

pub fn num_classes() -> usize {
    SIZE_CLASSES.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_small_object_into_smallest_fitting_class() {
        let idx = classify(8).expect("should fit a pool class");
        assert!(cell_size(idx) >= 8 + crate::constants::BYTES_IN_WORD);
        if idx > 0 {
            assert!(cell_size(idx - 1) < 8 + crate::constants::BYTES_IN_WORD);
        }
    }

    #[test]
    fn oversized_request_is_big_object() {
        assert!(classify(MAX_SZCLASS + 1).is_none());
    }

    #[test]
    fn table_is_monotonic_and_bounded() {
        assert!(num_classes() <= NUM_SZCLASSES);
        for w in SIZE_CLASSES.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!(*SIZE_CLASSES.last().unwrap() <= MAX_SZCLASS);
    }
}
