//! Heap allocator integration tests
//!
//! Run with: cargo test --test heap_test -- --nocapture

use groundwork::{Heap, PrintFlags, alloc_site};
use std::ptr::NonNull;

unsafe fn fill(ptr: NonNull<u8>, len: usize, value: u8) {
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), value, len) }
}

unsafe fn verify(ptr: NonNull<u8>, len: usize, value: u8) {
    unsafe {
        for offset in 0..len {
            assert_eq!(ptr.as_ptr().add(offset).read(), value, "mismatch at {offset}");
        }
    }
}

#[test]
fn test_split_then_coalesce_churn() {
    let heap = Heap::new();
    let mut ptrs = Vec::with_capacity(600);
    for index in 0..600usize {
        let ptr = heap.alloc(40, alloc_site!()).unwrap();
        unsafe { fill(ptr, 40, index as u8) };
        ptrs.push(ptr);
    }
    heap.check_state().unwrap();
    assert_eq!(heap.stats().live_bytes, 40 * 600);

    // Free every second block, then re-allocate the freed slots.
    for index in (0..600).step_by(2) {
        heap.free(ptrs[index].as_ptr());
    }
    heap.check_state().unwrap();
    for index in (0..600).step_by(2) {
        let ptr = heap.alloc(40, alloc_site!()).unwrap();
        unsafe { fill(ptr, 40, index as u8) };
        ptrs[index] = ptr;
    }
    heap.check_state().unwrap();
    assert_eq!(heap.stats().live_bytes, 40 * 600);
    assert_eq!(heap.stats().live_blocks, 600);

    // Nothing disturbed the survivors.
    for (index, ptr) in ptrs.iter().enumerate() {
        unsafe { verify(*ptr, 40, index as u8) };
    }

    for ptr in &ptrs {
        heap.free(ptr.as_ptr());
    }
    heap.check_state().unwrap();
    assert_eq!(heap.stats().live_bytes, 0);
    assert_eq!(heap.stats().live_blocks, 0);
}

#[test]
fn test_grow_and_realloc() {
    let heap = Heap::new();
    let mut ptrs: Vec<NonNull<u8>> = Vec::new();
    for index in 0..10usize {
        let ptr = heap.alloc(25_000, alloc_site!()).unwrap();
        unsafe { fill(ptr, 25_000, index as u8 + 1) };
        ptrs.push(ptr);
    }
    heap.check_state().unwrap();

    // Shrink in place.
    for (index, slot) in ptrs.iter_mut().enumerate() {
        let ptr = heap.realloc(Some(*slot), 12_500).unwrap().unwrap();
        assert_eq!(ptr, *slot, "shrink must not move the block");
        unsafe { verify(ptr, 12_500, index as u8 + 1) };
        *slot = ptr;
    }
    heap.check_state().unwrap();

    // Grow, possibly moving; contents must follow.
    for (index, slot) in ptrs.iter_mut().enumerate() {
        let ptr = heap.realloc(Some(*slot), 50_000).unwrap().unwrap();
        unsafe {
            verify(ptr, 12_500, index as u8 + 1);
            fill(ptr, 50_000, index as u8 + 101);
        }
        *slot = ptr;
    }
    heap.check_state().unwrap();

    for (index, ptr) in ptrs.iter().enumerate() {
        unsafe { verify(*ptr, 50_000, index as u8 + 101) };
        assert_eq!(heap.ptr_size(ptr.as_ptr()), 50_000);
    }

    for ptr in &ptrs {
        heap.free(ptr.as_ptr());
    }
    heap.check_state().unwrap();
    assert_eq!(heap.stats().live_bytes, 0);
}

#[test]
fn test_randomized_churn() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let heap = Heap::new();
    let mut rng = StdRng::seed_from_u64(0xA110C);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for round in 0..4000u32 {
        match rng.r#gen::<u32>() % 10 {
            // Mostly small allocations, to exercise the size cache.
            0..=4 => {
                let size = 1 + (rng.r#gen::<usize>() % 200);
                let value = rng.r#gen::<u8>();
                let ptr = heap.alloc(size, alloc_site!()).unwrap();
                unsafe { fill(ptr, size, value) };
                live.push((ptr, size, value));
            }
            5..=6 => {
                let size = 300 + (rng.r#gen::<usize>() % 20_000);
                let value = rng.r#gen::<u8>();
                let ptr = heap.alloc(size, alloc_site!()).unwrap();
                unsafe { fill(ptr, size, value) };
                live.push((ptr, size, value));
            }
            7..=8 => {
                if !live.is_empty() {
                    let index = rng.r#gen::<usize>() % live.len();
                    let (ptr, size, value) = live.swap_remove(index);
                    unsafe { verify(ptr, size, value) };
                    heap.free(ptr.as_ptr());
                }
            }
            _ => {
                if !live.is_empty() {
                    let index = rng.r#gen::<usize>() % live.len();
                    let (ptr, size, value) = live[index];
                    let new_size = 1 + (rng.r#gen::<usize>() % 4000);
                    let new_ptr = heap.realloc(Some(ptr), new_size).unwrap().unwrap();
                    unsafe {
                        verify(new_ptr, size.min(new_size), value);
                        fill(new_ptr, new_size, value);
                    }
                    live[index] = (new_ptr, new_size, value);
                }
            }
        }
        if round % 500 == 0 {
            heap.check_state().unwrap();
        }
    }

    let expected: usize = live.iter().map(|(_, size, _)| size).sum();
    assert_eq!(heap.stats().live_bytes, expected);
    for (ptr, size, value) in live.drain(..) {
        unsafe { verify(ptr, size, value) };
        heap.free(ptr.as_ptr());
    }
    heap.check_state().unwrap();
    assert_eq!(heap.stats().live_bytes, 0);
}

#[test]
fn test_leak_report_scoping() {
    let heap = Heap::new();
    let early = heap.alloc(777, alloc_site!()).unwrap();
    heap.mark_allocations();

    let late = heap.alloc(333, alloc_site!()).unwrap();
    let mut report = String::new();
    heap.print_allocations(PrintFlags::VERBOSE, &mut report);
    assert!(report.contains("333 bytes"));
    assert!(!report.contains("777 bytes"));

    // The suppressed block reappears when explicitly asked for.
    let mut full = String::new();
    heap.print_allocations(PrintFlags::INCLUDE_SUPPRESSED, &mut full);
    assert!(full.contains("777 bytes"));

    heap.free(early.as_ptr());
    heap.free(late.as_ptr());
}

#[test]
fn test_page_allocations_alongside_heap() {
    let heap = Heap::new();
    let page = groundwork::platform::page_size();

    let block = heap.alloc(1000, alloc_site!()).unwrap();
    let span = heap.alloc_pages(4, alloc_site!()).unwrap();
    assert_eq!(span.as_ptr() as usize % page, 0);
    unsafe {
        fill(span, 4 * page, 0x77);
        verify(span, 4 * page, 0x77);
    }
    assert_eq!(heap.ptr_size(span.as_ptr()), 4 * page);
    heap.check_state().unwrap();

    heap.free(span.as_ptr());
    heap.free(block.as_ptr());
    heap.check_state().unwrap();
    let stats = heap.stats();
    assert_eq!(stats.page_spans, 0);
    assert_eq!(stats.live_blocks, 0);
}
