use core::ptr::{null_mut, NonNull};

use first_fit_alloc::allocators::{RawAlloc, ToyHeap};
use first_fit_alloc::{ArenaConfig, ALIGNMENT};

use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use test_log::test;

// A live allocation: pointer, requested size, and the byte it is filled with.
#[derive(Clone, Copy)]
struct Slot {
    ptr: *mut u8,
    size: usize,
    fill: u8,
}

const EMPTY: Slot = Slot {
    ptr: null_mut(),
    size: 0,
    fill: 0,
};

fn validate(allocator: &RawAlloc<ToyHeap>, slots: &[Slot]) {
    let (validity, stats) = allocator.stats();
    log::trace!(
        "heap_size: {}; Validity: {:?}, Stats: {:?}",
        allocator.provider.size,
        validity,
        stats,
    );
    assert!(validity.is_valid(), "{:?}\n{}", validity, allocator.blocks);
    assert_eq!(stats.spanned, allocator.arena_size());

    let mut live_capacity = 0;
    for slot in slots.iter().filter(|s| !s.ptr.is_null()) {
        assert_eq!(slot.ptr as usize % ALIGNMENT, 0);
        let capacity = unsafe { allocator.capacity(NonNull::new(slot.ptr).unwrap()) };
        assert!(capacity >= slot.size);
        live_capacity += capacity;
    }
    assert_eq!(stats.used, live_capacity);
}

unsafe fn check_fill(slot: &Slot) {
    for i in 0..slot.size {
        assert_eq!(*slot.ptr.add(i), slot.fill, "byte {} of {:?}", i, slot.ptr);
    }
}

fn run(heap: ToyHeap, steps: usize) {
    let config = ArenaConfig::new().with_initial_size(4096);
    let mut allocator = Box::new(RawAlloc::with_config(heap, config));
    let mut slots = [EMPTY; 128];

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = Uniform::new_inclusive(1usize, 32);

    for step in 0..steps {
        let fill = (step % 251) as u8 + 1;
        let chosen = slots.choose_mut(&mut rng).unwrap();
        let new_size = range.sample(&mut rng) * range.sample(&mut rng);

        if chosen.ptr.is_null() {
            // Let's try allocating
            let zeroed = rng.gen_bool(0.25);
            let ptr = unsafe {
                if zeroed {
                    allocator.zero_allocate(new_size, 1)
                } else {
                    allocator.allocate(new_size)
                }
            };
            if ptr.is_null() {
                log::info!("Exhausted at step {} asking for {}", step, new_size);
                continue;
            }
            unsafe {
                if zeroed {
                    check_fill(&Slot {
                        ptr,
                        size: new_size,
                        fill: 0,
                    });
                }
                core::ptr::write_bytes(ptr, fill, new_size);
            }
            *chosen = Slot {
                ptr,
                size: new_size,
                fill,
            };
        } else if rng.gen_bool(0.5) {
            // Let's try resizing, keeping the common prefix
            let old = *chosen;
            let ptr = unsafe { allocator.resize(old.ptr, new_size) };
            if ptr.is_null() {
                log::info!("Resize exhausted at step {}", step);
                unsafe { check_fill(&old) };
                continue;
            }
            let kept = Slot {
                ptr,
                size: old.size.min(new_size),
                fill: old.fill,
            };
            unsafe {
                check_fill(&kept);
                core::ptr::write_bytes(ptr, fill, new_size);
            }
            *chosen = Slot {
                ptr,
                size: new_size,
                fill,
            };
        } else {
            // Let's try freeing
            unsafe {
                check_fill(chosen);
                allocator.release(chosen.ptr);
            }
            *chosen = EMPTY;
        }

        // And validate that everything is ok
        validate(&allocator, &slots);
    }

    for slot in slots.iter_mut().filter(|s| !s.ptr.is_null()) {
        unsafe {
            check_fill(slot);
            allocator.release(slot.ptr);
        }
        *slot = EMPTY;
    }
    validate(&allocator, &slots);

    // With everything released, each segment is a single free block.
    let (_, stats) = allocator.stats();
    assert_eq!(stats.used, 0);
    assert!(stats.free_length <= allocator.provider.growths);
}

#[test]
fn test_stress() {
    run(ToyHeap::default(), 1024 * 10);
}

#[test]
fn test_stress_segmented() {
    run(ToyHeap::with_gap(48), 1024 * 4);
}
