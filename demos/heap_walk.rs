//! Allocate a few blocks from a toy heap, free them again, and print the heap
//! after each step.

use first_fit_alloc::allocators::{RawAlloc, ToyHeap};
use first_fit_alloc::ArenaConfig;

fn print_heap(allocator: &RawAlloc<ToyHeap>) {
    println!("{}", allocator.blocks);
    for block in allocator.walk() {
        println!(
            "    {:p} {:>6} {}",
            block.address,
            block.size,
            if block.in_use { "in use" } else { "free" }
        );
    }
    println!("    fragmentation: {:.3}\n", allocator.fragmentation());
}

fn main() {
    let config = ArenaConfig::new().with_initial_size(4096);
    let mut allocator = Box::new(RawAlloc::with_config(ToyHeap::default(), config));

    unsafe {
        let test = allocator.allocate(123);
        let l = allocator.allocate(core::mem::size_of::<u64>()) as *mut u64;
        *l = u64::MAX;
        let c = allocator.allocate(1);
        print_heap(&allocator);

        allocator.release(test);
        print_heap(&allocator);

        allocator.release(l as *mut u8);
        allocator.release(c);
        print_heap(&allocator);
    }
}
