//! This is a very minimal example to show using the ArenaProvider functions.

use first_fit_alloc::{ArenaProvider, BreakProvider, MmapProvider};

fn main() {
    // BreakProvider moves the program break; regions follow each other.
    let mut brk = BreakProvider::new();
    let first = unsafe { brk.grow(4096).unwrap() };
    let second = unsafe { brk.grow(4096).unwrap() };
    println!("Break: {:?} then {:?}", first, second);
    println!(
        "    contiguous: {}",
        first.start.as_ptr() as usize + first.len == second.start.as_ptr() as usize
    );

    // MmapProvider maps fresh pages each time.
    let mut mmap = MmapProvider::default();
    let region = unsafe { mmap.grow(8).unwrap() };
    println!("Mmap: {:?} ({} pages)", region, mmap.pages());
}
