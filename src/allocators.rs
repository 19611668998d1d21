//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded arena manager offering the classic
//! `malloc` / `calloc` / `realloc` / `free` operations as
//! [`allocate`](struct.RawAlloc.html#method.allocate),
//! [`zero_allocate`](struct.RawAlloc.html#method.zero_allocate),
//! [`resize`](struct.RawAlloc.html#method.resize) and
//! [`release`](struct.RawAlloc.html#method.release). Because it is not
//! thread-safe, it cannot be used as a global allocator by itself.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` with a spin lock to make it
//! thread-safe, allowing it to be used as the global allocator.
//! `UnixAllocator` is one backed by the program break.
//!
//! ### [`ArenaProvider`](trait.ArenaProvider.html)
//!
//! `ArenaProvider` is a simple trait interface meant to abstract over the calls
//! to the OS to extend the arena.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a static array that can pretend to be a heap, and implements
//! `ArenaProvider` for such a purpose. It is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use log::debug;
use spin::{Mutex, MutexGuard};

use crate::blocklist::{align_up, Block, BlockInfo, BlockIter, BlockList, Stats, Validity};
use crate::blocklist::{ALIGNMENT, HEADER_SIZE, MIN_BLOCK_BYTES};
use crate::config::ArenaConfig;
use crate::error::Exhausted;
#[cfg(feature = "use_libc")]
use crate::unix::BreakProvider;

// Round up value to the nearest multiple of increment, or None on overflow
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}

/// A span of fresh memory handed out by an [`ArenaProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: NonNull<u8>,
    pub len: usize,
}

pub trait ArenaProvider {
    type Err: fmt::Debug;

    /// Extend the arena by at least `min_bytes`. Returns the new region, which
    /// may be larger than requested.
    ///
    /// # Safety
    ///
    /// This is pretty much entirely unsafe.
    ///
    /// For this to function properly with the other types in this module:
    ///
    /// - The returned memory must be readable and writable, available, and
    ///   untracked by any other rust code, including the allocator itself.
    /// - It must stay at the same address for as long as the allocator lives.
    ///   Regions are never moved or given back.
    /// - Regions may land anywhere. One that touches an earlier region at
    ///   either end is treated as one span with it.
    /// - The provider must not allocate through the allocator calling it.
    unsafe fn grow(&mut self, min_bytes: usize) -> Result<Region, Self::Err>;
}

/// A raw allocator: it carves blocks out of an arena, grows the arena on
/// demand, and reuses released blocks first-fit.
///
/// Note: It never returns memory to the provider; that is not implemented.
pub struct RawAlloc<P> {
    pub provider: P,
    pub blocks: BlockList,
    config: ArenaConfig,
    arena_size: usize,
}

impl<P: ArenaProvider + Default> Default for RawAlloc<P> {
    fn default() -> Self {
        RawAlloc::new(P::default())
    }
}

impl<P: ArenaProvider> RawAlloc<P> {
    /// Create a new `RawAlloc` with the default [`ArenaConfig`].
    pub fn new(provider: P) -> Self {
        RawAlloc::with_config(provider, ArenaConfig::default())
    }

    pub fn with_config(provider: P, config: ArenaConfig) -> Self {
        RawAlloc {
            provider,
            blocks: BlockList::default(),
            config,
            arena_size: 0,
        }
    }

    /// Bytes obtained from the provider and covered by blocks.
    pub fn arena_size(&self) -> usize {
        self.arena_size
    }

    /// Get statistics on this allocator, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        let (mut validity, stats) = self.blocks.stats();
        validity.unaccounted = if stats.spanned > self.arena_size {
            stats.spanned - self.arena_size
        } else {
            self.arena_size - stats.spanned
        };
        (validity, stats)
    }

    pub fn fragmentation(&self) -> f64 {
        self.blocks.fragmentation()
    }

    /// Walk the heap in address order.
    pub fn walk(&self) -> impl Iterator<Item = BlockInfo> {
        let blocks: BlockIter = self.blocks.iter();
        blocks.map(BlockInfo::from)
    }

    /// Payload capacity of a live allocation.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator and not been released.
    pub unsafe fn capacity(&self, ptr: NonNull<u8>) -> usize {
        Block::from_payload(ptr).size()
    }

    ////////////////////////////////////////////////////////////
    // Arena growth

    /// Ask the provider for `bytes` more and link them in.
    unsafe fn request(&mut self, bytes: usize, requested: usize) -> Result<(), Exhausted> {
        let exhausted = Exhausted { requested };
        let bytes = align_up(bytes).ok_or(exhausted)?;

        let region = match self.provider.grow(bytes) {
            Ok(region) => region,
            Err(err) => {
                debug!("Arena provider refused {} bytes: {:?}", bytes, err);
                return Err(exhausted);
            }
        };

        match self.blocks.adopt(region.start, region.len) {
            Some(adopted) => {
                self.arena_size += adopted;
                debug!(
                    "Arena grew by {} bytes at {:?} to {} bytes",
                    adopted, region.start, self.arena_size
                );
                Ok(())
            }
            None => {
                // Whatever the provider gave us is lost; it is too small to
                // hold a block.
                debug!("Arena provider gave an unusable region {:?}", region);
                Err(exhausted)
            }
        }
    }

    /// Make room for a block of `size` payload bytes: at least double the
    /// arena, and always fit the request.
    unsafe fn grow(&mut self, size: usize) -> Result<(), Exhausted> {
        let exhausted = Exhausted { requested: size };
        let needed = size.checked_add(HEADER_SIZE).ok_or(exhausted)?;
        let bytes = self
            .config
            .growth_size(self.arena_size, needed)
            .ok_or(exhausted)?;
        self.request(bytes, size)
    }

    /// Find the first free block with room for `size` bytes, growing the
    /// arena once if there is none.
    unsafe fn locate_or_grow(&mut self, size: usize) -> Result<Block, Exhausted> {
        if self.blocks.is_empty() {
            let initial = self.config.initial_size.max(MIN_BLOCK_BYTES);
            self.request(initial, size)?;
        }

        let mut grown = false;
        loop {
            if let Some(block) = self.blocks.first_fit(size) {
                return Ok(block);
            }
            if grown {
                // The provider handed us less than it should have.
                return Err(Exhausted { requested: size });
            }
            self.grow(size)?;
            grown = true;
        }
    }

    /// Locate a block for `size` (already aligned) bytes, split it down and
    /// mark it used.
    unsafe fn take_block(&mut self, size: usize) -> Result<Block, Exhausted> {
        debug_assert_eq!(size % ALIGNMENT, 0);
        let mut block = self.locate_or_grow(size)?;
        self.blocks.split(block, size);
        block.set_in_use(true);
        Ok(block)
    }

    ////////////////////////////////////////////////////////////
    // The malloc family

    /// Allocate at least `size` bytes, aligned to `ALIGNMENT`.
    ///
    /// Returns null for a `size` of 0, or if the arena can't grow enough.
    ///
    /// # Safety
    ///
    /// The provider must uphold the `ArenaProvider` contract.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let aligned = match align_up(size) {
            Some(aligned) => aligned,
            None => return null_mut(),
        };

        match self.take_block(aligned) {
            Ok(block) => block.payload().as_ptr(),
            Err(err) => {
                debug!("{}", err);
                null_mut()
            }
        }
    }

    /// Allocate at least `size` bytes aligned to `align`.
    ///
    /// Only alignments up to `ALIGNMENT` can be served, since every payload
    /// is aligned to exactly that. Larger ones, or an `align` that is not a
    /// power of two, get null.
    ///
    /// # Safety
    ///
    /// See [`allocate`](#method.allocate).
    pub unsafe fn allocate_aligned(&mut self, align: usize, size: usize) -> *mut u8 {
        if !align.is_power_of_two() || align > ALIGNMENT {
            debug!("Refusing alignment {} for {} bytes", align, size);
            return null_mut();
        }
        self.allocate(size)
    }

    /// Allocate room for `count` items of `size` bytes each, zeroed.
    ///
    /// The whole block is zeroed, including any padding past `count * size`.
    /// Returns null if the total is 0, overflows, or the arena is exhausted.
    ///
    /// # Safety
    ///
    /// See [`allocate`](#method.allocate).
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(0) | None => return null_mut(),
            Some(total) => total,
        };
        let aligned = match align_up(total) {
            Some(aligned) => aligned,
            None => return null_mut(),
        };

        match self.take_block(aligned) {
            Ok(block) => {
                let payload = block.payload().as_ptr();
                ptr::write_bytes(payload, 0, block.size());
                payload
            }
            Err(err) => {
                debug!("{}", err);
                null_mut()
            }
        }
    }

    /// Release (or "free") an allocation. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator. Releasing
    /// anything else, or releasing twice, is undefined.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            None => return,
            Some(ptr) => ptr,
        };
        let block = Block::from_payload(ptr);
        debug_assert!(block.in_use(), "Releasing a free block at {:?}", ptr);
        self.blocks.release(block);
    }

    /// Change the size of an allocation, keeping its contents up to the
    /// smaller of the old and new sizes.
    ///
    /// The block is resized in place when it, together with a free block right
    /// after it, is large enough; the same pointer comes back and nothing is
    /// copied. Otherwise the contents move to a new block and the old one is
    /// released.
    ///
    /// A null `ptr` behaves like `allocate(new_size)`; a `new_size` of 0
    /// releases `ptr` and returns null. If the arena can't grow enough, null is
    /// returned and `ptr` is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let ptr = match NonNull::new(ptr) {
            None => return self.allocate(new_size),
            Some(ptr) => ptr,
        };
        if new_size == 0 {
            self.release(ptr.as_ptr());
            return null_mut();
        }
        let aligned = match align_up(new_size) {
            Some(aligned) => aligned,
            None => return null_mut(),
        };

        let block = Block::from_payload(ptr);
        let old_size = block.size();
        if aligned == old_size {
            return ptr.as_ptr();
        }

        // Take in a free follower, if any; that's also what leaves room for a
        // header when shrinking a block with little slack.
        self.blocks.absorb_next(block);
        if block.size() >= aligned {
            // Nothing free touches the block now, so the rest needs no merging.
            self.blocks.split(block, aligned);
            return ptr.as_ptr();
        }

        // Not enough room here. Give the follower back, then move.
        self.blocks.split(block, old_size);

        let new_block = match self.take_block(aligned) {
            Ok(new_block) => new_block,
            Err(err) => {
                debug!("{}", err);
                return null_mut();
            }
        };
        ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_block.payload().as_ptr(),
            old_size.min(new_size),
        );
        self.blocks.release(block);

        new_block.payload().as_ptr()
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// Thread-safety is required for an allocator to be used as a global allocator,
/// so that was easy to add with a spin lock. The `RawAlloc` is created on first
/// use, with the provider's `Default`.
pub struct GenericAllocator<P> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    raw: UnsafeCell<MaybeUninit<Mutex<RawAlloc<P>>>>,
    config: ArenaConfig,
}

// The RawAlloc is only reached through the mutex, once initialized.
unsafe impl<P: Send> Sync for GenericAllocator<P> {}

impl<P: ArenaProvider + Default> Default for GenericAllocator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> GenericAllocator<P> {
    pub const fn new() -> Self {
        Self::with_config(ArenaConfig::new())
    }

    /// An allocator whose `RawAlloc` will be built with `config`.
    pub const fn with_config(config: ArenaConfig) -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            raw: UnsafeCell::new(MaybeUninit::uninit()),
            config,
        }
    }
}

impl<P: ArenaProvider + Default> GenericAllocator<P> {
    /// Get a reference to the underlying RawAlloc.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard is in
    /// place.
    pub unsafe fn get_raw(&self) -> MutexGuard<RawAlloc<P>> {
        // Whoever moves `init` from 0 to 1 writes the mutex into the cell and
        // publishes it with 2. Everyone else waits for the 2; only then is the
        // cell read.
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {
                // This is fully initialized, no need to do anything
            }
            Ok(0) => {
                // Nobody else touches the cell until we store 2.
                let slot: &mut MaybeUninit<Mutex<RawAlloc<P>>> = &mut *self.raw.get();
                slot.as_mut_ptr()
                    .write(Mutex::new(RawAlloc::with_config(P::default(), self.config)));

                // Let other threads know that the mutex and raw allocator are now initialized,
                // and they are free to use the mutex to access the raw allocator
                self.init.store(2, Ordering::SeqCst);
            }
            Err(1) => {
                // Some other thread is currently initializing. We wait for it.
                loop {
                    core::hint::spin_loop();

                    match self.init.load(Ordering::SeqCst) {
                        1 => continue,
                        2 => break,
                        state => panic!("Unexpected state {}", state),
                    }
                }
            }
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        let mx: &Mutex<RawAlloc<P>> = &*(*self.raw.get()).as_ptr();
        mx.lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().stats() }
    }
}

unsafe impl<P: ArenaProvider + Default + Send> GlobalAlloc for GenericAllocator<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.get_raw().allocate_aligned(layout.align(), layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.get_raw().release(ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.get_raw().zero_allocate(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.get_raw().resize(ptr, new_size)
    }
}

/// A global allocator growing its arena with the program break.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<BreakProvider>,
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    /// See [`GenericAllocator::get_raw`](struct.GenericAllocator.html#method.get_raw).
    ///
    /// # Safety
    ///
    /// Allocation through this allocator blocks while the guard is held.
    pub unsafe fn get_raw(&self) -> MutexGuard<RawAlloc<BreakProvider>> {
        self.alloc.get_raw()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}

pub const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A fixed buffer posing as an OS heap.
///
/// Each growth hands out the next `page_size`-rounded slice of `heap`, after
/// skipping `gap` bytes, so a non-zero `gap` makes every region a separate
/// segment. The buffer lives inside the struct: once anything has been
/// allocated from it, it must not be moved.
#[repr(C, align(16))]
pub struct ToyHeap {
    pub heap: [u8; TOY_HEAP_SIZE],
    pub page_size: usize,
    pub gap: usize,
    pub size: usize,
    pub growths: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            page_size: 64,
            gap: 0,
            size: 0,
            growths: 0,
        }
    }
}

impl ToyHeap {
    /// A toy heap leaving `gap` unused bytes between regions.
    pub fn with_gap(gap: usize) -> Self {
        ToyHeap {
            gap: round_up(gap, ALIGNMENT).unwrap_or(TOY_HEAP_SIZE),
            ..ToyHeap::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToyHeapExhausted {
    pub requested: usize,
    pub remaining: usize,
}

impl ArenaProvider for ToyHeap {
    type Err = ToyHeapExhausted;

    unsafe fn grow(&mut self, min_bytes: usize) -> Result<Region, Self::Err> {
        let start = if self.size == 0 {
            0
        } else {
            self.size.saturating_add(self.gap)
        };
        let remaining = self.heap.len().saturating_sub(start);
        let exhausted = ToyHeapExhausted {
            requested: min_bytes,
            remaining,
        };
        let allocating = round_up(min_bytes, self.page_size).ok_or(exhausted)?;
        if allocating > remaining {
            return Err(exhausted);
        }

        let ptr = self.heap.as_mut_ptr().add(start);
        self.size = start + allocating;
        self.growths += 1;
        Ok(Region {
            start: NonNull::new_unchecked(ptr),
            len: allocating,
        })
    }
}
