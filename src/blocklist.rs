use core::fmt;
use core::ptr::NonNull;

use log::trace;
use static_assertions::const_assert;

/// Every block size and every payload address is a multiple of this.
pub const ALIGNMENT: usize = 16;

/// The header at the start of every block in the arena, free or in use.
///
/// The header links to the blocks before and after it in the list, and holds
/// the size of the payload that follows it (not including the header).
///
/// We use C representation and align to 16 bytes, so a header followed by a
/// payload that is a multiple of 16 bytes always leaves the next header
/// aligned as well.
#[repr(C, align(16))]
pub struct BlockHeader {
    prev: Option<Block>,
    next: Option<Block>,
    size: usize,
    in_use: bool,
}

/// Bytes taken by a header; the payload starts this far past the block start.
pub const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const_assert!(HEADER_SIZE % ALIGNMENT == 0);
const_assert!(core::mem::align_of::<BlockHeader>() == ALIGNMENT);

/// The smallest span worth turning into a block: a header plus one unit of
/// payload. Anything smaller stays attached to its neighbour.
pub const MIN_BLOCK_BYTES: usize = HEADER_SIZE + ALIGNMENT;

/// Round `size` up to the next multiple of [`ALIGNMENT`], or `None` if that
/// overflows.
pub fn align_up(size: usize) -> Option<usize> {
    Some(size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1))
}

/// An enum for easy comparison of blocks and their order
enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A `Block` is a handle to a header living inside the arena.
///
/// It is only a pointer: copying it does not copy the block, and the block
/// outlives any handle to it until it is absorbed by a neighbour. Reading
/// through a handle is safe as long as the `BlockList` it came from is intact;
/// writing is `unsafe` and kept inside this crate.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// A Block is sendable - as long as the whole list is moved across threads
// together, its fine. It is not Sync; the list has a single writer.
unsafe impl Send for Block {}

impl Block {
    /// Write a fresh, free header at `ptr`, describing `size` payload bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to `ALIGNMENT` and point to `HEADER_SIZE + size`
    /// bytes owned by the arena and not covered by any other block.
    pub(crate) unsafe fn init(
        ptr: NonNull<u8>,
        size: usize,
        prev: Option<Block>,
        next: Option<Block>,
    ) -> Block {
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        debug_assert_eq!(size % ALIGNMENT, 0);

        let header: NonNull<BlockHeader> = ptr.cast();
        core::ptr::write(
            header.as_ptr(),
            BlockHeader {
                prev,
                next,
                size,
                in_use: false,
            },
        );
        Block { header }
    }

    /// Recover the block owning a payload pointer handed out earlier.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `Block::payload` on a block that is
    /// still part of a live `BlockList`.
    pub unsafe fn from_payload(ptr: NonNull<u8>) -> Block {
        let start = ptr.as_ptr().sub(HEADER_SIZE);
        Block {
            header: NonNull::new_unchecked(start).cast(),
        }
    }

    /// The first byte of the payload, the address handed to callers.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// Address of the header.
    pub fn start(&self) -> *const u8 {
        self.header.as_ptr() as *const u8
    }

    /// One past the last payload byte.
    pub fn end(&self) -> *const u8 {
        unsafe { self.start().add(self.span()) }
    }

    /// The size of the payload, in bytes.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    /// Header and payload together.
    pub fn span(&self) -> usize {
        HEADER_SIZE + self.size()
    }

    pub fn in_use(&self) -> bool {
        self.header_view().in_use
    }

    pub fn prev(&self) -> Option<Block> {
        self.header_view().prev
    }

    pub fn next(&self) -> Option<Block> {
        self.header_view().next
    }

    /// Whether `other` starts exactly where this block ends.
    pub fn touches(&self, other: &Block) -> bool {
        self.end() == other.start()
    }

    /// Compare two blocks to see how they are ordered.
    fn relation(&self, other: &Self) -> Relation {
        if self.end() < other.start() {
            Relation::Before
        } else if self.end() == other.start() {
            Relation::AdjacentBefore
        } else if self.start() < other.end() {
            Relation::Overlapping
        } else if self.start() == other.end() {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    /// # Safety
    ///
    /// Modifying a header in place can break the list invariants; callers
    /// must restore them before handing control back.
    unsafe fn header_mut(&mut self) -> &mut BlockHeader {
        self.header.as_mut()
    }

    pub(crate) unsafe fn set_in_use(&mut self, in_use: bool) {
        self.header_mut().in_use = in_use;
    }

    unsafe fn set_size(&mut self, size: usize) {
        debug_assert_eq!(size % ALIGNMENT, 0);
        self.header_mut().size = size;
    }

    unsafe fn set_prev(&mut self, prev: Option<Block>) {
        self.header_mut().prev = prev;
    }

    unsafe fn set_next(&mut self, next: Option<Block>) {
        self.header_mut().next = next;
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({:?}, {}, {})",
            self.header,
            self.size(),
            if self.in_use() { "used" } else { "free" }
        )
    }
}

/// What the heap walk reports for each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload address.
    pub address: *const u8,
    /// Payload capacity in bytes.
    pub size: usize,
    pub in_use: bool,
}

impl From<Block> for BlockInfo {
    fn from(block: Block) -> Self {
        BlockInfo {
            address: block.payload().as_ptr(),
            size: block.size(),
            in_use: block.in_use(),
        }
    }
}

/// A `BlockList` is a doubly linked list of every block carved out of the
/// arena, in address order.
///
/// Within one provider segment, neighbours touch. Segments from separate
/// provider calls are linked at their address, wherever the provider put
/// them; neighbours from segments with a gap between them do not touch, and
/// are never merged.
///
/// It maintains a few internal invariants:
///
/// - `first.prev` and `last.next` are `None`, and `b.next.prev == b`.
/// - Every block starts above the one before it.
/// - Every size is a multiple of `ALIGNMENT`.
/// - No two touching neighbours are both free.
#[derive(Default)]
pub struct BlockList {
    first: Option<Block>,
    last: Option<Block>,
}

pub struct BlockIter {
    next: Option<Block>,
}

impl Iterator for BlockIter {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = block.next();
        Some(block)
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "BlockList(")?;
        for block in self {
            writeln!(
                f,
                "  {:p} {} {:>10}",
                block.start(),
                if block.in_use() { "#" } else { " " },
                block.size()
            )?;
        }
        let (_, stats) = self.stats();
        writeln!(f, "  total size:    {:>10}", stats.spanned)?;
        writeln!(f, "  fragmentation: {:>10.3}", self.fragmentation())?;
        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of blocks overlapping their successor.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,

    /// Number of touching neighbours that are both free. These should have
    /// been coalesced.
    pub adjacent_free: usize,

    /// Number of blocks whose header or size is not a multiple of
    /// `ALIGNMENT`.
    pub misaligned: usize,

    /// Number of blocks starting below their predecessor.
    pub unordered: usize,

    /// Number of back links (or end pointers) that disagree with the forward
    /// links.
    pub broken_links: usize,

    /// Bytes by which the blocks fail to cover the adopted arena. Filled in by
    /// the allocator, which knows how large the arena is.
    pub unaccounted: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.adjacent_free == 0
            && self.misaligned == 0
            && self.unordered == 0
            && self.broken_links == 0
            && self.unaccounted == 0
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks.
    pub length: usize,
    /// Number of free blocks.
    pub free_length: usize,
    /// Payload bytes in use.
    pub used: usize,
    /// Payload bytes free.
    pub free: usize,
    /// Header and payload bytes over all blocks.
    pub spanned: usize,
}

impl BlockList {
    pub fn iter(&self) -> BlockIter {
        BlockIter { next: self.first }
    }

    pub fn first(&self) -> Option<Block> {
        self.first
    }

    pub fn last(&self) -> Option<Block> {
        self.last
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Find the first free block, in list order, with at least `size` payload
    /// bytes.
    pub fn first_fit(&self, size: usize) -> Option<Block> {
        self.iter().find(|block| !block.in_use() && block.size() >= size)
    }

    /// Take over a region from the arena provider.
    ///
    /// The region is linked in at its address, wherever that falls in the
    /// list. If it continues a free block, that block is simply extended;
    /// otherwise a new free block covers it. Either way, a free block starting
    /// right where the region ends is merged in as well.
    ///
    /// Returns the number of bytes now covered by blocks, which can be a little
    /// less than `len` if `start` was not aligned, or `None` if the region is
    /// too small to be used at all.
    ///
    /// # Safety
    ///
    /// `start..start + len` must be valid, writable memory, untouched by any
    /// other code for as long as this list lives.
    pub unsafe fn adopt(&mut self, start: NonNull<u8>, len: usize) -> Option<usize> {
        let offset = start.as_ptr().align_offset(ALIGNMENT);
        if offset >= len {
            return None;
        }
        let usable = (len - offset) & !(ALIGNMENT - 1);
        if usable == 0 {
            return None;
        }
        let aligned = start.as_ptr().add(offset);

        // The blocks on either side of the region, by address.
        let next = self.iter().find(|block| block.start() > aligned as *const u8);
        let prev = match next {
            Some(next) => next.prev(),
            None => self.last,
        };

        if let Some(mut prev) = prev {
            if !prev.in_use() && prev.end() == aligned as *const u8 {
                trace!("Extending free block {:?} by {}", prev, usable);
                prev.set_size(prev.size() + usable);
                self.absorb_next(prev);
                return Some(usable);
            }
        }

        if usable < MIN_BLOCK_BYTES {
            return None;
        }

        let block = Block::init(
            NonNull::new_unchecked(aligned),
            usable - HEADER_SIZE,
            prev,
            next,
        );
        match prev {
            Some(mut prev) => prev.set_next(Some(block)),
            None => self.first = Some(block),
        }
        match next {
            Some(mut next) => next.set_prev(Some(block)),
            None => self.last = Some(block),
        }
        trace!("Linked {:?}", block);
        self.absorb_next(block);

        Some(usable)
    }

    /// Shrink `block` to `size` payload bytes and link the rest after it as a
    /// new free block.
    ///
    /// Nothing happens if the rest could not hold a header and one unit of
    /// payload; the block keeps its extra space. Returns the new free block,
    /// if one was made.
    ///
    /// # Safety
    ///
    /// `block` must belong to this list, and `size` must be a multiple of
    /// `ALIGNMENT` no larger than its current size.
    pub unsafe fn split(&mut self, mut block: Block, size: usize) -> Option<Block> {
        let old_size = block.size();
        debug_assert!(size <= old_size);
        debug_assert_eq!(size % ALIGNMENT, 0);

        if old_size < size + MIN_BLOCK_BYTES {
            return None;
        }

        block.set_size(size);
        let next = block.next();
        let rest = Block::init(
            NonNull::new_unchecked(block.end() as *mut u8),
            old_size - size - HEADER_SIZE,
            Some(block),
            next,
        );
        match next {
            Some(mut next) => next.set_prev(Some(rest)),
            None => self.last = Some(rest),
        }
        block.set_next(Some(rest));
        trace!("Split {:?} off {:?}", rest, block);

        Some(rest)
    }

    /// Absorb the block after `block` into it, if that block exists, is free,
    /// and touches it. Returns whether a merge happened.
    ///
    /// # Safety
    ///
    /// `block` must belong to this list.
    pub unsafe fn absorb_next(&mut self, mut block: Block) -> bool {
        let next = match block.next() {
            None => return false,
            Some(next) => next,
        };
        if next.in_use() || !block.touches(&next) {
            return false;
        }

        block.set_size(block.size() + next.span());
        let after = next.next();
        block.set_next(after);
        match after {
            Some(mut after) => after.set_prev(Some(block)),
            None => self.last = Some(block),
        }
        trace!("Merged into {:?}", block);

        true
    }

    /// Mark `block` free and coalesce it with its neighbours: first the one
    /// after it, then the one before it. Returns the free block that now
    /// covers it.
    ///
    /// # Safety
    ///
    /// `block` must belong to this list.
    pub unsafe fn release(&mut self, mut block: Block) -> Block {
        block.set_in_use(false);
        self.absorb_next(block);

        match block.prev() {
            Some(prev) if !prev.in_use() && prev.touches(&block) => {
                self.absorb_next(prev);
                prev
            }
            _ => block,
        }
    }

    /// Check current size of the list, and whether its valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        if self.first.map_or(false, |first| first.prev().is_some()) {
            validity.broken_links += 1;
        }

        let mut previous: Option<Block> = None;
        for block in self.iter() {
            if block.start() as usize % ALIGNMENT != 0 || block.size() % ALIGNMENT != 0 {
                validity.misaligned += 1;
            }

            if let Some(prev) = previous {
                if block.prev() != Some(prev) {
                    validity.broken_links += 1;
                }
                match prev.relation(&block) {
                    Relation::AdjacentBefore => {
                        if !prev.in_use() && !block.in_use() {
                            validity.adjacent_free += 1;
                        }
                    }
                    Relation::Overlapping => {
                        // This is really bad.
                        validity.overlaps += 1;
                    }
                    Relation::Before => {
                        // A new segment. Fine.
                    }
                    Relation::AdjacentAfter | Relation::After => {
                        validity.unordered += 1;
                    }
                }
            }

            stats.length += 1;
            stats.spanned += block.span();
            if block.in_use() {
                stats.used += block.size();
            } else {
                stats.free_length += 1;
                stats.free += block.size();
            }
            previous = Some(block);
        }

        if previous != self.last {
            validity.broken_links += 1;
        }

        (validity, stats)
    }

    /// How scattered the free space is, between 0 (all free space in one
    /// block, or none free) and 1 (free space in many tiny blocks).
    ///
    /// Computed as `1 - (sqrt(Σ s²) / F)²` over free block sizes `s` summing
    /// to `F`; see <https://asawicki.info/news_1757_a_metric_for_memory_fragmentation>.
    pub fn fragmentation(&self) -> f64 {
        let mut squares = 0f64;
        let mut total = 0f64;
        for block in self.iter().filter(|b| !b.in_use()) {
            let size = block.size() as f64;
            squares += size * size;
            total += size;
        }
        if total == 0.0 {
            return 0.0;
        }

        1.0 - squares / (total * total)
    }
}
