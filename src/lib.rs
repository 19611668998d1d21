#![cfg_attr(not(test), no_std)]

//! A first-fit memory allocator.
//!
//! This crate manages a growable arena and offers the `malloc` family on top of
//! it: [`allocate`], [`zero_allocate`], [`resize`] and [`release`]. Every block
//! in the arena, free or in use, starts with a header linking it to its
//! neighbours, so freed blocks are merged with free neighbours right away and
//! no bookkeeping lives outside the arena.
//!
//! ```text
//!  arena ─────────────────────────────────────────────────────────────▶
//!  ┌────────┬──────────┬────────┬──────┬────────┬─────────────────────┐
//!  │ header │ payload  │ header │ pay- │ header │ payload (free)      │
//!  │  used  │          │  used  │ load │  free  │                     │
//!  └────────┴──────────┴────────┴──────┴────────┴─────────────────────┘
//!             ▲ returned to callers, 16-byte aligned
//! ```
//!
//! Requests are served from the first free block that is large enough, which
//! is split if the rest is worth keeping. When nothing fits, the arena grows
//! through an [`ArenaProvider`]: at least doubling, and always enough for the
//! request.
//!
//! [`RawAlloc`] is the single-threaded engine. [`GenericAllocator`] (and
//! [`UnixAllocator`], with the `use_libc` feature) put it behind a spin lock so
//! it can be the `#[global_allocator]`:
//!
//! ```rust,ignore
//! use first_fit_alloc::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//! ```
//!
//! With the `replace_malloc` feature, the C symbols `malloc`, `calloc`,
//! `realloc` and `free` are exported as well.
//!
//! [`allocate`]: allocators/struct.RawAlloc.html#method.allocate
//! [`zero_allocate`]: allocators/struct.RawAlloc.html#method.zero_allocate
//! [`resize`]: allocators/struct.RawAlloc.html#method.resize
//! [`release`]: allocators/struct.RawAlloc.html#method.release
//! [`ArenaProvider`]: allocators/trait.ArenaProvider.html
//! [`RawAlloc`]: allocators/struct.RawAlloc.html
//! [`GenericAllocator`]: allocators/struct.GenericAllocator.html
//! [`UnixAllocator`]: allocators/struct.UnixAllocator.html

pub mod allocators;
pub mod blocklist;
pub mod config;
pub mod error;

#[cfg(feature = "use_libc")]
pub mod unix;

#[cfg(feature = "replace_malloc")]
mod cabi;

pub use allocators::{ArenaProvider, GenericAllocator, RawAlloc, Region, ToyHeap};
pub use blocklist::{BlockInfo, ALIGNMENT, HEADER_SIZE};
pub use config::ArenaConfig;
pub use error::Exhausted;

#[cfg(feature = "use_libc")]
pub use allocators::UnixAllocator;
#[cfg(feature = "use_libc")]
pub use unix::{BreakProvider, MmapProvider};
