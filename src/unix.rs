//! Arena providers backed by the operating system, through libc.

use core::convert::TryFrom;
use core::ptr::{null_mut, NonNull};

use errno::Errno;

use crate::allocators::{round_up, ArenaProvider, Region};
use crate::blocklist::ALIGNMENT;

/// BreakProvider grows the arena by moving the program break with `sbrk`.
///
/// Consecutive regions are contiguous as long as nothing else in the process
/// moves the break, so the arena stays one span. If something does, the next
/// region simply becomes a new segment.
#[derive(Default)]
pub struct BreakProvider {
    // Whether the break has been aligned to ALIGNMENT yet
    aligned: bool,
    // Just for tracking, not really needed
    growths: usize,
}

impl BreakProvider {
    pub const fn new() -> Self {
        BreakProvider {
            aligned: false,
            growths: 0,
        }
    }

    pub fn growths(&self) -> usize {
        self.growths
    }

    unsafe fn sbrk(increment: libc::intptr_t) -> Result<*mut u8, Errno> {
        let ptr = libc::sbrk(increment);
        if ptr as isize == -1 {
            return Err(errno::errno());
        }
        Ok(ptr as *mut u8)
    }
}

impl ArenaProvider for BreakProvider {
    type Err = Errno;

    unsafe fn grow(&mut self, min_bytes: usize) -> Result<Region, Errno> {
        if !self.aligned {
            // Pad the break once, so every region we hand out starts aligned.
            let current = BreakProvider::sbrk(0)? as usize;
            let pad = current.wrapping_neg() % ALIGNMENT;
            if pad != 0 {
                BreakProvider::sbrk(pad as libc::intptr_t)?;
            }
            self.aligned = true;
        }

        let increment = match libc::intptr_t::try_from(min_bytes) {
            Ok(increment) if increment > 0 => increment,
            _ => return Err(Errno(libc::ENOMEM)),
        };
        let ptr = BreakProvider::sbrk(increment)?;
        let start = NonNull::new(ptr).ok_or(Errno(libc::ENOMEM))?;

        self.growths += 1;
        Ok(Region {
            start,
            len: min_bytes,
        })
    }
}

/// MmapProvider uses anonymous virtual memory pages to grow the arena.
///
/// Every region is a fresh mapping, usually not next to the previous one, so
/// each growth tends to add a new segment.
#[derive(Default)]
pub struct MmapProvider {
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

impl MmapProvider {
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn growths(&self) -> usize {
        self.growths
    }
}

impl ArenaProvider for MmapProvider {
    type Err = Errno;

    unsafe fn grow(&mut self, min_bytes: usize) -> Result<Region, Errno> {
        if min_bytes == 0 {
            return Err(Errno(libc::EINVAL));
        }
        let pagesize = sysconf::page::pagesize();
        let to_allocate = round_up(min_bytes, pagesize).ok_or(Errno(libc::ENOMEM))?;

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            // Amount of memory to allocate
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: We don't want a file descriptor, we're just going to
            //   use the memory.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            // The file descriptor we want memory mapped. We don't want a memory
            // mapped file, so -1 it is.
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        let start = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;

        self.pages += to_allocate / pagesize;
        self.growths += 1;

        Ok(Region {
            start,
            len: to_allocate,
        })
    }
}
