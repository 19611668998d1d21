//! The C allocation functions, exported under their C names.
//!
//! Linking a binary with the `replace_malloc` feature routes every C caller in
//! the process through a single [`UnixAllocator`]. Aligned requests are served
//! up to `ALIGNMENT` bytes and fail above that. `valloc` and `pvalloc` are not
//! provided.

use core::ptr::NonNull;

use libc::{c_int, c_void, size_t};

use crate::allocators::UnixAllocator;

static ALLOCATOR: UnixAllocator = UnixAllocator::new();

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    ALLOCATOR.get_raw().allocate(size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    ALLOCATOR.get_raw().zero_allocate(count, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    ALLOCATOR.get_raw().resize(ptr as *mut u8, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    ALLOCATOR.get_raw().release(ptr as *mut u8)
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    ALLOCATOR.get_raw().allocate_aligned(align, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    align: size_t,
    size: size_t,
) -> c_int {
    if !align.is_power_of_two() || align % core::mem::size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }
    let ptr = ALLOCATOR.get_raw().allocate_aligned(align, size);
    if ptr.is_null() && size != 0 {
        return libc::ENOMEM;
    }
    *out = ptr as *mut c_void;
    0
}

#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    match NonNull::new(ptr as *mut u8) {
        None => 0,
        Some(ptr) => ALLOCATOR.get_raw().capacity(ptr),
    }
}

#[no_mangle]
pub unsafe extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    ALLOCATOR.get_raw().allocate_aligned(align, size) as *mut c_void
}
