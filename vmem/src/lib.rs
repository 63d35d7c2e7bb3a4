// Copyright 2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 or the MIT license, at your
// option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Virtual-memory mapping primitives for the allocator.
//!
//! The allocator works on a reserve-then-commit model. At initialization the
//! entire address interval it will ever use is *reserved*: mapped `PROT_NONE`
//! so that no other mapping can land inside it, but consuming no physical
//! memory. Individual superpage runs are then *committed* (remapped
//! read/write) when the tracker hands them out and *uncommitted* (remapped
//! `PROT_NONE`) when they are released. Because the reservation belongs to
//! this process for its whole lifetime, committing at a fixed address inside
//! it is always safe.
//!
//! Committed memory is freshly-faulted anonymous memory and therefore
//! zero-filled, which callers rely on.
//!
//! All lengths must be multiples of the system page size and all addresses
//! page-aligned. Failures surface as `Err(MapError)` carrying the OS errno;
//! the `_checked` variants abort instead, for callers with no recovery path.

#[cfg(not(unix))]
compile_error!("vmem only supports Unix targets");

use core::fmt;
use core::ptr::NonNull;

use alloc_assert::{alloc_assert, alloc_panic};

/// The OS errno from a failed mapping call.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MapError(pub i32);

impl fmt::Debug for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MapError(errno {})", self.0)
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// The system page size.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned `PROT_NONE` address-space reservation, unmapped on drop.
pub struct Reservation {
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> usize {
        self.base() + self.len
    }

    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base() && addr + len <= self.end()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut _, self.len);
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Reservation({:#x}..{:#x})", self.base(), self.end())
    }
}

/// Reserves `len` bytes of address space at an OS-chosen location.
pub fn reserve(len: usize) -> Result<Reservation, MapError> {
    unsafe { reserve_inner(core::ptr::null_mut(), len, 0) }
}

/// Reserves `len` bytes of address space starting exactly at `addr`.
///
/// # Safety
///
/// `addr` must be page-aligned and the range must not overlap any mapping
/// this process cares about: `MAP_FIXED` silently replaces what is there.
pub unsafe fn reserve_at(addr: usize, len: usize) -> Result<Reservation, MapError> {
    reserve_inner(addr as *mut _, len, libc::MAP_FIXED)
}

unsafe fn reserve_inner(
    hint: *mut libc::c_void,
    len: usize,
    extra_flags: libc::c_int,
) -> Result<Reservation, MapError> {
    let p = libc::mmap(
        hint,
        len,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | extra_flags,
        -1,
        0,
    );
    if p == libc::MAP_FAILED {
        return Err(MapError(errno()));
    }
    Ok(Reservation { base: NonNull::new_unchecked(p as *mut u8), len })
}

/// Makes `[addr, addr + len)` readable and writable, replacing whatever
/// mapping covered it. The resulting pages read as zero.
///
/// # Safety
///
/// The range must lie inside a reservation owned by the caller.
pub unsafe fn commit(addr: usize, len: usize) -> Result<(), MapError> {
    let p = libc::mmap(
        addr as *mut _,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    );
    if p == libc::MAP_FAILED {
        return Err(MapError(errno()));
    }
    Ok(())
}

/// Returns `[addr, addr + len)` to the reserved (`PROT_NONE`) state,
/// releasing its physical backing.
///
/// # Safety
///
/// Same contract as [`commit`].
pub unsafe fn uncommit(addr: usize, len: usize) -> Result<(), MapError> {
    let p = libc::mmap(
        addr as *mut _,
        len,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
        -1,
        0,
    );
    if p == libc::MAP_FAILED {
        return Err(MapError(errno()));
    }
    Ok(())
}

/// Hints the OS that the committed range's contents are disposable. The
/// mapping stays readable/writable; pages re-fault as zero.
///
/// # Safety
///
/// Same contract as [`commit`], and the range must be committed.
pub unsafe fn discard(addr: usize, len: usize) -> Result<(), MapError> {
    if libc::madvise(addr as *mut _, len, libc::MADV_DONTNEED) != 0 {
        return Err(MapError(errno()));
    }
    Ok(())
}

/// [`commit`], aborting on failure. Mapping failures inside the allocator are
/// not recoverable (callers may already hold half-built metadata).
pub unsafe fn commit_checked(addr: usize, len: usize) {
    if let Err(e) = commit(addr, len) {
        alloc_panic!("commit of {:#x}+{:#x} failed: {:?}", addr, len, e);
    }
}

/// [`uncommit`], aborting on failure.
pub unsafe fn uncommit_checked(addr: usize, len: usize) {
    if let Err(e) = uncommit(addr, len) {
        alloc_panic!("uncommit of {:#x}+{:#x} failed: {:?}", addr, len, e);
    }
}

/// Asserts that the compile-time page size constant used by a caller matches
/// the running system.
pub fn assert_page_size(expected: usize) {
    alloc_assert!(
        page_size() == expected,
        "system page size {} != expected {}",
        page_size(),
        expected
    );
}
