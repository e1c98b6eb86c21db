//! Operating-system backed memory.
//!
//! [`PageMapping`] owns an anonymous private mapping and lends it out as a
//! [`Region`]; dropping the mapping returns the pages to the OS. This is how a
//! pool is acquired at startup, and how a pool allocator's region is given
//! back once the allocator is destroyed.
//!
//! [`OsPages`] is the fallback strategy. It keeps no pool at all: every
//! allocation is a fresh mapping whose first word records the mapping length,
//! and every release unmaps exactly that length.
//!
//! ```text
//! OsPages allocation of n bytes:
//! ┌─────────────────────┬──────────────────────┐
//! │ n + WORD  (1 word)  │ payload (n bytes)    │
//! └─────────────────────┴──────────────────────┘
//! ^ page aligned        ^ returned pointer
//! ```

use alloc::boxed::Box;
use core::{
    ffi::c_int,
    ptr::{self, NonNull},
};

use cfg_if::cfg_if;
use snafu::{Location, Snafu, ensure};

use crate::{
    region::Region,
    strategy::{CreateError, PoolAllocator, Strategy},
};

/// The error type returned when the OS refuses a mapping.
#[derive(Debug, Snafu)]
pub enum MapError {
    #[snafu(display("cannot map an empty range"))]
    EmptyRange {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to map {len} bytes of anonymous memory: errno={errno}"))]
    Mmap {
        len: usize,
        errno: c_int,
        #[snafu(implicit)]
        location: Location,
    },
}

impl MapError {
    /// Returns where the error was raised.
    #[must_use]
    pub fn location(&self) -> &Location {
        match self {
            Self::EmptyRange { location } | Self::Mmap { location, .. } => location,
        }
    }
}

fn last_errno() -> c_int {
    cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // SAFETY: the errno location is valid for the calling thread.
            unsafe { *libc::__errno_location() }
        } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
            // SAFETY: the errno location is valid for the calling thread.
            unsafe { *libc::__error() }
        } else {
            0
        }
    }
}

fn map_anonymous(len: usize) -> Result<NonNull<u8>, MapError> {
    ensure!(len > 0, EmptyRangeSnafu);

    // SAFETY: an anonymous mapping without an address hint touches no
    // existing memory.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return MmapSnafu {
            len,
            errno: last_errno(),
        }
        .fail();
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| MmapSnafu { len, errno: 0 }.build())
}

/// # Safety
///
/// `base..base + len` must be a live mapping created by `map_anonymous` that
/// is not accessed afterwards.
unsafe fn unmap(base: NonNull<u8>, len: usize) {
    // SAFETY: guaranteed by the caller.
    let res = unsafe { libc::munmap(base.as_ptr().cast(), len) };
    debug_assert_eq!(res, 0, "munmap failed: errno={}", last_errno());
}

/// An owned anonymous memory mapping.
#[derive(Debug)]
pub struct PageMapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is exclusively owned.
unsafe impl Send for PageMapping {}

impl PageMapping {
    /// Maps `len` bytes of zeroed, readable and writable memory.
    pub fn new(len: usize) -> Result<Self, MapError> {
        let base = map_anonymous(len)?;
        Ok(Self { base, len })
    }

    /// Returns the first address of the mapping.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapping has no bytes (never the case for a
    /// successfully created mapping).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lends the whole mapping out as a region.
    pub fn region(&mut self) -> Region<'_> {
        // SAFETY: the mapping is valid for reads and writes until dropped, and
        // `&mut self` keeps it exclusive for the region's lifetime.
        unsafe { Region::from_raw_parts(self.base, self.len) }
    }
}

impl Drop for PageMapping {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `map_anonymous` and no region
        // borrowing it can outlive `self`.
        unsafe { unmap(self.base, self.len) };
    }
}

/// Size of the length word preceding every [`OsPages`] allocation.
pub const HEADER_SIZE: usize = size_of::<usize>();

/// The fallback strategy: one OS mapping per allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPages;

impl Strategy for OsPages {
    fn name(&self) -> &'static str {
        "os-pages"
    }

    fn create<'a>(&self, region: Region<'a>) -> Result<Box<dyn PoolAllocator + 'a>, CreateError> {
        Ok(Box::new(OsPagesAllocator { region }))
    }
}

/// The handle of the [`OsPages`] strategy.
///
/// Creation passes the given region through untouched; allocations never come
/// from it.
#[derive(Debug)]
pub struct OsPagesAllocator<'a> {
    region: Region<'a>,
}

impl<'a> OsPagesAllocator<'a> {
    /// Returns the region the handle was created with.
    #[must_use]
    pub fn region(&self) -> &Region<'a> {
        &self.region
    }
}

impl PoolAllocator for OsPagesAllocator<'_> {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let total = size.checked_add(HEADER_SIZE)?;
        let base = map_anonymous(total).ok()?;
        // SAFETY: the mapping holds at least `total` bytes.
        unsafe {
            base.cast::<usize>().write_unaligned(total);
            Some(base.add(HEADER_SIZE))
        }
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        // SAFETY: `ptr` was returned by `allocate`, so the length word
        // precedes it at the start of its mapping.
        unsafe {
            let base = ptr.sub(HEADER_SIZE);
            let total = base.cast::<usize>().read_unaligned();
            unmap(base, total);
        }
    }

    fn destroy(self: Box<Self>) {}
}
