//! The allocator strategy contract.
//!
//! A strategy is one concrete implementation of four operations:
//!
//! | Operation  | Provided by                    |
//! |------------|--------------------------------|
//! | `create`   | [`Strategy::create`]           |
//! | `allocate` | [`PoolAllocator::allocate`]    |
//! | `release`  | [`PoolAllocator::release`]     |
//! | `destroy`  | [`PoolAllocator::destroy`]     |
//!
//! `create` binds a strategy to a [`Region`] and yields the allocator handle;
//! the remaining operations act on that handle. The size-class and first-fit
//! allocators as well as the OS-backed fallback all implement this contract,
//! which lets a loader pick one at run time and drive it through a
//! `dyn Strategy`.

use alloc::boxed::Box;
use core::ptr::NonNull;

use bitflags::bitflags;
use snafu::{Location, Snafu};

use crate::region::Region;

bitflags! {
    /// The set of contract operations a strategy implementation provides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Operations: u8 {
        const CREATE = 1 << 0;
        const ALLOCATE = 1 << 1;
        const RELEASE = 1 << 2;
        const DESTROY = 1 << 3;
    }
}

/// The error type returned when an allocator cannot be created over a region.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CreateError {
    #[snafu(display(
        "region too small for allocator bookkeeping: needed={needed}, actual={actual}"
    ))]
    RegionTooSmall {
        needed: usize,
        actual: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl CreateError {
    /// Returns where the error was raised.
    #[must_use]
    pub fn location(&self) -> &Location {
        match self {
            Self::RegionTooSmall { location, .. } => location,
        }
    }
}

/// An allocator handle created by a [`Strategy`].
///
/// A handle is driven from a single logical sequence of calls; it needs no
/// internal synchronization. See [`Locked`](crate::locked::Locked) for
/// sharing one between threads.
pub trait PoolAllocator {
    /// Allocates `size` bytes.
    ///
    /// Returns `None` when `size` is zero or when no free block can satisfy
    /// the request. Exhaustion is not fatal: a later request of another size
    /// may still succeed.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by [`allocate`](Self::allocate) on this same
    ///   handle
    /// - `ptr` has not been released since
    /// - the block is not accessed after this call
    unsafe fn release(&mut self, ptr: NonNull<u8>);

    /// Tears the handle down.
    ///
    /// Blocks still allocated from the handle must not be used afterwards.
    fn destroy(self: Box<Self>);
}

/// A pool allocator implementation that can be selected at run time.
pub trait Strategy {
    /// Returns the canonical name of the strategy.
    fn name(&self) -> &'static str;

    /// Returns the operations this implementation provides.
    ///
    /// A loader refuses to bind an implementation that does not provide every
    /// operation in [`Operations::all`].
    fn exports(&self) -> Operations {
        Operations::all()
    }

    /// Creates an allocator handle managing `region`.
    fn create<'a>(&self, region: Region<'a>) -> Result<Box<dyn PoolAllocator + 'a>, CreateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_complement() {
        let exported = Operations::CREATE | Operations::ALLOCATE;
        let missing = Operations::all() - exported;
        assert_eq!(missing, Operations::RELEASE | Operations::DESTROY);
        assert_eq!(
            missing.iter_names().map(|(name, _)| name).collect::<Vec<_>>(),
            ["RELEASE", "DESTROY"]
        );
    }

    #[test]
    fn test_create_error_display() {
        let err = RegionTooSmallSnafu {
            needed: 72_usize,
            actual: 40_usize,
        }
        .build();
        assert_eq!(
            err.to_string(),
            "region too small for allocator bookkeeping: needed=72, actual=40"
        );
        assert_eq!(err.location().file, file!());
    }
}
