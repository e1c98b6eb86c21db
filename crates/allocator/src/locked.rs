//! Sharing one allocator handle between threads.
//!
//! Allocator handles are single-threaded: every operation takes `&mut self`.
//! [`Locked`] wraps a handle in a spin lock so a shared reference is enough
//! to allocate and release, which keeps the sequential contract of the
//! wrapped allocator intact.

use core::ptr::NonNull;

use spin::Mutex;

use crate::strategy::PoolAllocator;

/// An allocator handle guarded by a mutex.
///
/// # Examples
///
/// ```
/// # use allocator::{locked::Locked, region::Region, size_class::SizeClassAllocator};
/// let mut pool = vec![0_u8; 4096];
/// let allocator = Locked::new(SizeClassAllocator::create(Region::new(&mut pool)).unwrap());
/// let ptr = allocator.allocate(64).unwrap();
/// unsafe { allocator.release(ptr) };
/// ```
#[derive(Debug, Default)]
pub struct Locked<A> {
    inner: Mutex<A>,
}

impl<A> Locked<A> {
    /// Wraps `allocator`.
    pub const fn new(allocator: A) -> Self {
        Self {
            inner: Mutex::new(allocator),
        }
    }

    /// Unwraps the allocator.
    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }
}

impl<A> Locked<A>
where
    A: PoolAllocator,
{
    /// Allocates `size` bytes under the lock.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.lock().allocate(size)
    }

    /// Releases a block under the lock.
    ///
    /// # Safety
    ///
    /// Same contract as [`PoolAllocator::release`].
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        unsafe { self.inner.lock().release(ptr) }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{first_fit::FirstFitAllocator, region::Region, size_class::SizeClassAllocator};

    struct SendPtr(NonNull<u8>);

    // SAFETY: the pointer is only handed back to the allocator it came from.
    unsafe impl Send for SendPtr {}

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        let mut heap = vec![0_u8; 1 << 16];
        let allocator = Locked::new(FirstFitAllocator::create(Region::new(&mut heap)).unwrap());

        let blocks: Vec<SendPtr> = thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..16)
                            .map(|_| SendPtr(allocator.allocate(64).unwrap()))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        let mut starts: Vec<_> = blocks.iter().map(|ptr| ptr.0.addr().get()).collect();
        starts.sort_unstable();
        assert_eq!(starts.len(), 64);
        assert!(starts.windows(2).all(|pair| pair[1] - pair[0] >= 64));

        for ptr in blocks {
            unsafe { allocator.release(ptr.0) };
        }
        let allocator = allocator.into_inner();
        assert_eq!(allocator.free_blocks().count(), 65);
    }

    #[test]
    fn test_into_inner() {
        let mut heap = vec![0_u8; 4096];
        let allocator = Locked::new(SizeClassAllocator::create(Region::new(&mut heap)).unwrap());
        let ptr = allocator.allocate(12).unwrap();
        let mut allocator = allocator.into_inner();
        assert_eq!(allocator.free_block_count(4), 1);
        unsafe { allocator.release(ptr) };
        assert_eq!(allocator.free_block_count(4), 2);
    }
}
