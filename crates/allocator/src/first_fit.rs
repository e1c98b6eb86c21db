//! First-fit free-list allocator.
//!
//! This module provides an allocator that keeps a single singly-linked list of
//! variable-sized free blocks. The list starts out as one block spanning the
//! whole region and is split on demand.
//!
//! # Algorithm
//!
//! - **Allocation**: Scans the free list from its head for the first block
//!   whose size covers the request plus one block header. A larger block is
//!   split: the head part is handed out and the tail becomes a new free block
//!   that takes the consumed block's place in the list. A block that matches
//!   exactly is unlinked whole.
//! - **Release**: Pushes the block onto the head of the free list. The list is
//!   therefore ordered by release (LIFO), not by address.
//! - **No coalescing**: Adjacent free blocks are never merged. Under
//!   allocate/release churn the free list grows into many small blocks, and a
//!   request can fail even though the total free bytes would cover it.
//!
//! # Memory Layout
//!
//! ```text
//! Pool:
//! ┌──────────────────────┬──────────────────────────────────────────────┐
//! │ PoolRecord (3 words) │ blocks ...                                   │
//! └──────────────────────┴──────────────────────────────────────────────┘
//!
//! Block:
//! ┌──────────────────────────────┬────────────────────────┐
//! │ BlockHeader (16 bytes)       │ payload (size bytes)   │
//! │ ┌─────────────┬─────────────┐│                        │
//! │ │ size: usize │ next: usize ││                        │
//! │ └─────────────┴─────────────┘│                        │
//! └──────────────────────────────┴────────────────────────┘
//! ```
//!
//! `size` is the payload of that exact block. Blocks are not aligned: a
//! request of `n` bytes places the next header exactly `n` bytes after the
//! payload start.

use alloc::boxed::Box;
use core::{iter, ptr::NonNull};

use dataview::Pod;
use snafu::ensure;

use crate::{
    region::{FreeSpan, Region},
    strategy::{CreateError, PoolAllocator, RegionTooSmallSnafu, Strategy},
};

const NIL: usize = 0;

/// Allocator bookkeeping stored at the start of the pool.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod)]
struct PoolRecord {
    /// Offset of the first block.
    start: usize,
    /// Bytes managed after the record.
    total_size: usize,
    free_head: usize,
}

/// Size of the pool record preceding the first block.
pub const RECORD_SIZE: usize = size_of::<PoolRecord>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod)]
struct BlockHeader {
    size: usize,
    next: usize,
}

/// Size of the header preceding every block payload.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// A first-fit allocator over a single region.
#[derive(Debug)]
pub struct FirstFitAllocator<'a> {
    region: Region<'a>,
}

impl<'a> FirstFitAllocator<'a> {
    /// Creates an allocator whose free list is one block covering `region`.
    ///
    /// Fails if the region cannot hold the pool record and one block header.
    ///
    /// # Examples
    ///
    /// ```
    /// # use allocator::{first_fit::FirstFitAllocator, region::Region};
    /// let mut pool = vec![0_u8; 4096];
    /// let mut allocator = FirstFitAllocator::create(Region::new(&mut pool)).unwrap();
    /// let ptr = allocator.allocate(100).unwrap();
    /// unsafe { allocator.release(ptr) };
    /// ```
    pub fn create(mut region: Region<'a>) -> Result<Self, CreateError> {
        let needed = RECORD_SIZE + HEADER_SIZE;
        ensure!(
            region.len() >= needed,
            RegionTooSmallSnafu {
                needed,
                actual: region.len(),
            }
        );

        let total_size = region.len() - RECORD_SIZE;
        region.write(
            RECORD_SIZE,
            &BlockHeader {
                size: total_size - HEADER_SIZE,
                next: NIL,
            },
        );
        region.write(
            0,
            &PoolRecord {
                start: RECORD_SIZE,
                total_size,
                free_head: RECORD_SIZE,
            },
        );

        Ok(Self { region })
    }

    fn record(&self) -> PoolRecord {
        self.region.read(0)
    }

    fn header(&self, offset: usize) -> BlockHeader {
        self.region.read(offset)
    }

    /// Points the link preceding a block (the list head when `prev` is
    /// `None`) at `next`.
    fn link(&mut self, prev: Option<usize>, next: usize) {
        match prev {
            None => {
                let record = self.record();
                self.region.write(
                    0,
                    &PoolRecord {
                        free_head: next,
                        ..record
                    },
                );
            }
            Some(prev) => {
                let header = self.header(prev);
                self.region.write(prev, &BlockHeader { next, ..header });
            }
        }
    }

    /// Allocates `size` bytes from the first free block large enough.
    ///
    /// A block qualifies when its size is at least `size` plus one header.
    /// Returns `None` for a zero size or when no block qualifies.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let needed = size.checked_add(HEADER_SIZE)?;

        let mut prev = None;
        let mut current = self.record().free_head;
        while current != NIL {
            let block = self.header(current);
            if block.size >= needed {
                let next = if block.size > needed {
                    let tail = current + HEADER_SIZE + size;
                    self.region.write(
                        tail,
                        &BlockHeader {
                            size: block.size - needed,
                            next: block.next,
                        },
                    );
                    self.region
                        .write(current, &BlockHeader { size, next: NIL });
                    tail
                } else {
                    self.region
                        .write(current, &BlockHeader { next: NIL, ..block });
                    block.next
                };
                self.link(prev, next);
                return Some(self.region.ptr_at(current + HEADER_SIZE));
            }
            prev = Some(current);
            current = block.next;
        }

        None
    }

    /// Pushes a block onto the head of the free list.
    ///
    /// The block keeps the size it was handed out with; it is not merged with
    /// its neighbours.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by
    /// [`allocate`](Self::allocate) on this allocator and has not been
    /// released since.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let start = self.record().start;
        let offset = self
            .region
            .offset_of(ptr)
            .and_then(|offset| offset.checked_sub(HEADER_SIZE))
            .filter(|&offset| offset >= start);
        debug_assert!(offset.is_some(), "pointer not allocated from this pool");
        let Some(offset) = offset else {
            return;
        };

        let header = self.header(offset);
        let next = self.record().free_head;
        self.region.write(offset, &BlockHeader { next, ..header });
        self.link(None, offset);
    }

    /// Returns the bytes managed after the pool record.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.record().total_size
    }

    /// Iterates over the free list, head first.
    pub fn free_blocks(&self) -> impl Iterator<Item = FreeSpan> {
        let head = Some(self.record().free_head).filter(|&offset| offset != NIL);
        iter::successors(head, move |&offset| {
            Some(self.header(offset).next).filter(|&next| next != NIL)
        })
        .map(move |offset| FreeSpan {
            offset,
            size: self.header(offset).size,
        })
    }

    /// Returns the total payload bytes of all free blocks.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_blocks().map(|span| span.size).sum()
    }

    /// Returns the payload size of the largest free block.
    #[must_use]
    pub fn largest_free_block(&self) -> Option<usize> {
        self.free_blocks().map(|span| span.size).max()
    }

    /// Tears the allocator down and hands the region back.
    ///
    /// The pool record is zeroed, so the region no longer describes an
    /// allocator.
    #[must_use]
    pub fn into_region(mut self) -> Region<'a> {
        self.region.write(0, &PoolRecord::default());
        self.region
    }
}

impl PoolAllocator for FirstFitAllocator<'_> {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        Self::allocate(self, size)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        unsafe { Self::release(self, ptr) }
    }

    fn destroy(self: Box<Self>) {
        let _region = self.into_region();
    }
}

/// The first-fit strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstFit;

impl Strategy for FirstFit {
    fn name(&self) -> &'static str {
        "first-fit"
    }

    fn create<'a>(&self, region: Region<'a>) -> Result<Box<dyn PoolAllocator + 'a>, CreateError> {
        let allocator = FirstFitAllocator::create(region)?;
        Ok(Box::new(allocator))
    }
}
