//! Caller-supplied memory regions.
//!
//! Every pool allocator in this crate manages exactly one [`Region`]: a
//! contiguous byte range handed over once at construction. All bookkeeping an
//! allocator needs (its pool record, list heads and block headers) lives
//! inside that range and is addressed by byte offset from the region base.
//!
//! Records are plain-old-data structs ([`dataview::Pod`]) read and written
//! through byte views at explicit offsets. The views use unaligned access, so
//! a header may start at any byte position inside the region.
//!
//! ```text
//! Region:
//! base                                                      base + len
//! ┌─────────────┬──────────┬───────────────┬──────────┬─────────────┐
//! │ pool record │ header   │ payload       │ header   │ payload ... │
//! └─────────────┴──────────┴───────────────┴──────────┴─────────────┘
//!  offset 0      offset h   offset h + H
//! ```

use core::{fmt, marker::PhantomData, ptr::NonNull, slice};

use dataview::{DataView, Pod};

/// A contiguous, exclusively borrowed byte range managed by one allocator.
///
/// The region never owns the memory it describes. It either borrows a byte
/// slice (see [`Region::new`]) or wraps a raw range whose validity the caller
/// vouches for (see [`Region::from_raw_parts`]), for example one lent by a
/// [`PageMapping`](crate::os::PageMapping).
pub struct Region<'a> {
    base: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

// SAFETY: a region stands for an exclusive borrow of plain bytes, which may
// move between threads like `&mut [u8]` does.
unsafe impl Send for Region<'_> {}

impl fmt::Debug for Region<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.base.addr().get()))
            .field("len", &self.len)
            .finish()
    }
}

/// A free block as seen from outside an allocator: where its header starts
/// and how many payload bytes it can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FreeSpan {
    /// Offset of the block header from the region base.
    pub offset: usize,
    /// Usable payload bytes following the header.
    pub size: usize,
}

impl<'a> Region<'a> {
    /// Creates a region covering the whole of `bytes`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use allocator::region::Region;
    /// let mut pool = vec![0_u8; 4096];
    /// let region = Region::new(&mut pool);
    /// assert_eq!(region.len(), 4096);
    /// ```
    #[must_use]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        let len = bytes.len();
        Self {
            base: NonNull::from(bytes).cast(),
            len,
            _marker: PhantomData,
        }
    }

    /// Creates a region from a base address and a length.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `base..base + len` is valid for reads and writes for `'a`
    /// - nothing else reads or writes the range while the region, or an
    ///   allocator built on it, is alive, except through pointers handed out
    ///   by that allocator
    #[must_use]
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            _marker: PhantomData,
        }
    }

    /// Returns the first address of the region.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Returns the length of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the region has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `ptr` lies within `base..base + len`.
    #[must_use]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// Returns the offset of `ptr` from the region base, or `None` if `ptr`
    /// lies outside the region.
    #[must_use]
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = ptr.addr().get().checked_sub(self.base.addr().get())?;
        (offset < self.len).then_some(offset)
    }

    /// Returns the address `offset` bytes past the region base.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is past the end of the region.
    #[must_use]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(
            offset <= self.len,
            "offset out of region bounds: offset={offset}, len={}",
            self.len
        );
        // SAFETY: `offset` stays within the region or one past its end.
        unsafe { self.base.add(offset) }
    }

    /// Reads a record stored at `offset`.
    pub(crate) fn read<T>(&self, offset: usize) -> T
    where
        T: Pod,
    {
        DataView::from(self.bytes(offset, size_of::<T>())).read(0)
    }

    /// Writes a record at `offset`.
    pub(crate) fn write<T>(&mut self, offset: usize, value: &T)
    where
        T: Pod,
    {
        DataView::from_mut(self.bytes_mut(offset, size_of::<T>())).write(0, value);
    }

    fn check_bounds(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "record out of region bounds: offset={offset}, record_len={len}, region_len={}",
            self.len
        );
    }

    fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.check_bounds(offset, len);
        // SAFETY: the range was bounds-checked above and the region is valid
        // for reads for its whole lifetime.
        unsafe { slice::from_raw_parts(self.base.add(offset).as_ptr(), len) }
    }

    fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        self.check_bounds(offset, len);
        // SAFETY: as in `bytes`, and `&mut self` guarantees the bookkeeping
        // bytes are not viewed twice at once.
        unsafe { slice::from_raw_parts_mut(self.base.add(offset).as_ptr(), len) }
    }
}
