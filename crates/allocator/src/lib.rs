//! Pool allocators over a single caller-supplied memory region.
//!
//! Each allocator in this crate is handed one contiguous [`Region`] at
//! creation and satisfies every later request from inside it. All allocator
//! bookkeeping lives in the region too, addressed by byte offset. The
//! allocators are `no_std` compatible.
//!
//! # Available Strategies
//!
//! ## [`SizeClass`](size_class::SizeClass)
//!
//! A segregated free-list allocator. The region is carved once into blocks of
//! power-of-two payload sizes, filed into free lists by size class. Best
//! suited for:
//!
//! - Small, frequently repeated request sizes
//! - Workloads that tolerate rounding a request up to its class
//!
//! **Performance**: O(1) allocation from a non-top list and O(1) release.
//!
//! ## [`FirstFit`](first_fit::FirstFit)
//!
//! A single free list of variable-sized blocks, split on demand. Best suited
//! for:
//!
//! - Variable-sized requests
//! - Short-lived pools where fragmentation does not accumulate
//!
//! **Performance**: O(n) allocation where n is the number of free blocks,
//! O(1) release.
//!
//! ## [`OsPages`](os::OsPages)
//!
//! The fallback strategy. It ignores its region and maps fresh pages from the
//! operating system for every request.
//!
//! # Usage Example
//!
//! ```rust
//! use allocator::{region::Region, size_class::SizeClass, strategy::Strategy as _};
//!
//! let mut pool = vec![0_u8; 4096];
//! let mut allocator = SizeClass::default().create(Region::new(&mut pool)).unwrap();
//!
//! let ptr = allocator.allocate(100).unwrap();
//! // Use the allocated memory...
//!
//! // Free the memory
//! unsafe {
//!     allocator.release(ptr);
//! }
//! allocator.destroy();
//! ```
//!
//! # Design Considerations
//!
//! ## No Coalescing
//!
//! Neither pool strategy merges adjacent free blocks. Growing external
//! fragmentation under allocate/release churn is expected behavior: a request
//! can fail while the total free bytes would cover it.
//!
//! ## Memory Safety
//!
//! Releasing a pointer that did not come from the same handle's `allocate`,
//! or releasing one twice, is undefined behavior. Handles do not detect it.
//!
//! ## Thread Safety
//!
//! Handles are `Send` but not `Sync`. Wrap one in
//! [`Locked`](locked::Locked) to share it between threads.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod first_fit;
pub mod locked;
pub mod os;
pub mod region;
pub mod size_class;
pub mod strategy;
