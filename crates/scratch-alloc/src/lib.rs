//! Fixed-capacity scratch allocators.
//!
//! This crate provides a free-list allocator over a single bounded arena, and
//! two composite allocators that put such an arena in front of a backing
//! allocator. Everything is `no_std` and only needs `alloc` for the
//! reference-counted default handle and the process heap adapter.
//!
//! # Available Allocators
//!
//! ## [`ScratchAllocator`](scratch::ScratchAllocator)
//!
//! A coalescing first-fit allocator over a caller-provided byte range. Block
//! headers are two bytes, and free-list links are stored as unit offsets
//! inside the free blocks themselves. Best suited for:
//!
//! - Short-lived working memory of bounded size
//! - Function-local or thread-local buffers
//! - Code paths where a heap round trip is too expensive
//!
//! Exhaustion is `None`; the allocator never grows.
//!
//! ## [`BoundedAllocator`](bounded::BoundedAllocator)
//!
//! An inline `N`-byte scratch arena plus a backing allocator that takes every
//! request the arena cannot hold. Single-threaded.
//!
//! ## [`LockingAllocator`](locking::LockingAllocator)
//!
//! The same composite with the arena behind a spin lock. The lock is never
//! held while the backing allocator runs. It also implements
//! [`GlobalAlloc`](core::alloc::GlobalAlloc).
//!
//! # Usage Examples
//!
//! ## Scratch arena over a stack buffer
//!
//! ```rust
//! use scratch_alloc::{arena::RawArena, scratch::ScratchAllocator};
//!
//! let mut buffer = [0_u8; 1024];
//! let allocator = ScratchAllocator::new(RawArena::from_bytes(&mut buffer));
//!
//! let ptr = allocator.allocate(100, 8).unwrap();
//! assert_eq!(ptr.addr().get() % 8, 0);
//! unsafe { allocator.free(ptr.as_ptr()) };
//!
//! // Everything freed: the arena is one free block again.
//! assert_eq!(allocator.stats().free_blocks, 1);
//! ```
//!
//! ## Generic and dynamic consumers
//!
//! ```rust
//! use scratch_alloc::{
//!     bounded::BoundedAllocator,
//!     contract::{Allocator, AllocatorExt as _},
//!     heap::GlobalHeap,
//! };
//!
//! fn with_static<A: Allocator>(allocator: &A) {
//!     let value = allocator.allocate_new([1_u32; 8]).unwrap();
//!     unsafe { allocator.delete_free(value) };
//! }
//!
//! fn with_dynamic(allocator: &dyn Allocator) {
//!     let value = allocator.allocate_with(|| [2_u64; 64]).unwrap();
//!     unsafe { allocator.delete_free(value) };
//! }
//!
//! let allocator = BoundedAllocator::<_, 256>::new(GlobalHeap);
//! with_static(&allocator);
//! with_dynamic(&allocator);
//! ```
//!
//! # Error Model
//!
//! Running out of memory is recoverable and reported as `None` (or
//! [`NewError::Exhausted`](error::NewError::Exhausted) from the typed
//! helpers). Misuse that the allocator can detect, such as a double free or
//! a pointer that does not belong to the arena, is not: it goes through
//! [`fatal::critical`], which logs the failure and panics.
//!
//! # Logging
//!
//! The crate logs through the [`log`] facade and installs no logger.
//! Overflow routing is logged at `trace`, blocks moved out of an arena at
//! `debug`, and critical failures at `error`.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod arena;
pub mod bounded;
pub mod contract;
pub mod error;
pub mod fatal;
pub mod global;
pub mod heap;
pub mod locking;
pub mod scratch;
pub mod tag;
