//! Inline scratch arena with overflow to a backing allocator.
//!
//! [`BoundedAllocator`] serves requests from an `N`-byte arena stored inside
//! the allocator value and hands everything that does not fit to a backing
//! allocator. Calls are routed by address: a pointer inside the arena belongs
//! to the arena, anything else belongs to the backing allocator. No
//! pointer-to-owner map is kept.
//!
//! ```rust
//! use scratch_alloc::{bounded::BoundedAllocator, contract::Allocator, heap::GlobalHeap};
//!
//! let allocator = BoundedAllocator::<_, 256>::new(GlobalHeap);
//! let small = allocator.allocate(32, 8).unwrap();
//! let large = allocator.allocate(4096, 8).unwrap();
//! assert!(allocator.is_our_ptr(small.as_ptr()));
//! assert!(!allocator.is_our_ptr(large.as_ptr()));
//! unsafe {
//!     allocator.free(small.as_ptr());
//!     allocator.free(large.as_ptr());
//! }
//! ```
//!
//! Arena allocations live inside the allocator value. [`Allocator::allocate`]
//! returns a raw pointer that does not borrow the allocator, so nothing stops
//! the value from being moved while allocations are outstanding. Such a move
//! leaves their pointers dangling. Moving an allocator with no outstanding
//! arena allocations is fine, because the arena metadata is stored as
//! offsets.

use core::ptr::NonNull;

use crate::{arena::InlineArena, contract::Allocator, scratch::ScratchAllocator};

/// A single-threaded composite of an inline scratch arena and a backing
/// allocator.
///
/// # Safety
///
/// Besides the requirements of [`Allocator`], [`free`](Allocator::free) and
/// [`reallocate`](Allocator::reallocate) require that the allocator has not
/// moved since `ptr` was allocated. Keep it in place (on the stack behind a
/// reference, or in a `Box`) while arena allocations are live.
#[derive(Debug)]
pub struct BoundedAllocator<B, const N: usize>
where
    B: Allocator,
{
    scratch: ScratchAllocator<InlineArena<N>>,
    backing: B,
}

impl<B, const N: usize> Default for BoundedAllocator<B, N>
where
    B: Allocator + Default,
{
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<B, const N: usize> BoundedAllocator<B, N>
where
    B: Allocator,
{
    #[must_use]
    pub fn new(backing: B) -> Self {
        Self {
            scratch: ScratchAllocator::new(InlineArena::new()),
            backing,
        }
    }

    /// The embedded scratch allocator.
    #[must_use]
    pub fn scratch(&self) -> &ScratchAllocator<InlineArena<N>> {
        &self.scratch
    }

    #[must_use]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Returns `true` if `ptr` points into the inline arena.
    #[must_use]
    pub fn is_our_ptr(&self, ptr: *const u8) -> bool {
        self.scratch.is_our_ptr(ptr)
    }
}

unsafe impl<B, const N: usize> Allocator for BoundedAllocator<B, N>
where
    B: Allocator,
{
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.scratch.allocate(bytes, align) {
            return Some(ptr);
        }
        if bytes == 0 {
            return None;
        }
        log::trace!("scratch arena full, {bytes} bytes from backing allocator");
        self.backing.allocate(bytes, align)
    }

    #[track_caller]
    unsafe fn reallocate(&self, ptr: *mut u8, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        let Some(old_ptr) = NonNull::new(ptr) else {
            return self.allocate(bytes, align);
        };
        if !self.scratch.is_our_ptr(ptr) {
            return unsafe { self.backing.reallocate(ptr, bytes, align) };
        }
        if let Some(new_ptr) = unsafe { self.scratch.reallocate(ptr, bytes, align) } {
            return Some(new_ptr);
        }

        // The arena cannot hold the new size; move the block out of it.
        let old_size = self.scratch.usable_size(old_ptr);
        let new_ptr = self.backing.allocate(bytes, align)?;
        unsafe {
            old_ptr.copy_to_nonoverlapping(new_ptr, old_size.min(bytes));
            self.scratch.free(ptr);
        }
        log::debug!(
            "moved {old_size} byte block from scratch arena to backing allocator ({bytes} bytes)"
        );
        Some(new_ptr)
    }

    #[track_caller]
    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if self.scratch.is_our_ptr(ptr) {
            unsafe { self.scratch.free(ptr) }
        } else {
            unsafe { self.backing.free(ptr) }
        }
    }
}
