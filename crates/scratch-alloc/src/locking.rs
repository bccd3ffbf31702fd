//! Thread-safe inline scratch arena with overflow to a backing allocator.
//!
//! [`LockingAllocator`] routes calls exactly like
//! [`BoundedAllocator`](crate::bounded::BoundedAllocator), but keeps its
//! scratch arena behind a spin lock so one instance can be shared between
//! threads.
//!
//! The lock covers the scratch arena only. It is taken for a single scratch
//! operation at a time and is always released before the backing allocator is
//! called, so the backing allocator may block, take its own locks, or call
//! back into this allocator. Detected misuse is reported through
//! [`critical`](crate::fatal::critical) after the lock is released, so a
//! logger or critical hook may allocate through the same instance.
//!
//! Arena allocations point into the allocator value itself. Keep it in place
//! (in a `static`, behind a reference, in a `Box` or `Arc`) while any of them
//! are outstanding.

use core::{
    alloc::{GlobalAlloc, Layout},
    ops::Range,
    ptr::{self, NonNull},
};

use spin::mutex::{SpinMutex, SpinMutexGuard};

use crate::{arena::InlineArena, contract::Allocator, scratch::ScratchAllocator};

/// A thread-safe composite of an inline scratch arena and a backing
/// allocator.
///
/// `LockingAllocator` is `Sync` whenever the backing allocator is, and can
/// then also serve as a [`GlobalAlloc`].
#[derive(Debug)]
pub struct LockingAllocator<B, const N: usize>
where
    B: Allocator,
{
    scratch: SpinMutex<ScratchAllocator<InlineArena<N>>>,
    /// Payload addresses of the arena, as offsets from `self`.
    payload: Range<usize>,
    backing: B,
}

impl<B, const N: usize> Default for LockingAllocator<B, N>
where
    B: Allocator + Default,
{
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<B, const N: usize> LockingAllocator<B, N>
where
    B: Allocator,
{
    #[must_use]
    pub fn new(backing: B) -> Self {
        let mut this = Self {
            scratch: SpinMutex::new(ScratchAllocator::new(InlineArena::new())),
            payload: 0..0,
            backing,
        };
        // The arena is inline and 16-byte aligned, so these offsets survive
        // moves of the allocator.
        let base = ptr::from_ref(&this).addr();
        let range = this.scratch.get_mut().payload_range();
        this.payload = range.start - base..range.end - base;
        this
    }

    /// Locks the embedded scratch allocator.
    ///
    /// Every arena operation on `self` spins until the guard is dropped.
    pub fn lock_scratch(&self) -> SpinMutexGuard<'_, ScratchAllocator<InlineArena<N>>> {
        self.scratch.lock()
    }

    #[must_use]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Returns `true` if `ptr` points into the inline arena.
    ///
    /// This is an address comparison and never takes the lock.
    #[must_use]
    pub fn is_our_ptr(&self, ptr: *const u8) -> bool {
        let offset = ptr.addr().wrapping_sub(ptr::from_ref(self).addr());
        self.payload.contains(&offset)
    }
}

unsafe impl<B, const N: usize> Allocator for LockingAllocator<B, N>
where
    B: Allocator,
{
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        if let Some(ptr) = self.scratch.lock().allocate(bytes, align) {
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
        if !self.is_our_ptr(ptr) {
            return unsafe { self.backing.reallocate(ptr, bytes, align) };
        }
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        let checked = {
            let scratch = self.scratch.lock();
            match unsafe { scratch.try_reallocate(old_ptr, bytes, align) } {
                Ok(Some(new_ptr)) => return Some(new_ptr),
                Ok(None) => scratch.try_usable_size(old_ptr),
                Err(misuse) => Err(misuse),
            }
        };
        let old_size = match checked {
            Ok(size) => size,
            Err(misuse) => misuse.report(),
        };

        // The block stays reserved in the arena while the lock is released,
        // so nothing else can reuse it before the copy.
        let new_ptr = self.backing.allocate(bytes, align)?;
        unsafe { old_ptr.copy_to_nonoverlapping(new_ptr, old_size.min(bytes)) };
        let checked = unsafe { self.scratch.lock().try_free(old_ptr) };
        if let Err(misuse) = checked {
            misuse.report();
        }
        log::debug!(
            "moved {old_size} byte block from scratch arena to backing allocator ({bytes} bytes)"
        );
        Some(new_ptr)
    }

    #[track_caller]
    unsafe fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if !self.is_our_ptr(ptr.as_ptr()) {
            return unsafe { self.backing.free(ptr.as_ptr()) };
        }
        let checked = unsafe { self.scratch.lock().try_free(ptr) };
        if let Err(misuse) = checked {
            misuse.report();
        }
    }
}

unsafe impl<B, const N: usize> GlobalAlloc for LockingAllocator<B, N>
where
    B: Allocator,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Allocator::allocate(self, layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { Allocator::free(self, ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { Allocator::reallocate(self, ptr, new_size, layout.align()) }
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
