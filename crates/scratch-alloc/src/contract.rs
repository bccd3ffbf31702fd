//! The allocator capability every consumer is written against.
//!
//! Containers and other subsystems take either a generic `A: Allocator`
//! (static dispatch, allocator chosen at compile time) or a
//! `&dyn Allocator` (allocator chosen at run time). Both forms use the same
//! trait; it is dyn-compatible on purpose, and the typed helpers live in the
//! blanket-implemented [`AllocatorExt`] so they stay available on trait
//! objects.
//!
//! ```rust
//! use scratch_alloc::{
//!     arena::RawArena,
//!     contract::{Allocator, AllocatorExt as _},
//!     scratch::ScratchAllocator,
//! };
//!
//! fn sum_squares(allocator: &dyn Allocator, n: u64) -> u64 {
//!     let total = allocator.allocate_new(0_u64).unwrap();
//!     unsafe {
//!         for i in 0..n {
//!             *total.as_ptr() += i * i;
//!         }
//!         let result = total.read();
//!         allocator.delete_free(total);
//!         result
//!     }
//! }
//!
//! let mut buffer = [0_u8; 256];
//! let scratch = ScratchAllocator::new(RawArena::from_bytes(&mut buffer));
//! assert_eq!(sum_squares(&scratch, 4), 14);
//! ```

use alloc::{boxed::Box, sync::Arc};
use core::{alloc::Layout, convert::Infallible, mem, ptr::NonNull};

use snafu::ResultExt as _;

use crate::error::{ConstructSnafu, ExhaustedSnafu, NewError};

/// Raw allocation interface shared by scratch arenas, composite allocators
/// and backing heaps.
///
/// `allocate` never fails loudly: exhaustion is `None`, and the caller
/// decides whether to try elsewhere.
///
/// # Safety
///
/// Implementors must return memory that is valid for `bytes` bytes, aligned
/// to `align`, and not handed out again until it is freed.
///
/// The memory may live inside the allocator value itself, as it does for the
/// inline arenas of the composite allocators. It then stays valid only while
/// the allocator stays where it was when the memory was allocated.
pub unsafe trait Allocator {
    /// Allocates `bytes` bytes aligned to `align` (a power of two).
    ///
    /// Returns `None` if `bytes` is zero or the memory is exhausted.
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>>;

    /// Resizes an allocation, moving it if needed.
    ///
    /// A null `ptr` behaves like [`allocate`](Self::allocate). On `None` the
    /// original allocation is left intact.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this allocator, and the
    /// allocator must not have moved since `ptr` was allocated.
    unsafe fn reallocate(&self, ptr: *mut u8, bytes: usize, align: usize) -> Option<NonNull<u8>>;

    /// Releases an allocation. Null pointers are ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this allocator, and must
    /// not be used afterwards. The allocator must not have moved since `ptr`
    /// was allocated.
    unsafe fn free(&self, ptr: *mut u8);
}

unsafe impl<A> Allocator for &A
where
    A: Allocator + ?Sized,
{
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        (**self).allocate(bytes, align)
    }

    #[track_caller]
    unsafe fn reallocate(&self, ptr: *mut u8, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        unsafe { (**self).reallocate(ptr, bytes, align) }
    }

    #[track_caller]
    unsafe fn free(&self, ptr: *mut u8) {
        unsafe { (**self).free(ptr) }
    }
}

unsafe impl<A> Allocator for Box<A>
where
    A: Allocator + ?Sized,
{
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        (**self).allocate(bytes, align)
    }

    #[track_caller]
    unsafe fn reallocate(&self, ptr: *mut u8, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        unsafe { (**self).reallocate(ptr, bytes, align) }
    }

    #[track_caller]
    unsafe fn free(&self, ptr: *mut u8) {
        unsafe { (**self).free(ptr) }
    }
}

unsafe impl<A> Allocator for Arc<A>
where
    A: Allocator + ?Sized,
{
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        (**self).allocate(bytes, align)
    }

    #[track_caller]
    unsafe fn reallocate(&self, ptr: *mut u8, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        unsafe { (**self).reallocate(ptr, bytes, align) }
    }

    #[track_caller]
    unsafe fn free(&self, ptr: *mut u8) {
        unsafe { (**self).free(ptr) }
    }
}

/// Frees the wrapped allocation when dropped.
///
/// Covers the window between reserving memory and finishing construction of
/// the value that goes into it, including unwinding out of the constructor.
struct ReleaseGuard<'a, A>
where
    A: Allocator + ?Sized,
{
    allocator: &'a A,
    ptr: NonNull<u8>,
}

impl<A> Drop for ReleaseGuard<'_, A>
where
    A: Allocator + ?Sized,
{
    fn drop(&mut self) {
        unsafe { self.allocator.free(self.ptr.as_ptr()) }
    }
}

/// Typed helpers that combine allocation with construction and destruction.
pub trait AllocatorExt: Allocator {
    /// Moves `value` into freshly allocated memory.
    fn allocate_new<T>(&self, value: T) -> Result<NonNull<T>, NewError<Infallible>> {
        self.try_allocate_with(|| Ok(value))
    }

    /// Allocates memory for a `T` and constructs it in place with `f`.
    ///
    /// If `f` panics, the memory is released before the panic propagates.
    fn allocate_with<T, F>(&self, f: F) -> Result<NonNull<T>, NewError<Infallible>>
    where
        F: FnOnce() -> T,
    {
        self.try_allocate_with(|| Ok(f()))
    }

    /// Allocates memory for a `T` and constructs it in place with a fallible
    /// `f`.
    ///
    /// The memory is reserved before `f` runs. If `f` fails or panics, the
    /// memory is released and the failure propagates. Zero-sized values get
    /// a dangling, well-aligned pointer without touching the allocator.
    fn try_allocate_with<T, E, F>(&self, f: F) -> Result<NonNull<T>, NewError<E>>
    where
        E: core::error::Error + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            let value = f().context(ConstructSnafu)?;
            let ptr = NonNull::dangling();
            unsafe { ptr.write(value) };
            return Ok(ptr);
        }

        let Some(raw) = self.allocate(layout.size(), layout.align()) else {
            return ExhaustedSnafu {
                size: layout.size(),
                align: layout.align(),
            }
            .fail();
        };
        let guard = ReleaseGuard {
            allocator: self,
            ptr: raw,
        };
        let value = f().context(ConstructSnafu)?;
        mem::forget(guard);

        let ptr = raw.cast::<T>();
        unsafe { ptr.write(value) };
        Ok(ptr)
    }

    /// Drops the value at `ptr` in place and frees its memory.
    ///
    /// # Safety
    ///
    /// `ptr` must come from one of the `allocate_*` helpers of this same
    /// allocator, and must not be used afterwards.
    unsafe fn delete_free<T>(&self, ptr: NonNull<T>)
    where
        T: ?Sized,
    {
        unsafe {
            let size = mem::size_of_val(ptr.as_ref());
            ptr.drop_in_place();
            if size != 0 {
                self.free(ptr.cast::<u8>().as_ptr());
            }
        }
    }
}

impl<A> AllocatorExt for A where A: Allocator + ?Sized {}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate std;

    use core::{
        cell::Cell,
        fmt,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use std::{panic, vec::Vec};

    use super::*;
    use crate::{arena::InlineArena, scratch::ScratchAllocator};

    fn scratch() -> ScratchAllocator<InlineArena<256>> {
        ScratchAllocator::new(InlineArena::new())
    }

    #[derive(Debug)]
    struct ConstructFailed;

    impl fmt::Display for ConstructFailed {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("construction failed")
        }
    }

    impl core::error::Error for ConstructFailed {}

    struct DropCounter<'a>(&'a Cell<usize>);

    impl Drop for DropCounter<'_> {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn fill<A>(allocator: &A, count: usize) -> Vec<NonNull<u8>>
    where
        A: Allocator + ?Sized,
    {
        (0..count)
            .map_while(|_| allocator.allocate(16, 8))
            .collect()
    }

    #[test]
    fn test_static_and_dynamic_dispatch() {
        let allocator = scratch();
        let by_generic = fill(&allocator, 2);
        let dynamic: &dyn Allocator = &allocator;
        let by_dyn = fill(dynamic, 2);
        assert_eq!(by_generic.len(), 2);
        assert_eq!(by_dyn.len(), 2);

        for ptr in by_generic.into_iter().chain(by_dyn) {
            unsafe { dynamic.free(ptr.as_ptr()) };
        }
        allocator.validate();
        assert_eq!(allocator.stats().free_blocks, 1);
    }

    #[test]
    fn test_forwarding_impls() {
        let boxed: Box<dyn Allocator> = Box::new(scratch());
        let ptr = boxed.allocate(8, 8).unwrap();
        unsafe { boxed.free(ptr.as_ptr()) };

        let shared = Arc::new(scratch());
        let ptr = (&shared).allocate(8, 8).unwrap();
        let ptr = unsafe { shared.reallocate(ptr.as_ptr(), 64, 8) }.unwrap();
        unsafe { shared.free(ptr.as_ptr()) };
        shared.validate();
    }

    #[test]
    fn test_allocate_new_and_delete_free() {
        let allocator = scratch();
        let drops = Cell::new(0);
        let ptr = allocator
            .allocate_new((DropCounter(&drops), [7_u32; 4]))
            .unwrap();
        assert_eq!(ptr.addr().get() % align_of::<u32>(), 0);
        unsafe {
            assert_eq!(ptr.as_ref().1, [7; 4]);
            allocator.delete_free(ptr);
        }
        assert_eq!(drops.get(), 1);
        assert_eq!(allocator.stats().used_blocks, 0);
    }

    #[test]
    fn test_allocate_new_exhausted() {
        let allocator = ScratchAllocator::new(InlineArena::<16>::new());
        let err = allocator.allocate_new([0_u8; 64]).unwrap_err();
        assert!(err.is_exhausted());
        assert!(err.location().file().ends_with("contract.rs"));
        let err = err.widen::<ConstructFailed>();
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_try_allocate_with_releases_on_error() {
        let allocator = scratch();
        let err = allocator
            .try_allocate_with::<u64, _, _>(|| Err(ConstructFailed))
            .unwrap_err();
        assert!(!err.is_exhausted());
        assert!(matches!(err, NewError::Construct { .. }));
        allocator.validate();
        assert_eq!(allocator.stats().used_blocks, 0);
    }

    #[test]
    fn test_allocate_with_releases_on_panic() {
        let allocator = scratch();
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let _ = allocator.allocate_with::<[u64; 4], _>(|| panic!("constructor panicked"));
        }));
        assert!(result.is_err());
        allocator.validate();
        assert_eq!(allocator.stats().used_blocks, 0);
    }

    #[test]
    fn test_zero_sized_values() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Unit;
        impl Drop for Unit {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let allocator = scratch();
        let ptr = allocator.allocate_new(Unit).unwrap();
        assert_eq!(allocator.stats().used_blocks, 0);
        unsafe { allocator.delete_free(ptr) };
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
    }
}
