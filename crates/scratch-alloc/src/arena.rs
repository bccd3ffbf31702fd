//! Backing storage for scratch arenas.
//!
//! A [`ScratchAllocator`](crate::scratch::ScratchAllocator) never owns the
//! lifetime of the bytes it manages. It only needs a base address and a
//! length, which the [`Arena`] trait provides. Two kinds of storage exist:
//!
//! - [`RawArena`]: an externally owned byte range, typically a stack buffer
//!   or a thread-local array borrowed for the allocator's lifetime.
//! - [`InlineArena`]: a fixed-size buffer stored inline, used by the
//!   composite allocators.
//!
//! Block metadata is addressed by unit offsets from the base, never by
//! absolute pointers, so an arena whose base moves together with its
//! contents (an [`InlineArena`] moved while nothing is allocated) stays
//! consistent.

use core::{cell::UnsafeCell, fmt, marker::PhantomData, mem::MaybeUninit, ptr::NonNull};

/// Byte storage managed by a scratch allocator.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - `base()..base() + len()` is valid for reads and writes through the
///   returned pointer for as long as the implementor is alive and not moved
/// - the range is not accessed by anything other than the allocator and the
///   holders of pointers it hands out
/// - `base()` and `len()` return the same values on every call
pub unsafe trait Arena {
    /// Start of the byte range.
    fn base(&self) -> NonNull<u8>;

    /// Length of the byte range in bytes.
    fn len(&self) -> usize;

    /// Returns `true` if the byte range is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An externally owned byte range.
pub struct RawArena<'a> {
    base: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

unsafe impl Send for RawArena<'_> {}

impl<'a> RawArena<'a> {
    /// Borrows `bytes` as arena storage for `'a`.
    #[must_use]
    pub fn new(bytes: &'a mut [MaybeUninit<u8>]) -> Self {
        let len = bytes.len();
        // Derive the pointer from the whole slice so it covers every byte.
        let base = NonNull::from(bytes).cast::<u8>();
        Self {
            base,
            len,
            _marker: PhantomData,
        }
    }

    /// Borrows an initialized byte slice as arena storage for `'a`.
    #[must_use]
    pub fn from_bytes(bytes: &'a mut [u8]) -> Self {
        let len = bytes.len();
        let base = NonNull::from(bytes).cast::<u8>();
        Self {
            base,
            len,
            _marker: PhantomData,
        }
    }

    /// Uses `start..start + len` as arena storage.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the range `start..start + len` is valid for reads and writes
    /// - the range is not used by any other allocator or code for `'a`
    /// - the memory outlives every pointer allocated from the arena
    #[must_use]
    pub const unsafe fn from_raw_parts(start: NonNull<u8>, len: usize) -> Self {
        Self {
            base: start,
            len,
            _marker: PhantomData,
        }
    }
}

unsafe impl Arena for RawArena<'_> {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl fmt::Debug for RawArena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawArena")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

/// A fixed-size byte buffer stored inline.
///
/// The buffer is 16-byte aligned, so its offset to the first header unit is
/// the same wherever the value lives.
#[repr(C, align(16))]
pub struct InlineArena<const N: usize> {
    bytes: UnsafeCell<[MaybeUninit<u8>; N]>,
}

unsafe impl<const N: usize> Send for InlineArena<N> {}

impl<const N: usize> Default for InlineArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> InlineArena<N> {
    /// Creates an uninitialized inline buffer of `N` bytes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([MaybeUninit::uninit(); N]),
        }
    }
}

unsafe impl<const N: usize> Arena for InlineArena<N> {
    fn base(&self) -> NonNull<u8> {
        NonNull::new(self.bytes.get().cast::<u8>()).unwrap_or_else(NonNull::dangling)
    }

    fn len(&self) -> usize {
        N
    }
}

impl<const N: usize> fmt::Debug for InlineArena<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineArena").field("len", &N).finish()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_arena_covers_slice() {
        let mut bytes = [0_u8; 37];
        let start = bytes.as_mut_ptr();
        let arena = RawArena::from_bytes(&mut bytes);
        assert_eq!(arena.base().as_ptr(), start);
        assert_eq!(arena.len(), 37);
        assert!(!arena.is_empty());
    }

    #[test]
    fn test_raw_arena_uninit() {
        let mut bytes = [MaybeUninit::<u8>::uninit(); 8];
        let arena = RawArena::new(&mut bytes);
        assert_eq!(arena.len(), 8);
    }

    #[test]
    fn test_empty_raw_arena() {
        let arena = RawArena::from_bytes(&mut []);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_inline_arena_alignment() {
        let arena = InlineArena::<64>::new();
        assert_eq!(arena.len(), 64);
        assert_eq!(arena.base().as_ptr().addr() % 16, 0);
        assert_eq!(align_of::<InlineArena<3>>(), 16);
    }
}
