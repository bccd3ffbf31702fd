//! The process heap as an [`Allocator`].
//!
//! The global allocator API needs the original [`Layout`] on every resize
//! and free, but the [`Allocator`] contract only passes a pointer. Each block
//! therefore carries a small prefix right in front of the returned pointer
//! that records how it was allocated.
//!
//! ```text
//!  block start                 returned pointer
//!  ┌──────────────┬────────────┬──────────────────────┐
//!  │ (padding)    │ Prefix     │ payload              │
//!  └──────────────┴────────────┴──────────────────────┘
//!  ◄──────────── offset ──────►
//! ```

use alloc::alloc as heap;
use core::{alloc::Layout, ptr::NonNull};

use crate::contract::Allocator;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Prefix {
    /// Distance from the block start to the payload.
    offset: usize,
    /// Payload size requested by the caller.
    size: usize,
    /// Alignment of the whole block.
    align: usize,
}

impl Prefix {
    fn new(bytes: usize, align: usize) -> Option<Self> {
        let align = align.max(align_of::<Self>());
        let offset = size_of::<Self>().checked_next_multiple_of(align)?;
        Some(Self {
            offset,
            size: bytes,
            align,
        })
    }

    fn layout(&self) -> Option<Layout> {
        Layout::from_size_align(self.offset.checked_add(self.size)?, self.align).ok()
    }

    /// # Safety
    ///
    /// `ptr` must be a live payload pointer returned by [`GlobalHeap`].
    unsafe fn of(ptr: NonNull<u8>) -> (NonNull<u8>, Self) {
        unsafe {
            let prefix = ptr.cast::<Self>().sub(1).read();
            (ptr.sub(prefix.offset), prefix)
        }
    }

    /// # Safety
    ///
    /// `block` must be valid for `self.layout()`.
    unsafe fn install(self, block: NonNull<u8>) -> NonNull<u8> {
        unsafe {
            let payload = block.add(self.offset);
            payload.cast::<Self>().sub(1).write(self);
            payload
        }
    }
}

/// The process heap behind the [`Allocator`] contract.
///
/// This is the backing allocator used when nothing else is installed, see
/// [`global`](crate::global).
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalHeap;

unsafe impl Allocator for GlobalHeap {
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        if bytes == 0 {
            return None;
        }
        let prefix = Prefix::new(bytes, align)?;
        let layout = prefix.layout()?;
        let block = NonNull::new(unsafe { heap::alloc(layout) })?;
        Some(unsafe { prefix.install(block) })
    }

    unsafe fn reallocate(&self, ptr: *mut u8, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.allocate(bytes, align);
        };
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        if bytes == 0 {
            return Some(ptr);
        }
        let (block, old) = unsafe { Prefix::of(ptr) };

        if align <= old.align {
            let prefix = Prefix {
                size: bytes,
                ..old
            };
            let layout = prefix.layout()?;
            let old_layout = old.layout()?;
            let block =
                NonNull::new(unsafe { heap::realloc(block.as_ptr(), old_layout, layout.size()) })?;
            return Some(unsafe { prefix.install(block) });
        }

        let new_ptr = self.allocate(bytes, align)?;
        unsafe {
            ptr.copy_to_nonoverlapping(new_ptr, old.size.min(bytes));
            self.free(ptr.as_ptr());
        }
        Some(new_ptr)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let (block, prefix) = unsafe { Prefix::of(ptr) };
        if let Some(layout) = prefix.layout() {
            unsafe { heap::dealloc(block.as_ptr(), layout) };
        }
    }
}
