//! Free-list allocator over a single fixed arena.
//!
//! [`ScratchAllocator`] carves allocations out of one contiguous byte range
//! and never grows it. It is meant for short-lived, bounded working memory
//! (a stack buffer, a thread-local array, the inline buffer of a composite
//! allocator) where going to the heap would be too expensive.
//!
//! # Algorithm
//!
//! - **Blocks**: the arena is split into blocks, each starting with a
//!   one-unit [`Tag`] holding the block size in units and an in-use bit.
//!   Walking the arena by block size visits every block exactly once.
//! - **Free List**: free blocks store `next`/`prev` links (unit offsets, not
//!   pointers) in their payload. The list is kept sorted by **descending**
//!   address, so the list neighbours of a position are also its nearest free
//!   physical neighbours.
//! - **Allocation**: first fit from the list head. Alignment padding in front
//!   of a block is split off as its own free block, and so is the unused
//!   tail, unless either would be smaller than a free-list node.
//! - **Deallocation**: the freed block is inserted at its sorted position and
//!   merged with a free block directly above and/or below it, so no two free
//!   blocks are ever adjacent.
//!
//! ```text
//!  start                                                            end
//!  ┌──────────┬───────────────┬──────────┬──────────────────────────┐
//!  │ free (A) │ in use        │ free (B) │ in use                   │
//!  └──────────┴───────────────┴──────────┴──────────────────────────┘
//!      ▲                          │ ▲
//!      └──────── next ────────────┘ │
//!                             head ─┘
//! ```
//!
//! # Thread Safety
//!
//! The allocator is `Send` but not `Sync`. Use
//! [`LockingAllocator`](crate::locking::LockingAllocator) to share an arena
//! between threads.

use core::{cell::Cell, fmt, iter::FusedIterator, ops::Range, ptr::NonNull};

use crate::{
    arena::Arena,
    contract::Allocator,
    fatal::{self, Misuse, Violation},
    tag::{self, MAX_UNITS, MIN_BLOCK_UNITS, NIL, Tag, UNIT, Word},
};

/// A coalescing first-fit allocator over a fixed arena.
///
/// Exhaustion is reported as `None`; the allocator never falls back to any
/// other memory. Misuse (freeing a pointer twice, freeing a pointer it did
/// not hand out) is fatal, see [`fatal`](crate::fatal).
pub struct ScratchAllocator<S>
where
    S: Arena,
{
    arena: S,
    /// Bytes skipped at the arena base to reach header alignment.
    pad: usize,
    /// Usable arena length in units.
    units: usize,
    head: Cell<Word>,
}

/// Location and state of one block, as reported by
/// [`ScratchAllocator::blocks`] and [`ScratchAllocator::free_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Byte offset of the block header from the start of the usable arena.
    pub offset: usize,
    /// Block size in bytes, header included.
    pub size: usize,
    pub in_use: bool,
}

/// Summary of the arena occupancy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub free_blocks: usize,
    /// Free bytes, headers included.
    pub free_bytes: usize,
    pub used_blocks: usize,
    /// Bytes held by in-use blocks, headers included.
    pub used_bytes: usize,
    /// Largest payload a single unaligned allocation could get.
    pub largest_free: usize,
}

impl<S> ScratchAllocator<S>
where
    S: Arena,
{
    /// Creates an allocator managing all of `arena`.
    ///
    /// The start of the arena is rounded up to the header alignment, and the
    /// usable length is clamped to what a block header can describe
    /// ([`MAX_UNITS`] units). The whole usable range becomes a single free
    /// block.
    #[must_use]
    pub fn new(arena: S) -> Self {
        let pad = arena.base().as_ptr().align_offset(UNIT).min(arena.len());
        let units = ((arena.len() - pad) / UNIT).min(MAX_UNITS);
        let this = Self {
            arena,
            pad,
            units,
            head: Cell::new(NIL),
        };
        if units >= MIN_BLOCK_UNITS {
            this.write_free(0, units, NIL, NIL);
            this.head.set(0);
        }
        log::trace!(
            "scratch arena at {:#x}: {} usable bytes",
            this.start_addr(),
            this.capacity()
        );
        this
    }

    /// Usable arena size in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.units * UNIT
    }

    /// Allocates `bytes` bytes aligned to `align`.
    ///
    /// Alignments below the header alignment are raised to it. Returns `None`
    /// if `bytes` is zero or no free block can hold the request.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        if bytes == 0 {
            return None;
        }
        let align = align.max(UNIT);
        let need = block_units(bytes)?;

        let mut current = self.head.get();
        while current != NIL {
            let block = usize::from(current);
            let units = self.tag(block).units();
            if let Some(gap) = self.fit(block, units, need, align) {
                return Some(self.carve(block, units, gap, need));
            }
            current = self.next(block);
        }
        None
    }

    /// Resizes the allocation at `ptr` to `bytes` bytes aligned to `align`.
    ///
    /// - A null `ptr` behaves like [`allocate`](Self::allocate).
    /// - If the block already holds `bytes` at a suitable alignment, `ptr` is
    ///   returned unchanged. Blocks never shrink.
    /// - Otherwise the block grows into a free successor if that is enough,
    ///   and is moved to a fresh block as a last resort.
    ///
    /// Returns `None` if the allocation cannot be satisfied; the original
    /// block is then left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this allocator, and no
    /// reference into it may be used after the call if the block moves.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two, or through
    /// [`fatal::critical`] if `ptr` is not a live allocation of this arena.
    #[track_caller]
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        bytes: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.allocate(bytes, align);
        };
        match unsafe { self.try_reallocate(ptr, bytes, align) } {
            Ok(new_ptr) => new_ptr,
            Err(misuse) => misuse.report(),
        }
    }

    /// Like [`reallocate`](Self::reallocate), but hands a detected misuse
    /// back to the caller instead of reporting it.
    ///
    /// # Safety
    ///
    /// Same as [`reallocate`](Self::reallocate).
    pub(crate) unsafe fn try_reallocate(
        &self,
        ptr: NonNull<u8>,
        bytes: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, Misuse> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let block = self.live_block(ptr)?;
        let units = self.tag(block).units();
        let capacity = (units - 1) * UNIT;
        let aligned = ptr.addr().get().is_multiple_of(align.max(UNIT));

        if aligned && (bytes <= capacity || self.grow_in_place(block, units, bytes)) {
            return Ok(Some(ptr));
        }

        let Some(new_ptr) = self.allocate(bytes, align) else {
            return Ok(None);
        };
        unsafe {
            ptr.copy_to_nonoverlapping(new_ptr, capacity.min(bytes));
        }
        self.release(block, units);
        Ok(Some(new_ptr))
    }

    /// Returns the allocation at `ptr` to the arena.
    ///
    /// Null pointers are ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this allocator, and must
    /// not be used after the call.
    ///
    /// # Panics
    ///
    /// Panics through [`fatal::critical`] if `ptr` is misaligned, outside the
    /// arena, or already free.
    #[track_caller]
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Err(misuse) = unsafe { self.try_free(ptr) } {
            misuse.report();
        }
    }

    /// Like [`free`](Self::free), but hands a detected misuse back to the
    /// caller instead of reporting it. The arena is left unchanged on error.
    ///
    /// # Safety
    ///
    /// Same as [`free`](Self::free).
    pub(crate) unsafe fn try_free(&self, ptr: NonNull<u8>) -> Result<(), Misuse> {
        let block = self.live_block(ptr)?;
        let units = self.tag(block).units();
        self.release(block, units);
        Ok(())
    }

    /// Returns `true` if `ptr` lies in the part of the arena that can hold
    /// payload.
    ///
    /// This is a pure address range check; it does not tell whether the block
    /// behind `ptr` is live.
    #[must_use]
    pub fn is_our_ptr(&self, ptr: *const u8) -> bool {
        self.payload_range().contains(&ptr.addr())
    }

    /// Addresses a payload pointer of this arena can take.
    pub(crate) fn payload_range(&self) -> Range<usize> {
        let start = self.start_addr();
        start + UNIT..start + self.capacity()
    }

    /// Number of payload bytes the live allocation at `ptr` can hold.
    ///
    /// # Panics
    ///
    /// Panics through [`fatal::critical`] if `ptr` is not a live allocation of
    /// this arena.
    #[track_caller]
    #[must_use]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        match self.try_usable_size(ptr) {
            Ok(size) => size,
            Err(misuse) => misuse.report(),
        }
    }

    pub(crate) fn try_usable_size(&self, ptr: NonNull<u8>) -> Result<usize, Misuse> {
        let block = self.live_block(ptr)?;
        Ok((self.tag(block).units() - 1) * UNIT)
    }

    /// Iterates over every block in address order.
    pub fn blocks(&self) -> Blocks<'_, S> {
        Blocks {
            allocator: self,
            index: 0,
        }
    }

    /// Iterates over the free list in list order (descending address).
    pub fn free_list(&self) -> FreeBlocks<'_, S> {
        FreeBlocks {
            allocator: self,
            current: self.head.get(),
            remaining: self.units / MIN_BLOCK_UNITS,
        }
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.blocks().fold(Stats::default(), |mut stats, block| {
            if block.in_use {
                stats.used_blocks += 1;
                stats.used_bytes += block.size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                stats.largest_free = stats.largest_free.max(block.size - UNIT);
            }
            stats
        })
    }

    /// Checks the block headers and the free list for consistency.
    ///
    /// # Panics
    ///
    /// Panics through [`fatal::critical`] with [`Violation::Corrupted`] if
    /// the walk over all blocks does not end exactly at the arena end, two
    /// free blocks are adjacent, or the free list is not a strictly
    /// descending, doubly linked list of exactly the free blocks.
    #[track_caller]
    pub fn validate(&self) {
        if self.units < MIN_BLOCK_UNITS {
            if self.head.get() != NIL {
                fatal::critical(Violation::Corrupted, self.start_addr());
            }
            return;
        }

        let mut index = 0;
        let mut free_blocks = 0;
        let mut last_free = false;
        while index < self.units {
            let tag = self.tag(index);
            let units = tag.units();
            if units < MIN_BLOCK_UNITS || index + units > self.units {
                fatal::critical(Violation::Corrupted, self.addr_of(index));
            }
            if !tag.is_in_use() {
                if last_free {
                    fatal::critical(Violation::Corrupted, self.addr_of(index));
                }
                free_blocks += 1;
            }
            last_free = !tag.is_in_use();
            index += units;
        }

        let mut listed = 0;
        let mut above = NIL;
        let mut current = self.head.get();
        while current != NIL {
            let block = usize::from(current);
            let out_of_order = above != NIL && current >= above;
            if block >= self.units
                || out_of_order
                || listed >= free_blocks
                || self.tag(block).is_in_use()
                || self.prev(block) != above
            {
                fatal::critical(Violation::Corrupted, self.addr_of(block.min(self.units)));
            }
            listed += 1;
            above = current;
            current = self.next(block);
        }
        if listed != free_blocks {
            fatal::critical(Violation::Corrupted, self.start_addr());
        }
    }

    /// Returns the arena storage, consuming the allocator.
    ///
    /// Outstanding allocations are not tracked; the caller must not use them
    /// afterwards.
    pub fn into_arena(self) -> S {
        self.arena
    }

    fn start_addr(&self) -> usize {
        self.arena.base().addr().get() + self.pad
    }

    fn addr_of(&self, index: usize) -> usize {
        self.start_addr() + index * UNIT
    }

    fn word_ptr(&self, index: usize) -> NonNull<Word> {
        debug_assert!(index < self.units);
        // `index` addresses a unit inside the usable range, which `Arena`
        // guarantees to be valid.
        unsafe { self.arena.base().add(self.pad).cast::<Word>().add(index) }
    }

    fn read(&self, index: usize) -> Word {
        unsafe { self.word_ptr(index).read() }
    }

    fn write(&self, index: usize, value: Word) {
        unsafe { self.word_ptr(index).write(value) }
    }

    fn tag(&self, block: usize) -> Tag {
        Tag::from_raw(self.read(block))
    }

    fn set_tag(&self, block: usize, tag: Tag) {
        self.write(block, tag.into_raw());
    }

    fn next(&self, block: usize) -> Word {
        self.read(block + 1)
    }

    fn prev(&self, block: usize) -> Word {
        self.read(block + 2)
    }

    fn set_next(&self, block: usize, next: Word) {
        self.write(block + 1, next);
    }

    fn set_prev(&self, block: usize, prev: Word) {
        self.write(block + 2, prev);
    }

    fn write_free(&self, block: usize, units: usize, next: Word, prev: Word) {
        self.set_tag(block, Tag::free(units));
        self.set_next(block, next);
        self.set_prev(block, prev);
    }

    /// Points the forward link of `prev` (or the list head) at `node`.
    fn link_forward(&self, prev: Word, node: Word) {
        if prev == NIL {
            self.head.set(node);
        } else {
            self.set_next(usize::from(prev), node);
        }
    }

    /// Points the back link of `next` at `node`.
    fn link_backward(&self, next: Word, node: Word) {
        if next != NIL {
            self.set_prev(usize::from(next), node);
        }
    }

    fn unlink(&self, block: usize) {
        let (next, prev) = (self.next(block), self.prev(block));
        self.link_forward(prev, next);
        self.link_backward(next, prev);
    }

    /// Writes a free block at `block` that takes over the list position of
    /// `old`.
    fn replace(&self, old: usize, block: usize, units: usize) {
        let (next, prev) = (self.next(old), self.prev(old));
        self.write_free(block, units, next, prev);
        self.link_forward(prev, tag::link(block));
        self.link_backward(next, tag::link(block));
    }

    /// Writes a free block at `block` directly in front of `successor` in
    /// list order.
    fn insert_before(&self, successor: usize, block: usize, units: usize) {
        let prev = self.prev(successor);
        self.write_free(block, units, tag::link(successor), prev);
        self.link_forward(prev, tag::link(block));
        self.set_prev(successor, tag::link(block));
    }

    /// Returns the number of units to split off in front of the allocation
    /// if a block of `need` units aligned to `align` fits into the free
    /// block.
    fn fit(&self, block: usize, units: usize, need: usize, align: usize) -> Option<usize> {
        let client = self.word_ptr(block + 1).cast::<u8>();
        let mut gap = client.as_ptr().align_offset(align) / UNIT;
        // A padding block must be able to hold a free-list node.
        while gap != 0 && gap < MIN_BLOCK_UNITS {
            gap += align / UNIT;
        }
        (gap + need <= units).then_some(gap)
    }

    fn carve(&self, block: usize, units: usize, gap: usize, need: usize) -> NonNull<u8> {
        let start = block + gap;
        let rest = units - gap - need;
        let mut size = need;

        if rest >= MIN_BLOCK_UNITS {
            if gap == 0 {
                self.replace(block, start + need, rest);
            } else {
                self.insert_before(block, start + need, rest);
            }
        } else {
            size += rest;
            if gap == 0 {
                self.unlink(block);
            }
        }
        if gap != 0 {
            // The padding keeps the list position of the original block.
            self.set_tag(block, Tag::free(gap));
        }

        self.set_tag(start, Tag::used(size));
        self.word_ptr(start + 1).cast()
    }

    fn grow_in_place(&self, block: usize, units: usize, bytes: usize) -> bool {
        let Some(need) = block_units(bytes) else {
            return false;
        };
        let successor = block + units;
        if successor >= self.units {
            return false;
        }
        let tag = self.tag(successor);
        let total = units + tag.units();
        if tag.is_in_use() || total < need {
            return false;
        }

        let rest = total - need;
        if rest >= MIN_BLOCK_UNITS {
            self.replace(successor, block + need, rest);
            self.set_tag(block, Tag::used(need));
        } else {
            self.unlink(successor);
            self.set_tag(block, Tag::used(total));
        }
        true
    }

    /// Marks `block` free, merges it with free physical neighbours and links
    /// it into the free list.
    fn release(&self, block: usize, units: usize) {
        // Clear the in-use bit first: if the block merges downwards its own
        // header stays behind and must read as free on a repeated free.
        self.set_tag(block, Tag::free(units));

        let mut above = NIL;
        let mut below = self.head.get();
        while below != NIL && usize::from(below) > block {
            above = below;
            below = self.next(usize::from(below));
        }

        let (mut start, mut size) = (block, units);
        let (mut prev, mut next) = (above, below);
        if above != NIL && block + units == usize::from(above) {
            let above = usize::from(above);
            size += self.tag(above).units();
            prev = self.prev(above);
        }
        if below != NIL {
            let below = usize::from(below);
            let below_units = self.tag(below).units();
            if below + below_units == block {
                start = below;
                size += below_units;
                next = self.next(below);
            }
        }

        self.write_free(start, size, next, prev);
        self.link_forward(prev, tag::link(start));
        self.link_backward(next, tag::link(start));
    }

    /// Maps a client pointer to the index of its in-use block.
    fn live_block(&self, ptr: NonNull<u8>) -> Result<usize, Misuse> {
        let addr = ptr.addr().get();
        if !self.is_our_ptr(ptr.as_ptr()) {
            return Err(Misuse::new(Violation::ForeignPointer, addr));
        }
        let offset = addr - self.start_addr();
        if !offset.is_multiple_of(UNIT) {
            return Err(Misuse::new(Violation::Misaligned, addr));
        }
        let block = offset / UNIT - 1;
        let tag = self.tag(block);
        if !tag.is_in_use() {
            return Err(Misuse::new(Violation::DoubleFree, addr));
        }
        if tag.units() < MIN_BLOCK_UNITS || block + tag.units() > self.units {
            return Err(Misuse::new(Violation::Corrupted, addr));
        }
        Ok(block)
    }
}

/// Number of units a block holding `bytes` payload bytes occupies.
fn block_units(bytes: usize) -> Option<usize> {
    let units = tag::units_for(bytes).checked_add(1)?;
    (units <= MAX_UNITS).then_some(units.max(MIN_BLOCK_UNITS))
}

unsafe impl<S> Allocator for ScratchAllocator<S>
where
    S: Arena,
{
    fn allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        Self::allocate(self, bytes, align)
    }

    #[track_caller]
    unsafe fn reallocate(&self, ptr: *mut u8, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        unsafe { Self::reallocate(self, ptr, bytes, align) }
    }

    #[track_caller]
    unsafe fn free(&self, ptr: *mut u8) {
        unsafe { Self::free(self, ptr) }
    }
}

impl<S> fmt::Debug for ScratchAllocator<S>
where
    S: Arena,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchAllocator")
            .field("start", &format_args!("{:#x}", self.start_addr()))
            .field("capacity", &self.capacity())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Iterator over all blocks of an arena, see [`ScratchAllocator::blocks`].
pub struct Blocks<'a, S>
where
    S: Arena,
{
    allocator: &'a ScratchAllocator<S>,
    index: usize,
}

impl<S> Iterator for Blocks<'_, S>
where
    S: Arena,
{
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index + MIN_BLOCK_UNITS > self.allocator.units {
            return None;
        }
        let tag = self.allocator.tag(self.index);
        // A zero-sized header would never advance; stop instead of spinning.
        if tag.units() == 0 {
            self.index = self.allocator.units;
            return None;
        }
        let info = BlockInfo {
            offset: self.index * UNIT,
            size: tag.units() * UNIT,
            in_use: tag.is_in_use(),
        };
        self.index += tag.units();
        Some(info)
    }
}

impl<S> FusedIterator for Blocks<'_, S> where S: Arena {}

/// Iterator over the free list, see [`ScratchAllocator::free_list`].
pub struct FreeBlocks<'a, S>
where
    S: Arena,
{
    allocator: &'a ScratchAllocator<S>,
    current: Word,
    remaining: usize,
}

impl<S> Iterator for FreeBlocks<'_, S>
where
    S: Arena,
{
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == NIL || self.remaining == 0 {
            return None;
        }
        let block = usize::from(self.current);
        let tag = self.allocator.tag(block);
        self.current = self.allocator.next(block);
        self.remaining -= 1;
        Some(BlockInfo {
            offset: block * UNIT,
            size: tag.units() * UNIT,
            in_use: tag.is_in_use(),
        })
    }
}

impl<S> FusedIterator for FreeBlocks<'_, S> where S: Arena {}
