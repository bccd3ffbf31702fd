//! Block header encoding.
//!
//! Every block in a scratch arena starts with a single [`Tag`]. The low 15
//! bits hold the block size measured in header units (header included), and
//! the top bit records whether the block is handed out.
//!
//! ```text
//!  15 14                                            0
//! ┌──┬──────────────────────────────────────────────┐
//! │U │ size in units (header + payload)             │
//! └──┴──────────────────────────────────────────────┘
//! ```
//!
//! Free blocks reuse their payload for the free-list node, so a block never
//! gets smaller than [`MIN_BLOCK_UNITS`]:
//!
//! ```text
//! Free Block Layout:
//! ┌──────────┬──────────┬──────────┬──────────────────┐
//! │ tag: u16 │ next: u16│ prev: u16│ unused ...       │
//! └──────────┴──────────┴──────────┴──────────────────┘
//! ```

use core::fmt;

/// Raw storage type of a block header and of free-list links.
pub(crate) type Word = u16;

/// Size of one header unit in bytes.
///
/// Block sizes, free-list links and arena offsets are all expressed in this
/// unit.
pub const UNIT: usize = size_of::<Word>();

/// Free-list link value meaning "no block".
pub(crate) const NIL: Word = Word::MAX;

/// Number of units needed to hold a free-list node (`tag`, `next`, `prev`).
pub const MIN_BLOCK_UNITS: usize = 3;

/// Largest arena (and block) size representable by a [`Tag`], in units.
pub const MAX_UNITS: usize = SIZE_MASK as usize;

const IN_USE: Word = 1 << (Word::BITS - 1);
const SIZE_MASK: Word = !IN_USE;

const _: () = assert!(UNIT == align_of::<Word>());
// `NIL` must never collide with a valid unit offset.
const _: () = assert!(MAX_UNITS < NIL as usize);

/// Header of a single block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(Word);

impl Tag {
    /// Header of a free block spanning `units` units.
    pub(crate) const fn free(units: usize) -> Self {
        assert!(units <= MAX_UNITS, "block size exceeds tag range");
        #[expect(clippy::cast_possible_truncation)]
        let raw = units as Word;
        Self(raw)
    }

    /// Header of an in-use block spanning `units` units.
    pub(crate) const fn used(units: usize) -> Self {
        Self(Self::free(units).0 | IN_USE)
    }

    pub(crate) const fn from_raw(raw: Word) -> Self {
        Self(raw)
    }

    pub(crate) const fn into_raw(self) -> Word {
        self.0
    }

    /// Block size in units, header included.
    pub(crate) const fn units(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    pub(crate) const fn is_in_use(self) -> bool {
        self.0 & IN_USE != 0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("units", &self.units())
            .field("in_use", &self.is_in_use())
            .finish()
    }
}

/// Converts a unit offset to a free-list link.
///
/// Offsets are bounded by [`MAX_UNITS`] when the arena is set up, so this
/// never truncates.
pub(crate) const fn link(index: usize) -> Word {
    assert!(index <= MAX_UNITS, "unit offset exceeds link range");
    #[expect(clippy::cast_possible_truncation)]
    let link = index as Word;
    link
}

/// Number of units needed to store `bytes` bytes.
pub(crate) const fn units_for(bytes: usize) -> usize {
    bytes.div_ceil(UNIT)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_tag() {
        let tag = Tag::free(42);
        assert_eq!(tag.units(), 42);
        assert!(!tag.is_in_use());
        assert_eq!(tag.into_raw(), 42);
    }

    #[test]
    fn test_used_tag() {
        let tag = Tag::used(42);
        assert_eq!(tag.units(), 42);
        assert!(tag.is_in_use());
        assert_eq!(tag.into_raw(), 0x8000 | 42);
        assert_eq!(Tag::from_raw(tag.into_raw()), tag);
    }

    #[test]
    fn test_max_units() {
        let tag = Tag::used(MAX_UNITS);
        assert_eq!(tag.units(), MAX_UNITS);
        assert!(tag.is_in_use());
        assert_eq!(Tag::free(MAX_UNITS).into_raw(), 0x7fff);
    }

    #[test]
    #[should_panic(expected = "block size exceeds tag range")]
    fn test_oversized_tag() {
        let _ = Tag::free(MAX_UNITS + 1);
    }

    #[test]
    fn test_units_for() {
        assert_eq!(units_for(0), 0);
        assert_eq!(units_for(1), 1);
        assert_eq!(units_for(2), 1);
        assert_eq!(units_for(3), 2);
        assert_eq!(units_for(64), 32);
    }

    #[test]
    fn test_min_block_holds_node() {
        // tag + next + prev
        assert_eq!(MIN_BLOCK_UNITS * UNIT, 3 * size_of::<Word>());
        assert_eq!(link(MAX_UNITS), 0x7fff);
        assert_ne!(link(MAX_UNITS), NIL);
    }
}
