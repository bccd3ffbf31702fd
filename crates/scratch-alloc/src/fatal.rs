//! Unrecoverable allocator misuse.
//!
//! Running out of arena space is an ordinary `None`. Everything in this
//! module is the other kind of failure: the caller handed the allocator a
//! pointer it cannot have obtained legitimately, or the arena metadata no
//! longer satisfies its invariants. Execution never continues past these.
//!
//! [`critical`] logs the failure, gives the installed hook (if any) a chance
//! to record it, and then panics. Builds with `panic = "abort"` terminate the
//! process at that point.

use core::{fmt, panic::Location};

use derive_more::{Display, IsVariant};
use spin::RwLock;

/// The kind of invariant a caller or the arena itself violated.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum Violation {
    /// The block behind the pointer is already free.
    #[display("double free")]
    DoubleFree,
    /// The pointer is not aligned to a header unit.
    #[display("misaligned pointer")]
    Misaligned,
    /// The pointer does not lie inside the arena.
    #[display("pointer not owned by this arena")]
    ForeignPointer,
    /// The block headers or the free list are inconsistent.
    #[display("arena metadata corrupted")]
    Corrupted,
}

/// Context of a critical failure, passed to the critical hook.
#[derive(Debug, Clone, Copy)]
pub struct CriticalFailure {
    violation: Violation,
    addr: usize,
    location: &'static Location<'static>,
}

impl CriticalFailure {
    #[must_use]
    pub fn violation(&self) -> Violation {
        self.violation
    }

    /// Address of the offending pointer or block.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Source location of the allocator call that detected the failure.
    #[must_use]
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Display for CriticalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {:#x} (detected at {})",
            self.violation, self.addr, self.location
        )
    }
}

/// Callback run before the allocator panics on a critical failure.
pub type CriticalHook = fn(&CriticalFailure);

static CRITICAL_HOOK: RwLock<Option<CriticalHook>> = RwLock::new(None);

/// Installs `hook` to be run on every critical failure, returning the
/// previously installed hook.
///
/// Passing `None` removes the hook.
pub fn set_critical_hook(hook: Option<CriticalHook>) -> Option<CriticalHook> {
    core::mem::replace(&mut *CRITICAL_HOOK.write(), hook)
}

/// Reports an unrecoverable allocator failure and panics.
#[cold]
#[track_caller]
pub fn critical(violation: Violation, addr: usize) -> ! {
    let failure = CriticalFailure {
        violation,
        addr,
        location: Location::caller(),
    };
    log::error!("critical allocator failure: {failure}");
    // Copy the hook out so a hook that panics cannot leave the lock held.
    let hook = *CRITICAL_HOOK.read();
    if let Some(hook) = hook {
        hook(&failure);
    }
    panic!("critical allocator failure: {failure}");
}

/// A detected misuse that has not been reported yet.
///
/// Checked allocator operations return this instead of calling [`critical`]
/// directly, so a caller holding a lock can release it before reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Misuse {
    violation: Violation,
    addr: usize,
}

impl Misuse {
    pub(crate) fn new(violation: Violation, addr: usize) -> Self {
        Self { violation, addr }
    }

    #[cold]
    #[track_caller]
    pub(crate) fn report(self) -> ! {
        critical(self.violation, self.addr)
    }
}
