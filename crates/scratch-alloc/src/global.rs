//! Process-wide default allocator handle.
//!
//! Nothing here replaces Rust's `#[global_allocator]`. Code that wants "the
//! allocator the application configured" asks for [`current`] explicitly and
//! gets a reference-counted handle to it.
//!
//! # Lifecycle
//!
//! 1. Until [`install`] is called, [`current`] hands out a shared
//!    [`GlobalHeap`].
//! 2. [`install`] sets the default once. A second call fails until the first
//!    handle is removed with [`uninstall`].
//! 3. [`uninstall`] only detaches the handle. Clones returned by [`current`]
//!    keep the allocator alive until the last one is dropped, so memory they
//!    allocated can still be freed through them.

use alloc::sync::Arc;

use snafu::ensure;
use spin::{Once, RwLock};

use crate::{
    contract::Allocator,
    error::{AlreadyInstalledSnafu, InstallError},
    heap::GlobalHeap,
};

/// A thread-safe, reference-counted allocator handle.
pub type SharedAllocator = Arc<dyn Allocator + Send + Sync>;

static DEFAULT: RwLock<Option<SharedAllocator>> = RwLock::new(None);
static FALLBACK: Once<SharedAllocator> = Once::new();

/// Installs `allocator` as the process-wide default.
pub fn install(allocator: SharedAllocator) -> Result<(), InstallError> {
    let mut default = DEFAULT.write();
    ensure!(default.is_none(), AlreadyInstalledSnafu);
    *default = Some(allocator);
    log::debug!("default allocator installed");
    Ok(())
}

/// Returns the installed default allocator, or the process heap if none is
/// installed.
#[must_use]
pub fn current() -> SharedAllocator {
    if let Some(allocator) = &*DEFAULT.read() {
        return Arc::clone(allocator);
    }
    Arc::clone(FALLBACK.call_once(|| Arc::new(GlobalHeap)))
}

#[must_use]
pub fn is_installed() -> bool {
    DEFAULT.read().is_some()
}

/// Removes the installed default allocator and returns it.
pub fn uninstall() -> Option<SharedAllocator> {
    let allocator = DEFAULT.write().take();
    if allocator.is_some() {
        log::debug!("default allocator uninstalled");
    }
    allocator
}
