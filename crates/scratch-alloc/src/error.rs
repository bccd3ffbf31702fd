use core::{convert::Infallible, fmt};

use snafu::{GenerateImplicitData, Snafu};

/// Source location captured when an error value is created.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Failure to place a new value with
/// [`AllocatorExt`](crate::contract::AllocatorExt).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum NewError<E>
where
    E: core::error::Error + 'static,
{
    #[snafu(display("allocator exhausted: {size} bytes aligned to {align}"))]
    Exhausted {
        size: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to construct value: {source}"))]
    Construct {
        source: E,
        #[snafu(implicit)]
        location: Location,
    },
}

impl<E> NewError<E>
where
    E: core::error::Error + 'static,
{
    /// Location where the error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::Exhausted { location, .. } | Self::Construct { location, .. } => *location,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl NewError<Infallible> {
    /// Converts an error that cannot carry a construction failure into the
    /// failure of a fallible constructor.
    #[must_use]
    pub fn widen<E>(self) -> NewError<E>
    where
        E: core::error::Error + 'static,
    {
        match self {
            Self::Exhausted {
                size,
                align,
                location,
            } => NewError::Exhausted {
                size,
                align,
                location,
            },
            Self::Construct { source, .. } => match source {},
        }
    }
}

/// Failure to install the process-wide default allocator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InstallError {
    #[snafu(display("a default allocator is already installed"))]
    AlreadyInstalled {
        #[snafu(implicit)]
        location: Location,
    },
}
