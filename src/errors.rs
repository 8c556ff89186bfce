//! Error kinds for every fallible scan-core operation.
//!
//! One enum covers the whole crate: rulesets are loaded, scanned, and saved
//! through a small number of entry points, and callers dispatch on the kind
//! rather than on per-stage types. The enum is `#[non_exhaustive]`; consumers
//! should include a fallback match arm.
//!
//! Policy:
//! - Faults while reading scan input (truncated maps, vanished process
//!   memory, corrupt condition code) surface as [`ScanError::CouldNotMapFile`]
//!   after teardown.
//! - A callback returning an error action surfaces as
//!   [`ScanError::CallbackError`]; a callback abort is not an error.
//! - Malformed serialized rulesets fail with [`ScanError::CorruptFile`] and
//!   no ruleset is created.

use std::fmt;
use std::io;

/// Errors returned by ruleset construction, serialization, and scanning.
#[derive(Debug)]
#[non_exhaustive]
pub enum ScanError {
    /// An allocation could not be satisfied.
    InsufficientMemory,
    /// A caller-supplied argument was rejected.
    InvalidArgument { detail: &'static str },
    /// A file could not be opened for reading or writing.
    CouldNotOpenFile(io::Error),
    /// Scan input could not be fetched (mapping failure, unreadable block,
    /// vanished process memory, or a contained evaluator fault).
    CouldNotMapFile,
    /// The scan exceeded its deadline.
    ScanTimeout,
    /// Every concurrent scan slot on the ruleset is in use.
    TooManyScanThreads,
    /// The callback requested termination with an error.
    CallbackError,
    /// A serialized ruleset stream is malformed or version-incompatible.
    CorruptFile { detail: &'static str },
    /// An I/O error while writing a serialized ruleset.
    Io(io::Error),
}

impl ScanError {
    /// Creates an invalid-argument error with a static description.
    #[inline]
    pub(crate) const fn invalid(detail: &'static str) -> Self {
        Self::InvalidArgument { detail }
    }

    /// Creates a corrupt-file error with a static description.
    #[inline]
    pub(crate) const fn corrupt(detail: &'static str) -> Self {
        Self::CorruptFile { detail }
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientMemory => write!(f, "insufficient memory"),
            Self::InvalidArgument { detail } => write!(f, "invalid argument: {detail}"),
            Self::CouldNotOpenFile(err) => write!(f, "could not open file: {err}"),
            Self::CouldNotMapFile => write!(f, "could not map scan input"),
            Self::ScanTimeout => write!(f, "scan timed out"),
            Self::TooManyScanThreads => write!(f, "too many concurrent scans on this ruleset"),
            Self::CallbackError => write!(f, "scan callback reported an error"),
            Self::CorruptFile { detail } => write!(f, "corrupt ruleset stream: {detail}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CouldNotOpenFile(err) | Self::Io(err) => Some(err),
            _ => None,
        }
    }
}
