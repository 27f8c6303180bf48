//! Error types for memory subsystem setup.
//!
//! Every variant is fatal for a runtime that depends on the arena: the
//! crate-level [`init`](crate::init) entry points report the error and exit
//! with [`EXIT_FATAL`]. [`MemoryManager::initialize`](crate::MemoryManager::initialize)
//! returns them so embedders and tests can inspect the failure instead.

use nix::errno::Errno;
use thiserror::Error;

use crate::region::RegionKind;

/// Process exit status for every fatal condition.
pub const EXIT_FATAL: i32 = 1;

/// Result alias for memory subsystem operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// A fatal setup or relaxation failure.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The backing reservation could not be obtained.
    #[error("cannot allocate arena: {step} failed: {source}")]
    Allocation {
        /// The step that failed (e.g. `mmap`).
        step: &'static str,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },

    /// Changing protection on a guard zone failed.
    #[error("cannot {action} {region} redzone: {source}")]
    Protection {
        /// Region whose zone was being changed.
        region: RegionKind,
        /// `protect` or `unprotect`.
        action: &'static str,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },

    /// Registering a fault signal handler failed.
    #[error("cannot set {signal} handler: {source}")]
    HandlerInstall {
        /// Signal name.
        signal: &'static str,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },

    /// Another manager already owns the process fault handlers.
    #[error("fault handlers are already installed by another memory manager")]
    HandlerAlreadyInstalled,

    /// Planner and allocator disagree about the arena extent.
    #[error("allocated too much memory: region end {end:#x} lies outside the arena ending at {arena_end:#x}")]
    LayoutInconsistency {
        /// End of the last region.
        end: usize,
        /// End of the reservation.
        arena_end: usize,
    },
}

impl MemoryError {
    /// Exit status the process should terminate with for this error.
    pub fn exit_code(&self) -> i32 {
        EXIT_FATAL
    }
}
