//! Arena reservation.
//!
//! One anonymous private mapping backs every region. The mapping is
//! page-aligned by the OS; the usable arena starts at the first `unit`
//! boundary inside it.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::{MemoryError, MemoryResult};
use crate::layout::round_up;

/// The backing reservation.
#[derive(Debug)]
pub struct Arena {
    mapping: NonNull<c_void>,
    reserved: usize,
    base: usize,
}

// The mapping is owned exclusively by the arena and only addressed by value.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserve `total_size` bytes and align the start to `unit`.
    pub fn reserve(total_size: usize, unit: usize) -> MemoryResult<Self> {
        let length = NonZeroUsize::new(total_size).ok_or(MemoryError::Allocation {
            step: "mmap",
            source: Errno::EINVAL,
        })?;

        let mapping = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|source| MemoryError::Allocation { step: "mmap", source })?;

        let base = round_up(mapping.as_ptr() as usize, unit);

        Ok(Self {
            mapping,
            reserved: total_size,
            base,
        })
    }

    /// First unit-aligned address in the reservation.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Start of the raw reservation.
    pub fn start(&self) -> usize {
        self.mapping.as_ptr() as usize
    }

    /// One past the end of the raw reservation.
    pub fn end(&self) -> usize {
        self.start() + self.reserved
    }

    /// Verify that a carved span ending at `end` stays inside the reservation.
    pub fn check_fits(&self, end: usize) -> MemoryResult<()> {
        if end > self.end() {
            return Err(MemoryError::LayoutInconsistency {
                end,
                arena_end: self.end(),
            });
        }
        Ok(())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.mapping, self.reserved) };
    }
}
