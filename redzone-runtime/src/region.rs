//! Published region boundaries.
//!
//! A [`Region`] is the view the execution engine reads: `base`, `min` and
//! `end` for one of the three execution areas. The engine compares its own
//! stack or heap pointer against these to decide when to request growth.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The three execution areas carved out of the arena, in address order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegionKind {
    /// Heap (absent when heap management is delegated externally).
    Heap,
    /// Deterministic control stack.
    DetStack,
    /// Nondeterministic (choice-point) stack.
    NondetStack,
}

impl RegionKind {
    /// All regions in arena order.
    pub const ALL: [RegionKind; 3] = [RegionKind::Heap, RegionKind::DetStack, RegionKind::NondetStack];

    /// Position in arena order.
    pub fn index(self) -> usize {
        match self {
            RegionKind::Heap => 0,
            RegionKind::DetStack => 1,
            RegionKind::NondetStack => 2,
        }
    }

    /// Human-readable name used in diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            RegionKind::Heap => "heap",
            RegionKind::DetStack => "det-stack",
            RegionKind::NondetStack => "nondet-stack",
        }
    }
}

/// A region name that matches none of the known spellings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown region {0:?} (expected heap, det or nondet)")]
pub struct UnknownRegion(pub String);

impl FromStr for RegionKind {
    type Err = UnknownRegion;

    /// Accepts `heap`, `det`, `detstack`, `det-stack`, `nondet`,
    /// `nondstack` and `nondet-stack`, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heap" => Ok(RegionKind::Heap),
            "det" | "detstack" | "det-stack" => Ok(RegionKind::DetStack),
            "nondet" | "nondstack" | "nondet-stack" => Ok(RegionKind::NondetStack),
            _ => Err(UnknownRegion(s.to_string())),
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute boundaries of one region.
///
/// An absent region has all three fields zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Which area this is.
    pub kind: RegionKind,
    /// Start of the raw allocation.
    pub base: usize,
    /// First address usable by the consumer.
    pub min: usize,
    /// Hard upper limit (exclusive).
    pub end: usize,
}

/// A prospective push would run past the region end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionOverflow {
    /// Region that overflowed.
    pub kind: RegionKind,
    /// Address the push would have reached.
    pub requested: usize,
    /// Region end.
    pub end: usize,
}

impl fmt::Display for RegionOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} overflow: {:#x} is past the region end {:#x}",
            self.kind, self.requested, self.end
        )
    }
}

impl std::error::Error for RegionOverflow {}

impl Region {
    /// An absent region.
    pub const fn absent(kind: RegionKind) -> Self {
        Self {
            kind,
            base: 0,
            min: 0,
            end: 0,
        }
    }

    /// Whether the region occupies no arena space.
    pub fn is_absent(&self) -> bool {
        self.base == 0 && self.min == 0 && self.end == 0
    }

    /// Total span including the cache pad.
    pub fn size(&self) -> usize {
        self.end - self.base
    }

    /// Bytes available to the consumer (`end - min`).
    pub fn usable(&self) -> usize {
        self.end - self.min
    }

    /// Whether `addr` lies in `[base, end)`.
    pub fn contains(&self, addr: usize) -> bool {
        !self.is_absent() && addr >= self.base && addr < self.end
    }

    /// Bounds check for engines that cannot rely on guard pages.
    ///
    /// Succeeds when `top + bytes` still fits below `end`.
    pub fn check_bounds(&self, top: usize, bytes: usize) -> Result<(), RegionOverflow> {
        let requested = top.saturating_add(bytes);
        if self.is_absent() || requested > self.end {
            return Err(RegionOverflow {
                kind: self.kind,
                requested,
                end: self.end,
            });
        }
        Ok(())
    }
}
