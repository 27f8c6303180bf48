//! Layout diagnostics.
//!
//! A [`LayoutReport`] is a read-only snapshot of the resolved layout; its
//! `Display` output is what the diagnostics flag prints after
//! initialization.

use std::fmt;
use std::io;

use crate::platform::FaultTier;
use crate::region::{Region, RegionKind};
use crate::zone::GuardZone;

/// One region in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionReport {
    /// Published boundaries.
    pub region: Region,
    /// Guard zone state, if the region has one.
    pub zone: Option<GuardZone>,
    /// Highest address the engine reported using.
    pub high_water: usize,
}

/// Snapshot of the resolved layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutReport {
    /// Primary cache size.
    pub cache_size: usize,
    /// OS page size.
    pub page_size: usize,
    /// Rounding granularity.
    pub unit: usize,
    /// Address of the register storage.
    pub registers: usize,
    /// Heap, det-stack, nondet-stack.
    pub regions: [RegionReport; 3],
    /// First aligned arena address.
    pub arena_start: usize,
    /// One past the reservation.
    pub arena_end: usize,
    /// Bytes reserved.
    pub total_size: usize,
    /// Whether guard pages are in use.
    pub protection: bool,
    /// Fault metadata tier, if handlers are installed.
    pub fault_tier: Option<FaultTier>,
}

impl LayoutReport {
    /// Region entry by kind.
    pub fn region(&self, kind: RegionKind) -> &RegionReport {
        &self.regions[kind.index()]
    }

    /// Write the report to `out`.
    pub fn print(&self, out: &mut impl io::Write) -> io::Result<()> {
        write!(out, "{}", self)
    }

    fn offset(&self, addr: usize) -> usize {
        addr % self.unit
    }

    fn line(&self, f: &mut fmt::Formatter<'_>, label: &str, addr: usize) -> fmt::Result {
        writeln!(f, "{:<20} = {:#014x} (offset {})", label, addr, self.offset(addr))
    }
}

impl fmt::Display for LayoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "pcache_size          = {} ({:#x})", self.cache_size, self.cache_size)?;
        writeln!(f, "page_size            = {} ({:#x})", self.page_size, self.page_size)?;
        writeln!(f, "unit                 = {} ({:#x})", self.unit, self.unit)?;
        writeln!(f, "protection           = {}", if self.protection { "enabled" } else { "unavailable" })?;
        match self.fault_tier {
            Some(tier) => writeln!(f, "fault handler        = {:?}", tier)?,
            None => writeln!(f, "fault handler        = not installed")?,
        }
        writeln!(f)?;
        self.line(f, "registers", self.registers)?;

        for entry in &self.regions {
            let name = entry.region.kind.as_str();
            writeln!(f)?;
            if entry.region.is_absent() {
                writeln!(f, "{:<20} = absent", name)?;
                continue;
            }
            self.line(f, name, entry.region.base)?;
            self.line(f, &format!("{} min", name), entry.region.min)?;
            self.line(f, &format!("{} end", name), entry.region.end)?;
            match entry.zone {
                Some(zone) => {
                    self.line(f, &format!("{} zone", name), zone.zone_start)?;
                    writeln!(
                        f,
                        "{:<20} = {} of {} bytes ({})",
                        format!("{} zone left", name),
                        zone.zone_left,
                        zone.zone_size,
                        zone.state(self.unit)
                    )?;
                }
                None => writeln!(f, "{:<20} = none", format!("{} zone", name))?,
            }
            if entry.high_water != 0 {
                self.line(f, &format!("{} high water", name), entry.high_water)?;
            }
        }

        writeln!(f)?;
        self.line(f, "arena start", self.arena_start)?;
        self.line(f, "arena end", self.arena_end)?;

        writeln!(f)?;
        for entry in &self.regions {
            let usable = if entry.region.is_absent() { 0 } else { entry.region.usable() };
            writeln!(f, "{:<20} = {} ({:#x})", format!("{} size", entry.region.kind), usable, usable)?;
        }
        writeln!(f, "{:<20} = {} ({:#x})", "arena size", self.total_size, self.total_size)
    }
}
