//! Guard Zones
//!
//! Each region's tail is protected so that running off the end of a stack or
//! the heap traps instead of corrupting the next region. The fault handler
//! can then cede the protected tail one unit at a time:
//!
//! ```text
//!   base          min                      zone_start          end
//!   |-------------|------------------------|///////////////////|
//!                  usable                     protected tail
//!
//!   after a fault at `a`:
//!   |-------------|--------------------------------|///////////|
//!                                                  ^ round_up(a + margin, unit)
//! ```
//!
//! Relaxation is monotonic: `zone_start` only moves toward `end`, the last
//! unit before `end` is never ceded, and once no further unit can be ceded
//! every fault in the zone is fatal. A fault in an already ceded span is
//! retried once; the same address faulting again is fatal too.
//!
//! The arithmetic lives on [`GuardZone`], a plain value with no OS
//! dependency. [`GuardZones`] adds locking and the [`PageProtector`] that
//! actually changes page permissions, which tests replace with a recorder.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::errno::Errno;
use nix::sys::mman::{mprotect, ProtFlags};
use parking_lot::{Mutex, MutexGuard};

use crate::error::{MemoryError, MemoryResult};
use crate::layout::round_up;
use crate::log::{LogBuilder, LogLevel};
use crate::region::RegionKind;

/// Slack added to a faulting address before rounding, so the word being
/// touched is fully inside the ceded span.
pub const RELAX_MARGIN: usize = std::mem::size_of::<usize>();

/// Attempts at taking a zone lock from the fault handler before giving up.
const LOCK_SPINS: usize = 1 << 12;

/// Page access applied to a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// No access at all.
    None,
    /// Reads allowed (zones scanned by an external collector).
    ReadOnly,
    /// Fully usable.
    ReadWrite,
}

impl Access {
    fn prot_flags(self) -> ProtFlags {
        match self {
            Access::None => ProtFlags::PROT_NONE,
            Access::ReadOnly => ProtFlags::PROT_READ,
            Access::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }
}

/// Changes page permissions.
pub trait PageProtector: Send + Sync + fmt::Debug {
    /// Apply `access` to `[start, start + len)`.
    fn protect(&self, start: usize, len: usize, access: Access) -> Result<(), Errno>;
}

/// [`PageProtector`] backed by `mprotect(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MprotectProtector;

impl PageProtector for MprotectProtector {
    fn protect(&self, start: usize, len: usize, access: Access) -> Result<(), Errno> {
        let addr = NonNull::new(start as *mut c_void).ok_or(Errno::EINVAL)?;
        unsafe { mprotect(addr, len, access.prot_flags()) }
    }
}

/// Where a zone is in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    /// Nothing ceded yet.
    Protected,
    /// Some units ceded, more can follow.
    PartiallyRelaxed,
    /// No further unit can be ceded.
    Exhausted,
}

impl ZoneState {
    /// Human-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            ZoneState::Protected => "protected",
            ZoneState::PartiallyRelaxed => "partially relaxed",
            ZoneState::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Bookkeeping for one guard zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardZone {
    /// Region the zone belongs to.
    pub kind: RegionKind,
    /// Current lower boundary of the protected tail.
    pub zone_start: usize,
    /// Originally configured size.
    pub zone_size: usize,
    /// Bytes still protected.
    pub zone_left: usize,
    /// Region end.
    pub end: usize,
}

/// Why a relaxation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The new boundary would reach the region end.
    LastUnit,
    /// The new boundary would cede more than `zone_left`.
    BudgetSpent,
}

impl GuardZone {
    /// A fully protected zone covering the last `zone_size` bytes before `end`.
    pub fn new(kind: RegionKind, end: usize, zone_size: usize) -> Self {
        Self {
            kind,
            zone_start: end - zone_size,
            zone_size,
            zone_left: zone_size,
            end,
        }
    }

    /// Lower boundary before any relaxation.
    pub fn initial_start(&self) -> usize {
        self.end - self.zone_size
    }

    /// Whether `addr` lies in the protected tail, both boundaries inclusive.
    pub fn contains(&self, addr: usize) -> bool {
        self.zone_start <= addr && addr <= self.end
    }

    /// Whether `addr` lies anywhere in the original zone extent.
    pub fn within_extent(&self, addr: usize) -> bool {
        self.initial_start() <= addr && addr <= self.end
    }

    /// Bytes ceded so far.
    pub fn ceded(&self) -> usize {
        self.zone_size - self.zone_left
    }

    /// Lifecycle state for a given unit.
    pub fn state(&self, unit: usize) -> ZoneState {
        if self.zone_left == 0 || self.zone_start + unit >= self.end {
            ZoneState::Exhausted
        } else if self.zone_left == self.zone_size {
            ZoneState::Protected
        } else {
            ZoneState::PartiallyRelaxed
        }
    }

    /// Compute the new lower boundary for a fault at `addr`.
    pub fn plan_relax(&self, addr: usize, unit: usize) -> Result<usize, Refusal> {
        let new_start = round_up(addr.saturating_add(RELAX_MARGIN), unit);
        if new_start >= self.end {
            return Err(Refusal::LastUnit);
        }
        if new_start - self.zone_start > self.zone_left {
            return Err(Refusal::BudgetSpent);
        }
        Ok(new_start)
    }

    /// Record that `[zone_start, new_start)` has been ceded.
    fn commit(&mut self, new_start: usize) {
        self.zone_left -= new_start - self.zone_start;
        self.zone_start = new_start;
    }
}

/// Result of a relaxation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaxOutcome {
    /// `[from, to)` is now writable; the faulting access can be retried.
    Relaxed {
        /// Region whose zone shrank.
        kind: RegionKind,
        /// Old boundary.
        from: usize,
        /// New boundary.
        to: usize,
    },
    /// Another thread ceded the span while this fault was in flight.
    AlreadyRelaxed {
        /// Region whose zone shrank.
        kind: RegionKind,
    },
    /// The same ceded address faulted twice in a row, so retrying will
    /// not help.
    Persistent {
        /// Region the address belongs to.
        kind: RegionKind,
        /// The faulting address.
        addr: usize,
    },
    /// The zone cannot give up any more memory.
    Exhausted {
        /// Region that overflowed.
        kind: RegionKind,
        /// Which limit was hit.
        refusal: Refusal,
    },
    /// The zone lock could not be taken from the fault context.
    Busy {
        /// Region whose lock was held.
        kind: RegionKind,
    },
    /// The address is not in any guard zone.
    NotOurs,
}

impl RelaxOutcome {
    /// Whether the faulting access can be retried.
    pub fn resumes(&self) -> bool {
        matches!(self, RelaxOutcome::Relaxed { .. } | RelaxOutcome::AlreadyRelaxed { .. })
    }
}

/// Placement of one zone to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneSpec {
    /// Region the zone belongs to.
    pub kind: RegionKind,
    /// Region end.
    pub end: usize,
    /// Zone size; zero means no zone.
    pub zone_size: usize,
}

#[derive(Debug)]
struct ZoneCell {
    kind: RegionKind,
    extent: GuardZone,
    state: Mutex<GuardZone>,
    /// Ceded address last resumed without a relaxation; 0 when none.
    retried: AtomicUsize,
}

/// The guard zones of all regions.
#[derive(Debug)]
pub struct GuardZones {
    unit: usize,
    cells: [Option<ZoneCell>; 3],
    protector: Box<dyn PageProtector>,
}

impl GuardZones {
    /// No zones at all, for platforms without page protection.
    pub fn disabled(unit: usize) -> Self {
        Self {
            unit,
            cells: [None, None, None],
            protector: Box::new(MprotectProtector),
        }
    }

    /// Protect every zone in `specs` with `access` and start tracking it.
    pub fn install(
        specs: &[ZoneSpec],
        unit: usize,
        access: Access,
        protector: Box<dyn PageProtector>,
    ) -> MemoryResult<Self> {
        let mut cells: [Option<ZoneCell>; 3] = [None, None, None];

        for spec in specs.iter().filter(|s| s.zone_size > 0) {
            let zone = GuardZone::new(spec.kind, spec.end, spec.zone_size);
            protector
                .protect(zone.zone_start, zone.zone_size, access)
                .map_err(|source| MemoryError::Protection {
                    region: spec.kind,
                    action: "protect",
                    source,
                })?;

            LogBuilder::new(LogLevel::Debug)
                .message("guard zone installed")
                .field_str("region", spec.kind.as_str())
                .field_addr("zone_start", zone.zone_start)
                .field_int("zone_size", zone.zone_size as i64)
                .emit();

            cells[spec.kind.index()] = Some(ZoneCell {
                kind: spec.kind,
                extent: zone,
                state: Mutex::new(zone),
                retried: AtomicUsize::new(0),
            });
        }

        Ok(Self {
            unit,
            cells,
            protector,
        })
    }

    /// Rounding granularity.
    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Whether no zone is tracked.
    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }

    /// Current state of a region's zone.
    pub fn zone(&self, kind: RegionKind) -> Option<GuardZone> {
        self.cells[kind.index()].as_ref().map(|cell| *cell.state.lock())
    }

    /// Try to cede the part of a zone up to the unit boundary above `addr`.
    ///
    /// Safe to call from the fault handler: it never blocks, allocates or
    /// logs. Errors only when the OS refuses to change protection.
    pub fn try_relax(&self, addr: usize) -> MemoryResult<RelaxOutcome> {
        let Some(cell) = self
            .cells
            .iter()
            .flatten()
            .find(|cell| cell.extent.within_extent(addr))
        else {
            return Ok(RelaxOutcome::NotOurs);
        };

        let Some(mut zone) = lock_bounded(&cell.state) else {
            return Ok(RelaxOutcome::Busy { kind: cell.kind });
        };

        // The lock is held, so relaxed ordering is enough for `retried`.
        if !zone.contains(addr) {
            if cell.retried.swap(addr, Ordering::Relaxed) == addr {
                return Ok(RelaxOutcome::Persistent { kind: cell.kind, addr });
            }
            return Ok(RelaxOutcome::AlreadyRelaxed { kind: cell.kind });
        }

        let new_start = match zone.plan_relax(addr, self.unit) {
            Ok(new_start) => new_start,
            Err(refusal) => {
                return Ok(RelaxOutcome::Exhausted {
                    kind: cell.kind,
                    refusal,
                })
            }
        };

        let from = zone.zone_start;
        self.protector
            .protect(from, new_start - from, Access::ReadWrite)
            .map_err(|source| MemoryError::Protection {
                region: cell.kind,
                action: "unprotect",
                source,
            })?;
        zone.commit(new_start);
        cell.retried.store(0, Ordering::Relaxed);

        Ok(RelaxOutcome::Relaxed {
            kind: cell.kind,
            from,
            to: new_start,
        })
    }
}

fn lock_bounded(mutex: &Mutex<GuardZone>) -> Option<MutexGuard<'_, GuardZone>> {
    for _ in 0..LOCK_SPINS {
        if let Some(guard) = mutex.try_lock() {
            return Some(guard);
        }
        std::hint::spin_loop();
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    const UNIT: usize = 4096;

    /// Records protection calls instead of touching real pages.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingProtector {
        pub(crate) calls: Arc<Mutex<Vec<(usize, usize, Access)>>>,
        pub(crate) fail: bool,
    }

    impl PageProtector for RecordingProtector {
        fn protect(&self, start: usize, len: usize, access: Access) -> Result<(), Errno> {
            if self.fail {
                return Err(Errno::ENOMEM);
            }
            self.calls.lock().push((start, len, access));
            Ok(())
        }
    }

    fn det_spec() -> ZoneSpec {
        // 64 KiB det-stack plus its pad unit, 8 KiB zone.
        ZoneSpec {
            kind: RegionKind::DetStack,
            end: 0x10_0000 + 64 * 1024 + UNIT,
            zone_size: 8 * 1024,
        }
    }

    fn zones(protector: RecordingProtector) -> GuardZones {
        GuardZones::install(&[det_spec()], UNIT, Access::None, Box::new(protector)).unwrap()
    }

    #[test]
    fn test_install_protects_tail() {
        let protector = RecordingProtector::default();
        let zones = zones(protector.clone());
        let spec = det_spec();

        assert_eq!(
            protector.calls.lock().as_slice(),
            &[(spec.end - 8192, 8192, Access::None)]
        );
        let zone = zones.zone(RegionKind::DetStack).unwrap();
        assert_eq!(zone.zone_left, 8192);
        assert_eq!(zone.state(UNIT), ZoneState::Protected);
        assert!(zones.zone(RegionKind::Heap).is_none());
    }

    #[test]
    fn test_install_failure_names_region() {
        let protector = RecordingProtector {
            fail: true,
            ..Default::default()
        };
        let err = GuardZones::install(&[det_spec()], UNIT, Access::None, Box::new(protector)).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Protection { region: RegionKind::DetStack, action: "protect", .. }
        ));
    }

    #[test]
    fn test_zero_sized_zone_is_skipped() {
        let spec = ZoneSpec { zone_size: 0, ..det_spec() };
        let zones = GuardZones::install(&[spec], UNIT, Access::None, Box::new(RecordingProtector::default())).unwrap();
        assert!(zones.is_empty());
    }

    #[test]
    fn test_fault_relaxes_one_unit() {
        let protector = RecordingProtector::default();
        let zones = zones(protector.clone());
        let start = zones.zone(RegionKind::DetStack).unwrap().zone_start;

        let outcome = zones.try_relax(start + 2000).unwrap();
        assert_eq!(
            outcome,
            RelaxOutcome::Relaxed { kind: RegionKind::DetStack, from: start, to: start + UNIT }
        );
        assert!(outcome.resumes());

        let zone = zones.zone(RegionKind::DetStack).unwrap();
        assert_eq!(zone.zone_left, 4096);
        assert_eq!(zone.zone_start, start + UNIT);
        assert_eq!(zone.state(UNIT), ZoneState::Exhausted);
        assert_eq!(protector.calls.lock().last(), Some(&(start, UNIT, Access::ReadWrite)));
    }

    #[test]
    fn test_last_unit_is_never_ceded() {
        let zones = zones(RecordingProtector::default());
        let start = zones.zone(RegionKind::DetStack).unwrap().zone_start;
        zones.try_relax(start + 2000).unwrap();

        let outcome = zones.try_relax(start + UNIT + 16).unwrap();
        assert_eq!(
            outcome,
            RelaxOutcome::Exhausted { kind: RegionKind::DetStack, refusal: Refusal::LastUnit }
        );
        assert!(!outcome.resumes());
        assert_eq!(zones.zone(RegionKind::DetStack).unwrap().zone_left, 4096);
    }

    #[test]
    fn test_lower_boundary_is_inclusive() {
        let zones = zones(RecordingProtector::default());
        let start = zones.zone(RegionKind::DetStack).unwrap().zone_start;
        assert!(matches!(zones.try_relax(start).unwrap(), RelaxOutcome::Relaxed { .. }));
    }

    #[test]
    fn test_margin_can_cede_two_units() {
        let spec = ZoneSpec { zone_size: 16 * 1024, ..det_spec() };
        let zones = GuardZones::install(&[spec], UNIT, Access::None, Box::new(RecordingProtector::default())).unwrap();
        let start = zones.zone(RegionKind::DetStack).unwrap().zone_start;

        let outcome = zones.try_relax(start + UNIT - 2).unwrap();
        assert_eq!(
            outcome,
            RelaxOutcome::Relaxed { kind: RegionKind::DetStack, from: start, to: start + 2 * UNIT }
        );
    }

    #[test]
    fn test_address_below_zone_is_not_ours() {
        let zones = zones(RecordingProtector::default());
        let start = zones.zone(RegionKind::DetStack).unwrap().zone_start;
        assert_eq!(zones.try_relax(start - 1).unwrap(), RelaxOutcome::NotOurs);
        assert_eq!(zones.try_relax(0).unwrap(), RelaxOutcome::NotOurs);
    }

    #[test]
    fn test_ceded_address_reports_already_relaxed() {
        let zones = zones(RecordingProtector::default());
        let start = zones.zone(RegionKind::DetStack).unwrap().zone_start;
        zones.try_relax(start + 8).unwrap();
        assert_eq!(
            zones.try_relax(start + 8).unwrap(),
            RelaxOutcome::AlreadyRelaxed { kind: RegionKind::DetStack }
        );
    }

    #[test]
    fn test_repeated_fault_in_ceded_span_is_persistent() {
        let spec = ZoneSpec { zone_size: 16 * 1024, ..det_spec() };
        let zones = GuardZones::install(&[spec], UNIT, Access::None, Box::new(RecordingProtector::default())).unwrap();
        let start = zones.zone(RegionKind::DetStack).unwrap().zone_start;
        zones.try_relax(start + 8).unwrap();

        assert!(zones.try_relax(start + 8).unwrap().resumes());
        let outcome = zones.try_relax(start + 8).unwrap();
        assert_eq!(outcome, RelaxOutcome::Persistent { kind: RegionKind::DetStack, addr: start + 8 });
        assert!(!outcome.resumes());

        // A different ceded address gets its own retry.
        assert!(zones.try_relax(start + 64).unwrap().resumes());

        // A real relaxation clears the record.
        zones.try_relax(start + 8).unwrap();
        assert!(matches!(zones.try_relax(start + UNIT).unwrap(), RelaxOutcome::Relaxed { .. }));
        assert!(zones.try_relax(start + 8).unwrap().resumes());
    }

    #[test]
    fn test_zone_state_names() {
        assert_eq!(ZoneState::Protected.as_str(), "protected");
        assert_eq!(format!("[{:<10}]", ZoneState::Exhausted), "[exhausted ]");
    }

    #[test]
    fn test_unprotect_failure_is_error() {
        let protector = RecordingProtector::default();
        let zones = zones(protector);
        let start = zones.zone(RegionKind::DetStack).unwrap().zone_start;

        let failing = GuardZones {
            unit: zones.unit,
            cells: zones.cells,
            protector: Box::new(RecordingProtector { fail: true, ..Default::default() }),
        };
        let err = failing.try_relax(start).unwrap_err();
        assert!(matches!(err, MemoryError::Protection { action: "unprotect", .. }));
        assert_eq!(failing.zone(RegionKind::DetStack).unwrap().zone_left, 8192);
    }

    #[test]
    fn test_held_lock_reports_busy() {
        let zones = zones(RecordingProtector::default());
        let start = zones.zone(RegionKind::DetStack).unwrap().zone_start;
        let cell = zones.cells[RegionKind::DetStack.index()].as_ref().unwrap();
        let _held = cell.state.lock();
        assert_eq!(
            zones.try_relax(start).unwrap(),
            RelaxOutcome::Busy { kind: RegionKind::DetStack }
        );
    }

    #[test]
    fn test_plan_relax_budget() {
        let mut zone = GuardZone::new(RegionKind::Heap, 0x20000, 0x4000);
        assert_eq!(zone.plan_relax(zone.zone_start, UNIT), Ok(0x1d000));
        zone.commit(0x1d000);
        assert_eq!(zone.ceded(), UNIT);
        assert_eq!(zone.state(UNIT), ZoneState::PartiallyRelaxed);
        assert_eq!(zone.plan_relax(0x1f000, UNIT), Err(Refusal::LastUnit));

        // A zone whose budget was cut below its extent refuses on budget.
        let zone = GuardZone { zone_left: 0x1000, ..GuardZone::new(RegionKind::Heap, 0x20000, 0x4000) };
        assert_eq!(zone.plan_relax(zone.zone_start + 0x1000, UNIT), Err(Refusal::BudgetSpent));
    }

    #[test]
    fn test_disabled_zones() {
        let zones = GuardZones::disabled(UNIT);
        assert!(zones.is_empty());
        assert_eq!(zones.try_relax(0x1234).unwrap(), RelaxOutcome::NotOurs);
    }
}
