//! Fault classification and decisions.
//!
//! The OS boundary in [`handler`](crate::handler) turns a delivered signal
//! into a [`Fault`] and hands it to the installed [`FaultPolicy`], which
//! returns a [`FaultDecision`]. Nothing here touches signals, so every path
//! can be exercised directly in tests.
//!
//! The report text is written through [`fmt::Write`] so the handler can
//! render it into a fixed stack buffer without allocating.

use std::fmt::{self, Write};

use crate::error::{MemoryError, EXIT_FATAL};
use crate::platform::FaultTier;
use crate::region::RegionKind;
use crate::zone::{GuardZones, RelaxOutcome};

/// `si_code` values shared by Linux, the BSDs and macOS.
mod code {
    pub const BUS_ADRALN: i32 = 1;
    pub const BUS_ADRERR: i32 = 2;
    pub const BUS_OBJERR: i32 = 3;
    pub const SEGV_MAPERR: i32 = 1;
    pub const SEGV_ACCERR: i32 = 2;
}

/// The signal a fault arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSignal {
    /// SIGSEGV.
    Segv,
    /// SIGBUS.
    Bus,
    /// Anything else (should never reach the handler).
    Other(i32),
}

impl FaultSignal {
    /// Map a raw signal number.
    pub fn from_raw(signo: i32) -> Self {
        match signo {
            libc::SIGSEGV => FaultSignal::Segv,
            libc::SIGBUS => FaultSignal::Bus,
            other => FaultSignal::Other(other),
        }
    }

    /// What the signal means, for reports.
    pub fn describe(&self) -> &'static str {
        match self {
            FaultSignal::Segv => "segmentation violation",
            FaultSignal::Bus => "bus error",
            FaultSignal::Other(_) => "unknown signal",
        }
    }
}

/// Reason code delivered with the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// BUS_ADRALN.
    Alignment,
    /// BUS_ADRERR.
    NonexistentAddress,
    /// BUS_OBJERR.
    ObjectHardware,
    /// SEGV_MAPERR.
    Unmapped,
    /// SEGV_ACCERR.
    Permission,
    /// A kernel-generated code this crate does not know.
    Unknown,
}

impl FaultReason {
    /// Decode `si_code`. Codes ≤ 0 mean the signal was sent by a process, not
    /// raised by a fault, and carry no reason.
    pub fn from_code(signal: FaultSignal, si_code: i32) -> Option<Self> {
        if si_code <= 0 {
            return None;
        }
        Some(match (signal, si_code) {
            (FaultSignal::Bus, code::BUS_ADRALN) => FaultReason::Alignment,
            (FaultSignal::Bus, code::BUS_ADRERR) => FaultReason::NonexistentAddress,
            (FaultSignal::Bus, code::BUS_OBJERR) => FaultReason::ObjectHardware,
            (FaultSignal::Segv, code::SEGV_MAPERR) => FaultReason::Unmapped,
            (FaultSignal::Segv, code::SEGV_ACCERR) => FaultReason::Permission,
            _ => FaultReason::Unknown,
        })
    }

    /// What the reason means, for reports.
    pub fn describe(&self) -> &'static str {
        match self {
            FaultReason::Alignment => "invalid address alignment",
            FaultReason::NonexistentAddress => "non-existent physical address",
            FaultReason::ObjectHardware => "object specific hardware error",
            FaultReason::Unmapped => "address not mapped to object",
            FaultReason::Permission => "invalid permissions for mapped object",
            FaultReason::Unknown => "unknown",
        }
    }
}

/// A delivered fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Signal the handler was invoked for.
    pub signal: FaultSignal,
    /// Whether the signal number in the metadata disagrees with the handler's.
    pub mismatched: bool,
    /// Reason, when metadata was delivered.
    pub reason: Option<FaultReason>,
    /// Faulting address, when metadata was delivered.
    pub address: Option<usize>,
    /// Program counter of the faulting instruction, when the platform's
    /// signal context exposes it.
    pub pc: Option<usize>,
}

impl Fault {
    /// A fault with only the signal known.
    pub fn bare(signal: FaultSignal) -> Self {
        Self {
            signal,
            mismatched: false,
            reason: None,
            address: None,
            pc: None,
        }
    }

    /// A fault with full metadata.
    pub fn with_info(signal: FaultSignal, info_signo: i32, si_code: i32, address: usize) -> Self {
        let reason = FaultReason::from_code(signal, si_code);
        Self {
            signal,
            mismatched: FaultSignal::from_raw(info_signo) != signal,
            reason,
            address: reason.map(|_| address),
            pc: None,
        }
    }

    /// Attach the program counter read from the signal context.
    pub fn with_pc(self, pc: Option<usize>) -> Self {
        Self { pc, ..self }
    }

    /// Render the report header.
    pub fn describe(&self, w: &mut impl Write) -> fmt::Result {
        if self.mismatched {
            return writeln!(w, "\n*** caught strange {} ***", self.signal.describe());
        }
        writeln!(w, "\n*** caught {} ***", self.signal.describe())?;
        if let Some(reason) = self.reason {
            writeln!(w, "cause: {}", reason.describe())?;
            if let Some(pc) = self.pc {
                writeln!(w, "PC at signal: {} ({:#x})", pc, pc)?;
            }
        }
        if let Some(address) = self.address {
            writeln!(w, "address involved: {:#x}", address)?;
        }
        Ok(())
    }
}

/// Why a fault is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    /// The region's guard zone cannot give up more memory.
    Overflow {
        /// Exhausted region.
        kind: RegionKind,
    },
    /// The zone lock was held by the interrupted code.
    ZoneBusy {
        /// Region whose lock was held.
        kind: RegionKind,
    },
    /// Unprotecting the ceded span failed.
    ProtectionFailure {
        /// Region being relaxed.
        kind: RegionKind,
    },
    /// Signal numbers disagree.
    Strange,
    /// No metadata to classify the fault with.
    NoMetadata,
    /// A ceded address kept faulting after being retried.
    Persistent {
        /// Region the address belongs to.
        kind: RegionKind,
    },
    /// Outside every zone, or not a permission fault.
    Unknown,
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCause::Overflow { kind } => write!(f, "{} overflow: guard zone exhausted", kind),
            FaultCause::ZoneBusy { kind } => write!(f, "{} guard zone is locked by the faulting code", kind),
            FaultCause::ProtectionFailure { kind } => write!(f, "cannot unprotect {}", kind),
            FaultCause::Persistent { kind } => write!(f, "fault persists in unprotected {} memory", kind),
            FaultCause::Strange => f.write_str("signal does not match its fault information"),
            FaultCause::NoMetadata => f.write_str("no fault information available"),
            FaultCause::Unknown => f.write_str("fault outside every guard zone"),
        }
    }
}

/// What to do about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// Return from the handler so the access is retried.
    Resume(RelaxOutcome),
    /// Report and exit.
    Terminate(FaultCause),
}

impl FaultDecision {
    /// Exit status, if the decision terminates.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            FaultDecision::Resume(_) => None,
            FaultDecision::Terminate(_) => Some(EXIT_FATAL),
        }
    }

    /// Render the closing lines of the report.
    pub fn describe(&self, w: &mut impl Write) -> fmt::Result {
        match self {
            FaultDecision::Resume(RelaxOutcome::Relaxed { kind, from, to }) => {
                writeln!(w, "address is in {} red zone", kind)?;
                writeln!(w, "unprotected {:#x} to {:#x}", from, to)?;
                writeln!(w, "returning from signal handler\n")
            }
            FaultDecision::Resume(_) => writeln!(w, "returning from signal handler\n"),
            FaultDecision::Terminate(cause) => {
                writeln!(w, "{}", cause)?;
                writeln!(w, "exiting from signal handler")
            }
        }
    }
}

/// Strategy for deciding what a fault means.
pub trait FaultPolicy: Send + Sync + fmt::Debug {
    /// Which metadata tier the policy expects.
    fn tier(&self) -> FaultTier;

    /// Decide about one fault. Must not block or allocate.
    fn decide(&self, fault: &Fault, zones: &GuardZones) -> FaultDecision;
}

/// Uses the faulting address to relax guard zones.
#[derive(Debug, Default, Clone, Copy)]
pub struct RichFaultPolicy;

impl FaultPolicy for RichFaultPolicy {
    fn tier(&self) -> FaultTier {
        FaultTier::Rich
    }

    fn decide(&self, fault: &Fault, zones: &GuardZones) -> FaultDecision {
        if fault.mismatched {
            return FaultDecision::Terminate(FaultCause::Strange);
        }

        let address = match (fault.signal, fault.reason, fault.address) {
            (FaultSignal::Segv, Some(FaultReason::Permission), Some(address)) => address,
            (_, None, _) => return FaultDecision::Terminate(FaultCause::NoMetadata),
            _ => return FaultDecision::Terminate(FaultCause::Unknown),
        };

        match zones.try_relax(address) {
            Ok(outcome) if outcome.resumes() => FaultDecision::Resume(outcome),
            Ok(RelaxOutcome::Exhausted { kind, .. }) => FaultDecision::Terminate(FaultCause::Overflow { kind }),
            Ok(RelaxOutcome::Busy { kind }) => FaultDecision::Terminate(FaultCause::ZoneBusy { kind }),
            Ok(RelaxOutcome::Persistent { kind, .. }) => FaultDecision::Terminate(FaultCause::Persistent { kind }),
            Ok(_) => FaultDecision::Terminate(FaultCause::Unknown),
            Err(MemoryError::Protection { region, .. }) => {
                FaultDecision::Terminate(FaultCause::ProtectionFailure { kind: region })
            }
            Err(_) => FaultDecision::Terminate(FaultCause::Unknown),
        }
    }
}

/// Every fault is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinimalFaultPolicy;

impl FaultPolicy for MinimalFaultPolicy {
    fn tier(&self) -> FaultTier {
        FaultTier::Minimal
    }

    fn decide(&self, _fault: &Fault, _zones: &GuardZones) -> FaultDecision {
        FaultDecision::Terminate(FaultCause::NoMetadata)
    }
}

/// Pick the policy for a metadata tier.
pub fn policy_for(tier: FaultTier) -> Box<dyn FaultPolicy> {
    match tier {
        FaultTier::Rich => Box::new(RichFaultPolicy),
        FaultTier::Minimal => Box::new(MinimalFaultPolicy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::tests::RecordingProtector;
    use crate::zone::{Access, ZoneSpec};

    const UNIT: usize = 4096;
    const DET_END: usize = 0x80_0000;
    const HEAP_END: usize = 0x40_0000;

    fn zones() -> GuardZones {
        GuardZones::install(
            &[
                ZoneSpec { kind: RegionKind::Heap, end: HEAP_END, zone_size: 4 * UNIT },
                ZoneSpec { kind: RegionKind::DetStack, end: DET_END, zone_size: 2 * UNIT },
            ],
            UNIT,
            Access::None,
            Box::new(RecordingProtector::default()),
        )
        .unwrap()
    }

    fn permission_fault(address: usize) -> Fault {
        Fault::with_info(FaultSignal::Segv, libc::SIGSEGV, code::SEGV_ACCERR, address)
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(FaultReason::from_code(FaultSignal::Bus, 1), Some(FaultReason::Alignment));
        assert_eq!(FaultReason::from_code(FaultSignal::Bus, 2), Some(FaultReason::NonexistentAddress));
        assert_eq!(FaultReason::from_code(FaultSignal::Bus, 3), Some(FaultReason::ObjectHardware));
        assert_eq!(FaultReason::from_code(FaultSignal::Segv, 1), Some(FaultReason::Unmapped));
        assert_eq!(FaultReason::from_code(FaultSignal::Segv, 2), Some(FaultReason::Permission));
        assert_eq!(FaultReason::from_code(FaultSignal::Segv, 9), Some(FaultReason::Unknown));
        assert_eq!(FaultReason::from_code(FaultSignal::Segv, 0), None);
        assert_eq!(FaultReason::from_code(FaultSignal::Segv, -6), None);
    }

    #[test]
    fn test_rich_policy_resumes_inside_zone() {
        let zones = zones();
        let start = DET_END - 2 * UNIT;
        let decision = RichFaultPolicy.decide(&permission_fault(start + 100), &zones);
        assert_eq!(
            decision,
            FaultDecision::Resume(RelaxOutcome::Relaxed { kind: RegionKind::DetStack, from: start, to: start + UNIT })
        );
        assert_eq!(decision.exit_code(), None);
    }

    #[test]
    fn test_rich_policy_overflow_in_last_unit() {
        let zones = zones();
        let decision = RichFaultPolicy.decide(&permission_fault(DET_END - 8), &zones);
        assert_eq!(decision, FaultDecision::Terminate(FaultCause::Overflow { kind: RegionKind::DetStack }));
        assert_eq!(decision.exit_code(), Some(EXIT_FATAL));
    }

    #[test]
    fn test_rich_policy_terminates_repeated_fault() {
        let zones = zones();
        let start = HEAP_END - 4 * UNIT;
        let fault = permission_fault(start + 8);
        assert!(matches!(RichFaultPolicy.decide(&fault, &zones), FaultDecision::Resume(RelaxOutcome::Relaxed { .. })));
        assert!(matches!(
            RichFaultPolicy.decide(&fault, &zones),
            FaultDecision::Resume(RelaxOutcome::AlreadyRelaxed { .. })
        ));

        let decision = RichFaultPolicy.decide(&fault, &zones);
        assert_eq!(decision, FaultDecision::Terminate(FaultCause::Persistent { kind: RegionKind::Heap }));
        assert_eq!(decision.exit_code(), Some(EXIT_FATAL));

        let mut out = String::new();
        decision.describe(&mut out).unwrap();
        assert!(out.contains("fault persists in unprotected heap memory"));
    }

    #[test]
    fn test_rich_policy_unknown_outside_zones() {
        let zones = zones();
        let decision = RichFaultPolicy.decide(&permission_fault(0x1000), &zones);
        assert_eq!(decision, FaultDecision::Terminate(FaultCause::Unknown));
    }

    #[test]
    fn test_rich_policy_ignores_non_permission_faults() {
        let zones = zones();
        let start = HEAP_END - 4 * UNIT;
        let unmapped = Fault::with_info(FaultSignal::Segv, libc::SIGSEGV, code::SEGV_MAPERR, start);
        assert_eq!(RichFaultPolicy.decide(&unmapped, &zones), FaultDecision::Terminate(FaultCause::Unknown));

        let bus = Fault::with_info(FaultSignal::Bus, libc::SIGBUS, code::BUS_ADRERR, start);
        assert_eq!(RichFaultPolicy.decide(&bus, &zones), FaultDecision::Terminate(FaultCause::Unknown));
        assert_eq!(zones.zone(RegionKind::Heap).unwrap().zone_left, 4 * UNIT);
    }

    #[test]
    fn test_rich_policy_strange_and_bare() {
        let zones = zones();
        let strange = Fault::with_info(FaultSignal::Segv, libc::SIGBUS, code::SEGV_ACCERR, DET_END - UNIT);
        assert!(strange.mismatched);
        assert_eq!(RichFaultPolicy.decide(&strange, &zones), FaultDecision::Terminate(FaultCause::Strange));

        let sent = Fault::with_info(FaultSignal::Segv, libc::SIGSEGV, 0, DET_END - 2 * UNIT);
        assert_eq!(sent.address, None);
        assert_eq!(RichFaultPolicy.decide(&sent, &zones), FaultDecision::Terminate(FaultCause::NoMetadata));
    }

    #[test]
    fn test_minimal_policy_always_terminates() {
        let zones = zones();
        let decision = MinimalFaultPolicy.decide(&permission_fault(DET_END - 2 * UNIT), &zones);
        assert_eq!(decision, FaultDecision::Terminate(FaultCause::NoMetadata));
        assert_eq!(zones.zone(RegionKind::DetStack).unwrap().zone_left, 2 * UNIT);
        assert_eq!(policy_for(FaultTier::Minimal).tier(), FaultTier::Minimal);
        assert_eq!(policy_for(FaultTier::Rich).tier(), FaultTier::Rich);
    }

    #[test]
    fn test_disabled_zones_make_every_fault_fatal() {
        let zones = GuardZones::disabled(UNIT);
        let decision = RichFaultPolicy.decide(&permission_fault(DET_END - 2 * UNIT), &zones);
        assert_eq!(decision, FaultDecision::Terminate(FaultCause::Unknown));
    }

    #[test]
    fn test_report_text() {
        let mut out = String::new();
        let fault = permission_fault(0xdead_0000);
        fault.describe(&mut out).unwrap();
        FaultDecision::Terminate(FaultCause::Overflow { kind: RegionKind::NondetStack })
            .describe(&mut out)
            .unwrap();

        assert!(out.contains("*** caught segmentation violation ***"));
        assert!(out.contains("cause: invalid permissions for mapped object"));
        assert!(out.contains("address involved: 0xdead0000"));
        assert!(!out.contains("PC at signal"));
        assert!(out.contains("nondet-stack overflow: guard zone exhausted"));
        assert!(out.contains("exiting from signal handler"));
    }

    #[test]
    fn test_report_includes_pc() {
        let mut out = String::new();
        permission_fault(0xdead_0000).with_pc(Some(0x4010)).describe(&mut out).unwrap();
        assert!(out.contains("cause: invalid permissions for mapped object\nPC at signal: 16400 (0x4010)\naddress involved: 0xdead0000"));

        // Without a reason there is nothing to attribute the PC to.
        let mut out = String::new();
        Fault::bare(FaultSignal::Segv).with_pc(Some(0x4010)).describe(&mut out).unwrap();
        assert!(!out.contains("PC at signal"));
    }

    #[test]
    fn test_minimal_report_has_only_signal() {
        let mut out = String::new();
        Fault::bare(FaultSignal::Bus).describe(&mut out).unwrap();
        assert_eq!(out, "\n*** caught bus error ***\n");
    }
}
