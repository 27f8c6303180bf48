//! Platform capability probe.
//!
//! Decides once, at startup, which protection and fault-handling strategy the
//! manager uses. The rest of the crate branches on [`Capabilities`] values
//! instead of on build configuration.

use nix::unistd::{sysconf, SysconfVar};

/// Page size assumed when the OS will not report one.
pub const FALLBACK_PAGE_SIZE: usize = 8192;

/// How much the OS tells the fault handler about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTier {
    /// Faulting address and reason code are delivered.
    Rich,
    /// Only the signal number is delivered.
    Minimal,
}

/// What the running platform supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// OS page size in bytes.
    pub page_size: usize,
    /// Page protection can be changed (`mprotect`).
    pub protection: bool,
    /// Fault metadata tier.
    pub fault_tier: FaultTier,
}

impl Capabilities {
    /// Probe the running platform.
    pub fn probe() -> Self {
        Self {
            page_size: page_size(),
            protection: cfg!(unix),
            fault_tier: if has_siginfo_address() {
                FaultTier::Rich
            } else {
                FaultTier::Minimal
            },
        }
    }

    /// Turn off page protection.
    pub fn without_protection(mut self) -> Self {
        self.protection = false;
        self
    }

    /// Force the minimal fault tier.
    pub fn with_minimal_faults(mut self) -> Self {
        self.fault_tier = FaultTier::Minimal;
        self
    }

    /// Guard-zone relaxation needs both protection and a faulting address.
    pub fn can_relax(&self) -> bool {
        self.protection && self.fault_tier == FaultTier::Rich
    }
}

fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

fn has_siginfo_address() -> bool {
    cfg!(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd"
    ))
}
