//! Fault Signal Boundary
//!
//! Installs the SIGSEGV/SIGBUS handlers and forwards every delivery to the
//! [`FaultPolicy`] held by the active [`HandlerRegistration`].
//!
//! # Signal context
//!
//! The handlers run on the interrupted thread at an arbitrary instruction.
//! They therefore only:
//!
//! - read an atomic pointer to the registration context,
//! - call the policy (which takes zone locks with `try_lock` only),
//! - format into a fixed stack buffer and `write(2)` it to stderr,
//! - return, or `_exit(2)`.
//!
//! Returning from the handler makes the OS re-execute the faulting
//! instruction against the now-writable pages.

use std::ffi::{c_int, c_void};
use std::fmt::{self, Write};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{MemoryError, MemoryResult, EXIT_FATAL};
use crate::fault::{Fault, FaultCause, FaultDecision, FaultPolicy, FaultSignal};
use crate::log::{self, LogLevel};
use crate::platform::FaultTier;
use crate::zone::GuardZones;

/// Signals the handler is registered for, with their report names.
const FAULT_SIGNALS: [(Signal, &str); 2] = [(Signal::SIGBUS, "SIGBUS"), (Signal::SIGSEGV, "SIGSEGV")];

/// Size of the on-stack report buffer.
const REPORT_CAPACITY: usize = 1024;

/// What the handler needs, pinned at a stable address while installed.
#[derive(Debug)]
struct FaultContext {
    zones: Arc<GuardZones>,
    policy: Box<dyn FaultPolicy>,
}

/// The active context, or null when no registration exists.
static CONTEXT: AtomicPtr<FaultContext> = AtomicPtr::new(ptr::null_mut());

/// Ownership of the process fault handlers.
///
/// At most one registration exists at a time. Dropping it restores the
/// dispositions that were in place before [`install`](Self::install).
#[derive(Debug)]
pub struct HandlerRegistration {
    context: *mut FaultContext,
    tier: FaultTier,
    previous: Vec<(Signal, SigAction)>,
}

// The context is immutable once published and only freed on drop.
unsafe impl Send for HandlerRegistration {}
unsafe impl Sync for HandlerRegistration {}

impl HandlerRegistration {
    /// Register `policy` for SIGBUS and SIGSEGV.
    pub fn install(zones: Arc<GuardZones>, policy: Box<dyn FaultPolicy>) -> MemoryResult<Self> {
        let tier = policy.tier();
        let context = Box::into_raw(Box::new(FaultContext { zones, policy }));

        if CONTEXT
            .compare_exchange(ptr::null_mut(), context, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            drop(unsafe { Box::from_raw(context) });
            return Err(MemoryError::HandlerAlreadyInstalled);
        }

        let action = match tier {
            FaultTier::Rich => SigAction::new(
                SigHandler::SigAction(rich_handler),
                SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
                SigSet::empty(),
            ),
            FaultTier::Minimal => SigAction::new(
                SigHandler::Handler(minimal_handler),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            ),
        };

        let mut registration = Self {
            context,
            tier,
            previous: Vec::with_capacity(FAULT_SIGNALS.len()),
        };

        for (signal, name) in FAULT_SIGNALS {
            match unsafe { sigaction(signal, &action) } {
                Ok(old) => registration.previous.push((signal, old)),
                // Drop restores whatever was already replaced.
                Err(source) => return Err(MemoryError::HandlerInstall { signal: name, source }),
            }
        }

        log::debug(format!("fault handlers installed ({:?} tier)", tier));
        Ok(registration)
    }

    /// Metadata tier of the installed handler.
    pub fn tier(&self) -> FaultTier {
        self.tier
    }

    /// Whether any registration is currently active in the process.
    pub fn is_active() -> bool {
        !CONTEXT.load(Ordering::Acquire).is_null()
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        for (signal, old) in self.previous.drain(..).rev() {
            let _ = unsafe { sigaction(signal, &old) };
        }
        let _ = CONTEXT.compare_exchange(self.context, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire);
        drop(unsafe { Box::from_raw(self.context) });
    }
}

extern "C" fn rich_handler(signo: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let signal = FaultSignal::from_raw(signo);
    let fault = if info.is_null() {
        Fault::bare(signal)
    } else {
        let info = unsafe { &*info };
        let address = unsafe { info.si_addr() } as usize;
        Fault::with_info(signal, info.si_signo, info.si_code, address).with_pc(program_counter(ucontext))
    };
    dispatch(fault);
}

/// Program counter saved in a signal context, where the layout is known.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn program_counter(ucontext: *mut c_void) -> Option<usize> {
    let context = unsafe { (ucontext as *const libc::ucontext_t).as_ref()? };
    Some(context.uc_mcontext.gregs[libc::REG_RIP as usize] as usize)
}

/// Program counter saved in a signal context, where the layout is known.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn program_counter(ucontext: *mut c_void) -> Option<usize> {
    let context = unsafe { (ucontext as *const libc::ucontext_t).as_ref()? };
    Some(context.uc_mcontext.pc as usize)
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
fn program_counter(_ucontext: *mut c_void) -> Option<usize> {
    None
}

extern "C" fn minimal_handler(signo: c_int) {
    dispatch(Fault::bare(FaultSignal::from_raw(signo)));
}

fn dispatch(fault: Fault) {
    let context = CONTEXT.load(Ordering::Acquire);
    let decision = if context.is_null() {
        FaultDecision::Terminate(FaultCause::Unknown)
    } else {
        let context = unsafe { &*context };
        context.policy.decide(&fault, &context.zones)
    };

    match decision {
        FaultDecision::Resume(_) => {
            if log::would_log(LogLevel::Debug) {
                report(&fault, &decision);
            }
        }
        FaultDecision::Terminate(_) => {
            report(&fault, &decision);
            unsafe { libc::_exit(EXIT_FATAL) };
        }
    }
}

fn report(fault: &Fault, decision: &FaultDecision) {
    let mut out = ReportBuffer::new();
    let _ = fault.describe(&mut out);
    let _ = decision.describe(&mut out);
    out.write_to_stderr();
}

/// Fixed-capacity text buffer; excess output is truncated.
struct ReportBuffer {
    bytes: [u8; REPORT_CAPACITY],
    len: usize,
}

impl ReportBuffer {
    fn new() -> Self {
        Self {
            bytes: [0; REPORT_CAPACITY],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn write_to_stderr(&self) {
        let bytes = self.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            let rest = &bytes[written..];
            let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr() as *const c_void, rest.len()) };
            if n <= 0 {
                break;
            }
            written += n as usize;
        }
    }
}

impl Write for ReportBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = REPORT_CAPACITY - self.len;
        let n = s.len().min(room);
        self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}
