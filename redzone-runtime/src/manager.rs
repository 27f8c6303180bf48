//! Memory Manager
//!
//! Owns everything the execution engine runs on: the virtual register
//! storage, the arena, the three regions, their guard zones and the fault
//! handler registration.
//!
//! # Initialization
//!
//! ```text
//!   probe capabilities ──► plan layout ──► reserve arena ──► resolve regions
//!                                                                  │
//!   install handlers ◄── install guard zones ◄── check reservation ◄┘
//! ```
//!
//! Every step either succeeds or returns a
//! [`MemoryError`](crate::error::MemoryError); nothing is left
//! installed when initialization fails part way.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::arena::Arena;
use crate::config::MemoryConfig;
use crate::diagnostics::{LayoutReport, RegionReport};
use crate::error::MemoryResult;
use crate::fault::policy_for;
use crate::handler::HandlerRegistration;
use crate::layout::{LayoutPlan, LayoutRequest};
use crate::log::{self, LogBuilder, LogLevel};
use crate::platform::Capabilities;
use crate::region::{Region, RegionKind};
use crate::zone::{Access, GuardZone, GuardZones, MprotectProtector, RelaxOutcome, ZoneSpec};

/// Number of virtual machine registers the engine can spill to memory.
pub const MAX_VIRTUAL_REGISTERS: usize = 1024;

/// The execution memory subsystem.
///
/// Fields drop in declaration order: the handler is removed before the zones
/// it points at, and the zones before the arena they protect.
#[derive(Debug)]
pub struct MemoryManager {
    handler: Option<HandlerRegistration>,
    zones: Arc<GuardZones>,
    arena: Arena,
    regions: [Region; 3],
    plan: LayoutPlan,
    capabilities: Capabilities,
    registers: Box<[usize]>,
    high_water: [AtomicUsize; 3],
}

impl MemoryManager {
    /// Build the arena, regions and guard zones described by `config`.
    pub fn initialize(config: &MemoryConfig) -> MemoryResult<Self> {
        let mut capabilities = Capabilities::probe();
        if config.faults.disable_protection {
            capabilities = capabilities.without_protection();
        }
        if config.faults.minimal_faults {
            capabilities = capabilities.with_minimal_faults();
        }

        let registers = vec![0usize; MAX_VIRTUAL_REGISTERS].into_boxed_slice();
        let request = LayoutRequest {
            heap: config.heap,
            det_stack: config.det_stack,
            nondet_stack: config.nondet_stack,
            page_size: capabilities.page_size,
            cache_size: config.pcache_size,
            register_offset: registers.as_ptr() as usize % config.pcache_size.max(1),
            external_heap: config.external_heap,
        };
        let plan = LayoutPlan::plan(&request)?;

        let arena = Arena::reserve(plan.total_size, plan.unit)?;
        let regions = plan.resolve(arena.base());
        arena.check_fits(arena.base() + plan.span_end())?;

        let zones = if capabilities.protection {
            // An external collector scans the whole arena, zones included.
            let access = if config.external_heap {
                Access::ReadOnly
            } else {
                Access::None
            };
            let specs: Vec<ZoneSpec> = plan
                .regions
                .iter()
                .zip(regions.iter())
                .filter(|(p, _)| p.present)
                .map(|(p, r)| ZoneSpec {
                    kind: p.kind,
                    end: r.end,
                    zone_size: p.zone_size,
                })
                .collect();
            GuardZones::install(&specs, plan.unit, access, Box::new(MprotectProtector))?
        } else {
            log::warn("page protection unavailable; running without guard zones");
            GuardZones::disabled(plan.unit)
        };
        let zones = Arc::new(zones);

        let handler = if config.faults.install_handler {
            Some(HandlerRegistration::install(
                Arc::clone(&zones),
                policy_for(capabilities.fault_tier),
            )?)
        } else {
            None
        };

        let manager = Self {
            handler,
            zones,
            arena,
            regions,
            plan,
            capabilities,
            registers,
            high_water: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
        };

        for region in manager.regions.iter().filter(|r| !r.is_absent()) {
            LogBuilder::new(LogLevel::Debug)
                .message("region resolved")
                .field_str("region", region.kind.as_str())
                .field_addr("base", region.base)
                .field_addr("min", region.min)
                .field_addr("end", region.end)
                .emit();
        }
        LogBuilder::new(LogLevel::Info)
            .message("execution memory initialized")
            .field_int("total_size", manager.plan.total_size as i64)
            .field_int("unit", manager.plan.unit as i64)
            .field_bool("protection", manager.capabilities.protection)
            .field_bool("relaxation", manager.capabilities.can_relax())
            .field_bool("fault_handler", manager.handler.is_some())
            .emit();

        if config.diagnostics {
            if let Err(e) = manager.report().print(&mut io::stdout().lock()) {
                log::warn(format!("failed to print memory layout: {}", e));
            }
        }

        Ok(manager)
    }

    /// The heap (absent when an external collector owns it).
    pub fn heap(&self) -> &Region {
        self.region(RegionKind::Heap)
    }

    /// The deterministic stack.
    pub fn det_stack(&self) -> &Region {
        self.region(RegionKind::DetStack)
    }

    /// The nondeterministic stack.
    pub fn nondet_stack(&self) -> &Region {
        self.region(RegionKind::NondetStack)
    }

    /// A region by kind.
    pub fn region(&self, kind: RegionKind) -> &Region {
        &self.regions[kind.index()]
    }

    /// Snapshot of a region's guard zone, if it has one.
    pub fn zone(&self, kind: RegionKind) -> Option<GuardZone> {
        self.zones.zone(kind)
    }

    /// Rounding granularity of every region boundary.
    pub fn unit(&self) -> usize {
        self.plan.unit
    }

    /// `(start, end)` of the raw reservation.
    pub fn arena_bounds(&self) -> (usize, usize) {
        (self.arena.start(), self.arena.end())
    }

    /// Bytes reserved for the arena.
    pub fn total_size(&self) -> usize {
        self.plan.total_size
    }

    /// What the platform turned out to support, after config overrides.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether fault handlers are installed.
    pub fn has_fault_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Virtual register storage.
    pub fn registers(&self) -> &[usize] {
        &self.registers
    }

    /// Mutable virtual register storage.
    pub fn registers_mut(&mut self) -> &mut [usize] {
        &mut self.registers
    }

    /// Relax the zone containing `addr`, exactly as the fault handler would.
    pub fn try_relax(&self, addr: usize) -> MemoryResult<RelaxOutcome> {
        let outcome = self.zones.try_relax(addr)?;
        if let RelaxOutcome::Relaxed { kind, from, to } = outcome {
            LogBuilder::new(LogLevel::Debug)
                .message("guard zone relaxed")
                .field_str("region", kind.as_str())
                .field_addr("from", from)
                .field_addr("to", to)
                .emit();
        }
        Ok(outcome)
    }

    /// Remember the highest address used in `kind`.
    pub fn record_high_water(&self, kind: RegionKind, addr: usize) {
        self.high_water[kind.index()].fetch_max(addr, Ordering::Relaxed);
    }

    /// Highest address recorded for `kind`, or zero.
    pub fn high_water(&self, kind: RegionKind) -> usize {
        self.high_water[kind.index()].load(Ordering::Relaxed)
    }

    /// Snapshot of the resolved layout.
    pub fn report(&self) -> LayoutReport {
        let regions = RegionKind::ALL.map(|kind| RegionReport {
            region: *self.region(kind),
            zone: self.zone(kind),
            high_water: self.high_water(kind),
        });
        LayoutReport {
            cache_size: self.plan.cache_size,
            page_size: self.plan.page_size,
            unit: self.plan.unit,
            registers: self.registers.as_ptr() as usize,
            regions,
            arena_start: self.arena.base(),
            arena_end: self.arena.end(),
            total_size: self.plan.total_size,
            protection: self.capabilities.protection,
            fault_tier: self.handler.as_ref().map(HandlerRegistration::tier),
        }
    }

    /// Remove the fault handlers and release the arena.
    pub fn shutdown(mut self) {
        drop(self.handler.take());
        log::debug("execution memory released");
    }
}
