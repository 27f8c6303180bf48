//! Region Layout Planning
//!
//! Computes where the heap, the deterministic stack and the nondeterministic
//! stack live inside the arena, before any memory is reserved.
//!
//! ## Cache placement
//!
//! The register storage, the heap, the det-stack and the nondet-stack are
//! accessed together in tight instruction sequences. On a direct-mapped or
//! low-associativity primary cache they would evict each other if they all
//! started at the same cache offset, so each region's usable `min` is pushed
//! a quarter of the cache further around than the previous one:
//!
//! ```text
//!   cache:   | registers | heap      | det-stack | nondet    |
//!            0          C/4         C/2        3C/4         C
//! ```
//!
//! The starting quarter comes from the runtime address of the register
//! storage, so the placement is a best-effort heuristic rather than a
//! guarantee.
//!
//! ## Arena shape
//!
//! ```text
//!   base                                                        total_size
//!   | heap (size + unit) | det-stack (size + unit) | nondet (size + unit) | slack |
//!                    ^zone               ^zone                  ^zone
//! ```
//!
//! Every region gets one extra unit to absorb its cache pad, and one more
//! unit of slack covers aligning the arena itself.

use nix::errno::Errno;

use crate::error::{MemoryError, MemoryResult};
use crate::region::{Region, RegionKind};

/// Bytes per configured size unit.
pub const KIB: usize = 1024;

/// Round `value` up to the next multiple of `align`.
///
/// `align` of zero leaves the value unchanged. Saturates at the largest
/// multiple of `align` when the result would not fit in a `usize`.
pub fn round_up(value: usize, align: usize) -> usize {
    checked_round_up(value, align).unwrap_or_else(|| usize::MAX - usize::MAX % align)
}

/// [`round_up`], or `None` on overflow.
pub fn checked_round_up(value: usize, align: usize) -> Option<usize> {
    if align == 0 {
        return Some(value);
    }
    match value % align {
        0 => Some(value),
        rem => value.checked_add(align - rem),
    }
}

fn kib_to_units(kib: usize, unit: usize) -> Option<usize> {
    kib.checked_mul(KIB).and_then(|bytes| checked_round_up(bytes, unit))
}

/// Requested size of one region and its guard zone, in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRequest {
    /// Region size in KiB.
    pub size_kib: usize,
    /// Guard-zone size in KiB.
    pub zone_kib: usize,
}

/// Everything the planner needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutRequest {
    /// Heap request (ignored when `external_heap` is set).
    pub heap: RegionRequest,
    /// Det-stack request.
    pub det_stack: RegionRequest,
    /// Nondet-stack request.
    pub nondet_stack: RegionRequest,
    /// OS page size in bytes.
    pub page_size: usize,
    /// Primary cache size in bytes.
    pub cache_size: usize,
    /// Cache offset of the register storage (`address % cache_size`).
    pub register_offset: usize,
    /// Heap management is delegated to an external collector.
    pub external_heap: bool,
}

/// Planned placement of one region, as offsets from the arena base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPlan {
    /// Which region.
    pub kind: RegionKind,
    /// Whether the region occupies arena space at all.
    pub present: bool,
    /// Offset of `base`.
    pub base: usize,
    /// Cache pad between `base` and `min`.
    pub cache_offset: usize,
    /// Offset of `end`.
    pub end: usize,
    /// Rounded region size (without the extra unit).
    pub size: usize,
    /// Effective guard-zone size; zero means no zone.
    pub zone_size: usize,
}

impl RegionPlan {
    fn absent(kind: RegionKind) -> Self {
        Self {
            kind,
            present: false,
            base: 0,
            cache_offset: 0,
            end: 0,
            size: 0,
            zone_size: 0,
        }
    }

    /// Offset of `min`.
    pub fn min(&self) -> usize {
        self.base + self.cache_offset
    }

    /// Offset at which the guard zone starts.
    pub fn zone_start(&self) -> usize {
        self.end - self.zone_size
    }
}

/// The planner's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPlan {
    /// Rounding granularity: `max(page_size, cache_size)`.
    pub unit: usize,
    /// OS page size.
    pub page_size: usize,
    /// Primary cache size.
    pub cache_size: usize,
    /// Cache offset of the register storage.
    pub register_offset: usize,
    /// Bytes to reserve for the arena.
    pub total_size: usize,
    /// Heap, det-stack, nondet-stack.
    pub regions: [RegionPlan; 3],
}

impl LayoutPlan {
    /// Compute the layout. Sizes are rounded and zones clamped.
    ///
    /// The only failure is a request whose arena would not fit in the
    /// address space, reported as an allocation failure.
    pub fn plan(request: &LayoutRequest) -> MemoryResult<Self> {
        let too_large = || MemoryError::Allocation {
            step: "layout",
            source: Errno::ENOMEM,
        };

        let cache_size = request.cache_size.max(1);
        let unit = request.page_size.max(cache_size);

        let sanitize = |req: RegionRequest| -> MemoryResult<(usize, usize)> {
            let size = kib_to_units(req.size_kib, unit).ok_or_else(too_large)?;
            let mut zone = kib_to_units(req.zone_kib, unit).ok_or_else(too_large)?;
            if zone > 0 && zone >= size {
                zone = unit;
            }
            Ok((size, zone))
        };

        let (heap_size, heap_zone) = if request.external_heap {
            (0, 0)
        } else {
            sanitize(request.heap)?
        };
        let (det_size, det_zone) = sanitize(request.det_stack)?;
        let (nondet_size, nondet_zone) = sanitize(request.nondet_stack)?;

        // Every offset below is bounded by the total, so only the total is checked.
        let total_size = [heap_size, det_size, nondet_size, unit, unit, unit, unit]
            .into_iter()
            .try_fold(0usize, usize::checked_add)
            .ok_or_else(too_large)?;

        let register_offset = request.register_offset % cache_size;
        let quarter = cache_size / 4;
        let heap_offset = (register_offset + quarter) % cache_size;
        let det_offset = (heap_offset + quarter) % cache_size;
        let nondet_offset = (det_offset + quarter) % cache_size;

        let heap = if request.external_heap {
            RegionPlan::absent(RegionKind::Heap)
        } else {
            RegionPlan {
                kind: RegionKind::Heap,
                present: true,
                base: 0,
                cache_offset: heap_offset,
                end: heap_size + unit,
                size: heap_size,
                zone_size: heap_zone,
            }
        };

        let det_base = heap.end;
        let det_stack = RegionPlan {
            kind: RegionKind::DetStack,
            present: true,
            base: det_base,
            cache_offset: det_offset,
            end: det_base + det_size + unit,
            size: det_size,
            zone_size: det_zone,
        };

        let nondet_base = det_stack.end;
        let nondet_stack = RegionPlan {
            kind: RegionKind::NondetStack,
            present: true,
            base: nondet_base,
            cache_offset: nondet_offset,
            end: nondet_base + nondet_size + unit,
            size: nondet_size,
            zone_size: nondet_zone,
        };

        Ok(Self {
            unit,
            page_size: request.page_size,
            cache_size,
            register_offset,
            total_size,
            regions: [heap, det_stack, nondet_stack],
        })
    }

    /// Plan for one region.
    pub fn region(&self, kind: RegionKind) -> &RegionPlan {
        &self.regions[kind.index()]
    }

    /// Offset one past the last region.
    pub fn span_end(&self) -> usize {
        self.regions[RegionKind::NondetStack.index()].end
    }

    /// Turn offsets into absolute regions for an arena starting at `arena_base`.
    pub fn resolve(&self, arena_base: usize) -> [Region; 3] {
        self.regions.map(|plan| {
            if !plan.present {
                return Region::absent(plan.kind);
            }
            Region {
                kind: plan.kind,
                base: arena_base + plan.base,
                min: arena_base + plan.min(),
                end: arena_base + plan.end,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(det_kib: usize, det_zone_kib: usize) -> LayoutRequest {
        LayoutRequest {
            heap: RegionRequest { size_kib: 256, zone_kib: 16 },
            det_stack: RegionRequest { size_kib: det_kib, zone_kib: det_zone_kib },
            nondet_stack: RegionRequest { size_kib: 32, zone_kib: 8 },
            page_size: 4096,
            cache_size: 4096,
            register_offset: 0,
            external_heap: false,
        }
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(10, 0), 10);
        assert_eq!(round_up(usize::MAX - 1, 4096), usize::MAX - usize::MAX % 4096);
        assert_eq!(checked_round_up(usize::MAX - 1, 4096), None);
    }

    #[test]
    fn test_huge_sizes_are_allocation_failures() {
        let mut req = request(64, 8);
        req.heap.size_kib = usize::MAX / KIB;
        assert!(matches!(
            LayoutPlan::plan(&req),
            Err(MemoryError::Allocation { step: "layout", .. })
        ));

        let mut req = request(64, 8);
        req.nondet_stack.size_kib = usize::MAX / KIB + 1;
        assert!(LayoutPlan::plan(&req).is_err());

        let mut req = request(64, 8);
        req.det_stack.zone_kib = usize::MAX;
        assert!(LayoutPlan::plan(&req).is_err());

        // Each region fits on its own, their sum does not.
        let mut req = request(usize::MAX / KIB / 2, 8);
        req.heap.size_kib = usize::MAX / KIB / 2;
        assert!(LayoutPlan::plan(&req).is_err());
    }

    #[test]
    fn test_unit_is_max_of_page_and_cache() {
        let mut req = request(64, 8);
        req.cache_size = 8192;
        assert_eq!(LayoutPlan::plan(&req).unwrap().unit, 8192);
        req.cache_size = 1024;
        assert_eq!(LayoutPlan::plan(&req).unwrap().unit, 4096);
    }

    #[test]
    fn test_det_stack_scenario() {
        let plan = LayoutPlan::plan(&request(64, 8)).unwrap();
        let det = plan.region(RegionKind::DetStack);
        assert_eq!(plan.unit, 4096);
        assert_eq!(det.size, 64 * KIB);
        assert_eq!(det.zone_size, 8 * KIB);
        assert_eq!(det.end - det.base, 64 * KIB + 4096);
        assert_eq!(det.zone_start(), det.end - 8192);
    }

    #[test]
    fn test_zone_clamped_to_one_unit() {
        let plan = LayoutPlan::plan(&request(16, 16)).unwrap();
        assert_eq!(plan.region(RegionKind::DetStack).zone_size, plan.unit);

        let plan = LayoutPlan::plan(&request(16, 64)).unwrap();
        assert_eq!(plan.region(RegionKind::DetStack).zone_size, plan.unit);
    }

    #[test]
    fn test_zero_zone_means_no_zone() {
        let plan = LayoutPlan::plan(&request(64, 0)).unwrap();
        assert_eq!(plan.region(RegionKind::DetStack).zone_size, 0);
    }

    #[test]
    fn test_regions_are_contiguous() {
        let plan = LayoutPlan::plan(&request(64, 8)).unwrap();
        let [heap, det, nondet] = plan.regions;
        assert_eq!(heap.base, 0);
        assert_eq!(heap.end, det.base);
        assert_eq!(det.end, nondet.base);
        assert_eq!(plan.total_size, heap.size + det.size + nondet.size + 4 * plan.unit);
        assert!(plan.span_end() + plan.unit <= plan.total_size);
        for r in plan.regions {
            assert_eq!(r.end % plan.unit, 0);
            assert_eq!((r.end - r.base) % plan.unit, 0);
        }
    }

    #[test]
    fn test_cache_offsets_walk_quarters() {
        let mut req = request(64, 8);
        req.register_offset = 3 * 1024;
        let plan = LayoutPlan::plan(&req).unwrap();
        assert_eq!(plan.region(RegionKind::Heap).cache_offset, 0);
        assert_eq!(plan.region(RegionKind::DetStack).cache_offset, 1024);
        assert_eq!(plan.region(RegionKind::NondetStack).cache_offset, 2048);
    }

    #[test]
    fn test_external_heap() {
        let mut req = request(64, 8);
        req.external_heap = true;
        let plan = LayoutPlan::plan(&req).unwrap();
        let heap = plan.region(RegionKind::Heap);
        assert!(!heap.present);
        assert_eq!(heap.zone_size, 0);
        assert_eq!(plan.region(RegionKind::DetStack).base, 0);

        let regions = plan.resolve(0x10_0000);
        assert!(regions[0].is_absent());
        assert_eq!(regions[1].base, 0x10_0000);
    }

    #[test]
    fn test_resolve_offsets() {
        let plan = LayoutPlan::plan(&request(64, 8)).unwrap();
        let regions = plan.resolve(0x40_0000);
        let det = plan.region(RegionKind::DetStack);
        assert_eq!(regions[1].base, 0x40_0000 + det.base);
        assert_eq!(regions[1].min, 0x40_0000 + det.min());
        assert_eq!(regions[1].end, 0x40_0000 + det.end);
    }
}
