//! # Redzone Runtime
//!
//! Execution memory for a logic-language runtime:
//!
//! - **Arena**: one anonymous reservation carved into every region
//! - **Regions**: heap, deterministic stack and nondeterministic stack
//! - **Guard Zones**: protected region tails that trap overflow
//! - **Fault Handling**: SIGSEGV/SIGBUS handlers that cede guard zones
//!   unit by unit and terminate once a region is exhausted
//! - **Diagnostics**: a printable snapshot of the resolved layout
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        REDZONE RUNTIME                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Platform   │  │    Layout    │  │    Arena     │          │
//! │  │(platform.rs) │  │ (layout.rs)  │  │  (arena.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                  ┌──────────────────┐                           │
//! │                  │  MemoryManager   │                           │
//! │                  │   (manager.rs)   │                           │
//! │                  └──────────────────┘                           │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Guard Zones  │  │Fault Policy  │  │   Handlers   │          │
//! │  │  (zone.rs)   │  │  (fault.rs)  │  │ (handler.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use redzone_runtime::{init, MemoryConfig};
//!
//! let config = MemoryConfig::builder()
//!     .det_stack(2048, 16)
//!     .nondet_stack(128, 16)
//!     .build()
//!     .unwrap();
//!
//! let memory = init(config);
//! let sp = memory.det_stack().min;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fault;
pub mod handler;
pub mod layout;
pub mod log;
pub mod manager;
pub mod platform;
pub mod region;
pub mod zone;

// Re-exports
pub use config::{ConfigError, MemoryConfig, MemoryConfigBuilder};
pub use diagnostics::LayoutReport;
pub use error::{MemoryError, MemoryResult, EXIT_FATAL};
pub use fault::{FaultDecision, FaultPolicy, MinimalFaultPolicy, RichFaultPolicy};
pub use log::LogLevel;
pub use manager::{MemoryManager, MAX_VIRTUAL_REGISTERS};
pub use platform::{Capabilities, FaultTier};
pub use region::{Region, RegionKind, RegionOverflow, UnknownRegion};
pub use zone::{GuardZone, RelaxOutcome};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize execution memory, exiting the process on failure.
///
/// Applies the logging configuration, then builds the [`MemoryManager`].
/// Any setup error is logged and the process exits with [`EXIT_FATAL`].
pub fn init(config: MemoryConfig) -> MemoryManager {
    log::set_level(config.log.level);
    log::set_format(config.log.format);

    match MemoryManager::initialize(&config) {
        Ok(manager) => manager,
        Err(e) => {
            log::error(e.to_string());
            std::process::exit(e.exit_code());
        }
    }
}

/// Initialize execution memory from `REDZONE_*` environment variables.
///
/// See [`MemoryConfig::from_env`] for the supported variables.
pub fn init_from_env() -> MemoryManager {
    init(MemoryConfig::from_env())
}
