//! Memory Configuration
//!
//! Sizes of the execution areas and their guard zones, plus the switches
//! that select protection and fault-handling behaviour. Configuration can be
//! built programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `REDZONE_` prefix. Sizes are in KiB
//! unless noted.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `REDZONE_HEAP_SIZE` | Heap size | 4096 |
//! | `REDZONE_HEAP_ZONE_SIZE` | Heap guard-zone size | 16 |
//! | `REDZONE_DETSTACK_SIZE` | Deterministic stack size | 2048 |
//! | `REDZONE_DETSTACK_ZONE_SIZE` | Deterministic stack guard-zone size | 16 |
//! | `REDZONE_NONDSTACK_SIZE` | Nondeterministic stack size | 128 |
//! | `REDZONE_NONDSTACK_ZONE_SIZE` | Nondeterministic stack guard-zone size | 16 |
//! | `REDZONE_PCACHE_SIZE` | Primary cache size in bytes | 8192 |
//! | `REDZONE_EXTERNAL_HEAP` | Heap is managed by an external collector | false |
//! | `REDZONE_MEMDEBUG` | Print the resolved layout after initialization | false |
//! | `REDZONE_FAULT_HANDLER` | Install SIGSEGV/SIGBUS handlers | true |
//! | `REDZONE_DISABLE_PROTECTION` | Do not install guard zones | false |
//! | `REDZONE_MINIMAL_FAULTS` | Ignore fault metadata even if available | false |
//! | `REDZONE_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `REDZONE_LOG_FORMAT` | Log format (plain/json) | plain |
//!
//! # Example
//!
//! ```rust,ignore
//! use redzone_runtime::config::MemoryConfig;
//!
//! let config = MemoryConfig::builder()
//!     .det_stack(64, 8)
//!     .nondet_stack(32, 8)
//!     .diagnostics(true)
//!     .build()?;
//! ```

use std::env;

use crate::layout::RegionRequest;
use crate::log::{LogFormat, LogLevel};

/// Fault handling configuration.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Install the SIGSEGV/SIGBUS handlers.
    /// Default: true.
    pub install_handler: bool,

    /// Skip guard-zone protection even where the platform supports it.
    /// Default: false.
    pub disable_protection: bool,

    /// Treat every fault as fatal without consulting fault metadata.
    /// Default: false.
    pub minimal_faults: bool,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            install_handler: true,
            disable_protection: false,
            minimal_faults: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Output format.
    /// Default: Plain.
    pub format: LogFormat,
}

/// Complete memory subsystem configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Heap size and guard zone (ignored with `external_heap`).
    pub heap: RegionRequest,

    /// Deterministic stack size and guard zone.
    pub det_stack: RegionRequest,

    /// Nondeterministic stack size and guard zone.
    pub nondet_stack: RegionRequest,

    /// Primary cache size in bytes.
    /// Default: 8192.
    pub pcache_size: usize,

    /// Heap management is delegated to an external collector.
    /// Default: false.
    pub external_heap: bool,

    /// Print the resolved layout after initialization.
    /// Default: false.
    pub diagnostics: bool,

    /// Fault handling.
    pub faults: FaultConfig,

    /// Logging.
    pub log: LogConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap: RegionRequest { size_kib: 4096, zone_kib: 16 },
            det_stack: RegionRequest { size_kib: 2048, zone_kib: 16 },
            nondet_stack: RegionRequest { size_kib: 128, zone_kib: 16 },
            pcache_size: 8192,
            external_heap: false,
            diagnostics: false,
            faults: FaultConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Create a new builder for MemoryConfig.
    pub fn builder() -> MemoryConfigBuilder {
        MemoryConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparseable variables keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("REDZONE_HEAP_SIZE") {
            config.heap.size_kib = val;
        }
        if let Some(val) = parse_env_usize("REDZONE_HEAP_ZONE_SIZE") {
            config.heap.zone_kib = val;
        }
        if let Some(val) = parse_env_usize("REDZONE_DETSTACK_SIZE") {
            if val > 0 {
                config.det_stack.size_kib = val;
            }
        }
        if let Some(val) = parse_env_usize("REDZONE_DETSTACK_ZONE_SIZE") {
            config.det_stack.zone_kib = val;
        }
        if let Some(val) = parse_env_usize("REDZONE_NONDSTACK_SIZE") {
            if val > 0 {
                config.nondet_stack.size_kib = val;
            }
        }
        if let Some(val) = parse_env_usize("REDZONE_NONDSTACK_ZONE_SIZE") {
            config.nondet_stack.zone_kib = val;
        }
        if let Some(val) = parse_env_usize("REDZONE_PCACHE_SIZE") {
            if is_valid_cache_size(val) {
                config.pcache_size = val;
            }
        }

        if let Some(val) = parse_env_bool("REDZONE_EXTERNAL_HEAP") {
            config.external_heap = val;
        }
        if let Some(val) = parse_env_bool("REDZONE_MEMDEBUG") {
            config.diagnostics = val;
        }
        if let Some(val) = parse_env_bool("REDZONE_FAULT_HANDLER") {
            config.faults.install_handler = val;
        }
        if let Some(val) = parse_env_bool("REDZONE_DISABLE_PROTECTION") {
            config.faults.disable_protection = val;
        }
        if let Some(val) = parse_env_bool("REDZONE_MINIMAL_FAULTS") {
            config.faults.minimal_faults = val;
        }

        if let Ok(val) = env::var("REDZONE_LOG_LEVEL") {
            if let Some(level) = LogLevel::from_str(&val) {
                config.log.level = level;
            }
        }
        if let Ok(val) = env::var("REDZONE_LOG_FORMAT") {
            if let Some(format) = LogFormat::from_str(&val) {
                config.log.format = format;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.external_heap && self.heap.size_kib == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heap.size_kib".into(),
                message: "must be at least 1 unless the heap is external".into(),
            });
        }

        if self.det_stack.size_kib == 0 {
            return Err(ConfigError::InvalidValue {
                field: "det_stack.size_kib".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.nondet_stack.size_kib == 0 {
            return Err(ConfigError::InvalidValue {
                field: "nondet_stack.size_kib".into(),
                message: "must be at least 1".into(),
            });
        }

        if !is_valid_cache_size(self.pcache_size) {
            return Err(ConfigError::InvalidValue {
                field: "pcache_size".into(),
                message: "must be a power of two of at least 64 bytes".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value.
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { field, message } => {
                write!(f, "invalid configuration for '{}': {}", field, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for MemoryConfig.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigBuilder {
    config: MemoryConfig,
}

impl MemoryConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set heap size and guard-zone size in KiB.
    pub fn heap(mut self, size_kib: usize, zone_kib: usize) -> Self {
        self.config.heap = RegionRequest { size_kib, zone_kib };
        self
    }

    /// Set deterministic stack size and guard-zone size in KiB.
    pub fn det_stack(mut self, size_kib: usize, zone_kib: usize) -> Self {
        self.config.det_stack = RegionRequest { size_kib, zone_kib };
        self
    }

    /// Set nondeterministic stack size and guard-zone size in KiB.
    pub fn nondet_stack(mut self, size_kib: usize, zone_kib: usize) -> Self {
        self.config.nondet_stack = RegionRequest { size_kib, zone_kib };
        self
    }

    /// Set the primary cache size in bytes.
    pub fn pcache_size(mut self, bytes: usize) -> Self {
        self.config.pcache_size = bytes;
        self
    }

    /// Delegate heap management to an external collector.
    pub fn external_heap(mut self, enabled: bool) -> Self {
        self.config.external_heap = enabled;
        self
    }

    /// Print the layout after initialization.
    pub fn diagnostics(mut self, enabled: bool) -> Self {
        self.config.diagnostics = enabled;
        self
    }

    /// Install or skip the fault handlers.
    pub fn install_handler(mut self, enabled: bool) -> Self {
        self.config.faults.install_handler = enabled;
        self
    }

    /// Skip guard-zone protection.
    pub fn disable_protection(mut self, disabled: bool) -> Self {
        self.config.faults.disable_protection = disabled;
        self
    }

    /// Force the minimal fault tier.
    pub fn minimal_faults(mut self, enabled: bool) -> Self {
        self.config.faults.minimal_faults = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<MemoryConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> MemoryConfig {
        self.config
    }
}

fn is_valid_cache_size(bytes: usize) -> bool {
    bytes >= 64 && bytes.is_power_of_two()
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MemoryConfig::default();
        assert_eq!(config.heap, RegionRequest { size_kib: 4096, zone_kib: 16 });
        assert_eq!(config.det_stack, RegionRequest { size_kib: 2048, zone_kib: 16 });
        assert_eq!(config.nondet_stack, RegionRequest { size_kib: 128, zone_kib: 16 });
        assert_eq!(config.pcache_size, 8192);
        assert!(!config.external_heap);
        assert!(!config.diagnostics);
        assert!(config.faults.install_handler);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = MemoryConfig::builder()
            .heap(256, 8)
            .det_stack(64, 8)
            .nondet_stack(32, 4)
            .pcache_size(4096)
            .diagnostics(true)
            .install_handler(false)
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert_eq!(config.heap.size_kib, 256);
        assert_eq!(config.det_stack.zone_kib, 8);
        assert_eq!(config.nondet_stack.size_kib, 32);
        assert_eq!(config.pcache_size, 4096);
        assert!(config.diagnostics);
        assert!(!config.faults.install_handler);
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_validation_rejects_empty_stacks() {
        assert!(MemoryConfig::builder().det_stack(0, 8).build().is_err());
        assert!(MemoryConfig::builder().nondet_stack(0, 8).build().is_err());
    }

    #[test]
    fn test_external_heap_may_be_empty() {
        assert!(MemoryConfig::builder().heap(0, 0).build().is_err());
        assert!(MemoryConfig::builder().heap(0, 0).external_heap(true).build().is_ok());
    }

    #[test]
    fn test_validation_cache_size() {
        assert!(MemoryConfig::builder().pcache_size(3000).build().is_err());
        assert!(MemoryConfig::builder().pcache_size(32).build().is_err());
        assert!(MemoryConfig::builder().pcache_size(65536).build().is_ok());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "pcache_size".into(),
            message: "must be a power of two".into(),
        };
        assert!(err.to_string().contains("pcache_size"));
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("REDZONE_HEAP_SIZE");
        env::remove_var("REDZONE_PCACHE_SIZE");

        let config = MemoryConfig::from_env();
        assert_eq!(config.heap.size_kib, 4096);
        assert_eq!(config.pcache_size, 8192);
    }
}
