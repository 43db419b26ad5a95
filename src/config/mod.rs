//! Configuration for Lua environments
//!
//! Limits and collector tuning are grouped into a single [`Config`] value
//! that is fixed when a state is created. Configurations can be built in
//! code or read from a simple `directive value` file.

mod parser;

pub use parser::{parse_config_file, parse_config_str, ConfigParseError};

/// Minimum free slots guaranteed to a host function on entry
pub const MIN_STACK: usize = 20;

/// Main configuration structure for a Lua environment
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Resource limits
    pub limits: Limits,

    /// Garbage collector tuning
    pub gc: GcConfig,
}

/// Resource limits enforced by the VM
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum bytes of collectable memory (0 = unlimited)
    pub memory_limit: usize,

    /// Maximum depth of nested Lua calls
    pub call_depth: usize,

    /// Maximum depth of nested host-to-VM re-entries
    ///
    /// Every level holds interpreter frames on the Rust stack; the default
    /// fits a thread with the standard 2 MiB stack.
    pub host_call_depth: usize,

    /// Maximum number of slots in one thread's value stack
    pub stack_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            memory_limit: 0,
            call_depth: 20_000,
            host_call_depth: 100,
            stack_limit: 1_000_000,
        }
    }
}

/// Garbage collector configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Whether automatic collection is enabled
    pub enabled: bool,

    /// Percentage the heap must grow past the live size before the next cycle
    pub pause: usize,

    /// Bytes allocated before the first automatic cycle
    pub threshold: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            enabled: true,
            pause: 200,
            threshold: 256 * 1024,
        }
    }
}

impl Config {
    /// Create a configuration with a memory limit and default everything else
    pub fn with_memory_limit(limit: usize) -> Self {
        let mut config = Config::default();
        config.limits.memory_limit = limit;
        config
    }

    /// Check the configuration for values the VM cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.call_depth == 0 {
            return Err(ConfigError::Invalid("call-depth must be positive".into()));
        }
        if self.limits.host_call_depth == 0 {
            return Err(ConfigError::Invalid("host-call-depth must be positive".into()));
        }
        if self.limits.stack_limit < MIN_STACK {
            return Err(ConfigError::Invalid(format!(
                "stack-limit must be at least {}",
                MIN_STACK
            )));
        }
        if self.gc.pause < 100 {
            return Err(ConfigError::Invalid("gc-pause must be at least 100".into()));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Parse error from configuration file
    #[error("Parse error: {0}")]
    Parse(#[from] ConfigParseError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
