//! Runtime configuration (arena.toml)
//!
//! ```toml
//! [stack]
//! segment_bits = 5
//!
//! [heap]
//! nursery_bits = 13
//!
//! [profiling]
//! enabled = true
//! frequency = 100
//! stack_log = "stack_profiling.json"
//! heap_log = "heap_profiling.json"
//! ```
//!
//! Every section and field is optional; missing values fall back to
//! [`crate::defaults`].

use crate::defaults::*;
use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Segment chain settings
    #[serde(default)]
    pub stack: StackConfig,

    /// Copying heap settings (ignored by the ARC backend)
    #[serde(default)]
    pub heap: HeapConfig,

    /// Profiling hooks
    #[serde(default)]
    pub profiling: ProfilingConfig,
}

/// Segment chain settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Each segment holds `2^segment_bits` slots
    #[serde(default = "default_segment_bits")]
    pub segment_bits: u32,
}

/// Copying heap settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeapConfig {
    /// Each semispace holds `2^nursery_bits` bytes
    #[serde(default = "default_nursery_bits")]
    pub nursery_bits: u32,
}

/// Profiling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfilingConfig {
    /// Whether to emit profiling logs at all
    #[serde(default)]
    pub enabled: bool,

    /// Record every `frequency`-th event
    #[serde(default = "default_frequency")]
    pub frequency: u64,

    /// Output path of the stack samples
    #[serde(default = "default_stack_log")]
    pub stack_log: PathBuf,

    /// Output path of the heap events
    #[serde(default = "default_heap_log")]
    pub heap_log: PathBuf,
}

fn default_segment_bits() -> u32 {
    DEFAULT_SEGMENT_BITS
}

fn default_nursery_bits() -> u32 {
    DEFAULT_NURSERY_BITS
}

fn default_frequency() -> u64 {
    DEFAULT_PROFILING_FREQUENCY
}

fn default_stack_log() -> PathBuf {
    PathBuf::from(DEFAULT_STACK_LOG)
}

fn default_heap_log() -> PathBuf {
    PathBuf::from(DEFAULT_HEAP_LOG)
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            segment_bits: default_segment_bits(),
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            nursery_bits: default_nursery_bits(),
        }
    }
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: default_frequency(),
            stack_log: default_stack_log(),
            heap_log: default_heap_log(),
        }
    }
}

impl StackConfig {
    /// Number of slots per segment
    pub fn segment_len(&self) -> usize {
        1 << self.segment_bits
    }
}

impl HeapConfig {
    /// Bytes per semispace
    pub fn semispace_len(&self) -> usize {
        1 << self.nursery_bits
    }
}

impl RuntimeConfig {
    /// Parse a configuration from a file
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a configuration from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> RuntimeResult<Self> {
        let config: RuntimeConfig =
            toml::from_str(content).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration back to TOML
    pub fn to_toml(&self) -> RuntimeResult<String> {
        toml::to_string_pretty(self).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    /// Check every field against its accepted range
    pub fn validate(&self) -> RuntimeResult<()> {
        let bits = self.stack.segment_bits;
        if !(MIN_SEGMENT_BITS..=MAX_SEGMENT_BITS).contains(&bits) {
            return Err(RuntimeError::Config(format!(
                "stack.segment_bits must be in {}..={}, got {}",
                MIN_SEGMENT_BITS, MAX_SEGMENT_BITS, bits
            )));
        }

        let bits = self.heap.nursery_bits;
        if !(MIN_NURSERY_BITS..=MAX_NURSERY_BITS).contains(&bits) {
            return Err(RuntimeError::Config(format!(
                "heap.nursery_bits must be in {}..={}, got {}",
                MIN_NURSERY_BITS, MAX_NURSERY_BITS, bits
            )));
        }

        if self.profiling.frequency == 0 {
            return Err(RuntimeError::Config(
                "profiling.frequency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
