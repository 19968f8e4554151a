//! Kernel configuration
//!
//! Capacities of the static tables and the bounds of the invocation and
//! scheduler hierarchies. Loaded once at boot and validated by
//! [`KernelState::with_config`](crate::KernelState::with_config).

use serde::{Deserialize, Serialize};

/// Static kernel limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Entries in the static capability table
    pub max_capabilities: usize,
    /// Protection domains
    pub max_domains: usize,
    /// Composite domains, including deprecated ones still held by threads
    pub max_composites: usize,
    /// Threads
    pub max_threads: usize,
    /// Frames per invocation stack, frame 0 included
    pub max_invocation_depth: usize,
    /// Levels of the scheduler hierarchy
    pub max_sched_depth: u8,
    /// Right shift that turns a capability word into a table index
    pub cap_id_shift: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_capabilities: 1024,
            max_domains: 64,
            max_composites: 128,
            max_threads: 64,
            max_invocation_depth: 32,
            max_sched_depth: 4,
            cap_id_shift: 20,
        }
    }
}

/// Rejected configuration.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("{field} = {value} exceeds the limit of {limit}")]
    TooLarge {
        field: &'static str,
        value: usize,
        limit: usize,
    },
    #[error("invocation stack depth must allow at least one invocation")]
    StackTooShallow,
}

impl KernelConfig {
    /// Check every limit against what ids and capability words can encode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let arena_limit = u16::MAX as usize - 1;
        for (field, value) in [
            ("max_capabilities", self.max_capabilities),
            ("max_domains", self.max_domains),
            ("max_composites", self.max_composites),
            ("max_threads", self.max_threads),
            ("max_invocation_depth", self.max_invocation_depth),
            ("max_sched_depth", self.max_sched_depth as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        for (field, value) in [
            ("max_domains", self.max_domains),
            ("max_composites", self.max_composites),
            ("max_threads", self.max_threads),
        ] {
            if value > arena_limit {
                return Err(ConfigError::TooLarge {
                    field,
                    value,
                    limit: arena_limit,
                });
            }
        }
        if self.cap_id_shift >= 32 {
            return Err(ConfigError::TooLarge {
                field: "cap_id_shift",
                value: self.cap_id_shift as usize,
                limit: 31,
            });
        }
        let addressable = (u32::MAX >> self.cap_id_shift) as usize + 1;
        if self.max_capabilities > addressable {
            return Err(ConfigError::TooLarge {
                field: "max_capabilities",
                value: self.max_capabilities,
                limit: addressable,
            });
        }
        if self.max_sched_depth as usize > 16 {
            return Err(ConfigError::TooLarge {
                field: "max_sched_depth",
                value: self.max_sched_depth as usize,
                limit: 16,
            });
        }
        if self.max_invocation_depth < 2 {
            return Err(ConfigError::StackTooShallow);
        }
        Ok(())
    }
}
