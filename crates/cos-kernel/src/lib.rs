//! Composite Kernel
//!
//! This crate wires the pure [`cos_kernel_core`] state machine to a
//! platform:
//! - Numeric syscall decoding
//! - Effect application through the [`HAL`](cos_hal::HAL)
//! - SysLog / CommitLog recording through the Axiom gateway
//! - `cos:` debug output for refused operations

#![no_std]
extern crate alloc;

pub mod syscall;
pub mod system;

pub use system::System;

// Re-export HAL types
pub use cos_hal::{HalError, HAL as HalTrait};

// Re-export Axiom types
pub use cos_axiom::{
    AxiomGateway, Commit, CommitId, CommitLog, CommitType, SecurityEvent, SecurityKind, SysEvent,
    SysEventType, SysLog,
};

// Re-export the core
pub use cos_kernel_core::{
    CompositeId, DomainDesc, DomainId, Effect, InvariantViolation, KernelConfig, KernelError,
    KernelState, KernelStats, MeasEvent, Region, SavedRegs, SyscallResult, ThreadId,
};
pub use cos_kernel_core::types::{SCHED_EXCL_YIELD, SCHED_RETURN};
