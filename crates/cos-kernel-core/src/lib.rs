//! Composite Kernel Core - Pure State Machine of the Invocation Path
//!
//! This crate contains the **pure, HAL-free** state machine behind
//! cross-domain invocation: capability-checked calls and returns, composite
//! address spaces with split/merge/subordination, per-thread invocation
//! stacks, and the scheduler-authority hierarchy.
//!
//! # Design Principles
//!
//! 1. **No HAL dependency**: page-table installs, region copies and
//!    mappings are returned as [`Effect`]s for the runtime to apply
//! 2. **Deterministic**: same state and request always produce the same
//!    result, commits and effects
//! 3. **Fail closed**: every refusal leaves the caller's frames untouched
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     cos-kernel-core                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │  KernelState  │    │ invoke / ret  │  fast path         │
//! │   │  - caps       │───▶│ step()        │  admin syscalls    │
//! │   │  - domains    │    └───────┬───────┘                   │
//! │   │  - composites │            │ StepResult                 │
//! │   │  - threads    │            ▼ {result, commits, effects} │
//! │   └───────────────┘    ┌───────────────┐                   │
//! │                        │  Invariants   │                   │
//! │                        └───────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        cos-kernel                           │
//! │   - applies effects through the HAL                         │
//! │   - CommitLog / SysLog recording                            │
//! │   - numeric syscall table                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Arena ids, page-table handles, ABI constants
//! - `arena` - Generation-checked slot arena
//! - `capability` - Static invocation capability table and `verify_trust`
//! - `domain` - Protection domain registry and virtual namespace
//! - `composite` - Composite address spaces: split, merge, subordination
//! - `invstack` - Per-thread bounded invocation stack
//! - `thread` - Threads, upcall roles and scheduler authority
//! - `state` - KernelState and the domain/thread switch primitives
//! - `invocation` - Capability invocation and return
//! - `step` - Administrative syscalls
//! - `invariants` - Runtime-checkable invariants

#![no_std]
extern crate alloc;

pub mod arena;
pub mod capability;
pub mod composite;
pub mod config;
pub mod domain;
pub mod effect;
pub mod error;
pub mod invariants;
pub mod invocation;
pub mod invstack;
pub mod refcount;
pub mod state;
pub mod step;
pub mod thread;
pub mod types;


pub use arena::{Arena, ArenaId};
pub use capability::{CapOwner, CapabilityTable, InvocationCap};
pub use composite::{AddressSpace, CompositeDomain, CompositeTable, SplitOutcome};
pub use config::{ConfigError, KernelConfig};
pub use domain::{DomainDesc, DomainRegistry, ProtectionDomain, Region, SchedControl};
pub use effect::{Effect, Journal, MeasEvent, StepResult};
pub use error::{CompositeError, ErrorClass, KernelError};
pub use invariants::{assert_invariants, check_all_invariants, InvariantViolation};
pub use invocation::{invoke, ret};
pub use invstack::{InvocationFrame, InvocationStack};
pub use refcount::RefCount;
pub use state::{KernelState, KernelStats, SharedUserData};
pub use step::{step, BrandOp, MmapOp, MpdOp, SchedOp, Syscall, SyscallResult};
pub use thread::{Activation, ExecState, SavedRegs, SchedInfo, Thread, ThreadRole};
pub use types::{CompositeId, DomainId, PageTableHandle, ThreadId};
