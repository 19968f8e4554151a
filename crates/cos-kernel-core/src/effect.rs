//! Hardware effects and the step journal
//!
//! The core never touches hardware. Every operation records what the
//! runtime must do through the HAL as an [`Effect`], in order, together
//! with the commits for the audit log.

use alloc::vec::Vec;
use cos_axiom::{CommitType, SecurityEvent};

use crate::step::SyscallResult;
use crate::types::PageTableHandle;

/// Opaque measurement counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MeasEvent {
    Invocation = 0,
    Upcall = 1,
    BrandUpcall = 2,
    SwitchCoop = 3,
    SwitchPreempt = 4,
    SplitReuse = 5,
}

/// One hardware action, applied by the runtime in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Allocate backing for a fresh, empty page table
    CreatePageTable(PageTableHandle),
    /// Release a page table's backing
    DestroyPageTable(PageTableHandle),
    /// Make a page table the active address space
    InstallPageTable(PageTableHandle),
    /// Copy the mappings of `[base, base + size)` between page tables
    CopyRegion {
        from: PageTableHandle,
        to: PageTableHandle,
        base: u64,
        size: u64,
    },
    /// Remove the mappings of `[base, base + size)`
    ClearRegion {
        page_table: PageTableHandle,
        base: u64,
        size: u64,
    },
    /// Look up backing memory `mem_id` and map it at `vaddr`
    MapPage {
        page_table: PageTableHandle,
        vaddr: u64,
        mem_id: u64,
    },
    /// Remove the translation at `vaddr`
    UnmapPage {
        page_table: PageTableHandle,
        vaddr: u64,
    },
    /// Swap the per-thread data page (raw thread ids, 0 = none)
    SwitchThreadData { from: u32, to: u32 },
    /// Bump a measurement counter
    Measure(MeasEvent),
}

/// Accumulates commits, effects and security events during one step.
#[derive(Debug, Default)]
pub struct Journal {
    pub commits: Vec<CommitType>,
    pub effects: Vec<Effect>,
    pub security: Vec<SecurityEvent>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&mut self, commit: CommitType) {
        self.commits.push(commit);
    }

    pub fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn security(&mut self, event: SecurityEvent) {
        self.security.push(event);
    }

    /// Close the journal with the step's result.
    pub fn finish(self, result: SyscallResult) -> StepResult {
        StepResult {
            result,
            commits: self.commits,
            effects: self.effects,
            security: self.security,
        }
    }
}

/// Result of a step operation.
///
/// Refused steps may still carry commits and effects: a split that backs
/// out has created and deprecated composites, and those are real.
#[derive(Debug)]
pub struct StepResult {
    /// The syscall result
    pub result: SyscallResult,
    /// Commits generated by this step
    pub commits: Vec<CommitType>,
    /// Hardware actions, in order
    pub effects: Vec<Effect>,
    /// Security events to audit
    pub security: Vec<SecurityEvent>,
}
