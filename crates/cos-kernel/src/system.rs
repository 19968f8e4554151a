//! System struct - combines the Axiom audit layer with the pure kernel state.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          SYSTEM                             │
//! │                                                             │
//! │   invoke / ret ───────────────┐        syscall(num, args)   │
//! │   (fast path, not logged)     │                │            │
//! │                               │                ▼            │
//! │                               │   ┌────────────────────┐    │
//! │                               │   │       AXIOM        │    │
//! │                               │   │  SysLog, CommitLog │    │
//! │                               │   └─────────┬──────────┘    │
//! │                               ▼             ▼               │
//! │   ┌───────────────────────────────────────────────────┐     │
//! │   │          cos-kernel-core (KernelState)            │     │
//! │   │   returns result + commits + effects + security   │     │
//! │   └─────────────────────────┬─────────────────────────┘     │
//! │                             ▼                               │
//! │   ┌───────────────────────────────────────────────────┐     │
//! │   │                      HAL                          │     │
//! │   │   page tables, mappings, data page, measurement   │     │
//! │   └───────────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Effects are applied in order even when the core refused the operation: a
//! split that backs out has still created and deprecated composites. If the
//! HAL cannot complete a mapping, the result becomes `MappingFailed` and the
//! step's commits are not recorded.

use alloc::vec::Vec;

use cos_axiom::{AxiomGateway, CommitType, SecurityEvent, SecurityKind};
use cos_hal::HAL;
use cos_kernel_core::{
    check_all_invariants, invoke, ret, step, ConfigError, DomainDesc, DomainId, Effect,
    InvariantViolation, Journal, KernelConfig, KernelError, KernelState, KernelStats, StepResult,
    SyscallResult, ThreadId,
};

use crate::syscall::decode;

/// Kernel state, audit logs and platform in one place.
pub struct System<H: HAL> {
    /// Axiom audit layer (SysLog + CommitLog)
    pub axiom: AxiomGateway,
    /// Pure kernel state
    pub state: KernelState,
    hal: H,
    boot_time: u64,
}

impl<H: HAL> System<H> {
    /// Create a new System with the default limits.
    pub fn new(hal: H) -> Self {
        let boot_time = hal.now_nanos();
        Self {
            axiom: AxiomGateway::new(boot_time),
            state: KernelState::new(),
            hal,
            boot_time,
        }
    }

    /// Create a new System after validating `config`.
    pub fn with_config(hal: H, config: KernelConfig) -> Result<Self, ConfigError> {
        let boot_time = hal.now_nanos();
        Ok(Self {
            axiom: AxiomGateway::new(boot_time),
            state: KernelState::with_config(config)?,
            hal,
            boot_time,
        })
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn uptime_nanos(&self) -> u64 {
        self.hal.now_nanos().saturating_sub(self.boot_time)
    }

    pub fn stats(&self) -> KernelStats {
        self.state.stats
    }

    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        check_all_invariants(&self.state)
    }

    // ========================================================================
    // Boot-time setup (routed through Axiom as internal commits)
    // ========================================================================

    pub fn register_domain(&mut self, desc: &DomainDesc) -> Result<DomainId, KernelError> {
        let mut journal = Journal::new();
        let result = self.state.register_domain(desc, &mut journal);
        self.settle(journal)?;
        result
    }

    /// Install capability `index` and return the word that names it.
    pub fn install_capability(
        &mut self,
        index: usize,
        owner: DomainId,
        destination: DomainId,
        entry: u64,
    ) -> Result<u32, KernelError> {
        let mut journal = Journal::new();
        let result = self
            .state
            .install_capability(index, owner, destination, entry, &mut journal);
        self.settle(journal)?;
        result
    }

    /// Start the first thread in `init`.
    pub fn boot(&mut self, init: DomainId) -> Result<ThreadId, KernelError> {
        let mut journal = Journal::new();
        let result = self.state.boot(init, &mut journal);
        self.settle(journal)?;
        result
    }

    /// What a scheduler writes to its control page before `switch_thread`.
    pub fn write_sched_page(
        &mut self,
        scheduler: DomainId,
        next_thread: u32,
        flags: u16,
    ) -> Result<(), KernelError> {
        self.state.write_sched_page(scheduler, next_thread, flags)
    }

    fn settle(&mut self, journal: Journal) -> Result<(), KernelError> {
        let timestamp = self.uptime_nanos();
        apply_effects(&self.hal, &journal.effects)?;
        for ct in journal.commits {
            self.axiom.append_internal_commit(ct, timestamp);
        }
        Ok(())
    }

    // ========================================================================
    // Invocation fast path
    // ========================================================================

    /// Invoke capability `cap_word`; the caller resumes later at `sp`/`ip`.
    pub fn invoke(&mut self, cap_word: u32, sp: u64, ip: u64) -> SyscallResult {
        let sender = self.state.user_data.current_thread;
        let out = invoke(&mut self.state, cap_word, sp, ip);
        let result = self.finish(sender, out);
        if let SyscallResult::Err(e) = &result {
            self.hal.debug_write(&alloc::format!(
                "cos: thread {} invocation of capability {:#x} refused: {}",
                sender,
                cap_word,
                e
            ));
        }
        result
    }

    /// Entry address to jump to, or 0 if the invocation was refused.
    pub fn invoke_entry(&mut self, cap_word: u32, sp: u64, ip: u64) -> u64 {
        match self.invoke(cap_word, sp, ip) {
            SyscallResult::Invoked { entry, .. } => entry,
            _ => 0,
        }
    }

    /// Return from the current thread's top invocation.
    pub fn ret(&mut self) -> SyscallResult {
        let sender = self.state.user_data.current_thread;
        let out = ret(&mut self.state);
        self.finish(sender, out)
    }

    fn finish(&mut self, sender: u32, out: StepResult) -> SyscallResult {
        let timestamp = self.uptime_nanos();
        let StepResult {
            result,
            commits,
            effects,
            security,
        } = out;

        let result = match apply_effects(&self.hal, &effects) {
            Ok(()) => {
                for ct in commits {
                    self.axiom.append_internal_commit(ct, timestamp);
                }
                result
            }
            Err(e) => SyscallResult::Err(e),
        };
        self.report(sender, security, timestamp);
        result
    }

    // ========================================================================
    // Main Syscall Entry Point - administrative syscalls flow through here
    // ========================================================================

    /// Process a numeric syscall made from domain `spd`.
    ///
    /// 1. Logs the request to SysLog
    /// 2. Decodes and executes it on the kernel state
    /// 3. Applies the effects through the HAL
    /// 4. Records commits to CommitLog
    /// 5. Logs the response and any security events
    ///
    /// Returns the value for the return register together with the rich
    /// result.
    pub fn syscall(&mut self, spd: u32, syscall_num: u32, args: [u32; 4]) -> (i64, SyscallResult) {
        let timestamp = self.uptime_nanos();
        let sender = self.state.user_data.current_thread;

        let state = &mut self.state;
        let hal = &self.hal;
        let mut rich = SyscallResult::Ok(0);
        let mut security = Vec::new();

        let (result, _commit_ids) =
            self.axiom
                .syscall(sender, syscall_num, args, timestamp, |num, args| {
                    let out = match decode(num, args) {
                        Ok(sc) => step(state, DomainId::from_raw(spd), sc),
                        Err(e) => Journal::new().finish(SyscallResult::Err(e)),
                    };
                    security = out.security;
                    let (result, commits) = match apply_effects(hal, &out.effects) {
                        Ok(()) => (out.result, out.commits),
                        Err(e) => (SyscallResult::Err(e), Vec::<CommitType>::new()),
                    };
                    let value = result.abi_value();
                    rich = result;
                    (value, commits)
                });

        match &rich {
            SyscallResult::Err(e) => self.hal.debug_write(&alloc::format!(
                "cos: syscall {} from domain {:#x} refused: {}",
                syscall_num,
                spd,
                e
            )),
            SyscallResult::Composites(list) => {
                for (domain, composite) in list {
                    self.hal
                        .debug_write(&alloc::format!("cos: {} in {}", domain, composite));
                }
            }
            _ => {}
        }
        self.report(sender, security, timestamp);
        (result, rich)
    }

    /// Log security events with the frame chain that produced them.
    fn report(&mut self, sender: u32, events: Vec<SecurityEvent>, timestamp: u64) {
        for event in events {
            let what = match &event.kind {
                SecurityKind::TrustViolation {
                    capability,
                    owner_composite,
                    frame_composite,
                } => alloc::format!(
                    "capability {} owned by composite {:#x} used from composite {:#x}",
                    capability,
                    owner_composite,
                    frame_composite
                ),
                SecurityKind::UntrustedUpcall { from, to } => alloc::format!(
                    "upcall attempted from {:#x} to {:#x} without trust relation",
                    from,
                    to
                ),
                SecurityKind::ProtocolFault => alloc::format!("return with no caller"),
                SecurityKind::UpcallLinkage => alloc::format!("inconsistent upcall linkage"),
            };
            self.hal.debug_write(&alloc::format!(
                "cos: thread {}: {}, frames {:x?}",
                sender,
                what,
                event.frames
            ));
            self.axiom.security(sender, event, timestamp);
        }
    }
}

/// Apply effects in order.
fn apply_effects<H: HAL>(hal: &H, effects: &[Effect]) -> Result<(), KernelError> {
    for effect in effects {
        match *effect {
            Effect::CreatePageTable(pt) => hal.create_page_table(pt.0),
            Effect::DestroyPageTable(pt) => hal.destroy_page_table(pt.0),
            Effect::InstallPageTable(pt) => hal.install_page_table(pt.0),
            Effect::CopyRegion {
                from,
                to,
                base,
                size,
            } => hal.copy_region(from.0, to.0, base, size),
            Effect::ClearRegion {
                page_table,
                base,
                size,
            } => hal.clear_region(page_table.0, base, size),
            Effect::MapPage {
                page_table,
                vaddr,
                mem_id,
            } => {
                let paddr = hal
                    .access_page(mem_id)
                    .ok_or(KernelError::MappingFailed)?;
                hal.pgtbl_add_entry(page_table.0, vaddr, paddr)
                    .map_err(|_| KernelError::MappingFailed)?;
            }
            Effect::UnmapPage { page_table, vaddr } => {
                hal.pgtbl_rem_entry(page_table.0, vaddr)
                    .map_err(|_| KernelError::MappingFailed)?;
            }
            Effect::SwitchThreadData { from, to } => hal.switch_thread_data_page(from, to),
            Effect::Measure(event) => hal.meas_event(event as u32),
        }
    }
    Ok(())
}
