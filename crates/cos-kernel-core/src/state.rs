//! Kernel state - pure data structure holding all kernel state
//!
//! This module contains the KernelState struct and the primitives every
//! entry point shares: domain registration, thread allocation, the domain
//! switch and the thread context switch. It has NO HAL dependency; hardware
//! actions are recorded in the [`Journal`].

use alloc::vec::Vec;
use cos_axiom::CommitType;

use crate::arena::{Arena, ArenaId};
use crate::capability::CapabilityTable;
use crate::composite::CompositeTable;
use crate::config::{ConfigError, KernelConfig};
use crate::domain::{DomainDesc, DomainRegistry};
use crate::effect::{Effect, Journal};
use crate::error::KernelError;
use crate::invstack::{InvocationFrame, InvocationStack};
use crate::thread::{Activation, ExecState, SchedInfo, Thread, ThreadRole};
use crate::types::{
    CompositeId, DomainId, PageTableHandle, ThreadId, INFO_REGION_ADDR, PAGE_SIZE,
};

/// Data page shared with user level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SharedUserData {
    /// Raw id of the running thread
    pub current_thread: u32,
    /// Argument region of the running thread
    pub argument_region: u64,
}

/// Counters kept alongside the measurement events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub invocations: u64,
    pub upcalls: u64,
    pub brand_upcalls: u64,
    pub switch_coop: u64,
    pub switch_preempt: u64,
    pub split_reuse: u64,
}

/// The pure kernel state - no HAL, no I/O.
pub struct KernelState {
    pub config: KernelConfig,
    pub caps: CapabilityTable,
    pub domains: DomainRegistry,
    pub composites: CompositeTable,
    pub threads: Arena<ThreadId, Thread>,
    /// Thread executing on this core
    pub current: Option<ThreadId>,
    /// Page table last installed
    pub active_page_table: Option<PageTableHandle>,
    pub user_data: SharedUserData,
    pub stats: KernelStats,
}

impl KernelState {
    /// Create an empty kernel state with the default limits.
    pub fn new() -> Self {
        Self::build(KernelConfig::default())
    }

    /// Create an empty kernel state after validating `config`.
    pub fn with_config(config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: KernelConfig) -> Self {
        Self {
            caps: CapabilityTable::new(config.max_capabilities, config.cap_id_shift),
            domains: DomainRegistry::new(config.max_domains),
            composites: CompositeTable::new(config.max_composites),
            threads: Arena::new(config.max_threads),
            current: None,
            active_page_table: None,
            user_data: SharedUserData::default(),
            stats: KernelStats::default(),
            config,
        }
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Register a protection domain in a composite of its own.
    pub fn register_domain(
        &mut self,
        desc: &DomainDesc,
        journal: &mut Journal,
    ) -> Result<DomainId, KernelError> {
        if desc.region.size == 0 || self.domains.region_taken(&desc.region) {
            return Err(KernelError::AddressOutOfRange(desc.region.base));
        }
        self.check_hierarchy(desc)?;
        if self.domains.is_full() {
            return Err(KernelError::ResourceExhausted);
        }

        let composite = self.composites.create(journal)?;
        let Some(cap_base) = self.caps.reserve_range(desc.cap_count) else {
            self.composites.deprecate(composite, journal)?;
            return Err(KernelError::ResourceExhausted);
        };
        let id = self
            .domains
            .insert(desc, composite, cap_base)
            .ok_or(KernelError::ResourceExhausted)?;
        self.composites.attach(composite, id)?;

        journal.commit(CommitType::DomainCreated {
            domain: id.to_raw(),
            composite: composite.to_raw(),
        });
        Ok(id)
    }

    /// A scheduler at depth d > 0 must name a parent scheduler at d - 1.
    fn check_hierarchy(&self, desc: &DomainDesc) -> Result<(), KernelError> {
        match (desc.sched_depth, desc.parent_sched) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(KernelError::InvalidArgument),
            (Some(d), _) if d >= self.config.max_sched_depth => Err(KernelError::InvalidArgument),
            (Some(0), None) => Ok(()),
            (Some(0), Some(_)) | (Some(_), None) => Err(KernelError::InvalidArgument),
            (Some(d), Some(parent)) => {
                let p = self
                    .domains
                    .get(parent)
                    .ok_or(KernelError::NoSuchDomain(parent))?;
                if p.sched_depth == Some(d - 1) {
                    Ok(())
                } else {
                    Err(KernelError::NotScheduler(parent))
                }
            }
        }
    }

    /// Install capability `index` of `owner`'s range.
    pub fn install_capability(
        &mut self,
        index: usize,
        owner: DomainId,
        destination: DomainId,
        entry: u64,
        journal: &mut Journal,
    ) -> Result<u32, KernelError> {
        let o = self
            .domains
            .get(owner)
            .ok_or(KernelError::NoSuchDomain(owner))?;
        if self.domains.get(destination).is_none() {
            return Err(KernelError::NoSuchDomain(destination));
        }
        if index < o.cap_base || index >= o.cap_base + o.cap_count {
            return Err(KernelError::InvalidCapability(index as u32));
        }
        self.caps.install(index, owner, destination, entry)?;
        journal.commit(CommitType::CapabilityInstalled {
            index: index as u32,
            owner: owner.to_raw(),
            destination: destination.to_raw(),
            entry,
        });
        Ok(self.caps.word_of(index))
    }

    /// Scheduler writes its shared control page.
    pub fn write_sched_page(
        &mut self,
        scheduler: DomainId,
        next_thread: u32,
        flags: u16,
    ) -> Result<(), KernelError> {
        let d = self
            .domains
            .get_mut(scheduler)
            .ok_or(KernelError::NoSuchDomain(scheduler))?;
        let page = d
            .sched_page
            .as_mut()
            .ok_or(KernelError::NotScheduler(scheduler))?;
        page.next_thread = next_thread;
        page.flags = flags;
        Ok(())
    }

    /// Start the first thread in `init` and make it current.
    pub fn boot(&mut self, init: DomainId, journal: &mut Journal) -> Result<ThreadId, KernelError> {
        if self.current.is_some() {
            return Err(KernelError::InvalidArgument);
        }
        let tid = self.alloc_thread(init, journal)?;
        if self.domains.get(init).is_some_and(|d| d.is_scheduler()) {
            self.inherit_authority(tid, init)?;
        }

        self.current = Some(tid);
        journal.effect(Effect::SwitchThreadData {
            from: 0,
            to: tid.to_raw(),
        });
        self.publish_current(tid);

        let composite = self
            .domains
            .get(init)
            .map(|d| d.composite)
            .ok_or(KernelError::NoSuchDomain(init))?;
        let pt = self
            .composites
            .resolve_page_table(composite)
            .ok_or(KernelError::Corrupted)?;
        journal.effect(Effect::InstallPageTable(pt));
        self.active_page_table = Some(pt);
        Ok(tid)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn current_thread(&self) -> Result<ThreadId, KernelError> {
        self.current.ok_or(KernelError::NoCurrentThread)
    }

    pub fn thread(&self, id: ThreadId) -> Result<&Thread, KernelError> {
        self.threads
            .get(id)
            .ok_or(KernelError::NoSuchThread(id.to_raw()))
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread, KernelError> {
        self.threads
            .get_mut(id)
            .ok_or(KernelError::NoSuchThread(id.to_raw()))
    }

    /// Composite ids of a thread's frames, base first.
    pub fn frame_chain(&self, id: ThreadId) -> Vec<u32> {
        self.threads
            .get(id)
            .map(|t| t.stack.frames().iter().map(|f| f.composite.to_raw()).collect())
            .unwrap_or_default()
    }

    /// Check that the current thread executes in `claimed`: either it is the
    /// top frame's domain or a member of the composite the thread is in.
    pub fn validate_domain_claim(&self, claimed: DomainId) -> Result<DomainId, KernelError> {
        let thread = self.thread(self.current_thread()?)?;
        let top = thread.stack.top();
        if top.domain == claimed {
            return Ok(claimed);
        }
        match self.domains.get(claimed) {
            Some(d) if d.composite == top.composite => Ok(claimed),
            _ => Err(KernelError::BadDomainClaim(claimed)),
        }
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Allocate a thread whose base frame is in `domain`.
    pub(crate) fn alloc_thread(
        &mut self,
        domain: DomainId,
        journal: &mut Journal,
    ) -> Result<ThreadId, KernelError> {
        let composite = self
            .domains
            .get(domain)
            .map(|d| d.composite)
            .ok_or(KernelError::NoSuchDomain(domain))?;
        self.composites.live(composite)?;

        let max_depth = self.config.max_invocation_depth;
        let sched_depth = self.config.max_sched_depth;
        let tid = self
            .threads
            .insert_with(|id| {
                let base = InvocationFrame::base(domain, composite);
                Thread::new(id, InvocationStack::new(base, max_depth), sched_depth)
            })
            .ok_or(KernelError::ResourceExhausted)?;
        self.composites.take(composite)?;

        journal.commit(CommitType::ThreadCreated {
            thread: tid.to_raw(),
            domain: domain.to_raw(),
        });
        Ok(tid)
    }

    /// Give `thread` the scheduler ancestry of `scheduler`: the scheduler
    /// at its own depth, its parent one level up, and so on to the root.
    pub(crate) fn inherit_authority(
        &mut self,
        thread: ThreadId,
        scheduler: DomainId,
    ) -> Result<(), KernelError> {
        let mut chain = Vec::new();
        let mut cur = Some(scheduler);
        while let Some(spd) = cur {
            let d = self.domains.get(spd).ok_or(KernelError::NoSuchDomain(spd))?;
            let depth = d.sched_depth.ok_or(KernelError::NotScheduler(spd))?;
            chain.push((depth, spd));
            cur = d.parent_sched;
        }
        let t = self.thread_mut(thread)?;
        for (depth, spd) in chain {
            if let Some(info) = t.sched.get_mut(depth as usize) {
                *info = SchedInfo {
                    scheduler: Some(spd),
                    urgency: 0,
                    notification: None,
                };
            }
        }
        Ok(())
    }

    /// Reset a thread's stack to a single base frame in `domain`, moving its
    /// composite references.
    pub(crate) fn rebase_thread(
        &mut self,
        thread: ThreadId,
        domain: DomainId,
        journal: &mut Journal,
    ) -> Result<(), KernelError> {
        let composite = self
            .domains
            .get(domain)
            .map(|d| d.composite)
            .ok_or(KernelError::NoSuchDomain(domain))?;
        self.composites.take(composite)?;
        let old = self
            .thread_mut(thread)?
            .stack
            .reset_base(InvocationFrame::base(domain, composite));
        self.release_frames(&old, journal)?;
        journal.commit(CommitType::ThreadRebased {
            thread: thread.to_raw(),
            domain: domain.to_raw(),
        });
        Ok(())
    }

    pub(crate) fn release_frames(
        &mut self,
        frames: &[InvocationFrame],
        journal: &mut Journal,
    ) -> Result<(), KernelError> {
        for frame in frames.iter().rev() {
            self.composites.release(frame.composite, journal)?;
        }
        Ok(())
    }

    // ========================================================================
    // Switch primitives
    // ========================================================================

    /// Install `to`'s address space unless `from` already resolves to it.
    pub(crate) fn switch_domain(
        &mut self,
        from: CompositeId,
        to: CompositeId,
        journal: &mut Journal,
    ) -> Result<(), KernelError> {
        let to_pt = self
            .composites
            .resolve_page_table(to)
            .ok_or(KernelError::Corrupted)?;
        if self.composites.resolve_page_table(from) != Some(to_pt) {
            journal.effect(Effect::InstallPageTable(to_pt));
        }
        self.active_page_table = Some(to_pt);
        Ok(())
    }

    /// Make `to` the running thread.
    pub(crate) fn switch_thread_context(
        &mut self,
        from: ThreadId,
        to: ThreadId,
        journal: &mut Journal,
    ) -> Result<(), KernelError> {
        let from_composite = self.thread(from)?.stack.top().composite;
        let to_composite = self.thread(to)?.stack.top().composite;

        self.current = Some(to);
        journal.effect(Effect::SwitchThreadData {
            from: from.to_raw(),
            to: to.to_raw(),
        });
        self.publish_current(to);
        self.switch_domain(from_composite, to_composite, journal)
    }

    fn publish_current(&mut self, tid: ThreadId) {
        self.user_data = SharedUserData {
            current_thread: tid.to_raw(),
            argument_region: INFO_REGION_ADDR + tid.index() as u64 * PAGE_SIZE,
        };
    }

    /// Re-install the running thread's page table if an administrative
    /// operation changed what it resolves to.
    pub(crate) fn reinstall_if_changed(&mut self, journal: &mut Journal) -> Result<(), KernelError> {
        let Some(tid) = self.current else {
            return Ok(());
        };
        let composite = self.thread(tid)?.stack.top().composite;
        let pt = self
            .composites
            .resolve_page_table(composite)
            .ok_or(KernelError::Corrupted)?;
        if self.active_page_table != Some(pt) {
            journal.effect(Effect::InstallPageTable(pt));
            self.active_page_table = Some(pt);
        }
        Ok(())
    }

    /// Retire a thread: release every frame and free its id.
    pub(crate) fn retire_thread(
        &mut self,
        id: ThreadId,
        journal: &mut Journal,
    ) -> Result<(), KernelError> {
        let thread = self
            .threads
            .remove(id)
            .ok_or(KernelError::NoSuchThread(id.to_raw()))?;
        self.release_frames(thread.stack.frames(), journal)?;
        journal.commit(CommitType::ThreadKilled {
            thread: id.to_raw(),
        });
        Ok(())
    }

    /// Threads preempted by an active upcall that still expects to resume
    /// them.
    pub fn is_interrupted_thread(&self, id: ThreadId) -> bool {
        self.threads.iter().any(|(_, t)| {
            matches!(
                t.role,
                ThreadRole::Upcall {
                    activation: Activation::Active {
                        interrupted: Some(prev)
                    },
                    ..
                } if prev == id
            )
        })
    }

    /// Detach `id` from any active upcall that would resume it.
    pub(crate) fn detach_from_upcalls(&mut self, id: ThreadId) {
        for (_, t) in self.threads.iter_mut() {
            if matches!(
                t.role,
                ThreadRole::Upcall {
                    activation: Activation::Active {
                        interrupted: Some(prev)
                    },
                    ..
                } if prev == id
            ) {
                t.detach_interrupted();
            }
        }
    }

    pub fn is_faulted(&self, id: ThreadId) -> bool {
        self.threads
            .get(id)
            .is_some_and(|t| t.exec == ExecState::Faulted)
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Region;

    fn desc(base: u64) -> DomainDesc {
        DomainDesc {
            region: Region {
                base,
                size: 0x10_0000,
            },
            cap_count: 4,
            parent_sched: None,
            sched_depth: None,
            upcall_entry: base + 0x100,
            privileged: false,
        }
    }

    #[test]
    fn test_with_config_validates() {
        let bad = KernelConfig {
            max_domains: 0,
            ..KernelConfig::default()
        };
        assert!(KernelState::with_config(bad).is_err());
        assert!(KernelState::with_config(KernelConfig::default()).is_ok());
    }

    #[test]
    fn test_register_domain_gets_own_composite() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let a = state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        let b = state.register_domain(&desc(0x20_0000), &mut j).unwrap();

        let da = state.domains.get(a).unwrap();
        let db = state.domains.get(b).unwrap();
        assert_ne!(da.composite, db.composite);
        assert_eq!(da.cap_base, 0);
        assert_eq!(db.cap_base, 4);
        assert!(state
            .composites
            .get(da.composite)
            .unwrap()
            .members
            .contains(&a));
    }

    #[test]
    fn test_register_overlapping_region_refused() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        assert_eq!(
            state.register_domain(&desc(0x18_0000), &mut j),
            Err(KernelError::AddressOutOfRange(0x18_0000))
        );
    }

    #[test]
    fn test_register_child_scheduler_needs_parent_depth() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let mut root = desc(0x10_0000);
        root.sched_depth = Some(0);
        let root = state.register_domain(&root, &mut j).unwrap();

        let mut child = desc(0x20_0000);
        child.sched_depth = Some(2);
        child.parent_sched = Some(root);
        assert_eq!(
            state.register_domain(&child, &mut j),
            Err(KernelError::NotScheduler(root))
        );

        child.sched_depth = Some(1);
        assert!(state.register_domain(&child, &mut j).is_ok());
    }

    #[test]
    fn test_register_cap_exhaustion_backs_out_composite() {
        let config = KernelConfig {
            max_capabilities: 4,
            ..KernelConfig::default()
        };
        let mut state = KernelState::with_config(config).unwrap();
        let mut j = Journal::new();
        state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        assert_eq!(
            state.register_domain(&desc(0x20_0000), &mut j),
            Err(KernelError::ResourceExhausted)
        );
        assert_eq!(state.composites.len(), 1);
    }

    #[test]
    fn test_install_capability_checks_range() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let a = state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        let b = state.register_domain(&desc(0x20_0000), &mut j).unwrap();

        // Entry 5 belongs to b's range
        assert_eq!(
            state.install_capability(5, a, b, 0x1234, &mut j),
            Err(KernelError::InvalidCapability(5))
        );
        let word = state.install_capability(3, a, b, 0x1234, &mut j).unwrap();
        assert_eq!(word, 3 << 20);
    }

    #[test]
    fn test_boot_publishes_current_thread() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let a = state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        let tid = state.boot(a, &mut j).unwrap();

        assert_eq!(tid.to_raw(), 1);
        assert_eq!(state.current, Some(tid));
        assert_eq!(state.user_data.current_thread, 1);
        assert_eq!(state.user_data.argument_region, INFO_REGION_ADDR + PAGE_SIZE);
        let c = state.domains.get(a).unwrap().composite;
        assert_eq!(state.composites.ref_count(c), Some(2));
        assert_eq!(
            state.active_page_table,
            state.composites.resolve_page_table(c)
        );
        assert_eq!(state.boot(a, &mut j), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_boot_in_scheduler_inherits_authority() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let mut root = desc(0x10_0000);
        root.sched_depth = Some(0);
        let root = state.register_domain(&root, &mut j).unwrap();
        let tid = state.boot(root, &mut j).unwrap();
        assert!(state.thread(tid).unwrap().scheduled_by(root, 0));
    }

    #[test]
    fn test_domain_claim() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let a = state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        let b = state.register_domain(&desc(0x20_0000), &mut j).unwrap();
        state.boot(a, &mut j).unwrap();

        assert_eq!(state.validate_domain_claim(a), Ok(a));
        assert_eq!(
            state.validate_domain_claim(b),
            Err(KernelError::BadDomainClaim(b))
        );
    }

    #[test]
    fn test_sched_page_only_for_schedulers() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let a = state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        assert_eq!(
            state.write_sched_page(a, 1, 0),
            Err(KernelError::NotScheduler(a))
        );
    }
}
