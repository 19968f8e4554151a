//! Administrative syscalls
//!
//! Everything except the invocation fast path goes through [`step`]: thread
//! creation and switching under scheduler authority, brands and upcalls,
//! composite split/merge, and mapping control. Every handler validates the
//! domain the caller claims to execute in before touching state.

use alloc::vec::Vec;

use cos_axiom::{CommitType, SecurityEvent, SecurityKind};

use crate::composite::SplitOutcome;
use crate::effect::{Effect, Journal, MeasEvent, StepResult};
use crate::error::KernelError;
use crate::invocation::upcall_regs;
use crate::invstack::InvocationFrame;
use crate::state::KernelState;
use crate::thread::{Activation, ExecState, SavedRegs, SchedInfo, ThreadRole};
use crate::types::{CompositeId, DomainId, ThreadId, SCHED_EXCL_YIELD, SCHED_RETURN};

// ============================================================================
// Syscall definitions
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedOp {
    /// Register a notification address inside the scheduler's region
    EventRegion,
    /// Hand a thread to a child scheduler
    Grant,
    /// Take a thread back from a child scheduler
    Revoke,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrandOp {
    /// Snapshot the caller's invocation stack into a new brand thread
    Create,
    /// Attach a new upcall thread to a brand
    AddThread,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpdOp {
    Split,
    Merge,
    /// Split and merge in one step; refused
    SplitMerge,
    /// List every domain with its composite
    Debug,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmapOp {
    Grant,
    Revoke,
}

/// Syscall variants, decoded from the numeric interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Unused slot
    Void,
    /// Deprecated resume-return path
    ResumeReturn,
    GetThreadId,
    CreateThread {
        stack: u64,
        entry: u64,
        data: u64,
    },
    /// Switch to the thread named in the scheduler's control page
    SwitchThread,
    Kill {
        thread: ThreadId,
    },
    BrandUpcall {
        brand: ThreadId,
    },
    BrandCntl {
        op: BrandOp,
        thread: ThreadId,
    },
    Upcall {
        dest: DomainId,
    },
    SchedCntl {
        op: SchedOp,
        thread: ThreadId,
        option: u32,
    },
    MpdCntl {
        op: MpdOp,
        composite: CompositeId,
        domain: DomainId,
        dest: CompositeId,
    },
    MmapCntl {
        op: MmapOp,
        domain: DomainId,
        vaddr: u64,
        mem_id: u64,
    },
}

// ============================================================================
// Syscall results
// ============================================================================

/// What the kernel hands back to the runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyscallResult {
    /// Success with value
    Ok(u64),
    /// Capability invocation: jump to `entry` in the destination
    Invoked {
        entry: u64,
        thread: ThreadId,
        data_region: u64,
    },
    /// Return: resume the caller at the popped frame's `sp`/`ip`
    Returned(InvocationFrame),
    /// Run `thread` with `regs`. `preempted` if it had been interrupted.
    Resume {
        thread: ThreadId,
        regs: SavedRegs,
        preempted: bool,
    },
    /// Thread rebased into a new domain at `entry`
    Upcall { thread: ThreadId, entry: u64 },
    Split(SplitOutcome),
    Composites(Vec<(DomainId, CompositeId)>),
    /// Upcall thread finished with nothing to resume; the runtime picks the
    /// next thread
    UpcallIdle { thread: ThreadId },
    /// Unrecoverable protocol error; the thread is halted
    Fault,
    Err(KernelError),
}

impl SyscallResult {
    /// Value of the numeric return register.
    pub fn abi_value(&self) -> i64 {
        match self {
            SyscallResult::Ok(v) => *v as i64,
            SyscallResult::Invoked { entry, .. } => *entry as i64,
            SyscallResult::Returned(_) => 0,
            SyscallResult::Resume { preempted, .. } => *preempted as i64,
            SyscallResult::Upcall { thread, .. } => thread.to_raw() as i64,
            SyscallResult::Split(o) => {
                ((o.split.to_raw() as i64) << 32) | o.remainder.to_raw() as i64
            }
            SyscallResult::Composites(list) => list.len() as i64,
            SyscallResult::UpcallIdle { .. } => 0,
            SyscallResult::Fault => KernelError::ProtocolFault.errno(),
            SyscallResult::Err(e) => e.errno(),
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, SyscallResult::Err(_) | SyscallResult::Fault)
    }
}

// ============================================================================
// The step function
// ============================================================================

/// Execute an administrative syscall made from `caller`.
///
/// `caller` is the domain the thread claims to execute in. Refusals leave
/// the current thread and its frames as they were.
pub fn step(state: &mut KernelState, caller: DomainId, syscall: Syscall) -> StepResult {
    let mut journal = Journal::new();
    let result = dispatch(state, caller, syscall, &mut journal).unwrap_or_else(SyscallResult::Err);
    journal.finish(result)
}

fn dispatch(
    state: &mut KernelState,
    caller: DomainId,
    syscall: Syscall,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    let spd = match syscall {
        Syscall::Void => return Ok(SyscallResult::Ok(0)),
        Syscall::ResumeReturn => return Err(KernelError::NotSupported),
        Syscall::GetThreadId => {
            return Ok(SyscallResult::Ok(state.current_thread()?.to_raw() as u64));
        }
        _ => state.validate_domain_claim(caller)?,
    };

    match syscall {
        Syscall::CreateThread { stack, entry, data } => {
            step_create_thread(state, spd, stack, entry, data, journal)
        }
        Syscall::SwitchThread => step_switch_thread(state, spd, journal),
        Syscall::Kill { thread } => step_kill(state, spd, thread, journal),
        Syscall::BrandUpcall { brand } => step_brand_upcall(state, spd, brand, journal),
        Syscall::BrandCntl { op, thread } => step_brand_cntl(state, spd, op, thread, journal),
        Syscall::Upcall { dest } => step_upcall(state, spd, dest, journal),
        Syscall::SchedCntl { op, thread, option } => {
            step_sched_cntl(state, spd, op, thread, option, journal)
        }
        Syscall::MpdCntl {
            op,
            composite,
            domain,
            dest,
        } => step_mpd_cntl(state, spd, op, composite, domain, dest, journal),
        Syscall::MmapCntl {
            op,
            domain,
            vaddr,
            mem_id,
        } => step_mmap_cntl(state, spd, op, domain, vaddr, mem_id, journal),
        // Answered above without a domain claim.
        Syscall::Void | Syscall::ResumeReturn | Syscall::GetThreadId => Ok(SyscallResult::Ok(0)),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn scheduler_depth(state: &KernelState, spd: DomainId) -> Result<u8, KernelError> {
    state
        .domains
        .get(spd)
        .ok_or(KernelError::NoSuchDomain(spd))?
        .sched_depth
        .ok_or(KernelError::NotScheduler(spd))
}

/// `spd` must be a scheduler with authority over the running thread.
fn current_under(state: &KernelState, spd: DomainId) -> Result<(ThreadId, u8), KernelError> {
    let depth = scheduler_depth(state, spd)?;
    let curr = state.current_thread()?;
    if !state.thread(curr)?.scheduled_by(spd, depth) {
        return Err(KernelError::Unauthorized(spd));
    }
    Ok((curr, depth))
}

fn require_privileged(state: &KernelState, spd: DomainId) -> Result<(), KernelError> {
    match state.domains.get(spd) {
        Some(d) if d.privileged => Ok(()),
        Some(_) => Err(KernelError::Unauthorized(spd)),
        None => Err(KernelError::NoSuchDomain(spd)),
    }
}

// ============================================================================
// Threads and scheduling
// ============================================================================

fn step_create_thread(
    state: &mut KernelState,
    spd: DomainId,
    stack: u64,
    entry: u64,
    data: u64,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    current_under(state, spd)?;

    let tid = state.alloc_thread(spd, journal)?;
    state.inherit_authority(tid, spd)?;
    state.thread_mut(tid)?.regs = SavedRegs {
        ip: entry,
        sp: stack,
        args: [data, 0, 0, 0],
    };
    Ok(SyscallResult::Ok(tid.to_raw() as u64))
}

fn step_switch_thread(
    state: &mut KernelState,
    spd: DomainId,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    let page = state
        .domains
        .get(spd)
        .ok_or(KernelError::NoSuchDomain(spd))?
        .sched_page
        .ok_or(KernelError::NotScheduler(spd))?;
    if page.flags & SCHED_RETURN != 0 {
        return Err(KernelError::NotSupported);
    }
    let (curr, depth) = current_under(state, spd)?;

    let next = ThreadId::from_raw(page.next_thread);
    if next == curr {
        return Err(KernelError::InvalidArgument);
    }
    let target = state.thread(next)?;
    if !target.scheduled_by(spd, depth) {
        return Err(KernelError::Unauthorized(spd));
    }
    if target.exec == ExecState::Faulted {
        return Err(KernelError::ThreadFaulted);
    }
    if target.sched_exclusive {
        // Only the scheduler that suspended it, or an ancestor, may resume.
        if let Some(suspender) = target.sched_suspended {
            let suspender_depth = scheduler_depth(state, suspender)?;
            if depth > suspender_depth {
                return Err(KernelError::Unauthorized(spd));
            }
        }
    }

    {
        let c = state.thread_mut(curr)?;
        c.sched_suspended = Some(spd);
        if page.flags & SCHED_EXCL_YIELD != 0 {
            c.sched_exclusive = true;
        }
    }
    {
        let n = state.thread_mut(next)?;
        n.sched_exclusive = false;
        n.sched_suspended = None;
    }
    state.switch_thread_context(curr, next, journal)?;

    let preempted = state.thread_mut(next)?.resume()?;
    if preempted {
        // The scheduler resumed it; the upcall must not resume it again.
        state.detach_from_upcalls(next);
        state.stats.switch_preempt += 1;
        journal.effect(Effect::Measure(MeasEvent::SwitchPreempt));
    } else {
        state.stats.switch_coop += 1;
        journal.effect(Effect::Measure(MeasEvent::SwitchCoop));
    }

    Ok(SyscallResult::Resume {
        thread: next,
        regs: state.thread(next)?.regs,
        preempted,
    })
}

fn step_kill(
    state: &mut KernelState,
    spd: DomainId,
    target: ThreadId,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    let (curr, depth) = current_under(state, spd)?;
    let t = state.thread(target)?;
    if !t.scheduled_by(spd, depth) {
        return Err(KernelError::Unauthorized(spd));
    }

    let busy_brand = matches!(&t.role, ThreadRole::Brand { upcalls, .. } if !upcalls.is_empty());
    if target == curr || t.is_active_upcall() || busy_brand || state.is_interrupted_thread(target)
    {
        return Err(KernelError::NotSupported);
    }
    let brand_of = match t.role {
        ThreadRole::Upcall { brand, .. } => Some(brand),
        _ => None,
    };

    if let Some(brand) = brand_of {
        if let Some(ThreadRole::Brand { upcalls, .. }) =
            state.threads.get_mut(brand).map(|b| &mut b.role)
        {
            upcalls.retain(|&u| u != target);
        }
    }
    state.retire_thread(target, journal)?;
    Ok(SyscallResult::Ok(0))
}

// ============================================================================
// Brands and upcalls
// ============================================================================

fn step_brand_cntl(
    state: &mut KernelState,
    spd: DomainId,
    op: BrandOp,
    thread: ThreadId,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    match op {
        BrandOp::Create => {
            let curr = state.current_thread()?;
            let (stack, sched) = {
                let c = state.thread(curr)?;
                (c.stack.clone(), c.sched.clone())
            };
            let frames = stack.frames().len() as u32;

            let brand = state.alloc_thread(spd, journal)?;
            for frame in stack.frames() {
                state.composites.take(frame.composite)?;
            }
            let old = {
                let b = state.thread_mut(brand)?;
                b.sched = sched;
                b.role = ThreadRole::Brand {
                    upcalls: Vec::new(),
                    pending: 0,
                };
                core::mem::replace(&mut b.stack, stack)
            };
            state.release_frames(old.frames(), journal)?;

            journal.commit(CommitType::BrandCreated {
                brand: brand.to_raw(),
                frames,
            });
            Ok(SyscallResult::Ok(brand.to_raw() as u64))
        }
        BrandOp::AddThread => {
            let b = state.thread(thread)?;
            if !matches!(b.role, ThreadRole::Brand { .. }) {
                return Err(KernelError::InvalidArgument);
            }
            if b.current_domain() != spd {
                return Err(KernelError::Unauthorized(spd));
            }
            let brand_depth = b.stack.depth();
            let sched = b.sched.clone();

            let tid = state.alloc_thread(spd, journal)?;
            {
                let u = state.thread_mut(tid)?;
                u.sched = sched;
                u.role = ThreadRole::Upcall {
                    brand: thread,
                    brand_depth,
                    activation: Activation::Ready,
                };
            }
            if let ThreadRole::Brand { upcalls, .. } = &mut state.thread_mut(thread)?.role {
                upcalls.push(tid);
            }

            journal.commit(CommitType::UpcallThreadAdded {
                thread: tid.to_raw(),
                brand: thread.to_raw(),
            });
            Ok(SyscallResult::Ok(tid.to_raw() as u64))
        }
    }
}

fn step_brand_upcall(
    state: &mut KernelState,
    spd: DomainId,
    brand: ThreadId,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    let curr = state.current_thread()?;
    let b = state.thread(brand)?;
    let ThreadRole::Brand { upcalls, .. } = &b.role else {
        return Err(KernelError::InvalidArgument);
    };
    if b.current_domain() != spd {
        return Err(KernelError::Unauthorized(spd));
    }
    // The upcall runs in the domain that invoked the brand's owner.
    let dest = b
        .stack
        .nth_from_top(2)
        .ok_or(KernelError::BrandAncestry)?
        .domain;
    if upcalls.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    // An idle upcall thread of this brand cannot interrupt itself. An active
    // one raising its brand again only queues work below.
    if upcalls.contains(&curr) && !state.thread(curr)?.is_active_upcall() {
        return Err(KernelError::UpcallLinkage);
    }
    let ready = upcalls.iter().copied().find(|&u| {
        u != curr
            && state.threads.get(u).is_some_and(|t| {
                matches!(
                    t.role,
                    ThreadRole::Upcall {
                        activation: Activation::Ready,
                        ..
                    }
                )
            })
    });

    let Some(upcall) = ready else {
        // Every upcall thread is busy; the next terminal return serves it.
        let b = state.thread_mut(brand)?;
        let ThreadRole::Brand { pending, .. } = &mut b.role else {
            return Err(KernelError::Corrupted);
        };
        *pending += 1;
        return Ok(SyscallResult::Ok(*pending as u64));
    };

    let entry = state
        .domains
        .get(dest)
        .map(|d| d.upcall_entry)
        .ok_or(KernelError::NoSuchDomain(dest))?;
    if state.thread(curr)?.exec != ExecState::Runnable {
        return Err(KernelError::ThreadFaulted);
    }

    state.thread_mut(upcall)?.activate_upcall(curr)?;
    state.thread_mut(curr)?.preempt()?;
    state.rebase_thread(upcall, dest, journal)?;
    let regs = upcall_regs(brand, entry);
    state.thread_mut(upcall)?.regs = regs;
    state.switch_thread_context(curr, upcall, journal)?;

    state.stats.brand_upcalls += 1;
    journal.effect(Effect::Measure(MeasEvent::BrandUpcall));
    Ok(SyscallResult::Resume {
        thread: upcall,
        regs,
        preempted: false,
    })
}

fn step_upcall(
    state: &mut KernelState,
    spd: DomainId,
    dest: DomainId,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    let curr = state.current_thread()?;
    let d = state
        .domains
        .get(dest)
        .ok_or(KernelError::NoSuchDomain(dest))?;
    if !state.caps.verify_trust(d.cap_base, d.cap_count, spd) {
        journal.security(SecurityEvent {
            kind: SecurityKind::UntrustedUpcall {
                from: spd.to_raw(),
                to: dest.to_raw(),
            },
            frames: state.frame_chain(curr),
        });
        return Err(KernelError::UntrustedUpcall { from: spd, to: dest });
    }
    let entry = d.upcall_entry;
    let (parent, child_depth) = (d.parent_sched, d.sched_depth);

    // A parent scheduler upcalling into its child hands the thread down,
    // unless another child already holds it.
    if parent == Some(spd) {
        if let (Some(depth), Some(cd)) = (scheduler_depth(state, spd).ok(), child_depth) {
            let t = state.thread_mut(curr)?;
            let slot_free = t.sched.get(cd as usize).is_some_and(|i| i.scheduler.is_none());
            if cd == depth + 1 && t.scheduled_by(spd, depth) && slot_free {
                t.sched[cd as usize] = SchedInfo {
                    scheduler: Some(dest),
                    urgency: 0,
                    notification: None,
                };
                journal.commit(CommitType::AuthorityGranted {
                    thread: curr.to_raw(),
                    scheduler: dest.to_raw(),
                    depth: cd,
                });
            }
        }
    }

    let from = state.thread(curr)?.stack.top().composite;
    let to = state
        .domains
        .get(dest)
        .map(|d| d.composite)
        .ok_or(KernelError::NoSuchDomain(dest))?;
    state.switch_domain(from, to, journal)?;
    state.rebase_thread(curr, dest, journal)?;

    state.stats.upcalls += 1;
    journal.effect(Effect::Measure(MeasEvent::Upcall));
    Ok(SyscallResult::Upcall {
        thread: curr,
        entry,
    })
}

fn step_sched_cntl(
    state: &mut KernelState,
    spd: DomainId,
    op: SchedOp,
    thread: ThreadId,
    option: u32,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    let (_, depth) = current_under(state, spd)?;
    if !state.thread(thread)?.scheduled_by(spd, depth) {
        return Err(KernelError::Unauthorized(spd));
    }

    if op == SchedOp::EventRegion {
        let addr = option as u64;
        let region = state
            .domains
            .get(spd)
            .map(|d| d.region)
            .ok_or(KernelError::NoSuchDomain(spd))?;
        if !region.contains(addr) {
            return Err(KernelError::AddressOutOfRange(addr));
        }
        if let Some(info) = state.thread_mut(thread)?.sched.get_mut(depth as usize) {
            info.notification = Some(addr);
        }
        return Ok(SyscallResult::Ok(0));
    }

    let child = DomainId::from_raw(option);
    let c = state
        .domains
        .get(child)
        .ok_or(KernelError::NoSuchDomain(child))?;
    if c.parent_sched != Some(spd) {
        return Err(KernelError::Unauthorized(spd));
    }
    let child_depth = c.sched_depth.ok_or(KernelError::NotScheduler(child))?;
    let t = state.thread_mut(thread)?;
    let slot = t
        .sched
        .get_mut(child_depth as usize)
        .ok_or(KernelError::InvalidArgument)?;

    match op {
        SchedOp::Grant => {
            *slot = SchedInfo {
                scheduler: Some(child),
                urgency: 0,
                notification: None,
            };
            t.clear_authority_from(child_depth as usize + 1);
            journal.commit(CommitType::AuthorityGranted {
                thread: thread.to_raw(),
                scheduler: child.to_raw(),
                depth: child_depth,
            });
        }
        SchedOp::Revoke => {
            if slot.scheduler != Some(child) {
                return Err(KernelError::InvalidArgument);
            }
            t.clear_authority_from(child_depth as usize);
            journal.commit(CommitType::AuthorityRevoked {
                thread: thread.to_raw(),
                depth: child_depth,
            });
        }
        SchedOp::EventRegion => {}
    }
    Ok(SyscallResult::Ok(0))
}

// ============================================================================
// Composite and mapping control
// ============================================================================

fn step_mpd_cntl(
    state: &mut KernelState,
    spd: DomainId,
    op: MpdOp,
    composite: CompositeId,
    domain: DomainId,
    dest: CompositeId,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    require_privileged(state, spd)?;

    match op {
        MpdOp::Split => {
            let outcome = state
                .composites
                .split(&mut state.domains, composite, domain, journal)?;
            if outcome.reused {
                state.stats.split_reuse += 1;
            }
            state.reinstall_if_changed(journal)?;
            Ok(SyscallResult::Split(outcome))
        }
        MpdOp::Merge => {
            let survivor = state
                .composites
                .merge(&mut state.domains, composite, dest, journal)?;
            state.reinstall_if_changed(journal)?;
            Ok(SyscallResult::Ok(survivor.to_raw() as u64))
        }
        MpdOp::SplitMerge => Err(KernelError::NotSupported),
        MpdOp::Debug => Ok(SyscallResult::Composites(
            state
                .domains
                .iter()
                .map(|(id, d)| (id, d.composite))
                .collect(),
        )),
    }
}

fn step_mmap_cntl(
    state: &mut KernelState,
    spd: DomainId,
    op: MmapOp,
    domain: DomainId,
    vaddr: u64,
    mem_id: u64,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    require_privileged(state, spd)?;
    let composite = state
        .domains
        .get(domain)
        .map(|d| d.composite)
        .ok_or(KernelError::NoSuchDomain(domain))?;
    if state.domains.virtual_namespace_query(vaddr) != Some(domain) {
        return Err(KernelError::AddressOutOfRange(vaddr));
    }
    let page_table = state
        .composites
        .resolve_page_table(composite)
        .ok_or(KernelError::Corrupted)?;

    match op {
        MmapOp::Grant => {
            journal.effect(Effect::MapPage {
                page_table,
                vaddr,
                mem_id,
            });
            journal.commit(CommitType::PageMapped {
                domain: domain.to_raw(),
                vaddr,
                mem_id,
            });
        }
        MmapOp::Revoke => {
            journal.effect(Effect::UnmapPage { page_table, vaddr });
            journal.commit(CommitType::PageUnmapped {
                domain: domain.to_raw(),
                vaddr,
            });
        }
    }
    Ok(SyscallResult::Ok(0))
}
