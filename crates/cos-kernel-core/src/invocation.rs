//! Capability invocation and return
//!
//! The hot path of the kernel. `invoke` walks the capability table,
//! checks that the caller executes in the capability owner's composite,
//! switches address space and pushes a frame. `ret` pops it again, or, at
//! the base of an active upcall thread, resumes the thread the upcall
//! interrupted.

use cos_axiom::{SecurityEvent, SecurityKind};

use crate::effect::{Effect, Journal, MeasEvent, StepResult};
use crate::error::KernelError;
use crate::invstack::InvocationFrame;
use crate::state::KernelState;
use crate::step::SyscallResult;
use crate::thread::{Activation, ExecState, SavedRegs, ThreadRole};
use crate::types::ThreadId;

/// Invoke capability `cap_word` from the current thread, resuming later at
/// `sp`/`ip`.
///
/// On refusal the caller's frames are untouched and the result carries the
/// error; trust violations also leave a security event in the result.
pub fn invoke(state: &mut KernelState, cap_word: u32, sp: u64, ip: u64) -> StepResult {
    let mut journal = Journal::new();
    let result = invoke_inner(state, cap_word, sp, ip, &mut journal)
        .unwrap_or_else(SyscallResult::Err);
    journal.finish(result)
}

fn invoke_inner(
    state: &mut KernelState,
    cap_word: u32,
    sp: u64,
    ip: u64,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    let tid = state.current_thread()?;
    let thread = state.thread(tid)?;
    if thread.exec == ExecState::Faulted {
        return Err(KernelError::ThreadFaulted);
    }
    let top = *thread.stack.top();
    let stack_full = thread.stack.is_full();

    let (index, cap) = state.caps.lookup(cap_word)?;
    let entry = cap.entry;
    let (owner, dest) = cap
        .edge()
        .ok_or(KernelError::InvalidCapability(index as u32))?;
    let owner_composite = state
        .domains
        .get(owner)
        .map(|d| d.composite)
        .ok_or(KernelError::InvalidCapability(index as u32))?;
    let dest_composite = state
        .domains
        .get(dest)
        .map(|d| d.composite)
        .ok_or(KernelError::InvalidCapability(index as u32))?;

    // The owner must be where the thread executes: same composite, the
    // frame's own domain after a split, or an alias of the same address
    // space after a merge.
    let trusted = owner_composite == top.composite
        || top.domain == owner
        || state
            .composites
            .resolve_page_table(owner_composite)
            .is_some_and(|pt| state.composites.resolve_page_table(top.composite) == Some(pt));
    if !trusted {
        journal.security(SecurityEvent {
            kind: SecurityKind::TrustViolation {
                capability: index as u32,
                owner_composite: owner_composite.to_raw(),
                frame_composite: top.composite.to_raw(),
            },
            frames: state.frame_chain(tid),
        });
        return Err(KernelError::TrustViolation {
            capability: index as u32,
            owner: owner_composite,
            frame: top.composite,
        });
    }

    if stack_full {
        state.thread_mut(tid)?.fault();
        return Err(KernelError::StackOverflow);
    }

    // Committed from here on.
    if let Some(cap) = state.caps.get(index) {
        cap.count_invocation();
    }

    state.switch_domain(top.composite, dest_composite, journal)?;
    state.composites.take(dest_composite)?;
    state.thread_mut(tid)?.stack.push(InvocationFrame {
        domain: dest,
        composite: dest_composite,
        sp,
        ip,
    })?;

    state.stats.invocations += 1;
    journal.effect(Effect::Measure(MeasEvent::Invocation));

    Ok(SyscallResult::Invoked {
        entry,
        thread: tid,
        data_region: state.user_data.argument_region,
    })
}

/// Return from the current thread's top invocation.
pub fn ret(state: &mut KernelState) -> StepResult {
    let mut journal = Journal::new();
    let result = ret_inner(state, &mut journal).unwrap_or_else(SyscallResult::Err);
    journal.finish(result)
}

fn ret_inner(state: &mut KernelState, journal: &mut Journal) -> Result<SyscallResult, KernelError> {
    let tid = state.current_thread()?;
    let thread = state.thread_mut(tid)?;

    if let Some(popped) = thread.stack.pop() {
        let caller = thread.stack.top().composite;
        state.switch_domain(popped.composite, caller, journal)?;
        state.composites.release(popped.composite, journal)?;
        return Ok(SyscallResult::Returned(popped));
    }

    if thread.is_active_upcall() {
        return complete_upcall(state, tid, journal);
    }

    // Nowhere to return to.
    thread.fault();
    journal.security(SecurityEvent {
        kind: SecurityKind::ProtocolFault,
        frames: state.frame_chain(tid),
    });
    Ok(SyscallResult::Fault)
}

/// Registers an upcall thread starts with.
pub(crate) fn upcall_regs(brand: ThreadId, entry: u64) -> SavedRegs {
    SavedRegs {
        ip: entry,
        sp: 0,
        args: [brand.to_raw() as u64, 0, 0, entry],
    }
}

/// Terminal return of an active upcall thread.
fn complete_upcall(
    state: &mut KernelState,
    tid: ThreadId,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    let ThreadRole::Upcall { brand, .. } = state.thread(tid)?.role else {
        return linkage_fault(state, tid, journal);
    };
    let pending = match state.threads.get(brand).map(|b| &b.role) {
        Some(ThreadRole::Brand { upcalls, pending }) if upcalls.contains(&tid) => *pending,
        _ => return linkage_fault(state, tid, journal),
    };

    // Serve a queued upcall before giving the core back.
    if pending > 0 {
        if let Some(ThreadRole::Brand { pending, .. }) =
            state.threads.get_mut(brand).map(|b| &mut b.role)
        {
            *pending -= 1;
        }
        let domain = state.thread(tid)?.current_domain();
        let entry = state
            .domains
            .get(domain)
            .map(|d| d.upcall_entry)
            .ok_or(KernelError::NoSuchDomain(domain))?;
        let regs = upcall_regs(brand, entry);
        state.thread_mut(tid)?.regs = regs;
        state.stats.brand_upcalls += 1;
        journal.effect(Effect::Measure(MeasEvent::BrandUpcall));
        return Ok(SyscallResult::Resume {
            thread: tid,
            regs,
            preempted: false,
        });
    }

    let interrupted = match &state.thread(tid)?.role {
        ThreadRole::Upcall {
            activation: Activation::Active { interrupted },
            ..
        } => *interrupted,
        _ => return linkage_fault(state, tid, journal),
    };

    let Some(prev) = interrupted else {
        // A scheduler already resumed the interrupted thread.
        state.thread_mut(tid)?.finish_upcall()?;
        return Ok(SyscallResult::UpcallIdle { thread: tid });
    };
    if !state
        .threads
        .get(prev)
        .is_some_and(|p| p.exec == ExecState::Preempted)
    {
        return linkage_fault(state, tid, journal);
    }

    state.thread_mut(tid)?.finish_upcall()?;
    state.switch_thread_context(tid, prev, journal)?;
    let p = state.thread_mut(prev)?;
    p.resume()?;
    Ok(SyscallResult::Resume {
        thread: prev,
        regs: p.regs,
        preempted: true,
    })
}

/// Halt only the offending thread.
fn linkage_fault(
    state: &mut KernelState,
    tid: ThreadId,
    journal: &mut Journal,
) -> Result<SyscallResult, KernelError> {
    state.thread_mut(tid)?.fault();
    journal.security(SecurityEvent {
        kind: SecurityKind::UpcallLinkage,
        frames: state.frame_chain(tid),
    });
    Err(KernelError::UpcallLinkage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainDesc, Region};
    use crate::types::DomainId;

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

    /// A (caps 0..4) and B (caps 4..8) in separate composites, thread booted
    /// in A, cap 3: A -> B at 0xE000.
    fn two_domains() -> (KernelState, DomainId, DomainId, u32) {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let a = state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        let b = state.register_domain(&desc(0x20_0000), &mut j).unwrap();
        let cap = state.install_capability(3, a, b, 0xE000, &mut j).unwrap();
        state.boot(a, &mut j).unwrap();
        (state, a, b, cap)
    }

    fn composite_of(state: &KernelState, d: DomainId) -> crate::types::CompositeId {
        state.domains.get(d).unwrap().composite
    }

    #[test]
    fn test_invoke_pushes_frame_and_switches() {
        let (mut state, a, b, cap) = two_domains();
        let x = composite_of(&state, a);
        let y = composite_of(&state, b);
        let y_pt = state.composites.resolve_page_table(y).unwrap();

        let out = invoke(&mut state, cap, 0x7000, 0x1234);
        assert!(matches!(out.result, SyscallResult::Invoked { entry: 0xE000, .. }));
        assert!(out.effects.contains(&Effect::InstallPageTable(y_pt)));

        let tid = state.current.unwrap();
        let t = state.thread(tid).unwrap();
        assert_eq!(t.stack.depth(), 1);
        assert_eq!(
            *t.stack.top(),
            InvocationFrame {
                domain: b,
                composite: y,
                sp: 0x7000,
                ip: 0x1234
            }
        );
        assert_eq!(state.caps.get(3).unwrap().invocation_count(), 1);
        assert_eq!(state.composites.ref_count(y), Some(2));
        assert_eq!(state.composites.ref_count(x), Some(2));
        assert_eq!(state.stats.invocations, 1);
    }

    #[test]
    fn test_return_restores_caller() {
        let (mut state, a, b, cap) = two_domains();
        let x = composite_of(&state, a);
        let y = composite_of(&state, b);
        let x_pt = state.composites.resolve_page_table(x).unwrap();
        invoke(&mut state, cap, 0x7000, 0x1234);

        let out = ret(&mut state);
        match out.result {
            SyscallResult::Returned(frame) => {
                assert_eq!(frame.sp, 0x7000);
                assert_eq!(frame.ip, 0x1234);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out.effects.contains(&Effect::InstallPageTable(x_pt)));
        let tid = state.current.unwrap();
        assert_eq!(state.thread(tid).unwrap().stack.depth(), 0);
        assert_eq!(state.composites.ref_count(y), Some(1));
        assert_eq!(state.caps.get(3).unwrap().invocation_count(), 1);
        assert_eq!(state.active_page_table, Some(x_pt));
    }

    #[test]
    fn test_invalid_capabilities_refused() {
        let (mut state, _, _, _) = two_domains();
        for word in [0u32, 2 << 20, 6 << 20, 2000 << 20] {
            let out = invoke(&mut state, word, 0, 0);
            assert!(
                matches!(out.result, SyscallResult::Err(KernelError::InvalidCapability(_))),
                "{word:#x}"
            );
            assert!(out.effects.is_empty());
        }
        let tid = state.current.unwrap();
        assert_eq!(state.thread(tid).unwrap().stack.depth(), 0);
    }

    #[test]
    fn test_untrusted_owner_refused_and_logged() {
        let (mut state, a, b, _) = two_domains();
        let mut j = Journal::new();
        // Capability 5 is owned by B, but the thread executes in A.
        let word = state.install_capability(5, b, a, 0xF000, &mut j).unwrap();

        let out = invoke(&mut state, word, 0, 0);
        assert!(matches!(
            out.result,
            SyscallResult::Err(KernelError::TrustViolation { capability: 5, .. })
        ));
        assert_eq!(out.security.len(), 1);
        assert_eq!(
            out.security[0].frames,
            alloc::vec![composite_of(&state, a).to_raw()]
        );
        assert_eq!(state.caps.get(5).unwrap().invocation_count(), 0);
    }

    #[test]
    fn test_return_at_base_faults_thread() {
        let (mut state, _, _, _) = two_domains();
        let out = ret(&mut state);
        assert!(matches!(out.result, SyscallResult::Fault));
        assert_eq!(out.security[0].kind, SecurityKind::ProtocolFault);

        let tid = state.current.unwrap();
        assert!(state.is_faulted(tid));
        let out = invoke(&mut state, 3 << 20, 0, 0);
        assert!(matches!(
            out.result,
            SyscallResult::Err(KernelError::ThreadFaulted)
        ));
    }

    #[test]
    fn test_stack_overflow_faults_thread() {
        let mut state = KernelState::with_config(crate::config::KernelConfig {
            max_invocation_depth: 3,
            ..Default::default()
        })
        .unwrap();
        let mut j = Journal::new();
        let a = state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        // Self-capability: A -> A
        let cap = state.install_capability(0, a, a, 0x100, &mut j).unwrap();
        state.boot(a, &mut j).unwrap();

        assert!(matches!(invoke(&mut state, cap, 0, 0).result, SyscallResult::Invoked { .. }));
        assert!(matches!(invoke(&mut state, cap, 0, 0).result, SyscallResult::Invoked { .. }));
        let out = invoke(&mut state, cap, 0, 0);
        assert!(matches!(
            out.result,
            SyscallResult::Err(KernelError::StackOverflow)
        ));
        let tid = state.current.unwrap();
        assert_eq!(state.thread(tid).unwrap().stack.depth(), 2);
        assert!(state.is_faulted(tid));
    }

    #[test]
    fn test_same_composite_invocation_skips_install() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let a = state.register_domain(&desc(0x10_0000), &mut j).unwrap();
        let cap = state.install_capability(0, a, a, 0x100, &mut j).unwrap();
        state.boot(a, &mut j).unwrap();
        let before = state.active_page_table;

        let out = invoke(&mut state, cap, 0, 0);
        assert!(!out
            .effects
            .iter()
            .any(|e| matches!(e, Effect::InstallPageTable(_))));
        assert_eq!(state.active_page_table, before);
    }
}
