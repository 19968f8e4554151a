//! Runtime-checkable kernel invariants
//!
//! Used by the tests after every interesting sequence and by the Kani
//! harnesses below.
//!
//! # Invariants
//!
//! 1. **Membership consistency**: a domain's composite lists it as a member,
//!    and every member points back at its composite
//! 2. **Composite liveness**: live composites have members, deprecated ones
//!    have none
//! 3. **Refcount conservation**: a composite's count is its structural
//!    reference (while live) plus the frames naming it plus the subordinates
//!    aliased onto it
//! 4. **Chain termination**: every composite resolves to a page table
//! 5. **Frame validity**: every frame names an existing domain and composite
//! 6. **Authority prefix**: depth `i` of a thread's authority names a
//!    scheduler at depth `i` whose parent is at `i - 1`, with no holes
//! 7. **Upcall linkage**: upcall threads are listed by their brand and only
//!    interrupt preempted threads
//! 8. **Current thread**: exists and is not preempted

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::composite::AddressSpace;
use crate::state::KernelState;
use crate::thread::{Activation, ExecState, ThreadRole};
use crate::types::CompositeId;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

fn violation(invariant: &'static str, description: String) -> InvariantViolation {
    InvariantViolation {
        invariant,
        description,
    }
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_membership(state));
    violations.extend(check_composite_liveness(state));
    violations.extend(check_refcount_conservation(state));
    violations.extend(check_chain_termination(state));
    violations.extend(check_frame_validity(state));
    violations.extend(check_authority_prefix(state));
    violations.extend(check_upcall_linkage(state));
    violations.extend(check_current_thread(state));

    violations
}

fn check_membership(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, d) in state.domains.iter() {
        match state.composites.get(d.composite) {
            Some(c) if c.members.contains(&id) => {}
            Some(_) => violations.push(violation(
                "membership",
                alloc::format!("{} not listed by its composite {}", id, d.composite),
            )),
            None => violations.push(violation(
                "membership",
                alloc::format!("{} points at missing composite {}", id, d.composite),
            )),
        }
    }

    for (cid, c) in state.composites.iter() {
        for member in &c.members {
            if state.domains.get(*member).map(|d| d.composite) != Some(cid) {
                violations.push(violation(
                    "membership",
                    alloc::format!("{} lists {} which points elsewhere", cid, member),
                ));
            }
        }
    }

    violations
}

fn check_composite_liveness(state: &KernelState) -> Vec<InvariantViolation> {
    state
        .composites
        .iter()
        .filter(|(_, c)| c.deprecated != c.members.is_empty())
        .map(|(cid, c)| {
            violation(
                "composite_liveness",
                alloc::format!(
                    "{} deprecated={} with {} members",
                    cid,
                    c.deprecated,
                    c.members.len()
                ),
            )
        })
        .collect()
}

fn check_refcount_conservation(state: &KernelState) -> Vec<InvariantViolation> {
    let mut expected: BTreeMap<CompositeId, u32> = BTreeMap::new();

    for (cid, c) in state.composites.iter() {
        *expected.entry(cid).or_default() += u32::from(!c.deprecated);
        if let AddressSpace::Subordinate { target, .. } = c.space {
            *expected.entry(target).or_default() += 1;
        }
    }
    for (_, t) in state.threads.iter() {
        for frame in t.stack.frames() {
            *expected.entry(frame.composite).or_default() += 1;
        }
    }

    let mut violations = Vec::new();
    for (cid, want) in expected {
        let have = state.composites.ref_count(cid);
        if have != Some(want) {
            violations.push(violation(
                "refcount_conservation",
                alloc::format!("{} holds {:?} references, expected {}", cid, have, want),
            ));
        }
    }
    violations
}

fn check_chain_termination(state: &KernelState) -> Vec<InvariantViolation> {
    state
        .composites
        .iter()
        .filter(|(cid, _)| state.composites.resolve_page_table(*cid).is_none())
        .map(|(cid, _)| {
            violation(
                "chain_termination",
                alloc::format!("{} does not resolve to a page table", cid),
            )
        })
        .collect()
}

fn check_frame_validity(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (tid, t) in state.threads.iter() {
        for (i, frame) in t.stack.frames().iter().enumerate() {
            if state.domains.get(frame.domain).is_none()
                || state.composites.get(frame.composite).is_none()
            {
                violations.push(violation(
                    "frame_validity",
                    alloc::format!(
                        "{} frame {} names {} in {}",
                        tid,
                        i,
                        frame.domain,
                        frame.composite
                    ),
                ));
            }
        }
    }
    violations
}

fn check_authority_prefix(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (tid, t) in state.threads.iter() {
        let mut parent = None;
        let mut ended = false;
        for (depth, info) in t.sched.iter().enumerate() {
            let Some(spd) = info.scheduler else {
                ended = true;
                continue;
            };
            let ok = !ended
                && state.domains.get(spd).is_some_and(|d| {
                    d.sched_depth == Some(depth as u8) && d.parent_sched == parent
                });
            if !ok {
                violations.push(violation(
                    "authority_prefix",
                    alloc::format!("{} depth {} names {} out of order", tid, depth, spd),
                ));
            }
            parent = Some(spd);
        }
    }
    violations
}

fn check_upcall_linkage(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (tid, t) in state.threads.iter() {
        let ThreadRole::Upcall {
            brand, activation, ..
        } = &t.role
        else {
            continue;
        };
        let listed = state.threads.get(*brand).is_some_and(|b| {
            matches!(&b.role, ThreadRole::Brand { upcalls, .. } if upcalls.contains(&tid))
        });
        if !listed {
            violations.push(violation(
                "upcall_linkage",
                alloc::format!("{} not listed by brand {}", tid, brand),
            ));
        }
        if let Activation::Active {
            interrupted: Some(prev),
        } = activation
        {
            if !state
                .threads
                .get(*prev)
                .is_some_and(|p| p.exec == ExecState::Preempted)
            {
                violations.push(violation(
                    "upcall_linkage",
                    alloc::format!("{} would resume {} which is not preempted", tid, prev),
                ));
            }
        }
    }
    violations
}

fn check_current_thread(state: &KernelState) -> Vec<InvariantViolation> {
    let Some(tid) = state.current else {
        return Vec::new();
    };
    match state.threads.get(tid) {
        Some(t) if t.exec != ExecState::Preempted => Vec::new(),
        Some(_) => alloc::vec![violation(
            "current_thread",
            alloc::format!("{} is current but preempted", tid),
        )],
        None => alloc::vec![violation(
            "current_thread",
            alloc::format!("current thread {} does not exist", tid),
        )],
    }
}

/// Assert all invariants hold (panic if not)
pub fn assert_invariants(state: &KernelState) {
    let violations = check_all_invariants(state);
    if let Some(v) = violations.first() {
        panic!("Invariant violated: {}: {}", v.invariant, v.description);
    }
}

// ============================================================================
// Kani proofs for invariants
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;
    use crate::domain::{DomainDesc, Region};
    use crate::effect::Journal;
    use crate::invocation::{invoke, ret};

    fn desc(base: u64) -> DomainDesc {
        DomainDesc {
            region: Region {
                base,
                size: 0x1000,
            },
            cap_count: 1,
            parent_sched: None,
            sched_depth: None,
            upcall_entry: base,
            privileged: false,
        }
    }

    /// Proof: an invocation followed by its return restores refcounts
    #[kani::proof]
    #[kani::unwind(5)]
    fn invoke_return_maintains_invariants() {
        let mut state = KernelState::new();
        let mut j = Journal::new();
        let a = state.register_domain(&desc(0x1000), &mut j).unwrap();
        let b = state.register_domain(&desc(0x2000), &mut j).unwrap();
        let word = state.install_capability(0, a, b, 0, &mut j).unwrap();
        state.boot(a, &mut j).unwrap();

        let cap_word: u32 = kani::any();
        kani::assume(cap_word == word || cap_word == 0xFFFF_FFFF);
        invoke(&mut state, cap_word, 0, 0);
        kani::assert(
            check_all_invariants(&state).is_empty(),
            "Invocation should maintain invariants",
        );

        ret(&mut state);
        kani::assert(
            check_all_invariants(&state).is_empty(),
            "Return should maintain invariants",
        );
    }
}
