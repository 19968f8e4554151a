//! Composite domains
//!
//! A composite is a set of protection domains sharing one page table. It is
//! reference counted: one structural reference while it is live, one per
//! invocation frame that points at it, and one per subordinate composite
//! aliased onto it.
//!
//! # Operations
//!
//! - **split** peels one member into a new composite. With no holders
//!   besides the structural reference the source shrinks in place;
//!   otherwise two fresh composites are populated and the source is
//!   deprecated, leaving it valid for the frames that still point at it.
//! - **merge** moves every member of one composite into another and makes
//!   the emptied one a subordinate of the survivor, so stale frames resolve
//!   to the survivor's page table until they are released.
//!
//! A composite is reclaimed when its count reaches zero. An owning
//! composite destroys its page table then; a subordinate releases the
//! composite it was aliased onto.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use cos_axiom::CommitType;

use crate::arena::Arena;
use crate::domain::DomainRegistry;
use crate::effect::{Effect, Journal, MeasEvent};
use crate::error::CompositeError;
use crate::refcount::RefCount;
use crate::types::{CompositeId, DomainId, PageTableHandle};

/// Who owns the address space a composite resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    /// The composite owns this page table
    Owning(PageTableHandle),
    /// Aliased onto `target`. `stale` is the composite's former page table:
    /// it is never installed again and is destroyed at reclaim.
    Subordinate {
        target: CompositeId,
        stale: PageTableHandle,
    },
}

#[derive(Debug)]
pub struct CompositeDomain {
    pub id: CompositeId,
    pub space: AddressSpace,
    pub refs: RefCount,
    pub members: BTreeSet<DomainId>,
    /// Not selectable for invocation, membership or merge
    pub deprecated: bool,
}

/// Result of a split.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitOutcome {
    /// Composite now holding only the split-out domain
    pub split: CompositeId,
    /// Composite holding the remaining members
    pub remainder: CompositeId,
    /// The source composite was shrunk in place and is the remainder
    pub reused: bool,
}

pub struct CompositeTable {
    arena: Arena<CompositeId, CompositeDomain>,
    next_page_table: u64,
}

impl CompositeTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Arena::new(capacity),
            next_page_table: 1,
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn get(&self, id: CompositeId) -> Option<&CompositeDomain> {
        self.arena.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CompositeId, &CompositeDomain)> {
        self.arena.iter()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// A composite that may be used for new invocations or membership.
    pub fn live(&self, id: CompositeId) -> Result<&CompositeDomain, CompositeError> {
        let c = self
            .arena
            .get(id)
            .ok_or(CompositeError::NoSuchComposite(id))?;
        if c.deprecated {
            return Err(CompositeError::Deprecated(id));
        }
        Ok(c)
    }

    pub fn ref_count(&self, id: CompositeId) -> Option<u32> {
        self.arena.get(id).map(|c| c.refs.value())
    }

    /// Page table the composite currently resolves to, following the
    /// subordinate chain.
    pub fn resolve_page_table(&self, id: CompositeId) -> Option<PageTableHandle> {
        let mut cur = id;
        for _ in 0..=self.arena.len() {
            match self.arena.get(cur)?.space {
                AddressSpace::Owning(pt) => return Some(pt),
                AddressSpace::Subordinate { target, .. } => cur = target,
            }
        }
        None
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Allocate an empty composite with a fresh page table and the
    /// structural reference.
    pub(crate) fn create(&mut self, journal: &mut Journal) -> Result<CompositeId, CompositeError> {
        let pt = PageTableHandle(self.next_page_table);
        let id = self
            .arena
            .insert_with(|id| CompositeDomain {
                id,
                space: AddressSpace::Owning(pt),
                refs: RefCount::new(1),
                members: BTreeSet::new(),
                deprecated: false,
            })
            .ok_or(CompositeError::Exhausted)?;
        self.next_page_table += 1;

        journal.effect(Effect::CreatePageTable(pt));
        journal.commit(CommitType::CompositeCreated {
            composite: id.to_raw(),
            page_table: pt.0,
        });
        Ok(id)
    }

    /// Record a boot-time member of a freshly created composite.
    pub(crate) fn attach(&mut self, id: CompositeId, domain: DomainId) -> Result<(), CompositeError> {
        let c = self
            .arena
            .get_mut(id)
            .ok_or(CompositeError::NoSuchComposite(id))?;
        c.members.insert(domain);
        Ok(())
    }

    pub(crate) fn take(&self, id: CompositeId) -> Result<(), CompositeError> {
        self.arena
            .get(id)
            .ok_or(CompositeError::NoSuchComposite(id))?
            .refs
            .take();
        Ok(())
    }

    /// Drop one reference, reclaiming every composite whose count reaches
    /// zero along the subordinate chain.
    pub(crate) fn release(
        &mut self,
        id: CompositeId,
        journal: &mut Journal,
    ) -> Result<(), CompositeError> {
        let mut next = Some(id);
        while let Some(cur) = next.take() {
            let c = self
                .arena
                .get(cur)
                .ok_or(CompositeError::NoSuchComposite(cur))?;
            let remaining = c.refs.release().ok_or(CompositeError::RefUnderflow(cur))?;
            if remaining > 0 {
                break;
            }
            if !c.members.is_empty() {
                return Err(CompositeError::Corrupted(cur));
            }
            let reclaimed = self
                .arena
                .remove(cur)
                .ok_or(CompositeError::NoSuchComposite(cur))?;
            journal.commit(CommitType::CompositeReclaimed {
                composite: cur.to_raw(),
            });
            match reclaimed.space {
                AddressSpace::Owning(pt) => journal.effect(Effect::DestroyPageTable(pt)),
                AddressSpace::Subordinate { target, stale } => {
                    journal.effect(Effect::DestroyPageTable(stale));
                    next = Some(target);
                }
            }
        }
        Ok(())
    }

    /// Mark deprecated and drop the structural reference.
    pub(crate) fn deprecate(
        &mut self,
        id: CompositeId,
        journal: &mut Journal,
    ) -> Result<(), CompositeError> {
        let c = self
            .arena
            .get_mut(id)
            .ok_or(CompositeError::NoSuchComposite(id))?;
        if c.deprecated {
            return Ok(());
        }
        c.deprecated = true;
        journal.commit(CommitType::CompositeDeprecated {
            composite: id.to_raw(),
        });
        self.release(id, journal)
    }

    /// Alias `other` onto `dest`'s address space and deprecate it.
    fn make_subordinate(
        &mut self,
        dest: CompositeId,
        other: CompositeId,
        journal: &mut Journal,
    ) -> Result<(), CompositeError> {
        self.take(dest)?;
        let c = self
            .arena
            .get_mut(other)
            .ok_or(CompositeError::NoSuchComposite(other))?;
        let stale = match c.space {
            AddressSpace::Owning(pt) => pt,
            AddressSpace::Subordinate { .. } => return Err(CompositeError::Corrupted(other)),
        };
        c.space = AddressSpace::Subordinate {
            target: dest,
            stale,
        };
        journal.commit(CommitType::CompositeSubordinated {
            composite: other.to_raw(),
            target: dest.to_raw(),
        });
        self.deprecate(other, journal)
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Move `domain` into `to`. With `copy`, the domain's mappings are
    /// copied into the destination page table.
    fn move_member(
        &mut self,
        domains: &mut DomainRegistry,
        domain: DomainId,
        to: CompositeId,
        copy: bool,
        journal: &mut Journal,
    ) -> Result<(), CompositeError> {
        let d = domains
            .get_mut(domain)
            .ok_or(CompositeError::Corrupted(to))?;
        let from = d.composite;
        if from == to {
            return Ok(());
        }
        let region = d.region;

        let src_pt = self
            .resolve_page_table(from)
            .ok_or(CompositeError::Corrupted(from))?;
        let dst_pt = self
            .resolve_page_table(to)
            .ok_or(CompositeError::Corrupted(to))?;
        let dst = self
            .arena
            .get_mut(to)
            .ok_or(CompositeError::NoSuchComposite(to))?;
        dst.members.insert(domain);
        if let Some(src) = self.arena.get_mut(from) {
            src.members.remove(&domain);
        }
        d.composite = to;

        if copy && src_pt != dst_pt {
            journal.effect(Effect::CopyRegion {
                from: src_pt,
                to: dst_pt,
                base: region.base,
                size: region.size,
            });
        }
        journal.commit(CommitType::MemberMoved {
            domain: domain.to_raw(),
            from: from.to_raw(),
            to: to.to_raw(),
        });
        Ok(())
    }

    // ========================================================================
    // Split / merge
    // ========================================================================

    /// Split `domain` out of composite `id`.
    pub fn split(
        &mut self,
        domains: &mut DomainRegistry,
        id: CompositeId,
        domain: DomainId,
        journal: &mut Journal,
    ) -> Result<SplitOutcome, CompositeError> {
        let c = self.live(id)?;
        if !c.members.contains(&domain) {
            return Err(CompositeError::NotMember {
                domain,
                composite: id,
            });
        }
        if c.members.len() <= 1 {
            return Err(CompositeError::SingleMember(id));
        }
        let sole_holder = c.refs.value() == 1;

        let new1 = self.create(journal)?;

        if sole_holder {
            // Nobody executes in `id`, so its mappings may change under it.
            let region = domains
                .get(domain)
                .map(|d| d.region)
                .ok_or(CompositeError::Corrupted(id))?;
            let pt = self
                .resolve_page_table(id)
                .ok_or(CompositeError::Corrupted(id))?;
            if let Err(e) = self.move_member(domains, domain, new1, true, journal) {
                self.deprecate(new1, journal)?;
                return Err(e);
            }
            journal.effect(Effect::ClearRegion {
                page_table: pt,
                base: region.base,
                size: region.size,
            });
            journal.effect(Effect::Measure(MeasEvent::SplitReuse));
            return Ok(SplitOutcome {
                split: new1,
                remainder: id,
                reused: true,
            });
        }

        let new2 = match self.create(journal) {
            Ok(new2) => new2,
            Err(e) => {
                self.deprecate(new1, journal)?;
                return Err(e);
            }
        };

        if let Err(e) = self.populate(domains, id, domain, new1, new2, journal) {
            self.rollback(domains, id, &[new1, new2], journal)?;
            return Err(e);
        }

        self.deprecate(id, journal)?;
        Ok(SplitOutcome {
            split: new1,
            remainder: new2,
            reused: false,
        })
    }

    fn populate(
        &mut self,
        domains: &mut DomainRegistry,
        id: CompositeId,
        domain: DomainId,
        new1: CompositeId,
        new2: CompositeId,
        journal: &mut Journal,
    ) -> Result<(), CompositeError> {
        self.move_member(domains, domain, new1, true, journal)?;
        let rest: Vec<DomainId> = self
            .arena
            .get(id)
            .map(|c| c.members.iter().copied().collect())
            .unwrap_or_default();
        for member in rest {
            self.move_member(domains, member, new2, true, journal)?;
        }
        Ok(())
    }

    /// Return every member of the half-built composites to `id` and
    /// deprecate them. `id`'s page table was never changed, so nothing is
    /// copied back.
    fn rollback(
        &mut self,
        domains: &mut DomainRegistry,
        id: CompositeId,
        partial: &[CompositeId],
        journal: &mut Journal,
    ) -> Result<(), CompositeError> {
        for &p in partial.iter().rev() {
            let moved: Vec<DomainId> = self
                .arena
                .get(p)
                .map(|c| c.members.iter().copied().collect())
                .unwrap_or_default();
            for member in moved {
                self.move_member(domains, member, id, false, journal)?;
            }
            self.deprecate(p, journal)?;
        }
        Ok(())
    }

    /// Merge two live composites. Returns the surviving composite.
    pub fn merge(
        &mut self,
        domains: &mut DomainRegistry,
        c1: CompositeId,
        c2: CompositeId,
        journal: &mut Journal,
    ) -> Result<CompositeId, CompositeError> {
        if c1 == c2 {
            return Err(CompositeError::SameComposite(c1));
        }
        let first = self.live(c1)?;
        self.live(c2)?;

        // A composite with no holders can be torn down right away.
        let (other, dest) = if first.refs.value() == 1 {
            (c1, c2)
        } else {
            (c2, c1)
        };

        let moving: Vec<DomainId> = self
            .arena
            .get(other)
            .map(|c| c.members.iter().copied().collect())
            .unwrap_or_default();
        for member in moving {
            self.move_member(domains, member, dest, true, journal)?;
        }

        self.make_subordinate(dest, other, journal)?;
        Ok(dest)
    }
}
