//! Protection domain registry
//!
//! Domains are the isolation units. Each belongs to exactly one composite
//! at a time (`composite` is a plain id, the composite keeps the member
//! set). Each owns a disjoint virtual region, which makes the virtual
//! namespace a function from address to domain.

use serde::{Deserialize, Serialize};

use crate::arena::Arena;
use crate::types::{CompositeId, DomainId};

/// Virtual address range `[base, base + size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub base: u64,
    pub size: u64,
}

impl Region {
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.base && vaddr - self.base < self.size
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.base < other.base.saturating_add(other.size)
            && other.base < self.base.saturating_add(self.size)
    }
}

/// Scheduler shared control page: written by the scheduler at user
/// level, read by `switch_thread`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedControl {
    /// Raw id of the thread to switch to
    pub next_thread: u32,
    /// `SCHED_EXCL_YIELD` / `SCHED_RETURN`
    pub flags: u16,
}

/// Boot-time description of a domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDesc {
    pub region: Region,
    /// Number of capability table entries to reserve
    pub cap_count: usize,
    /// Scheduler that created this one; required for depth > 0
    pub parent_sched: Option<DomainId>,
    /// Depth in the scheduler hierarchy, `None` for non-schedulers
    pub sched_depth: Option<u8>,
    /// Where upcalls into this domain start
    pub upcall_entry: u64,
    /// May run composite and mapping control
    pub privileged: bool,
}

/// A protection domain.
#[derive(Clone, Debug)]
pub struct ProtectionDomain {
    pub id: DomainId,
    pub composite: CompositeId,
    pub cap_base: usize,
    pub cap_count: usize,
    pub parent_sched: Option<DomainId>,
    pub sched_depth: Option<u8>,
    pub upcall_entry: u64,
    pub region: Region,
    pub privileged: bool,
    /// Present only for schedulers
    pub sched_page: Option<SchedControl>,
}

impl ProtectionDomain {
    pub fn is_scheduler(&self) -> bool {
        self.sched_depth.is_some()
    }
}

/// All protection domains.
pub struct DomainRegistry {
    arena: Arena<DomainId, ProtectionDomain>,
}

impl DomainRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Arena::new(capacity),
        }
    }

    pub(crate) fn insert(
        &mut self,
        desc: &DomainDesc,
        composite: CompositeId,
        cap_base: usize,
    ) -> Option<DomainId> {
        self.arena.insert_with(|id| ProtectionDomain {
            id,
            composite,
            cap_base,
            cap_count: desc.cap_count,
            parent_sched: desc.parent_sched,
            sched_depth: desc.sched_depth,
            upcall_entry: desc.upcall_entry,
            region: desc.region,
            privileged: desc.privileged,
            sched_page: desc.sched_depth.map(|_| SchedControl::default()),
        })
    }

    pub fn get(&self, id: DomainId) -> Option<&ProtectionDomain> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: DomainId) -> Option<&mut ProtectionDomain> {
        self.arena.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DomainId, &ProtectionDomain)> {
        self.arena.iter()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.arena.len() >= self.arena.capacity()
    }

    /// Which domain owns `vaddr`.
    pub fn virtual_namespace_query(&self, vaddr: u64) -> Option<DomainId> {
        self.arena
            .iter()
            .find(|(_, d)| d.region.contains(vaddr))
            .map(|(id, _)| id)
    }

    /// Would `region` collide with an existing domain?
    pub fn region_taken(&self, region: &Region) -> bool {
        self.arena.iter().any(|(_, d)| d.region.overlaps(region))
    }
}
