//! Static invocation capability table
//!
//! A fixed-size table of invocation edges. Each protection domain owns a
//! contiguous range of entries. Entries are installed once during setup
//! and are read without locking on every invocation; only the invocation
//! counter changes afterwards.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernelError;
use crate::types::DomainId;

/// Who may use a capability entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapOwner {
    /// Not part of any domain's range
    Free,
    /// Reserved for a domain but never installed
    AllocatedUnused,
    /// Installed, usable from this domain
    Domain(DomainId),
}

/// One invocation edge.
#[derive(Debug)]
pub struct InvocationCap {
    pub owner: CapOwner,
    pub destination: Option<DomainId>,
    /// Entry address in the destination
    pub entry: u64,
    invocation_count: AtomicU64,
}

impl InvocationCap {
    const fn free() -> Self {
        Self {
            owner: CapOwner::Free,
            destination: None,
            entry: 0,
            invocation_count: AtomicU64::new(0),
        }
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocation_count.load(Ordering::Relaxed)
    }

    pub(crate) fn count_invocation(&self) {
        self.invocation_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Owner and destination of an installed entry.
    pub fn edge(&self) -> Option<(DomainId, DomainId)> {
        match (self.owner, self.destination) {
            (CapOwner::Domain(owner), Some(dest)) => Some((owner, dest)),
            _ => None,
        }
    }
}

/// The static capability table.
pub struct CapabilityTable {
    entries: Vec<InvocationCap>,
    shift: u32,
    next_free: usize,
}

impl CapabilityTable {
    pub fn new(size: usize, shift: u32) -> Self {
        let mut entries = Vec::with_capacity(size);
        entries.resize_with(size, InvocationCap::free);
        Self {
            entries,
            shift,
            next_free: 0,
        }
    }

    /// Table index named by a capability word.
    pub fn index_of(&self, word: u32) -> Option<usize> {
        let index = (word >> self.shift) as usize;
        (index < self.entries.len()).then_some(index)
    }

    /// Capability word naming a table index.
    pub fn word_of(&self, index: usize) -> u32 {
        (index as u32) << self.shift
    }

    /// Resolve a capability word to an installed entry.
    ///
    /// Refuses out-of-range words, entries without an owner, and entries
    /// whose destination is unset, free or never installed.
    pub fn lookup(&self, word: u32) -> Result<(usize, &InvocationCap), KernelError> {
        let index = self
            .index_of(word)
            .ok_or(KernelError::InvalidCapability(word >> self.shift))?;
        let cap = &self.entries[index];
        match cap.edge() {
            Some(_) => Ok((index, cap)),
            None => Err(KernelError::InvalidCapability(index as u32)),
        }
    }

    pub fn get(&self, index: usize) -> Option<&InvocationCap> {
        self.entries.get(index)
    }

    /// Reserve `count` consecutive entries for a new domain.
    pub(crate) fn reserve_range(&mut self, count: usize) -> Option<usize> {
        let base = self.next_free;
        let end = base.checked_add(count)?;
        if end > self.entries.len() {
            return None;
        }
        for cap in &mut self.entries[base..end] {
            cap.owner = CapOwner::AllocatedUnused;
        }
        self.next_free = end;
        Some(base)
    }

    /// Install an edge into a reserved entry of `owner`'s range.
    pub(crate) fn install(
        &mut self,
        index: usize,
        owner: DomainId,
        destination: DomainId,
        entry: u64,
    ) -> Result<(), KernelError> {
        let cap = self
            .entries
            .get_mut(index)
            .ok_or(KernelError::InvalidCapability(index as u32))?;
        if cap.owner != CapOwner::AllocatedUnused {
            return Err(KernelError::InvalidCapability(index as u32));
        }
        cap.owner = CapOwner::Domain(owner);
        cap.destination = Some(destination);
        cap.entry = entry;
        Ok(())
    }

    /// Does `truster` hold a capability into `trustee`?
    ///
    /// Scans the truster's own range `[base, base + count)`.
    pub fn verify_trust(&self, base: usize, count: usize, trustee: DomainId) -> bool {
        self.entries
            .iter()
            .skip(base)
            .take(count)
            .any(|cap| cap.destination == Some(trustee))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
