//! Commit Log
//!
//! Append-only record of every committed state mutation (domains,
//! composites, threads, authority, mappings). Each commit is chained to
//! its predecessor by hash so the sequence can be checked for gaps or
//! tampering with [`CommitLog::verify_integrity`].

use alloc::vec::Vec;
use core::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};

use crate::types::{CommitId, EventId};

/// Kind of state mutation. Ids are the raw packed arena ids of the kernel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitType {
    /// First commit of every log
    Genesis,
    /// Protection domain registered at boot
    DomainCreated { domain: u32, composite: u32 },
    /// Capability installed into the static table
    CapabilityInstalled {
        index: u32,
        owner: u32,
        destination: u32,
        entry: u64,
    },
    /// Thread allocated (boot, create, brand or upcall thread)
    ThreadCreated { thread: u32, domain: u32 },
    /// Thread retired
    ThreadKilled { thread: u32 },
    /// Composite allocated with a fresh page table
    CompositeCreated { composite: u32, page_table: u64 },
    /// Domain moved between composites
    MemberMoved { domain: u32, from: u32, to: u32 },
    /// Composite no longer selectable for invocation or membership
    CompositeDeprecated { composite: u32 },
    /// Composite aliased onto another's address space
    CompositeSubordinated { composite: u32, target: u32 },
    /// Composite reference count reached zero
    CompositeReclaimed { composite: u32 },
    /// Scheduler authority recorded at a depth
    AuthorityGranted { thread: u32, scheduler: u32, depth: u8 },
    /// Scheduler authority cleared from a depth downward
    AuthorityRevoked { thread: u32, depth: u8 },
    /// Brand thread created from a caller's invocation stack
    BrandCreated { brand: u32, frames: u32 },
    /// Upcall thread attached to a brand
    UpcallThreadAdded { thread: u32, brand: u32 },
    /// Thread's invocation stack reset into another domain
    ThreadRebased { thread: u32, domain: u32 },
    /// Page mapped into a domain's address space
    PageMapped { domain: u32, vaddr: u64, mem_id: u64 },
    /// Page unmapped from a domain's address space
    PageUnmapped { domain: u32, vaddr: u64 },
}

/// A single committed mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commit {
    /// Hash of this commit (covers prev, seq, timestamp, cause, type)
    pub id: CommitId,
    /// Hash of the previous commit (0 for genesis)
    pub prev_commit: CommitId,
    /// Sequence number (genesis = 0)
    pub seq: u64,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
    /// SysLog request that caused this commit, if any
    pub caused_by: Option<EventId>,
    /// The mutation
    pub commit_type: CommitType,
}

/// FNV-1a, 64-bit.
struct ChainHasher(u64);

impl ChainHasher {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn new() -> Self {
        Self(Self::OFFSET)
    }
}

impl Hasher for ChainHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= u64::from(*b);
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }
}

fn compute_id(
    prev: CommitId,
    seq: u64,
    timestamp: u64,
    caused_by: Option<EventId>,
    commit_type: &CommitType,
) -> CommitId {
    let mut h = ChainHasher::new();
    prev.hash(&mut h);
    seq.hash(&mut h);
    timestamp.hash(&mut h);
    caused_by.hash(&mut h);
    commit_type.hash(&mut h);
    h.finish()
}

/// Maximum number of commits to keep in memory
const MAX_COMMITLOG_ENTRIES: usize = 10000;

/// Append-only, hash-chained commit log. Only the newest
/// `MAX_COMMITLOG_ENTRIES` commits are retained.
pub struct CommitLog {
    commits: Vec<Commit>,
    seq: u64,
}

impl CommitLog {
    /// Create a log holding only the genesis commit.
    pub fn new(timestamp: u64) -> Self {
        let id = compute_id(0, 0, timestamp, None, &CommitType::Genesis);
        Self {
            commits: alloc::vec![Commit {
                id,
                prev_commit: 0,
                seq: 0,
                timestamp,
                caused_by: None,
                commit_type: CommitType::Genesis,
            }],
            seq: 0,
        }
    }

    /// Append a commit and return its id.
    pub fn append(
        &mut self,
        commit_type: CommitType,
        caused_by: Option<EventId>,
        timestamp: u64,
    ) -> CommitId {
        let prev = self.head();
        self.seq += 1;
        let id = compute_id(prev, self.seq, timestamp, caused_by, &commit_type);
        self.commits.push(Commit {
            id,
            prev_commit: prev,
            seq: self.seq,
            timestamp,
            caused_by,
            commit_type,
        });
        self.trim_if_needed();
        id
    }

    /// Hash of the newest commit.
    pub fn head(&self) -> CommitId {
        self.commits.last().map(|c| c.id).unwrap_or(0)
    }

    /// Sequence number of the newest commit.
    pub fn current_seq(&self) -> u64 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    /// Commits with `seq >= from`.
    pub fn since(&self, from: u64) -> &[Commit] {
        let start = self.commits.partition_point(|c| c.seq < from);
        &self.commits[start..]
    }

    /// Recompute every retained hash and check linkage and sequence
    /// numbers. The oldest retained commit anchors the chain.
    pub fn verify_integrity(&self) -> bool {
        let Some(first) = self.commits.first() else {
            return true;
        };
        if first.seq == 0 && first.prev_commit != 0 {
            return false;
        }

        let mut prev = first.prev_commit;
        for (c, seq) in self.commits.iter().zip(first.seq..) {
            if c.seq != seq || c.prev_commit != prev {
                return false;
            }
            if c.id != compute_id(c.prev_commit, c.seq, c.timestamp, c.caused_by, &c.commit_type) {
                return false;
            }
            prev = c.id;
        }
        prev == self.head() && self.commits.last().map(|c| c.seq) == Some(self.seq)
    }

    /// Trim old commits if exceeding max capacity.
    fn trim_if_needed(&mut self) {
        if self.commits.len() > MAX_COMMITLOG_ENTRIES {
            let drain_count = self.commits.len() - MAX_COMMITLOG_ENTRIES;
            self.commits.drain(0..drain_count);
        }
    }
}

impl Default for CommitLog {
    fn default() -> Self {
        Self::new(0)
    }
}
