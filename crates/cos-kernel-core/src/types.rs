//! Core kernel types
//!
//! Arena-backed identifiers for domains, composites and threads, the
//! page-table handle the core hands out, and the constants shared with
//! user level through the ABI.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::arena::ArenaId;

/// Size of a page
pub const PAGE_SIZE: u64 = 4096;

/// Base of the per-thread argument regions. Thread `n` finds its region at
/// `INFO_REGION_ADDR + n * PAGE_SIZE`.
pub const INFO_REGION_ADDR: u64 = 0x4000_0000;

/// Switch-thread flag: the yielding thread may only be resumed by its
/// suspender or an ancestor of it.
pub const SCHED_EXCL_YIELD: u16 = 0x1;

/// Switch-thread flag: return to the invoking component after the switch.
/// Not supported.
pub const SCHED_RETURN: u16 = 0x2;

/// Generations are kept to 15 bits so a packed id is always a non-negative
/// `i64` at the syscall boundary.
pub(crate) const GENERATION_MASK: u16 = 0x7FFF;

/// Handle naming one hardware page table. Allocated by the core, backed by
/// the HAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageTableHandle(pub u64);

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name {
            index: u16,
            generation: u16,
        }

        impl $name {
            /// Pack into the 32-bit form used at the syscall boundary.
            pub const fn to_raw(self) -> u32 {
                ((self.generation as u32) << 16) | self.index as u32
            }

            /// Unpack a raw id. The result may be stale or unallocated;
            /// arena lookups reject both.
            pub const fn from_raw(raw: u32) -> Self {
                Self {
                    index: raw as u16,
                    generation: ((raw >> 16) as u16) & GENERATION_MASK,
                }
            }
        }

        impl ArenaId for $name {
            fn new(index: u16, generation: u16) -> Self {
                Self { index, generation: generation & GENERATION_MASK }
            }

            fn index(self) -> u16 {
                self.index
            }

            fn generation(self) -> u16 {
                self.generation
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.index)?;
                if self.generation != 0 {
                    write!(f, ".{}", self.generation)?;
                }
                Ok(())
            }
        }
    };
}

arena_id!(
    /// Protection domain (component) identifier
    DomainId,
    "spd"
);
arena_id!(
    /// Composite domain (shared address space) identifier
    CompositeId,
    "cspd"
);
arena_id!(
    /// Thread identifier
    ThreadId,
    "thd"
);
