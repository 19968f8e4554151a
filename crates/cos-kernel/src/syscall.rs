//! Numeric syscall interface
//!
//! The table has 16 slots; unused slots answer like `SYS_VOID`. Arguments
//! arrive as four 32-bit words and are decoded into a [`Syscall`] before
//! the core sees them.

use cos_kernel_core::{
    BrandOp, CompositeId, DomainId, KernelError, MmapOp, MpdOp, SchedOp, Syscall, ThreadId,
};

// ============================================================================
// Syscall numbers
// ============================================================================

pub const SYS_VOID: u32 = 0;
/// Deprecated; always refused
pub const SYS_RESUME_RETURN: u32 = 1;
pub const SYS_GET_THREAD_ID: u32 = 2;
/// args: stack pointer, entry, data
pub const SYS_CREATE_THREAD: u32 = 3;
pub const SYS_SWITCH_THREAD: u32 = 4;
/// args: thread
pub const SYS_KILL: u32 = 5;
/// args: brand thread
pub const SYS_BRAND_UPCALL: u32 = 6;
/// args: op, thread
pub const SYS_BRAND_CNTL: u32 = 7;
/// args: destination domain
pub const SYS_UPCALL: u32 = 8;
/// args: op, thread, option
pub const SYS_SCHED_CNTL: u32 = 9;
/// args: op, composite, domain, destination composite
pub const SYS_MPD_CNTL: u32 = 10;
/// args: op, domain, vaddr, memory id
pub const SYS_MMAP_CNTL: u32 = 11;

pub const SYSCALL_TABLE_SIZE: u32 = 16;

// ============================================================================
// Operation codes
// ============================================================================

pub const BRAND_CNTL_CREATE: u32 = 0;
pub const BRAND_CNTL_ADD_THREAD: u32 = 1;

pub const SCHED_CNTL_EVT_REGION: u32 = 0;
pub const SCHED_CNTL_GRANT: u32 = 1;
pub const SCHED_CNTL_REVOKE: u32 = 2;

pub const MPD_CNTL_SPLIT: u32 = 0;
pub const MPD_CNTL_MERGE: u32 = 1;
pub const MPD_CNTL_SPLIT_MERGE: u32 = 2;
pub const MPD_CNTL_DEBUG: u32 = 3;

pub const MMAP_CNTL_GRANT: u32 = 0;
pub const MMAP_CNTL_REVOKE: u32 = 1;

/// Decode a numeric syscall.
pub fn decode(num: u32, args: [u32; 4]) -> Result<Syscall, KernelError> {
    let [a0, a1, a2, a3] = args;
    let syscall = match num {
        SYS_VOID => Syscall::Void,
        SYS_RESUME_RETURN => Syscall::ResumeReturn,
        SYS_GET_THREAD_ID => Syscall::GetThreadId,
        SYS_CREATE_THREAD => Syscall::CreateThread {
            stack: a0 as u64,
            entry: a1 as u64,
            data: a2 as u64,
        },
        SYS_SWITCH_THREAD => Syscall::SwitchThread,
        SYS_KILL => Syscall::Kill {
            thread: ThreadId::from_raw(a0),
        },
        SYS_BRAND_UPCALL => Syscall::BrandUpcall {
            brand: ThreadId::from_raw(a0),
        },
        SYS_BRAND_CNTL => Syscall::BrandCntl {
            op: match a0 {
                BRAND_CNTL_CREATE => BrandOp::Create,
                BRAND_CNTL_ADD_THREAD => BrandOp::AddThread,
                _ => return Err(KernelError::InvalidArgument),
            },
            thread: ThreadId::from_raw(a1),
        },
        SYS_UPCALL => Syscall::Upcall {
            dest: DomainId::from_raw(a0),
        },
        SYS_SCHED_CNTL => Syscall::SchedCntl {
            op: match a0 {
                SCHED_CNTL_EVT_REGION => SchedOp::EventRegion,
                SCHED_CNTL_GRANT => SchedOp::Grant,
                SCHED_CNTL_REVOKE => SchedOp::Revoke,
                _ => return Err(KernelError::InvalidArgument),
            },
            thread: ThreadId::from_raw(a1),
            option: a2,
        },
        SYS_MPD_CNTL => Syscall::MpdCntl {
            op: match a0 {
                MPD_CNTL_SPLIT => MpdOp::Split,
                MPD_CNTL_MERGE => MpdOp::Merge,
                MPD_CNTL_SPLIT_MERGE => MpdOp::SplitMerge,
                MPD_CNTL_DEBUG => MpdOp::Debug,
                _ => return Err(KernelError::InvalidArgument),
            },
            composite: CompositeId::from_raw(a1),
            domain: DomainId::from_raw(a2),
            dest: CompositeId::from_raw(a3),
        },
        SYS_MMAP_CNTL => Syscall::MmapCntl {
            op: match a0 {
                MMAP_CNTL_GRANT => MmapOp::Grant,
                MMAP_CNTL_REVOKE => MmapOp::Revoke,
                _ => return Err(KernelError::InvalidArgument),
            },
            domain: DomainId::from_raw(a1),
            vaddr: a2 as u64,
            mem_id: a3 as u64,
        },
        n if n < SYSCALL_TABLE_SIZE => Syscall::Void,
        _ => return Err(KernelError::InvalidArgument),
    };
    Ok(syscall)
}
