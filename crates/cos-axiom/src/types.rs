//! Identifier types shared by the audit logs.

/// Monotonic SysLog event identifier
pub type EventId = u64;

/// Hash-chained CommitLog identifier
pub type CommitId = u64;

/// Raw (packed index + generation) thread identifier of the caller
pub type ThreadRef = u32;
