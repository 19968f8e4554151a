//! Kernel errors
//!
//! Every refusal is a [`KernelError`]. At the syscall boundary it becomes a
//! stable negative errno; the invocation entry reports refusal as `0`.

use crate::types::{CompositeId, DomainId};

/// How a refusal should be treated by the caller path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad id, bad argument, missing authority
    Caller,
    /// Cross-composite use without a trust relation; logged as security event
    Trust,
    /// Table or stack capacity reached; partial state was backed out
    Exhausted,
    /// The calling thread's own path is broken
    Fault,
    /// Operation exists but is not implemented
    Unsupported,
}

/// Errors from composite split/merge/subordination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompositeError {
    #[error("no composite {0}")]
    NoSuchComposite(CompositeId),
    #[error("composite {0} is deprecated")]
    Deprecated(CompositeId),
    #[error("composite {0} has a single member")]
    SingleMember(CompositeId),
    #[error("domain {domain} is not a member of composite {composite}")]
    NotMember {
        domain: DomainId,
        composite: CompositeId,
    },
    #[error("cannot merge composite {0} with itself")]
    SameComposite(CompositeId),
    #[error("composite table full")]
    Exhausted,
    #[error("composite {0} reference count underflow")]
    RefUnderflow(CompositeId),
    #[error("composite {0} chain is corrupted")]
    Corrupted(CompositeId),
}

/// Kernel refusal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("invalid capability {0}")]
    InvalidCapability(u32),
    #[error("capability {capability} owned from composite {owner} used from {frame}")]
    TrustViolation {
        capability: u32,
        owner: CompositeId,
        frame: CompositeId,
    },
    #[error("upcall from {from} into {to} without trust relation")]
    UntrustedUpcall { from: DomainId, to: DomainId },
    #[error("caller claimed domain {0} but is not executing in it")]
    BadDomainClaim(DomainId),
    #[error("no domain {0}")]
    NoSuchDomain(DomainId),
    #[error("no thread {0}")]
    NoSuchThread(u32),
    #[error("no current thread")]
    NoCurrentThread,
    #[error("domain {0} is not a scheduler")]
    NotScheduler(DomainId),
    #[error("domain {0} lacks authority for this operation")]
    Unauthorized(DomainId),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("address {0:#x} outside the target domain")]
    AddressOutOfRange(u64),
    #[error("brand invocation history is missing frames")]
    BrandAncestry,
    #[error("invocation stack overflow")]
    StackOverflow,
    #[error("kernel table full")]
    ResourceExhausted,
    #[error("thread is faulted")]
    ThreadFaulted,
    #[error("return with no caller")]
    ProtocolFault,
    #[error("inconsistent upcall linkage")]
    UpcallLinkage,
    #[error("page mapping failed")]
    MappingFailed,
    #[error("not supported")]
    NotSupported,
    #[error("kernel state corrupted")]
    Corrupted,
    #[error(transparent)]
    Composite(#[from] CompositeError),
}

impl KernelError {
    /// Stable negative errno for the numeric syscall interface.
    pub fn errno(&self) -> i64 {
        match self {
            KernelError::InvalidCapability(_) => -1,
            KernelError::TrustViolation { .. } => -2,
            KernelError::UntrustedUpcall { .. } => -3,
            KernelError::BadDomainClaim(_) => -4,
            KernelError::NoSuchDomain(_) => -5,
            KernelError::NoSuchThread(_) => -6,
            KernelError::NoCurrentThread => -7,
            KernelError::NotScheduler(_) => -8,
            KernelError::Unauthorized(_) => -9,
            KernelError::InvalidArgument => -10,
            KernelError::AddressOutOfRange(_) => -11,
            KernelError::BrandAncestry => -12,
            KernelError::StackOverflow => -13,
            KernelError::ResourceExhausted => -14,
            KernelError::ThreadFaulted => -15,
            KernelError::ProtocolFault => -16,
            KernelError::UpcallLinkage => -17,
            KernelError::MappingFailed => -18,
            KernelError::NotSupported => -19,
            KernelError::Corrupted => -20,
            KernelError::Composite(e) => match e {
                CompositeError::NoSuchComposite(_) => -21,
                CompositeError::Deprecated(_) => -22,
                CompositeError::SingleMember(_) => -23,
                CompositeError::NotMember { .. } => -24,
                CompositeError::SameComposite(_) => -25,
                CompositeError::Exhausted => -14,
                CompositeError::RefUnderflow(_) | CompositeError::Corrupted(_) => -20,
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            KernelError::TrustViolation { .. } | KernelError::UntrustedUpcall { .. } => {
                ErrorClass::Trust
            }
            KernelError::StackOverflow
            | KernelError::ResourceExhausted
            | KernelError::MappingFailed
            | KernelError::Composite(CompositeError::Exhausted) => ErrorClass::Exhausted,
            KernelError::ThreadFaulted
            | KernelError::ProtocolFault
            | KernelError::UpcallLinkage
            | KernelError::NoCurrentThread
            | KernelError::Corrupted
            | KernelError::Composite(CompositeError::RefUnderflow(_))
            | KernelError::Composite(CompositeError::Corrupted(_)) => ErrorClass::Fault,
            KernelError::NotSupported => ErrorClass::Unsupported,
            _ => ErrorClass::Caller,
        }
    }
}
