//! Axiom audit layer
//!
//! Every kernel entry that changes shared state is recorded twice:
//!
//! - **SysLog**: what was asked and what was answered (requests, responses,
//!   security events such as trust violations).
//! - **CommitLog**: which administrative mutations were committed, in order,
//!   chained by hash so the record can be checked for tampering.
//!
//! The `AxiomGateway` owns both and is the single place the runtime writes
//! them from.

#![no_std]
extern crate alloc;

pub mod commitlog;
pub mod gateway;
pub mod syslog;
pub mod types;

pub use commitlog::{Commit, CommitLog, CommitType};
pub use gateway::{AxiomGateway, GatewayState};
pub use syslog::{SecurityEvent, SecurityKind, SysEvent, SysEventType, SysLog};
pub use types::{CommitId, EventId, ThreadRef};
