//! Axiom Gateway
//!
//! Audit path for the kernel's numbered syscalls. For each one the gateway:
//! 1. Logs the request to SysLog
//! 2. Runs the kernel step
//! 3. Appends the step's commits to CommitLog, tagged with the request id
//! 4. Logs the response to SysLog
//!
//! Invocation and return bypass the syscall path. Their commits (composite
//! reclamation) and the setup commits from domain registration and boot are
//! appended untagged. Refused invocations surface as security events.

use alloc::vec::Vec;

use crate::commitlog::{CommitLog, CommitType};
use crate::syslog::{SecurityEvent, SysLog};
use crate::types::{CommitId, EventId, ThreadRef};

/// Axiom gateway: owns the audit log and the commit log.
pub struct AxiomGateway {
    /// Syscall audit log
    syslog: SysLog,
    /// State mutation log
    commitlog: CommitLog,
}

impl AxiomGateway {
    /// Create a new Axiom gateway.
    ///
    /// # Arguments
    /// - `timestamp`: Boot timestamp (nanos)
    pub fn new(timestamp: u64) -> Self {
        Self {
            syslog: SysLog::new(),
            commitlog: CommitLog::new(timestamp),
        }
    }

    /// Run one numbered syscall under audit.
    ///
    /// # Arguments
    /// - `sender`: Raw id of the calling thread
    /// - `syscall_num`: Syscall number
    /// - `args`: Syscall arguments (up to 4)
    /// - `timestamp`: Current timestamp (nanos since boot)
    /// - `kernel_fn`: Runs the step, returning (ABI result, commits)
    ///
    /// # Returns
    /// Tuple of (ABI result, ids of the appended commits)
    pub fn syscall<F>(
        &mut self,
        sender: ThreadRef,
        syscall_num: u32,
        args: [u32; 4],
        timestamp: u64,
        mut kernel_fn: F,
    ) -> (i64, Vec<CommitId>)
    where
        F: FnMut(u32, [u32; 4]) -> (i64, Vec<CommitType>),
    {
        let request_id = self
            .syslog
            .log_request(sender, syscall_num, args, timestamp);

        let (result, commit_types) = kernel_fn(syscall_num, args);

        let commit_ids: Vec<CommitId> = commit_types
            .into_iter()
            .map(|ct| self.commitlog.append(ct, Some(request_id), timestamp))
            .collect();

        self.syslog
            .log_response(sender, request_id, result, timestamp);

        (result, commit_ids)
    }

    /// Record a security event (trust violation, untrusted upcall, linkage
    /// fault). It is not tied to a request id.
    pub fn security(&mut self, sender: ThreadRef, event: SecurityEvent, timestamp: u64) -> EventId {
        self.syslog.log_security(sender, event, timestamp)
    }

    /// Requests, responses and security events.
    pub fn syslog(&self) -> &SysLog {
        &self.syslog
    }

    /// Committed state mutations, hash-chained.
    pub fn commitlog(&self) -> &CommitLog {
        &self.commitlog
    }

    /// Append a commit with no originating request.
    ///
    /// Used for domain registration, capability installation, boot, and the
    /// invocation and return entries.
    pub fn append_internal_commit(&mut self, commit_type: CommitType, timestamp: u64) -> CommitId {
        self.commitlog.append(commit_type, None, timestamp)
    }

    /// Verify integrity of the commit chain.
    pub fn verify_integrity(&self) -> bool {
        self.commitlog.verify_integrity()
    }

    /// Get current state for serialization.
    pub fn state_summary(&self) -> GatewayState {
        GatewayState {
            syslog_len: self.syslog.len(),
            syslog_next_id: self.syslog.next_id(),
            commitlog_len: self.commitlog.len(),
            commitlog_seq: self.commitlog.current_seq(),
            commitlog_head: self.commitlog.head(),
        }
    }
}

/// Summary of gateway state (for debugging/monitoring).
#[derive(Clone, Debug)]
pub struct GatewayState {
    /// Number of events in SysLog
    pub syslog_len: usize,
    /// Next event ID in SysLog
    pub syslog_next_id: u64,
    /// Number of commits in CommitLog
    pub commitlog_len: usize,
    /// Current sequence number in CommitLog
    pub commitlog_seq: u64,
    /// Head commit hash
    pub commitlog_head: CommitId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syslog::SecurityKind;

    #[test]
    fn test_gateway_creation() {
        let gateway = AxiomGateway::new(0);
        assert_eq!(gateway.syslog().len(), 0);
        assert_eq!(gateway.commitlog().len(), 1); // Genesis
    }

    #[test]
    fn test_gateway_syscall_no_commits() {
        let mut gateway = AxiomGateway::new(0);

        let (result, commits) =
            gateway.syscall(1, 0x02, [0, 0, 0, 0], 1000, |_, _| (42, Vec::new()));

        assert_eq!(result, 42);
        assert!(commits.is_empty());
        assert_eq!(gateway.syslog().len(), 2); // Request + Response
        assert_eq!(gateway.commitlog().len(), 1); // Still just Genesis
    }

    #[test]
    fn test_gateway_syscall_with_commits() {
        let mut gateway = AxiomGateway::new(0);

        let (result, commits) = gateway.syscall(1, 0x0A, [0, 0, 0, 0], 1000, |_, _| {
            (
                0,
                alloc::vec![
                    CommitType::MemberMoved {
                        domain: 2,
                        from: 1,
                        to: 3,
                    },
                    CommitType::CompositeDeprecated { composite: 1 },
                ],
            )
        });

        assert_eq!(result, 0);
        assert_eq!(commits.len(), 2);
        assert_eq!(gateway.syslog().len(), 2);
        assert_eq!(gateway.commitlog().len(), 3); // Genesis + 2
        assert_eq!(gateway.commitlog().commits()[1].caused_by, Some(0));
    }

    #[test]
    fn test_gateway_multiple_syscalls() {
        let mut gateway = AxiomGateway::new(0);

        for i in 1..=5 {
            gateway.syscall(1, 0x03, [i, 0, 0, 0], i as u64 * 1000, |_, _| {
                (
                    0,
                    alloc::vec![CommitType::ThreadCreated {
                        thread: i,
                        domain: 1
                    }],
                )
            });
        }

        assert_eq!(gateway.syslog().len(), 10); // 5 requests + 5 responses
        assert_eq!(gateway.commitlog().len(), 6); // Genesis + 5 threads
        assert!(gateway.verify_integrity());
    }

    #[test]
    fn test_gateway_state_summary() {
        let mut gateway = AxiomGateway::new(1000);

        gateway.syscall(1, 0x03, [0, 0, 0, 0], 2000, |_, _| {
            (
                0,
                alloc::vec![CommitType::ThreadCreated { thread: 2, domain: 1 }],
            )
        });

        let state = gateway.state_summary();
        assert_eq!(state.syslog_len, 2);
        assert_eq!(state.syslog_next_id, 2);
        assert_eq!(state.commitlog_len, 2);
        assert_eq!(state.commitlog_seq, 1);
    }

    #[test]
    fn test_gateway_internal_commit() {
        let mut gateway = AxiomGateway::new(0);

        let commit_id =
            gateway.append_internal_commit(CommitType::ThreadKilled { thread: 1 }, 1000);

        assert_eq!(commit_id, gateway.commitlog().head());
        assert_eq!(gateway.syslog().len(), 0); // No syscall logged
        assert_eq!(gateway.commitlog().len(), 2); // Genesis + kill
    }

    #[test]
    fn test_gateway_security_event() {
        let mut gateway = AxiomGateway::new(0);
        gateway.security(
            4,
            SecurityEvent {
                kind: SecurityKind::ProtocolFault,
                frames: alloc::vec![1],
            },
            10,
        );
        assert_eq!(gateway.syslog().security_events().len(), 1);
        assert_eq!(gateway.commitlog().len(), 1);
    }
}
