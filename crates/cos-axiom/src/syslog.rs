//! System Event Log (SysLog)
//!
//! Records all syscalls (request + response) and security events for audit
//! trail. This is separate from CommitLog - SysLog is for auditing,
//! CommitLog records committed state mutations.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::types::{EventId, ThreadRef};

/// A system event (syscall request, response, or security event).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SysEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Thread that made the syscall
    pub sender: ThreadRef,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
    /// Event type
    pub event_type: SysEventType,
}

/// Type of system event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SysEventType {
    /// Syscall request from a thread
    Request {
        /// Syscall number
        syscall_num: u32,
        /// Syscall arguments (up to 4)
        args: [u32; 4],
    },
    /// Syscall response to a thread
    Response {
        /// ID of the request this responds to
        request_id: EventId,
        /// Syscall result (negative = error)
        result: i64,
    },
    /// Security-relevant refusal or fault
    Security(SecurityEvent),
}

/// A security event together with the invocation history that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// What happened
    pub kind: SecurityKind,
    /// Composite ids of the thread's invocation frames, frame 0 first
    pub frames: Vec<u32>,
}

/// Kinds of security events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityKind {
    /// A capability was used from outside its owner's composite
    TrustViolation {
        /// Capability table index
        capability: u32,
        /// Composite the owning domain belongs to
        owner_composite: u32,
        /// Composite of the caller's top frame
        frame_composite: u32,
    },
    /// Upcall into a domain that does not trust the caller
    UntrustedUpcall {
        /// Calling domain
        from: u32,
        /// Destination domain
        to: u32,
    },
    /// Return with no caller and no upcall to complete
    ProtocolFault,
    /// Active upcall with inconsistent brand / interrupted-thread linkage
    UpcallLinkage,
}

/// Maximum number of events to keep in memory
const MAX_SYSLOG_EVENTS: usize = 10000;

/// System event log for auditing.
///
/// Events are append-only with monotonic IDs.
pub struct SysLog {
    /// Event entries (append-only)
    events: Vec<SysEvent>,
    /// Next event ID to assign
    next_id: EventId,
}

impl SysLog {
    /// Create a new empty SysLog.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
        }
    }

    /// Log a syscall request.
    ///
    /// Returns the event ID for correlating with the response.
    pub fn log_request(
        &mut self,
        sender: ThreadRef,
        syscall_num: u32,
        args: [u32; 4],
        timestamp: u64,
    ) -> EventId {
        self.push(sender, timestamp, SysEventType::Request { syscall_num, args })
    }

    /// Log a syscall response.
    pub fn log_response(
        &mut self,
        sender: ThreadRef,
        request_id: EventId,
        result: i64,
        timestamp: u64,
    ) {
        self.push(
            sender,
            timestamp,
            SysEventType::Response { request_id, result },
        );
    }

    /// Log a security event.
    pub fn log_security(
        &mut self,
        sender: ThreadRef,
        event: SecurityEvent,
        timestamp: u64,
    ) -> EventId {
        self.push(sender, timestamp, SysEventType::Security(event))
    }

    fn push(&mut self, sender: ThreadRef, timestamp: u64, event_type: SysEventType) -> EventId {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(SysEvent {
            id,
            sender,
            timestamp,
            event_type,
        });

        self.trim_if_needed();
        id
    }

    /// Get all events.
    pub fn events(&self) -> &[SysEvent] {
        &self.events
    }

    /// Get all security events, oldest first.
    pub fn security_events(&self) -> Vec<&SecurityEvent> {
        self.events
            .iter()
            .filter_map(|e| match &e.event_type {
                SysEventType::Security(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Get events in a sequence range.
    pub fn get_range(&self, start_id: EventId, end_id: EventId) -> Vec<&SysEvent> {
        self.events
            .iter()
            .filter(|e| e.id >= start_id && e.id < end_id)
            .collect()
    }

    /// Get the most recent N events.
    pub fn get_recent(&self, count: usize) -> Vec<&SysEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Get the number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the next event ID.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Trim old events if exceeding max capacity.
    fn trim_if_needed(&mut self) {
        if self.events.len() > MAX_SYSLOG_EVENTS {
            let drain_count = self.events.len() - MAX_SYSLOG_EVENTS;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for SysLog {
    fn default() -> Self {
        Self::new()
    }
}
