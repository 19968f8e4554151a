//! Threads and scheduler authority
//!
//! A thread carries its invocation stack, one authority record per level of
//! the scheduler hierarchy, and two small state machines: its role in the
//! brand/upcall protocol and its execution state.
//!
//! ```text
//! role:   Normal
//!         Brand { upcalls, pending }
//!         Upcall { Ready } --brand upcall--> Upcall { Active } --terminal return--> Upcall { Ready }
//!
//! exec:   Runnable --interrupted by upcall--> Preempted --resumed--> Runnable
//!         any --protocol fault--> Faulted
//! ```

use alloc::vec::Vec;

use crate::error::KernelError;
use crate::invstack::InvocationStack;
use crate::types::{DomainId, ThreadId};

/// Authority record at one hierarchy depth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedInfo {
    pub scheduler: Option<DomainId>,
    pub urgency: u32,
    /// Notification address registered by the scheduler at this level
    pub notification: Option<u64>,
}

/// Register context the thread resumes with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SavedRegs {
    pub ip: u64,
    pub sp: u64,
    pub args: [u64; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Ready,
    /// Running an upcall. `interrupted` is the thread to resume on the
    /// terminal return; `None` once a scheduler has resumed it directly.
    Active { interrupted: Option<ThreadId> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThreadRole {
    Normal,
    /// Holds a snapshot of its creator's invocation stack
    Brand {
        upcalls: Vec<ThreadId>,
        /// Upcalls requested while every upcall thread was active
        pending: u32,
    },
    /// Delivers upcalls for `brand`
    Upcall {
        brand: ThreadId,
        /// Brand stack depth when this thread was attached
        brand_depth: usize,
        activation: Activation,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    Runnable,
    Preempted,
    Faulted,
}

#[derive(Clone, Debug)]
pub struct Thread {
    pub id: ThreadId,
    pub stack: InvocationStack,
    pub sched: Vec<SchedInfo>,
    pub role: ThreadRole,
    pub exec: ExecState,
    /// Scheduler that last switched away from this thread
    pub sched_suspended: Option<DomainId>,
    /// Only the suspender or one of its ancestors may resume it
    pub sched_exclusive: bool,
    pub regs: SavedRegs,
}

impl Thread {
    pub fn new(id: ThreadId, stack: InvocationStack, sched_depth: u8) -> Self {
        Self {
            id,
            stack,
            sched: alloc::vec![SchedInfo::default(); sched_depth as usize],
            role: ThreadRole::Normal,
            exec: ExecState::Runnable,
            sched_suspended: None,
            sched_exclusive: false,
            regs: SavedRegs::default(),
        }
    }

    /// Domain the thread is executing in.
    pub fn current_domain(&self) -> DomainId {
        self.stack.top().domain
    }

    /// Does `spd`, a scheduler at `depth`, hold authority over this thread?
    pub fn scheduled_by(&self, spd: DomainId, depth: u8) -> bool {
        self.sched
            .get(depth as usize)
            .is_some_and(|info| info.scheduler == Some(spd))
    }

    /// Clear authority at every depth `>= from`.
    pub fn clear_authority_from(&mut self, from: usize) {
        for info in self.sched.iter_mut().skip(from) {
            info.scheduler = None;
            info.notification = None;
        }
    }

    pub fn is_active_upcall(&self) -> bool {
        matches!(
            self.role,
            ThreadRole::Upcall {
                activation: Activation::Active { .. },
                ..
            }
        )
    }

    // ========================================================================
    // Execution state transitions
    // ========================================================================

    pub fn preempt(&mut self) -> Result<(), KernelError> {
        match self.exec {
            ExecState::Runnable => {
                self.exec = ExecState::Preempted;
                Ok(())
            }
            ExecState::Preempted => Err(KernelError::InvalidArgument),
            ExecState::Faulted => Err(KernelError::ThreadFaulted),
        }
    }

    /// Leave the preempted state. Returns whether the thread was preempted.
    pub fn resume(&mut self) -> Result<bool, KernelError> {
        match self.exec {
            ExecState::Runnable => Ok(false),
            ExecState::Preempted => {
                self.exec = ExecState::Runnable;
                Ok(true)
            }
            ExecState::Faulted => Err(KernelError::ThreadFaulted),
        }
    }

    pub fn fault(&mut self) {
        self.exec = ExecState::Faulted;
    }

    // ========================================================================
    // Upcall transitions
    // ========================================================================

    /// Ready -> Active.
    pub fn activate_upcall(&mut self, interrupted: ThreadId) -> Result<(), KernelError> {
        match &mut self.role {
            ThreadRole::Upcall { activation, .. } if *activation == Activation::Ready => {
                *activation = Activation::Active {
                    interrupted: Some(interrupted),
                };
                Ok(())
            }
            _ => Err(KernelError::UpcallLinkage),
        }
    }

    /// Active -> Ready. Returns the thread to resume, if still attached.
    pub fn finish_upcall(&mut self) -> Result<Option<ThreadId>, KernelError> {
        match &mut self.role {
            ThreadRole::Upcall { activation, .. } => match *activation {
                Activation::Active { interrupted } => {
                    *activation = Activation::Ready;
                    Ok(interrupted)
                }
                Activation::Ready => Err(KernelError::UpcallLinkage),
            },
            _ => Err(KernelError::UpcallLinkage),
        }
    }

    /// Forget the interrupted thread after a scheduler resumed it.
    pub fn detach_interrupted(&mut self) {
        if let ThreadRole::Upcall {
            activation: Activation::Active { interrupted },
            ..
        } = &mut self.role
        {
            *interrupted = None;
        }
    }
}
