//! Per-thread invocation stack
//!
//! Frame 0 is the thread's base: the domain it was booted, created or
//! upcalled into. Every successful invocation pushes one frame and every
//! return pops one; the base frame is never popped. Each frame holds a
//! reference on its composite.

use alloc::vec::Vec;

use crate::error::KernelError;
use crate::types::{CompositeId, DomainId};

/// One domain crossing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvocationFrame {
    /// Domain entered
    pub domain: DomainId,
    /// Composite the thread executes in while this frame is on top
    pub composite: CompositeId,
    /// Caller's stack pointer to resume with
    pub sp: u64,
    /// Caller's instruction pointer to resume with
    pub ip: u64,
}

impl InvocationFrame {
    pub fn base(domain: DomainId, composite: CompositeId) -> Self {
        Self {
            domain,
            composite,
            sp: 0,
            ip: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InvocationStack {
    frames: Vec<InvocationFrame>,
    max_depth: usize,
}

impl InvocationStack {
    pub fn new(base: InvocationFrame, max_depth: usize) -> Self {
        let mut frames = Vec::with_capacity(max_depth.min(8));
        frames.push(base);
        Self { frames, max_depth }
    }

    /// Index of the top frame (0 when only the base is present).
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.max_depth
    }

    pub fn top(&self) -> &InvocationFrame {
        // frames is never empty
        &self.frames[self.frames.len() - 1]
    }

    /// Frame `n` from the top, counting the top as 1.
    pub fn nth_from_top(&self, n: usize) -> Option<&InvocationFrame> {
        let len = self.frames.len();
        if n == 0 || n > len {
            return None;
        }
        self.frames.get(len - n)
    }

    pub fn push(&mut self, frame: InvocationFrame) -> Result<(), KernelError> {
        if self.is_full() {
            return Err(KernelError::StackOverflow);
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pop the top frame. `None` at the base.
    pub fn pop(&mut self) -> Option<InvocationFrame> {
        if self.frames.len() <= 1 {
            return None;
        }
        self.frames.pop()
    }

    /// Replace every frame with a single base frame. Returns the old frames
    /// so their references can be released.
    pub fn reset_base(&mut self, base: InvocationFrame) -> Vec<InvocationFrame> {
        core::mem::replace(&mut self.frames, alloc::vec![base])
    }

    /// Frames from the base up.
    pub fn frames(&self) -> &[InvocationFrame] {
        &self.frames
    }
}
