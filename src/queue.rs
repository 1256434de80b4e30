//! Single-slot FIFO scheduler for session operations.
//!
//! Many operations may be requested concurrently; exactly one is dispatched
//! to the helper at a time. The queue owns every parked operation and its
//! waiter, so releasing callers on disconnect or device switch is a local
//! drain — nothing can leak.

use std::collections::VecDeque;

use crate::ops::Operation;

pub struct OpQueue {
    pending: VecDeque<Operation>,
    active: Option<Operation>,
    next_id: u64,
}

impl OpQueue {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            active: None,
            next_id: 1,
        }
    }

    /// Park an operation at the tail, assigning its session-local id.
    pub fn enqueue(&mut self, mut op: Operation) -> u64 {
        op.id = self.next_id;
        self.next_id += 1;
        let id = op.id;
        tracing::debug!(op_id = id, kind = ?op.kind, "operation enqueued");
        self.pending.push_back(op);
        id
    }

    /// True when an operation currently holds the helper.
    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    /// True when anything is active or parked.
    pub fn is_busy(&self) -> bool {
        self.active.is_some() || !self.pending.is_empty()
    }

    /// Dequeue the head for dispatch. Callers must either install it with
    /// [`set_active`](Self::set_active) or resolve it on dispatch failure.
    pub fn take_next(&mut self) -> Option<Operation> {
        debug_assert!(self.active.is_none(), "dequeue with an operation active");
        self.pending.pop_front()
    }

    pub fn set_active(&mut self, op: Operation) {
        tracing::debug!(op_id = op.id, kind = ?op.kind, "operation active");
        self.active = Some(op);
    }

    pub fn active_mut(&mut self) -> Option<&mut Operation> {
        self.active.as_mut()
    }

    pub fn active_kind(&self) -> Option<crate::ops::OpKind> {
        self.active.as_ref().map(|op| op.kind)
    }

    /// Remove the active operation for completion.
    pub fn take_active(&mut self) -> Option<Operation> {
        self.active.take()
    }

    /// Resolve every parked and active caller with the sentinel `None`.
    pub fn release_all(&mut self) {
        if let Some(mut op) = self.active.take() {
            op.resolve(None);
        }
        for mut op in self.pending.drain(..) {
            op.resolve(None);
        }
    }

    /// Release everyone and restart id numbering, as on a device switch.
    pub fn reset(&mut self) {
        self.release_all();
        self.next_id = 1;
    }
}
