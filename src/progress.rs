//! Typed progress surface for UIs
//!
//! The library never prints; it publishes an operation queue and
//! byte-level progress through a listener trait, and front-ends render
//! those however they like.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::transfer::TransferListener;

/// Coarse steps of a run, published up front and marked as they
/// complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    WaitClients,
    WaitServer,
    ReadPartitionTable,
    TransferData,
    WritePartitionTable,
    WritePartitionFlags,
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    /// Device or image path the step applies to; empty for global steps.
    pub target: String,
    pub completed: bool,
}

pub trait ProgressListener: Send + Sync {
    fn operation_added(&self, _op: &Operation) {}
    fn operation_completed(&self, _op: &Operation) {}
    /// A receiver connected (unicast accept or chain predecessor).
    fn new_connection(&self, _peer: &str) {}
    fn warning(&self, _msg: &str) {}
    fn transfer(&self, _transferred: u64, _total: u64) {}
}

pub struct NoopProgress;
impl ProgressListener for NoopProgress {}

/// The pending-operations queue the orchestrator publishes.
pub struct OperationQueue {
    ops: Mutex<Vec<Operation>>,
    listener: Arc<dyn ProgressListener>,
}

impl OperationQueue {
    pub fn new(listener: Arc<dyn ProgressListener>) -> Self {
        OperationQueue {
            ops: Mutex::new(Vec::new()),
            listener,
        }
    }

    pub fn add(&self, kind: OperationKind, target: impl Into<String>) {
        let op = Operation {
            kind,
            target: target.into(),
            completed: false,
        };
        self.listener.operation_added(&op);
        self.ops.lock().push(op);
    }

    pub fn mark_completed(&self, kind: OperationKind, target: &str) {
        let mut ops = self.ops.lock();
        if let Some(op) = ops
            .iter_mut()
            .find(|op| op.kind == kind && op.target == target && !op.completed)
        {
            op.completed = true;
            self.listener.operation_completed(op);
        }
    }

    pub fn pending(&self) -> usize {
        self.ops.lock().iter().filter(|op| !op.completed).count()
    }

    pub fn clear(&self) {
        self.ops.lock().clear();
    }
}

/// Routes the transfer hub's byte-level callbacks into the progress
/// listener: chunk progress and per-peer drops (as warnings).
pub struct ProgressBridge(pub Arc<dyn ProgressListener>);

impl TransferListener for ProgressBridge {
    fn progress(&self, transferred: u64, total: u64) {
        self.0.transfer(transferred, total);
    }

    fn peer_failed(&self, peer: &str, msg: &str) {
        self.0.warning(&format!("receiver {peer} dropped: {msg}"));
    }
}
