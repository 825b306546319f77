//! In-memory state shared by the reconcile entry points
//!
//! Both pieces live as long as the process and are never persisted.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Single-flight guard for node reconciliation
///
/// [`try_enter`](ExecutionGuard::try_enter) either takes the guard or
/// reports that a run is already in progress. Nothing is queued.
#[derive(Debug, Default)]
pub struct ExecutionGuard {
    busy: AtomicBool,
}

/// Held while a guarded run is in progress; releases the guard on drop
#[derive(Debug)]
pub struct GuardPermit<'a> {
    guard: &'a ExecutionGuard,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move Idle -> Busy, or return `None` if already Busy
    pub fn try_enter(&self) -> Option<GuardPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| GuardPermit { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Drop for GuardPermit<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::SeqCst);
    }
}

/// Ports shared between the service and node reconcilers
///
/// - `desired`: port the elastic IP serves on. 0 means "take it from the
///   cluster". Set at construction or adopted once by
///   [`observe_node_port`](PortState::observe_node_port).
/// - `node`: port the API server listens on on each control plane node.
///   0 means "not known yet". Written only by `observe_node_port`.
///
/// The service reconciler is the only writer; the node reconciler only reads.
#[derive(Debug, Default)]
pub struct PortState {
    desired: AtomicI32,
    node: AtomicI32,
}

impl PortState {
    /// `desired_port` of 0 leaves the external port to be derived
    pub fn new(desired_port: i32) -> Self {
        Self {
            desired: AtomicI32::new(desired_port),
            node: AtomicI32::new(0),
        }
    }

    pub fn desired_port(&self) -> Option<i32> {
        non_zero(self.desired.load(Ordering::SeqCst))
    }

    pub fn node_port(&self) -> Option<i32> {
        non_zero(self.node.load(Ordering::SeqCst))
    }

    /// Record the node-side API server port
    ///
    /// The first observation also becomes the desired port when none was
    /// configured; a configured or previously adopted port is never
    /// overwritten. Returns the desired port in effect afterwards.
    pub fn observe_node_port(&self, port: i32) -> i32 {
        self.node.store(port, Ordering::SeqCst);
        match self
            .desired
            .compare_exchange(0, port, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => port,
            Err(existing) => existing,
        }
    }
}

fn non_zero(port: i32) -> Option<i32> {
    (port != 0).then_some(port)
}
