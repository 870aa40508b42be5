//! Deferred flush scheduling.
//!
//! The pipeline itself is synchronous. When a submit should not flush right
//! away it asks the host's [`Scheduler`] for one wake-up, and the host calls
//! back into [`crate::runtime::PipelineRuntime::flush_scheduled`] when it
//! fires.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// When accumulated ops are flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlushMode {
    /// Flush after every submit outside a sequential scope.
    Immediate,
    /// Flush at the end of the current synchronous turn.
    TurnBased,
    /// Flush once the current task queue drains.
    Async,
}

impl Default for FlushMode {
    fn default() -> Self {
        FlushMode::TurnBased
    }
}

pub trait Scheduler {
    /// Request one deferred flush. Repeated requests before it fires are
    /// coalesced by the runtime, not by the scheduler.
    fn schedule_once(&mut self, mode: FlushMode);
}

/// Scheduler that only records requests; the owner decides when they fire.
#[derive(Clone, Debug, Default)]
pub struct ManualScheduler {
    requests: Rc<RefCell<Vec<FlushMode>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the requests recorded so far.
    pub fn take_requests(&self) -> Vec<FlushMode> {
        std::mem::take(&mut *self.requests.borrow_mut())
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&mut self, mode: FlushMode) {
        self.requests.borrow_mut().push(mode);
    }
}
