use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared pause/resume switch read by every emission loop on each tick.
///
/// Changes are eventually visible: a tick that has already passed its check
/// finishes its publish even if a pause lands mid-flight.
#[derive(Debug)]
pub struct RunState {
    emitting: AtomicBool,
}

/// Outcome of a control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transition {
    Changed,
    Unchanged,
}

impl RunState {
    pub fn new(emitting: bool) -> Self {
        Self {
            emitting: AtomicBool::new(emitting),
        }
    }

    pub fn is_emitting(&self) -> bool {
        self.emitting.load(Ordering::Acquire)
    }

    pub fn pause(&self) -> Transition {
        self.set(false)
    }

    pub fn resume(&self) -> Transition {
        self.set(true)
    }

    fn set(&self, emitting: bool) -> Transition {
        if self.emitting.swap(emitting, Ordering::AcqRel) == emitting {
            Transition::Unchanged
        } else {
            tracing::info!(emitting, "emission state changed");
            Transition::Changed
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new(true)
    }
}
