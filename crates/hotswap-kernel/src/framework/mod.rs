//! Framework-wide lifecycle state.
//!
//! The [`FrameworkStateTracker`] is the single source of truth for whether the
//! framework is booting, running, warm-restarting or shutting down. Transitions
//! are validated against a fixed rule table and published with a lock-free
//! compare-and-set loop, so a reader never observes a state that is later
//! rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;
use tracing::debug;

/// Overall framework state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameworkState {
    /// Constructed, never started
    NotStarted = 0,
    /// Loading and enabling modules
    Starting = 1,
    /// Fully started
    Started = 2,
    /// Reloading every module without stopping the host
    WarmRestarting = 3,
    /// Disabling and unloading modules
    ShuttingDown = 4,
    /// Stopped; may be started again
    Shutdown = 5,
}

impl FrameworkState {
    const ALL: [FrameworkState; 6] = [
        FrameworkState::NotStarted,
        FrameworkState::Starting,
        FrameworkState::Started,
        FrameworkState::WarmRestarting,
        FrameworkState::ShuttingDown,
        FrameworkState::Shutdown,
    ];

    /// Every state, in ordinal order.
    pub fn all() -> &'static [FrameworkState] {
        &Self::ALL
    }

    fn from_ordinal(ordinal: u8) -> Self {
        Self::ALL[ordinal as usize]
    }

    /// Whether `self -> target` is a legal transition.
    pub fn can_transition_to(self, target: FrameworkState) -> bool {
        use FrameworkState::*;
        matches!(
            (self, target),
            (NotStarted, Starting)
                | (NotStarted, ShuttingDown)
                | (Starting, Started)
                | (Started, WarmRestarting)
                | (Started, ShuttingDown)
                | (WarmRestarting, Started)
                | (ShuttingDown, Shutdown)
                | (Shutdown, Starting)
        )
    }

    /// States in which modules may be loaded and enabled.
    pub fn accepts_module_work(self) -> bool {
        matches!(
            self,
            FrameworkState::Starting | FrameworkState::Started | FrameworkState::WarmRestarting
        )
    }
}

impl fmt::Display for FrameworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameworkState::NotStarted => "NotStarted",
            FrameworkState::Starting => "Starting",
            FrameworkState::Started => "Started",
            FrameworkState::WarmRestarting => "WarmRestarting",
            FrameworkState::ShuttingDown => "ShuttingDown",
            FrameworkState::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Rejected framework transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal framework transition from {from} to {to}")]
pub struct TransitionError {
    /// State at the time of the attempt
    pub from: FrameworkState,
    /// Requested target
    pub to: FrameworkState,
}

/// Lock-free holder of the current [`FrameworkState`].
#[derive(Debug)]
pub struct FrameworkStateTracker {
    current: AtomicU8,
}

impl FrameworkStateTracker {
    pub fn new() -> Self {
        Self::with_state(FrameworkState::NotStarted)
    }

    /// Tracker starting from an arbitrary state (restored runtimes, tests).
    pub fn with_state(state: FrameworkState) -> Self {
        Self {
            current: AtomicU8::new(state as u8),
        }
    }

    /// Current state.
    pub fn current(&self) -> FrameworkState {
        FrameworkState::from_ordinal(self.current.load(Ordering::Acquire))
    }

    /// Move to `target`, returning the state that was replaced.
    ///
    /// Validation and publication happen in one CAS loop: if another thread
    /// changes the state between the load and the swap, the new value is
    /// validated again before retrying.
    pub fn transition_to(&self, target: FrameworkState) -> Result<FrameworkState, TransitionError> {
        let mut observed = self.current.load(Ordering::Acquire);
        loop {
            let from = FrameworkState::from_ordinal(observed);
            if !from.can_transition_to(target) {
                return Err(TransitionError { from, to: target });
            }
            match self.current.compare_exchange_weak(
                observed,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(%from, to = %target, "framework state transition");
                    return Ok(from);
                }
                Err(actual) => observed = actual,
            }
        }
    }

    /// Whether module loading/enabling may proceed.
    pub fn accepts_module_work(&self) -> bool {
        self.current().accepts_module_work()
    }

    /// Whether the framework is fully started.
    pub fn is_started(&self) -> bool {
        self.current() == FrameworkState::Started
    }
}

impl Default for FrameworkStateTracker {
    fn default() -> Self {
        Self::new()
    }
}
