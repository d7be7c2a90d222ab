//! Cycle Stage Tracking
//!
//! Provides the cycle state machine and a shared tracker recording which
//! stage the agent is in and how past cycles ended.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Stages of one synchronization cycle, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    /// No cycle in flight
    Idle,
    /// Fetching desired configuration and building cycle state
    Initializing,
    /// Downloading and extracting policy archives
    Syncing,
    /// Removing stale working-directory entries
    Cleaning,
    /// Writing the attribute document
    PersistingAttributes,
    /// Running policy commands
    Executing,
    /// Submitting the applied-configuration summary
    Reporting,
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStage::Idle => write!(f, "Idle"),
            CycleStage::Initializing => write!(f, "Initializing"),
            CycleStage::Syncing => write!(f, "Syncing"),
            CycleStage::Cleaning => write!(f, "Cleaning"),
            CycleStage::PersistingAttributes => write!(f, "PersistingAttributes"),
            CycleStage::Executing => write!(f, "Executing"),
            CycleStage::Reporting => write!(f, "Reporting"),
        }
    }
}

/// Stage transition information
#[derive(Debug, Clone)]
pub struct StageTransition {
    pub from: CycleStage,
    pub to: CycleStage,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Internal state data
struct StageTrackerInner {
    current: CycleStage,
    last_completed: Option<DateTime<Utc>>,
    cycles_completed: u64,
    cycles_aborted: u64,
    transitions: Vec<StageTransition>,
}

/// Thread-safe cycle stage tracker
#[derive(Clone)]
pub struct StageTracker {
    inner: Arc<RwLock<StageTrackerInner>>,
}

const MAX_TRANSITIONS: usize = 100;

impl StageTracker {
    /// Create a new tracker starting in Idle
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StageTrackerInner {
                current: CycleStage::Idle,
                last_completed: None,
                cycles_completed: 0,
                cycles_aborted: 0,
                transitions: Vec::new(),
            })),
        }
    }

    /// Get the current stage
    pub fn current_stage(&self) -> CycleStage {
        self.inner.read().current
    }

    /// When the last cycle reached Idle from Reporting
    pub fn last_completed(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_completed
    }

    pub fn cycles_completed(&self) -> u64 {
        self.inner.read().cycles_completed
    }

    pub fn cycles_aborted(&self) -> u64 {
        self.inner.read().cycles_aborted
    }

    /// Transition to a new stage
    pub fn transition_to(&self, next: CycleStage, reason: Option<String>) -> bool {
        let mut inner = self.inner.write();

        if !Self::is_valid_transition(inner.current, next) {
            tracing::warn!(from = %inner.current, to = %next, "Rejected cycle stage transition");
            return false;
        }

        let previous = inner.current;
        inner.current = next;

        if next == CycleStage::Idle && previous != CycleStage::Idle {
            if previous == CycleStage::Reporting {
                inner.cycles_completed += 1;
                inner.last_completed = Some(Utc::now());
            } else {
                inner.cycles_aborted += 1;
            }
        }

        inner.transitions.push(StageTransition {
            from: previous,
            to: next,
            timestamp: Utc::now(),
            reason,
        });

        if inner.transitions.len() > MAX_TRANSITIONS {
            inner.transitions.remove(0);
        }

        tracing::info!(from = %previous, to = %next, "Cycle stage transition");

        true
    }

    /// Check if a stage transition is valid
    fn is_valid_transition(from: CycleStage, to: CycleStage) -> bool {
        use CycleStage::*;

        if from == to {
            return true;
        }

        matches!(
            (from, to),
            (Idle, Initializing)
                | (Initializing, Syncing)
                | (Syncing, Cleaning)
                | (Cleaning, PersistingAttributes)
                | (PersistingAttributes, Executing)
                | (Executing, Reporting)
                // Completion, or abort from any stage
                | (_, Idle)
        )
    }

    /// Return to Idle, recording why
    pub fn set_idle(&self, reason: Option<String>) {
        self.transition_to(CycleStage::Idle, reason);
    }

    /// Get recent stage transitions, newest first
    pub fn recent_transitions(&self, count: usize) -> Vec<StageTransition> {
        let inner = self.inner.read();
        inner.transitions.iter().rev().take(count).cloned().collect()
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}
