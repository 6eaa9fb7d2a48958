//! Fault-isolated pipeline stages.
//!
//! A stage owns one tokio task and one output pair of channels. Whatever
//! happens inside the task, including a panic, the output channels are closed
//! exactly once when it ends, so the next stage always observes completion.

mod producer;
mod transform;

pub use producer::SafeProducerStage;
pub use transform::SafeTransformStage;

use std::time::Duration;

use tokio::sync::watch;

use crate::channel::{DataChannel, ErrorChannel, DEFAULT_ERROR_CAPACITY, DEFAULT_POLL_INTERVAL};

/// Configuration shared by both stage kinds
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StageConfig {
    /// Name used in log events, metrics labels and panic errors
    pub name: Option<String>,
    /// Error channel capacity of a producer stage. Transform stages size
    /// their error channel from upstream instead.
    pub error_capacity: usize,
    /// Longest wait of a single error channel check
    pub poll_interval: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: None,
            error_capacity: DEFAULT_ERROR_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl StageConfig {
    pub(crate) fn stage_name(&self, fallback: &str) -> String {
        self.name.clone().unwrap_or_else(|| fallback.to_string())
    }
}

/// Lifecycle of a stage task.
///
/// `NotStarted -> Running -> Completed | Faulted -> Closed`. A stage is
/// started at most once and never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    NotStarted,
    Running,
    /// The main loop ended on exhaustion, cancellation or a returned error
    Completed,
    /// A panic was caught
    Faulted,
    /// Output channels are closed and the finalizer has run
    Closed { faulted: bool },
}

impl StageState {
    pub fn is_closed(&self) -> bool {
        matches!(self, StageState::Closed { .. })
    }
}

/// Read-only view of a stage's lifecycle, usable after the stage was started.
#[derive(Debug, Clone)]
pub struct StageMonitor {
    state: watch::Receiver<StageState>,
}

impl StageMonitor {
    pub fn state(&self) -> StageState {
        *self.state.borrow()
    }

    /// Wait until the stage has closed its output channels
    pub async fn closed(&self) -> StageState {
        let mut state = self.state.clone();
        let closed = state.wait_for(StageState::is_closed).await.map(|s| *s);
        // The task was dropped before reporting; report what it last said
        closed.unwrap_or_else(|_| *state.borrow())
    }
}

pub(crate) struct Lifecycle {
    state: watch::Sender<StageState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(StageState::NotStarted);
        Self { state }
    }

    pub(crate) fn monitor(&self) -> StageMonitor {
        StageMonitor {
            state: self.state.subscribe(),
        }
    }

    pub(crate) fn set(&self, state: StageState) {
        self.state.send_replace(state);
    }
}

/// Closes a stage's outputs when dropped: error channel first, then data
/// channel, then the finalizer.
///
/// Dropping also covers the task being cancelled at an await point, e.g. on
/// runtime shutdown.
pub(crate) struct CleanupGuard {
    stage: String,
    errors: ErrorChannel,
    data: DataChannel,
    finalizer: Option<Box<dyn FnOnce() + Send>>,
    lifecycle: Lifecycle,
    faulted: bool,
}

impl CleanupGuard {
    pub(crate) fn new(
        stage: String,
        errors: ErrorChannel,
        data: DataChannel,
        finalizer: Option<Box<dyn FnOnce() + Send>>,
        lifecycle: Lifecycle,
    ) -> Self {
        lifecycle.set(StageState::Running);
        Self {
            stage,
            errors,
            data,
            finalizer,
            lifecycle,
            faulted: false,
        }
    }

    pub(crate) fn completed(&self) {
        self.lifecycle.set(StageState::Completed);
    }

    pub(crate) fn faulted(&mut self) {
        self.faulted = true;
        self.lifecycle.set(StageState::Faulted);
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.errors.close();
        self.data.close();
        if let Some(finalizer) = self.finalizer.take() {
            finalizer();
        }
        self.lifecycle.set(StageState::Closed {
            faulted: self.faulted,
        });
        tracing::debug!(stage = %self.stage, faulted = self.faulted, "stage closed");
    }
}
