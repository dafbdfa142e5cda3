use crate::error::AppError;
use std::fmt;

/// Active stages of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Authenticating,
    Fetching,
    Building,
    Notifying,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticating => write!(f, "authenticating"),
            Self::Fetching => write!(f, "fetching"),
            Self::Building => write!(f, "building"),
            Self::Notifying => write!(f, "notifying"),
        }
    }
}

/// Lifecycle of a single report run.
///
/// Transitions only move forward: `Idle → Authenticating → Fetching →
/// Building → Notifying → Done`. `Failed` can be entered from any active
/// stage and, like `Done`, is terminal.
#[derive(Debug)]
pub enum RunState {
    Idle,
    Active(Stage),
    Done,
    Failed { stage: Stage, error: AppError },
}

impl RunState {
    #[must_use]
    pub const fn new() -> Self {
        Self::Idle
    }

    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Active(stage) | Self::Failed { stage, .. } => Some(*stage),
            Self::Idle | Self::Done => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Moves to the next stage. Terminal states stay where they are.
    pub fn advance(&mut self) {
        let next = match self {
            Self::Idle => Self::Active(Stage::Authenticating),
            Self::Active(Stage::Authenticating) => Self::Active(Stage::Fetching),
            Self::Active(Stage::Fetching) => Self::Active(Stage::Building),
            Self::Active(Stage::Building) => Self::Active(Stage::Notifying),
            Self::Active(Stage::Notifying) => Self::Done,
            Self::Done | Self::Failed { .. } => return,
        };
        tracing::debug!(from = %self, to = %next, "Run state transition");
        *self = next;
    }

    /// Records a failure in the current stage. Only active states can fail.
    pub fn fail(&mut self, error: AppError) {
        if let Self::Active(stage) = *self {
            tracing::debug!(%stage, "Run state transition to failed");
            *self = Self::Failed { stage, error };
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active(stage) => write!(f, "{stage}"),
            Self::Done => write!(f, "done"),
            Self::Failed { stage, .. } => write!(f, "failed({stage})"),
        }
    }
}
