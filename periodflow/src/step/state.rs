//! Step lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a step is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Constructed, nothing run yet.
    #[default]
    Created,
    /// Inputs acquired.
    Setup,
    /// Transformation done.
    Applied,
    /// Checks passed (possibly with warnings).
    Validated,
    /// Outputs written and registered. Terminal.
    Persisted,
    /// A phase failed. Terminal.
    Failed,
}

impl StepState {
    /// The state reached by the next successful phase.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Setup),
            Self::Setup => Some(Self::Applied),
            Self::Applied => Some(Self::Validated),
            Self::Validated => Some(Self::Persisted),
            Self::Persisted | Self::Failed => None,
        }
    }

    /// Returns true if no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Persisted | Self::Failed)
    }

    /// Returns true if `to` is reachable in one transition.
    ///
    /// `Failed` is reachable from every non-terminal state.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || self.next() == Some(to)
    }

    /// Name of the phase that leads into this state.
    #[must_use]
    pub const fn phase(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Setup => "setup",
            Self::Applied => "apply",
            Self::Validated => "validate",
            Self::Persisted => "persist",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Setup => write!(f, "setup"),
            Self::Applied => write!(f, "applied"),
            Self::Validated => write!(f, "validated"),
            Self::Persisted => write!(f, "persisted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
