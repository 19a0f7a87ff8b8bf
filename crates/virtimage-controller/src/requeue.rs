//! Requeue directives returned by steps, strategies and handlers

use std::time::Duration;

use kube::runtime::controller::Action;

/// Delay used for an immediate requeue
pub const IMMEDIATE_REQUEUE: Duration = Duration::from_secs(1);

/// Short poll used while a helper object is progressing
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// When the reconciler should look at the image again
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for the next watch event
    #[default]
    None,
    /// Requeue right away
    Immediate,
    /// Requeue after the given delay
    After(Duration),
}

impl Requeue {
    /// Requeue after `delay`
    pub fn after(delay: Duration) -> Self {
        Self::After(delay)
    }

    /// Whether no requeue is requested
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    fn delay(&self) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Immediate => Some(Duration::ZERO),
            Self::After(d) => Some(*d),
        }
    }

    /// Combine two directives, keeping the soonest requeue
    pub fn merge(self, other: Self) -> Self {
        match (self.delay(), other.delay()) {
            (None, _) => other,
            (_, None) => self,
            (Some(a), Some(b)) if b < a => other,
            _ => self,
        }
    }

    /// Convert into a kube-runtime action
    pub fn into_action(self) -> Action {
        match self {
            Self::None => Action::await_change(),
            Self::Immediate => Action::requeue(IMMEDIATE_REQUEUE),
            Self::After(d) => Action::requeue(d),
        }
    }
}

impl From<bool> for Requeue {
    /// `true` asks for an immediate requeue
    fn from(requeue: bool) -> Self {
        if requeue {
            Self::Immediate
        } else {
            Self::None
        }
    }
}
