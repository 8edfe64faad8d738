//! Reconciliation state: what an external executor reports back about a
//! resource, and the version-skew model derived from it.
//!
//! The store bumps `config_version` on every config write. An executor that
//! applies a config reports `state_version` equal to the `config_version` it
//! applied. Comparing the two tells whether the desired config has been
//! confirmed.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Observed-state companion of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Bumped by the store on every config write. Never decreases.
    pub config_version: i64,
    /// Set by whatever reports observed state. May lag arbitrarily.
    pub state_version: i64,
    /// Free-form status label.
    #[serde(default)]
    pub state: String,
    /// Free-form health payload.
    #[serde(default)]
    pub monitoring: String,
    /// Last reported failure text.
    #[serde(default)]
    pub error: String,
}

/// Relation between the desired and the confirmed config version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Convergence {
    /// `state_version == config_version`.
    Converged,
    /// `state_version < config_version`; `behind` versions are unconfirmed.
    Pending { behind: i64 },
    /// `state_version > config_version`. The executor reported a version the
    /// store never issued.
    Ahead { by: i64 },
}

impl ResourceState {
    /// A state report as an executor would send it.
    pub fn reported(state_version: i64, state: impl Into<String>) -> Self {
        Self {
            state_version,
            state: state.into(),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    pub fn with_monitoring(mut self, monitoring: impl Into<String>) -> Self {
        self.monitoring = monitoring.into();
        self
    }

    pub fn convergence(&self) -> Convergence {
        match self.state_version.cmp(&self.config_version) {
            Ordering::Equal => Convergence::Converged,
            Ordering::Less => Convergence::Pending {
                behind: self.config_version - self.state_version,
            },
            Ordering::Greater => Convergence::Ahead {
                by: self.state_version - self.config_version,
            },
        }
    }

    pub fn is_converged(&self) -> bool {
        self.convergence() == Convergence::Converged
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.convergence(), Convergence::Pending { .. })
    }
}
