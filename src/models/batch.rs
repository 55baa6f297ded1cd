// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Import batch aggregate.
//!
//! A batch is never stored. Its status is recomputed from the member files on
//! every read so there is no second source of truth to drift.

use crate::models::fitness_file::{EffectiveState, FitnessFile};
use serde::{Deserialize, Serialize};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Aggregate status of an import batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    PartiallyFailed,
    Failed,
    Completed,
}

/// Per-state file counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
pub struct BatchSummary {
    pub total: u32,
    pub pending: u32,
    pub completed: u32,
    pub failed: u32,
}

impl BatchSummary {
    /// Fold effective file states into counts.
    pub fn from_states(states: impl IntoIterator<Item = EffectiveState>) -> Self {
        states.into_iter().fold(Self::default(), |mut acc, state| {
            acc.total += 1;
            match state {
                EffectiveState::Pending => acc.pending += 1,
                EffectiveState::Completed => acc.completed += 1,
                EffectiveState::Failed => acc.failed += 1,
            }
            acc
        })
    }

    pub fn from_files<'a>(files: impl IntoIterator<Item = &'a FitnessFile>) -> Self {
        Self::from_states(files.into_iter().map(FitnessFile::effective_state))
    }

    /// Strict precedence: pending dominates failed, which dominates completed.
    pub fn status(&self) -> BatchStatus {
        match (self.pending, self.failed, self.completed) {
            (p, _, _) if p > 0 => BatchStatus::Pending,
            (_, f, c) if f > 0 && c > 0 => BatchStatus::PartiallyFailed,
            (_, f, _) if f > 0 => BatchStatus::Failed,
            _ => BatchStatus::Completed,
        }
    }
}
