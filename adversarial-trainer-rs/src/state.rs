//! Global-step bookkeeping.
//!
//! The global step counts completed training steps. Everything positional
//! (epoch, cursor, learning-rate decay, trigger firing) derives from it, so a
//! session restarted from a checkpoint tagged `k` picks up exactly where the
//! interrupted one would have continued.

use serde::{Deserialize, Serialize};

use crate::data::Cursor;

/// Position of a training session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    global_step: u64,
    steps_per_epoch: u64,
    total_epochs: u64,
}

impl TrainingState {
    /// Creates a state at step 0.
    #[must_use]
    pub fn new(steps_per_epoch: usize, total_epochs: u64) -> Self {
        Self {
            global_step: 0,
            steps_per_epoch: steps_per_epoch as u64,
            total_epochs,
        }
    }

    /// Completed steps.
    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Steps per epoch.
    #[must_use]
    pub fn steps_per_epoch(&self) -> u64 {
        self.steps_per_epoch
    }

    /// Epoch of the next step.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.global_step
            .checked_div(self.steps_per_epoch)
            .unwrap_or(0)
    }

    /// Index of the next step within its epoch.
    #[must_use]
    pub fn step_in_epoch(&self) -> u64 {
        self.global_step
            .checked_rem(self.steps_per_epoch)
            .unwrap_or(0)
    }

    /// Step count at which training ends.
    #[must_use]
    pub fn total_steps(&self) -> u64 {
        self.total_epochs.saturating_mul(self.steps_per_epoch)
    }

    /// Returns `true` once every configured epoch has run.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.global_step >= self.total_steps()
    }

    /// Fraction of training completed, in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        let total = self.total_steps();
        if total == 0 {
            1.0
        } else {
            (self.global_step as f64 / total as f64).min(1.0)
        }
    }

    /// Iterator cursor matching this state.
    #[must_use]
    pub fn cursor(&self, batch_size: usize) -> Cursor {
        Cursor::from_global_step(self.global_step, self.steps_per_epoch as usize, batch_size)
    }

    /// Records one completed step and returns the new global step.
    pub fn advance(&mut self) -> u64 {
        self.global_step += 1;
        self.global_step
    }

    /// Jumps to `global_step` completed steps.
    pub fn resume_at(&mut self, global_step: u64) {
        self.global_step = global_step;
    }

    /// Returns `true` when `interval` divides the global step.
    ///
    /// A zero interval never fires.
    #[must_use]
    pub fn fires(&self, interval: u64) -> bool {
        interval > 0 && self.global_step % interval == 0
    }
}
