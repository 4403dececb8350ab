//! Learning-rate state and decay schedules.
//!
//! Rates are a pure function of `(base, global_step, epoch)`, so a resumed
//! session recomputes exactly the rate it would have reached without the
//! restart. Every schedule clamps to a floor.

use serde::{Deserialize, Serialize};

use crate::error::{GanError, Result};
use crate::objective::ParameterGroup;

/// Current learning rate of each parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRateState {
    /// Generator learning rate.
    #[serde(default = "default_lr")]
    pub generator: f64,
    /// Discriminator / critic learning rate.
    #[serde(default = "default_lr")]
    pub discriminator: f64,
    /// Learning rate of the classifier union group (auxiliary-classifier objectives).
    #[serde(default = "default_lr")]
    pub classifier: f64,
}

fn default_lr() -> f64 {
    2e-4
}

impl Default for LearningRateState {
    fn default() -> Self {
        Self::uniform(default_lr())
    }
}

impl LearningRateState {
    /// Uses the same rate for every group.
    #[must_use]
    pub fn uniform(rate: f64) -> Self {
        Self {
            generator: rate,
            discriminator: rate,
            classifier: rate,
        }
    }

    /// Returns the rate of a parameter group.
    #[must_use]
    pub fn get(&self, group: ParameterGroup) -> f64 {
        match group {
            ParameterGroup::Generator => self.generator,
            ParameterGroup::Discriminator => self.discriminator,
            ParameterGroup::Classifier => self.classifier,
        }
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            generator: f(self.generator),
            discriminator: f(self.discriminator),
            classifier: f(self.classifier),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("generator", self.generator),
            ("discriminator", self.discriminator),
            ("classifier", self.classifier),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(GanError::Config(format!(
                    "{name} learning rate must be finite and > 0, got {rate}"
                )));
            }
        }
        Ok(())
    }
}

/// Learning-rate decay schedule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrDecay {
    /// No decay.
    #[default]
    Constant,

    /// Multiply by `factor` at every `every_epochs` epoch boundary.
    EpochMultiplicative {
        /// Epochs between decays.
        every_epochs: u64,
        /// Multiplicative factor in `(0, 1]`.
        factor: f64,
        /// Minimum rate.
        floor: f64,
    },

    /// Multiply by `factor` every `every_steps` global steps.
    StepMultiplicative {
        /// Steps between decays.
        every_steps: u64,
        /// Multiplicative factor in `(0, 1]`.
        factor: f64,
        /// Minimum rate.
        floor: f64,
    },

    /// Constant until `start_epoch`, then linear decay reaching zero at
    /// `total_epochs`.
    LinearTail {
        /// First epoch of the decay.
        start_epoch: u64,
        /// Epoch at which the rate would reach zero.
        total_epochs: u64,
        /// Minimum rate.
        floor: f64,
    },
}

impl LrDecay {
    /// Computes the decayed rate for a base rate at the given position.
    #[must_use]
    pub fn rate(&self, base: f64, global_step: u64, epoch: u64) -> f64 {
        match *self {
            Self::Constant => base,
            Self::EpochMultiplicative {
                every_epochs,
                factor,
                floor,
            } => clamp_floor(base * factor.powi(exponent(epoch, every_epochs)), base, floor),
            Self::StepMultiplicative {
                every_steps,
                factor,
                floor,
            } => clamp_floor(
                base * factor.powi(exponent(global_step, every_steps)),
                base,
                floor,
            ),
            Self::LinearTail {
                start_epoch,
                total_epochs,
                floor,
            } => {
                if epoch < start_epoch {
                    base
                } else {
                    let span = total_epochs.saturating_sub(start_epoch).max(1) as f64;
                    let remaining = total_epochs.saturating_sub(epoch) as f64;
                    clamp_floor(base * (remaining / span), base, floor)
                }
            }
        }
    }

    /// Checks schedule parameters.
    pub fn validate(&self) -> Result<()> {
        let (period, factor, floor) = match *self {
            Self::Constant => return Ok(()),
            Self::EpochMultiplicative {
                every_epochs,
                factor,
                floor,
            } => (every_epochs, factor, floor),
            Self::StepMultiplicative {
                every_steps,
                factor,
                floor,
            } => (every_steps, factor, floor),
            Self::LinearTail {
                start_epoch,
                total_epochs,
                floor,
            } => {
                if total_epochs <= start_epoch {
                    return Err(GanError::Config(format!(
                        "linear decay must end after it starts ({start_epoch} >= {total_epochs})"
                    )));
                }
                (1, 1.0, floor)
            }
        };
        if period == 0 {
            return Err(GanError::Config("decay period must be > 0".to_string()));
        }
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(GanError::Config(format!(
                "decay factor must be in (0, 1], got {factor}"
            )));
        }
        if !floor.is_finite() || floor < 0.0 {
            return Err(GanError::Config(format!(
                "decay floor must be >= 0, got {floor}"
            )));
        }
        Ok(())
    }
}

fn exponent(position: u64, period: u64) -> i32 {
    i32::try_from(position / period.max(1)).unwrap_or(i32::MAX)
}

fn clamp_floor(rate: f64, base: f64, floor: f64) -> f64 {
    rate.max(floor.min(base))
}

/// Tracks the learning-rate state of a session.
#[derive(Debug, Clone)]
pub struct LearningRateSchedule {
    base: LearningRateState,
    decay: LrDecay,
    current: LearningRateState,
}

impl LearningRateSchedule {
    /// Creates a schedule starting at the base rates.
    #[must_use]
    pub fn new(base: LearningRateState, decay: LrDecay) -> Self {
        Self {
            base,
            decay,
            current: base,
        }
    }

    /// Returns the rates currently in effect.
    #[must_use]
    pub fn current(&self) -> LearningRateState {
        self.current
    }

    /// Returns the configured base rates.
    #[must_use]
    pub fn base(&self) -> LearningRateState {
        self.base
    }

    /// Recomputes the rates for a position.
    ///
    /// Returns the new state when it differs from the one in effect, so the
    /// caller only touches optimizers on an actual change.
    pub fn evaluate(&mut self, global_step: u64, epoch: u64) -> Option<LearningRateState> {
        let next = self
            .base
            .map(|base| self.decay.rate(base, global_step, epoch));
        if next == self.current {
            None
        } else {
            self.current = next;
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_rate() {
        let decay = LrDecay::Constant;
        assert_eq!(decay.rate(1e-4, 10_000, 50), 1e-4);
    }

    #[test]
    fn test_epoch_decay_with_floor() {
        let decay = LrDecay::EpochMultiplicative {
            every_epochs: 10,
            factor: 0.5,
            floor: 1e-5,
        };
        assert_eq!(decay.rate(1e-4, 0, 0), 1e-4);
        assert_eq!(decay.rate(1e-4, 0, 9), 1e-4);
        assert!((decay.rate(1e-4, 0, 10) - 5e-5).abs() < 1e-15);
        assert!((decay.rate(1e-4, 0, 25) - 2.5e-5).abs() < 1e-15);
        assert_eq!(decay.rate(1e-4, 0, 1_000), 1e-5);
    }

    #[test]
    fn test_step_decay() {
        let decay = LrDecay::StepMultiplicative {
            every_steps: 100,
            factor: 0.5,
            floor: 2e-5,
        };
        assert_eq!(decay.rate(8e-5, 99, 0), 8e-5);
        assert!((decay.rate(8e-5, 100, 0) - 4e-5).abs() < 1e-15);
        assert_eq!(decay.rate(8e-5, 1_000, 0), 2e-5);
    }

    #[test]
    fn test_linear_tail() {
        let decay = LrDecay::LinearTail {
            start_epoch: 100,
            total_epochs: 200,
            floor: 0.0,
        };
        assert_eq!(decay.rate(2e-4, 0, 50), 2e-4);
        assert!((decay.rate(2e-4, 0, 150) - 1e-4).abs() < 1e-15);
        assert_eq!(decay.rate(2e-4, 0, 200), 0.0);
    }

    #[test]
    fn test_floor_never_raises_small_base() {
        let decay = LrDecay::EpochMultiplicative {
            every_epochs: 1,
            factor: 0.5,
            floor: 1e-3,
        };
        assert_eq!(decay.rate(1e-4, 0, 3), 1e-4);
    }

    #[test]
    fn test_validate_rejects_bad_factor() {
        let decay = LrDecay::EpochMultiplicative {
            every_epochs: 1,
            factor: 1.5,
            floor: 0.0,
        };
        assert!(decay.validate().is_err());
        let decay = LrDecay::StepMultiplicative {
            every_steps: 0,
            factor: 0.5,
            floor: 0.0,
        };
        assert!(decay.validate().is_err());
    }

    #[test]
    fn test_schedule_reports_changes_only() {
        let mut schedule = LearningRateSchedule::new(
            LearningRateState::uniform(1e-3),
            LrDecay::EpochMultiplicative {
                every_epochs: 2,
                factor: 0.1,
                floor: 0.0,
            },
        );
        assert!(schedule.evaluate(0, 0).is_none());
        assert!(schedule.evaluate(10, 1).is_none());
        let changed = schedule.evaluate(20, 2).unwrap();
        assert!((changed.generator - 1e-4).abs() < 1e-12);
        assert!(schedule.evaluate(21, 2).is_none());
    }

    #[test]
    fn test_schedule_recomputes_on_resume() {
        let decay = LrDecay::EpochMultiplicative {
            every_epochs: 1,
            factor: 0.5,
            floor: 0.0,
        };
        let mut continuous = LearningRateSchedule::new(LearningRateState::uniform(1.0), decay.clone());
        for epoch in 0..=4 {
            continuous.evaluate(epoch * 10, epoch);
        }
        let mut resumed = LearningRateSchedule::new(LearningRateState::uniform(1.0), decay);
        resumed.evaluate(40, 4);
        assert_eq!(continuous.current(), resumed.current());
    }

    #[test]
    fn test_group_lookup() {
        let state = LearningRateState {
            generator: 1.0,
            discriminator: 2.0,
            classifier: 3.0,
        };
        assert_eq!(state.get(ParameterGroup::Generator), 1.0);
        assert_eq!(state.get(ParameterGroup::Discriminator), 2.0);
        assert_eq!(state.get(ParameterGroup::Classifier), 3.0);
        assert!(LearningRateState::uniform(0.0).validate().is_err());
    }
}
