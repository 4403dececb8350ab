//! Per-group optimizers (AdamW, SGD).

use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use crate::error::{GanError, Result};

/// Optimizer algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam with decoupled weight decay.
    #[default]
    AdamW,
    /// Plain stochastic gradient descent.
    Sgd,
}

/// Optimizer configuration shared by every parameter group.
///
/// Adversarial training conventionally lowers `beta1` to 0.5.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Algorithm.
    #[serde(default)]
    pub kind: OptimizerKind,
    /// Beta1 for Adam.
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    /// Beta2 for Adam.
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// Epsilon for numerical stability.
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Weight decay.
    #[serde(default)]
    pub weight_decay: f64,
}

fn default_beta1() -> f64 {
    0.5
}
fn default_beta2() -> f64 {
    0.9
}
fn default_eps() -> f64 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    /// Builds an optimizer over one parameter group's variables.
    ///
    /// # Errors
    ///
    /// Returns an error if candle rejects the parameters.
    pub fn build(&self, vars: Vec<Var>, learning_rate: f64) -> Result<GroupOptimizer> {
        let inner = match self.kind {
            OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr: learning_rate,
                    beta1: self.beta1,
                    beta2: self.beta2,
                    eps: self.eps,
                    weight_decay: self.weight_decay,
                };
                let opt = candle_nn::AdamW::new(vars, params)
                    .map_err(|e| GanError::Config(format!("failed to create AdamW: {e}")))?;
                Inner::AdamW(opt)
            }
            OptimizerKind::Sgd => {
                let opt = candle_nn::SGD::new(vars, learning_rate)
                    .map_err(|e| GanError::Config(format!("failed to create SGD: {e}")))?;
                Inner::Sgd(opt)
            }
        };
        Ok(GroupOptimizer { inner })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(GanError::Config(format!(
                "optimizer betas must be in [0, 1), got ({}, {})",
                self.beta1, self.beta2
            )));
        }
        if self.eps <= 0.0 || self.weight_decay < 0.0 {
            return Err(GanError::Config(
                "optimizer eps must be > 0 and weight_decay >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

enum Inner {
    AdamW(candle_nn::AdamW),
    Sgd(candle_nn::SGD),
}

/// Optimizer bound to exactly one parameter group.
pub struct GroupOptimizer {
    inner: Inner,
}

impl GroupOptimizer {
    /// Backpropagates `loss` and updates this group's variables only.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward pass or the update fails.
    pub fn step(&mut self, loss: &Tensor) -> Result<()> {
        match &mut self.inner {
            Inner::AdamW(opt) => opt.backward_step(loss)?,
            Inner::Sgd(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }

    /// Returns the current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        match &self.inner {
            Inner::AdamW(opt) => opt.learning_rate(),
            Inner::Sgd(opt) => opt.learning_rate(),
        }
    }

    /// Sets the learning rate (used by decay schedules).
    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.inner {
            Inner::AdamW(opt) => opt.set_learning_rate(lr),
            Inner::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

impl std::fmt::Debug for GroupOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            Inner::AdamW(_) => "AdamW",
            Inner::Sgd(_) => "SGD",
        };
        f.debug_struct("GroupOptimizer")
            .field("kind", &kind)
            .field("learning_rate", &self.learning_rate())
            .finish()
    }
}
