//! Equilibrium control for autoencoding discriminators.
//!
//! The controller keeps the generator and discriminator losses in a target
//! ratio `γ = E[d_fake] / E[d_real]` through a proportional term `k`:
//!
//! ```text
//! L_D = d_real − k_t · d_fake
//! L_G = d_fake
//! k_{t+1} = clip(k_t + λ·(γ·d_real − d_fake), 0, 1)
//! M_t = d_real + |γ·d_real − d_fake|
//! ```
//!
//! `M_t` is a convergence measure for reporting; it never feeds back.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{GanError, Result};

/// Controller state after an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumState {
    /// Balance term `k_t`, always in `[0, 1]`.
    pub k: f32,
    /// Convergence measure `M_t`.
    pub measure: f32,
}

/// Proportional controller of the generator/discriminator balance.
#[derive(Debug, Clone)]
pub struct EquilibriumController {
    gamma: f32,
    lambda: f32,
    state: EquilibriumState,
}

impl EquilibriumController {
    /// Creates a controller with diversity ratio `gamma` and gain `lambda`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `gamma > 0` and `lambda >= 0`,
    /// both finite.
    pub fn new(gamma: f32, lambda: f32) -> Result<Self> {
        if !(gamma > 0.0 && gamma.is_finite()) {
            return Err(GanError::Config(format!(
                "equilibrium gamma must be > 0, got {gamma}"
            )));
        }
        if !(lambda >= 0.0 && lambda.is_finite()) {
            return Err(GanError::Config(format!(
                "equilibrium lambda must be >= 0, got {lambda}"
            )));
        }
        Ok(Self {
            gamma,
            lambda,
            state: EquilibriumState::default(),
        })
    }

    /// Current balance term.
    #[must_use]
    pub fn k(&self) -> f32 {
        self.state.k
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EquilibriumState {
        self.state
    }

    /// Target ratio.
    #[must_use]
    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    /// Restores `k` from a checkpoint.
    pub fn restore(&mut self, k: f32) {
        self.state = EquilibriumState {
            k: if k.is_finite() { k.clamp(0.0, 1.0) } else { 0.0 },
            measure: 0.0,
        };
    }

    /// Resets to `k = 0`.
    pub fn reset(&mut self) {
        self.state = EquilibriumState::default();
    }

    /// Discriminator loss `d_real − k·d_fake` with the current `k`.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn discriminator_loss(&self, d_real: &Tensor, d_fake: &Tensor) -> Result<Tensor> {
        Ok((d_real - d_fake.affine(f64::from(self.state.k), 0.0)?)?)
    }

    /// Advances `k` from the loss values of the step just taken.
    pub fn update(&mut self, d_real: f32, d_fake: f32) -> EquilibriumState {
        let balance = self.gamma * d_real - d_fake;
        let k = (self.state.k + self.lambda * balance).clamp(0.0, 1.0);
        self.state = EquilibriumState {
            k: if k.is_finite() { k } else { self.state.k },
            measure: d_real + balance.abs(),
        };
        self.state
    }
}
