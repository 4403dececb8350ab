//! Loss divergence detection.
//!
//! A non-finite loss ends training with [`GanError::Diverged`]: retrying the
//! same step cannot recover an adversarial game whose losses blew up.
//!
//! [`LossMonitor`] additionally tracks an exponential moving average and
//! variance of each loss and reports spikes far outside the recent range.
//! Spikes are warnings only; adversarial losses oscillate by nature.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{GanError, Result};

/// Fails with [`GanError::Diverged`] when `value` is NaN or infinite.
///
/// # Errors
///
/// Returns the divergence error carrying the step and loss name.
pub fn ensure_finite(step: u64, loss: &str, value: f32) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(GanError::Diverged {
            step,
            loss: loss.to_string(),
            value,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct LossStatistics {
    ema: f32,
    var_ema: f32,
    observations: usize,
}

/// Moving statistics of named losses with spike detection.
#[derive(Debug, Clone)]
pub struct LossMonitor {
    stats: HashMap<String, LossStatistics>,
    ema_decay: f32,
    sigma_threshold: f32,
    min_observations: usize,
}

/// A loss observation far outside its recent range.
#[derive(Debug, Clone, PartialEq)]
pub struct LossSpike {
    /// Loss name.
    pub loss: String,
    /// Observed value.
    pub value: f32,
    /// Moving average before the observation.
    pub expected: f32,
    /// Deviation in standard deviations.
    pub deviation_sigma: f32,
}

impl LossMonitor {
    /// Creates a monitor that flags deviations above `sigma_threshold`.
    #[must_use]
    pub fn new(sigma_threshold: f32) -> Self {
        Self {
            stats: HashMap::new(),
            ema_decay: 0.99,
            sigma_threshold,
            min_observations: 50,
        }
    }

    /// Records a loss value. Returns a spike when the value deviates more
    /// than the threshold from the moving average.
    pub fn observe(&mut self, loss: &str, value: f32) -> Option<LossSpike> {
        let decay = self.ema_decay;
        let stats = self.stats.entry(loss.to_string()).or_default();

        let spike = if stats.observations >= self.min_observations {
            let std = stats.var_ema.sqrt().max(1e-6);
            let deviation_sigma = (value - stats.ema).abs() / std;
            (deviation_sigma > self.sigma_threshold).then(|| LossSpike {
                loss: loss.to_string(),
                value,
                expected: stats.ema,
                deviation_sigma,
            })
        } else {
            None
        };

        let alpha = if stats.observations == 0 {
            1.0
        } else {
            1.0 - decay
        };
        let delta = value - stats.ema;
        stats.ema += alpha * delta;
        if stats.observations > 0 {
            stats.var_ema = decay * stats.var_ema + alpha * delta * delta;
        }
        stats.observations += 1;

        if let Some(spike) = &spike {
            warn!(
                loss = %spike.loss,
                value = spike.value,
                expected = spike.expected,
                sigma = spike.deviation_sigma,
                "loss spike"
            );
        }
        spike
    }

    /// Moving average of a loss, if observed.
    #[must_use]
    pub fn average(&self, loss: &str) -> Option<f32> {
        self.stats.get(loss).map(|s| s.ema)
    }
}

impl Default for LossMonitor {
    fn default() -> Self {
        Self::new(6.0)
    }
}
