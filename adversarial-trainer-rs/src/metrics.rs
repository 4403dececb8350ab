//! Per-step reports and windowed aggregation.
//!
//! Every step produces a [`StepReport`]. The [`MetricsCollector`] averages
//! reports between logging triggers so a log line summarizes the whole
//! interval rather than its last step, and keeps run-level totals.

use serde::{Deserialize, Serialize};

use crate::equilibrium::EquilibriumState;
use crate::lr_decay::LearningRateState;

/// Losses and state recorded for one training step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Global step after the update.
    pub step: u64,
    /// Epoch the step ran in.
    pub epoch: u64,
    /// Discriminator loss (mean across stages for cascades).
    pub discriminator_loss: Option<f32>,
    /// Generator loss (mean across stages for cascades).
    pub generator_loss: Option<f32>,
    /// Classifier loss.
    pub classifier_loss: Option<f32>,
    /// Weighted gradient penalty.
    pub penalty: Option<f32>,
    /// Supervised content loss.
    pub supervised_loss: Option<f32>,
    /// Unweighted cycle loss.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_loss: Option<f32>,
    /// Equilibrium state.
    pub equilibrium: Option<EquilibriumState>,
    /// Per-stage `(discriminator, generator)` losses of a cascade.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_losses: Vec<(f32, f32)>,
    /// Learning rates in effect.
    pub learning_rates: LearningRateState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn push(&mut self, value: Option<f32>) {
        if let Some(v) = value {
            self.sum += f64::from(v);
            self.count += 1;
        }
    }

    fn mean(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.sum / self.count as f64) as f32)
    }
}

/// Averages over the steps since the last flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    /// First step of the window.
    pub first_step: u64,
    /// Last step of the window.
    pub last_step: u64,
    /// Epoch of the last step.
    pub epoch: u64,
    /// Steps in the window.
    pub steps: u64,
    /// Mean discriminator loss.
    pub discriminator_loss: Option<f32>,
    /// Mean generator loss.
    pub generator_loss: Option<f32>,
    /// Mean classifier loss.
    pub classifier_loss: Option<f32>,
    /// Mean gradient penalty.
    pub penalty: Option<f32>,
    /// Mean supervised loss.
    pub supervised_loss: Option<f32>,
    /// Mean cycle loss.
    pub cycle_loss: Option<f32>,
    /// Equilibrium state at the last step.
    pub equilibrium: Option<EquilibriumState>,
    /// Learning rates at the last step.
    pub learning_rates: LearningRateState,
}

/// Run-level statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatistics {
    /// Steps recorded.
    pub total_steps: u64,
    /// Mean discriminator loss over the run.
    pub mean_discriminator_loss: Option<f32>,
    /// Mean generator loss over the run.
    pub mean_generator_loss: Option<f32>,
    /// Last report recorded.
    pub last: Option<StepReport>,
}

#[derive(Debug, Clone, Default)]
struct Window {
    first_step: Option<u64>,
    steps: u64,
    discriminator: RunningMean,
    generator: RunningMean,
    classifier: RunningMean,
    penalty: RunningMean,
    supervised: RunningMean,
    cycle: RunningMean,
}

/// Collects step reports.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    window: Window,
    last: Option<StepReport>,
    total_steps: u64,
    run_discriminator: RunningMean,
    run_generator: RunningMean,
    history: Vec<StepReport>,
    keep_history: bool,
}

impl MetricsCollector {
    /// Creates a collector. With `keep_history` every report is retained for
    /// export.
    #[must_use]
    pub fn new(keep_history: bool) -> Self {
        Self {
            keep_history,
            ..Self::default()
        }
    }

    /// Records one step.
    pub fn record(&mut self, report: StepReport) {
        let w = &mut self.window;
        w.first_step.get_or_insert(report.step);
        w.steps += 1;
        w.discriminator.push(report.discriminator_loss);
        w.generator.push(report.generator_loss);
        w.classifier.push(report.classifier_loss);
        w.penalty.push(report.penalty);
        w.supervised.push(report.supervised_loss);
        w.cycle.push(report.cycle_loss);

        self.total_steps += 1;
        self.run_discriminator.push(report.discriminator_loss);
        self.run_generator.push(report.generator_loss);
        if self.keep_history {
            self.history.push(report.clone());
        }
        self.last = Some(report);
    }

    /// Returns the window summary and starts a new window. `None` if nothing
    /// was recorded since the last flush.
    pub fn flush(&mut self) -> Option<WindowSummary> {
        let window = std::mem::take(&mut self.window);
        let first_step = window.first_step?;
        let last = self.last.as_ref()?;
        Some(WindowSummary {
            first_step,
            last_step: last.step,
            epoch: last.epoch,
            steps: window.steps,
            discriminator_loss: window.discriminator.mean(),
            generator_loss: window.generator.mean(),
            classifier_loss: window.classifier.mean(),
            penalty: window.penalty.mean(),
            supervised_loss: window.supervised.mean(),
            cycle_loss: window.cycle.mean(),
            equilibrium: last.equilibrium,
            learning_rates: last.learning_rates,
        })
    }

    /// Most recent report.
    #[must_use]
    pub fn last(&self) -> Option<&StepReport> {
        self.last.as_ref()
    }

    /// Retained reports (empty unless history is kept).
    #[must_use]
    pub fn history(&self) -> &[StepReport] {
        &self.history
    }

    /// Run-level statistics.
    #[must_use]
    pub fn statistics(&self) -> TrainingStatistics {
        TrainingStatistics {
            total_steps: self.total_steps,
            mean_discriminator_loss: self.run_discriminator.mean(),
            mean_generator_loss: self.run_generator.mean(),
            last: self.last.clone(),
        }
    }

    /// Exports retained reports as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.history)
    }
}
