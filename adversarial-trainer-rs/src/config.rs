//! Configuration types for adversarial training sessions.
//!
//! # Overview
//!
//! [`GanTrainerConfig`] collects every orchestration setting: batch size,
//! objective, critic schedule, stabilizer, equilibrium control, learning
//! rates and their decay, cascade layout, sampling, trigger intervals, and
//! checkpointing. It is:
//! - **Serializable** - loaded from and saved to TOML files
//! - **Validated** - contradictory settings are rejected before training
//! - **Defaulted** - every field has a default, so partial files work
//!
//! Named presets reproduce well-known variants (`wgan-gp`, `wgan-clip`,
//! `began`, `acgan`, `srgan`, `lapgan`, `cyclegan`).
//!
//! # Example
//!
//! ```rust
//! use adversarial_trainer_rs::config::GanTrainerConfig;
//! use adversarial_trainer_rs::objective::ObjectiveKind;
//!
//! let config = GanTrainerConfig::builder()
//!     .batch_size(32)
//!     .objective(ObjectiveKind::Critic)
//!     .gradient_penalty(10.0)
//!     .build();
//! assert!(config.validate().is_ok());
//!
//! let preset = GanTrainerConfig::from_preset("began")?;
//! assert!(preset.equilibrium.is_some());
//! # Ok::<(), adversarial_trainer_rs::GanError>(())
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cascade::validate_resolutions;
use crate::equilibrium::EquilibriumController;
use crate::error::{GanError, Result};
use crate::lr_decay::{LearningRateState, LrDecay};
use crate::objective::{Conditioning, ObjectiveKind};
use crate::optimizer::OptimizerConfig;
use crate::penalty::Stabilizer;
use crate::phases::{CriticSchedule, GeneratorBatch};

/// Names accepted by [`GanTrainerConfig::from_preset`].
pub const PRESETS: [&str; 7] = [
    "wgan-gp",
    "wgan-clip",
    "began",
    "acgan",
    "srgan",
    "lapgan",
    "cyclegan",
];

/// Main configuration for a training session.
///
/// # Defaults
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `batch_size` | 64 | Examples per batch |
/// | `total_epochs` | 10 | Epochs to train |
/// | `noise_dim` | 32 | Latent dimensionality |
/// | `objective` | `standard` | Loss formulation |
/// | `critic_schedule` | fixed, 1 | Critic updates per step |
/// | `learning_rates` | 2e-4 | Per-group base rates |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GanTrainerConfig {
    /// Examples per batch. Must not exceed the dataset size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of epochs to train.
    #[serde(default = "default_total_epochs")]
    pub total_epochs: u64,

    /// Latent noise dimensionality. Zero for purely conditional generators.
    #[serde(default = "default_noise_dim")]
    pub noise_dim: usize,

    /// Loss formulation.
    #[serde(default)]
    pub objective: ObjectiveKind,

    /// Conditioning source of the generator.
    #[serde(default)]
    pub conditioning: Conditioning,

    /// Number of classes for label-conditioned objectives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<usize>,

    /// Which batch the generator update consumes.
    #[serde(default)]
    pub generator_batch: GeneratorBatch,

    /// Epochs of generator-only supervised training before adversarial
    /// updates begin.
    #[serde(default)]
    pub supervised_init_epochs: u64,

    /// Gradient penalty coefficient. Mutually exclusive with `weight_clip`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradient_penalty: Option<f64>,

    /// Critic weight clip bound. Mutually exclusive with `gradient_penalty`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_clip: Option<f64>,

    /// Weight of the L1 cycle loss (cycle-consistent objective only).
    #[serde(default = "default_cycle_weight")]
    pub cycle_weight: f64,

    /// Seed for shuffling, noise and penalty interpolation.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Loss spikes beyond this many standard deviations are logged.
    #[serde(default = "default_spike_sigma")]
    pub spike_sigma: f32,

    /// Base learning rates.
    #[serde(default)]
    pub learning_rates: LearningRateState,

    /// Optimizer settings shared by all groups.
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Critic updates per step.
    #[serde(default)]
    pub critic_schedule: CriticSchedule,

    /// Learning-rate decay.
    #[serde(default)]
    pub lr_decay: LrDecay,

    /// Equilibrium control (reconstruction objective only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equilibrium: Option<EquilibriumConfig>,

    /// Multi-stage cascade layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade: Option<CascadeConfig>,

    /// Fixed sampling input.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Trigger intervals.
    #[serde(default)]
    pub intervals: IntervalConfig,

    /// Checkpoint store.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Reference network sizes.
    #[serde(default)]
    pub model: ModelConfig,

    /// Synthetic dataset used by the command-line trainer.
    #[serde(default)]
    pub data: DataConfig,
}

fn default_batch_size() -> usize {
    64
}
fn default_total_epochs() -> u64 {
    10
}
fn default_noise_dim() -> usize {
    32
}
fn default_seed() -> u64 {
    42
}
fn default_cycle_weight() -> f64 {
    10.0
}
fn default_spike_sigma() -> f32 {
    6.0
}

impl Default for GanTrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            total_epochs: default_total_epochs(),
            noise_dim: default_noise_dim(),
            objective: ObjectiveKind::default(),
            conditioning: Conditioning::default(),
            num_classes: None,
            generator_batch: GeneratorBatch::default(),
            supervised_init_epochs: 0,
            gradient_penalty: None,
            weight_clip: None,
            cycle_weight: default_cycle_weight(),
            seed: default_seed(),
            spike_sigma: default_spike_sigma(),
            learning_rates: LearningRateState::default(),
            optimizer: OptimizerConfig::default(),
            critic_schedule: CriticSchedule::default(),
            lr_decay: LrDecay::default(),
            equilibrium: None,
            cascade: None,
            sampling: SamplingConfig::default(),
            intervals: IntervalConfig::default(),
            checkpoint: CheckpointConfig::default(),
            model: ModelConfig::default(),
            data: DataConfig::default(),
        }
    }
}

impl GanTrainerConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> GanTrainerConfigBuilder {
        GanTrainerConfigBuilder::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&content)?)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| GanError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Returns a named preset.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown name.
    pub fn from_preset(name: &str) -> Result<Self> {
        let base = Self::default();
        let config = match name {
            "wgan-clip" => Self {
                objective: ObjectiveKind::Critic,
                noise_dim: 128,
                critic_schedule: CriticSchedule::WarmUp {
                    critic_steps: 5,
                    warmup_critic_steps: 100,
                    warmup_steps: 25,
                    period: Some(500),
                },
                weight_clip: Some(0.01),
                learning_rates: LearningRateState::uniform(1e-4),
                optimizer: OptimizerConfig {
                    beta1: 0.0,
                    beta2: 0.9,
                    ..OptimizerConfig::default()
                },
                ..base
            },
            "wgan-gp" => Self {
                objective: ObjectiveKind::Critic,
                noise_dim: 128,
                critic_schedule: CriticSchedule::Fixed { critic_steps: 1 },
                gradient_penalty: Some(10.0),
                learning_rates: LearningRateState::uniform(2e-4),
                optimizer: OptimizerConfig {
                    beta1: 0.0,
                    beta2: 0.9,
                    ..OptimizerConfig::default()
                },
                ..base
            },
            "began" => Self {
                objective: ObjectiveKind::Reconstruction,
                noise_dim: 64,
                equilibrium: Some(EquilibriumConfig::default()),
                learning_rates: LearningRateState::uniform(1e-4),
                lr_decay: LrDecay::StepMultiplicative {
                    every_steps: 3000,
                    factor: 0.5,
                    floor: 2e-5,
                },
                data: DataConfig {
                    kind: SyntheticKind::Images,
                    ..DataConfig::default()
                },
                ..base
            },
            "acgan" => Self {
                objective: ObjectiveKind::AuxiliaryClassifier,
                conditioning: Conditioning::Labels,
                num_classes: Some(10),
                noise_dim: 128,
                sampling: SamplingConfig {
                    sample_count: 100,
                    ..SamplingConfig::default()
                },
                data: DataConfig {
                    modes: 10,
                    ..DataConfig::default()
                },
                ..base
            },
            "srgan" => Self {
                objective: ObjectiveKind::Standard,
                conditioning: Conditioning::Paired,
                noise_dim: 0,
                supervised_init_epochs: 2,
                generator_batch: GeneratorBatch::Reuse,
                learning_rates: LearningRateState::uniform(1e-4),
                lr_decay: LrDecay::EpochMultiplicative {
                    every_epochs: 5,
                    factor: 0.5,
                    floor: 1e-5,
                },
                sampling: SamplingConfig {
                    sample_count: 16,
                    ..SamplingConfig::default()
                },
                data: DataConfig {
                    kind: SyntheticKind::PairedImages,
                    ..DataConfig::default()
                },
                ..base
            },
            "lapgan" => Self {
                objective: ObjectiveKind::Standard,
                cascade: Some(CascadeConfig {
                    resolutions: vec![4, 8, 16],
                    noise_dims: vec![16, 32, 64],
                }),
                data: DataConfig {
                    kind: SyntheticKind::Images,
                    resolution: 16,
                    ..DataConfig::default()
                },
                ..base
            },
            "cyclegan" => Self {
                objective: ObjectiveKind::CycleConsistent,
                conditioning: Conditioning::Paired,
                noise_dim: 0,
                gradient_penalty: Some(10.0),
                critic_schedule: CriticSchedule::Fixed { critic_steps: 5 },
                lr_decay: LrDecay::LinearTail {
                    start_epoch: 5,
                    total_epochs: 10,
                    floor: 0.0,
                },
                sampling: SamplingConfig {
                    sample_count: 16,
                    ..SamplingConfig::default()
                },
                data: DataConfig {
                    kind: SyntheticKind::TwoDomains,
                    ..DataConfig::default()
                },
                ..base
            },
            other => {
                return Err(GanError::Config(format!(
                    "unknown preset {other:?}, expected one of {PRESETS:?}"
                )))
            }
        };
        Ok(config)
    }

    /// Resolves the stabilizer.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when both a gradient penalty and weight
    /// clipping are set.
    pub fn stabilizer(&self) -> Result<Stabilizer> {
        Stabilizer::from_options(self.gradient_penalty, self.weight_clip)
    }

    /// Validates the configuration.
    ///
    /// Checks that all parameters are within valid ranges and consistent
    /// with each other.
    ///
    /// # Errors
    ///
    /// Returns [`GanError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(GanError::Config("batch_size must be > 0".to_string()));
        }
        if self.total_epochs == 0 {
            return Err(GanError::Config("total_epochs must be > 0".to_string()));
        }
        self.learning_rates.validate()?;
        self.optimizer.validate()?;
        self.critic_schedule.validate()?;
        self.lr_decay.validate()?;

        let stabilizer = self.stabilizer()?;
        if self.objective.is_critic() && !stabilizer.is_active() {
            return Err(GanError::Config(
                "critic objectives need gradient_penalty or weight_clip".to_string(),
            ));
        }

        if self.objective == ObjectiveKind::CycleConsistent {
            if self.conditioning != Conditioning::Paired {
                return Err(GanError::Config(
                    "the cycle-consistent objective requires paired conditioning".to_string(),
                ));
            }
            if self.supervised_init_epochs > 0 || self.cascade.is_some() {
                return Err(GanError::Config(
                    "the cycle-consistent objective supports neither supervised_init_epochs nor cascades"
                        .to_string(),
                ));
            }
            if !(self.cycle_weight >= 0.0 && self.cycle_weight.is_finite()) {
                return Err(GanError::Config(format!(
                    "cycle_weight must be finite and >= 0, got {}",
                    self.cycle_weight
                )));
            }
        }

        if let Some(eq) = &self.equilibrium {
            if self.objective != ObjectiveKind::Reconstruction {
                return Err(GanError::Config(
                    "equilibrium control requires the reconstruction objective".to_string(),
                ));
            }
            EquilibriumController::new(eq.gamma, eq.lambda)?;
        }

        if self.supervised_init_epochs > 0 && self.conditioning != Conditioning::Paired {
            return Err(GanError::Config(
                "supervised_init_epochs requires paired conditioning".to_string(),
            ));
        }

        let labelled = self.objective == ObjectiveKind::AuxiliaryClassifier
            || self.conditioning == Conditioning::Labels;
        if labelled {
            let classes = self.num_classes.unwrap_or(0);
            if classes < 2 {
                return Err(GanError::Config(
                    "label-conditioned training needs num_classes >= 2".to_string(),
                ));
            }
            if self.sampling.sample_count % classes != 0 {
                return Err(GanError::Config(format!(
                    "sampling.sample_count {} must be a multiple of num_classes {classes}",
                    self.sampling.sample_count
                )));
            }
        }
        if self.objective == ObjectiveKind::AuxiliaryClassifier
            && self.conditioning != Conditioning::Labels
        {
            return Err(GanError::Config(
                "the auxiliary-classifier objective requires label conditioning".to_string(),
            ));
        }

        if self.noise_dim == 0 && self.conditioning == Conditioning::None && self.cascade.is_none()
        {
            return Err(GanError::Config(
                "an unconditional generator needs noise_dim > 0".to_string(),
            ));
        }

        if let Some(cascade) = &self.cascade {
            cascade.validate(self.data.resolution)?;
            if self.equilibrium.is_some()
                || self.supervised_init_epochs > 0
                || self.objective == ObjectiveKind::AuxiliaryClassifier
                || self.conditioning != Conditioning::None
            {
                return Err(GanError::Config(
                    "cascades support only unconditional standard, reconstruction or critic stages"
                        .to_string(),
                ));
            }
        }

        if self.sampling.sample_count == 0 {
            return Err(GanError::Config("sampling.sample_count must be > 0".to_string()));
        }
        if self.model.hidden_dims.is_empty() {
            return Err(GanError::Config("model.hidden_dims must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Builder for `GanTrainerConfig`.
#[derive(Debug, Default)]
pub struct GanTrainerConfigBuilder {
    batch_size: Option<usize>,
    total_epochs: Option<u64>,
    noise_dim: Option<usize>,
    objective: Option<ObjectiveKind>,
    conditioning: Option<Conditioning>,
    num_classes: Option<usize>,
    supervised_init_epochs: Option<u64>,
    gradient_penalty: Option<f64>,
    weight_clip: Option<f64>,
    cycle_weight: Option<f64>,
    seed: Option<u64>,
    learning_rates: Option<LearningRateState>,
    critic_schedule: Option<CriticSchedule>,
    lr_decay: Option<LrDecay>,
    equilibrium: Option<EquilibriumConfig>,
    cascade: Option<CascadeConfig>,
    intervals: Option<IntervalConfig>,
    checkpoint: Option<CheckpointConfig>,
    data: Option<DataConfig>,
}

impl GanTrainerConfigBuilder {
    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Sets the number of epochs.
    #[must_use]
    pub fn total_epochs(mut self, epochs: u64) -> Self {
        self.total_epochs = Some(epochs);
        self
    }

    /// Sets the latent dimensionality.
    #[must_use]
    pub fn noise_dim(mut self, dim: usize) -> Self {
        self.noise_dim = Some(dim);
        self
    }

    /// Sets the objective.
    #[must_use]
    pub fn objective(mut self, objective: ObjectiveKind) -> Self {
        self.objective = Some(objective);
        self
    }

    /// Sets the conditioning source.
    #[must_use]
    pub fn conditioning(mut self, conditioning: Conditioning) -> Self {
        self.conditioning = Some(conditioning);
        self
    }

    /// Sets the number of classes.
    #[must_use]
    pub fn num_classes(mut self, classes: usize) -> Self {
        self.num_classes = Some(classes);
        self
    }

    /// Sets the supervised-initialization length.
    #[must_use]
    pub fn supervised_init_epochs(mut self, epochs: u64) -> Self {
        self.supervised_init_epochs = Some(epochs);
        self
    }

    /// Enables a gradient penalty with the given coefficient.
    #[must_use]
    pub fn gradient_penalty(mut self, coefficient: f64) -> Self {
        self.gradient_penalty = Some(coefficient);
        self
    }

    /// Enables weight clipping with the given bound.
    #[must_use]
    pub fn weight_clip(mut self, bound: f64) -> Self {
        self.weight_clip = Some(bound);
        self
    }

    /// Sets the cycle loss weight.
    #[must_use]
    pub fn cycle_weight(mut self, weight: f64) -> Self {
        self.cycle_weight = Some(weight);
        self
    }

    /// Sets the seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the base learning rates.
    #[must_use]
    pub fn learning_rates(mut self, rates: LearningRateState) -> Self {
        self.learning_rates = Some(rates);
        self
    }

    /// Sets the critic schedule.
    #[must_use]
    pub fn critic_schedule(mut self, schedule: CriticSchedule) -> Self {
        self.critic_schedule = Some(schedule);
        self
    }

    /// Sets the learning-rate decay.
    #[must_use]
    pub fn lr_decay(mut self, decay: LrDecay) -> Self {
        self.lr_decay = Some(decay);
        self
    }

    /// Enables equilibrium control.
    #[must_use]
    pub fn equilibrium(mut self, equilibrium: EquilibriumConfig) -> Self {
        self.equilibrium = Some(equilibrium);
        self
    }

    /// Sets the cascade layout.
    #[must_use]
    pub fn cascade(mut self, cascade: CascadeConfig) -> Self {
        self.cascade = Some(cascade);
        self
    }

    /// Sets trigger intervals.
    #[must_use]
    pub fn intervals(mut self, intervals: IntervalConfig) -> Self {
        self.intervals = Some(intervals);
        self
    }

    /// Sets the checkpoint store.
    #[must_use]
    pub fn checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Sets the synthetic dataset.
    #[must_use]
    pub fn data(mut self, data: DataConfig) -> Self {
        self.data = Some(data);
        self
    }

    /// Builds the configuration with defaults for unset values.
    #[must_use]
    pub fn build(self) -> GanTrainerConfig {
        let defaults = GanTrainerConfig::default();
        GanTrainerConfig {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            total_epochs: self.total_epochs.unwrap_or(defaults.total_epochs),
            noise_dim: self.noise_dim.unwrap_or(defaults.noise_dim),
            objective: self.objective.unwrap_or_default(),
            conditioning: self.conditioning.unwrap_or_default(),
            num_classes: self.num_classes,
            supervised_init_epochs: self.supervised_init_epochs.unwrap_or(0),
            gradient_penalty: self.gradient_penalty,
            weight_clip: self.weight_clip,
            cycle_weight: self.cycle_weight.unwrap_or(defaults.cycle_weight),
            seed: self.seed.unwrap_or(defaults.seed),
            learning_rates: self.learning_rates.unwrap_or_default(),
            critic_schedule: self.critic_schedule.unwrap_or_default(),
            lr_decay: self.lr_decay.unwrap_or_default(),
            equilibrium: self.equilibrium,
            cascade: self.cascade,
            intervals: self.intervals.unwrap_or_default(),
            checkpoint: self.checkpoint.unwrap_or_default(),
            data: self.data.unwrap_or_default(),
            ..defaults
        }
    }
}

/// Equilibrium controller parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumConfig {
    /// Target ratio `E[d_fake] / E[d_real]`.
    #[serde(default = "default_gamma")]
    pub gamma: f32,
    /// Gain of the `k` update.
    #[serde(default = "default_lambda")]
    pub lambda: f32,
}

fn default_gamma() -> f32 {
    0.5
}
fn default_lambda() -> f32 {
    0.001
}

impl Default for EquilibriumConfig {
    fn default() -> Self {
        Self {
            gamma: default_gamma(),
            lambda: default_lambda(),
        }
    }
}

/// Cascade layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Stage resolutions, coarse to fine.
    pub resolutions: Vec<usize>,
    /// Noise dimensionality of each stage.
    pub noise_dims: Vec<usize>,
}

impl CascadeConfig {
    /// Checks the layout against the data resolution.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for shape violations.
    pub fn validate(&self, data_resolution: usize) -> Result<()> {
        validate_resolutions(&self.resolutions, data_resolution)?;
        if self.noise_dims.len() != self.resolutions.len() {
            return Err(GanError::Config(format!(
                "cascade has {} resolutions but {} noise dims",
                self.resolutions.len(),
                self.noise_dims.len()
            )));
        }
        if self.noise_dims.first() == Some(&0) {
            return Err(GanError::Config(
                "the first cascade stage needs noise_dim > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fixed sampling input settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Samples generated per trigger.
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,
    /// Seed of the fixed noise.
    #[serde(default = "default_sample_seed")]
    pub seed: u64,
}

fn default_sample_count() -> usize {
    64
}
fn default_sample_seed() -> u64 {
    7
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_count: default_sample_count(),
            seed: default_sample_seed(),
        }
    }
}

/// Trigger intervals in global steps. Zero disables a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalConfig {
    /// Logging interval.
    #[serde(default = "default_log_interval")]
    pub log: u64,
    /// Sampling interval.
    #[serde(default = "default_sample_interval")]
    pub sample: u64,
    /// Checkpoint interval.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint: u64,
}

fn default_log_interval() -> u64 {
    100
}
fn default_sample_interval() -> u64 {
    500
}
fn default_checkpoint_interval() -> u64 {
    1000
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            log: default_log_interval(),
            sample: default_sample_interval(),
            checkpoint: default_checkpoint_interval(),
        }
    }
}

/// Checkpoint store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Root directory.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// Checkpoints to keep; zero keeps all.
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,
    /// Whether to resume from the latest checkpoint at start.
    #[serde(default = "default_resume")]
    pub resume: bool,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./model")
}
fn default_keep_last_n() -> usize {
    3
}
fn default_resume() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            keep_last_n: default_keep_last_n(),
            resume: default_resume(),
        }
    }
}

/// Reference network sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden layer widths of every MLP.
    #[serde(default = "default_hidden_dims")]
    pub hidden_dims: Vec<usize>,
}

fn default_hidden_dims() -> Vec<usize> {
    vec![128, 128]
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dims: default_hidden_dims(),
        }
    }
}

/// Kind of synthetic dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticKind {
    /// 2-D Gaussian mixture on a ring, labelled by mode.
    #[default]
    Ring,
    /// Smooth random images `[channels, resolution, resolution]`.
    Images,
    /// Images paired with their downsampled counterparts.
    PairedImages,
    /// Two unaligned image domains of equal shape, the second as the paired
    /// input.
    TwoDomains,
}

/// Synthetic dataset settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset kind.
    #[serde(default)]
    pub kind: SyntheticKind,
    /// Number of examples.
    #[serde(default = "default_examples")]
    pub examples: usize,
    /// Mixture modes of the ring dataset.
    #[serde(default = "default_modes")]
    pub modes: usize,
    /// Image side length.
    #[serde(default = "default_resolution")]
    pub resolution: usize,
    /// Image channels.
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Downsampling factor of paired inputs.
    #[serde(default = "default_paired_factor")]
    pub paired_factor: usize,
}

fn default_examples() -> usize {
    2048
}
fn default_modes() -> usize {
    8
}
fn default_resolution() -> usize {
    8
}
fn default_channels() -> usize {
    1
}
fn default_paired_factor() -> usize {
    2
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            kind: SyntheticKind::default(),
            examples: default_examples(),
            modes: default_modes(),
            resolution: default_resolution(),
            channels: default_channels(),
            paired_factor: default_paired_factor(),
        }
    }
}
