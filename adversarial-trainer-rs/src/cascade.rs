//! Coarse-to-fine cascades of generator/discriminator pairs.
//!
//! Stages are ordered from the coarsest resolution to the finest. In one
//! step every stage receives the shared real batch downsampled (average
//! pooling) to its resolution. Stage `i > 0` is conditioned on the output
//! of stage `i − 1` produced earlier in the same step, upsampled with
//! nearest-neighbour interpolation and detached. Each stage runs one
//! discriminator update and one generator update.
//!
//! Tensors are rank 4, `[batch, channels, height, width]`, with square
//! spatial dimensions.

use candle_core::Tensor;
use tracing::debug;

use crate::data::{Batch, ShuffledBatchIterator};
use crate::error::{GanError, Result};
use crate::objective::{
    Conditioning, Discriminator, Generator, ObjectiveKind, ObjectivePair, ParameterGroup,
};
use crate::penalty::{GradientPenalty, Stabilizer};
use crate::phases::{discriminator_update, DiscriminatorUpdate, StepContext, UpdateCounters};
use crate::sampling::NoiseSampler;

/// One level of the cascade.
pub struct CascadeStage<G, D> {
    /// Side length of this stage's images.
    pub resolution: usize,
    /// The stage's networks and optimizers.
    pub pair: ObjectivePair<G, D>,
    /// Latent dimensionality of this stage's generator.
    pub noise_dim: usize,
}

/// Losses of one stage in one step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageLosses {
    /// Discriminator update.
    pub discriminator: DiscriminatorUpdate,
    /// Generator loss.
    pub generator: f32,
}

/// Losses of one cascade step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CascadeOutcome {
    /// Per-stage losses, coarse to fine.
    pub stages: Vec<StageLosses>,
    /// Mean discriminator loss across stages.
    pub mean_discriminator: f32,
    /// Mean generator loss across stages.
    pub mean_generator: f32,
}

/// Runs all stages of a cascade in order.
pub struct CascadeCoordinator<G, D> {
    stages: Vec<CascadeStage<G, D>>,
    data_resolution: usize,
    stabilizer: Stabilizer,
    penalty: Option<GradientPenalty>,
    samplers: Vec<NoiseSampler>,
    counters: UpdateCounters,
    outputs: Vec<Option<Tensor>>,
    conditioning: Vec<Option<Tensor>>,
}

impl<G: Generator, D: Discriminator> CascadeCoordinator<G, D> {
    /// Creates a coordinator for images of side `data_resolution`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty cascade, resolutions that
    /// do not strictly increase or do not divide the data resolution, stage
    /// conditioning that does not match its position, a cycle-consistent
    /// stage, or a critic objective without a stabilizer.
    pub fn new(
        stages: Vec<CascadeStage<G, D>>,
        data_resolution: usize,
        stabilizer: Stabilizer,
        seed: u64,
    ) -> Result<Self> {
        let resolutions: Vec<usize> = stages.iter().map(|s| s.resolution).collect();
        validate_resolutions(&resolutions, data_resolution)?;
        for (i, stage) in stages.iter().enumerate() {
            let expected = if i == 0 {
                Conditioning::None
            } else {
                Conditioning::Paired
            };
            if stage.pair.conditioning() != expected {
                return Err(GanError::Config(format!(
                    "cascade stage {i} must use {expected:?} conditioning"
                )));
            }
            if stage.pair.kind() == ObjectiveKind::CycleConsistent {
                return Err(GanError::Config(format!(
                    "cascade stage {i} cannot use the cycle-consistent objective"
                )));
            }
            if stage.pair.kind().is_critic() && !stabilizer.is_active() {
                return Err(GanError::Config(
                    "a critic objective needs a gradient penalty or weight clipping".to_string(),
                ));
            }
        }

        let penalty = match stabilizer {
            Stabilizer::GradientPenalty { coefficient } => {
                Some(GradientPenalty::new(coefficient, seed))
            }
            _ => None,
        };
        let samplers = stages
            .iter()
            .enumerate()
            .map(|(i, s)| NoiseSampler::new(s.noise_dim, seed.wrapping_add(i as u64 + 1)))
            .collect();
        let n = stages.len();
        Ok(Self {
            stages,
            data_resolution,
            stabilizer,
            penalty,
            samplers,
            counters: UpdateCounters::default(),
            outputs: vec![None; n],
            conditioning: vec![None; n],
        })
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always `false`; construction rejects empty cascades.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages, coarse to fine.
    #[must_use]
    pub fn stages(&self) -> &[CascadeStage<G, D>] {
        &self.stages
    }

    /// Mutable stages, for pushing learning rates.
    pub fn stages_mut(&mut self) -> &mut [CascadeStage<G, D>] {
        &mut self.stages
    }

    /// Update counters summed over stages.
    #[must_use]
    pub fn counters(&self) -> UpdateCounters {
        self.counters
    }

    /// Restores counters from a checkpoint.
    pub fn restore_counters(&mut self, counters: UpdateCounters) {
        self.counters = counters;
    }

    /// Generator output of each stage in the last step (detached).
    #[must_use]
    pub fn stage_outputs(&self) -> &[Option<Tensor>] {
        &self.outputs
    }

    /// Conditioning fed to each stage in the last step.
    #[must_use]
    pub fn stage_conditioning(&self) -> &[Option<Tensor>] {
        &self.conditioning
    }

    /// Executes one cascade step on a single real batch.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the batch is not rank 4 at the
    /// data resolution, [`GanError::Diverged`] on a non-finite loss, and
    /// propagates tensor errors.
    pub fn run_step(
        &mut self,
        ctx: StepContext,
        data: &mut ShuffledBatchIterator,
    ) -> Result<CascadeOutcome> {
        let batch = data.next_batch()?;
        let (_, _, h, w) = batch.inputs.dims4()?;
        if h != self.data_resolution || w != self.data_resolution {
            return Err(GanError::Config(format!(
                "cascade expects {0}x{0} images, got {h}x{w}",
                self.data_resolution
            )));
        }

        let mut stages = Vec::with_capacity(self.stages.len());
        let mut previous: Option<Tensor> = None;
        for (i, stage) in self.stages.iter_mut().enumerate() {
            let real = downsample(&batch.inputs, self.data_resolution / stage.resolution)?;
            let conditioning = previous
                .as_ref()
                .map(|out| out.upsample_nearest2d(stage.resolution, stage.resolution))
                .transpose()?;
            let stage_batch = Batch {
                inputs: real,
                labels: batch.labels.clone(),
                paired: conditioning.clone(),
            };

            let sampler = &mut self.samplers[i];
            let discriminator = discriminator_update(
                &mut stage.pair,
                &stage_batch,
                sampler,
                self.stabilizer,
                self.penalty.as_mut(),
                None,
                ctx.global_step,
            )?;
            self.counters.discriminator += 1;

            let z = sampler.sample(stage_batch.size(), stage_batch.inputs.device())?;
            let generated = stage.pair.generator_losses(&stage_batch, z)?;
            let generator = stage.pair.apply(
                ParameterGroup::Generator,
                &generated.loss,
                ctx.global_step,
            )?;
            self.counters.generator += 1;

            debug!(
                step = ctx.global_step,
                stage = i,
                resolution = stage.resolution,
                d_loss = discriminator.loss,
                g_loss = generator,
                "cascade stage updated"
            );

            self.conditioning[i] = conditioning;
            self.outputs[i] = Some(generated.fake_samples.clone());
            previous = Some(generated.fake_samples);
            stages.push(StageLosses {
                discriminator,
                generator,
            });
        }

        let n = stages.len().max(1) as f32;
        let mean_discriminator = stages.iter().map(|s| s.discriminator.loss).sum::<f32>() / n;
        let mean_generator = stages.iter().map(|s| s.generator).sum::<f32>() / n;
        Ok(CascadeOutcome {
            stages,
            mean_discriminator,
            mean_generator,
        })
    }
}

/// Checks cascade resolutions against the data resolution.
///
/// # Errors
///
/// Returns a configuration error describing the first violation.
pub fn validate_resolutions(resolutions: &[usize], data_resolution: usize) -> Result<()> {
    if resolutions.is_empty() {
        return Err(GanError::Config("cascade must have at least one stage".to_string()));
    }
    for pair in resolutions.windows(2) {
        if pair[0] >= pair[1] {
            return Err(GanError::Config(format!(
                "cascade resolutions must strictly increase, got {resolutions:?}"
            )));
        }
    }
    for &r in resolutions {
        if r == 0 || data_resolution % r != 0 {
            return Err(GanError::Config(format!(
                "stage resolution {r} does not divide data resolution {data_resolution}"
            )));
        }
    }
    Ok(())
}

/// Average-pools `[b, c, h, w]` by `factor` in both spatial dimensions.
///
/// # Errors
///
/// Propagates tensor errors.
pub fn downsample(images: &Tensor, factor: usize) -> Result<Tensor> {
    if factor <= 1 {
        return Ok(images.clone());
    }
    Ok(images.avg_pool2d(factor)?)
}
