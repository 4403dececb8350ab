//! Adversarial objectives and parameter-group ownership.
//!
//! An [`ObjectivePair`] bundles a generator, a discriminator, the parameter
//! groups that own their variables, and one optimizer per group. It computes
//! the loss terms of the configured [`ObjectiveKind`] and applies each loss to
//! exactly one group.
//!
//! # Parameter groups
//!
//! Variables are tagged at creation: a network builds its layers from the
//! [`VarBuilder`] returned by [`ParameterGroups::builder`], which writes into
//! that group's own `VarMap`. There is no name matching. `Generator` and
//! `Discriminator` must be disjoint; `Classifier` is the union of both and is
//! only ever optimized by the auxiliary-classifier loss.
//!
//! # Objectives
//!
//! | kind | discriminator | generator |
//! |---|---|---|
//! | `Standard` | `BCE(D(x),1) + BCE(D(G),0)` | `BCE(D(G),1)` |
//! | `AuxiliaryClassifier` | as standard, plus `CE` class loss | as standard |
//! | `Reconstruction` | `L1(x,D(x)) + L1(G,D(G))` | `L1(G,D(G))` |
//! | `Critic` | `mean(D(G)) - mean(D(x))` | `-mean(D(G))` |
//! | `CycleConsistent` | critic terms of both domains | critic terms plus `w * L1` cycle loss |
//!
//! A cycle-consistent pair translates between two domains: A is the batch's
//! paired input and B the batch inputs. The pair's own networks map A to B
//! and score B; a [`CycleBranch`] maps B back to A and scores A. Both
//! generators live in the `Generator` group and both critics in the
//! `Discriminator` group, so one update moves both directions.

use std::collections::HashSet;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::data::Batch;
use crate::divergence::ensure_finite;
use crate::error::{GanError, Result};
use crate::lr_decay::LearningRateState;
use crate::optimizer::{GroupOptimizer, OptimizerConfig};

/// Input handed to a generator.
#[derive(Debug, Clone, Default)]
pub struct GeneratorInput {
    /// Latent noise, `[batch, noise_dim]`.
    pub noise: Option<Tensor>,
    /// Conditioning (one-hot labels or a paired input).
    pub conditioning: Option<Tensor>,
}

/// Output of a discriminator.
#[derive(Debug, Clone)]
pub struct DiscriminatorOutput {
    /// Realness logits, critic scores, or a reconstruction of the input.
    pub score: Tensor,
    /// Class logits for auxiliary-classifier objectives.
    pub class_logits: Option<Tensor>,
}

/// A generator network.
pub trait Generator {
    /// Produces samples from noise and/or conditioning.
    fn generate(&self, input: &GeneratorInput) -> candle_core::Result<Tensor>;
}

/// A discriminator, critic, or autoencoding discriminator.
pub trait Discriminator {
    /// Scores `samples`, optionally conditioned.
    fn score(
        &self,
        samples: &Tensor,
        conditioning: Option<&Tensor>,
    ) -> candle_core::Result<DiscriminatorOutput>;
}

impl<T: Generator + ?Sized> Generator for Box<T> {
    fn generate(&self, input: &GeneratorInput) -> candle_core::Result<Tensor> {
        (**self).generate(input)
    }
}

impl<T: Discriminator + ?Sized> Discriminator for Box<T> {
    fn score(
        &self,
        samples: &Tensor,
        conditioning: Option<&Tensor>,
    ) -> candle_core::Result<DiscriminatorOutput> {
        (**self).score(samples, conditioning)
    }
}

/// Loss formulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    /// Sigmoid cross-entropy on realness logits.
    #[default]
    Standard,
    /// Standard losses plus a class-prediction loss.
    AuxiliaryClassifier,
    /// Autoencoding discriminator with L1 reconstruction losses.
    Reconstruction,
    /// Wasserstein critic.
    Critic,
    /// Two critic pairs translating between domains, tied by an L1 cycle loss.
    CycleConsistent,
}

impl ObjectiveKind {
    /// Whether the discriminator is an unbounded critic that needs a
    /// stabilizer.
    #[must_use]
    pub fn is_critic(&self) -> bool {
        matches!(self, Self::Critic | Self::CycleConsistent)
    }
}

/// Where the generator's conditioning comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conditioning {
    /// Unconditional.
    #[default]
    None,
    /// One-hot class labels of the batch.
    Labels,
    /// The batch's paired input (e.g. a low-resolution image).
    Paired,
}

/// A set of parameters that one optimizer owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGroup {
    /// Generator variables.
    Generator,
    /// Discriminator / critic variables.
    Discriminator,
    /// Union of generator and discriminator variables.
    Classifier,
}

impl std::fmt::Display for ParameterGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generator => write!(f, "generator"),
            Self::Discriminator => write!(f, "discriminator"),
            Self::Classifier => write!(f, "classifier"),
        }
    }
}

/// Per-group variable stores.
#[derive(Clone)]
pub struct ParameterGroups {
    generator: VarMap,
    discriminator: VarMap,
}

impl Default for ParameterGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterGroups {
    /// Creates empty groups.
    #[must_use]
    pub fn new() -> Self {
        Self {
            generator: VarMap::new(),
            discriminator: VarMap::new(),
        }
    }

    /// Returns a builder that creates variables owned by `group`.
    ///
    /// # Errors
    ///
    /// `Classifier` is a derived union and owns no variables of its own.
    pub fn builder(
        &self,
        group: ParameterGroup,
        dtype: DType,
        device: &Device,
    ) -> Result<VarBuilder<'static>> {
        let varmap = self.varmap(group).ok_or_else(|| {
            GanError::Config("the classifier group cannot own variables".to_string())
        })?;
        Ok(VarBuilder::from_varmap(varmap, dtype, device))
    }

    /// Returns the store backing a primary group.
    #[must_use]
    pub fn varmap(&self, group: ParameterGroup) -> Option<&VarMap> {
        match group {
            ParameterGroup::Generator => Some(&self.generator),
            ParameterGroup::Discriminator => Some(&self.discriminator),
            ParameterGroup::Classifier => None,
        }
    }

    /// Returns the variables of a group.
    #[must_use]
    pub fn vars(&self, group: ParameterGroup) -> Vec<Var> {
        match group {
            ParameterGroup::Generator => self.generator.all_vars(),
            ParameterGroup::Discriminator => self.discriminator.all_vars(),
            ParameterGroup::Classifier => {
                let mut vars = self.generator.all_vars();
                vars.extend(self.discriminator.all_vars());
                vars
            }
        }
    }

    /// Number of scalar parameters in a group.
    #[must_use]
    pub fn parameter_count(&self, group: ParameterGroup) -> usize {
        self.vars(group).iter().map(|v| v.elem_count()).sum()
    }

    /// Verifies that no variable belongs to both primary groups.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the number of shared variables.
    pub fn validate_disjoint(&self) -> Result<()> {
        let generator: HashSet<_> = self
            .generator
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().id())
            .collect();
        let shared = self
            .discriminator
            .all_vars()
            .iter()
            .filter(|v| generator.contains(&v.as_tensor().id()))
            .count();
        if shared > 0 {
            return Err(GanError::Config(format!(
                "generator and discriminator groups share {shared} variable(s)"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ParameterGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterGroups")
            .field("generator", &self.generator.all_vars().len())
            .field("discriminator", &self.discriminator.all_vars().len())
            .finish()
    }
}

/// Discriminator-side loss terms of one update.
#[derive(Debug, Clone)]
pub struct DiscriminatorLosses {
    /// Loss term on real samples.
    pub real: Tensor,
    /// Loss term on generated samples.
    pub fake: Tensor,
    /// `real + fake`.
    pub total: Tensor,
    /// The generated samples, detached from the generator graph.
    pub fake_samples: Tensor,
    /// Detached samples of the reverse generator (cycle-consistent only).
    pub reverse_fake_samples: Option<Tensor>,
}

/// Generator-side loss of one update.
#[derive(Debug, Clone)]
pub struct GeneratorLosses {
    /// Generator loss, cycle term included.
    pub loss: Tensor,
    /// The generated samples, detached.
    pub fake_samples: Tensor,
    /// Unweighted cycle loss, detached (cycle-consistent only).
    pub cycle: Option<Tensor>,
}

/// Reverse direction of a cycle-consistent pair.
pub struct CycleBranch<G, D> {
    /// Generator from domain B (batch inputs) to domain A (paired inputs).
    pub generator: G,
    /// Critic of domain A.
    pub discriminator: D,
    /// Weight of the cycle loss in the generator loss.
    pub weight: f64,
}

/// A generator/discriminator pair with its objective and optimizers.
pub struct ObjectivePair<G, D> {
    generator: G,
    discriminator: D,
    cycle: Option<CycleBranch<G, D>>,
    groups: ParameterGroups,
    kind: ObjectiveKind,
    conditioning: Conditioning,
    generator_optimizer: GroupOptimizer,
    discriminator_optimizer: GroupOptimizer,
    classifier_optimizer: Option<GroupOptimizer>,
}

/// Pair of boxed networks, as used by sessions built from configuration.
pub type DynObjectivePair = ObjectivePair<Box<dyn Generator>, Box<dyn Discriminator>>;

impl<G: Generator, D: Discriminator> ObjectivePair<G, D> {
    /// Creates a pair and one optimizer per parameter group.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the groups overlap, if an
    /// auxiliary-classifier objective is not label-conditioned, or for the
    /// cycle-consistent objective, which [`ObjectivePair::cycle_consistent`]
    /// builds.
    pub fn new(
        generator: G,
        discriminator: D,
        groups: ParameterGroups,
        kind: ObjectiveKind,
        conditioning: Conditioning,
        optimizer: &OptimizerConfig,
        rates: &LearningRateState,
    ) -> Result<Self> {
        if kind == ObjectiveKind::AuxiliaryClassifier && conditioning != Conditioning::Labels {
            return Err(GanError::Config(
                "the auxiliary-classifier objective requires label conditioning".to_string(),
            ));
        }
        if kind == ObjectiveKind::CycleConsistent {
            return Err(GanError::Config(
                "a cycle-consistent pair needs its reverse branch".to_string(),
            ));
        }
        Self::assemble(generator, discriminator, None, groups, kind, conditioning, optimizer, rates)
    }

    /// Creates a cycle-consistent pair. `generator` maps domain A to B and
    /// `discriminator` scores B; `branch` holds the reverse direction.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the groups overlap or the cycle
    /// weight is negative or not finite.
    pub fn cycle_consistent(
        generator: G,
        discriminator: D,
        branch: CycleBranch<G, D>,
        groups: ParameterGroups,
        optimizer: &OptimizerConfig,
        rates: &LearningRateState,
    ) -> Result<Self> {
        if !(branch.weight >= 0.0 && branch.weight.is_finite()) {
            return Err(GanError::Config(format!(
                "cycle weight must be finite and >= 0, got {}",
                branch.weight
            )));
        }
        Self::assemble(
            generator,
            discriminator,
            Some(branch),
            groups,
            ObjectiveKind::CycleConsistent,
            Conditioning::Paired,
            optimizer,
            rates,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        generator: G,
        discriminator: D,
        cycle: Option<CycleBranch<G, D>>,
        groups: ParameterGroups,
        kind: ObjectiveKind,
        conditioning: Conditioning,
        optimizer: &OptimizerConfig,
        rates: &LearningRateState,
    ) -> Result<Self> {
        groups.validate_disjoint()?;
        let generator_optimizer =
            optimizer.build(groups.vars(ParameterGroup::Generator), rates.generator)?;
        let discriminator_optimizer =
            optimizer.build(groups.vars(ParameterGroup::Discriminator), rates.discriminator)?;
        let classifier_optimizer = if kind == ObjectiveKind::AuxiliaryClassifier {
            Some(optimizer.build(groups.vars(ParameterGroup::Classifier), rates.classifier)?)
        } else {
            None
        };

        Ok(Self {
            generator,
            discriminator,
            cycle,
            groups,
            kind,
            conditioning,
            generator_optimizer,
            discriminator_optimizer,
            classifier_optimizer,
        })
    }

    /// Objective variant.
    #[must_use]
    pub fn kind(&self) -> ObjectiveKind {
        self.kind
    }

    /// Conditioning source.
    #[must_use]
    pub fn conditioning(&self) -> Conditioning {
        self.conditioning
    }

    /// Parameter groups of this pair.
    #[must_use]
    pub fn parameters(&self) -> &ParameterGroups {
        &self.groups
    }

    /// Selects the conditioning tensor of a batch.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the batch lacks the required array.
    pub fn batch_conditioning(&self, batch: &Batch) -> Result<Option<Tensor>> {
        let missing = |what: &str| {
            GanError::Config(format!(
                "{:?} conditioning needs batches with {what}",
                self.conditioning
            ))
        };
        match self.conditioning {
            Conditioning::None => Ok(None),
            Conditioning::Labels => batch
                .labels
                .clone()
                .map(Some)
                .ok_or_else(|| missing("labels")),
            Conditioning::Paired => batch
                .paired
                .clone()
                .map(Some)
                .ok_or_else(|| missing("a paired input")),
        }
    }

    /// Conditioning the discriminator sees. Cycle critics score samples
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the batch lacks the required array.
    pub fn discriminator_conditioning(&self, batch: &Batch) -> Result<Option<Tensor>> {
        if self.cycle.is_some() {
            return Ok(None);
        }
        self.batch_conditioning(batch)
    }

    /// Builds the generator input for a batch.
    ///
    /// # Errors
    ///
    /// Fails if the batch lacks the configured conditioning.
    pub fn generator_input(&self, batch: &Batch, noise: Option<Tensor>) -> Result<GeneratorInput> {
        Ok(GeneratorInput {
            noise,
            conditioning: self.batch_conditioning(batch)?,
        })
    }

    /// Runs the generator.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors from the network.
    pub fn generate(&self, input: &GeneratorInput) -> Result<Tensor> {
        Ok(self.generator.generate(input)?)
    }

    /// Raw critic scores of `samples`, for penalty evaluation.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors from the network.
    pub fn critic_scores(
        &self,
        samples: &Tensor,
        conditioning: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        Ok(self.discriminator.score(samples, conditioning)?.score)
    }

    /// Scores of the domain-A critic, for penalty evaluation.
    ///
    /// # Errors
    ///
    /// Fails for pairs without a cycle branch.
    pub fn reverse_critic_scores(&self, samples: &Tensor) -> candle_core::Result<Tensor> {
        let branch = self.cycle.as_ref().ok_or_else(|| {
            candle_core::Error::Msg("pair has no reverse critic".to_string())
        })?;
        Ok(branch.discriminator.score(samples, None)?.score)
    }

    /// Unweighted cycle loss `L1(G_ba(G_ab(a)), a) + L1(G_ab(G_ba(b)), b)`.
    ///
    /// # Errors
    ///
    /// Fails for pairs without a cycle branch or batches without a paired
    /// input.
    pub fn cycle_loss(&self, batch: &Batch, noise: Option<Tensor>) -> Result<Tensor> {
        let branch = self.cycle_branch()?;
        let (a, b) = domains(batch)?;
        Ok(self.translate(branch, a, b, noise)?.cycle)
    }

    fn cycle_branch(&self) -> Result<&CycleBranch<G, D>> {
        self.cycle
            .as_ref()
            .ok_or_else(|| GanError::Config("pair has no cycle branch".to_string()))
    }

    fn translate(
        &self,
        branch: &CycleBranch<G, D>,
        a: &Tensor,
        b: &Tensor,
        noise: Option<Tensor>,
    ) -> candle_core::Result<Translation> {
        let forward = |x: &Tensor| {
            self.generator.generate(&GeneratorInput {
                noise: noise.clone(),
                conditioning: Some(x.clone()),
            })
        };
        let backward = |x: &Tensor| {
            branch.generator.generate(&GeneratorInput {
                noise: noise.clone(),
                conditioning: Some(x.clone()),
            })
        };
        let fake_b = forward(a)?;
        let fake_a = backward(b)?;
        let cycle = (l1(&backward(&fake_b)?, a)? + l1(&forward(&fake_a)?, b)?)?;
        Ok(Translation {
            fake_b,
            fake_a,
            cycle,
        })
    }

    fn cycle_discriminator_losses(
        &self,
        branch: &CycleBranch<G, D>,
        batch: &Batch,
        noise: Option<Tensor>,
    ) -> Result<DiscriminatorLosses> {
        let (a, b) = domains(batch)?;
        let fake_b = self
            .generator
            .generate(&GeneratorInput {
                noise: noise.clone(),
                conditioning: Some(a.clone()),
            })?
            .detach();
        let fake_a = branch
            .generator
            .generate(&GeneratorInput {
                noise,
                conditioning: Some(b.clone()),
            })?
            .detach();
        let score_b = |x: &Tensor| self.discriminator.score(x, None)?.score.mean_all();
        let score_a = |x: &Tensor| branch.discriminator.score(x, None)?.score.mean_all();
        let real = (score_b(b)? + score_a(a)?)?.neg()?;
        let fake = (score_b(&fake_b)? + score_a(&fake_a)?)?;
        let total = (&real + &fake)?;
        Ok(DiscriminatorLosses {
            real,
            fake,
            total,
            fake_samples: fake_b,
            reverse_fake_samples: Some(fake_a),
        })
    }

    /// Computes the discriminator loss terms on a batch.
    ///
    /// # Errors
    ///
    /// Propagates tensor and conditioning errors.
    pub fn discriminator_losses(
        &self,
        batch: &Batch,
        noise: Option<Tensor>,
    ) -> Result<DiscriminatorLosses> {
        if let Some(branch) = &self.cycle {
            return self.cycle_discriminator_losses(branch, batch, noise);
        }
        let input = self.generator_input(batch, noise)?;
        let fake_samples = self.generator.generate(&input)?.detach();
        let cond = input.conditioning.as_ref();
        let real_out = self.discriminator.score(&batch.inputs, cond)?;
        let fake_out = self.discriminator.score(&fake_samples, cond)?;

        let (real, fake) = match self.kind {
            ObjectiveKind::Standard | ObjectiveKind::AuxiliaryClassifier => (
                sigmoid_cross_entropy(&real_out.score, 1.0)?,
                sigmoid_cross_entropy(&fake_out.score, 0.0)?,
            ),
            ObjectiveKind::Reconstruction => (
                l1(&batch.inputs, &real_out.score)?,
                l1(&fake_samples, &fake_out.score)?,
            ),
            ObjectiveKind::Critic | ObjectiveKind::CycleConsistent => (
                real_out.score.mean_all()?.neg()?,
                fake_out.score.mean_all()?,
            ),
        };
        let total = (&real + &fake)?;
        Ok(DiscriminatorLosses {
            real,
            fake,
            total,
            fake_samples,
            reverse_fake_samples: None,
        })
    }

    /// Computes the adversarial generator loss on a batch.
    ///
    /// # Errors
    ///
    /// Propagates tensor and conditioning errors.
    pub fn generator_losses(&self, batch: &Batch, noise: Option<Tensor>) -> Result<GeneratorLosses> {
        if let Some(branch) = &self.cycle {
            let (a, b) = domains(batch)?;
            let t = self.translate(branch, a, b, noise)?;
            let score_b = self.discriminator.score(&t.fake_b, None)?.score.mean_all()?;
            let score_a = branch.discriminator.score(&t.fake_a, None)?.score.mean_all()?;
            let adversarial = (score_b + score_a)?.neg()?;
            let loss = (adversarial + t.cycle.affine(branch.weight, 0.0)?)?;
            return Ok(GeneratorLosses {
                loss,
                fake_samples: t.fake_b.detach(),
                cycle: Some(t.cycle.detach()),
            });
        }
        let input = self.generator_input(batch, noise)?;
        let fake = self.generator.generate(&input)?;
        let out = self.discriminator.score(&fake, input.conditioning.as_ref())?;
        let loss = match self.kind {
            ObjectiveKind::Standard | ObjectiveKind::AuxiliaryClassifier => {
                sigmoid_cross_entropy(&out.score, 1.0)?
            }
            ObjectiveKind::Reconstruction => l1(&fake, &out.score)?,
            ObjectiveKind::Critic | ObjectiveKind::CycleConsistent => {
                out.score.mean_all()?.neg()?
            }
        };
        Ok(GeneratorLosses {
            loss,
            fake_samples: fake.detach(),
            cycle: None,
        })
    }

    /// Class-prediction loss on real and generated samples.
    ///
    /// # Errors
    ///
    /// Fails if the discriminator emits no class logits or the batch has no
    /// labels.
    pub fn classifier_loss(&self, batch: &Batch, noise: Option<Tensor>) -> Result<Tensor> {
        let labels = batch
            .labels
            .as_ref()
            .ok_or_else(|| GanError::Config("classifier loss needs labelled batches".to_string()))?;
        let input = self.generator_input(batch, noise)?;
        let fake = self.generator.generate(&input)?;
        let cond = input.conditioning.as_ref();
        let real_logits = class_logits(self.discriminator.score(&batch.inputs, cond)?)?;
        let fake_logits = class_logits(self.discriminator.score(&fake, cond)?)?;
        let loss = (softmax_cross_entropy(&real_logits, labels)?
            + softmax_cross_entropy(&fake_logits, labels)?)?;
        Ok(loss)
    }

    /// Content loss `MSE(G(conditioning), x)` for supervised initialization.
    ///
    /// # Errors
    ///
    /// Propagates tensor and conditioning errors.
    pub fn supervised_loss(&self, batch: &Batch, noise: Option<Tensor>) -> Result<Tensor> {
        let input = self.generator_input(batch, noise)?;
        let fake = self.generator.generate(&input)?;
        Ok(mse(&fake, &batch.inputs)?)
    }

    /// Checks `loss` and applies it to one group's optimizer.
    ///
    /// Returns the scalar loss value.
    ///
    /// # Errors
    ///
    /// Returns [`GanError::Diverged`] for a non-finite loss, or a
    /// configuration error when the classifier group has no optimizer.
    pub fn apply(&mut self, group: ParameterGroup, loss: &Tensor, step: u64) -> Result<f32> {
        let value = scalar(loss)?;
        ensure_finite(step, &group.to_string(), value)?;
        let optimizer = match group {
            ParameterGroup::Generator => &mut self.generator_optimizer,
            ParameterGroup::Discriminator => &mut self.discriminator_optimizer,
            ParameterGroup::Classifier => self.classifier_optimizer.as_mut().ok_or_else(|| {
                GanError::Config("no classifier optimizer for this objective".to_string())
            })?,
        };
        optimizer.step(loss)?;
        Ok(value)
    }

    /// Clamps every discriminator variable, both critics of a
    /// cycle-consistent pair included, into `[-bound, bound]`.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors.
    pub fn clip_discriminator(&self, bound: f64) -> Result<()> {
        for var in self.groups.vars(ParameterGroup::Discriminator) {
            let clipped = var.as_tensor().clamp(-bound, bound)?;
            var.set(&clipped)?;
        }
        Ok(())
    }

    /// Pushes new learning rates to every optimizer.
    pub fn set_learning_rates(&mut self, rates: &LearningRateState) {
        self.generator_optimizer.set_learning_rate(rates.generator);
        self.discriminator_optimizer
            .set_learning_rate(rates.discriminator);
        if let Some(optimizer) = self.classifier_optimizer.as_mut() {
            optimizer.set_learning_rate(rates.classifier);
        }
    }

    /// Learning rate currently used by a group's optimizer.
    #[must_use]
    pub fn learning_rate(&self, group: ParameterGroup) -> Option<f64> {
        match group {
            ParameterGroup::Generator => Some(self.generator_optimizer.learning_rate()),
            ParameterGroup::Discriminator => Some(self.discriminator_optimizer.learning_rate()),
            ParameterGroup::Classifier => {
                self.classifier_optimizer.as_ref().map(GroupOptimizer::learning_rate)
            }
        }
    }
}

struct Translation {
    fake_b: Tensor,
    fake_a: Tensor,
    cycle: Tensor,
}

/// Splits a batch into its domain-A (paired) and domain-B (inputs) halves.
fn domains(batch: &Batch) -> Result<(&Tensor, &Tensor)> {
    let a = batch.paired.as_ref().ok_or_else(|| {
        GanError::Config("cycle-consistent training needs batches with a paired input".to_string())
    })?;
    Ok((a, &batch.inputs))
}

fn class_logits(output: DiscriminatorOutput) -> Result<Tensor> {
    output.class_logits.ok_or_else(|| {
        GanError::Config("discriminator produced no class logits".to_string())
    })
}

/// Reads a scalar loss as `f32`.
pub(crate) fn scalar(loss: &Tensor) -> Result<f32> {
    Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// Mean sigmoid cross-entropy of `logits` against a constant target.
///
/// Uses `max(x, 0) - x*z + log(1 + exp(-|x|))`.
pub fn sigmoid_cross_entropy(logits: &Tensor, target: f64) -> candle_core::Result<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let loss = ((logits.relu()? - logits.affine(target, 0.0)?)? + softplus)?;
    loss.mean_all()
}

/// Mean softmax cross-entropy of `logits` against one-hot `targets`.
pub fn softmax_cross_entropy(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, candle_core::D::Minus1)?;
    (log_probs * targets)?
        .sum(candle_core::D::Minus1)?.neg()?.mean_all()
}

/// Mean absolute error.
pub fn l1(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    (a - b)?.abs()?.mean_all()
}

/// Mean squared error.
pub fn mse(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    (a - b)?.sqr()?.mean_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MlpDiscriminator, MlpGenerator};

    fn pair(kind: ObjectiveKind) -> ObjectivePair<MlpGenerator, MlpDiscriminator> {
        let device = Device::Cpu;
        let groups = ParameterGroups::new();
        let g_vb = groups
            .builder(ParameterGroup::Generator, DType::F32, &device)
            .unwrap();
        let d_vb = groups
            .builder(ParameterGroup::Discriminator, DType::F32, &device)
            .unwrap();
        let generator = MlpGenerator::new(4, &[8], &[2], g_vb).unwrap();
        let discriminator = MlpDiscriminator::new(2, &[8], None, d_vb).unwrap();
        ObjectivePair::new(
            generator,
            discriminator,
            groups,
            kind,
            Conditioning::None,
            &OptimizerConfig::default(),
            &LearningRateState::uniform(1e-3),
        )
        .unwrap()
    }

    fn batch() -> Batch {
        Batch {
            inputs: Tensor::new(&[[1f32, 0.], [0., 1.], [-1., 0.], [0., -1.]], &Device::Cpu)
                .unwrap(),
            labels: None,
            paired: None,
        }
    }

    fn noise() -> Option<Tensor> {
        Some(Tensor::zeros((4, 4), DType::F32, &Device::Cpu).unwrap())
    }

    #[test]
    fn test_sigmoid_cross_entropy_matches_closed_form() {
        let logits = Tensor::new(&[0f32, 2.0, -3.0], &Device::Cpu).unwrap();
        let loss = sigmoid_cross_entropy(&logits, 1.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let expected = [0f32, 2.0, -3.0]
            .iter()
            .map(|x| (1.0 + (-x).exp()).ln())
            .sum::<f32>()
            / 3.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_sigmoid_cross_entropy_is_stable_for_large_logits() {
        let logits = Tensor::new(&[500f32, -500.0], &Device::Cpu).unwrap();
        let loss = sigmoid_cross_entropy(&logits, 0.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss.is_finite());
        assert!((loss - 250.0).abs() < 1e-3);
    }

    #[test]
    fn test_softmax_cross_entropy_uniform_logits() {
        let logits = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1f32, 0., 0., 0.], [0., 0., 1., 0.]], &Device::Cpu).unwrap();
        let loss = softmax_cross_entropy(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_classifier_group_cannot_own_variables() {
        let groups = ParameterGroups::new();
        assert!(groups
            .builder(ParameterGroup::Classifier, DType::F32, &Device::Cpu)
            .is_err());
    }

    #[test]
    fn test_shared_variable_is_rejected() {
        let groups = ParameterGroups::new();
        let var = Var::zeros(3, DType::F32, &Device::Cpu).unwrap();
        for group in [ParameterGroup::Generator, ParameterGroup::Discriminator] {
            groups
                .varmap(group)
                .unwrap()
                .data()
                .lock()
                .unwrap()
                .insert("shared".to_string(), var.clone());
        }
        let err = groups.validate_disjoint().unwrap_err();
        assert!(matches!(err, GanError::Config(_)));
    }

    #[test]
    fn test_classifier_is_union() {
        let pair = pair(ObjectiveKind::Standard);
        let groups = pair.parameters();
        assert_eq!(
            groups.vars(ParameterGroup::Classifier).len(),
            groups.vars(ParameterGroup::Generator).len()
                + groups.vars(ParameterGroup::Discriminator).len()
        );
        assert!(groups.validate_disjoint().is_ok());
    }

    #[test]
    fn test_critic_loss_sign() {
        let pair = pair(ObjectiveKind::Critic);
        let losses = pair.discriminator_losses(&batch(), noise()).unwrap();
        let real = scalar(&losses.real).unwrap();
        let fake = scalar(&losses.fake).unwrap();
        let total = scalar(&losses.total).unwrap();
        assert!((total - (real + fake)).abs() < 1e-6);

        let d_real = scalar(
            &pair
                .critic_scores(&batch().inputs, None)
                .unwrap()
                .mean_all()
                .unwrap(),
        )
        .unwrap();
        assert!((real + d_real).abs() < 1e-6);
    }

    #[test]
    fn test_discriminator_step_leaves_generator_untouched() {
        let mut pair = pair(ObjectiveKind::Standard);
        let before: Vec<Vec<f32>> = pair
            .parameters()
            .vars(ParameterGroup::Generator)
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        let losses = pair.discriminator_losses(&batch(), noise()).unwrap();
        pair.apply(ParameterGroup::Discriminator, &losses.total, 0)
            .unwrap();
        let after: Vec<Vec<f32>> = pair
            .parameters()
            .vars(ParameterGroup::Generator)
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_non_finite_loss_diverges() {
        let mut pair = pair(ObjectiveKind::Standard);
        let loss = Tensor::new(f32::NAN, &Device::Cpu).unwrap();
        let err = pair.apply(ParameterGroup::Generator, &loss, 7).unwrap_err();
        assert!(matches!(err, GanError::Diverged { step: 7, .. }));
    }

    #[test]
    fn test_weight_clipping_bounds_discriminator() {
        let pair = pair(ObjectiveKind::Critic);
        pair.clip_discriminator(0.01).unwrap();
        for var in pair.parameters().vars(ParameterGroup::Discriminator) {
            let max = var
                .as_tensor()
                .abs()
                .unwrap()
                .flatten_all()
                .unwrap()
                .max(0)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(max <= 0.01 + 1e-7);
        }
    }

    #[test]
    fn test_auxiliary_classifier_requires_labels() {
        let device = Device::Cpu;
        let groups = ParameterGroups::new();
        let generator = MlpGenerator::new(
            4,
            &[8],
            &[2],
            groups
                .builder(ParameterGroup::Generator, DType::F32, &device)
                .unwrap(),
        )
        .unwrap();
        let discriminator = MlpDiscriminator::new(
            2,
            &[8],
            Some(3),
            groups
                .builder(ParameterGroup::Discriminator, DType::F32, &device)
                .unwrap(),
        )
        .unwrap();
        let result = ObjectivePair::new(
            generator,
            discriminator,
            groups,
            ObjectiveKind::AuxiliaryClassifier,
            Conditioning::None,
            &OptimizerConfig::default(),
            &LearningRateState::default(),
        );
        assert!(matches!(result, Err(GanError::Config(_))));
    }

    struct Passthrough;

    impl Generator for Passthrough {
        fn generate(&self, input: &GeneratorInput) -> candle_core::Result<Tensor> {
            input
                .conditioning
                .clone()
                .ok_or_else(|| candle_core::Error::Msg("no conditioning".to_string()))
        }
    }

    fn identity_cycle(weight: f64) -> Result<ObjectivePair<Passthrough, MlpDiscriminator>> {
        let device = Device::Cpu;
        let groups = ParameterGroups::new();
        let d_vb = groups
            .builder(ParameterGroup::Discriminator, DType::F32, &device)
            .unwrap();
        let critic_b = MlpDiscriminator::new(2, &[8], None, d_vb.pp("b")).unwrap();
        let critic_a = MlpDiscriminator::new(2, &[8], None, d_vb.pp("a")).unwrap();
        ObjectivePair::cycle_consistent(
            Passthrough,
            critic_b,
            CycleBranch {
                generator: Passthrough,
                discriminator: critic_a,
                weight,
            },
            groups,
            &OptimizerConfig::default(),
            &LearningRateState::uniform(1e-3),
        )
    }

    fn two_domain_batch() -> Batch {
        Batch {
            paired: Some(
                Tensor::new(&[[0.5f32, -0.5], [0.25, 0.75], [-1., 0.], [0., 0.]], &Device::Cpu)
                    .unwrap(),
            ),
            ..batch()
        }
    }

    fn mean_score(scores: candle_core::Result<Tensor>) -> f32 {
        scalar(&scores.unwrap().mean_all().unwrap()).unwrap()
    }

    #[test]
    fn test_cycle_term_vanishes_for_identity_generators() {
        let pair = identity_cycle(10.0).unwrap();
        let batch = two_domain_batch();
        let (a, b) = (batch.paired.clone().unwrap(), batch.inputs.clone());

        let cycle = scalar(&pair.cycle_loss(&batch, None).unwrap()).unwrap();
        assert_eq!(cycle, 0.0);

        let losses = pair.generator_losses(&batch, None).unwrap();
        assert_eq!(scalar(losses.cycle.as_ref().unwrap()).unwrap(), 0.0);
        let adversarial = -(mean_score(pair.critic_scores(&a, None))
            + mean_score(pair.reverse_critic_scores(&b)));
        assert!((scalar(&losses.loss).unwrap() - adversarial).abs() < 1e-5);
    }

    #[test]
    fn test_cycle_critics_score_both_domains() {
        let pair = identity_cycle(10.0).unwrap();
        let batch = two_domain_batch();
        let (a, b) = (batch.paired.clone().unwrap(), batch.inputs.clone());
        assert!(pair.discriminator_conditioning(&batch).unwrap().is_none());

        let losses = pair.discriminator_losses(&batch, None).unwrap();
        let reverse = losses.reverse_fake_samples.unwrap();
        assert_eq!(reverse.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());

        let real = -(mean_score(pair.critic_scores(&b, None))
            + mean_score(pair.reverse_critic_scores(&a)));
        let fake =
            mean_score(pair.critic_scores(&a, None)) + mean_score(pair.reverse_critic_scores(&b));
        assert!((scalar(&losses.real).unwrap() - real).abs() < 1e-5);
        assert!((scalar(&losses.fake).unwrap() - fake).abs() < 1e-5);
    }

    #[test]
    fn test_cycle_pair_construction_rules() {
        assert!(matches!(identity_cycle(-1.0), Err(GanError::Config(_))));
        assert!(matches!(identity_cycle(f64::NAN), Err(GanError::Config(_))));
        assert!(identity_cycle(0.0).is_ok());

        let err = pair(ObjectiveKind::Standard)
            .cycle_loss(&two_domain_batch(), noise())
            .unwrap_err();
        assert!(matches!(err, GanError::Config(_)));

        let pair = identity_cycle(1.0).unwrap();
        assert!(matches!(pair.cycle_loss(&batch(), None), Err(GanError::Config(_))));
    }

    #[test]
    fn test_learning_rates_propagate() {
        let mut pair = pair(ObjectiveKind::Standard);
        pair.set_learning_rates(&LearningRateState {
            generator: 1e-4,
            discriminator: 2e-4,
            classifier: 3e-4,
        });
        assert_eq!(pair.learning_rate(ParameterGroup::Generator), Some(1e-4));
        assert_eq!(pair.learning_rate(ParameterGroup::Discriminator), Some(2e-4));
        assert_eq!(pair.learning_rate(ParameterGroup::Classifier), None);
    }
}
