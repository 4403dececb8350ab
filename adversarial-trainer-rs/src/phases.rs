//! Update-phase state machine and alternating scheduler.
//!
//! One training step of a single generator/discriminator pair is a burst of
//! discriminator (critic) updates followed by one generator update, preceded
//! by an optional supervised-initialization period in which only the
//! generator's content loss is optimized.
//!
//! # State Machine
//!
//! ```text
//! SUPERVISED_INIT ──(epoch >= init epochs)──▶ WARMUP_CRITIC | NORMAL_CRITIC
//!       ▲    │                                       │   ▲
//!       └────┘                                       ▼   │
//!                                              GENERATOR_UPDATE
//! ```
//!
//! Critic phases may follow one another inside a burst. Once left,
//! `SupervisedInit` is never re-entered.
//!
//! # Critic schedules
//!
//! - [`CriticSchedule::Fixed`]: the same number of critic updates every step.
//! - [`CriticSchedule::WarmUp`]: a larger burst during the first
//!   `warmup_steps` steps and on every `period`-th step.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::{Batch, ShuffledBatchIterator};
use crate::equilibrium::{EquilibriumController, EquilibriumState};
use crate::error::{GanError, Result};
use crate::objective::{
    scalar, Conditioning, Discriminator, Generator, ObjectiveKind, ObjectivePair, ParameterGroup,
};
use crate::penalty::{GradientPenalty, Stabilizer};
use crate::sampling::NoiseSampler;

/// Phases of the alternating scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    /// Generator-only content loss before adversarial training.
    SupervisedInit,
    /// Critic update within an enlarged warm-up burst.
    WarmupCritic,
    /// Critic update within a regular burst.
    NormalCritic,
    /// Generator (and classifier) update closing a step.
    GeneratorUpdate,
}

impl UpdatePhase {
    /// Returns a human-readable name for the phase.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SupervisedInit => "supervised_init",
            Self::WarmupCritic => "warmup_critic",
            Self::NormalCritic => "normal_critic",
            Self::GeneratorUpdate => "generator_update",
        }
    }

    /// Returns whether this phase updates the discriminator.
    #[must_use]
    pub fn is_critic(&self) -> bool {
        matches!(self, Self::WarmupCritic | Self::NormalCritic)
    }

    /// Returns whether moving from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::SupervisedInit => next == Self::SupervisedInit || next.is_critic(),
            Self::WarmupCritic | Self::NormalCritic => {
                next.is_critic() || next == Self::GeneratorUpdate
            }
            Self::GeneratorUpdate => next.is_critic(),
        }
    }
}

/// Number of critic updates per step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriticSchedule {
    /// Constant burst size.
    Fixed {
        /// Critic updates per step.
        critic_steps: usize,
    },
    /// Enlarged bursts early on and periodically.
    WarmUp {
        /// Critic updates on regular steps.
        critic_steps: usize,
        /// Critic updates on warm-up steps.
        warmup_critic_steps: usize,
        /// Steps `< warmup_steps` use the warm-up burst.
        warmup_steps: u64,
        /// Every step divisible by `period` also uses the warm-up burst.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        period: Option<u64>,
    },
}

impl Default for CriticSchedule {
    fn default() -> Self {
        Self::Fixed { critic_steps: 1 }
    }
}

impl CriticSchedule {
    /// Burst size and phase for a global step.
    #[must_use]
    pub fn burst(&self, global_step: u64) -> (usize, UpdatePhase) {
        match *self {
            Self::Fixed { critic_steps } => (critic_steps, UpdatePhase::NormalCritic),
            Self::WarmUp {
                critic_steps,
                warmup_critic_steps,
                warmup_steps,
                period,
            } => {
                let periodic = period.is_some_and(|p| p > 0 && global_step % p == 0);
                if global_step < warmup_steps || periodic {
                    (warmup_critic_steps, UpdatePhase::WarmupCritic)
                } else {
                    (critic_steps, UpdatePhase::NormalCritic)
                }
            }
        }
    }

    /// Checks that every burst performs at least one update.
    pub fn validate(&self) -> Result<()> {
        let sizes = match *self {
            Self::Fixed { critic_steps } => [critic_steps, critic_steps],
            Self::WarmUp {
                critic_steps,
                warmup_critic_steps,
                ..
            } => [critic_steps, warmup_critic_steps],
        };
        if sizes.contains(&0) {
            return Err(GanError::Config(
                "critic schedule must run at least one critic update per step".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which batch the generator update consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorBatch {
    /// Pull a fresh batch.
    #[default]
    Fresh,
    /// Reuse the batch of the last critic update.
    Reuse,
}

/// Update counts by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCounters {
    /// All discriminator updates.
    pub discriminator: u64,
    /// Discriminator updates made in warm-up bursts.
    pub warmup_discriminator: u64,
    /// Generator updates.
    pub generator: u64,
    /// Classifier-union updates.
    pub classifier: u64,
    /// Supervised-initialization updates.
    pub supervised: u64,
}

/// Position of the step being executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepContext {
    /// Completed steps before this one.
    pub global_step: u64,
    /// Epoch of this step.
    pub epoch: u64,
}

/// Loss values of one discriminator update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiscriminatorUpdate {
    /// Applied discriminator loss, penalty included.
    pub loss: f32,
    /// Real-sample loss term.
    pub real: f32,
    /// Generated-sample loss term.
    pub fake: f32,
    /// Weighted gradient penalty, if one was added.
    pub penalty: Option<f32>,
}

/// Losses and phase information of one scheduler step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Number of critic updates in the burst.
    pub critic_updates: usize,
    /// Last discriminator update of the burst.
    pub discriminator: Option<DiscriminatorUpdate>,
    /// Generator loss.
    pub generator_loss: Option<f32>,
    /// Classifier loss (auxiliary-classifier objectives).
    pub classifier_loss: Option<f32>,
    /// Supervised content loss (supervised initialization).
    pub supervised_loss: Option<f32>,
    /// Unweighted cycle loss (cycle-consistent objectives).
    pub cycle_loss: Option<f32>,
    /// Equilibrium state after the step.
    pub equilibrium: Option<EquilibriumState>,
}

/// Runs one discriminator update of `pair` on `batch`.
///
/// Applies the equilibrium composition and the stabilizer when configured.
pub(crate) fn discriminator_update<G: Generator, D: Discriminator>(
    pair: &mut ObjectivePair<G, D>,
    batch: &Batch,
    noise: &mut NoiseSampler,
    stabilizer: Stabilizer,
    penalty: Option<&mut GradientPenalty>,
    equilibrium: Option<&EquilibriumController>,
    step: u64,
) -> Result<DiscriminatorUpdate> {
    let z = noise.sample(batch.size(), batch.inputs.device())?;
    let losses = pair.discriminator_losses(batch, z)?;
    let mut total = match equilibrium {
        Some(controller) => controller.discriminator_loss(&losses.real, &losses.fake)?,
        None => losses.total.clone(),
    };

    let mut penalty_value = None;
    if let Some(penalty) = penalty {
        let conditioning = pair.discriminator_conditioning(batch)?;
        let mut weighted = penalty.compute(&batch.inputs, &losses.fake_samples, |x: &Tensor| {
            pair.critic_scores(x, conditioning.as_ref())
        })?;
        if let (Some(real_a), Some(fake_a)) = (&batch.paired, &losses.reverse_fake_samples) {
            let reverse =
                penalty.compute(real_a, fake_a, |x: &Tensor| pair.reverse_critic_scores(x))?;
            weighted = (weighted + reverse)?;
        }
        penalty_value = Some(scalar(&weighted)?);
        total = (total + weighted)?;
    }

    let loss = pair.apply(ParameterGroup::Discriminator, &total, step)?;
    if let Stabilizer::WeightClip { bound } = stabilizer {
        pair.clip_discriminator(bound)?;
    }

    Ok(DiscriminatorUpdate {
        loss,
        real: scalar(&losses.real)?,
        fake: scalar(&losses.fake)?,
        penalty: penalty_value,
    })
}

/// Alternates discriminator bursts and generator updates for one pair.
#[derive(Debug)]
pub struct AlternatingScheduler {
    schedule: CriticSchedule,
    generator_batch: GeneratorBatch,
    stabilizer: Stabilizer,
    penalty: Option<GradientPenalty>,
    equilibrium: Option<EquilibriumController>,
    supervised_init_epochs: u64,
    supervised_pending: bool,
    phase: UpdatePhase,
    noise: NoiseSampler,
    counters: UpdateCounters,
}

impl AlternatingScheduler {
    /// Creates a scheduler.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid critic schedule.
    pub fn new(
        schedule: CriticSchedule,
        stabilizer: Stabilizer,
        noise: NoiseSampler,
        seed: u64,
    ) -> Result<Self> {
        schedule.validate()?;
        let penalty = match stabilizer {
            Stabilizer::GradientPenalty { coefficient } => {
                Some(GradientPenalty::new(coefficient, seed))
            }
            _ => None,
        };
        Ok(Self {
            schedule,
            generator_batch: GeneratorBatch::default(),
            stabilizer,
            penalty,
            equilibrium: None,
            supervised_init_epochs: 0,
            supervised_pending: false,
            phase: UpdatePhase::GeneratorUpdate,
            noise,
            counters: UpdateCounters::default(),
        })
    }

    /// Sets which batch the generator update consumes.
    #[must_use]
    pub fn with_generator_batch(mut self, generator_batch: GeneratorBatch) -> Self {
        self.generator_batch = generator_batch;
        self
    }

    /// Adds an equilibrium controller.
    #[must_use]
    pub fn with_equilibrium(mut self, controller: EquilibriumController) -> Self {
        self.equilibrium = Some(controller);
        self
    }

    /// Optimizes only the supervised content loss during the first `epochs`
    /// epochs.
    #[must_use]
    pub fn with_supervised_init(mut self, epochs: u64) -> Self {
        self.supervised_init_epochs = epochs;
        self.supervised_pending = epochs > 0;
        if self.supervised_pending {
            self.phase = UpdatePhase::SupervisedInit;
        }
        self
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Update counters.
    #[must_use]
    pub fn counters(&self) -> UpdateCounters {
        self.counters
    }

    /// Restores counters from a checkpoint.
    pub fn restore_counters(&mut self, counters: UpdateCounters) {
        self.counters = counters;
    }

    /// Stabilizer in use.
    #[must_use]
    pub fn stabilizer(&self) -> Stabilizer {
        self.stabilizer
    }

    /// Equilibrium controller, if configured.
    #[must_use]
    pub fn equilibrium(&self) -> Option<&EquilibriumController> {
        self.equilibrium.as_ref()
    }

    /// Mutable equilibrium controller, for restoring `k`.
    pub fn equilibrium_mut(&mut self) -> Option<&mut EquilibriumController> {
        self.equilibrium.as_mut()
    }

    /// Moves to `next` if the transition is legal.
    ///
    /// # Errors
    ///
    /// Returns [`GanError::InvalidPhaseTransition`] otherwise.
    pub fn transition(&mut self, next: UpdatePhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(GanError::InvalidPhaseTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Checks that this scheduler can drive `pair`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a critic without a stabilizer,
    /// equilibrium control on a non-reconstruction objective, supervised
    /// initialization without paired conditioning or with a cycle-consistent
    /// objective.
    pub fn check_compatible<G, D>(&self, pair: &ObjectivePair<G, D>) -> Result<()>
    where
        G: Generator,
        D: Discriminator,
    {
        if pair.kind().is_critic() && !self.stabilizer.is_active() {
            return Err(GanError::Config(
                "a critic objective needs a gradient penalty or weight clipping".to_string(),
            ));
        }
        if self.equilibrium.is_some() && pair.kind() != ObjectiveKind::Reconstruction {
            return Err(GanError::Config(
                "equilibrium control requires the reconstruction objective".to_string(),
            ));
        }
        if self.supervised_init_epochs > 0 && pair.conditioning() != Conditioning::Paired {
            return Err(GanError::Config(
                "supervised initialization requires paired conditioning".to_string(),
            ));
        }
        if self.supervised_init_epochs > 0 && pair.kind() == ObjectiveKind::CycleConsistent {
            return Err(GanError::Config(
                "supervised initialization does not apply to cycle-consistent pairs".to_string(),
            ));
        }
        Ok(())
    }

    /// Executes one training step.
    ///
    /// # Errors
    ///
    /// Returns [`GanError::Diverged`] on a non-finite loss, and propagates
    /// data and tensor errors.
    pub fn run_step<G, D>(
        &mut self,
        ctx: StepContext,
        pair: &mut ObjectivePair<G, D>,
        data: &mut ShuffledBatchIterator,
    ) -> Result<StepOutcome>
    where
        G: Generator,
        D: Discriminator,
    {
        self.check_compatible(pair)?;

        if self.supervised_pending {
            if ctx.epoch < self.supervised_init_epochs {
                return self.supervised_step(ctx, pair, data);
            }
            self.supervised_pending = false;
            info!(
                step = ctx.global_step,
                epoch = ctx.epoch,
                "supervised initialization complete, starting adversarial updates"
            );
        }

        let (burst, critic_phase) = self.schedule.burst(ctx.global_step);
        let mut last_update = DiscriminatorUpdate::default();
        let mut last_batch = None;
        for _ in 0..burst {
            self.transition(critic_phase)?;
            let batch = data.next_batch()?;
            last_update = discriminator_update(
                pair,
                &batch,
                &mut self.noise,
                self.stabilizer,
                self.penalty.as_mut(),
                self.equilibrium.as_ref(),
                ctx.global_step,
            )?;
            self.counters.discriminator += 1;
            if critic_phase == UpdatePhase::WarmupCritic {
                self.counters.warmup_discriminator += 1;
            }
            last_batch = Some(batch);
        }
        debug!(step = ctx.global_step, burst, phase = critic_phase.name(), "critic burst done");

        self.transition(UpdatePhase::GeneratorUpdate)?;
        let batch = match (self.generator_batch, last_batch) {
            (GeneratorBatch::Reuse, Some(batch)) => batch,
            _ => data.next_batch()?,
        };
        let z = self.noise.sample(batch.size(), batch.inputs.device())?;
        let generator = pair.generator_losses(&batch, z.clone())?;
        let generator_loss = pair.apply(ParameterGroup::Generator, &generator.loss, ctx.global_step)?;
        self.counters.generator += 1;
        let cycle_loss = generator.cycle.as_ref().map(scalar).transpose()?;

        let classifier_loss = if pair.kind() == ObjectiveKind::AuxiliaryClassifier {
            let loss = pair.classifier_loss(&batch, z)?;
            let value = pair.apply(ParameterGroup::Classifier, &loss, ctx.global_step)?;
            self.counters.classifier += 1;
            Some(value)
        } else {
            None
        };

        let equilibrium = self
            .equilibrium
            .as_mut()
            .map(|controller| controller.update(last_update.real, last_update.fake));

        Ok(StepOutcome {
            critic_updates: burst,
            discriminator: Some(last_update),
            generator_loss: Some(generator_loss),
            classifier_loss,
            supervised_loss: None,
            cycle_loss,
            equilibrium,
        })
    }

    fn supervised_step<G, D>(
        &mut self,
        ctx: StepContext,
        pair: &mut ObjectivePair<G, D>,
        data: &mut ShuffledBatchIterator,
    ) -> Result<StepOutcome>
    where
        G: Generator,
        D: Discriminator,
    {
        self.transition(UpdatePhase::SupervisedInit)?;
        let batch = data.next_batch()?;
        let z = self.noise.sample(batch.size(), batch.inputs.device())?;
        let loss = pair.supervised_loss(&batch, z)?;
        let value = pair.apply(ParameterGroup::Generator, &loss, ctx.global_step)?;
        self.counters.supervised += 1;
        Ok(StepOutcome {
            supervised_loss: Some(value),
            ..StepOutcome::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use UpdatePhase::*;
        assert!(SupervisedInit.can_transition_to(SupervisedInit));
        assert!(SupervisedInit.can_transition_to(WarmupCritic));
        assert!(SupervisedInit.can_transition_to(NormalCritic));
        assert!(!SupervisedInit.can_transition_to(GeneratorUpdate));

        assert!(WarmupCritic.can_transition_to(WarmupCritic));
        assert!(NormalCritic.can_transition_to(GeneratorUpdate));
        assert!(!NormalCritic.can_transition_to(SupervisedInit));

        assert!(GeneratorUpdate.can_transition_to(NormalCritic));
        assert!(!GeneratorUpdate.can_transition_to(GeneratorUpdate));
        assert!(!GeneratorUpdate.can_transition_to(SupervisedInit));
    }

    #[test]
    fn test_fixed_schedule() {
        let schedule = CriticSchedule::Fixed { critic_steps: 5 };
        for step in [0, 1, 500, 10_000] {
            assert_eq!(schedule.burst(step), (5, UpdatePhase::NormalCritic));
        }
    }

    #[test]
    fn test_warmup_schedule() {
        let schedule = CriticSchedule::WarmUp {
            critic_steps: 5,
            warmup_critic_steps: 100,
            warmup_steps: 25,
            period: Some(500),
        };
        assert_eq!(schedule.burst(0), (100, UpdatePhase::WarmupCritic));
        assert_eq!(schedule.burst(24), (100, UpdatePhase::WarmupCritic));
        assert_eq!(schedule.burst(25), (5, UpdatePhase::NormalCritic));
        assert_eq!(schedule.burst(499), (5, UpdatePhase::NormalCritic));
        assert_eq!(schedule.burst(500), (100, UpdatePhase::WarmupCritic));
        assert_eq!(schedule.burst(1000), (100, UpdatePhase::WarmupCritic));

        let warm: usize = (0..1000u64)
            .filter(|s| schedule.burst(*s).1 == UpdatePhase::WarmupCritic)
            .count();
        assert_eq!(warm, 26);
    }

    #[test]
    fn test_zero_burst_rejected() {
        assert!(CriticSchedule::Fixed { critic_steps: 0 }.validate().is_err());
        let schedule = CriticSchedule::WarmUp {
            critic_steps: 5,
            warmup_critic_steps: 0,
            warmup_steps: 10,
            period: None,
        };
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_supervised_phase_cannot_be_reentered() {
        let mut scheduler = AlternatingScheduler::new(
            CriticSchedule::default(),
            Stabilizer::None,
            NoiseSampler::new(0, 0),
            0,
        )
        .unwrap()
        .with_supervised_init(2);
        assert_eq!(scheduler.phase(), UpdatePhase::SupervisedInit);
        scheduler.transition(UpdatePhase::NormalCritic).unwrap();
        scheduler.transition(UpdatePhase::GeneratorUpdate).unwrap();
        let err = scheduler
            .transition(UpdatePhase::SupervisedInit)
            .unwrap_err();
        assert!(matches!(
            err,
            GanError::InvalidPhaseTransition {
                from: UpdatePhase::GeneratorUpdate,
                to: UpdatePhase::SupervisedInit
            }
        ));
    }

    #[test]
    fn test_schedule_serde() {
        let schedule = CriticSchedule::WarmUp {
            critic_steps: 5,
            warmup_critic_steps: 100,
            warmup_steps: 25,
            period: Some(500),
        };
        let json = serde_json::to_string(&schedule).unwrap();
        assert!(json.contains("\"type\":\"warm_up\""));
        let back: CriticSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }
}
