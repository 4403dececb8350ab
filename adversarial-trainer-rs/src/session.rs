//! Training session driver.
//!
//! A [`TrainingSession`] owns the global step and everything derived from
//! it. It runs one pair through the [`AlternatingScheduler`] or several
//! through the [`CascadeCoordinator`], and fires three independent triggers:
//!
//! - **logging** - one `info!` line averaging the interval's losses,
//! - **sampling** - generator output on a fixed input, handed to
//!   [`SessionHooks::on_sample`],
//! - **checkpoint** - parameters and session state saved under a tag equal
//!   to the global step.
//!
//! A trigger with interval `n` fires after every step whose new global step
//! is a multiple of `n`. Hook and checkpoint-write failures are logged and
//! training continues; divergence and configuration errors stop the run.
//!
//! # Resuming
//!
//! [`TrainingSession::resume`] reads the latest checkpoint tag. No tag, or a
//! tag without a step suffix, means a cold start at step 0. A tag for step
//! `k` restores parameters, seeds the batch cursor at `k`, restores `k_t` and
//! update counters when the state file carries them, and recomputes the
//! learning rates for step `k`.

use candle_core::{Device, Tensor};
use tracing::{info, warn};

use crate::cascade::{CascadeCoordinator, CascadeOutcome, CascadeStage};
use crate::checkpoint::{CheckpointManager, CheckpointTag, SessionSnapshot};
use crate::config::{GanTrainerConfig, IntervalConfig};
use crate::data::{Dataset, ShuffledBatchIterator};
use crate::divergence::LossMonitor;
use crate::equilibrium::{EquilibriumController, EquilibriumState};
use crate::error::{GanError, Result};
use crate::lr_decay::{LearningRateSchedule, LearningRateState};
use crate::metrics::{MetricsCollector, StepReport, TrainingStatistics, WindowSummary};
use crate::models::{build_cycle_pair, build_pair, PairLayout};
use crate::objective::{
    Conditioning, Discriminator, Generator, ObjectiveKind, ObjectivePair, ParameterGroups,
};
use crate::penalty::enable_second_order_gradients;
use crate::phases::{AlternatingScheduler, StepContext, StepOutcome, UpdateCounters};
use crate::sampling::{FixedSampleInput, NoiseSampler};
use crate::state::TrainingState;

/// Receivers of periodic side effects.
///
/// Every method defaults to a no-op. Errors are logged by the session and
/// never abort training.
pub trait SessionHooks {
    /// Called at each logging trigger with the interval's averages.
    fn on_log(&mut self, _summary: &WindowSummary) -> Result<()> {
        Ok(())
    }

    /// Called at each sampling trigger with one tensor per stage.
    fn on_sample(&mut self, _global_step: u64, _samples: &[Tensor]) -> Result<()> {
        Ok(())
    }

    /// Called after a checkpoint was written.
    fn on_checkpoint(&mut self, _tag: &CheckpointTag) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

/// The networks a session trains.
pub enum Engine<G, D> {
    /// One pair driven by the alternating scheduler.
    Single {
        /// Phase scheduler.
        scheduler: AlternatingScheduler,
        /// Networks and optimizers.
        pair: ObjectivePair<G, D>,
    },
    /// A coarse-to-fine cascade.
    Cascade(CascadeCoordinator<G, D>),
}

impl<G: Generator, D: Discriminator> Engine<G, D> {
    fn parameter_groups(&self) -> Vec<ParameterGroups> {
        match self {
            Self::Single { pair, .. } => vec![pair.parameters().clone()],
            Self::Cascade(coordinator) => coordinator
                .stages()
                .iter()
                .map(|stage| stage.pair.parameters().clone())
                .collect(),
        }
    }

    fn counters(&self) -> UpdateCounters {
        match self {
            Self::Single { scheduler, .. } => scheduler.counters(),
            Self::Cascade(coordinator) => coordinator.counters(),
        }
    }

    fn set_learning_rates(&mut self, rates: &LearningRateState) {
        match self {
            Self::Single { pair, .. } => pair.set_learning_rates(rates),
            Self::Cascade(coordinator) => {
                for stage in coordinator.stages_mut() {
                    stage.pair.set_learning_rates(rates);
                }
            }
        }
    }

    fn equilibrium(&self) -> Option<&EquilibriumController> {
        match self {
            Self::Single { scheduler, .. } => scheduler.equilibrium(),
            Self::Cascade(_) => None,
        }
    }
}

/// Drives training of one pair or cascade.
pub struct TrainingSession<G = Box<dyn Generator>, D = Box<dyn Discriminator>> {
    engine: Engine<G, D>,
    data: ShuffledBatchIterator,
    state: TrainingState,
    schedule: LearningRateSchedule,
    checkpoints: CheckpointManager,
    resume_enabled: bool,
    metrics: MetricsCollector,
    monitor: LossMonitor,
    fixed_inputs: Vec<FixedSampleInput>,
    intervals: IntervalConfig,
    hooks: Box<dyn SessionHooks>,
}

impl TrainingSession {
    /// Builds a session with the reference networks for `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid configuration or a
    /// dataset that does not match it.
    pub fn from_config(
        config: &GanTrainerConfig,
        dataset: Dataset,
        device: &Device,
    ) -> Result<Self> {
        enable_second_order_gradients();
        config.validate()?;
        let stabilizer = config.stabilizer()?;
        let engine = match &config.cascade {
            Some(cascade) => {
                let (_, channels, _, _) = dataset.inputs().dims4()?;
                let mut stages = Vec::with_capacity(cascade.resolutions.len());
                for (i, (&resolution, &noise_dim)) in cascade
                    .resolutions
                    .iter()
                    .zip(&cascade.noise_dims)
                    .enumerate()
                {
                    let stage_dim = channels * resolution * resolution;
                    let layout = PairLayout {
                        sample_shape: vec![channels, resolution, resolution],
                        noise_dim,
                        conditioning: if i == 0 {
                            Conditioning::None
                        } else {
                            Conditioning::Paired
                        },
                        conditioning_dim: if i == 0 { 0 } else { stage_dim },
                    };
                    stages.push(CascadeStage {
                        resolution,
                        pair: build_pair(config, &layout, device)?,
                        noise_dim,
                    });
                }
                Engine::Cascade(CascadeCoordinator::new(
                    stages,
                    config.data.resolution,
                    stabilizer,
                    config.seed,
                )?)
            }
            None => {
                let sample_shape = example_shape("inputs", dataset.inputs())?;
                let paired_shape = dataset
                    .paired()
                    .map(|p| example_shape("paired inputs", p))
                    .transpose()?;
                let conditioning_dim = match config.conditioning {
                    Conditioning::None => 0,
                    Conditioning::Labels => config.num_classes.unwrap_or(0),
                    Conditioning::Paired => paired_shape
                        .as_ref()
                        .map(|shape| shape.iter().product())
                        .ok_or_else(|| {
                            GanError::Config("paired conditioning needs paired data".to_string())
                        })?,
                };
                let pair = if config.objective == ObjectiveKind::CycleConsistent {
                    let domain_a = paired_shape.as_deref().ok_or_else(|| {
                        GanError::Config("cycle-consistent training needs paired data".to_string())
                    })?;
                    build_cycle_pair(config, domain_a, &sample_shape, device)?
                } else {
                    let layout = PairLayout {
                        sample_shape,
                        noise_dim: config.noise_dim,
                        conditioning: config.conditioning,
                        conditioning_dim,
                    };
                    build_pair(config, &layout, device)?
                };
                let noise = NoiseSampler::new(config.noise_dim, config.seed.wrapping_add(1));
                let mut scheduler = AlternatingScheduler::new(
                    config.critic_schedule.clone(),
                    stabilizer,
                    noise,
                    config.seed,
                )?
                .with_generator_batch(config.generator_batch)
                .with_supervised_init(config.supervised_init_epochs);
                if let Some(eq) = config.equilibrium {
                    scheduler =
                        scheduler.with_equilibrium(EquilibriumController::new(eq.gamma, eq.lambda)?);
                }
                Engine::Single { scheduler, pair }
            }
        };
        Self::new(engine, dataset, config)
    }
}

impl<G: Generator, D: Discriminator> TrainingSession<G, D> {
    /// Wraps an engine built by the caller.
    ///
    /// Batch size, epochs, learning rates, sampling, intervals and the
    /// checkpoint store come from `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the engine is incompatible with
    /// its scheduler, and the iterator's errors for an unusable dataset.
    pub fn new(engine: Engine<G, D>, dataset: Dataset, config: &GanTrainerConfig) -> Result<Self> {
        if let Engine::Single { scheduler, pair } = &engine {
            scheduler.check_compatible(pair)?;
        }
        let fixed_inputs = fixed_inputs(&engine, &dataset, config)?;
        let data = ShuffledBatchIterator::with_seed(dataset, config.batch_size, config.seed)?;
        let state = TrainingState::new(data.steps_per_epoch(), config.total_epochs);
        info!(
            examples = data.num_examples(),
            batch_size = data.batch_size(),
            steps_per_epoch = data.steps_per_epoch(),
            total_steps = state.total_steps(),
            "training session ready"
        );
        Ok(Self {
            engine,
            data,
            state,
            schedule: LearningRateSchedule::new(config.learning_rates, config.lr_decay.clone()),
            checkpoints: CheckpointManager::new(
                config.checkpoint.dir.clone(),
                config.checkpoint.keep_last_n,
            ),
            resume_enabled: config.checkpoint.resume,
            metrics: MetricsCollector::new(false),
            monitor: LossMonitor::new(config.spike_sigma),
            fixed_inputs,
            intervals: config.intervals,
            hooks: Box::new(NoopHooks),
        })
    }

    /// Installs side-effect hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl SessionHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Retains every step report for export.
    #[must_use]
    pub fn with_history(mut self) -> Self {
        self.metrics = MetricsCollector::new(true);
        self
    }

    /// Completed steps.
    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.state.global_step()
    }

    /// Step bookkeeping.
    #[must_use]
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Update counters.
    #[must_use]
    pub fn counters(&self) -> UpdateCounters {
        self.engine.counters()
    }

    /// Equilibrium state, when a controller is in use.
    #[must_use]
    pub fn equilibrium(&self) -> Option<EquilibriumState> {
        self.engine.equilibrium().map(EquilibriumController::state)
    }

    /// Learning rates in effect.
    #[must_use]
    pub fn learning_rates(&self) -> LearningRateState {
        self.schedule.current()
    }

    /// Trained networks.
    #[must_use]
    pub fn engine(&self) -> &Engine<G, D> {
        &self.engine
    }

    /// Batch source.
    #[must_use]
    pub fn data(&self) -> &ShuffledBatchIterator {
        &self.data
    }

    /// Collected metrics.
    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Checkpoint store.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Restores the latest checkpoint, or cold-starts.
    ///
    /// Returns the global step training continues from.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error when the tagged checkpoint exists but
    /// cannot be loaded. A missing or unparsable tag is not an error.
    pub fn resume(&mut self) -> Result<u64> {
        let Some(raw) = self.checkpoints.latest_tag()? else {
            warn!(
                dir = %self.checkpoints.dir().display(),
                "no checkpoint found, starting from scratch"
            );
            return Ok(0);
        };
        let tag = match CheckpointTag::parse(&raw) {
            Ok(tag) => tag,
            Err(e) => {
                warn!(error = %e, "ignoring checkpoint, starting from scratch");
                return Ok(0);
            }
        };

        let groups = self.engine.parameter_groups();
        let refs: Vec<&ParameterGroups> = groups.iter().collect();
        let snapshot = self.checkpoints.restore(&tag, &refs)?;

        let step = tag.step();
        self.state.resume_at(step);
        self.data.resume(step);

        let mut restored_k = None;
        if let Some(snapshot) = snapshot {
            if snapshot.stages != groups.len() {
                return Err(GanError::Checkpoint(format!(
                    "checkpoint has {} stage(s), session has {}",
                    snapshot.stages,
                    groups.len()
                )));
            }
            restored_k = snapshot.equilibrium_k;
            match &mut self.engine {
                Engine::Single { scheduler, .. } => scheduler.restore_counters(snapshot.counters),
                Engine::Cascade(coordinator) => coordinator.restore_counters(snapshot.counters),
            }
        }
        if let Engine::Single { scheduler, .. } = &mut self.engine {
            if let Some(controller) = scheduler.equilibrium_mut() {
                match restored_k {
                    Some(k) => controller.restore(k),
                    None => controller.reset(),
                }
            }
        }

        if let Some(rates) = self.schedule.evaluate(step, self.state.epoch()) {
            self.engine.set_learning_rates(&rates);
        }
        info!(
            tag = %tag,
            step,
            epoch = self.state.epoch(),
            k = ?restored_k,
            "resumed from checkpoint"
        );
        Ok(step)
    }

    /// Executes one training step and fires any due triggers.
    ///
    /// # Errors
    ///
    /// Returns [`GanError::Diverged`] on a non-finite loss, and propagates
    /// configuration, data and tensor errors.
    pub fn step(&mut self) -> Result<StepReport> {
        let ctx = StepContext {
            global_step: self.state.global_step(),
            epoch: self.state.epoch(),
        };
        if let Some(rates) = self.schedule.evaluate(ctx.global_step, ctx.epoch) {
            info!(
                step = ctx.global_step,
                generator = rates.generator,
                discriminator = rates.discriminator,
                classifier = rates.classifier,
                "learning rates updated"
            );
            self.engine.set_learning_rates(&rates);
        }

        let mut report = match &mut self.engine {
            Engine::Single { scheduler, pair } => {
                single_report(scheduler.run_step(ctx, pair, &mut self.data)?)
            }
            Engine::Cascade(coordinator) => {
                cascade_report(coordinator.run_step(ctx, &mut self.data)?)
            }
        };
        report.step = self.state.advance();
        report.epoch = ctx.epoch;
        report.learning_rates = self.schedule.current();

        for (name, value) in [
            ("discriminator", report.discriminator_loss),
            ("generator", report.generator_loss),
        ] {
            if let Some(value) = value {
                self.monitor.observe(name, value);
            }
        }
        self.metrics.record(report.clone());
        self.fire_triggers();
        Ok(report)
    }

    /// Resumes (when enabled) and steps until every epoch has run.
    ///
    /// # Errors
    ///
    /// Stops at the first fatal error.
    pub fn run(&mut self) -> Result<TrainingStatistics> {
        if self.resume_enabled {
            self.resume()?;
        }
        info!(
            start = self.state.global_step(),
            total = self.state.total_steps(),
            "training started"
        );
        while !self.state.is_complete() {
            self.step()?;
        }
        let stats = self.metrics.statistics();
        info!(
            steps = stats.total_steps,
            d_loss = ?stats.mean_discriminator_loss,
            g_loss = ?stats.mean_generator_loss,
            "training finished"
        );
        Ok(stats)
    }

    /// Runs the generators on the fixed sampling input.
    ///
    /// Cascade stages after the first are conditioned on the upsampled
    /// output of the stage before. Returns one tensor per stage.
    ///
    /// # Errors
    ///
    /// Propagates generator errors.
    pub fn sample(&self) -> Result<Vec<Tensor>> {
        match &self.engine {
            Engine::Single { pair, .. } => {
                let input = self
                    .fixed_inputs
                    .first()
                    .map(FixedSampleInput::generator_input)
                    .unwrap_or_default();
                Ok(vec![pair.generate(&input)?])
            }
            Engine::Cascade(coordinator) => {
                let mut outputs: Vec<Tensor> = Vec::with_capacity(coordinator.len());
                for (stage, fixed) in coordinator.stages().iter().zip(&self.fixed_inputs) {
                    let mut input = fixed.generator_input();
                    if let Some(previous) = outputs.last() {
                        input.conditioning =
                            Some(previous.upsample_nearest2d(stage.resolution, stage.resolution)?);
                    }
                    outputs.push(stage.pair.generate(&input)?);
                }
                Ok(outputs)
            }
        }
    }

    /// Writes a checkpoint for the current global step.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error when writing fails.
    pub fn save_checkpoint(&self) -> Result<CheckpointTag> {
        let groups = self.engine.parameter_groups();
        let refs: Vec<&ParameterGroups> = groups.iter().collect();
        let mut snapshot =
            SessionSnapshot::new(self.state.global_step(), self.schedule.current(), groups.len());
        snapshot.counters = self.engine.counters();
        snapshot.equilibrium_k = self.engine.equilibrium().map(EquilibriumController::k);
        self.checkpoints.save(&refs, &snapshot)
    }

    fn fire_triggers(&mut self) {
        let step = self.state.global_step();
        if self.state.fires(self.intervals.log) {
            if let Some(summary) = self.metrics.flush() {
                log_summary(&summary);
                if let Err(e) = self.hooks.on_log(&summary) {
                    warn!(step, error = %e, "log hook failed");
                }
            }
        }
        if self.state.fires(self.intervals.sample) {
            match self.sample() {
                Ok(samples) => {
                    if let Err(e) = self.hooks.on_sample(step, &samples) {
                        warn!(step, error = %e, "sample hook failed");
                    }
                }
                Err(e) => warn!(step, error = %e, "sampling failed"),
            }
        }
        if self.state.fires(self.intervals.checkpoint) {
            match self.save_checkpoint() {
                Ok(tag) => {
                    if let Err(e) = self.hooks.on_checkpoint(&tag) {
                        warn!(step, error = %e, "checkpoint hook failed");
                    }
                }
                Err(e) => warn!(step, error = %e, "checkpoint write failed"),
            }
        }
    }
}

fn fixed_inputs<G: Generator, D: Discriminator>(
    engine: &Engine<G, D>,
    dataset: &Dataset,
    config: &GanTrainerConfig,
) -> Result<Vec<FixedSampleInput>> {
    let device = dataset.device();
    let count = config.sampling.sample_count;
    let seed = config.sampling.seed;
    match engine {
        Engine::Cascade(coordinator) => coordinator
            .stages()
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                FixedSampleInput::new(count, stage.noise_dim, seed.wrapping_add(i as u64), device)
            })
            .collect(),
        Engine::Single { pair, .. } => {
            let mut fixed = FixedSampleInput::new(count, config.noise_dim, seed, device)?;
            match pair.conditioning() {
                Conditioning::None => {}
                Conditioning::Labels => {
                    let classes = config.num_classes.ok_or_else(|| {
                        GanError::Config("label conditioning needs num_classes".to_string())
                    })?;
                    fixed = fixed.with_class_grid(classes)?;
                }
                Conditioning::Paired => {
                    let paired = dataset.paired().ok_or_else(|| {
                        GanError::Config("paired conditioning needs paired data".to_string())
                    })?;
                    if count > dataset.len() {
                        return Err(GanError::Config(format!(
                            "sample_count {count} exceeds the {} paired examples",
                            dataset.len()
                        )));
                    }
                    fixed = fixed.with_conditioning(paired.narrow(0, 0, count)?)?;
                }
            }
            Ok(vec![fixed])
        }
    }
}

/// Shape of one example of a dataset array, without the batch axis.
fn example_shape(what: &str, array: &Tensor) -> Result<Vec<usize>> {
    match array.dims() {
        [_, rest @ ..] if !rest.is_empty() => Ok(rest.to_vec()),
        dims => Err(GanError::Config(format!(
            "dataset {what} need a batch axis and at least one feature axis, got shape {dims:?}"
        ))),
    }
}

fn single_report(outcome: StepOutcome) -> StepReport {
    StepReport {
        discriminator_loss: outcome.discriminator.map(|d| d.loss),
        generator_loss: outcome.generator_loss,
        classifier_loss: outcome.classifier_loss,
        penalty: outcome.discriminator.and_then(|d| d.penalty),
        supervised_loss: outcome.supervised_loss,
        cycle_loss: outcome.cycle_loss,
        equilibrium: outcome.equilibrium,
        ..StepReport::default()
    }
}

fn cascade_report(outcome: CascadeOutcome) -> StepReport {
    let penalties: Vec<f32> = outcome
        .stages
        .iter()
        .filter_map(|s| s.discriminator.penalty)
        .collect();
    let penalty = (!penalties.is_empty())
        .then(|| penalties.iter().sum::<f32>() / penalties.len() as f32);
    StepReport {
        discriminator_loss: Some(outcome.mean_discriminator),
        generator_loss: Some(outcome.mean_generator),
        penalty,
        stage_losses: outcome
            .stages
            .iter()
            .map(|s| (s.discriminator.loss, s.generator))
            .collect(),
        ..StepReport::default()
    }
}

fn log_summary(summary: &WindowSummary) {
    let rates = summary.learning_rates;
    info!(
        epoch = summary.epoch,
        step = summary.last_step,
        d_loss = ?summary.discriminator_loss,
        g_loss = ?summary.generator_loss,
        c_loss = ?summary.classifier_loss,
        penalty = ?summary.penalty,
        supervised = ?summary.supervised_loss,
        cycle = ?summary.cycle_loss,
        k_t = ?summary.equilibrium.map(|e| e.k),
        m_t = ?summary.equilibrium.map(|e| e.measure),
        lr_g = rates.generator,
        lr_d = rates.discriminator,
        "training progress"
    );
}
