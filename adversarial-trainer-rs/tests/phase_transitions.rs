//! Integration tests for the alternating scheduler's update ratios and phases

use adversarial_trainer_rs::config::GanTrainerConfig;
use adversarial_trainer_rs::data::ShuffledBatchIterator;
use adversarial_trainer_rs::lr_decay::LearningRateState;
use adversarial_trainer_rs::models::{MlpDiscriminator, MlpGenerator};
use adversarial_trainer_rs::objective::{Conditioning, ObjectiveKind, ObjectivePair, ParameterGroups};
use adversarial_trainer_rs::optimizer::OptimizerConfig;
use adversarial_trainer_rs::penalty::Stabilizer;
use adversarial_trainer_rs::phases::{
    AlternatingScheduler, CriticSchedule, StepContext, UpdatePhase,
};
use adversarial_trainer_rs::sampling::NoiseSampler;
use adversarial_trainer_rs::{synthetic, GanError, ParameterGroup, TrainingState};
use candle_core::{DType, Device};

type Pair = ObjectivePair<MlpGenerator, MlpDiscriminator>;

fn critic_pair(input_dim: usize, sample_dim: usize, conditioning: Conditioning, kind: ObjectiveKind) -> Pair {
    let device = Device::Cpu;
    let groups = ParameterGroups::new();
    let generator = MlpGenerator::new(
        input_dim,
        &[4],
        &[sample_dim],
        groups
            .builder(ParameterGroup::Generator, DType::F32, &device)
            .unwrap(),
    )
    .unwrap();
    let cond_dim = if conditioning == Conditioning::Paired { sample_dim } else { 0 };
    let discriminator = MlpDiscriminator::new(
        sample_dim + cond_dim,
        &[4],
        None,
        groups
            .builder(ParameterGroup::Discriminator, DType::F32, &device)
            .unwrap(),
    )
    .unwrap();
    ObjectivePair::new(
        generator,
        discriminator,
        groups,
        kind,
        conditioning,
        &OptimizerConfig::default(),
        &LearningRateState::uniform(1e-4),
    )
    .unwrap()
}

fn ring(examples: usize, batch_size: usize) -> ShuffledBatchIterator {
    let data = synthetic::ring_mixture(examples, 8, false, 1, &Device::Cpu).unwrap();
    ShuffledBatchIterator::with_seed(data, batch_size, 2).unwrap()
}

fn drive(
    scheduler: &mut AlternatingScheduler,
    pair: &mut Pair,
    data: &mut ShuffledBatchIterator,
    steps: u64,
) -> TrainingState {
    let mut state = TrainingState::new(data.steps_per_epoch(), u64::MAX);
    for _ in 0..steps {
        let ctx = StepContext {
            global_step: state.global_step(),
            epoch: state.epoch(),
        };
        scheduler.run_step(ctx, pair, data).unwrap();
        state.advance();
    }
    state
}

#[test]
fn test_five_to_one_ratio_over_1000_steps() {
    let mut pair = critic_pair(2, 2, Conditioning::None, ObjectiveKind::Critic);
    let mut data = ring(64, 8);
    let mut scheduler = AlternatingScheduler::new(
        CriticSchedule::Fixed { critic_steps: 5 },
        Stabilizer::WeightClip { bound: 0.01 },
        NoiseSampler::new(2, 3),
        4,
    )
    .unwrap();

    drive(&mut scheduler, &mut pair, &mut data, 1000);

    let counters = scheduler.counters();
    assert_eq!(counters.discriminator, 5000);
    assert_eq!(counters.generator, 1000);
    assert_eq!(counters.warmup_discriminator, 0);
    assert_eq!(scheduler.phase(), UpdatePhase::GeneratorUpdate);
}

#[test]
fn test_warmup_window_uses_enlarged_bursts() {
    let mut pair = critic_pair(2, 2, Conditioning::None, ObjectiveKind::Critic);
    let mut data = ring(64, 8);
    let mut scheduler = AlternatingScheduler::new(
        CriticSchedule::WarmUp {
            critic_steps: 5,
            warmup_critic_steps: 100,
            warmup_steps: 25,
            period: Some(500),
        },
        Stabilizer::WeightClip { bound: 0.01 },
        NoiseSampler::new(2, 3),
        4,
    )
    .unwrap();

    drive(&mut scheduler, &mut pair, &mut data, 30);

    let counters = scheduler.counters();
    assert_eq!(counters.warmup_discriminator, 25 * 100);
    assert_eq!(counters.discriminator, 25 * 100 + 5 * 5);
    assert_eq!(counters.generator, 30);
}

#[test]
fn test_supervised_init_precedes_adversarial_updates() {
    let data = synthetic::paired_images(32, 1, 4, 2, 5, &Device::Cpu).unwrap();
    let mut data = ShuffledBatchIterator::with_seed(data, 8, 6).unwrap();
    assert_eq!(data.steps_per_epoch(), 4);

    let mut pair = {
        let device = Device::Cpu;
        let groups = ParameterGroups::new();
        let generator = MlpGenerator::new(
            4,
            &[8],
            &[1, 4, 4],
            groups
                .builder(ParameterGroup::Generator, DType::F32, &device)
                .unwrap(),
        )
        .unwrap();
        let discriminator = MlpDiscriminator::new(
            16 + 4,
            &[8],
            None,
            groups
                .builder(ParameterGroup::Discriminator, DType::F32, &device)
                .unwrap(),
        )
        .unwrap();
        ObjectivePair::new(
            generator,
            discriminator,
            groups,
            ObjectiveKind::Standard,
            Conditioning::Paired,
            &OptimizerConfig::default(),
            &LearningRateState::uniform(1e-4),
        )
        .unwrap()
    };
    let mut scheduler = AlternatingScheduler::new(
        CriticSchedule::default(),
        Stabilizer::None,
        NoiseSampler::new(0, 0),
        0,
    )
    .unwrap()
    .with_supervised_init(1);
    assert_eq!(scheduler.phase(), UpdatePhase::SupervisedInit);

    let mut state = TrainingState::new(data.steps_per_epoch(), 10);
    for step in 0..6 {
        let ctx = StepContext {
            global_step: state.global_step(),
            epoch: state.epoch(),
        };
        let outcome = scheduler.run_step(ctx, &mut pair, &mut data).unwrap();
        if step < 4 {
            assert!(outcome.supervised_loss.is_some());
            assert!(outcome.generator_loss.is_none());
            assert_eq!(scheduler.phase(), UpdatePhase::SupervisedInit);
        } else {
            assert!(outcome.supervised_loss.is_none());
            assert!(outcome.generator_loss.is_some());
            assert_eq!(scheduler.phase(), UpdatePhase::GeneratorUpdate);
        }
        state.advance();
    }

    let counters = scheduler.counters();
    assert_eq!(counters.supervised, 4);
    assert_eq!(counters.generator, 2);
    assert_eq!(counters.discriminator, 2);
    assert!(matches!(
        scheduler.transition(UpdatePhase::SupervisedInit),
        Err(GanError::InvalidPhaseTransition { .. })
    ));
}

#[test]
fn test_epoch_boundary_inside_burst() {
    let mut pair = critic_pair(2, 2, Conditioning::None, ObjectiveKind::Critic);
    let mut data = ring(32, 8);
    let mut scheduler = AlternatingScheduler::new(
        CriticSchedule::Fixed { critic_steps: 5 },
        Stabilizer::WeightClip { bound: 0.01 },
        NoiseSampler::new(2, 3),
        4,
    )
    .unwrap();

    drive(&mut scheduler, &mut pair, &mut data, 1);

    // six batches from a four-batch epoch
    assert_eq!(data.cursor().epoch, 1);
    assert_eq!(data.cursor().pointer, 16);
}

#[test]
fn test_critic_without_stabilizer_is_rejected() {
    let mut pair = critic_pair(2, 2, Conditioning::None, ObjectiveKind::Critic);
    let mut data = ring(32, 8);
    let mut scheduler = AlternatingScheduler::new(
        CriticSchedule::default(),
        Stabilizer::None,
        NoiseSampler::new(2, 3),
        4,
    )
    .unwrap();
    let err = scheduler
        .run_step(StepContext::default(), &mut pair, &mut data)
        .unwrap_err();
    assert!(matches!(err, GanError::Config(_)));
}

#[test]
fn test_generator_batch_reuse_pulls_fewer_batches() {
    let mut pair = critic_pair(2, 2, Conditioning::None, ObjectiveKind::Standard);
    let mut data = ring(64, 8);
    let mut scheduler = AlternatingScheduler::new(
        CriticSchedule::Fixed { critic_steps: 2 },
        Stabilizer::None,
        NoiseSampler::new(2, 3),
        4,
    )
    .unwrap()
    .with_generator_batch(adversarial_trainer_rs::phases::GeneratorBatch::Reuse);

    drive(&mut scheduler, &mut pair, &mut data, 2);
    assert_eq!(data.cursor().pointer, 4 * 8);
}

#[test]
fn test_preset_schedules_match_variants() {
    let clip = GanTrainerConfig::from_preset("wgan-clip").unwrap();
    assert_eq!(clip.critic_schedule.burst(0).0, 100);
    assert_eq!(clip.critic_schedule.burst(100).0, 5);
    assert_eq!(clip.critic_schedule.burst(500).0, 100);

    let gp = GanTrainerConfig::from_preset("wgan-gp").unwrap();
    assert_eq!(gp.critic_schedule.burst(0), (1, UpdatePhase::NormalCritic));

    let cycle = GanTrainerConfig::from_preset("cyclegan").unwrap();
    assert_eq!(cycle.critic_schedule.burst(0), (5, UpdatePhase::NormalCritic));
    assert_eq!(cycle.cycle_weight, 10.0);
}
