//! End-to-end integration tests for adversarial-trainer-rs

use adversarial_trainer_rs::checkpoint::CheckpointTag;
use adversarial_trainer_rs::config::{CheckpointConfig, IntervalConfig, ModelConfig, PRESETS};
use adversarial_trainer_rs::data::{Dataset, ShuffledBatchIterator};
use adversarial_trainer_rs::objective::ParameterGroup;
use adversarial_trainer_rs::session::Engine;
use adversarial_trainer_rs::{synthetic, GanTrainerConfig, TrainingSession};
use candle_core::{Device, Tensor};

/// Shrinks a preset so a few steps run quickly on the CPU.
fn small(preset: &str, dir: &std::path::Path) -> GanTrainerConfig {
    let mut config = GanTrainerConfig::from_preset(preset).unwrap();
    config.batch_size = 16;
    config.total_epochs = 1;
    config.data.examples = 64;
    config.model = ModelConfig {
        hidden_dims: vec![16],
    };
    config.intervals = IntervalConfig {
        log: 2,
        sample: 2,
        checkpoint: 4,
    };
    config.checkpoint = CheckpointConfig {
        dir: dir.to_path_buf(),
        keep_last_n: 2,
        resume: true,
    };
    config
}

fn session(config: &GanTrainerConfig) -> TrainingSession {
    let data =
        synthetic::from_config(&config.data, config.num_classes, config.seed, &Device::Cpu).unwrap();
    TrainingSession::from_config(config, data, &Device::Cpu).unwrap()
}

#[test]
fn test_every_preset_trains_and_checkpoints() {
    for preset in PRESETS {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = small(preset, dir.path());
        if preset == "srgan" {
            // one supervised epoch, then adversarial epochs
            config.supervised_init_epochs = 1;
            config.total_epochs = 2;
        }
        let mut session = session(&config);
        let stats = session.run().unwrap_or_else(|e| panic!("{preset}: {e}"));
        let expected = 4 * config.total_epochs;
        assert_eq!(stats.total_steps, expected, "{preset}");

        let last = stats.last.unwrap();
        assert!(last.discriminator_loss.unwrap().is_finite(), "{preset}");
        assert!(last.generator_loss.unwrap().is_finite(), "{preset}");

        let raw = session.checkpoints().latest_tag().unwrap().unwrap();
        assert_eq!(CheckpointTag::parse(&raw).unwrap().step(), expected, "{preset}");
    }
}

#[test]
fn test_cascade_stage_conditioning_is_fresh() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut session = session(&small("lapgan", dir.path()));
    for _ in 0..2 {
        session.step().unwrap();
        let Engine::Cascade(cascade) = session.engine() else {
            panic!("lapgan preset builds a cascade");
        };
        assert_eq!(cascade.len(), 3);
        assert!(cascade.stage_conditioning()[0].is_none());
        for i in 1..cascade.len() {
            let resolution = cascade.stages()[i].resolution;
            let expected = cascade.stage_outputs()[i - 1]
                .as_ref()
                .unwrap()
                .upsample_nearest2d(resolution, resolution)
                .unwrap();
            let actual = cascade.stage_conditioning()[i].as_ref().unwrap();
            assert_eq!(actual.dims(), expected.dims());
            let diff = (actual - &expected)
                .unwrap()
                .abs()
                .unwrap()
                .flatten_all()
                .unwrap()
                .max(0)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert_eq!(diff, 0.0);
        }
    }
}

#[test]
fn test_cascade_report_is_mean_of_stages() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut session = session(&small("lapgan", dir.path()));
    let report = session.step().unwrap();
    assert_eq!(report.stage_losses.len(), 3);
    let mean_d = report.stage_losses.iter().map(|s| s.0).sum::<f32>() / 3.0;
    let mean_g = report.stage_losses.iter().map(|s| s.1).sum::<f32>() / 3.0;
    assert!((report.discriminator_loss.unwrap() - mean_d).abs() < 1e-5);
    assert!((report.generator_loss.unwrap() - mean_g).abs() < 1e-5);
}

#[test]
fn test_equilibrium_term_stays_bounded() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = small("began", dir.path());
    config.equilibrium = Some(adversarial_trainer_rs::config::EquilibriumConfig {
        gamma: 0.5,
        lambda: 0.5,
    });
    let mut session = session(&config);
    for _ in 0..8 {
        let report = session.step().unwrap();
        let state = report.equilibrium.unwrap();
        assert!((0.0..=1.0).contains(&state.k));
        assert!(state.measure.is_finite());
    }
}

#[test]
fn test_auxiliary_classifier_runs_three_updates_per_step() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut session = session(&small("acgan", dir.path()));
    for _ in 0..3 {
        let report = session.step().unwrap();
        assert!(report.classifier_loss.unwrap().is_finite());
    }
    let counters = session.counters();
    assert_eq!(counters.discriminator, 3);
    assert_eq!(counters.generator, 3);
    assert_eq!(counters.classifier, 3);
}

#[test]
fn test_weight_clipping_holds_after_training() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = small("wgan-clip", dir.path());
    config.critic_schedule = adversarial_trainer_rs::CriticSchedule::Fixed { critic_steps: 5 };
    let mut session = session(&config);
    for _ in 0..3 {
        session.step().unwrap();
    }
    let Engine::Single { pair, .. } = session.engine() else {
        panic!("wgan-clip builds a single pair");
    };
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
fn test_gradient_penalty_is_reported() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut session = session(&small("wgan-gp", dir.path()));
    let report = session.step().unwrap();
    let penalty = report.penalty.unwrap();
    assert!(penalty.is_finite());
    assert!(penalty >= 0.0);
}

#[test]
fn test_iterator_serves_each_example_once_per_epoch() {
    let values: Vec<f32> = (0..1000).map(|i| i as f32).collect();
    let inputs = Tensor::from_vec(values, (1000, 1), &Device::Cpu).unwrap();
    let mut iterator =
        ShuffledBatchIterator::with_seed(Dataset::new(inputs), 100, 9).unwrap();
    assert_eq!(iterator.steps_per_epoch(), 10);

    let mut seen: Vec<f32> = Vec::new();
    for _ in 0..10 {
        let batch = iterator.next_batch().unwrap();
        seen.extend(batch.inputs.flatten_all().unwrap().to_vec1::<f32>().unwrap());
    }
    seen.sort_by(f32::total_cmp);
    let expected: Vec<f32> = (0..1000).map(|i| i as f32).collect();
    assert_eq!(seen, expected);
    assert_eq!(iterator.cursor().epoch, 0);

    iterator.next_batch().unwrap();
    assert_eq!(iterator.cursor().epoch, 1);
    assert_eq!(iterator.cursor().pointer, 100);
}

fn values_by_prefix(session: &TrainingSession, group: ParameterGroup) -> Vec<(String, Vec<f32>)> {
    let Engine::Single { pair, .. } = session.engine() else {
        panic!("cyclegan preset builds a single pair");
    };
    let varmap = pair.parameters().varmap(group).unwrap();
    let data = varmap.data().lock().unwrap();
    let mut values: Vec<(String, Vec<f32>)> = data
        .iter()
        .map(|(name, var)| {
            let flat = var.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
            (name.clone(), flat)
        })
        .collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
}

#[test]
fn test_cycle_step_updates_both_directions() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut session = session(&small("cyclegan", dir.path()));
    let before_g = values_by_prefix(&session, ParameterGroup::Generator);
    let before_d = values_by_prefix(&session, ParameterGroup::Discriminator);
    let report = session.step().unwrap();
    assert!(report.cycle_loss.unwrap().is_finite());

    for (group, before, prefixes) in [
        (ParameterGroup::Generator, before_g, ["a2b.", "b2a."]),
        (ParameterGroup::Discriminator, before_d, ["a.", "b."]),
    ] {
        let after = values_by_prefix(&session, group);
        for prefix in prefixes {
            let moved = before
                .iter()
                .zip(&after)
                .any(|(b, a)| b.0.starts_with(prefix) && b.1 != a.1);
            assert!(moved, "no {group} variable under {prefix} changed");
        }
    }
}
