//! CLI entry point for adversarial-trainer.

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adversarial_trainer_rs::checkpoint::CheckpointTag;
use adversarial_trainer_rs::config::PRESETS;
use adversarial_trainer_rs::penalty::enable_second_order_gradients;
use adversarial_trainer_rs::sampling::sample_layout;
use adversarial_trainer_rs::{synthetic, GanTrainerConfig, Result, SessionHooks, TrainingSession};

#[derive(Parser)]
#[command(name = "adversarial-trainer")]
#[command(about = "Resumable adversarial training on synthetic data")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start or resume training
    Train {
        /// Path to configuration file
        #[arg(long)]
        config: String,
        /// Checkpoint directory (overrides the config)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Ignore existing checkpoints
        #[arg(long)]
        fresh: bool,
    },
    /// Generate a configuration file from a preset
    Init {
        /// Output path for config file
        #[arg(default_value = "gan.toml")]
        output: String,
        /// Preset (wgan-gp, wgan-clip, began, acgan, srgan, lapgan, cyclegan)
        #[arg(long, default_value = "wgan-gp")]
        preset: String,
    },
}

/// Writes each sample batch next to the checkpoints as safetensors.
struct SampleWriter {
    dir: PathBuf,
}

impl SessionHooks for SampleWriter {
    fn on_sample(&mut self, global_step: u64, samples: &[Tensor]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        for (stage, images) in samples.iter().enumerate() {
            let tensor = sample_layout(images);
            let path = self
                .dir
                .join(format!("sample-{global_step}-stage{stage}.safetensors"));
            tensor.save_safetensors("sample", &path)?;
        }
        tracing::debug!(step = global_step, dir = %self.dir.display(), "wrote samples");
        Ok(())
    }

    fn on_checkpoint(&mut self, tag: &CheckpointTag) -> Result<()> {
        println!("✓ Checkpoint saved: {tag}");
        Ok(())
    }
}

fn main() -> Result<()> {
    // Before any backward pass on the main thread.
    enable_second_order_gradients();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = GanTrainerConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Objective: {:?}", config.objective);
            println!("  Stabilizer: {:?}", config.stabilizer()?);
            println!("  Critic schedule: {:?}", config.critic_schedule);
            println!("  Batch size: {}", config.batch_size);
        }
        Commands::Train {
            config,
            output,
            fresh,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let mut config = GanTrainerConfig::from_file(&config)?;
            if let Some(dir) = output {
                config.checkpoint.dir = dir;
            }
            if fresh {
                config.checkpoint.resume = false;
            }
            config.validate()?;

            let device = Device::Cpu;
            let data = synthetic::from_config(&config.data, config.num_classes, config.seed, &device)?;
            let hooks = SampleWriter {
                dir: config.checkpoint.dir.join("samples"),
            };
            let mut session = TrainingSession::from_config(&config, data, &device)?.with_hooks(hooks);
            let stats = session.run()?;
            println!("✓ Trained {} steps", stats.total_steps);
            if let Some(d) = stats.mean_discriminator_loss {
                println!("  Mean discriminator loss: {d:.4}");
            }
            if let Some(g) = stats.mean_generator_loss {
                println!("  Mean generator loss: {g:.4}");
            }
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {} (available: {:?})", preset, PRESETS);
            let config = GanTrainerConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
