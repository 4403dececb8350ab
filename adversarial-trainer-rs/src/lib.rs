//! # adversarial-trainer-rs
//!
//! Resumable orchestration core for adversarial (GAN) training on candle.
//!
//! ## Overview
//!
//! Generators and discriminators are supplied by the caller through the
//! [`objective::Generator`] and [`objective::Discriminator`] traits. This
//! crate owns everything around them:
//!
//! - a shuffled batch source whose cursor is recovered from a global step,
//! - alternating optimization of the two players with variant-specific
//!   critic/generator ratios,
//! - stability controls: gradient penalty, weight clipping, an equilibrium
//!   controller, and learning-rate decay,
//! - coarse-to-fine cascades where each stage conditions on the previous
//!   stage's output from the same step,
//! - checkpointing, resume, periodic sampling and windowed loss logging.
//!
//! ## Update phases
//!
//! ```text
//! SUPERVISED_INIT ──▶ WARMUP_CRITIC | NORMAL_CRITIC ◀──┐
//!                              │                        │
//!                              ▼                        │
//!                       GENERATOR_UPDATE ───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use adversarial_trainer_rs::{synthetic, GanTrainerConfig, TrainingSession};
//! use candle_core::Device;
//!
//! let config = GanTrainerConfig::from_preset("wgan-gp")?;
//! let device = Device::Cpu;
//! let data = synthetic::from_config(&config.data, config.num_classes, config.seed, &device)?;
//! let mut session = TrainingSession::from_config(&config, data, &device)?;
//! let stats = session.run()?;
//! println!("trained {} steps", stats.total_steps);
//! # Ok::<(), adversarial_trainer_rs::GanError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`data`] - Resumable shuffled batch iterator
//! - [`objective`] - Loss variants and parameter-group ownership
//! - [`optimizer`] - Per-group optimizers
//! - [`penalty`] - Gradient penalty and stabilizer selection
//! - [`equilibrium`] - Equilibrium controller
//! - [`phases`] - Update-phase state machine and alternating scheduler
//! - [`cascade`] - Multi-stage cascades
//! - [`session`] - Training loop, resume and triggers
//! - [`checkpoint`] - Checkpoint tags and the default store
//! - [`lr_decay`] - Learning-rate decay schedules
//! - [`config`] - TOML configuration and presets
//! - [`metrics`] - Step reports and windowed aggregation
//! - [`models`], [`synthetic`] - Reference networks and datasets

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]
// Allow precision loss casts - acceptable in ML numerical code
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

// Core modules
pub mod config;
pub mod error;
pub mod phases;
pub mod state;

// Training components
pub mod cascade;
pub mod data;
pub mod equilibrium;
pub mod objective;
pub mod optimizer;
pub mod penalty;
pub mod session;

// Stability and scheduling
pub mod divergence;
pub mod lr_decay;

// Side effects
pub mod checkpoint;
pub mod metrics;
pub mod sampling;

// Reference collaborators
pub mod models;
pub mod synthetic;

pub use config::GanTrainerConfig;
pub use data::{Batch, Dataset, ShuffledBatchIterator};
pub use error::{GanError, Result};
pub use objective::{ObjectiveKind, ObjectivePair, ParameterGroup};
pub use phases::{AlternatingScheduler, CriticSchedule, UpdatePhase};
pub use session::{SessionHooks, TrainingSession};
pub use state::TrainingState;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```
/// use adversarial_trainer_rs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::objective::{Discriminator, Generator, GeneratorInput};
    pub use crate::{
        AlternatingScheduler, Batch, CriticSchedule, Dataset, GanError, GanTrainerConfig,
        ObjectiveKind, ObjectivePair, ParameterGroup, Result, SessionHooks,
        ShuffledBatchIterator, TrainingSession, TrainingState, UpdatePhase,
    };
}
