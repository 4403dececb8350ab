//! Error types for adversarial training orchestration.
//!
//! The taxonomy separates errors that must stop a run from errors the session
//! degrades around:
//!
//! - **Configuration errors**: invalid batch sizes, overlapping parameter
//!   groups, conflicting stabilizers. Raised at construction, never recovered.
//! - **Insufficient data**: the dataset cannot fill a single batch.
//! - **Divergence**: a loss became NaN or infinite. Training halts; retrying
//!   the same step does not help an adversarial game that has blown up.
//! - **Recovery parse failures**: a checkpoint tag exists but carries no step
//!   number. The session logs a warning and cold-starts instead.
//!
//! # Example
//!
//! ```rust
//! use adversarial_trainer_rs::error::GanError;
//!
//! let error = GanError::RecoveryParse {
//!     tag: "./model/checkpoint-latest".to_string(),
//!     reason: "no step suffix".to_string(),
//! };
//! assert!(!error.is_fatal());
//!
//! let error = GanError::Config("batch_size must be > 0".to_string());
//! assert!(error.is_fatal());
//! ```

use thiserror::Error;

use crate::phases::UpdatePhase;

/// Result type alias for adversarial training operations.
pub type Result<T> = std::result::Result<T, GanError>;

/// Errors raised by the training core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GanError {
    /// Invalid or contradictory configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The dataset holds fewer examples than one batch.
    #[error("insufficient data: batch size {batch_size} exceeds {examples} examples")]
    InsufficientData {
        /// Number of examples available.
        examples: usize,
        /// Requested batch size.
        batch_size: usize,
    },

    /// A loss became non-finite.
    #[error("training diverged at step {step}: {loss} loss is {value}")]
    Diverged {
        /// Global step at which the loss was observed.
        step: u64,
        /// Name of the offending loss term.
        loss: String,
        /// The non-finite value.
        value: f32,
    },

    /// A checkpoint tag was found but its step suffix could not be parsed.
    #[error("unparsable checkpoint tag {tag:?}: {reason}")]
    RecoveryParse {
        /// The raw tag.
        tag: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The scheduler was asked to make an illegal phase transition.
    #[error("invalid phase transition from {from:?} to {to:?}")]
    InvalidPhaseTransition {
        /// Phase the scheduler was in.
        from: UpdatePhase,
        /// Phase it was asked to enter.
        to: UpdatePhase,
    },

    /// Checkpoint save or restore failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration file could not be parsed.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Tensor backend error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl GanError {
    /// Returns whether this error must stop the training loop.
    ///
    /// Only recovery parse failures are degraded into a cold start.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::RecoveryParse { .. })
    }
}
