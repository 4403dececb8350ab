//! Resumable shuffled batch source.
//!
//! [`ShuffledBatchIterator`] serves fixed-size batches from aligned arrays
//! (inputs, optional labels, optional paired inputs). The first epoch is
//! served in stored order; every later epoch starts with a fresh random
//! permutation applied to all arrays alike. Examples left over when the
//! dataset size is not a multiple of the batch size are skipped for that
//! epoch.
//!
//! The cursor can be recovered from a global step after a restart. Only the
//! batch count and offset are restored, never the permutation.
//!
//! # Example
//!
//! ```rust
//! use adversarial_trainer_rs::data::{Dataset, ShuffledBatchIterator};
//! use candle_core::{Device, Tensor};
//!
//! let inputs = Tensor::arange(0f32, 10f32, &Device::Cpu)?.reshape((10, 1))?;
//! let mut batches = ShuffledBatchIterator::with_seed(Dataset::new(inputs), 4, 0)?;
//! assert_eq!(batches.steps_per_epoch(), 2);
//!
//! let first = batches.next_batch()?;
//! assert_eq!(first.size(), 4);
//! # Ok::<(), adversarial_trainer_rs::GanError>(())
//! ```

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GanError, Result};

/// Aligned arrays sharing their leading dimension.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Tensor,
    labels: Option<Tensor>,
    paired: Option<Tensor>,
}

impl Dataset {
    /// Creates a dataset of real samples.
    #[must_use]
    pub fn new(inputs: Tensor) -> Self {
        Self {
            inputs,
            labels: None,
            paired: None,
        }
    }

    /// Attaches one-hot labels.
    #[must_use]
    pub fn with_labels(mut self, labels: Tensor) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Attaches paired inputs (e.g. low-resolution counterparts).
    #[must_use]
    pub fn with_paired(mut self, paired: Tensor) -> Self {
        self.paired = Some(paired);
        self
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        leading_dim(&self.inputs)
    }

    /// Returns `true` when the dataset holds no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Device the arrays live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.inputs.device()
    }

    /// Real samples.
    #[must_use]
    pub fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    /// One-hot labels, if attached.
    #[must_use]
    pub fn labels(&self) -> Option<&Tensor> {
        self.labels.as_ref()
    }

    /// Paired inputs, if attached.
    #[must_use]
    pub fn paired(&self) -> Option<&Tensor> {
        self.paired.as_ref()
    }

    fn validate(&self) -> Result<()> {
        let n = self.len();
        for (name, array) in [("labels", &self.labels), ("paired", &self.paired)] {
            if let Some(array) = array {
                let m = leading_dim(array);
                if m != n {
                    return Err(GanError::Config(format!(
                        "{name} has {m} examples but inputs have {n}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn permute(&mut self, order: &Tensor) -> Result<()> {
        self.inputs = self.inputs.index_select(order, 0)?;
        if let Some(labels) = self.labels.as_mut() {
            *labels = labels.index_select(order, 0)?;
        }
        if let Some(paired) = self.paired.as_mut() {
            *paired = paired.index_select(order, 0)?;
        }
        Ok(())
    }

    fn slice(&self, start: usize, len: usize) -> Result<Batch> {
        Ok(Batch {
            inputs: self.inputs.narrow(0, start, len)?,
            labels: self
                .labels
                .as_ref()
                .map(|t| t.narrow(0, start, len))
                .transpose()?,
            paired: self
                .paired
                .as_ref()
                .map(|t| t.narrow(0, start, len))
                .transpose()?,
        })
    }
}

/// One batch of aligned arrays.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Real samples.
    pub inputs: Tensor,
    /// One-hot labels, if the dataset has them.
    pub labels: Option<Tensor>,
    /// Paired inputs, if the dataset has them.
    pub paired: Option<Tensor>,
}

impl Batch {
    /// Number of examples in the batch.
    #[must_use]
    pub fn size(&self) -> usize {
        leading_dim(&self.inputs)
    }
}

/// Position of the iterator within the dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Index of the next example to serve.
    pub pointer: usize,
    /// Number of reshuffles observed.
    pub epoch: u64,
}

impl Cursor {
    /// Cursor corresponding to `global_step` completed steps.
    ///
    /// Returns the start of the dataset when `steps_per_epoch` is zero.
    #[must_use]
    pub fn from_global_step(global_step: u64, steps_per_epoch: usize, batch_size: usize) -> Self {
        if steps_per_epoch == 0 {
            return Self::default();
        }
        let spe = steps_per_epoch as u64;
        Self {
            pointer: (global_step % spe) as usize * batch_size,
            epoch: global_step / spe,
        }
    }

    /// Global step this cursor corresponds to.
    #[must_use]
    pub fn to_global_step(&self, steps_per_epoch: usize, batch_size: usize) -> u64 {
        if batch_size == 0 {
            return 0;
        }
        self.epoch * steps_per_epoch as u64 + (self.pointer / batch_size) as u64
    }
}

/// Fixed-size batch source with reshuffling and cursor recovery.
#[derive(Debug)]
pub struct ShuffledBatchIterator {
    data: Dataset,
    batch_size: usize,
    cursor: Cursor,
    rng: ChaCha8Rng,
}

impl ShuffledBatchIterator {
    /// Creates an iterator with an entropy-seeded shuffle.
    ///
    /// # Errors
    ///
    /// Returns [`GanError::InsufficientData`] if the dataset cannot fill one
    /// batch, and a configuration error for a zero batch size or misaligned
    /// arrays.
    pub fn new(data: Dataset, batch_size: usize) -> Result<Self> {
        Self::build(data, batch_size, ChaCha8Rng::from_entropy())
    }

    /// Creates an iterator with a reproducible shuffle.
    ///
    /// # Errors
    ///
    /// Same as [`ShuffledBatchIterator::new`].
    pub fn with_seed(data: Dataset, batch_size: usize, seed: u64) -> Result<Self> {
        Self::build(data, batch_size, ChaCha8Rng::seed_from_u64(seed))
    }

    fn build(data: Dataset, batch_size: usize, rng: ChaCha8Rng) -> Result<Self> {
        if batch_size == 0 {
            return Err(GanError::Config("batch_size must be > 0".to_string()));
        }
        data.validate()?;
        let examples = data.len();
        if batch_size > examples {
            return Err(GanError::InsufficientData {
                examples,
                batch_size,
            });
        }
        Ok(Self {
            data,
            batch_size,
            cursor: Cursor::default(),
            rng,
        })
    }

    /// Batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of examples.
    #[must_use]
    pub fn num_examples(&self) -> usize {
        self.data.len()
    }

    /// Full batches per epoch.
    #[must_use]
    pub fn steps_per_epoch(&self) -> usize {
        self.data.len() / self.batch_size
    }

    /// Current cursor.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// The underlying arrays, in their current order.
    #[must_use]
    pub fn dataset(&self) -> &Dataset {
        &self.data
    }

    /// Returns the next batch, reshuffling first if the epoch is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors from slicing or permuting.
    pub fn next_batch(&mut self) -> Result<Batch> {
        if self.cursor.pointer + self.batch_size > self.data.len() {
            self.reshuffle()?;
        }
        let batch = self.data.slice(self.cursor.pointer, self.batch_size)?;
        self.cursor.pointer += self.batch_size;
        Ok(batch)
    }

    /// Lazily yields the batches left in the current epoch.
    ///
    /// Called mid-epoch, it stops at the epoch boundary. Called once the
    /// epoch is exhausted, it yields the whole of the next epoch.
    pub fn epoch_batches(&mut self) -> EpochBatches<'_> {
        let left = self.data.len().saturating_sub(self.cursor.pointer) / self.batch_size;
        let remaining = if left == 0 { self.steps_per_epoch() } else { left };
        EpochBatches {
            source: self,
            remaining,
        }
    }

    /// Positions the cursor as if `global_step` steps had been served.
    pub fn resume(&mut self, global_step: u64) {
        self.cursor = Cursor::from_global_step(global_step, self.steps_per_epoch(), self.batch_size);
    }

    fn reshuffle(&mut self) -> Result<()> {
        let n = self.data.len();
        let mut order: Vec<u32> = (0..n as u32).collect();
        order.shuffle(&mut self.rng);
        let order = Tensor::from_vec(order, n, self.data.device())?;
        self.data.permute(&order)?;
        self.cursor.pointer = 0;
        self.cursor.epoch += 1;
        Ok(())
    }
}

/// Iterator over the batches of one epoch.
#[derive(Debug)]
pub struct EpochBatches<'a> {
    source: &'a mut ShuffledBatchIterator,
    remaining: usize,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.source.next_batch())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

fn leading_dim(tensor: &Tensor) -> usize {
    tensor.dims().first().copied().unwrap_or(0)
}
