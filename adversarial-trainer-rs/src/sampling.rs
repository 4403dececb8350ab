//! Latent noise and fixed sampling inputs.

use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::warn;

use crate::error::{GanError, Result};
use crate::objective::GeneratorInput;

/// Draws uniform(−1, 1) latent noise.
#[derive(Debug, Clone)]
pub struct NoiseSampler {
    dim: usize,
    rng: ChaCha8Rng,
}

impl NoiseSampler {
    /// Creates a sampler of `dim`-dimensional noise. A zero dimension means
    /// the generator is driven by conditioning only.
    #[must_use]
    pub fn new(dim: usize, seed: u64) -> Self {
        Self {
            dim,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Noise dimensionality.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Samples a `[batch, dim]` noise tensor, or `None` for `dim == 0`.
    ///
    /// # Errors
    ///
    /// Propagates tensor allocation errors.
    pub fn sample(&mut self, batch: usize, device: &Device) -> Result<Option<Tensor>> {
        if self.dim == 0 {
            return Ok(None);
        }
        let values: Vec<f32> = (0..batch * self.dim)
            .map(|_| self.rng.gen_range(-1.0..1.0))
            .collect();
        Ok(Some(Tensor::from_vec(values, (batch, self.dim), device)?))
    }
}

/// Input reused for every periodic sample, so successive samples are
/// comparable.
#[derive(Debug, Clone)]
pub struct FixedSampleInput {
    noise: Option<Tensor>,
    labels: Option<Tensor>,
    conditioning: Option<Tensor>,
    sample_count: usize,
}

impl FixedSampleInput {
    /// Draws fixed noise for `sample_count` samples.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero sample count.
    pub fn new(sample_count: usize, noise_dim: usize, seed: u64, device: &Device) -> Result<Self> {
        if sample_count == 0 {
            return Err(GanError::Config("sample_count must be > 0".to_string()));
        }
        let noise = NoiseSampler::new(noise_dim, seed).sample(sample_count, device)?;
        Ok(Self {
            noise,
            labels: None,
            conditioning: None,
            sample_count,
        })
    }

    /// Adds a one-hot class grid: consecutive blocks of
    /// `sample_count / num_classes` rows share a class.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `num_classes` divides the sample
    /// count.
    pub fn with_class_grid(mut self, num_classes: usize) -> Result<Self> {
        if num_classes == 0 || self.sample_count % num_classes != 0 {
            return Err(GanError::Config(format!(
                "sample_count {} must be a multiple of num_classes {num_classes}",
                self.sample_count
            )));
        }
        let per_class = self.sample_count / num_classes;
        let mut one_hot = vec![0f32; self.sample_count * num_classes];
        for row in 0..self.sample_count {
            one_hot[row * num_classes + row / per_class] = 1.0;
        }
        let device = self.device();
        self.labels = Some(Tensor::from_vec(
            one_hot,
            (self.sample_count, num_classes),
            &device,
        )?);
        Ok(self)
    }

    /// Uses a fixed conditioning tensor (e.g. held-out paired inputs).
    ///
    /// # Errors
    ///
    /// Returns a configuration error if its leading dimension differs from
    /// the sample count.
    pub fn with_conditioning(mut self, conditioning: Tensor) -> Result<Self> {
        let rows = conditioning.dims().first().copied().unwrap_or(0);
        if rows != self.sample_count {
            return Err(GanError::Config(format!(
                "fixed conditioning has {rows} rows, expected {}",
                self.sample_count
            )));
        }
        self.conditioning = Some(conditioning);
        Ok(self)
    }

    /// Number of samples produced per trigger.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// The fixed one-hot grid, if any.
    #[must_use]
    pub fn labels(&self) -> Option<&Tensor> {
        self.labels.as_ref()
    }

    /// Generator input: fixed noise plus labels or paired conditioning.
    #[must_use]
    pub fn generator_input(&self) -> GeneratorInput {
        GeneratorInput {
            noise: self.noise.clone(),
            conditioning: self.labels.clone().or_else(|| self.conditioning.clone()),
        }
    }

    fn device(&self) -> Device {
        self.noise
            .as_ref()
            .or(self.conditioning.as_ref())
            .map_or(Device::Cpu, |t| t.device().clone())
    }
}

/// Tiles `images` (`[n, c, h, w]`) into one `[c, rows·h, cols·w]` grid.
///
/// # Errors
///
/// Returns a configuration error for tensors that are not rank 4 or when
/// `n` is not `rows · cols`.
pub fn tile_grid(images: &Tensor, rows: usize) -> Result<Tensor> {
    let (n, c, h, w) = images.dims4()?;
    if rows == 0 || n % rows != 0 {
        return Err(GanError::Config(format!(
            "cannot tile {n} images into {rows} rows"
        )));
    }
    let cols = n / rows;
    let grid = images
        .reshape((rows, cols, c, h, w))?
        .permute((2, 0, 3, 1, 4))?
        .reshape((c, rows * h, cols * w))?;
    Ok(grid.to_dtype(DType::F32)?)
}

/// Lays out a sample batch for writing.
///
/// Image batches are tiled into a grid with `⌊√n⌋` rows. A batch that does
/// not fill the grid is logged and returned unchanged, as is any tensor
/// that is not an image batch.
#[must_use]
pub fn sample_layout(images: &Tensor) -> Tensor {
    if images.rank() != 4 {
        return images.clone();
    }
    let n = images.dims()[0];
    let rows = (n as f64).sqrt().floor().max(1.0) as usize;
    match tile_grid(images, rows) {
        Ok(grid) => grid,
        Err(e) => {
            warn!(images = n, rows, error = %e, "could not tile samples, keeping the raw batch");
            images.clone()
        }
    }
}
