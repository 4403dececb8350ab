//! Synthetic datasets for the command-line trainer, tests and benches.
//!
//! Decoding real datasets is left to callers; these generators produce
//! in-memory [`Dataset`]s with the shapes each objective expects.

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::{DataConfig, SyntheticKind};
use crate::data::Dataset;
use crate::error::{GanError, Result};

const RING_RADIUS: f32 = 0.8;
const RING_STD: f32 = 0.05;

fn gaussian(rng: &mut ChaCha8Rng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

/// Points drawn from `modes` Gaussians evenly spaced on a ring, shape
/// `[examples, 2]`, optionally with one-hot mode labels `[examples, modes]`.
///
/// # Errors
///
/// Returns a configuration error for zero modes and propagates tensor
/// errors.
pub fn ring_mixture(
    examples: usize,
    modes: usize,
    labelled: bool,
    seed: u64,
    device: &Device,
) -> Result<Dataset> {
    if modes == 0 {
        return Err(GanError::Config("ring mixture needs at least one mode".to_string()));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(examples * 2);
    let mut one_hot = vec![0f32; examples * modes];
    for i in 0..examples {
        let mode = rng.gen_range(0..modes);
        let angle = std::f32::consts::TAU * mode as f32 / modes as f32;
        points.push(RING_RADIUS * angle.cos() + RING_STD * gaussian(&mut rng));
        points.push(RING_RADIUS * angle.sin() + RING_STD * gaussian(&mut rng));
        one_hot[i * modes + mode] = 1.0;
    }
    let dataset = Dataset::new(Tensor::from_vec(points, (examples, 2), device)?);
    if labelled {
        let labels = Tensor::from_vec(one_hot, (examples, modes), device)?;
        return Ok(dataset.with_labels(labels));
    }
    Ok(dataset)
}

/// Smooth random images in `(-1, 1)`, shape `[examples, channels, res, res]`.
///
/// Each channel is `tanh(a·u + b·v + c)` over normalized pixel coordinates
/// with per-image random `a`, `b`, `c`.
///
/// # Errors
///
/// Propagates tensor errors.
pub fn smooth_images(
    examples: usize,
    channels: usize,
    resolution: usize,
    seed: u64,
    device: &Device,
) -> Result<Tensor> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let denom = resolution.saturating_sub(1).max(1) as f32;
    let mut pixels = Vec::with_capacity(examples * channels * resolution * resolution);
    for _ in 0..examples * channels {
        let a: f32 = rng.gen_range(-2.0..2.0);
        let b: f32 = rng.gen_range(-2.0..2.0);
        let c: f32 = rng.gen_range(-0.5..0.5);
        for y in 0..resolution {
            let v = 2.0 * y as f32 / denom - 1.0;
            for x in 0..resolution {
                let u = 2.0 * x as f32 / denom - 1.0;
                pixels.push((a * u + b * v + c).tanh());
            }
        }
    }
    Ok(Tensor::from_vec(
        pixels,
        (examples, channels, resolution, resolution),
        device,
    )?)
}

/// Smooth images paired with their `factor`-times average-pooled
/// counterparts.
///
/// # Errors
///
/// Returns a configuration error unless `factor` divides the resolution.
pub fn paired_images(
    examples: usize,
    channels: usize,
    resolution: usize,
    factor: usize,
    seed: u64,
    device: &Device,
) -> Result<Dataset> {
    if factor == 0 || resolution % factor != 0 {
        return Err(GanError::Config(format!(
            "paired factor {factor} does not divide resolution {resolution}"
        )));
    }
    let high = smooth_images(examples, channels, resolution, seed, device)?;
    let low = high.avg_pool2d(factor)?;
    Ok(Dataset::new(high).with_paired(low))
}

/// Two unaligned image domains of equal shape.
///
/// Domain B (the inputs) holds smooth images; domain A (the paired input)
/// holds independently drawn smooth images with inverted sign. Row `i` of A
/// is unrelated to row `i` of B.
///
/// # Errors
///
/// Propagates tensor errors.
pub fn two_domains(
    examples: usize,
    channels: usize,
    resolution: usize,
    seed: u64,
    device: &Device,
) -> Result<Dataset> {
    let domain_b = smooth_images(examples, channels, resolution, seed, device)?;
    let domain_a =
        smooth_images(examples, channels, resolution, seed.wrapping_add(1), device)?.neg()?;
    Ok(Dataset::new(domain_b).with_paired(domain_a))
}

/// Builds the dataset described by `config`.
///
/// `num_classes` requests one-hot labels; only the ring dataset carries them,
/// with one class per mode.
///
/// # Errors
///
/// Returns a configuration error when labels are requested from an image
/// dataset or the class count differs from the mode count.
pub fn from_config(
    config: &DataConfig,
    num_classes: Option<usize>,
    seed: u64,
    device: &Device,
) -> Result<Dataset> {
    match (config.kind, num_classes) {
        (SyntheticKind::Ring, Some(classes)) if classes != config.modes => {
            Err(GanError::Config(format!(
                "ring dataset has {} modes but {classes} classes were requested",
                config.modes
            )))
        }
        (SyntheticKind::Ring, classes) => {
            ring_mixture(config.examples, config.modes, classes.is_some(), seed, device)
        }
        (_, Some(_)) => Err(GanError::Config(
            "only the ring dataset carries labels".to_string(),
        )),
        (SyntheticKind::Images, None) => Ok(Dataset::new(smooth_images(
            config.examples,
            config.channels,
            config.resolution,
            seed,
            device,
        )?)),
        (SyntheticKind::PairedImages, None) => paired_images(
            config.examples,
            config.channels,
            config.resolution,
            config.paired_factor,
            seed,
            device,
        ),
        (SyntheticKind::TwoDomains, None) => two_domains(
            config.examples,
            config.channels,
            config.resolution,
            seed,
            device,
        ),
    }
}
