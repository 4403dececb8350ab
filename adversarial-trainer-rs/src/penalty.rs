//! Critic stabilizers: gradient penalty and weight clipping.
//!
//! The gradient penalty evaluates the critic at random interpolates between
//! real and generated samples and penalizes the deviation of the per-example
//! gradient norm from 1:
//!
//! ```text
//! x̂ = x + α·(g − x),  α ~ U(0, 1) per example
//! penalty = coefficient · mean((‖∇x̂ D(x̂)‖₂ − 1)²)
//! ```
//!
//! Backpropagating the penalty into the critic parameters needs gradients of
//! gradients. candle keeps the graph of computed gradients only when
//! `CANDLE_GRAD_DO_NOT_DETACH` is set before the first backward pass of a
//! thread, which [`enable_second_order_gradients`] does. The flag is read
//! once per thread, so [`GradientPenalty::compute`] refuses to run on a
//! thread that already detaches gradients.

use std::cell::Cell;

use candle_core::{Device, Tensor, Var};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GanError, Result};

/// Stability control applied to discriminator updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stabilizer {
    /// No stabilizer.
    #[default]
    None,
    /// Gradient penalty on interpolates.
    GradientPenalty {
        /// Penalty weight.
        coefficient: f64,
    },
    /// Clamp critic weights after each update.
    WeightClip {
        /// Clamp bound `c`; weights end up in `[-c, c]`.
        bound: f64,
    },
}

impl Stabilizer {
    /// Resolves the stabilizer from the two optional settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when both are set or a value is not
    /// positive.
    pub fn from_options(gradient_penalty: Option<f64>, weight_clip: Option<f64>) -> Result<Self> {
        match (gradient_penalty, weight_clip) {
            (Some(_), Some(_)) => Err(GanError::Config(
                "gradient penalty and weight clipping are mutually exclusive".to_string(),
            )),
            (Some(coefficient), None) if coefficient > 0.0 => {
                Ok(Self::GradientPenalty { coefficient })
            }
            (None, Some(bound)) if bound > 0.0 => Ok(Self::WeightClip { bound }),
            (None, None) => Ok(Self::None),
            _ => Err(GanError::Config(
                "stabilizer values must be positive".to_string(),
            )),
        }
    }

    /// Returns `true` unless this is [`Stabilizer::None`].
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Asks candle to keep the graph of computed gradients.
///
/// Must run before the first backward pass on each thread that computes a
/// penalty; the binary calls it at start-up.
pub fn enable_second_order_gradients() {
    if std::env::var_os("CANDLE_GRAD_DO_NOT_DETACH").is_none() {
        std::env::set_var("CANDLE_GRAD_DO_NOT_DETACH", "1");
    }
}

thread_local! {
    static SECOND_ORDER: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Returns whether backward passes on the current thread keep gradient
/// graphs.
///
/// Differentiates `d/dw [d/dx (x·w)²]` at `x = w = 1`, which is 4 with
/// gradient graphs and 2 when candle detaches intermediate gradients. The
/// answer is cached per thread, matching candle.
///
/// # Errors
///
/// Propagates tensor errors.
pub fn second_order_gradients_available() -> Result<bool> {
    if let Some(known) = SECOND_ORDER.with(Cell::get) {
        return Ok(known);
    }
    let device = Device::Cpu;
    let x = Var::new(&[1f32], &device)?;
    let w = Var::new(&[1f32], &device)?;
    let grads = (x.as_tensor() * w.as_tensor())?.sqr()?.sum_all()?.backward()?;
    let available = match grads.get(x.as_tensor()) {
        Some(dx) => {
            let second = dx.sum_all()?.backward()?;
            match second.get(w.as_tensor()) {
                Some(dw) => (dw.sum_all()?.to_scalar::<f32>()? - 4.0).abs() < 1e-4,
                None => false,
            }
        }
        None => false,
    };
    SECOND_ORDER.with(|c| c.set(Some(available)));
    Ok(available)
}

/// Gradient penalty evaluator.
#[derive(Debug, Clone)]
pub struct GradientPenalty {
    coefficient: f64,
    rng: ChaCha8Rng,
}

impl GradientPenalty {
    /// Creates a penalty with the given weight and interpolation seed.
    #[must_use]
    pub fn new(coefficient: f64, seed: u64) -> Self {
        enable_second_order_gradients();
        Self {
            coefficient,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Penalty weight.
    #[must_use]
    pub fn coefficient(&self) -> f64 {
        self.coefficient
    }

    /// Computes the weighted penalty for `critic` between `real` and `fake`.
    ///
    /// `fake` should be detached from the generator graph.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `real` and `fake` differ in shape
    /// or when the current thread detaches gradients (the penalty would not
    /// reach the critic), and propagates tensor errors from the critic.
    pub fn compute<F>(&mut self, real: &Tensor, fake: &Tensor, mut critic: F) -> Result<Tensor>
    where
        F: FnMut(&Tensor) -> candle_core::Result<Tensor>,
    {
        if !second_order_gradients_available()? {
            return Err(GanError::Config(
                "second-order gradients unavailable on this thread: enable them before its first backward pass"
                    .to_string(),
            ));
        }
        if real.dims() != fake.dims() {
            return Err(GanError::Config(format!(
                "penalty inputs differ in shape: {:?} vs {:?}",
                real.dims(),
                fake.dims()
            )));
        }
        let batch = real.dims().first().copied().unwrap_or(0);
        let mut alpha_shape = vec![1usize; real.rank()];
        if let Some(first) = alpha_shape.first_mut() {
            *first = batch;
        }
        let alphas: Vec<f32> = (0..batch).map(|_| self.rng.gen_range(0.0..1.0)).collect();
        let alpha = Tensor::from_vec(alphas, alpha_shape, real.device())?.to_dtype(real.dtype())?;

        let delta = (fake - real)?;
        let interpolate = real.broadcast_add(&delta.broadcast_mul(&alpha)?)?;
        let interpolate = Var::from_tensor(&interpolate.detach())?;

        let penalty = gradient_norm_penalty(interpolate.as_tensor(), &mut critic)?;
        Ok(penalty.affine(self.coefficient, 0.0)?)
    }
}

/// Unweighted `mean((‖∇x D(x)‖₂ − 1)²)` at the points `x`.
fn gradient_norm_penalty<F>(points: &Tensor, critic: &mut F) -> Result<Tensor>
where
    F: FnMut(&Tensor) -> candle_core::Result<Tensor>,
{
    let scores = critic(points)?;
    let grads = scores.sum_all()?.backward()?;
    let grad = grads
        .get(points)
        .ok_or_else(|| GanError::Config("critic output does not depend on its input".to_string()))?;
    let norms = grad
        .flatten_from(1)?
        .sqr()?
        .sum(1)?
        .affine(1.0, 1e-12)?
        .sqrt()?;
    Ok(norms.affine(1.0, -1.0)?.sqr()?.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn linear_critic(w: &Tensor) -> impl FnMut(&Tensor) -> candle_core::Result<Tensor> + '_ {
        move |x: &Tensor| x.matmul(w)
    }

    #[test]
    fn test_linear_critic_known_penalty() {
        let device = Device::Cpu;
        let w = Tensor::new(&[[3f32], [4.0]], &device).unwrap();
        let real = Tensor::randn(0f32, 1.0, (8, 2), &device).unwrap();
        let fake = Tensor::randn(0f32, 1.0, (8, 2), &device).unwrap();
        let mut gp = GradientPenalty::new(1.0, 0);
        let value = gp
            .compute(&real, &fake, linear_critic(&w))
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // ‖∇‖ = ‖w‖ = 5 everywhere, so the penalty is (5 - 1)².
        assert!((value - 16.0).abs() < 1e-3, "penalty = {value}");
    }

    #[test]
    fn test_coefficient_scales_penalty() {
        let device = Device::Cpu;
        let w = Tensor::new(&[[3f32], [4.0]], &device).unwrap();
        let x = Tensor::ones((4, 2), DType::F32, &device).unwrap();
        let mut gp = GradientPenalty::new(10.0, 0);
        let value = gp
            .compute(&x, &x.zeros_like().unwrap(), linear_critic(&w))
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((value - 160.0).abs() < 1e-2);
    }

    #[test]
    fn test_identical_inputs_stay_finite() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (4, 1, 2, 2), &device).unwrap();
        let mut gp = GradientPenalty::new(10.0, 3);
        // A critic with a vanishing gradient at x̂ must not produce NaN.
        let value = gp
            .compute(&x, &x, |t: &Tensor| t.sqr()?.flatten_from(1)?.sum(1)?.affine(0.0, 1.0))
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(value.is_finite());
        assert!((value - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_penalty_backpropagates_into_critic() {
        enable_second_order_gradients();
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[[3f32], [4.0]], &device).unwrap()).unwrap();
        let real = Tensor::randn(0f32, 1.0, (6, 2), &device).unwrap();
        let fake = Tensor::randn(0f32, 1.0, (6, 2), &device).unwrap();
        let mut gp = GradientPenalty::new(1.0, 11);
        let penalty = gp
            .compute(&real, &fake, |x: &Tensor| x.matmul(w.as_tensor()))
            .unwrap();
        let grads = penalty.backward().unwrap();
        let dw = grads
            .get(w.as_tensor())
            .expect("penalty gradient reaches the critic weights")
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        // d/dw (‖w‖ - 1)² = 2(‖w‖ - 1) · w / ‖w‖ = [4.8, 6.4]
        assert!((dw[0] - 4.8).abs() < 1e-3, "dw = {dw:?}");
        assert!((dw[1] - 6.4).abs() < 1e-3, "dw = {dw:?}");
    }

    #[test]
    fn test_second_order_check_is_cached() {
        enable_second_order_gradients();
        let first = second_order_gradients_available().unwrap();
        assert_eq!(second_order_gradients_available().unwrap(), first);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let device = Device::Cpu;
        let a = Tensor::zeros((4, 2), DType::F32, &device).unwrap();
        let b = Tensor::zeros((4, 3), DType::F32, &device).unwrap();
        let mut gp = GradientPenalty::new(10.0, 0);
        assert!(gp.compute(&a, &b, |x: &Tensor| x.sum(1)).is_err());
    }

    #[test]
    fn test_stabilizer_resolution() {
        assert_eq!(Stabilizer::from_options(None, None).unwrap(), Stabilizer::None);
        assert_eq!(
            Stabilizer::from_options(Some(10.0), None).unwrap(),
            Stabilizer::GradientPenalty { coefficient: 10.0 }
        );
        assert_eq!(
            Stabilizer::from_options(None, Some(0.01)).unwrap(),
            Stabilizer::WeightClip { bound: 0.01 }
        );
        assert!(Stabilizer::from_options(Some(10.0), Some(0.01)).is_err());
        assert!(Stabilizer::from_options(None, Some(-1.0)).is_err());
    }
}
