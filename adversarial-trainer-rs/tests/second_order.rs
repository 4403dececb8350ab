//! Gradient penalty behaviour across threads.
//!
//! candle decides once per thread whether backward passes keep gradient
//! graphs, so this file holds a single test and owns its process.

use adversarial_trainer_rs::penalty::{second_order_gradients_available, GradientPenalty};
use adversarial_trainer_rs::GanError;
use candle_core::{Device, Tensor, Var};

struct TwoLayerCritic {
    w1: Var,
    w2: Var,
}

impl TwoLayerCritic {
    fn new() -> Self {
        let device = Device::Cpu;
        Self {
            w1: Var::from_tensor(&Tensor::new(&[[0.5f32, -1.0], [2.0, 0.25]], &device).unwrap())
                .unwrap(),
            w2: Var::from_tensor(&Tensor::new(&[[1.5f32], [-0.5]], &device).unwrap()).unwrap(),
        }
    }

    fn score(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.matmul(self.w1.as_tensor())?.matmul(self.w2.as_tensor())
    }
}

fn inputs() -> (Tensor, Tensor) {
    let device = Device::Cpu;
    let real = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [1.0, 1.0]], &device).unwrap();
    let fake = Tensor::new(&[[-1f32, 0.5], [0.5, -1.0], [0.0, 0.0]], &device).unwrap();
    (real, fake)
}

#[test]
fn test_penalty_requires_graphs_kept_from_first_backward() {
    std::env::remove_var("CANDLE_GRAD_DO_NOT_DETACH");

    let late = std::thread::spawn(|| {
        let critic = TwoLayerCritic::new();
        let (real, _) = inputs();
        critic.score(&real).unwrap().sum_all().unwrap().backward().unwrap();

        let mut penalty = GradientPenalty::new(1.0, 0);
        let (real, fake) = inputs();
        let result = penalty.compute(&real, &fake, |x: &Tensor| critic.score(x));
        (second_order_gradients_available().unwrap(), result)
    })
    .join()
    .unwrap();
    assert!(!late.0);
    assert!(matches!(late.1, Err(GanError::Config(_))));

    let fresh = std::thread::spawn(|| {
        let critic = TwoLayerCritic::new();
        let mut penalty = GradientPenalty::new(1.0, 0);
        let (real, fake) = inputs();
        let value = penalty
            .compute(&real, &fake, |x: &Tensor| critic.score(x))
            .unwrap();
        let grads = value.backward().unwrap();
        grads
            .get(critic.w2.as_tensor())
            .map(|g| g.flatten_all().unwrap().to_vec1::<f32>().unwrap())
    })
    .join()
    .unwrap();
    let dw2 = fresh.expect("penalty gradient reaches the second layer");
    assert!(dw2.iter().any(|v| v.abs() > 1e-3), "dw2 = {dw2:?}");
}
