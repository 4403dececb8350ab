//! Reference multilayer-perceptron networks.
//!
//! The orchestration core is network-agnostic; these small MLPs exist so the
//! command-line trainer, tests and benches can drive real parameter updates.
//! Every network flattens its inputs, so images and 2-D points are handled
//! alike.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::config::GanTrainerConfig;
use crate::error::{GanError, Result};
use crate::objective::{
    Conditioning, CycleBranch, Discriminator, DiscriminatorOutput, DynObjectivePair, Generator,
    GeneratorInput, ObjectiveKind, ObjectivePair, ParameterGroup, ParameterGroups,
};

const LEAKY_SLOPE: f64 = 0.2;

fn leaky_relu(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.maximum(&xs.affine(LEAKY_SLOPE, 0.0)?)
}

/// Stack of linear layers with leaky-ReLU between them.
#[derive(Debug, Clone)]
struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    fn new(input: usize, hidden: &[usize], output: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut width = input;
        for (i, &h) in hidden.iter().enumerate() {
            layers.push(linear(width, h, vb.pp(format!("fc{i}")))?);
            width = h;
        }
        layers.push(linear(width, output, vb.pp("out"))?);
        Ok(Self { layers })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut xs = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last {
                xs = leaky_relu(&xs)?;
            }
        }
        Ok(xs)
    }
}

/// Concatenates the flattened tensors along the feature axis.
fn flat_concat(parts: &[Option<&Tensor>]) -> candle_core::Result<Tensor> {
    let flat = parts
        .iter()
        .flatten()
        .map(|t| t.flatten_from(1))
        .collect::<candle_core::Result<Vec<_>>>()?;
    match flat.len() {
        0 => Err(candle_core::Error::Msg("network received no input".to_string())),
        1 => Ok(flat[0].clone()),
        _ => Tensor::cat(&flat, 1),
    }
}

/// MLP generator with a `tanh` output reshaped to the sample shape.
#[derive(Debug, Clone)]
pub struct MlpGenerator {
    mlp: Mlp,
    output_shape: Vec<usize>,
}

impl MlpGenerator {
    /// `input_dim` is the noise width plus the flattened conditioning width.
    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        output_shape: &[usize],
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let output: usize = output_shape.iter().product();
        Ok(Self {
            mlp: Mlp::new(input_dim, hidden, output, vb)?,
            output_shape: output_shape.to_vec(),
        })
    }
}

impl Generator for MlpGenerator {
    fn generate(&self, input: &GeneratorInput) -> candle_core::Result<Tensor> {
        let xs = flat_concat(&[input.noise.as_ref(), input.conditioning.as_ref()])?;
        let batch = xs.dim(0)?;
        let mut shape = vec![batch];
        shape.extend_from_slice(&self.output_shape);
        self.mlp.forward(&xs)?.tanh()?.reshape(shape)
    }
}

/// MLP discriminator emitting one logit per sample and optional class logits.
#[derive(Debug, Clone)]
pub struct MlpDiscriminator {
    body: Mlp,
    score: Linear,
    classes: Option<Linear>,
    use_conditioning: bool,
}

impl MlpDiscriminator {
    /// `input_dim` is the flattened sample width plus, unless
    /// [`ignoring_conditioning`](Self::ignoring_conditioning) is applied, the
    /// flattened conditioning width. The last hidden width feeds both heads.
    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        num_classes: Option<usize>,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let (&features, body_hidden) = hidden
            .split_last()
            .ok_or_else(|| candle_core::Error::Msg("discriminator needs a hidden layer".into()))?;
        let body = Mlp::new(input_dim, body_hidden, features, vb.pp("body"))?;
        let score = linear(features, 1, vb.pp("score"))?;
        let classes = num_classes
            .map(|n| linear(features, n, vb.pp("classes")))
            .transpose()?;
        Ok(Self {
            body,
            score,
            classes,
            use_conditioning: true,
        })
    }

    /// Scores samples alone even when conditioning is supplied.
    #[must_use]
    pub fn ignoring_conditioning(mut self) -> Self {
        self.use_conditioning = false;
        self
    }
}

impl Discriminator for MlpDiscriminator {
    fn score(
        &self,
        samples: &Tensor,
        conditioning: Option<&Tensor>,
    ) -> candle_core::Result<DiscriminatorOutput> {
        let conditioning = conditioning.filter(|_| self.use_conditioning);
        let xs = flat_concat(&[Some(samples), conditioning])?;
        let features = leaky_relu(&self.body.forward(&xs)?)?;
        Ok(DiscriminatorOutput {
            score: self.score.forward(&features)?,
            class_logits: self
                .classes
                .as_ref()
                .map(|head| head.forward(&features))
                .transpose()?,
        })
    }
}

/// Autoencoding discriminator: its score is a reconstruction of the sample.
#[derive(Debug, Clone)]
pub struct AutoencoderDiscriminator {
    encoder: Mlp,
    decoder: Mlp,
    sample_shape: Vec<usize>,
}

impl AutoencoderDiscriminator {
    /// Creates an autoencoder over samples of `sample_shape`, with
    /// `conditioning_dim` extra encoder inputs and a `bottleneck`-wide code.
    pub fn new(
        sample_shape: &[usize],
        conditioning_dim: usize,
        hidden: &[usize],
        bottleneck: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let sample_dim: usize = sample_shape.iter().product();
        let mut reversed = hidden.to_vec();
        reversed.reverse();
        Ok(Self {
            encoder: Mlp::new(sample_dim + conditioning_dim, hidden, bottleneck, vb.pp("enc"))?,
            decoder: Mlp::new(bottleneck, &reversed, sample_dim, vb.pp("dec"))?,
            sample_shape: sample_shape.to_vec(),
        })
    }
}

impl Discriminator for AutoencoderDiscriminator {
    fn score(
        &self,
        samples: &Tensor,
        conditioning: Option<&Tensor>,
    ) -> candle_core::Result<DiscriminatorOutput> {
        let xs = flat_concat(&[Some(samples), conditioning])?;
        let code = self.encoder.forward(&xs)?;
        let mut shape = vec![samples.dim(0)?];
        shape.extend_from_slice(&self.sample_shape);
        let reconstruction = self.decoder.forward(&code)?.tanh()?.reshape(shape)?;
        Ok(DiscriminatorOutput {
            score: reconstruction,
            class_logits: None,
        })
    }
}

/// Shapes of one pair of reference networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairLayout {
    /// Shape of one sample, without the batch axis.
    pub sample_shape: Vec<usize>,
    /// Latent noise width.
    pub noise_dim: usize,
    /// Conditioning source.
    pub conditioning: Conditioning,
    /// Flattened width of one conditioning row.
    pub conditioning_dim: usize,
}

/// Builds a boxed reference pair for `layout` using the objective, class
/// count, model widths and optimizer settings of `config`.
///
/// # Errors
///
/// Returns a configuration error for an inconsistent layout or the
/// cycle-consistent objective, which [`build_cycle_pair`] builds, and
/// propagates network construction errors.
pub fn build_pair(
    config: &GanTrainerConfig,
    layout: &PairLayout,
    device: &Device,
) -> Result<DynObjectivePair> {
    if config.objective == ObjectiveKind::CycleConsistent {
        return Err(GanError::Config(
            "cycle-consistent pairs are built by build_cycle_pair".to_string(),
        ));
    }
    if layout.noise_dim == 0 && layout.conditioning_dim == 0 {
        return Err(GanError::Config(
            "a generator needs noise or conditioning input".to_string(),
        ));
    }
    let sample_dim: usize = layout.sample_shape.iter().product();
    let hidden = &config.model.hidden_dims;
    let groups = ParameterGroups::new();
    let g_vb = groups.builder(ParameterGroup::Generator, DType::F32, device)?;
    let d_vb = groups.builder(ParameterGroup::Discriminator, DType::F32, device)?;

    let generator = MlpGenerator::new(
        layout.noise_dim + layout.conditioning_dim,
        hidden,
        &layout.sample_shape,
        g_vb,
    )?;

    let discriminator: Box<dyn Discriminator> = match config.objective {
        ObjectiveKind::Reconstruction => {
            let bottleneck = (hidden.last().copied().unwrap_or(2) / 2).max(1);
            Box::new(AutoencoderDiscriminator::new(
                &layout.sample_shape,
                layout.conditioning_dim,
                hidden,
                bottleneck,
                d_vb,
            )?)
        }
        ObjectiveKind::AuxiliaryClassifier => Box::new(
            MlpDiscriminator::new(sample_dim, hidden, config.num_classes, d_vb)?
                .ignoring_conditioning(),
        ),
        ObjectiveKind::Standard | ObjectiveKind::Critic | ObjectiveKind::CycleConsistent => {
            Box::new(MlpDiscriminator::new(
                sample_dim + layout.conditioning_dim,
                hidden,
                None,
                d_vb,
            )?)
        }
    };

    ObjectivePair::new(
        Box::new(generator) as Box<dyn Generator>,
        discriminator,
        groups,
        config.objective,
        layout.conditioning,
        &config.optimizer,
        &config.learning_rates,
    )
}

/// Builds a boxed cycle-consistent pair translating between samples of
/// `domain_a` shape (the paired input) and `domain_b` shape (the inputs).
///
/// Generator variables are prefixed `a2b` and `b2a`, critic variables `b`
/// and `a`.
///
/// # Errors
///
/// Propagates network construction errors and an invalid cycle weight.
pub fn build_cycle_pair(
    config: &GanTrainerConfig,
    domain_a: &[usize],
    domain_b: &[usize],
    device: &Device,
) -> Result<DynObjectivePair> {
    let dim_a: usize = domain_a.iter().product();
    let dim_b: usize = domain_b.iter().product();
    let hidden = &config.model.hidden_dims;
    let groups = ParameterGroups::new();
    let g_vb = groups.builder(ParameterGroup::Generator, DType::F32, device)?;
    let d_vb = groups.builder(ParameterGroup::Discriminator, DType::F32, device)?;

    let a2b = MlpGenerator::new(config.noise_dim + dim_a, hidden, domain_b, g_vb.pp("a2b"))?;
    let b2a = MlpGenerator::new(config.noise_dim + dim_b, hidden, domain_a, g_vb.pp("b2a"))?;
    let critic_b =
        MlpDiscriminator::new(dim_b, hidden, None, d_vb.pp("b"))?.ignoring_conditioning();
    let critic_a =
        MlpDiscriminator::new(dim_a, hidden, None, d_vb.pp("a"))?.ignoring_conditioning();

    ObjectivePair::cycle_consistent(
        Box::new(a2b) as Box<dyn Generator>,
        Box::new(critic_b) as Box<dyn Discriminator>,
        CycleBranch {
            generator: Box::new(b2a) as Box<dyn Generator>,
            discriminator: Box::new(critic_a) as Box<dyn Discriminator>,
            weight: config.cycle_weight,
        },
        groups,
        &config.optimizer,
        &config.learning_rates,
    )
}
