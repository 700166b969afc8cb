pub mod discriminator;
pub mod generator;
pub mod identity;
pub mod layers;

use burn::prelude::*;
use burn::tensor::activation::log_softmax;

pub use discriminator::{DiscriminatorConfig, MultiScaleDiscriminator};
pub use generator::{AdaInGenerator, GeneratorConfig};
pub use identity::{IdNet, IdNetConfig};

/// Architecture settings for the three sub-networks.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub gen: GeneratorConfig,
    pub dis: DiscriminatorConfig,
    pub id: IdNetConfig,
}

impl ModelConfig {
    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> AdaInGenerator<B> {
        self.gen.init(device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> MultiScaleDiscriminator<B> {
        self.dis.init(device)
    }

    pub fn init_id_net<B: Backend>(&self, device: &B::Device) -> IdNet<B> {
        self.id.init(device)
    }
}

/// Structure encoder / identity-conditioned decoder.
pub trait StructureGenerator<B: Backend> {
    /// Encode a structure (pose) image into an identity-free structure code.
    fn encode(&self, structure: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Synthesize an image from a structure code and an identity embedding.
    fn decode(&self, code: Tensor<B, 4>, identity: Tensor<B, 2>) -> Tensor<B, 4>;
}

/// Adversarial loss contract for both update directions.
pub trait AdversarialCritic<B: Backend> {
    /// Loss the generator minimizes to make `fake` look real.
    fn calc_gen_loss(&self, fake: Tensor<B, 4>) -> Tensor<B, 1>;

    /// Loss the discriminator minimizes, plus a detached diagnostic value.
    fn calc_dis_loss(&self, fake: Tensor<B, 4>, real: Tensor<B, 4>) -> (Tensor<B, 1>, Tensor<B, 1>);
}

/// How the identity extractor runs for a given call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityMode {
    /// Trainable forward pass, stochastic layers active.
    Train,
    /// Deterministic forward pass used when the extractor is frozen.
    Fix,
    /// Inference for visualization, embedding only.
    Display,
}

/// Identity embedding plus the classification/memory feature vector.
#[derive(Clone, Debug)]
pub struct IdentityOutput<B: Backend> {
    pub feat: Tensor<B, 2>,
    pub logits: Option<Tensor<B, 2>>,
}

pub trait IdentityExtractor<B: Backend> {
    fn extract(&self, images: Tensor<B, 4>, mode: IdentityMode) -> IdentityOutput<B>;
}

/// Mean absolute error with the target cut out of the graph.
pub fn recon_criterion<B: Backend, const D: usize>(
    input: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, 1> {
    input.sub(target.detach()).abs().mean()
}

/// Cross entropy against soft (e.g. mixed one-hot) targets.
pub fn cross_entropy_one_hot<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    log_softmax(logits, 1)
        .mul(targets)
        .sum_dim(1)
        .neg()
        .mean()
}

/// Row-wise L2 normalization.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().square().sum_dim(1).sqrt().clamp_min(1e-12);
    x.div(norm)
}

/// Per-class mean of normalized features, re-normalized. Classes without
/// samples get a zero row.
pub fn class_centers<B: Backend>(
    features: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    num_classes: usize,
) -> Tensor<B, 2> {
    let one_hot = labels.one_hot::<2>(num_classes).float();
    let counts = one_hot.clone().sum_dim(0).transpose().clamp_min(1.0);
    let sums = one_hot.transpose().matmul(l2_normalize(features));
    l2_normalize(sums.div(counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn assert_close<const D: usize>(actual: Tensor<TestBackend, D>, expected: &[f32]) {
        let actual = actual.into_data().to_vec::<f32>().unwrap();
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn recon_criterion_is_zero_for_identical_inputs() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Normal(0.0, 1.0), &device);

        let loss = recon_criterion(x.clone(), x).into_scalar();

        assert_eq!(loss, 0.0);
    }

    #[test]
    fn recon_criterion_is_mean_absolute_error() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 2>::from_floats([[1.0, -1.0], [0.0, 2.0]], &device);
        let target = Tensor::<TestBackend, 2>::zeros([2, 2], &device);

        let loss = recon_criterion(input, target).into_scalar();

        assert!((loss - 1.0).abs() < 1e-6);
    }

    #[test]
    fn one_hot_cross_entropy_matches_hard_label_cross_entropy() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[2.0, 0.5, -1.0], [0.1, 0.2, 3.0]], &device);
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([0, 2], &device);
        let targets = labels.clone().one_hot::<2>(3).float();

        let soft = cross_entropy_one_hot(logits.clone(), targets);
        let hard = burn::nn::loss::CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, labels);

        let hard = hard.into_data().to_vec::<f32>().unwrap();
        assert_close(soft, &hard);
    }

    #[test]
    fn l2_normalize_produces_unit_rows() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[3.0, 4.0], [0.0, -2.0]], &device);

        let norms = l2_normalize(x).square().sum_dim(1).sqrt();

        assert_close(norms, &[1.0, 1.0]);
    }

    #[test]
    fn class_centers_average_features_per_label() {
        let device = Default::default();
        let features = Tensor::<TestBackend, 2>::from_floats(
            [[1.0, 0.0], [0.0, 1.0], [0.0, 2.0]],
            &device,
        );
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([0, 1, 1], &device);

        let centers = class_centers(features, labels, 3);

        assert_close(centers, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
    }
}
