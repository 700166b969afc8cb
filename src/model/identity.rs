use crate::model::layers::conv2d;
use crate::model::{IdentityExtractor, IdentityMode, IdentityOutput};
use burn::nn::conv::Conv2d;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the identity feature extractor.
#[derive(Config, Debug)]
pub struct IdNetConfig {
    #[config(default = 3)]
    pub input_dim: usize,
    #[config(default = 32)]
    pub dim: usize,
    #[config(default = 3)]
    pub n_downsample: usize,
    /// Must match the generator's `style_dim`.
    #[config(default = 128)]
    pub embedding_dim: usize,
    /// Width of `f`, the vector used for classification and the memory bank.
    #[config(default = 256)]
    pub num_features: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
}

/// Conv backbone with an embedding head (`feat`) and a feature head (`f`).
#[derive(Module, Debug)]
pub struct IdNet<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    embed: Linear<B>,
    feature: Linear<B>,
}

impl IdNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> IdNet<B> {
        let mut convs = Vec::with_capacity(self.n_downsample + 1);
        convs.push(conv2d(self.input_dim, self.dim, 3, 1, 1, true, device));
        let mut channels = self.dim;
        for _ in 0..self.n_downsample {
            convs.push(conv2d(channels, channels * 2, 4, 2, 1, true, device));
            channels *= 2;
        }

        IdNet {
            convs,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            embed: LinearConfig::new(channels, self.embedding_dim).init(device),
            feature: LinearConfig::new(channels, self.num_features).init(device),
        }
    }
}

impl<B: Backend> IdNet<B> {
    fn pooled(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .convs
            .iter()
            .fold(images, |x, conv| leaky_relu(conv.forward(x), 0.2));
        let pooled = self.pool.forward(x);
        let [batch, channels, _, _] = pooled.dims();
        pooled.reshape([batch, channels])
    }
}

impl<B: Backend> IdentityExtractor<B> for IdNet<B> {
    fn extract(&self, images: Tensor<B, 4>, mode: IdentityMode) -> IdentityOutput<B> {
        let pooled = self.pooled(images);
        match mode {
            IdentityMode::Display => IdentityOutput {
                feat: self.embed.forward(pooled),
                logits: None,
            },
            IdentityMode::Fix => IdentityOutput {
                feat: self.embed.forward(pooled.clone()),
                logits: Some(self.feature.forward(pooled)),
            },
            IdentityMode::Train => {
                let pooled = self.dropout.forward(pooled);
                IdentityOutput {
                    feat: self.embed.forward(pooled.clone()),
                    logits: Some(self.feature.forward(pooled)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn display_mode_returns_embedding_only() {
        let device = Default::default();
        let net = IdNetConfig::new()
            .with_dim(4)
            .with_embedding_dim(8)
            .with_num_features(6)
            .init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Default, &device);

        let display = net.extract(images.clone(), IdentityMode::Display);
        let fixed = net.extract(images, IdentityMode::Fix);

        assert!(display.logits.is_none());
        assert_eq!(display.feat.dims(), [2, 8]);
        assert_eq!(fixed.logits.map(|l| l.dims()), Some([2, 6]));
    }

    #[test]
    fn fix_mode_is_deterministic() {
        let device = Default::default();
        let net = IdNetConfig::new()
            .with_dim(4)
            .with_embedding_dim(8)
            .with_num_features(6)
            .init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Default, &device);

        let a = net.extract(images.clone(), IdentityMode::Fix).feat;
        let b = net.extract(images, IdentityMode::Fix).feat;

        assert_eq!(
            a.into_data().to_vec::<f32>().unwrap(),
            b.into_data().to_vec::<f32>().unwrap()
        );
    }
}
