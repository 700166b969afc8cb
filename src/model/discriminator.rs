use crate::model::layers::conv2d;
use crate::model::AdversarialCritic;
use burn::nn::conv::Conv2d;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the multi-scale PatchGAN discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    #[config(default = 3)]
    pub input_dim: usize,
    #[config(default = 32)]
    pub dim: usize,
    /// Strided convolutions per scale.
    #[config(default = 3)]
    pub n_layer: usize,
    #[config(default = 2)]
    pub num_scales: usize,
}

/// One PatchGAN branch producing a map of real/fake scores.
#[derive(Module, Debug)]
pub struct PatchDiscriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> PatchDiscriminator<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self
            .convs
            .iter()
            .fold(images, |x, conv| leaky_relu(conv.forward(x), 0.2));
        self.head.forward(x)
    }
}

/// PatchGAN discriminators applied to an image pyramid, trained with
/// least-squares GAN objectives.
#[derive(Module, Debug)]
pub struct MultiScaleDiscriminator<B: Backend> {
    scales: Vec<PatchDiscriminator<B>>,
    downsample: AvgPool2d,
}

impl DiscriminatorConfig {
    /// Initialize one branch per scale on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiScaleDiscriminator<B> {
        let scales = (0..self.num_scales)
            .map(|_| {
                let mut convs = Vec::with_capacity(self.n_layer);
                let mut channels = self.input_dim;
                let mut out_channels = self.dim;
                for _ in 0..self.n_layer {
                    convs.push(conv2d(channels, out_channels, 4, 2, 1, true, device));
                    channels = out_channels;
                    out_channels *= 2;
                }
                let head = conv2d(channels, 1, 1, 1, 0, true, device);
                PatchDiscriminator { convs, head }
            })
            .collect();

        let downsample = AvgPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_count_include_pad(false)
            .init();

        MultiScaleDiscriminator { scales, downsample }
    }
}

impl<B: Backend> MultiScaleDiscriminator<B> {
    /// Score maps from the finest to the coarsest scale.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut outputs = Vec::with_capacity(self.scales.len());
        let mut x = images;
        for (idx, branch) in self.scales.iter().enumerate() {
            outputs.push(branch.forward(x.clone()));
            if idx + 1 < self.scales.len() {
                x = self.downsample.forward(x);
            }
        }
        outputs
    }
}

impl<B: Backend> AdversarialCritic<B> for MultiScaleDiscriminator<B> {
    fn calc_gen_loss(&self, fake: Tensor<B, 4>) -> Tensor<B, 1> {
        let device = fake.device();
        self.forward(fake)
            .into_iter()
            .fold(Tensor::zeros([1], &device), |loss, out| {
                loss.add(out.sub_scalar(1.0).square().mean())
            })
    }

    fn calc_dis_loss(&self, fake: Tensor<B, 4>, real: Tensor<B, 4>) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let device = fake.device();
        let fake_outs = self.forward(fake);
        let real_outs = self.forward(real);
        let num_scales = real_outs.len().max(1) as f64;

        let mut loss = Tensor::<B, 1>::zeros([1], &device);
        let mut real_score = Tensor::<B, 1>::zeros([1], &device);
        for (out_fake, out_real) in fake_outs.into_iter().zip(real_outs) {
            real_score = real_score.add(out_real.clone().detach().mean());
            loss = loss
                .add(out_fake.square().mean())
                .add(out_real.sub_scalar(1.0).square().mean());
        }
        (loss, real_score.div_scalar(num_scales))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> DiscriminatorConfig {
        DiscriminatorConfig::new().with_dim(4).with_n_layer(2)
    }

    #[test]
    fn forward_returns_one_map_per_scale() {
        let device = Default::default();
        let dis = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Default, &device);

        let outputs = dis.forward(images);

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].dims(), [2, 1, 4, 4]);
        assert_eq!(outputs[1].dims(), [2, 1, 2, 2]);
    }

    #[test]
    fn losses_are_non_negative_scalars() {
        let device = Default::default();
        let dis = tiny_config().init::<TestBackend>(&device);
        let fake = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Default, &device);
        let real = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Default, &device);

        let gen_loss = dis.calc_gen_loss(fake.clone());
        let (dis_loss, _) = dis.calc_dis_loss(fake, real);

        assert_eq!(gen_loss.dims(), [1]);
        assert!(gen_loss.into_scalar() >= 0.0);
        assert!(dis_loss.into_scalar() >= 0.0);
    }
}
