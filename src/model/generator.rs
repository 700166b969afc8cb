use crate::model::layers::{conv2d, AdainParams, AdainResBlock};
use crate::model::StructureGenerator;
use burn::nn::conv::{Conv2d, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the structure-encoder / AdaIN-decoder generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    /// Channels of the structure image.
    #[config(default = 1)]
    pub input_dim: usize,
    #[config(default = 3)]
    pub output_dim: usize,
    #[config(default = 32)]
    pub dim: usize,
    #[config(default = 2)]
    pub n_downsample: usize,
    #[config(default = 2)]
    pub n_res: usize,
    /// Width of the identity embedding used for conditioning.
    #[config(default = 128)]
    pub style_dim: usize,
    #[config(default = 256)]
    pub mlp_dim: usize,
}

/// Generator that keeps structure in a spatial code and injects identity
/// through adaptive instance norm.
#[derive(Module, Debug)]
pub struct AdaInGenerator<B: Backend> {
    enc_convs: Vec<Conv2d<B>>,
    enc_norms: Vec<InstanceNorm<B>>,
    res_blocks: Vec<AdainResBlock<B>>,
    mlp: Vec<Linear<B>>,
    up_convs: Vec<ConvTranspose2d<B>>,
    up_norms: Vec<InstanceNorm<B>>,
    out_conv: Conv2d<B>,
    #[module(ignore)]
    code_dim: usize,
}

impl GeneratorConfig {
    /// Channels of the structure code produced by `encode`.
    pub fn code_dim(&self) -> usize {
        self.dim << self.n_downsample
    }

    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> AdaInGenerator<B> {
        let mut enc_convs = Vec::with_capacity(self.n_downsample + 1);
        let mut enc_norms = Vec::with_capacity(self.n_downsample + 1);
        enc_convs.push(conv2d(self.input_dim, self.dim, 7, 1, 3, true, device));
        enc_norms.push(InstanceNormConfig::new(self.dim).init(device));
        let mut channels = self.dim;
        for _ in 0..self.n_downsample {
            enc_convs.push(conv2d(channels, channels * 2, 4, 2, 1, true, device));
            enc_norms.push(InstanceNormConfig::new(channels * 2).init(device));
            channels *= 2;
        }

        let res_blocks = (0..self.n_res)
            .map(|_| AdainResBlock::new(channels, device))
            .collect();

        // Two AdaIN layers per residual block, each with a scale and a shift.
        let num_adain_params = self.n_res * 2 * 2 * channels;
        let mlp = vec![
            LinearConfig::new(self.style_dim, self.mlp_dim).init(device),
            LinearConfig::new(self.mlp_dim, self.mlp_dim).init(device),
            LinearConfig::new(self.mlp_dim, num_adain_params).init(device),
        ];

        let mut up_convs = Vec::with_capacity(self.n_downsample);
        let mut up_norms = Vec::with_capacity(self.n_downsample);
        for _ in 0..self.n_downsample {
            up_convs.push(up_conv(channels, channels / 2, device));
            up_norms.push(InstanceNormConfig::new(channels / 2).init(device));
            channels /= 2;
        }
        let out_conv = conv2d(channels, self.output_dim, 7, 1, 3, true, device);

        AdaInGenerator {
            enc_convs,
            enc_norms,
            res_blocks,
            mlp,
            up_convs,
            up_norms,
            out_conv,
            code_dim: self.code_dim(),
        }
    }
}

impl<B: Backend> AdaInGenerator<B> {
    /// Map the identity embedding to the AdaIN parameters of every block.
    fn adain_params(&self, identity: Tensor<B, 2>) -> Vec<AdainParams<B>> {
        let last = self.mlp.len() - 1;
        let mut h = identity;
        for (idx, layer) in self.mlp.iter().enumerate() {
            h = layer.forward(h);
            if idx != last {
                h = relu(h);
            }
        }

        let c = self.code_dim;
        (0..self.res_blocks.len() * 2)
            .map(|idx| {
                let base = idx * 2 * c;
                AdainParams {
                    scale: h.clone().slice_dim(1, base..base + c).add_scalar(1.0),
                    shift: h.clone().slice_dim(1, base + c..base + 2 * c),
                }
            })
            .collect()
    }
}

impl<B: Backend> StructureGenerator<B> for AdaInGenerator<B> {
    fn encode(&self, structure: Tensor<B, 4>) -> Tensor<B, 4> {
        self.enc_convs
            .iter()
            .zip(self.enc_norms.iter())
            .fold(structure, |x, (conv, norm)| relu(norm.forward(conv.forward(x))))
    }

    fn decode(&self, code: Tensor<B, 4>, identity: Tensor<B, 2>) -> Tensor<B, 4> {
        let params = self.adain_params(identity);
        let mut x = code;
        for (block, pair) in self.res_blocks.iter().zip(params.chunks(2)) {
            x = block.forward(x, &pair[0], &pair[1]);
        }
        for (conv, norm) in self.up_convs.iter().zip(self.up_norms.iter()) {
            x = relu(norm.forward(conv.forward(x)));
        }
        self.out_conv.forward(x).tanh()
    }
}

fn up_conv<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> GeneratorConfig {
        GeneratorConfig::new()
            .with_dim(4)
            .with_style_dim(8)
            .with_mlp_dim(8)
            .with_n_res(1)
    }

    #[test]
    fn encode_downsamples_structure() {
        let device = Default::default();
        let config = tiny_config();
        let generator = config.init::<TestBackend>(&device);
        let structure = Tensor::<TestBackend, 4>::random([2, 1, 16, 16], Distribution::Default, &device);

        let code = generator.encode(structure);

        assert_eq!(code.dims(), [2, config.code_dim(), 4, 4]);
    }

    #[test]
    fn decode_restores_image_resolution_in_tanh_range() {
        let device = Default::default();
        let generator = tiny_config().init::<TestBackend>(&device);
        let structure = Tensor::<TestBackend, 4>::random([3, 1, 16, 16], Distribution::Default, &device);
        let identity = Tensor::<TestBackend, 2>::random([3, 8], Distribution::Normal(0.0, 1.0), &device);

        let image = generator.decode(generator.encode(structure), identity);

        assert_eq!(image.dims(), [3, 3, 16, 16]);
        let max = image.abs().max().into_scalar();
        assert!(max <= 1.0);
    }
}
