use burn::{
    module::Param,
    nn::{
        Initializer, LeakyRelu, LeakyReluConfig, Linear, LinearConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
    tensor::{
        activation::relu,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::error::{self, Error};
use crate::model::constants::LEAKY_SLOPE;

pub(crate) fn conv2d<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(bias)
        .init(device)
}

/// Nearest-neighbour resampling to an absolute spatial size.
pub fn resize<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if [h, w] == size {
        return x;
    }
    interpolate(x, size, InterpolateOptions::new(InterpolateMode::Nearest))
}

fn leaky<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    burn::tensor::activation::leaky_relu(x, LEAKY_SLOPE)
}

/// Condition-dependent per-channel scale and shift.
///
/// `gamma` and `beta` are two-layer projections `D -> C -> C`. The second layer of `gamma`
/// starts with zero weight and unit bias, the second layer of `beta` starts at zero, so a
/// freshly built block is the identity on its feature map.
#[derive(Module, Debug)]
pub struct Affine<B: Backend> {
    gamma_in: Linear<B>,
    gamma_out: Linear<B>,
    beta_in: Linear<B>,
    beta_out: Linear<B>,
}

#[derive(Config, Debug)]
pub struct AffineConfig {
    pub cond_dim: usize,
    pub num_features: usize,
}

impl AffineConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Affine<B> {
        let features = self.num_features;
        let zeroed = LinearConfig::new(features, features).with_initializer(Initializer::Zeros);

        let mut gamma_out = zeroed.init(device);
        gamma_out.bias = Some(Param::from_tensor(Tensor::ones([features], device)));

        Affine {
            gamma_in: LinearConfig::new(self.cond_dim, features).init(device),
            gamma_out,
            beta_in: LinearConfig::new(self.cond_dim, features).init(device),
            beta_out: zeroed.init(device),
        }
    }
}

impl<B: Backend> Affine<B> {
    pub fn forward(&self, x: Tensor<B, 4>, cond: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, channels, _, _] = x.dims();
        let gamma = self
            .gamma_out
            .forward(relu(self.gamma_in.forward(cond.clone())))
            .reshape([batch, channels, 1, 1]);
        let beta = self
            .beta_out
            .forward(relu(self.beta_in.forward(cond)))
            .reshape([batch, channels, 1, 1]);

        x * gamma + beta
    }
}

/// Two affine modulations, each followed by a leaky rectifier. Spatial size is unchanged.
#[derive(Module, Debug)]
pub struct FusionBlock<B: Backend> {
    affine0: Affine<B>,
    affine1: Affine<B>,
    activation: LeakyRelu,
}

#[derive(Config, Debug)]
pub struct FusionBlockConfig {
    pub cond_dim: usize,
    pub num_features: usize,
}

impl FusionBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FusionBlock<B> {
        let affine = AffineConfig::new(self.cond_dim, self.num_features);
        FusionBlock {
            affine0: affine.init(device),
            affine1: affine.init(device),
            activation: LeakyReluConfig::new()
                .with_negative_slope(LEAKY_SLOPE)
                .init(),
        }
    }
}

impl<B: Backend> FusionBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>, cond: Tensor<B, 2>) -> Tensor<B, 4> {
        let h = self.affine0.forward(x, cond.clone());
        let h = self.activation.forward(h);
        let h = self.affine1.forward(h, cond);
        self.activation.forward(h)
    }
}

/// Residual block `conv -> fuse -> conv -> fuse` with a learned 1x1 shortcut when the
/// channel count changes.
#[derive(Module, Debug)]
pub struct MappingBlock<B: Backend> {
    conv1: Conv2d<B>,
    fuse1: FusionBlock<B>,
    conv2: Conv2d<B>,
    fuse2: FusionBlock<B>,
    shortcut: Option<Conv2d<B>>,
}

#[derive(Config, Debug)]
pub struct MappingBlockConfig {
    pub in_channels: usize,
    pub mid_channels: usize,
    pub out_channels: usize,
    pub cond_dim: usize,
    #[config(default = 3)]
    pub kernel: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = 1)]
    pub padding: usize,
}

impl MappingBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MappingBlock<B> {
        let (k, s, p) = (self.kernel, self.stride, self.padding);
        MappingBlock {
            conv1: conv2d([self.in_channels, self.mid_channels], k, s, p, true, device),
            fuse1: FusionBlockConfig::new(self.cond_dim, self.mid_channels).init(device),
            conv2: conv2d([self.mid_channels, self.out_channels], k, s, p, true, device),
            fuse2: FusionBlockConfig::new(self.cond_dim, self.out_channels).init(device),
            shortcut: (self.in_channels != self.out_channels)
                .then(|| conv2d([self.in_channels, self.out_channels], 1, 1, 0, true, device)),
        }
    }
}

impl<B: Backend> MappingBlock<B> {
    pub fn forward(&self, h: Tensor<B, 4>, cond: Tensor<B, 2>) -> Tensor<B, 4> {
        let residual = self.conv1.forward(h.clone());
        let residual = self.fuse1.forward(residual, cond.clone());
        let residual = self.conv2.forward(residual);
        let residual = self.fuse2.forward(residual, cond);

        let shortcut = match &self.shortcut {
            Some(conv) => conv.forward(h),
            None => h,
        };
        shortcut + residual
    }
}

/// Conditional decoder block: resample to a target size, then `fuse -> conv -> fuse -> conv`
/// added to a (possibly projected) shortcut.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    fuse1: FusionBlock<B>,
    conv1: Conv2d<B>,
    fuse2: FusionBlock<B>,
    conv2: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
}

#[derive(Config, Debug)]
pub struct UpBlockConfig {
    pub cond_dim: usize,
    pub in_channels: usize,
    pub out_channels: usize,
}

impl UpBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UpBlock<B> {
        let (fin, fout) = (self.in_channels, self.out_channels);
        UpBlock {
            fuse1: FusionBlockConfig::new(self.cond_dim, fin).init(device),
            conv1: conv2d([fin, fout], 3, 1, 1, true, device),
            fuse2: FusionBlockConfig::new(self.cond_dim, fout).init(device),
            conv2: conv2d([fout, fout], 3, 1, 1, true, device),
            shortcut: (fin != fout).then(|| conv2d([fin, fout], 1, 1, 0, true, device)),
        }
    }
}

impl<B: Backend> UpBlock<B> {
    pub fn forward(&self, h: Tensor<B, 4>, cond: Tensor<B, 2>, size: [usize; 2]) -> Tensor<B, 4> {
        let h = resize(h, size);

        let residual = self.fuse1.forward(h.clone(), cond.clone());
        let residual = self.conv1.forward(residual);
        let residual = self.fuse2.forward(residual, cond);
        let residual = self.conv2.forward(residual);

        let shortcut = match &self.shortcut {
            Some(conv) => conv.forward(h),
            None => h,
        };
        shortcut + residual
    }
}

/// Discriminator residual block. The residual branch and the injected encoder feature are
/// each weighted by a learned scalar gate that starts at zero.
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    conv_r1: Conv2d<B>,
    conv_r2: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
    gamma: Param<Tensor<B, 1>>,
    beta: Option<Param<Tensor<B, 1>>>,
}

#[derive(Config, Debug)]
pub struct DownBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Whether the block receives an encoder feature map to inject.
    #[config(default = true)]
    pub encoder_feature: bool,
}

impl DownBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DownBlock<B> {
        let (fin, fout) = (self.in_channels, self.out_channels);
        DownBlock {
            conv_r1: conv2d([fin, fout], 3, 1, 1, false, device),
            conv_r2: conv2d([fout, fout], 3, 1, 1, false, device),
            shortcut: (fin != fout).then(|| conv2d([fin, fout], 1, 1, 0, true, device)),
            gamma: Param::from_tensor(Tensor::zeros([1], device)),
            beta: self
                .encoder_feature
                .then(|| Param::from_tensor(Tensor::zeros([1], device))),
        }
    }
}

impl<B: Backend> DownBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>, feature: Option<Tensor<B, 4>>) -> Tensor<B, 4> {
        let residual = leaky(self.conv_r1.forward(x.clone()));
        let residual = leaky(self.conv_r2.forward(residual));

        let x = match &self.shortcut {
            Some(conv) => conv.forward(x),
            None => x,
        };
        let out = x + residual * self.gamma.val().reshape([1, 1, 1, 1]);

        match (&self.beta, feature) {
            (Some(beta), Some(feature)) => out + feature * beta.val().reshape([1, 1, 1, 1]),
            _ => out,
        }
    }
}

/// Sub-pixel rearrangement `[B, C*r*r, H, W] -> [B, C, H*r, W*r]`.
#[derive(Module, Debug, Clone)]
pub struct PixelShuffle {
    factor: usize,
}

impl PixelShuffle {
    pub fn new(factor: usize) -> Self {
        Self { factor }
    }

    pub fn forward<B: Backend>(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = input.dims();
        let r = self.factor;
        let out_channels = channels / (r * r);

        // [B, C, r1, r2, H, W] -> [B, C, H, r1, W, r2]
        input
            .reshape([batch, out_channels, r, r, height, width])
            .swap_dims(2, 4)
            .swap_dims(3, 4)
            .swap_dims(4, 5)
            .reshape([batch, out_channels, height * r, width * r])
    }
}

/// Chain of `conv -> pixel shuffle` stages. Powers of two use factor-2 stages, 3 uses a single
/// factor-3 stage.
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    convs: Vec<Conv2d<B>>,
    shuffle: PixelShuffle,
}

#[derive(Config, Debug)]
pub struct UpsampleConfig {
    pub scale: usize,
    pub num_features: usize,
}

impl UpsampleConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<Upsample<B>> {
        let nf = self.num_features;
        let (stages, factor) = match self.scale {
            0 => return Err(Error::UnsupportedScale(0)),
            s if s & (s - 1) == 0 => (s.trailing_zeros() as usize, 2),
            3 => (1, 3),
            s => return Err(Error::UnsupportedScale(s)),
        };

        let convs = (0..stages)
            .map(|_| conv2d([nf, factor * factor * nf], 3, 1, 1, true, device))
            .collect();

        Ok(Upsample {
            convs,
            shuffle: PixelShuffle::new(factor),
        })
    }
}

impl<B: Backend> Upsample<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.convs
            .iter()
            .fold(x, |x, conv| self.shuffle.forward(conv.forward(x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn to_vec<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn affine_starts_as_identity() {
        let device = Default::default();
        let affine = AffineConfig::new(6, 4).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random(
            [2, 4, 3, 5],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let cond = Tensor::<TestBackend, 2>::random(
            [2, 6],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        let out = affine.forward(x.clone(), cond);

        assert_eq!(out.dims(), [2, 4, 3, 5]);
        for (a, b) in to_vec(out).into_iter().zip(to_vec(x)) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn fusion_block_keeps_shape_and_rectifies() {
        let device = Default::default();
        let block = FusionBlockConfig::new(8, 3).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::from_floats(
            [[[[-1.0, 2.0]], [[0.5, -4.0]], [[0.0, 1.0]]]],
            &device,
        );
        let cond = Tensor::<TestBackend, 2>::zeros([1, 8], &device);

        let out = block.forward(x, cond);

        // identity affines, so only the two leaky rectifiers act
        let expected = [-0.04, 2.0, 0.5, -0.16, 0.0, 1.0];
        assert_eq!(out.dims(), [1, 3, 1, 2]);
        for (a, b) in to_vec(out).into_iter().zip(expected) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn up_block_resamples_to_target() {
        let device = Default::default();
        let block = UpBlockConfig::new(4, 6, 3).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([2, 6, 7, 7], Distribution::Default, &device);
        let cond = Tensor::<TestBackend, 2>::ones([2, 4], &device);

        assert_eq!(block.forward(x, cond, [8, 8]).dims(), [2, 3, 8, 8]);
    }

    #[test]
    fn down_block_gates_start_closed() {
        let device = Default::default();
        let block = DownBlockConfig::new(4, 4).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([1, 4, 5, 5], Distribution::Default, &device);
        let feature = Tensor::<TestBackend, 4>::ones([1, 4, 5, 5], &device);

        let out = block.forward(x.clone(), Some(feature));

        assert_eq!(to_vec(out), to_vec(x));
    }

    #[test]
    fn pixel_shuffle_matches_channel_to_space_layout() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 1, Int>::arange(0..8, &device)
            .float()
            .reshape([1, 4, 1, 2]);

        let out = PixelShuffle::new(2).forward(input);

        assert_eq!(out.dims(), [1, 1, 2, 4]);
        assert_eq!(to_vec(out), vec![0.0, 2.0, 1.0, 3.0, 4.0, 6.0, 5.0, 7.0]);
    }

    #[test]
    fn upsample_supports_powers_of_two_and_three() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([1, 2, 3, 5], &device);
        for (scale, expected) in [(1, [3, 5]), (2, [6, 10]), (4, [12, 20]), (3, [9, 15])] {
            let up = UpsampleConfig::new(scale, 2).init::<TestBackend>(&device).unwrap();
            let [_, c, h, w] = up.forward(x.clone()).dims();
            assert_eq!((c, [h, w]), (2, expected));
        }
    }

    #[test]
    fn upsample_rejects_unsupported_scale() {
        let device = Default::default();
        for scale in [0, 5, 6] {
            let err = UpsampleConfig::new(scale, 2).init::<TestBackend>(&device).unwrap_err();
            assert!(matches!(err, Error::UnsupportedScale(s) if s == scale));
        }
    }
}
