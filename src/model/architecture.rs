use burn::{
    nn::{LeakyRelu, LeakyReluConfig, Linear, LinearConfig, PRelu, PReluConfig, conv::Conv2d},
    prelude::*,
    tensor::activation::leaky_relu,
};

use crate::error;
use crate::model::{
    blocks::{
        DownBlock, DownBlockConfig, MappingBlock, MappingBlockConfig, UpBlock, UpBlockConfig,
        Upsample, UpsampleConfig, conv2d, resize,
    },
    clip::{ClipTextConfig, ClipTextEncoder, ClipVisionConfig, ClipVisionEncoder},
    constants::{CANONICAL_SIZE, CHANNELS, LEAKY_SLOPE, UPSCALE},
};

/// Fuses the deepest generator features with the frozen vision transformer. The condition is
/// projected to one prompt token per prompted transformer block; only the projections and
/// convolutions around the transformer are trainable.
#[derive(Module, Debug)]
pub struct ClipAdapter<B: Backend> {
    conv_fuse: Conv2d<B>,
    fc_prompt: Linear<B>,
    encoder: ClipVisionEncoder<B>,
    conv: Conv2d<B>,
}

impl<B: Backend> ClipAdapter<B> {
    fn new(
        channels: usize,
        cond_dim: usize,
        encoder: ClipVisionEncoder<B>,
        device: &B::Device,
    ) -> Self {
        let width = encoder.width();
        Self {
            conv_fuse: conv2d([channels, width], 2, 1, 0, true, device),
            fc_prompt: LinearConfig::new(cond_dim, width * encoder.num_prompts()).init(device),
            encoder: encoder.no_grad(),
            conv: conv2d([width, channels], 5, 1, 2, true, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, cond: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, _] = cond.dims();
        let prompts = self.fc_prompt.forward(cond).reshape([
            batch as i32,
            self.encoder.num_prompts() as i32,
            -1,
        ]);

        let fused = self.conv_fuse.forward(x);
        let mapped = self.encoder.prompted_features(fused.clone(), prompts);
        self.conv.forward(fused + mapped.mul_scalar(0.1))
    }
}

#[derive(Config, Debug)]
pub struct GeneratorConfig {
    /// Base width; the pyramid uses `4 * ngf` and `8 * ngf` channels.
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 512)]
    pub cond_dim: usize,
    #[config(default = 32)]
    pub mid_channels: usize,
    #[config(default = 64)]
    pub upsample_features: usize,
    #[config(default = "UPSCALE")]
    pub scale: usize,
    #[config(default = "CANONICAL_SIZE")]
    pub canonical_size: usize,
}

/// Super-resolves a low-resolution image under a sentence condition.
///
/// The output is `scale` times the input's original height and width. It is not clamped;
/// use [`Generator::generate`] for evaluation output in `[-1, 1]`.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    head: Conv2d<B>,
    c1: Conv2d<B>,
    c2: Conv2d<B>,
    c3: Conv2d<B>,
    c4: Conv2d<B>,
    prelu: PRelu<B>,
    fusion: MappingBlock<B>,
    adapter: ClipAdapter<B>,
    decoder: Vec<UpBlock<B>>,
    body1: Conv2d<B>,
    body2: Conv2d<B>,
    body3: Conv2d<B>,
    before_upsample: Conv2d<B>,
    upsample: Upsample<B>,
    tail: Conv2d<B>,
    activation: LeakyRelu,
    canonical_size: usize,
    scale: usize,
}

impl GeneratorConfig {
    /// Fails when `scale` is neither a power of two nor 3.
    pub fn init<B: Backend>(
        &self,
        vision: ClipVisionEncoder<B>,
        device: &B::Device,
    ) -> error::Result<Generator<B>> {
        let shallow = self.ngf * 4;
        let deep = self.ngf * 8;
        let quarter = shallow / 4;
        let up = |fin, fout| UpBlockConfig::new(self.cond_dim, fin, fout).init(device);

        Ok(Generator {
            head: conv2d([CHANNELS, shallow], 3, 1, 1, true, device),
            c1: conv2d([CHANNELS, shallow], 3, 1, 1, true, device),
            c2: conv2d([shallow, deep], 3, 2, 1, true, device),
            c3: conv2d([deep, deep], 3, 2, 1, true, device),
            c4: conv2d([deep, deep], 3, 2, 1, true, device),
            prelu: PReluConfig::new().init(device),
            fusion: MappingBlockConfig::new(deep, self.mid_channels, deep, self.cond_dim)
                .init(device),
            adapter: ClipAdapter::new(deep, self.cond_dim, vision, device),
            decoder: vec![up(deep, deep), up(deep, deep), up(deep, deep), up(deep, shallow)],
            body1: conv2d([shallow, quarter], 3, 1, 1, true, device),
            body2: conv2d([quarter, quarter], 1, 1, 0, true, device),
            body3: conv2d([quarter, shallow], 3, 1, 1, true, device),
            before_upsample: conv2d([shallow, self.upsample_features], 3, 1, 1, true, device),
            upsample: UpsampleConfig::new(self.scale, self.upsample_features).init(device)?,
            tail: conv2d([self.upsample_features, CHANNELS], 3, 1, 1, true, device),
            activation: LeakyReluConfig::new()
                .with_negative_slope(LEAKY_SLOPE)
                .init(),
            canonical_size: self.canonical_size,
            scale: self.scale,
        })
    }
}

impl<B: Backend> Generator<B> {
    pub fn forward(&self, low_res: Tensor<B, 4>, cond: Tensor<B, 2>) -> Tensor<B, 4> {
        let [_, _, height, width] = low_res.dims();
        let x = resize(low_res, [self.canonical_size, self.canonical_size]);
        let residual = self.head.forward(x.clone());

        let r1 = self.c1.forward(x);
        let r2 = self.c2.forward(self.prelu.forward(r1.clone()));
        let r3 = self.c3.forward(self.prelu.forward(r2.clone()));
        let r4 = self.c4.forward(self.prelu.forward(r3.clone()));

        let fused = self.fusion.forward(r4.clone(), cond.clone());
        let mut out = self.adapter.forward(fused, cond.clone());

        for (block, skip) in self.decoder.iter().zip([r4, r3, r2, r1]) {
            let [_, _, h, w] = skip.dims();
            out = block.forward(out, cond.clone(), [h, w]) + skip;
        }

        let body = self.activation.forward(self.body1.forward(out));
        let body = self.activation.forward(self.body2.forward(body));
        let out = self.body3.forward(body) + residual;

        let out = leaky_relu(self.before_upsample.forward(out), 0.01);
        let out = self.tail.forward(self.upsample.forward(out));

        fit(out, [height * self.scale, width * self.scale])
    }

    /// Evaluation output, clamped to `[-1, 1]`.
    pub fn generate(&self, low_res: Tensor<B, 4>, cond: Tensor<B, 2>) -> Tensor<B, 4> {
        self.forward(low_res, cond).clamp(-1.0, 1.0)
    }

    /// Marks the embedded vision transformer as frozen again, e.g. after loading a record.
    pub fn freeze_encoder(mut self) -> Self {
        self.adapter.encoder = self.adapter.encoder.no_grad();
        self
    }
}

/// Crops to `size`, or resamples when the map is smaller than `size` along either axis.
fn fit<B: Backend>(x: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [batch, channels, h, w] = x.dims();
    if h >= size[0] && w >= size[1] {
        x.slice([0..batch, 0..channels, 0..size[0], 0..size[1]])
    } else {
        resize(x, size)
    }
}

#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    /// Channel count of the encoder feature maps.
    #[config(default = 768)]
    pub feature_channels: usize,
    #[config(default = 512)]
    pub out_channels: usize,
    /// Number of encoder feature maps consumed per image.
    #[config(default = 3)]
    pub num_features: usize,
}

/// Folds the encoder's multi-scale feature maps into a single map.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    blocks: Vec<DownBlock<B>>,
    main: DownBlock<B>,
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let fc = self.feature_channels;
        Discriminator {
            blocks: (1..self.num_features)
                .map(|_| DownBlockConfig::new(fc, fc).init(device))
                .collect(),
            main: DownBlockConfig::new(fc, self.out_channels)
                .with_encoder_feature(false)
                .init(device),
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// # Panics
    ///
    /// If `features` is empty.
    pub fn forward(&self, features: &[Tensor<B, 4>]) -> Tensor<B, 4> {
        let mut out = features[0].clone();
        for (idx, block) in self.blocks.iter().enumerate() {
            out = block.forward(out, features.get(idx + 1).cloned());
        }
        self.main.forward(out, None)
    }
}

#[derive(Config, Debug)]
pub struct CriticConfig {
    #[config(default = 512)]
    pub in_channels: usize,
    #[config(default = 512)]
    pub cond_dim: usize,
    #[config(default = 128)]
    pub hidden_channels: usize,
}

/// Scores a discriminator map against a sentence condition. Returns raw logits `[B, 1, 1, 1]`.
#[derive(Module, Debug)]
pub struct Critic<B: Backend> {
    joint1: Conv2d<B>,
    joint2: Conv2d<B>,
    activation: LeakyRelu,
}

impl CriticConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Critic<B> {
        let joint = self.in_channels + self.cond_dim;
        Critic {
            joint1: conv2d([joint, self.hidden_channels], 4, 1, 0, false, device),
            joint2: conv2d([self.hidden_channels, 1], 4, 1, 0, false, device),
            activation: LeakyReluConfig::new()
                .with_negative_slope(LEAKY_SLOPE)
                .init(),
        }
    }
}

impl<B: Backend> Critic<B> {
    pub fn forward(&self, features: Tensor<B, 4>, cond: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, _, h, w] = features.dims();
        let [_, cond_dim] = cond.dims();
        let cond = cond
            .reshape([batch, cond_dim, 1, 1])
            .repeat_dim(2, h)
            .repeat_dim(3, w);

        let x = Tensor::cat(vec![features, cond], 1);
        let x = self.activation.forward(self.joint1.forward(x));
        self.joint2.forward(x)
    }
}

/// Discriminator and critic, optimised together.
#[derive(Module, Debug)]
pub struct Adversary<B: Backend> {
    pub discriminator: Discriminator<B>,
    pub critic: Critic<B>,
}

impl<B: Backend> Adversary<B> {
    pub fn score(&self, features: &[Tensor<B, 4>], cond: Tensor<B, 2>) -> Tensor<B, 4> {
        self.critic.forward(self.discriminator.forward(features), cond)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "GeneratorConfig::new()")]
    pub generator: GeneratorConfig,
    #[config(default = "DiscriminatorConfig::new()")]
    pub discriminator: DiscriminatorConfig,
    #[config(default = "CriticConfig::new()")]
    pub critic: CriticConfig,
    #[config(default = "ClipVisionConfig::new()")]
    pub vision: ClipVisionConfig,
    #[config(default = "ClipTextConfig::new()")]
    pub text: ClipTextConfig,
}

impl ModelConfig {
    pub fn init_vision<B: Backend>(&self, device: &B::Device) -> ClipVisionEncoder<B> {
        self.vision.init(device)
    }

    pub fn init_text<B: Backend>(&self, device: &B::Device) -> ClipTextEncoder<B> {
        self.text.init(device)
    }

    pub fn init_generator<B: Backend>(
        &self,
        vision: ClipVisionEncoder<B>,
        device: &B::Device,
    ) -> error::Result<Generator<B>> {
        self.generator.init(vision, device)
    }

    pub fn init_adversary<B: Backend>(&self, device: &B::Device) -> Adversary<B> {
        Adversary {
            discriminator: self.discriminator.init(device),
            critic: self.critic.init(device),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::clip::{
        ImageEncoder,
        tests::{tiny_text, tiny_vision},
    };
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    pub(crate) fn tiny_model() -> ModelConfig {
        ModelConfig::new()
            .with_generator(
                GeneratorConfig::new()
                    .with_ngf(2)
                    .with_cond_dim(6)
                    .with_mid_channels(4)
                    .with_upsample_features(4),
            )
            .with_discriminator(
                DiscriminatorConfig::new()
                    .with_feature_channels(8)
                    .with_out_channels(16),
            )
            .with_critic(
                CriticConfig::new()
                    .with_in_channels(16)
                    .with_cond_dim(6)
                    .with_hidden_channels(4),
            )
            .with_vision(tiny_vision())
            .with_text(tiny_text())
    }

    #[test]
    fn generator_output_is_four_times_the_input() {
        let device = Default::default();
        let config = tiny_model();
        let generator = config
            .init_generator::<TestBackend>(config.init_vision(&device), &device)
            .unwrap();
        let cond = Tensor::<TestBackend, 2>::random([1, 6], Distribution::Default, &device);

        for (h, w) in [(7, 5), (16, 16), (10, 13), (64, 64), (70, 33)] {
            let low_res = Tensor::<TestBackend, 4>::random(
                [1, 3, h, w],
                Distribution::Uniform(-1.0, 1.0),
                &device,
            );
            let out = generator.forward(low_res, cond.clone());
            assert_eq!(out.dims(), [1, 3, 4 * h, 4 * w], "input {h}x{w}");
        }
    }

    #[test]
    fn generate_is_clamped() {
        let device = Default::default();
        let config = tiny_model();
        let generator = config
            .init_generator::<TestBackend>(config.init_vision(&device), &device)
            .unwrap();
        let low_res = Tensor::<TestBackend, 4>::random(
            [2, 3, 9, 9],
            Distribution::Normal(0.0, 50.0),
            &device,
        );
        let cond = Tensor::<TestBackend, 2>::random(
            [2, 6],
            Distribution::Normal(0.0, 50.0),
            &device,
        );

        let values: Vec<f32> = generator
            .generate(low_res, cond)
            .into_data()
            .to_vec()
            .unwrap();

        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn generator_rejects_unsupported_scale() {
        let device = Default::default();
        let config = tiny_model();
        let generator = config
            .generator
            .clone()
            .with_scale(5)
            .init::<TestBackend>(config.init_vision(&device), &device);

        assert!(matches!(generator, Err(Error::UnsupportedScale(5))));
    }

    #[test]
    fn critic_scores_one_logit_per_sample() {
        let device = Default::default();
        let config = tiny_model();
        let encoder = config.init_vision::<TestBackend>(&device);
        let adversary = config.init_adversary::<TestBackend>(&device);
        let image = Tensor::<TestBackend, 4>::random(
            [3, 3, 16, 16],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let cond = Tensor::<TestBackend, 2>::random([3, 6], Distribution::Default, &device);

        let features = encoder.extract_layers(image);
        let map = adversary.discriminator.forward(&features);
        let score = adversary.score(&features, cond);

        assert_eq!(map.dims(), [3, 16, 7, 7]);
        assert_eq!(score.dims(), [3, 1, 1, 1]);
    }
}
