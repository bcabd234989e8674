//! Frozen vision-language encoder.
//!
//! The pretrained weights are loaded from a record file and never updated: both encoders are
//! built with [`Module::no_grad`] and the training loop only ever reads their activations.
//! The core depends on them through [`ImageEncoder`] and [`TextEncoder`].

use burn::{
    module::Param,
    nn::{
        Embedding, EmbeddingConfig, Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig,
        attention::{
            MhaInput, MultiHeadAttention, MultiHeadAttentionConfig, generate_autoregressive_mask,
        },
        conv::Conv2d,
    },
    prelude::*,
    tensor::activation::sigmoid,
};

use crate::model::blocks::{conv2d, resize};
use crate::model::constants::{CLIP_MEAN, CLIP_STD};

/// Image side of the frozen encoder.
pub trait ImageEncoder<B: Backend> {
    /// Ordered intermediate feature maps `[B, width, grid, grid]`, one per tapped layer.
    fn extract_layers(&self, image: Tensor<B, 4>) -> Vec<Tensor<B, 4>>;

    /// Tapped feature maps plus the pooled, projected image embedding `[B, embed]`.
    fn encode_image(&self, image: Tensor<B, 4>) -> (Vec<Tensor<B, 4>>, Tensor<B, 2>);
}

/// Text side of the frozen encoder.
pub trait TextEncoder<B: Backend> {
    /// Sentence embedding `[B, embed]` and per-token embeddings `[B, seq, width]`.
    fn encode_text(&self, tokens: Tensor<B, 2, Int>) -> (Tensor<B, 2>, Tensor<B, 3>);
}

fn quick_gelu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * sigmoid(x.mul_scalar(1.702))
}

#[derive(Module, Debug)]
pub struct ResidualAttentionBlock<B: Backend> {
    ln_1: LayerNorm<B>,
    attn: MultiHeadAttention<B>,
    ln_2: LayerNorm<B>,
    c_fc: Linear<B>,
    c_proj: Linear<B>,
}

impl<B: Backend> ResidualAttentionBlock<B> {
    fn new(width: usize, heads: usize, device: &B::Device) -> Self {
        Self {
            ln_1: LayerNormConfig::new(width).init(device),
            attn: MultiHeadAttentionConfig::new(width, heads)
                .with_dropout(0.0)
                .init(device),
            ln_2: LayerNormConfig::new(width).init(device),
            c_fc: LinearConfig::new(width, width * 4).init(device),
            c_proj: LinearConfig::new(width * 4, width).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 3, Bool>>) -> Tensor<B, 3> {
        let input = MhaInput::self_attn(self.ln_1.forward(x.clone()));
        let input = match mask {
            Some(mask) => input.mask_attn(mask),
            None => input,
        };
        let x = x + self.attn.forward(input).context;

        let h = self.c_fc.forward(self.ln_2.forward(x.clone()));
        x + self.c_proj.forward(quick_gelu(h))
    }
}

#[derive(Config, Debug)]
pub struct ClipVisionConfig {
    #[config(default = 224)]
    pub image_size: usize,
    #[config(default = 32)]
    pub patch_size: usize,
    #[config(default = 768)]
    pub width: usize,
    #[config(default = 12)]
    pub layers: usize,
    #[config(default = 12)]
    pub heads: usize,
    #[config(default = 512)]
    pub embed_dim: usize,
    /// Blocks whose outputs are tapped as multi-scale features.
    #[config(default = "vec![1, 4, 8]")]
    pub feature_layers: Vec<usize>,
    /// Blocks that receive a condition prompt token in [`ClipVisionEncoder::prompted_features`].
    #[config(default = "vec![1, 2, 3, 4, 5, 6, 7, 8]")]
    pub prompt_layers: Vec<usize>,
}

impl ClipVisionConfig {
    pub fn grid(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ClipVisionEncoder<B> {
        let grid = self.grid();
        let scale = 1.0 / (self.width as f64).sqrt();
        let normal = Initializer::Normal { mean: 0.0, std: scale };

        ClipVisionEncoder {
            conv1: conv2d(
                [3, self.width],
                self.patch_size,
                self.patch_size,
                0,
                false,
                device,
            ),
            class_embedding: normal.init([self.width], device),
            positional_embedding: normal.init([grid * grid + 1, self.width], device),
            ln_pre: LayerNormConfig::new(self.width).init(device),
            blocks: (0..self.layers)
                .map(|_| ResidualAttentionBlock::new(self.width, self.heads, device))
                .collect(),
            ln_post: LayerNormConfig::new(self.width).init(device),
            proj: normal.init([self.width, self.embed_dim], device),
            image_size: self.image_size,
            feature_layers: self.feature_layers.clone(),
            prompt_layers: self.prompt_layers.clone(),
        }
        .no_grad()
    }
}

#[derive(Module, Debug)]
pub struct ClipVisionEncoder<B: Backend> {
    conv1: Conv2d<B>,
    class_embedding: Param<Tensor<B, 1>>,
    positional_embedding: Param<Tensor<B, 2>>,
    ln_pre: LayerNorm<B>,
    blocks: Vec<ResidualAttentionBlock<B>>,
    ln_post: LayerNorm<B>,
    proj: Param<Tensor<B, 2>>,
    image_size: usize,
    feature_layers: Vec<usize>,
    prompt_layers: Vec<usize>,
}

impl<B: Backend> ClipVisionEncoder<B> {
    /// Maps a `[-1, 1]` image to the encoder's normalised input resolution.
    fn preprocess(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let device = image.device();
        let mean = Tensor::<B, 1>::from_floats(CLIP_MEAN, &device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(CLIP_STD, &device).reshape([1, 3, 1, 1]);

        let image = resize(image * 0.5 + 0.5, [self.image_size, self.image_size]);
        (image - mean) / std
    }

    /// `[B, width, g, g]` patch map to `[B, g*g + 1, width]` tokens with the class token first.
    fn tokens(&self, map: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, width, gh, gw] = map.dims();
        let patches = map.reshape([batch, width, gh * gw]).swap_dims(1, 2);
        let class = self
            .class_embedding
            .val()
            .reshape([1, 1, width])
            .repeat_dim(0, batch);

        let x = Tensor::cat(vec![class, patches], 1) + self.positional_embedding.val().unsqueeze();
        self.ln_pre.forward(x)
    }

    fn patch_map(tokens: Tensor<B, 3>, grid: [usize; 2]) -> Tensor<B, 4> {
        let [batch, seq, width] = tokens.dims();
        tokens
            .slice([0..batch, 1..seq, 0..width])
            .swap_dims(1, 2)
            .reshape([batch, width, grid[0], grid[1]])
    }

    /// Runs the first `depth` blocks, returning the tapped maps and the final token sequence.
    fn run(&self, image: Tensor<B, 4>, depth: usize) -> (Vec<Tensor<B, 4>>, Tensor<B, 3>) {
        let map = self.conv1.forward(self.preprocess(image));
        let [_, _, gh, gw] = map.dims();

        let mut x = self.tokens(map);
        let mut features = Vec::with_capacity(self.feature_layers.len());
        for (i, block) in self.blocks.iter().enumerate().take(depth) {
            x = block.forward(x, None);
            if self.feature_layers.contains(&i) {
                features.push(Self::patch_map(x.clone(), [gh, gw]));
            }
        }
        (features, x)
    }

    /// Runs an already patch-embedded map through the transformer. Every block listed in
    /// `prompt_layers` sees one extra prompt token appended to its sequence, stripped again
    /// before the next block.
    ///
    /// `prompts` is `[B, prompt_layers.len(), width]`.
    pub fn prompted_features(&self, map: Tensor<B, 4>, prompts: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch, _, gh, gw] = map.dims();
        let width = prompts.dims()[2];

        let mut x = self.tokens(map);
        let mut prompt_idx = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            if self.prompt_layers.contains(&i) {
                let prompt = prompts
                    .clone()
                    .slice([0..batch, prompt_idx..prompt_idx + 1, 0..width]);
                prompt_idx += 1;

                let seq = x.dims()[1];
                x = block
                    .forward(Tensor::cat(vec![x, prompt], 1), None)
                    .slice([0..batch, 0..seq, 0..width]);
            } else {
                x = block.forward(x, None);
            }
        }
        Self::patch_map(x, [gh, gw])
    }

    pub fn width(&self) -> usize {
        self.class_embedding.val().dims()[0]
    }

    pub fn num_prompts(&self) -> usize {
        self.prompt_layers.len()
    }
}

impl<B: Backend> ImageEncoder<B> for ClipVisionEncoder<B> {
    fn extract_layers(&self, image: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let depth = self.feature_layers.iter().max().map_or(0, |l| l + 1);
        self.run(image, depth).0
    }

    fn encode_image(&self, image: Tensor<B, 4>) -> (Vec<Tensor<B, 4>>, Tensor<B, 2>) {
        let (features, x) = self.run(image, self.blocks.len());
        let [batch, _, width] = x.dims();
        let class = x.slice([0..batch, 0..1, 0..width]).reshape([batch, width]);
        let embedding = self.ln_post.forward(class).matmul(self.proj.val());
        (features, embedding)
    }
}

#[derive(Config, Debug)]
pub struct ClipTextConfig {
    #[config(default = 49408)]
    pub vocab_size: usize,
    #[config(default = 77)]
    pub context_length: usize,
    #[config(default = 512)]
    pub width: usize,
    #[config(default = 12)]
    pub layers: usize,
    #[config(default = 8)]
    pub heads: usize,
    #[config(default = 512)]
    pub embed_dim: usize,
}

impl ClipTextConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClipTextEncoder<B> {
        ClipTextEncoder {
            token_embedding: EmbeddingConfig::new(self.vocab_size, self.width).init(device),
            positional_embedding: Initializer::Normal { mean: 0.0, std: 0.01 }
                .init([self.context_length, self.width], device),
            blocks: (0..self.layers)
                .map(|_| ResidualAttentionBlock::new(self.width, self.heads, device))
                .collect(),
            ln_final: LayerNormConfig::new(self.width).init(device),
            text_projection: Initializer::Normal {
                mean: 0.0,
                std: 1.0 / (self.width as f64).sqrt(),
            }
            .init([self.width, self.embed_dim], device),
        }
        .no_grad()
    }
}

#[derive(Module, Debug)]
pub struct ClipTextEncoder<B: Backend> {
    token_embedding: Embedding<B>,
    positional_embedding: Param<Tensor<B, 2>>,
    blocks: Vec<ResidualAttentionBlock<B>>,
    ln_final: LayerNorm<B>,
    text_projection: Param<Tensor<B, 2>>,
}

impl<B: Backend> TextEncoder<B> for ClipTextEncoder<B> {
    fn encode_text(&self, tokens: Tensor<B, 2, Int>) -> (Tensor<B, 2>, Tensor<B, 3>) {
        let [batch, seq] = tokens.dims();
        let device = tokens.device();
        let [_, width] = self.positional_embedding.val().dims();

        let positions = self
            .positional_embedding
            .val()
            .slice([0..seq, 0..width])
            .unsqueeze();
        let mut x = self.token_embedding.forward(tokens.clone()) + positions;

        let mask = generate_autoregressive_mask::<B>(batch, seq, &device);
        for block in &self.blocks {
            x = block.forward(x, Some(mask.clone()));
        }
        let words = self.ln_final.forward(x);

        // the end-of-text token carries the highest id in the vocabulary
        let eot = tokens.argmax(1).reshape([batch, 1, 1]).repeat_dim(2, width);
        let sentence = words
            .clone()
            .gather(1, eot)
            .reshape([batch, width])
            .matmul(self.text_projection.val());

        (sentence, words)
    }
}
