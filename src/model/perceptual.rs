use burn::{
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    tensor::activation::relu,
};

use crate::model::constants::{IMAGENET_MEAN, IMAGENET_STD};

/// Differentiable feature-space distance between a generated image and its target.
pub trait PerceptualDistance<B: Backend> {
    fn distance(&self, generated: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1>;
}

#[derive(Config, Debug)]
pub struct VggPerceptualConfig {
    /// Output channels of the five VGG16 blocks.
    #[config(default = "vec![64, 128, 256, 512, 512]")]
    pub channels: Vec<usize>,
}

/// Frozen VGG16 feature extractor. The distance is the mean squared error between the
/// rectified outputs of each block, averaged over blocks.
#[derive(Module, Debug)]
pub struct VggPerceptual<B: Backend> {
    blocks: Vec<Vec<Conv2d<B>>>,
    pool: MaxPool2d,
}

impl VggPerceptualConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> VggPerceptual<B> {
        let conv = |fin, fout| {
            Conv2dConfig::new([fin, fout], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };

        let mut fin = 3;
        let blocks = self
            .channels
            .iter()
            .zip([2, 2, 3, 3, 3])
            .map(|(&fout, depth)| {
                let block = (0..depth)
                    .map(|i| conv(if i == 0 { fin } else { fout }, fout))
                    .collect();
                fin = fout;
                block
            })
            .collect();

        VggPerceptual {
            blocks,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
        .no_grad()
    }
}

impl<B: Backend> VggPerceptual<B> {
    pub fn features(&self, image: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let device = image.device();
        let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device).reshape([1, 3, 1, 1]);
        let mut x = ((image + 1.0) * 0.5 - mean) / std;

        let mut features = Vec::with_capacity(self.blocks.len());
        for (idx, block) in self.blocks.iter().enumerate() {
            if idx > 0 {
                x = self.pool.forward(x);
            }
            for conv in block {
                x = relu(conv.forward(x));
            }
            features.push(x.clone());
        }
        features
    }
}

impl<B: Backend> PerceptualDistance<B> for VggPerceptual<B> {
    fn distance(&self, generated: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        let device = generated.device();
        let generated = self.features(generated);
        let target = self.features(target.detach());
        let layers = generated.len().max(1) as f64;

        generated
            .into_iter()
            .zip(target)
            .fold(Tensor::zeros([1], &device), |total, (g, t)| {
                total + (g - t).powf_scalar(2.0).mean()
            })
            .div_scalar(layers)
    }
}
