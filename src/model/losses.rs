use burn::{prelude::*, tensor::activation::relu, tensor::backend::AutodiffBackend};

use crate::model::{
    architecture::Adversary,
    constants::{GP_POWER, GP_WEIGHT},
    precision::GradScaling,
};

/// Which side of the hinge a critic score is pushed towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Real,
    Fake,
}

/// `mean(relu(1 - score))` for real pairs, `mean(relu(1 + score))` for fake or mismatched ones.
pub fn hinge_loss<B: Backend, const D: usize>(score: Tensor<B, D>, target: Target) -> Tensor<B, 1> {
    match target {
        Target::Real => relu(score.neg().add_scalar(1.0)).mean(),
        Target::Fake => relu(score.add_scalar(1.0)).mean(),
    }
}

/// Scores `features` against `cond` and returns the raw score with its hinge loss.
pub fn predict_loss<B: Backend>(
    adversary: &Adversary<B>,
    features: &[Tensor<B, 4>],
    cond: Tensor<B, 2>,
    target: Target,
) -> (Tensor<B, 4>, Tensor<B, 1>) {
    let score = adversary.score(features, cond);
    let loss = hinge_loss(score.clone(), target);
    (score, loss)
}

/// Pairs each sample with the next sentence in the batch, wrapping the last to the first.
pub fn cyclic_shift<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, dim] = x.dims();
    if batch < 2 {
        return x.detach();
    }
    let head = x.clone().slice([1..batch, 0..dim]);
    let tail = x.slice([0..1, 0..dim]);
    Tensor::cat(vec![head, tail], 0).detach()
}

/// Row-wise cosine similarity, `[B, D] x [B, D] -> [B]`.
pub fn cosine_similarity<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 1> {
    let dot = (a.clone() * b.clone()).sum_dim(1);
    let norm_a = a.powf_scalar(2.0).sum_dim(1).sqrt();
    let norm_b = b.powf_scalar(2.0).sum_dim(1).sqrt();
    (dot / (norm_a * norm_b).clamp_min(1e-8)).squeeze(1)
}

pub fn l1_loss<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    (a - b).abs().mean()
}

#[derive(Config, Debug)]
pub struct GradientPenaltyConfig {
    #[config(default = "GP_WEIGHT")]
    pub weight: f64,
    #[config(default = "GP_POWER")]
    pub power: f64,
    /// Step of the central difference used for the parameter gradient.
    #[config(default = 1e-3)]
    pub fd_step: f64,
}

/// Matching-aware gradient penalty on the real branch:
/// `weight * mean(||[d score / d features, d score / d sentence]||^power)`.
///
/// Input gradients are taken on the scaled score and unscaled before the norm. The returned
/// tensor carries the exact penalty value. Its gradient with respect to the adversary
/// parameters is the Hessian-vector product along the input-gradient direction, estimated by a
/// central difference of the score.
pub fn gradient_penalty<B, S>(
    config: &GradientPenaltyConfig,
    adversary: &Adversary<B>,
    features: &[Tensor<B, 4>],
    sentence: Tensor<B, 2>,
    scaler: &S,
) -> Tensor<B, 1>
where
    B: AutodiffBackend,
    S: GradScaling,
{
    let device = sentence.device();
    let [batch, sent_dim] = sentence.dims();

    let features: Vec<Tensor<B, 4>> = features
        .iter()
        .map(|f| f.clone().detach().require_grad())
        .collect();
    let sentence = sentence.detach().require_grad();

    let score = adversary.score(&features, sentence.clone());
    let grads = scaler.scale(score.sum()).backward();

    let mut flat = Vec::with_capacity(features.len() + 1);
    for feature in &features {
        let grad = feature
            .grad(&grads)
            .map(|g| scaler.unscale(g))
            .unwrap_or_else(|| feature.clone().inner().zeros_like());
        flat.push(grad.reshape([batch as i32, -1]));
    }
    let sent_grad = sentence
        .grad(&grads)
        .map(|g| scaler.unscale(g))
        .unwrap_or_else(|| sentence.clone().inner().zeros_like());
    flat.push(sent_grad);

    let grad = Tensor::cat(flat, 1);
    let norm = grad.clone().powf_scalar(2.0).sum_dim(1).sqrt();
    let value = norm.clone().powf_scalar(config.power).mean().mul_scalar(config.weight);

    // Unit direction of the input gradient, split back per input.
    let direction = grad / norm.clone().clamp_min(1e-12);
    let mut offset = 0;
    let mut plus = Vec::with_capacity(features.len());
    let mut minus = Vec::with_capacity(features.len());
    for feature in &features {
        let dims = feature.dims();
        let len = dims[1] * dims[2] * dims[3];
        let step = Tensor::<B, 2>::from_inner(
            direction
                .clone()
                .slice([0..batch, offset..offset + len])
                .mul_scalar(config.fd_step),
        )
        .reshape(dims);
        offset += len;
        let base = feature.clone().detach();
        plus.push(base.clone() + step.clone());
        minus.push(base - step);
    }
    let sent_step = Tensor::<B, 2>::from_inner(
        direction
            .slice([0..batch, offset..offset + sent_dim])
            .mul_scalar(config.fd_step),
    );
    let sentence = sentence.detach();

    let directional = (adversary.score(&plus, sentence.clone() + sent_step.clone())
        - adversary.score(&minus, sentence - sent_step))
    .reshape([batch, 1])
        / (2.0 * config.fd_step);

    let coef = Tensor::<B, 2>::from_inner(
        norm.powf_scalar(config.power - 1.0)
            .mul_scalar(config.weight * config.power / batch as f64),
    );
    let surrogate = (directional * coef).sum();

    Tensor::<B, 1>::from_inner(value).to_device(&device) + surrogate.clone() - surrogate.detach()
}
