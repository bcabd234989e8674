use std::io::Write;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::{Complex, DMatrix, DVector};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{
    architecture::Generator,
    clip::TextEncoder,
    data::{SrBatch, prepare},
};
use crate::utils::{chw_vec_to_image, psnr, save_image, tensor2img};

/// Largest tolerated imaginary part of `sqrt(sigma1 * sigma2)`.
const IMAGINARY_TOLERANCE: f64 = 1e-3;
const FRECHET_EPS: f64 = 1e-6;

pub fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    let template = "{msg} {wide_bar} {pos}/{len} [{elapsed_precise}<{eta_precise}]";
    if let Ok(style) = ProgressStyle::with_template(template) {
        bar.set_style(style);
    }
    bar
}

/// Mean PSNR of the generator over `times` passes of the batches produced by `batches`.
///
/// Each batch is compared as one tiled image.
pub fn calculate_psnr<B, T, F, I>(
    generator: &Generator<B>,
    text_encoder: &T,
    mut batches: F,
    times: usize,
    device: &B::Device,
    progress: &ProgressBar,
) -> Result<f64>
where
    B: Backend,
    T: TextEncoder<B>,
    F: FnMut() -> I,
    I: Iterator<Item = SrBatch<B>>,
{
    let mut total = 0.0;
    let mut count = 0usize;

    for _ in 0..times {
        for batch in batches() {
            let batch = prepare(batch, text_encoder, device);
            let fake = generator.forward(batch.low_res, batch.sentence_emb);

            total += psnr(&tensor2img(fake, (-1.0, 1.0))?, &tensor2img(batch.real, (-1.0, 1.0))?)?;
            count += 1;
            progress.inc(1);
        }
    }

    if count == 0 {
        warn!("no batches to evaluate");
        return Ok(f64::NAN);
    }
    Ok(total / count as f64)
}

/// Mean vector and unbiased covariance of a `[samples, features]` matrix.
pub fn feature_statistics<B: Backend>(
    features: Tensor<B, 2>,
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    let [n, d] = features.dims();
    let values = features
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| Error::TensorData(format!("{e:?}")))?;
    let x = DMatrix::from_row_slice(n, d, &values);

    let mean = x.row_mean().transpose();
    let centered = DMatrix::from_fn(n, d, |i, j| x[(i, j)] - mean[j]);
    let cov = centered.transpose() * &centered / (n.saturating_sub(1).max(1) as f64);
    Ok((mean, cov))
}

/// Squared Fréchet distance between two Gaussians:
/// `|mu1 - mu2|^2 + tr(sigma1 + sigma2 - 2 sqrt(sigma1 sigma2))`.
pub fn frechet_distance(
    mu1: &DVector<f64>,
    sigma1: &DMatrix<f64>,
    mu2: &DVector<f64>,
    sigma2: &DMatrix<f64>,
) -> Result<f64> {
    if mu1.len() != mu2.len() {
        return Err(Error::ShapeMismatch {
            left: vec![mu1.len()],
            right: vec![mu2.len()],
        });
    }
    if sigma1.shape() != sigma2.shape() || sigma1.nrows() != mu1.len() {
        return Err(Error::ShapeMismatch {
            left: vec![sigma1.nrows(), sigma1.ncols()],
            right: vec![sigma2.nrows(), sigma2.ncols()],
        });
    }

    let (trace_covmean, imaginary) = match trace_sqrt_product(sigma1, sigma2) {
        Some(result) => result,
        None => {
            warn!(eps = FRECHET_EPS, "singular product of covariances, adding eps to the diagonal");
            let offset = DMatrix::<f64>::identity(sigma1.nrows(), sigma1.ncols()) * FRECHET_EPS;
            trace_sqrt_product(&(sigma1 + &offset), &(sigma2 + &offset))
                .ok_or(Error::NonFiniteDistance)?
        }
    };
    if imaginary > IMAGINARY_TOLERANCE {
        return Err(Error::ImaginaryComponent(imaginary));
    }

    let diff = mu1 - mu2;
    Ok(diff.dot(&diff) + sigma1.trace() + sigma2.trace() - 2.0 * trace_covmean)
}

/// Trace of the principal `sqrt(a b)`, together with the largest imaginary part of its
/// eigenvalues. `None` when the product or its spectrum is not finite.
///
/// `a b` and `b a` share their spectrum, so the result does not depend on argument order.
fn trace_sqrt_product(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<(f64, f64)> {
    let product = a * b;
    if !product.iter().all(|v| v.is_finite()) {
        return None;
    }

    let roots: Vec<Complex<f64>> = product
        .complex_eigenvalues()
        .iter()
        .map(|l| l.sqrt())
        .collect();
    if !roots.iter().all(|r| r.re.is_finite() && r.im.is_finite()) {
        return None;
    }

    let trace = roots.iter().map(|r| r.re).sum();
    let imaginary = roots.iter().map(|r| r.im.abs()).fold(0.0, f64::max);
    Some((trace, imaginary))
}

/// Output layout of [`sample`]. Distributed runs get one subdirectory per rank.
fn sample_dirs(save_dir: &Path, rank: Option<usize>) -> [PathBuf; 3] {
    let with_rank = |dir: PathBuf| match rank {
        Some(rank) => dir.join(format!("gpu{rank}")),
        None => dir,
    };
    [
        with_rank(save_dir.join("batch")).join("imgs"),
        with_rank(save_dir.join("batch")).join("txts"),
        with_rank(save_dir.join("single")),
    ]
}

/// Generates every batch and writes a preview grid, the captions and each single image.
///
/// `rank` is `Some` in distributed runs.
pub fn sample<B, T, I>(
    batches: I,
    generator: &Generator<B>,
    text_encoder: &T,
    save_dir: &Path,
    device: &B::Device,
    rank: Option<usize>,
    is_primary: bool,
) -> Result<()>
where
    B: Backend,
    T: TextEncoder<B>,
    I: IntoIterator<Item = SrBatch<B>>,
{
    let [imgs_dir, txts_dir, single_dir] = sample_dirs(save_dir, rank);
    std::fs::create_dir_all(&imgs_dir)?;
    std::fs::create_dir_all(&txts_dir)?;

    for (step, batch) in batches.into_iter().enumerate() {
        let batch = prepare(batch, text_encoder, device);
        let fake = generator.generate(batch.low_res, batch.sentence_emb);
        let [batch_size, _, height, width] = fake.dims();

        save_image(fake.clone(), imgs_dir.join(format!("step_{step:04}.png")), 8)?;
        let mut txt = std::fs::File::create(txts_dir.join(format!("step_{step:04}.txt")))?;
        for caption in &batch.captions {
            writeln!(txt, "{caption}")?;
        }

        let step_dir = single_dir.join(format!("step{step:04}"));
        std::fs::create_dir_all(&step_dir)?;
        let values = fake
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::TensorData(format!("{e:?}")))?;
        let image_len = values.len() / batch_size.max(1);
        for (j, chunk) in values.chunks(image_len.max(1)).enumerate() {
            if let Some(image) = chw_vec_to_image(chunk, height, width) {
                image.save(step_dir.join(format!("batch_{j:04}.png")))?;
            }
        }

        if is_primary {
            info!(step, "sampled batch");
        }
    }
    Ok(())
}

/// Writes `samples_epoch_{epoch:03}.png` for a fixed batch. Only the primary process writes.
pub fn sample_one_batch<B: Backend>(
    low_res: Tensor<B, 4>,
    sentence: Tensor<B, 2>,
    generator: &Generator<B>,
    epoch: usize,
    save_dir: &Path,
    is_primary: bool,
) -> Result<()> {
    if !is_primary {
        return Ok(());
    }

    let [batch, c, h, w] = low_res.dims();
    let [_, dim] = sentence.dims();
    let half = batch / 2;
    let results = if half == 0 {
        generator.generate(low_res, sentence)
    } else {
        let first = generator.generate(
            low_res.clone().slice([0..half, 0..c, 0..h, 0..w]),
            sentence.clone().slice([0..half, 0..dim]),
        );
        let second = generator.generate(
            low_res.slice([half..batch, 0..c, 0..h, 0..w]),
            sentence.slice([half..batch, 0..dim]),
        );
        Tensor::cat(vec![first, second], 0)
    };

    std::fs::create_dir_all(save_dir)?;
    save_image(results, save_dir.join(format!("samples_epoch_{epoch:03}.png")), 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::tests::tiny_model;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn batch(device: &<TestBackend as Backend>::Device) -> SrBatch<TestBackend> {
        SrBatch {
            real: Tensor::random([2, 3, 16, 16], Distribution::Uniform(-1.0, 1.0), device),
            low_res: Tensor::random([2, 3, 4, 4], Distribution::Uniform(-1.0, 1.0), device),
            tokens: Tensor::from_ints(
                [[30, 2, 4, 31, 0, 0, 0, 0], [30, 6, 7, 31, 0, 0, 0, 0]],
                device,
            ),
            captions: vec!["a bird".to_string(), "red wings".to_string()],
            keys: vec!["a".to_string(), "b".to_string()],
        }
    }

    #[test]
    fn frechet_distance_to_itself_is_zero() {
        let mu = DVector::from_vec(vec![0.5, -1.0]);
        let sigma = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);

        let distance = frechet_distance(&mu, &sigma, &mu, &sigma).unwrap();

        assert_relative_eq!(distance, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn frechet_distance_of_univariate_gaussians() {
        let distance = frechet_distance(
            &DVector::from_vec(vec![0.0]),
            &DMatrix::from_element(1, 1, 1.0),
            &DVector::from_vec(vec![1.0]),
            &DMatrix::from_element(1, 1, 4.0),
        )
        .unwrap();

        // 1 + 1 + 4 - 2 * sqrt(4)
        assert_relative_eq!(distance, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn frechet_distance_rejects_imaginary_square_root() {
        let mu = DVector::from_vec(vec![0.0, 0.0]);
        let identity = DMatrix::<f64>::identity(2, 2);
        let indefinite = DMatrix::from_row_slice(2, 2, &[-1.0, 0.0, 0.0, 1.0]);

        for result in [
            frechet_distance(&mu, &identity, &mu, &indefinite),
            frechet_distance(&mu, &indefinite, &mu, &identity),
        ] {
            assert!(matches!(result, Err(Error::ImaginaryComponent(v)) if (v - 1.0).abs() < 1e-9));
        }
    }

    #[test]
    fn frechet_distance_is_symmetric() {
        let mu1 = DVector::from_vec(vec![0.0, 1.0]);
        let mu2 = DVector::from_vec(vec![1.0, -1.0]);
        let sigma1 = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        let sigma2 = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 3.0]);

        let forward = frechet_distance(&mu1, &sigma1, &mu2, &sigma2).unwrap();
        let backward = frechet_distance(&mu2, &sigma2, &mu1, &sigma1).unwrap();

        assert_relative_eq!(forward, backward, epsilon = 1e-9);
        assert!(forward > 0.0);
    }

    #[test]
    fn frechet_distance_rejects_non_finite_covariance() {
        let mu = DVector::from_vec(vec![0.0]);
        let sigma = DMatrix::from_element(1, 1, f64::INFINITY);

        let result = frechet_distance(&mu, &sigma, &mu, &sigma);

        assert!(matches!(result, Err(Error::NonFiniteDistance)));
    }

    #[test]
    fn frechet_distance_checks_shapes() {
        let result = frechet_distance(
            &DVector::zeros(2),
            &DMatrix::identity(2, 2),
            &DVector::zeros(3),
            &DMatrix::identity(3, 3),
        );
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn feature_statistics_are_unbiased() {
        let device = Default::default();
        let features = Tensor::<TestBackend, 2>::from_floats(
            [[1.0, 2.0], [3.0, 4.0], [5.0, 9.0]],
            &device,
        );

        let (mean, cov) = feature_statistics(features).unwrap();

        assert_eq!(mean.as_slice(), &[3.0, 5.0]);
        assert_relative_eq!(cov[(0, 0)], 4.0);
        assert_relative_eq!(cov[(0, 1)], 7.0);
        assert_relative_eq!(cov[(1, 0)], 7.0);
        assert_relative_eq!(cov[(1, 1)], 13.0);
    }

    #[test]
    fn psnr_is_averaged_over_batches_and_repeats() {
        let device = Default::default();
        let config = tiny_model();
        let generator = config
            .init_generator::<TestBackend>(config.init_vision(&device), &device)
            .unwrap();
        let text = config.init_text::<TestBackend>(&device);
        let fixed = batch(&device);
        let bar = ProgressBar::hidden();

        let value = calculate_psnr(
            &generator,
            &text,
            || vec![fixed.clone(), fixed.clone()].into_iter(),
            2,
            &device,
            &bar,
        )
        .unwrap();

        assert!(value.is_finite() && value > 0.0);
        assert_eq!(bar.position(), 4);
    }

    #[test]
    fn sample_writes_grids_captions_and_single_images() {
        let device = Default::default();
        let config = tiny_model();
        let generator = config
            .init_generator::<TestBackend>(config.init_vision(&device), &device)
            .unwrap();
        let text = config.init_text::<TestBackend>(&device);
        let dir = tempfile::tempdir().unwrap();

        sample(
            vec![batch(&device)],
            &generator,
            &text,
            dir.path(),
            &device,
            Some(1),
            false,
        ).unwrap();

        let root = dir.path();
        assert!(root.join("batch/gpu1/imgs/step_0000.png").is_file());
        let captions = std::fs::read_to_string(root.join("batch/gpu1/txts/step_0000.txt")).unwrap();
        assert_eq!(captions, "a bird\nred wings\n");
        let single = image::open(root.join("single/gpu1/step0000/batch_0001.png")).unwrap();
        assert_eq!((single.width(), single.height()), (16, 16));
    }

    #[test]
    fn sample_one_batch_only_writes_on_primary() {
        let device = Default::default();
        let config = tiny_model();
        let generator = config
            .init_generator::<TestBackend>(config.init_vision(&device), &device)
            .unwrap();
        let fixed = batch(&device);
        let sentence = Tensor::<TestBackend, 2>::random([2, 6], Distribution::Default, &device);
        let dir = tempfile::tempdir().unwrap();

        sample_one_batch(
            fixed.low_res.clone(),
            sentence.clone(),
            &generator,
            4,
            dir.path(),
            false,
        ).unwrap();
        assert!(!dir.path().join("samples_epoch_004.png").exists());

        sample_one_batch(fixed.low_res, sentence, &generator, 4, dir.path(), true).unwrap();
        assert!(dir.path().join("samples_epoch_004.png").is_file());
    }
}
