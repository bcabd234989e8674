pub mod checkpoint;
pub mod distributed;
pub mod sink;

use std::path::Path;

use burn::prelude::*;
use image::{DynamicImage, GrayImage, ImageBuffer, Rgb, RgbImage};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::constants::CHANNELS;

/// Grid layout used when a batch is tiled into one image.
#[derive(Debug, Clone, Copy)]
pub struct GridOptions {
    pub nrow: usize,
    pub padding: usize,
    pub pad_value: f32,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            nrow: 8,
            padding: 2,
            pad_value: 0.0,
        }
    }
}

/// Converts a float tensor to an 8-bit image.
///
/// Size-1 dimensions are squeezed, values are clamped to `min_max` and rescaled to `[0, 1]`.
/// A remaining 4D batch is tiled with `floor(sqrt(n))` images per row, a 3D tensor is read as
/// CHW and a 2D tensor as a grayscale image.
pub fn tensor2img<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    min_max: (f32, f32),
) -> Result<DynamicImage> {
    let data = tensor.into_data().convert::<f32>();
    let shape: Vec<usize> = data.shape.iter().copied().filter(|&d| d != 1).collect();
    let values = data.to_vec::<f32>().map_err(|e| Error::TensorData(format!("{e:?}")))?;

    let (lo, hi) = min_max;
    let values: Vec<f32> = values
        .into_iter()
        .map(|v| (v.clamp(lo, hi) - lo) / (hi - lo))
        .collect();

    match shape.len() {
        4 => {
            let n = shape[0];
            let nrow = ((n as f64).sqrt().floor() as usize).max(1);
            let options = GridOptions {
                nrow,
                ..Default::default()
            };
            let (grid, [h, w]) = grid(&values, [shape[0], shape[1], shape[2], shape[3]], options)?;
            Ok(DynamicImage::ImageRgb8(to_rgb8(&grid, h, w)?))
        }
        3 => {
            let [c, h, w] = [shape[0], shape[1], shape[2]];
            let rgb = to_three_channels(&values, c, h * w)?;
            Ok(DynamicImage::ImageRgb8(to_rgb8(&rgb, h, w)?))
        }
        2 => {
            let [h, w] = [shape[0], shape[1]];
            let pixels = values.iter().map(|&v| quantize(v)).collect();
            let image = GrayImage::from_raw(w as u32, h as u32, pixels).ok_or(Error::ShapeMismatch {
                left: vec![h, w],
                right: vec![values.len()],
            })?;
            Ok(DynamicImage::ImageLuma8(image))
        }
        rank => Err(Error::UnsupportedRank(rank)),
    }
}

fn quantize(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

fn to_three_channels(planar: &[f32], channels: usize, plane: usize) -> Result<Vec<f32>> {
    match channels {
        CHANNELS => Ok(planar.to_vec()),
        1 => Ok(planar.repeat(CHANNELS)),
        other => Err(Error::UnsupportedChannels(other)),
    }
    .and_then(|values| {
        if values.len() == CHANNELS * plane {
            Ok(values)
        } else {
            Err(Error::ShapeMismatch {
                left: vec![CHANNELS, plane],
                right: vec![values.len()],
            })
        }
    })
}

/// Planar RGB `[3, h, w]` in `[0, 1]` to an interleaved 8-bit image.
fn to_rgb8(planar: &[f32], h: usize, w: usize) -> Result<RgbImage> {
    let plane = h * w;
    let mut raw = Vec::with_capacity(CHANNELS * plane);
    for i in 0..plane {
        for c in 0..CHANNELS {
            raw.push(quantize(planar[c * plane + i]));
        }
    }
    ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(w as u32, h as u32, raw).ok_or(Error::ShapeMismatch {
        left: vec![CHANNELS, h, w],
        right: vec![planar.len()],
    })
}

/// Tiles a planar `[n, c, h, w]` batch into one planar `[3, H, W]` canvas.
fn grid(
    values: &[f32],
    [n, c, h, w]: [usize; 4],
    options: GridOptions,
) -> Result<(Vec<f32>, [usize; 2])> {
    let GridOptions {
        nrow,
        padding,
        pad_value,
    } = options;
    let cols = nrow.min(n).max(1);
    let rows = n.div_ceil(cols);
    let (cell_h, cell_w) = (h + padding, w + padding);
    let (height, width) = (rows * cell_h + padding, cols * cell_w + padding);

    let mut canvas = vec![pad_value; CHANNELS * height * width];
    let image_len = c * h * w;
    for k in 0..n {
        let image = to_three_channels(&values[k * image_len..(k + 1) * image_len], c, h * w)?;
        let (top, left) = ((k / cols) * cell_h + padding, (k % cols) * cell_w + padding);
        for ch in 0..CHANNELS {
            for y in 0..h {
                let src = ch * h * w + y * w;
                let dst = ch * height * width + (top + y) * width + left;
                canvas[dst..dst + w].copy_from_slice(&image[src..src + w]);
            }
        }
    }
    Ok((canvas, [height, width]))
}

/// Tiles a `[-1, 1]` batch into a grid with `nrow` images per row and writes it to `path`.
pub fn save_image<B: Backend>(
    batch: Tensor<B, 4>,
    path: impl AsRef<Path>,
    nrow: usize,
) -> Result<()> {
    let [n, c, h, w] = batch.dims();
    let values: Vec<f32> = batch
        .clamp(-1.0, 1.0)
        .add_scalar(1.0)
        .div_scalar(2.0)
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| Error::TensorData(format!("{e:?}")))?;

    let options = GridOptions {
        nrow,
        ..Default::default()
    };
    let (canvas, [height, width]) = grid(&values, [n, c, h, w], options)?;
    to_rgb8(&canvas, height, width)?.save(path)?;
    Ok(())
}

/// Peak signal-to-noise ratio of two 8-bit images, infinite when they are identical.
pub fn psnr(a: &DynamicImage, b: &DynamicImage) -> Result<f64> {
    let (a, b) = (a.to_rgb8(), b.to_rgb8());
    if a.dimensions() != b.dimensions() {
        let (aw, ah) = a.dimensions();
        let (bw, bh) = b.dimensions();
        return Err(Error::ShapeMismatch {
            left: vec![ah as usize, aw as usize],
            right: vec![bh as usize, bw as usize],
        });
    }

    let rmse = imageproc::stats::root_mean_squared_error(&a, &b);
    if rmse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(20.0 * (255.0 / rmse).log10())
}

/// Interleaved `[-1, 1]` RGB values to an image.
pub fn float_vec_to_image(data: &[f32], height: usize, width: usize) -> Option<DynamicImage> {
    let expected_len = width * height * CHANNELS;
    if data.len() != expected_len {
        warn!(
            expected = expected_len,
            got = data.len(),
            "mismatched image data length"
        );
        return None;
    }

    let raw_pixels: Vec<u8> = data
        .iter()
        .map(|&val| {
            // Reversing the normalization: (val + 1.0) * 127.5
            let denormalized = (val + 1.0) * 127.5;
            denormalized.clamp(0.0, 255.0) as u8
        })
        .collect();

    let img_buf =
        ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(width as u32, height as u32, raw_pixels)?;

    Some(DynamicImage::ImageRgb8(img_buf))
}

/// Planar CHW `[-1, 1]` values to an image.
pub fn chw_vec_to_image(data: &[f32], height: usize, width: usize) -> Option<DynamicImage> {
    let plane = height * width;
    if data.len() != CHANNELS * plane {
        return float_vec_to_image(data, height, width);
    }
    let interleaved: Vec<f32> = (0..plane)
        .flat_map(|i| (0..CHANNELS).map(move |c| c * plane + i))
        .map(|idx| data[idx])
        .collect();
    float_vec_to_image(&interleaved, height, width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn as_tensor(image: &DynamicImage) -> Tensor<TestBackend, 3> {
        let rgb = image.to_rgb8();
        let (w, h) = rgb.dimensions();
        let values: Vec<f32> = (0..CHANNELS)
            .flat_map(|c| rgb.pixels().map(move |p| p[c] as f32 / 255.0))
            .collect();
        Tensor::from_data(
            TensorData::new(values, [CHANNELS, h as usize, w as usize]),
            &Default::default(),
        )
    }

    #[test]
    fn tensor2img_is_idempotent() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 3>::random(
            [3, 5, 7],
            Distribution::Uniform(-1.5, 1.5),
            &device,
        );

        let first = tensor2img(tensor, (-1.0, 1.0)).unwrap();
        let second = tensor2img(as_tensor(&first), (0.0, 1.0)).unwrap();

        assert_eq!(first.to_rgb8(), second.to_rgb8());
    }

    #[test]
    fn tensor2img_squeezes_and_tiles() {
        let device = Default::default();
        let single = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 6], &device);
        let batch = Tensor::<TestBackend, 4>::zeros([4, 3, 4, 6], &device);
        let gray = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 6], &device);

        let single = tensor2img(single, (-1.0, 1.0)).unwrap();
        let batch = tensor2img(batch, (-1.0, 1.0)).unwrap();
        let gray = tensor2img(gray, (-1.0, 1.0)).unwrap();

        assert_eq!((single.width(), single.height()), (6, 4));
        // 2x2 grid, two pixels of padding around every tile
        assert_eq!((batch.width(), batch.height()), (2 * 8 + 2, 2 * 6 + 2));
        assert!(matches!(gray, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn tensor2img_rejects_vectors() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 2>::zeros([1, 9], &device);

        assert!(matches!(tensor2img(tensor, (-1.0, 1.0)), Err(Error::UnsupportedRank(1))));
    }

    #[test]
    fn psnr_of_identical_images_is_infinite() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([10, 200, 30])));
        assert_eq!(psnr(&image, &image).unwrap(), f64::INFINITY);
    }

    #[test]
    fn psnr_of_constant_offset() {
        let a = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([100, 100, 100])));
        for c in [1u8, 5, 40] {
            let b = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([100 + c; 3])));
            let expected = 20.0 * (255.0 / c as f64).log10();
            assert_relative_eq!(psnr(&a, &b).unwrap(), expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn psnr_checks_dimensions() {
        let a = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let b = DynamicImage::ImageRgb8(RgbImage::new(8, 4));
        assert!(matches!(psnr(&a, &b), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn save_image_writes_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.png");
        let batch = Tensor::<TestBackend, 4>::ones([3, 3, 4, 4], &Default::default());

        save_image(batch, &path, 8).unwrap();

        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (3 * 6 + 2, 6 + 2));
        assert_eq!(saved.get_pixel(2, 2), &Rgb([255, 255, 255]));
        assert_eq!(saved.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn chw_values_are_interleaved() {
        let data = [1.0, -1.0, -1.0, 1.0, -1.0, -1.0];
        let image = chw_vec_to_image(&data, 1, 2).unwrap().to_rgb8();
        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([0, 255, 0]));
    }
}
