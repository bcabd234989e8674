use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::{ImageReader, RgbImage, imageops::FilterType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::clip::TextEncoder;
use crate::model::constants::{CHANNELS, UPSCALE};

const START_OF_TEXT: &str = "<|startoftext|>";
const END_OF_TEXT: &str = "<|endoftext|>";

/// CLIP-style caption tokenizer: `[sot] tokens.. [eot]`, zero padded to the context length.
/// Overlong captions are truncated with the end-of-text token kept last.
#[derive(Clone)]
pub struct CaptionTokenizer {
    inner: Arc<Tokenizer>,
    context_length: usize,
    start: u32,
    end: u32,
}

impl CaptionTokenizer {
    pub fn new(tokenizer: Tokenizer, context_length: usize) -> Result<Self> {
        let lookup = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| Error::Tokenizer(format!("vocabulary has no {token} token")))
        };
        let start = lookup(START_OF_TEXT)?;
        let end = lookup(END_OF_TEXT)?;

        Ok(Self {
            inner: Arc::new(tokenizer),
            context_length,
            start,
            end,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P, context_length: usize) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Self::new(tokenizer, context_length)
    }

    pub fn encode(&self, caption: &str) -> Result<Vec<i64>> {
        let encoding = self
            .inner
            .encode(caption.to_lowercase(), false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;

        let mut ids = Vec::with_capacity(self.context_length);
        ids.push(self.start as i64);
        ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
        ids.push(self.end as i64);

        if ids.len() > self.context_length {
            ids.truncate(self.context_length);
            if let Some(last) = ids.last_mut() {
                *last = self.end as i64;
            }
        }
        ids.resize(self.context_length, 0);
        Ok(ids)
    }
}

#[derive(Debug, Clone)]
pub struct SrItem {
    /// Planar CHW in [-1, 1].
    pub high_res: Vec<f32>,
    pub low_res: Vec<f32>,
    pub tokens: Vec<i64>,
    pub caption: String,
    pub key: String,
}

/// Image folder where every image has a caption file with the same stem.
/// The low-resolution input is derived from the resized high-resolution image.
#[derive(Clone)]
pub struct SrDataset {
    pub image_paths: Vec<PathBuf>,
    tokenizer: CaptionTokenizer,
    hr_size: usize,
}

impl SrDataset {
    pub fn new<P: AsRef<Path>>(
        path: P,
        tokenizer: CaptionTokenizer,
        hr_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut image_paths = Vec::new();

        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() {
                if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
                    match ext.to_lowercase().as_str() {
                        "jpg" | "jpeg" | "png" | "bmp" | "tiff" => {
                            image_paths.push(path);
                        }
                        _ => {}
                    }
                }
            }
        }
        if image_paths.is_empty() {
            return Err(Error::EmptyDataset(path.to_path_buf()));
        }
        if let Some(missing) = image_paths.iter().find(|p| !p.with_extension("txt").is_file()) {
            return Err(Error::MissingCaption(missing.clone()));
        }

        // Unreadable samples would end a data loader pass early, so drop them here.
        let found = image_paths.len();
        image_paths.retain(|image| match check_sample(image) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %image.display(), %err, "skipping unreadable sample");
                false
            }
        });
        if image_paths.is_empty() {
            return Err(Error::EmptyDataset(path.to_path_buf()));
        }
        image_paths.sort();
        debug!(
            dir = %path.display(),
            images = image_paths.len(),
            skipped = found - image_paths.len(),
            "loaded dataset"
        );

        Ok(Self {
            image_paths,
            tokenizer,
            hr_size,
        })
    }

    pub fn lr_size(&self) -> usize {
        self.hr_size / UPSCALE
    }

    fn load(&self, path: &Path) -> Result<SrItem> {
        let image = ImageReader::open(path)?.decode()?.to_rgb8();
        let hr_size = self.hr_size as u32;
        let lr_size = self.lr_size() as u32;
        let high_res = image::imageops::resize(&image, hr_size, hr_size, FilterType::CatmullRom);
        let low_res = image::imageops::resize(&high_res, lr_size, lr_size, FilterType::CatmullRom);

        let caption = std::fs::read_to_string(path.with_extension("txt"))?
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string();
        let tokens = self.tokenizer.encode(&caption)?;
        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        Ok(SrItem {
            high_res: to_planar(&high_res),
            low_res: to_planar(&low_res),
            tokens,
            caption,
            key,
        })
    }
}

/// Image header and caption text of one sample can be read.
fn check_sample(image: &Path) -> Result<()> {
    image::image_dimensions(image)?;
    std::fs::read_to_string(image.with_extension("txt"))?;
    Ok(())
}

fn to_planar(image: &RgbImage) -> Vec<f32> {
    let (w, h) = image.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0.0; CHANNELS * plane];
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..CHANNELS {
            // Normalize to [-1, 1]
            data[c * plane + i] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }
    data
}

impl Dataset<SrItem> for SrDataset {
    fn len(&self) -> usize {
        self.image_paths.len()
    }

    fn get(&self, index: usize) -> Option<SrItem> {
        let path = self.image_paths.get(index)?;
        match self.load(path) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable sample");
                None
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct SrBatcher {
    hr_size: usize,
}

impl SrBatcher {
    pub fn new(hr_size: usize) -> Self {
        Self { hr_size }
    }
}

#[derive(Clone, Debug)]
pub struct SrBatch<B: Backend> {
    pub real: Tensor<B, 4>,     // [batch_size, channels, hr, hr]
    pub low_res: Tensor<B, 4>,  // [batch_size, channels, hr / 4, hr / 4]
    pub tokens: Tensor<B, 2, Int>,
    pub captions: Vec<String>,
    pub keys: Vec<String>,
}

impl<B: Backend> Batcher<B, SrItem, SrBatch<B>> for SrBatcher {
    fn batch(&self, items: Vec<SrItem>, device: &B::Device) -> SrBatch<B> {
        let hr = self.hr_size;
        let lr = hr / UPSCALE;
        let image = |data: Vec<f32>, size: usize| {
            Tensor::<B, 3>::from_data(
                TensorData::new(data, [CHANNELS, size, size]).convert::<B::FloatElem>(),
                device,
            )
            .unsqueeze::<4>()
        };

        let mut real = Vec::with_capacity(items.len());
        let mut low_res = Vec::with_capacity(items.len());
        let mut tokens = Vec::with_capacity(items.len());
        let mut captions = Vec::with_capacity(items.len());
        let mut keys = Vec::with_capacity(items.len());

        for item in items {
            let context = item.tokens.len();
            real.push(image(item.high_res, hr));
            low_res.push(image(item.low_res, lr));
            tokens.push(
                Tensor::<B, 1, Int>::from_data(
                    TensorData::new(item.tokens, [context]).convert::<B::IntElem>(),
                    device,
                )
                .unsqueeze::<2>(),
            );
            captions.push(item.caption);
            keys.push(item.key);
        }

        SrBatch {
            real: Tensor::cat(real, 0),
            low_res: Tensor::cat(low_res, 0),
            tokens: Tensor::cat(tokens, 0),
            captions,
            keys,
        }
    }
}

/// A batch with its caption embeddings.
#[derive(Clone, Debug)]
pub struct PreparedBatch<B: Backend> {
    pub real: Tensor<B, 4>,
    pub low_res: Tensor<B, 4>,
    pub captions: Vec<String>,
    pub tokens: Tensor<B, 2, Int>,
    pub sentence_emb: Tensor<B, 2>,
    pub word_embs: Tensor<B, 3>,
    pub keys: Vec<String>,
}

/// Moves a batch to `device` and encodes its captions with the frozen text encoder.
pub fn prepare<B: Backend, T: TextEncoder<B>>(
    batch: SrBatch<B>,
    text_encoder: &T,
    device: &B::Device,
) -> PreparedBatch<B> {
    let tokens = batch.tokens.to_device(device);
    let (sentence_emb, word_embs) = text_encoder.encode_text(tokens.clone());

    PreparedBatch {
        real: batch.real.to_device(device),
        low_res: batch.low_res.to_device(device),
        captions: batch.captions,
        tokens,
        sentence_emb: sentence_emb.detach(),
        word_embs: word_embs.detach(),
        keys: batch.keys,
    }
}
