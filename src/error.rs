use std::path::PathBuf;

use burn::record::RecorderError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("scale {0} is not supported. Supported scales: 2^n and 3.")]
    UnsupportedScale(usize),

    #[error("only 4D, 3D and 2D tensors can be converted to images, got {0} dimensions")]
    UnsupportedRank(usize),

    #[error("cannot build an image from {0} channels")]
    UnsupportedChannels(usize),

    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },

    #[error("imaginary component {0}")]
    ImaginaryComponent(f64),

    #[error("frechet distance is not finite")]
    NonFiniteDistance,

    #[error("no valid image files found in {}", .0.display())]
    EmptyDataset(PathBuf),

    #[error("missing caption file {}", .0.display())]
    MissingCaption(PathBuf),

    #[error("tokenizer: {0}")]
    Tokenizer(String),

    #[error("tensor data: {0}")]
    TensorData(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
