pub const CHANNELS: usize = 3;

/// Super-resolution factor between the low-resolution input and the output.
pub const UPSCALE: usize = 4;

/// Low-resolution inputs are resampled to this size before feature extraction.
pub const CANONICAL_SIZE: usize = 64;

/// Loss scale restored when a scaler decays below its configured floor.
pub const SCALE_RECOVERY: f64 = 16384.0;

pub const ADVERSARIAL_WEIGHT: f64 = 0.01;

pub const GP_WEIGHT: f64 = 2.0;
pub const GP_POWER: f64 = 6.0;

pub const LEAKY_SLOPE: f64 = 0.2;

pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
