pub mod architecture;
pub mod blocks;
pub mod clip;
pub mod constants;
pub mod data;
pub mod evaluation;
pub mod losses;
pub mod perceptual;
pub mod precision;
pub mod training;
