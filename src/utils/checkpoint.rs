use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    optim::Optimizer,
    record::{CompactRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::model::architecture::{Adversary, Generator};

const GENERATOR: &str = "generator";
const ADVERSARY: &str = "adversary";
const OPTIMIZER_G: &str = "optimizer_g";
const OPTIMIZER_D: &str = "optimizer_d";
const STATE: &str = "state.json";

/// Progress persisted next to the records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TrainingState {
    pub epoch: usize,
    pub step: usize,
}

pub fn checkpoint_dir(root: &Path, epoch: usize, step: usize) -> PathBuf {
    root.join(format!("state_epoch_{epoch:03}_{step:03}"))
}

/// Writes generator, adversary, both optimizer states and the progress marker.
pub fn save_checkpoint<B, OG, OD>(
    dir: &Path,
    generator: &Generator<B>,
    adversary: &Adversary<B>,
    optim_g: &OG,
    optim_d: &OD,
    state: TrainingState,
) -> Result<()>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Adversary<B>, B>,
{
    std::fs::create_dir_all(dir)?;
    let recorder = CompactRecorder::new();
    generator.clone().save_file(dir.join(GENERATOR), &recorder)?;
    adversary.clone().save_file(dir.join(ADVERSARY), &recorder)?;
    recorder.record(optim_g.to_record(), dir.join(OPTIMIZER_G))?;
    recorder.record(optim_d.to_record(), dir.join(OPTIMIZER_D))?;
    std::fs::write(dir.join(STATE), serde_json::to_string_pretty(&state)?)?;

    info!(dir = %dir.display(), epoch = state.epoch, "saved checkpoint");
    Ok(())
}

/// Restores everything [`save_checkpoint`] wrote. Missing pieces are left untouched; the
/// progress marker is returned when present.
pub fn load_checkpoint<B, OG, OD>(
    dir: &Path,
    device: &B::Device,
    generator: &mut Generator<B>,
    adversary: &mut Adversary<B>,
    optim_g: &mut OG,
    optim_d: &mut OD,
) -> Result<Option<TrainingState>>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B> + Clone,
    OD: Optimizer<Adversary<B>, B> + Clone,
{
    let recorder = CompactRecorder::new();
    let exists = |name: &str| record_path(dir, name).exists();

    if exists(GENERATOR) {
        let record = recorder.load(dir.join(GENERATOR), device)?;
        *generator = generator.clone().load_record(record).freeze_encoder();
    }
    if exists(ADVERSARY) {
        let record = recorder.load(dir.join(ADVERSARY), device)?;
        *adversary = adversary.clone().load_record(record);
    }
    if exists(OPTIMIZER_G) {
        let record = recorder.load(dir.join(OPTIMIZER_G), device)?;
        *optim_g = optim_g.clone().load_record(record);
    }
    if exists(OPTIMIZER_D) {
        let record = recorder.load(dir.join(OPTIMIZER_D), device)?;
        *optim_d = optim_d.clone().load_record(record);
    }

    let state_path = dir.join(STATE);
    if state_path.exists() {
        let state: TrainingState = serde_json::from_str(&std::fs::read_to_string(state_path)?)?;
        info!(dir = %dir.display(), epoch = state.epoch, "resumed from checkpoint");
        return Ok(Some(state));
    }
    Ok(None)
}

/// Loads generator weights only, for evaluation and sampling.
pub fn load_generator<B: Backend>(
    dir: &Path,
    generator: Generator<B>,
    device: &B::Device,
) -> Result<Generator<B>> {
    let generator = generator.load_file(dir.join(GENERATOR), &CompactRecorder::new(), device)?;
    Ok(generator.freeze_encoder())
}

fn record_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.mpk"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::tests::tiny_model;
    use approx::assert_relative_eq;
    use burn::{
        backend::{Autodiff, NdArray},
        optim::AdamConfig,
        tensor::{Distribution, Tensor},
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn directory_name_pads_epoch_and_step() {
        let dir = checkpoint_dir(Path::new("ckpt"), 7, 12);
        assert_eq!(dir, Path::new("ckpt/state_epoch_007_012"));
    }

    #[test]
    fn checkpoint_round_trip_restores_state_and_weights() {
        let device = Default::default();
        let config = tiny_model();
        let generator = config
            .init_generator::<TestBackend>(config.init_vision(&device), &device)
            .unwrap();
        let adversary = config.init_adversary::<TestBackend>(&device);
        let optim_g = AdamConfig::new().init::<TestBackend, Generator<TestBackend>>();
        let optim_d = AdamConfig::new().init::<TestBackend, Adversary<TestBackend>>();

        let root = tempfile::tempdir().unwrap();
        let dir = checkpoint_dir(root.path(), 3, 0);
        let state = TrainingState { epoch: 3, step: 0 };
        save_checkpoint(&dir, &generator, &adversary, &optim_g, &optim_d, state).unwrap();

        let mut fresh_g = config
            .init_generator::<TestBackend>(config.init_vision(&device), &device)
            .unwrap();
        let mut fresh_a = config.init_adversary::<TestBackend>(&device);
        let mut fresh_og = AdamConfig::new().init::<TestBackend, Generator<TestBackend>>();
        let mut fresh_od = AdamConfig::new().init::<TestBackend, Adversary<TestBackend>>();
        let restored = load_checkpoint(
            &dir,
            &device,
            &mut fresh_g,
            &mut fresh_a,
            &mut fresh_og,
            &mut fresh_od,
        )
        .unwrap();

        assert_eq!(restored, Some(state));

        // Records are stored at half precision.
        let features: Vec<_> = (0..3)
            .map(|_| Tensor::<TestBackend, 4>::random([1, 8, 7, 7], Distribution::Default, &device))
            .collect();
        let cond = Tensor::<TestBackend, 2>::random([1, 6], Distribution::Default, &device);
        let before = adversary.score(&features, cond.clone()).into_scalar();
        let after = fresh_a.score(&features, cond).into_scalar();
        assert_relative_eq!(before, after, max_relative = 2e-2, epsilon = 1e-2);
    }

    #[test]
    fn missing_checkpoint_is_not_an_error() {
        let device = Default::default();
        let config = tiny_model();
        let mut generator = config
            .init_generator::<TestBackend>(config.init_vision(&device), &device)
            .unwrap();
        let mut adversary = config.init_adversary::<TestBackend>(&device);
        let mut optim_g = AdamConfig::new().init::<TestBackend, Generator<TestBackend>>();
        let mut optim_d = AdamConfig::new().init::<TestBackend, Adversary<TestBackend>>();
        let root = tempfile::tempdir().unwrap();

        let restored = load_checkpoint(
            root.path(),
            &device,
            &mut generator,
            &mut adversary,
            &mut optim_g,
            &mut optim_d,
        )
        .unwrap();

        assert_eq!(restored, None);
    }
}
