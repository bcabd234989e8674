use std::path::{Path, PathBuf};

use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamConfig, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use tracing::{info, warn};

use crate::error;
use crate::model::{
    architecture::{Adversary, Generator, ModelConfig},
    clip::{ClipTextEncoder, ClipVisionEncoder, ImageEncoder},
    constants::ADVERSARIAL_WEIGHT,
    data::{CaptionTokenizer, PreparedBatch, SrBatcher, SrDataset, prepare},
    evaluation::{calculate_psnr, progress_bar, sample_one_batch},
    losses::{
        GradientPenaltyConfig, Target, cosine_similarity, cyclic_shift, gradient_penalty, l1_loss,
        predict_loss,
    },
    perceptual::{PerceptualDistance, VggPerceptual, VggPerceptualConfig},
    precision::{GradScaler, GradScaling, PrecisionConfig},
};
use crate::utils::{
    checkpoint::{TrainingState, checkpoint_dir, load_checkpoint, save_checkpoint},
    distributed::ProcessGroup,
    sink::{CsvSink, MetricSink, TracingSink},
};

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,

    #[config(default = "AdamConfig::new().with_beta_1(0.0).with_beta_2(0.9)")]
    pub optimizer_g: AdamConfig,

    #[config(default = "AdamConfig::new().with_beta_1(0.0).with_beta_2(0.9)")]
    pub optimizer_d: AdamConfig,

    #[config(default = "PrecisionConfig::new()")]
    pub precision: PrecisionConfig,

    #[config(default = "GradientPenaltyConfig::new()")]
    pub penalty: GradientPenaltyConfig,

    #[config(default = "VggPerceptualConfig::new()")]
    pub perceptual: VggPerceptualConfig,

    #[config(default = 600)]
    pub num_epochs: usize,

    #[config(default = 16)]
    pub batch_size: usize,

    #[config(default = 4)]
    pub num_workers: usize,

    #[config(default = 100)]
    pub seed: u64,

    #[config(default = 1e-4)]
    pub lr_g: f64,

    #[config(default = 4e-4)]
    pub lr_d: f64,

    /// Weight of the text-image similarity reward in the generator's adversarial loss.
    #[config(default = 4.0)]
    pub sim_w: f64,

    /// Side of the high-resolution crops; inputs are a quarter of it.
    #[config(default = 256)]
    pub hr_size: usize,

    /// Epochs between PSNR evaluations; 0 disables them.
    #[config(default = 10)]
    pub test_interval: usize,

    #[config(default = 10)]
    pub save_interval: usize,

    /// Passes over the test set per PSNR evaluation.
    #[config(default = 1)]
    pub sample_times: usize,
}

/// Files consumed by [`train`] besides the configuration.
#[derive(Debug, Clone, Default)]
pub struct TrainingPaths {
    pub train_dir: PathBuf,
    pub test_dir: PathBuf,
    pub tokenizer: PathBuf,
    pub clip_vision: Option<PathBuf>,
    pub clip_text: Option<PathBuf>,
    pub vgg: Option<PathBuf>,
    pub resume: Option<PathBuf>,
}

/// Everything mutated by one adversarial step.
pub struct GanState<B: AutodiffBackend, OG, OD> {
    pub generator: Generator<B>,
    pub adversary: Adversary<B>,
    pub optim_g: OG,
    pub optim_d: OD,
    pub scaler_g: GradScaler,
    pub scaler_d: GradScaler,
}

/// Scalar loss components of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepLosses {
    pub d_real: f64,
    pub d_fake: f64,
    pub d_mismatch: f64,
    pub d_gp: f64,
    pub d_total: f64,
    pub g_total: f64,
    pub g_l1: f64,
    pub g_adversarial: f64,
    pub g_perceptual: f64,
}

impl StepLosses {
    pub fn is_finite(&self) -> bool {
        self.values().iter().all(|(_, v)| v.is_finite())
    }

    pub fn values(&self) -> [(&'static str, f64); 9] {
        [
            ("loss/d_real", self.d_real),
            ("loss/d_fake", self.d_fake),
            ("loss/d_mismatch", self.d_mismatch),
            ("loss/d_gp", self.d_gp),
            ("loss/d_total", self.d_total),
            ("loss/g_total", self.g_total),
            ("loss/g_l1", self.g_l1),
            ("loss/g_adversarial", self.g_adversarial),
            ("loss/g_perceptual", self.g_perceptual),
        ]
    }

    pub fn record(&self, sink: &mut dyn MetricSink, step: usize) {
        for (name, value) in self.values() {
            sink.record(name, value, step);
        }
    }
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem::<f64>()
}

/// Generator output of the discriminator phase, reused by the generator phase.
pub struct FakeBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub features: Vec<Tensor<B, 4>>,
    pub embedding: Tensor<B, 2>,
}

/// Discriminator objective: real + (fake + mismatched) / 2 + gradient penalty.
///
/// The fake images only reach the adversary detached, so the loss carries no gradient
/// for the generator.
pub fn discriminator_loss<B, E, S>(
    generator: &Generator<B>,
    adversary: &Adversary<B>,
    batch: &PreparedBatch<B>,
    image_encoder: &E,
    scaler: &S,
    config: &TrainingConfig,
    losses: &mut StepLosses,
) -> (Tensor<B, 1>, FakeBatch<B>)
where
    B: AutodiffBackend,
    E: ImageEncoder<B>,
    S: GradScaling,
{
    let sentence = batch.sentence_emb.clone();

    let real_features = image_encoder.extract_layers(batch.real.clone());
    let (_, loss_real) = predict_loss(adversary, &real_features, sentence.clone(), Target::Real);

    let mismatched = cyclic_shift(sentence.clone());
    let (_, loss_mismatch) = predict_loss(adversary, &real_features, mismatched, Target::Fake);

    let images = generator.forward(batch.low_res.clone(), sentence.clone());
    let (features, embedding) = image_encoder.encode_image(images.clone());
    let detached: Vec<Tensor<B, 4>> = features.iter().map(|f| f.clone().detach()).collect();
    let (_, loss_fake) = predict_loss(adversary, &detached, sentence.clone(), Target::Fake);

    let loss_gp = gradient_penalty(&config.penalty, adversary, &real_features, sentence, scaler);

    let loss =
        loss_real.clone() + (loss_fake.clone() + loss_mismatch.clone()) / 2.0 + loss_gp.clone();
    losses.d_real = scalar(&loss_real);
    losses.d_fake = scalar(&loss_fake);
    losses.d_mismatch = scalar(&loss_mismatch);
    losses.d_gp = scalar(&loss_gp);
    losses.d_total = scalar(&loss);

    let fake = FakeBatch {
        images,
        features,
        embedding,
    };
    (loss, fake)
}

/// Updates the adversary once and hands the generated batch on to [`generator_step`].
#[allow(clippy::too_many_arguments)]
pub fn discriminator_step<B, OD, E>(
    generator: &Generator<B>,
    adversary: Adversary<B>,
    optim: &mut OD,
    scaler: &mut GradScaler,
    batch: &PreparedBatch<B>,
    image_encoder: &E,
    config: &TrainingConfig,
    losses: &mut StepLosses,
) -> (Adversary<B>, FakeBatch<B>)
where
    B: AutodiffBackend,
    OD: Optimizer<Adversary<B>, B>,
    E: ImageEncoder<B>,
{
    let (loss, fake) =
        discriminator_loss(generator, &adversary, batch, image_encoder, &*scaler, config, losses);
    let adversary = scaler.backward_and_step(loss, adversary, optim, config.lr_d);
    (adversary, fake)
}

/// Generator objective: L1 + weighted adversarial term + perceptual distance.
#[allow(clippy::too_many_arguments)]
pub fn generator_step<B, OG, P>(
    generator: Generator<B>,
    adversary: &Adversary<B>,
    fake: FakeBatch<B>,
    optim: &mut OG,
    scaler: &mut GradScaler,
    batch: &PreparedBatch<B>,
    perceptual: &P,
    config: &TrainingConfig,
    losses: &mut StepLosses,
) -> Generator<B>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    P: PerceptualDistance<B>,
{
    let sentence = batch.sentence_emb.clone();
    let real = batch.real.clone();

    let score = adversary.score(&fake.features, sentence.clone());
    let similarity = cosine_similarity(fake.embedding, sentence).mean();
    let loss_adversarial = score.mean().neg() - similarity.mul_scalar(config.sim_w);

    let loss_l1 = l1_loss(fake.images.clone(), real.clone());
    let loss_perceptual = perceptual.distance(fake.images, real);
    let loss = loss_l1.clone()
        + loss_adversarial.clone().mul_scalar(ADVERSARIAL_WEIGHT)
        + loss_perceptual.clone();

    losses.g_l1 = scalar(&loss_l1);
    losses.g_adversarial = scalar(&loss_adversarial);
    losses.g_perceptual = scalar(&loss_perceptual);
    losses.g_total = scalar(&loss);
    scaler.backward_and_step(loss, generator, optim, config.lr_g)
}

/// One discriminator update followed by one generator update on `batch`.
pub fn train_step<B, OG, OD, E, P>(
    state: GanState<B, OG, OD>,
    batch: &PreparedBatch<B>,
    image_encoder: &E,
    perceptual: &P,
    config: &TrainingConfig,
) -> (GanState<B, OG, OD>, StepLosses)
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Adversary<B>, B>,
    E: ImageEncoder<B>,
    P: PerceptualDistance<B>,
{
    let GanState {
        generator,
        adversary,
        mut optim_g,
        mut optim_d,
        mut scaler_g,
        mut scaler_d,
    } = state;
    let mut losses = StepLosses::default();

    let (adversary, fake) = discriminator_step(
        &generator,
        adversary,
        &mut optim_d,
        &mut scaler_d,
        batch,
        image_encoder,
        config,
        &mut losses,
    );
    let generator = generator_step(
        generator,
        &adversary,
        fake,
        &mut optim_g,
        &mut scaler_g,
        batch,
        perceptual,
        config,
        &mut losses,
    );

    let state = GanState {
        generator,
        adversary,
        optim_g,
        optim_d,
        scaler_g,
        scaler_d,
    };
    (state, losses)
}

fn create_artifact_dir(artifact_dir: &Path, resume: bool) -> error::Result<()> {
    // Remove existing artifacts unless a run is resumed
    if !resume {
        std::fs::remove_dir_all(artifact_dir).ok();
    }
    std::fs::create_dir_all(artifact_dir.join("checkpoints"))?;
    std::fs::create_dir_all(artifact_dir.join("samples"))?;
    Ok(())
}

/// Frozen pretrained networks shared by training, evaluation and sampling.
pub struct Pretrained<B: Backend> {
    pub vision: ClipVisionEncoder<B>,
    pub text: ClipTextEncoder<B>,
}

impl<B: Backend> Pretrained<B> {
    pub fn load(
        model: &ModelConfig,
        vision: Option<&Path>,
        text: Option<&Path>,
        device: &B::Device,
    ) -> error::Result<Self> {
        let recorder = CompactRecorder::new();
        let mut encoder = model.init_vision(device);
        if let Some(path) = vision {
            encoder = encoder.load_file(path, &recorder, device)?;
        }
        let mut text_encoder = model.init_text(device);
        if let Some(path) = text {
            text_encoder = text_encoder.load_file(path, &recorder, device)?;
        }
        if vision.is_none() || text.is_none() {
            warn!("no pretrained encoder weights given, using random initialisation");
        }

        Ok(Self {
            vision: encoder.no_grad(),
            text: text_encoder.no_grad(),
        })
    }
}

fn load_perceptual<B: Backend>(
    config: &VggPerceptualConfig,
    path: Option<&Path>,
    device: &B::Device,
) -> error::Result<VggPerceptual<B>> {
    let vgg = config.init(device);
    let vgg = match path {
        Some(path) => vgg.load_file(path, &CompactRecorder::new(), device)?,
        None => {
            warn!("no pretrained VGG weights given, perceptual loss uses random features");
            vgg
        }
    };
    Ok(vgg.no_grad())
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: TrainingConfig,
    paths: TrainingPaths,
    group: ProcessGroup,
    device: B::Device,
) -> error::Result<()> {
    let is_primary = group.is_primary();
    if is_primary {
        create_artifact_dir(artifact_dir, paths.resume.is_some())?;
        config.save(artifact_dir.join("config.json"))?;
    }

    B::seed(config.seed);

    let tokenizer =
        CaptionTokenizer::from_file(&paths.tokenizer, config.model.text.context_length)?;
    let dataset_train = SrDataset::new(&paths.train_dir, tokenizer.clone(), config.hr_size)?;
    let dataset_test = SrDataset::new(&paths.test_dir, tokenizer, config.hr_size)?;
    let num_batches = (dataset_train.len() / group.world_size).div_ceil(config.batch_size);
    let test_batches = (dataset_test.len() / group.world_size).div_ceil(config.batch_size);

    let dataloader_train = DataLoaderBuilder::<B, _, _>::new(SrBatcher::new(config.hr_size))
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(group.shard(dataset_train));
    let dataloader_test =
        DataLoaderBuilder::<B::InnerBackend, _, _>::new(SrBatcher::new(config.hr_size))
            .batch_size(config.batch_size)
            .num_workers(config.num_workers)
            .build(group.shard(dataset_test));

    let pretrained = Pretrained::<B>::load(
        &config.model,
        paths.clip_vision.as_deref(),
        paths.clip_text.as_deref(),
        &device,
    )?;
    let perceptual = load_perceptual::<B>(&config.perceptual, paths.vgg.as_deref(), &device)?;

    let mut generator = config.model.init_generator(pretrained.vision.clone(), &device)?;
    let mut adversary = config.model.init_adversary(&device);
    let mut optim_g = config.optimizer_g.init::<B, Generator<B>>();
    let mut optim_d = config.optimizer_d.init::<B, Adversary<B>>();

    let mut start_epoch = 1;
    if let Some(dir) = &paths.resume {
        if let Some(TrainingState { epoch, .. }) =
            load_checkpoint(
                dir,
                &device,
                &mut generator,
                &mut adversary,
                &mut optim_g,
                &mut optim_d,
            )?
        {
            start_epoch = epoch + 1;
        }
    }

    let mut state = GanState {
        generator,
        adversary,
        optim_g,
        optim_d,
        scaler_g: config.precision.init(),
        scaler_d: config.precision.init(),
    };

    let mut sink: Box<dyn MetricSink> = if is_primary {
        Box::new((TracingSink, CsvSink::create(artifact_dir.join("metrics.csv"))?))
    } else {
        Box::new(TracingSink)
    };

    let text_valid = pretrained.text.valid();
    let fixed = dataloader_test
        .iter()
        .next()
        .map(|batch| prepare(batch, &text_valid, &device));
    let samples_dir = artifact_dir.join("samples");
    let mut global_step = (start_epoch - 1) * num_batches;

    info!(
        start_epoch,
        epochs = config.num_epochs,
        batches = num_batches,
        mixed = state.scaler_g.is_dynamic(),
        "starting training"
    );

    for epoch in start_epoch..=config.num_epochs {
        let bar = progress_bar(num_batches, is_primary);
        bar.set_message(format!("Train Epoch [{epoch}/{}]", config.num_epochs));

        for batch in dataloader_train.iter() {
            let batch = prepare(batch, &pretrained.text, &device);
            let (next, losses) = train_step(
                state,
                &batch,
                &pretrained.vision,
                &perceptual,
                &config,
            );
            state = next;

            losses.record(sink.as_mut(), global_step);
            if state.scaler_g.is_dynamic() {
                sink.record("scale/g", state.scaler_g.get_scale(), global_step);
                sink.record("scale/d", state.scaler_d.get_scale(), global_step);
            }
            bar.set_message(format!(
                "Train Epoch [{epoch}/{}] errD {:.4} errG {:.4}",
                config.num_epochs, losses.d_total, losses.g_total
            ));
            bar.inc(1);
            global_step += 1;
        }
        bar.finish_and_clear();

        let generator_valid = state.generator.valid();
        if let Some(fixed) = &fixed {
            sample_one_batch(
                fixed.low_res.clone(),
                fixed.sentence_emb.clone(),
                &generator_valid,
                epoch,
                &samples_dir,
                is_primary,
            )?;
        }

        if is_primary && config.save_interval > 0 && epoch % config.save_interval == 0 {
            save_checkpoint(
                &checkpoint_dir(&artifact_dir.join("checkpoints"), epoch, 0),
                &state.generator,
                &state.adversary,
                &state.optim_g,
                &state.optim_d,
                TrainingState { epoch, step: 0 },
            )?;
        }

        if config.test_interval > 0 && epoch % config.test_interval == 0 {
            let bar = progress_bar(test_batches * config.sample_times, is_primary);
            bar.set_message(format!("Eval Epoch [{epoch}/{}]", config.num_epochs));
            let psnr = calculate_psnr(
                &generator_valid,
                &text_valid,
                || dataloader_test.iter(),
                config.sample_times,
                &device,
                &bar,
            )?;
            bar.finish_and_clear();

            sink.record("eval/psnr", psnr, epoch);
            if is_primary {
                info!(epoch, psnr, "evaluation");
            }
        }
        sink.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sink::MemorySink;

    #[test]
    fn losses_are_recorded_under_stable_names() {
        let losses = StepLosses {
            d_total: 1.25,
            g_total: -0.5,
            ..Default::default()
        };
        let mut sink = MemorySink::default();
        losses.record(&mut sink, 7);

        assert_eq!(sink.records.len(), 9);
        assert_eq!(sink.values("loss/d_total"), vec![1.25]);
        assert_eq!(sink.values("loss/g_total"), vec![-0.5]);
        assert!(sink.records.iter().all(|(_, _, step)| *step == 7));
    }

    #[test]
    fn non_finite_losses_are_detected() {
        let losses = StepLosses {
            d_gp: f64::NAN,
            ..Default::default()
        };
        assert!(!losses.is_finite());
        assert!(StepLosses::default().is_finite());
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainingConfig::new().with_batch_size(4).with_sim_w(2.0);
        config.save(&path).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.batch_size, 4);
        assert_eq!(loaded.sim_w, 2.0);
        assert_eq!(loaded.num_epochs, 600);
    }

    #[test]
    fn perceptual_weights_are_optional_but_must_exist_when_given() {
        type TestBackend = burn::backend::NdArray<f32>;
        let device = Default::default();
        let config = VggPerceptualConfig::new().with_channels(vec![2, 3, 4, 4, 4]);

        assert!(load_perceptual::<TestBackend>(&config, None, &device).is_ok());

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("vgg16");
        assert!(load_perceptual::<TestBackend>(&config, Some(&missing), &device).is_err());
    }
}
