use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use text_guided_sr::{
    model::{
        architecture::Generator,
        data::{CaptionTokenizer, SrBatcher, SrDataset},
        evaluation::{calculate_psnr, progress_bar, sample},
        training::{Pretrained, TrainingConfig, TrainingPaths, train},
    },
    utils::{checkpoint::load_generator, distributed::ProcessGroup},
};

#[derive(Parser)]
#[command(name = "text_guided_sr")]
#[command(about = "Text-guided 4x image super-resolution GAN")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Common {
    /// Tokenizer JSON for captions
    #[arg(long)]
    tokenizer: PathBuf,

    /// Training configuration saved by a previous run
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pretrained CLIP image encoder record
    #[arg(long)]
    clip_vision: Option<PathBuf>,

    /// Pretrained CLIP text encoder record
    #[arg(long)]
    clip_text: Option<PathBuf>,

    /// Train in reduced precision with dynamic loss scaling
    #[arg(long)]
    mixed_precision: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Train generator and discriminator
    Train {
        #[command(flatten)]
        common: Common,

        #[arg(long, default_value = "dataset/train")]
        train_dir: PathBuf,

        #[arg(long, default_value = "dataset/test")]
        test_dir: PathBuf,

        /// Pretrained VGG16 record for the perceptual loss
        #[arg(long)]
        vgg: Option<PathBuf>,

        #[arg(long, default_value = "artifacts")]
        artifact_dir: PathBuf,

        /// Checkpoint directory to resume from
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Report PSNR of a trained generator on a test set
    Test {
        #[command(flatten)]
        common: Common,

        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long, default_value = "dataset/test")]
        test_dir: PathBuf,

        /// Passes over the test set
        #[arg(long, default_value = "1")]
        times: usize,
    },

    /// Write super-resolved images for every caption/image pair in a directory
    Sample {
        #[command(flatten)]
        common: Common,

        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long, default_value = "dataset/test")]
        data_dir: PathBuf,

        #[arg(long, default_value = "samples")]
        save_dir: PathBuf,
    },
}

impl Commands {
    fn common(&self) -> &Common {
        match self {
            Commands::Train { common, .. }
            | Commands::Test { common, .. }
            | Commands::Sample { common, .. } => common,
        }
    }
}

fn load_config(common: &Common) -> Result<TrainingConfig> {
    let config = match &common.config {
        Some(path) => TrainingConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TrainingConfig::new(),
    };
    let precision = config.precision.clone().with_mixed(common.mixed_precision);
    Ok(config.with_precision(precision))
}

fn run<B: AutodiffBackend>(command: Commands, device: B::Device) -> Result<()> {
    let group = ProcessGroup::from_env();
    let config = load_config(command.common())?;

    match command {
        Commands::Train {
            common,
            train_dir,
            test_dir,
            vgg,
            artifact_dir,
            resume,
        } => {
            let paths = TrainingPaths {
                train_dir,
                test_dir,
                tokenizer: common.tokenizer,
                clip_vision: common.clip_vision,
                clip_text: common.clip_text,
                vgg,
                resume,
            };
            train::<B>(&artifact_dir, config, paths, group, device).context("training failed")?;
        }
        Commands::Test {
            common,
            checkpoint,
            test_dir,
            times,
        } => {
            let (pretrained, generator) = restore::<B::InnerBackend>(
                &config,
                &common,
                &checkpoint,
                &device,
            )?;
            let tokenizer =
                CaptionTokenizer::from_file(&common.tokenizer, config.model.text.context_length)?;
            let dataset = group.shard(SrDataset::new(&test_dir, tokenizer, config.hr_size)?);
            let num_batches = dataset.len().div_ceil(config.batch_size);
            let loader =
                DataLoaderBuilder::<B::InnerBackend, _, _>::new(SrBatcher::new(config.hr_size))
                    .batch_size(config.batch_size)
                    .num_workers(config.num_workers)
                    .build(dataset);

            let bar = progress_bar(num_batches * times, group.is_primary());
            bar.set_message("Eval");
            let psnr = calculate_psnr(
                &generator,
                &pretrained.text,
                || loader.iter(),
                times,
                &device,
                &bar,
            )?;
            bar.finish_and_clear();
            info!(psnr, rank = group.rank, "evaluation finished");
        }
        Commands::Sample {
            common,
            checkpoint,
            data_dir,
            save_dir,
        } => {
            let (pretrained, generator) = restore::<B::InnerBackend>(
                &config,
                &common,
                &checkpoint,
                &device,
            )?;
            let tokenizer =
                CaptionTokenizer::from_file(&common.tokenizer, config.model.text.context_length)?;
            let dataset = group.shard(SrDataset::new(&data_dir, tokenizer, config.hr_size)?);
            let loader =
                DataLoaderBuilder::<B::InnerBackend, _, _>::new(SrBatcher::new(config.hr_size))
                    .batch_size(config.batch_size)
                    .num_workers(config.num_workers)
                    .build(dataset);

            let rank = group.is_distributed().then_some(group.rank);
            sample(
                loader.iter(),
                &generator,
                &pretrained.text,
                &save_dir,
                &device,
                rank,
                group.is_primary(),
            )?;
            info!(dir = %save_dir.display(), "samples written");
        }
    }
    Ok(())
}

fn restore<B: Backend>(
    config: &TrainingConfig,
    common: &Common,
    checkpoint: &Path,
    device: &B::Device,
) -> Result<(Pretrained<B>, Generator<B>)> {
    let pretrained = Pretrained::<B>::load(
        &config.model,
        common.clip_vision.as_deref(),
        common.clip_text.as_deref(),
        device,
    )?;
    let generator = config.model.init_generator(pretrained.vision.clone(), device)?;
    let generator = load_generator(checkpoint, generator, device)
        .with_context(|| format!("loading generator from {}", checkpoint.display()))?;
    Ok((pretrained, generator))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.verbosity)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    #[cfg(feature = "cuda")]
    {
        use burn::backend::{Autodiff, Cuda, cuda::CudaDevice};
        use burn::tensor::f16;
        let device = CudaDevice::default();
        if cli.command.common().mixed_precision {
            return run::<Autodiff<Cuda<f16, i32>>>(cli.command, device);
        }
        return run::<Autodiff<Cuda<f32, i32>>>(cli.command, device);
    }

    #[cfg(not(feature = "cuda"))]
    {
        use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};
        run::<Autodiff<NdArray<f32>>>(cli.command, NdArrayDevice::default())
    }
}
