#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use burn::data::dataset::Dataset;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use env_logger::Env;
use gcl_burn::data::{build_batch, ImageConfig, ReidBatch, ReidDataset};
use gcl_burn::training::{init_trainer, TrainerOptions, TrainingConfig};
use gcl_burn::utils::save_sample_grid;
use log::info;
use rand::{rngs::StdRng, SeedableRng};
use std::path::{Path, PathBuf};

#[cfg(not(feature = "cuda"))]
type Backend = burn::backend::WebGpu<f32, i32>;
#[cfg(feature = "cuda")]
type Backend = burn::backend::Cuda<f32, i32>;

#[derive(Parser, Debug)]
#[command(about = "Render reconstruction and novel-structure grids from a snapshot")]
struct Args {
    /// Output directory of a training run.
    #[arg(long)]
    run_dir: PathBuf,
    #[arg(long)]
    image_dir: PathBuf,
    #[arg(long)]
    structure_dir: PathBuf,
    #[arg(long)]
    save_dir: PathBuf,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let device = Default::default();
    sample::<Autodiff<Backend>>(&args, device)
}

fn sample<B: AutodiffBackend>(args: &Args, device: B::Device) -> Result<()> {
    let config_path = args.run_dir.join("config.json");
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let dataset = ReidDataset::open(&args.image_dir, &args.structure_dir)?;
    if dataset.is_empty() {
        return Err(anyhow::anyhow!("no images in {}", args.image_dir.display()));
    }

    let options = TrainerOptions {
        num_samples: dataset.len(),
        num_features: config.model.id.num_features,
        idnet_freeze: true,
        seed: args.seed,
    };
    let mut trainer = init_trainer::<B>(&config.model, config.hyper.clone(), options, &device)?;
    let iteration = trainer.resume(&args.run_dir.join("checkpoints"))?;
    info!("loaded snapshot {iteration}");

    let image_config = ImageConfig {
        height: config.image_height as u32,
        width: config.image_width as u32,
    };
    let pool = dataset.structure_paths();
    let mut rng = StdRng::seed_from_u64(args.seed);
    std::fs::create_dir_all(&args.save_dir)?;

    for (idx, chunk) in dataset.samples().chunks(args.batch_size.max(1)).enumerate() {
        let ReidBatch {
            images,
            structures,
            novel_structures,
            ..
        } = build_batch::<B::InnerBackend>(chunk, &pool, &image_config, &mut rng, &device)?;

        let out = trainer.sample(images.clone(), structures.clone(), novel_structures.clone());
        let path = output_path(&args.save_dir, idx);
        save_sample_grid(
            vec![
                images,
                structures,
                out.x_recon,
                novel_structures,
                out.x_nv,
                out.x_nv2recon,
            ],
            &path,
        )?;
        info!("saved {}", path.display());
    }

    Ok(())
}

fn output_path(save_dir: &Path, batch: usize) -> PathBuf {
    save_dir.join(format!("sample_{batch:04}.png"))
}
