#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use clap::Parser;
use env_logger::Env;
use gcl_burn::data::{ImageConfig, ReidBatch, ReidBatcher, ReidDataset, ReidSample};
use gcl_burn::model::class_centers;
use gcl_burn::training::{init_trainer, TrainerComponents, TrainerOptions, TrainingConfig};
use gcl_burn::utils::save_sample_grid;
use gcl_burn::Trainer;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(not(feature = "cuda"))]
type Backend = burn::backend::WebGpu<f32, i32>;
#[cfg(feature = "cuda")]
type Backend = burn::backend::Cuda<f32, i32>;

#[derive(Parser, Debug)]
#[command(about = "Train the identity-preserving re-synthesis GAN")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Receives `config.json`, `checkpoints/` and `images/`.
    #[arg(long)]
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let device = Default::default();
    train::<Autodiff<Backend>>(&args.output_dir, config, device)
}

fn train<B: AutodiffBackend>(output_dir: &Path, config: TrainingConfig, device: B::Device) -> Result<()> {
    let checkpoint_dir = output_dir.join("checkpoints");
    let image_dir = output_dir.join("images");
    std::fs::create_dir_all(&checkpoint_dir)?;
    std::fs::create_dir_all(&image_dir)?;
    config.save(output_dir.join("config.json"))?;

    let dataset = ReidDataset::open(Path::new(&config.image_dir), Path::new(&config.structure_dir))?;
    if dataset.is_empty() {
        return Err(anyhow::anyhow!("no training images in {}", config.image_dir));
    }
    let num_classes = dataset.num_classes();
    info!("{} images of {num_classes} identities", dataset.len());

    let batcher = ReidBatcher::new(
        ImageConfig {
            height: config.image_height as u32,
            width: config.image_width as u32,
        },
        dataset.structure_paths(),
        config.seed,
    );
    let train_loader = DataLoaderBuilder::<B, ReidSample, ReidBatch<B>>::new(batcher.clone())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .set_device(device.clone())
        .build(dataset.clone());
    let center_loader =
        DataLoaderBuilder::<B::InnerBackend, ReidSample, ReidBatch<B::InnerBackend>>::new(batcher)
            .batch_size(config.batch_size)
            .set_device(device.clone())
            .build(dataset.clone());

    let options = TrainerOptions {
        num_samples: dataset.len(),
        num_features: config.model.id.num_features,
        idnet_freeze: config.idnet_freeze,
        seed: config.seed,
    };
    let mut trainer = init_trainer::<B>(&config.model, config.hyper.clone(), options, &device)?;
    let mut iterations = if config.resume {
        trainer.resume(&checkpoint_dir)?
    } else {
        0
    };

    for epoch in 0..config.num_epochs {
        let centers = Tensor::from_inner(compute_centers(&trainer, &center_loader, num_classes)?);

        for batch in train_loader.iter() {
            let ReidBatch {
                images,
                structures,
                novel_structures,
                labels,
                indices,
            } = batch;

            let out = trainer.forward(
                images.clone(),
                structures.clone(),
                novel_structures.clone(),
                Some(labels.clone()),
                Some(num_classes),
            )?;
            let gen_losses = trainer.gen_update(
                &out,
                images.clone(),
                labels,
                &indices,
                iterations,
                centers.clone(),
            );
            let dis_losses = trainer.dis_update(images.clone(), &out);
            trainer.update_learning_rate();

            if iterations % 10 == 0 {
                info!(
                    "epoch {epoch} iteration {:08}: gen {:.4} dis {:.4}",
                    iterations + 1,
                    gen_losses.total,
                    dis_losses.total
                );
            }

            if config.image_save_iter > 0 && (iterations + 1) % config.image_save_iter == 0 {
                let samples = trainer.sample(
                    images.clone().inner(),
                    structures.clone().inner(),
                    novel_structures.clone().inner(),
                );
                save_sample_grid(
                    vec![
                        images.inner(),
                        structures.inner(),
                        samples.x_recon,
                        novel_structures.inner(),
                        samples.x_nv,
                        samples.x_nv2recon,
                    ],
                    &image_dir.join(format!("train_{:08}.png", iterations + 1)),
                )?;
            }

            if config.snapshot_save_iter > 0 && (iterations + 1) % config.snapshot_save_iter == 0 {
                trainer.save(&checkpoint_dir, iterations)?;
            }
            iterations += 1;
        }
    }

    if iterations > 0 {
        trainer.save(&checkpoint_dir, iterations - 1)?;
    }
    Ok(())
}

/// Class centers of the identity features `f` over the whole dataset.
fn compute_centers<B, C>(
    trainer: &Trainer<C>,
    loader: &Arc<dyn DataLoader<B::InnerBackend, ReidBatch<B::InnerBackend>>>,
    num_classes: usize,
) -> Result<Tensor<B::InnerBackend, 2>>
where
    B: AutodiffBackend,
    C: TrainerComponents<Backend = B>,
{
    let mut features = Vec::new();
    let mut labels = Vec::new();
    for batch in loader.iter() {
        features.push(trainer.identity_features(batch.images)?);
        labels.push(batch.labels);
    }
    Ok(class_centers(
        Tensor::cat(features, 0),
        Tensor::cat(labels, 0),
        num_classes,
    ))
}
