//! Snapshot files written next to each other in one directory:
//! `gen_<k>.mpk`, `dis_<k>.mpk`, `id_<k>.mpk`, `optimizer.mpk` and
//! `state.json`, where `k` is the 1-based iteration padded to 8 digits.

use crate::error::TrainerError;
use crate::training::{Trainer, TrainerComponents};
use anyhow::{Context, Result};
use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const GEN_PREFIX: &str = "gen";
pub const DIS_PREFIX: &str = "dis";
pub const ID_PREFIX: &str = "id";
const OPTIMIZER_FILE: &str = "optimizer.mpk";
const STATE_FILE: &str = "state.json";

/// Metadata stored alongside the network records.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SnapshotState {
    pub iteration: usize,
}

type OptimizerRecord<C> = (
    <<C as TrainerComponents>::GenOptimizer as Optimizer<
        <C as TrainerComponents>::Generator,
        <C as TrainerComponents>::Backend,
    >>::Record,
    <<C as TrainerComponents>::DisOptimizer as Optimizer<
        <C as TrainerComponents>::Discriminator,
        <C as TrainerComponents>::Backend,
    >>::Record,
    <<C as TrainerComponents>::IdOptimizer as Optimizer<
        <C as TrainerComponents>::IdNet,
        <C as TrainerComponents>::Backend,
    >>::Record,
);

/// File name of a network snapshot taken after `iterations` completed steps.
pub fn snapshot_name(prefix: &str, iterations: usize) -> String {
    format!("{prefix}_{:08}.mpk", iterations + 1)
}

/// Newest `<prefix>_*.mpk` file in `dir`.
pub fn latest_checkpoint(dir: &Path, prefix: &str) -> Result<PathBuf> {
    let dir_str = dir
        .to_str()
        .with_context(|| format!("non UTF-8 checkpoint dir {}", dir.display()))?;
    let pattern = format!("{}/{prefix}_*.mpk", glob::Pattern::escape(dir_str));

    let mut paths: Vec<PathBuf> = glob::glob(&pattern)
        .context("invalid checkpoint pattern")?
        .filter_map(|entry| entry.ok())
        .collect();
    paths.sort();

    paths.pop().ok_or_else(|| {
        TrainerError::MissingCheckpoint {
            prefix: prefix.to_string(),
            dir: dir.to_path_buf(),
        }
        .into()
    })
}

/// Iteration encoded in a snapshot file name such as `gen_00000042.mpk`.
pub fn iteration_from_path(path: &Path) -> Result<usize> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.rsplit_once('_'))
        .and_then(|(_, digits)| digits.parse::<usize>().ok())
        .ok_or_else(|| TrainerError::BadCheckpointName(path.to_path_buf()).into())
}

pub fn read_snapshot_state(dir: &Path) -> Option<SnapshotState> {
    let contents = std::fs::read_to_string(dir.join(STATE_FILE)).ok()?;
    serde_json::from_str(&contents).ok()
}

fn write_snapshot_state(dir: &Path, state: &SnapshotState) -> Result<()> {
    let state_json =
        serde_json::to_string_pretty(state).context("failed to serialize snapshot state")?;
    let path = dir.join(STATE_FILE);
    std::fs::write(&path, state_json)
        .with_context(|| format!("failed to write {}", path.display()))
}

impl<B, C> Trainer<C>
where
    B: AutodiffBackend,
    C: TrainerComponents<Backend = B>,
{
    /// Write all three networks, the optimizer states and the iteration.
    pub fn save(&self, dir: &Path, iterations: usize) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let recorder = CompactRecorder::new();

        self.gen
            .clone()
            .save_file(dir.join(snapshot_name(GEN_PREFIX, iterations)), &recorder)
            .context("failed to save generator")?;
        self.dis
            .clone()
            .save_file(dir.join(snapshot_name(DIS_PREFIX, iterations)), &recorder)
            .context("failed to save discriminator")?;
        self.id_net
            .clone()
            .save_file(dir.join(snapshot_name(ID_PREFIX, iterations)), &recorder)
            .context("failed to save identity network")?;

        let optimizers: OptimizerRecord<C> = (
            self.gen_opt.to_record(),
            self.dis_opt.to_record(),
            self.id_opt.to_record(),
        );
        Recorder::<B>::record(&recorder, optimizers, dir.join(OPTIMIZER_FILE))
            .context("failed to save optimizer state")?;

        write_snapshot_state(
            dir,
            &SnapshotState {
                iteration: iterations + 1,
            },
        )?;
        info!("saved snapshot {} to {}", iterations + 1, dir.display());
        Ok(())
    }

    /// Load the newest snapshot in `dir` and return its iteration.
    ///
    /// Network records must exist. Optimizer state is restored when it can
    /// be read; otherwise the optimizers start fresh.
    pub fn resume(&mut self, dir: &Path) -> Result<usize> {
        let recorder = CompactRecorder::new();

        let gen_path = latest_checkpoint(dir, GEN_PREFIX)?;
        self.gen = self
            .gen
            .clone()
            .load_file(gen_path.clone(), &recorder, &self.device)
            .with_context(|| format!("failed to load {}", gen_path.display()))?;

        let dis_path = latest_checkpoint(dir, DIS_PREFIX)?;
        self.dis = self
            .dis
            .clone()
            .load_file(dis_path.clone(), &recorder, &self.device)
            .with_context(|| format!("failed to load {}", dis_path.display()))?;

        let id_path = latest_checkpoint(dir, ID_PREFIX)?;
        let id_net = self
            .id_net
            .clone()
            .load_file(id_path.clone(), &recorder, &self.device)
            .with_context(|| format!("failed to load {}", id_path.display()))?;
        self.id_net = if self.is_id_frozen() {
            id_net.no_grad()
        } else {
            id_net
        };

        let iteration = match read_snapshot_state(dir) {
            Some(state) => state.iteration,
            None => iteration_from_path(&gen_path)?,
        };

        match Recorder::<B>::load::<OptimizerRecord<C>>(&recorder, dir.join(OPTIMIZER_FILE), &self.device) {
            Ok((gen, dis, id)) => {
                self.gen_opt = self.gen_opt.clone().load_record(gen);
                self.dis_opt = self.dis_opt.clone().load_record(dis);
                self.id_opt = self.id_opt.clone().load_record(id);
            }
            Err(err) => warn!("optimizer state not restored, starting fresh: {err}"),
        }

        self.reset_schedulers(iteration);
        info!("resumed from iteration {iteration}");
        Ok(iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::init_trainer;
    use crate::training::tests::{batch, options, tiny_hyper, tiny_model, Batch, TestBackend};
    use burn::backend::NdArray;
    use burn::prelude::*;
    use burn::tensor::Distribution;

    fn values(tensor: Tensor<NdArray<f32>, 4>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    fn recon_values(trainer: &Trainer<impl TrainerComponents<Backend = TestBackend>>, batch: &Batch) -> Vec<f32> {
        values(trainer.sample_recon(batch.x_img.clone().inner(), batch.x_mesh.clone().inner()))
    }

    #[test]
    fn snapshot_names_encode_next_iteration() {
        assert_eq!(snapshot_name(GEN_PREFIX, 0), "gen_00000001.mpk");
        assert_eq!(snapshot_name(ID_PREFIX, 41), "id_00000042.mpk");
    }

    #[test]
    fn iteration_is_parsed_from_file_name() {
        assert_eq!(
            iteration_from_path(Path::new("/tmp/run/dis_00001000.mpk")).unwrap(),
            1000
        );
        assert!(iteration_from_path(Path::new("/tmp/run/dis_latest.mpk")).is_err());
    }

    #[test]
    fn latest_checkpoint_picks_highest_iteration() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["gen_00000002.mpk", "gen_00000010.mpk", "dis_00000099.mpk"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let latest = latest_checkpoint(dir.path(), GEN_PREFIX).unwrap();

        assert_eq!(latest.file_name().unwrap(), "gen_00000010.mpk");
        assert!(latest_checkpoint(dir.path(), ID_PREFIX).is_err());
    }

    #[test]
    fn save_then_resume_restores_networks_and_iteration() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let batch = batch();
        let mut trainer =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(false), &device).unwrap();
        let out = trainer
            .forward(
                batch.x_img.clone(),
                batch.x_mesh.clone(),
                batch.x_mesh_nv.clone(),
                Some(batch.labels.clone()),
                Some(3),
            )
            .unwrap();
        let centers = Tensor::<TestBackend, 2>::random([3, 6], Distribution::Normal(0.0, 1.0), &device);
        trainer.gen_update(&out, batch.x_img.clone(), batch.labels.clone(), &batch.indices, 0, centers);
        trainer.dis_update(batch.x_img.clone(), &out);

        trainer.save(dir.path(), 6).unwrap();

        for name in ["gen_00000007.mpk", "dis_00000007.mpk", "id_00000007.mpk", "optimizer.mpk", "state.json"] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }

        let mut first =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(false), &device).unwrap();
        let fresh = recon_values(&first, &batch);
        let mut second =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(false), &device).unwrap();

        assert_eq!(first.resume(dir.path()).unwrap(), 7);
        assert_eq!(second.resume(dir.path()).unwrap(), 7);
        assert_eq!(recon_values(&first, &batch), recon_values(&second, &batch));
        assert_ne!(recon_values(&first, &batch), fresh);
        assert_eq!(
            values(first.sample_nv(batch.x_img.clone().inner(), batch.x_mesh_nv.clone().inner())),
            values(second.sample_nv(batch.x_img.inner(), batch.x_mesh_nv.inner()))
        );
    }

    #[test]
    fn corrupt_optimizer_state_does_not_fail_resume() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let trainer =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(true), &device).unwrap();
        trainer.save(dir.path(), 2).unwrap();
        std::fs::write(dir.path().join(OPTIMIZER_FILE), b"not a record").unwrap();

        let mut restored =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(true), &device).unwrap();

        assert_eq!(restored.resume(dir.path()).unwrap(), 3);
    }

    #[test]
    fn missing_optimizer_state_does_not_fail_resume() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let trainer =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(false), &device).unwrap();
        trainer.save(dir.path(), 0).unwrap();
        std::fs::remove_file(dir.path().join(OPTIMIZER_FILE)).unwrap();

        let mut restored =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(false), &device).unwrap();

        assert_eq!(restored.resume(dir.path()).unwrap(), 1);
    }

    #[test]
    fn iteration_falls_back_to_file_name_without_state() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let trainer =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(false), &device).unwrap();
        trainer.save(dir.path(), 41).unwrap();
        std::fs::remove_file(dir.path().join(STATE_FILE)).unwrap();

        let mut restored =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(false), &device).unwrap();

        assert_eq!(restored.resume(dir.path()).unwrap(), 42);
    }

    #[test]
    fn resume_rebuilds_schedulers_at_recovered_iteration() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let hyper = || tiny_hyper().with_step_size(2).with_gamma(0.5).with_gamma2(0.1);
        let trainer = init_trainer::<TestBackend>(&tiny_model(), hyper(), options(false), &device).unwrap();
        trainer.save(dir.path(), 3).unwrap();

        let mut restored = init_trainer::<TestBackend>(&tiny_model(), hyper(), options(false), &device).unwrap();
        restored.resume(dir.path()).unwrap();
        let lrs = restored.learning_rates();

        assert!((lrs.gen - 2.5e-3).abs() < 1e-12);
        assert!((lrs.dis - 2.5e-3).abs() < 1e-12);
        assert!((lrs.id - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn resume_without_snapshot_fails() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            init_trainer::<TestBackend>(&tiny_model(), tiny_hyper(), options(false), &device).unwrap();

        let err = trainer.resume(dir.path()).unwrap_err();

        assert!(err.downcast_ref::<TrainerError>().is_some());
    }
}
