use crate::model::IdentityMode;
use std::path::PathBuf;

/// Failures specific to the trainer; everything else travels as `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error("identity extractor returned no logits in {0:?} mode")]
    MissingLogits(IdentityMode),
    #[error("no `{prefix}` checkpoint found in {}", .dir.display())]
    MissingCheckpoint { prefix: String, dir: PathBuf },
    #[error("cannot read an iteration from checkpoint name {}", .0.display())]
    BadCheckpointName(PathBuf),
}
