pub mod checkpoint;
pub mod data;
pub mod error;
pub mod memory;
pub mod model;
pub mod training;
pub mod utils;

pub use error::TrainerError;
pub use training::{init_trainer, Hyperparameters, Trainer, TrainerComponents, TrainingConfig};
