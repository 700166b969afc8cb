use crate::model::l2_normalize;
use crate::utils::index_tensor;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;

/// Settings for the momentum memory bank.
#[derive(Config, Debug)]
pub struct MemoryConfig {
    pub num_samples: usize,
    pub num_features: usize,
    #[config(default = 0.05)]
    pub temperature: f64,
    #[config(default = 0.5)]
    pub momentum: f64,
    /// Negatives drawn from the table per update; capped at `num_samples`.
    #[config(default = 4096)]
    pub k: usize,
    #[config(default = 0)]
    pub seed: u64,
}

/// Per-sample table of running identity features.
///
/// The table lives on the inner (non-autodiff) backend: it is read as a
/// constant when building the contrastive loss and written only by the
/// momentum blend, never by an optimizer.
#[derive(Debug)]
pub struct MemoryBank<B: Backend> {
    table: Tensor<B, 2>,
    temperature: f64,
    momentum: f64,
    num_negatives: usize,
    rng: StdRng,
}

impl MemoryConfig {
    /// Allocate a table of random unit rows.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MemoryBank<B> {
        let stdv = 1.0 / (self.num_features as f64 / 3.0).sqrt();
        let table = Tensor::random(
            [self.num_samples, self.num_features],
            Distribution::Uniform(-stdv, stdv),
            device,
        );
        MemoryBank {
            table: l2_normalize(table),
            temperature: self.temperature,
            momentum: self.momentum,
            num_negatives: self.k.min(self.num_samples),
            rng: StdRng::seed_from_u64(self.seed),
        }
    }
}

impl<B: Backend> MemoryBank<B> {
    pub fn num_samples(&self) -> usize {
        self.table.dims()[0]
    }

    pub fn num_features(&self) -> usize {
        self.table.dims()[1]
    }

    pub fn table(&self) -> Tensor<B, 2> {
        self.table.clone()
    }

    /// Stored rows for the given sample indices, in order.
    pub fn rows(&self, indices: &[usize]) -> Tensor<B, 2> {
        let device = self.table.device();
        self.table.clone().select(0, index_tensor(indices, &device))
    }

    /// Contrastive loss of `query` against its stored row and `positive`,
    /// followed by the momentum update of the touched rows.
    ///
    /// Indices must lie in `0..num_samples`.
    pub fn update<AB>(
        &mut self,
        query: Tensor<AB, 2>,
        positive: Tensor<AB, 2>,
        indices: &[usize],
    ) -> Tensor<AB, 1>
    where
        AB: AutodiffBackend<InnerBackend = B>,
    {
        let query = l2_normalize(query);
        let positive = l2_normalize(positive);
        let stored = self.rows(indices);

        let bank_logits = query
            .clone()
            .mul(Tensor::from_inner(stored.clone()))
            .sum_dim(1);
        let positive_logits = query.clone().mul(positive).sum_dim(1);
        let mut columns = vec![bank_logits, positive_logits];
        if self.num_negatives > 0 {
            let negatives = self.sample_negatives();
            columns.push(query.clone().matmul(Tensor::from_inner(negatives).transpose()));
        }

        let logits = Tensor::cat(columns, 1).div_scalar(self.temperature);
        let loss = log_softmax(logits, 1)
            .slice_dim(1, 0..2)
            .mean_dim(1)
            .neg()
            .mean();

        self.momentum_update(stored, query.inner(), indices);
        loss
    }

    /// `row <- normalize(momentum * row + (1 - momentum) * embedding)`.
    ///
    /// When an index repeats within the batch the last occurrence wins.
    fn momentum_update(&mut self, stored: Tensor<B, 2>, embeddings: Tensor<B, 2>, indices: &[usize]) {
        let num_samples = self.num_samples();
        let device = self.table.device();
        let blended = l2_normalize(
            stored
                .mul_scalar(self.momentum)
                .add(embeddings.mul_scalar(1.0 - self.momentum)),
        );

        let mut last_position = BTreeMap::new();
        for (position, &index) in indices.iter().enumerate() {
            debug_assert!(index < num_samples, "memory index {index} out of range");
            last_position.insert(index, position);
        }
        let (unique, positions): (Vec<usize>, Vec<usize>) = last_position.into_iter().unzip();

        let rows = blended.select(0, index_tensor(&positions, &device));
        let scatter = index_tensor::<B>(&unique, &device)
            .one_hot::<2>(num_samples)
            .float();
        let keep = scatter
            .clone()
            .sum_dim(0)
            .transpose()
            .neg()
            .add_scalar(1.0);

        self.table = self
            .table
            .clone()
            .mul(keep)
            .add(scatter.transpose().matmul(rows));
    }

    fn sample_negatives(&mut self) -> Tensor<B, 2> {
        let num_samples = self.num_samples();
        let picks: Vec<usize> = (0..self.num_negatives)
            .map(|_| self.rng.gen_range(0..num_samples))
            .collect();
        self.rows(&picks)
    }
}
