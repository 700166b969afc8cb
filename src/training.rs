use crate::error::TrainerError;
use crate::memory::{MemoryBank, MemoryConfig};
use crate::model::{
    cross_entropy_one_hot, l2_normalize, recon_criterion, AdaInGenerator, AdversarialCritic,
    IdNet, IdentityExtractor, IdentityMode, ModelConfig, MultiScaleDiscriminator,
    StructureGenerator,
};
use crate::utils::index_tensor;
use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Beta, Distribution as _};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// How the learning rate of each optimizer evolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrPolicy {
    /// No scheduler; the base rate is kept forever.
    Constant,
    /// Multiply by `gamma` every `step_size` scheduler steps.
    Step,
}

/// Optimizer settings and loss weights.
#[derive(Config, Debug)]
pub struct Hyperparameters {
    #[config(default = 1e-4)]
    pub lr_g: f64,
    #[config(default = 1e-4)]
    pub lr_d: f64,
    #[config(default = 3.5e-4)]
    pub lr_id: f64,
    #[config(default = 0.0)]
    pub beta1: f64,
    #[config(default = 0.999)]
    pub beta2: f64,
    #[config(default = 5e-4)]
    pub weight_decay: f64,
    /// Identity optimizer (SGD, Nesterov) momentum.
    #[config(default = 0.9)]
    pub id_momentum: f64,
    #[config(default = 0.05)]
    pub temperature: f64,
    /// Memory bank blend factor for the stored row.
    #[config(default = 0.2)]
    pub momentum: f64,
    /// Negatives per memory update (`K`).
    #[config(default = 4096)]
    pub k: usize,
    #[config(default = "LrPolicy::Step")]
    pub lr_policy: LrPolicy,
    #[config(default = 20000)]
    pub step_size: usize,
    #[config(default = 0.1)]
    pub gamma: f64,
    /// Decay factor of the identity schedule.
    #[config(default = 0.1)]
    pub gamma2: f64,
    #[config(default = 0.6)]
    pub mixup_alpha: f64,
    #[config(default = 1.0)]
    pub gan_w: f64,
    #[config(default = 5.0)]
    pub recon_x_w: f64,
    #[config(default = 1.0)]
    pub recon_f_w: f64,
    #[config(default = 2.0)]
    pub recon_x_cyc_w: f64,
    #[config(default = 1.0)]
    pub id_w: f64,
    #[config(default = 0.5)]
    pub memory_id_w: f64,
}

impl Hyperparameters {
    pub fn gen_optimizer(&self) -> AdamConfig {
        self.adam()
    }

    pub fn dis_optimizer(&self) -> AdamConfig {
        self.adam()
    }

    pub fn id_optimizer(&self) -> SgdConfig {
        SgdConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay as f32)))
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(self.id_momentum)
                    .with_dampening(0.0)
                    .with_nesterov(true),
            ))
    }

    pub fn memory_config(&self, num_samples: usize, num_features: usize) -> MemoryConfig {
        MemoryConfig::new(num_samples, num_features)
            .with_temperature(self.temperature)
            .with_momentum(self.momentum)
            .with_k(self.k)
    }

    fn adam(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(self.beta1 as f32)
            .with_beta_2(self.beta2 as f32)
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay as f32)))
    }

    fn scheduler(&self, base_lr: f64, gamma: f64, iteration: usize) -> Option<StepLrScheduler> {
        match self.lr_policy {
            LrPolicy::Constant => None,
            LrPolicy::Step => Some(StepLrScheduler::new(base_lr, self.step_size, gamma, iteration)),
        }
    }
}

/// Step decay anchored at an iteration count.
#[derive(Clone, Debug)]
pub struct StepLrScheduler {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    iteration: usize,
}

#[derive(Record, Clone)]
pub struct StepLrRecord {
    iteration: usize,
}

impl StepLrScheduler {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64, iteration: usize) -> Self {
        Self {
            base_lr,
            step_size,
            gamma,
            iteration,
        }
    }

    pub fn current_lr(&self) -> f64 {
        if self.step_size == 0 {
            return self.base_lr;
        }
        self.base_lr * self.gamma.powi((self.iteration / self.step_size) as i32)
    }
}

impl LrScheduler for StepLrScheduler {
    type Record<B: Backend> = StepLrRecord;

    fn step(&mut self) -> f64 {
        self.iteration += 1;
        self.current_lr()
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        StepLrRecord {
            iteration: self.iteration,
        }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.iteration = record.iteration;
        self
    }
}

/// The types a [`Trainer`] coordinates.
pub trait TrainerComponents {
    type Backend: AutodiffBackend;
    type Generator: AutodiffModule<
            Self::Backend,
            InnerModule: StructureGenerator<InnerBackend<Self>>,
        > + StructureGenerator<Self::Backend>;
    type Discriminator: AutodiffModule<Self::Backend> + AdversarialCritic<Self::Backend>;
    type IdNet: AutodiffModule<Self::Backend, InnerModule: IdentityExtractor<InnerBackend<Self>>>
        + IdentityExtractor<Self::Backend>;
    type GenOptimizer: Optimizer<Self::Generator, Self::Backend> + Clone;
    type DisOptimizer: Optimizer<Self::Discriminator, Self::Backend> + Clone;
    type IdOptimizer: Optimizer<Self::IdNet, Self::Backend> + Clone;
}

pub type InnerBackend<C> = <<C as TrainerComponents>::Backend as AutodiffBackend>::InnerBackend;

/// Plain type-level bundle implementing [`TrainerComponents`].
pub struct TrainerComponentsMarker<B, G, D, I, OG, OD, OI> {
    _phantom: PhantomData<(B, G, D, I, OG, OD, OI)>,
}

impl<B, G, D, I, OG, OD, OI> TrainerComponents for TrainerComponentsMarker<B, G, D, I, OG, OD, OI>
where
    B: AutodiffBackend,
    G: AutodiffModule<B, InnerModule: StructureGenerator<B::InnerBackend>> + StructureGenerator<B>,
    D: AutodiffModule<B> + AdversarialCritic<B>,
    I: AutodiffModule<B, InnerModule: IdentityExtractor<B::InnerBackend>> + IdentityExtractor<B>,
    OG: Optimizer<G, B> + Clone,
    OD: Optimizer<D, B> + Clone,
    OI: Optimizer<I, B> + Clone,
{
    type Backend = B;
    type Generator = G;
    type Discriminator = D;
    type IdNet = I;
    type GenOptimizer = OG;
    type DisOptimizer = OD;
    type IdOptimizer = OI;
}

/// Components built by [`init_trainer`].
pub type DefaultComponents<B, OG, OD, OI> = TrainerComponentsMarker<
    B,
    AdaInGenerator<B>,
    MultiScaleDiscriminator<B>,
    IdNet<B>,
    OG,
    OD,
    OI,
>;

/// Identity mixing drawn once per forward pass.
#[derive(Clone, Debug)]
pub struct Mixup {
    /// Weight of the original sample, always in `[0.5, 1]`.
    pub lambda: f64,
    pub permutation: Vec<usize>,
}

/// Fold a Beta draw so the original identity dominates the blend.
pub fn fold_mix_lambda(lambda: f64) -> f64 {
    lambda.max(1.0 - lambda)
}

impl Mixup {
    pub fn sample<R: Rng>(rng: &mut R, beta: &Beta<f64>, batch_size: usize) -> Self {
        let lambda = fold_mix_lambda(beta.sample(rng));
        let mut permutation: Vec<usize> = (0..batch_size).collect();
        permutation.shuffle(rng);
        Self {
            lambda,
            permutation,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.permutation.iter().enumerate().all(|(idx, &p)| idx == p)
    }

    /// `lambda * x + (1 - lambda) * x[permutation]`, row-wise.
    pub fn mix<B: Backend>(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = x.device();
        let partner = x.clone().select(0, index_tensor(&self.permutation, &device));
        x.mul_scalar(self.lambda)
            .add(partner.mul_scalar(1.0 - self.lambda))
    }

    /// Soft targets: the same blend applied to one-hot labels.
    pub fn mix_labels<B: Backend>(&self, labels: Tensor<B, 1, Int>, num_classes: usize) -> Tensor<B, 2> {
        self.mix(labels.one_hot::<2>(num_classes).float())
    }
}

/// Every intermediate of one training forward pass.
#[derive(Clone, Debug)]
pub struct ForwardOutput<B: Backend> {
    pub x_recon: Tensor<B, 4>,
    pub x_nv: Tensor<B, 4>,
    pub x_nv2recon: Tensor<B, 4>,
    pub x_mix: Tensor<B, 4>,
    pub feat: Tensor<B, 2>,
    pub feat_recon: Tensor<B, 2>,
    pub feat_nv: Tensor<B, 2>,
    pub feat_nv2recon: Tensor<B, 2>,
    pub feat_recon_mix: Tensor<B, 2>,
    pub mixed_feat: Tensor<B, 2>,
    pub f: Tensor<B, 2>,
    pub f_recon: Tensor<B, 2>,
    pub f_nv: Tensor<B, 2>,
    pub f_nv2recon: Tensor<B, 2>,
    pub f_mix: Tensor<B, 2>,
    pub mixed_target: Option<Tensor<B, 2>>,
    pub mixup: Mixup,
}

/// Inference-only syntheses.
#[derive(Clone, Debug)]
pub struct SampleOutput<B: Backend> {
    pub x_recon: Tensor<B, 4>,
    pub x_nv: Tensor<B, 4>,
    pub x_nv2recon: Tensor<B, 4>,
}

/// Unweighted generator-side loss terms and the weighted total.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GenLosses {
    pub adv_recon: f64,
    pub adv_nv: f64,
    pub adv_nv2recon: f64,
    pub adv_mix: f64,
    pub recon_x: f64,
    pub recon_f: f64,
    pub nv2recon_f: f64,
    pub cycrecon_x: f64,
    pub id: f64,
    pub memory_id: f64,
    pub total: f64,
}

/// Unweighted discriminator loss terms and the weighted total.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DisLosses {
    pub recon: f64,
    pub nv: f64,
    pub nv2recon: f64,
    pub mix: f64,
    pub total: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LearningRates {
    pub gen: f64,
    pub dis: f64,
    pub id: f64,
}

/// Construction-time settings that are not hyperparameters.
#[derive(Clone, Debug)]
pub struct TrainerOptions {
    /// Rows of the memory bank: the size of the dataset index space.
    pub num_samples: usize,
    /// Width of the identity feature vector `f`.
    pub num_features: usize,
    /// Keep the identity network fixed: no gradients, no optimizer steps.
    pub idnet_freeze: bool,
    pub seed: u64,
}

/// Coordinates generator, discriminator, identity network and memory bank.
pub struct Trainer<C: TrainerComponents> {
    pub(crate) gen: C::Generator,
    pub(crate) dis: C::Discriminator,
    pub(crate) id_net: C::IdNet,
    pub(crate) gen_opt: C::GenOptimizer,
    pub(crate) dis_opt: C::DisOptimizer,
    pub(crate) id_opt: C::IdOptimizer,
    memory: MemoryBank<InnerBackend<C>>,
    gen_scheduler: Option<StepLrScheduler>,
    dis_scheduler: Option<StepLrScheduler>,
    id_scheduler: Option<StepLrScheduler>,
    hyper: Hyperparameters,
    idnet_freeze: bool,
    mix_beta: Beta<f64>,
    rng: StdRng,
    pub(crate) device: <C::Backend as Backend>::Device,
}

impl<B, C> Trainer<C>
where
    B: AutodiffBackend,
    C: TrainerComponents<Backend = B>,
{
    /// Assemble a trainer. Order: networks, optimizers, memory bank, schedulers.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gen: C::Generator,
        dis: C::Discriminator,
        id_net: C::IdNet,
        gen_opt: C::GenOptimizer,
        dis_opt: C::DisOptimizer,
        id_opt: C::IdOptimizer,
        hyper: Hyperparameters,
        options: TrainerOptions,
        device: &B::Device,
    ) -> Result<Self> {
        let id_net = if options.idnet_freeze {
            id_net.no_grad()
        } else {
            id_net
        };
        let memory = hyper
            .memory_config(options.num_samples, options.num_features)
            .with_seed(options.seed)
            .init(device);
        let mix_beta = Beta::new(hyper.mixup_alpha, hyper.mixup_alpha)
            .context("invalid mixup_alpha")?;

        let mut trainer = Self {
            gen,
            dis,
            id_net,
            gen_opt,
            dis_opt,
            id_opt,
            memory,
            gen_scheduler: None,
            dis_scheduler: None,
            id_scheduler: None,
            hyper,
            idnet_freeze: options.idnet_freeze,
            mix_beta,
            rng: StdRng::seed_from_u64(options.seed),
            device: device.clone(),
        };
        trainer.reset_schedulers(0);
        Ok(trainer)
    }

    pub fn generator(&self) -> &C::Generator {
        &self.gen
    }

    pub fn discriminator(&self) -> &C::Discriminator {
        &self.dis
    }

    pub fn id_net(&self) -> &C::IdNet {
        &self.id_net
    }

    pub fn memory(&self) -> &MemoryBank<B::InnerBackend> {
        &self.memory
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    pub fn is_id_frozen(&self) -> bool {
        self.idnet_freeze
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Mode used for every identity extraction during training.
    pub fn identity_mode(&self) -> IdentityMode {
        if self.idnet_freeze {
            IdentityMode::Fix
        } else {
            IdentityMode::Train
        }
    }

    pub fn learning_rates(&self) -> LearningRates {
        LearningRates {
            gen: current_lr(&self.gen_scheduler, self.hyper.lr_g),
            dis: current_lr(&self.dis_scheduler, self.hyper.lr_d),
            id: current_lr(&self.id_scheduler, self.hyper.lr_id),
        }
    }

    /// Rebuild all schedulers as if `iteration` steps had already been taken.
    pub(crate) fn reset_schedulers(&mut self, iteration: usize) {
        let hp = &self.hyper;
        self.dis_scheduler = hp.scheduler(hp.lr_d, hp.gamma, iteration);
        self.gen_scheduler = hp.scheduler(hp.lr_g, hp.gamma, iteration);
        self.id_scheduler = hp.scheduler(hp.lr_id, hp.gamma2, iteration);
    }

    fn identify(&self, images: Tensor<B, 4>, mode: IdentityMode) -> Result<(Tensor<B, 2>, Tensor<B, 2>)> {
        let out = self.id_net.extract(images, mode);
        let logits = out.logits.ok_or(TrainerError::MissingLogits(mode))?;
        Ok((out.feat, logits))
    }

    /// Build every intermediate used by `gen_update` and `dis_update`.
    ///
    /// Mixed labels are produced only when both `labels` and `label_count`
    /// are given.
    pub fn forward(
        &mut self,
        x_img: Tensor<B, 4>,
        x_mesh: Tensor<B, 4>,
        x_mesh_nv: Tensor<B, 4>,
        labels: Option<Tensor<B, 1, Int>>,
        label_count: Option<usize>,
    ) -> Result<ForwardOutput<B>> {
        let mode = self.identity_mode();

        let s_org = self.gen.encode(x_mesh);
        let s_nv = self.gen.encode(x_mesh_nv);
        let (feat, f) = self.identify(x_img, mode)?;

        let x_recon = self.gen.decode(s_org.clone(), feat.clone());
        let x_nv = self.gen.decode(s_nv, feat.clone());

        let (feat_recon, f_recon) = self.identify(x_recon.clone(), mode)?;
        let (feat_nv, f_nv) = self.identify(x_nv.clone(), mode)?;

        let mixup = Mixup::sample(&mut self.rng, &self.mix_beta, feat.dims()[0]);
        let mixed_target = match (labels, label_count) {
            (Some(labels), Some(num_classes)) => Some(mixup.mix_labels(labels, num_classes)),
            _ => None,
        };
        let mixed_feat = mixup.mix(feat.clone());
        let x_mix = self.gen.decode(s_org.clone(), mixed_feat.clone());
        let (feat_recon_mix, f_mix) = self.identify(x_mix.clone(), mode)?;

        let x_nv2recon = self.gen.decode(s_org, feat_nv.clone());
        let (feat_nv2recon, f_nv2recon) = self.identify(x_nv2recon.clone(), mode)?;

        Ok(ForwardOutput {
            x_recon,
            x_nv,
            x_nv2recon,
            x_mix,
            feat,
            feat_recon,
            feat_nv,
            feat_nv2recon,
            feat_recon_mix,
            mixed_feat,
            f,
            f_recon,
            f_nv,
            f_nv2recon,
            f_mix,
            mixed_target,
            mixup,
        })
    }

    /// One optimization step of the generator and (unless frozen) the
    /// identity network. Updates the memory rows of `indices`.
    pub fn gen_update(
        &mut self,
        out: &ForwardOutput<B>,
        x: Tensor<B, 4>,
        labels: Tensor<B, 1, Int>,
        indices: &[usize],
        iterations: usize,
        centers: Tensor<B, 2>,
    ) -> GenLosses {
        let hp = self.hyper.clone();
        let lrs = self.learning_rates();
        let device = x.device();

        let recon_x = recon_criterion(out.x_recon.clone(), x.clone());
        let cycrecon_x = recon_criterion(out.x_nv2recon.clone(), x);
        let recon_f = recon_criterion(out.feat_recon.clone(), out.feat.clone());
        let nv2recon_f = recon_criterion(out.feat_nv2recon.clone(), out.feat.clone());

        let (loss_id, memory_id) = if self.idnet_freeze {
            (
                Tensor::<B, 1>::zeros([1], &device),
                Tensor::<B, 1>::zeros([1], &device),
            )
        } else {
            let centers = centers.transpose();
            let prob = out.f.clone().matmul(centers.clone());
            let mut loss_id = CrossEntropyLossConfig::new()
                .init(&device)
                .forward(prob, labels);
            if let Some(target) = &out.mixed_target {
                let prob_mix = out.f_mix.clone().matmul(centers);
                loss_id = loss_id.add(cross_entropy_one_hot(prob_mix, target.clone()));
            }
            let memory_id = self.memory.update(
                l2_normalize(out.f.clone()),
                l2_normalize(out.f_nv.clone()),
                indices,
            );
            (loss_id, memory_id)
        };

        let adv_recon = self.dis.calc_gen_loss(out.x_recon.clone());
        let adv_nv = self.dis.calc_gen_loss(out.x_nv.clone());
        let adv_nv2recon = self.dis.calc_gen_loss(out.x_nv2recon.clone());
        let adv_mix = self.dis.calc_gen_loss(out.x_mix.clone());

        let total = adv_recon
            .clone()
            .add(adv_nv.clone())
            .add(adv_nv2recon.clone())
            .add(adv_mix.clone())
            .mul_scalar(hp.gan_w)
            .add(recon_x.clone().mul_scalar(hp.recon_x_w))
            .add(recon_f.clone().add(nv2recon_f.clone()).mul_scalar(hp.recon_f_w))
            .add(cycrecon_x.clone().mul_scalar(hp.recon_x_cyc_w))
            .add(loss_id.clone().mul_scalar(hp.id_w))
            .add(memory_id.clone().mul_scalar(hp.memory_id_w));

        let losses = GenLosses {
            adv_recon: scalar(&adv_recon),
            adv_nv: scalar(&adv_nv),
            adv_nv2recon: scalar(&adv_nv2recon),
            adv_mix: scalar(&adv_mix),
            recon_x: scalar(&recon_x),
            recon_f: scalar(&recon_f),
            nv2recon_f: scalar(&nv2recon_f),
            cycrecon_x: scalar(&cycrecon_x),
            id: scalar(&loss_id),
            memory_id: scalar(&memory_id),
            total: scalar(&total),
        };

        let mut grads = total.backward();
        let gen_grads = GradientsParams::from_module(&mut grads, &self.gen);
        self.gen = self.gen_opt.step(lrs.gen, self.gen.clone(), gen_grads);

        if !self.idnet_freeze {
            let id_grads = GradientsParams::from_module(&mut grads, &self.id_net);
            self.id_net = self.id_opt.step(lrs.id, self.id_net.clone(), id_grads);
            if iterations % 10 == 0 {
                info!(
                    "LR_id:{}\tL_memory_id:{:.3}",
                    lrs.id,
                    hp.memory_id_w * losses.memory_id
                );
            }
        }
        debug!("iteration {iterations} generator losses: {losses:?}");

        losses
    }

    /// Weighted discriminator objective over detached syntheses.
    pub fn dis_objective(&self, x: Tensor<B, 4>, out: &ForwardOutput<B>) -> (Tensor<B, 1>, DisLosses) {
        let (recon, _) = self.dis.calc_dis_loss(out.x_recon.clone().detach(), x.clone());
        let (nv, _) = self.dis.calc_dis_loss(out.x_nv.clone().detach(), x.clone());
        let (nv2recon, _) = self.dis.calc_dis_loss(out.x_nv2recon.clone().detach(), x.clone());
        let (mix, _) = self.dis.calc_dis_loss(out.x_mix.clone().detach(), x);

        let total = recon
            .clone()
            .add(nv2recon.clone())
            .add(nv.clone())
            .add(mix.clone())
            .mul_scalar(self.hyper.gan_w);

        let losses = DisLosses {
            recon: scalar(&recon),
            nv: scalar(&nv),
            nv2recon: scalar(&nv2recon),
            mix: scalar(&mix),
            total: scalar(&total),
        };
        (total, losses)
    }

    /// One optimization step of the discriminator.
    pub fn dis_update(&mut self, x: Tensor<B, 4>, out: &ForwardOutput<B>) -> DisLosses {
        let lr = self.learning_rates().dis;
        let (total, losses) = self.dis_objective(x, out);

        let mut grads = total.backward();
        let dis_grads = GradientsParams::from_module(&mut grads, &self.dis);
        self.dis = self.dis_opt.step(lr, self.dis.clone(), dis_grads);

        losses
    }

    /// Advance the discriminator, generator and identity schedulers once.
    pub fn update_learning_rate(&mut self) {
        for scheduler in [
            &mut self.dis_scheduler,
            &mut self.gen_scheduler,
            &mut self.id_scheduler,
        ]
        .into_iter()
        .flatten()
        {
            scheduler.step();
        }
    }

    /// Reconstruction, novel-structure and cycle images on the inference view.
    pub fn sample(
        &self,
        x_img: Tensor<B::InnerBackend, 4>,
        x_mesh: Tensor<B::InnerBackend, 4>,
        x_mesh_nv: Tensor<B::InnerBackend, 4>,
    ) -> SampleOutput<B::InnerBackend> {
        let gen = self.gen.valid();
        let id_net = self.id_net.valid();

        let s_org = gen.encode(x_mesh);
        let s_nv = gen.encode(x_mesh_nv);
        let feat = id_net.extract(x_img, IdentityMode::Display).feat;

        let x_recon = gen.decode(s_org.clone(), feat.clone());
        let x_nv = gen.decode(s_nv, feat);

        let feat_nv = id_net.extract(x_nv.clone(), IdentityMode::Display).feat;
        let x_nv2recon = gen.decode(s_org, feat_nv);

        SampleOutput {
            x_recon,
            x_nv,
            x_nv2recon,
        }
    }

    pub fn sample_recon(
        &self,
        x_img: Tensor<B::InnerBackend, 4>,
        x_mesh: Tensor<B::InnerBackend, 4>,
    ) -> Tensor<B::InnerBackend, 4> {
        let gen = self.gen.valid();
        let feat = self.id_net.valid().extract(x_img, IdentityMode::Display).feat;
        gen.decode(gen.encode(x_mesh), feat)
    }

    pub fn sample_nv(
        &self,
        x_img: Tensor<B::InnerBackend, 4>,
        x_mesh_nv: Tensor<B::InnerBackend, 4>,
    ) -> Tensor<B::InnerBackend, 4> {
        let gen = self.gen.valid();
        let feat = self.id_net.valid().extract(x_img, IdentityMode::Display).feat;
        gen.decode(gen.encode(x_mesh_nv), feat)
    }

    /// Identity feature vectors `f` on the inference view, used to derive
    /// class centers.
    pub fn identity_features(&self, images: Tensor<B::InnerBackend, 4>) -> Result<Tensor<B::InnerBackend, 2>> {
        let out = self.id_net.valid().extract(images, IdentityMode::Fix);
        out.logits
            .ok_or_else(|| TrainerError::MissingLogits(IdentityMode::Fix).into())
    }
}

fn current_lr(scheduler: &Option<StepLrScheduler>, base_lr: f64) -> f64 {
    scheduler
        .as_ref()
        .map_or(base_lr, StepLrScheduler::current_lr)
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem::<f64>()
}

/// Build the reference networks and their optimizers, then the trainer.
pub fn init_trainer<B: AutodiffBackend>(
    model: &ModelConfig,
    hyper: Hyperparameters,
    options: TrainerOptions,
    device: &B::Device,
) -> Result<
    Trainer<
        impl TrainerComponents<
            Backend = B,
            Generator = AdaInGenerator<B>,
            Discriminator = MultiScaleDiscriminator<B>,
            IdNet = IdNet<B>,
        >,
    >,
> {
    let gen = model.init_generator::<B>(device);
    let dis = model.init_discriminator::<B>(device);
    let id_net = model.init_id_net::<B>(device);

    let gen_opt = hyper.gen_optimizer().init::<B, AdaInGenerator<B>>();
    let dis_opt = hyper.dis_optimizer().init::<B, MultiScaleDiscriminator<B>>();
    let id_opt = hyper.id_optimizer().init::<B, IdNet<B>>();

    assemble(gen, dis, id_net, gen_opt, dis_opt, id_opt, hyper, options, device)
}

#[allow(clippy::too_many_arguments)]
fn assemble<B, OG, OD, OI>(
    gen: AdaInGenerator<B>,
    dis: MultiScaleDiscriminator<B>,
    id_net: IdNet<B>,
    gen_opt: OG,
    dis_opt: OD,
    id_opt: OI,
    hyper: Hyperparameters,
    options: TrainerOptions,
    device: &B::Device,
) -> Result<Trainer<DefaultComponents<B, OG, OD, OI>>>
where
    B: AutodiffBackend,
    OG: Optimizer<AdaInGenerator<B>, B> + Clone,
    OD: Optimizer<MultiScaleDiscriminator<B>, B> + Clone,
    OI: Optimizer<IdNet<B>, B> + Clone,
{
    Trainer::<DefaultComponents<B, OG, OD, OI>>::new(
        gen, dis, id_net, gen_opt, dis_opt, id_opt, hyper, options, device,
    )
}

/// Full training run configuration loaded from JSON.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub hyper: Hyperparameters,
    /// Appearance images, named `<pid>_<anything>.<ext>`.
    pub image_dir: String,
    /// Structure images with the same file names as `image_dir`.
    pub structure_dir: String,
    #[config(default = 128)]
    pub image_height: usize,
    #[config(default = 64)]
    pub image_width: usize,
    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 10000)]
    pub snapshot_save_iter: usize,
    #[config(default = 1000)]
    pub image_save_iter: usize,
    #[config(default = false)]
    pub idnet_freeze: bool,
    #[config(default = false)]
    pub resume: bool,
    #[config(default = 42)]
    pub seed: u64,
}
