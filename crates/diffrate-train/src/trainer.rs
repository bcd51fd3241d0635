//! Search loop: controller updates under a frozen backbone.
//!
//! ```text
//! for epoch in start..epochs:
//!     for batch in train subset (sharded by rank):
//!         reference = full backbone (no grad)
//!         output    = backbone with Soft decisions
//!         loss      = task + penalty + similarity
//!         scaler: backward → all-reduce → clip → AdamW (controllers only)
//!     scheduler.step(epoch + 1)
//!     save checkpoint.bin                    (rank 0)
//!     evaluate with Hard decisions (or the fixed schedule)
//!     copy to model_best.bin on a new minimum (rank 0)
//!     append a JSON line to log.txt          (rank 0)
//!     barrier
//! ```

use std::collections::BTreeMap;
use std::time::Instant;
use tch::{Device, Kind, Tensor};
use tracing::{error, info, warn};

use diffrate_core::budget::Schedule;
use diffrate_core::checkpoint::{Checkpoint, CheckpointManager};
use diffrate_core::config::{DiffRateConfig, FinetuneFormat};
use diffrate_core::dataset::{DataLoader, ImageBatch, ImageDataset, ReplacementSampler, UniformSubsetSampler};
use diffrate_core::dist::{DistContext, GradientSync};
use diffrate_core::materialize::Materializer;
use diffrate_core::rate_table::CompressionRateTable;
use diffrate_core::registry::{ModelRegistry, ModelSpec};
use diffrate_core::schedule::CosineScheduler;
use diffrate_core::state_dict::convert_openai_clip;
use diffrate_core::stats::{EpochRecord, MetricLogger};

use crate::controller::DecideMode;
use crate::convert::array_to_tensor;
use crate::error::{TrainError, TrainResult};
use crate::losses::CompressionLoss;
use crate::model::{BudgetSource, DiffRateModel, ModelOutput};
use crate::optim::{ArchAdamW, LossScaler, StepOutcome};
use crate::patch::PatchRegistry;

/// Metric name → epoch average.
pub type EpochStats = BTreeMap<String, f64>;

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitReport {
    /// Epochs run in this invocation.
    pub epochs_run: usize,
    /// Lowest evaluation loss seen, resumed runs included.
    pub min_loss: Option<f64>,
    /// Evaluation metrics of the last epoch (or of the single evaluation).
    pub last_test: EpochStats,
}

/// Owns the model, the controller optimizer and the run bookkeeping.
pub struct Trainer {
    config: DiffRateConfig,
    model: DiffRateModel,
    loss: CompressionLoss,
    optimizer: ArchAdamW,
    scheduler: CosineScheduler,
    scaler: LossScaler,
    checkpoints: CheckpointManager,
    materializer: Materializer,
    fixed: Option<BudgetSource>,
    dist: DistContext,
    sync: Box<dyn GradientSync>,
    start_epoch: usize,
}

impl Trainer {
    /// Build everything `config` describes: model, strategy, fixed schedule,
    /// finetune weights and resumed state.
    ///
    /// # Errors
    ///
    /// Configuration errors (unknown model, unsupported family, invalid
    /// values), a missing rate-table entry in fixed-schedule mode, and any
    /// checkpoint that cannot be read or reconciled.
    pub fn new(
        config: DiffRateConfig,
        registry: &ModelRegistry,
        dist: DistContext,
        sync: Box<dyn GradientSync>,
    ) -> TrainResult<Self> {
        config.validate()?;
        let spec = registry.get(&config.model)?.clone().with_img_size(config.input_size);
        spec.validate()?;
        let patches = PatchRegistry::default();
        let strategy = patches.resolve(spec.family)?;

        let budget = config.global_budget()?;
        let candidates = budget.candidates(spec.num_tokens())?;
        let device = select_device(&config);
        tch::manual_seed((config.seed + dist.rank as u64) as i64);

        let mut model = DiffRateModel::new(&spec, strategy, candidates.clone(), config.num_classes, config.drop_path, device);
        budget.warn_if_infeasible(model.vit.flops_model(), spec.depth, &candidates);
        info!(
            "{} ({}): {} tokens, {} candidates per stage, target {} GFLOPs",
            spec.display_name,
            spec.family.tag(),
            spec.num_tokens(),
            candidates.len(),
            config.target_flops
        );

        if let Some(path) = &config.finetune {
            let checkpoint = Checkpoint::load(path)?;
            let weights = match config.finetune_format {
                FinetuneFormat::Timm => checkpoint.model,
                FinetuneFormat::OpenaiClip => convert_openai_clip(&checkpoint.model)?,
            };
            info!("finetuning from {}", path.display());
            model.load_state_dict(weights)?;
        }

        let fixed = if config.load_compression_rate {
            Some(load_fixed_schedule(&config, &spec)?)
        } else {
            None
        };

        model.freeze_backbone();
        let optimizer = ArchAdamW::new(&model.arch_vs, config.arch_lr, config.opt_betas, config.opt_eps, 0.0);
        let scheduler =
            CosineScheduler::new(config.arch_lr, config.arch_min_lr, config.epochs).with_cycle_decay(config.decay_rate);
        let loss = CompressionLoss::new(&config, strategy.has_task_loss());

        let mut trainer = Trainer {
            checkpoints: CheckpointManager::new(&config.output_dir),
            materializer: Materializer::new(candidates, spec.depth),
            start_epoch: config.start_epoch,
            scaler: LossScaler::new(config.use_amp),
            config,
            model,
            loss,
            optimizer,
            scheduler,
            fixed,
            dist,
            sync,
        };
        trainer.resume()?;
        Ok(trainer)
    }

    fn resume(&mut self) -> TrainResult<()> {
        let Some(path) = self.config.resume_path() else { return Ok(()) };
        let checkpoint = Checkpoint::load(&path)?;
        info!("resuming from {} (epoch {})", path.display(), checkpoint.epoch);
        let report = self.model.load_state_dict(checkpoint.model)?;
        if !report.dropped.is_empty() {
            info!("dropped {} head entries with a different class count", report.dropped.len());
        }
        if self.config.eval {
            return Ok(());
        }
        if let Some(state) = &checkpoint.optimizer {
            self.optimizer.load_state(state)?;
            self.start_epoch = checkpoint.epoch + 1;
        }
        if let Some(state) = checkpoint.scheduler {
            self.scheduler.load_state(state);
            self.optimizer.set_lr(self.scheduler.current_lr());
        }
        if let Some(state) = checkpoint.scaler {
            self.scaler.load_state(state);
        }
        self.checkpoints = CheckpointManager::new(&self.config.output_dir).with_min_loss(checkpoint.min_loss);
        Ok(())
    }

    /// Active configuration.
    pub fn config(&self) -> &DiffRateConfig {
        &self.config
    }

    /// The model under search.
    pub fn model(&self) -> &DiffRateModel {
        &self.model
    }

    /// Backbone spec.
    pub fn spec(&self) -> &ModelSpec {
        self.model.spec()
    }

    /// First epoch [`Trainer::fit`] will run.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// The controller optimizer.
    pub fn optimizer(&self) -> &ArchAdamW {
        &self.optimizer
    }

    /// Budget source used for evaluation.
    pub fn eval_source(&self) -> BudgetSource {
        self.fixed.clone().unwrap_or(BudgetSource::Learned(DecideMode::Hard))
    }

    fn batch_tensors(&self, batch: ImageBatch) -> (Tensor, Tensor) {
        let device = self.model.device();
        let images = array_to_tensor(&batch.images.into_dyn(), device);
        let labels = Tensor::from_slice(&batch.labels).to_device(device);
        (images, labels)
    }

    /// Run the search, or a single evaluation when `eval` is set.
    pub fn fit(&mut self, train: &dyn ImageDataset, val: &dyn ImageDataset) -> TrainResult<FitReport> {
        let val_indices =
            ReplacementSampler::new(val.len(), self.config.test_sampling_rate, self.config.seed)?.indices().to_vec();
        if self.config.eval {
            let test = self.evaluate(val, &val_indices, self.start_epoch)?;
            info!("evaluation on {} samples: loss {:.4}", val_indices.len(), test.get("loss").copied().unwrap_or(f64::NAN));
            return Ok(FitReport { epochs_run: 0, min_loss: self.checkpoints.min_loss(), last_test: test });
        }

        let sampler = UniformSubsetSampler::new(
            train.len(),
            self.config.train_sampling_rate,
            self.dist.rank,
            self.dist.world_size,
            self.config.seed,
        )?;
        info!(
            "searching epochs {}..{} on {} of {} training samples ({})",
            self.start_epoch,
            self.config.epochs,
            sampler.len(),
            train.len(),
            train.name()
        );

        let started = Instant::now();
        let mut report = FitReport::default();
        for epoch in self.start_epoch..self.config.epochs {
            let train_stats = self.train_one_epoch(train, &sampler, epoch)?;
            let lr = self.scheduler.step(epoch + 1);
            self.optimizer.set_lr(lr);

            if self.dist.is_main() {
                self.checkpoints.save_latest(&self.checkpoint(epoch)?)?;
            }
            let test_stats = self.evaluate(val, &val_indices, epoch)?;
            let loss = test_stats.get("loss").copied().unwrap_or(f64::NAN);
            if self.checkpoints.update_best(loss, self.dist.is_main())? {
                info!("epoch {epoch}: new minimum loss {loss:.4}");
            }

            if self.dist.is_main() {
                EpochRecord {
                    epoch,
                    n_parameters: self.model.n_parameters(),
                    train: train_stats,
                    test: test_stats.clone(),
                }
                .append_to(&self.config.log_path())?;
            }
            report.epochs_run += 1;
            report.last_test = test_stats;
            self.sync.barrier()?;
        }
        report.min_loss = self.checkpoints.min_loss();
        info!("search finished in {:.1}s", started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// One pass over this rank's shard with soft decisions.
    pub fn train_one_epoch(
        &mut self,
        dataset: &dyn ImageDataset,
        sampler: &UniformSubsetSampler,
        epoch: usize,
    ) -> TrainResult<EpochStats> {
        let loader = DataLoader::new(dataset, sampler.epoch_indices(epoch), self.config.batch_size);
        let num_batches = loader.num_batches();
        let mut metrics = MetricLogger::new();
        let source = BudgetSource::Learned(DecideMode::Soft);

        for (step, batch) in loader.iter().enumerate() {
            let (images, labels) = self.batch_tensors(batch?);
            let n = labels.size()[0] as usize;
            let reference = self.model.forward_full(&images)?;
            let output = self.model.forward(&images, &source, true)?;
            let (loss, parts) = self.loss.compute(&output, &reference, &labels, epoch);
            if !parts.total.is_finite() {
                error!("loss is {}, stopping training", parts.total);
                return Err(TrainError::training_step(format!("non-finite loss {} at epoch {epoch}", parts.total)));
            }

            match self.scaler.backward_and_step(&loss, &mut self.optimizer, self.sync.as_ref(), self.config.clip_grad)? {
                StepOutcome::Applied { grad_norm } => metrics.update("grad_norm", grad_norm, 1),
                StepOutcome::Skipped => metrics.update("skipped_steps", 1.0, 1),
            }
            metrics.update("loss", parts.total, n);
            metrics.update("loss_task", parts.task, n);
            metrics.update("loss_flops", parts.penalty, n);
            metrics.update("loss_similarity", parts.similarity, n);
            metrics.update("flops", parts.flops, n);
            metrics.update("lr", self.optimizer.lr(), 1);

            if step % self.config.log_interval.max(1) == 0 || step + 1 == num_batches {
                info!("Epoch [{epoch}] [{}/{num_batches}] {}", step + 1, metrics.render());
            }
        }

        let schedule = self.materializer.schedule_from_logits(&self.model.vit.arch_logits()?);
        info!("epoch {epoch} argmax schedule: prune {:?} merge {:?}", schedule.prune_kept_num, schedule.merge_kept_num);
        self.reduce(metrics)
    }

    fn reduce(&self, metrics: MetricLogger) -> TrainResult<EpochStats> {
        metrics
            .summary()
            .into_iter()
            .map(|(k, v)| Ok((k, self.sync.mean_scalar(v)?)))
            .collect()
    }

    /// Evaluate `indices` of `dataset` with hard decisions (or the fixed
    /// schedule) and no gradient.
    pub fn evaluate(&self, dataset: &dyn ImageDataset, indices: &[usize], epoch: usize) -> TrainResult<EpochStats> {
        let loader = DataLoader::new(dataset, indices.to_vec(), self.config.batch_size);
        let source = self.eval_source();
        let mut metrics = MetricLogger::new();

        tch::no_grad(|| -> TrainResult<()> {
            for batch in loader.iter() {
                let (images, labels) = self.batch_tensors(batch?);
                let n = labels.size()[0] as usize;
                let reference = self.model.forward_full(&images)?;
                let output = self.model.forward(&images, &source, false)?;
                let (_, parts) = self.loss.compute(&output, &reference, &labels, epoch);
                metrics.update("loss", parts.total, n);
                metrics.update("loss_similarity", parts.similarity, n);
                metrics.update("flops", self.model.vit.flops_model().schedule_gflops(&output.budgets()), n);
                if self.model.spec().family.is_classifier() {
                    let (acc1, acc5) = accuracy(&output, &labels);
                    metrics.update("acc1", acc1, n);
                    metrics.update("acc5", acc5, n);
                }
            }
            Ok(())
        })?;

        if metrics.get("loss").is_none() {
            warn!("evaluation saw no samples");
        } else {
            info!("* test {}", metrics.render());
        }
        self.reduce(metrics)
    }

    fn checkpoint(&self, epoch: usize) -> TrainResult<Checkpoint> {
        Ok(Checkpoint {
            epoch,
            model: self.model.state_dict()?,
            optimizer: Some(self.optimizer.state()),
            scheduler: Some(self.scheduler.state()),
            scaler: Some(self.scaler.state()),
            min_loss: self.checkpoints.min_loss(),
            config: self.config.clone(),
        })
    }

    /// Discretize the current controllers and upsert them into the rate
    /// table. Only the main process writes; other ranks return the schedule.
    pub fn materialize(&self) -> TrainResult<Schedule> {
        let state = self.model.state_dict()?;
        let spec = self.model.spec();
        let schedule = if self.dist.is_main() {
            self.materializer.write_table(
                &state,
                &self.config.compression_rate_path,
                &spec.display_name,
                self.config.target_flops,
            )?
        } else {
            self.materializer.schedule_from_state_dict(&state)?
        };
        let budgets = schedule.layer_budgets(self.model.vit.num_tokens())?;
        info!(
            "materialized schedule costs {:.3} GFLOPs (target {})",
            self.model.vit.flops_model().schedule_gflops(&budgets),
            self.config.target_flops
        );
        Ok(schedule)
    }
}

fn select_device(config: &DiffRateConfig) -> Device {
    if config.use_gpu && tch::Cuda::is_available() {
        Device::Cuda(config.gpu_device_id as usize)
    } else {
        if config.use_gpu {
            warn!("CUDA requested but not available, using CPU");
        }
        Device::Cpu
    }
}

fn load_fixed_schedule(config: &DiffRateConfig, spec: &ModelSpec) -> TrainResult<BudgetSource> {
    let table = CompressionRateTable::load(&config.compression_rate_path)?;
    let schedule = table.lookup(&spec.display_name, config.target_flops)?;
    info!(
        "fixed schedule for {} @ {}G: prune {:?} merge {:?}",
        spec.display_name, config.target_flops, schedule.prune_kept_num, schedule.merge_kept_num
    );
    BudgetSource::from_schedule(&schedule, spec.depth, spec.num_tokens())
}

/// Top-1 and top-5 accuracy in percent.
fn accuracy(output: &ModelOutput, labels: &Tensor) -> (f64, f64) {
    let classes = output.logits.size()[1];
    let k = classes.min(5);
    let (_, pred) = output.logits.topk(k, -1, true, true);
    let correct = pred.eq_tensor(&labels.unsqueeze(-1)).to_kind(Kind::Float);
    let n = labels.size()[0].max(1) as f64;
    let top = |k: i64| correct.narrow(1, 0, k).sum(Kind::Float).double_value(&[]) * 100.0 / n;
    (top(1), top(k))
}
