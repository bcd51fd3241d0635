//! `diffrate` binary: search, evaluate and materialize compression rates.
//!
//! # Usage
//!
//! ```bash
//! diffrate train --config search.json --target-flops 3.0
//! diffrate eval --config search.json --load-compression-rate
//! diffrate materialize --checkpoint log/temp/model_best.bin
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, error, info};

use diffrate_core::checkpoint::Checkpoint;
use diffrate_core::config::DiffRateConfig;
use diffrate_core::dataset::{ImageDataset, SyntheticImageDataset};
use diffrate_core::dist::{DistContext, LocalSync};
use diffrate_core::materialize::materialize_checkpoint;
use diffrate_core::registry::ModelRegistry;
use diffrate_train::trainer::Trainer;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(name = "diffrate", version, about = "Differentiable compression-rate search for vision transformers")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search compression rates for the configured model and target.
    Train(RunArgs),
    /// Evaluate once with learned or table-loaded rates.
    Eval(RunArgs),
    /// Write the argmax schedule of a checkpoint into the rate table, keyed
    /// by the model and target recorded in the checkpoint.
    Materialize {
        /// Checkpoint holding the controller logits.
        #[arg(long, value_name = "FILE")]
        checkpoint: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },
}

/// Configuration file plus overrides shared by every subcommand.
#[derive(Args, Debug)]
struct RunArgs {
    /// JSON configuration file; defaults are used when absent.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Architecture name.
    #[arg(long)]
    model: Option<String>,

    /// Target cost in GFLOPs.
    #[arg(long)]
    target_flops: Option<f64>,

    /// Candidate granularity.
    #[arg(long)]
    granularity: Option<usize>,

    /// Number of search epochs.
    #[arg(long)]
    epochs: Option<usize>,

    /// Per-replica batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Output directory for checkpoints and `log.txt`.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Compression rate table.
    #[arg(long, value_name = "FILE")]
    compression_rate_path: Option<PathBuf>,

    /// Use the rate table instead of the learned controllers.
    #[arg(long)]
    load_compression_rate: bool,

    /// Keep the FLOPs penalty off during the first epoch.
    #[arg(long)]
    warmup_compression_rate: bool,

    /// Resume from this checkpoint.
    #[arg(long, value_name = "FILE")]
    resume: Option<PathBuf>,

    /// Resume from `<output_dir>/checkpoint.bin` when it exists.
    #[arg(long)]
    autoresume: bool,

    /// Initialise the backbone from this checkpoint.
    #[arg(long, value_name = "FILE")]
    finetune: Option<PathBuf>,

    /// Run on CUDA when available.
    #[arg(long)]
    cuda: bool,
}

impl RunArgs {
    /// Configuration file (or defaults) with the overrides applied.
    fn resolve(&self, eval: bool) -> anyhow::Result<DiffRateConfig> {
        self.resolve_from(DiffRateConfig::default(), eval)
    }

    /// Like [`RunArgs::resolve`], starting from `base` when no file is given.
    fn resolve_from(&self, base: DiffRateConfig, eval: bool) -> anyhow::Result<DiffRateConfig> {
        let mut config = match self.config.as_deref() {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                DiffRateConfig::from_json(path)?
            }
            None => base,
        };
        if let Some(v) = &self.model {
            config.model = v.clone();
        }
        if let Some(v) = self.target_flops {
            config.target_flops = v;
        }
        if let Some(v) = self.granularity {
            config.granularity = v;
        }
        if let Some(v) = self.epochs {
            config.epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = &self.output_dir {
            config.output_dir = v.clone();
        }
        if let Some(v) = &self.compression_rate_path {
            config.compression_rate_path = v.clone();
        }
        if let Some(v) = &self.resume {
            config.resume = Some(v.clone());
        }
        if let Some(v) = &self.finetune {
            config.finetune = Some(v.clone());
        }
        config.load_compression_rate |= self.load_compression_rate;
        config.warmup_compression_rate |= self.warmup_compression_rate;
        config.autoresume |= self.autoresume;
        config.use_gpu |= self.cuda;
        config.eval |= eval;
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_target(false).with_thread_ids(false).init();

    info!("DiffRate v{}", diffrate_train::VERSION);
    if let Err(e) = run(cli.command) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    let registry = ModelRegistry::with_defaults();
    match command {
        Command::Train(args) => search(args.resolve(false)?, &registry),
        Command::Eval(args) => search(args.resolve(true)?, &registry),
        Command::Materialize { checkpoint, run } => materialize(&checkpoint, &run, &registry),
    }
}

fn search(config: DiffRateConfig, registry: &ModelRegistry) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;
    debug!("resolved configuration:\n{}", serde_json::to_string_pretty(&config)?);
    let dist = DistContext::from_env()?;
    let sync = Box::new(LocalSync::for_context(&dist)?);

    let train = SyntheticImageDataset::new(config.synthetic_train_samples, config.num_classes, config.input_size);
    let val = SyntheticImageDataset::new(config.synthetic_val_samples, config.num_classes, config.input_size);
    info!("using synthetic datasets ({} train / {} val samples)", train.len(), val.len());

    let is_main = dist.is_main();
    let eval = config.eval;
    let mut trainer = Trainer::new(config, registry, dist, sync)?;
    let report = trainer.fit(&train, &val)?;
    info!("finished {} epochs, minimum loss {:?}", report.epochs_run, report.min_loss);

    if !eval && is_main {
        let schedule = trainer.materialize()?;
        info!("prune_kept_num {:?}", schedule.prune_kept_num);
        info!("merge_kept_num {:?}", schedule.merge_kept_num);
    }
    Ok(())
}

fn materialize(path: &std::path::Path, run: &RunArgs, registry: &ModelRegistry) -> anyhow::Result<()> {
    let checkpoint = Checkpoint::load(path).with_context(|| format!("loading {}", path.display()))?;
    let config = run.resolve_from(checkpoint.config.clone(), false)?;
    let schedule = materialize_checkpoint(&checkpoint, &config, registry)?;
    info!("prune_kept_num {:?}", schedule.prune_kept_num);
    info!("merge_kept_num {:?}", schedule.merge_kept_num);
    Ok(())
}
