use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cycleid::training::{
    export, CycleTrainer, DataPipeline, DeviceType, Phase, TrainingConfig, TrainingSession,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cycleid")]
#[command(about = "Cycle-consistency and identity training for unpaired image translation", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the model pair
    Train(RunArgs),

    /// Export translations of the test images
    Test(RunArgs),

    /// Validate a configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Write the default configuration
    Init {
        /// Output path (.json, .yaml or .yml)
        #[arg(short, long, default_value = "cycleid.yaml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file path (JSON or YAML)
    #[arg(short, long, env = "CYCLEID_CONFIG")]
    config: Option<PathBuf>,

    /// Run identifier; generated from the UTC time when unset
    #[arg(long)]
    task_id: Option<String>,

    /// Root directory for checkpoints and summaries
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Root directory for exported translations
    #[arg(long)]
    test_npy_save_dir: Option<PathBuf>,

    /// Batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Patch size
    #[arg(long)]
    patch_size: Option<usize>,

    /// Exclusive upper bound on epochs
    #[arg(long)]
    end_epoch: Option<usize>,

    /// Base learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Seed for crop plans and sample selection
    #[arg(long)]
    seed: Option<u64>,

    /// Device to run on (cpu, cuda, metal)
    #[arg(long)]
    device: Option<String>,

    /// Start from fresh weights even if a checkpoint exists
    #[arg(long)]
    no_continue: bool,
}

impl RunArgs {
    fn load_config(&self, phase: Phase) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_file(path)?,
            None => TrainingConfig::default(),
        };
        config.training.phase = phase;

        if let Some(task_id) = &self.task_id {
            config.checkpointing.task_id = Some(task_id.clone());
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpointing.checkpoint_dir = dir.clone();
        }
        if let Some(dir) = &self.test_npy_save_dir {
            config.checkpointing.test_npy_save_dir = dir.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.data.batch_size = batch_size;
        }
        if let Some(patch_size) = self.patch_size {
            config.data.patch_size = patch_size;
        }
        if let Some(end_epoch) = self.end_epoch {
            config.training.end_epoch = end_epoch;
        }
        if let Some(lr) = self.lr {
            config.optimizer.learning_rate = lr;
        }
        if let Some(seed) = self.seed {
            config.training.seed = seed;
        }
        if let Some(device) = &self.device {
            config.runtime.device_type = match device.to_lowercase().as_str() {
                "cpu" => DeviceType::Cpu,
                "cuda" => DeviceType::Cuda,
                "metal" => DeviceType::Metal,
                other => anyhow::bail!("unknown device '{other}'"),
            };
        }
        if self.no_continue {
            config.training.continue_train = false;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    match cli.command {
        Commands::Train(args) => train(args.load_config(Phase::Train)?).await,
        Commands::Test(args) => test(args.load_config(Phase::Test)?),
        Commands::Config { file } => validate_config(file),
        Commands::Init { output } => {
            TrainingConfig::default().to_file(&output)?;
            info!("Default configuration written to {}", output.display());
            Ok(())
        }
    }
}

fn init_logging(verbose: u8, json: bool) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn train(mut config: TrainingConfig) -> Result<()> {
    let task_id = config.resolve_task_id();
    info!("Task: {}", task_id);

    let device = config.runtime.device()?;
    let session = TrainingSession::from_config(&config, device)?;
    let pipeline = DataPipeline::for_training(&config.data, &config.training)?;

    let mut trainer = CycleTrainer::new(config, session, pipeline)?;

    let stop = trainer.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let result = trainer.train().await?;
    info!(
        "Finished at step {} ({} this run, {} non-finite) in {:?}",
        result.total_steps, result.steps_this_run, result.non_finite_steps, result.training_duration
    );
    Ok(())
}

fn test(mut config: TrainingConfig) -> Result<()> {
    let task_id = config.resolve_task_id();
    let device = config.runtime.device()?;
    let mut session = TrainingSession::from_config(&config, device)?;
    let pipeline = DataPipeline::for_testing(&config.data)?;

    let summary = export(&config, &task_id, &mut session, &pipeline)?;
    info!(
        "Wrote {} files to {}",
        summary.files.len(),
        summary.output_dir.display()
    );
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = TrainingConfig::from_file(&config_path)?;
    config.validate().context("Invalid configuration")?;

    info!("Configuration is valid");
    info!("  - Images: {}px whole, {}px patches, {} channel(s)", config.data.whole_size, config.data.patch_size, config.data.channels);
    info!("  - Generators: ngf {}, nglf {}", config.model.ngf, config.model.nglf);
    info!("  - Discriminators: ndf {}", config.model.ndf);
    info!("  - Loss weights: cycle {}, identity {}", config.loss.lambda_cycle, config.loss.gamma_identity);
    info!("  - Schedule: {:?}, {} epochs", config.optimizer.scheduler.scheduler_type, config.training.end_epoch);
    Ok(())
}
