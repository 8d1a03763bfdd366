//! `car-state` command line: train a model from a labeled image directory, or
//! assess a vehicle from up to four photographs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray};
use car_state::{
    assess_vehicle, load_model, BackboneInit, CarStateTrainer, ModelConfig, TrainingConfig, VehicleViews,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type InferenceBackend = NdArray<f32>;
type TrainingBackend = Autodiff<InferenceBackend>;

#[derive(Parser, Debug)]
#[command(name = "car-state")]
#[command(about = "Vehicle cleanliness / integrity classifier")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train both heads on `<data>/{clean,dirty}_{intact,damaged}/`
    Train {
        /// JSON training config; flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON model architecture config
        #[arg(long)]
        model_config: Option<PathBuf>,

        #[arg(long, env = "CAR_STATE_DATA")]
        data: Option<PathBuf>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        lr: Option<f64>,

        #[arg(long, env = "CAR_STATE_ARTIFACTS")]
        artifact_dir: Option<PathBuf>,

        /// Save a checkpoint every N epochs
        #[arg(long)]
        checkpoint_interval: Option<usize>,

        /// Pretrained backbone record; random initialization when omitted
        #[arg(long)]
        backbone_weights: Option<PathBuf>,
    },

    /// Classify a vehicle from the supplied views
    Predict {
        #[arg(long, env = "CAR_STATE_ARTIFACTS", default_value = "artifacts")]
        model: PathBuf,

        #[arg(long)]
        front: Option<PathBuf>,

        #[arg(long)]
        rear: Option<PathBuf>,

        #[arg(long)]
        left: Option<PathBuf>,

        #[arg(long)]
        right: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match args.command {
        Command::Train {
            config,
            model_config,
            data,
            epochs,
            batch_size,
            lr,
            artifact_dir,
            checkpoint_interval,
            backbone_weights,
        } => {
            let mut training = match config {
                Some(path) => TrainingConfig::load(&path)
                    .with_context(|| format!("Failed to load training config {}", path.display()))?,
                None => TrainingConfig::default(),
            };
            if let Some(data) = data {
                training.data_path = data.to_string_lossy().into_owned();
            }
            if let Some(dir) = artifact_dir {
                training.artifact_dir = dir.to_string_lossy().into_owned();
            }
            training.num_epochs = epochs.unwrap_or(training.num_epochs);
            training.batch_size = batch_size.unwrap_or(training.batch_size);
            training.learning_rate = lr.unwrap_or(training.learning_rate);
            training.checkpoint_interval = checkpoint_interval.or(training.checkpoint_interval);

            let model_config = match model_config {
                Some(path) => ModelConfig::load(&path)
                    .with_context(|| format!("Failed to load model config {}", path.display()))?,
                None => ModelConfig::default(),
            };

            let init = match backbone_weights {
                Some(path) => BackboneInit::Pretrained(path),
                None => {
                    tracing::warn!("No backbone weights given, starting from random initialization");
                    BackboneInit::Random
                }
            };

            let summary = CarStateTrainer::<TrainingBackend>::new(model_config, training, Default::default())
                .run(&init)
                .context("Training failed")?;

            info!(
                "Trained on {} images for {} epochs, artifacts in {}",
                summary.num_samples,
                summary.epochs.len(),
                summary.artifact_dir.display()
            );
        }

        Command::Predict {
            model,
            front,
            rear,
            left,
            right,
            format,
        } => {
            let predictor = load_model::<InferenceBackend, _>(&model, Default::default()).ok();
            let views = VehicleViews {
                front,
                rear,
                left,
                right,
            };

            let report = assess_vehicle(predictor.as_ref(), &views)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report.to_json())?),
                OutputFormat::Text => print!("{}", report),
            }
        }
    }

    Ok(())
}
