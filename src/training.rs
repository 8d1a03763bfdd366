use crate::{
    config::{ModelConfig, TrainingConfig},
    data::{CarImageItem, CarStateBatch, CarStateBatcher, CarStateDataset},
    efficientnet::BackboneInit,
    error::{CarStateError, Result},
    model::{CarStateModel, RECORD_EXTENSION},
    transform::{ImageTransform, TrainTransform},
};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLrSchedule {
    pub initial: f64,
    pub step_size: usize,
    pub gamma: f64,
}

impl StepLrSchedule {
    pub fn learning_rate(&self, epoch: usize) -> f64 {
        self.initial * self.gamma.powi((epoch / self.step_size.max(1)) as i32)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    /// 1-based.
    pub epoch: usize,
    pub avg_loss: f64,
    pub learning_rate: f64,
    pub batches: usize,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub num_samples: usize,
    pub epochs: Vec<EpochStats>,
    pub artifact_dir: PathBuf,
    pub checkpoints: Vec<PathBuf>,
}

pub struct CarStateTrainer<B: AutodiffBackend> {
    model_config: ModelConfig,
    config: TrainingConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> CarStateTrainer<B> {
    pub fn new(model_config: ModelConfig, config: TrainingConfig, device: B::Device) -> Self {
        Self {
            model_config,
            config,
            device,
        }
    }

    pub fn run(&self, init: &BackboneInit) -> Result<TrainingSummary> {
        self.model_config.validate()?;
        self.config.validate()?;

        tracing::info!(
            backend = std::any::type_name::<B>(),
            device = ?self.device,
            image_size = self.model_config.image_size,
            batch_size = self.config.batch_size,
            learning_rate = self.config.learning_rate,
            epochs = self.config.num_epochs,
            "Starting training"
        );

        let transform: Arc<dyn ImageTransform> = Arc::new(TrainTransform::new(self.model_config.image_size));
        let dataset = CarStateDataset::new(&self.config.data_path, transform.clone())?;
        if dataset.is_empty() {
            return Err(CarStateError::EmptyDataset(PathBuf::from(&self.config.data_path)));
        }

        let model = CarStateModel::<B>::new(&self.model_config, init, &self.device)?;
        let batcher = CarStateBatcher::<B>::new(transform, self.device.clone());
        self.train_model(model, dataset, batcher)
    }

    fn train_model(
        &self,
        mut model: CarStateModel<B>,
        dataset: CarStateDataset,
        batcher: CarStateBatcher<B>,
    ) -> Result<TrainingSummary> {
        let num_samples = dataset.len();
        let data_root = dataset.root().to_path_buf();
        let device = batcher.device().clone();
        let loader = DataLoaderBuilder::<B, CarImageItem, Option<CarStateBatch<B>>>::new(batcher)
            .batch_size(self.config.batch_size)
            .shuffle(self.config.seed)
            .set_device(device)
            .build(dataset);

        let mut optim = AdamConfig::new().init::<B, CarStateModel<B>>();
        let schedule = StepLrSchedule {
            initial: self.config.learning_rate,
            step_size: self.config.lr_step_size,
            gamma: self.config.lr_gamma,
        };
        let artifact_dir = PathBuf::from(&self.config.artifact_dir);

        let mut epochs = Vec::with_capacity(self.config.num_epochs);
        let mut checkpoints = Vec::new();
        let start_time = Instant::now();

        for epoch in 0..self.config.num_epochs {
            let learning_rate = schedule.learning_rate(epoch);

            let mut epoch_loss = 0.0;
            let mut batch_count = 0;

            for batch in loader.iter() {
                let Some(batch) = batch else {
                    tracing::warn!("No decodable samples in batch, skipping");
                    continue;
                };

                let loss = model.joint_loss(batch, self.config.loss_weights);
                let loss_value: f64 = loss.clone().into_scalar().elem();
                if !loss_value.is_finite() {
                    tracing::error!("Loss became {} at epoch {}, aborting", loss_value, epoch + 1);
                    return Err(CarStateError::Diverged {
                        epoch: epoch + 1,
                        loss: loss_value,
                    });
                }

                epoch_loss += loss_value;
                batch_count += 1;

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(learning_rate, model, grads);
            }

            if batch_count == 0 {
                tracing::error!("Epoch {} had no decodable samples, aborting", epoch + 1);
                return Err(CarStateError::NoUsableSamples(data_root));
            }

            let avg_loss = epoch_loss / batch_count as f64;
            tracing::info!(
                "Epoch {}/{}, Loss: {:.4}, lr: {:e}",
                epoch + 1,
                self.config.num_epochs,
                avg_loss,
                learning_rate
            );
            epochs.push(EpochStats {
                epoch: epoch + 1,
                avg_loss,
                learning_rate,
                batches: batch_count,
            });

            if let Some(path) = self.maybe_checkpoint(&model, &artifact_dir, epoch + 1)? {
                checkpoints.push(path);
            }
        }

        tracing::info!("Training finished in {:?}", start_time.elapsed());

        let model_path = model.save_artifact(&self.model_config, &artifact_dir)?;
        tracing::info!("Model saved to {}", model_path.display());

        Ok(TrainingSummary {
            num_samples,
            epochs,
            artifact_dir,
            checkpoints,
        })
    }

    fn maybe_checkpoint(
        &self,
        model: &CarStateModel<B>,
        artifact_dir: &Path,
        epoch: usize,
    ) -> Result<Option<PathBuf>> {
        let Some(interval) = self.config.checkpoint_interval else {
            return Ok(None);
        };
        if epoch % interval != 0 {
            return Ok(None);
        }

        std::fs::create_dir_all(artifact_dir)?;
        let path = artifact_dir.join(format!("checkpoint-epoch-{}", epoch));
        model.save_record(&path)?;
        let path = path.with_extension(RECORD_EXTENSION);
        tracing::info!("Checkpoint saved to {}", path.display());
        Ok(Some(path))
    }
}

/// Trains with the default architecture and schedule, saving into `artifacts/`.
pub fn train<B: AutodiffBackend>(
    dataset_root: impl AsRef<Path>,
    epochs: usize,
    batch_size: usize,
    learning_rate: f64,
    init: &BackboneInit,
    device: B::Device,
) -> Result<TrainingSummary> {
    let config = TrainingConfig {
        data_path: dataset_root.as_ref().to_string_lossy().into_owned(),
        num_epochs: epochs,
        batch_size,
        learning_rate,
        ..TrainingConfig::default()
    };
    CarStateTrainer::<B>::new(ModelConfig::default(), config, device).run(init)
}
