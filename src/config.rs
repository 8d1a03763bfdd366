use crate::efficientnet::BackboneConfig;
use crate::error::{CarStateError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fs, path::Path};

/// Probability above which a head's output is read as dirty / damaged.
///
/// Shared by single-view inference and multi-view aggregation.
pub const DECISION_THRESHOLD: f32 = 0.5;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// `true` when `probability` lies strictly above [`DECISION_THRESHOLD`].
pub fn exceeds_threshold(probability: f32) -> bool {
    probability > DECISION_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub image_size: usize,
    pub resize_size: usize,
    pub head_hidden_units: usize,
    pub dropout_rate: f64,
    pub backbone: BackboneConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            resize_size: 256,
            head_hidden_units: 128,
            dropout_rate: 0.3,
            backbone: BackboneConfig::efficientnet_b0(),
        }
    }
}

impl ModelConfig {
    /// Small architecture used by tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            image_size: 32,
            resize_size: 36,
            head_hidden_units: 8,
            dropout_rate: 0.3,
            backbone: BackboneConfig::tiny(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(path.as_ref(), self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(CarStateError::InvalidConfig("image_size must be > 0".into()));
        }
        if self.resize_size < self.image_size {
            return Err(CarStateError::InvalidConfig(format!(
                "resize_size ({}) must be >= image_size ({})",
                self.resize_size, self.image_size
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(CarStateError::InvalidConfig(
                "dropout_rate must be in [0, 1)".into(),
            ));
        }
        if self.head_hidden_units == 0 {
            return Err(CarStateError::InvalidConfig(
                "head_hidden_units must be > 0".into(),
            ));
        }
        self.backbone.validate()
    }
}

/// Relative weight of each head's BCE term in the joint loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub cleanliness: f32,
    pub integrity: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            cleanliness: 1.0,
            integrity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub data_path: String,
    pub artifact_dir: String,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub lr_step_size: usize,
    pub lr_gamma: f64,
    pub loss_weights: LossWeights,
    /// Save an intermediate record every N epochs. `None` keeps only the final model.
    pub checkpoint_interval: Option<usize>,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_path: "dataset/train".to_string(),
            artifact_dir: "artifacts".to_string(),
            num_epochs: 50,
            batch_size: 32,
            learning_rate: 0.0005,
            lr_step_size: 5,
            lr_gamma: 0.1,
            loss_weights: LossWeights::default(),
            checkpoint_interval: None,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CarStateError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.num_epochs == 0 {
            return Err(CarStateError::InvalidConfig("num_epochs must be > 0".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(CarStateError::InvalidConfig(
                "learning_rate must be > 0".into(),
            ));
        }
        if self.lr_step_size == 0 {
            return Err(CarStateError::InvalidConfig("lr_step_size must be > 0".into()));
        }
        if !(self.lr_gamma > 0.0) {
            return Err(CarStateError::InvalidConfig("lr_gamma must be > 0".into()));
        }
        let weights = self.loss_weights;
        if weights.cleanliness < 0.0
            || weights.integrity < 0.0
            || weights.cleanliness + weights.integrity <= 0.0
        {
            return Err(CarStateError::InvalidConfig(
                "loss weights must be non-negative and not both zero".into(),
            ));
        }
        if self.checkpoint_interval == Some(0) {
            return Err(CarStateError::InvalidConfig(
                "checkpoint_interval must be > 0 when set".into(),
            ));
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| {
        CarStateError::InvalidConfig(format!("{}: {}", path.display(), e))
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(value)
        .map_err(|e| CarStateError::Persistence(e.to_string()))?;
    fs::write(path, raw)?;
    Ok(())
}
