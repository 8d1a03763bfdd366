use crate::{
    config::{LossWeights, ModelConfig},
    data::CarStateBatch,
    efficientnet::{BackboneInit, EfficientNet},
    error::{CarStateError, Result},
    heads::BinaryHead,
};
use burn::{
    module::Module,
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, Tensor},
};
use std::path::{Path, PathBuf};

/// Record file stem inside an artifact directory; the recorder appends `.mpk`.
pub const MODEL_FILE: &str = "model";
pub const RECORD_EXTENSION: &str = "mpk";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Module, Debug)]
pub struct CarStateModel<B: Backend> {
    backbone: EfficientNet<B>,
    cleanliness_head: BinaryHead<B>,
    integrity_head: BinaryHead<B>,
}

impl<B: Backend> CarStateModel<B> {
    pub fn new(config: &ModelConfig, init: &BackboneInit, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let backbone = config.backbone.init(init, device)?;
        let num_features = backbone.num_features();

        let cleanliness_head = BinaryHead::new(
            num_features,
            config.head_hidden_units,
            config.dropout_rate,
            device,
        );
        let integrity_head = BinaryHead::new(
            num_features,
            config.head_hidden_units,
            config.dropout_rate,
            device,
        );

        Ok(Self {
            backbone,
            cleanliness_head,
            integrity_head,
        })
    }

    /// Cleanliness and integrity probabilities, each `[N, 1]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let features = self.backbone.forward(x);

        let cleanliness = self.cleanliness_head.forward(features.clone());
        let integrity = self.integrity_head.forward(features);

        (cleanliness, integrity)
    }

    pub fn forward_logits(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let features = self.backbone.forward(x);

        let cleanliness = self.cleanliness_head.forward_logits(features.clone());
        let integrity = self.integrity_head.forward_logits(features);

        (cleanliness, integrity)
    }

    /// Weighted sum of both heads' binary cross-entropy on one batch.
    pub fn joint_loss(&self, batch: CarStateBatch<B>, weights: LossWeights) -> Tensor<B, 1> {
        let (cleanliness_logits, integrity_logits) = self.forward_logits(batch.images);

        let cleanliness_loss = binary_cross_entropy_with_logits(cleanliness_logits, batch.cleanliness);
        let integrity_loss = binary_cross_entropy_with_logits(integrity_logits, batch.integrity);

        cleanliness_loss * weights.cleanliness + integrity_loss * weights.integrity
    }

    /// Writes the record and the architecture it was built from into `dir`.
    pub fn save_artifact(&self, config: &ModelConfig, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        config.save(dir.join(CONFIG_FILE))?;
        let path = dir.join(MODEL_FILE);
        self.save_record(&path)?;
        Ok(path)
    }

    pub fn save_record(&self, path: &Path) -> Result<()> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|e| CarStateError::Persistence(format!("{}: {}", path.display(), e)))
    }

    /// Rebuilds the architecture described in `dir/config.json` and loads its
    /// parameters. Falls back to the default architecture when no config was saved.
    pub fn load_artifact(dir: &Path, device: &B::Device) -> Result<(Self, ModelConfig)> {
        let path = dir.join(MODEL_FILE);
        if !path.with_extension(RECORD_EXTENSION).is_file() {
            return Err(CarStateError::ModelUnavailable(format!(
                "no model record in {}",
                dir.display()
            )));
        }

        let config_path = dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            ModelConfig::load(&config_path)
                .map_err(|e| CarStateError::ModelUnavailable(e.to_string()))?
        } else {
            ModelConfig::default()
        };

        let model = Self::new(&config, &BackboneInit::Random, device)
            .map_err(|e| CarStateError::ModelUnavailable(e.to_string()))?;

        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        let model = model
            .load_file(path.clone(), &recorder, device)
            .map_err(|e| CarStateError::ModelUnavailable(format!("{}: {}", path.display(), e)))?;

        Ok((model, config))
    }
}

/// Mean BCE of `sigmoid(logits)` against `targets`, in the overflow-safe form
/// `max(x, 0) - x * t + ln(1 + exp(-|x|))`.
pub fn binary_cross_entropy_with_logits<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let max_val = logits.clone().clamp_min(0.0);

    let bce_term = max_val - logits.clone() * targets;
    let log_term = (logits.abs().neg().exp() + 1.0).log();

    (bce_term + log_term).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};
    use burn::tensor::{Distribution, ElementConversion};

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar().elem()
    }

    #[test]
    fn bce_matches_closed_form() {
        let device = NdArrayDevice::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0], [0.0]], &device);
        let targets = Tensor::<TestBackend, 2>::from_floats([[1.0], [0.0]], &device);

        let loss = scalar(binary_cross_entropy_with_logits(logits, targets));
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn bce_is_stable_for_large_logits() {
        let device = NdArrayDevice::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[100.0], [-100.0]], &device);
        let targets = Tensor::<TestBackend, 2>::from_floats([[1.0], [0.0]], &device);

        let loss = scalar(binary_cross_entropy_with_logits(logits, targets));
        assert!(loss.is_finite());
        assert!(loss < 1e-6);
    }

    #[test]
    fn forward_yields_two_probabilities_per_image() {
        let device = NdArrayDevice::default();
        let model: CarStateModel<TestBackend> =
            CarStateModel::new(&ModelConfig::tiny(), &BackboneInit::Random, &device).unwrap();

        let images = Tensor::<TestBackend, 4>::random([3, 3, 32, 32], Distribution::Default, &device);
        let (cleanliness, integrity) = model.forward(images);

        assert_eq!(cleanliness.dims(), [3, 1]);
        assert_eq!(integrity.dims(), [3, 1]);

        let probs: Vec<f32> = cleanliness
            .into_data()
            .to_vec::<f32>()
            .unwrap()
            .into_iter()
            .chain(integrity.into_data().to_vec::<f32>().unwrap())
            .collect();
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn zero_weight_drops_a_head_from_the_joint_loss() {
        let device = NdArrayDevice::default();
        let model: CarStateModel<TestBackend> =
            CarStateModel::new(&ModelConfig::tiny(), &BackboneInit::Random, &device).unwrap();

        let images = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);
        let batch = CarStateBatch {
            images,
            cleanliness: Tensor::from_floats([[1.0], [0.0]], &device),
            integrity: Tensor::from_floats([[0.0], [1.0]], &device),
        };

        let both = scalar(model.joint_loss(batch.clone(), LossWeights::default()));
        let clean_only = scalar(model.joint_loss(
            batch.clone(),
            LossWeights {
                cleanliness: 1.0,
                integrity: 0.0,
            },
        ));
        let integ_only = scalar(model.joint_loss(
            batch,
            LossWeights {
                cleanliness: 0.0,
                integrity: 1.0,
            },
        ));

        assert!((both - (clean_only + integ_only)).abs() < 1e-4);
    }

    #[test]
    fn artifact_reloads_identical_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::default();
        let config = ModelConfig::tiny();
        let model: CarStateModel<TestBackend> =
            CarStateModel::new(&config, &BackboneInit::Random, &device).unwrap();
        model.save_artifact(&config, dir.path()).unwrap();

        let (restored, restored_config) = CarStateModel::<TestBackend>::load_artifact(dir.path(), &device).unwrap();
        assert_eq!(restored_config, config);

        let images = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);
        let (a, _) = model.forward(images.clone());
        let (b, _) = restored.forward(images);
        assert_eq!(
            a.into_data().to_vec::<f32>().unwrap(),
            b.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn corrupt_record_is_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        ModelConfig::tiny().save(dir.path().join(CONFIG_FILE)).unwrap();
        std::fs::write(dir.path().join("model.mpk"), b"garbage").unwrap();

        let result = CarStateModel::<TestBackend>::load_artifact(dir.path(), &Default::default());
        assert!(matches!(result, Err(CarStateError::ModelUnavailable(_))));
    }

    #[test]
    fn missing_artifact_is_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let device = NdArrayDevice::default();
        let result = CarStateModel::<TestBackend>::load_artifact(dir.path(), &device);
        assert!(matches!(result, Err(CarStateError::ModelUnavailable(_))));
    }
}
