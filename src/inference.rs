use crate::{
    aggregate::{aggregate, AggregateReport, VehicleViews, ViewOutcome, ViewPrediction},
    config::ModelConfig,
    error::{CarStateError, Result},
    model::CarStateModel,
    transform::{decode_image, ImageTransform, InferenceTransform},
};
use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;
use rayon::prelude::*;
use std::path::Path;

/// A trained model plus the deterministic preprocessing it expects.
///
/// Only non-autodiff backends are accepted: no graph is recorded and dropout
/// is inactive, so identical inputs give bit-identical probabilities. The
/// predictor is never mutated after construction and can be shared by
/// reference across any number of callers.
#[derive(Debug)]
pub struct CarStatePredictor<B: Backend> {
    model: CarStateModel<B>,
    transform: InferenceTransform,
    device: B::Device,
}

impl<B: Backend> CarStatePredictor<B> {
    /// Fails with [`CarStateError::InvalidConfig`] on an autodiff backend, where
    /// dropout would stay active.
    pub fn new(model: CarStateModel<B>, config: &ModelConfig, device: B::Device) -> Result<Self> {
        if B::ad_enabled() {
            return Err(CarStateError::InvalidConfig(format!(
                "prediction needs a backend without autodiff, got {}",
                std::any::type_name::<B>()
            )));
        }

        Ok(Self {
            model,
            transform: InferenceTransform::new(config.resize_size, config.image_size),
            device,
        })
    }

    pub fn load<P: AsRef<Path>>(artifact_dir: P, device: B::Device) -> Result<Self> {
        let (model, config) = CarStateModel::load_artifact(artifact_dir.as_ref(), &device)?;
        Self::new(model, &config, device)
    }

    pub fn predict_view<P: AsRef<Path>>(&self, image_path: P) -> Result<ViewPrediction> {
        let image = decode_image(image_path.as_ref())?;
        self.predict_image(&image)
    }

    pub fn predict_image(&self, image: &DynamicImage) -> Result<ViewPrediction> {
        self.predict_preprocessed(self.transform.apply(image.clone()))
    }

    fn predict_preprocessed(&self, data: Vec<f32>) -> Result<ViewPrediction> {
        let size = self.transform.resolution();
        let input = Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape([1, 3, size, size]);

        let (cleanliness, integrity) = self.model.forward(input);

        Ok(ViewPrediction::from_probabilities(
            read_probability(cleanliness)?,
            read_probability(integrity)?,
        ))
    }

    /// Predicts every supplied view and aggregates them. A view that fails to
    /// decode is reported in the breakdown without stopping the others.
    pub fn assess(&self, views: &VehicleViews) -> Result<AggregateReport> {
        let transform = &self.transform;
        let prepared: Vec<_> = views
            .supplied()
            .into_par_iter()
            .map(|(side, path)| (side, decode_image(path).map(|image| transform.apply(image))))
            .collect();

        let outcomes = prepared
            .into_iter()
            .map(|(side, data)| {
                let result = data.and_then(|data| self.predict_preprocessed(data));
                if let Err(e) = &result {
                    tracing::warn!("{} view failed: {}", side, e);
                }
                ViewOutcome { side, result }
            })
            .collect();

        aggregate(outcomes)
    }
}

fn read_probability<B: Backend>(output: Tensor<B, 2>) -> Result<f32> {
    let values = output
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| CarStateError::Tensor(format!("{:?}", e)))?;
    values
        .first()
        .copied()
        .ok_or_else(|| CarStateError::Tensor("empty model output".into()))
}

/// Loads a trained artifact directory, logging the outcome. `B` must be an
/// inference backend such as `NdArray<f32>`, not `Autodiff<_>`.
///
/// Callers keep the result as an `Option` and pass it to [`assess_vehicle`];
/// a failed load leaves the host running without a model.
pub fn load_model<B: Backend, P: AsRef<Path>>(artifact_dir: P, device: B::Device) -> Result<CarStatePredictor<B>> {
    let artifact_dir = artifact_dir.as_ref();
    match CarStatePredictor::load(artifact_dir, device) {
        Ok(predictor) => {
            tracing::info!("Model loaded from {}", artifact_dir.display());
            Ok(predictor)
        }
        Err(e) => {
            tracing::error!("Error loading model: {}", e);
            Err(e)
        }
    }
}

/// Entry point for front ends: refuses with [`CarStateError::ModelUnavailable`]
/// when no model is loaded instead of failing later.
pub fn assess_vehicle<B: Backend>(
    predictor: Option<&CarStatePredictor<B>>,
    views: &VehicleViews,
) -> Result<AggregateReport> {
    let predictor = predictor.ok_or_else(|| {
        CarStateError::ModelUnavailable("train a model first and point the service at its artifact directory".into())
    })?;
    predictor.assess(views)
}
