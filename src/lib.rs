//! Vehicle condition classification from up to four photographs.
//!
//! A shared EfficientNet-style backbone feeds two binary heads, one for
//! cleanliness (clean / dirty) and one for integrity (intact / damaged).
//! [`training`] fits both heads jointly on a directory of labeled images,
//! [`inference`] scores single views, and [`aggregate`] averages the views of
//! one vehicle into an overall verdict.

pub mod aggregate;
pub mod config;
pub mod data;
pub mod efficientnet;
pub mod error;
pub mod heads;
pub mod inference;
pub mod model;
pub mod training;
pub mod transform;

pub use aggregate::{
    aggregate, AggregateReport, Cleanliness, Integrity, Side, VehicleViews, ViewDetail, ViewOutcome,
    ViewPrediction,
};
pub use config::{LossWeights, ModelConfig, TrainingConfig, DECISION_THRESHOLD};
pub use data::{CarStateDataset, Category, LabelPair};
pub use efficientnet::{BackboneConfig, BackboneInit};
pub use error::{CarStateError, Result};
pub use inference::{assess_vehicle, load_model, CarStatePredictor};
pub use model::CarStateModel;
pub use training::{train, CarStateTrainer, TrainingSummary};
