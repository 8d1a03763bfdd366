//! End-to-end tests: dataset scanning, training on a tiny synthetic dataset,
//! loading the artifact and assessing vehicles.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};
use burn::data::dataset::Dataset;
use car_state::{
    assess_vehicle, load_model, transform::InferenceTransform, BackboneInit, CarStateDataset, CarStateError,
    CarStateModel, CarStatePredictor, CarStateTrainer, Category, Cleanliness, Integrity, ModelConfig, Side,
    TrainingConfig, VehicleViews, ViewDetail, DECISION_THRESHOLD,
};
use image::{Rgb, RgbImage};
use tempfile::TempDir;

type InferenceBackend = NdArray<f32>;
type TrainingBackend = Autodiff<InferenceBackend>;

fn write_image(path: &Path, seed: u8) {
    let image = RgbImage::from_fn(40, 36, |x, y| {
        Rgb([
            seed.wrapping_add((x * 3) as u8),
            seed.wrapping_mul(2).wrapping_add((y * 5) as u8),
            ((x + y) as u8).wrapping_add(seed),
        ])
    });
    image.save(path).unwrap();
}

fn write_corrupt(path: &Path) {
    fs::write(path, b"definitely not a png").unwrap();
}

/// Two images in every category directory.
fn full_dataset() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (i, category) in Category::ALL.into_iter().enumerate() {
        let category_dir = dir.path().join(category.dir_name());
        fs::create_dir_all(&category_dir).unwrap();
        for j in 0..2u8 {
            write_image(&category_dir.join(format!("car_{j}.png")), (i as u8) * 60 + j * 20);
        }
    }
    dir
}

fn inference_transform() -> Arc<InferenceTransform> {
    let config = ModelConfig::tiny();
    Arc::new(InferenceTransform::new(config.resize_size, config.image_size))
}

/// Randomly initialized tiny model written as an artifact directory.
fn saved_tiny_model(dir: &Path) -> PathBuf {
    let config = ModelConfig::tiny();
    let model =
        CarStateModel::<InferenceBackend>::new(&config, &BackboneInit::Random, &Default::default()).unwrap();
    let artifact_dir = dir.join("artifacts");
    model.save_artifact(&config, &artifact_dir).unwrap();
    artifact_dir
}

#[test]
fn dataset_counts_accepted_files_in_existing_categories() {
    let dir = tempfile::tempdir().unwrap();
    let clean_intact = dir.path().join("clean_intact");
    let dirty_damaged = dir.path().join("dirty_damaged");
    fs::create_dir_all(&clean_intact).unwrap();
    fs::create_dir_all(&dirty_damaged).unwrap();
    fs::create_dir_all(dir.path().join("unrelated")).unwrap();

    write_image(&clean_intact.join("a.png"), 1);
    write_image(&clean_intact.join("b.jpg"), 2);
    fs::write(clean_intact.join("notes.txt"), "skip me").unwrap();
    write_image(&dirty_damaged.join("c.png"), 3);
    write_image(&dir.path().join("unrelated").join("d.png"), 4);

    let dataset = CarStateDataset::new(dir.path(), inference_transform()).unwrap();

    assert_eq!(dataset.len(), 3);
    assert_eq!(Dataset::len(&dataset), 3);
    let first = Dataset::get(&dataset, 0).unwrap();
    assert_eq!(first.labels, Category::CleanIntact.labels());
    let last = Dataset::get(&dataset, 2).unwrap();
    assert_eq!(last.labels, Category::DirtyDamaged.labels());
}

#[test]
fn samples_carry_their_category_labels() {
    let dir = full_dataset();
    let dataset = CarStateDataset::new(dir.path(), inference_transform()).unwrap();
    assert_eq!(dataset.len(), 8);

    for (index, item) in dataset.items().iter().enumerate() {
        let category_name = item
            .image_path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap();
        let category = Category::from_dir_name(category_name).unwrap();

        let sample = dataset.sample(index).unwrap();
        assert_eq!(sample.labels, category.labels().as_floats());
        assert_eq!(sample.image.len(), 3 * 32 * 32);
    }
}

#[test]
fn dataset_order_follows_category_order() {
    let dir = full_dataset();
    let dataset = CarStateDataset::new(dir.path(), inference_transform()).unwrap();

    let order: Vec<Category> = dataset
        .items()
        .iter()
        .map(|item| Category::from_labels(item.labels).unwrap())
        .collect();
    let mut expected = Vec::new();
    for category in Category::ALL {
        expected.extend([category, category]);
    }
    assert_eq!(order, expected);
}

#[test]
fn corrupt_sample_fails_with_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let category_dir = dir.path().join("dirty_intact");
    fs::create_dir_all(&category_dir).unwrap();
    write_corrupt(&category_dir.join("broken.png"));

    let dataset = CarStateDataset::new(dir.path(), inference_transform()).unwrap();
    assert_eq!(dataset.len(), 1);
    assert!(matches!(dataset.sample(0), Err(CarStateError::Decode { .. })));
}

#[test]
fn training_produces_loadable_artifact_and_checkpoints() {
    let data = full_dataset();
    let out = tempfile::tempdir().unwrap();
    let artifact_dir = out.path().join("run");

    let config = TrainingConfig {
        data_path: data.path().to_string_lossy().into_owned(),
        artifact_dir: artifact_dir.to_string_lossy().into_owned(),
        num_epochs: 2,
        batch_size: 3,
        learning_rate: 0.001,
        lr_step_size: 1,
        checkpoint_interval: Some(1),
        ..TrainingConfig::default()
    };

    let summary = CarStateTrainer::<TrainingBackend>::new(ModelConfig::tiny(), config, Default::default())
        .run(&BackboneInit::Random)
        .unwrap();

    assert_eq!(summary.num_samples, 8);
    assert_eq!(summary.epochs.len(), 2);
    for stats in &summary.epochs {
        assert_eq!(stats.batches, 3);
        assert!(stats.avg_loss.is_finite() && stats.avg_loss > 0.0);
    }
    assert!((summary.epochs[1].learning_rate - 0.0001).abs() < 1e-12);

    assert_eq!(
        summary.checkpoints,
        vec![
            artifact_dir.join("checkpoint-epoch-1.mpk"),
            artifact_dir.join("checkpoint-epoch-2.mpk"),
        ]
    );
    assert!(summary.checkpoints.iter().all(|path| path.is_file()));
    assert!(artifact_dir.join("model.mpk").exists());
    assert!(artifact_dir.join("config.json").exists());

    let predictor = load_model::<InferenceBackend, _>(&artifact_dir, Default::default()).unwrap();
    let prediction = predictor
        .predict_view(data.path().join("clean_intact").join("car_0.png"))
        .unwrap();
    assert!((0.0..=1.0).contains(&prediction.cleanliness_prob));
    assert!((0.0..=1.0).contains(&prediction.integrity_prob));
}

#[test]
fn training_skips_corrupt_samples() {
    let data = full_dataset();
    write_corrupt(&data.path().join("clean_damaged").join("zz_broken.png"));
    let out = tempfile::tempdir().unwrap();

    let config = TrainingConfig {
        data_path: data.path().to_string_lossy().into_owned(),
        artifact_dir: out.path().to_string_lossy().into_owned(),
        num_epochs: 1,
        batch_size: 9,
        ..TrainingConfig::default()
    };

    let summary = CarStateTrainer::<TrainingBackend>::new(ModelConfig::tiny(), config, Default::default())
        .run(&BackboneInit::Random)
        .unwrap();

    assert_eq!(summary.num_samples, 9);
    assert_eq!(summary.epochs[0].batches, 1);
}

#[test]
fn training_refuses_when_no_sample_decodes() {
    let data = tempfile::tempdir().unwrap();
    let category_dir = data.path().join("clean_intact");
    fs::create_dir_all(&category_dir).unwrap();
    write_corrupt(&category_dir.join("a.png"));
    write_corrupt(&category_dir.join("b.png"));
    let out = tempfile::tempdir().unwrap();
    let artifact_dir = out.path().join("run");

    let config = TrainingConfig {
        data_path: data.path().to_string_lossy().into_owned(),
        artifact_dir: artifact_dir.to_string_lossy().into_owned(),
        num_epochs: 2,
        batch_size: 2,
        ..TrainingConfig::default()
    };

    let result = CarStateTrainer::<TrainingBackend>::new(ModelConfig::tiny(), config, Default::default())
        .run(&BackboneInit::Random);

    assert!(matches!(result, Err(CarStateError::NoUsableSamples(_))));
    assert!(!artifact_dir.join("model.mpk").exists());
}

#[test]
fn predictor_rejects_autodiff_backend() {
    let out = tempfile::tempdir().unwrap();
    let artifact_dir = saved_tiny_model(out.path());

    let result = CarStatePredictor::<TrainingBackend>::load(&artifact_dir, Default::default());
    assert!(matches!(result, Err(CarStateError::InvalidConfig(_))));
    assert!(CarStatePredictor::<InferenceBackend>::load(&artifact_dir, Default::default()).is_ok());
}

#[test]
fn view_with_mismatched_extension_is_predicted() {
    let data = full_dataset();
    let out = tempfile::tempdir().unwrap();
    let predictor = CarStatePredictor::<InferenceBackend>::load(saved_tiny_model(out.path()), Default::default())
        .unwrap();

    let source = data.path().join("dirty_damaged").join("car_0.png");
    let upload = out.path().join("front.jpg");
    fs::copy(&source, &upload).unwrap();

    assert_eq!(
        predictor.predict_view(&upload).unwrap(),
        predictor.predict_view(&source).unwrap()
    );
}

#[test]
fn predictions_are_deterministic_and_consistent_with_threshold() {
    let data = full_dataset();
    let out = tempfile::tempdir().unwrap();
    let predictor = CarStatePredictor::<InferenceBackend>::load(saved_tiny_model(out.path()), Default::default())
        .unwrap();

    for category in Category::ALL {
        let path = data.path().join(category.dir_name()).join("car_1.png");
        let first = predictor.predict_view(&path).unwrap();
        let second = predictor.predict_view(&path).unwrap();

        assert_eq!(first.cleanliness_prob.to_bits(), second.cleanliness_prob.to_bits());
        assert_eq!(first.integrity_prob.to_bits(), second.integrity_prob.to_bits());

        assert!((0.0..=1.0).contains(&first.cleanliness_prob));
        assert!((0.0..=1.0).contains(&first.integrity_prob));
        assert_eq!(
            first.cleanliness == Cleanliness::Dirty,
            first.cleanliness_prob > DECISION_THRESHOLD
        );
        assert_eq!(
            first.integrity == Integrity::Damaged,
            first.integrity_prob > DECISION_THRESHOLD
        );
    }
}

#[test]
fn in_memory_and_file_predictions_agree() {
    let data = full_dataset();
    let out = tempfile::tempdir().unwrap();
    let predictor = CarStatePredictor::<InferenceBackend>::load(saved_tiny_model(out.path()), Default::default())
        .unwrap();

    let path = data.path().join("dirty_intact").join("car_0.png");
    let from_file = predictor.predict_view(&path).unwrap();
    let from_memory = predictor.predict_image(&image::open(&path).unwrap()).unwrap();

    assert_eq!(from_file, from_memory);
}

#[test]
fn assessment_survives_a_corrupt_view() {
    let data = full_dataset();
    let out = tempfile::tempdir().unwrap();
    let predictor = CarStatePredictor::<InferenceBackend>::load(saved_tiny_model(out.path()), Default::default())
        .unwrap();

    let good = data.path().join("clean_intact").join("car_0.png");
    let corrupt = out.path().join("rear.png");
    write_corrupt(&corrupt);

    let views = VehicleViews {
        front: Some(good.clone()),
        rear: Some(corrupt),
        ..VehicleViews::default()
    };
    let report = assess_vehicle(Some(&predictor), &views).unwrap();
    let single = predictor.predict_view(&good).unwrap();

    assert_eq!(report.views.len(), 2);
    assert_eq!(report.predicted_views(), 1);
    assert_eq!(report.avg_cleanliness_prob, single.cleanliness_prob);
    assert_eq!(report.avg_integrity_prob, single.integrity_prob);
    assert_eq!(report.views[0].side(), Side::Front);
    assert!(matches!(&report.views[1], ViewDetail::Failed { side: Side::Rear, .. }));
}

#[test]
fn only_corrupt_views_is_no_input() {
    let out = tempfile::tempdir().unwrap();
    let predictor = CarStatePredictor::<InferenceBackend>::load(saved_tiny_model(out.path()), Default::default())
        .unwrap();
    let corrupt = out.path().join("left.png");
    write_corrupt(&corrupt);

    let views = VehicleViews {
        left: Some(corrupt),
        ..VehicleViews::default()
    };
    assert!(matches!(
        assess_vehicle(Some(&predictor), &views),
        Err(CarStateError::NoInput)
    ));
    assert!(matches!(
        assess_vehicle(Some(&predictor), &VehicleViews::default()),
        Err(CarStateError::NoInput)
    ));
}

#[test]
fn missing_model_refuses_assessment() {
    let out = tempfile::tempdir().unwrap();
    let loaded = load_model::<InferenceBackend, _>(out.path().join("absent"), Default::default());
    assert!(matches!(loaded, Err(CarStateError::ModelUnavailable(_))));

    let views = VehicleViews {
        front: Some(out.path().join("front.png")),
        ..VehicleViews::default()
    };
    assert!(matches!(
        assess_vehicle::<InferenceBackend>(loaded.ok().as_ref(), &views),
        Err(CarStateError::ModelUnavailable(_))
    ));
}

#[test]
fn decode_failure_on_single_view() {
    let out = tempfile::tempdir().unwrap();
    let predictor = CarStatePredictor::<InferenceBackend>::load(saved_tiny_model(out.path()), Default::default())
        .unwrap();
    let corrupt = out.path().join("front.png");
    write_corrupt(&corrupt);

    assert!(matches!(
        predictor.predict_view(&corrupt),
        Err(CarStateError::Decode { .. })
    ));
}
